//! The resolved translation ladder of one virtual address.

use core::fmt;

use ptedit_arch::{Architecture, Codec, Entry, EntryTable, Geometry, Level, LevelMask};

use crate::{
	Error, Result,
	channel::{LadderRecord, wire_pid},
};

/// The raw entry at every level of a walk, plus which of them are valid.
///
/// As a resolve result, `valid` marks the levels that were reached
/// and present. As an update request, it selects the levels to write.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ladder {
	/// The virtual address.
	pub address: u64,
	/// The process; `0` is the caller.
	pub pid:     u32,
	/// Raw entries, indexed by [`Level::index`].
	entries:     [u64; 5],
	/// Valid (or selected) levels.
	valid:       LevelMask,
}

impl Ladder {
	/// An empty ladder for `address` in `pid`.
	#[must_use]
	pub const fn new(address: u64, pid: u32) -> Self {
		Self {
			address,
			pid,
			entries: [0; 5],
			valid: LevelMask::EMPTY,
		}
	}

	/// The validity mask.
	#[must_use]
	pub const fn valid(&self) -> LevelMask {
		self.valid
	}

	/// Whether `level` is valid.
	#[must_use]
	pub const fn is_valid(&self, level: Level) -> bool {
		self.valid.contains(level)
	}

	/// The raw entry at `level`, valid or not.
	#[must_use]
	pub const fn raw(&self, level: Level) -> u64 {
		self.entries[level.index()]
	}

	/// The raw entry at `level` if it is valid.
	#[must_use]
	pub const fn get(&self, level: Level) -> Option<u64> {
		if self.is_valid(level) {
			Some(self.raw(level))
		} else {
			None
		}
	}

	/// Stores `raw` at `level` and marks it valid.
	///
	/// On an update request this selects the level for writing.
	pub fn set(&mut self, level: Level, raw: u64) {
		self.entries[level.index()] = raw;
		self.valid.insert(level);
	}

	/// Stores `raw` at `level` without touching the mask.
	pub fn record(&mut self, level: Level, raw: u64) {
		self.entries[level.index()] = raw;
	}

	/// Marks `level` valid without changing its entry.
	pub fn mark_valid(&mut self, level: Level) {
		self.valid.insert(level);
	}

	/// Removes `level` from the mask, keeping its raw entry.
	pub fn clear(&mut self, level: Level) {
		self.valid.remove(level);
	}

	/// Keeps only the levels in `mask`.
	#[must_use]
	pub const fn masked(mut self, mask: LevelMask) -> Self {
		self.valid = self.valid.intersection(mask);
		self
	}

	/// The deepest valid level: where the translation ends.
	#[must_use]
	pub fn leaf(&self) -> Option<Level> {
		self.valid.deepest()
	}

	/// Decodes the entry at `level` if it is valid.
	#[must_use]
	pub fn entry(&self, level: Level, codec: Codec, geometry: &Geometry) -> Option<Entry> {
		self.get(level).map(|raw| codec.decode(raw, level, geometry))
	}

	/// Renders every valid level under `arch`'s entry layout.
	#[must_use]
	pub const fn display(&self, arch: Architecture) -> LadderDisplay<'_> {
		LadderDisplay { ladder: self, arch }
	}
}

impl fmt::Debug for Ladder {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut s = f.debug_struct("Ladder");
		s.field("address", &format_args!("{:#x}", self.address))
			.field("pid", &self.pid)
			.field("valid", &self.valid);
		for level in Level::ALL {
			if self.is_valid(level) {
				s.field(
					&level.to_string(),
					&format_args!("{:#018x}", self.raw(level)),
				);
			}
		}
		s.finish()
	}
}

/// Renders a [`Ladder`]; see [`Ladder::display`].
pub struct LadderDisplay<'a> {
	/// The ladder.
	ladder: &'a Ladder,
	/// Entry layout.
	arch:   Architecture,
}

impl fmt::Display for LadderDisplay<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for level in self.ladder.valid.iter() {
			writeln!(f, "{level} of address {:#x}", self.ladder.address)?;
			write!(f, "{}", EntryTable::new(self.arch, self.ladder.raw(level)))?;
		}
		Ok(())
	}
}

impl TryFrom<&LadderRecord> for Ladder {
	type Error = Error;

	fn try_from(record: &LadderRecord) -> Result<Self> {
		Ok(Self {
			address: record.vaddr,
			pid:     wire_pid(record.pid)?,
			entries: [record.pgd, record.p4d, record.pud, record.pmd, record.pte],
			valid:   LevelMask::from_bits(record.valid),
		})
	}
}

impl From<&Ladder> for LadderRecord {
	fn from(ladder: &Ladder) -> Self {
		let [pgd, p4d, pud, pmd, pte] = ladder.entries;
		Self {
			pid: u64::from(ladder.pid),
			vaddr: ladder.address,
			pgd,
			p4d,
			pud,
			pmd,
			pte,
			valid: ladder.valid.bits(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn record_conversion() {
		let mut ladder = Ladder::new(0x7fff_0000_1000, 42);
		ladder.set(Level::Pgd, 0x1003);
		ladder.set(Level::Pte, 0x8000_0000_0000_5067);
		ladder.record(Level::Pmd, 0x2003);

		let record = LadderRecord::from(&ladder);
		assert_eq!(record.pid, 42);
		assert_eq!(record.vaddr, 0x7fff_0000_1000);
		assert_eq!(record.pgd, 0x1003);
		assert_eq!(record.pmd, 0x2003);
		assert_eq!(record.valid, 0b1_0001);
		assert_eq!(Ladder::try_from(&record).unwrap(), ladder);
	}

	#[test]
	fn wire_pids_past_u32_do_not_exist() {
		let record = LadderRecord {
			pid: u64::from(u32::MAX) + 1,
			..LadderRecord::default()
		};
		assert!(matches!(
			Ladder::try_from(&record),
			Err(Error::NotFound { .. })
		));
	}

	#[test]
	fn get_honours_mask() {
		let mut ladder = Ladder::new(0, 0);
		ladder.record(Level::Pud, 7);
		assert_eq!(ladder.get(Level::Pud), None);
		assert_eq!(ladder.raw(Level::Pud), 7);
		ladder.mark_valid(Level::Pud);
		assert_eq!(ladder.get(Level::Pud), Some(7));
		assert_eq!(ladder.leaf(), Some(Level::Pud));

		let masked = ladder.masked(LevelMask::from(Level::Pte));
		assert!(masked.valid().is_empty());
		assert_eq!(masked.raw(Level::Pud), 7);
	}

	#[test]
	fn renders_valid_levels_only() {
		let mut ladder = Ladder::new(0x40_0000, 0);
		ladder.set(Level::Pgd, 0x1067);
		ladder.record(Level::Pud, 0x2067);
		let text = ladder.display(Architecture::X86_64).to_string();
		assert!(text.starts_with("PGD of address 0x400000\n"));
		assert!(!text.contains("PUD"));
		assert_eq!(text.lines().count(), 5);
	}
}
