//! The CPU's memory-type table as a single packed register value.
//!
//! On x86_64 this is `IA32_PAT`, on AArch64 `MAIR_EL1`. Both hold
//! eight one-byte slots; leaf entries select a slot with three bits
//! (see [`crate::Codec::apply_mem_type`]).

use core::fmt;

use crate::{
	Architecture, Error, Result,
	aarch64::{MairAttributes, MairRegister, mair},
	x86_64::{Pat, pat},
};

/// Number of slots in the table.
pub const SLOTS: u8 = 8;

/// A memory-type table value tagged with its architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemTypeTable {
	/// Whose layout `raw` follows.
	arch: Architecture,
	/// The packed register value.
	raw:  u64,
}

impl MemTypeTable {
	/// Wraps a raw register value.
	#[must_use]
	pub const fn new(arch: Architecture, raw: u64) -> Self {
		Self { arch, raw }
	}

	/// The value the architecture's boot code usually leaves behind.
	#[must_use]
	pub const fn reset(arch: Architecture) -> Self {
		match arch {
			Architecture::X86_64 => Self::new(arch, Pat::RESET.raw()),
			Architecture::Aarch64 => Self::new(arch, MairRegister::LINUX.raw()),
		}
	}

	/// The architecture.
	#[must_use]
	pub const fn arch(&self) -> Architecture {
		self.arch
	}

	/// The packed register value.
	#[must_use]
	pub const fn raw(&self) -> u64 {
		self.raw
	}

	/// Validates a slot number.
	const fn check_slot(slot: u8) -> Result<()> {
		if slot < SLOTS {
			Ok(())
		} else {
			Err(Error::SlotOutOfRange(slot))
		}
	}

	/// The type programmed into `slot`: the low 3 bits on x86_64,
	/// the full attribute byte on AArch64.
	pub fn get(&self, slot: u8) -> Result<u8> {
		Self::check_slot(slot)?;
		Ok(self.get_unchecked(slot))
	}

	/// [`Self::get`] for a slot already known to be in range.
	fn get_unchecked(&self, slot: u8) -> u8 {
		match self.arch {
			Architecture::X86_64 => Pat::from_raw(self.raw).get(slot),
			Architecture::Aarch64 => MairRegister::from_raw(self.raw).get(slot).raw(),
		}
	}

	/// Programs `slot` to `value`.
	///
	/// x86_64 accepts only `0..8`; the reserved upper bits of the
	/// slot are cleared.
	pub fn set(&mut self, slot: u8, value: u8) -> Result<()> {
		Self::check_slot(slot)?;
		self.raw = match self.arch {
			Architecture::X86_64 => {
				if value > Pat::SLOT_MASK {
					return Err(Error::MemTypeOutOfRange {
						arch: self.arch,
						value,
					});
				}
				Pat::from_raw(self.raw).with(slot, value).raw()
			}
			Architecture::Aarch64 => {
				MairRegister::from_raw(self.raw)
					.with(slot, MairAttributes::from_raw(value))
					.raw()
			}
		};
		Ok(())
	}

	/// Returns a copy with `slot` programmed to `value`.
	pub fn with(mut self, slot: u8, value: u8) -> Result<Self> {
		self.set(slot, value)?;
		Ok(self)
	}

	/// Whether slot `slot` holds memory type `value`.
	///
	/// On AArch64 a slot also matches when both of its nibbles equal
	/// `value`, so a nibble-sized policy finds its symmetric byte.
	fn matches(&self, slot: u8, value: u8) -> bool {
		let current = self.get_unchecked(slot);
		if current == value {
			return true;
		}

		match self.arch {
			Architecture::X86_64 => false,
			Architecture::Aarch64 => {
				let attrs = MairAttributes::from_raw(current);
				attrs.inner() == attrs.outer() && attrs.inner() == value
			}
		}
	}

	/// Bitmask of the slots programmed to `value`.
	#[must_use]
	pub fn find(&self, value: u8) -> u8 {
		(0..SLOTS)
			.filter(|slot| self.matches(*slot, value))
			.fold(0, |mask, slot| mask | (1 << slot))
	}

	/// The lowest slot programmed to `value`.
	#[must_use]
	pub fn find_first(&self, value: u8) -> Option<u8> {
		(0..SLOTS).find(|slot| self.matches(*slot, value))
	}

	/// Short human-readable name of a memory-type value.
	#[must_use]
	pub fn describe(arch: Architecture, value: u8) -> String {
		match arch {
			Architecture::X86_64 => pat::describe(value).to_owned(),
			Architecture::Aarch64 => mair::describe(value),
		}
	}

	/// Iterates `(slot, value)` pairs.
	pub fn slots(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
		(0..SLOTS).map(|slot| (slot, self.get_unchecked(slot)))
	}
}

impl fmt::Display for MemTypeTable {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (slot, value) in self.slots() {
			if slot != 0 {
				f.write_str(" ")?;
			}
			write!(f, "{slot}:{}", Self::describe(self.arch, value))?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{aarch64::mair::shorthand, x86_64::PatType};

	#[test]
	fn x86_64_round_trip_every_slot_and_value() {
		let mut table = MemTypeTable::reset(Architecture::X86_64);
		for slot in 0..SLOTS {
			for value in 0..8 {
				table.set(slot, value).unwrap();
				assert_eq!(table.get(slot).unwrap(), value);
			}
		}
	}

	#[test]
	fn aarch64_round_trip_every_slot_and_value() {
		let mut table = MemTypeTable::reset(Architecture::Aarch64);
		for slot in 0..SLOTS {
			for value in 0..=u8::MAX {
				table.set(slot, value).unwrap();
				assert_eq!(table.get(slot).unwrap(), value);
			}
		}
	}

	#[test]
	fn set_touches_only_its_slot() {
		let mut table = MemTypeTable::new(Architecture::X86_64, u64::MAX);
		table.set(2, PatType::WriteCombining.bits()).unwrap();
		assert_eq!(table.raw(), 0xFFFF_FFFF_FF01_FFFF);

		let mut table = MemTypeTable::new(Architecture::Aarch64, 0);
		table.set(7, shorthand::WB).unwrap();
		assert_eq!(table.raw(), 0xFF00_0000_0000_0000);
	}

	#[test]
	fn out_of_range() {
		let mut table = MemTypeTable::reset(Architecture::X86_64);
		assert_eq!(table.get(8).unwrap_err(), Error::SlotOutOfRange(8));
		assert_eq!(table.set(9, 0).unwrap_err(), Error::SlotOutOfRange(9));
		assert_eq!(
			table.set(0, 8).unwrap_err(),
			Error::MemTypeOutOfRange {
				arch:  Architecture::X86_64,
				value: 8,
			}
		);
		assert_eq!(table, MemTypeTable::reset(Architecture::X86_64));
	}

	#[test]
	fn find_by_construction() {
		// WB, WT, UC-, UC, WB, WT, UC-, UC
		let table = MemTypeTable::reset(Architecture::X86_64);
		assert_eq!(table.find(PatType::WriteBack.bits()), 0b0001_0001);
		assert_eq!(table.find(PatType::Uncacheable.bits()), 0b1000_1000);
		assert_eq!(table.find(PatType::WriteCombining.bits()), 0);
		assert_eq!(table.find_first(PatType::UncachedMinus.bits()), Some(2));
		assert_eq!(table.find_first(PatType::WriteProtected.bits()), None);

		let table = table.with(1, PatType::WriteCombining.bits()).unwrap();
		assert_eq!(table.find_first(PatType::WriteCombining.bits()), Some(1));
	}

	#[test]
	fn find_matches_symmetric_mair_nibbles() {
		// nGnRnE, nGnRE, GRE, UC, WB
		let table = MemTypeTable::reset(Architecture::Aarch64);
		assert_eq!(table.find(shorthand::UC), 0b0000_1000);
		assert_eq!(table.find(shorthand::WB), 0b0001_0000);
		assert_eq!(table.find(0x4), 0b0000_1010);
		assert_eq!(table.find_first(0x0), Some(0));
		assert_eq!(table.find_first(shorthand::WT), None);
	}

	#[test]
	fn renders_every_slot() {
		assert_eq!(
			MemTypeTable::reset(Architecture::X86_64).to_string(),
			"0:WB 1:WT 2:UC- 3:UC 4:WB 5:WT 6:UC- 7:UC"
		);
	}

	#[test]
	fn describe_values() {
		assert_eq!(MemTypeTable::describe(Architecture::X86_64, 6), "WB");
		assert_eq!(MemTypeTable::describe(Architecture::X86_64, 3), "Rsvd");
		assert_eq!(MemTypeTable::describe(Architecture::Aarch64, 0xff), "WB");
		assert_eq!(MemTypeTable::describe(Architecture::Aarch64, 0x4f), "IWBOUC");
	}
}
