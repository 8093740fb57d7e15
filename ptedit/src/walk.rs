//! The resolve/update engine.
//!
//! One [`Walker`] serves every backend: it only ever touches physical
//! memory through the [`PageAccess`] it was built with, so the kernel
//! side, the pread path and the mapped-window path all run the same
//! walk.
//!
//! Folded levels (a level the paging mode does not have) take their
//! parent's entry and are marked valid without a physical read.

use std::{
	collections::{BTreeMap, btree_map},
	io,
};

use log::{debug, trace, warn};
use ptedit_arch::{Codec, Geometry, Level};

use crate::{
	Error, Ladder, Result,
	access::{PageAccess, PhysicalPage},
	tlb::TlbControl,
};

/// Walks translation tables rooted at a physical address.
#[derive(Debug, Clone)]
pub struct Walker<A> {
	/// Physical memory.
	access:   A,
	/// The paging mode being walked.
	geometry: Geometry,
	/// Entry layout of `geometry`'s architecture.
	codec:    Codec,
}

impl<A: PageAccess> Walker<A> {
	/// Creates a walker over `access` for tables shaped like `geometry`.
	pub const fn new(access: A, geometry: Geometry) -> Self {
		Self {
			access,
			codec: Codec::for_arch(geometry.arch()),
			geometry,
		}
	}

	/// The geometry being walked.
	pub const fn geometry(&self) -> &Geometry {
		&self.geometry
	}

	/// The entry codec.
	pub const fn codec(&self) -> Codec {
		self.codec
	}

	/// The frame holding the root table, given the raw root register
	/// value (flag and ASID bits are ignored).
	#[must_use]
	pub fn root_pfn(&self, root: u64) -> u64 {
		(root & self.codec.pfn_mask(Level::Pgd, false, &self.geometry))
			>> self.geometry.page_offset_bits()
	}

	/// Walks `address` from the root table at physical address `root`.
	///
	/// A level is valid when it was reached and its entry is present;
	/// the walk stops at the first non-present, block or leaf entry.
	/// An unmapped address is not an error.
	pub fn resolve(&self, root: u64, address: u64, pid: u32) -> Result<Ladder> {
		let mut ladder = Ladder::new(address, pid);
		let mut table = self.root_pfn(root);
		let mut parent = None;

		for level in Level::ALL {
			if !self.geometry.is_present(level) {
				let Some(raw) = parent else {
					break;
				};
				trace!("{level} folded, taking {raw:#018x}");
				ladder.set(level, raw);
				continue;
			}

			let index = self.geometry.index(level, address);
			let page = self.access.read(table)?;
			let raw = entry_at(&page, index)?;
			ladder.record(level, raw);
			trace!("{level} at pfn {table:#x} index {index}: {raw:#018x}");

			let entry = self.codec.decode(raw, level, &self.geometry);

			if !entry.present {
				if raw & 1 != 0 {
					warn!("{level} entry {raw:#018x} of {address:#x} has a reserved encoding");
				}
				break;
			}

			ladder.mark_valid(level);

			if entry.huge || level.is_leaf() {
				break;
			}

			table = entry.pfn;
			parent = Some(raw);
		}

		Ok(ladder)
	}

	/// Writes the levels `request` selects, then invalidates the TLB
	/// entry of `request.address`.
	///
	/// A requested level is written only if it was valid before the
	/// call and is still reached by the walk. The walk descends through
	/// the values being written, so a level under an entry that this
	/// very update makes non-present (or points elsewhere) follows the
	/// new entry. Requests that are not honoured are dropped silently.
	///
	/// Pages are written back once each, after the walk; invalidation
	/// happens even if nothing was written. A failed page write leaves
	/// earlier pages written.
	pub fn update<T: TlbControl + ?Sized>(
		&self,
		root: u64,
		request: &Ladder,
		tlb: &T,
	) -> Result<()> {
		let address = request.address;
		let allowed = self.resolve(root, address, request.pid)?.valid();
		let mut pending = request.valid();
		let mut pages = PageSet::default();
		let mut table = self.root_pfn(root);
		let mut parent = None;

		for level in Level::ALL {
			if !self.geometry.is_present(level) {
				if pending.contains(level) {
					debug!("dropping write to folded {level} of {address:#x}");
					pending.remove(level);
				}
				if parent.is_none() {
					break;
				}
				continue;
			}

			let index = self.geometry.index(level, address);
			let page = pages.get_or_read(&self.access, table)?;
			let current = entry_at(page.page(), index)?;

			let effective = match request.get(level) {
				Some(value) if allowed.contains(level) => {
					if value != current {
						page.store(index, value)?;
					}
					debug!("{level} of {address:#x}: {current:#018x} -> {value:#018x}");
					value
				}
				Some(_) => {
					debug!("dropping write to {level} of {address:#x}: not valid before update");
					current
				}
				None => current,
			};
			pending.remove(level);

			let entry = self.codec.decode(effective, level, &self.geometry);
			if !entry.present || entry.huge || level.is_leaf() {
				break;
			}

			table = entry.pfn;
			parent = Some(effective);
		}

		for level in pending.iter() {
			debug!("dropping write to {level} of {address:#x}: no longer reached");
		}

		// Pages written before a failure are live; flush regardless.
		let written = pages.write_back(&self.access);
		let invalidated = tlb.invalidate(address);
		written.and(invalidated)
	}
}

/// Reads entry `index` of a table page.
fn entry_at(page: &PhysicalPage, index: usize) -> Result<u64> {
	page.entry(index).ok_or_else(|| short_page(page))
}

/// A page too short to hold the indexed entry.
fn short_page(page: &PhysicalPage) -> Error {
	Error::Io(io::Error::new(
		io::ErrorKind::UnexpectedEof,
		format!(
			"table page {:#x} is only {} bytes",
			page.pfn(),
			page.bytes().len()
		),
	))
}

/// A page copy taken during an update, and whether it was modified.
struct CachedPage {
	/// The copy.
	page:  PhysicalPage,
	/// Whether it must be written back.
	dirty: bool,
}

impl CachedPage {
	/// The copy.
	fn page(&self) -> &PhysicalPage {
		&self.page
	}

	/// Overwrites an entry of the copy.
	fn store(&mut self, index: usize, value: u64) -> Result<()> {
		if !self.page.set_entry(index, value) {
			return Err(short_page(&self.page));
		}
		self.dirty = true;
		Ok(())
	}
}

/// Page copies of one update, keyed by frame so that a table reached
/// twice is read once and written once.
#[derive(Default)]
struct PageSet {
	/// Copies by frame number.
	pages: BTreeMap<u64, CachedPage>,
}

impl PageSet {
	/// The copy of `pfn`, reading it on first use.
	fn get_or_read<A: PageAccess>(&mut self, access: &A, pfn: u64) -> Result<&mut CachedPage> {
		Ok(match self.pages.entry(pfn) {
			btree_map::Entry::Occupied(cached) => cached.into_mut(),
			btree_map::Entry::Vacant(vacant) => {
				vacant.insert(CachedPage {
					page:  access.read(pfn)?,
					dirty: false,
				})
			}
		})
	}

	/// Writes back every modified copy.
	fn write_back<A: PageAccess>(self, access: &A) -> Result<()> {
		for cached in self.pages.into_values().filter(|c| c.dirty) {
			access.write(&cached.page)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::cell::Cell;

	use ptedit_arch::{LevelMask, PagingMode};
	use strum::IntoEnumIterator;

	use super::*;
	use crate::{
		access::Direct,
		sim::{SimMachine, SimWindow, TlbEvent},
	};

	const ADDRESS: u64 = 0x0000_7f12_3456_7000;

	/// Counts page writes, failing every write past `limit`.
	struct Counting<A> {
		inner:  A,
		writes: Cell<usize>,
		limit:  usize,
	}

	impl<A: PageAccess> PageAccess for Counting<A> {
		fn page_size(&self) -> usize {
			self.inner.page_size()
		}

		fn read_into(&self, pfn: u64, buffer: &mut [u8]) -> Result<()> {
			self.inner.read_into(pfn, buffer)
		}

		fn write_from(&self, pfn: u64, buffer: &[u8]) -> Result<()> {
			if self.writes.get() >= self.limit {
				return Err(Error::Io(io::Error::other("write refused")));
			}
			self.writes.set(self.writes.get() + 1);
			self.inner.write_from(pfn, buffer)
		}
	}

	fn walker(machine: &SimMachine) -> Walker<Direct<SimWindow<'_>>> {
		Walker::new(
			Direct::new(machine.window(), machine.page_size()),
			*machine.geometry(),
		)
	}

	fn counting(machine: &SimMachine) -> Walker<Counting<Direct<SimWindow<'_>>>> {
		limited(machine, usize::MAX)
	}

	fn limited(machine: &SimMachine, limit: usize) -> Walker<Counting<Direct<SimWindow<'_>>>> {
		Walker::new(
			Counting {
				inner:  Direct::new(machine.window(), machine.page_size()),
				writes: Cell::new(0),
				limit,
			},
			*machine.geometry(),
		)
	}

	/// A machine with one process (pid 1) mapping `address`.
	fn mapped(mode: PagingMode, address: u64) -> (SimMachine, u64, u64) {
		let machine = SimMachine::new(mode, 64);
		let root = machine.spawn(1).unwrap();
		let frame = machine.alloc_frame().unwrap();
		machine.map(1, address, frame).unwrap();
		(machine, root, frame)
	}

	#[test]
	fn resolves_full_ladder() {
		for mode in PagingMode::iter() {
			let address = ADDRESS & ((1 << 39) - 1);
			let (machine, root, frame) = mapped(mode, address);
			let walker = walker(&machine);
			let ladder = walker.resolve(root, address, 1).unwrap();

			assert_eq!(ladder.valid(), LevelMask::ALL, "{mode}");
			assert_eq!(ladder.leaf(), Some(Level::Pte));
			let leaf = ladder
				.entry(Level::Pte, walker.codec(), walker.geometry())
				.unwrap();
			assert!(leaf.present);
			assert_eq!(leaf.pfn, frame);
		}
	}

	#[test]
	fn folded_levels_copy_their_parent() {
		let (machine, root, _) = mapped(PagingMode::Aarch64Va39, 0x40_0000);
		let ladder = walker(&machine).resolve(root, 0x40_0000, 1).unwrap();
		assert_eq!(ladder.get(Level::P4d), ladder.get(Level::Pgd));
		assert_eq!(ladder.get(Level::Pud), ladder.get(Level::Pgd));

		let (machine, root, _) = mapped(PagingMode::X86_64Level4, 0x40_0000);
		let ladder = walker(&machine).resolve(root, 0x40_0000, 1).unwrap();
		assert_eq!(ladder.get(Level::P4d), ladder.get(Level::Pgd));
		assert_ne!(ladder.get(Level::Pud), ladder.get(Level::Pgd));
	}

	#[test]
	fn fixed_vector_locates_the_right_slots() {
		let (machine, root, _) = mapped(PagingMode::X86_64Level4, 0x40_0000);
		let geometry = *machine.geometry();
		assert_eq!(geometry.indices(0x40_0000), [0, 0, 0, 2, 0]);

		let ladder = walker(&machine).resolve(root, 0x40_0000, 1).unwrap();
		let pmd_slot = machine.locate(1, 0x40_0000, Level::Pmd).unwrap().unwrap();
		let pud = ladder
			.entry(Level::Pud, Codec::X86_64, &geometry)
			.unwrap();
		assert_eq!(pmd_slot, pud.physical_address() + 2 * 8);
		assert_eq!(machine.read_u64(pmd_slot), ladder.raw(Level::Pmd));
	}

	#[test]
	fn unknown_addresses_resolve_to_nothing_below_the_root() {
		// PML5 slot 0 is shared with 0x40_0000; PML4 slot 0xe0 is empty.
		let (machine, root, _) = mapped(PagingMode::X86_64Level5, 0x40_0000);
		let ladder = walker(&machine)
			.resolve(root, 0x0000_7000_0000_0000, 1)
			.unwrap();
		assert_eq!(ladder.valid(), LevelMask::from(Level::Pgd));
		assert!(!ladder.is_valid(Level::P4d));

		let (machine, root, _) = mapped(PagingMode::X86_64Level4, 0x40_0000);
		let ladder = walker(&machine)
			.resolve(root, 0x0000_7000_0000_0000, 1)
			.unwrap();
		assert!(ladder.valid().is_empty());
		assert_eq!(ladder.leaf(), None);
	}

	#[test]
	fn validity_is_monotonic_for_every_absent_pattern() {
		for mode in PagingMode::iter() {
			let address = 0x0000_0040_1234_5000 & ((1 << 39) - 1);
			let (machine, root, _) = mapped(mode, address);
			let walker = walker(&machine);
			let geometry = *machine.geometry();

			let slots: Vec<(Level, u64, u64)> = geometry
				.present_levels()
				.map(|level| {
					let slot = machine.locate(1, address, level).unwrap().unwrap();
					(level, slot, machine.read_u64(slot))
				})
				.collect();

			for pattern in 0_u64..32 {
				let absent = LevelMask::from_bits(pattern);
				for (level, slot, raw) in &slots {
					let value = if absent.contains(*level) { raw & !1 } else { *raw };
					machine.write_u64(*slot, value);
				}

				let ladder = walker.resolve(root, address, 1).unwrap();

				for level in Level::ALL {
					let ancestors_intact = Level::ALL
						.into_iter()
						.take_while(|l| *l <= level)
						.filter(|l| geometry.is_present(*l))
						.all(|l| !absent.contains(l));
					assert_eq!(
						ladder.is_valid(level),
						ancestors_intact,
						"{mode} pattern {pattern:05b} {level}"
					);
					if let Some(parent) = level.parent() {
						assert!(!ladder.is_valid(level) || ladder.is_valid(parent));
					}
				}
			}

			for (_, slot, raw) in &slots {
				machine.write_u64(*slot, *raw);
			}
		}
	}

	#[test]
	fn huge_entries_end_the_walk() {
		let machine = SimMachine::new(PagingMode::X86_64Level4, 64);
		let root = machine.spawn(1).unwrap();
		machine.map_huge(1, 0x4000_0000, Level::Pmd, 0x200).unwrap();

		let walker = walker(&machine);
		let ladder = walker.resolve(root, 0x4012_3000, 1).unwrap();
		assert_eq!(ladder.leaf(), Some(Level::Pmd));
		assert!(!ladder.is_valid(Level::Pte));
		let pmd = ladder
			.entry(Level::Pmd, walker.codec(), walker.geometry())
			.unwrap();
		assert!(pmd.huge);
		assert!(pmd.is_leaf_shortcut());
		assert_eq!(pmd.pfn, 0x200);
		assert_eq!(
			ladder.valid(),
			[Level::Pgd, Level::P4d, Level::Pud, Level::Pmd]
				.into_iter()
				.collect::<LevelMask>()
		);
	}

	#[test]
	fn aarch64_root_blocks_end_the_walk() {
		let machine = SimMachine::new(PagingMode::Aarch64Va39, 64);
		let root = machine.spawn(1).unwrap();
		machine.map_huge(1, 0x4000_0000, Level::Pgd, 0x4_0000).unwrap();

		let walker = walker(&machine);
		let ladder = walker.resolve(root, 0x4000_1000, 1).unwrap();
		assert_eq!(ladder.valid(), LevelMask::from(Level::Pgd));
		assert!(
			ladder
				.entry(Level::Pgd, walker.codec(), walker.geometry())
				.unwrap()
				.huge
		);
	}

	#[test]
	fn resolve_then_update_changes_nothing() {
		for mode in PagingMode::iter() {
			let (machine, root, _) = mapped(mode, 0x40_0000);
			let walker = counting(&machine);
			let before = walker.resolve(root, 0x40_0000, 1).unwrap();

			walker.update(root, &before, &machine).unwrap();

			assert_eq!(walker.resolve(root, 0x40_0000, 1).unwrap(), before);
			assert_eq!(walker.access.writes.get(), 0, "{mode}");
			assert_eq!(machine.tlb_events(), vec![TlbEvent::Invalidate {
				address: 0x40_0000
			}]);
		}
	}

	#[test]
	fn update_rewrites_the_leaf() {
		let (machine, root, _) = mapped(PagingMode::X86_64Level4, 0x40_0000);
		let walker = counting(&machine);
		let target = machine.alloc_frame().unwrap();

		let resolved = walker.resolve(root, 0x40_0000, 1).unwrap();
		let mut request = resolved.masked(LevelMask::EMPTY);
		request.set(
			Level::Pte,
			Codec::X86_64.with_pfn(resolved.raw(Level::Pte), target),
		);
		walker.update(root, &request, &machine).unwrap();

		let after = walker.resolve(root, 0x40_0000, 1).unwrap();
		assert_eq!(Codec::X86_64.pfn(after.raw(Level::Pte)), target);
		assert_eq!(after.raw(Level::Pmd), resolved.raw(Level::Pmd));
		assert_eq!(walker.access.writes.get(), 1);
	}

	#[test]
	fn failed_write_back_still_invalidates() {
		let (machine, root, _) = mapped(PagingMode::X86_64Level4, 0x40_0000);
		let walker = limited(&machine, 1);
		let resolved = walker.resolve(root, 0x40_0000, 1).unwrap();

		// Touch the accessed bit in two different tables.
		let mut request = Ladder::new(0x40_0000, 1);
		request.set(Level::Pmd, resolved.raw(Level::Pmd) ^ (1 << 5));
		request.set(Level::Pte, resolved.raw(Level::Pte) ^ (1 << 5));

		assert!(matches!(
			walker.update(root, &request, &machine),
			Err(Error::Io(_))
		));
		assert_eq!(walker.access.writes.get(), 1);
		assert_eq!(machine.tlb_events(), vec![TlbEvent::Invalidate {
			address: 0x40_0000
		}]);
	}

	#[test]
	fn writes_under_an_absent_ancestor_are_dropped() {
		let (machine, root, _) = mapped(PagingMode::X86_64Level4, 0x40_0000);
		let walker = walker(&machine);
		let pmd_slot = machine.locate(1, 0x40_0000, Level::Pmd).unwrap().unwrap();
		let pte_slot = machine.locate(1, 0x40_0000, Level::Pte).unwrap().unwrap();
		let pmd = machine.read_u64(pmd_slot);
		let pte = machine.read_u64(pte_slot);
		machine.write_u64(pmd_slot, pmd & !1);

		let resolved = walker.resolve(root, 0x40_0000, 1).unwrap();
		assert!(!resolved.is_valid(Level::Pmd));

		let mut request = Ladder::new(0x40_0000, 1);
		request.set(Level::Pte, 0xdead_b067);
		walker.update(root, &request, &machine).unwrap();

		assert_eq!(machine.read_u64(pte_slot), pte);
		assert_eq!(machine.read_u64(pmd_slot), pmd & !1);
		assert_eq!(machine.tlb_events(), vec![TlbEvent::Invalidate {
			address: 0x40_0000
		}]);
	}

	#[test]
	fn clearing_present_drops_writes_below() {
		let (machine, root, _) = mapped(PagingMode::Aarch64Va48, 0x40_0000);
		let walker = walker(&machine);
		let pte_slot = machine.locate(1, 0x40_0000, Level::Pte).unwrap().unwrap();
		let pte = machine.read_u64(pte_slot);

		let resolved = walker.resolve(root, 0x40_0000, 1).unwrap();
		let mut request = Ladder::new(0x40_0000, 1);
		request.set(Level::Pmd, resolved.raw(Level::Pmd) & !1);
		request.set(Level::Pte, 0);
		walker.update(root, &request, &machine).unwrap();

		let after = walker.resolve(root, 0x40_0000, 1).unwrap();
		assert!(!after.is_valid(Level::Pmd));
		assert_eq!(after.raw(Level::Pmd), resolved.raw(Level::Pmd) & !1);
		assert_eq!(machine.read_u64(pte_slot), pte);
	}

	#[test]
	fn descent_follows_the_new_entry() {
		let a = 0x40_0000;
		let b = 0x60_0000;
		let (machine, root, _) = mapped(PagingMode::X86_64Level4, a);
		let other = machine.alloc_frame().unwrap();
		machine.map(1, b, other).unwrap();

		let walker = walker(&machine);
		let old_slot = machine.locate(1, a, Level::Pte).unwrap().unwrap();
		let b_slot = machine.locate(1, b, Level::Pte).unwrap().unwrap();
		let old = machine.read_u64(old_slot);

		let b_ladder = walker.resolve(root, b, 1).unwrap();
		let mut request = Ladder::new(a, 1);
		request.set(Level::Pmd, b_ladder.raw(Level::Pmd));
		request.set(Level::Pte, 0x1234_5067);
		walker.update(root, &request, &machine).unwrap();

		assert_eq!(machine.read_u64(b_slot), 0x1234_5067);
		assert_eq!(machine.read_u64(old_slot), old);
	}

	#[test]
	fn folded_level_writes_are_dropped() {
		let (machine, root, _) = mapped(PagingMode::X86_64Level4, 0x40_0000);
		let walker = counting(&machine);
		let mut request = Ladder::new(0x40_0000, 1);
		request.set(Level::P4d, 0);
		walker.update(root, &request, &machine).unwrap();

		assert_eq!(walker.access.writes.get(), 0);
		assert!(
			walker
				.resolve(root, 0x40_0000, 1)
				.unwrap()
				.is_valid(Level::Pte)
		);
	}

	#[test]
	fn root_flag_bits_are_ignored() {
		let (machine, root, _) = mapped(PagingMode::X86_64Level4, 0x40_0000);
		let walker = walker(&machine);
		assert_eq!(
			walker.resolve(root | 0x18, 0x40_0000, 1).unwrap(),
			walker.resolve(root, 0x40_0000, 1).unwrap()
		);
	}
}
