//! Architecture-dispatched interpretation of raw translation entries.
//!
//! The walker never looks at entry bits itself; it asks the [`Codec`]
//! selected for the running architecture. Layouts differ between the
//! architectures and, within one architecture, between table entries
//! and block (huge) mappings, so every query takes the [`Level`] and
//! [`Geometry`] the entry was read under.

use crate::{
	Architecture, Error, Geometry, Level, Result, aarch64::Descriptor, x86_64::PageTableEntry,
};

/// A decoded translation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
	/// The raw entry value.
	pub raw:     u64,
	/// The level the entry was read from.
	pub level:   Level,
	/// Whether the walk may follow or use the entry.
	pub present: bool,
	/// Whether the entry maps a block and so terminates the walk early.
	pub huge:    bool,
	/// The 4 KiB page-frame number the entry points at.
	pub pfn:     u64,
	/// Bits of `raw` that form the frame address.
	pfn_mask:    u64,
}

impl Entry {
	/// The entry with the frame address bits masked out.
	#[must_use]
	pub const fn flags(&self) -> u64 {
		self.raw & !self.pfn_mask
	}

	/// Whether the walk ends at this entry even though the level is
	/// not the leaf.
	#[must_use]
	pub const fn is_leaf_shortcut(&self) -> bool {
		self.huge && !self.level.is_leaf()
	}

	/// Physical address of the first byte the entry points at.
	#[must_use]
	pub const fn physical_address(&self) -> u64 {
		self.raw & self.pfn_mask
	}
}

/// Entry layouts, one per supported architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
	/// x86_64 page table entries.
	X86_64,
	/// AArch64 VMSAv8-64 descriptors.
	Aarch64,
}

impl Codec {
	/// Returns the codec for `arch`.
	#[must_use]
	pub const fn for_arch(arch: Architecture) -> Self {
		match arch {
			Architecture::X86_64 => Self::X86_64,
			Architecture::Aarch64 => Self::Aarch64,
		}
	}

	/// The architecture this codec decodes.
	#[must_use]
	pub const fn arch(self) -> Architecture {
		match self {
			Self::X86_64 => Architecture::X86_64,
			Self::Aarch64 => Architecture::Aarch64,
		}
	}

	/// Whether `raw`, read at `level`, lets the walk proceed.
	#[must_use]
	pub fn is_present(self, raw: u64, level: Level, geometry: &Geometry) -> bool {
		match self {
			Self::X86_64 => PageTableEntry::from_raw(raw).present(),
			Self::Aarch64 => {
				Descriptor::from_raw(raw)
					.kind(level.is_leaf(), geometry.supports_block(level))
					.is_valid()
			}
		}
	}

	/// Whether `raw`, read at `level`, is a present block mapping.
	#[must_use]
	pub fn is_huge(self, raw: u64, level: Level, geometry: &Geometry) -> bool {
		if !geometry.supports_block(level) {
			return false;
		}

		match self {
			Self::X86_64 => {
				let entry = PageTableEntry::from_raw(raw);
				entry.present() && entry.huge()
			}
			Self::Aarch64 => {
				Descriptor::from_raw(raw).kind(level.is_leaf(), true)
					== crate::aarch64::DescriptorKind::Block
			}
		}
	}

	/// The frame address bits of an entry at `level`.
	#[must_use]
	pub fn pfn_mask(self, level: Level, huge: bool, geometry: &Geometry) -> u64 {
		let shift = huge.then(|| geometry.shift(level));
		match self {
			Self::X86_64 => PageTableEntry::address_mask(shift),
			Self::Aarch64 => Descriptor::address_mask(shift),
		}
	}

	/// Decodes `raw`, read at `level`.
	#[must_use]
	pub fn decode(self, raw: u64, level: Level, geometry: &Geometry) -> Entry {
		let present = self.is_present(raw, level, geometry);
		let huge = self.is_huge(raw, level, geometry);
		let pfn_mask = self.pfn_mask(level, huge, geometry);

		Entry {
			raw,
			level,
			present,
			huge,
			pfn: (raw & pfn_mask) >> geometry.page_offset_bits(),
			pfn_mask,
		}
	}

	/// Builds an entry from a frame number and flag bits.
	///
	/// Bits of `flags` inside the frame address field are discarded;
	/// bits of `pfn` that do not fit the field are dropped.
	#[must_use]
	pub fn encode(self, pfn: u64, flags: u64, level: Level, huge: bool, geometry: &Geometry) -> u64 {
		let mask = self.pfn_mask(level, huge, geometry);
		(flags & !mask) | ((pfn << geometry.page_offset_bits()) & mask)
	}

	/// Replaces the frame number of a decoded entry, keeping its flags.
	#[must_use]
	pub fn with_entry_pfn(self, entry: &Entry, pfn: u64, geometry: &Geometry) -> u64 {
		self.encode(pfn, entry.flags(), entry.level, entry.huge, geometry)
	}

	/// The page-frame number field of a table or 4 KiB entry
	/// (40 bits on x86_64, 36 bits on AArch64).
	#[must_use]
	pub const fn pfn(self, raw: u64) -> u64 {
		match self {
			Self::X86_64 => PageTableEntry::from_raw(raw).pfn(),
			Self::Aarch64 => Descriptor::from_raw(raw).pfn(),
		}
	}

	/// Replaces the page-frame number field of a table or 4 KiB entry.
	#[must_use]
	pub const fn with_pfn(self, raw: u64, pfn: u64) -> u64 {
		match self {
			Self::X86_64 => PageTableEntry::from_raw(raw).with_pfn(pfn).raw(),
			Self::Aarch64 => Descriptor::from_raw(raw).with_pfn(pfn).raw(),
		}
	}

	/// Selects memory-type slot `slot` in a leaf entry.
	///
	/// `huge` moves the x86_64 PAT selector from bit 7 to bit 12.
	pub fn apply_mem_type(self, raw: u64, slot: u8, huge: bool) -> Result<u64> {
		if slot >= 8 {
			return Err(Error::SlotOutOfRange(slot));
		}

		Ok(match self {
			Self::X86_64 => PageTableEntry::from_raw(raw).with_mem_type(slot, huge).raw(),
			Self::Aarch64 => Descriptor::from_raw(raw).with_mair_index(slot).raw(),
		})
	}

	/// The memory-type slot a leaf entry selects.
	#[must_use]
	pub const fn extract_mem_type(self, raw: u64, huge: bool) -> u8 {
		match self {
			Self::X86_64 => PageTableEntry::from_raw(raw).mem_type(huge),
			Self::Aarch64 => Descriptor::from_raw(raw).mair_index(),
		}
	}

	/// A present, writable, user-accessible entry pointing at the
	/// next-level table `pfn`.
	#[must_use]
	pub const fn table_entry(self, pfn: u64) -> u64 {
		match self {
			Self::X86_64 => {
				PageTableEntry::new()
					.with_present()
					.with_writable()
					.with_user()
					.with_pfn(pfn)
					.raw()
			}
			Self::Aarch64 => Descriptor::from_raw(0b11).with_pfn(pfn).raw(),
		}
	}

	/// A present, accessed, writable mapping of frame `pfn` at `level`.
	///
	/// With `huge`, `level` must support blocks and `pfn` must be
	/// aligned to the block size.
	#[must_use]
	pub fn leaf_entry(self, pfn: u64, level: Level, huge: bool, geometry: &Geometry) -> u64 {
		let flags = match self {
			Self::X86_64 => {
				let entry = PageTableEntry::new()
					.with_present()
					.with_writable()
					.with_user()
					.with_accessed()
					.with_dirty();
				(if huge { entry.with_huge() } else { entry }).raw()
			}
			Self::Aarch64 => {
				// Inner shareable, read/write at EL1 and EL0.
				let entry = Descriptor::from_raw((0b11 << 8) | (0b01 << 6)).with_accessed(true);
				let ty = if huge { 0b01 } else { 0b11 };
				entry.raw() | ty
			}
		};

		self.encode(pfn, flags, level, huge, geometry)
	}
}
