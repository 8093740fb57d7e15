//! VMSAv8-64 translation table descriptors, 4 KiB granule.
//!
//! The same two type bits mean different things depending on where a
//! descriptor sits:
//!
//! | bits `[1:0]` | non-leaf, block-capable | non-leaf, table-only | leaf (level 3) |
//! |--------------|-------------------------|----------------------|----------------|
//! | `0bX0`       | invalid                 | invalid              | invalid        |
//! | `0b01`       | block                   | malformed            | malformed      |
//! | `0b11`       | table                   | table                | page           |
//!
//! A malformed descriptor faults the hardware walk exactly like an
//! invalid one.
//!
//! See D5.3 of the ARMv8-A Architecture Reference Manual.

use core::fmt;

/// Bit positions within an AArch64 descriptor.
pub mod bit {
	/// Descriptor valid.
	pub const VALID: u32 = 0;
	/// Table (non-leaf) or page (leaf) descriptor.
	pub const TABLE: u32 = 1;
	/// Lowest bit of the 3-bit `AttrIndx` field.
	pub const ATTR_INDEX: u32 = 2;
	/// Non-secure.
	pub const NON_SECURE: u32 = 5;
	/// Lowest bit of the 2-bit access permission field.
	pub const ACCESS_PERMISSIONS: u32 = 6;
	/// Lowest bit of the 2-bit shareability field.
	pub const SHAREABILITY: u32 = 8;
	/// Access flag.
	pub const ACCESS_FLAG: u32 = 10;
	/// Not global.
	pub const NOT_GLOBAL: u32 = 11;
	/// Contiguous hint.
	pub const CONTIGUOUS: u32 = 52;
	/// Privileged execute-never.
	pub const PXN: u32 = 53;
	/// (Unprivileged) execute-never.
	pub const UXN: u32 = 54;
	/// Lowest of the nine software-available bits.
	pub const SOFTWARE: u32 = 55;
}

/// What a descriptor means at the position it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
	/// Bit 0 clear; the walk stops here.
	Invalid,
	/// Reserved encoding; the walk stops here as for [`Self::Invalid`].
	Malformed,
	/// Points at the next-level table.
	Table,
	/// Maps a block of memory at a non-leaf level.
	Block,
	/// Maps a single page at the leaf level.
	Page,
}

impl DescriptorKind {
	/// Whether the walk may use the descriptor.
	#[must_use]
	pub const fn is_valid(self) -> bool {
		matches!(self, Self::Table | Self::Block | Self::Page)
	}
}

/// A single AArch64 translation table descriptor.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Descriptor(u64);

static_assertions::const_assert_eq!(::core::mem::size_of::<Descriptor>(), 8);

impl Descriptor {
	/// Output address bits `[47:12]` of a table or page descriptor.
	pub const ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_F000;
	/// Width of the page-frame number field.
	pub const PFN_BITS: u32 = 36;
	/// Mask of the `AttrIndx` field.
	pub const ATTR_INDEX_MASK: u64 = 0b111 << bit::ATTR_INDEX;

	/// Creates a descriptor with all bits cleared.
	#[inline]
	#[must_use]
	pub const fn new() -> Self {
		Self(0)
	}

	/// Wraps a raw descriptor.
	#[inline]
	#[must_use]
	pub const fn from_raw(raw: u64) -> Self {
		Self(raw)
	}

	/// Returns the raw descriptor.
	#[inline]
	#[must_use]
	pub const fn raw(self) -> u64 {
		self.0
	}

	/// Tests a single bit.
	#[inline]
	const fn bit(self, bit: u32) -> bool {
		(self.0 >> bit) & 1 != 0
	}

	/// Returns a copy with a single bit set to `value`.
	#[inline]
	const fn with_bit(self, bit: u32, value: bool) -> Self {
		if value {
			Self(self.0 | (1 << bit))
		} else {
			Self(self.0 & !(1 << bit))
		}
	}

	/// Whether bit 0 is set.
	#[inline]
	#[must_use]
	pub const fn valid(self) -> bool {
		self.bit(bit::VALID)
	}

	/// Whether bit 1 is set.
	#[inline]
	#[must_use]
	pub const fn table(self) -> bool {
		self.bit(bit::TABLE)
	}

	/// Classifies the descriptor.
	///
	/// `leaf` selects level-3 semantics; `block_capable` tells whether
	/// a non-leaf descriptor at this position may map a block.
	#[must_use]
	pub const fn kind(self, leaf: bool, block_capable: bool) -> DescriptorKind {
		if !self.valid() {
			return DescriptorKind::Invalid;
		}

		match (self.table(), leaf) {
			(true, true) => DescriptorKind::Page,
			(true, false) => DescriptorKind::Table,
			(false, false) if block_capable => DescriptorKind::Block,
			(false, _) => DescriptorKind::Malformed,
		}
	}

	/// The output address bits of the descriptor. A block's low
	/// address bits below `block_shift` are attributes, not address.
	#[inline]
	#[must_use]
	pub const fn address_mask(block_shift: Option<u32>) -> u64 {
		match block_shift {
			Some(shift) => Self::ADDRESS_MASK & !((1 << shift) - 1),
			None => Self::ADDRESS_MASK,
		}
	}

	/// Returns the output address.
	#[inline]
	#[must_use]
	pub const fn address(self, block_shift: Option<u32>) -> u64 {
		self.0 & Self::address_mask(block_shift)
	}

	/// Replaces the output address, leaving every other bit untouched.
	#[inline]
	#[must_use]
	pub const fn with_address(self, address: u64, block_shift: Option<u32>) -> Self {
		let mask = Self::address_mask(block_shift);
		Self((self.0 & !mask) | (address & mask))
	}

	/// Returns the 36-bit page-frame number field.
	#[inline]
	#[must_use]
	pub const fn pfn(self) -> u64 {
		(self.0 >> 12) & ((1 << Self::PFN_BITS) - 1)
	}

	/// Replaces the 36-bit page-frame number field.
	#[inline]
	#[must_use]
	pub const fn with_pfn(self, pfn: u64) -> Self {
		self.with_address(pfn << 12, None)
	}

	/// The `MAIR_EL1` slot selected by `AttrIndx[2:0]`.
	#[inline]
	#[must_use]
	pub const fn mair_index(self) -> u8 {
		((self.0 & Self::ATTR_INDEX_MASK) >> bit::ATTR_INDEX) as u8
	}

	/// Selects `MAIR_EL1` slot `index` (only the low 3 bits are used).
	#[inline]
	#[must_use]
	pub const fn with_mair_index(self, index: u8) -> Self {
		Self((self.0 & !Self::ATTR_INDEX_MASK) | (((index & 0b111) as u64) << bit::ATTR_INDEX))
	}

	/// The 2-bit access permissions field (`AP[2:1]`).
	#[inline]
	#[must_use]
	pub const fn access_permissions(self) -> u8 {
		((self.0 >> bit::ACCESS_PERMISSIONS) & 0b11) as u8
	}

	/// The 2-bit shareability field.
	#[inline]
	#[must_use]
	pub const fn shareability(self) -> u8 {
		((self.0 >> bit::SHAREABILITY) & 0b11) as u8
	}

	/// Non-secure bit.
	#[inline]
	#[must_use]
	pub const fn non_secure(self) -> bool {
		self.bit(bit::NON_SECURE)
	}

	/// Access flag.
	#[inline]
	#[must_use]
	pub const fn accessed(self) -> bool {
		self.bit(bit::ACCESS_FLAG)
	}

	/// Returns a copy with the access flag set to `value`.
	#[inline]
	#[must_use]
	pub const fn with_accessed(self, value: bool) -> Self {
		self.with_bit(bit::ACCESS_FLAG, value)
	}

	/// Not-global bit.
	#[inline]
	#[must_use]
	pub const fn not_global(self) -> bool {
		self.bit(bit::NOT_GLOBAL)
	}

	/// Contiguous hint.
	#[inline]
	#[must_use]
	pub const fn contiguous(self) -> bool {
		self.bit(bit::CONTIGUOUS)
	}

	/// Privileged execute-never.
	#[inline]
	#[must_use]
	pub const fn pxn(self) -> bool {
		self.bit(bit::PXN)
	}

	/// Execute-never.
	#[inline]
	#[must_use]
	pub const fn uxn(self) -> bool {
		self.bit(bit::UXN)
	}

	/// Returns a copy with the execute-never bits set to `value`.
	#[inline]
	#[must_use]
	pub const fn with_no_exec(self, value: bool) -> Self {
		self.with_bit(bit::PXN, value).with_bit(bit::UXN, value)
	}

	/// The nine software-available bits `[63:55]`.
	#[inline]
	#[must_use]
	pub const fn software(self) -> u16 {
		(self.0 >> bit::SOFTWARE) as u16
	}
}

impl From<u64> for Descriptor {
	fn from(raw: u64) -> Self {
		Self(raw)
	}
}

impl From<Descriptor> for u64 {
	fn from(descriptor: Descriptor) -> Self {
		descriptor.0
	}
}

impl fmt::Debug for Descriptor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Descriptor")
			.field("raw", &format_args!("{:#018x}", self.0))
			.field("valid", &self.valid())
			.field("table", &self.table())
			.field("attr_index", &self.mair_index())
			.field("af", &self.accessed())
			.field("pfn", &format_args!("{:#x}", self.pfn()))
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classification() {
		let invalid = Descriptor::from_raw(0b10);
		let block = Descriptor::from_raw(0b01);
		let table = Descriptor::from_raw(0b11);

		for (leaf, capable) in [(false, false), (false, true), (true, false)] {
			assert_eq!(invalid.kind(leaf, capable), DescriptorKind::Invalid);
		}

		assert_eq!(table.kind(false, true), DescriptorKind::Table);
		assert_eq!(table.kind(false, false), DescriptorKind::Table);
		assert_eq!(table.kind(true, false), DescriptorKind::Page);

		assert_eq!(block.kind(false, true), DescriptorKind::Block);
		assert_eq!(block.kind(false, false), DescriptorKind::Malformed);
		assert_eq!(block.kind(true, false), DescriptorKind::Malformed);
		assert!(!DescriptorKind::Malformed.is_valid());
	}

	#[test]
	fn attribute_fields() {
		let desc = Descriptor::new()
			.with_mair_index(5)
			.with_accessed(true)
			.with_no_exec(true);
		assert_eq!(desc.mair_index(), 5);
		assert!(desc.accessed());
		assert!(desc.pxn() && desc.uxn());
		assert_eq!(desc.raw(), (5 << 2) | (1 << 10) | (1 << 53) | (1 << 54));

		let desc = Descriptor::from_raw(0xFF80_0000_0000_03C0);
		assert_eq!(desc.access_permissions(), 0b11);
		assert_eq!(desc.shareability(), 0b11);
		assert_eq!(desc.software(), 0x1FF);
		assert!(!desc.non_secure());
	}

	#[test]
	fn pfn_field_width() {
		let desc = Descriptor::from_raw(0x0060_0000_0000_0703).with_pfn(0xF_FFFF_FFFF);
		assert_eq!(desc.pfn(), 0xF_FFFF_FFFF);
		assert_eq!(desc.raw() & !Descriptor::ADDRESS_MASK, 0x0060_0000_0000_0703);
		assert_eq!(
			Descriptor::from_raw(u64::MAX).pfn(),
			(1 << Descriptor::PFN_BITS) - 1
		);

		let block = Descriptor::from_raw(0x4020_0701);
		assert_eq!(block.address(Some(21)), 0x4020_0000);
		assert_eq!(block.address(Some(30)), 0x4000_0000);
	}
}
