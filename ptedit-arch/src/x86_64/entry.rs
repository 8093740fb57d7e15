#![expect(clippy::unusual_byte_groupings, reason = "address masks")]

use core::fmt;

/// Bit positions within an x86_64 page table entry.
pub mod bit {
	/// Present.
	pub const PRESENT: u32 = 0;
	/// Writable.
	pub const WRITABLE: u32 = 1;
	/// User accessible.
	pub const USER: u32 = 2;
	/// Page-level write-through (PAT index bit 0).
	pub const WRITE_THROUGH: u32 = 3;
	/// Page-level cache disable (PAT index bit 1).
	pub const CACHE_DISABLE: u32 = 4;
	/// Accessed.
	pub const ACCESSED: u32 = 5;
	/// Dirty.
	pub const DIRTY: u32 = 6;
	/// Page size; set on a PDPT/PD entry that maps a huge page.
	pub const HUGE: u32 = 7;
	/// PAT index bit 2 on a 4 KiB leaf entry. Aliases [`HUGE`].
	pub const PAT: u32 = 7;
	/// Global.
	pub const GLOBAL: u32 = 8;
	/// Software-available bit 1.
	pub const SOFTW1: u32 = 9;
	/// Software-available bit 2.
	pub const SOFTW2: u32 = 10;
	/// Software-available bit 3.
	pub const SOFTW3: u32 = 11;
	/// PAT index bit 2 on a huge entry.
	pub const PAT_LARGE: u32 = 12;
	/// Software-available bit 4.
	pub const SOFTW4: u32 = 58;
	/// Lowest bit of the 4-bit protection key.
	pub const PKEY: u32 = 59;
	/// Execute disable.
	pub const NO_EXEC: u32 = 63;
}

/// A single x86_64 page table entry.
///
/// Every accessor is a shift and a mask on the raw word; no layout
/// punning is involved, so any `u64` read out of a table is a valid
/// `PageTableEntry`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

static_assertions::const_assert_eq!(::core::mem::size_of::<PageTableEntry>(), 8);

/// Generates the query/set/clear/with quadruple for a single-bit flag.
macro_rules! flag {
	($($(#[doc = $doc:literal])* $get:ident, $set:ident, $clear:ident, $with:ident => $bit:path;)*) => {
		$(
			$(#[doc = $doc])*
			#[inline]
			#[must_use]
			pub const fn $get(self) -> bool {
				(self.0 & (1 << $bit)) != 0
			}

			#[doc = concat!("Sets the flag queried by [`Self::", stringify!($get), "`].")]
			#[inline]
			pub fn $set(&mut self) {
				self.0 |= 1 << $bit;
			}

			#[doc = concat!("Clears the flag queried by [`Self::", stringify!($get), "`].")]
			#[inline]
			pub fn $clear(&mut self) {
				self.0 &= !(1 << $bit);
			}

			#[doc = concat!("Returns a copy with the flag queried by [`Self::", stringify!($get), "`] set.")]
			#[inline]
			#[must_use]
			pub const fn $with(self) -> Self {
				Self(self.0 | (1 << $bit))
			}
		)*
	};
}

impl PageTableEntry {
	/// Mask of the physical address bits (51:12) of an entry
	/// pointing to a table or a 4 KiB page.
	pub const ADDRESS_MASK: u64 = 0x000_FFFFFFFFFF_000;
	/// Width of the page-frame number field.
	pub const PFN_BITS: u32 = 40;
	/// Mask of the protection-key field.
	pub const PKEY_MASK: u64 = 0b1111 << bit::PKEY;

	/// Creates an entry with all bits cleared.
	#[inline]
	#[must_use]
	pub const fn new() -> Self {
		Self(0)
	}

	/// Wraps a raw entry value.
	#[inline]
	#[must_use]
	pub const fn from_raw(raw: u64) -> Self {
		Self(raw)
	}

	/// Returns the raw entry value.
	#[inline]
	#[must_use]
	pub const fn raw(self) -> u64 {
		self.0
	}

	flag! {
		/// Whether the entry is present.
		present, set_present, clear_present, with_present => bit::PRESENT;
		/// Whether the mapping is writable.
		writable, set_writable, clear_writable, with_writable => bit::WRITABLE;
		/// Whether the mapping is accessible from user mode.
		user, set_user, clear_user, with_user => bit::USER;
		/// Whether write-through caching is selected.
		write_through, set_write_through, clear_write_through, with_write_through => bit::WRITE_THROUGH;
		/// Whether caching is disabled.
		cache_disable, set_cache_disable, clear_cache_disable, with_cache_disable => bit::CACHE_DISABLE;
		/// Whether the entry has been used in a translation.
		accessed, set_accessed, clear_accessed, with_accessed => bit::ACCESSED;
		/// Whether the mapped page has been written to.
		dirty, set_dirty, clear_dirty, with_dirty => bit::DIRTY;
		/// Whether a PDPT/PD entry maps a huge page.
		///
		/// Meaningless on a leaf entry, where the same bit is the
		/// third PAT selector.
		huge, set_huge, clear_huge, with_huge => bit::HUGE;
		/// Whether the translation is global.
		global, set_global, clear_global, with_global => bit::GLOBAL;
		/// Whether instruction fetches from the mapping fault.
		no_exec, set_no_exec, clear_no_exec, with_no_exec => bit::NO_EXEC;
	}

	/// The physical address bits of the entry.
	///
	/// `huge_shift` is the level shift of a huge mapping (21 or 30),
	/// or `None` for table and 4 KiB entries.
	#[inline]
	#[must_use]
	pub const fn address_mask(huge_shift: Option<u32>) -> u64 {
		match huge_shift {
			Some(shift) => Self::ADDRESS_MASK & !((1 << shift) - 1),
			None => Self::ADDRESS_MASK,
		}
	}

	/// Returns the physical address the entry points to.
	#[inline]
	#[must_use]
	pub const fn address(self, huge_shift: Option<u32>) -> u64 {
		self.0 & Self::address_mask(huge_shift)
	}

	/// Replaces the physical address, leaving every other bit untouched.
	#[inline]
	#[must_use]
	pub const fn with_address(self, address: u64, huge_shift: Option<u32>) -> Self {
		let mask = Self::address_mask(huge_shift);
		Self((self.0 & !mask) | (address & mask))
	}

	/// Returns the 40-bit page-frame number field.
	#[inline]
	#[must_use]
	pub const fn pfn(self) -> u64 {
		(self.0 >> 12) & ((1 << Self::PFN_BITS) - 1)
	}

	/// Replaces the 40-bit page-frame number field.
	#[inline]
	#[must_use]
	pub const fn with_pfn(self, pfn: u64) -> Self {
		self.with_address(pfn << 12, None)
	}

	/// Returns the protection key.
	#[inline]
	#[must_use]
	pub const fn protection_key(self) -> u8 {
		((self.0 & Self::PKEY_MASK) >> bit::PKEY) as u8
	}

	/// Replaces the protection key; only the low 4 bits of `key` are used.
	#[inline]
	#[must_use]
	pub const fn with_protection_key(self, key: u8) -> Self {
		Self((self.0 & !Self::PKEY_MASK) | (((key as u64) << bit::PKEY) & Self::PKEY_MASK))
	}

	/// Position of the third PAT selector bit.
	#[inline]
	const fn pat_bit(huge: bool) -> u32 {
		if huge { bit::PAT_LARGE } else { bit::PAT }
	}

	/// Returns the 3-bit PAT slot selected by the entry
	/// (`PWT | PCD << 1 | PAT << 2`).
	#[inline]
	#[must_use]
	pub const fn mem_type(self, huge: bool) -> u8 {
		let pwt = (self.0 >> bit::WRITE_THROUGH) & 1;
		let pcd = (self.0 >> bit::CACHE_DISABLE) & 1;
		let pat = (self.0 >> Self::pat_bit(huge)) & 1;
		(pwt | (pcd << 1) | (pat << 2)) as u8
	}

	/// Selects PAT slot `slot` (only the low 3 bits are used).
	#[inline]
	#[must_use]
	pub const fn with_mem_type(self, slot: u8, huge: bool) -> Self {
		let pat_bit = Self::pat_bit(huge);
		let mut raw = self.0
			& !((1 << bit::WRITE_THROUGH) | (1 << bit::CACHE_DISABLE) | (1 << pat_bit));
		if slot & 1 != 0 {
			raw |= 1 << bit::WRITE_THROUGH;
		}
		if slot & 2 != 0 {
			raw |= 1 << bit::CACHE_DISABLE;
		}
		if slot & 4 != 0 {
			raw |= 1 << pat_bit;
		}
		Self(raw)
	}
}

impl From<u64> for PageTableEntry {
	fn from(raw: u64) -> Self {
		Self(raw)
	}
}

impl From<PageTableEntry> for u64 {
	fn from(entry: PageTableEntry) -> Self {
		entry.0
	}
}

impl fmt::Debug for PageTableEntry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PageTableEntry")
			.field("raw", &format_args!("{:#018x}", self.0))
			.field("present", &self.present())
			.field("writable", &self.writable())
			.field("user", &self.user())
			.field("huge", &self.huge())
			.field("no_exec", &self.no_exec())
			.field("pfn", &format_args!("{:#x}", self.pfn()))
			.finish()
	}
}
