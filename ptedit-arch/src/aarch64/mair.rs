//! The `MAIR_EL1` memory attribute indirection register.
//!
//! Eight one-byte attribute slots; a descriptor's `AttrIndx` picks
//! one. A byte whose upper nibble is zero describes device memory,
//! otherwise the upper and lower nibbles give the outer and inner
//! cacheability of normal memory.

use core::fmt;

/// Shorthand attribute bytes with identical inner and outer policies.
pub mod shorthand {
	/// Normal memory, inner and outer non-cacheable.
	pub const UC: u8 = 0x44;
	/// Normal memory, inner and outer write-through non-transient, RW-allocate.
	pub const WT: u8 = 0xbb;
	/// Normal memory, inner and outer write-back non-transient, RW-allocate.
	pub const WB: u8 = 0xff;
}

/// A `MAIR_EL1` value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct MairRegister(u64);

impl MairRegister {
	/// The layout Linux programs: device nGnRnE, nGnRE, GRE,
	/// normal non-cacheable, normal write-back.
	pub const LINUX: Self = Self(0x0000_00FF_440C_0400);

	/// Wraps a raw register value.
	#[inline]
	#[must_use]
	pub const fn from_raw(raw: u64) -> Self {
		Self(raw)
	}

	/// Returns the raw register value.
	#[inline]
	#[must_use]
	pub const fn raw(self) -> u64 {
		self.0
	}

	/// Gets the attributes of slot `index`. Indices above 7 are masked.
	#[inline]
	#[must_use]
	pub const fn get(self, index: u8) -> MairAttributes {
		let shift = (index & 0b111) * 8;
		MairAttributes((self.0 >> shift) as u8)
	}

	/// Returns a copy with slot `index` replaced. Indices above 7 are masked.
	#[inline]
	#[must_use]
	pub const fn with(self, index: u8, attrs: MairAttributes) -> Self {
		let shift = (index & 0b111) * 8;
		let mask = 0xFF << shift;
		Self((self.0 & !mask) | ((attrs.0 as u64) << shift))
	}
}

impl fmt::Debug for MairRegister {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_list()
			.entries((0..8).map(|i| self.get(i)))
			.finish()
	}
}

/// Memory attributes of a single MAIR slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct MairAttributes(u8);

impl MairAttributes {
	/// Wraps a raw attribute byte.
	#[inline]
	#[must_use]
	pub const fn from_raw(raw: u8) -> Self {
		Self(raw)
	}

	/// Returns the raw attribute byte.
	#[inline]
	#[must_use]
	pub const fn raw(self) -> u8 {
		self.0
	}

	/// Outer cacheability nibble.
	#[inline]
	#[must_use]
	pub const fn outer(self) -> u8 {
		self.0 >> 4
	}

	/// Inner cacheability nibble.
	#[inline]
	#[must_use]
	pub const fn inner(self) -> u8 {
		self.0 & 0b1111
	}

	/// Builds normal-memory attributes from outer and inner policies.
	#[inline]
	#[must_use]
	pub const fn memory(outer: Cacheability, inner: Cacheability) -> Self {
		Self((outer.bits() << 4) | inner.bits())
	}

	/// Builds device-memory attributes.
	#[inline]
	#[must_use]
	pub const fn device(attr: MairDeviceAttribute) -> Self {
		Self(attr.bits())
	}

	/// Decodes the attributes.
	#[must_use]
	pub fn ty(self) -> AttributesType {
		if self.outer() == 0 {
			return MairDeviceAttribute::from_repr(self.0)
				.map_or(AttributesType::Unpredictable(self.0), AttributesType::Device);
		}

		match (
			Cacheability::from_repr(self.outer()),
			Cacheability::from_repr(self.inner()),
		) {
			(Some(outer), Some(inner)) => AttributesType::Memory { outer, inner },
			_ => AttributesType::Unpredictable(self.0),
		}
	}
}

impl fmt::Debug for MairAttributes {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.ty() {
			AttributesType::Device(attr) => write!(f, "Device({attr})"),
			AttributesType::Memory { outer, inner } => {
				write!(f, "Memory(outer={outer:?}, inner={inner:?})")
			}
			AttributesType::Unpredictable(raw) => write!(f, "Unpredictable({raw:#04x})"),
		}
	}
}

/// The decoded meaning of a [`MairAttributes`] byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributesType {
	/// Device memory.
	Device(MairDeviceAttribute),
	/// Normal memory.
	Memory {
		/// Outer cacheability.
		outer: Cacheability,
		/// Inner cacheability.
		inner: Cacheability,
	},
	/// An encoding the architecture leaves UNPREDICTABLE.
	Unpredictable(u8),
}

/// Device memory attributes.
///
/// See section E2.8.2 of the ARMv8-A Architecture Reference Manual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum MairDeviceAttribute {
	/// Device non-Gathering, non-Reordering, No Early write acknowledgement.
	#[strum(to_string = "nGnRnE")]
	DnGnRnE = 0b0000,
	/// Device non-Gathering, non-Reordering, Early write acknowledgement.
	#[strum(to_string = "nGnRE")]
	DnGnRE  = 0b0100,
	/// Device non-Gathering, Reordering, Early Write Acknowledgement.
	#[strum(to_string = "nGRE")]
	DnGRE   = 0b1000,
	/// Device Gathering, Reordering, Early Write Acknowledgement.
	#[strum(to_string = "GRE")]
	DGRE    = 0b1100,
}

impl MairDeviceAttribute {
	/// The raw attribute byte.
	#[expect(
		clippy::as_conversions,
		reason = "u8 cast is safe as that is the repr of the enum"
	)]
	#[must_use]
	pub const fn bits(self) -> u8 {
		self as u8
	}
}

/// Cacheability policy of one half (inner or outer) of a
/// normal-memory attribute byte.
///
/// See section E2.8.1 of the ARMv8-A Architecture Reference Manual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr)]
#[repr(u8)]
pub enum Cacheability {
	/// Write-through transient, write allocate.
	WriteThroughTransientW     = 0b0001,
	/// Write-through transient, read allocate.
	WriteThroughTransientR     = 0b0010,
	/// Write-through transient, read and write allocate.
	WriteThroughTransientRW    = 0b0011,
	/// Non-cacheable.
	NonCacheable               = 0b0100,
	/// Write-back transient, write allocate.
	WriteBackTransientW        = 0b0101,
	/// Write-back transient, read allocate.
	WriteBackTransientR        = 0b0110,
	/// Write-back transient, read and write allocate.
	WriteBackTransientRW       = 0b0111,
	/// Write-through non-transient, no allocation.
	WriteThroughNonTransient   = 0b1000,
	/// Write-through non-transient, write allocate.
	WriteThroughNonTransientW  = 0b1001,
	/// Write-through non-transient, read allocate.
	WriteThroughNonTransientR  = 0b1010,
	/// Write-through non-transient, read and write allocate.
	WriteThroughNonTransientRW = 0b1011,
	/// Write-back non-transient, no allocation.
	WriteBackNonTransient      = 0b1100,
	/// Write-back non-transient, write allocate.
	WriteBackNonTransientW     = 0b1101,
	/// Write-back non-transient, read allocate.
	WriteBackNonTransientR     = 0b1110,
	/// Write-back non-transient, read and write allocate.
	WriteBackNonTransientRW    = 0b1111,
}

impl Cacheability {
	/// The raw 4-bit encoding.
	#[expect(
		clippy::as_conversions,
		reason = "u8 cast is safe as that is the repr of the enum"
	)]
	#[must_use]
	pub const fn bits(self) -> u8 {
		self as u8
	}
}

/// Short name of a single cacheability nibble, as printed by the tooling.
const fn nibble_name(nibble: u8) -> &'static str {
	match nibble & 0b1111 {
		0 => "DM",
		1..=3 | 8..=11 => "WT",
		4 => "UC",
		_ => "WB",
	}
}

/// Short name of an attribute byte, as printed by the tooling.
///
/// Bytes with identical nibbles collapse to one name (`0xff` is
/// `"WB"`); otherwise the inner and outer halves are spelled out
/// (`0x4f` is `"IWBOUC"`).
#[must_use]
pub fn describe(value: u8) -> String {
	let attrs = MairAttributes::from_raw(value);
	if attrs.inner() == attrs.outer() {
		nibble_name(attrs.inner()).to_owned()
	} else {
		format!(
			"I{}O{}",
			nibble_name(attrs.inner()),
			nibble_name(attrs.outer())
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn slot_access() {
		let mair = MairRegister::LINUX;
		assert_eq!(mair.get(0).ty(), AttributesType::Device(MairDeviceAttribute::DnGnRnE));
		assert_eq!(mair.get(1).ty(), AttributesType::Device(MairDeviceAttribute::DnGnRE));
		assert_eq!(mair.get(2).ty(), AttributesType::Device(MairDeviceAttribute::DGRE));
		assert_eq!(
			mair.get(3).ty(),
			AttributesType::Memory {
				outer: Cacheability::NonCacheable,
				inner: Cacheability::NonCacheable,
			}
		);
		assert_eq!(mair.get(4).raw(), shorthand::WB);

		let mair = mair.with(
			6,
			MairAttributes::memory(
				Cacheability::WriteThroughNonTransientRW,
				Cacheability::WriteThroughNonTransientRW,
			),
		);
		assert_eq!(mair.get(6).raw(), shorthand::WT);
		assert_eq!(mair.raw(), 0x00BB_00FF_440C_0400);
	}

	#[test]
	fn unpredictable_encodings() {
		assert_eq!(
			MairAttributes::from_raw(0x02).ty(),
			AttributesType::Unpredictable(0x02)
		);
		assert_eq!(
			MairAttributes::from_raw(0x40).ty(),
			AttributesType::Unpredictable(0x40)
		);
	}

	#[test]
	fn names() {
		assert_eq!(describe(shorthand::UC), "UC");
		assert_eq!(describe(shorthand::WT), "WT");
		assert_eq!(describe(shorthand::WB), "WB");
		assert_eq!(describe(0x00), "DM");
		assert_eq!(describe(0x4f), "IWBOUC");
		assert_eq!(describe(0x04), "IUCODM");
	}
}
