//! The `IA32_PAT` model-specific register.

/// Memory types programmable into a PAT slot.
///
/// Values 2 and 3 are reserved.
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	strum::Display,
	strum::EnumString,
	strum::EnumIter,
	strum::FromRepr,
)]
#[repr(u8)]
pub enum PatType {
	/// Uncacheable.
	#[strum(to_string = "UC")]
	Uncacheable     = 0,
	/// Write combining.
	#[strum(to_string = "WC")]
	WriteCombining  = 1,
	/// Write through.
	#[strum(to_string = "WT")]
	WriteThrough    = 4,
	/// Write protected.
	#[strum(to_string = "WP")]
	WriteProtected  = 5,
	/// Write back.
	#[strum(to_string = "WB")]
	WriteBack       = 6,
	/// Uncached, overridable by MTRRs.
	#[strum(to_string = "UC-")]
	UncachedMinus   = 7,
}

impl PatType {
	/// The raw 3-bit encoding.
	#[expect(
		clippy::as_conversions,
		reason = "u8 cast is safe as that is the repr of the enum"
	)]
	#[must_use]
	pub const fn bits(self) -> u8 {
		self as u8
	}
}

/// A value of the `IA32_PAT` MSR: eight one-byte slots, of which
/// only the low 3 bits are significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Pat(u64);

impl Pat {
	/// The power-on value: WB, WT, UC-, UC repeated twice.
	pub const RESET: Self = Self(0x0007_0406_0007_0406);
	/// Significant bits of each slot.
	pub const SLOT_MASK: u8 = 0b111;

	/// Wraps a raw register value.
	#[must_use]
	pub const fn from_raw(raw: u64) -> Self {
		Self(raw)
	}

	/// Returns the raw register value.
	#[must_use]
	pub const fn raw(self) -> u64 {
		self.0
	}

	/// Returns the 3-bit type of `slot` (`0..8`).
	#[must_use]
	pub const fn get(self, slot: u8) -> u8 {
		((self.0 >> (slot * 8)) & 0b111) as u8
	}

	/// Returns a copy with `slot` (`0..8`) programmed to `value`.
	///
	/// The whole slot byte is cleared first so the reserved
	/// upper bits never carry stale state.
	#[must_use]
	pub const fn with(self, slot: u8, value: u8) -> Self {
		let shift = slot * 8;
		let cleared = self.0 & !(0xFF << shift);
		Self(cleared | (((value & Self::SLOT_MASK) as u64) << shift))
	}

	/// Decodes `slot` into a known type, or `None` if it holds
	/// a reserved encoding.
	#[must_use]
	pub fn get_type(self, slot: u8) -> Option<PatType> {
		PatType::from_repr(self.get(slot))
	}
}

/// Short name of a 3-bit PAT value, as printed by the tooling.
#[must_use]
pub fn describe(value: u8) -> &'static str {
	match PatType::from_repr(value) {
		Some(PatType::Uncacheable) => "UC",
		Some(PatType::WriteCombining) => "WC",
		Some(PatType::WriteThrough) => "WT",
		Some(PatType::WriteProtected) => "WP",
		Some(PatType::WriteBack) => "WB",
		Some(PatType::UncachedMinus) => "UC-",
		None => "Rsvd",
	}
}

#[cfg(test)]
mod tests {
	use strum::IntoEnumIterator;

	use super::*;

	#[test]
	fn reset_value_layout() {
		let pat = Pat::RESET;
		assert_eq!(pat.get_type(0), Some(PatType::WriteBack));
		assert_eq!(pat.get_type(1), Some(PatType::WriteThrough));
		assert_eq!(pat.get_type(2), Some(PatType::UncachedMinus));
		assert_eq!(pat.get_type(3), Some(PatType::Uncacheable));
		assert_eq!(pat.get_type(4), Some(PatType::WriteBack));
		assert_eq!(pat.get_type(7), Some(PatType::Uncacheable));
	}

	#[test]
	fn with_clears_the_whole_slot() {
		let pat = Pat::from_raw(u64::MAX).with(3, PatType::WriteCombining.bits());
		assert_eq!(pat.raw(), 0xFFFF_FFFF_01FF_FFFF);
		assert_eq!(pat.get(3), 1);
	}

	#[test]
	fn names() {
		for ty in PatType::iter() {
			assert_eq!(describe(ty.bits()), ty.to_string());
		}
		assert_eq!(describe(2), "Rsvd");
		assert_eq!(describe(3), "Rsvd");
		assert_eq!(describe(9), "Rsvd");
	}
}
