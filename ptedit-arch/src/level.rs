//! Translation levels and the per-ladder validity bitmask.

use core::fmt;

/// One stage of the translation hierarchy, ordered root first.
///
/// The naming follows the five-level layout; paging modes with
/// fewer levels fold the missing ones away (see
/// [`crate::Geometry::is_present`]).
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	PartialOrd,
	Ord,
	strum::Display,
	strum::EnumIter,
	serde::Serialize,
	serde::Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Level {
	/// The root directory (PML5 under 5-level paging, PML4 otherwise).
	Pgd = 0,
	/// The fourth-level directory.
	P4d = 1,
	/// The upper directory (PDPT on x86_64).
	Pud = 2,
	/// The middle directory (PD on x86_64).
	Pmd = 3,
	/// The leaf table.
	Pte = 4,
}

impl Level {
	/// Every level, root first.
	pub const ALL: [Self; 5] = [Self::Pgd, Self::P4d, Self::Pud, Self::Pmd, Self::Pte];

	/// Position of the level, root being `0`.
	#[expect(
		clippy::as_conversions,
		reason = "usize cast is safe as that is the repr of the enum"
	)]
	#[must_use]
	pub const fn index(self) -> usize {
		self as usize
	}

	/// The bit representing this level in a [`LevelMask`].
	#[must_use]
	pub const fn bit(self) -> u64 {
		1 << self.index()
	}

	/// The next level towards the leaf, if any.
	#[must_use]
	pub const fn child(self) -> Option<Self> {
		match self {
			Self::Pgd => Some(Self::P4d),
			Self::P4d => Some(Self::Pud),
			Self::Pud => Some(Self::Pmd),
			Self::Pmd => Some(Self::Pte),
			Self::Pte => None,
		}
	}

	/// The next level towards the root, if any.
	#[must_use]
	pub const fn parent(self) -> Option<Self> {
		match self {
			Self::Pgd => None,
			Self::P4d => Some(Self::Pgd),
			Self::Pud => Some(Self::P4d),
			Self::Pmd => Some(Self::Pud),
			Self::Pte => Some(Self::Pmd),
		}
	}

	/// Whether this is the leaf level.
	#[must_use]
	pub const fn is_leaf(self) -> bool {
		matches!(self, Self::Pte)
	}
}

/// A set of [`Level`]s, stored in the same bit order as the
/// `valid` word exchanged with the privileged side
/// (`PGD = 1 << 0` .. `PTE = 1 << 4`).
#[derive(
	Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct LevelMask(u64);

impl LevelMask {
	/// No levels.
	pub const EMPTY: Self = Self(0);
	/// All five levels.
	pub const ALL: Self = Self(0b1_1111);

	/// Builds a mask from its raw representation. Bits above
	/// the leaf are discarded.
	#[must_use]
	pub const fn from_bits(bits: u64) -> Self {
		Self(bits & Self::ALL.0)
	}

	/// Returns the raw representation.
	#[must_use]
	pub const fn bits(self) -> u64 {
		self.0
	}

	/// Whether `level` is in the set.
	#[must_use]
	pub const fn contains(self, level: Level) -> bool {
		(self.0 & level.bit()) != 0
	}

	/// Adds `level` to the set.
	pub fn insert(&mut self, level: Level) {
		self.0 |= level.bit();
	}

	/// Removes `level` from the set.
	pub fn remove(&mut self, level: Level) {
		self.0 &= !level.bit();
	}

	/// Returns a copy with `level` added.
	#[must_use]
	pub const fn with(self, level: Level) -> Self {
		Self(self.0 | level.bit())
	}

	/// Returns the intersection of two masks.
	#[must_use]
	pub const fn intersection(self, other: Self) -> Self {
		Self(self.0 & other.0)
	}

	/// Whether the set is empty.
	#[must_use]
	pub const fn is_empty(self) -> bool {
		self.0 == 0
	}

	/// Iterates the levels in the set, root first.
	pub fn iter(self) -> impl Iterator<Item = Level> {
		Level::ALL.into_iter().filter(move |l| self.contains(*l))
	}

	/// The deepest level in the set.
	#[must_use]
	pub fn deepest(self) -> Option<Level> {
		self.iter().last()
	}
}

impl From<Level> for LevelMask {
	fn from(level: Level) -> Self {
		Self(level.bit())
	}
}

impl FromIterator<Level> for LevelMask {
	fn from_iter<T: IntoIterator<Item = Level>>(iter: T) -> Self {
		let mut mask = Self::EMPTY;
		for level in iter {
			mask.insert(level);
		}
		mask
	}
}

impl fmt::Debug for LevelMask {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_set().entries(self.iter()).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bits_match_wire_layout() {
		assert_eq!(Level::Pgd.bit(), 1 << 0);
		assert_eq!(Level::P4d.bit(), 1 << 1);
		assert_eq!(Level::Pud.bit(), 1 << 2);
		assert_eq!(Level::Pmd.bit(), 1 << 3);
		assert_eq!(Level::Pte.bit(), 1 << 4);
	}

	#[test]
	fn parent_and_child_are_inverse() {
		for level in Level::ALL {
			if let Some(child) = level.child() {
				assert_eq!(child.parent(), Some(level));
			}
		}
		assert!(Level::Pte.is_leaf());
		assert_eq!(Level::Pgd.parent(), None);
	}

	#[test]
	fn mask_operations() {
		let mut mask: LevelMask = [Level::Pgd, Level::Pmd].into_iter().collect();
		assert_eq!(mask.bits(), 0b0_1001);
		assert!(mask.contains(Level::Pmd));
		assert!(!mask.contains(Level::Pte));
		mask.insert(Level::Pte);
		mask.remove(Level::Pgd);
		assert_eq!(mask.iter().collect::<Vec<_>>(), [Level::Pmd, Level::Pte]);
		assert_eq!(mask.deepest(), Some(Level::Pte));
		assert_eq!(LevelMask::from_bits(0xff), LevelMask::ALL);
		assert!(LevelMask::EMPTY.is_empty());
	}

	#[test]
	fn display_names() {
		assert_eq!(Level::Pgd.to_string(), "PGD");
		assert_eq!(Level::Pte.to_string(), "PTE");
	}
}
