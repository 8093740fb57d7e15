//! Paging geometry: the static shape of a translation hierarchy.
//!
//! A [`Geometry`] tells the walker which levels exist, how many
//! virtual-address bits each level consumes and which levels may
//! terminate the walk with a block (huge) mapping. Folded levels
//! consume no bits and are never read from memory.

use crate::{Architecture, Error, Level, Result};

/// Size in bytes of a single translation entry.
pub const ENTRY_SIZE: usize = 8;

/// The paging modes this crate knows how to walk.
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
	serde::Serialize,
	serde::Deserialize,
)]
pub enum PagingMode {
	/// x86_64 4-level paging, 48-bit virtual addresses.
	#[strum(to_string = "x86_64-l4")]
	#[serde(rename = "x86_64-l4")]
	X86_64Level4,
	/// x86_64 5-level paging (`CR4.LA57`), 57-bit virtual addresses.
	#[strum(to_string = "x86_64-l5")]
	#[serde(rename = "x86_64-l5")]
	X86_64Level5,
	/// AArch64, 4 KiB granule, 39-bit virtual addresses (3 levels).
	#[strum(to_string = "aarch64-va39")]
	#[serde(rename = "aarch64-va39")]
	Aarch64Va39,
	/// AArch64, 4 KiB granule, 48-bit virtual addresses (4 levels).
	#[strum(to_string = "aarch64-va48")]
	#[serde(rename = "aarch64-va48")]
	Aarch64Va48,
}

impl PagingMode {
	/// The architecture this mode belongs to.
	#[must_use]
	pub const fn arch(self) -> Architecture {
		match self {
			Self::X86_64Level4 | Self::X86_64Level5 => Architecture::X86_64,
			Self::Aarch64Va39 | Self::Aarch64Va48 => Architecture::Aarch64,
		}
	}

	/// Number of translation levels actually present.
	#[must_use]
	pub const fn levels(self) -> u32 {
		match self {
			Self::Aarch64Va39 => 3,
			Self::X86_64Level4 | Self::Aarch64Va48 => 4,
			Self::X86_64Level5 => 5,
		}
	}

	/// Looks up the mode of `arch` with `levels` translation levels.
	pub fn with_levels(arch: Architecture, levels: u32) -> Result<Self> {
		match (arch, levels) {
			(Architecture::X86_64, 4) => Ok(Self::X86_64Level4),
			(Architecture::X86_64, 5) => Ok(Self::X86_64Level5),
			(Architecture::Aarch64, 3) => Ok(Self::Aarch64Va39),
			(Architecture::Aarch64, 4) => Ok(Self::Aarch64Va48),
			(arch, levels) => Err(Error::UnsupportedPagingMode { arch, levels }),
		}
	}
}

/// Shape of one translation level within a [`Geometry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelSpec {
	/// Whether the level physically exists. Absent levels are folded
	/// into their parent.
	pub present:    bool,
	/// Virtual-address bits consumed by this level's index.
	pub index_bits: u32,
	/// Whether an entry at this level may map a block directly.
	pub block:      bool,
}

impl LevelSpec {
	/// A folded level.
	const ABSENT: Self = Self {
		present:    false,
		index_bits: 0,
		block:      false,
	};

	/// A present level that only ever points at another table
	/// (or, at the leaf, at a page).
	const fn table(index_bits: u32) -> Self {
		Self {
			present: true,
			index_bits,
			block: false,
		}
	}

	/// A present level that may also hold block mappings.
	const fn block(index_bits: u32) -> Self {
		Self {
			present: true,
			index_bits,
			block: true,
		}
	}
}

/// Immutable description of a paging mode's translation hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
	/// The mode this geometry describes.
	mode:             PagingMode,
	/// Per-level shape, indexed by [`Level::index`].
	levels:           [LevelSpec; 5],
	/// Low address bits selecting the byte within a leaf page.
	page_offset_bits: u32,
}

impl Geometry {
	/// Returns the geometry of `mode`.
	#[must_use]
	pub const fn new(mode: PagingMode) -> Self {
		let levels = match mode {
			PagingMode::X86_64Level4 => {
				[
					LevelSpec::table(9),
					LevelSpec::ABSENT,
					LevelSpec::block(9),
					LevelSpec::block(9),
					LevelSpec::table(9),
				]
			}
			PagingMode::X86_64Level5 => {
				[
					LevelSpec::table(9),
					LevelSpec::table(9),
					LevelSpec::block(9),
					LevelSpec::block(9),
					LevelSpec::table(9),
				]
			}
			// Level 1 is the root under a 39-bit VA and may hold 1 GiB blocks.
			PagingMode::Aarch64Va39 => {
				[
					LevelSpec::block(9),
					LevelSpec::ABSENT,
					LevelSpec::ABSENT,
					LevelSpec::block(9),
					LevelSpec::table(9),
				]
			}
			PagingMode::Aarch64Va48 => {
				[
					LevelSpec::table(9),
					LevelSpec::ABSENT,
					LevelSpec::block(9),
					LevelSpec::block(9),
					LevelSpec::table(9),
				]
			}
		};

		Self {
			mode,
			levels,
			page_offset_bits: 12,
		}
	}

	/// Returns the geometry of `arch`'s default paging mode.
	#[must_use]
	pub const fn for_arch(arch: Architecture) -> Self {
		Self::new(arch.default_paging_mode())
	}

	/// Returns the default geometry of the named architecture.
	///
	/// Fails only if the architecture is unsupported.
	pub fn for_arch_name(name: &str) -> Result<Self> {
		Ok(Self::for_arch(Architecture::parse(name)?))
	}

	/// The paging mode.
	#[must_use]
	pub const fn mode(&self) -> PagingMode {
		self.mode
	}

	/// The architecture.
	#[must_use]
	pub const fn arch(&self) -> Architecture {
		self.mode.arch()
	}

	/// Number of low address bits addressing bytes within a page.
	#[must_use]
	pub const fn page_offset_bits(&self) -> u32 {
		self.page_offset_bits
	}

	/// Size of a leaf page in bytes.
	#[must_use]
	pub const fn page_size(&self) -> usize {
		1 << self.page_offset_bits
	}

	/// The shape of `level`.
	#[must_use]
	pub const fn level(&self, level: Level) -> LevelSpec {
		self.levels[level.index()]
	}

	/// Whether `level` physically exists.
	#[must_use]
	pub const fn is_present(&self, level: Level) -> bool {
		self.level(level).present
	}

	/// Whether a present entry at `level` may be a block mapping.
	#[must_use]
	pub const fn supports_block(&self, level: Level) -> bool {
		self.level(level).block
	}

	/// Iterates the levels that physically exist, root first.
	pub fn present_levels(&self) -> impl Iterator<Item = Level> + '_ {
		Level::ALL.into_iter().filter(|l| self.is_present(*l))
	}

	/// The virtual address width covered by this geometry.
	#[must_use]
	pub fn va_bits(&self) -> u32 {
		self.page_offset_bits + self.levels.iter().map(|l| l.index_bits).sum::<u32>()
	}

	/// Address bits below `level`'s index: the page offset plus the
	/// index bits of every level closer to the leaf.
	#[must_use]
	pub fn shift(&self, level: Level) -> u32 {
		self.page_offset_bits
			+ self.levels[level.index() + 1..]
				.iter()
				.map(|l| l.index_bits)
				.sum::<u32>()
	}

	/// Bytes of virtual address space covered by one entry at `level`.
	#[must_use]
	pub fn mapping_size(&self, level: Level) -> u64 {
		1 << self.shift(level)
	}

	/// The index of `address` within `level`'s table.
	///
	/// Folded levels always yield `0`.
	#[must_use]
	pub fn index(&self, level: Level, address: u64) -> usize {
		let bits = self.level(level).index_bits;
		if bits == 0 {
			return 0;
		}

		let index = (address >> self.shift(level)) & ((1 << bits) - 1);
		#[expect(
			clippy::as_conversions,
			reason = "index is at most `index_bits` wide, which always fits"
		)]
		let index = index as usize;
		index
	}

	/// Per-level indices of `address`, indexed by [`Level::index`].
	#[must_use]
	pub fn indices(&self, address: u64) -> [usize; 5] {
		Level::ALL.map(|l| self.index(l, address))
	}

	/// Byte offset of `address`'s entry within `level`'s table page.
	#[must_use]
	pub fn entry_offset(&self, level: Level, address: u64) -> usize {
		self.index(level, address) * ENTRY_SIZE
	}
}
