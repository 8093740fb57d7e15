//! Errors raised by the architecture model.

use crate::Architecture;

/// Result alias for this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Failures of the architecture model. Everything else in this
/// crate is total.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
	/// The architecture name is not one of the supported families.
	#[error("unsupported architecture: {0}")]
	UnsupportedArchitecture(String),
	/// The architecture has no paging mode with this many levels.
	#[error("{arch} has no {levels}-level paging mode")]
	UnsupportedPagingMode {
		/// The architecture that was asked.
		arch:   Architecture,
		/// The requested level count.
		levels: u32,
	},
	/// A memory-type slot outside of `0..8`.
	#[error("memory type slot {0} is out of range (0..8)")]
	SlotOutOfRange(u8),
	/// A memory-type value the architecture cannot encode.
	#[error("memory type {value:#x} cannot be encoded on {arch}")]
	MemTypeOutOfRange {
		/// The architecture the value was meant for.
		arch:  Architecture,
		/// The rejected value.
		value: u8,
	},
}
