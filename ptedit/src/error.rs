//! Error taxonomy of the editor.
//!
//! An address that does not resolve is not an error; it shows up as
//! missing bits in [`crate::Ladder::valid`].

use crate::channel::Opcode;

/// Result alias for this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Failures surfaced to callers. None of them are retried internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// The process (and so its address space) does not exist.
	#[error("no such process: {pid}")]
	NotFound {
		/// The process that was looked up.
		pid: u32,
	},
	/// Unknown opcode, architecture or implementation selector.
	#[error("unsupported: {0}")]
	Unsupported(String),
	/// The address-space lock was requested while already held.
	#[error("address space is already locked")]
	AlreadyLocked,
	/// The address-space lock was released while not held.
	#[error("address space is not locked")]
	NotLocked,
	/// Another session owns the privileged channel.
	#[error("privileged channel is owned by another session")]
	Busy,
	/// A physical page could not be read or written.
	#[error("physical memory I/O failed: {0}")]
	Io(#[from] std::io::Error),
	/// A frame lies outside the mapped physical-memory window.
	#[error("page frame {pfn:#x} lies outside of the physical memory window")]
	OutOfBounds {
		/// The frame that was accessed.
		pfn: u64,
	},
	/// The privileged side rejected a command with a status not
	/// covered above.
	#[error("{opcode} failed with status {status}")]
	Channel {
		/// The rejected command.
		opcode: Opcode,
		/// The status it was rejected with.
		status: i32,
	},
	/// Errors from the architecture model.
	#[error(transparent)]
	Arch(#[from] ptedit_arch::Error),
}

impl Error {
	/// Whether the error is an I/O failure on physical memory.
	#[must_use]
	pub const fn is_io(&self) -> bool {
		matches!(self, Self::Io(_) | Self::OutOfBounds { .. })
	}
}
