//! The request/response channel to the privileged side.
//!
//! Every operation that needs privileges (walking another process'
//! tables in kernel context, touching physical memory, reading CPU
//! registers) is a [`Command`] submitted through a [`Channel`]. The
//! payload records are `repr(C)` and match what the privileged side
//! reads and writes in place.

use crate::{Error, Result};

/// Operations understood by the privileged side, in wire order.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter, strum::FromRepr,
)]
#[strum(serialize_all = "snake_case")]
#[repr(u32)]
pub enum Opcode {
	/// Walk a process' tables for one address.
	Resolve       = 1,
	/// Overwrite selected levels of a ladder.
	Update        = 2,
	/// Take the address-space lock.
	Lock          = 3,
	/// Release the address-space lock.
	Unlock        = 4,
	/// Read one physical page.
	ReadPage      = 5,
	/// Write one physical page.
	WritePage     = 6,
	/// Read a process' translation root.
	GetRoot       = 7,
	/// Replace a process' translation root.
	SetRoot       = 8,
	/// Query the base page size.
	GetPageSize   = 9,
	/// Flush the TLB entry of an address on every CPU.
	InvalidateTlb = 10,
	/// Read the memory-type table.
	GetMemType    = 11,
	/// Program the memory-type table on every CPU.
	SetMemType    = 12,
	/// Flush the whole TLB on a set of CPUs.
	TlbShootdown  = 13,
}

impl Opcode {
	/// The opcode's wire number.
	#[expect(
		clippy::as_conversions,
		reason = "u32 cast is safe as that is the repr of the enum"
	)]
	#[must_use]
	pub const fn number(self) -> u32 {
		self as u32
	}

	/// Decodes a wire number.
	pub fn from_number(number: u32) -> Result<Self> {
		Self::from_repr(number).ok_or_else(|| Error::Unsupported(format!("opcode {number}")))
	}
}

/// Translation ladder exchanged with the privileged side: one raw entry
/// per level plus the validity bitmask (`PGD = 1 << 0` .. `PTE = 1 << 4`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct LadderRecord {
	/// Target process; `0` is the caller.
	pub pid:   u64,
	/// The virtual address the ladder belongs to.
	pub vaddr: u64,
	/// Root-level entry.
	pub pgd:   u64,
	/// Fourth-level entry.
	pub p4d:   u64,
	/// Upper directory entry.
	pub pud:   u64,
	/// Middle directory entry.
	pub pmd:   u64,
	/// Leaf entry.
	pub pte:   u64,
	/// Levels resolved (on resolve) or to be written (on update).
	pub valid: u64,
}

static_assertions::const_assert_eq!(::core::mem::size_of::<LadderRecord>(), 64);

/// A process' translation root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RootRecord {
	/// Target process; `0` is the caller.
	pub pid:  u64,
	/// Physical address of the root table (CR3 / TTBR0).
	pub root: u64,
}

static_assertions::const_assert_eq!(::core::mem::size_of::<RootRecord>(), 16);

/// Narrows a pid from a wire record. No process has a pid past
/// `u32::MAX`.
pub(crate) fn wire_pid(pid: u64) -> Result<u32> {
	u32::try_from(pid).map_err(|_| Error::NotFound { pid: u32::MAX })
}

/// A single request to the privileged side. Payloads that the privileged
/// side fills in are borrowed mutably.
#[derive(Debug)]
pub enum Command<'a> {
	/// Walk `vaddr` in `pid`; the privileged side fills in the entries
	/// and the validity mask.
	Resolve(&'a mut LadderRecord),
	/// Write the levels selected by `valid`.
	Update(&'a LadderRecord),
	/// Take the address-space lock.
	Lock,
	/// Release the address-space lock.
	Unlock,
	/// Read frame `pfn` into `buffer` (one page).
	ReadPage {
		/// The frame to read.
		pfn:    u64,
		/// Receives the page.
		buffer: &'a mut [u8],
	},
	/// Write `buffer` (one page) to frame `pfn`.
	WritePage {
		/// The frame to write.
		pfn:    u64,
		/// The new page contents.
		buffer: &'a [u8],
	},
	/// Look up the translation root of `pid`.
	GetRoot(&'a mut RootRecord),
	/// Replace the translation root of `pid`.
	SetRoot(&'a RootRecord),
	/// Query the page size; returned as the response value.
	GetPageSize,
	/// Flush `address` from every CPU's TLB.
	InvalidateTlb {
		/// The virtual address to flush.
		address: u64,
	},
	/// Read the memory-type table; returned as the response value.
	GetMemType,
	/// Program the memory-type table on every CPU.
	SetMemType(u64),
	/// Flush the whole TLB on every CPU in the mask.
	TlbShootdown {
		/// Bitmask of target CPUs.
		cpus: u64,
	},
}

impl Command<'_> {
	/// The opcode the command is sent under.
	#[must_use]
	pub const fn opcode(&self) -> Opcode {
		match self {
			Self::Resolve(_) => Opcode::Resolve,
			Self::Update(_) => Opcode::Update,
			Self::Lock => Opcode::Lock,
			Self::Unlock => Opcode::Unlock,
			Self::ReadPage { .. } => Opcode::ReadPage,
			Self::WritePage { .. } => Opcode::WritePage,
			Self::GetRoot(_) => Opcode::GetRoot,
			Self::SetRoot(_) => Opcode::SetRoot,
			Self::GetPageSize => Opcode::GetPageSize,
			Self::InvalidateTlb { .. } => Opcode::InvalidateTlb,
			Self::GetMemType => Opcode::GetMemType,
			Self::SetMemType(_) => Opcode::SetMemType,
			Self::TlbShootdown { .. } => Opcode::TlbShootdown,
		}
	}
}

/// A transport to the privileged side.
///
/// Implementations are synchronous: `submit` returns once the
/// privileged side has finished with the command.
pub trait Channel {
	/// Submits `command`. The response value is meaningful for
	/// [`Command::GetPageSize`] and [`Command::GetMemType`], `0`
	/// otherwise.
	fn submit(&self, command: Command<'_>) -> Result<u64>;

	/// Looks up the translation root of `pid`.
	fn root(&self, pid: u32) -> Result<u64> {
		let mut record = RootRecord {
			pid:  u64::from(pid),
			root: 0,
		};
		self.submit(Command::GetRoot(&mut record))?;
		Ok(record.root)
	}

	/// Replaces the translation root of `pid`.
	fn set_root(&self, pid: u32, root: u64) -> Result<()> {
		let record = RootRecord {
			pid: u64::from(pid),
			root,
		};
		self.submit(Command::SetRoot(&record)).map(drop)
	}

	/// Queries the base page size.
	fn page_size(&self) -> Result<usize> {
		let size = self.submit(Command::GetPageSize)?;
		usize::try_from(size)
			.map_err(|_| Error::Unsupported(format!("page size {size:#x}")))
	}
}

impl<C: Channel + ?Sized> Channel for &C {
	fn submit(&self, command: Command<'_>) -> Result<u64> {
		(**self).submit(command)
	}
}

impl<C: Channel + ?Sized> Channel for Box<C> {
	fn submit(&self, command: Command<'_>) -> Result<u64> {
		(**self).submit(command)
	}
}

#[cfg(test)]
mod tests {
	use strum::IntoEnumIterator;

	use super::*;

	#[test]
	fn opcode_numbers_are_dense() {
		for (expected, opcode) in (1..).zip(Opcode::iter()) {
			assert_eq!(opcode.number(), expected);
			assert_eq!(Opcode::from_number(expected).unwrap(), opcode);
		}
		assert_eq!(Opcode::TlbShootdown.number(), 13);
	}

	#[test]
	fn unknown_opcode_is_unsupported() {
		assert!(matches!(Opcode::from_number(0), Err(Error::Unsupported(_))));
		assert!(matches!(Opcode::from_number(14), Err(Error::Unsupported(_))));
	}

	#[test]
	fn opcode_names() {
		assert_eq!(Opcode::InvalidateTlb.to_string(), "invalidate_tlb");
		assert_eq!(Command::GetMemType.opcode(), Opcode::GetMemType);
		assert_eq!(
			Command::TlbShootdown { cpus: 1 }.opcode(),
			Opcode::TlbShootdown
		);
	}
}
