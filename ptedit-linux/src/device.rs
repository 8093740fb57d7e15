//! The `pteditor` kernel module's misc device.
//!
//! Every [`Command`] maps to one `ioctl` numbered
//! `_IOR(0x3d17, opcode, size_t)`. Records are passed by pointer and
//! filled in place; scalar arguments (addresses, memory-type values,
//! CPU masks) are passed by value.

use std::{
	ffi::c_void,
	fs::File,
	io,
	os::fd::{AsRawFd, OwnedFd},
	path::Path,
	ptr,
};

use log::{debug, info};
use ptedit::{
	Error, Result,
	channel::{Channel, Command, Opcode},
};

/// The module's `ioctl` type number.
pub const MAGIC: u32 = 0x3d17;

/// `_IOC_READ`.
const IOC_READ: u32 = 2;

/// The `ioctl` request number of `opcode`: `_IOR(MAGIC, opcode, size_t)`.
///
/// The magic is wider than `_IOC_TYPEBITS`; as with the C macro, it is
/// shifted in unmasked.
#[must_use]
pub const fn request(opcode: Opcode) -> u32 {
	// Size field: `sizeof(size_t)`.
	(IOC_READ << 30) | (8 << 16) | (MAGIC << 8) | opcode.number()
}

/// The module's page transfer record.
#[derive(Debug)]
#[repr(C)]
struct PageRecord {
	/// Frame to read or write.
	pfn:    u64,
	/// Unused by page transfers.
	vaddr:  u64,
	/// Length of `buffer`.
	size:   u64,
	/// One page of user memory.
	buffer: *mut u8,
}

/// A channel to the `pteditor` module.
#[derive(Debug)]
pub struct DeviceChannel {
	/// The open device.
	fd:        OwnedFd,
	/// The kernel's page size.
	page_size: usize,
}

impl DeviceChannel {
	/// Opens the device at `path`.
	///
	/// The module admits one open file at a time; while another
	/// process holds it this fails with [`Error::Busy`].
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let file = File::open(path).map_err(|err| {
			match err.raw_os_error() {
				Some(libc::EBUSY) => Error::Busy,
				_ => Error::Io(err),
			}
		})?;

		let mut channel = Self {
			fd:        file.into(),
			page_size: 0,
		};
		channel.page_size = Channel::page_size(&channel)?;
		info!(
			"opened {}, {} byte pages",
			path.display(),
			channel.page_size
		);
		Ok(channel)
	}

	/// Issues `opcode` with a pointer argument.
	///
	/// # Safety
	/// `arg` must be valid for whatever the module reads or writes
	/// through it for `opcode`.
	unsafe fn ioctl_ptr<T>(&self, opcode: Opcode, arg: *mut T) -> Result<u64> {
		let arg = arg.cast::<c_void>();
		// SAFETY: The descriptor is owned and open; the caller upholds the
		// SAFETY: pointer contract.
		let status = unsafe { libc::ioctl(self.fd.as_raw_fd(), ioctl_request(opcode), arg) };
		finish(opcode, status)
	}

	/// Issues `opcode` with a scalar argument.
	fn ioctl_value(&self, opcode: Opcode, value: u64) -> Result<u64> {
		// SAFETY: The descriptor is owned and open; the module never
		// SAFETY: dereferences scalar arguments.
		let status = unsafe { libc::ioctl(self.fd.as_raw_fd(), ioctl_request(opcode), value) };
		finish(opcode, status)
	}

	/// Rejects page buffers of the wrong length before the module
	/// copies a whole page through them.
	fn check_len(&self, len: usize) -> Result<()> {
		if len == self.page_size {
			Ok(())
		} else {
			Err(Error::Io(io::Error::new(
				io::ErrorKind::InvalidInput,
				format!("page buffer is {len} bytes, expected {}", self.page_size),
			)))
		}
	}
}

/// [`request`] in the width `libc::ioctl` takes.
fn ioctl_request(opcode: Opcode) -> libc::Ioctl {
	debug!("ioctl {opcode} ({:#x})", request(opcode));
	#[expect(
		clippy::as_conversions,
		reason = "request numbers are `unsigned long` on glibc and `int` on musl"
	)]
	#[allow(
		clippy::cast_lossless,
		clippy::cast_possible_wrap,
		reason = "musl takes the raw bits as `int`"
	)]
	let request = request(opcode) as libc::Ioctl;
	request
}

/// Turns an `ioctl` return value into the response value.
fn finish(opcode: Opcode, status: libc::c_int) -> Result<u64> {
	u64::try_from(status).map_err(|_| status_error(opcode, io::Error::last_os_error()))
}

/// Maps a failed `ioctl` to the error taxonomy.
fn status_error(opcode: Opcode, err: io::Error) -> Error {
	match (opcode, err.raw_os_error()) {
		(_, Some(libc::EBUSY)) => Error::Busy,
		(Opcode::Lock, Some(libc::EPERM)) => Error::AlreadyLocked,
		(Opcode::Unlock, Some(libc::EPERM)) => Error::NotLocked,
		(Opcode::ReadPage | Opcode::WritePage, _) | (_, None) => Error::Io(err),
		(opcode, Some(errno)) => {
			Error::Channel {
				opcode,
				status: -errno,
			}
		}
	}
}

impl Channel for DeviceChannel {
	fn submit(&self, command: Command<'_>) -> Result<u64> {
		let opcode = command.opcode();

		match command {
			// SAFETY: The record is borrowed for the call and is `repr(C)`
			// SAFETY: with the layout the module reads and writes.
			Command::Resolve(record) => unsafe { self.ioctl_ptr(opcode, ptr::from_mut(record)) },
			// SAFETY: As above; the module only reads the record.
			Command::Update(record) => unsafe {
				self.ioctl_ptr(opcode, ptr::from_ref(record).cast_mut())
			},
			Command::Lock | Command::Unlock | Command::GetPageSize => self.ioctl_value(opcode, 0),
			Command::ReadPage { pfn, buffer } => {
				self.check_len(buffer.len())?;
				let mut page = PageRecord {
					pfn,
					vaddr: 0,
					size: u64::try_from(buffer.len()).unwrap_or(u64::MAX),
					buffer: buffer.as_mut_ptr(),
				};
				// SAFETY: `buffer` is exactly one page and mutably borrowed
				// SAFETY: for the call.
				unsafe { self.ioctl_ptr(opcode, ptr::from_mut(&mut page)) }
			}
			Command::WritePage { pfn, buffer } => {
				self.check_len(buffer.len())?;
				let mut page = PageRecord {
					pfn,
					vaddr: 0,
					size: u64::try_from(buffer.len()).unwrap_or(u64::MAX),
					buffer: buffer.as_ptr().cast_mut(),
				};
				// SAFETY: `buffer` is exactly one page and borrowed for the
				// SAFETY: call; the module only reads through it.
				unsafe { self.ioctl_ptr(opcode, ptr::from_mut(&mut page)) }
			}
			Command::GetRoot(record) => {
				let pid = record.pid;
				// SAFETY: The record is borrowed for the call and is `repr(C)`.
				let status = unsafe { self.ioctl_ptr(opcode, ptr::from_mut(record))? };
				not_found_if(status, pid).map(|()| 0)
			}
			Command::SetRoot(record) => {
				// SAFETY: The record is borrowed for the call and is `repr(C)`;
				// SAFETY: the module only reads it.
				let status = unsafe { self.ioctl_ptr(opcode, ptr::from_ref(record).cast_mut())? };
				not_found_if(status, record.pid).map(|()| 0)
			}
			Command::InvalidateTlb { address } => self.ioctl_value(opcode, address),
			Command::GetMemType => {
				let mut value = 0_u64;
				// SAFETY: The module writes one `u64` through the pointer.
				unsafe { self.ioctl_ptr(opcode, ptr::from_mut(&mut value))? };
				Ok(value)
			}
			Command::SetMemType(value) => self.ioctl_value(opcode, value),
			// The module reads the mask from the argument itself.
			Command::TlbShootdown { cpus } => self.ioctl_value(opcode, cpus),
		}
	}
}

/// The module answers root lookups for a missing process with a
/// positive status.
fn not_found_if(status: u64, pid: u64) -> Result<()> {
	if status == 0 {
		Ok(())
	} else {
		Err(Error::NotFound {
			pid: u32::try_from(pid).unwrap_or(u32::MAX),
		})
	}
}
