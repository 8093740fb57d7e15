//! Physical memory through a device file.
//!
//! Byte `n` of the device (`/proc/umem`, `/dev/mem`) is physical
//! address `n`. Pages are either copied with positioned reads and
//! writes ([`FileAccess`]) or the device is mapped outright
//! ([`MappedWindow`], [`pmap`]).

use std::{
	fs::{File, OpenOptions},
	io,
	os::{fd::AsRawFd, unix::fs::FileExt},
	path::Path,
	ptr::{self, NonNull},
};

use log::{debug, info, warn};
use ptedit::{
	Error, Result,
	access::{PageAccess, PhysWindow},
};

/// Opens `path` for reading and writing.
fn open_rw(path: &Path) -> Result<File> {
	Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

/// Page access with `pread`/`pwrite` on a physical memory device.
#[derive(Debug)]
pub struct FileAccess {
	/// The device.
	file:      File,
	/// Page size in bytes.
	page_size: usize,
}

impl FileAccess {
	/// Opens the device at `path`.
	pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
		let path = path.as_ref();
		let file = open_rw(path)?;
		info!("physical page access through {}", path.display());
		Ok(Self::new(file, page_size))
	}

	/// Wraps an already open device.
	#[must_use]
	pub const fn new(file: File, page_size: usize) -> Self {
		Self { file, page_size }
	}

	/// Byte offset of frame `pfn`, after checking `len` is one page.
	fn offset(&self, pfn: u64, len: usize) -> Result<u64> {
		if len != self.page_size {
			return Err(Error::Io(io::Error::new(
				io::ErrorKind::InvalidInput,
				format!("page buffer is {len} bytes, expected {}", self.page_size),
			)));
		}

		u64::try_from(self.page_size)
			.ok()
			.and_then(|size| pfn.checked_mul(size))
			.ok_or(Error::OutOfBounds { pfn })
	}
}

impl PageAccess for FileAccess {
	fn page_size(&self) -> usize {
		self.page_size
	}

	fn read_into(&self, pfn: u64, buffer: &mut [u8]) -> Result<()> {
		let offset = self.offset(pfn, buffer.len())?;
		self.file.read_exact_at(buffer, offset).map_err(|err| {
			match err.kind() {
				io::ErrorKind::UnexpectedEof => Error::OutOfBounds { pfn },
				_ => Error::Io(err),
			}
		})
	}

	fn write_from(&self, pfn: u64, buffer: &[u8]) -> Result<()> {
		let offset = self.offset(pfn, buffer.len())?;
		Ok(self.file.write_all_at(buffer, offset)?)
	}
}

/// A shared, writable mapping of part of a file.
#[derive(Debug)]
struct Mapping {
	/// First mapped byte.
	base: NonNull<u8>,
	/// Mapped length in bytes.
	len:  usize,
}

impl Mapping {
	/// Maps `len` bytes of `file` starting at `offset`, which must be
	/// page aligned.
	fn new(file: &File, offset: u64, len: usize) -> Result<Self> {
		let offset = libc::off_t::try_from(offset).map_err(|_| {
			Error::Io(io::Error::new(
				io::ErrorKind::InvalidInput,
				format!("offset {offset:#x} does not fit off_t"),
			))
		})?;

		// SAFETY: A fresh mapping at a kernel-chosen address aliases
		// SAFETY: nothing; failure is reported through `MAP_FAILED`.
		let base = unsafe {
			libc::mmap(
				ptr::null_mut(),
				len,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_SHARED | libc::MAP_NORESERVE,
				file.as_raw_fd(),
				offset,
			)
		};

		if base == libc::MAP_FAILED {
			return Err(io::Error::last_os_error().into());
		}

		let base = NonNull::new(base.cast::<u8>())
			.ok_or_else(|| Error::Io(io::Error::other("mmap returned null")))?;
		debug!("mapped {len:#x} bytes at offset {offset:#x} to {base:p}");
		Ok(Self { base, len })
	}
}

impl Drop for Mapping {
	fn drop(&mut self) {
		// SAFETY: `base..base + len` is exactly the region `mmap` returned,
		// SAFETY: and nothing borrows from it past this point.
		let status = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
		if status != 0 {
			warn!("munmap failed: {}", io::Error::last_os_error());
		}
	}
}

/// The whole of physical memory mapped from a device, for
/// [`ptedit::access::Direct`].
#[derive(Debug)]
pub struct MappedWindow {
	/// The mapping, starting at physical address zero.
	mapping: Mapping,
}

impl MappedWindow {
	/// Maps the first `len` bytes of the device at `path`.
	pub fn open(path: impl AsRef<Path>, len: usize) -> Result<Self> {
		let path = path.as_ref();
		let file = open_rw(path)?;
		let window = Self::new(&file, len)?;
		info!("mapped {len:#x} bytes of {}", path.display());
		Ok(window)
	}

	/// Maps the first `len` bytes of `file`. The mapping outlives the
	/// descriptor.
	pub fn new(file: &File, len: usize) -> Result<Self> {
		Ok(Self {
			mapping: Mapping::new(file, 0, len)?,
		})
	}
}

// SAFETY: The mapping lives exactly as long as the window, is readable
// SAFETY: and writable, and is never handed out as a Rust reference.
unsafe impl PhysWindow for MappedWindow {
	fn base(&self) -> *mut u8 {
		self.mapping.base.as_ptr()
	}

	fn len(&self) -> usize {
		self.mapping.len
	}
}

/// A mapping of an arbitrary physical range.
#[derive(Debug)]
pub struct PhysMapping {
	/// The page-aligned mapping that covers the range.
	mapping: Mapping,
	/// Offset of the first requested byte within `mapping`.
	skip:    usize,
	/// Physical address of the first requested byte.
	phys:    u64,
}

impl PhysMapping {
	/// The physical address the mapping starts at.
	#[must_use]
	pub const fn phys(&self) -> u64 {
		self.phys
	}

	/// The requested length in bytes.
	#[must_use]
	pub const fn len(&self) -> usize {
		self.mapping.len - self.skip
	}

	/// Whether the mapping is empty.
	#[must_use]
	pub const fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Pointer to the byte at physical address [`Self::phys`].
	#[must_use]
	pub fn as_ptr(&self) -> *mut u8 {
		// SAFETY: `skip` is at most the mapped length.
		unsafe { self.mapping.base.as_ptr().add(self.skip) }
	}

	/// Pointer to the `u64` at byte `offset`, bounds checked.
	fn word(&self, offset: usize) -> Result<*mut u64> {
		let end = offset.checked_add(size_of::<u64>());
		if end.is_none_or(|end| end > self.len()) {
			return Err(Error::Io(io::Error::new(
				io::ErrorKind::InvalidInput,
				format!("offset {offset:#x} is past the {:#x} byte mapping", self.len()),
			)));
		}
		// SAFETY: `offset + 8` was checked to lie inside the mapping.
		Ok(unsafe { self.as_ptr().add(offset) }.cast::<u64>())
	}

	/// Reads the `u64` at byte `offset` of the range.
	pub fn read_u64(&self, offset: usize) -> Result<u64> {
		let word = self.word(offset)?;
		// SAFETY: In bounds and mapped; physical memory has no alignment
		// SAFETY: guarantee relative to `offset`, hence the unaligned read.
		Ok(unsafe { word.read_unaligned() })
	}

	/// Writes `value` at byte `offset` of the range.
	pub fn write_u64(&self, offset: usize, value: u64) -> Result<()> {
		let word = self.word(offset)?;
		// SAFETY: In bounds, mapped and writable.
		unsafe { word.write_unaligned(value) };
		Ok(())
	}
}

/// Maps `len` bytes of physical memory starting at `phys` from `file`.
///
/// `phys` need not be page aligned; the mapping is widened to whole
/// pages underneath and [`PhysMapping::as_ptr`] points at `phys`
/// itself.
pub fn pmap(file: &File, phys: u64, len: usize, page_size: usize) -> Result<PhysMapping> {
	let page = u64::try_from(page_size)
		.ok()
		.filter(|page| page.is_power_of_two())
		.ok_or_else(|| Error::Unsupported(format!("page size {page_size}")))?;

	let aligned = phys & !(page - 1);
	let skip = usize::try_from(phys - aligned).map_err(|_| Error::OutOfBounds { pfn: phys })?;
	let total = skip
		.checked_add(len)
		.ok_or(Error::OutOfBounds { pfn: phys })?;

	Ok(PhysMapping {
		mapping: Mapping::new(file, aligned, total)?,
		skip,
		phys,
	})
}
