//! Physical page accessors.
//!
//! The walker reads and writes whole physical pages through
//! [`PageAccess`]. Two strategies are provided:
//!
//! - [`Mediated`] forwards every page to the privileged side of a
//!   [`Channel`].
//! - [`Direct`] copies bytes in and out of a mapped window that
//!   covers all of physical memory ([`PhysWindow`]).
//!
//! Neither strategy caches: physical memory changes underneath us.

use std::io;

use crate::{
	Error, Result,
	channel::{Channel, Command},
};

/// A page-frame number plus one page of bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct PhysicalPage {
	/// The frame the bytes belong to.
	pfn:   u64,
	/// Exactly one page.
	bytes: Box<[u8]>,
}

impl PhysicalPage {
	/// A zero-filled page for frame `pfn`.
	#[must_use]
	pub fn zeroed(pfn: u64, page_size: usize) -> Self {
		Self {
			pfn,
			bytes: vec![0; page_size].into_boxed_slice(),
		}
	}

	/// Wraps existing page contents.
	#[must_use]
	pub fn from_bytes(pfn: u64, bytes: impl Into<Box<[u8]>>) -> Self {
		Self {
			pfn,
			bytes: bytes.into(),
		}
	}

	/// The frame number.
	#[must_use]
	pub const fn pfn(&self) -> u64 {
		self.pfn
	}

	/// The page contents.
	#[must_use]
	pub fn bytes(&self) -> &[u8] {
		&self.bytes
	}

	/// The page contents, mutably.
	#[must_use]
	pub fn bytes_mut(&mut self) -> &mut [u8] {
		&mut self.bytes
	}

	/// Consumes the page, returning its contents.
	#[must_use]
	pub fn into_bytes(self) -> Box<[u8]> {
		self.bytes
	}

	/// Reads the 8-byte entry at `index`, or `None` past the page end.
	#[must_use]
	pub fn entry(&self, index: usize) -> Option<u64> {
		let start = index.checked_mul(8)?;
		let bytes = self.bytes.get(start..start.checked_add(8)?)?;
		Some(u64::from_ne_bytes(bytes.try_into().ok()?))
	}

	/// Overwrites the 8-byte entry at `index`. Returns `false` past the
	/// page end.
	pub fn set_entry(&mut self, index: usize, value: u64) -> bool {
		let Some(start) = index.checked_mul(8) else {
			return false;
		};
		let Some(end) = start.checked_add(8) else {
			return false;
		};
		match self.bytes.get_mut(start..end) {
			Some(slot) => {
				slot.copy_from_slice(&value.to_ne_bytes());
				true
			}
			None => false,
		}
	}
}

impl core::fmt::Debug for PhysicalPage {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("PhysicalPage")
			.field("pfn", &format_args!("{:#x}", self.pfn))
			.field("len", &self.bytes.len())
			.finish()
	}
}

/// Reads and writes one page-sized block of physical memory.
pub trait PageAccess {
	/// Size of a page in bytes.
	fn page_size(&self) -> usize;

	/// Reads frame `pfn` into `buffer`, which is one page long.
	fn read_into(&self, pfn: u64, buffer: &mut [u8]) -> Result<()>;

	/// Writes `buffer`, which is one page long, to frame `pfn`.
	fn write_from(&self, pfn: u64, buffer: &[u8]) -> Result<()>;

	/// Reads frame `pfn`.
	fn read(&self, pfn: u64) -> Result<PhysicalPage> {
		let mut page = PhysicalPage::zeroed(pfn, self.page_size());
		self.read_into(pfn, page.bytes_mut())?;
		Ok(page)
	}

	/// Writes `page` back to its frame.
	fn write(&self, page: &PhysicalPage) -> Result<()> {
		self.write_from(page.pfn(), page.bytes())
	}
}

impl<A: PageAccess + ?Sized> PageAccess for &A {
	fn page_size(&self) -> usize {
		(**self).page_size()
	}

	fn read_into(&self, pfn: u64, buffer: &mut [u8]) -> Result<()> {
		(**self).read_into(pfn, buffer)
	}

	fn write_from(&self, pfn: u64, buffer: &[u8]) -> Result<()> {
		(**self).write_from(pfn, buffer)
	}
}

impl<A: PageAccess + ?Sized> PageAccess for Box<A> {
	fn page_size(&self) -> usize {
		(**self).page_size()
	}

	fn read_into(&self, pfn: u64, buffer: &mut [u8]) -> Result<()> {
		(**self).read_into(pfn, buffer)
	}

	fn write_from(&self, pfn: u64, buffer: &[u8]) -> Result<()> {
		(**self).write_from(pfn, buffer)
	}
}

/// Rejects buffers that are not exactly one page.
pub(crate) fn check_page_len(len: usize, page_size: usize) -> Result<()> {
	if len == page_size {
		Ok(())
	} else {
		Err(Error::Io(io::Error::new(
			io::ErrorKind::InvalidInput,
			format!("page buffer is {len} bytes, expected {page_size}"),
		)))
	}
}

/// Page access through the privileged side.
#[derive(Debug)]
pub struct Mediated<C> {
	/// The transport.
	channel:   C,
	/// Page size reported by the privileged side.
	page_size: usize,
}

impl<C: Channel> Mediated<C> {
	/// Wraps `channel`, asking it for the page size.
	pub fn new(channel: C) -> Result<Self> {
		let page_size = channel.page_size()?;
		Ok(Self { channel, page_size })
	}

	/// Wraps `channel` with an already-known page size.
	#[must_use]
	pub const fn with_page_size(channel: C, page_size: usize) -> Self {
		Self { channel, page_size }
	}
}

impl<C: Channel> PageAccess for Mediated<C> {
	fn page_size(&self) -> usize {
		self.page_size
	}

	fn read_into(&self, pfn: u64, buffer: &mut [u8]) -> Result<()> {
		check_page_len(buffer.len(), self.page_size)?;
		self.channel.submit(Command::ReadPage { pfn, buffer })?;
		Ok(())
	}

	fn write_from(&self, pfn: u64, buffer: &[u8]) -> Result<()> {
		check_page_len(buffer.len(), self.page_size)?;
		self.channel.submit(Command::WritePage { pfn, buffer })?;
		Ok(())
	}
}

/// A mapped view of all physical memory, byte `n` of which is
/// physical address `n`.
///
/// # Safety
/// `base()` through `base() + len()` must stay mapped, readable and
/// writable for as long as the window is alive, and must not alias
/// memory that Rust code holds references to.
pub unsafe trait PhysWindow {
	/// First byte of the window.
	fn base(&self) -> *mut u8;
	/// Length of the window in bytes.
	fn len(&self) -> usize;

	/// Whether the window is empty.
	fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Page access by plain byte copies out of a [`PhysWindow`].
#[derive(Debug)]
pub struct Direct<W> {
	/// The mapped physical memory.
	window:    W,
	/// Page size in bytes.
	page_size: usize,
}

impl<W: PhysWindow> Direct<W> {
	/// Wraps `window`.
	#[must_use]
	pub const fn new(window: W, page_size: usize) -> Self {
		Self { window, page_size }
	}

	/// The underlying window.
	#[must_use]
	pub const fn window(&self) -> &W {
		&self.window
	}

	/// Byte offset of frame `pfn`, checked against the window.
	fn offset(&self, pfn: u64, len: usize) -> Result<usize> {
		usize::try_from(pfn)
			.ok()
			.and_then(|pfn| pfn.checked_mul(self.page_size))
			.filter(|offset| {
				offset
					.checked_add(len)
					.is_some_and(|end| end <= self.window.len())
			})
			.ok_or(Error::OutOfBounds { pfn })
	}
}

impl<W: PhysWindow> PageAccess for Direct<W> {
	fn page_size(&self) -> usize {
		self.page_size
	}

	fn read_into(&self, pfn: u64, buffer: &mut [u8]) -> Result<()> {
		check_page_len(buffer.len(), self.page_size)?;
		let offset = self.offset(pfn, buffer.len())?;
		// SAFETY: `offset..offset + len` was checked to lie inside the window,
		// SAFETY: which the `PhysWindow` contract keeps mapped and unaliased.
		unsafe {
			core::ptr::copy_nonoverlapping(
				self.window.base().add(offset),
				buffer.as_mut_ptr(),
				buffer.len(),
			);
		}
		Ok(())
	}

	fn write_from(&self, pfn: u64, buffer: &[u8]) -> Result<()> {
		check_page_len(buffer.len(), self.page_size)?;
		let offset = self.offset(pfn, buffer.len())?;
		// SAFETY: `offset..offset + len` was checked to lie inside the window,
		// SAFETY: which the `PhysWindow` contract keeps mapped and unaliased.
		unsafe {
			core::ptr::copy_nonoverlapping(
				buffer.as_ptr(),
				self.window.base().add(offset),
				buffer.len(),
			);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sim::SimMachine;
	use ptedit_arch::PagingMode;

	#[test]
	fn entries_within_a_page() {
		let mut page = PhysicalPage::zeroed(7, 4096);
		assert!(page.set_entry(511, 0xdead_beef));
		assert_eq!(page.entry(511), Some(0xdead_beef));
		assert_eq!(page.entry(0), Some(0));
		assert!(!page.set_entry(512, 1));
		assert_eq!(page.entry(512), None);
		assert_eq!(page.pfn(), 7);
	}

	#[test]
	fn mediated_round_trip() {
		let machine = SimMachine::new(PagingMode::X86_64Level4, 64);
		let channel = machine.open().unwrap();
		let access = Mediated::new(&channel).unwrap();
		assert_eq!(access.page_size(), 4096);

		let pfn = machine.alloc_frame().unwrap();
		let bytes: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
		access
			.write(&PhysicalPage::from_bytes(pfn, bytes.clone()))
			.unwrap();
		assert_eq!(access.read(pfn).unwrap().bytes(), bytes.as_slice());
	}

	#[test]
	fn direct_round_trip() {
		let machine = SimMachine::new(PagingMode::Aarch64Va39, 64);
		let access = Direct::new(machine.window(), machine.page_size());

		let pfn = machine.alloc_frame().unwrap();
		let bytes = vec![0x5a; 4096];
		access
			.write(&PhysicalPage::from_bytes(pfn, bytes.clone()))
			.unwrap();
		assert_eq!(access.read(pfn).unwrap().bytes(), bytes.as_slice());

		// Visible to the other strategy without any flush.
		let channel = machine.open().unwrap();
		let mediated = Mediated::new(&channel).unwrap();
		assert_eq!(mediated.read(pfn).unwrap().bytes(), bytes.as_slice());
	}

	#[test]
	fn direct_rejects_frames_past_the_window() {
		let machine = SimMachine::new(PagingMode::X86_64Level4, 4);
		let access = Direct::new(machine.window(), machine.page_size());
		let err = access.read(4).unwrap_err();
		assert!(matches!(err, Error::OutOfBounds { pfn: 4 }));
		assert!(err.is_io());
		assert!(access.read(3).is_ok());
	}

	#[test]
	fn short_buffers_are_rejected() {
		let machine = SimMachine::new(PagingMode::X86_64Level4, 4);
		let access = Direct::new(machine.window(), machine.page_size());
		let mut buffer = [0; 16];
		assert!(matches!(
			access.read_into(0, &mut buffer),
			Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::InvalidInput
		));
	}
}
