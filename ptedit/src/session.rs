//! One open connection to the privileged side, and everything that can
//! be done through it.

use std::fmt;

use log::{info, warn};
use ptedit_arch::{Codec, Geometry, Level, MemTypeTable};

use crate::{
	Config, Error, Ladder, Result,
	access::{Mediated, PageAccess, PhysicalPage},
	channel::{Channel, Command, LadderRecord},
	tlb::{ChannelTlb, TlbControl},
	walk::Walker,
};

/// Where resolve and update run.
#[derive(
	Debug,
	Clone,
	Copy,
	Default,
	PartialEq,
	Eq,
	Hash,
	strum::Display,
	strum::EnumString,
	strum::EnumIter,
	serde::Serialize,
	serde::Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Implementation {
	/// The privileged side walks the tables itself.
	#[default]
	Kernel,
	/// The tables are walked locally, reading pages with `pread`.
	UserPread,
	/// The tables are walked locally over a mapped physical-memory window.
	User,
	/// The tables are walked locally, each page read and written by the
	/// privileged side.
	Mediated,
}

impl TryFrom<u32> for Implementation {
	type Error = Error;

	fn try_from(selector: u32) -> Result<Self> {
		match selector {
			0 => Ok(Self::Kernel),
			1 => Ok(Self::UserPread),
			2 => Ok(Self::User),
			3 => Ok(Self::Mediated),
			other => Err(Error::Unsupported(format!("implementation {other}"))),
		}
	}
}

/// An open session with the privileged side.
///
/// The session owns the channel, so the channel's single-owner gate is
/// held for exactly as long as the session lives.
pub struct Session<'a, C> {
	/// The privileged side.
	channel:        C,
	/// The paging mode of every address space.
	geometry:       Geometry,
	/// Entry layout of the running architecture.
	codec:          Codec,
	/// Page size reported by the privileged side.
	page_size:      usize,
	/// The current implementation.
	implementation: Implementation,
	/// Page access for [`Implementation::UserPread`] and page I/O.
	pread:          Option<Box<dyn PageAccess + 'a>>,
	/// Page access for [`Implementation::User`].
	direct:         Option<Box<dyn PageAccess + 'a>>,
}

impl<'a, C: Channel> Session<'a, C> {
	/// Starts a session over `channel` with the paging mode `config`
	/// selects. The session starts out on [`Implementation::Kernel`];
	/// register accessors before switching away from it.
	///
	/// Fails with [`Error::Unsupported`] if the privileged side reports
	/// a page size other than the geometry's.
	pub fn open(channel: C, config: &Config) -> Result<Self> {
		let geometry = config.geometry()?;
		let page_size = channel.page_size()?;

		if page_size != geometry.page_size() {
			warn!(
				"privileged side reports {page_size} byte pages, {} expects {}",
				geometry.mode(),
				geometry.page_size()
			);
			return Err(Error::Unsupported(format!("page size {page_size}")));
		}

		info!("session open: {}, {page_size} byte pages", geometry.mode());

		Ok(Self {
			channel,
			codec: Codec::for_arch(geometry.arch()),
			geometry,
			page_size,
			implementation: Implementation::Kernel,
			pread: None,
			direct: None,
		})
	}

	/// Registers the accessor used by [`Implementation::UserPread`] and
	/// by physical page I/O.
	#[must_use]
	pub fn with_pread_access(mut self, access: impl PageAccess + 'a) -> Self {
		self.pread = Some(Box::new(access));
		self
	}

	/// Registers the accessor used by [`Implementation::User`].
	#[must_use]
	pub fn with_direct_access(mut self, access: impl PageAccess + 'a) -> Self {
		self.direct = Some(Box::new(access));
		self
	}

	/// The channel.
	pub const fn channel(&self) -> &C {
		&self.channel
	}

	/// The paging geometry.
	pub const fn geometry(&self) -> &Geometry {
		&self.geometry
	}

	/// The entry codec.
	pub const fn codec(&self) -> Codec {
		self.codec
	}

	/// The current implementation.
	pub const fn implementation(&self) -> Implementation {
		self.implementation
	}

	/// Switches implementation. Fails with [`Error::Unsupported`] if
	/// the accessor it needs was never registered.
	pub fn use_implementation(&mut self, implementation: Implementation) -> Result<()> {
		let available = match implementation {
			Implementation::Kernel | Implementation::Mediated => true,
			Implementation::UserPread => self.pread.is_some(),
			Implementation::User => self.direct.is_some(),
		};

		if !available {
			return Err(Error::Unsupported(format!(
				"implementation {implementation} has no page accessor"
			)));
		}

		info!("using implementation {implementation}");
		self.implementation = implementation;
		Ok(())
	}

	/// The accessor the current local implementation walks with.
	fn walk_access(&self) -> Result<WalkAccess<'_, 'a, C>> {
		let access = match self.implementation {
			Implementation::Kernel => None,
			Implementation::Mediated => {
				Some(WalkAccess::Privileged(Mediated::with_page_size(
					&self.channel,
					self.page_size,
				)))
			}
			Implementation::UserPread => self.pread.as_deref().map(WalkAccess::Registered),
			Implementation::User => self.direct.as_deref().map(WalkAccess::Registered),
		};
		access.ok_or_else(|| {
			Error::Unsupported(format!("local walk under {}", self.implementation))
		})
	}

	/// Resolves `address` in `pid` (`0` for the caller). Fails with
	/// [`Error::NotFound`] if the process does not exist.
	pub fn resolve(&self, address: u64, pid: u32) -> Result<Ladder> {
		let root = self.channel.root(pid)?;

		if self.implementation == Implementation::Kernel {
			let mut record = LadderRecord {
				pid: u64::from(pid),
				vaddr: address,
				..LadderRecord::default()
			};
			self.channel.submit(Command::Resolve(&mut record))?;
			return Ladder::try_from(&record);
		}

		Walker::new(self.walk_access()?, self.geometry).resolve(root, address, pid)
	}

	/// Writes the levels `request` selects for `request.address` in
	/// `request.pid`, then invalidates the TLB.
	///
	/// Levels that were not valid before the call, and levels the walk
	/// no longer reaches once earlier writes are applied, are dropped
	/// without error.
	pub fn update(&self, request: &Ladder) -> Result<()> {
		let root = self.channel.root(request.pid)?;

		if self.implementation == Implementation::Kernel {
			let record = LadderRecord::from(request);
			return self.channel.submit(Command::Update(&record)).map(drop);
		}

		Walker::new(self.walk_access()?, self.geometry).update(
			root,
			request,
			&ChannelTlb(&self.channel),
		)
	}

	/// Takes the address-space lock.
	pub fn lock(&self) -> Result<()> {
		self.channel.submit(Command::Lock).map(drop)
	}

	/// Releases the address-space lock.
	pub fn unlock(&self) -> Result<()> {
		self.channel.submit(Command::Unlock).map(drop)
	}

	/// The translation root (CR3 / TTBR0) of `pid`.
	pub fn paging_root(&self, pid: u32) -> Result<u64> {
		self.channel.root(pid)
	}

	/// Replaces the translation root of `pid`.
	pub fn set_paging_root(&self, pid: u32, root: u64) -> Result<()> {
		self.channel.set_root(pid, root)
	}

	/// The page size.
	pub const fn page_size(&self) -> usize {
		self.page_size
	}

	/// Reads frame `pfn`, through the pread accessor if one is
	/// registered and the privileged side otherwise.
	pub fn read_physical_page(&self, pfn: u64) -> Result<PhysicalPage> {
		match &self.pread {
			Some(access) => access.read(pfn),
			None => Mediated::with_page_size(&self.channel, self.page_size).read(pfn),
		}
	}

	/// Writes `page` back to its frame; see
	/// [`Session::read_physical_page`].
	pub fn write_physical_page(&self, page: &PhysicalPage) -> Result<()> {
		match &self.pread {
			Some(access) => access.write(page),
			None => Mediated::with_page_size(&self.channel, self.page_size).write(page),
		}
	}

	/// Flushes `address` from every CPU's TLB.
	pub fn invalidate_tlb(&self, address: u64) -> Result<()> {
		ChannelTlb(&self.channel).invalidate(address)
	}

	/// Flushes the whole TLB of every CPU in `cpus`.
	pub fn tlb_shootdown(&self, cpus: u64) -> Result<()> {
		ChannelTlb(&self.channel).shootdown(cpus)
	}

	/// Barrier, root reload, barrier.
	pub fn full_serializing_barrier(&self) -> Result<()> {
		ChannelTlb(&self.channel).serializing_barrier()
	}

	/// Rewrites the leaf PTE of `address` with `edit`, if the walk
	/// reaches it.
	fn edit_pte(&self, address: u64, pid: u32, edit: impl FnOnce(u64) -> u64) -> Result<()> {
		let ladder = self.resolve(address, pid)?;
		let Some(pte) = ladder.get(Level::Pte) else {
			return Ok(());
		};

		let mut request = Ladder::new(address, pid);
		request.set(Level::Pte, edit(pte));
		self.update(&request)
	}

	/// Sets bit `bit` of the PTE mapping `address`. Does nothing if the
	/// address has no valid PTE.
	pub fn pte_set_bit(&self, address: u64, pid: u32, bit: u32) -> Result<()> {
		let mask = bit_mask(bit)?;
		self.edit_pte(address, pid, |pte| pte | mask)
	}

	/// Clears bit `bit` of the PTE mapping `address`. Does nothing if the
	/// address has no valid PTE.
	pub fn pte_clear_bit(&self, address: u64, pid: u32, bit: u32) -> Result<()> {
		let mask = bit_mask(bit)?;
		self.edit_pte(address, pid, |pte| pte & !mask)
	}

	/// Bit `bit` of the PTE slot of `address`, present or not. An
	/// unreached PTE reads as zero.
	pub fn pte_get_bit(&self, address: u64, pid: u32, bit: u32) -> Result<bool> {
		let mask = bit_mask(bit)?;
		Ok(self.resolve(address, pid)?.raw(Level::Pte) & mask != 0)
	}

	/// The frame the PTE of `address` points at, or `0` without a valid
	/// PTE.
	pub fn pte_pfn(&self, address: u64, pid: u32) -> Result<u64> {
		Ok(self
			.resolve(address, pid)?
			.get(Level::Pte)
			.map_or(0, |pte| self.codec.pfn(pte)))
	}

	/// Points the PTE of `address` at frame `pfn`, keeping its flags.
	/// Does nothing without a valid PTE.
	pub fn pte_set_pfn(&self, address: u64, pid: u32, pfn: u64) -> Result<()> {
		let codec = self.codec;
		self.edit_pte(address, pid, |pte| codec.with_pfn(pte, pfn))
	}

	/// Points whatever maps `address` (a PTE or a block entry) at frame
	/// `pfn`, keeping its flags. A block needs a block-aligned `pfn`.
	///
	/// Returns the level rewritten, or `None` if `address` is not mapped.
	pub fn map_page(&self, address: u64, pid: u32, pfn: u64) -> Result<Option<Level>> {
		let ladder = self.resolve(address, pid)?;
		let Some(leaf) = ladder.leaf() else {
			return Ok(None);
		};
		let Some(entry) = ladder.entry(leaf, self.codec, &self.geometry) else {
			return Ok(None);
		};
		if !leaf.is_leaf() && !entry.huge {
			return Ok(None);
		}

		let mut request = Ladder::new(address, pid);
		request.set(leaf, self.codec.with_entry_pfn(&entry, pfn, &self.geometry));
		self.update(&request)?;
		Ok(Some(leaf))
	}

	/// The memory-type table (PAT / MAIR).
	pub fn mem_types(&self) -> Result<MemTypeTable> {
		let raw = self.channel.submit(Command::GetMemType)?;
		Ok(MemTypeTable::new(self.geometry.arch(), raw))
	}

	/// Programs the memory-type table on every CPU.
	pub fn set_mem_types(&self, table: &MemTypeTable) -> Result<()> {
		self.channel
			.submit(Command::SetMemType(table.raw()))
			.map(drop)
	}

	/// The memory type programmed in `slot`.
	pub fn mem_type(&self, slot: u8) -> Result<u8> {
		Ok(self.mem_types()?.get(slot)?)
	}

	/// Programs `slot` with `value`, leaving the other slots alone.
	pub fn set_mem_type(&self, slot: u8, value: u8) -> Result<()> {
		let table = self.mem_types()?.with(slot, value)?;
		self.set_mem_types(&table)
	}

	/// Slots programmed with `value`, as a bitmask.
	pub fn find_mem_type(&self, value: u8) -> Result<u8> {
		Ok(self.mem_types()?.find(value))
	}

	/// The lowest slot programmed with `value`.
	pub fn find_first_mem_type(&self, value: u8) -> Result<Option<u8>> {
		Ok(self.mem_types()?.find_first(value))
	}
}

impl<C> fmt::Debug for Session<'_, C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Session")
			.field("mode", &self.geometry.mode())
			.field("page_size", &self.page_size)
			.field("implementation", &self.implementation)
			.field("pread", &self.pread.is_some())
			.field("direct", &self.direct.is_some())
			.finish_non_exhaustive()
	}
}

impl<C> Drop for Session<'_, C> {
	fn drop(&mut self) {
		info!("session closed");
	}
}

/// What a local walk reads and writes pages through.
enum WalkAccess<'s, 'a, C> {
	/// An accessor registered with the session.
	Registered(&'s (dyn PageAccess + 'a)),
	/// The privileged side.
	Privileged(Mediated<&'s C>),
}

impl<C: Channel> PageAccess for WalkAccess<'_, '_, C> {
	fn page_size(&self) -> usize {
		match self {
			Self::Registered(access) => access.page_size(),
			Self::Privileged(access) => access.page_size(),
		}
	}

	fn read_into(&self, pfn: u64, buffer: &mut [u8]) -> Result<()> {
		match self {
			Self::Registered(access) => access.read_into(pfn, buffer),
			Self::Privileged(access) => access.read_into(pfn, buffer),
		}
	}

	fn write_from(&self, pfn: u64, buffer: &[u8]) -> Result<()> {
		match self {
			Self::Registered(access) => access.write_from(pfn, buffer),
			Self::Privileged(access) => access.write_from(pfn, buffer),
		}
	}
}

/// The mask of entry bit `bit`.
fn bit_mask(bit: u32) -> Result<u64> {
	1_u64
		.checked_shl(bit)
		.ok_or_else(|| Error::Unsupported(format!("entry bit {bit}")))
}
