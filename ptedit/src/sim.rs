//! A simulated machine for exercising the editor without privileges.
//!
//! [`SimMachine`] owns a block of "physical" memory, a process table
//! mapping pids to translation roots, per-CPU memory-type registers and
//! a log of TLB maintenance. [`SimChannel`] plays the privileged side:
//! it answers every [`Command`] by running the same
//! [`Walker`](crate::walk::Walker) the user-space paths use, directly on
//! the simulated memory.

use std::{
	collections::BTreeMap,
	io,
	sync::{
		Mutex, MutexGuard, PoisonError,
		atomic::{AtomicU8, AtomicU64, Ordering},
	},
};

use log::debug;
use ptedit_arch::{Architecture, Codec, Geometry, Level, MemTypeTable, PagingMode};

use crate::{
	Error, Ladder, Result,
	access::{Direct, PageAccess, PhysWindow, check_page_len},
	channel::{Channel, Command, LadderRecord, wire_pid},
	gate::{Gate, GateGuard, LockToggle},
	tlb::TlbControl,
	walk::Walker,
};

/// Number of simulated CPUs.
pub const CPUS: usize = 4;

/// TLB maintenance observed by the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbEvent {
	/// One address was flushed on every CPU.
	Invalidate {
		/// The flushed address.
		address: u64,
	},
	/// The whole TLB was flushed on a set of CPUs.
	Shootdown {
		/// The targeted CPUs.
		cpus: u64,
	},
	/// The running process' root register was re-written.
	RootReload {
		/// The value written.
		root: u64,
	},
}

/// Locks `mutex`, ignoring poisoning; the protected state stays
/// consistent across every panic point.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Simulated physical memory, processes and CPU state.
pub struct SimMachine {
	/// Paging mode of every process.
	geometry:   Geometry,
	/// Physical memory, frame `n` at byte `n * page_size`.
	memory:     Box<[AtomicU8]>,
	/// Next frame handed out by [`SimMachine::alloc_frame`].
	next_frame: AtomicU64,
	/// Translation roots by pid.
	processes:  Mutex<BTreeMap<u32, u64>>,
	/// The pid that `0` refers to.
	current:    Mutex<Option<u32>>,
	/// Memory-type register of each CPU.
	mem_types:  Mutex<[u64; CPUS]>,
	/// TLB maintenance, oldest first.
	tlb:        Mutex<Vec<TlbEvent>>,
	/// The address-space lock.
	lock:       LockToggle,
	/// The single-session gate.
	gate:       Gate,
}

impl SimMachine {
	/// A machine with `frames` zeroed frames. Frame `0` is never
	/// handed out by the allocator.
	#[must_use]
	pub fn new(mode: PagingMode, frames: usize) -> Self {
		let geometry = Geometry::new(mode);
		let len = frames.saturating_mul(geometry.page_size());
		let reset = MemTypeTable::reset(mode.arch()).raw();

		Self {
			geometry,
			memory: (0..len).map(|_| AtomicU8::new(0)).collect(),
			next_frame: AtomicU64::new(1),
			processes: Mutex::new(BTreeMap::new()),
			current: Mutex::new(None),
			mem_types: Mutex::new([reset; CPUS]),
			tlb: Mutex::new(Vec::new()),
			lock: LockToggle::new(),
			gate: Gate::new(),
		}
	}

	/// The paging geometry.
	#[must_use]
	pub const fn geometry(&self) -> &Geometry {
		&self.geometry
	}

	/// The architecture.
	#[must_use]
	pub const fn arch(&self) -> Architecture {
		self.geometry.arch()
	}

	/// The page size.
	#[must_use]
	pub const fn page_size(&self) -> usize {
		self.geometry.page_size()
	}

	/// The entry codec.
	const fn codec(&self) -> Codec {
		Codec::for_arch(self.geometry.arch())
	}

	/// A window over the whole of physical memory.
	#[must_use]
	pub fn window(&self) -> SimWindow<'_> {
		SimWindow {
			memory: &self.memory,
		}
	}

	/// Byte-copy access to physical memory.
	fn access(&self) -> Direct<SimWindow<'_>> {
		Direct::new(self.window(), self.page_size())
	}

	/// Opens the privileged channel. Fails with [`Error::Busy`] while
	/// another channel is open.
	pub fn open(&self) -> Result<SimChannel<'_>> {
		let guard = self.gate.try_acquire()?;
		Ok(SimChannel {
			machine: self,
			_guard:  guard,
		})
	}

	/// Hands out a fresh frame. Frames are never freed, so it is still
	/// zeroed.
	pub fn alloc_frame(&self) -> Result<u64> {
		let pfn = self.next_frame.fetch_add(1, Ordering::Relaxed);
		let end = usize::try_from(pfn)
			.ok()
			.and_then(|pfn| pfn.checked_add(1))
			.and_then(|frames| frames.checked_mul(self.page_size()));
		match end {
			Some(end) if end <= self.memory.len() => Ok(pfn),
			_ => {
				Err(Error::Io(io::Error::new(
					io::ErrorKind::OutOfMemory,
					format!("simulated memory has no frame {pfn:#x}"),
				)))
			}
		}
	}

	/// Creates process `pid` with an empty root table; returns the
	/// root's physical address.
	pub fn spawn(&self, pid: u32) -> Result<u64> {
		let root = self.alloc_frame()? << self.geometry.page_offset_bits();
		lock(&self.processes).insert(pid, root);
		Ok(root)
	}

	/// Makes `pid` the process that pid `0` refers to.
	pub fn set_current(&self, pid: u32) {
		*lock(&self.current) = Some(pid);
	}

	/// Resolves pid `0` to the current process.
	fn effective_pid(&self, pid: u32) -> Result<u32> {
		match pid {
			0 => (*lock(&self.current)).ok_or(Error::NotFound { pid }),
			pid => Ok(pid),
		}
	}

	/// The translation root of `pid`.
	pub fn root(&self, pid: u32) -> Result<u64> {
		let pid = self.effective_pid(pid)?;
		lock(&self.processes)
			.get(&pid)
			.copied()
			.ok_or(Error::NotFound { pid })
	}

	/// Replaces the translation root of `pid`.
	pub fn set_root(&self, pid: u32, root: u64) -> Result<()> {
		let pid = self.effective_pid(pid)?;
		let mut processes = lock(&self.processes);
		let slot = processes.get_mut(&pid).ok_or(Error::NotFound { pid })?;
		*slot = root;
		drop(processes);

		if *lock(&self.current) == Some(pid) {
			lock(&self.tlb).push(TlbEvent::RootReload { root });
		}
		Ok(())
	}

	/// Reads the 8 bytes at physical address `phys`; out-of-range bytes
	/// read as zero.
	#[must_use]
	pub fn read_u64(&self, phys: u64) -> u64 {
		let mut bytes = [0; 8];
		for (offset, byte) in (0..).zip(bytes.iter_mut()) {
			*byte = self
				.byte(phys.wrapping_add(offset))
				.map_or(0, |b| b.load(Ordering::Relaxed));
		}
		u64::from_ne_bytes(bytes)
	}

	/// Writes the 8 bytes at physical address `phys`; out-of-range bytes
	/// are discarded.
	pub fn write_u64(&self, phys: u64, value: u64) {
		for (offset, byte) in (0..).zip(value.to_ne_bytes()) {
			if let Some(cell) = self.byte(phys.wrapping_add(offset)) {
				cell.store(byte, Ordering::Relaxed);
			}
		}
	}

	/// The byte at physical address `phys`.
	fn byte(&self, phys: u64) -> Option<&AtomicU8> {
		self.memory.get(usize::try_from(phys).ok()?)
	}

	/// Physical address of the table slot `level` of `address` lives
	/// in, following the tables currently installed. `None` if a table
	/// above `level` is missing or `level` is folded.
	pub fn locate(&self, pid: u32, address: u64, level: Level) -> Result<Option<u64>> {
		let codec = self.codec();
		let mut table = self.root(pid)? >> self.geometry.page_offset_bits();

		for current in self.geometry.present_levels() {
			let slot = (table << self.geometry.page_offset_bits())
				+ u64::try_from(self.geometry.entry_offset(current, address))
					.map_err(|_| Error::OutOfBounds { pfn: table })?;

			if current == level {
				return Ok(Some(slot));
			}

			let entry = codec.decode(self.read_u64(slot), current, &self.geometry);
			if !entry.present || entry.huge || current.is_leaf() {
				return Ok(None);
			}
			table = entry.pfn;
		}

		Ok(None)
	}

	/// Maps the 4 KiB page at `address` of `pid` to frame `pfn`,
	/// allocating intermediate tables as needed.
	pub fn map(&self, pid: u32, address: u64, pfn: u64) -> Result<()> {
		self.install(pid, address, Level::Pte, pfn)
	}

	/// Maps a block at `level` of `pid` covering `address` to frame
	/// `pfn`, which must be block aligned.
	pub fn map_huge(&self, pid: u32, address: u64, level: Level, pfn: u64) -> Result<()> {
		if !self.geometry.supports_block(level) {
			return Err(Error::Unsupported(format!(
				"{level} block mappings under {}",
				self.geometry.mode()
			)));
		}
		self.install(pid, address, level, pfn)
	}

	/// Installs a leaf at `leaf`, creating tables above it.
	fn install(&self, pid: u32, address: u64, leaf: Level, pfn: u64) -> Result<()> {
		let codec = self.codec();
		let huge = !leaf.is_leaf();

		for level in self.geometry.present_levels() {
			let slot = self
				.locate(pid, address, level)?
				.ok_or_else(|| Error::Unsupported(format!("{level} is covered by a block")))?;

			if level == leaf {
				let raw = codec.leaf_entry(pfn, level, huge, &self.geometry);
				debug!("sim: {level} of {address:#x} -> {raw:#018x}");
				self.write_u64(slot, raw);
				return Ok(());
			}

			let current = self.read_u64(slot);
			if !codec.is_present(current, level, &self.geometry) {
				let table = self.alloc_frame()?;
				self.write_u64(slot, codec.table_entry(table));
			}
		}

		Err(Error::Unsupported(format!(
			"{leaf} under {}",
			self.geometry.mode()
		)))
	}

	/// The memory-type register of `cpu`.
	#[must_use]
	pub fn mem_type_of(&self, cpu: usize) -> Option<u64> {
		lock(&self.mem_types).get(cpu).copied()
	}

	/// Programs the memory-type register of a single CPU, leaving the
	/// others alone.
	pub fn set_mem_type_of(&self, cpu: usize, value: u64) {
		if let Some(reg) = lock(&self.mem_types).get_mut(cpu) {
			*reg = value;
		}
	}

	/// TLB maintenance observed so far.
	#[must_use]
	pub fn tlb_events(&self) -> Vec<TlbEvent> {
		lock(&self.tlb).clone()
	}

	/// Forgets the TLB maintenance observed so far.
	pub fn clear_tlb_events(&self) {
		lock(&self.tlb).clear();
	}

	/// Whether the address-space lock is held.
	#[must_use]
	pub fn is_locked(&self) -> bool {
		self.lock.is_locked()
	}
}

impl TlbControl for SimMachine {
	fn invalidate(&self, address: u64) -> Result<()> {
		lock(&self.tlb).push(TlbEvent::Invalidate { address });
		Ok(())
	}

	fn shootdown(&self, cpus: u64) -> Result<()> {
		lock(&self.tlb).push(TlbEvent::Shootdown { cpus });
		Ok(())
	}

	fn reload_root(&self) -> Result<()> {
		let root = self.root(0)?;
		self.set_root(0, root)
	}
}

/// A [`PhysWindow`] over a [`SimMachine`]'s memory.
#[derive(Debug, Clone, Copy)]
pub struct SimWindow<'a> {
	/// The memory.
	memory: &'a [AtomicU8],
}

// SAFETY: The slice is borrowed for the window's lifetime, so it stays
// SAFETY: mapped. Its bytes are atomics, so mutation through a shared
// SAFETY: borrow is permitted and no `&u8` into it exists.
unsafe impl PhysWindow for SimWindow<'_> {
	fn base(&self) -> *mut u8 {
		self.memory.as_ptr().cast::<u8>().cast_mut()
	}

	fn len(&self) -> usize {
		self.memory.len()
	}
}

/// The privileged side of a [`SimMachine`]. Holds the machine's gate
/// until dropped.
pub struct SimChannel<'a> {
	/// The machine.
	machine: &'a SimMachine,
	/// Ownership of the gate.
	_guard:  GateGuard<'a>,
}

impl SimChannel<'_> {
	/// The walker the privileged side runs.
	fn walker(&self) -> Walker<Direct<SimWindow<'_>>> {
		Walker::new(self.machine.access(), self.machine.geometry)
	}

	/// The machine behind the channel.
	#[must_use]
	pub const fn machine(&self) -> &SimMachine {
		self.machine
	}
}

impl Channel for SimChannel<'_> {
	fn submit(&self, command: Command<'_>) -> Result<u64> {
		let machine = self.machine;
		match command {
			Command::Resolve(record) => {
				let pid = wire_pid(record.pid)?;
				let root = machine.root(pid)?;
				let ladder = self.walker().resolve(root, record.vaddr, pid)?;
				*record = LadderRecord::from(&ladder);
				Ok(0)
			}
			Command::Update(record) => {
				let request = Ladder::try_from(record)?;
				let root = machine.root(request.pid)?;
				self.walker().update(root, &request, machine)?;
				Ok(0)
			}
			Command::Lock => machine.lock.acquire().map(|()| 0),
			Command::Unlock => machine.lock.release().map(|()| 0),
			Command::ReadPage { pfn, buffer } => {
				check_page_len(buffer.len(), machine.page_size())?;
				machine.access().read_into(pfn, buffer)?;
				Ok(0)
			}
			Command::WritePage { pfn, buffer } => {
				check_page_len(buffer.len(), machine.page_size())?;
				machine.access().write_from(pfn, buffer)?;
				Ok(0)
			}
			Command::GetRoot(record) => {
				let pid = wire_pid(record.pid)?;
				record.root = machine.root(pid)?;
				Ok(0)
			}
			Command::SetRoot(record) => {
				let pid = wire_pid(record.pid)?;
				machine.set_root(pid, record.root)?;
				Ok(0)
			}
			Command::GetPageSize => Ok(u64::try_from(machine.page_size()).unwrap_or(u64::MAX)),
			Command::InvalidateTlb { address } => machine.invalidate(address).map(|()| 0),
			Command::GetMemType => Ok(lock(&machine.mem_types)[0]),
			Command::SetMemType(value) => {
				*lock(&machine.mem_types) = [value; CPUS];
				Ok(0)
			}
			Command::TlbShootdown { cpus } => machine.shootdown(cpus).map(|()| 0),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn one_channel_at_a_time() {
		let machine = SimMachine::new(PagingMode::X86_64Level4, 8);
		let channel = machine.open().unwrap();
		assert!(matches!(machine.open(), Err(Error::Busy)));
		drop(channel);
		let _channel = machine.open().unwrap();
	}

	#[test]
	fn unknown_processes_are_not_found() {
		let machine = SimMachine::new(PagingMode::X86_64Level4, 8);
		let channel = machine.open().unwrap();
		assert!(matches!(channel.root(9), Err(Error::NotFound { pid: 9 })));
		assert!(matches!(channel.root(0), Err(Error::NotFound { pid: 0 })));

		let mut record = LadderRecord {
			pid: 9,
			..LadderRecord::default()
		};
		assert!(matches!(
			channel.submit(Command::Resolve(&mut record)),
			Err(Error::NotFound { pid: 9 })
		));
	}

	#[test]
	fn allocator_runs_out() {
		let machine = SimMachine::new(PagingMode::X86_64Level4, 3);
		assert_eq!(machine.alloc_frame().unwrap(), 1);
		assert_eq!(machine.alloc_frame().unwrap(), 2);
		assert!(machine.alloc_frame().unwrap_err().is_io());
	}

	#[test]
	fn mem_type_writes_reach_every_cpu() {
		let machine = SimMachine::new(PagingMode::Aarch64Va39, 8);
		machine.set_mem_type_of(2, 0);
		let channel = machine.open().unwrap();
		channel.submit(Command::SetMemType(0x1234)).unwrap();
		for cpu in 0..CPUS {
			assert_eq!(machine.mem_type_of(cpu), Some(0x1234));
		}
		assert_eq!(channel.submit(Command::GetMemType).unwrap(), 0x1234);
	}

	#[test]
	fn channel_resolves_in_kernel() {
		let machine = SimMachine::new(PagingMode::X86_64Level5, 32);
		machine.spawn(3).unwrap();
		machine.set_current(3);
		let frame = machine.alloc_frame().unwrap();
		machine.map(3, 0x1000, frame).unwrap();

		let channel = machine.open().unwrap();
		let mut record = LadderRecord {
			pid: 0,
			vaddr: 0x1000,
			..LadderRecord::default()
		};
		channel.submit(Command::Resolve(&mut record)).unwrap();
		assert_eq!(record.valid, 0b1_1111);
		assert_eq!(Codec::X86_64.pfn(record.pte), frame);
	}
}
