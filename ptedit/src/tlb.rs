//! TLB invalidation and full serialization.

use crate::{
	Result,
	channel::{Channel, Command},
};

/// Flushes translation caches.
pub trait TlbControl {
	/// Flushes `address` from the TLB of every CPU. Returns once the
	/// flush is complete.
	fn invalidate(&self, address: u64) -> Result<()>;

	/// Flushes the whole TLB of every CPU in `cpus` (bit `n` = CPU `n`).
	fn shootdown(&self, cpus: u64) -> Result<()>;

	/// Re-programs the caller's translation root with its current value.
	fn reload_root(&self) -> Result<()>;

	/// Worst-case flush: barrier, root reload, barrier.
	///
	/// Makes no assumption about incremental invalidation support.
	fn serializing_barrier(&self) -> Result<()> {
		barrier();
		self.reload_root()?;
		barrier();
		Ok(())
	}
}

impl<T: TlbControl + ?Sized> TlbControl for &T {
	fn invalidate(&self, address: u64) -> Result<()> {
		(**self).invalidate(address)
	}

	fn shootdown(&self, cpus: u64) -> Result<()> {
		(**self).shootdown(cpus)
	}

	fn reload_root(&self) -> Result<()> {
		(**self).reload_root()
	}
}

/// TLB control through the privileged side of a [`Channel`].
#[derive(Debug, Clone, Copy)]
pub struct ChannelTlb<C>(pub C);

impl<C: Channel> TlbControl for ChannelTlb<C> {
	fn invalidate(&self, address: u64) -> Result<()> {
		self.0.submit(Command::InvalidateTlb { address }).map(drop)
	}

	fn shootdown(&self, cpus: u64) -> Result<()> {
		self.0.submit(Command::TlbShootdown { cpus }).map(drop)
	}

	fn reload_root(&self) -> Result<()> {
		let root = self.0.root(0)?;
		self.0.set_root(0, root)
	}
}

/// Full memory and instruction barrier on the current CPU.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn barrier() {
	// SAFETY: Fences only order memory accesses; they have no other effects.
	unsafe {
		core::arch::asm!("mfence", "lfence", options(nostack, preserves_flags));
	}
}

/// Full memory and instruction barrier on the current CPU.
#[cfg(target_arch = "aarch64")]
#[inline]
pub fn barrier() {
	// SAFETY: Barriers only order memory accesses and the instruction
	// SAFETY: stream; they have no other effects.
	unsafe {
		core::arch::asm!("dsb sy", "dsb ish", "isb", options(nostack, preserves_flags));
	}
}

/// Full memory barrier on the current CPU.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline]
pub fn barrier() {
	core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
	use ptedit_arch::PagingMode;

	use super::*;
	use crate::sim::{SimMachine, TlbEvent};

	#[test]
	fn serializing_barrier_reloads_root() {
		let machine = SimMachine::new(PagingMode::X86_64Level4, 16);
		let root = machine.spawn(1).unwrap();
		machine.set_current(1);
		let channel = machine.open().unwrap();
		let tlb = ChannelTlb(&channel);

		tlb.serializing_barrier().unwrap();
		assert_eq!(machine.tlb_events(), vec![TlbEvent::RootReload { root }]);
		assert_eq!(channel.root(0).unwrap(), root);
	}

	#[test]
	fn invalidate_and_shootdown_reach_privileged_side() {
		let machine = SimMachine::new(PagingMode::Aarch64Va48, 16);
		let channel = machine.open().unwrap();
		let tlb = ChannelTlb(&channel);

		tlb.invalidate(0x7000).unwrap();
		tlb.shootdown(0b101).unwrap();
		assert_eq!(machine.tlb_events(), vec![
			TlbEvent::Invalidate { address: 0x7000 },
			TlbEvent::Shootdown { cpus: 0b101 },
		]);
	}
}
