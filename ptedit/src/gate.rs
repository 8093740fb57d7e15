//! Two-state primitives guarding the privileged side: the single-owner
//! channel gate and the address-space lock toggle.
//!
//! Both live in whatever object models the privileged side, never in
//! process-wide statics, so independent instances do not interfere.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::{Error, Result};

/// Admits at most one session at a time. A second session is turned
/// away with [`Error::Busy`] rather than queued.
#[derive(Debug, Default)]
pub struct Gate {
	/// Whether a [`GateGuard`] is alive.
	busy: AtomicBool,
}

impl Gate {
	/// Creates an open gate.
	#[must_use]
	pub const fn new() -> Self {
		Self {
			busy: AtomicBool::new(false),
		}
	}

	/// Takes ownership of the gate until the guard is dropped.
	pub fn try_acquire(&self) -> Result<GateGuard<'_>> {
		self.busy
			.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
			.map_err(|_| Error::Busy)?;
		Ok(GateGuard { gate: self })
	}

	/// Whether a session currently owns the gate.
	#[must_use]
	pub fn is_busy(&self) -> bool {
		self.busy.load(Ordering::Relaxed)
	}
}

/// Ownership of a [`Gate`]; releases it on drop.
#[derive(Debug)]
pub struct GateGuard<'a> {
	/// The owned gate.
	gate: &'a Gate,
}

impl Drop for GateGuard<'_> {
	fn drop(&mut self) {
		self.gate.busy.store(false, Ordering::Release);
	}
}

/// The address-space lock toggle. Acquiring twice or releasing twice is
/// reported to the caller and leaves the state unchanged.
#[derive(Debug, Default)]
pub struct LockToggle {
	/// Current state.
	locked: AtomicBool,
}

impl LockToggle {
	/// Creates an unlocked toggle.
	#[must_use]
	pub const fn new() -> Self {
		Self {
			locked: AtomicBool::new(false),
		}
	}

	/// Unlocked -> Locked.
	pub fn acquire(&self) -> Result<()> {
		self.locked
			.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
			.map(drop)
			.map_err(|_| Error::AlreadyLocked)
	}

	/// Locked -> Unlocked.
	pub fn release(&self) -> Result<()> {
		self.locked
			.compare_exchange(true, false, Ordering::Release, Ordering::Relaxed)
			.map(drop)
			.map_err(|_| Error::NotLocked)
	}

	/// Whether the lock is held.
	#[must_use]
	pub fn is_locked(&self) -> bool {
		self.locked.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lock_toggle_twice() {
		let lock = LockToggle::new();
		lock.acquire().unwrap();
		assert!(matches!(lock.acquire(), Err(Error::AlreadyLocked)));
		assert!(lock.is_locked());
		lock.release().unwrap();
		assert!(matches!(lock.release(), Err(Error::NotLocked)));
		assert!(!lock.is_locked());
	}

	#[test]
	fn gate_admits_one_owner() {
		let gate = Gate::new();
		let guard = gate.try_acquire().unwrap();
		assert!(gate.is_busy());
		assert!(matches!(gate.try_acquire(), Err(Error::Busy)));
		drop(guard);
		assert!(!gate.is_busy());
		let _guard = gate.try_acquire().unwrap();
	}

	#[test]
	fn independent_instances() {
		let a = LockToggle::new();
		let b = LockToggle::new();
		a.acquire().unwrap();
		b.acquire().unwrap();
	}
}
