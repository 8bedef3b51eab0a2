//! Cross-process mutual exclusion over a single byte plus a 4-byte
//! owner-pid cell, both living in the control block's shared memory.
//! Reentrant per owning process via a process-local counter that is never
//! written to shared memory, so no peer can observe or tamper with another
//! process's hold count.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::error::{Error, Result};

const SPIN_BUDGET: u32 = 10_000;

/// Raw view over the shared lock byte + owner pid, both embedded in the
/// control block. Safety: caller guarantees the pointers stay valid for the
/// lifetime of the map (they point into the mmap'd control segment).
pub struct SharedLock {
    lock_byte: *const AtomicU8,
    lock_pid: *const AtomicU32,
    held_count: Cell<u32>,
}

unsafe impl Send for SharedLock {}
unsafe impl Sync for SharedLock {}

impl SharedLock {
    /// # Safety
    /// `lock_byte` and `lock_pid` must point at live, suitably aligned cells
    /// inside a shared-memory control block for as long as `self` exists.
    pub unsafe fn new(lock_byte: *const AtomicU8, lock_pid: *const AtomicU32) -> Self {
        SharedLock {
            lock_byte,
            lock_pid,
            held_count: Cell::new(0),
        }
    }

    fn lock_byte(&self) -> &AtomicU8 {
        unsafe { &*self.lock_byte }
    }

    fn lock_pid(&self) -> &AtomicU32 {
        unsafe { &*self.lock_pid }
    }

    pub fn acquire(&self) -> Result<()> {
        let my_pid = std::process::id();

        if self.held_count.get() > 0 {
            let owner = self.lock_pid().load(Ordering::Relaxed);
            if owner != my_pid {
                return Err(Error::LockStolen {
                    our_pid: my_pid,
                    other_pid: owner,
                });
            }
            self.held_count.set(self.held_count.get() + 1);
            return Ok(());
        }

        for spin in 0..SPIN_BUDGET {
            match self
                .lock_byte()
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.lock_pid().store(my_pid, Ordering::Relaxed);
                    self.held_count.set(1);
                    tracing::debug!(pid = my_pid, spin, "acquired shared lock");
                    return Ok(());
                }
                Err(_) => std::hint::spin_loop(),
            }
        }

        Err(Error::CannotAcquireLock { spins: SPIN_BUDGET })
    }

    pub fn release(&self) -> Result<()> {
        if self.held_count.get() == 0 {
            return Ok(());
        }

        let my_pid = std::process::id();
        let owner = self.lock_pid().load(Ordering::Relaxed);
        if owner != my_pid {
            return Err(Error::LockStolen {
                our_pid: my_pid,
                other_pid: owner,
            });
        }

        self.held_count.set(self.held_count.get() - 1);
        if self.held_count.get() == 0 {
            self.lock_pid().store(0, Ordering::Relaxed);
            let previous = self.lock_byte().swap(0, Ordering::Release);
            debug_assert_eq!(previous, 1, "lock byte should have been held on release");
        }
        Ok(())
    }

    /// Forcibly take the lock away from whoever holds it. Only valid when we
    /// don't believe we hold it ourselves.
    pub fn steal(&self) -> bool {
        assert_eq!(self.held_count.get(), 0, "cannot steal a lock we already hold");
        self.lock_pid().store(0, Ordering::Relaxed);
        self.lock_byte()
            .compare_exchange(1, 0, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// Destructive, unconditional reset. Recovery-only.
    pub fn reset(&self) {
        self.lock_pid().store(0, Ordering::Relaxed);
        self.lock_byte().store(0, Ordering::Relaxed);
        self.held_count.set(0);
    }

    pub fn owner_pid(&self) -> u32 {
        self.lock_pid().load(Ordering::Relaxed)
    }

    /// RAII guard; releases on drop.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        self.acquire()?;
        Ok(LockGuard { lock: self })
    }
}

pub struct LockGuard<'a> {
    lock: &'a SharedLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let _ = self.lock.release();
    }
}

/// In-process fallback when cross-process locking is disabled: guards
/// writers within the same address space, relying on cooperative
/// single-writer usage across processes.
pub struct LocalLock(parking_lot::ReentrantMutex<()>);

impl LocalLock {
    pub fn new() -> Self {
        LocalLock(parking_lot::ReentrantMutex::new(()))
    }

    pub fn lock(&self) -> parking_lot::ReentrantMutexGuard<'_, ()> {
        self.0.lock()
    }
}

impl Default for LocalLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Unifies the shared (cross-process) and local (in-process) lock so
/// `crate::map::SharedMap` can hold one field regardless of configuration.
pub enum MapLock {
    Shared(SharedLock),
    Local(LocalLock),
}

impl MapLock {
    pub fn with_guard<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        match self {
            MapLock::Shared(lock) => {
                let _guard = lock.lock()?;
                f()
            }
            MapLock::Local(lock) => {
                let _guard = lock.lock();
                f()
            }
        }
    }

    pub fn as_shared(&self) -> Option<&SharedLock> {
        match self {
            MapLock::Shared(lock) => Some(lock),
            MapLock::Local(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_cells() -> (Box<AtomicU8>, Box<AtomicU32>) {
        (Box::new(AtomicU8::new(0)), Box::new(AtomicU32::new(0)))
    }

    #[test]
    fn reentrant_within_same_process() {
        let (byte, pid) = fresh_cells();
        let lock = unsafe { SharedLock::new(&*byte as *const _, &*pid as *const _) };

        lock.acquire().unwrap();
        lock.acquire().unwrap();
        assert_eq!(lock.owner_pid(), std::process::id());

        lock.release().unwrap();
        assert_eq!(lock.owner_pid(), std::process::id());
        lock.release().unwrap();
        assert_eq!(lock.owner_pid(), 0);
    }

    #[test]
    fn second_acquirer_is_rejected_until_released() {
        let (byte, pid) = fresh_cells();
        let a = unsafe { SharedLock::new(&*byte as *const _, &*pid as *const _) };

        a.acquire().unwrap();
        byte.store(1, Ordering::SeqCst); // simulate a peer seeing the held byte

        // a fresh `SharedLock` view representing a different process's bookkeeping
        let b = unsafe { SharedLock::new(&*byte as *const _, &*pid as *const _) };
        assert!(matches!(b.acquire(), Err(Error::CannotAcquireLock { .. })));

        a.release().unwrap();
    }

    #[test]
    fn steal_clears_a_stuck_lock() {
        let (byte, pid) = fresh_cells();
        byte.store(1, Ordering::SeqCst);
        pid.store(12345, Ordering::SeqCst);

        let lock = unsafe { SharedLock::new(&*byte as *const _, &*pid as *const _) };
        assert!(lock.steal());
        assert_eq!(byte.load(Ordering::SeqCst), 0);
        assert_eq!(pid.load(Ordering::SeqCst), 0);
    }
}
