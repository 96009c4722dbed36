//! Long-term locks, held across disk I/O.

use core::cell::{Cell, UnsafeCell};
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut, Drop};

use crate::SpinLock;

/// Mutual exclusion that may be held while the owner blocks on the disk.
/// The `locked` flag is protected by the inner spinlock; a contending
/// acquirer releases the spinlock and retries, so the short-term lock is
/// never held while waiting.
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: SpinLock::new(()),
            locked: Cell::new(false),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();
        while self.locked.get() {
            // No scheduler to yield to here: back off and re-check.
            drop(guard);
            spin_loop();
            guard = self.lock.lock();
        }
        self.locked.set(true);
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// Called by the guard when dropped.
    fn unlock(&self) {
        let guard = self.lock.lock();
        if !self.locked.get() {
            panic!("sleeplock: unlock while not locked");
        }
        self.locked.set(false);
        drop(guard);
    }
}

pub struct SleepLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
