use crate::{RawLock, RawUnlock};
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// A value guarded by a raw lock `R`.
///
/// The value is only reachable through a [`MutexGuard`]. The guard releases
/// the raw lock when it goes out of scope, so an early return or a `?`
/// inside the critical section cannot leave the lock held.
pub struct Mutex<T, R> {
    raw: R,
    data: UnsafeCell<T>,
}

// `UnsafeCell` already keeps the auto `Send` impl tied to `T: Send`; sharing
// needs the raw lock to be shareable and the value to be movable between CPUs.
unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    /// Wraps `value` behind an already constructed raw lock.
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            data: UnsafeCell::new(value),
        }
    }

    /// Exclusive access through `&mut self`; the lock is not touched.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    #[inline]
    pub const fn raw(&self) -> &R {
        &self.raw
    }

    /// Pointer to the protected value. Dereferencing it is only sound while
    /// the lock is held.
    #[inline]
    pub const fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Spins until the raw lock is acquired.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.raw_lock();
        // SAFETY: the raw lock was just acquired by this call.
        unsafe { MutexGuard::new(self) }
    }

    /// Acquires the lock only if that needs no waiting.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        // SAFETY: `raw_try_lock` returned true, so this call owns the lock.
        self.raw
            .raw_try_lock()
            .then(|| unsafe { MutexGuard::new(self) })
    }

    /// Runs `f` on the protected value and releases the lock afterwards.
    #[inline]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        f(&mut self.lock())
    }
}

/// Proof of ownership of a [`Mutex`], released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard<'a, T, R: RawUnlock> {
    raw: &'a R,
    data: *mut T,
    _value: PhantomData<&'a mut T>,
}

impl<'a, T, R: RawUnlock> MutexGuard<'a, T, R> {
    /// # Safety
    /// The caller must hold `mutex`'s raw lock and hand its release over to
    /// the guard.
    #[inline]
    unsafe fn new(mutex: &'a Mutex<T, R>) -> Self {
        Self {
            raw: &mutex.raw,
            data: mutex.data.get(),
            _value: PhantomData,
        }
    }
}

// The guard only hands out `&T` when shared.
unsafe impl<T: Sync, R: RawUnlock + Sync> Sync for MutexGuard<'_, T, R> {}

impl<T, R: RawUnlock> Deref for MutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard's existence means the lock is held.
        unsafe { &*self.data }
    }
}

impl<T, R: RawUnlock> DerefMut for MutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as in `deref`, and `&mut self` rules out other borrows.
        unsafe { &mut *self.data }
    }
}

impl<T, R: RawUnlock> Drop for MutexGuard<'_, T, R> {
    fn drop(&mut self) {
        // SAFETY: the guard was created with the lock held and drops once.
        unsafe { self.raw.raw_unlock() }
    }
}

impl<T: fmt::Debug, R: RawUnlock> fmt::Debug for MutexGuard<'_, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Debug, R: RawLock + RawUnlock> fmt::Debug for Mutex<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(g) => s.field("data", &&*g),
            None => s.field("data", &format_args!("<locked>")),
        };
        s.finish_non_exhaustive()
    }
}
