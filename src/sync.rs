//! A [`Mutex`] that does not poison itself.
//!
//! The critical sections in this crate only ever perform bookkeeping (moving a waiter list out of
//! the coalescing map, checking worker counts), and user code never runs while one of them is
//! held. A panic can therefore never leave the protected data half-updated, and poisoning would
//! only turn a reaction or production panic on one thread into knock-on `unwrap` panics on every
//! other thread touching the same reactor or producer.
//!
//! [`Mutex::lock`] simply recovers the guard from a poisoned lock.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync,
};

#[derive(Default)]
pub struct Mutex<T: ?Sized> {
    inner: sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(t: T) -> Mutex<T> {
        Self {
            inner: sync::Mutex::new(t),
        }
    }

    pub fn into_inner(self) -> T {
        match self.inner.into_inner() {
            Ok(inner) => inner,
            Err(poison) => poison.into_inner(),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };

        MutexGuard { inner: guard }
    }

    /// Locks the mutex unless another thread currently holds it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(sync::TryLockError::Poisoned(poison)) => poison.into_inner(),
            Err(sync::TryLockError::WouldBlock) => return None,
        };

        Some(MutexGuard { inner: guard })
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(val) => s.field("data", &&*val),
            None => s.field("data", &"<locked>"),
        }
        .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    inner: sync::MutexGuard<'a, T>,
}

impl<'a, T: ?Sized + 'a> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        thread,
    };

    use super::*;

    #[test]
    fn lock_survives_panicking_holder() {
        let mutex = Mutex::new(Vec::new());
        thread::scope(|s| {
            s.spawn(|| {
                catch_unwind(AssertUnwindSafe(|| {
                    let mut guard = mutex.lock();
                    guard.push(1);
                    crate::test::silent_panic("holder panic");
                }))
                .unwrap_err();
            });
        });
        mutex.lock().push(2);
        assert_eq!(mutex.into_inner(), [1, 2]);
    }

    #[test]
    fn debug_does_not_block_when_locked() {
        let mutex = Mutex::new(7);
        let guard = mutex.lock();
        assert!(format!("{mutex:?}").contains("<locked>"));
        drop(guard);
        assert!(format!("{mutex:?}").contains('7'));
    }
}
