//! Scoped guards that run cleanup on every exit path, including unwinding.

use std::{cell::Cell, marker::PhantomData};

/// Drop guard returned by [`defer`].
#[must_use = "`Defer` should be assigned to a variable, or it will be dropped immediately"]
pub struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(cb) = self.0.take() {
            cb();
        }
    }
}

/// Returns a value that runs `cb` when dropped.
pub fn defer<F: FnOnce()>(cb: F) -> Defer<F> {
    Defer(Some(cb))
}

thread_local! {
    static BORROWED: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as borrowed by a reactor's foreground path.
///
/// At most one borrow exists per thread at any time, across all reactors. The flag is cleared
/// when the guard is dropped.
#[must_use = "the thread is only borrowed while the guard is alive"]
pub struct ForegroundBorrow {
    // Tied to the thread that set the flag.
    _not_send: PhantomData<*const ()>,
}

impl ForegroundBorrow {
    /// Borrows the current thread, or returns [`None`] if it is already borrowed.
    pub fn acquire() -> Option<Self> {
        BORROWED.with(|borrowed| {
            if borrowed.replace(true) {
                None
            } else {
                Some(Self {
                    _not_send: PhantomData,
                })
            }
        })
    }

    /// Returns whether the current thread is borrowed.
    pub fn is_held() -> bool {
        BORROWED.with(Cell::get)
    }
}

impl Drop for ForegroundBorrow {
    fn drop(&mut self) {
        BORROWED.with(|borrowed| borrowed.set(false));
    }
}
