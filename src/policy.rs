//! Reaction failures and the host hook that decides what happens to them.

use std::{any::Any, error::Error, fmt, panic::resume_unwind};

/// A boxed error returned by a reaction.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// An error raised by a reactor's reaction while processing an item.
///
/// Both failure modes are caught at the dispatch boundary: a reaction returning `Err` and a
/// reaction panicking. What happens next is up to the reactor's [`ExceptionPolicy`].
pub enum ReactionError {
    /// The reaction returned an error.
    Failed(BoxError),
    /// The reaction panicked. Holds the panic payload.
    Panicked(Box<dyn Any + Send + 'static>),
}

impl ReactionError {
    /// Returns the panic message if the reaction panicked with a string payload.
    pub fn panic_message(&self) -> Option<&str> {
        match self {
            ReactionError::Failed(_) => None,
            ReactionError::Panicked(payload) => panic_message(&**payload),
        }
    }

    /// Rethrows the error as a panic on the current thread.
    ///
    /// A panicking reaction resumes with its original payload; a failed reaction unwinds with the
    /// whole [`ReactionError`] as the payload, so that the host can downcast it.
    pub(crate) fn rethrow(self) -> ! {
        match self {
            ReactionError::Panicked(payload) => resume_unwind(payload),
            failed @ ReactionError::Failed(_) => resume_unwind(Box::new(failed)),
        }
    }
}

impl fmt::Debug for ReactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactionError::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
            ReactionError::Panicked(_) => f
                .debug_tuple("Panicked")
                .field(&self.panic_message().unwrap_or("<non-string payload>"))
                .finish(),
        }
    }
}

impl fmt::Display for ReactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactionError::Failed(err) => write!(f, "reaction failed: {err}"),
            ReactionError::Panicked(_) => match self.panic_message() {
                Some(msg) => write!(f, "reaction panicked: {msg}"),
                None => f.write_str("reaction panicked"),
            },
        }
    }
}

impl Error for ReactionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReactionError::Failed(err) => Some(&**err),
            ReactionError::Panicked(_) => None,
        }
    }
}

/// Decides, per uncaught [`ReactionError`], whether the faulting worker should escalate.
///
/// The policy runs synchronously on the worker thread at the point of failure. Returning `false`
/// swallows the error and the worker keeps dequeuing items. Returning `true` escalates:
///
/// - a background worker stops and rethrows the error as a panic on its pool thread, which the
///   [`ThreadPool`][crate::ThreadPool] forwards to its owner;
/// - a borrowed foreground thread stops and [`Reactor::push`][crate::Reactor::push] returns
///   [`PushError::Escalated`][crate::PushError::Escalated].
///
/// Any `Fn(&ReactionError) -> bool` closure is a policy.
pub trait ExceptionPolicy: Send + Sync {
    /// Returns `true` to escalate `error`, `false` to swallow it.
    fn should_rethrow(&self, error: &ReactionError) -> bool;
}

impl<F> ExceptionPolicy for F
where
    F: Fn(&ReactionError) -> bool + Send + Sync,
{
    fn should_rethrow(&self, error: &ReactionError) -> bool {
        self(error)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        Some(*s)
    } else {
        payload.downcast_ref::<String>().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        panic::{catch_unwind, AssertUnwindSafe},
    };

    use super::*;

    #[test]
    fn panic_messages() {
        let err = catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(
            ReactionError::Panicked(err).to_string(),
            "reaction panicked: static message"
        );

        let n = 3;
        let err = catch_unwind(|| panic!("formatted {n}")).unwrap_err();
        assert_eq!(
            ReactionError::Panicked(err).panic_message(),
            Some("formatted 3")
        );

        let err = ReactionError::Panicked(Box::new(42u8));
        assert_eq!(err.panic_message(), None);
        assert_eq!(err.to_string(), "reaction panicked");
    }

    #[test]
    fn failed_exposes_source() {
        let err = ReactionError::Failed(io::Error::new(io::ErrorKind::Other, "disk on fire").into());
        assert_eq!(err.to_string(), "reaction failed: disk on fire");
        assert!(err.source().is_some());
    }

    #[test]
    fn rethrow_failed_carries_error() {
        let payload = catch_unwind(AssertUnwindSafe(|| {
            ReactionError::Failed("nope".into()).rethrow()
        }))
        .unwrap_err();
        let err = payload.downcast::<ReactionError>().unwrap();
        assert!(matches!(*err, ReactionError::Failed(_)));
    }

    #[test]
    fn rethrow_panicked_resumes_payload() {
        let payload = catch_unwind(AssertUnwindSafe(|| {
            ReactionError::Panicked(Box::new("original")).rethrow()
        }))
        .unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"original"));
    }

    #[test]
    fn closures_are_policies() {
        let policy = |err: &ReactionError| matches!(err, ReactionError::Panicked(_));
        assert!(!policy.should_rethrow(&ReactionError::Failed("x".into())));
        assert!(policy.should_rethrow(&ReactionError::Panicked(Box::new(()))));
    }
}
