//! Error taxonomy shared by every cursor, flow and window in this crate.

use std::convert::Infallible;

/// Failure surfaced by a consumption operation.
///
/// `E` is the error type of the wrapped producer. End of sequence is never an
/// error; it shows up as `None` or as the natural end of a traversal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForkError<E> {
    /// A precondition was violated at the call site.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The producer failed while pulling the item at this index. The same
    /// failure is replayed to every consumer that reaches the index.
    #[error("upstream failure: {0}")]
    Upstream(E),

    /// The awaiting consumer, or the pull it was waiting on, was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl<E> ForkError<E> {
    /// Returns `true` for [`ForkError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` when the error came from the producer.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream(_))
    }

    /// Borrows the producer error, if this is one.
    pub fn upstream(&self) -> Option<&E> {
        match self {
            Self::Upstream(err) => Some(err),
            _ => None,
        }
    }

    /// Maps the producer error type, leaving the other variants untouched.
    pub fn map_upstream<F, E2>(self, f: F) -> ForkError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            Self::InvalidArgument(msg) => ForkError::InvalidArgument(msg),
            Self::Upstream(err) => ForkError::Upstream(f(err)),
            Self::Cancelled => ForkError::Cancelled,
        }
    }
}

impl ForkError<Infallible> {
    /// Widens an error from an infallible producer into any producer error type.
    pub fn widen<E>(self) -> ForkError<E> {
        self.map_upstream(|never| match never {})
    }
}

/// Result alias used across the crate.
pub type ForkResult<T, E> = Result<T, ForkError<E>>;

pub(crate) fn ensure_positive<E>(value: usize, what: &'static str) -> ForkResult<usize, E> {
    if value == 0 {
        Err(ForkError::InvalidArgument(what))
    } else {
        Ok(value)
    }
}
