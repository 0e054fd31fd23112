//! Error types surfaced by the progress graph and by [`AsyncLazy`](crate::AsyncLazy).
//!
//! Errors are only ever returned from a caller's *own* entry point (creating a token on a
//! disposed builder, adding a weight the merger cannot represent, ...). Staleness detected
//! while a report is walking the graph is never an error: it means the edge was already
//! severed, and the report is dropped silently.

use thiserror::Error;

/// Errors returned synchronously by the progress graph's public entry points.
#[derive(Clone, Copy, Debug, Error, PartialEq)]
pub enum ProgressError {
    /// The node behind a builder or token was already disposed (its epoch moved on).
    #[error("{0} was already disposed")]
    ObjectDisposed(&'static str),

    /// The weight cannot be folded into the merger's denominator without losing it
    /// to floating-point resolution, or the sum overflows.
    #[error("cannot add weight {weight} to merge denominator {denominator}")]
    Arithmetic {
        /// The rejected weight.
        weight: f64,
        /// The merger's denominator at the time of the rejection.
        denominator: f64,
    },

    /// An argument was outside the accepted domain.
    #[error("invalid argument: {0}")]
    Argument(&'static str),
}

/// The outcome of a failed [`AsyncLazy`](crate::AsyncLazy) factory attempt.
///
/// Both variants reset the lazy value so the next access retries the factory.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LazyError<E> {
    /// The factory future resolved with an error.
    #[error("lazy factory failed: {0}")]
    Failed(E),

    /// The factory future reported cancellation.
    #[error("lazy factory was canceled")]
    Canceled,
}

impl<E> LazyError<E> {
    /// Returns `true` if this is [`LazyError::Canceled`].
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Returns the factory error, if any.
    #[must_use]
    pub const fn failure(&self) -> Option<&E> {
        match self {
            Self::Failed(error) => Some(error),
            Self::Canceled => None,
        }
    }
}
