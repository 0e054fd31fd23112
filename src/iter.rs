//! Iterator adapters that report into a [`ProgressToken`].
//!
//! [`ProgressIteratorExt`] adds helper methods to any Rust [`Iterator`], so a loop can feed
//! a listener, a merge slot or a race entrant with a single method call.
//!
//! # Heuristics
//!
//! The adapter checks [`Iterator::size_hint`]:
//! * If the iterator provides an exact size, each item reports `position / total`.
//! * If the size is unknown, nothing is reported until the iterator is exhausted.
//!
//! Exhaustion always reports `1.0`.
//!
//! # Example
//!
//! ```
//! use progress_flow::{ProgressIteratorExt, ProgressListener};
//!
//! let listener = ProgressListener::new(|v| println!("{:.0}%", v * 100.0));
//! let sum: u32 = vec![1, 2, 3, 4].into_iter().report_to(listener.token()).sum();
//!
//! assert_eq!(sum, 10);
//! assert_eq!(listener.value(), Some(1.0));
//! # let _ = listener.dispose();
//! ```

use crate::token::ProgressToken;

/// An iterator adapter that reports its position into a [`ProgressToken`].
#[derive(Debug)]
pub struct ProgressIter<I> {
    iter: I,
    token: ProgressToken,
    total: Option<usize>,
    position: usize,
    exhausted: bool,
}

impl<I> ProgressIter<I> {
    /// Creates a new `ProgressIter`. `total` of `None` (or zero) reports only on exhaustion.
    ///
    /// Note: This is usually constructed via [`ProgressIteratorExt`] methods.
    pub const fn new(iter: I, token: ProgressToken, total: Option<usize>) -> Self {
        Self {
            iter,
            token,
            total,
            position: 0,
            exhausted: false,
        }
    }

    /// Items yielded so far.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }
}

impl<I: Iterator> Iterator for ProgressIter<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.iter.next();

        if item.is_some() {
            self.position += 1;
            if let Some(total) = self.total.filter(|total| *total > 0) {
                #[allow(clippy::cast_precision_loss)]
                self.token.report(self.position as f64 / total as f64);
            }
        } else if !self.exhausted {
            self.exhausted = true;
            self.token.report(1.0);
        }

        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

/// Extension trait to attach progress reporting to any Iterator.
pub trait ProgressIteratorExt: Sized {
    /// Wraps the iterator, taking the total from an exact `size_hint` if there is one.
    fn report_to(self, token: ProgressToken) -> ProgressIter<Self>;

    /// Wraps the iterator with an explicit item count.
    fn report_to_with_total(self, token: ProgressToken, total: usize) -> ProgressIter<Self>;
}

impl<I: Iterator> ProgressIteratorExt for I {
    fn report_to(self, token: ProgressToken) -> ProgressIter<Self> {
        let total = match self.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(upper),
            _ => None,
        };
        ProgressIter::new(self, token, total)
    }

    fn report_to_with_total(self, token: ProgressToken, total: usize) -> ProgressIter<Self> {
        ProgressIter::new(self, token, Some(total))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::ProgressIteratorExt as _;
    use crate::ProgressListener;

    fn recording() -> (ProgressListener, Arc<Mutex<Vec<f64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (ProgressListener::new(move |v| sink.lock().push(v)), seen)
    }

    /// Exact Size
    /// Verifies each item reports its fraction and exhaustion completes.
    #[test]
    fn test_exact_size() {
        let (listener, seen) = recording();
        let data = [1, 2, 3, 4];

        let mut iter = data.iter().report_to(listener.token());
        assert_eq!(iter.by_ref().count(), 4);
        assert_eq!(iter.position(), 4);
        assert!(iter.next().is_none());

        // The final item already reports 1.0, so exhaustion is a duplicate and is dropped.
        assert_eq!(*seen.lock(), vec![0.25, 0.5, 0.75, 1.0]);
        let _ = listener.dispose();
    }

    /// Unknown Size
    /// Verifies an iterator without an exact size only reports on exhaustion.
    #[test]
    fn test_unknown_size() {
        let (listener, seen) = recording();

        let evens = (0..10).filter(|n| n % 2 == 0).report_to(listener.token());
        assert_eq!(evens.count(), 5);

        assert_eq!(*seen.lock(), vec![1.0]);
        let _ = listener.dispose();
    }

    /// Explicit Total
    /// Verifies an explicit total inside a sliced token.
    #[test]
    fn test_explicit_total() {
        let (listener, seen) = recording();
        let stage = listener.token().slice(0.0, 0.5).unwrap();

        let lines = "a\nb".lines().report_to_with_total(stage, 2);
        assert_eq!(lines.count(), 2);

        assert_eq!(*seen.lock(), vec![0.25, 0.5]);
        let _ = listener.dispose();
    }
}
