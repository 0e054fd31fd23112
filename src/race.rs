//! Maximum-value racing: progress of "whichever finishes first".
//!
//! A racer forwards a report upstream only when it strictly exceeds every value seen so
//! far. Ties and decreases are dropped, so the upstream sequence is increasing and ends at
//! the maximum of everything reported.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

use crate::{
    error::ProgressError,
    node::{self, ChainKind, ChainNode, Step},
    pool::{self, Disposal},
    token::{ProgressToken, Target},
};

pub(crate) struct RaceState {
    upstream: ProgressToken,
    current_max: f64,
}

impl RaceState {
    pub(crate) fn offer(&mut self, value: f64) -> Step {
        if value <= self.current_max {
            return Step::Halt;
        }
        self.current_max = value;

        Step::Forward {
            target: self.upstream.target.clone(),
            epoch: self.upstream.epoch,
            value: self.upstream.range.lerp(value),
        }
    }
}

/// Reports the maximum progress of several competing sources into one upstream token.
///
/// All tokens created by one builder point at the same racer node. Dropping the builder
/// disposes it.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
///
/// use progress_flow::{ProgressListener, RaceBuilder};
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = seen.clone();
/// let listener = ProgressListener::new(move |v| sink.lock().unwrap().push(v));
///
/// let race = RaceBuilder::new(listener.token());
/// let mirror_a = race.new_token().unwrap();
/// let mirror_b = race.new_token().unwrap();
///
/// mirror_a.report(0.4);
/// mirror_b.report(0.2); // behind, dropped
/// mirror_b.report(0.6);
/// assert_eq!(*seen.lock().unwrap(), vec![0.4, 0.6]);
/// # let _ = race.dispose();
/// # let _ = listener.dispose();
/// ```
pub struct RaceBuilder {
    cell: Arc<Mutex<ChainNode>>,
    epoch: u32,
    disposed: AtomicBool,
}

impl RaceBuilder {
    /// Creates a racer reporting into `upstream`.
    #[must_use]
    pub fn new(upstream: ProgressToken) -> Self {
        let (cell, epoch) = node::acquire(ChainKind::Race(RaceState {
            upstream,
            current_max: f64::NEG_INFINITY,
        }));
        Self {
            cell,
            epoch,
            disposed: AtomicBool::new(false),
        }
    }

    /// Returns a token reporting into the racer.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError::ObjectDisposed`] if the builder was disposed.
    pub fn new_token(&self) -> Result<ProgressToken, ProgressError> {
        let target = Target::chain(&self.cell);
        if !node::accepts(&self.cell, self.epoch) {
            return Err(ProgressError::ObjectDisposed("race builder"));
        }
        Ok(ProgressToken::new(target, self.epoch))
    }

    /// The highest value reported so far, or `None` before the first report and after
    /// disposal.
    #[must_use]
    pub fn current_max(&self) -> Option<f64> {
        let node = self.cell.lock();
        match &node.kind {
            ChainKind::Race(race) if node.epoch == self.epoch && race.current_max >= 0.0 => {
                Some(race.current_max)
            }
            _ => None,
        }
    }

    /// Disposes the racer. Repeated calls are no-ops.
    pub fn dispose(&self) -> Disposal {
        self.disposed.store(true, Ordering::Release);
        node::dispose(&self.cell, self.epoch)
    }
}

impl Drop for RaceBuilder {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if node::accepts(&self.cell, self.epoch) {
            pool::leaked("race builder", "");
        }
        let _ = node::dispose(&self.cell, self.epoch);
    }
}
