//! Leaf listeners: where progress leaves the graph and reaches user code.
//!
//! A [`ProgressListener`] owns a pooled chain node holding the user callback. Reports that
//! reach it are filtered before anything runs:
//!
//! * **Stale or canceled:** dropped.
//! * **Unchanged:** a value equal to the last stored one is dropped. The stored value
//!   starts out as NaN, so the very first report (even a bare terminal `1.0`) always
//!   gets through.
//! * **Terminal:** `1.0` is the last value a listener ever admits.
//!
//! Admitted values are delivered inline on the reporting thread, unless the listener was
//! built with an [`ExecutionContext`] the reporter is not running on. Then exactly one
//! deferred callback is scheduled and any reports arriving before it runs are coalesced
//! into the latest value.
//!
//! The callback never runs while the node's lock is held, and never on two threads at
//! once. A value admitted while another thread is inside the callback is handed to that
//! thread, which delivers the latest such value before returning, so deliveries follow
//! admission order and the terminal `1.0` is always delivered last.

use std::{
    mem,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use compact_str::CompactString;
use parking_lot::Mutex;
use web_time::Instant;

use crate::{
    builder::ListenerBuilder,
    context::ExecutionContext,
    node::{self, ChainKind, ChainNode, Step},
    pool::{self, Disposal},
    token::{ProgressToken, Target},
};

pub(crate) type Callback = Arc<dyn Fn(f64) + Send + Sync>;

/// Listener state stored in its chain node.
pub(crate) struct ListenerState {
    callback: Callback,
    context: Option<Arc<dyn ExecutionContext>>,
    value: f64,
    reports: u64,
    scheduled: bool,
    /// A thread is running the callback inline.
    delivering: bool,
    /// `value` was admitted while `delivering` and is still owed to the callback.
    owed: bool,
    canceled: bool,
    finished: bool,
}

impl ListenerState {
    pub(crate) fn new(callback: Callback, context: Option<Arc<dyn ExecutionContext>>) -> Self {
        Self {
            callback,
            context,
            value: f64::NAN,
            reports: 0,
            scheduled: false,
            delivering: false,
            owed: false,
            canceled: false,
            finished: false,
        }
    }

    #[allow(clippy::float_cmp)]
    pub(crate) fn admit(&mut self, value: f64) -> Step {
        if self.canceled || self.finished || value == self.value {
            return Step::Halt;
        }
        self.value = value;
        self.reports += 1;
        self.finished = value >= 1.0;

        match &self.context {
            Some(context) if !context.is_current() => {
                if self.scheduled {
                    // The pending callback will pick up the new value.
                    Step::Halt
                } else {
                    self.scheduled = true;
                    Step::Schedule(context.clone())
                }
            }
            _ if self.delivering => {
                // The delivering thread picks up the latest value when its callback returns.
                self.owed = true;
                Step::Halt
            }
            _ => {
                self.delivering = true;
                Step::Deliver {
                    callback: self.callback.clone(),
                    value,
                }
            }
        }
    }

    /// Called by the delivering thread after each inline callback. Returns the value
    /// admitted in the meantime, or ends the delivery.
    pub(crate) fn next_inline(&mut self) -> Option<(Callback, f64)> {
        if mem::take(&mut self.owed) && !self.canceled {
            return Some((self.callback.clone(), self.value));
        }
        self.delivering = false;
        None
    }

    /// Ends an inline delivery whose callback unwound.
    pub(crate) fn abandon_delivery(&mut self) {
        self.delivering = false;
        self.owed = false;
    }

    /// Clears the scheduled flag, returning what the deferred callback should deliver.
    pub(crate) fn take_scheduled(&mut self) -> Option<(Callback, f64)> {
        if !mem::take(&mut self.scheduled) || self.canceled {
            return None;
        }
        Some((self.callback.clone(), self.value))
    }

    pub(crate) const fn is_scheduled(&self) -> bool {
        self.scheduled
    }
}

/// The terminal consumer of progress reports.
///
/// Dropping a listener disposes it. Prefer calling [`dispose`](Self::dispose) explicitly;
/// debug builds log a warning for listeners that are dropped while still live.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
///
/// use progress_flow::ProgressListener;
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = seen.clone();
/// let listener = ProgressListener::new(move |v| sink.lock().unwrap().push(v));
///
/// let token = listener.token();
/// token.report(0.25);
/// token.report(0.25); // unchanged, dropped
/// listener.complete();
/// token.report(0.5); // after the terminal 1.0, dropped
///
/// assert_eq!(*seen.lock().unwrap(), vec![0.25, 1.0]);
/// # let _ = listener.dispose();
/// ```
pub struct ProgressListener {
    pub(crate) cell: Arc<Mutex<ChainNode>>,
    pub(crate) epoch: u32,
    pub(crate) name: CompactString,
    pub(crate) start: Option<Instant>,
    pub(crate) disposed: AtomicBool,
}

impl ProgressListener {
    /// Creates a listener invoking `callback` inline for every admitted value.
    pub fn new(callback: impl Fn(f64) + Send + Sync + 'static) -> Self {
        ListenerBuilder::new(callback).build()
    }

    /// Starts building a listener with a name, execution context or start time.
    pub fn builder(callback: impl Fn(f64) + Send + Sync + 'static) -> ListenerBuilder {
        ListenerBuilder::new(callback)
    }

    pub(crate) fn from_parts(
        state: ListenerState,
        name: CompactString,
        start: Option<Instant>,
    ) -> Self {
        let (cell, epoch) = node::acquire(ChainKind::Listener(state));
        Self {
            cell,
            epoch,
            name,
            start,
            disposed: AtomicBool::new(false),
        }
    }

    /// The label given at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A token reporting into this listener over the full `[0, 1]` range, or a detached
    /// token once the listener was disposed.
    #[must_use]
    pub fn token(&self) -> ProgressToken {
        // Downgrade before the epoch check: a node with live weak pointers is never pooled.
        let target = Target::chain(&self.cell);
        if node::accepts(&self.cell, self.epoch) {
            ProgressToken::new(target, self.epoch)
        } else {
            ProgressToken::detached()
        }
    }

    /// Reports the terminal `1.0`. Delivered exactly once, even if nothing was reported
    /// before.
    pub fn complete(&self) {
        self.token().report(1.0);
    }

    /// Stops all further deliveries without a final report.
    pub fn cancel(&self) {
        let mut node = self.cell.lock();
        if node.epoch != self.epoch {
            return;
        }
        if let ChainKind::Listener(state) = &mut node.kind {
            state.canceled = true;
        }
    }

    /// Returns `true` once the listener was disposed (directly or through a token).
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        !node::accepts(&self.cell, self.epoch)
    }

    /// The last admitted value, if any.
    #[must_use]
    pub fn value(&self) -> Option<f64> {
        self.snapshot().value
    }

    /// Duration since the configured start time, if one was set.
    #[must_use]
    pub fn get_elapsed(&self) -> Option<Duration> {
        self.start.map(|start| start.elapsed())
    }

    /// Creates a plain-data snapshot of the listener.
    #[must_use]
    pub fn snapshot(&self) -> ListenerSnapshot {
        self.into()
    }

    /// Disposes the listener. Reports through its tokens become no-ops immediately.
    ///
    /// If a deferred callback is still queued on the execution context, the node is
    /// recycled once it has drained and the returned [`Disposal`] completes then.
    /// Repeated calls return a completed [`Disposal`].
    pub fn dispose(&self) -> Disposal {
        self.disposed.store(true, Ordering::Release);
        node::dispose(&self.cell, self.epoch)
    }
}

impl Drop for ProgressListener {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.is_disposed() {
            pool::leaked("listener", &self.name);
        }
        let _ = node::dispose(&self.cell, self.epoch);
    }
}

/// A plain-data view of a [`ProgressListener`] at one instant.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ListenerSnapshot {
    name: CompactString,
    value: Option<f64>,
    reports: u64,
    canceled: bool,
    disposed: bool,
    elapsed: Option<Duration>,
}

impl From<&ProgressListener> for ListenerSnapshot {
    fn from(listener: &ProgressListener) -> Self {
        let node = listener.cell.lock();
        let state = match &node.kind {
            ChainKind::Listener(state) if node.epoch == listener.epoch => Some(state),
            _ => None,
        };

        Self {
            name: listener.name.clone(),
            value: state.map(|s| s.value).filter(|v| !v.is_nan()),
            reports: state.map_or(0, |s| s.reports),
            canceled: state.is_some_and(|s| s.canceled),
            disposed: state.is_none(),
            elapsed: listener.get_elapsed(),
        }
    }
}

impl ListenerSnapshot {
    /// The listener's label.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last admitted value, `None` before the first report or after disposal.
    #[must_use]
    pub const fn value(&self) -> Option<f64> {
        self.value
    }

    /// Number of reports admitted (delivered or coalesced).
    #[must_use]
    pub const fn reports(&self) -> u64 {
        self.reports
    }

    /// Returns whether the listener was canceled.
    #[must_use]
    pub const fn canceled(&self) -> bool {
        self.canceled
    }

    /// Returns whether the listener was disposed.
    #[must_use]
    pub const fn disposed(&self) -> bool {
        self.disposed
    }

    /// Time since the listener's start time, if one was set.
    #[must_use]
    pub const fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    /// Returns `true` once the terminal `1.0` was admitted.
    #[allow(clippy::float_cmp)]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.value == Some(1.0)
    }
}
