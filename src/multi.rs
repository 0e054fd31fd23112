//! Broadcasting one progress source to a changing set of observers.
//!
//! A broadcast node keeps its downstream tokens in two lists, `current` and
//! `still_valid`. A broadcast drains `current`, delivers to every token that is still live
//! (remapped through that token's own range), pushes survivors onto `still_valid`, and then
//! swaps the two. Dead observers are pruned as a side effect of reporting, and steady-state
//! broadcasts reuse the same two allocations.
//!
//! # Locking
//!
//! Broadcasts are serialized by a re-entrant fan-out lock held for the whole sweep, since
//! its duration grows with the number of observers and what they do. The edge lists live
//! behind a separate short lock, so observers can be added (or the node disposed) while a
//! sweep is running: additions made during a sweep are kept and receive the next report.
//! A report made from inside an observer re-enters the fan-out lock and is re-broadcast,
//! latest value only, once the running sweep has reached every observer.
//!
//! # Recursion
//!
//! A broadcast edge may itself target another broadcast node, so fan-out is the one place
//! propagation recurses. Broadcast trees are expected to be shallow (a lazy value whose
//! observers are themselves lazy values, rarely deeper); chain nodes never recurse.

use std::{
    mem,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::channel::oneshot;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, const_mutex, const_reentrant_mutex};

use crate::{
    error::ProgressError,
    pool::{self, BROADCAST_NODES, Disposal},
    token::{ProgressToken, Target},
};

/// A pooled broadcast node.
pub(crate) struct MultiHandler {
    fanout: ReentrantMutex<()>,
    edges: Mutex<Edges>,
}

struct Edges {
    epoch: u32,
    current: Vec<ProgressToken>,
    still_valid: Vec<ProgressToken>,
    /// Number of sweeps that have the lists checked out.
    sweeping: u32,
    /// Latest value reported from inside a running sweep, re-broadcast once it ends.
    pending: Option<f64>,
    /// Completes a deferred disposal once the last sweep has returned the lists.
    drain: Option<oneshot::Sender<()>>,
}

impl MultiHandler {
    const fn vacant() -> Self {
        Self {
            fanout: const_reentrant_mutex(()),
            edges: const_mutex(Edges {
                epoch: 0,
                current: Vec::new(),
                still_valid: Vec::new(),
                sweeping: 0,
                pending: None,
                drain: None,
            }),
        }
    }

    fn acquire() -> (Arc<Self>, u32) {
        let node = BROADCAST_NODES
            .try_take()
            .unwrap_or_else(|| Arc::new(Self::vacant()));
        let epoch = node.epoch();
        (node, epoch)
    }

    pub(crate) fn epoch(&self) -> u32 {
        self.edges.lock().epoch
    }

    /// Takes the fan-out lock. Held by the caller across [`broadcast`](Self::broadcast).
    pub(crate) fn enter(&self) -> ReentrantMutexGuard<'_, ()> {
        self.fanout.lock()
    }

    pub(crate) fn add(&self, token: ProgressToken, epoch: u32) -> Result<(), ProgressError> {
        let mut edges = self.edges.lock();
        if edges.epoch != epoch {
            return Err(ProgressError::ObjectDisposed("progress broadcast"));
        }
        edges.current.push(token);
        Ok(())
    }

    pub(crate) fn report(self: &Arc<Self>, value: f64, epoch: u32) {
        let fanout = self.enter();
        self.broadcast(&fanout, value, epoch);
    }

    /// Delivers `value` to every live edge. `_fanout` proves the fan-out lock is held.
    ///
    /// A report arriving while this thread is already sweeping (an observer reporting
    /// back into the broadcast) is parked in `pending`, and the outer sweep repeats with
    /// the latest parked value once every observer has seen the current one.
    pub(crate) fn broadcast(
        self: &Arc<Self>,
        _fanout: &ReentrantMutexGuard<'_, ()>,
        value: f64,
        epoch: u32,
    ) {
        let mut value = value;
        loop {
            let (mut current, mut survivors) = {
                let mut edges = self.edges.lock();
                if edges.epoch != epoch {
                    return;
                }
                if edges.sweeping > 0 {
                    edges.pending = Some(value);
                    return;
                }
                edges.sweeping += 1;
                (
                    mem::take(&mut edges.current),
                    mem::take(&mut edges.still_valid),
                )
            };

            for token in current.drain(..) {
                if token.is_live() {
                    token.report(value);
                    survivors.push(token);
                }
            }

            let mut edges = self.edges.lock();
            edges.sweeping -= 1;
            if edges.epoch != epoch {
                // Disposed mid-sweep; the lists we hold belong to no one now.
                if edges.sweeping == 0 {
                    if let Some(drained) = edges.drain.take() {
                        drop(edges);
                        BROADCAST_NODES.repool(self.clone());
                        let _ = drained.send(());
                    }
                }
                return;
            }
            survivors.append(&mut edges.current);
            edges.current = survivors;
            edges.still_valid = current;

            match edges.pending.take() {
                Some(next) => value = next,
                None => return,
            }
        }
    }

    pub(crate) fn dispose(self: &Arc<Self>, epoch: u32) -> Disposal {
        let mut edges = self.edges.lock();
        if edges.epoch != epoch {
            return Disposal::completed();
        }
        edges.epoch = edges.epoch.wrapping_add(1);
        let current = mem::take(&mut edges.current);
        edges.still_valid.clear();
        edges.pending = None;

        if edges.sweeping > 0 {
            let (disposal, drained) = Disposal::deferred();
            edges.drain = Some(drained);
            drop(edges);
            drop(current);
            return disposal;
        }
        drop(edges);
        drop(current);
        BROADCAST_NODES.repool(self.clone());
        Disposal::completed()
    }

    fn len(&self, epoch: u32) -> usize {
        let edges = self.edges.lock();
        if edges.epoch == epoch {
            edges.current.len()
        } else {
            0
        }
    }
}

/// Fans one progress source out to any number of observer tokens.
///
/// Observers whose targets were disposed are pruned on the next report. Dropping the
/// broadcast disposes it.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
///
/// use progress_flow::{ProgressBroadcast, ProgressListener};
///
/// let a = Arc::new(Mutex::new(0.0));
/// let b = Arc::new(Mutex::new(0.0));
/// let (sink_a, sink_b) = (a.clone(), b.clone());
/// let left = ProgressListener::new(move |v| *sink_a.lock().unwrap() = v);
/// let right = ProgressListener::new(move |v| *sink_b.lock().unwrap() = v);
///
/// let broadcast = ProgressBroadcast::new();
/// broadcast.add(left.token()).unwrap();
/// broadcast.add(right.token().slice(0.0, 0.5).unwrap()).unwrap();
///
/// broadcast.token().report(0.5);
/// assert_eq!(*a.lock().unwrap(), 0.5);
/// assert_eq!(*b.lock().unwrap(), 0.25);
/// # let _ = broadcast.dispose();
/// # let _ = left.dispose();
/// # let _ = right.dispose();
/// ```
pub struct ProgressBroadcast {
    node: Arc<MultiHandler>,
    epoch: u32,
    disposed: AtomicBool,
}

impl Default for ProgressBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroadcast {
    /// Takes a broadcast node from the pool.
    #[must_use]
    pub fn new() -> Self {
        let (node, epoch) = MultiHandler::acquire();
        Self {
            node,
            epoch,
            disposed: AtomicBool::new(false),
        }
    }

    /// A token whose reports are broadcast to every observer, or a detached token once the
    /// broadcast was disposed.
    #[must_use]
    pub fn token(&self) -> ProgressToken {
        let target = Target::Broadcast(Arc::downgrade(&self.node));
        if self.node.epoch() == self.epoch {
            ProgressToken::new(target, self.epoch)
        } else {
            ProgressToken::detached()
        }
    }

    /// Adds an observer.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError::ObjectDisposed`] if the broadcast was disposed.
    pub fn add(&self, token: ProgressToken) -> Result<(), ProgressError> {
        self.node.add(token, self.epoch)
    }

    /// Broadcasts `value` (clamped to `[0, 1]`, NaN ignored) to all live observers.
    pub fn report(&self, value: f64) {
        if !value.is_nan() {
            self.node.report(value.clamp(0.0, 1.0), self.epoch);
        }
    }

    /// Number of observers retained since the last sweep (including dead ones not yet
    /// pruned).
    #[must_use]
    pub fn len(&self) -> usize {
        self.node.len(self.epoch)
    }

    /// Returns `true` if no observer is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disposes the broadcast. If a sweep is still running on another thread, the node is
    /// recycled when it finishes and the returned [`Disposal`] completes then.
    pub fn dispose(&self) -> Disposal {
        self.disposed.store(true, Ordering::Release);
        self.node.dispose(self.epoch)
    }
}

impl Drop for ProgressBroadcast {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.node.epoch() == self.epoch {
            pool::leaked("progress broadcast", "");
        }
        let _ = self.node.dispose(self.epoch);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use parking_lot::Mutex;

    use super::ProgressBroadcast;
    use crate::{ProgressListener, error::ProgressError, pool::BROADCAST_NODES};

    fn counting() -> (ProgressListener, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let listener = ProgressListener::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (listener, calls)
    }

    /// Pruning
    /// Verifies disposed observers miss the broadcast and are dropped from the set.
    #[test]
    fn test_pruning() {
        let broadcast = ProgressBroadcast::new();
        let observers: Vec<_> = (0..6).map(|_| counting()).collect();
        for (listener, _) in &observers {
            broadcast.add(listener.token()).unwrap();
        }

        for (listener, _) in observers.iter().take(2) {
            let _ = listener.dispose();
        }
        broadcast.report(0.5);
        assert_eq!(broadcast.len(), 4);

        let delivered: Vec<_> = observers
            .iter()
            .map(|(_, calls)| calls.load(Ordering::SeqCst))
            .collect();
        assert_eq!(delivered, vec![0, 0, 1, 1, 1, 1]);

        broadcast.report(0.75);
        assert_eq!(broadcast.len(), 4);
        assert_eq!(observers[0].1.load(Ordering::SeqCst), 0);
        assert_eq!(observers[5].1.load(Ordering::SeqCst), 2);

        let _ = broadcast.dispose();
        for (listener, _) in &observers {
            let _ = listener.dispose();
        }
    }

    /// Re-Entrant Additions
    /// Verifies an observer added from inside a callback is kept for the next report.
    #[test]
    fn test_add_during_broadcast() {
        let broadcast = Arc::new(ProgressBroadcast::new());
        let (late, late_calls) = counting();
        let late_token = Mutex::new(Some(late.token()));

        let b = broadcast.clone();
        let first = ProgressListener::new(move |_| {
            if let Some(token) = late_token.lock().take() {
                b.add(token).unwrap();
            }
        });
        broadcast.add(first.token()).unwrap();

        broadcast.report(0.25);
        assert_eq!(broadcast.len(), 2);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        broadcast.report(0.5);
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);

        let _ = first.dispose();
        let _ = late.dispose();
        let _ = broadcast.dispose();
    }

    /// Nested Broadcasts
    /// Verifies a broadcast can observe another broadcast, remapping at each level.
    #[test]
    fn test_nested_broadcast() {
        let value = Arc::new(Mutex::new(0.0));
        let sink = value.clone();
        let listener = ProgressListener::new(move |v| *sink.lock() = v);

        let inner = ProgressBroadcast::new();
        inner.add(listener.token()).unwrap();
        let outer = ProgressBroadcast::new();
        outer.add(inner.token().slice(0.5, 1.0).unwrap()).unwrap();

        outer.report(0.5);
        assert!((*value.lock() - 0.75).abs() < 1e-12);

        let _ = outer.dispose();
        let _ = inner.dispose();
        let _ = listener.dispose();
    }

    /// Disposal
    /// Verifies a disposed broadcast rejects observers and twice-disposal completes.
    #[test]
    fn test_dispose() {
        let (listener, calls) = counting();
        let broadcast = ProgressBroadcast::new();
        let token = broadcast.token();
        broadcast.add(listener.token()).unwrap();

        let mut disposal = broadcast.dispose();
        assert!(disposal.is_completed());
        let mut again = broadcast.dispose();
        assert!(again.is_completed());

        assert!(matches!(
            broadcast.add(listener.token()),
            Err(ProgressError::ObjectDisposed(_))
        ));
        token.report(1.0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(broadcast.is_empty());
        let _ = listener.dispose();
    }

    /// Reports From Observers
    /// Verifies a report issued by an observer mid-sweep reaches every observer afterwards.
    #[test]
    fn test_report_from_observer() {
        let broadcast = Arc::new(ProgressBroadcast::new());
        let b = broadcast.clone();
        let first = ProgressListener::new(move |v| {
            if v < 0.5 {
                b.report(0.9);
            }
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let second = ProgressListener::new(move |v| sink.lock().push(v));
        broadcast.add(first.token()).unwrap();
        broadcast.add(second.token()).unwrap();

        broadcast.report(0.25);
        assert_eq!(*seen.lock(), vec![0.25, 0.9]);
        assert_eq!(first.value(), Some(0.9));

        let _ = first.dispose();
        let _ = second.dispose();
        let _ = broadcast.dispose();
    }

    /// Disposal Mid-Sweep
    /// Verifies disposing from inside an observer defers recycling until the sweep ends,
    /// and that the node is recycled exactly once.
    #[test]
    fn test_dispose_during_broadcast() {
        let broadcast = Arc::new(ProgressBroadcast::new());
        let slot = Arc::new(Mutex::new(None));
        let (b, s) = (broadcast.clone(), slot.clone());
        let disposer = ProgressListener::new(move |_| {
            let mut disposal = b.dispose();
            assert!(!disposal.is_completed(), "the sweep still holds the node");
            *s.lock() = Some(disposal);
        });
        let (after, after_calls) = counting();
        broadcast.add(disposer.token()).unwrap();
        broadcast.add(after.token()).unwrap();

        broadcast.report(0.5);
        let mut disposal = slot.lock().take().unwrap();
        assert!(disposal.is_completed());
        // The sweep already under way still reached the remaining observer.
        assert_eq!(after_calls.load(Ordering::SeqCst), 1);
        assert!(BROADCAST_NODES.occurrences(&broadcast.node) <= 1);

        let mut again = broadcast.dispose();
        assert!(again.is_completed());
        broadcast.report(0.75);
        assert_eq!(after_calls.load(Ordering::SeqCst), 1);
        assert!(BROADCAST_NODES.occurrences(&broadcast.node) <= 1);

        let _ = disposer.dispose();
        let _ = after.dispose();
    }
}
