//! Chain nodes and the iterative report walk.
//!
//! Listeners, mergers (root and per-child edge) and racers share one node type: a
//! [`ChainNode`] behind a `parking_lot` mutex, tagged with the kind-specific state in
//! [`ChainKind`]. A report entering the graph is walked upward node by node:
//!
//! 1. lock the next node (while still holding the current one),
//! 2. release the current node,
//! 3. compare epochs; a mismatch ends the walk silently,
//! 4. let the node fold the value and name its own upstream target,
//! 5. repeat until a node halts, delivers, or hands off to a broadcast.
//!
//! The hand-off in steps 1-2 keeps two reports from one reporter in order across the whole
//! chain, and the loop keeps stack usage constant however deep the composition is.
//! Broadcast nodes fan out to many edges and are entered through
//! [`MultiHandler::broadcast`](crate::multi::MultiHandler) instead.

use std::{mem, sync::Arc};

use futures::channel::oneshot;
use parking_lot::Mutex;

use crate::{
    context::ExecutionContext,
    listener::{Callback, ListenerState},
    merge::{MergeEdge, MergeRoot},
    pool::{CHAIN_NODES, Disposal},
    race::RaceState,
    token::Target,
};

/// A pooled graph node that forwards to at most one upstream target.
pub(crate) struct ChainNode {
    pub(crate) epoch: u32,
    pub(crate) kind: ChainKind,
    /// Completes a deferred disposal once the pending scheduled callback has drained.
    drain: Option<oneshot::Sender<()>>,
}

pub(crate) enum ChainKind {
    /// Idle in the pool, or disposed.
    Vacant,
    Listener(ListenerState),
    MergeRoot(MergeRoot),
    MergeEdge(MergeEdge),
    Race(RaceState),
}

/// What a node wants done with a report after folding it in.
pub(crate) enum Step {
    /// Drop the report.
    Halt,
    /// Continue the walk at `target`.
    Forward {
        target: Target,
        epoch: u32,
        value: f64,
    },
    /// Run a listener callback inline, after the lock is released.
    Deliver { callback: Callback, value: f64 },
    /// Schedule one deferred listener callback on `context`.
    Schedule(Arc<dyn ExecutionContext>),
}

impl ChainNode {
    const fn vacant() -> Self {
        Self {
            epoch: 0,
            kind: ChainKind::Vacant,
            drain: None,
        }
    }

    fn advance(&mut self, value: f64) -> Step {
        match &mut self.kind {
            ChainKind::Vacant => Step::Halt,
            ChainKind::Listener(listener) => listener.admit(value),
            ChainKind::MergeRoot(root) => root.fold(value),
            ChainKind::MergeEdge(edge) => edge.forward(value),
            ChainKind::Race(race) => race.offer(value),
        }
    }

    /// Invalidates every outstanding token and hands back the kind state, to be dropped
    /// outside the lock.
    pub(crate) fn retire(&mut self) -> ChainKind {
        self.epoch = self.epoch.wrapping_add(1);
        mem::replace(&mut self.kind, ChainKind::Vacant)
    }
}

/// Takes a node from the pool (or allocates one) and initializes it as `kind`.
///
/// Returns the node and the epoch tokens for it must carry.
pub(crate) fn acquire(kind: ChainKind) -> (Arc<Mutex<ChainNode>>, u32) {
    let cell = CHAIN_NODES
        .try_take()
        .unwrap_or_else(|| Arc::new(Mutex::new(ChainNode::vacant())));
    let epoch = {
        let mut node = cell.lock();
        node.kind = kind;
        node.epoch
    };
    (cell, epoch)
}

/// Returns `true` if `cell` still accepts reports tagged with `epoch`.
pub(crate) fn accepts(cell: &Arc<Mutex<ChainNode>>, epoch: u32) -> bool {
    cell.lock().epoch == epoch
}

/// Walks one report up the chain starting at `cell`.
pub(crate) fn walk(cell: Arc<Mutex<ChainNode>>, epoch: u32, value: f64) {
    let mut cell = cell;
    let mut guard = cell.lock_arc();
    let mut epoch = epoch;
    let mut value = value;

    loop {
        if guard.epoch != epoch {
            return;
        }

        match guard.advance(value) {
            Step::Halt => return,
            Step::Deliver { callback, value } => {
                drop(guard);
                deliver_inline(&cell, epoch, callback, value);
                return;
            }
            Step::Schedule(context) => {
                drop(guard);
                let pending = cell.clone();
                context.schedule(Box::new(move || run_deferred(&pending, epoch)));
                return;
            }
            Step::Forward {
                target,
                epoch: next_epoch,
                value: next_value,
            } => match target {
                Target::Detached => return,
                Target::Chain(weak) => {
                    let Some(next) = weak.upgrade() else {
                        return;
                    };
                    // Hand-off: the assignment drops the current guard only after the
                    // next lock is held.
                    guard = next.lock_arc();
                    cell = next;
                    epoch = next_epoch;
                    value = next_value;
                }
                Target::Broadcast(weak) => {
                    let Some(multi) = weak.upgrade() else {
                        return;
                    };
                    let fanout = multi.enter();
                    drop(guard);
                    multi.broadcast(&fanout, next_value, next_epoch);
                    return;
                }
            },
        }
    }
}

/// Runs the callback for a value the listener admitted inline, then any value admitted
/// while it ran, until none is owed.
fn deliver_inline(cell: &Arc<Mutex<ChainNode>>, epoch: u32, callback: Callback, value: f64) {
    let _unwind = DeliveryGuard { cell, epoch };
    let mut next = Some((callback, value));
    while let Some((callback, value)) = next {
        callback(value);
        let mut node = cell.lock();
        let live = node.epoch == epoch;
        next = match &mut node.kind {
            ChainKind::Listener(listener) if live => listener.next_inline(),
            _ => None,
        };
    }
}

/// Releases the listener's delivery slot if its callback panics.
struct DeliveryGuard<'a> {
    cell: &'a Arc<Mutex<ChainNode>>,
    epoch: u32,
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        let mut node = self.cell.lock();
        let live = node.epoch == self.epoch;
        if let ChainKind::Listener(listener) = &mut node.kind {
            if live {
                listener.abandon_delivery();
            }
        }
    }
}

/// Runs a listener callback scheduled by [`walk`], or finishes a disposal that was
/// waiting on it.
fn run_deferred(cell: &Arc<Mutex<ChainNode>>, epoch: u32) {
    let mut node = cell.lock();
    if node.epoch != epoch {
        let drained = node.drain.take();
        drop(node);
        if let Some(drained) = drained {
            CHAIN_NODES.repool(cell.clone());
            let _ = drained.send(());
        }
        return;
    }

    let ChainKind::Listener(listener) = &mut node.kind else {
        return;
    };
    let Some((callback, value)) = listener.take_scheduled() else {
        return;
    };
    drop(node);
    callback(value);
}

/// Disposes the node `cell` as its owner: bumps the epoch, tears down owned children and
/// returns the node to the pool (deferred while a scheduled callback is pending).
pub(crate) fn dispose(cell: &Arc<Mutex<ChainNode>>, epoch: u32) -> Disposal {
    let mut node = cell.lock();
    if node.epoch != epoch {
        return Disposal::completed();
    }

    let pending = matches!(&node.kind, ChainKind::Listener(listener) if listener.is_scheduled());
    let kind = node.retire();
    if pending {
        let (disposal, drained) = Disposal::deferred();
        node.drain = Some(drained);
        drop(node);
        drop(kind);
        return disposal;
    }
    drop(node);

    match kind {
        ChainKind::MergeRoot(root) => root.teardown(),
        other => drop(other),
    }
    CHAIN_NODES.repool(cell.clone());
    Disposal::completed()
}

/// Releases what a token pointing at `cell` owns; see
/// [`ProgressToken::dispose`](crate::ProgressToken::dispose).
pub(crate) fn release_edge(cell: &Arc<Mutex<ChainNode>>, epoch: u32) -> Disposal {
    let mut node = cell.lock();
    if node.epoch != epoch {
        return Disposal::completed();
    }
    if let ChainKind::MergeEdge(edge) = &mut node.kind {
        edge.sever();
        return Disposal::completed();
    }
    let is_listener = matches!(node.kind, ChainKind::Listener(_));
    drop(node);

    if is_listener {
        dispose(cell, epoch)
    } else {
        Disposal::completed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use crate::{MergeBuilder, ProgressListener, RaceBuilder};

    /// Deep Chains
    /// Verifies a report crosses tens of thousands of nested racers without recursion.
    #[test]
    #[allow(clippy::float_cmp)]
    fn test_deep_chain_is_iterative() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = ProgressListener::new(move |v| sink.lock().push(v));

        let mut builders = Vec::new();
        let mut token = listener.token();
        for _ in 0..50_000 {
            let race = RaceBuilder::new(token);
            token = race.new_token().unwrap();
            builders.push(race);
        }

        token.report(0.5);
        token.report(1.0);
        assert_eq!(*seen.lock(), vec![0.5, 1.0]);

        for race in builders.iter().rev() {
            let _ = race.dispose();
        }
        let _ = listener.dispose();
    }

    /// Mixed Chains
    /// Verifies values are remapped at every hop of a merger/racer chain.
    #[test]
    fn test_mixed_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(parking_lot::Mutex::new(0.0));
        let (c, l) = (calls.clone(), last.clone());
        let listener = ProgressListener::new(move |v| {
            c.fetch_add(1, Ordering::SeqCst);
            *l.lock() = v;
        });

        let merge = MergeBuilder::new(listener.token());
        let heavy = merge.new_token(3.0).unwrap();
        let light = merge.new_token(1.0).unwrap();
        let race = RaceBuilder::new(light);
        let racer = race.new_token().unwrap();

        heavy.report(1.0);
        assert!((*last.lock() - 0.75).abs() < 1e-9);

        racer.report(0.5);
        assert!((*last.lock() - 0.875).abs() < 1e-9);

        // Lower than the racer's maximum: dropped before reaching the merger.
        racer.report(0.25);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let _ = race.dispose();
        let _ = merge.dispose();
        let _ = listener.dispose();
    }
}
