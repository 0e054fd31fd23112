//! Node recycling and the epoch discipline shared by every node kind.
//!
//! Every node that owns mutable, concurrently-reported-to state lives behind an [`Arc`]
//! and carries an *epoch*: a small counter bumped each time the node is logically
//! disposed. Tokens capture the epoch they were issued for, so a token that outlives its
//! node can still reach the disposed allocation through its [`Weak`] pointer,
//! but every operation compares epochs under the node's lock first and turns into a
//! no-op on mismatch.
//!
//! A [`NodePool`] keeps a bounded stack of disposed nodes so that steady-state graph
//! construction does not allocate. Only nodes that nothing can reach any more are
//! retained. A disposed node some stale token still points at is freed with its last
//! handle instead.
//!
//! # Deferred Return
//!
//! Disposal bumps the epoch immediately, but a report that was already admitted (a
//! scheduled listener callback, a broadcast that is still fanning out) may still be
//! touching the node. In that case the pool return is deferred to whoever drains last,
//! and the caller receives a pending [`Disposal`].
//!
//! [`Weak`]: std::sync::Weak

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};

use futures::channel::oneshot;
use parking_lot::{Mutex, const_mutex};

use crate::{multi::MultiHandler, node::ChainNode};

/// Default number of idle nodes each pool retains.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Idle chain nodes (listeners, merge roots and edges, racers).
pub(crate) static CHAIN_NODES: NodePool<Mutex<ChainNode>> = NodePool::new(DEFAULT_POOL_CAPACITY);

/// Idle broadcast nodes.
pub(crate) static BROADCAST_NODES: NodePool<MultiHandler> = NodePool::new(DEFAULT_POOL_CAPACITY);

/// A bounded stack of recycled nodes of one kind.
pub struct NodePool<N> {
    idle: Mutex<Vec<Arc<N>>>,
    capacity: AtomicUsize,
}

impl<N> NodePool<N> {
    /// Creates an empty pool retaining at most `capacity` idle nodes.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            idle: const_mutex(Vec::new()),
            capacity: AtomicUsize::new(capacity),
        }
    }

    /// Takes an idle node, or `None` when the pool is empty.
    pub fn try_take(&self) -> Option<Arc<N>> {
        self.idle.lock().pop()
    }

    /// Returns a disposed node to the pool. Dropped instead when the pool is full, or when
    /// a [`Weak`](std::sync::Weak) pointer to it is still out there.
    ///
    /// A node only re-enters circulation once nothing can reach it, so every edge into a
    /// recycled node is created after the node's own upstream edges. Walks therefore lock
    /// nodes from younger to older and two chains can never wait on each other.
    pub fn repool(&self, node: Arc<N>) {
        if Arc::weak_count(&node) > 0 {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity.load(Ordering::Relaxed) {
            idle.push(node);
        }
    }

    /// How many times `node` sits in the idle stack.
    #[cfg(test)]
    pub(crate) fn occurrences(&self, node: &Arc<N>) -> usize {
        self.idle
            .lock()
            .iter()
            .filter(|idle| Arc::ptr_eq(idle, node))
            .count()
    }

    /// Number of idle nodes currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.idle.lock().len()
    }

    /// Returns `true` if no idle node is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.idle.lock().is_empty()
    }

    /// Maximum number of idle nodes retained.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Changes the capacity, releasing idle nodes above it.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
        let surplus = {
            let mut idle = self.idle.lock();
            let keep = idle.len().min(capacity);
            idle.split_off(keep)
        };
        // Released outside the lock; dropping a node may drop user state.
        drop(surplus);
    }
}

/// Capacities of the global node pools.
///
/// # Examples
///
/// ```
/// use progress_flow::pool::PoolConfig;
///
/// PoolConfig::default().with_chain_capacity(1024).apply();
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolConfig {
    chain_capacity: usize,
    broadcast_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chain_capacity: DEFAULT_POOL_CAPACITY,
            broadcast_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl PoolConfig {
    /// Sets how many idle listener/merger/racer nodes are retained.
    #[must_use]
    pub const fn with_chain_capacity(mut self, capacity: usize) -> Self {
        self.chain_capacity = capacity;
        self
    }

    /// Sets how many idle broadcast nodes are retained.
    #[must_use]
    pub const fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Applies the capacities to the global pools.
    pub fn apply(self) {
        CHAIN_NODES.set_capacity(self.chain_capacity);
        BROADCAST_NODES.set_capacity(self.broadcast_capacity);
    }
}

/// Idle node counts of the global pools.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    /// Idle listener/merger/racer nodes.
    pub chain_idle: usize,
    /// Idle broadcast nodes.
    pub broadcast_idle: usize,
}

/// Returns the current idle counts of the global pools.
#[must_use]
pub fn stats() -> PoolStats {
    PoolStats {
        chain_idle: CHAIN_NODES.len(),
        broadcast_idle: BROADCAST_NODES.len(),
    }
}

/// Completion of a dispose call.
///
/// Already complete when the node could be recycled immediately (or was already
/// disposed); otherwise completes once the in-flight report holding the node drains.
/// Awaiting it is optional: the node is recycled either way.
#[must_use = "a pending disposal only completes once awaited or polled"]
#[derive(Debug)]
pub struct Disposal {
    drained: Option<oneshot::Receiver<()>>,
}

impl Disposal {
    pub(crate) const fn completed() -> Self {
        Self { drained: None }
    }

    /// Creates a pending disposal and the sender the draining party completes it with.
    pub(crate) fn deferred() -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { drained: Some(rx) }, tx)
    }

    /// Returns `true` if the disposal has nothing left to wait for.
    #[must_use]
    pub fn is_completed(&mut self) -> bool {
        match &mut self.drained {
            None => true,
            Some(rx) => {
                // A dropped sender also means nothing is left holding the node.
                if matches!(rx.try_recv(), Ok(Some(())) | Err(_)) {
                    self.drained = None;
                    true
                } else {
                    false
                }
            }
        }
    }
}

impl Future for Disposal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.drained {
            None => Poll::Ready(()),
            Some(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(_) => {
                    self.drained = None;
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Reports a handle dropped without an explicit dispose.
///
/// Advisory only: the handle disposes itself on drop either way.
pub(crate) fn leaked(kind: &'static str, name: &str) {
    if cfg!(debug_assertions) {
        tracing::warn!(kind, name, "progress handle dropped without dispose");
    }
}
