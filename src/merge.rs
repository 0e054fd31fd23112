//! Weighted merging of many progress sources into one.
//!
//! A [`MergeBuilder`] owns a merge root node that reports into an upstream token. Each
//! [`new_token`](MergeBuilder::new_token) call adds a weighted edge node in front of the
//! root. Edges remember the last value they saw and send only the *weighted difference*
//! upward, so the root maintains its numerator by a single addition per report:
//!
//! ```text
//! value = numerator / denominator,  denominator = sum(weights)
//! ```
//!
//! The forwarded ratio is quantized to `2^-k` (`k` decimal bits, 16 by default). Without
//! it, a sum of weighted differences would routinely land a few ulps short of `1.0` and
//! listeners would never see completion.
//!
//! # Precision Guard
//!
//! Weights whose ratio exceeds floating-point resolution cannot be merged meaningfully.
//! Adding such a weight (one that leaves the denominator unchanged, or that overflows it)
//! is rejected with [`ProgressError::Arithmetic`] instead of silently miscomputing.
//!
//! # Teardown
//!
//! The root threads its edges into a singly linked list through the edge nodes
//! themselves. Disposing the builder invalidates the root, then walks that list returning
//! each edge to the pool, locking one node at a time.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

use crate::{
    error::ProgressError,
    node::{self, ChainKind, ChainNode, Step},
    pool::{self, CHAIN_NODES, Disposal},
    token::{ProgressToken, Target},
};

/// Default number of binary decimal digits a merger's output is rounded to.
pub const DEFAULT_DECIMAL_BITS: u8 = 16;

/// An edge node and the epoch it was linked under.
type EdgeLink = (Arc<Mutex<ChainNode>>, u32);

pub(crate) struct MergeRoot {
    upstream: ProgressToken,
    numerator: f64,
    denominator: f64,
    scale: f64,
    forwarded: f64,
    head: Option<EdgeLink>,
}

impl MergeRoot {
    #[allow(clippy::float_cmp)]
    pub(crate) fn fold(&mut self, diff: f64) -> Step {
        self.numerator += diff;
        let ratio = (self.numerator / self.denominator).clamp(0.0, 1.0);
        let ratio = (ratio * self.scale).round() / self.scale;
        if ratio == self.forwarded {
            return Step::Halt;
        }
        self.forwarded = ratio;

        Step::Forward {
            target: self.upstream.target.clone(),
            epoch: self.upstream.epoch,
            value: self.upstream.range.lerp(ratio),
        }
    }

    /// Returns every linked edge to the pool. Called after the root itself was retired.
    pub(crate) fn teardown(self) {
        let mut link = self.head;
        while let Some((edge, epoch)) = link {
            let mut node = edge.lock();
            if node.epoch != epoch {
                break;
            }
            let kind = node.retire();
            drop(node);

            link = match kind {
                ChainKind::MergeEdge(merge_edge) => merge_edge.next,
                _ => None,
            };
            CHAIN_NODES.repool(edge);
        }
    }
}

pub(crate) struct MergeEdge {
    parent: Weak<Mutex<ChainNode>>,
    parent_epoch: u32,
    weight: f64,
    last: f64,
    severed: bool,
    next: Option<EdgeLink>,
}

impl MergeEdge {
    #[allow(clippy::float_cmp)]
    pub(crate) fn forward(&mut self, value: f64) -> Step {
        if self.severed || value == self.last {
            return Step::Halt;
        }
        let diff = (value - self.last) * self.weight;
        self.last = value;

        Step::Forward {
            target: Target::Chain(self.parent.clone()),
            epoch: self.parent_epoch,
            value: diff,
        }
    }

    /// Stops forwarding. The contribution reported so far stays in the merger.
    pub(crate) const fn sever(&mut self) {
        self.severed = true;
    }
}

/// Combines weighted progress sources into one upstream token.
///
/// Dropping the builder disposes it, along with every edge it created.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
///
/// use progress_flow::{MergeBuilder, ProgressListener};
///
/// let last = Arc::new(Mutex::new(0.0));
/// let sink = last.clone();
/// let listener = ProgressListener::new(move |v| *sink.lock().unwrap() = v);
///
/// let merge = MergeBuilder::new(listener.token());
/// let download = merge.new_token(3.0).unwrap();
/// let unpack = merge.new_token(1.0).unwrap();
///
/// download.report(1.0);
/// assert_eq!(*last.lock().unwrap(), 0.75);
/// unpack.report(1.0);
/// assert_eq!(*last.lock().unwrap(), 1.0);
/// # let _ = merge.dispose();
/// # let _ = listener.dispose();
/// ```
pub struct MergeBuilder {
    cell: Arc<Mutex<ChainNode>>,
    epoch: u32,
    disposed: AtomicBool,
}

impl MergeBuilder {
    /// Creates a merger reporting into `upstream`.
    #[must_use]
    pub fn new(upstream: ProgressToken) -> Self {
        Self::create(upstream, DEFAULT_DECIMAL_BITS)
    }

    /// Creates a merger whose output is rounded to `2^-bits`.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError::Argument`] unless `1 <= bits <= 52`.
    pub fn with_decimal_bits(upstream: ProgressToken, bits: u8) -> Result<Self, ProgressError> {
        if !(1..=52).contains(&bits) {
            return Err(ProgressError::Argument(
                "decimal bits must be between 1 and 52",
            ));
        }
        Ok(Self::create(upstream, bits))
    }

    fn create(upstream: ProgressToken, bits: u8) -> Self {
        let root = MergeRoot {
            upstream,
            numerator: 0.0,
            denominator: 0.0,
            scale: f64::from(bits).exp2(),
            forwarded: f64::NAN,
            head: None,
        };
        let (cell, epoch) = node::acquire(ChainKind::MergeRoot(root));
        Self {
            cell,
            epoch,
            disposed: AtomicBool::new(false),
        }
    }

    /// Adds a source contributing `weight` to the merged value.
    ///
    /// # Errors
    ///
    /// * [`ProgressError::ObjectDisposed`] if the builder was disposed.
    /// * [`ProgressError::Arithmetic`] if `weight` is not a positive finite number, is too
    ///   small to change the accumulated denominator, or overflows it.
    pub fn new_token(&self, weight: f64) -> Result<ProgressToken, ProgressError> {
        let mut node = self.cell.lock();
        if node.epoch != self.epoch {
            return Err(ProgressError::ObjectDisposed("merge builder"));
        }
        let ChainKind::MergeRoot(root) = &mut node.kind else {
            return Err(ProgressError::ObjectDisposed("merge builder"));
        };

        let denominator = root.denominator + weight;
        #[allow(clippy::float_cmp)]
        let representable =
            weight > 0.0 && denominator != root.denominator && denominator.is_finite();
        if !representable {
            tracing::debug!(
                weight,
                denominator = root.denominator,
                "rejected merge weight"
            );
            return Err(ProgressError::Arithmetic {
                weight,
                denominator: root.denominator,
            });
        }
        root.denominator = denominator;

        // A fresh node: no live token can be holding its lock on the way up, so locking
        // it under the root's lock cannot invert the lock order.
        let (edge, edge_epoch) = node::acquire(ChainKind::MergeEdge(MergeEdge {
            parent: Arc::downgrade(&self.cell),
            parent_epoch: self.epoch,
            weight,
            last: 0.0,
            severed: false,
            next: root.head.take(),
        }));
        let token = ProgressToken::new(Target::chain(&edge), edge_epoch);
        root.head = Some((edge, edge_epoch));
        Ok(token)
    }

    /// Sum of all weights added so far, or `None` once disposed.
    #[must_use]
    pub fn total_weight(&self) -> Option<f64> {
        let node = self.cell.lock();
        match &node.kind {
            ChainKind::MergeRoot(root) if node.epoch == self.epoch => Some(root.denominator),
            _ => None,
        }
    }

    /// Disposes the merger and all of its edges. Repeated calls are no-ops.
    pub fn dispose(&self) -> Disposal {
        self.disposed.store(true, Ordering::Release);
        node::dispose(&self.cell, self.epoch)
    }
}

impl Drop for MergeBuilder {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if node::accepts(&self.cell, self.epoch) {
            pool::leaked("merge builder", "");
        }
        let _ = node::dispose(&self.cell, self.epoch);
    }
}
