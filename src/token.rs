//! Progress tokens: the edges of the progress graph.
//!
//! A [`ProgressToken`] is a plain value `{ target, epoch, range }`. It owns nothing: the
//! target is held weakly, and the token is only *live* while its captured epoch still
//! matches the target's. Reporting through a dead token is a silent no-op.
//!
//! The token's [`ProgressRange`] is the slice of the target's `[0, 1]` scale this edge
//! owns. A raw report `t` is delivered as `min + (max - min) * t`, so a sequence of stages
//! can share one target by each taking a slice of it.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::{
    error::ProgressError,
    multi::MultiHandler,
    node::{self, ChainNode},
    pool::Disposal,
};

/// The `[min, max]` sub-range of a target that one edge reports into.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProgressRange {
    min: f64,
    max: f64,
}

impl Default for ProgressRange {
    fn default() -> Self {
        Self::FULL
    }
}

impl ProgressRange {
    /// The whole `[0, 1]` range.
    pub const FULL: Self = Self { min: 0.0, max: 1.0 };

    /// Creates a range, requiring `0 <= min <= max <= 1`.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError::Argument`] if the bounds are out of order, outside
    /// `[0, 1]`, or NaN.
    pub fn new(min: f64, max: f64) -> Result<Self, ProgressError> {
        if (0.0..=1.0).contains(&min) && (0.0..=1.0).contains(&max) && min <= max {
            Ok(Self { min, max })
        } else {
            Err(ProgressError::Argument(
                "progress range bounds must satisfy 0 <= min <= max <= 1",
            ))
        }
    }

    /// Lower bound.
    #[must_use]
    pub const fn min(&self) -> f64 {
        self.min
    }

    /// Upper bound.
    #[must_use]
    pub const fn max(&self) -> f64 {
        self.max
    }

    /// Maps `t` in `[0, 1]` into this range. `0` maps to `min` and `1` to `max` exactly.
    #[must_use]
    pub fn lerp(&self, t: f64) -> f64 {
        if t >= 1.0 {
            self.max
        } else if t <= 0.0 {
            self.min
        } else {
            (self.max - self.min).mul_add(t, self.min).min(self.max)
        }
    }

    /// The sub-range `[lerp(min), lerp(max)]` of this range.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ProgressRange::new`].
    pub fn slice(&self, min: f64, max: f64) -> Result<Self, ProgressError> {
        let inner = Self::new(min, max)?;
        Ok(Self {
            min: self.lerp(inner.min),
            max: self.lerp(inner.max),
        })
    }
}

/// What a token points at.
#[derive(Clone, Default)]
pub(crate) enum Target {
    /// Reports go nowhere.
    #[default]
    Detached,
    /// A listener, merger, merge edge or racer.
    Chain(Weak<Mutex<ChainNode>>),
    /// A broadcast node.
    Broadcast(Weak<MultiHandler>),
}

impl Target {
    pub(crate) fn chain(cell: &Arc<Mutex<ChainNode>>) -> Self {
        Self::Chain(Arc::downgrade(cell))
    }

    /// Delivers an already-remapped value to the target.
    pub(crate) fn deliver(&self, value: f64, epoch: u32) {
        match self {
            Self::Detached => {}
            Self::Chain(weak) => {
                if let Some(cell) = weak.upgrade() {
                    node::walk(cell, epoch, value);
                }
            }
            Self::Broadcast(weak) => {
                if let Some(multi) = weak.upgrade() {
                    multi.report(value, epoch);
                }
            }
        }
    }
}

/// A handle for reporting `[0, 1]` progress into the graph.
///
/// Tokens are cheap to clone and never keep their target alive. Obtain them from a
/// [`ProgressListener`](crate::ProgressListener), a [`MergeBuilder`](crate::MergeBuilder),
/// a [`RaceBuilder`](crate::RaceBuilder) or a [`ProgressBroadcast`](crate::ProgressBroadcast).
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
/// // The second stage owns the upper half of the listener's scale.
/// let stage = listener.token().slice(0.5, 1.0).unwrap();
/// stage.report(0.5);
/// assert_eq!(*seen.lock().unwrap(), vec![0.75]);
/// # let _ = listener.dispose();
/// ```
#[derive(Clone, Default)]
pub struct ProgressToken {
    pub(crate) target: Target,
    pub(crate) epoch: u32,
    pub(crate) range: ProgressRange,
}

impl fmt::Debug for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.target {
            Target::Detached => "detached",
            Target::Chain(_) => "chain",
            Target::Broadcast(_) => "broadcast",
        };
        f.debug_struct("ProgressToken")
            .field("target", &kind)
            .field("epoch", &self.epoch)
            .field("range", &self.range)
            .finish()
    }
}

impl ProgressToken {
    pub(crate) const fn new(target: Target, epoch: u32) -> Self {
        Self {
            target,
            epoch,
            range: ProgressRange::FULL,
        }
    }

    /// A token connected to nothing. Reports through it are discarded.
    #[must_use]
    pub fn detached() -> Self {
        Self::default()
    }

    /// The range this token reports into.
    #[must_use]
    pub const fn range(&self) -> ProgressRange {
        self.range
    }

    /// Returns a token for the same target owning only `[min, max]` of this token's range.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError::Argument`] unless `0 <= min <= max <= 1`.
    pub fn slice(&self, min: f64, max: f64) -> Result<Self, ProgressError> {
        Ok(Self {
            target: self.target.clone(),
            epoch: self.epoch,
            range: self.range.slice(min, max)?,
        })
    }

    /// Reports `value` (clamped to `[0, 1]`, NaN ignored) through this edge.
    pub fn report(&self, value: f64) {
        if value.is_nan() {
            return;
        }
        let raw = value.clamp(0.0, 1.0);
        self.target.deliver(self.range.lerp(raw), self.epoch);
    }

    /// Returns `true` while the target still accepts reports from this token.
    #[must_use]
    pub fn is_live(&self) -> bool {
        match &self.target {
            Target::Detached => false,
            Target::Chain(weak) => weak
                .upgrade()
                .is_some_and(|cell| node::accepts(&cell, self.epoch)),
            Target::Broadcast(weak) => weak
                .upgrade()
                .is_some_and(|multi| multi.epoch() == self.epoch),
        }
    }

    /// Releases the edge this token owns.
    ///
    /// A listener token disposes the listener; a merge token stops contributing further
    /// reports to its merger. Racer and broadcast tokens own no edge and return at once.
    /// Repeated calls are no-ops returning a completed [`Disposal`].
    pub fn dispose(&self) -> Disposal {
        match &self.target {
            Target::Chain(weak) => weak
                .upgrade()
                .map_or_else(Disposal::completed, |cell| node::release_edge(&cell, self.epoch)),
            Target::Detached | Target::Broadcast(_) => Disposal::completed(),
        }
    }
}
