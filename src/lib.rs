//! # `progress_flow`
//!
//! Thread-safe progress propagation through composable graphs, plus a single-flight
//! asynchronous lazy value that reports its progress through them.
//!
//! Work reports fractions in `[0, 1]` into a [`ProgressToken`]. Tokens point at nodes that
//! combine and forward those fractions until they reach a [`ProgressListener`]:
//!
//! * **Headless**: listeners receive plain `f64` values through a callback and never
//!   render anything themselves.
//! * **Composable**: a [`MergeBuilder`] combines weighted sub-tasks into one normalized
//!   fraction, a [`RaceBuilder`] forwards the furthest of several competitors, and a
//!   [`ProgressBroadcast`] fans one source out to many observers.
//! * **Deep-chain safe**: chains of mergers and racers are walked iteratively with
//!   hand-over-hand locking, so nesting depth costs no stack.
//! * **Disposable**: every node has an epoch. Disposing it bumps the epoch, which turns
//!   every outstanding token into a silent no-op, and returns the node to a pool.
//!
//! ## Modules
//!
//! * [`builder`]: Fluent interface for constructing [`ProgressListener`] instances.
//! * [`context`]: The [`ExecutionContext`](context::ExecutionContext) seam for delivering
//!   callbacks on a specific thread.
//! * [`error`]: Errors returned by the graph and by [`AsyncLazy`].
//! * [`future`]: Adapters reporting completion of a future.
//! * [`io`]: Wrappers for [`std::io::Read`] and [`std::io::Write`] that report transfer
//!   progress.
//! * [`iter`]: Extension traits for reporting progress from Iterators.
//! * [`lazy`]: The single-flight [`AsyncLazy`] value.
//! * [`listener`]: The terminal [`ProgressListener`] and its snapshots.
//! * [`merge`]: Weighted merging.
//! * [`multi`]: Broadcast fan-out.
//! * [`pool`]: Node pooling and [`Disposal`] handles.
//! * [`race`]: Maximum-value racing.
//! * [`token`]: [`ProgressToken`] and [`ProgressRange`].
//!
//! ## Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//!
//! use progress_flow::{MergeBuilder, ProgressListener};
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//! let listener = ProgressListener::new(move |v| sink.lock().unwrap().push(v));
//!
//! let merge = MergeBuilder::new(listener.token());
//! let download = merge.new_token(3.0).unwrap();
//! let unpack = merge.new_token(1.0).unwrap();
//!
//! download.report(1.0);
//! unpack.report(1.0);
//! assert_eq!(*seen.lock().unwrap(), vec![0.75, 1.0]);
//! # let _ = merge.dispose();
//! # let _ = listener.dispose();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod builder;
pub mod context;
pub mod error;
pub mod future;
pub mod io;
pub mod iter;
pub mod lazy;
pub mod listener;
pub mod merge;
pub mod multi;
mod node;
pub mod pool;
pub mod race;
pub mod token;

pub use builder::ListenerBuilder;
pub use error::{LazyError, ProgressError};
pub use iter::{ProgressIter, ProgressIteratorExt};
pub use lazy::AsyncLazy;
pub use listener::{ListenerSnapshot, ProgressListener};
pub use merge::MergeBuilder;
pub use multi::ProgressBroadcast;
pub use pool::{Disposal, PoolConfig};
pub use race::RaceBuilder;
pub use token::{ProgressRange, ProgressToken};
