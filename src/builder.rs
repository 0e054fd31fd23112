//! Fluent interface for constructing [`ProgressListener`] instances.
//!
//! Simple listeners can be created via [`ProgressListener::new`]; the [`ListenerBuilder`]
//! covers the remaining knobs:
//!
//! * **Execution Context:** deliver callbacks on a specific [`ExecutionContext`] (a UI
//!   thread, an event loop) instead of on whichever thread reported. Reports arriving from
//!   elsewhere are coalesced into one deferred callback.
//! * **Name:** a label carried into snapshots and leak diagnostics.
//! * **Start Time:** enables [`ProgressListener::get_elapsed`], and can be set explicitly
//!   to line up a batch of listeners on one instant.

use std::{fmt, sync::Arc};

use compact_str::CompactString;
use web_time::Instant;

use crate::{
    context::ExecutionContext,
    listener::{Callback, ListenerState, ProgressListener},
};

/// A builder for [`ProgressListener`] instances.
///
/// # Examples
///
/// ```
/// use progress_flow::ListenerBuilder;
///
/// let listener = ListenerBuilder::new(|v| println!("download: {:.0}%", v * 100.0))
///     .with_name("download")
///     .with_start_time_now()
///     .build();
///
/// assert_eq!(listener.name(), "download");
/// assert!(listener.get_elapsed().is_some());
/// # let _ = listener.dispose();
/// ```
pub struct ListenerBuilder {
    name: CompactString,
    callback: Callback,
    context: Option<Arc<dyn ExecutionContext>>,
    start: Option<Instant>,
}

impl fmt::Debug for ListenerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerBuilder")
            .field("name", &self.name)
            .field("has_context", &self.context.is_some())
            .field("start", &self.start)
            .finish_non_exhaustive()
    }
}

impl ListenerBuilder {
    /// Starts building a listener that invokes `callback` with each admitted value.
    pub fn new(callback: impl Fn(f64) + Send + Sync + 'static) -> Self {
        Self {
            name: CompactString::default(),
            callback: Arc::new(callback),
            context: None,
            start: None,
        }
    }

    /// Sets the listener's label.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<CompactString>) -> Self {
        self.name = name.into();
        self
    }

    /// Delivers callbacks on `context`.
    ///
    /// Reports issued while already running on the context are still delivered inline.
    #[must_use]
    pub fn with_context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets the start time explicitly.
    #[must_use]
    pub const fn with_start_time(mut self, start: Instant) -> Self {
        self.start = Some(start);
        self
    }

    /// Sets the start time to `Instant::now()`.
    #[must_use]
    pub fn with_start_time_now(self) -> Self {
        self.with_start_time(Instant::now())
    }

    /// Consumes the builder, taking a node from the pool for the listener.
    #[must_use]
    pub fn build(self) -> ProgressListener {
        ProgressListener::from_parts(
            ListenerState::new(self.callback, self.context),
            self.name,
            self.start,
        )
    }
}
