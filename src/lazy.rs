//! Single-flight asynchronous lazy values.
//!
//! An [`AsyncLazy`] computes its value with an asynchronous factory the first time anyone
//! asks for it, and shares that one computation with everyone who asks while it runs:
//!
//! ```text
//! Idle --value_future--> Started --Ok--> Resolved
//!   ^                       |
//!   +--------Err------------+
//! ```
//!
//! * **Idle:** the first caller starts an attempt. The shared future is created under the
//!   coordination lock, the factory runs only after the lock is released.
//! * **Started:** callers receive a clone of the in-flight shared future. Callers passing a
//!   [`ProgressToken`] are attached to the attempt's [`ProgressBroadcast`].
//! * **Resolved:** the value is cached in a [`OnceLock`] and the coordination state
//!   (factory included) is released. From then on `value_future` reads the value without
//!   taking any lock.
//! * A failed or canceled attempt is delivered to every attached caller and resets the
//!   state to Idle, so the next access retries the factory.

use std::{
    fmt,
    future::Future,
    sync::{Arc, OnceLock, Weak},
};

use futures::future::{self, BoxFuture, Either, FutureExt, Ready, Shared};
use parking_lot::Mutex;

use crate::{error::LazyError, multi::ProgressBroadcast, token::ProgressToken};

/// The outcome of one factory attempt.
pub type LazyResult<T, E> = Result<T, LazyError<E>>;

/// The in-flight attempt, shared by every caller attached to it.
pub type SharedAttempt<T, E> = Shared<BoxFuture<'static, LazyResult<T, E>>>;

/// Future returned by [`AsyncLazy::value_future`]: ready at once when the value is cached,
/// otherwise attached to the in-flight attempt.
pub type ValueFuture<T, E> = Either<Ready<LazyResult<T, E>>, SharedAttempt<T, E>>;

type Factory<T, E> =
    Arc<dyn Fn(Option<ProgressToken>) -> BoxFuture<'static, LazyResult<T, E>> + Send + Sync>;

struct Inner<T, E> {
    value: OnceLock<T>,
    /// `None` once resolved.
    state: Mutex<Option<LazyState<T, E>>>,
}

struct LazyState<T, E> {
    factory: Factory<T, E>,
    in_flight: Option<InFlight<T, E>>,
    attempts: u64,
}

struct InFlight<T, E> {
    attempt: u64,
    future: SharedAttempt<T, E>,
    progress: Option<ProgressBroadcast>,
}

/// A value produced by an asynchronous factory at most once at a time, shared by all
/// concurrent callers, and retried after failures.
///
/// Cloning an `AsyncLazy` is cheap and yields a handle to the same value.
///
/// # Examples
///
/// ```
/// use futures::executor::block_on;
/// use progress_flow::{AsyncLazy, LazyError};
///
/// let config: AsyncLazy<String, std::io::ErrorKind> =
///     AsyncLazy::new(|_progress| async { Ok::<_, LazyError<_>>("loaded".to_string()) });
///
/// assert!(!config.is_started());
/// assert_eq!(block_on(config.value_future(None)), Ok("loaded".to_string()));
/// assert!(config.is_resolved());
/// ```
pub struct AsyncLazy<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for AsyncLazy<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: fmt::Debug, E> fmt::Debug for AsyncLazy<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLazy")
            .field("value", &self.inner.value.get())
            .finish_non_exhaustive()
    }
}

impl<T, E> AsyncLazy<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a lazy value computed by `factory`.
    ///
    /// The factory receives a token to report its progress into when the caller that
    /// started the attempt asked for progress, and `None` otherwise.
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn(Option<ProgressToken>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LazyResult<T, E>> + Send + 'static,
    {
        let factory: Factory<T, E> = Arc::new(move |progress| factory(progress).boxed());
        Self {
            inner: Arc::new(Inner {
                value: OnceLock::new(),
                state: Mutex::new(Some(LazyState {
                    factory,
                    in_flight: None,
                    attempts: 0,
                })),
            }),
        }
    }

    /// Creates an already-resolved lazy value.
    #[must_use]
    pub fn from_value(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: OnceLock::from(value),
                state: Mutex::new(None),
            }),
        }
    }

    /// Returns the value, starting the factory if no attempt is in flight.
    ///
    /// If `progress` is given it receives the attempt's progress from the point it
    /// attached, and `1.0` once the value is available.
    pub fn value_future(&self, progress: Option<ProgressToken>) -> ValueFuture<T, E> {
        loop {
            if let Some(value) = self.inner.value.get() {
                if let Some(token) = progress {
                    token.report(1.0);
                }
                return Either::Left(future::ready(Ok(value.clone())));
            }

            let mut guard = self.inner.state.lock();
            let Some(state) = guard.as_mut() else {
                // Resolved between the check above and taking the lock.
                continue;
            };

            if let Some(in_flight) = &mut state.in_flight {
                if let Some(token) = progress {
                    let broadcast = in_flight
                        .progress
                        .get_or_insert_with(ProgressBroadcast::new);
                    let _ = broadcast.add(token);
                }
                return Either::Right(in_flight.future.clone());
            }

            state.attempts += 1;
            let attempt = state.attempts;
            let broadcast = progress.map(|token| {
                let broadcast = ProgressBroadcast::new();
                let _ = broadcast.add(token);
                broadcast
            });
            let factory_progress = broadcast.as_ref().map(ProgressBroadcast::token);
            let factory = state.factory.clone();
            let inner = Arc::downgrade(&self.inner);

            let future = async move {
                let result = factory(factory_progress).await;
                if let Some(inner) = Weak::upgrade(&inner) {
                    inner.settle(attempt, &result);
                }
                result
            }
            .boxed()
            .shared();

            state.in_flight = Some(InFlight {
                attempt,
                future: future.clone(),
                progress: broadcast,
            });
            drop(guard);
            tracing::trace!(attempt, "lazy factory started");

            // Run the factory up to its first suspension point on the calling thread.
            let _ = future.clone().now_or_never();
            return Either::Right(future);
        }
    }

    /// Returns `true` while an attempt is in flight or once the value is resolved.
    ///
    /// `false` again after a failed attempt, until the next access.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.value.get().is_some()
            || self
                .inner
                .state
                .lock()
                .as_ref()
                .is_some_and(|state| state.in_flight.is_some())
    }

    /// Returns `true` once the value is cached.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.inner.value.get().is_some()
    }

    /// Returns the cached value without starting the factory.
    #[must_use]
    pub fn try_get(&self) -> Option<T> {
        self.inner.value.get().cloned()
    }
}

impl<T: Clone, E> Inner<T, E> {
    /// Records the outcome of `attempt`. Runs inside the shared future, on whichever
    /// thread polled it to completion.
    fn settle(&self, attempt: u64, result: &LazyResult<T, E>) {
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            return;
        };
        if state.in_flight.as_ref().map(|in_flight| in_flight.attempt) != Some(attempt) {
            return;
        }

        match result {
            Ok(value) => {
                let _ = self.value.set(value.clone());
                // Sever the coordination state; readers now take the lock-free path.
                let retired = guard.take();
                drop(guard);
                tracing::trace!(attempt, "lazy value resolved");

                let progress = retired
                    .and_then(|state| state.in_flight)
                    .and_then(|in_flight| in_flight.progress);
                if let Some(progress) = progress {
                    progress.report(1.0);
                    let _ = progress.dispose();
                }
            }
            Err(error) => {
                let in_flight = state.in_flight.take();
                drop(guard);
                tracing::debug!(
                    attempt,
                    canceled = error.is_canceled(),
                    "lazy factory attempt failed, resetting"
                );

                if let Some(progress) = in_flight.and_then(|in_flight| in_flight.progress) {
                    let _ = progress.dispose();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use futures::{channel::oneshot, executor::block_on};
    use parking_lot::Mutex;

    use super::AsyncLazy;
    use crate::{ProgressListener, error::LazyError, token::ProgressToken};

    type Gate = Arc<Mutex<Option<oneshot::Receiver<u32>>>>;

    /// A factory that counts invocations and waits for the value on a oneshot gate.
    fn gated() -> (AsyncLazy<u32, &'static str>, oneshot::Sender<u32>, Arc<AtomicUsize>) {
        let (tx, rx) = oneshot::channel();
        let gate: Gate = Arc::new(Mutex::new(Some(rx)));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        let lazy = AsyncLazy::new(move |progress: Option<ProgressToken>| {
            c.fetch_add(1, Ordering::SeqCst);
            let rx = gate.lock().take();
            async move {
                if let Some(progress) = &progress {
                    progress.report(0.5);
                }
                match rx {
                    Some(rx) => rx.await.map_err(|_| LazyError::Canceled),
                    None => Err(LazyError::Failed("gate already used")),
                }
            }
        });
        (lazy, tx, calls)
    }

    fn recording() -> (ProgressListener, Arc<Mutex<Vec<f64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (ProgressListener::new(move |v| sink.lock().push(v)), seen)
    }

    /// Single Flight
    /// Verifies concurrent callers share one factory invocation and one result.
    #[test]
    fn test_single_flight() {
        let (lazy, tx, calls) = gated();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lazy = lazy.clone();
                thread::spawn(move || lazy.value_future(None))
            })
            .collect();
        let futures: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(lazy.is_started());
        assert!(!lazy.is_resolved());

        tx.send(42).unwrap();
        for future in futures {
            assert_eq!(block_on(future), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(lazy.try_get(), Some(42));
        assert_eq!(block_on(lazy.value_future(None)), Ok(42));
    }

    /// Retry After Failure
    /// Verifies a failed attempt resets the lazy value and the next access retries.
    #[test]
    fn test_retry_after_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let lazy: AsyncLazy<u32, String> = AsyncLazy::new(move |_| {
            let attempt = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(LazyError::Failed("flaky".to_string()))
                } else {
                    Ok(7)
                }
            }
        });

        assert_eq!(
            block_on(lazy.value_future(None)),
            Err(LazyError::Failed("flaky".to_string()))
        );
        assert!(!lazy.is_started(), "a failed attempt resets to idle");

        assert_eq!(block_on(lazy.value_future(None)), Ok(7));
        assert_eq!(block_on(lazy.value_future(None)), Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Shared Failure
    /// Verifies every attached caller observes the same failed attempt.
    #[test]
    fn test_failure_reaches_all_callers() {
        let (lazy, tx, calls) = gated();
        let first = lazy.value_future(None);
        let second = lazy.value_future(None);

        // Dropping the sender cancels the attempt.
        drop(tx);
        assert_eq!(block_on(first), Err(LazyError::Canceled));
        assert_eq!(block_on(second), Err(LazyError::Canceled));
        assert!(!lazy.is_started());

        // The gate is spent, so the retry fails differently; it still ran once more.
        assert_eq!(
            block_on(lazy.value_future(None)),
            Err(LazyError::Failed("gate already used"))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Progress Fan-Out
    /// Verifies attached observers see in-flight progress and exactly one final `1.0`.
    #[test]
    fn test_progress_observers() {
        let (lazy, tx, _) = gated();
        let (early, early_seen) = recording();
        let (late, late_seen) = recording();

        let first = lazy.value_future(Some(early.token()));
        assert_eq!(*early_seen.lock(), vec![0.5]);

        let second = lazy.value_future(Some(late.token()));
        assert!(late_seen.lock().is_empty(), "no replay of earlier progress");

        tx.send(3).unwrap();
        assert_eq!(block_on(first), Ok(3));
        assert_eq!(block_on(second), Ok(3));

        assert_eq!(*early_seen.lock(), vec![0.5, 1.0]);
        assert_eq!(*late_seen.lock(), vec![1.0]);
        let _ = early.dispose();
        let _ = late.dispose();
    }

    /// Resolved Fast Path
    /// Verifies a resolved value is returned immediately and completes the caller's token.
    #[test]
    fn test_resolved_fast_path() {
        let lazy: AsyncLazy<&str, ()> = AsyncLazy::from_value("ready");
        assert!(lazy.is_started());
        assert!(lazy.is_resolved());

        let (listener, seen) = recording();
        let mut future = lazy.value_future(Some(listener.token().slice(0.0, 0.5).unwrap()));
        assert!(matches!(future, futures::future::Either::Left(_)));
        assert_eq!(block_on(&mut future), Ok("ready"));
        assert_eq!(*seen.lock(), vec![0.5]);
        let _ = listener.dispose();
    }
}
