//! Reporting the completion of a future.
//!
//! Asynchronous work rarely knows its own fraction done, but it always knows when it has
//! finished. These adapters report the terminal `1.0` into a [`ProgressToken`] once the
//! wrapped future resolves, which is enough to drive a [`MergeBuilder`](crate::MergeBuilder)
//! slot per task.

use std::future::Future;

use crate::token::ProgressToken;

/// Awaits `future`, then reports `1.0` into `token` regardless of the output.
///
/// # Examples
///
/// ```
/// use futures::executor::block_on;
/// use progress_flow::{ProgressListener, future::report_on_completion};
///
/// let listener = ProgressListener::new(|_| {});
/// let answer = block_on(report_on_completion(async { 42 }, listener.token()));
///
/// assert_eq!(answer, 42);
/// assert_eq!(listener.value(), Some(1.0));
/// # let _ = listener.dispose();
/// ```
pub async fn report_on_completion<F: Future>(future: F, token: ProgressToken) -> F::Output {
    let output = future.await;
    token.report(1.0);
    output
}

/// Awaits `future`, then reports `1.0` into `token` only if it resolved with `Ok`.
///
/// A failed future leaves the token where it was, so a merger waiting on it never
/// reaches completion.
pub async fn report_on_success<F, T, E>(future: F, token: ProgressToken) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    let output = future.await;
    if output.is_ok() {
        token.report(1.0);
    }
    output
}

#[cfg(test)]
mod tests {
    use futures::{channel::oneshot, executor::block_on, future::join};

    use super::{report_on_completion, report_on_success};
    use crate::{MergeBuilder, ProgressListener};

    /// Completion
    /// Verifies `1.0` is reported only after the wrapped future resolves.
    #[test]
    #[allow(clippy::float_cmp)]
    fn test_report_on_completion() {
        let listener = ProgressListener::new(|_| {});
        let (tx, rx) = oneshot::channel::<u8>();

        let task = report_on_completion(rx, listener.token());
        let driver = async {
            assert!(listener.value().is_none(), "nothing reported before resolution");
            tx.send(9).unwrap();
        };
        let (output, ()) = block_on(join(task, driver));

        assert_eq!(output, Ok(9));
        assert_eq!(listener.value(), Some(1.0));
        let _ = listener.dispose();
    }

    /// Success Only
    /// Verifies failed futures leave their merge slot incomplete.
    #[test]
    #[allow(clippy::float_cmp)]
    fn test_report_on_success() {
        let listener = ProgressListener::new(|_| {});
        let merge = MergeBuilder::new(listener.token());
        let ok_slot = merge.new_token(1.0).unwrap();
        let err_slot = merge.new_token(1.0).unwrap();

        let ok = block_on(report_on_success(async { Ok::<_, ()>(1) }, ok_slot));
        let err = block_on(report_on_success(async { Err::<u8, _>("boom") }, err_slot));

        assert_eq!(ok, Ok(1));
        assert_eq!(err, Err("boom"));
        assert_eq!(listener.value(), Some(0.5));
        let _ = merge.dispose();
        let _ = listener.dispose();
    }
}
