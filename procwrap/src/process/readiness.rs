//! One readiness wait over many pipe ends.

use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;

use super::pipe::ReadEnd;

/// Fallback wait when nothing is eligible for a readiness wait, e.g. every
/// pipe hit EOF but the child has not been reaped yet.
pub(crate) const IDLE_TICK: Duration = Duration::from_millis(1);

/// Longest a caller-driven `poll` waits for output.
pub(crate) const POLL_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// Index into the waited set of the first end that became readable.
    Ready(usize),
    TimedOut,
}

/// Wait until any of `ends` is readable or `bound` elapses.
///
/// `None` waits without limit, except for an empty set which always waits
/// [`IDLE_TICK`] at most. The readiness of the reported end is consumed, so
/// the caller must drain it until `WouldBlock` before waiting again.
pub(crate) async fn wait_ready(ends: &[ReadEnd], bound: Option<Duration>) -> Readiness {
    if ends.is_empty() {
        tokio::time::sleep(cap(bound, IDLE_TICK)).await;
        return Readiness::TimedOut;
    }

    let waits = ends.iter().map(|end| {
        let end = Arc::clone(end);
        Box::pin(async move {
            // An error here means the end is unusable; reporting it ready
            // lets the drain discover that.
            if let Ok(mut guard) = end.readable().await {
                guard.clear_ready();
            }
        })
    });
    let any = select_all(waits);

    match bound {
        Some(bound) => match tokio::time::timeout(bound, any).await {
            Ok((_, index, _)) => Readiness::Ready(index),
            Err(_) => Readiness::TimedOut,
        },
        None => Readiness::Ready(any.await.1),
    }
}

/// Shorten `bound` to at most `cap`.
pub(crate) fn cap(bound: Option<Duration>, cap: Duration) -> Duration {
    bound.map_or(cap, |bound| bound.min(cap))
}
