//! Run two independent operations side by side and wait for both of them.
use std::future::Future;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::telemetry;
use crate::{Result, TransportError};

/// Which of the two operations a finished task belongs to
enum Side<T, U> {
    First(T),
    Second(U),
}

/// Start `first` and `second` concurrently and complete once both have finished, yielding both
/// outputs.
///
/// Each operation runs in its own task, so neither can keep the other from starting, and a failure
/// in one doesn't cancel the other.  If either fails the combined result is the failure that was
/// observed first; a second failure is logged and counted but otherwise dropped.
///
/// Panics in either task are caught and reported as [`TransportError::TaskFailed`].
pub async fn interleave<A, B, T, U>(first: A, second: B) -> Result<(T, U)>
where
    A: Future<Output = Result<T>> + Send + 'static,
    B: Future<Output = Result<U>> + Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    let span = tracing::Span::current();
    let mut tasks = JoinSet::new();
    tasks.spawn(first.map(|r| r.map(Side::First)).instrument(span.clone()));
    tasks.spawn(second.map(|r| r.map(Side::Second)).instrument(span));

    let mut first_output = None;
    let mut second_output = None;
    let mut first_error = None;

    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(TransportError::from_join_error).and_then(|r| r) {
            Ok(Side::First(output)) => first_output = Some(output),
            Ok(Side::Second(output)) => second_output = Some(output),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    telemetry::record_error();
                    tracing::warn!(err = %e, "Both interleaved operations failed; dropping the second error");
                }
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    match (first_output, second_output) {
        (Some(first), Some(second)) => Ok((first, second)),
        _ => Err(TransportError::TaskFailed {
            message: "interleaved operation finished without producing output".to_string(),
        }),
    }
}
