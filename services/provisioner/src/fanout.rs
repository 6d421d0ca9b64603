//! Concurrent per-host execution within a stage.
//!
//! Every host in a stage gets its own task. All tasks run to completion (or
//! cancellation) before the stage outcome is decided, so one failing host
//! never hides what happened on the others.

use std::future::Future;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

use crate::error::{ProvisionError, Stage};

/// Run one future per host concurrently, racing each against `token`.
///
/// Results come back in the order of `tasks`.
pub(crate) async fn run_per_host<T, F>(
    stage: Stage,
    token: &CancellationToken,
    tasks: Vec<(String, F)>,
) -> Vec<Result<T, ProvisionError>>
where
    F: Future<Output = Result<T, ProvisionError>>,
{
    let futures = tasks.into_iter().map(|(host, task)| {
        let span = info_span!("host", host = %host, phase = %stage);
        async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(ProvisionError::Cancelled { stage }),
                result = task => result,
            }
        }
        .instrument(span)
    });
    join_all(futures).await
}

/// Split per-host results into successes, or the stage's error.
///
/// A cancellation wins over host failures. Otherwise the first failure in
/// host order is returned and the rest are logged.
pub(crate) fn collect_stage<T>(
    stage: Stage,
    results: Vec<Result<T, ProvisionError>>,
) -> Result<Vec<T>, (ProvisionError, Vec<T>)> {
    let mut ok = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(value) => ok.push(value),
            Err(e) => errors.push(e),
        }
    }

    if errors.is_empty() {
        return Ok(ok);
    }

    let primary = match errors.iter().position(ProvisionError::is_cancelled) {
        Some(index) => errors.remove(index),
        None => errors.remove(0),
    };
    for other in &errors {
        warn!(stage = %stage, error = %other, "Additional host failure");
    }
    Err((primary, ok))
}
