use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{KeyedResult, Probe, ProbeResult};

const PROBE_DURATION_SECONDS: &str = "status_probe_duration_seconds";

/// Runs every probe concurrently and returns their results in input order.
///
/// Each probe gets its own task, so a panic is contained in its slot and
/// reported as an error result. When `cancel` fires, probes that are still
/// running resolve to `Unknown`. The call returns once every task has
/// finished, no partial results are returned.
pub async fn run_all(
    probes: Vec<(String, Arc<dyn Probe>)>,
    cancel: &CancellationToken,
) -> Vec<KeyedResult> {
    let (keys, tasks): (Vec<String>, Vec<_>) = probes
        .into_iter()
        .map(|(key, probe)| {
            let cancel = cancel.clone();
            let task = tokio::spawn(async move {
                let started = Instant::now();
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => ProbeResult::unknown("probe cancelled"),
                    result = probe.run() => result,
                };
                (result, started.elapsed())
            });
            (key, task)
        })
        .unzip();

    // join_all keeps the order of its input, whatever the completion order.
    let joined = join_all(tasks).await;

    keys.into_iter()
        .zip(joined)
        .map(|(key, joined)| {
            let result = match joined {
                Ok((result, elapsed)) => {
                    debug!(
                        probe = %key,
                        status = %result.status(),
                        duration_ms = elapsed.as_millis() as u64,
                        "status probe finished"
                    );
                    metrics::histogram!(PROBE_DURATION_SECONDS, "probe" => key.clone())
                        .record(elapsed.as_secs_f64());
                    result
                }
                Err(err) if err.is_panic() => {
                    let reason = panic_reason(err.into_panic());
                    error!(probe = %key, reason = %reason, "status probe panicked");
                    ProbeResult::error(format!("probe panicked: {reason}"))
                }
                Err(err) => ProbeResult::unknown(format!("probe aborted: {err}")),
            };
            KeyedResult { key, result }
        })
        .collect()
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        (*reason).to_owned()
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic".to_owned()
    }
}
