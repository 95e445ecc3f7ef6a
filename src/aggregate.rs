use crate::prober::{Probe, ProbeError};
use crate::scheduler::RunState;
use crate::types::AggregatedResult;
use std::net::Ipv4Addr;
use tokio::sync::Mutex;
use tracing::debug;

/// Smallest accepted number of probes per candidate.
pub const MIN_EVERY: usize = 5;

/// Mean of the samples after dropping one minimum and one maximum.
///
/// Returns `None` with fewer than three samples. Sorts in place.
pub fn trimmed_mean(samples: &mut [u64]) -> Option<u64> {
    if samples.len() < 3 {
        return None;
    }
    samples.sort_unstable();
    let kept = &samples[1..samples.len() - 1];
    Some(kept.iter().sum::<u64>() / kept.len() as u64)
}

/// Probe `ip` `every` times in sequence and reduce to one delay.
///
/// The first failed attempt abandons the candidate; samples collected so far
/// are discarded.
pub async fn measure_candidate<P: Probe>(
    probe: &P,
    ip: Ipv4Addr,
    every: usize,
) -> Result<AggregatedResult, ProbeError> {
    let mut samples = Vec::with_capacity(every);
    for _ in 0..every {
        samples.push(probe.probe(ip).await?);
    }
    // every >= MIN_EVERY is checked at startup; a smaller count degrades to
    // the plain mean rather than dropping a fully successful candidate.
    let delay_ms = trimmed_mean(&mut samples)
        .unwrap_or_else(|| samples.iter().sum::<u64>() / samples.len().max(1) as u64);
    Ok(AggregatedResult::new(ip, delay_ms))
}

/// Measure one candidate and record the outcome: a result under the lock on
/// success, a failure count otherwise.
pub async fn run_candidate<P: Probe>(
    probe: &P,
    ip: Ipv4Addr,
    every: usize,
    state: &RunState,
    results: &Mutex<Vec<AggregatedResult>>,
) {
    match measure_candidate(probe, ip, every).await {
        Ok(result) => {
            debug!(%ip, delay_ms = result.delay_ms, "candidate measured");
            results.lock().await.push(result);
        }
        Err(e) => {
            let failed = state.record_failure();
            debug!(%ip, error = %e, failed, "candidate dropped");
        }
    }
}
