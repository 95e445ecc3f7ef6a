use crate::aggregate::run_candidate;
use crate::prober::Probe;
use crate::types::AggregatedResult;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counters and the cancellation flag for one run.
///
/// Cloning shares the underlying state; construct one per invocation and
/// hand clones to whoever needs to observe or cancel it.
#[derive(Clone, Debug, Default)]
pub struct RunState {
    total: Arc<AtomicU64>,
    started: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub total: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; never un-cancels.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Count one failed candidate and return the new total.
    pub fn record_failure(&self) -> u64 {
        self.failed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            total: self.total.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn mark_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleOptions {
    /// Upper bound on simultaneously measured candidates.
    pub workers: usize,
    /// Probes per candidate.
    pub every: usize,
}

/// What a run produced. `results` is in completion order, not ranked.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub results: Vec<AggregatedResult>,
    pub progress: Progress,
    pub cancelled: bool,
}

/// Measure every candidate with at most `opts.workers` in flight.
///
/// Once `state` is cancelled no further candidate starts probing; those
/// not yet started are counted as completed without any network activity,
/// and candidates already being measured run to their natural end. Returns
/// after every candidate has been accounted for.
pub async fn run_candidates<P: Probe>(
    probe: Arc<P>,
    candidates: Vec<Ipv4Addr>,
    opts: ScheduleOptions,
    state: RunState,
) -> RunOutcome {
    state
        .total
        .store(candidates.len() as u64, Ordering::Relaxed);
    let workers = opts.workers.max(1);
    info!(candidates = candidates.len(), workers, every = opts.every, "starting probe run");

    let sem = Arc::new(Semaphore::new(workers));
    let results = Arc::new(Mutex::new(Vec::new()));
    let mut set = JoinSet::new();

    for ip in candidates {
        if state.is_cancelled() {
            state.mark_completed();
            continue;
        }
        let permit = tokio::select! {
            permit = sem.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    warn!("worker pool closed, skipping remaining candidates");
                    state.mark_completed();
                    continue;
                }
            },
            _ = state.cancel.cancelled() => {
                state.mark_completed();
                continue;
            }
        };

        let probe = probe.clone();
        let state = state.clone();
        let results = results.clone();
        let every = opts.every;
        set.spawn(async move {
            let _permit = permit; // held until the candidate is done

            if !state.is_cancelled() {
                state.started.fetch_add(1, Ordering::Relaxed);
                run_candidate(probe.as_ref(), ip, every, &state, &results).await;
            }
            state.mark_completed();
        });
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "probe worker aborted");
        }
    }

    let results = std::mem::take(&mut *results.lock().await);
    let progress = state.snapshot();
    let cancelled = state.is_cancelled();
    debug!(
        measured = results.len(),
        failed = progress.failed,
        cancelled,
        "probe run finished"
    );
    RunOutcome {
        results,
        progress,
        cancelled,
    }
}
