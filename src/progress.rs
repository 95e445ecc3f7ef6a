use crate::scheduler::RunState;
use anyhow::Result;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TEMPLATE: &str =
    "[failed {prefix}] {pos}/{len} {wide_bar} {percent}% {per_sec} ETA {eta}";
const REFRESH: Duration = Duration::from_millis(100);

/// Progress bar fed by polling the run counters.
pub struct ProgressReporter {
    bar: ProgressBar,
    state: RunState,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn(state: RunState, visible: bool) -> Result<Self> {
        let bar = if visible {
            ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr())
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(ProgressStyle::with_template(TEMPLATE)?);
        bar.set_prefix("0");

        let stop = CancellationToken::new();
        let task = tokio::spawn(refresh_loop(bar.clone(), state.clone(), stop.clone()));
        Ok(Self {
            bar,
            state,
            stop,
            task,
        })
    }

    /// Stop polling and draw the final counters.
    pub async fn finish(self) {
        self.stop.cancel();
        let _ = self.task.await;
        update(&self.bar, &self.state);
        self.bar.finish();
    }
}

async fn refresh_loop(bar: ProgressBar, state: RunState, stop: CancellationToken) {
    let mut tick = tokio::time::interval(REFRESH);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tick.tick() => update(&bar, &state),
        }
    }
}

fn update(bar: &ProgressBar, state: &RunState) {
    let p = state.snapshot();
    bar.set_length(p.total);
    bar.set_position(p.completed);
    bar.set_prefix(p.failed.to_string());
}
