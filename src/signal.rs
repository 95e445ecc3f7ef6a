use crate::scheduler::RunState;
use std::io;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Cancel `state` on the first SIGINT, SIGTERM or SIGQUIT (Ctrl+C off unix).
pub fn cancel_on_signal(state: RunState) -> JoinHandle<()> {
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(name) => {
                warn!(signal = name, "interrupted, finishing in-flight probes");
                state.cancel();
            }
            Err(e) => error!(error = %e, "failed to install signal handlers"),
        }
    })
}

#[cfg(unix)]
async fn shutdown_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let name = tokio::select! {
        _ = int.recv() => "SIGINT",
        _ = term.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn shutdown_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
