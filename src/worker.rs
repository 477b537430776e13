use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::api::CoordinatorClient;
use crate::checker::Checker;
use crate::error::WorkerError;
use crate::pipeline::TaskPipeline;
use crate::store::WorkStore;

/// Fires once when the process is asked to stop.
pub fn spawn_shutdown_listener() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        info!(signal, "shutdown signal received");
        let _ = tx.send(());
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut terminate), Ok(mut hangup), Ok(mut quit)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
        signal(SignalKind::quit()),
    ) else {
        warn!("unix signal handlers unavailable, listening for Ctrl-C only");
        let _ = tokio::signal::ctrl_c().await;
        return "SIGINT";
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
        _ = quit.recv() => "SIGQUIT",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}

/// Runs one pipeline tick per `period` until `shutdown` fires.
///
/// A tick always runs to completion on the blocking pool before the next
/// tick or the shutdown is observed; ticks missed meanwhile are not replayed.
/// A pending shutdown wins over a tick that came due in the meantime.
/// The pipeline is handed back so the caller can release its store.
pub async fn run<A, S, C>(
    mut pipeline: TaskPipeline<A, S, C>,
    period: Duration,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<TaskPipeline<A, S, C>, WorkerError>
where
    A: CoordinatorClient + 'static,
    S: WorkStore + Send + 'static,
    C: Checker + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_secs = period.as_secs_f64(), "worker running");

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let current = pipeline;
                pipeline = tokio::task::spawn_blocking(move || {
                    current.process();
                    current
                })
                .await
                .map_err(|err| WorkerError::Runtime(format!("tick aborted: {err}")))?;
            }
        }
    }

    info!("worker stopped");
    Ok(pipeline)
}
