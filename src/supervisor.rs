use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::agent::TaskState;
use crate::config::Config;
use crate::gateway::{Gateway, StopReason};
use crate::paths::Paths;

/// Bounded grace before a restart/shutdown stops waiting for workers.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Signal-aware outer loop around the gateway factory.
///
/// SIGUSR1 restarts the gateway in place (and re-reads the config —
/// configuration changes only take effect here); SIGTERM/SIGINT stop it
/// for good. Startup errors propagate out so the CLI exits non-zero.
pub async fn run(paths: Paths) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        let config = Arc::new(Config::load(&paths)?);
        let running = Gateway::start(config, paths.clone()).await?;
        info!("supervisor: gateway up");

        let reason = tokio::select! {
            _ = sigterm.recv() => {
                info!("supervisor: SIGTERM");
                running.stop(StopReason::Shutdown);
                StopReason::Shutdown
            }
            _ = sigint.recv() => {
                info!("supervisor: SIGINT");
                running.stop(StopReason::Shutdown);
                StopReason::Shutdown
            }
            _ = sigusr1.recv() => {
                info!("supervisor: SIGUSR1, restarting");
                running.stop(StopReason::Restart);
                StopReason::Restart
            }
            reason = running.stopped() => reason,
        };

        drain(&running.gateway).await;
        running.abort_background();

        match reason {
            StopReason::Restart => {
                info!("supervisor: restarting gateway");
                continue;
            }
            StopReason::Shutdown => {
                info!("supervisor: shutdown complete");
                return Ok(());
            }
        }
    }
}

/// Cooperatively cancel every task, then wait up to the grace period for
/// the loops to reach their next checkpoint. Errors here are logged,
/// never masked.
async fn drain(gateway: &Arc<Gateway>) {
    gateway.cancel_all_tasks();
    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    loop {
        let live = gateway
            .task_snapshot()
            .into_iter()
            .filter(|t| {
                matches!(
                    t.state(),
                    TaskState::Running | TaskState::AwaitingAuth | TaskState::Queued
                )
            })
            .count();
        if live == 0 {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                "supervisor: {} task(s) still live after {}s grace, force-terminating",
                live,
                DRAIN_GRACE.as_secs()
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
