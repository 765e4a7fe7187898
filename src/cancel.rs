use crate::report::Reporter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STOP_FLAG_POLL: Duration = Duration::from_millis(500);

/// Spawn the cancel watcher: the returned token fires exactly once, on
/// SIGINT, SIGTERM, or the appearance of the stop-flag file, whichever comes
/// first. The reporter announces the transition.
pub fn spawn(stop_flag_path: Option<PathBuf>, reporter: Arc<Reporter>) -> CancellationToken {
    let token = CancellationToken::new();
    let fired = token.clone();
    tokio::spawn(async move {
        let reason = tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = terminate_signal() => "SIGTERM",
            _ = stop_flag_watch(stop_flag_path) => "stop flag",
        };
        tracing::info!(reason, "cancel requested; draining in-flight work");
        reporter.begin_cancelling();
        fired.cancel();
    });
    token
}

async fn stop_flag_watch(path: Option<PathBuf>) {
    let Some(path) = path else {
        return std::future::pending::<()>().await;
    };
    let mut poll = tokio::time::interval(STOP_FLAG_POLL);
    loop {
        poll.tick().await;
        if path.exists() {
            return;
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await
}
