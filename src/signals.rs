//! Process signal handling.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Spawn a task that cancels the returned token on SIGINT or SIGTERM.
///
/// Must be called from within a tokio runtime. Callers thread the token (or
/// child tokens) into everything that should stop on shutdown.
pub fn setup_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        cancel.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(%e, "failed to install SIGTERM handler, falling back to ctrl-c only");
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = term.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(%e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
