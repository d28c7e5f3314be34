/// Signal handling for cancelling a running login.
///
/// Resolves on the first SIGINT (Ctrl-C) or SIGTERM. The watcher treats that
/// as a cancellation: the login process group gets SIGTERM, then SIGKILL
/// after the grace period.
use tokio::signal::unix::{signal, SignalKind};

pub async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler, only Ctrl-C will cancel");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                sigterm.recv().await;
            }
            tracing::info!("received SIGINT");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM");
        }
    }
}
