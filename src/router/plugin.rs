//! Router plugins run once when the router starts.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Hook invoked by `Router::run` before any handler subscribes.
///
/// Plugins receive the router's shutdown token and may cancel it.
pub trait RouterPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_start(&self, shutdown: CancellationToken);
}

/// Cancels the router on Ctrl-C or SIGTERM.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalsHandler;

impl RouterPlugin for SignalsHandler {
    fn name(&self) -> &'static str {
        "signals"
    }

    fn on_start(&self, shutdown: CancellationToken) {
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal() => {
                    info!("Shutdown signal received");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
