use std::sync::OnceLock;

use eyre::{Result, WrapErr};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Why the process is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Triggered from code, e.g. after the listener failed.
    Requested,
}

/// Turns OS signals into one cancellation shared by the server and the
/// background task drain.
#[derive(Debug, Default)]
pub struct GracefulShutdown {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Starts shutdown. Only the first reason is kept.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_ok() {
            tracing::info!("Shutdown initiated: {:?}", reason);
        } else {
            tracing::warn!("Shutdown already initiated, ignoring {:?}", reason);
        }
        self.token.cancel();
    }

    /// Listens for SIGINT and SIGTERM until the first one arrives.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        #[cfg(unix)]
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to register SIGTERM handler")?;

        #[cfg(unix)]
        let terminate = sigterm.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for SIGINT")?;
                self.trigger_shutdown(ShutdownReason::Interrupt);
            }
            _ = terminate => {
                self.trigger_shutdown(ShutdownReason::Terminate);
            }
            _ = self.token.cancelled() => {}
        }
        Ok(())
    }

    /// Waits for shutdown and returns its reason.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason
            .get()
            .copied()
            .unwrap_or(ShutdownReason::Requested)
    }
}
