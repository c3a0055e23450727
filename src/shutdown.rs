//! Process-wide signal handling.
//!
//! SIGINT and SIGTERM arm a single `CancellationToken` threaded through
//! every long-running operation. Components observe the token at I/O
//! suspension points and at the head of every loop over sessions/issues;
//! the fleet orchestrator follows up with a hard group-kill of tracked
//! agent children after a brief grace period.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Spawn the signal listener. Returns the token components poll.
pub fn install_signal_handlers() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received; starting graceful shutdown"),
            _ = sigterm.recv() => info!("SIGTERM received; starting graceful shutdown"),
        }
        token.cancel();
    });
    cancel
}
