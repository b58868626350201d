//! Ordered shutdown.
//!
//! The listener stops first (axum's graceful shutdown handles steps one
//! and two), then the audit queue flushes inside the remaining ceiling,
//! and only then do the analyzer channel and the store pool close.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::http::FirewallState;

pub const SHUTDOWN_CEILING: Duration = Duration::from_secs(10);

/// Resolves when the process receives SIGTERM or ctrl-c.
pub async fn signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // No signal handler means no clean shutdown path; park forever
            // and let the supervisor kill us.
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("termination signal received");
}

/// Drains and closes everything after the listener has stopped. Returns
/// `false` when the ceiling expired before the queue was empty; the
/// process should then exit non-zero.
pub async fn drain(state: &FirewallState, ceiling: Duration) -> bool {
    let deadline = Instant::now() + ceiling;

    let flushed = tokio::time::timeout_at(deadline, state.audit_logger().flush())
        .await
        .is_ok();
    if flushed {
        info!("audit queue flushed");
    } else {
        warn!(
            dropped = state.audit_logger().size(),
            "shutdown ceiling reached before the audit queue drained"
        );
    }

    state.analyzer().shutdown().await;
    state.audit_store().close().await;
    info!("analyzer channel and audit store closed");

    flushed
}
