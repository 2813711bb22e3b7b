//! Process runtime: drive an [`Engine`] until a signal or until its order
//! budget is spent, plus the operator API used by the CLI.

pub mod api;

use std::time::Duration;

use tracing::info;

use crate::builders::Engine;
use crate::core::AppResult;

pub use api::{
    clear, flow_summary, list_entries, list_errors, list_pools, pool_usage, restart, restart_errors,
    summarize_flows, validate_notebooks, CommandReport, EntryView, FlowSummary, NotebookReport, PoolSnapshot,
    ERROR_STATUSES,
};

/// How often the runtime checks whether a bounded run has drained.
pub const DRAIN_POLL: Duration = Duration::from_millis(200);

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Ctrl+C or SIGTERM.
    Signal,
    /// `max_orders` reached and every task finished.
    Drained,
}

fn drained(engine: &Engine) -> bool {
    engine.executor.orders_exhausted() && engine.executor.is_idle()
}

/// Start the engine and block the calling thread until the order budget is
/// spent and every task has finished. Never returns for an unbounded run.
///
/// # Errors
///
/// Fails when the executor cannot start.
pub fn run_until_drained(engine: &Engine, poll: Duration) -> AppResult<StopReason> {
    engine.executor.start()?;
    while !drained(engine) {
        std::thread::sleep(poll);
    }
    engine.executor.stop();
    info!(stats = ?engine.executor.stats(), "run drained");
    Ok(StopReason::Drained)
}

/// Start the engine and wait for Ctrl+C, SIGTERM or a drained bounded run,
/// then stop the executor gracefully.
///
/// # Errors
///
/// Fails when the executor cannot start.
#[cfg(feature = "tokio-runtime")]
pub async fn run_until_signal(engine: &Engine) -> AppResult<StopReason> {
    engine.executor.start()?;

    let drain = async {
        let mut ticker = tokio::time::interval(DRAIN_POLL);
        loop {
            ticker.tick().await;
            if drained(engine) {
                break;
            }
        }
    };

    let reason = tokio::select! {
        () = shutdown_signal() => StopReason::Signal,
        () = drain => StopReason::Drained,
    };

    tokio::task::block_in_place(|| engine.executor.stop());
    info!(reason = ?reason, stats = ?engine.executor.stats(), "run finished");
    Ok(reason)
}

#[cfg(feature = "tokio-runtime")]
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
