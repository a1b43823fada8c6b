//! Background triage loop: runs the orchestrator on a timer.
//!
//! Each tick:
//! 1. `Orchestrator::run()` over the current unread batch
//! 2. Log the report summary
//! 3. Stop for good on an authentication failure (credentials need a human)
//!
//! Cancelling the returned token stops the loop and cancels the in-flight
//! batch; drafts already persisted stay persisted.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::pipeline::orchestrator::{BatchReport, Orchestrator};

/// What the loop should do after a batch.
#[derive(Debug, PartialEq, Eq)]
enum Next {
    Continue,
    Stop,
}

/// Spawn a background task that runs a batch every `interval`.
///
/// The first batch runs immediately. Returns the task handle and a token
/// that shuts the loop down.
pub fn spawn_triage_loop(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
) -> (JoinHandle<()>, CancellationToken) {
    let shutdown = CancellationToken::new();
    let shutdown_token = shutdown.clone();

    let handle = tokio::spawn(async move {
        info!("Triage loop started, running every {}s", interval.as_secs());

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Run immediately on first tick
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Triage loop shutting down");
                    return;
                }
                _ = tick.tick() => {}
            }

            let result = orchestrator.run(shutdown.child_token()).await;
            if handle_result(result) == Next::Stop {
                return;
            }
            if shutdown.is_cancelled() {
                info!("Triage loop shutting down");
                return;
            }
        }
    });

    (handle, shutdown_token)
}

/// Run exactly one batch (for one-shot CLI use).
pub async fn run_once(
    orchestrator: &Orchestrator,
    cancel: CancellationToken,
) -> Result<BatchReport, PipelineError> {
    let result = orchestrator.run(cancel).await;
    match &result {
        Ok(report) => info!(summary = %report.summary(), "Batch finished"),
        Err(e) => error!(error = %e, "Batch failed"),
    }
    result
}

fn handle_result(result: Result<BatchReport, PipelineError>) -> Next {
    match result {
        Ok(report) => {
            info!(
                drafted = report.drafted(),
                skipped = report.skipped(),
                failed = report.failed(),
                "Triage batch finished"
            );
            Next::Continue
        }
        Err(PipelineError::Aborted { report, source }) => {
            error!(
                error = %source,
                drafted = report.drafted(),
                "Triage batch aborted, stopping loop until credentials are fixed"
            );
            Next::Stop
        }
        Err(e) => {
            // Transient fetch failure; the next tick retries.
            warn!(error = %e, "Triage batch failed to start");
            Next::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;

    #[test]
    fn fetch_failure_keeps_looping() {
        let result = Err(PipelineError::Fetch(ProviderError::RequestFailed {
            provider: "gmail".into(),
            reason: "HTTP 503".into(),
        }));
        assert_eq!(handle_result(result), Next::Continue);
    }
}
