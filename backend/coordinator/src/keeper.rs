//! Long-running background task that drives the protocol's time-based
//! transitions.
//!
//! The core never acts on its own when a deadline passes. On every tick the
//! keeper asks it for tasks past `deadline + grace_period` and for rounds
//! past their voting deadline, then calls `check_deadline` and
//! `finalize_verification` on them exactly like an external caller would.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::Result;
use crate::state::AppState;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sweep {
    pub abandoned: usize,
    pub finalized: usize,
    pub failed: usize,
}

/// Run the keeper loop until `shutdown` is cancelled.
pub async fn run(state: Arc<AppState>, interval: Duration, shutdown: CancellationToken) {
    info!(interval_secs = interval.as_secs(), "Keeper starting");

    loop {
        match sweep_once(&state).await {
            Ok(sweep) if sweep != Sweep::default() => {
                info!(
                    abandoned = sweep.abandoned,
                    finalized = sweep.finalized,
                    failed = sweep.failed,
                    "Keeper sweep applied"
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!("Keeper sweep error: {e}");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Keeper stopped");
}

/// Perform a single sweep.
///
/// Each transition is its own command, so one failure (for instance a
/// caller racing the keeper to the same task) does not stop the others.
pub async fn sweep_once(state: &AppState) -> Result<Sweep> {
    let (overdue, expired) = {
        let protocol = state.protocol.read().await;
        if protocol.is_paused() {
            return Ok(Sweep::default());
        }
        (protocol.overdue_tasks(), protocol.expired_rounds())
    };

    let mut sweep = Sweep::default();

    for id in expired {
        match state.mutate(|p| p.finalize_verification(id)).await {
            Ok(outcome) => {
                info!(task_id = id, ?outcome, "Finalized expired verification round");
                sweep.finalized += 1;
            }
            Err(e) => {
                warn!(task_id = id, error = %e, "Could not finalize round");
                sweep.failed += 1;
            }
        }
    }

    for id in overdue {
        match state.mutate(|p| p.check_deadline(id)).await {
            Ok(previous) => {
                info!(task_id = id, ?previous, "Settled abandoned task");
                sweep.abandoned += 1;
            }
            Err(e) => {
                warn!(task_id = id, error = %e, "Could not settle abandoned task");
                sweep.failed += 1;
            }
        }
    }

    Ok(sweep)
}
