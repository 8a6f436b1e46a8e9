//! Invitation dispatcher — invites pending users while supply lasts and puts
//! the rest on the waiting line.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::{error, info, warn};

use crate::db;
use crate::errors::{Result, SchedulerError};
use crate::scheduler::SchedulerState;
use crate::users::{available_slots, AirdropStatus, StagedTransition};

const TASK: &str = "dispatcher";

/// Outcome of one dispatcher run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Pending users picked up by the run.
    pub selected: usize,
    /// Moved to `EMAIL_SENT`.
    pub invited: usize,
    /// Moved to `IN_WAITING_LINE`.
    pub waitlisted: usize,
    /// Moved to `EMAIL_ERROR`.
    pub failed: usize,
}

/// Run the dispatcher every `dispatch_interval_secs` until `state.shutdown` fires.
pub async fn run(state: Arc<SchedulerState>) {
    let interval = Duration::from_secs(state.config.dispatch_interval_secs);
    info!(
        "Dispatcher starting — every {}s, supply cap: {:?}",
        interval.as_secs(),
        state.config.max_supply
    );

    loop {
        match dispatch_once(&state, Utc::now().timestamp()).await {
            Ok(report) if report.selected > 0 => info!(
                selected = report.selected,
                invited = report.invited,
                waitlisted = report.waitlisted,
                failed = report.failed,
                "Dispatcher run committed"
            ),
            Ok(_) => {}
            Err(SchedulerError::Cancelled) => {
                info!("Dispatcher run abandoned while waiting for the lock")
            }
            Err(e) => error!("Dispatcher run rolled back: {e}"),
        }

        tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Dispatcher stopped");
}

/// Perform a single dispatcher run at `now` (unix seconds).
///
/// Supply is counted once, before the transaction. Every status change of
/// the run is written in one bulk upsert and committed together; a store
/// error anywhere rolls the whole batch back.
pub async fn dispatch_once(state: &SchedulerState, now: i64) -> Result<DispatchReport> {
    let available = match state.config.max_supply {
        Some(max_supply) => {
            let reserved = db::count_reserving_active(&state.pool).await?;
            Some(available_slots(max_supply, reserved))
        }
        None => None,
    };

    let mut tx = db::begin_locked(&state.pool, TASK, now, &state.shutdown).await?;

    match invite_pending(&mut tx, state, available, now).await {
        Ok(report) => {
            tx.commit().await?;
            Ok(report)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!("Dispatcher rollback failed: {rollback}");
            }
            Err(e)
        }
    }
}

async fn invite_pending(
    conn: &mut SqliteConnection,
    state: &SchedulerState,
    available: Option<usize>,
    now: i64,
) -> Result<DispatchReport> {
    let users = db::select_pending(conn, now).await?;
    let mut report = DispatchReport {
        selected: users.len(),
        ..Default::default()
    };
    let mut staged = Vec::with_capacity(users.len());

    for (index, user) in users.iter().enumerate() {
        let has_slot = available.map_or(true, |slots| index < slots);

        let next = if has_slot {
            match state.send_claim_invitation(&user.email, now).await {
                Ok(()) => {
                    report.invited += 1;
                    AirdropStatus::EmailSent
                }
                Err(e) => {
                    warn!(user_id = user.id, "Claim invitation failed: {e}");
                    report.failed += 1;
                    AirdropStatus::EmailError
                }
            }
        } else {
            // Outcome does not change the status.
            if let Err(e) = state.send_waiting_line_notice(&user.email).await {
                warn!(user_id = user.id, "Waiting line notice failed: {e}");
            }
            report.waitlisted += 1;
            AirdropStatus::InWaitingLine
        };

        staged.push(StagedTransition::new(user, next, now)?);
    }

    if !staged.is_empty() {
        db::apply_transitions(conn, &staged).await?;
    }

    Ok(report)
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
