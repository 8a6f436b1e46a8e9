//! Expiration & promotion sweeper — expires claims whose window has passed
//! and hands each freed slot to the oldest user in the waiting line.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::{error, info, warn};

use crate::db;
use crate::errors::{Result, SchedulerError};
use crate::scheduler::SchedulerState;
use crate::users::{transition_ids, AirdropStatus};

const TASK: &str = "sweeper";

/// Outcome of one sweeper run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Moved from `EMAIL_SENT` to `AIRDROP_CLAIM_EXPIRED`.
    pub expired: usize,
    /// Taken off the waiting line into `EMAIL_SENT`.
    pub promoted: usize,
    /// Promoted users whose invitation could not be delivered; they end in
    /// `EMAIL_ERROR` and keep the slot.
    pub failed: usize,
}

/// Run the sweeper every `sweep_interval_secs` until `state.shutdown` fires.
pub async fn run(state: Arc<SchedulerState>) {
    let interval = Duration::from_secs(state.config.sweep_interval_secs);
    info!(
        "Sweeper starting — every {}s, claim window: {}h",
        interval.as_secs(),
        state.config.claim_expires_in_hours
    );

    loop {
        match sweep_once(&state, Utc::now().timestamp()).await {
            Ok(report) if report.expired > 0 => info!(
                expired = report.expired,
                promoted = report.promoted,
                failed = report.failed,
                "Sweeper run committed"
            ),
            Ok(_) => {}
            Err(SchedulerError::Cancelled) => {
                info!("Sweeper run abandoned while waiting for the lock")
            }
            Err(e) => error!("Sweeper run rolled back: {e}"),
        }

        tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Sweeper stopped");
}

/// Perform a single sweep at `now` (unix seconds).
///
/// Promotions backfill expirations one for one, so the number of users
/// holding supply never grows during a sweep.
pub async fn sweep_once(state: &SchedulerState, now: i64) -> Result<SweepReport> {
    let mut tx = db::begin_locked(&state.pool, TASK, now, &state.shutdown).await?;

    match expire_and_promote(&mut tx, state, now).await {
        Ok(report) => {
            tx.commit().await?;
            Ok(report)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!("Sweeper rollback failed: {rollback}");
            }
            Err(e)
        }
    }
}

async fn expire_and_promote(
    conn: &mut SqliteConnection,
    state: &SchedulerState,
    now: i64,
) -> Result<SweepReport> {
    let cutoff = now - state.config.claim_window_secs();
    let expired = db::select_expired_claims(conn, cutoff).await?;
    if expired.is_empty() {
        return Ok(SweepReport::default());
    }

    let expired_ids = transition_ids(&expired, AirdropStatus::AirdropClaimExpired)?;
    db::set_status(conn, &expired_ids, AirdropStatus::AirdropClaimExpired, None).await?;
    info!("{} users updated to AIRDROP_CLAIM_EXPIRED", expired_ids.len());

    let mut report = SweepReport {
        expired: expired_ids.len(),
        ..Default::default()
    };

    let limit = i64::try_from(expired_ids.len()).unwrap_or(i64::MAX);
    let line = db::select_waiting_line(conn, limit).await?;
    info!("Num of users taken from waiting line: {}", line.len());
    if line.is_empty() {
        return Ok(report);
    }

    let promoted_ids = transition_ids(&line, AirdropStatus::EmailSent)?;
    db::set_status(conn, &promoted_ids, AirdropStatus::EmailSent, Some(now)).await?;
    report.promoted = promoted_ids.len();

    for user in &line {
        if let Err(e) = state.send_claim_invitation(&user.email, now).await {
            warn!(user_id = user.id, "Promotion invitation failed: {e}");
            db::mark_email_error(conn, user.id).await?;
            report.failed += 1;
        }
    }

    Ok(report)
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
