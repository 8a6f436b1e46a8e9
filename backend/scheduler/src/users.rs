//! User airdrop records and the status state machine shared by the
//! dispatcher and the sweeper.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SchedulerError};

/// Progress of a user through the airdrop.
///
/// Stored as an integer code in `users.airdrop_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AirdropStatus {
    /// Registered, no email sent yet.
    Pending,
    /// Claim invitation delivered; the claim window is running.
    EmailSent,
    /// User linked a wallet through the claim API.
    WalletLinked,
    /// Airdrop transaction submitted.
    TransactionCreated,
    /// Airdrop delivered.
    AirdropCompleted,
    /// Delivery of the claim invitation failed. Needs manual attention.
    EmailError,
    /// No supply left when the user was reached; waiting for a freed slot.
    InWaitingLine,
    /// Claim window elapsed without the user claiming.
    AirdropClaimExpired,
}

/// States that hold one unit of the global supply.
pub const RESERVING_STATUSES: [AirdropStatus; 5] = [
    AirdropStatus::EmailSent,
    AirdropStatus::WalletLinked,
    AirdropStatus::TransactionCreated,
    AirdropStatus::AirdropCompleted,
    AirdropStatus::InWaitingLine,
];

/// Every status, in code order.
pub const ALL_STATUSES: [AirdropStatus; 8] = [
    AirdropStatus::Pending,
    AirdropStatus::EmailSent,
    AirdropStatus::WalletLinked,
    AirdropStatus::TransactionCreated,
    AirdropStatus::AirdropCompleted,
    AirdropStatus::EmailError,
    AirdropStatus::InWaitingLine,
    AirdropStatus::AirdropClaimExpired,
];

impl AirdropStatus {
    /// Integer code persisted in the database.
    pub fn code(self) -> i64 {
        match self {
            Self::Pending => 1,
            Self::EmailSent => 2,
            Self::WalletLinked => 3,
            Self::TransactionCreated => 4,
            Self::AirdropCompleted => 5,
            Self::EmailError => 6,
            Self::InWaitingLine => 7,
            Self::AirdropClaimExpired => 8,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        ALL_STATUSES.into_iter().find(|s| s.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::EmailSent => "email_sent",
            Self::WalletLinked => "wallet_linked",
            Self::TransactionCreated => "transaction_created",
            Self::AirdropCompleted => "airdrop_completed",
            Self::EmailError => "email_error",
            Self::InWaitingLine => "in_waiting_line",
            Self::AirdropClaimExpired => "airdrop_claim_expired",
        }
    }

    /// Whether a user in this state counts against `MAX_SUPPLY`.
    pub fn reserves_supply(self) -> bool {
        RESERVING_STATUSES.contains(&self)
    }

    /// Transitions the scheduler is allowed to make. Everything from
    /// `WALLET_LINKED` onwards belongs to the claim API.
    pub fn can_transition_to(self, next: Self) -> bool {
        use AirdropStatus::*;
        matches!(
            (self, next),
            (Pending, EmailSent)
                | (Pending, InWaitingLine)
                | (Pending, EmailError)
                | (EmailSent, AirdropClaimExpired)
                | (EmailSent, EmailError)
                | (InWaitingLine, EmailSent)
        )
    }
}

/// Soft-delete state of a user row. Only `Active` rows are scheduled.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStatus {
    Inactive,
    Active,
    Deleted,
}

impl LifecycleStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::Inactive => 3,
            Self::Active => 5,
            Self::Deleted => 9,
        }
    }
}

/// A row of the `users` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    pub registered_at: i64,
    pub send_after: i64,
    pub airdrop_status: i64,
    pub invitation_sent_at: Option<i64>,
    pub status: i64,
}

impl UserRecord {
    pub fn airdrop_status(&self) -> Result<AirdropStatus> {
        AirdropStatus::from_code(self.airdrop_status).ok_or_else(|| {
            SchedulerError::Transition(format!(
                "user {} has unknown airdrop_status {}",
                self.id, self.airdrop_status
            ))
        })
    }

    fn check_transition(&self, next: AirdropStatus) -> Result<()> {
        let current = self.airdrop_status()?;
        if current.can_transition_to(next) {
            return Ok(());
        }
        Err(SchedulerError::Transition(format!(
            "user {}: {} -> {}",
            self.id,
            current.as_str(),
            next.as_str()
        )))
    }
}

/// A status change decided during a run, written back in bulk before commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedTransition {
    pub user_id: i64,
    pub email: String,
    pub status: AirdropStatus,
    pub invitation_sent_at: Option<i64>,
}

impl StagedTransition {
    /// Stage `user` moving to `next` at `now`.
    ///
    /// `invitation_sent_at` is stamped only when entering `EMAIL_SENT`;
    /// otherwise the row keeps the value it already had.
    pub fn new(user: &UserRecord, next: AirdropStatus, now: i64) -> Result<Self> {
        user.check_transition(next)?;

        let invitation_sent_at = if next == AirdropStatus::EmailSent {
            Some(now)
        } else {
            user.invitation_sent_at
        };

        Ok(Self {
            user_id: user.id,
            email: user.email.clone(),
            status: next,
            invitation_sent_at,
        })
    }
}

/// Ids of `users`, after checking each may move to `next`.
pub fn transition_ids(users: &[UserRecord], next: AirdropStatus) -> Result<Vec<i64>> {
    users
        .iter()
        .map(|user| user.check_transition(next).map(|()| user.id))
        .collect()
}

/// Slots left under `max_supply` given `reserved` holders. Never negative.
pub fn available_slots(max_supply: u64, reserved: i64) -> usize {
    let max = i64::try_from(max_supply).unwrap_or(i64::MAX);
    usize::try_from(max.saturating_sub(reserved)).unwrap_or(0)
}
