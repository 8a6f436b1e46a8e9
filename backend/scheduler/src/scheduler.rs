//! State shared by the dispatcher and the sweeper, plus the send helpers
//! both use.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::errors::Result;
use crate::mailer::{self, Notifier};
use crate::token::TokenMinter;

pub struct SchedulerState {
    pub pool: SqlitePool,
    pub config: Config,
    pub notifier: Arc<dyn Notifier>,
    pub minter: Arc<dyn TokenMinter>,
    /// Stops the periodic loops and abandons a pending wait for the lock.
    pub shutdown: CancellationToken,
}

impl SchedulerState {
    /// Mint a claim token for `email` and send the claim invitation.
    ///
    /// A minting error is reported like a delivery error: the user did not
    /// get a usable link.
    pub async fn send_claim_invitation(&self, email: &str, now: i64) -> Result<()> {
        let token = self.minter.mint(email, now)?;
        let message = mailer::claim_invitation(&self.config, email, &token);
        self.notifier.send(&message).await
    }

    pub async fn send_waiting_line_notice(&self, email: &str) -> Result<()> {
        let message = mailer::waiting_line_notice(&self.config, email);
        self.notifier.send(&message).await
    }
}
