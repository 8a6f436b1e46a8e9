//! Outbound email — the `Notifier` seam and its implementations.
//!
//! Delivery is per message: an `Err` from [`Notifier::send`] means this
//! recipient was not reached, nothing more. Callers decide what that does to
//! the user's status.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::{Result, SchedulerError};

pub const CLAIM_TEMPLATE: &str = "airdrop-claim";
pub const WAITING_LINE_TEMPLATE: &str = "airdrop-waiting-line";

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// A template-based email, as handed to the mail relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub recipients: Vec<String>,
    pub subject: String,
    pub template: String,
    pub vars: Value,
    pub sender_name: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Claim invitation carrying the signed claim link.
pub fn claim_invitation(config: &Config, email: &str, token: &str) -> EmailMessage {
    EmailMessage {
        recipients: vec![email.to_string()],
        subject: "Claim your airdrop".to_string(),
        template: CLAIM_TEMPLATE.to_string(),
        vars: json!({
            "appUrl": config.app_url,
            "link": format!("{}/claim?token={token}", config.app_url),
            "claimExpiresIn": config.claim_expires_in_hours,
        }),
        sender_name: config.mail_sender_name.clone(),
    }
}

/// Notice that supply ran out and the user is queued.
pub fn waiting_line_notice(config: &Config, email: &str) -> EmailMessage {
    EmailMessage {
        recipients: vec![email.to_string()],
        subject: "You have been placed on the airdrop waiting line".to_string(),
        template: WAITING_LINE_TEMPLATE.to_string(),
        vars: json!({ "appUrl": config.app_url }),
        sender_name: config.mail_sender_name.clone(),
    }
}

// ─────────────────────────────────────────────────────────
// HTTP relay
// ─────────────────────────────────────────────────────────

/// Posts each message as JSON to a transactional-mail relay.
pub struct HttpMailer {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpMailer {
    pub fn new(url: String, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url,
            api_key,
        })
    }
}

#[async_trait]
impl Notifier for HttpMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let mut request = self.client.post(&self.url).json(message);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SchedulerError::Delivery(format!("mail relay unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulerError::Delivery(format!(
                "mail relay returned {status} for template {}: {body}",
                message.template
            )));
        }

        debug!(template = %message.template, "email handed to relay");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Log-only
// ─────────────────────────────────────────────────────────

/// Logs messages instead of sending them. Used when no relay is configured.
pub struct LogMailer;

#[async_trait]
impl Notifier for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            recipients = ?message.recipients,
            template = %message.template,
            vars = %message.vars,
            "email (log only)"
        );
        Ok(())
    }
}

/// Pick the notifier for this configuration.
pub fn from_config(config: &Config) -> Result<Box<dyn Notifier>> {
    match &config.mail_api_url {
        Some(url) => Ok(Box::new(HttpMailer::new(
            url.clone(),
            config.mail_api_key.clone(),
        )?)),
        None => {
            info!("MAIL_API_URL not set — emails will only be logged");
            Ok(Box::new(LogMailer))
        }
    }
}
