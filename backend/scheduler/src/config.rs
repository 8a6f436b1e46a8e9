//! Application configuration loaded from environment variables.

use std::str::FromStr;

use crate::errors::{Result, SchedulerError};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Global supply cap. `None` when `MAX_SUPPLY` is unset or 0 (uncapped).
    pub max_supply: Option<u64>,
    /// How long (in hours) a claim invitation stays valid
    pub claim_expires_in_hours: u32,
    /// Seconds between dispatcher runs
    pub dispatch_interval_secs: u64,
    /// Seconds between sweeper runs
    pub sweep_interval_secs: u64,
    /// Public frontend URL, used to build claim links
    pub app_url: String,
    /// HMAC key used to sign claim tokens
    pub claim_token_secret: String,
    /// HTTP mail relay endpoint; `None` falls back to logging messages
    pub mail_api_url: Option<String>,
    pub mail_api_key: Option<String>,
    pub mail_sender_name: String,
    /// Port for the operator status API
    pub api_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let max_supply: u64 = parse_or("MAX_SUPPLY", 0)?;

        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./airdrop.db".to_string()),
            max_supply: (max_supply > 0).then_some(max_supply),
            claim_expires_in_hours: parse_or("CLAIM_EXPIRES_IN", 24)?,
            dispatch_interval_secs: parse_or("DISPATCH_INTERVAL_SECS", 60)?,
            sweep_interval_secs: parse_or("SWEEP_INTERVAL_SECS", 60)?,
            app_url: env_var("APP_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            claim_token_secret: env_var("CLAIM_TOKEN_SECRET").map_err(|_| {
                SchedulerError::Config(
                    "CLAIM_TOKEN_SECRET environment variable is required".to_string(),
                )
            })?,
            mail_api_url: env_var("MAIL_API_URL").ok().filter(|v| !v.is_empty()),
            mail_api_key: env_var("MAIL_API_KEY").ok().filter(|v| !v.is_empty()),
            mail_sender_name: env_var("MAIL_SENDER_NAME")
                .unwrap_or_else(|_| "Airdrop".to_string()),
            api_port: parse_or("API_PORT", 3001)?,
        })
    }

    /// Claim window in seconds.
    pub fn claim_window_secs(&self) -> i64 {
        i64::from(self.claim_expires_in_hours) * 3600
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| SchedulerError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| SchedulerError::Config(format!("Invalid {key}"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    /// Baseline configuration for unit tests.
    pub fn for_tests(max_supply: Option<u64>) -> Self {
        Config {
            database_url: "sqlite::memory:".to_string(),
            max_supply,
            claim_expires_in_hours: 24,
            dispatch_interval_secs: 60,
            sweep_interval_secs: 60,
            app_url: "https://airdrop.test".to_string(),
            claim_token_secret: "test-secret".to_string(),
            mail_api_url: None,
            mail_api_key: None,
            mail_sender_name: "Airdrop".to_string(),
            api_port: 0,
        }
    }
}
