//! Fixtures for unit tests: an in-memory store, seeded users and a
//! notifier that records what it was asked to send.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db;
use crate::errors::{Result, SchedulerError};
use crate::mailer::{EmailMessage, Notifier};
use crate::scheduler::SchedulerState;
use crate::token::HmacTokenMinter;
use crate::users::{AirdropStatus, LifecycleStatus, UserRecord};

/// Single-connection in-memory database with migrations applied.
///
/// Every connection to `sqlite::memory:` is its own database, so the pool is
/// pinned to one connection that never idles out.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    pool
}

/// File-backed database in `dir` with a short busy timeout, for tests where
/// several connections contend for the write lock.
pub async fn file_pool(dir: &tempfile::TempDir) -> SqlitePool {
    let path = dir.path().join("scheduler.db");
    db::init_pool_with(&path.to_string_lossy(), Duration::from_millis(100))
        .await
        .expect("open file-backed sqlite")
}

pub struct SeedUser {
    email: String,
    registered_at: i64,
    send_after: i64,
    status: AirdropStatus,
    invitation_sent_at: Option<i64>,
    lifecycle: LifecycleStatus,
}

impl SeedUser {
    pub fn new(email: &str) -> Self {
        Self {
            email: email.to_string(),
            registered_at: 0,
            send_after: 0,
            status: AirdropStatus::Pending,
            invitation_sent_at: None,
            lifecycle: LifecycleStatus::Active,
        }
    }

    pub fn status(mut self, status: AirdropStatus) -> Self {
        self.status = status;
        self
    }

    pub fn registered_at(mut self, at: i64) -> Self {
        self.registered_at = at;
        self
    }

    pub fn send_after(mut self, at: i64) -> Self {
        self.send_after = at;
        self
    }

    pub fn invited_at(mut self, at: i64) -> Self {
        self.invitation_sent_at = Some(at);
        self
    }

    pub fn lifecycle(mut self, lifecycle: LifecycleStatus) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

/// Insert a user and return its id.
pub async fn seed_user(pool: &SqlitePool, user: SeedUser) -> i64 {
    sqlx::query(
        r#"
        INSERT INTO users
            (email, registered_at, send_after, airdrop_status, invitation_sent_at, status)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&user.email)
    .bind(user.registered_at)
    .bind(user.send_after)
    .bind(user.status.code())
    .bind(user.invitation_sent_at)
    .bind(user.lifecycle.code())
    .execute(pool)
    .await
    .expect("seed user")
    .last_insert_rowid()
}

pub async fn fetch_user(pool: &SqlitePool, id: i64) -> UserRecord {
    sqlx::query_as::<_, UserRecord>(
        "SELECT id, email, registered_at, send_after, airdrop_status, invitation_sent_at, status \
         FROM users WHERE id = ?1",
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .expect("fetch user")
}

pub async fn status_of(pool: &SqlitePool, id: i64) -> AirdropStatus {
    fetch_user(pool, id)
        .await
        .airdrop_status()
        .expect("known status")
}

pub async fn count_in(pool: &SqlitePool, status: AirdropStatus) -> i64 {
    sqlx::query_scalar("SELECT COUNT(id) FROM users WHERE airdrop_status = ?1")
        .bind(status.code())
        .fetch_one(pool)
        .await
        .expect("count users")
}

/// Records every message; fails sends to the configured addresses.
#[derive(Default)]
pub struct RecordingNotifier {
    failing: HashSet<String>,
    delay: Option<Duration>,
    sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingNotifier {
    pub fn failing_for(addresses: &[&str]) -> Self {
        Self {
            failing: addresses.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Every send takes `delay` before it is recorded.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().expect("notifier lock").clone()
    }

    pub fn sent_with_template(&self, template: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|m| m.template == template)
            .flat_map(|m| m.recipients)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().expect("notifier lock").push(message.clone());
        if message.recipients.iter().any(|r| self.failing.contains(r)) {
            return Err(SchedulerError::Delivery(format!(
                "refused {:?}",
                message.recipients
            )));
        }
        Ok(())
    }
}

pub fn state_with(
    pool: SqlitePool,
    max_supply: Option<u64>,
    notifier: Arc<RecordingNotifier>,
) -> SchedulerState {
    let config = Config::for_tests(max_supply);
    let minter = HmacTokenMinter::new(&config.claim_token_secret, config.claim_window_secs());
    SchedulerState {
        pool,
        config,
        notifier,
        minter: Arc::new(minter),
        shutdown: CancellationToken::new(),
    }
}
