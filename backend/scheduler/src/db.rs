//! Database layer — pool setup, migrations, and the scheduler's queries.
//!
//! SQLite has no `SELECT … FOR UPDATE`. Every scheduler run instead opens its
//! transaction with a write to `scheduler_lock`, which takes the database
//! write lock for the rest of the transaction. Rows a run selects afterwards
//! cannot change under it until it commits or rolls back.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{Result, SchedulerError};
use crate::users::{
    AirdropStatus, LifecycleStatus, StagedTransition, UserRecord, RESERVING_STATUSES,
};

/// How long a single lock attempt waits inside SQLite before `begin_locked`
/// backs off and tries again.
const BUSY_TIMEOUT_SECS: u64 = 5;

/// Pause between lock attempts while another run holds the write lock.
const LOCK_RETRY_MS: u64 = 250;

/// Primary result code for `SQLITE_BUSY`; extended codes share the low byte.
const SQLITE_BUSY: i32 = 5;

/// Rows per bulk statement. Keeps bind parameters well below SQLite's limit.
const BULK_CHUNK: usize = 500;

const USER_COLUMNS: &str =
    "id, email, registered_at, send_after, airdrop_status, invitation_sent_at, status";

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    init_pool_with(database_url, Duration::from_secs(BUSY_TIMEOUT_SECS)).await
}

/// [`init_pool`] with an explicit per-attempt busy timeout.
pub async fn init_pool_with(database_url: &str, busy_timeout: Duration) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Run transactions
// ─────────────────────────────────────────────────────────

/// Begin a scheduler run: open a transaction and take the write lock.
///
/// Blocks until a competing run commits or rolls back; only `shutdown`
/// ends the wait early, with [`SchedulerError::Cancelled`].
///
/// The returned transaction owns its pooled connection. Dropping it without
/// committing rolls back and hands the connection back to the pool.
pub async fn begin_locked(
    pool: &SqlitePool,
    holder: &str,
    now: i64,
    shutdown: &CancellationToken,
) -> Result<Transaction<'static, Sqlite>> {
    loop {
        let mut tx = pool.begin().await?;

        let locked =
            sqlx::query("UPDATE scheduler_lock SET holder = ?1, acquired_at = ?2 WHERE id = 1")
                .bind(holder)
                .bind(now)
                .execute(&mut *tx)
                .await;

        match locked {
            Ok(_) => {
                debug!(holder, "scheduler lock acquired");
                return Ok(tx);
            }
            Err(e) if is_busy(&e) => {
                let _ = tx.rollback().await;
                debug!(holder, "scheduler lock held by another run, waiting");
            }
            Err(e) => return Err(e.into()),
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(SchedulerError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(LOCK_RETRY_MS)) => {}
        }
    }
}

fn is_busy(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|db| db.code())
        .and_then(|code| code.parse::<i32>().ok())
        .map_or(false, |code| code & 0xff == SQLITE_BUSY)
}

// ─────────────────────────────────────────────────────────
// Supply accounting
// ─────────────────────────────────────────────────────────

/// Number of active users currently holding a unit of supply.
pub async fn count_reserving_active(pool: &SqlitePool) -> Result<i64> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(id) FROM users WHERE status = ");
    qb.push_bind(LifecycleStatus::Active.code());
    qb.push(" AND airdrop_status IN (");
    let mut codes = qb.separated(", ");
    for status in RESERVING_STATUSES {
        codes.push_bind(status.code());
    }
    codes.push_unseparated(")");

    let total = qb.build_query_scalar::<i64>().fetch_one(pool).await?;
    Ok(total)
}

/// Active users per airdrop status code.
pub async fn status_counts(pool: &SqlitePool) -> Result<Vec<(i64, i64)>> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT airdrop_status, COUNT(id)
        FROM   users
        WHERE  status = ?1
        GROUP  BY airdrop_status
        ORDER  BY airdrop_status ASC
        "#,
    )
    .bind(LifecycleStatus::Active.code())
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Dispatcher queries
// ─────────────────────────────────────────────────────────

/// Active `PENDING` users whose `send_after` lies before `now`, in id order.
pub async fn select_pending(conn: &mut SqliteConnection, now: i64) -> Result<Vec<UserRecord>> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users \
         WHERE airdrop_status = ?1 AND status = ?2 AND send_after < ?3 \
         ORDER BY id ASC"
    );
    let rows = sqlx::query_as::<_, UserRecord>(&sql)
        .bind(AirdropStatus::Pending.code())
        .bind(LifecycleStatus::Active.code())
        .bind(now)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows)
}

/// Write staged transitions back as bulk upserts keyed on `id`.
pub async fn apply_transitions(
    conn: &mut SqliteConnection,
    transitions: &[StagedTransition],
) -> Result<u64> {
    let mut affected = 0u64;
    for chunk in transitions.chunks(BULK_CHUNK) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO users (id, email, airdrop_status, invitation_sent_at) ",
        );
        qb.push_values(chunk, |mut row, t| {
            row.push_bind(t.user_id)
                .push_bind(t.email.as_str())
                .push_bind(t.status.code())
                .push_bind(t.invitation_sent_at);
        });
        qb.push(
            " ON CONFLICT(id) DO UPDATE SET \
             airdrop_status = excluded.airdrop_status, \
             invitation_sent_at = excluded.invitation_sent_at",
        );

        affected += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

// ─────────────────────────────────────────────────────────
// Sweeper queries
// ─────────────────────────────────────────────────────────

/// Active `EMAIL_SENT` users invited strictly before `cutoff`.
pub async fn select_expired_claims(
    conn: &mut SqliteConnection,
    cutoff: i64,
) -> Result<Vec<UserRecord>> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users \
         WHERE airdrop_status = ?1 AND status = ?2 AND invitation_sent_at < ?3 \
         ORDER BY id ASC"
    );
    let rows = sqlx::query_as::<_, UserRecord>(&sql)
        .bind(AirdropStatus::EmailSent.code())
        .bind(LifecycleStatus::Active.code())
        .bind(cutoff)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows)
}

/// Oldest `limit` active users in the waiting line (registration order).
pub async fn select_waiting_line(
    conn: &mut SqliteConnection,
    limit: i64,
) -> Result<Vec<UserRecord>> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users \
         WHERE airdrop_status = ?1 AND status = ?2 \
         ORDER BY registered_at ASC, id ASC \
         LIMIT ?3"
    );
    let rows = sqlx::query_as::<_, UserRecord>(&sql)
        .bind(AirdropStatus::InWaitingLine.code())
        .bind(LifecycleStatus::Active.code())
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows)
}

/// Set `status` on every id in `ids`. When `invitation_sent_at` is given it
/// is written too.
pub async fn set_status(
    conn: &mut SqliteConnection,
    ids: &[i64],
    status: AirdropStatus,
    invitation_sent_at: Option<i64>,
) -> Result<u64> {
    let mut affected = 0u64;
    for chunk in ids.chunks(BULK_CHUNK) {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE users SET airdrop_status = ");
        qb.push_bind(status.code());
        if let Some(sent_at) = invitation_sent_at {
            qb.push(", invitation_sent_at = ");
            qb.push_bind(sent_at);
        }
        qb.push(" WHERE id IN (");
        let mut list = qb.separated(", ");
        for id in chunk {
            list.push_bind(*id);
        }
        list.push_unseparated(")");

        affected += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

/// Point update used when a promoted user's invitation cannot be delivered.
pub async fn mark_email_error(conn: &mut SqliteConnection, user_id: i64) -> Result<()> {
    sqlx::query("UPDATE users SET airdrop_status = ?1 WHERE id = ?2")
        .bind(AirdropStatus::EmailError.code())
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fetch_user, file_pool, memory_pool, seed_user, SeedUser};

    #[tokio::test]
    async fn counts_only_active_reserving_users() {
        let pool = memory_pool().await;
        seed_user(&pool, SeedUser::new("a@x.io").status(AirdropStatus::EmailSent)).await;
        seed_user(&pool, SeedUser::new("b@x.io").status(AirdropStatus::InWaitingLine)).await;
        seed_user(&pool, SeedUser::new("c@x.io").status(AirdropStatus::AirdropCompleted)).await;
        seed_user(&pool, SeedUser::new("d@x.io").status(AirdropStatus::Pending)).await;
        seed_user(&pool, SeedUser::new("e@x.io").status(AirdropStatus::AirdropClaimExpired)).await;
        seed_user(
            &pool,
            SeedUser::new("f@x.io")
                .status(AirdropStatus::EmailSent)
                .lifecycle(LifecycleStatus::Deleted),
        )
        .await;

        assert_eq!(count_reserving_active(&pool).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn pending_selection_respects_send_after_and_lifecycle() {
        let pool = memory_pool().await;
        let ready = seed_user(&pool, SeedUser::new("ready@x.io").send_after(10)).await;
        seed_user(&pool, SeedUser::new("later@x.io").send_after(5_000)).await;
        seed_user(
            &pool,
            SeedUser::new("off@x.io").send_after(10).lifecycle(LifecycleStatus::Inactive),
        )
        .await;

        let mut tx = begin_locked(&pool, "test", 1_000, &CancellationToken::new())
            .await
            .unwrap();
        let rows = select_pending(&mut tx, 1_000).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, ready);
    }

    #[tokio::test]
    async fn apply_transitions_updates_existing_rows() {
        let pool = memory_pool().await;
        let id = seed_user(&pool, SeedUser::new("a@x.io").registered_at(42)).await;
        let user = fetch_user(&pool, id).await;

        let staged = StagedTransition::new(&user, AirdropStatus::EmailSent, 900).unwrap();
        let mut tx = begin_locked(&pool, "test", 900, &CancellationToken::new())
            .await
            .unwrap();
        apply_transitions(&mut tx, &[staged]).await.unwrap();
        tx.commit().await.unwrap();

        let after = fetch_user(&pool, id).await;
        assert_eq!(after.airdrop_status, AirdropStatus::EmailSent.code());
        assert_eq!(after.invitation_sent_at, Some(900));
        assert_eq!(after.registered_at, 42);
        assert_eq!(after.email, "a@x.io");
    }

    #[tokio::test]
    async fn rollback_discards_staged_changes() {
        let pool = memory_pool().await;
        let id = seed_user(&pool, SeedUser::new("a@x.io")).await;

        let mut tx = begin_locked(&pool, "test", 900, &CancellationToken::new())
            .await
            .unwrap();
        set_status(&mut tx, &[id], AirdropStatus::EmailError, None).await.unwrap();
        tx.rollback().await.unwrap();

        let after = fetch_user(&pool, id).await;
        assert_eq!(after.airdrop_status, AirdropStatus::Pending.code());
    }

    #[tokio::test]
    async fn waiting_line_is_fifo_by_registration() {
        let pool = memory_pool().await;
        let late = seed_user(
            &pool,
            SeedUser::new("late@x.io").status(AirdropStatus::InWaitingLine).registered_at(300),
        )
        .await;
        let early = seed_user(
            &pool,
            SeedUser::new("early@x.io").status(AirdropStatus::InWaitingLine).registered_at(100),
        )
        .await;
        let middle = seed_user(
            &pool,
            SeedUser::new("middle@x.io").status(AirdropStatus::InWaitingLine).registered_at(200),
        )
        .await;

        let mut tx = begin_locked(&pool, "test", 1_000, &CancellationToken::new())
            .await
            .unwrap();
        let rows = select_waiting_line(&mut tx, 2).await.unwrap();
        tx.rollback().await.unwrap();

        let ids: Vec<i64> = rows.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![early, middle]);
        assert!(!ids.contains(&late));
    }

    #[tokio::test]
    async fn status_counts_groups_active_users() {
        let pool = memory_pool().await;
        seed_user(&pool, SeedUser::new("a@x.io")).await;
        seed_user(&pool, SeedUser::new("b@x.io")).await;
        seed_user(&pool, SeedUser::new("c@x.io").status(AirdropStatus::EmailSent)).await;

        let counts = status_counts(&pool).await.unwrap();
        assert_eq!(
            counts,
            vec![(AirdropStatus::Pending.code(), 2), (AirdropStatus::EmailSent.code(), 1)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lock_wait_outlasts_busy_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let pool = file_pool(&dir).await;
        let shutdown = CancellationToken::new();

        let holder = begin_locked(&pool, "first", 1_000, &shutdown).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let tx = begin_locked(&pool, "second", 1_001, &shutdown).await?;
                tx.commit().await?;
                Ok::<_, SchedulerError>(())
            })
        };

        // Several busy timeouts pass while the first run holds the lock.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!waiter.is_finished());

        holder.commit().await.unwrap();
        waiter.await.unwrap().unwrap();

        let current: String = sqlx::query_scalar("SELECT holder FROM scheduler_lock WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(current, "second");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lock_wait_ends_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let pool = file_pool(&dir).await;

        let _holder = begin_locked(&pool, "first", 1_000, &CancellationToken::new())
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let waiter = {
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { begin_locked(&pool, "second", 1_001, &shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SchedulerError::Cancelled)));
    }
}
