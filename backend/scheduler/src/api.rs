//! Axum handlers for the read-only operator API.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db;
use crate::users::{available_slots, AirdropStatus};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub max_supply: Option<u64>,
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct StatsResponse {
    /// Active users per airdrop status.
    pub users: BTreeMap<&'static str, i64>,
    /// Active users holding a unit of supply.
    pub reserved: i64,
    pub max_supply: Option<u64>,
    /// Slots left; `None` when uncapped.
    pub available: Option<usize>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /stats`
///
/// Current airdrop progress and remaining supply.
pub async fn get_stats(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match db::status_counts(&state.pool).await {
        Ok(counts) => (
            StatusCode::OK,
            Json(serde_json::json!(summarize(&counts, state.max_supply))),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!(ErrorResponse {
                error: e.to_string()
            })),
        )
            .into_response(),
    }
}

fn summarize(counts: &[(i64, i64)], max_supply: Option<u64>) -> StatsResponse {
    let mut users = BTreeMap::new();
    let mut reserved = 0;

    for &(code, count) in counts {
        let Some(status) = AirdropStatus::from_code(code) else {
            continue;
        };
        if status.reserves_supply() {
            reserved += count;
        }
        users.insert(status.as_str(), count);
    }

    StatsResponse {
        users,
        reserved,
        max_supply,
        available: max_supply.map(|max| available_slots(max, reserved)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_counts_reserving_statuses() {
        let counts = vec![
            (AirdropStatus::Pending.code(), 4),
            (AirdropStatus::EmailSent.code(), 3),
            (AirdropStatus::InWaitingLine.code(), 2),
            (AirdropStatus::AirdropClaimExpired.code(), 6),
        ];

        let stats = summarize(&counts, Some(10));

        assert_eq!(stats.reserved, 5);
        assert_eq!(stats.available, Some(5));
        assert_eq!(stats.users.get("pending"), Some(&4));
        assert_eq!(stats.users.get("airdrop_claim_expired"), Some(&6));
    }

    #[test]
    fn summarize_uncapped_has_no_availability() {
        let stats = summarize(&[(AirdropStatus::EmailSent.code(), 50)], None);
        assert_eq!(stats.available, None);
        assert_eq!(stats.reserved, 50);
    }

    #[test]
    fn summarize_ignores_unknown_codes() {
        let stats = summarize(&[(99, 1)], Some(1));
        assert!(stats.users.is_empty());
        assert_eq!(stats.available, Some(1));
    }
}
