//! Audit chain endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use sahay_core::audit::{self, AuditEntry};

use crate::state::AppState;

use super::analytics::OFFICER_ROLES;
use super::{authenticate, error::ApiError};

/// Log listing parameters.
#[derive(Debug, Deserialize)]
pub struct LogParams {
    #[serde(default = "default_log_limit")]
    pub limit: u64,
}

const fn default_log_limit() -> u64 {
    100
}

/// Verification parameters.
#[derive(Debug, Default, Deserialize)]
pub struct VerifyParams {
    /// Checkpoint sequence to start from (defaults to 1).
    pub from: Option<u64>,
}

/// Verification response.
#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub ok: bool,
    pub first_broken_seq: Option<u64>,
}

/// `GET /audit/logs` — officer only.
pub async fn logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<LogParams>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let user = authenticate(&state, &headers)?;
    user.require_any(&OFFICER_ROLES)?;
    let entries = state
        .store
        .with_conn(|conn| audit::list(conn, params.limit))?;
    Ok(Json(entries))
}

/// `GET /audit/verify` — officer only; walks the chain and reports the
/// first break.
pub async fn verify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<VerifyParams>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    user.require_any(&OFFICER_ROLES)?;

    let verification = state
        .store
        .with_conn(|conn| audit::verify(conn, params.from.unwrap_or(1)))?;
    if !verification.ok {
        // Operator alert path: a broken chain is an incident, not a 500.
        tracing::error!(
            first_broken_seq = ?verification.first_broken_seq,
            "audit chain verification failed"
        );
    }
    Ok(Json(VerifyResponse {
        ok: verification.ok,
        first_broken_seq: verification.first_broken_seq,
    }))
}
