//! Sync gateway endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use sahay_core::sync::{SyncEnvelope, SyncItemResult};

use crate::state::AppState;

use super::{actor_context, authenticate, error::ApiError};

/// Batch request body.
#[derive(Debug, Deserialize)]
pub struct SyncBatchRequest {
    pub events: Vec<SyncEnvelope>,
}

/// Batch response: one outcome per item, in the submitted order.
#[derive(Debug, Serialize)]
pub struct SyncBatchResponse {
    pub results: Vec<SyncItemResult>,
}

/// `POST /sync/events/batch`
pub async fn submit_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SyncBatchRequest>,
) -> Result<Json<SyncBatchResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let actor = actor_context(Some(&user), &headers);

    let results = state
        .sync
        .submit_batch(&actor, &user.user_id, &body.events, Utc::now())?;

    for item in &results {
        state
            .metrics
            .sync_items_total
            .with_label_values(&[item.outcome.as_str()])
            .inc();
    }
    Ok(Json(SyncBatchResponse { results }))
}
