//! Triage endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;

use sahay_core::triage::{Language, TriageCategory, TriageInput, TriageSession};

use crate::state::AppState;

use super::{actor_context, authenticate, error::ApiError};

/// Triage request body.
#[derive(Debug, Deserialize)]
pub struct TriageRequest {
    pub symptoms_text: String,
    pub age: Option<u32>,
    pub sex: Option<String>,
    #[serde(default)]
    pub pregnancy: bool,
    /// Language tag (`en`, `hi`); defaults to English.
    pub language: Option<String>,
}

/// `POST /triage/sessions`
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TriageRequest>,
) -> Result<Json<TriageSession>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let actor = actor_context(Some(&user), &headers);
    let now = Utc::now();

    let input = TriageInput {
        symptoms_text: body.symptoms_text,
        age: body.age,
        sex: body.sex,
        pregnancy: body.pregnancy,
        language: Language::from_tag(body.language.as_deref().unwrap_or("en")),
    };
    let session = state
        .triage
        .create_session(&actor, &user.user_id, &input, now)?;

    // Consent is re-checked inside the emission; a missing grant skips the
    // event without failing the triage.
    let event_type = if session.category == TriageCategory::Emergency {
        "triage_emergency"
    } else {
        "triage_completed"
    };
    let emitted = state.analytics.emit_opportunistic(
        &actor,
        Some(&user.user_id),
        event_type,
        Some(session.category.as_str()),
        Some(serde_json::json!({ "has_red_flags": !session.red_flags.is_empty() })),
        now,
    )?;
    if emitted.is_some() {
        state.metrics.analytics_events_total.inc();
    }

    Ok(Json(session))
}

/// `GET /triage/sessions/{id}` — owner only.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<TriageSession>, ApiError> {
    let user = authenticate(&state, &headers)?;
    Ok(Json(state.triage.get_session(&user, &id)?))
}
