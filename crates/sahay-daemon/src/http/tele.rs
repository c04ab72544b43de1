//! Tele-consultation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;

use sahay_core::tele::{Prescription, TeleRequest, TeleStatus};

use crate::state::AppState;

use super::{actor_context, authenticate, error::ApiError};

/// New request body.
#[derive(Debug, Deserialize)]
pub struct TeleRequestCreate {
    pub symptom_summary: String,
    pub preferred_time: Option<String>,
}

/// Status transition body.
#[derive(Debug, Deserialize)]
pub struct TeleStatusUpdate {
    pub status: String,
}

/// Prescription body.
#[derive(Debug, Deserialize)]
pub struct PrescriptionCreate {
    pub tele_request_id: String,
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
    pub summary_text: String,
}

/// `POST /tele/requests`
pub async fn create_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TeleRequestCreate>,
) -> Result<Json<TeleRequest>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let actor = actor_context(Some(&user), &headers);
    let now = Utc::now();

    let request = state.tele.create_request(
        &actor,
        &user.user_id,
        &body.symptom_summary,
        body.preferred_time.as_deref(),
        now,
    )?;

    state.analytics.emit_opportunistic(
        &actor,
        Some(&user.user_id),
        "tele_request_created",
        None,
        None,
        now,
    )?;
    Ok(Json(request))
}

/// `PATCH /tele/requests/{id}` — clinician-only status transitions.
pub async fn update_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<TeleStatusUpdate>,
) -> Result<Json<TeleRequest>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let actor = actor_context(Some(&user), &headers);
    let now = Utc::now();

    let status = TeleStatus::parse(&body.status)?;
    let request = state.tele.update_status(&actor, &user, &id, status, now)?;

    if status == TeleStatus::Completed {
        state.analytics.emit_opportunistic(
            &actor,
            Some(&request.citizen_id),
            "tele_consultation_completed",
            None,
            None,
            now,
        )?;
    }
    Ok(Json(request))
}

/// `POST /prescriptions` — clinician only.
pub async fn create_prescription(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PrescriptionCreate>,
) -> Result<Json<Prescription>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let actor = actor_context(Some(&user), &headers);
    let prescription = state.tele.create_prescription(
        &actor,
        &user,
        &body.tele_request_id,
        &body.items,
        &body.summary_text,
        Utc::now(),
    )?;
    Ok(Json(prescription))
}

#[cfg(test)]
mod tests {
    use sahay_core::identity::Role;

    use super::super::testutil::{grant_role, register_user, test_state};
    use super::*;

    #[tokio::test]
    async fn full_consult_flow() {
        let state = test_state();
        let (_citizen, citizen_headers) = register_user(&state, "9876500040");
        let (doc_id, doc_headers) = register_user(&state, "9876500041");
        grant_role(&state, &doc_id, Role::Clinician);

        let request = create_request(
            State(state.clone()),
            citizen_headers.clone(),
            Json(TeleRequestCreate {
                symptom_summary: "fever and fatigue".into(),
                preferred_time: None,
            }),
        )
        .await
        .unwrap();

        // Citizen cannot advance status.
        let denied = update_status(
            State(state.clone()),
            citizen_headers,
            Path(request.id.clone()),
            Json(TeleStatusUpdate {
                status: "scheduled".into(),
            }),
        )
        .await;
        assert!(matches!(
            denied,
            Err(ApiError(sahay_core::Error::Forbidden))
        ));

        for status in ["scheduled", "in_progress", "completed"] {
            update_status(
                State(state.clone()),
                doc_headers.clone(),
                Path(request.id.clone()),
                Json(TeleStatusUpdate {
                    status: status.into(),
                }),
            )
            .await
            .unwrap();
        }

        let summary = "Continue the prescribed course for five full days, take each dose \
                       after a meal with water, avoid cold drinks, rest well, and come \
                       back for review if the fever has not settled within three days.";
        let prescription = create_prescription(
            State(state),
            doc_headers,
            Json(PrescriptionCreate {
                tele_request_id: request.id.clone(),
                items: vec![serde_json::json!({"drug": "ors", "dose": "1 sachet"})],
                summary_text: summary.into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(prescription.tele_request_id, request.id);
    }
}
