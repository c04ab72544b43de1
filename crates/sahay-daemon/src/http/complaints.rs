//! Complaint endpoints.
//!
//! Anonymous complaints are accepted with or without credentials; their
//! audit entries and error responses carry no requester-identifying IP or
//! device.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;

use sahay_core::complaint::{Complaint, ComplaintStatus};

use crate::state::AppState;

use super::{actor_context, authenticate, error::ApiError};

/// New complaint body.
#[derive(Debug, Deserialize)]
pub struct ComplaintCreate {
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub anonymous: bool,
    #[serde(default)]
    pub draft: bool,
}

/// Status transition body.
#[derive(Debug, Deserialize)]
pub struct ComplaintStatusUpdate {
    pub status: String,
    pub reason: Option<String>,
}

/// Closure body.
#[derive(Debug, Deserialize)]
pub struct ComplaintClose {
    pub feedback: String,
}

/// List query parameters.
#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: u64,
}

const fn default_limit() -> u64 {
    20
}

/// `POST /complaints`
pub async fn submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ComplaintCreate>,
) -> Result<Json<Complaint>, ApiError> {
    // Anonymous submissions may arrive without credentials; authenticated
    // submissions resolve the submitter.
    let user = match authenticate(&state, &headers) {
        Ok(user) => Some(user),
        Err(_) if body.anonymous => None,
        Err(err) => return Err(err),
    };
    let actor = actor_context(user.as_ref(), &headers);
    let now = Utc::now();

    let complaint = state.complaints.submit(
        &actor,
        user.as_ref().map(|u| u.user_id.as_str()),
        &body.category,
        &body.description,
        body.anonymous,
        body.draft,
        now,
    )?;

    if !body.draft {
        state.analytics.emit_opportunistic(
            &actor,
            complaint.submitter_id.as_deref(),
            "complaint_submitted",
            Some(&complaint.category),
            None,
            now,
        )?;
    }
    Ok(Json(complaint))
}

/// `GET /complaints/{id}` — submitter or officer.
pub async fn get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Complaint>, ApiError> {
    let user = authenticate(&state, &headers)?;
    Ok(Json(state.complaints.get(&user, &id)?))
}

/// `GET /complaints`
pub async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Complaint>>, ApiError> {
    let user = authenticate(&state, &headers)?;
    Ok(Json(state.complaints.list_for(&user, params.limit)?))
}

/// `PATCH /complaints/{id}/status` — officer only.
pub async fn update_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ComplaintStatusUpdate>,
) -> Result<Json<Complaint>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let actor = actor_context(Some(&user), &headers);
    let now = Utc::now();

    let status = ComplaintStatus::parse(&body.status)?;
    let complaint = state.complaints.update_status(
        &actor,
        &user,
        &id,
        status,
        body.reason.as_deref(),
        now,
    )?;

    if status == ComplaintStatus::Resolved {
        state.analytics.emit_opportunistic(
            &actor,
            complaint.submitter_id.as_deref(),
            "complaint_resolved",
            Some(&complaint.category),
            None,
            now,
        )?;
    }
    Ok(Json(complaint))
}

/// `POST /complaints/{id}/close` — officer only, feedback required.
pub async fn close(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ComplaintClose>,
) -> Result<Json<Complaint>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let actor = actor_context(Some(&user), &headers);
    let complaint = state
        .complaints
        .close(&actor, &user, &id, &body.feedback, Utc::now())?;
    Ok(Json(complaint))
}

#[cfg(test)]
mod tests {
    use sahay_core::audit;
    use sahay_core::identity::Role;

    use super::super::testutil::{grant_role, register_user, test_state};
    use super::*;

    fn create_body(anonymous: bool) -> ComplaintCreate {
        ComplaintCreate {
            category: "service_quality".into(),
            description: "ambulance never arrived".into(),
            anonymous,
            draft: false,
        }
    }

    #[tokio::test]
    async fn anonymous_complaint_without_credentials() {
        let state = test_state();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7".parse().unwrap());
        headers.insert("x-device-id", "dev-7".parse().unwrap());

        let complaint = submit(State(state.clone()), headers, Json(create_body(true)))
            .await
            .unwrap();
        assert!(complaint.anonymous);
        assert!(complaint.submitter_id.is_none());

        // The audit entry for the anonymous write is scrubbed.
        let entries = state
            .store
            .with_conn(|conn| audit::list(conn, 10))
            .unwrap();
        let entry = entries
            .iter()
            .find(|e| e.action == "complaint.create")
            .unwrap();
        assert!(entry.actor_id.is_none());
        assert!(entry.ip.is_none());
        assert!(entry.device.is_none());
    }

    #[tokio::test]
    async fn named_complaint_requires_credentials() {
        let state = test_state();
        let result = submit(State(state), HeaderMap::new(), Json(create_body(false))).await;
        assert!(matches!(
            result,
            Err(ApiError(sahay_core::Error::Unauthorized))
        ));
    }

    #[tokio::test]
    async fn lifecycle_through_the_endpoints() {
        let state = test_state();
        let (_citizen, citizen_headers) = register_user(&state, "9876500050");
        let (officer_id, officer_headers) = register_user(&state, "9876500051");
        grant_role(&state, &officer_id, Role::DistrictOfficer);

        let complaint = submit(
            State(state.clone()),
            citizen_headers.clone(),
            Json(create_body(false)),
        )
        .await
        .unwrap();

        // Submitter reads their own complaint; officers read anything.
        get(
            State(state.clone()),
            citizen_headers.clone(),
            Path(complaint.id.clone()),
        )
        .await
        .unwrap();

        for status in ["under_review", "in_progress", "resolved"] {
            update_status(
                State(state.clone()),
                officer_headers.clone(),
                Path(complaint.id.clone()),
                Json(ComplaintStatusUpdate {
                    status: status.into(),
                    reason: None,
                }),
            )
            .await
            .unwrap();
        }

        // Citizens cannot close.
        let denied = close(
            State(state.clone()),
            citizen_headers,
            Path(complaint.id.clone()),
            Json(ComplaintClose {
                feedback: "thanks".into(),
            }),
        )
        .await;
        assert!(matches!(
            denied,
            Err(ApiError(sahay_core::Error::Forbidden))
        ));

        let closed = close(
            State(state),
            officer_headers,
            Path(complaint.id.clone()),
            Json(ComplaintClose {
                feedback: "resolved to my satisfaction".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(closed.status, ComplaintStatus::Closed);
        assert!(closed.closure_hash.is_some());
    }
}
