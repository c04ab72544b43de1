//! Analytics endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;

use sahay_core::analytics::DeidentifiedEvent;
use sahay_core::analytics::query::{QueryFilter, Report, SummaryRow};
use sahay_core::identity::Role;

use crate::state::AppState;

use super::{actor_context, authenticate, error::ApiError};

/// Officer roles allowed on aggregate read surfaces.
pub(crate) const OFFICER_ROLES: [Role; 3] = [
    Role::DistrictOfficer,
    Role::StateOfficer,
    Role::NationalAdmin,
];

/// Emission request body.
#[derive(Debug, Deserialize)]
pub struct EmitRequest {
    pub event_type: String,
    pub category: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Shared query parameters for aggregate endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct AggregateParams {
    pub from: Option<String>,
    pub to: Option<String>,
    pub event_type: Option<String>,
}

impl AggregateParams {
    pub(crate) fn into_filter(self) -> QueryFilter {
        QueryFilter {
            from: self.from,
            to: self.to,
            event_type: self.event_type,
        }
    }
}

/// `POST /analytics/events` — consent-gated emission.
pub async fn emit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<EmitRequest>,
) -> Result<Json<DeidentifiedEvent>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let actor = actor_context(Some(&user), &headers);

    let event = state.analytics.emit(
        &actor,
        &user.user_id,
        &body.event_type,
        body.category.as_deref(),
        body.metadata,
        Utc::now(),
    )?;
    state.metrics.analytics_events_total.inc();
    Ok(Json(event))
}

/// `GET /analytics/summary` — officer view, k-filtered.
pub async fn summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<AggregateParams>,
) -> Result<Json<Report<SummaryRow>>, ApiError> {
    let user = authenticate(&state, &headers)?;
    user.require_any(&OFFICER_ROLES)?;

    // Fold buffered counts in before answering, so a fresh emission is
    // visible to the officer who just caused it.
    state.analytics.flush(Utc::now())?;
    Ok(Json(state.analytics.summary(&params.into_filter())?))
}

#[cfg(test)]
mod tests {
    use sahay_core::Error;
    use sahay_core::consent::{ConsentCategory, ConsentScope};

    use super::super::testutil::{grant_role, register_user, test_state};
    use super::*;

    fn emit_body() -> EmitRequest {
        EmitRequest {
            event_type: "daily_wellness_logged".into(),
            category: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn consent_revocation_blocks_next_emission() {
        let state = test_state();
        let (user_id, headers) = register_user(&state, "9876500060");

        // No consent yet.
        let denied = emit(State(state.clone()), headers.clone(), Json(emit_body())).await;
        assert!(matches!(
            denied,
            Err(ApiError(Error::ConsentMissing { .. }))
        ));

        let actor = sahay_core::audit::ActorContext::user(&user_id);
        state
            .consents
            .grant(
                &actor,
                &user_id,
                ConsentCategory::Analytics,
                ConsentScope::GovAggregated,
                true,
                Utc::now(),
            )
            .unwrap();
        emit(State(state.clone()), headers.clone(), Json(emit_body()))
            .await
            .unwrap();

        state
            .consents
            .grant(
                &actor,
                &user_id,
                ConsentCategory::Analytics,
                ConsentScope::GovAggregated,
                false,
                Utc::now() + chrono::Duration::seconds(1),
            )
            .unwrap();
        let denied = emit(State(state), headers, Json(emit_body())).await;
        assert!(matches!(
            denied,
            Err(ApiError(Error::ConsentMissing { .. }))
        ));
    }

    #[tokio::test]
    async fn summary_requires_officer_role() {
        let state = test_state();
        let (_citizen, citizen_headers) = register_user(&state, "9876500061");
        let denied = summary(
            State(state.clone()),
            citizen_headers,
            Query(AggregateParams::default()),
        )
        .await;
        assert!(matches!(denied, Err(ApiError(Error::Forbidden))));

        let (officer_id, officer_headers) = register_user(&state, "9876500062");
        grant_role(&state, &officer_id, Role::DistrictOfficer);
        let report = summary(
            State(state),
            officer_headers,
            Query(AggregateParams::default()),
        )
        .await
        .unwrap();
        assert_eq!(report.report_version, sahay_core::REPORT_VERSION);
    }
}
