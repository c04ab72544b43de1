//! HTTP surface.
//!
//! Every mutating route follows `Auth → RBAC → Consent → Handler → Audit`:
//! handlers resolve the bearer token, enforce role guards, delegate to the
//! core services (which bind the audit append to the domain write), and may
//! emit consent-re-checked analytics afterwards.

pub mod analytics;
pub mod audit;
pub mod auth;
pub mod complaints;
pub mod consents;
pub mod dashboard;
pub mod error;
pub mod sync;
pub mod tele;
pub mod triage;

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use serde_json::json;

use sahay_core::Error;
use sahay_core::audit::ActorContext;
use sahay_core::identity::AuthedUser;

use crate::state::AppState;
use self::error::ApiError;

/// Builds the full API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/metrics", get(metrics))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/consents", post(consents::grant).get(consents::list))
        .route("/sync/events/batch", post(sync::submit_batch))
        .route("/triage/sessions", post(triage::create_session))
        .route("/triage/sessions/:id", get(triage::get_session))
        .route("/tele/requests", post(tele::create_request))
        .route("/tele/requests/:id", patch(tele::update_status))
        .route("/prescriptions", post(tele::create_prescription))
        .route("/complaints", post(complaints::submit).get(complaints::list))
        .route("/complaints/:id", get(complaints::get))
        .route("/complaints/:id/status", patch(complaints::update_status))
        .route("/complaints/:id/close", post(complaints::close))
        .route("/analytics/events", post(analytics::emit))
        .route("/analytics/summary", get(analytics::summary))
        .route("/dashboard/timeseries", get(dashboard::timeseries))
        .route("/dashboard/heatmap", get(dashboard::heatmap))
        .route("/dashboard/categories", get(dashboard::categories))
        .route("/dashboard/demographics", get(dashboard::demographics))
        .route("/dashboard/top-regions", get(dashboard::top_regions))
        .route(
            "/dashboard/materialized-views/refresh",
            post(dashboard::refresh_views),
        )
        .route(
            "/dashboard/materialized-views/stats",
            get(dashboard::view_stats),
        )
        .route("/dashboard/mv/triage-counts", get(dashboard::mv_triage_counts))
        .route(
            "/dashboard/mv/complaint-categories",
            get(dashboard::mv_complaint_categories),
        )
        .route(
            "/dashboard/mv/symptom-heatmap",
            get(dashboard::mv_symptom_heatmap),
        )
        .route("/dashboard/mv/sla-breaches", get(dashboard::mv_sla_breaches))
        .route("/audit/logs", get(audit::logs))
        .route("/audit/verify", get(audit::verify))
        .with_state(state)
}

/// Resolves the bearer token to the calling user.
pub(crate) fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthedUser, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError(Error::Unauthorized))?;
    state.identity.resolve_token(&token).map_err(Into::into)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Builds the audit actor context for a request.
pub(crate) fn actor_context(user: Option<&AuthedUser>, headers: &HeaderMap) -> ActorContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    ActorContext {
        actor_id: user.map(|u| u.user_id.clone()),
        ip: header("x-forwarded-for")
            .map(|v| v.split(',').next().unwrap_or_default().trim().to_string()),
        device: header("x-device-id"),
    }
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok" }))
}

async fn version() -> impl IntoResponse {
    axum::Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "report_version": sahay_core::REPORT_VERSION,
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> axum::response::Response {
    state
        .metrics
        .aggregation_buffer_keys
        .set(state.analytics.buffered_keys() as i64);
    match state.metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        },
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use sahay_core::Store;

    use super::*;
    use crate::config::{BlobsConfig, SahayConfig};

    /// In-memory state for handler tests.
    pub fn test_state() -> Arc<AppState> {
        let dir = tempfile::tempdir().unwrap();
        let config = SahayConfig {
            blobs: BlobsConfig {
                root: dir.path().join("blobs"),
            },
            ..SahayConfig::default()
        };
        AppState::build(&config, Store::in_memory().unwrap()).unwrap()
    }

    /// Registers a user and returns `(user_id, bearer headers)`.
    pub fn register_user(state: &AppState, alias: &str) -> (String, HeaderMap) {
        let (user, token) = state
            .identity
            .register(
                &ActorContext::system(),
                alias,
                "password-123",
                chrono::Utc::now(),
            )
            .unwrap();
        (user.id, bearer_headers(&token))
    }

    /// Headers carrying a bearer token.
    pub fn bearer_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    /// Grants a role directly (test fixture).
    pub fn grant_role(state: &AppState, user_id: &str, role: sahay_core::identity::Role) {
        state
            .identity
            .grant_role(&ActorContext::system(), user_id, role, chrono::Utc::now())
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc123".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic abc123".parse().unwrap(),
        );
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn actor_context_reads_forwarded_ip_and_device() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        headers.insert("x-device-id", "dev-42".parse().unwrap());
        let ctx = actor_context(None, &headers);
        assert_eq!(ctx.ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(ctx.device.as_deref(), Some("dev-42"));
        assert!(ctx.actor_id.is_none());
    }

    #[test]
    fn router_builds() {
        let state = testutil::test_state();
        let _router = router(state);
    }
}
