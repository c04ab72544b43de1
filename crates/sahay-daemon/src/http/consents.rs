//! Consent endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;

use sahay_core::Error;
use sahay_core::consent::{ConsentCategory, ConsentReceipt, ConsentScope};

use crate::state::AppState;

use super::{actor_context, authenticate, error::ApiError};

/// Consent payload: `{category, scope, granted, version}`.
#[derive(Debug, Deserialize)]
pub struct ConsentRequest {
    pub category: String,
    pub scope: String,
    pub granted: bool,
    /// Consent-document version the client consents under; must match the
    /// active version.
    pub version: Option<u32>,
}

/// `POST /consents`
pub async fn grant(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ConsentRequest>,
) -> Result<Json<ConsentReceipt>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let actor = actor_context(Some(&user), &headers);

    let category = ConsentCategory::parse(&body.category)?;
    let scope = ConsentScope::parse(&body.scope)?;

    if let Some(version) = body.version {
        let active = state.consents.active_document_version()?;
        if version != active {
            return Err(ApiError(Error::Validation(format!(
                "consent document version {version} is not the active version {active}"
            ))));
        }
    }

    let receipt = state.consents.grant(
        &actor,
        &user.user_id,
        category,
        scope,
        body.granted,
        Utc::now(),
    )?;
    Ok(Json(receipt))
}

/// `GET /consents`
pub async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConsentReceipt>>, ApiError> {
    let user = authenticate(&state, &headers)?;
    Ok(Json(state.consents.list(&user.user_id)?))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{register_user, test_state};
    use super::*;

    #[tokio::test]
    async fn grant_list_and_stale_document_version() {
        let state = test_state();
        let (_user_id, headers) = register_user(&state, "9876500010");

        let receipt = grant(
            State(state.clone()),
            headers.clone(),
            Json(ConsentRequest {
                category: "analytics".into(),
                scope: "gov_aggregated".into(),
                granted: true,
                version: Some(1),
            }),
        )
        .await
        .unwrap();
        assert!(receipt.granted);
        assert_eq!(receipt.version, 1);

        let receipts = list(State(state.clone()), headers.clone()).await.unwrap();
        assert_eq!(receipts.len(), 1);

        // A consent made against an outdated document is rejected.
        let result = grant(
            State(state),
            headers,
            Json(ConsentRequest {
                category: "analytics".into(),
                scope: "gov_aggregated".into(),
                granted: true,
                version: Some(7),
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError(Error::Validation(_)))));
    }

    #[tokio::test]
    async fn requires_auth() {
        let state = test_state();
        let result = list(State(state), HeaderMap::new()).await;
        assert!(matches!(result, Err(ApiError(Error::Unauthorized))));
    }
}
