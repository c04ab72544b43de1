//! Identity endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

use super::{actor_context, error::ApiError};

/// Registration/login request body.
#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    /// Phone number or alias.
    pub username: String,
    pub password: String,
}

/// Token response.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub user_id: String,
    pub token: String,
}

/// `POST /auth/register`
pub async fn register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CredentialsRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let actor = actor_context(None, &headers);
    let (user, token) =
        state
            .identity
            .register(&actor, &body.username, &body.password, Utc::now())?;
    Ok(Json(TokenResponse {
        user_id: user.id,
        token,
    }))
}

/// `POST /auth/login`
pub async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CredentialsRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let actor = actor_context(None, &headers);
    let token = state
        .identity
        .login(&actor, &body.username, &body.password, Utc::now())?;
    let authed = state.identity.resolve_token(&token)?;
    Ok(Json(TokenResponse {
        user_id: authed.user_id,
        token,
    }))
}
