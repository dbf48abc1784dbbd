use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::middleware;
use crate::api::state::AppState;
use crate::error::AppError;
use crate::session::ANONYMOUS_USER;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenQuery {
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub token: String,
    pub expires_in: i64,
    pub session_id: String,
    pub issued_at: DateTime<Utc>,
    pub user_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub revoked: bool,
}

/// GET /api/token
///
/// Mints a session token for the widget. A still-valid bearer keeps its
/// identity and session; anything else gets a fresh anonymous credential, so
/// a widget holding an expired token can always recover here.
pub async fn issue_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Json<TokenResponse>, AppError> {
    let existing = match middleware::bearer_token(&headers) {
        Ok(Some(token)) => state.sessions.verify(token).await,
        _ => None,
    };

    let (user_id, session_id) = match existing {
        Some(record) => (record.user_id, Some(record.session_id)),
        None => (ANONYMOUS_USER, query.session_id),
    };

    let issued = state
        .sessions
        .issue(user_id, session_id, json!({"scope": "chat"}))
        .await?;

    Ok(Json(TokenResponse {
        token: issued.token,
        expires_in: issued.expires_in,
        session_id: issued.session_id,
        issued_at: issued.issued_at,
        user_id: issued.user_id,
    }))
}

/// POST /api/token/revoke
///
/// Kills the server-side record for a token, from the body or the
/// Authorization header. Reports whether anything was actually revoked.
pub async fn revoke_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<RevokeRequest>>,
) -> Result<Json<RevokeResponse>, AppError> {
    let from_body = body.and_then(|Json(req)| req.token);
    let token = match from_body {
        Some(token) => token,
        None => middleware::bearer_token(&headers)?
            .map(str::to_string)
            .ok_or(AppError::InvalidToken)?,
    };

    let revoked = state.sessions.revoke(&token).await;
    Ok(Json(RevokeResponse { revoked }))
}
