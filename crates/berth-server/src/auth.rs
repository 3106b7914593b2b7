use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::debug;

use crate::{handlers::internal_error, store::EntryId, AppState};

/// Header naming the container a session credential belongs to.
pub const CONTAINER_HEADER: &str = "x-container-id";

/// Set on requests that presented an enabled access token.
#[derive(Debug, Clone, Copy)]
pub struct AccessGrant {
    pub token_entry_id: EntryId,
}

/// Set on requests that presented a valid session credential.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub entry_id: EntryId,
    pub container_id: String,
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized"})),
    )
        .into_response()
}

/// Axum middleware that validates `Authorization: Bearer <access token>`
/// against the durable token store. Disabled tokens are rejected.
pub async fn require_access_token(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer(request.headers()).map(str::to_owned) else {
        return unauthorized();
    };

    let store = state.access_tokens.clone();
    let lookup = tokio::task::spawn_blocking(move || store.authenticate(&token)).await;

    match lookup {
        Ok(Ok(Some(token_entry_id))) => {
            request
                .extensions_mut()
                .insert(AccessGrant { token_entry_id });
            next.run(request).await
        }
        Ok(Ok(None)) => {
            debug!("access token rejected");
            unauthorized()
        }
        Ok(Err(e)) => internal_error(e.into()),
        Err(e) => internal_error(e.into()),
    }
}

/// Axum middleware that validates a session credential: the container in
/// `X-Container-Id` and its client secret as the bearer token. Both must
/// match the same session.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let container_id = headers
        .get(CONTAINER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let (Some(container_id), Some(secret)) = (container_id, bearer(headers)) else {
        return unauthorized();
    };

    match state.sessions.get_entry_id(&container_id, secret) {
        Ok(Some(entry_id)) => {
            request.extensions_mut().insert(SessionContext {
                entry_id,
                container_id,
            });
            next.run(request).await
        }
        Ok(None) => {
            debug!("session credential rejected");
            unauthorized()
        }
        Err(e) => internal_error(e.into()),
    }
}
