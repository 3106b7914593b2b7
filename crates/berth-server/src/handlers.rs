use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    auth::{AccessGrant, SessionContext},
    error::StoreError,
    store::secret::generate_secret,
    AppState,
};

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Identity ─────────────────────────────────────────────────────────────────

pub async fn server_identity(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "public_key": state.identity.public_key_pem(),
        "fingerprint": state.identity.fingerprint(),
        "key_size": state.identity.key_size(),
    }))
}

// ── Sessions ─────────────────────────────────────────────────────────────────

/// Grant a container to the holder of an access token. The client secret is
/// only ever returned here and by rotation.
pub async fn create_session(
    State(state): State<AppState>,
    Extension(grant): Extension<AccessGrant>,
) -> Response {
    let container_id = match state.containers.provision() {
        Ok(id) => id,
        Err(e) => return internal_error(e),
    };

    match state.sessions.add_entry(&container_id) {
        Ok(issued) => {
            info!(
                entry_id = issued.entry_id,
                token_entry_id = grant.token_entry_id,
                "container granted"
            );
            (
                StatusCode::CREATED,
                Json(json!({
                    "entry_id": issued.entry_id,
                    "container_id": container_id,
                    "client_secret": issued.secret.as_str(),
                    "created_at": issued.created_at,
                })),
            )
                .into_response()
        }
        Err(e) => {
            if let Err(release) = state.containers.release(&container_id) {
                warn!(error = %release, "releasing container after failed grant");
            }
            match e {
                StoreError::Duplicate { .. } => (
                    StatusCode::CONFLICT,
                    Json(json!({"error": "container already has a session"})),
                )
                    .into_response(),
                other => internal_error(other.into()),
            }
        }
    }
}

pub async fn current_session(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Response {
    match state.sessions.get_entry(session.entry_id) {
        Ok(Some(record)) => Json(json!({
            "entry_id": record.entry_id,
            "container_id": session.container_id,
            "created_at": record.created_at,
        }))
        .into_response(),
        Ok(None) => session_gone(),
        Err(e) => internal_error(e.into()),
    }
}

pub async fn rotate_session(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Response {
    let secret = generate_secret();
    match state
        .sessions
        .update_entry(session.entry_id, &session.container_id, &secret)
    {
        Ok(()) => {
            info!(entry_id = session.entry_id, "client secret rotated");
            Json(json!({
                "entry_id": session.entry_id,
                "client_secret": secret.as_str(),
            }))
            .into_response()
        }
        Err(StoreError::NotFound { .. }) => session_gone(),
        Err(e) => internal_error(e.into()),
    }
}

/// Release the container and forget its session.
pub async fn delete_session(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Response {
    match state.sessions.delete_entry(session.entry_id) {
        Ok(()) => {}
        Err(StoreError::NotFound { .. }) => return session_gone(),
        Err(e) => return internal_error(e.into()),
    }
    if let Err(e) = state.containers.release(&session.container_id) {
        warn!(error = %e, "releasing container");
    }
    info!(entry_id = session.entry_id, "container released");
    Json(json!({"released": session.container_id})).into_response()
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// The session was removed between authentication and the handler.
fn session_gone() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized"})),
    )
        .into_response()
}

pub(crate) fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Method, Request},
        Router,
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::{
        auth::CONTAINER_HEADER,
        containers::EphemeralContainers,
        identity::Identity,
        server::router,
        store::{AccessTokenStore, SessionStore},
        AppState,
    };

    struct Harness {
        _dir: TempDir,
        app: Router,
        state: AppState,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState {
            access_tokens: Arc::new(
                AccessTokenStore::open(&dir.path().join("access_tokens.db")).unwrap(),
            ),
            sessions: Arc::new(SessionStore::new().unwrap()),
            identity: Arc::new(Identity::generate(1024).unwrap()),
            containers: Arc::new(EphemeralContainers::default()),
        };
        Harness {
            _dir: dir,
            app: router(state.clone()),
            state,
        }
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        container: Option<&str>,
        bearer: Option<&str>,
    ) -> (u16, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(c) = container {
            req = req.header(CONTAINER_HEADER, c);
        }
        if let Some(b) = bearer {
            req = req.header("Authorization", format!("Bearer {b}"));
        }
        let resp = app
            .clone()
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status().as_u16();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn grant(h: &Harness) -> (String, String) {
        let token = h.state.access_tokens.add_entry(false).unwrap();
        let (status, body) = send(&h.app, Method::POST, "/sessions", None, Some(token.secret.as_str())).await;
        assert_eq!(status, 201);
        (
            body["container_id"].as_str().unwrap().to_owned(),
            body["client_secret"].as_str().unwrap().to_owned(),
        )
    }

    #[tokio::test]
    async fn health_and_identity_are_public() {
        let h = harness();
        let (status, body) = send(&h.app, Method::GET, "/health", None, None).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&h.app, Method::GET, "/identity", None, None).await;
        assert_eq!(status, 200);
        assert_eq!(body["fingerprint"], h.state.identity.fingerprint());
        assert_eq!(body["key_size"], 1024);
    }

    #[tokio::test]
    async fn grant_requires_enabled_token() {
        let h = harness();
        let (status, _) = send(&h.app, Method::POST, "/sessions", None, None).await;
        assert_eq!(status, 401);

        let token = h.state.access_tokens.add_entry(true).unwrap();
        let (status, _) = send(&h.app, Method::POST, "/sessions", None, Some(token.secret.as_str())).await;
        assert_eq!(status, 401);

        h.state.access_tokens.enable_entry(token.entry_id).unwrap();
        let (status, body) =
            send(&h.app, Method::POST, "/sessions", None, Some(token.secret.as_str())).await;
        assert_eq!(status, 201);
        assert_eq!(body["client_secret"].as_str().unwrap().len(), 255);
        assert_eq!(h.state.sessions.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn session_is_bound_to_its_container() {
        let h = harness();
        let (c1, s1) = grant(&h).await;
        let (c2, s2) = grant(&h).await;

        let (status, body) =
            send(&h.app, Method::GET, "/sessions/current", Some(&c1), Some(&s1)).await;
        assert_eq!(status, 200);
        assert_eq!(body["container_id"], c1.as_str());

        let (status, _) =
            send(&h.app, Method::GET, "/sessions/current", Some(&c1), Some(&s2)).await;
        assert_eq!(status, 401);
        let (status, _) = send(&h.app, Method::GET, "/sessions/current", None, Some(&s2)).await;
        assert_eq!(status, 401);
        let (status, _) =
            send(&h.app, Method::GET, "/sessions/current", Some(&c2), Some(&s2)).await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn rotate_replaces_the_secret() {
        let h = harness();
        let (c, old) = grant(&h).await;

        let (status, body) = send(
            &h.app,
            Method::POST,
            "/sessions/current/rotate",
            Some(&c),
            Some(&old),
        )
        .await;
        assert_eq!(status, 200);
        let new = body["client_secret"].as_str().unwrap().to_owned();
        assert_ne!(new, old);

        let (status, _) = send(&h.app, Method::GET, "/sessions/current", Some(&c), Some(&old)).await;
        assert_eq!(status, 401);
        let (status, _) = send(&h.app, Method::GET, "/sessions/current", Some(&c), Some(&new)).await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn delete_releases_the_container() {
        let h = harness();
        let (c, s) = grant(&h).await;

        let (status, body) =
            send(&h.app, Method::DELETE, "/sessions/current", Some(&c), Some(&s)).await;
        assert_eq!(status, 200);
        assert_eq!(body["released"], c.as_str());
        assert_eq!(h.state.sessions.count().unwrap(), 0);

        let (status, _) = send(&h.app, Method::GET, "/sessions/current", Some(&c), Some(&s)).await;
        assert_eq!(status, 401);
    }
}
