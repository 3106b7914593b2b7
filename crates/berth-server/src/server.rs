use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::{require_access_token, require_session},
    containers::EphemeralContainers,
    daemon::PidMarker,
    handlers::{
        create_session, current_session, delete_session, health, rotate_session, server_identity,
    },
    identity::{Identity, DEFAULT_KEY_SIZE},
    store::{AccessTokenStore, SessionStore},
    AppState,
};

pub const DEFAULT_PORT: u16 = 6150;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub access_tokens_db: Option<PathBuf>,
    pub public_key: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    /// Output of the detached daemon ($BERTH_LOG_FILE).
    pub log_file: Option<PathBuf>,
    /// Unprivileged user the daemon runs as ($BERTH_USER).
    pub user: Option<String>,
    /// Size of the identity generated when none exists yet.
    pub key_size: usize,
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("BERTH_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("BERTH_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            data_dir: env_path("BERTH_DATA_DIR"),
            pid_file: env_path("BERTH_PID_FILE"),
            access_tokens_db: env_path("BERTH_ACCESS_TOKENS_DB"),
            public_key: env_path("BERTH_PUBLIC_KEY"),
            private_key: env_path("BERTH_PRIVATE_KEY"),
            log_file: env_path("BERTH_LOG_FILE"),
            user: std::env::var("BERTH_USER").ok().filter(|u| !u.is_empty()),
            key_size: std::env::var("BERTH_KEY_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_KEY_SIZE),
        }
    }
}

/// Every state path, resolved against the data directory.
#[derive(Debug, Clone)]
pub struct ServerPaths {
    pub data_dir: PathBuf,
    pub pid_file: PathBuf,
    pub access_tokens_db: PathBuf,
    pub public_key: PathBuf,
    pub private_key: PathBuf,
    pub log_file: PathBuf,
}

impl ServerConfig {
    pub fn paths(&self) -> Result<ServerPaths> {
        let data_dir = resolve_data_dir(self.data_dir.as_ref())?;
        let or_default =
            |path: &Option<PathBuf>, name: &str| path.clone().unwrap_or_else(|| data_dir.join(name));
        Ok(ServerPaths {
            pid_file: or_default(&self.pid_file, "berth.pid"),
            access_tokens_db: or_default(&self.access_tokens_db, "access_tokens.db"),
            public_key: or_default(&self.public_key, "public.pem"),
            private_key: or_default(&self.private_key, "private.pem"),
            log_file: or_default(&self.log_file, "berth.log"),
            data_dir,
        })
    }
}

impl ServerPaths {
    /// The resolved paths as the environment the daemon is started with, so
    /// it does not depend on the home directory of the user it runs as.
    pub fn to_env(&self) -> Vec<(&'static str, PathBuf)> {
        vec![
            ("BERTH_DATA_DIR", self.data_dir.clone()),
            ("BERTH_PID_FILE", self.pid_file.clone()),
            ("BERTH_ACCESS_TOKENS_DB", self.access_tokens_db.clone()),
            ("BERTH_PUBLIC_KEY", self.public_key.clone()),
            ("BERTH_PRIVATE_KEY", self.private_key.clone()),
            ("BERTH_LOG_FILE", self.log_file.clone()),
        ]
    }
}

/// Resolve the data directory, creating it if needed.
/// Public so the CLI can reuse this logic.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

pub fn router(state: AppState) -> Router {
    // Public routes (no auth required).
    let public = Router::new()
        .route("/health", get(health))
        .route("/identity", get(server_identity));

    // Container grants need an enabled access token.
    let grants = Router::new()
        .route("/sessions", post(create_session))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_access_token,
        ));

    // Everything on a granted container needs its session credential.
    let sessions = Router::new()
        .route("/sessions/current", get(current_session).delete(delete_session))
        .route("/sessions/current/rotate", post(rotate_session))
        .layer(middleware::from_fn_with_state(state.clone(), require_session));

    Router::new()
        .merge(public)
        .merge(grants)
        .merge(sessions)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let paths = cfg.paths()?;
    info!(data_dir = %paths.data_dir.display(), "using data directory");

    let (public, private, key_size) = (
        paths.public_key.clone(),
        paths.private_key.clone(),
        cfg.key_size,
    );
    let identity =
        tokio::task::spawn_blocking(move || Identity::load_or_generate(&public, &private, key_size))
            .await
            .context("identity task")?
            .context("load server identity")?;
    info!(fingerprint = %identity.fingerprint(), key_size = identity.key_size(), "server identity loaded");

    let access_tokens = Arc::new(
        AccessTokenStore::open(&paths.access_tokens_db).context("open access token store")?,
    );
    let sessions = Arc::new(SessionStore::new().context("create session store")?);

    let state = AppState {
        access_tokens: access_tokens.clone(),
        sessions: sessions.clone(),
        identity: Arc::new(identity),
        containers: Arc::new(EphemeralContainers::default()),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind((cfg.host.as_str(), cfg.port))
        .await
        .with_context(|| format!("bind listener on {}:{}", cfg.host, cfg.port))?;
    info!(addr = %listener.local_addr()?, "berth server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error");

    info!("shutting down");
    if let Err(e) = sessions.close() {
        warn!(error = %e, "closing session store");
    }
    if let Err(e) = access_tokens.close() {
        warn!(error = %e, "closing access token store");
    }
    match PidMarker::new(&paths.pid_file).remove_if_owned(std::process::id()) {
        Ok(true) => info!(path = %paths.pid_file.display(), "released PID marker"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "releasing PID marker"),
    }

    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received interrupt"),
        _ = terminate => info!("received SIGTERM"),
    }
}
