mod account;
mod egress;
mod pages;
mod rooms;
mod sandbox;
mod selection;
mod settings;

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::{AuthGateway, require_admin};
use crate::config::{DashboardConfig, ServerRegistry};
use crate::context::RequestContext;
use crate::csrf::CsrfError;
use crate::livekit::{LiveKitClient, UpstreamError};
use crate::session::{
    DEFAULT_IDLE_TTL, MemorySessionStore, Session, SessionContext, SessionManager,
    session_middleware,
};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct BindOptions {
    pub host: IpAddr,
    pub port: u16,
    pub port_file: Option<PathBuf>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ServerRegistry>,
    auth: AuthGateway,
    sessions: SessionManager,
    http: reqwest::Client,
    debug: bool,
}

impl AppState {
    pub(crate) fn new(config: DashboardConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        let store = Arc::new(MemorySessionStore::new(DEFAULT_IDLE_TTL));
        Ok(Self {
            registry: Arc::new(config.registry),
            auth: AuthGateway::new(config.credentials),
            sessions: SessionManager::new(store, config.secure_cookies),
            http,
            debug: config.debug,
        })
    }

    fn context(&self, session: &Session, headers: &HeaderMap) -> RequestContext {
        RequestContext::build(&self.registry, session, headers)
    }

    fn selection<'a>(&'a self, session: &'a Session) -> SessionContext<'a> {
        SessionContext::new(session, &self.registry)
    }

    /// Management client for the server this session is scoped to.
    fn client(&self, session: &Session) -> Result<LiveKitClient, PageError> {
        let profile = self
            .selection(session)
            .current_server()
            .ok_or(PageError::NoServerSelected)?;
        Ok(LiveKitClient::new(self.http.clone(), profile)?)
    }
}

/// Failures a page handler hands back to the framework.
#[derive(Debug)]
pub(crate) enum PageError {
    NoServerSelected,
    Csrf(CsrfError),
    Upstream(UpstreamError),
}

impl From<CsrfError> for PageError {
    fn from(err: CsrfError) -> Self {
        Self::Csrf(err)
    }
}

impl From<UpstreamError> for PageError {
    fn from(err: UpstreamError) -> Self {
        Self::Upstream(err)
    }
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        match self {
            Self::NoServerSelected => Redirect::to("/select-server").into_response(),
            Self::Csrf(err) => err.into_response(),
            Self::Upstream(err) => {
                error!(error = %err, "LiveKit request failed");
                (
                    StatusCode::BAD_GATEWAY,
                    pages::bare("Server error", &pages::error_notice(&err.to_string())),
                )
                    .into_response()
            }
        }
    }
}

/// Partial re-renders requested by htmx carry this header.
fn is_htmx(headers: &HeaderMap) -> bool {
    headers.contains_key("hx-request")
}

/// Browsers submit ticked checkboxes as `on` and omit unticked ones.
fn checkbox(value: Option<&str>) -> bool {
    value.is_some_and(|raw| matches!(raw.trim(), "on" | "true" | "1"))
}

/// Blank or unparsable numeric inputs fall back to `default`.
fn number_or<T: FromStr>(value: Option<&str>, default: T) -> T {
    value
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

/// Blank optional text inputs count as absent.
fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(crate) fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/", get(selection::index))
        .route(
            "/select-server",
            get(selection::select_page).post(selection::select_submit),
        )
        .route("/select-server/clear", post(selection::clear))
        .route("/rooms", get(rooms::list).post(rooms::create))
        .route("/rooms/{room}", get(rooms::detail))
        .route("/rooms/{room}/delete", post(rooms::delete))
        .route("/rooms/{room}/token", post(rooms::token))
        .route(
            "/rooms/{room}/participants/{identity}/kick",
            post(rooms::kick),
        )
        .route(
            "/rooms/{room}/participants/{identity}/mute",
            post(rooms::mute),
        )
        .route("/egress", get(egress::list))
        .route("/egress/start", post(egress::start))
        .route("/egress/{egress_id}/stop", post(egress::stop))
        .route("/sandbox", get(sandbox::page))
        .route("/sandbox/generate", post(sandbox::generate))
        .route("/settings", get(settings::page))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_admin,
        ));

    Router::new()
        .route(
            "/login",
            get(account::login_page).post(account::login_submit),
        )
        .route("/logout", get(account::logout))
        .route("/logout-clear-auth", get(account::logout_clear_auth))
        .merge(protected)
        .layer(middleware::from_fn_with_state(
            state.sessions.clone(),
            session_middleware,
        ))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn serve(bind: BindOptions, config: DashboardConfig) -> Result<()> {
    if config.credentials.uses_defaults() {
        warn!(
            "ADMIN_USERNAME/ADMIN_PASSWORD are unset; the built-in admin credentials are active and must be overridden before exposing the dashboard"
        );
    }
    info!(
        servers = %config.registry.ids().join(","),
        debug = config.debug,
        secure_cookies = config.secure_cookies,
        "starting dashboard"
    );

    let state = AppState::new(config)?;
    let addr = SocketAddr::from((bind.host, bind.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind dashboard on {addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve local address for dashboard listener")?;
    if let Some(path) = bind.port_file {
        tokio::fs::write(&path, format!("{}\n", local_addr.port()))
            .await
            .with_context(|| format!("failed to write listener port to {}", path.display()))?;
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            return;
        }
        info!("received ctrl-c, shutting down");
        signal.cancel();
    });

    info!(addr = %local_addr, "dashboard listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await
        .context("dashboard server exited unexpectedly")
}
