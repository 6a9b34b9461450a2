use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::catalog::ComponentCatalog;
use crate::chat::{ChatRequest, PageAgent};
use crate::ops::DocumentIndex;
use crate::stream::StreamEvent;
use crate::tools::page::UPDATE_PAGE;
use crate::tools::{ToolContext, ToolOutput};

/// Events buffered per response before the agent waits for the client.
const EVENT_BUFFER: usize = 64;

#[derive(Clone)]
pub struct ServerState {
    pub agent: Arc<PageAgent>,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

impl AuthConfig {
    pub fn required(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Required,
            token: Some(token.into()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            token: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NormalizeRequest {
    #[serde(default)]
    description: String,
    #[serde(default)]
    reset_confirmed: bool,
    build: Vec<Value>,
    #[serde(default)]
    page_data: Option<Value>,
    #[serde(default)]
    config: Option<Value>,
}

pub async fn serve_backend(agent: Arc<PageAgent>) -> Result<()> {
    let bind_addr = std::env::var("PUCK_AGENT_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8788".to_string())
        .parse::<SocketAddr>()
        .context("Invalid PUCK_AGENT_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let state = Arc::new(ServerState { agent, auth });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Puck agent backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/build/normalize", post(normalize_build))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

pub fn load_auth_config() -> Result<AuthConfig> {
    let mode = parse_auth_mode(std::env::var("PUCK_AGENT_AUTH_MODE").ok())?;
    let token = std::env::var("PUCK_AGENT_API_KEY")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "PUCK_AGENT_API_KEY is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(AuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid PUCK_AGENT_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

/// Key presented by the caller: a bearer token, else the `x-api-key` value.
pub fn presented_key(authorization: Option<&str>, api_key: Option<&str>) -> Option<String> {
    authorization
        .and_then(|value| value.trim().strip_prefix("Bearer "))
        .or(api_key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn authorize(presented: Option<&str>, auth: &AuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    if presented != Some(token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let key = presented_key(
        header_value(&headers, header::AUTHORIZATION.as_str()),
        header_value(&headers, "x-api-key"),
    );
    if let Err(status) = authorize(key.as_deref(), &state.auth) {
        tracing::warn!("Rejected unauthorized request to {}", request.uri().path());
        return Err(status);
    }
    Ok(next.run(request).await)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = flume::bounded::<StreamEvent>(EVENT_BUFFER);
    let agent = state.agent.clone();
    tokio::spawn(async move {
        agent.run(request, tx).await;
    });

    let stream = rx
        .into_stream()
        .map(|event| Ok(Event::default().data(event.to_json())));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn normalize_build(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<NormalizeRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let Some(tool) = state.agent.registry().get(UPDATE_PAGE).await else {
        return Err(internal_error(anyhow!("{} tool is not registered", UPDATE_PAGE)));
    };
    let ctx = ToolContext {
        document: Arc::new(DocumentIndex::from_page_data(request.page_data.as_ref())),
        catalog: Arc::new(ComponentCatalog::from_config(request.config.as_ref())),
    };
    let params = json!({
        "description": request.description,
        "resetConfirmed": request.reset_confirmed,
        "build": request.build,
    });

    match tool.execute(params, &ctx).await.map_err(internal_error)? {
        ToolOutput::Json(value) => Ok(Json(value)),
        ToolOutput::Error(e) => Err((StatusCode::BAD_REQUEST, e)),
    }
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
