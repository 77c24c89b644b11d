//! HTTP server for the chat page and its streaming API

use crate::agent::Agent;
use crate::chat::{render_message, ChatError, ChatMessage, ChatRole, ChatServer, ModuleId};
use crate::ui;
use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

/// Namespace of the chat module on the page
pub const CHAT_NAMESPACE: &str = "chat_session";

const CHAT_JS: &str = include_str!("../../static/chat.js");
const CHAT_CSS: &str = include_str!("../../static/chat.css");

/// Upper bound between two idle-session sweeps
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared application state
pub struct AppState {
    agent: Arc<Agent>,
    sessions: DashMap<String, Arc<ChatServer>>,
    static_dir: Option<PathBuf>,
    reload_tx: broadcast::Sender<()>,
}

impl AppState {
    /// `static_dir` set means assets are read from disk and clients may
    /// subscribe to reloads; otherwise the embedded copies are served
    pub fn new(agent: Arc<Agent>, static_dir: Option<PathBuf>) -> Self {
        let (reload_tx, _) = broadcast::channel(16);
        Self {
            agent,
            sessions: DashMap::new(),
            static_dir,
            reload_tx,
        }
    }

    pub fn reload_sender(&self) -> broadcast::Sender<()> {
        self.reload_tx.clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close and forget sessions idle for at least `max_idle`
    ///
    /// Sessions with an answer streaming are kept. Returns how many were
    /// removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|id, server| match server.idle_for() {
            Some(idle) if idle >= max_idle => {
                tracing::debug!(
                    session = %id,
                    idle_secs = idle.as_secs(),
                    "Evicting idle session"
                );
                server.close();
                false
            }
            _ => true,
        });
        before.saturating_sub(self.sessions.len())
    }

    /// Periodically evict idle sessions until the state is dropped
    pub fn spawn_session_sweeper(
        self: &Arc<Self>,
        max_idle: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let state: Weak<Self> = Arc::downgrade(self);
        let period = max_idle.clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else { break };
                let evicted = state.evict_idle(max_idle);
                if evicted > 0 {
                    tracing::info!(
                        evicted,
                        remaining = state.session_count(),
                        "Evicted idle chat sessions"
                    );
                }
            }
        })
    }

    fn reload_enabled(&self) -> bool {
        self.static_dir.is_some()
    }

    fn session(&self, id: &str) -> Result<Arc<ChatServer>, ChatError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ChatError::SessionNotFound(id.to_string()))
    }

    fn new_session(&self) -> Arc<ChatServer> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let server = Arc::new(ChatServer::new(
            ModuleId::new(CHAT_NAMESPACE),
            session_id.clone(),
            Arc::clone(&self.agent),
            Vec::new(),
        ));
        self.sessions.insert(session_id, Arc::clone(&server));
        server
    }
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    message: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    model: String,
    sessions: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            ChatError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Closed => StatusCode::GONE,
            ChatError::EmptyMessage => StatusCode::BAD_REQUEST,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/chat/:session/submit", post(submit))
        .route("/chat/:session/messages", get(messages))
        .route("/chat/:session/close", post(close))
        .route("/health", get(health_check))
        .route("/static/:file", get(static_asset))
        .route("/dev/reload", get(dev_reload))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server until `shutdown` resolves
pub async fn run_http_server(
    state: Arc<AppState>,
    host: &str,
    port: u16,
    launch_browser: bool,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let url = format!("http://{}", listener.local_addr()?);
    tracing::info!("HTTP server listening on {}", url);

    if launch_browser {
        crate::dev::launch_browser(&url);
    }

    let sessions = Arc::clone(&state);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    for entry in sessions.sessions.iter() {
        entry.value().close();
    }
    tracing::info!("HTTP server stopped");
    Ok(())
}

/// Each page load starts a fresh chat session
async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    let server = state.new_session();
    tracing::debug!(session = server.session_id(), "New chat session");
    Html(ui::app_page(
        server.session_id(),
        &server.surface(),
        state.reload_enabled(),
    ))
}

/// Stream the answer to one message as SSE
///
/// Events: `chunk` per text fragment, `error` if the run fails, and a final
/// `done` carrying the rendered answer.
async fn submit(
    State(state): State<Arc<AppState>>,
    Path(session): Path<String>,
    Json(req): Json<SubmitRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ChatError> {
    let server = state.session(&session)?;
    let fragments = server.on_user_submit(&req.message).await?;

    let events = fragments
        .map(|item| match item {
            Ok(text) => Event::default()
                .event("chunk")
                .json_data(serde_json::json!({ "text": text })),
            Err(e) => {
                tracing::error!("Chat run failed: {:#}", e);
                Event::default()
                    .event("error")
                    .json_data(serde_json::json!({ "error": format!("{:#}", e) }))
            }
        })
        .chain(futures::stream::once(async move { done_event(&server) }));

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

fn done_event(server: &ChatServer) -> Result<Event, axum::Error> {
    let html = server
        .messages()
        .last()
        .filter(|m| m.role == ChatRole::Assistant)
        .map(render_message)
        .unwrap_or_default();
    Event::default()
        .event("done")
        .json_data(serde_json::json!({ "html": html }))
}

async fn messages(
    State(state): State<Arc<AppState>>,
    Path(session): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ChatError> {
    Ok(Json(state.session(&session)?.messages()))
}

async fn close(
    State(state): State<Arc<AppState>>,
    Path(session): Path<String>,
) -> Result<StatusCode, ChatError> {
    let (_, server) = state
        .sessions
        .remove(&session)
        .ok_or_else(|| ChatError::SessionNotFound(session.clone()))?;
    server.close();
    Ok(StatusCode::NO_CONTENT)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: format!(
            "{}{}",
            env!("CARGO_PKG_VERSION"),
            env!("ANALYST_CHAT_VERSION_SUFFIX")
        ),
        model: state.agent.model().model().to_string(),
        sessions: state.session_count(),
    })
}

async fn static_asset(
    State(state): State<Arc<AppState>>,
    Path(file): Path<String>,
) -> Response {
    let (embedded, content_type) = match file.as_str() {
        "chat.js" => (CHAT_JS, "text/javascript; charset=utf-8"),
        "chat.css" => (CHAT_CSS, "text/css; charset=utf-8"),
        _ => return StatusCode::NOT_FOUND.into_response(),
    };

    let body = match &state.static_dir {
        Some(dir) => match tokio::fs::read_to_string(dir.join(&file)).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Serving embedded {}: {}", file, e);
                embedded.to_string()
            }
        },
        None => embedded.to_string(),
    };

    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// SSE feed of reload notices while assets are served from disk
async fn dev_reload(State(state): State<Arc<AppState>>) -> Response {
    if !state.reload_enabled() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let events = futures::stream::unfold(state.reload_tx.subscribe(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(()) => {
                    let event = Event::default().event("reload").data("reload");
                    return Some((Ok::<_, axum::Error>(event), rx));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}
