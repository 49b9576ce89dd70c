use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Json, Router,
    routing::{get, post},
};
use futures_util::Stream;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::ChatClient;
use crate::config::ChatConfig;
use crate::events::StreamEvent;
use crate::relay::run_relay;
use crate::session::{Role, SessionStore};
use crate::tools::{ToolDispatcher, ToolRegistry};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ChatConfig>,
    pub store: SessionStore,
    pub client: Option<Arc<ChatClient>>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn from_config(config: ChatConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(config.request_timeout())
            .build()?;
        let store = SessionStore::new(config.max_history);
        let registry = ToolRegistry::from_config(&config, &http);
        let dispatcher = Arc::new(ToolDispatcher::new(registry));
        let client = ChatClient::from_config(&config, http).map(Arc::new);
        Ok(Self { config: Arc::new(config), store, client, dispatcher, metrics: None })
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    #[serde(default)]
    pub message: String,
    pub session_id: Option<String>,
    pub context: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub session_id: String,
    pub stream_url: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: &str) -> (StatusCode, Json<ErrorBody>) {
    (status, Json(ErrorBody { error: message.into() }))
}

async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<SendMessageResponse>, (StatusCode, Json<ErrorBody>)> {
    if !state.config.enabled {
        return Err(error_response(StatusCode::SERVICE_UNAVAILABLE, "Chat service is disabled"));
    }
    let message = body.message.trim().to_string();
    if message.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "Message is required"));
    }
    if message.chars().count() > state.config.max_message_len {
        return Err(error_response(StatusCode::BAD_REQUEST, "Message too long"));
    }

    let session_id = state.store.create_or_touch(body.session_id.as_deref());
    state.store.append(&session_id, Role::User, &message, body.context);
    metrics::counter!("chat_messages_total").increment(1);
    debug!(session_id = %session_id, "accepted chat message");

    Ok(Json(SendMessageResponse {
        stream_url: format!("/chat/stream/{session_id}"),
        session_id,
    }))
}

/// Opens the event stream for a session, replaying its most recent user
/// message through the adapter. Configuration and validation failures are
/// delivered as a single in-stream error event so the framing stays intact.
async fn stream_chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<StreamEvent>(32);

    if !state.config.enabled {
        let _ = tx.try_send(StreamEvent::Error { message: "Chat service is disabled".into() });
    } else if !state.store.exists(&session_id) {
        let _ = tx.try_send(StreamEvent::Error { message: "Invalid session ID".into() });
    } else {
        match (&state.client, state.store.last_user_message(&session_id)) {
            (None, _) => {
                let _ = tx.try_send(StreamEvent::Error {
                    message: "Chat service is not available. Please check configuration.".into(),
                });
            }
            (_, None) => {
                let _ = tx.try_send(StreamEvent::Error { message: "No user message found in session".into() });
            }
            (Some(client), Some((user_text, context))) => {
                state.store.create_or_touch(Some(&session_id));
                let mut history = state.store.history_for_completion(&session_id);
                // drop the user turn being replayed so it is not submitted twice
                if history.last().is_some_and(|h| h.role == Role::User) {
                    history.pop();
                }
                debug!(session_id = %session_id, history = history.len(), "starting stream");

                let cancel = CancellationToken::new();
                let fragments =
                    client.respond(user_text, history, context, state.dispatcher.clone(), cancel.clone());
                let store = state.store.clone();
                let sid = session_id.clone();
                tokio::spawn(async move {
                    // cancels the adapter once the relay stops for any reason
                    let _guard = cancel.drop_guard();
                    run_relay(store, sid, fragments, tx).await;
                });
            }
        }
    }

    // the HTTP response ends after the terminal event even if more arrives
    let stream = futures_util::stream::unfold((rx, false), |(mut rx, done)| async move {
        if done {
            return None;
        }
        let ev = rx.recv().await?;
        let terminal = ev.is_terminal();
        Some((Ok::<_, Infallible>(sse_frame(&ev)), (rx, terminal)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_frame(event: &StreamEvent) -> Event {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".into());
    Event::default().data(payload)
}

#[derive(Debug, Serialize)]
struct HistoryMessage {
    role: Role,
    content: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    messages: Vec<HistoryMessage>,
}

async fn get_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<HistoryResponse>, (StatusCode, Json<ErrorBody>)> {
    if !state.config.enabled {
        return Err(error_response(StatusCode::SERVICE_UNAVAILABLE, "Chat service is disabled"));
    }
    let messages = state
        .store
        .history(&session_id)
        .into_iter()
        .map(|m| HistoryMessage { role: m.role, content: m.content, timestamp: m.timestamp })
        .collect();
    Ok(Json(HistoryResponse { messages }))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    enabled: bool,
    backend_available: bool,
    active_sessions: usize,
}

async fn chat_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let active_sessions = state.store.len();
    metrics::gauge!("chat_active_sessions").set(active_sessions as f64);
    Json(StatusResponse {
        enabled: state.config.enabled,
        backend_available: state.client.is_some(),
        active_sessions,
    })
}

async fn metrics_text(State(state): State<AppState>) -> Result<String, StatusCode> {
    state.metrics.as_ref().map(|h| h.render()).ok_or(StatusCode::NOT_FOUND)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat/message", post(send_message))
        .route("/chat/stream/:session_id", get(stream_chat))
        .route("/chat/history/:session_id", get(get_history))
        .route("/chat/status", get(chat_status))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "chat relay listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
