//! HTTP and websocket endpoints
//!
//! | Method | Path           | Body                                | Success |
//! |--------|----------------|-------------------------------------|---------|
//! | GET    | `/data`        |                                     | 200     |
//! | POST   | `/data`        | full document                       | 201     |
//! | POST   | `/dataUpdates` | `{"updates": [...], "previousHash"}` | 201     |
//! | GET    | `/updates`     | websocket upgrade                   | 101     |

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{Envelope, UpdateRequest, DATA_PATH, DATA_UPDATES_PATH, UPDATES_PATH};

use super::registry::SubscriberRegistry;
use super::store::DocumentStore;

/// Shared state of the request handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub store: Arc<DocumentStore>,
    pub registry: Arc<SubscriberRegistry>,
    /// Include error detail in failed responses
    pub debug: bool,
}

/// Build the router with endpoints mounted under `base_path`
///
/// `base_path` must be empty or start with a slash and have no trailing
/// slash (see `Config::normalized_base_path`).
pub fn router(state: AppState, base_path: &str) -> Router {
    let api = Router::new()
        .route(&format!("/{}", DATA_PATH), get(get_data).post(set_data))
        .route(&format!("/{}", DATA_UPDATES_PATH), post(update_data))
        .route(&format!("/{}", UPDATES_PATH), get(subscribe))
        .with_state(state);

    let app = if base_path.is_empty() {
        Router::new().merge(api)
    } else {
        Router::new().nest(base_path, api)
    };

    app.fallback(not_found).layer(middleware::from_fn(cors))
}

/// A failed request, rendered as an error envelope
struct ApiError {
    status: StatusCode,
    error: SyncError,
    debug: bool,
}

impl ApiError {
    fn new(error: SyncError, debug: bool) -> Self {
        let status = match &error {
            SyncError::Validation(_) => StatusCode::BAD_REQUEST,
            SyncError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            error,
            debug,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self.error {
            SyncError::Validation(msg) | SyncError::Conflict(msg) => msg.clone(),
            other => other.to_string(),
        };
        let stack = self.debug.then(|| format!("{:?}", self.error));
        (self.status, Json(Envelope::error(message, stack))).into_response()
    }
}

fn parse_body(body: &Bytes) -> SyncResult<Value> {
    if body.is_empty() {
        return Err(SyncError::Validation(
            "parameter \"data\" is not found".to_string(),
        ));
    }
    serde_json::from_slice(body)
        .map_err(|e| SyncError::Validation(format!("request body is not valid JSON: {}", e)))
}

async fn get_data(State(state): State<AppState>) -> Json<Envelope> {
    Json(Envelope::ok(Some(state.store.read())))
}

async fn set_data(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let data = parse_body(&body).map_err(|e| ApiError::new(e, state.debug))?;
    state.store.replace(data);
    Ok((StatusCode::CREATED, Json(Envelope::ok(None))).into_response())
}

async fn update_data(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request = parse_body(&body)
        .and_then(UpdateRequest::from_value)
        .map_err(|e| ApiError::new(e, state.debug))?;

    state
        .store
        .apply_patch(&request.updates, request.previous_hash)
        .map_err(|e| {
            debug!("Patch rejected: {}", e);
            ApiError::new(e, state.debug)
        })?;

    Ok((StatusCode::CREATED, Json(Envelope::ok(None))).into_response())
}

/// Open a change stream
///
/// The connection is registered before the upgrade response goes out, so a
/// client that completed the handshake never misses a change. Frames queue
/// in the channel until the writer starts.
async fn subscribe(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = state.registry.add(tx);

    let registry = Arc::clone(&state.registry);
    ws.on_failed_upgrade(move |e| {
        warn!(id, "Websocket upgrade failed: {}", e);
        registry.remove(id);
    })
    .on_upgrade(move |socket| stream_changes(socket, state.registry, id, rx))
}

async fn stream_changes(
    socket: WebSocket,
    registry: Arc<SubscriberRegistry>,
    id: u64,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Clients never send anything meaningful; read only to notice the close
    let mut reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    registry.remove(id);
}

async fn not_found() -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        error: SyncError::Validation("Not found".to_string()),
        debug: false,
    }
}

/// Allow browser clients on other origins
async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("X-Requested-With, Content-Type, Accept"),
    );
    response
}
