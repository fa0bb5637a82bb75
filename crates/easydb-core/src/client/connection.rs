//! Transport to the server
//!
//! Requests go over HTTP (reqwest); change notifications arrive on a
//! websocket stream (tokio-tungstenite) read by a background task that
//! re-emits every frame as a [`ConnectionEvent`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use json_patch::PatchOperation;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::events::{Event, EventBus, ListenerId};
use crate::hash::Fingerprint;
use crate::protocol::{
    Envelope, StreamMessage, UpdateRequest, DATA_PATH, DATA_UPDATES_PATH, UPDATES_PATH,
};

/// Events emitted by a [`Connection`]
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The change stream is open
    Subscribe,
    /// The server replaced the document
    SetData {
        data: Value,
        previous_hash: Fingerprint,
    },
    /// The server applied a patch
    UpdateData {
        updates: Vec<PatchOperation>,
        previous_hash: Fingerprint,
    },
    /// Any change, emitted after `SetData` or `UpdateData`
    ChangeData(StreamMessage),
    /// The server sent a frame that could not be understood; the stream is closed
    ProtocolError(SyncError),
    /// The stream could not be opened or failed
    ConnectionError(String),
    /// The stream was closed
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    Subscribe,
    SetData,
    UpdateData,
    ChangeData,
    ProtocolError,
    ConnectionError,
    Disconnect,
}

impl Event for ConnectionEvent {
    type Kind = ConnectionEventKind;

    fn kind(&self) -> ConnectionEventKind {
        match self {
            ConnectionEvent::Subscribe => ConnectionEventKind::Subscribe,
            ConnectionEvent::SetData { .. } => ConnectionEventKind::SetData,
            ConnectionEvent::UpdateData { .. } => ConnectionEventKind::UpdateData,
            ConnectionEvent::ChangeData(_) => ConnectionEventKind::ChangeData,
            ConnectionEvent::ProtocolError(_) => ConnectionEventKind::ProtocolError,
            ConnectionEvent::ConnectionError(_) => ConnectionEventKind::ConnectionError,
            ConnectionEvent::Disconnect => ConnectionEventKind::Disconnect,
        }
    }
}

/// An open change stream
struct Stream {
    close_tx: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<SyncResult<()>>>,
}

/// Client side of the wire protocol
pub struct Connection {
    url: String,
    http: reqwest::Client,
    events: Arc<EventBus<ConnectionEvent>>,
    /// Generation of the open stream, 0 when none is open
    live: Arc<AtomicU64>,
    next_generation: AtomicU64,
    stream: Mutex<Option<Stream>>,
}

impl Connection {
    /// Create a connection to the server mounted at `url`
    ///
    /// A trailing slash is appended when missing.
    pub fn new(url: &str) -> Self {
        let mut url = url.to_string();
        if !url.ends_with('/') {
            url.push('/');
        }

        Self {
            url,
            http: reqwest::Client::new(),
            events: Arc::new(EventBus::new()),
            live: Arc::new(AtomicU64::new(0)),
            next_generation: AtomicU64::new(1),
            stream: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// URL of the change stream, with the scheme switched to websocket
    pub fn updates_url(&self) -> String {
        let url = if let Some(rest) = self.url.strip_prefix("https") {
            format!("wss{}", rest)
        } else if let Some(rest) = self.url.strip_prefix("http") {
            format!("ws{}", rest)
        } else {
            self.url.clone()
        };
        format!("{}{}", url, UPDATES_PATH)
    }

    pub fn is_subscribed(&self) -> bool {
        self.live.load(Ordering::SeqCst) != 0
    }

    pub fn on<F>(&self, kind: ConnectionEventKind, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Fetch the full document
    pub async fn get_data(&self) -> SyncResult<Value> {
        let response = self
            .http
            .get(format!("{}{}", self.url, DATA_PATH))
            .send()
            .await
            .map_err(request_failed)?;

        let envelope = read_envelope(response).await?;
        match envelope {
            Envelope {
                status: true,
                result: Some(data),
                ..
            } => Ok(data),
            _ => Err(SyncError::Connection(
                "There is an error connecting to the server".to_string(),
            )),
        }
    }

    /// Replace the full document
    pub async fn set_data(&self, data: &Value) -> SyncResult<()> {
        let response = self
            .http
            .post(format!("{}{}", self.url, DATA_PATH))
            .json(data)
            .send()
            .await
            .map_err(request_failed)?;

        let envelope = read_envelope(response).await?;
        if !envelope.status {
            return Err(SyncError::Connection("Data can not be set".to_string()));
        }
        Ok(())
    }

    /// Send patch operations computed against the document with `previous_hash`
    pub async fn send_updates(
        &self,
        updates: &[PatchOperation],
        previous_hash: Option<Fingerprint>,
    ) -> SyncResult<()> {
        let request = UpdateRequest {
            updates: updates.to_vec(),
            previous_hash,
        };
        let response = self
            .http
            .post(format!("{}{}", self.url, DATA_UPDATES_PATH))
            .json(&request)
            .send()
            .await
            .map_err(request_failed)?;

        let envelope = read_envelope(response).await?;
        if !envelope.status {
            return Err(SyncError::Connection("Data cannot be updated".to_string()));
        }
        Ok(())
    }

    /// Open the change stream, closing any stream already open
    ///
    /// The previous stream's reader is waited for, so its `Disconnect` is
    /// emitted before the new stream's `Subscribe`.
    pub async fn subscribe(&self) -> SyncResult<()> {
        if let Some(reader) = self.close_stream() {
            let _ = reader.await;
        }

        let url = self.updates_url();
        debug!("Connecting to {}", url);
        let (ws, _) = match connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                self.events
                    .emit(&ConnectionEvent::ConnectionError("Does not connected".to_string()));
                return Err(SyncError::Connection(format!(
                    "Cannot be connected to ws: {}",
                    e
                )));
            }
        };
        info!("Subscribed to {}", url);

        let (close_tx, close_rx) = oneshot::channel();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        self.live.store(generation, Ordering::SeqCst);
        self.events.emit(&ConnectionEvent::Subscribe);

        let reader = tokio::spawn(read_stream(
            ws,
            close_rx,
            Arc::clone(&self.events),
            Arc::clone(&self.live),
            generation,
        ));

        *self.stream.lock() = Some(Stream {
            close_tx: Some(close_tx),
            reader: Some(reader),
        });
        Ok(())
    }

    /// Close the change stream
    ///
    /// The reader task notices the request, closes the socket and emits
    /// `Disconnect`.
    pub fn unsubscribe(&self) {
        // The reader is left to finish on its own
        drop(self.close_stream());
    }

    /// Ask the open stream's reader to stop and hand back its task
    fn close_stream(&self) -> Option<JoinHandle<SyncResult<()>>> {
        let mut stream = self.stream.lock().take()?;
        if let Some(close_tx) = stream.close_tx.take() {
            let _ = close_tx.send(());
        }
        self.live.store(0, Ordering::SeqCst);
        stream.reader.take()
    }

    /// Wait for the current stream's reader to finish
    ///
    /// Returns `None` when no stream is open. A reader stopped by a
    /// malformed frame finishes with a protocol error.
    pub async fn closed(&self) -> Option<SyncResult<()>> {
        let reader = self.stream.lock().as_mut().and_then(|s| s.reader.take())?;
        match reader.await {
            Ok(result) => Some(result),
            Err(e) => Some(Err(SyncError::Connection(format!(
                "Stream reader failed: {}",
                e
            )))),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

async fn read_stream<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    mut close_rx: oneshot::Receiver<()>,
    events: Arc<EventBus<ConnectionEvent>>,
    live: Arc<AtomicU64>,
    generation: u64,
) -> SyncResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    let result = loop {
        tokio::select! {
            _ = &mut close_rx => {
                let _ = sink.close().await;
                break Ok(());
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match StreamMessage::decode(&text) {
                    Ok(message) => dispatch(&events, message),
                    Err(e) => {
                        warn!("Closing change stream: {}", e);
                        events.emit(&ConnectionEvent::ProtocolError(e.clone()));
                        let _ = sink.close().await;
                        break Err(e);
                    }
                },
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    events.emit(&ConnectionEvent::ConnectionError(e.to_string()));
                    break Err(SyncError::Connection(e.to_string()));
                }
            }
        }
    };

    // A newer stream may already be live; only clear our own generation
    let _ = live.compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst);
    events.emit(&ConnectionEvent::Disconnect);
    debug!("Change stream closed");
    result
}

fn dispatch(events: &EventBus<ConnectionEvent>, message: StreamMessage) {
    let specific = match &message {
        StreamMessage::Set {
            data,
            previous_hash,
        } => ConnectionEvent::SetData {
            data: data.clone(),
            previous_hash: *previous_hash,
        },
        StreamMessage::Update {
            data,
            previous_hash,
        } => ConnectionEvent::UpdateData {
            updates: data.clone(),
            previous_hash: *previous_hash,
        },
    };
    events.emit(&specific);
    events.emit(&ConnectionEvent::ChangeData(message));
}

fn request_failed(e: reqwest::Error) -> SyncError {
    SyncError::Connection(format!("Request failed: {}", e))
}

/// Decode a response body, mapping failures by status code
async fn read_envelope(response: reqwest::Response) -> SyncResult<Envelope> {
    let status = response.status();
    let body = response.text().await.map_err(request_failed)?;

    if status.is_success() {
        return serde_json::from_str(&body)
            .map_err(|e| SyncError::Connection(format!("Unexpected response: {}", e)));
    }

    let message = serde_json::from_str::<Envelope>(&body)
        .ok()
        .and_then(|envelope| envelope.message)
        .unwrap_or_else(|| format!("Server answered {}", status));

    Err(match status {
        StatusCode::CONFLICT => SyncError::Conflict(message),
        StatusCode::BAD_REQUEST => SyncError::Validation(message),
        _ => SyncError::Connection(message),
    })
}
