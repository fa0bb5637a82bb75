//! Client session
//!
//! A [`ClientSession`] keeps a local replica of the shared document. Local
//! changes are recorded as they happen and flushed to the server after an
//! idle window; changes made by other clients arrive on the change stream and
//! are applied on top of the local replica.
//!
//! The session also tracks a shadow copy of the server's document (the last
//! server state it knows of). Patches are sent with the shadow's fingerprint
//! so the server can reject them when the session is behind.
//!
//! ```no_run
//! use easydb_core::{ClientSession, SessionOptions};
//! use serde_json::json;
//!
//! # async fn example() -> easydb_core::SyncResult<()> {
//! let session = ClientSession::new("http://127.0.0.1:3000/easy-db", SessionOptions::default());
//! session.init().await?;
//! session.update(|doc| doc["greeting"] = json!("hello"))?;
//! session.save().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use json_patch::PatchOperation;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::events::{Event, EventBus, ListenerId};
use crate::hash::{fingerprint, Fingerprint};
use crate::protocol::StreamMessage;

use super::connection::{Connection, ConnectionEvent, ConnectionEventKind};
use super::observer::{DataContainer, Modification, ObserverError};
use super::timer::SyncTimer;

/// Session settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Open the change stream during `init`
    pub subscribe: bool,
    /// Idle window between the first unsaved change and the flush
    pub sync_time: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            subscribe: true,
            sync_time: Duration::from_millis(1000),
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            subscribe: config.subscribe,
            sync_time: config.sync_time(),
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Events emitted by a [`ClientSession`]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// `init` completed
    Init,
    /// A request, the stream or a flush failed
    Error(SyncError),
    /// The document was replaced, locally or by the server
    SetData { previous: Value, current: Value },
    /// A local mutation batch produced these operations
    Update { updates: Vec<PatchOperation> },
    /// Operations from the server were applied
    UpdateData {
        previous: Value,
        current: Value,
        updates: Vec<PatchOperation>,
    },
    /// Any change from the server, after `SetData` or `UpdateData`
    ChangeData { previous: Value, current: Value },
    /// Local changes reached the server
    Save,
    /// The server reported a change on top of a document this session has
    /// not seen; a resync follows
    Stale {
        expected: Fingerprint,
        actual: Fingerprint,
    },
    /// The change stream closed
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Init,
    Error,
    SetData,
    Update,
    UpdateData,
    ChangeData,
    Save,
    Stale,
    Disconnect,
}

impl Event for SessionEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Init => EventKind::Init,
            SessionEvent::Error(_) => EventKind::Error,
            SessionEvent::SetData { .. } => EventKind::SetData,
            SessionEvent::Update { .. } => EventKind::Update,
            SessionEvent::UpdateData { .. } => EventKind::UpdateData,
            SessionEvent::ChangeData { .. } => EventKind::ChangeData,
            SessionEvent::Save => EventKind::Save,
            SessionEvent::Stale { .. } => EventKind::Stale,
            SessionEvent::Disconnect => EventKind::Disconnect,
        }
    }
}

/// A change handed to the server
#[derive(Debug, Clone, PartialEq)]
enum SentChange {
    Set(Value),
    Update {
        previous_hash: Fingerprint,
        ops: Vec<PatchOperation>,
    },
}

impl SentChange {
    /// Whether a stream message is the server's broadcast of this change
    fn is_echoed_by(&self, message: &StreamMessage) -> bool {
        match (self, message) {
            (SentChange::Set(sent), StreamMessage::Set { data, .. }) => sent == data,
            (
                SentChange::Update { previous_hash, ops },
                StreamMessage::Update {
                    data,
                    previous_hash: hash,
                },
            ) => previous_hash == hash && ops == data,
            _ => false,
        }
    }

    /// Move the shadow to the server state after this change
    fn advance(&self, shadow: &mut Value) -> bool {
        match self {
            SentChange::Set(data) => {
                *shadow = data.clone();
                true
            }
            SentChange::Update { ops, .. } => {
                let mut next = shadow.clone();
                if json_patch::patch(&mut next, ops).is_err() {
                    return false;
                }
                *shadow = next;
                true
            }
        }
    }
}

/// Bookkeeping for a sent change until both the response and the broadcast
/// have been seen
#[derive(Debug)]
struct Sent {
    id: u64,
    change: SentChange,
    /// The shadow already includes this change
    applied: bool,
    echoed: bool,
    acked: bool,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    container: Option<DataContainer>,
    /// Last known server document
    shadow: Value,
    synced: bool,
    flushing: bool,
    /// Bumped whenever the server state replaces local state
    epoch: u64,
    next_sent_id: u64,
    sent: VecDeque<Sent>,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: SessionState::Uninitialized,
            container: None,
            shadow: Value::Null,
            synced: false,
            flushing: false,
            epoch: 0,
            next_sent_id: 1,
            sent: VecDeque::new(),
        }
    }

    fn container_mut(&mut self) -> SyncResult<&mut DataContainer> {
        match (self.state, self.container.as_mut()) {
            (SessionState::Ready, Some(container)) => Ok(container),
            _ => Err(SyncError::NotInitialized),
        }
    }

    /// Install a full document from the server, dropping local changes
    fn install(&mut self, data: Value) -> Value {
        let previous = match self.container.as_mut() {
            Some(container) => container.reset(data.clone()),
            None => {
                self.container = Some(DataContainer::new(data.clone()));
                Value::Null
            }
        };
        self.shadow = data;
        self.sent.clear();
        self.epoch += 1;
        self.synced = !self.flushing;
        previous
    }

    /// Install a full document from the server, keeping local changes on top
    fn rebase(&mut self, data: Value) -> (Value, Result<(), ObserverError>) {
        let (previous, rebased) = match self.container.as_mut() {
            Some(container) => container.rebase(data.clone()),
            None => {
                self.container = Some(DataContainer::new(data.clone()));
                (Value::Null, Ok(()))
            }
        };
        self.shadow = data;
        self.sent.clear();
        self.epoch += 1;
        self.synced = !self.flushing && !self.has_pending();
        (previous, rebased)
    }

    fn has_pending(&self) -> bool {
        self.container
            .as_ref()
            .is_some_and(|container| !container.modification().is_none())
    }

    /// Recognise the broadcast of one of our own changes
    ///
    /// The server broadcasts in apply order, so only the oldest unechoed
    /// change can match. Returns false when the shadow could not follow.
    fn consume_echo(&mut self, message: &StreamMessage) -> Option<bool> {
        let pos = self.sent.iter().position(|sent| !sent.echoed)?;
        if !self.sent[pos].change.is_echoed_by(message) {
            return None;
        }

        let mut consistent = true;
        let sent = &mut self.sent[pos];
        sent.echoed = true;
        if !sent.applied {
            sent.applied = true;
            consistent = sent.change.advance(&mut self.shadow);
        }
        if sent.acked {
            self.sent.remove(pos);
        }
        Some(consistent)
    }

    /// Record the server's acceptance of a sent change
    fn acknowledge(&mut self, id: u64, expect_echo: bool) -> bool {
        let Some(pos) = self.sent.iter().position(|sent| sent.id == id) else {
            // Superseded by a full document from the server
            return true;
        };

        let mut consistent = true;
        let sent = &mut self.sent[pos];
        sent.acked = true;
        if !sent.applied {
            sent.applied = true;
            consistent = sent.change.advance(&mut self.shadow);
        }
        if sent.echoed || !expect_echo {
            self.sent.remove(pos);
        }
        consistent
    }

    fn forget(&mut self, id: u64) {
        self.sent.retain(|sent| sent.id != id);
    }

    /// Fold a change pushed by the server into local state
    fn receive(&mut self, message: &StreamMessage) -> Inbound {
        match self.consume_echo(message) {
            Some(true) => return Inbound::Ignore,
            Some(false) => return Inbound::Resync,
            None => {}
        }

        let (updates, previous_hash) = match message {
            StreamMessage::Set { data, .. } => return Inbound::Set(data.clone()),
            StreamMessage::Update {
                data,
                previous_hash,
            } => (data, *previous_hash),
        };

        let expected = fingerprint(&self.shadow);
        if previous_hash != expected {
            return Inbound::Stale {
                expected,
                actual: previous_hash,
            };
        }

        let mut shadow = self.shadow.clone();
        if let Err(e) = json_patch::patch(&mut shadow, updates) {
            warn!("Server update does not apply to the known server state: {}", e);
            return Inbound::Resync;
        }
        self.shadow = shadow;

        let Some(container) = self.container.as_mut() else {
            return Inbound::Ignore;
        };
        let (previous, current) = match container.apply_remote(updates) {
            Ok(previous) => (previous, container.data().clone()),
            Err(e) => {
                // Local changes collide with the server's; the server wins
                debug!("Dropping local changes: {}", e);
                let current = self.shadow.clone();
                (self.install(current.clone()), current)
            }
        };

        Inbound::Updated {
            previous,
            current,
            updates: updates.clone(),
        }
    }
}

/// What an inbound change did to local state
#[derive(Debug)]
enum Inbound {
    Ignore,
    Resync,
    Set(Value),
    Stale {
        expected: Fingerprint,
        actual: Fingerprint,
    },
    Updated {
        previous: Value,
        current: Value,
        updates: Vec<PatchOperation>,
    },
}

struct Inner {
    connection: Connection,
    options: SessionOptions,
    events: EventBus<SessionEvent>,
    timer: SyncTimer,
    /// Held for a whole flush or resync, so they run one at a time
    flush_lock: tokio::sync::Mutex<()>,
    state: Mutex<SessionInner>,
    connection_listeners: Mutex<Vec<ListenerId>>,
}

/// Handle to a replicated document
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
}

impl ClientSession {
    /// Create a session for the server mounted at `url`
    ///
    /// Nothing is fetched until [`init`](Self::init).
    pub fn new(url: &str, options: SessionOptions) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let timer = SyncTimer::new(options.sync_time, move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let session = ClientSession { inner };
                tokio::spawn(async move {
                    if let Err(e) = session.save().await {
                        debug!("Scheduled flush failed: {}", e);
                    }
                });
            });

            Inner {
                connection: Connection::new(url),
                options,
                events: EventBus::new(),
                timer,
                flush_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(SessionInner::new()),
                connection_listeners: Mutex::new(Vec::new()),
            }
        });

        Self { inner }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.server_url, SessionOptions::from_config(config))
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.lock().state
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// No local change is waiting to be sent or awaiting a response
    pub fn is_synced(&self) -> bool {
        self.inner.state.lock().synced
    }

    /// Fingerprint of the last server document this session knows of
    pub fn server_fingerprint(&self) -> Fingerprint {
        fingerprint(&self.inner.state.lock().shadow)
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    fn emit(&self, event: SessionEvent) {
        self.inner.events.emit(&event);
    }

    fn fail(&self, error: SyncError) -> SyncError {
        self.emit(SessionEvent::Error(error.clone()));
        error
    }

    /// Fetch the document and, when configured, open the change stream
    ///
    /// Calling `init` on a session that is ready or initializing does
    /// nothing.
    pub async fn init(&self) -> SyncResult<()> {
        {
            let mut state = self.inner.state.lock();
            if state.state != SessionState::Uninitialized {
                return Ok(());
            }
            state.state = SessionState::Initializing;
        }

        let data = match self.inner.connection.get_data().await {
            Ok(data) => data,
            Err(e) => {
                self.inner.state.lock().state = SessionState::Uninitialized;
                return Err(self.fail(SyncError::Connection(format!(
                    "Cannot connect to database. Reason: {}",
                    e
                ))));
            }
        };

        self.inner.state.lock().install(data);

        if self.inner.options.subscribe {
            self.register_connection_listeners();
            if let Err(e) = self.inner.connection.subscribe().await {
                self.inner.state.lock().state = SessionState::Uninitialized;
                return Err(self.fail(SyncError::Connection(format!(
                    "Cannot subscribe. Reason: {}",
                    e
                ))));
            }
        }

        {
            let mut state = self.inner.state.lock();
            state.state = SessionState::Ready;
            state.synced = true;
        }
        info!("Session initialized from {}", self.inner.connection.url());
        self.emit(SessionEvent::Init);
        Ok(())
    }

    fn register_connection_listeners(&self) {
        let mut ids = self.inner.connection_listeners.lock();
        if !ids.is_empty() {
            return;
        }

        let connection = &self.inner.connection;

        let weak = Arc::downgrade(&self.inner);
        ids.push(connection.on(ConnectionEventKind::ChangeData, move |event| {
            if let (Some(inner), ConnectionEvent::ChangeData(message)) = (weak.upgrade(), event) {
                ClientSession { inner }.handle_message(message);
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        ids.push(connection.on(ConnectionEventKind::ConnectionError, move |event| {
            if let (Some(inner), ConnectionEvent::ConnectionError(msg)) = (weak.upgrade(), event) {
                // `init` reports its own subscribe failure
                if inner.state.lock().state != SessionState::Ready {
                    return;
                }
                ClientSession { inner }.emit(SessionEvent::Error(SyncError::Connection(
                    format!("Connection error: {}", msg),
                )));
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        ids.push(connection.on(ConnectionEventKind::ProtocolError, move |event| {
            if let (Some(inner), ConnectionEvent::ProtocolError(e)) = (weak.upgrade(), event) {
                ClientSession { inner }.emit(SessionEvent::Error(e.clone()));
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        ids.push(connection.on(ConnectionEventKind::Disconnect, move |_| {
            if let Some(inner) = weak.upgrade() {
                // Broadcasts of acknowledged changes will never arrive now
                inner.state.lock().sent.retain(|sent| !sent.acked);
                ClientSession { inner }.emit(SessionEvent::Disconnect);
            }
        }));
    }

    /// Copy of the local document
    pub fn data(&self) -> SyncResult<Value> {
        let mut state = self.inner.state.lock();
        Ok(state.container_mut()?.data().clone())
    }

    /// Replace the whole local document
    pub fn set(&self, data: Value) -> SyncResult<()> {
        let previous = {
            let mut state = self.inner.state.lock();
            let previous = state.container_mut()?.set(data.clone());
            state.synced = false;
            previous
        };
        self.inner.timer.start();
        self.emit(SessionEvent::SetData {
            previous,
            current: data,
        });
        Ok(())
    }

    /// Mutate the local document
    ///
    /// The closure runs with the session locked and must not call back into
    /// the session. Returns what the closure returns.
    pub fn update<F, R>(&self, f: F) -> SyncResult<R>
    where
        F: FnOnce(&mut Value) -> R,
    {
        let (result, updates) = {
            let mut state = self.inner.state.lock();
            let (result, updates) = state
                .container_mut()?
                .mutate(f)
                .map_err(|_| SyncError::NotInitialized)?;
            if !updates.is_empty() {
                state.synced = false;
            }
            (result, updates)
        };

        if !updates.is_empty() {
            self.inner.timer.start();
            self.emit(SessionEvent::Update { updates });
        }
        Ok(result)
    }

    /// Send pending local changes to the server
    ///
    /// Does nothing when synced. A flush already in flight is waited for,
    /// then whatever is still pending is sent. On failure the changes are
    /// kept and another flush is scheduled.
    pub async fn save(&self) -> SyncResult<()> {
        let _flush = self.inner.flush_lock.lock().await;
        let (modification, previous_hash, sent_id, epoch) = {
            let mut state = self.inner.state.lock();
            if state.synced {
                return Ok(());
            }
            let previous_hash = fingerprint(&state.shadow);
            let modification = state.container_mut()?.take_modification();

            let change = match &modification {
                Modification::None => {
                    state.synced = true;
                    drop(state);
                    self.inner.timer.stop();
                    return Ok(());
                }
                Modification::Set(data) => SentChange::Set(data.clone()),
                Modification::Update(ops) => SentChange::Update {
                    previous_hash,
                    ops: ops.clone(),
                },
            };

            let id = state.next_sent_id;
            state.next_sent_id += 1;
            state.sent.push_back(Sent {
                id,
                change,
                applied: false,
                echoed: false,
                acked: false,
            });
            state.flushing = true;
            (modification, previous_hash, id, state.epoch)
        };

        let connection = &self.inner.connection;
        let result = match &modification {
            Modification::Set(data) => connection.set_data(data).await,
            Modification::Update(ops) => connection.send_updates(ops, Some(previous_hash)).await,
            Modification::None => Ok(()),
        };

        let expect_echo = connection.is_subscribed();
        let outcome = {
            let mut state = self.inner.state.lock();
            state.flushing = false;
            match result {
                Ok(()) => {
                    let consistent = state.acknowledge(sent_id, expect_echo);
                    let pending = state.has_pending();
                    state.synced = !pending;
                    Ok((pending, consistent))
                }
                Err(e) => {
                    state.forget(sent_id);
                    // A full document from the server replaced what we sent
                    if state.epoch == epoch {
                        if let Some(container) = state.container.as_mut() {
                            container.requeue(modification);
                        }
                        state.synced = false;
                    }
                    Err((e, state.has_pending()))
                }
            }
        };

        match outcome {
            Ok((pending, consistent)) => {
                if pending {
                    self.inner.timer.start();
                } else {
                    self.inner.timer.stop();
                }
                debug!("Local changes saved");
                self.emit(SessionEvent::Save);
                if !consistent {
                    self.spawn_resync();
                }
                Ok(())
            }
            Err((e, pending)) => {
                warn!("Failed to save local changes: {}", e);
                if pending {
                    self.inner.timer.start();
                }
                Err(self.fail(e))
            }
        }
    }

    /// Replace the shadow with a freshly fetched server document
    ///
    /// Pending local changes are replayed on top of it and stay pending.
    /// When they no longer apply they are dropped in favour of the server's
    /// document and a conflict is reported.
    pub async fn resync(&self) -> SyncResult<()> {
        let _flush = self.inner.flush_lock.lock().await;
        let data = match self.inner.connection.get_data().await {
            Ok(data) => data,
            Err(e) => return Err(self.fail(e)),
        };

        let (previous, current, pending, rebased) = {
            let mut state = self.inner.state.lock();
            // Closed while fetching
            if state.container.is_none() {
                return Ok(());
            }
            let (previous, rebased) = state.rebase(data);
            let current = state
                .container
                .as_ref()
                .map(|container| container.data().clone())
                .unwrap_or_default();
            (previous, current, state.has_pending(), rebased)
        };
        if pending {
            self.inner.timer.start();
        } else {
            self.inner.timer.stop();
        }
        info!(pending, "Resynchronized with server");

        self.emit(SessionEvent::SetData {
            previous: previous.clone(),
            current: current.clone(),
        });
        self.emit(SessionEvent::ChangeData { previous, current });

        rebased.map_err(|e| {
            self.fail(SyncError::Conflict(format!(
                "Local changes no longer apply to the server document: {}",
                e
            )))
        })
    }

    fn spawn_resync(&self) {
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.resync().await {
                warn!("Resync failed: {}", e);
            }
        });
    }

    fn install_remote(&self, data: Value) {
        let previous = {
            let mut state = self.inner.state.lock();
            if state.container.is_none() {
                return;
            }
            state.install(data.clone())
        };
        self.inner.timer.stop();
        self.emit(SessionEvent::SetData {
            previous: previous.clone(),
            current: data.clone(),
        });
        self.emit(SessionEvent::ChangeData {
            previous,
            current: data,
        });
    }

    /// Apply a change pushed by the server
    fn handle_message(&self, message: &StreamMessage) {
        let inbound = {
            let mut state = self.inner.state.lock();
            if state.container.is_none() {
                return;
            }
            state.receive(message)
        };

        match inbound {
            Inbound::Ignore => debug!("Ignoring broadcast of our own change"),
            Inbound::Resync => self.spawn_resync(),
            Inbound::Set(data) => self.install_remote(data),
            Inbound::Stale { expected, actual } => {
                info!(expected, actual, "Local replica is stale");
                self.emit(SessionEvent::Stale { expected, actual });
                self.spawn_resync();
            }
            Inbound::Updated {
                previous,
                current,
                updates,
            } => {
                self.emit(SessionEvent::UpdateData {
                    previous: previous.clone(),
                    current: current.clone(),
                    updates,
                });
                self.emit(SessionEvent::ChangeData { previous, current });
            }
        }
    }

    /// Stop syncing: cancel the pending flush, close the stream, stop
    /// observing the document
    pub fn close(&self) {
        self.inner.timer.stop();
        self.inner.connection.unsubscribe();
        for id in self.inner.connection_listeners.lock().drain(..) {
            self.inner.connection.off(id);
        }

        let mut state = self.inner.state.lock();
        if let Some(container) = state.container.as_mut() {
            container.unobserve();
        }
        state.container = None;
        state.sent.clear();
        state.state = SessionState::Uninitialized;
        debug!("Session closed");
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ClientSession")
            .field("url", &self.inner.connection.url())
            .field("state", &state.state)
            .field("synced", &state.synced)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ops(value: Value) -> Vec<PatchOperation> {
        serde_json::from_value(value).unwrap()
    }

    fn ready(data: Value) -> SessionInner {
        let mut inner = SessionInner::new();
        inner.install(data);
        inner.state = SessionState::Ready;
        inner
    }

    fn send(inner: &mut SessionInner, change: SentChange) -> u64 {
        let id = inner.next_sent_id;
        inner.next_sent_id += 1;
        inner.sent.push_back(Sent {
            id,
            change,
            applied: false,
            echoed: false,
            acked: false,
        });
        id
    }

    #[test]
    fn test_uninitialized_session_rejects_local_changes() {
        let session = ClientSession::new("http://127.0.0.1:1/easy-db", SessionOptions::default());
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(session.data(), Err(SyncError::NotInitialized));
        assert_eq!(session.set(json!({})), Err(SyncError::NotInitialized));
        assert_eq!(
            session.update(|doc| doc["a"] = json!(1)),
            Err(SyncError::NotInitialized)
        );
    }

    #[test]
    fn test_options_from_config() {
        let config = Config {
            subscribe: false,
            sync_time_ms: 250,
            ..Config::default()
        };
        let options = SessionOptions::from_config(&config);
        assert!(!options.subscribe);
        assert_eq!(options.sync_time, Duration::from_millis(250));
    }

    #[test]
    fn test_matching_update_applies_and_keeps_pending() {
        let mut inner = ready(json!({"a": 1}));
        inner
            .container_mut()
            .unwrap()
            .mutate(|doc| doc["mine"] = json!(true))
            .unwrap();
        let h0 = fingerprint(&json!({"a": 1}));

        let inbound = inner.receive(&StreamMessage::Update {
            data: ops(json!([{"op": "add", "path": "/theirs", "value": 2}])),
            previous_hash: h0,
        });

        let Inbound::Updated { previous, current, .. } = inbound else {
            panic!("Expected Updated, got {:?}", inbound);
        };
        assert_eq!(previous, json!({"a": 1, "mine": true}));
        assert_eq!(current, json!({"a": 1, "mine": true, "theirs": 2}));
        assert_eq!(inner.shadow, json!({"a": 1, "theirs": 2}));
        assert!(!inner.container.as_ref().unwrap().modification().is_none());
    }

    #[test]
    fn test_mismatched_update_is_stale() {
        let mut inner = ready(json!({"a": 1}));
        let h0 = fingerprint(&json!({"a": 1}));

        let inbound = inner.receive(&StreamMessage::Update {
            data: ops(json!([{"op": "add", "path": "/b", "value": 2}])),
            previous_hash: h0 + 1,
        });

        match inbound {
            Inbound::Stale { expected, actual } => {
                assert_eq!(expected, h0);
                assert_eq!(actual, h0 + 1);
            }
            other => panic!("Expected Stale, got {:?}", other),
        }
        assert_eq!(inner.shadow, json!({"a": 1}));
    }

    #[test]
    fn test_colliding_update_lets_server_win() {
        let mut inner = ready(json!({"list": [1]}));
        inner
            .container_mut()
            .unwrap()
            .mutate(|doc| {
                doc.as_object_mut().unwrap().remove("list");
            })
            .unwrap();

        let inbound = inner.receive(&StreamMessage::Update {
            data: ops(json!([{"op": "add", "path": "/list/1", "value": 2}])),
            previous_hash: fingerprint(&json!({"list": [1]})),
        });

        let Inbound::Updated { current, .. } = inbound else {
            panic!("Expected Updated, got {:?}", inbound);
        };
        assert_eq!(current, json!({"list": [1, 2]}));
        assert!(inner.container.as_ref().unwrap().modification().is_none());
    }

    #[test]
    fn test_inbound_set_is_reported() {
        let mut inner = ready(json!({"a": 1}));
        let inbound = inner.receive(&StreamMessage::Set {
            data: json!({"fresh": 1}),
            previous_hash: 0,
        });
        assert!(matches!(inbound, Inbound::Set(data) if data == json!({"fresh": 1})));
    }

    #[test]
    fn test_echo_before_ack_advances_shadow_once() {
        let mut inner = ready(json!({}));
        let h0 = fingerprint(&json!({}));
        let patch = ops(json!([{"op": "add", "path": "/a", "value": 1}]));
        let id = send(
            &mut inner,
            SentChange::Update {
                previous_hash: h0,
                ops: patch.clone(),
            },
        );

        let inbound = inner.receive(&StreamMessage::Update {
            data: patch,
            previous_hash: h0,
        });
        assert!(matches!(inbound, Inbound::Ignore));
        assert_eq!(inner.shadow, json!({"a": 1}));

        assert!(inner.acknowledge(id, true));
        assert_eq!(inner.shadow, json!({"a": 1}));
        assert!(inner.sent.is_empty());
    }

    #[test]
    fn test_ack_before_echo_waits_for_broadcast() {
        let mut inner = ready(json!({}));
        let id = send(&mut inner, SentChange::Set(json!({"s": 1})));

        assert!(inner.acknowledge(id, true));
        assert_eq!(inner.shadow, json!({"s": 1}));
        assert_eq!(inner.sent.len(), 1);

        let inbound = inner.receive(&StreamMessage::Set {
            data: json!({"s": 1}),
            previous_hash: fingerprint(&json!({})),
        });
        assert!(matches!(inbound, Inbound::Ignore));
        assert!(inner.sent.is_empty());
    }

    #[test]
    fn test_ack_without_stream_forgets_change() {
        let mut inner = ready(json!({}));
        let id = send(&mut inner, SentChange::Set(json!({"s": 1})));

        assert!(inner.acknowledge(id, false));
        assert!(inner.sent.is_empty());
    }

    #[test]
    fn test_other_clients_change_is_not_an_echo() {
        let mut inner = ready(json!({}));
        let h0 = fingerprint(&json!({}));
        send(
            &mut inner,
            SentChange::Update {
                previous_hash: h0,
                ops: ops(json!([{"op": "add", "path": "/mine", "value": 1}])),
            },
        );

        let inbound = inner.receive(&StreamMessage::Update {
            data: ops(json!([{"op": "add", "path": "/theirs", "value": 1}])),
            previous_hash: h0,
        });
        assert!(matches!(inbound, Inbound::Updated { .. }));
        assert_eq!(inner.sent.len(), 1);
    }

    #[test]
    fn test_install_discards_pending_and_sent() {
        let mut inner = ready(json!({}));
        inner.container_mut().unwrap().set(json!({"local": 1}));
        send(&mut inner, SentChange::Set(json!({"local": 1})));
        let epoch = inner.epoch;

        let previous = inner.install(json!({"server": 1}));

        assert_eq!(previous, json!({"local": 1}));
        assert!(inner.sent.is_empty());
        assert!(inner.synced);
        assert_eq!(inner.epoch, epoch + 1);
        assert!(inner.container.as_ref().unwrap().modification().is_none());
    }

    #[test]
    fn test_rebase_keeps_pending_update() {
        let mut inner = ready(json!({}));
        inner
            .container_mut()
            .unwrap()
            .mutate(|doc| doc["mine"] = json!(1))
            .unwrap();
        inner.synced = false;
        send(&mut inner, SentChange::Set(json!({"acked": 1})));
        let epoch = inner.epoch;

        let (previous, rebased) = inner.rebase(json!({"missed": 1}));

        rebased.unwrap();
        assert_eq!(previous, json!({"mine": 1}));
        assert_eq!(
            *inner.container.as_ref().unwrap().data(),
            json!({"missed": 1, "mine": 1})
        );
        assert_eq!(inner.shadow, json!({"missed": 1}));
        assert!(inner.sent.is_empty());
        assert!(!inner.synced);
        assert_eq!(inner.epoch, epoch + 1);
    }

    #[test]
    fn test_rebase_without_pending_is_synced() {
        let mut inner = ready(json!({}));
        inner.synced = false;

        let (_, rebased) = inner.rebase(json!({"server": 1}));
        rebased.unwrap();
        assert!(inner.synced);
        assert!(!inner.has_pending());
    }
}
