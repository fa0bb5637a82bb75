//! Canonical document holder
//!
//! The store owns the authoritative document and its fingerprint. All writers
//! go through a single write guard that is held for the whole
//! read-modify-notify sequence, so change notifications are emitted in the
//! same order the changes were applied.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use json_patch::PatchOperation;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::events::{Event, EventBus, ListenerId};
use crate::hash::{fingerprint, Fingerprint};
use crate::protocol::StreamMessage;

use super::persistence::{DataFile, PersistenceError, PersistenceResult};

/// A change applied to the canonical document
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    /// The document was replaced wholesale
    Set {
        data: Value,
        previous_hash: Fingerprint,
    },
    /// A patch was applied
    Update {
        updates: Vec<PatchOperation>,
        previous_hash: Fingerprint,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreChangeKind {
    Set,
    Update,
}

impl Event for StoreChange {
    type Kind = StoreChangeKind;

    fn kind(&self) -> StoreChangeKind {
        match self {
            StoreChange::Set { .. } => StoreChangeKind::Set,
            StoreChange::Update { .. } => StoreChangeKind::Update,
        }
    }
}

impl StoreChange {
    /// The frame pushed to subscribers for this change
    pub fn to_message(&self) -> StreamMessage {
        match self {
            StoreChange::Set {
                data,
                previous_hash,
            } => StreamMessage::Set {
                data: data.clone(),
                previous_hash: *previous_hash,
            },
            StoreChange::Update {
                updates,
                previous_hash,
            } => StreamMessage::Update {
                data: updates.clone(),
                previous_hash: *previous_hash,
            },
        }
    }
}

#[derive(Debug)]
struct StoreState {
    data: Value,
    fingerprint: Fingerprint,
    dirty: bool,
}

impl StoreState {
    fn new(data: Value, dirty: bool) -> Self {
        let fingerprint = fingerprint(&data);
        Self {
            data,
            fingerprint,
            dirty,
        }
    }
}

/// The authoritative copy of the shared document
#[derive(Debug)]
pub struct DocumentStore {
    state: RwLock<StoreState>,
    file: Option<DataFile>,
    events: EventBus<StoreChange>,
}

impl DocumentStore {
    /// Open the store backed by a data file
    ///
    /// Startup never fails: a missing, unreadable or corrupt file yields an
    /// empty object, marked dirty so the next flush creates a valid file.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let file = DataFile::new(path.as_ref());

        let state = match file.load() {
            Ok(data) => {
                info!("Loaded document from {:?}", file.path());
                StoreState::new(data, false)
            }
            Err(PersistenceError::NotFound { .. }) => {
                info!(
                    "No document at {:?}, starting with an empty one",
                    file.path()
                );
                StoreState::new(Value::Object(Default::default()), true)
            }
            Err(e) => {
                warn!("Could not load document, starting with an empty one: {}", e);
                StoreState::new(Value::Object(Default::default()), true)
            }
        };

        Self {
            state: RwLock::new(state),
            file: Some(file),
            events: EventBus::new(),
        }
    }

    /// A store that is never written to disk
    pub fn in_memory(data: Value) -> Self {
        Self {
            state: RwLock::new(StoreState::new(data, false)),
            file: None,
            events: EventBus::new(),
        }
    }

    /// Copy of the current document
    pub fn read(&self) -> Value {
        self.state.read().data.clone()
    }

    /// Fingerprint of the current document
    pub fn fingerprint(&self) -> Fingerprint {
        self.state.read().fingerprint
    }

    /// Whether there are changes not yet written to disk
    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    /// Register a listener for applied changes
    ///
    /// Listeners run while the write guard is held. They must not call back
    /// into the store.
    pub fn on_change<F>(&self, listener: F) -> Vec<ListenerId>
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        let listener = Arc::new(listener);
        [StoreChangeKind::Set, StoreChangeKind::Update]
            .into_iter()
            .map(|kind| {
                let listener = Arc::clone(&listener);
                self.events.on(kind, move |change| listener(change))
            })
            .collect()
    }

    /// Remove a change listener
    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Replace the whole document unconditionally
    pub fn replace(&self, data: Value) {
        let mut state = self.state.write();
        let previous_hash = state.fingerprint;

        state.fingerprint = fingerprint(&data);
        state.data = data.clone();
        state.dirty = true;
        debug!(previous_hash, hash = state.fingerprint, "Document replaced");

        self.events.emit(&StoreChange::Set {
            data,
            previous_hash,
        });
    }

    /// Apply a patch to the document
    ///
    /// When `expected_hash` is given and differs from the current fingerprint
    /// the patch was computed against a stale document and nothing is
    /// applied. A failing operation leaves the document untouched.
    pub fn apply_patch(
        &self,
        updates: &[PatchOperation],
        expected_hash: Option<Fingerprint>,
    ) -> SyncResult<()> {
        let mut state = self.state.write();
        let previous_hash = state.fingerprint;

        if let Some(expected) = expected_hash {
            if expected != previous_hash {
                debug!(expected, actual = previous_hash, "Rejecting stale patch");
                return Err(SyncError::stale(expected, previous_hash));
            }
        }

        let mut working = state.data.clone();
        json_patch::patch(&mut working, updates)
            .map_err(|e| SyncError::Validation(format!("patch could not be applied: {}", e)))?;

        state.fingerprint = fingerprint(&working);
        state.data = working;
        state.dirty = true;
        debug!(
            previous_hash,
            hash = state.fingerprint,
            ops = updates.len(),
            "Patch applied"
        );

        self.events.emit(&StoreChange::Update {
            updates: updates.to_vec(),
            previous_hash,
        });
        Ok(())
    }

    /// Write the document to disk if it changed since the last flush
    ///
    /// Returns true when a write happened. On failure the store stays dirty
    /// so the next flush retries.
    pub fn persist(&self) -> PersistenceResult<bool> {
        let Some(file) = &self.file else {
            return Ok(false);
        };

        let serialized = {
            let mut state = self.state.write();
            if !state.dirty {
                return Ok(false);
            }
            state.dirty = false;
            state.data.to_string()
        };

        if let Err(e) = file.save(&serialized) {
            self.state.write().dirty = true;
            return Err(e);
        }

        debug!("Document written to {:?}", file.path());
        Ok(true)
    }
}

/// Flush the store on a fixed interval
///
/// Failures are logged and retried on the next tick.
pub fn spawn_persistence(store: Arc<DocumentStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = persist_blocking(Arc::clone(&store)).await {
                match e.recovery_suggestion() {
                    Some(hint) => error!("Failed to persist document: {} ({})", e, hint),
                    None => error!("Failed to persist document: {}", e),
                }
            }
        }
    })
}

/// Run [`DocumentStore::persist`] on the blocking pool
///
/// The write syncs the file to disk, which must not stall a runtime worker.
pub async fn persist_blocking(store: Arc<DocumentStore>) -> PersistenceResult<bool> {
    let path = store
        .file
        .as_ref()
        .map(|file| file.path().to_path_buf())
        .unwrap_or_default();

    match tokio::task::spawn_blocking(move || store.persist()).await {
        Ok(result) => result,
        Err(e) => Err(PersistenceError::WriteError {
            path,
            source: io::Error::new(io::ErrorKind::Other, e),
        }),
    }
}
