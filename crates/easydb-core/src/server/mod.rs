//! Authoritative side of the replication
//!
//! - [`DocumentStore`] holds the canonical document and rejects stale patches
//! - [`SubscriberRegistry`] fans changes out to streaming connections
//! - [`handlers`] exposes both over HTTP and websocket
//! - [`Server`] wires them together and persists the document periodically

pub mod handlers;
pub mod persistence;
pub mod registry;
pub mod runner;
pub mod store;

pub use handlers::{router, AppState};
pub use persistence::{DataFile, PersistenceError, PersistenceResult};
pub use registry::SubscriberRegistry;
pub use runner::Server;
pub use store::{
    persist_blocking, spawn_persistence, DocumentStore, StoreChange, StoreChangeKind,
};
