//! EasyDB Core Library
//!
//! This crate keeps one shared JSON document consistent between an
//! authoritative server and any number of connected clients. Changes travel
//! as JSON Patch (RFC 6902) operations; a client patch is rejected when it
//! was computed against a document the server no longer has.
//!
//! # Architecture
//!
//! - **Server**: holds the canonical document, checks fingerprints, persists
//!   to a JSON file and streams every applied change to subscribers
//! - **Client**: keeps a local replica, records local mutations as patches,
//!   flushes them after an idle window and applies changes from the stream
//!
//! # Quick Start
//!
//! ```text
//! // Server
//! let server = Server::from_config(&config);
//! server.run(config.bind, shutdown_signal()).await?;
//!
//! // Client
//! let session = ClientSession::from_config(&config);
//! session.init().await?;
//! session.update(|doc| doc["visits"] = json!(1))?;
//! session.save().await?;
//! ```
//!
//! # Modules
//!
//! - `client`: session, transport, change observer, debounce timer, collections
//! - `server`: document store, subscriber registry, HTTP/websocket handlers
//! - `protocol`: wire messages
//! - `hash`: document fingerprints
//! - `events`: typed listener registry
//! - `config`: application configuration

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod hash;
pub mod protocol;
pub mod server;

pub use client::{
    ClientSession, Collection, Connection, EventKind, Record, SessionEvent, SessionOptions,
    SessionState,
};
pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use events::{Event, EventBus, ListenerId};
pub use hash::{fingerprint, Fingerprint};
pub use protocol::{Envelope, StreamMessage, UpdateRequest};
pub use server::{DocumentStore, PersistenceError, Server, SubscriberRegistry};
