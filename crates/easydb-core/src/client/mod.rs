//! Replica side of the replication
//!
//! - [`ClientSession`] owns the local document and reconciles it with the server
//! - [`Connection`] speaks the wire protocol
//! - [`observer`] turns local mutations into patch operations
//! - [`SyncTimer`] debounces flushes
//! - [`Collection`] stores typed records inside the document

pub mod collection;
pub mod connection;
pub mod observer;
pub mod session;
pub mod timer;

pub use collection::{Collection, Record};
pub use connection::{Connection, ConnectionEvent, ConnectionEventKind};
pub use observer::{DataContainer, Modification, Observation, Observer, ObserverError};
pub use session::{ClientSession, EventKind, SessionEvent, SessionOptions, SessionState};
pub use timer::SyncTimer;
