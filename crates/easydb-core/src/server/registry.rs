//! Registry of streaming connections
//!
//! Each connection is represented by the sending half of its own unbounded
//! channel; a writer task per connection drains it onto the socket, which
//! keeps delivery to one connection in FIFO order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::StreamMessage;

/// Outbound channel of one connection, carrying encoded text frames
pub type FrameSender = mpsc::UnboundedSender<String>;

/// Live streaming connections keyed by id
#[derive(Debug)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    connections: RwLock<HashMap<u64, FrameSender>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection. Ids are never reused.
    pub fn add(&self, sender: FrameSender) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.write().insert(id, sender);
        debug!(id, "Subscriber connected");
        id
    }

    pub fn remove(&self, id: u64) -> bool {
        let removed = self.connections.write().remove(&id).is_some();
        if removed {
            debug!(id, "Subscriber disconnected");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Send a message to every connection
    ///
    /// The message is encoded once. A connection whose channel is closed is
    /// skipped; its own handler removes it. Returns the number of
    /// connections the frame was handed to.
    pub fn broadcast(&self, message: &StreamMessage) -> usize {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping broadcast: {}", e);
                return 0;
            }
        };

        let connections = self.connections.read();
        let mut delivered = 0;
        for (id, sender) in connections.iter() {
            match sender.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(id, "Failed to deliver change to subscriber"),
            }
        }
        debug!(
            method = message.method(),
            delivered,
            total = connections.len(),
            "Broadcast change"
        );
        delivered
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set_message() -> StreamMessage {
        StreamMessage::Set {
            data: json!({"a": 1}),
            previous_hash: 3,
        }
    }

    #[test]
    fn test_ids_are_monotonic_and_not_reused() {
        let registry = SubscriberRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let a = registry.add(tx.clone());
        let b = registry.add(tx.clone());
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        let c = registry.add(tx);
        assert_eq!(c, 3);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_broadcast_reaches_everyone() {
        let registry = SubscriberRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.add(tx1);
        registry.add(tx2);

        assert_eq!(registry.broadcast(&set_message()), 2);

        let expected = set_message().encode().unwrap();
        assert_eq!(rx1.try_recv().unwrap(), expected);
        assert_eq!(rx2.try_recv().unwrap(), expected);
    }

    #[test]
    fn test_broadcast_skips_closed_connections() {
        let registry = SubscriberRegistry::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.add(tx1);
        registry.add(tx2);
        drop(rx1);

        assert_eq!(registry.broadcast(&set_message()), 1);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_preserves_order() {
        let registry = SubscriberRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.add(tx);

        for hash in 0..5 {
            registry.broadcast(&StreamMessage::Set {
                data: json!(hash),
                previous_hash: hash,
            });
        }

        for hash in 0..5 {
            let frame = rx.try_recv().unwrap();
            assert_eq!(StreamMessage::decode(&frame).unwrap().previous_hash(), hash);
        }
    }

    #[test]
    fn test_empty_registry() {
        let registry = SubscriberRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.broadcast(&set_message()), 0);
    }
}
