//! Server process wiring
//!
//! Ties the store, the registry and the router together, drives periodic
//! persistence and flushes once more on shutdown.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;

use super::handlers::{router, AppState};
use super::registry::SubscriberRegistry;
use super::store::{persist_blocking, spawn_persistence, DocumentStore};

/// A configured, not yet listening server
#[derive(Debug)]
pub struct Server {
    state: AppState,
    base_path: String,
    persist_interval: Duration,
}

impl Server {
    /// Wrap a store. Changes applied to it are streamed to subscribers.
    pub fn new(store: Arc<DocumentStore>) -> Self {
        let registry = Arc::new(SubscriberRegistry::new());

        let broadcast_to = Arc::clone(&registry);
        store.on_change(move |change| {
            broadcast_to.broadcast(&change.to_message());
        });

        Self {
            state: AppState {
                store,
                registry,
                debug: false,
            },
            base_path: String::new(),
            persist_interval: Duration::from_secs(20),
        }
    }

    /// Open the configured data file and apply the server settings
    pub fn from_config(config: &Config) -> Self {
        let store = Arc::new(DocumentStore::open(&config.data_file));
        Self::new(store)
            .with_debug(config.debug)
            .with_base_path(&config.normalized_base_path())
            .with_persist_interval(config.persist_interval())
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.state.debug = debug;
        self
    }

    /// Mount point, normalized like `Config::normalized_base_path`
    pub fn with_base_path(mut self, base_path: &str) -> Self {
        let trimmed = base_path.trim_matches('/');
        self.base_path = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        };
        self
    }

    pub fn with_persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = interval;
        self
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.state.store
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.state.registry
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn router(&self) -> Router {
        router(self.state.clone(), &self.base_path)
    }

    /// Bind to an address and serve until `shutdown` resolves
    pub async fn run<F>(self, addr: SocketAddr, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    ///
    /// The document is persisted one last time before returning.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        info!("Listening on http://{}{}/", local_addr, self.base_path);

        let store = Arc::clone(&self.state.store);
        let persistence = spawn_persistence(Arc::clone(&store), self.persist_interval);

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;

        persistence.abort();
        match persist_blocking(store).await {
            Ok(true) => info!("Document persisted on shutdown"),
            Ok(false) => {}
            Err(e) => error!("Failed to persist document on shutdown: {}", e),
        }

        result
    }
}
