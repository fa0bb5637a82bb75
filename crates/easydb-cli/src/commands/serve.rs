//! Serve command handler

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use easydb_core::{Config, Server};

use crate::output::Output;

/// Command-line settings that take precedence over the configuration
#[derive(Debug, Default)]
pub struct ServeOptions {
    pub bind: Option<SocketAddr>,
    pub data_file: Option<PathBuf>,
    pub base_path: Option<String>,
    pub debug: bool,
}

impl ServeOptions {
    fn apply(self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(data_file) = self.data_file {
            config.data_file = data_file;
        }
        if let Some(base_path) = self.base_path {
            config.base_path = base_path;
        }
        if self.debug {
            config.debug = true;
        }
    }
}

/// Run the server until Ctrl-C
pub async fn run(mut config: Config, options: ServeOptions, output: &Output) -> Result<()> {
    options.apply(&mut config);

    let server = Server::from_config(&config);
    output.message(&format!(
        "Serving {} at http://{}{}/",
        config.data_file.display(),
        config.bind,
        server.base_path()
    ));

    server
        .run(config.bind, shutdown_signal())
        .await
        .with_context(|| format!("Failed to serve on {}", config.bind))?;

    output.success("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let mut config = Config::default();
        let options = ServeOptions {
            bind: Some("0.0.0.0:4000".parse().unwrap()),
            data_file: Some(PathBuf::from("/srv/easydb.json")),
            base_path: None,
            debug: true,
        };

        options.apply(&mut config);
        assert_eq!(config.bind.port(), 4000);
        assert_eq!(config.data_file, PathBuf::from("/srv/easydb.json"));
        assert_eq!(config.base_path, "/easy-db");
        assert!(config.debug);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let mut config = Config {
            debug: true,
            ..Config::default()
        };
        ServeOptions::default().apply(&mut config);
        assert!(config.debug);
        assert_eq!(config.bind, Config::default().bind);
        assert_eq!(config.data_file, Config::default().data_file);
    }
}
