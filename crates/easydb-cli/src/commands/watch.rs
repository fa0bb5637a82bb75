//! Watch command handler

use anyhow::{bail, Context, Result};

use easydb_core::{ClientSession, Config, EventKind, SessionOptions};

use crate::output::Output;

/// Print the document, then every change to it until Ctrl-C
pub async fn run(config: &Config, output: &Output) -> Result<()> {
    let session = ClientSession::new(
        &config.server_url,
        SessionOptions {
            subscribe: true,
            sync_time: config.sync_time(),
        },
    );

    for kind in [
        EventKind::SetData,
        EventKind::UpdateData,
        EventKind::Stale,
        EventKind::Disconnect,
        EventKind::Error,
    ] {
        let output = *output;
        session.on(kind, move |event| output.print_event(event));
    }

    session
        .init()
        .await
        .with_context(|| format!("Failed to connect to {}", config.server_url))?;
    output.print_document(&session.data()?, session.server_fingerprint());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            session.close();
            signal.context("Failed to listen for Ctrl-C")?;
        }
        closed = session.connection().closed() => {
            session.close();
            if let Some(Err(e)) = closed {
                return Err(e).context("Change stream failed");
            }
            bail!("Server closed the change stream");
        }
    }

    Ok(())
}
