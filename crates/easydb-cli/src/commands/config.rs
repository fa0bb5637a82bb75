//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use easydb_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&config).context("Failed to serialize configuration")?
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.server_url);
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  Server");
            println!("    data_file:             {}", config.data_file.display());
            println!("    bind:                  {}", config.bind);
            println!("    base_path:             {}", config.base_path);
            println!("    persist_interval_secs: {}", config.persist_interval_secs);
            println!("    debug:                 {}", config.debug);
            println!("  Client");
            println!("    server_url:            {}", config.server_url);
            println!("    sync_time_ms:          {}", config.sync_time_ms);
            println!("    subscribe:             {}", config.subscribe);
            println!("  Logging");
            println!("    log_level:             {}", config.log_level);
            println!(
                "    log_file:              {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_file" => config.data_file = value.into(),
        "bind" => {
            config.bind = value
                .parse()
                .context("Invalid value for bind. Use host:port, e.g. 127.0.0.1:3000")?;
        }
        "base_path" => config.base_path = value.to_string(),
        "persist_interval_secs" => {
            config.persist_interval_secs = value
                .parse()
                .context("Invalid value for persist_interval_secs. Use a number of seconds.")?;
        }
        "debug" => {
            config.debug = value
                .parse()
                .context("Invalid value for debug. Use 'true' or 'false'.")?;
        }
        "server_url" => config.server_url = value.to_string(),
        "sync_time_ms" => {
            config.sync_time_ms = value
                .parse()
                .context("Invalid value for sync_time_ms. Use a number of milliseconds.")?;
        }
        "subscribe" => {
            config.subscribe = value
                .parse()
                .context("Invalid value for subscribe. Use 'true' or 'false'.")?;
        }
        "log_level" => config.log_level = value.to_string(),
        "log_file" => {
            config.log_file = if value.is_empty() || value == "none" {
                None
            } else {
                Some(value.into())
            };
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: data_file, bind, base_path, persist_interval_secs, debug, \
                 server_url, sync_time_ms, subscribe, log_level, log_file",
                key
            );
        }
    }
    Ok(())
}
