//! One-shot document commands: get, set, patch, hash

use anyhow::{bail, Context, Result};
use json_patch::PatchOperation;
use serde_json::Value;

use easydb_core::{fingerprint, Config, Connection, Fingerprint, SyncError};

use crate::output::Output;

/// Print the document, or the part of it a JSON pointer selects
pub async fn get(config: &Config, pointer: Option<String>, output: &Output) -> Result<()> {
    let connection = Connection::new(&config.server_url);
    let data = connection
        .get_data()
        .await
        .with_context(|| format!("Failed to fetch document from {}", connection.url()))?;

    let selected = match pointer.as_deref() {
        Some(pointer) => data
            .pointer(pointer)
            .with_context(|| format!("Nothing at '{}'", pointer))?,
        None => &data,
    };
    output.print_document(selected, fingerprint(&data));
    Ok(())
}

/// Replace the document on the server
pub async fn set(config: &Config, input: &str, output: &Output) -> Result<()> {
    let data = parse_input(input)?;
    let connection = Connection::new(&config.server_url);
    connection
        .set_data(&data)
        .await
        .context("Failed to replace document")?;

    output.success(&format!(
        "Document replaced (fingerprint {})",
        fingerprint(&data)
    ));
    Ok(())
}

/// Send a JSON patch to the server
///
/// Without a previous fingerprint the patch is applied unconditionally.
pub async fn patch(
    config: &Config,
    input: &str,
    previous_hash: Option<Fingerprint>,
    output: &Output,
) -> Result<()> {
    let updates = parse_patch(input)?;
    if updates.is_empty() {
        output.message("Nothing to apply");
        return Ok(());
    }

    let connection = Connection::new(&config.server_url);
    match connection.send_updates(&updates, previous_hash).await {
        Ok(()) => {}
        Err(SyncError::Conflict(msg)) => bail!(
            "Patch rejected: {}\n\
             Fetch the current fingerprint with `easydb get` and try again.",
            msg
        ),
        Err(e) => return Err(e).context("Failed to apply patch"),
    }

    output.success(&format!("Applied {} operation(s)", updates.len()));
    Ok(())
}

/// Print the fingerprint of a value
pub fn hash(input: &str, output: &Output) -> Result<()> {
    let value = parse_input(input)?;
    output.print_fingerprint(fingerprint(&value));
    Ok(())
}

/// Parse a JSON argument, reading it from a file when it starts with `@`
fn parse_input(input: &str) -> Result<Value> {
    let text = match input.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path))?,
        None => input.to_string(),
    };
    serde_json::from_str(&text).context("Input is not valid JSON")
}

fn parse_patch(input: &str) -> Result<Vec<PatchOperation>> {
    let value = parse_input(input)?;
    // A single operation is accepted without the surrounding array
    let value = match value {
        Value::Object(_) => Value::Array(vec![value]),
        other => other,
    };
    serde_json::from_value(value).context("Input is not a JSON patch")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_parse_inline() {
        assert_eq!(parse_input(r#"{"a": [1, 2]}"#).unwrap(), json!({"a": [1, 2]}));
        assert_eq!(parse_input("42").unwrap(), json!(42));
        assert!(parse_input("{a: 1}").is_err());
    }

    #[test]
    fn test_parse_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"from": "file"}}"#).unwrap();

        let arg = format!("@{}", file.path().display());
        assert_eq!(parse_input(&arg).unwrap(), json!({"from": "file"}));

        assert!(parse_input("@/nonexistent/easydb/input.json").is_err());
    }

    #[test]
    fn test_parse_patch() {
        let ops = parse_patch(r#"[{"op": "add", "path": "/a", "value": 1}]"#).unwrap();
        assert_eq!(ops.len(), 1);

        let single = parse_patch(r#"{"op": "remove", "path": "/a"}"#).unwrap();
        assert_eq!(single.len(), 1);

        assert!(parse_patch(r#"[{"op": "explode", "path": "/a"}]"#).is_err());
        assert!(parse_patch(r#""add""#).is_err());
    }
}
