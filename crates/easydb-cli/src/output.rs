//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use easydb_core::{Fingerprint, SessionEvent};
use serde_json::{json, Value};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
#[derive(Debug, Clone, Copy)]
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print a document (or part of one) with the fingerprint of the whole
    pub fn print_document(&self, value: &Value, fingerprint: Fingerprint) {
        match self.format {
            OutputFormat::Human => {
                println!("{:#}", value);
                println!();
                println!("Fingerprint: {}", fingerprint);
            }
            OutputFormat::Json => {
                println!("{}", json!({"fingerprint": fingerprint, "data": value}));
            }
            OutputFormat::Quiet => println!("{}", value),
        }
    }

    pub fn print_fingerprint(&self, fingerprint: Fingerprint) {
        match self.format {
            OutputFormat::Json => println!("{}", json!({"fingerprint": fingerprint})),
            OutputFormat::Human | OutputFormat::Quiet => println!("{}", fingerprint),
        }
    }

    /// Print a change seen by a watching session
    ///
    /// Events that do not describe a change print nothing.
    pub fn print_event(&self, event: &SessionEvent) {
        let Some(line) = self.format_event(event) else {
            return;
        };
        match event {
            SessionEvent::Error(_) => eprintln!("{}", line),
            _ => println!("{}", line),
        }
    }

    fn format_event(&self, event: &SessionEvent) -> Option<String> {
        match (self.format, event) {
            (OutputFormat::Human, SessionEvent::SetData { current, .. }) => {
                Some(format!("── Document replaced ──\n{:#}", current))
            }
            (OutputFormat::Human, SessionEvent::UpdateData { updates, .. }) => {
                let ops: Vec<String> = updates
                    .iter()
                    .map(|op| match serde_json::to_value(op) {
                        Ok(value) => format!("  {}", value),
                        Err(_) => format!("  {:?}", op),
                    })
                    .collect();
                Some(format!(
                    "── Updated ({} op(s)) ──\n{}",
                    updates.len(),
                    ops.join("\n")
                ))
            }
            (OutputFormat::Human, SessionEvent::Stale { expected, actual }) => Some(format!(
                "Out of date (have {}, server had {}), reloading",
                expected, actual
            )),
            (OutputFormat::Human, SessionEvent::Disconnect) => {
                Some("Disconnected from server".to_string())
            }
            (OutputFormat::Human, SessionEvent::Error(e)) => Some(format!("Error: {}", e)),

            (OutputFormat::Json, SessionEvent::SetData { current, .. }) => {
                Some(json!({"event": "set", "data": current}).to_string())
            }
            (OutputFormat::Json, SessionEvent::UpdateData {
                current, updates, ..
            }) => Some(
                json!({"event": "update", "updates": updates, "data": current}).to_string(),
            ),
            (OutputFormat::Json, SessionEvent::Stale { expected, actual }) => Some(
                json!({"event": "stale", "expected": expected, "actual": actual}).to_string(),
            ),
            (OutputFormat::Json, SessionEvent::Disconnect) => {
                Some(json!({"event": "disconnect"}).to_string())
            }
            (OutputFormat::Json, SessionEvent::Error(e)) => {
                Some(json!({"event": "error", "message": e.to_string()}).to_string())
            }

            // Quiet mode prints each new version of the document
            (OutputFormat::Quiet, SessionEvent::SetData { current, .. })
            | (OutputFormat::Quiet, SessionEvent::UpdateData { current, .. }) => {
                Some(current.to_string())
            }

            _ => None,
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!("{}", json!({"status": "success", "message": message}));
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easydb_core::SyncError;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_json_events_are_single_lines() {
        let output = Output::new(OutputFormat::Json);
        let updates = serde_json::from_value(json!([
            {"op": "add", "path": "/a", "value": 1}
        ]))
        .unwrap();
        let event = SessionEvent::UpdateData {
            previous: json!({}),
            current: json!({"a": 1}),
            updates,
        };

        let line = output.format_event(&event).unwrap();
        assert!(!line.contains('\n'));
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["event"], json!("update"));
        assert_eq!(parsed["updates"][0]["path"], json!("/a"));
        assert_eq!(parsed["data"], json!({"a": 1}));
    }

    #[test]
    fn test_human_update_lists_ops() {
        let output = Output::new(OutputFormat::Human);
        let updates = serde_json::from_value(json!([
            {"op": "add", "path": "/a", "value": 1},
            {"op": "remove", "path": "/b"}
        ]))
        .unwrap();
        let event = SessionEvent::UpdateData {
            previous: json!({"b": 2}),
            current: json!({"a": 1}),
            updates,
        };

        let text = output.format_event(&event).unwrap();
        assert!(text.starts_with("── Updated (2 op(s)) ──"));
        assert!(text.contains("\"/b\""));
    }

    #[test]
    fn test_quiet_prints_only_documents() {
        let output = Output::new(OutputFormat::Quiet);
        let set = SessionEvent::SetData {
            previous: json!({}),
            current: json!({"x": true}),
        };
        assert_eq!(output.format_event(&set).unwrap(), r#"{"x":true}"#);
        assert!(output.format_event(&SessionEvent::Disconnect).is_none());
        assert!(output
            .format_event(&SessionEvent::Error(SyncError::NotInitialized))
            .is_none());
    }

    #[test]
    fn test_events_without_output() {
        let output = Output::new(OutputFormat::Human);
        assert!(output.format_event(&SessionEvent::Save).is_none());
        assert!(output.format_event(&SessionEvent::Init).is_none());
    }
}
