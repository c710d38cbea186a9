//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde_json::{json, Value};

use sealsync_core::Op;

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
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print a JSON value, pretty-printed
    pub fn json(&self, value: &Value) {
        println!("{:#}", value);
    }

    /// Print a list of ops
    pub fn print_ops(&self, ops: &[Op]) {
        match self.format {
            OutputFormat::Human => {
                if ops.is_empty() {
                    println!("No unpushed ops.");
                    return;
                }
                for op in ops {
                    println!(
                        "{} | {} | {:>8} B",
                        short_id(&op.id),
                        op.created_at_utc().format("%Y-%m-%d %H:%M:%S%.3f"),
                        op.size()
                    );
                }
                println!("\n{} op(s)", ops.len());
            }
            OutputFormat::Json => {
                let items: Vec<Value> = ops.iter().map(op_json).collect();
                self.json(&Value::Array(items));
            }
            OutputFormat::Quiet => {
                for op in ops {
                    println!("{}", op.id);
                }
            }
        }
    }

    /// Print document entries
    pub fn print_entries(&self, entries: &[(String, String)]) {
        match self.format {
            OutputFormat::Human => {
                if entries.is_empty() {
                    println!("Document is empty.");
                    return;
                }
                let width = entries.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
                for (key, value) in entries {
                    println!("{:width$}  {}", key, truncate(value, 60), width = width);
                }
            }
            OutputFormat::Json => {
                let map: serde_json::Map<String, Value> = entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                self.json(&Value::Object(map));
            }
            OutputFormat::Quiet => {
                for (key, _) in entries {
                    println!("{}", key);
                }
            }
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

    /// Print a warning to stderr (suppressed in quiet mode)
    pub fn warn(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("⚠ {}", message);
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
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

fn op_json(op: &Op) -> Value {
    json!({
        "id": op.id,
        "created_at": op.created_at_utc().to_rfc3339(),
        "size": op.size(),
        "pushed": op.pushed,
        "version_marker": op.version_marker.to_base64(),
    })
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealsync_core::{DocumentId, VersionMarker};

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééé", 5), "éé...");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_op_json_fields() {
        let op = Op::new(
            DocumentId::new(),
            VersionMarker::new(vec![1, 2, 3]),
            vec![0u8; 42],
            1_700_000_000_000,
        );
        let value = op_json(&op);

        assert_eq!(value["id"], op.id.as_str());
        assert_eq!(value["size"], 42);
        assert_eq!(value["pushed"], false);
        assert_eq!(value["version_marker"], "AQID");
    }
}
