//! Output formatting for CLI commands.
//!
//! Every command builds a serializable record and a text rendering; the
//! writer picks one depending on `--json`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::{self, Write};
use strata_core::{Id, Stat};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Write `data` as JSON, or the text from `text_fn` otherwise. The closure
    /// only runs in text mode.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Report a fatal error on stderr in the selected format.
    pub fn write_error(&self, error: &anyhow::Error) {
        match self.format {
            OutputFormat::Json => {
                let output = ErrorOutput {
                    success: false,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Records for JSON output
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub error: String,
}

/// Output for `init`.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub repo: String,
    pub algorithm: String,
}

/// Output for `backup`.
#[derive(Debug, Serialize)]
pub struct BackupOutput {
    pub success: bool,
    pub snapshot: Id,
    pub tree: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Id>,
    pub source: String,
    pub stat: Stat,
    /// Files whose content was taken over from the parent snapshot.
    pub reused: usize,
    /// Items skipped because of errors.
    pub errors: usize,
    pub duration_secs: f64,
}

/// Output for `restore`.
#[derive(Debug, Serialize)]
pub struct RestoreOutput {
    pub success: bool,
    pub snapshot: Id,
    pub destination: String,
    pub errors: usize,
}

/// One row of `snapshots`.
#[derive(Debug, Serialize)]
pub struct SnapshotInfo {
    pub id: Id,
    pub short_id: String,
    pub time: DateTime<Utc>,
    pub dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub stat: Stat,
}

/// Output for `snapshots`.
#[derive(Debug, Serialize)]
pub struct SnapshotsOutput {
    pub success: bool,
    pub snapshots: Vec<SnapshotInfo>,
}

/// One entry of `ls`.
#[derive(Debug, Serialize)]
pub struct LsEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

/// Output for `ls`.
#[derive(Debug, Serialize)]
pub struct LsOutput {
    pub success: bool,
    pub snapshot: Id,
    pub entries: Vec<LsEntry>,
}
