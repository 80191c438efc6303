//! Saved sessions: JSON snapshots and Markdown transcripts.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::core::session::{Message, Role};

pub const FORMAT_VERSION: u32 = 1;

/// One session's history and settings as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
    pub config: SessionConfig,
    pub history: Vec<Message>,
}

impl SessionSnapshot {
    /// Snapshot of `history` without its UI-only entries.
    pub fn new(config: SessionConfig, history: &[Message]) -> Self {
        Self {
            version: FORMAT_VERSION,
            saved_at: Some(Utc::now()),
            config,
            history: history.iter().filter(|m| !m.ui_only).cloned().collect(),
        }
    }
}

/// Writes `snapshot` as pretty JSON, atomically.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn save(path: &Path, snapshot: &SessionSnapshot) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(snapshot).context("Failed to serialize session")?;

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json)
        .with_context(|| format!("Failed to write session to {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Reads a snapshot written by [`save`].
///
/// # Errors
/// Returns an error if the file is missing, malformed or from another
/// format version.
pub fn load(path: &Path) -> Result<SessionSnapshot> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read session file {}", path.display()))?;
    let mut snapshot: SessionSnapshot = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse session file {}", path.display()))?;
    if snapshot.version != FORMAT_VERSION {
        bail!(
            "Unsupported session file version {} in {} (expected {FORMAT_VERSION})",
            snapshot.version,
            path.display()
        );
    }
    snapshot.history.retain(|m| !m.ui_only);
    Ok(snapshot)
}

/// Renders the provider-visible transcript as Markdown.
pub fn export_markdown(history: &[Message]) -> String {
    let mut out = String::new();
    for message in history.iter().filter(|m| !m.ui_only) {
        if !out.is_empty() {
            out.push('\n');
        }
        let heading = match (message.role, message.model.as_deref()) {
            (Role::User, _) => "### User".to_string(),
            (Role::Model, Some(model)) => format!("### Model ({model})"),
            (Role::Model, None) => "### Model".to_string(),
        };
        out.push_str(&heading);
        out.push_str("\n\n");
        out.push_str(message.text.trim_end());
        out.push('\n');
    }
    out
}
