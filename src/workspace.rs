//! Per-issue build workspaces.
//!
//! Each issue builds in an isolated git worktree under the project's
//! `.ralph/workspaces/` directory:
//!
//! ```text
//! .ralph/workspaces/<workspace_name>/
//!   tree/           ← git worktree checkout
//!   prd.json        ← PRD authored by the AI
//!   progress.txt    ← build runner progress
//!   run/            ← PID and status files
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Sanitize an issue identifier into a workspace name: lowercase, with
/// anything outside `[a-z0-9._-]` replaced by `-`.
pub fn sanitize_workspace_name(identifier: &str) -> String {
    identifier
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Resolved filesystem layout for one issue workspace.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub tree: PathBuf,
    pub prd_file: PathBuf,
    pub progress_file: PathBuf,
    pub run_dir: PathBuf,
}

impl WorkspacePaths {
    pub fn new(project_local_path: &Path, workspace_name: &str) -> Self {
        let root = project_local_path
            .join(".ralph")
            .join("workspaces")
            .join(workspace_name);
        Self {
            tree: root.join("tree"),
            prd_file: root.join("prd.json"),
            progress_file: root.join("progress.txt"),
            run_dir: root.join("run"),
            root,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root).context("Failed to create workspace directory")?;
        std::fs::create_dir_all(&self.run_dir).context("Failed to create run directory")?;
        Ok(())
    }
}

/// The product requirements document the AI writes before a build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prd {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub stories: Vec<PrdStory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrdStory {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub acceptance: String,
}

impl Prd {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read PRD at {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse PRD at {}", path.display()))
    }
}

// ── Run-state files for external observers ────────────────────────────

pub const PID_FILE: &str = "build.pid";
pub const STATUS_FILE: &str = "status.json";

/// Terminal status of a build, written for TUI-style external observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Cancelled,
    Failed { error: String },
}

pub fn write_pid_file(run_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(run_dir).context("Failed to create run directory")?;
    std::fs::write(run_dir.join(PID_FILE), std::process::id().to_string())
        .context("Failed to write PID file")
}

pub fn remove_pid_file(run_dir: &Path) {
    let _ = std::fs::remove_file(run_dir.join(PID_FILE));
}

pub fn write_status_file(run_dir: &Path, status: &RunStatus) -> Result<()> {
    std::fs::create_dir_all(run_dir).context("Failed to create run directory")?;
    let json = serde_json::to_string_pretty(status).context("Failed to serialize run status")?;
    std::fs::write(run_dir.join(STATUS_FILE), json).context("Failed to write status file")
}
