//! YAML configuration: per-project files under `<config_dir>/projects/`,
//! the shared credentials file, and the optional per-repo ralph config.
//!
//! Project loading is lenient per file: an invalid file is a warning, not
//! a startup failure. Credential fields resolve with the precedence
//! environment variable > named profile > default profile.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::errors::StoreError;
use crate::store::{Project, Store};

pub const DEFAULT_MAX_ITERATIONS: i64 = 20;
pub const DEFAULT_BRANCH_PREFIX: &str = "autoralph/";
pub const DEFAULT_RALPH_CONFIG_PATH: &str = ".ralph/ralph.yaml";
pub const DEFAULT_BASE_BRANCH: &str = "main";

pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("autoralph"))
        .unwrap_or_else(|| PathBuf::from(".autoralph"))
}

pub fn db_path(config_dir: &Path) -> PathBuf {
    config_dir.join("autoralph.db")
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

// ── Project files ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectFile {
    pub name: String,
    pub local_path: String,
    pub github: GithubSection,
    pub linear: LinearSection,
    #[serde(default)]
    pub credentials_profile: Option<String>,
    #[serde(default = "default_ralph_config_path")]
    pub ralph_config_path: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: i64,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubSection {
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinearSection {
    pub team_id: String,
    pub assignee_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

fn default_ralph_config_path() -> String {
    DEFAULT_RALPH_CONFIG_PATH.to_string()
}
fn default_max_iterations() -> i64 {
    DEFAULT_MAX_ITERATIONS
}
fn default_branch_prefix() -> String {
    DEFAULT_BRANCH_PREFIX.to_string()
}
fn default_base_branch() -> String {
    DEFAULT_BASE_BRANCH.to_string()
}

impl ProjectFile {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("project name is empty");
        }
        let path = expand_tilde(&self.local_path);
        if !path.is_dir() {
            anyhow::bail!("local_path {} does not exist", path.display());
        }
        Ok(())
    }

    pub fn expanded_local_path(&self) -> PathBuf {
        expand_tilde(&self.local_path)
    }
}

/// Load every `projects/*.yaml` under the config dir. Invalid files are
/// skipped with a warning.
pub fn load_project_files(config_dir: &Path) -> Result<Vec<ProjectFile>> {
    let dir = config_dir.join("projects");
    let mut projects = Vec::new();
    if !dir.is_dir() {
        return Ok(projects);
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    for path in paths {
        match load_project_file(&path) {
            Ok(project) => projects.push(project),
            Err(err) => {
                warn!(file = %path.display(), error = %err, "skipping invalid project file");
            }
        }
    }
    Ok(projects)
}

fn load_project_file(path: &Path) -> Result<ProjectFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let project: ProjectFile =
        serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))?;
    project.validate()?;
    Ok(project)
}

/// Sync loaded project files into the store by name: create absent ones,
/// update the rest in place.
pub fn sync_projects(store: &Store, files: &[ProjectFile]) -> Result<Vec<Project>, StoreError> {
    let mut synced = Vec::new();
    for file in files {
        let local_path = file.expanded_local_path().display().to_string();
        match store.get_project_by_name(&file.name) {
            Ok(mut existing) => {
                existing.local_path = local_path;
                existing.github_owner = file.github.owner.clone();
                existing.github_repo = file.github.repo.clone();
                existing.linear_team_id = file.linear.team_id.clone();
                existing.linear_assignee_id = file.linear.assignee_id.clone();
                existing.linear_project_id = file.linear.project_id.clone();
                existing.linear_label = file.linear.label.clone();
                existing.default_base_branch = file.base_branch.clone();
                existing.branch_prefix = file.branch_prefix.clone();
                existing.max_iterations = file.max_iterations;
                existing.ralph_config_path = file.ralph_config_path.clone();
                synced.push(store.update_project(&existing)?);
            }
            Err(StoreError::NotFound { .. }) => {
                synced.push(store.create_project(&Project {
                    id: 0,
                    name: file.name.clone(),
                    local_path,
                    github_owner: file.github.owner.clone(),
                    github_repo: file.github.repo.clone(),
                    linear_team_id: file.linear.team_id.clone(),
                    linear_assignee_id: file.linear.assignee_id.clone(),
                    linear_project_id: file.linear.project_id.clone(),
                    linear_label: file.linear.label.clone(),
                    default_base_branch: file.base_branch.clone(),
                    branch_prefix: file.branch_prefix.clone(),
                    max_iterations: file.max_iterations,
                    ralph_config_path: file.ralph_config_path.clone(),
                    created_at: String::new(),
                    updated_at: String::new(),
                })?);
            }
            Err(other) => return Err(other),
        }
    }
    Ok(synced)
}

// ── Per-repo ralph config ─────────────────────────────────────────────

/// Optional repo-local settings (`.ralph/ralph.yaml` by default).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RalphConfig {
    #[serde(default)]
    pub knowledge_dir: Option<String>,
    #[serde(default)]
    pub copy_files: Vec<String>,
}

impl RalphConfig {
    /// Lenient load: a missing or invalid file yields the defaults.
    pub fn load(project_local_path: &Path, relative_path: &str) -> Self {
        let path = project_local_path.join(relative_path);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        match serde_yaml::from_str(&raw) {
            Ok(config) => config,
            Err(err) => {
                warn!(file = %path.display(), error = %err, "invalid ralph config, using defaults");
                Self::default()
            }
        }
    }
}

// ── Credentials ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsFile {
    #[serde(default)]
    pub default_profile: Option<String>,
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub linear_api_key: Option<String>,
    #[serde(default)]
    pub github_token: Option<String>,
    #[serde(default)]
    pub github_app_client_id: Option<String>,
    #[serde(default)]
    pub github_app_installation_id: Option<String>,
    #[serde(default)]
    pub github_app_private_key_path: Option<String>,
    #[serde(default)]
    pub github_user_id: Option<String>,
    #[serde(default)]
    pub github_username: Option<String>,
    #[serde(default)]
    pub git_author_name: Option<String>,
    #[serde(default)]
    pub git_author_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GithubAuth {
    Token(String),
    App {
        client_id: String,
        installation_id: String,
        private_key_path: String,
    },
}

#[derive(Debug, Clone)]
pub struct ResolvedCredentials {
    pub linear_api_key: String,
    pub github: GithubAuth,
    pub github_username: Option<String>,
    pub git_author: Option<(String, String)>,
}

/// Load `<config_dir>/credentials.yaml`; a missing file is an empty set.
pub fn load_credentials(config_dir: &Path) -> Result<CredentialsFile> {
    let path = config_dir.join("credentials.yaml");
    if !path.exists() {
        return Ok(CredentialsFile::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Resolve credentials for one project's profile with the precedence
/// environment variable > named profile > default profile.
pub fn resolve_credentials(
    creds: &CredentialsFile,
    profile_name: Option<&str>,
) -> Result<ResolvedCredentials> {
    resolve_credentials_with(creds, profile_name, |key| std::env::var(key).ok())
}

fn resolve_credentials_with(
    creds: &CredentialsFile,
    profile_name: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedCredentials> {
    let named = match profile_name {
        Some(name) => Some(
            creds
                .profiles
                .get(name)
                .with_context(|| format!("credentials profile '{}' not found", name))?,
        ),
        None => None,
    };
    let default = creds
        .default_profile
        .as_deref()
        .and_then(|name| creds.profiles.get(name));

    let field = |get: fn(&Profile) -> Option<&String>| -> Option<String> {
        named
            .and_then(|p| get(p))
            .or_else(|| default.and_then(|p| get(p)))
            .cloned()
    };

    let linear_api_key = env("LINEAR_API_KEY")
        .or_else(|| field(|p| p.linear_api_key.as_ref()))
        .context("no Linear API key: set LINEAR_API_KEY or add linear_api_key to a profile")?;

    // An environment token overrides every GitHub-App field.
    let github = if let Some(token) = env("GITHUB_TOKEN") {
        GithubAuth::Token(token)
    } else if let Some(token) = field(|p| p.github_token.as_ref()) {
        GithubAuth::Token(token)
    } else {
        let client_id = field(|p| p.github_app_client_id.as_ref());
        let installation_id = field(|p| p.github_app_installation_id.as_ref());
        let private_key_path = field(|p| p.github_app_private_key_path.as_ref());
        match (client_id, installation_id, private_key_path) {
            (Some(client_id), Some(installation_id), Some(private_key_path)) => GithubAuth::App {
                client_id,
                installation_id,
                private_key_path,
            },
            (None, None, None) => anyhow::bail!(
                "no GitHub credentials: set GITHUB_TOKEN or configure a token or app profile"
            ),
            _ => anyhow::bail!(
                "incomplete GitHub App credentials: client_id, installation_id, and \
                 private_key_path must all be set"
            ),
        }
    };

    let git_author = match (
        env("AUTORALPH_GIT_AUTHOR_NAME")
            .or_else(|| field(|p| p.git_author_name.as_ref())),
        env("AUTORALPH_GIT_AUTHOR_EMAIL")
            .or_else(|| field(|p| p.git_author_email.as_ref())),
    ) {
        (Some(name), Some(email)) => Some((name, email)),
        _ => None,
    };

    Ok(ResolvedCredentials {
        linear_api_key,
        github,
        github_username: field(|p| p.github_username.as_ref()),
        git_author,
    })
}
