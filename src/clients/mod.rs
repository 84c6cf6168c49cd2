//! Collaborator contracts for the external world: the issue tracker, the
//! code host, the AI agent, and the build runner. Production implementations
//! live in the `linear`/`github` submodules and in `crate::runner`; tests
//! substitute mocks.

pub mod github;
pub mod linear;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::events::AgentEvent;

// ── Tracker data types ────────────────────────────────────────────────

/// One issue as seen in the external tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerIssue {
    pub id: String,
    pub identifier: String,
    pub title: String,
    pub description: String,
}

/// One tracker comment. IDs are opaque strings; `created_at` is RFC 3339.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub body: String,
    pub author_name: String,
    pub author_is_bot: bool,
    pub parent_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub name: String,
}

/// Search parameters for assigned-issue discovery.
#[derive(Debug, Clone)]
pub struct IssueQuery {
    pub team_id: String,
    pub assignee_id: String,
    pub project_id: Option<String>,
    pub label: Option<String>,
}

// ── Code-host data types ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approved,
    ChangesRequested,
    Commented,
    Other,
}

impl ReviewVerdict {
    pub fn from_str(s: &str) -> Self {
        match s {
            "APPROVED" => Self::Approved,
            "CHANGES_REQUESTED" => Self::ChangesRequested,
            "COMMENTED" => Self::Commented,
            _ => Self::Other,
        }
    }

    /// Verdicts that count as actionable feedback.
    pub fn requests_changes(&self) -> bool {
        matches!(self, Self::ChangesRequested | Self::Commented)
    }
}

#[derive(Debug, Clone)]
pub struct Review {
    pub id: String,
    pub author_name: String,
    pub verdict: ReviewVerdict,
    pub body: String,
    pub submitted_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: i64,
    pub html_url: String,
}

#[derive(Debug, Clone)]
pub struct CreatePullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

// ── Tracker contracts ─────────────────────────────────────────────────

#[async_trait]
pub trait IssueFetcher: Send + Sync {
    async fn list_assigned_issues(&self, query: &IssueQuery) -> Result<Vec<TrackerIssue>>;
}

#[async_trait]
pub trait CommentClient: Send + Sync {
    /// Full comment thread, oldest first, threaded children included.
    async fn list_comments(&self, issue_id: &str) -> Result<Vec<Comment>>;
    async fn post_comment(&self, issue_id: &str, body: &str) -> Result<Comment>;
    async fn post_reply(&self, issue_id: &str, parent_id: &str, body: &str) -> Result<Comment>;
    async fn react(&self, comment_id: &str, emoji: &str) -> Result<()>;
}

#[async_trait]
pub trait IssueStateClient: Send + Sync {
    async fn list_workflow_states(&self, team_id: &str) -> Result<Vec<WorkflowState>>;
    async fn update_issue_state(&self, issue_id: &str, state_id: &str) -> Result<()>;
}

// ── Code-host contracts ───────────────────────────────────────────────

#[async_trait]
pub trait PrClient: Send + Sync {
    async fn create_pull_request(&self, req: &CreatePullRequest) -> Result<PullRequest>;
    /// Look up an already-open PR for the head/base pair (idempotent create).
    async fn find_open_pull_request(&self, head: &str, base: &str)
    -> Result<Option<PullRequest>>;
    async fn edit_pull_request(&self, number: i64, title: &str, body: &str) -> Result<()>;
}

#[async_trait]
pub trait ReviewClient: Send + Sync {
    async fn list_reviews(&self, pr_number: i64) -> Result<Vec<Review>>;
}

#[async_trait]
pub trait MergeChecker: Send + Sync {
    async fn is_merged(&self, pr_number: i64) -> Result<bool>;
}

// ── AI agent contracts ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub prompt: String,
    pub max_turns: u32,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct InvokeOutcome {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub num_turns: u32,
    pub duration_ms: u64,
}

/// One bounded agentic invocation of the external AI agent.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, cancel: &CancellationToken, req: InvokeRequest)
    -> Result<InvokeOutcome>;
}

/// Streaming handler given to the build runner; fan-out to the activity log
/// and an optional live callback happens behind it.
pub type EventSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub workspace_dir: PathBuf,
    pub tree_dir: PathBuf,
    pub knowledge_dir: Option<PathBuf>,
    pub max_iterations: u32,
}

/// The external AI-driven build loop. Must honor cancellation and unwind.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        req: BuildRequest,
        events: EventSink,
    ) -> Result<()>;
}

// ── Per-tick comment cache ────────────────────────────────────────────

/// Wraps a `CommentClient` so the same comment list is fetched at most once
/// per engine tick, keyed by the external issue ID. Posting through the
/// wrapper invalidates that issue's entry. Built fresh each tick.
pub struct CachedComments {
    inner: Arc<dyn CommentClient>,
    cache: tokio::sync::Mutex<HashMap<String, Arc<Vec<Comment>>>>,
}

impl CachedComments {
    pub fn new(inner: Arc<dyn CommentClient>) -> Self {
        Self {
            inner,
            cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CommentClient for CachedComments {
    async fn list_comments(&self, issue_id: &str) -> Result<Vec<Comment>> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(issue_id) {
            return Ok(cached.as_ref().clone());
        }
        let comments = self.inner.list_comments(issue_id).await?;
        cache.insert(issue_id.to_string(), Arc::new(comments.clone()));
        Ok(comments)
    }

    async fn post_comment(&self, issue_id: &str, body: &str) -> Result<Comment> {
        let posted = self.inner.post_comment(issue_id, body).await?;
        self.cache.lock().await.remove(issue_id);
        Ok(posted)
    }

    async fn post_reply(&self, issue_id: &str, parent_id: &str, body: &str) -> Result<Comment> {
        let posted = self.inner.post_reply(issue_id, parent_id, body).await?;
        self.cache.lock().await.remove(issue_id);
        Ok(posted)
    }

    async fn react(&self, comment_id: &str, emoji: &str) -> Result<()> {
        self.inner.react(comment_id, emoji).await
    }
}
