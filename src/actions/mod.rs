//! The action library: the effectful half of every state-machine transition.
//!
//! Each action is a function of `(ctx, issue)` that may call the external
//! collaborators and is idempotent at the granularity of its own effects.
//! Actions return `ActionOutcome::Skip` when a re-check shows there is
//! nothing to do (the condition raced a remote change); the engine then
//! leaves the issue in place for the next tick.

pub mod approval;
pub mod build;
pub mod feedback;
pub mod pr;
pub mod refine;

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::clients::{
    BuildRunner, Comment, CommentClient, InvokeOutcome, InvokeRequest, Invoker, IssueFetcher,
    IssueStateClient, MergeChecker, PrClient, ReviewClient,
};
use crate::errors::{ActionError, Cancelled};
use crate::events::EventBus;
use crate::git::{AncestorChecker, BranchFetcher, GitPusher, RebaseRunner, WorktreeGit};
use crate::retry::Retrier;
use crate::store::{EVENT_AI_INVOCATION, Issue, Project, Store};

pub const REFINE_MAX_TURNS: u32 = 25;
pub const PRD_MAX_TURNS: u32 = 15;
pub const PR_DESC_MAX_TURNS: u32 = 8;
pub const FEEDBACK_MAX_TURNS: u32 = 40;

pub const EYES_EMOJI: &str = "👀";

/// Result of a successfully executed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The action took effect; `detail` goes into the `state_change` entry.
    Done { detail: String },
    /// Nothing to do after a re-check; do not transition.
    Skip,
}

impl ActionOutcome {
    pub fn done(detail: impl Into<String>) -> Self {
        Self::Done {
            detail: detail.into(),
        }
    }
}

/// Git author identity configured into worktrees before a build.
#[derive(Debug, Clone)]
pub struct GitAuthor {
    pub name: String,
    pub email: String,
}

/// Everything an action needs for one project: the store, the external
/// collaborators, and the project row itself.
pub struct ActionCtx {
    pub store: Arc<Store>,
    pub project: Project,
    pub bus: EventBus,
    pub retrier: Retrier,
    pub cancel: CancellationToken,

    pub issue_fetcher: Arc<dyn IssueFetcher>,
    pub comments: Arc<dyn CommentClient>,
    pub tracker_state: Arc<dyn IssueStateClient>,
    pub pr: Arc<dyn PrClient>,
    pub reviews: Arc<dyn ReviewClient>,
    pub merge: Arc<dyn MergeChecker>,
    pub invoker: Arc<dyn Invoker>,
    pub builder: Arc<dyn BuildRunner>,

    pub pusher: Arc<dyn GitPusher>,
    pub fetcher: Arc<dyn BranchFetcher>,
    pub ancestry: Arc<dyn AncestorChecker>,
    pub rebaser: Option<Arc<dyn RebaseRunner>>,
    pub worktree: Arc<dyn WorktreeGit>,

    pub knowledge_dir: Option<String>,
    pub copy_files: Vec<String>,
    pub git_author: Option<GitAuthor>,
}

impl ActionCtx {
    pub fn local_path(&self) -> PathBuf {
        PathBuf::from(&self.project.local_path)
    }

    /// Fetch the comment thread with retries, through the given client
    /// (the engine passes its per-tick cached wrapper).
    pub async fn fetch_comments(
        &self,
        comments: &dyn CommentClient,
        issue: &Issue,
    ) -> Result<Vec<Comment>, ActionError> {
        self.retrier
            .run(&self.cancel, || {
                comments.list_comments(&issue.tracker_issue_id)
            })
            .await
            .map_err(external)
    }

    /// Invoke the AI agent, accumulate token counters, and log the call.
    pub async fn invoke_tracked(
        &self,
        issue_id: i64,
        req: InvokeRequest,
    ) -> Result<InvokeOutcome, ActionError> {
        let outcome = self
            .invoker
            .invoke(&self.cancel, req)
            .await
            .map_err(external)?;
        self.store
            .increment_tokens(issue_id, outcome.input_tokens, outcome.output_tokens)?;
        self.store.log_activity(
            issue_id,
            EVENT_AI_INVOCATION,
            "",
            "",
            &format!(
                "{} turns, {} in / {} out tokens",
                outcome.num_turns, outcome.input_tokens, outcome.output_tokens
            ),
        )?;
        Ok(outcome)
    }
}

/// Classify an error from an external collaborator: cancellation is
/// propagated as such, everything else surfaces as an action failure.
pub fn external(err: anyhow::Error) -> ActionError {
    if err.chain().any(|c| c.downcast_ref::<Cancelled>().is_some()) {
        ActionError::Cancelled
    } else {
        ActionError::Other(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_maps_cancellation_marker() {
        let err = external(anyhow::Error::new(Cancelled).context("during invoke"));
        assert!(err.is_cancellation());
        let err = external(anyhow::anyhow!("network down"));
        assert!(!err.is_cancellation());
    }

    #[test]
    fn outcome_done_carries_detail() {
        let outcome = ActionOutcome::done("posted plan");
        assert_eq!(
            outcome,
            ActionOutcome::Done {
                detail: "posted plan".to_string()
            }
        );
    }
}
