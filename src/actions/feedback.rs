//! Addressing human PR review feedback inside the issue's worktree.

use super::{ActionCtx, FEEDBACK_MAX_TURNS, external};
use crate::clients::{InvokeRequest, Review};
use crate::errors::ActionError;
use crate::prompts;
use crate::store::Issue;
use crate::workspace::WorkspacePaths;

/// Dispatched worker body: have the agent apply the reviewers' requests in
/// the worktree, then push the branch. The engine returns the issue to
/// `in_review` once this worker has exited.
pub async fn address_feedback(
    ctx: &ActionCtx,
    issue: &Issue,
    reviews: &[Review],
) -> Result<(), ActionError> {
    let pairs: Vec<(String, String)> = reviews
        .iter()
        .filter(|r| !r.body.trim().is_empty())
        .map(|r| (r.author_name.clone(), r.body.clone()))
        .collect();
    if pairs.is_empty() {
        return Ok(());
    }

    let paths = WorkspacePaths::new(&ctx.local_path(), &issue.workspace_name);
    let prompt = prompts::feedback_prompt(&issue.identifier, &pairs);
    ctx.invoke_tracked(
        issue.id,
        InvokeRequest {
            prompt,
            max_turns: FEEDBACK_MAX_TURNS,
            working_dir: Some(paths.tree.clone()),
        },
    )
    .await?;
    ctx.pusher
        .push(&paths.tree, &issue.branch_name, false)
        .await
        .map_err(external)?;
    Ok(())
}
