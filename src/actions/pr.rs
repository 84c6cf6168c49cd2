//! Pull-request creation (push → rebase-on-failure → AI description →
//! idempotent create) and the in-review auto-rebase.

use tracing::warn;

use super::{ActionCtx, ActionOutcome, PR_DESC_MAX_TURNS, external};
use crate::clients::{CreatePullRequest, InvokeRequest};
use crate::errors::ActionError;
use crate::git::RebaseOutcome;
use crate::prompts;
use crate::store::{
    EVENT_PR_CREATED, EVENT_REBASE_FINISH, EVENT_REBASE_START, Issue,
};
use crate::workspace::{Prd, WorkspacePaths};

/// Push the branch and open (or reuse) the pull request for an issue whose
/// build just succeeded. A conflicted rebase surfaces as
/// `ActionError::Conflict`, which the dispatcher maps to `paused`.
pub async fn create_pull_request_flow(
    ctx: &ActionCtx,
    issue_id: i64,
) -> Result<(), ActionError> {
    let issue = ctx.store.get_issue(issue_id)?;
    let base = ctx.project.default_base_branch.clone();
    let paths = WorkspacePaths::new(&ctx.local_path(), &issue.workspace_name);
    let tree = paths.tree.clone();

    if let Err(push_err) = ctx.pusher.push(&tree, &issue.branch_name, false).await {
        let Some(rebaser) = &ctx.rebaser else {
            return Err(external(push_err));
        };
        ctx.store.log_activity(
            issue.id,
            EVENT_REBASE_START,
            "",
            "",
            &format!("push rejected, rebasing onto origin/{base}"),
        )?;
        ctx.fetcher
            .fetch_branch(&tree, &base)
            .await
            .map_err(external)?;
        match rebaser
            .rebase_onto(&tree, &format!("origin/{base}"))
            .await
            .map_err(external)?
        {
            RebaseOutcome::Conflicts(files) => {
                return Err(ActionError::Conflict { files });
            }
            RebaseOutcome::Clean => {
                ctx.store.log_activity(
                    issue.id,
                    EVENT_REBASE_FINISH,
                    "",
                    "",
                    "rebase clean, retrying push",
                )?;
                ctx.pusher
                    .push(&tree, &issue.branch_name, true)
                    .await
                    .map_err(external)?;
            }
        }
    }

    // Reuse an already-open PR for this head/base pair.
    let existing = ctx
        .retrier
        .run(&ctx.cancel, || {
            ctx.pr.find_open_pull_request(&issue.branch_name, &base)
        })
        .await
        .map_err(external)?;

    let pull = match existing {
        Some(pull) => pull,
        None => {
            let stat = ctx
                .worktree
                .diff_stat(&tree, &format!("origin/{base}"))
                .await
                .unwrap_or_default();
            let prd = Prd::load(&paths.prd_file).unwrap_or_default();
            let prompt = prompts::pr_description_prompt(&issue.identifier, &prd, &stat);
            let outcome = ctx
                .invoke_tracked(
                    issue.id,
                    InvokeRequest {
                        prompt,
                        max_turns: PR_DESC_MAX_TURNS,
                        working_dir: Some(tree.clone()),
                    },
                )
                .await?;
            let (title, body) = split_title_body(&outcome.text);
            let req = CreatePullRequest {
                title,
                body,
                head: issue.branch_name.clone(),
                base: base.clone(),
            };
            ctx.retrier
                .run(&ctx.cancel, || ctx.pr.create_pull_request(&req))
                .await
                .map_err(external)?
        }
    };

    ctx.store.set_pr(issue.id, pull.number, &pull.html_url)?;
    match ctx
        .comments
        .post_comment(
            &issue.tracker_issue_id,
            &format!("Opened pull request: {}", pull.html_url),
        )
        .await
    {
        Ok(posted) => ctx.store.set_last_comment_id(issue.id, &posted.id)?,
        Err(err) => warn!(issue_id = issue.id, error = %err, "PR link comment failed"),
    }
    ctx.store.log_activity(
        issue.id,
        EVENT_PR_CREATED,
        "",
        "",
        &format!("PR #{}: {}", pull.number, pull.html_url),
    )?;
    Ok(())
}

/// Condition for the in-review auto-rebase row: true only when the PR
/// exists and `origin/<base>` is no longer an ancestor of the branch HEAD.
/// Any error reads as "no rebase needed".
pub async fn needs_rebase(ctx: &ActionCtx, issue: &Issue) -> anyhow::Result<bool> {
    if issue.pr_number <= 0 || issue.workspace_name.is_empty() {
        return Ok(false);
    }
    let base = &ctx.project.default_base_branch;
    let paths = WorkspacePaths::new(&ctx.local_path(), &issue.workspace_name);
    ctx.fetcher.fetch_branch(&paths.tree, base).await?;
    let up_to_date = ctx
        .ancestry
        .is_ancestor(&paths.tree, &format!("origin/{base}"), "HEAD")
        .await?;
    Ok(!up_to_date)
}

/// Rebase the PR branch onto the freshly fetched base and force-push.
pub async fn auto_rebase(ctx: &ActionCtx, issue: &Issue) -> Result<ActionOutcome, ActionError> {
    let Some(rebaser) = &ctx.rebaser else {
        return Ok(ActionOutcome::Skip);
    };
    let base = ctx.project.default_base_branch.clone();
    let paths = WorkspacePaths::new(&ctx.local_path(), &issue.workspace_name);
    ctx.store.log_activity(
        issue.id,
        EVENT_REBASE_START,
        "",
        "",
        &format!("base moved, rebasing onto origin/{base}"),
    )?;
    ctx.fetcher
        .fetch_branch(&paths.tree, &base)
        .await
        .map_err(external)?;
    match rebaser
        .rebase_onto(&paths.tree, &format!("origin/{base}"))
        .await
        .map_err(external)?
    {
        RebaseOutcome::Conflicts(files) => Err(ActionError::Conflict { files }),
        RebaseOutcome::Clean => {
            ctx.pusher
                .push(&paths.tree, &issue.branch_name, true)
                .await
                .map_err(external)?;
            ctx.store.log_activity(
                issue.id,
                EVENT_REBASE_FINISH,
                "",
                "",
                &format!("rebased onto origin/{base} and force-pushed"),
            )?;
            Ok(ActionOutcome::done(format!("rebased onto origin/{base}")))
        }
    }
}

/// Split an AI response into the PR title (first line) and body (the rest).
pub fn split_title_body(text: &str) -> (String, String) {
    let trimmed = text.trim();
    let mut lines = trimmed.lines();
    let title = lines
        .next()
        .unwrap_or("Automated change")
        .trim()
        .to_string();
    let body = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    let title = if title.is_empty() {
        "Automated change".to_string()
    } else {
        title
    };
    (title, body)
}
