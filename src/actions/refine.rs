//! Refinement actions: the initial plan post and the comment-driven
//! iteration loop.

use tracing::warn;

use super::{ActionCtx, ActionOutcome, EYES_EMOJI, REFINE_MAX_TURNS, external};
use crate::clients::{Comment, CommentClient, InvokeRequest};
use crate::comments::{
    APPROVAL_HINT, comments_after, split_type_marker, wants_approval_hint,
};
use crate::errors::ActionError;
use crate::prompts;
use crate::store::{
    EVENT_AI_REFINEMENT, EVENT_PLAN_ITERATION, EVENT_REPLY_RECEIVED, EVENT_WARNING, Issue,
};

/// Initial refinement: read the whole thread, ask the agent for a plan (or
/// clarifying questions), and post it as a top-level comment.
pub async fn refine(
    ctx: &ActionCtx,
    comments: &dyn CommentClient,
    issue: &Issue,
) -> Result<ActionOutcome, ActionError> {
    // Keep the local base branch fresh for context. Failure is not fatal.
    if let Err(err) = ctx
        .worktree
        .pull_ff_only(&ctx.local_path(), &ctx.project.default_base_branch)
        .await
    {
        warn!(issue_id = issue.id, error = %err, "fast-forward pull failed, continuing");
        ctx.store.log_activity(
            issue.id,
            EVENT_WARNING,
            "",
            "",
            &format!("fast-forward pull failed: {err:#}"),
        )?;
    }

    let thread = ctx.fetch_comments(comments, issue).await?;
    let prompt = prompts::refine_prompt(
        &issue.title,
        &issue.description,
        &thread,
        ctx.knowledge_dir.as_deref(),
    );
    let outcome = ctx
        .invoke_tracked(
            issue.id,
            InvokeRequest {
                prompt,
                max_turns: REFINE_MAX_TURNS,
                working_dir: Some(ctx.local_path()),
            },
        )
        .await?;

    let body = finalize_response(&outcome.text);
    let posted = comments
        .post_comment(&issue.tracker_issue_id, &body)
        .await
        .map_err(external)?;
    ctx.store.set_last_comment_id(issue.id, &posted.id)?;
    ctx.store.log_activity(
        issue.id,
        EVENT_AI_REFINEMENT,
        "",
        "",
        &format!("posted refinement ({} chars)", body.len()),
    )?;
    Ok(ActionOutcome::done("posted initial refinement"))
}

/// Iteration: react to the new human comments, answer them incrementally,
/// and advance the cursor to the posted reply.
pub async fn iterate(
    ctx: &ActionCtx,
    comments: &dyn CommentClient,
    issue: &Issue,
) -> Result<ActionOutcome, ActionError> {
    let thread = ctx.fetch_comments(comments, issue).await?;
    let new: Vec<Comment> = comments_after(&thread, &issue.last_comment_id).to_vec();
    if new.is_empty() {
        return Ok(ActionOutcome::Skip);
    }

    ctx.store.log_activity(
        issue.id,
        EVENT_REPLY_RECEIVED,
        "",
        "",
        &format!("{} new comment(s)", new.len()),
    )?;
    for comment in new.iter().filter(|c| !c.author_is_bot) {
        if let Err(err) = comments.react(&comment.id, EYES_EMOJI).await {
            warn!(comment_id = %comment.id, error = %err, "reaction failed, continuing");
        }
    }

    // First refinement with no cursor gets the full thread and description;
    // afterwards only the new replies plus a short context prefix.
    let prompt = if issue.last_comment_id.is_empty() {
        prompts::refine_prompt(
            &issue.title,
            &issue.description,
            &thread,
            ctx.knowledge_dir.as_deref(),
        )
    } else {
        prompts::iteration_prompt(&issue.title, &new)
    };
    let outcome = ctx
        .invoke_tracked(
            issue.id,
            InvokeRequest {
                prompt,
                max_turns: REFINE_MAX_TURNS,
                working_dir: Some(ctx.local_path()),
            },
        )
        .await?;

    let body = finalize_response(&outcome.text);
    let threaded_parent = new.iter().find_map(|c| c.parent_id.clone());
    let posted = match threaded_parent {
        Some(parent_id) => comments
            .post_reply(&issue.tracker_issue_id, &parent_id, &body)
            .await
            .map_err(external)?,
        None => comments
            .post_comment(&issue.tracker_issue_id, &body)
            .await
            .map_err(external)?,
    };
    ctx.store.set_last_comment_id(issue.id, &posted.id)?;
    ctx.store.log_activity(
        issue.id,
        EVENT_PLAN_ITERATION,
        "",
        "",
        &format!("replied to {} comment(s)", new.len()),
    )?;
    Ok(ActionOutcome::done(format!(
        "iterated on {} new comment(s)",
        new.len()
    )))
}

/// Strip the type marker and append the approval hint for plans and
/// unmarked responses.
fn finalize_response(text: &str) -> String {
    let (kind, body) = split_type_marker(text);
    if wants_approval_hint(kind) {
        format!("{}{}", body, APPROVAL_HINT)
    } else {
        body
    }
}
