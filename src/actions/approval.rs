//! Approval detection: capture the approved plan and move the cursor past
//! the thread tail.

use tracing::warn;

use super::{ActionCtx, ActionOutcome, EYES_EMOJI};
use crate::clients::CommentClient;
use crate::comments::{find_approval, plan_text_before_approval};
use crate::errors::ActionError;
use crate::store::{EVENT_APPROVAL_DETECTED, Issue};

pub async fn record_approval(
    ctx: &ActionCtx,
    comments: &dyn CommentClient,
    issue: &Issue,
) -> Result<ActionOutcome, ActionError> {
    let thread = ctx.fetch_comments(comments, issue).await?;
    let Some(approval) = find_approval(&thread, &issue.last_comment_id) else {
        // The approval seen by the condition is no longer visible.
        return Ok(ActionOutcome::Skip);
    };

    if let Err(err) = comments.react(&approval.id, EYES_EMOJI).await {
        warn!(comment_id = %approval.id, error = %err, "reaction failed, continuing");
    }

    let plan_text = plan_text_before_approval(&thread, &approval.id);
    let thread_tail = thread
        .last()
        .map(|c| c.id.clone())
        .unwrap_or_else(|| approval.id.clone());
    ctx.store
        .record_approval(issue.id, &plan_text, &thread_tail)?;
    ctx.store.log_activity(
        issue.id,
        EVENT_APPROVAL_DETECTED,
        "",
        "",
        &format!(
            "approved by {} ({} chars of plan)",
            approval.author_name,
            plan_text.len()
        ),
    )?;
    Ok(ActionOutcome::done(format!(
        "plan approved by {}",
        approval.author_name
    )))
}
