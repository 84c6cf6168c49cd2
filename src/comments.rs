//! Comment-tracking protocol for the refining phase.
//!
//! The change detector operates on `(fetched_list, last_comment_id)` and is
//! safe against the tracker's eventual consistency: a cursor that does not
//! appear in the fetched list means "no new comments", never "everything is
//! new". The approval matcher strips the bot's own approval-hint footer
//! before matching so the bot can never approve itself.

use std::sync::LazyLock;

use regex::Regex;

use crate::clients::Comment;

/// Footer appended to bot plan comments telling the human how to approve.
/// Stripped from candidate text before approval matching.
pub const APPROVAL_HINT: &str =
    "\n\n---\nReply with \"I approve this\" to approve the plan and start the build.";

/// Case-insensitive whole-phrase approval match.
static APPROVAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bI approve this\b").expect("valid approval regex"));

pub const TYPE_MARKER_PLAN: &str = "<!-- type: plan -->";
pub const TYPE_MARKER_QUESTIONS: &str = "<!-- type: questions -->";

/// Internal type marker at the top of an AI response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Plan,
    Questions,
}

/// The comments strictly after `last_comment_id`.
///
/// - empty cursor: every fetched comment is new
/// - cursor found: the suffix after it
/// - cursor not found (consistency lag): nothing is new
pub fn comments_after<'a>(comments: &'a [Comment], last_comment_id: &str) -> &'a [Comment] {
    if last_comment_id.is_empty() {
        return comments;
    }
    match comments.iter().position(|c| c.id == last_comment_id) {
        Some(idx) => &comments[idx + 1..],
        None => &comments[comments.len()..],
    }
}

/// True when `body` contains the approval phrase once the bot's own
/// approval-hint footer has been removed.
pub fn contains_approval(body: &str) -> bool {
    let stripped = body.replace(APPROVAL_HINT, "");
    APPROVAL_RE.is_match(&stripped)
}

/// The first new comment containing the approval phrase, if any.
pub fn find_approval<'a>(comments: &'a [Comment], last_comment_id: &str) -> Option<&'a Comment> {
    comments_after(comments, last_comment_id)
        .iter()
        .find(|c| contains_approval(&c.body))
}

/// True when there are new comments and none of them is an approval.
pub fn has_new_without_approval(comments: &[Comment], last_comment_id: &str) -> bool {
    let new = comments_after(comments, last_comment_id);
    !new.is_empty() && !new.iter().any(|c| contains_approval(&c.body))
}

/// The body of the comment immediately preceding the approval: the approved
/// plan. Empty when the approval is first in the thread or absent.
pub fn plan_text_before_approval(comments: &[Comment], approval_id: &str) -> String {
    match comments.iter().position(|c| c.id == approval_id) {
        Some(idx) if idx > 0 => comments[idx - 1].body.clone(),
        _ => String::new(),
    }
}

/// Split the leading type marker (tolerating leading whitespace/newlines)
/// off an AI response. Returns the detected kind, if any, and the response
/// with the marker removed.
pub fn split_type_marker(text: &str) -> (Option<ResponseKind>, String) {
    let trimmed = text.trim_start();
    for (marker, kind) in [
        (TYPE_MARKER_PLAN, ResponseKind::Plan),
        (TYPE_MARKER_QUESTIONS, ResponseKind::Questions),
    ] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            return (Some(kind), rest.trim_start_matches(['\r', '\n']).to_string());
        }
    }
    (None, text.to_string())
}

/// Whether the approval hint should be appended: plans get it, questions do
/// not, and an unmarked response defaults to getting it.
pub fn wants_approval_hint(kind: Option<ResponseKind>) -> bool {
    !matches!(kind, Some(ResponseKind::Questions))
}
