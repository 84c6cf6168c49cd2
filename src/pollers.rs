//! Ingestion pollers: assigned-issue discovery and PR review observation.
//!
//! Both pollers run an immediate first tick and then a periodic interval,
//! exiting within one tick of cancellation. Transport errors are logged and
//! swallowed; the next tick retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::actions::{self, ActionCtx};
use crate::clients::{IssueQuery, Review};
use crate::dispatcher::Dispatcher;
use crate::errors::StoreError;
use crate::store::{
    EVENT_CHANGES_REQUESTED, EVENT_INGESTED, EVENT_PR_MERGED, Issue, IssueFilter, IssueState,
    Store,
};

/// Review authors with this suffix are automation; their reviews advance
/// the cursor but never trigger the feedback transition.
pub const BOT_AUTHOR_SUFFIX: &str = "[bot]";

pub fn is_bot_author(name: &str) -> bool {
    name.ends_with(BOT_AUTHOR_SUFFIX)
}

/// Compare opaque review IDs: numerically when both parse, else
/// lexicographically. Anything beats an empty cursor.
fn review_id_gt(a: &str, b: &str) -> bool {
    if b.is_empty() {
        return true;
    }
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x > y,
        _ => a > b,
    }
}

// ── Issue poller ──────────────────────────────────────────────────────

/// Discovers newly-assigned tracker issues and inserts them as `queued`.
pub struct IssuePoller {
    store: Arc<Store>,
    ctxs: HashMap<i64, Arc<ActionCtx>>,
    interval: Duration,
    cancel: CancellationToken,
}

impl IssuePoller {
    pub fn new(
        store: Arc<Store>,
        ctxs: HashMap<i64, Arc<ActionCtx>>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            ctxs,
            interval,
            cancel,
        }
    }

    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = self.cancel.cancelled() => {
                    info!("issue poller stopping");
                    return;
                }
            }
        }
    }

    pub async fn tick(&self) {
        for ctx in self.ctxs.values() {
            match ingest_assigned_issues(&self.store, ctx).await {
                Ok(0) => {}
                Ok(n) => info!(project = %ctx.project.name, count = n, "ingested issues"),
                Err(err) => {
                    warn!(project = %ctx.project.name, error = %err, "issue poll failed");
                }
            }
        }
    }
}

/// One project's ingestion pass. Returns how many issues were inserted.
pub async fn ingest_assigned_issues(store: &Store, ctx: &ActionCtx) -> anyhow::Result<usize> {
    let project = &ctx.project;
    let query = IssueQuery {
        team_id: project.linear_team_id.clone(),
        assignee_id: project.linear_assignee_id.clone(),
        project_id: project.linear_project_id.clone(),
        label: project.linear_label.clone(),
    };
    let assigned = ctx
        .retrier
        .run(&ctx.cancel, || ctx.issue_fetcher.list_assigned_issues(&query))
        .await?;

    let mut ingested = 0;
    for tracker_issue in assigned {
        if store
            .get_issue_by_tracker_id_and_project(&tracker_issue.id, project.id)?
            .is_some()
        {
            continue;
        }
        let issue = store.create_issue(
            project.id,
            &tracker_issue.id,
            &tracker_issue.identifier,
            &tracker_issue.title,
            &tracker_issue.description,
        )?;
        store.log_activity(
            issue.id,
            EVENT_INGESTED,
            "",
            "queued",
            &format!("{}: {}", issue.identifier, issue.title),
        )?;
        info!(issue_id = issue.id, identifier = %issue.identifier, "issue ingested");
        ingested += 1;
    }
    Ok(ingested)
}

// ── Review poller ─────────────────────────────────────────────────────

/// Watches open PRs for merges and fresh human review feedback.
pub struct ReviewPoller {
    store: Arc<Store>,
    dispatcher: Arc<Dispatcher>,
    ctxs: HashMap<i64, Arc<ActionCtx>>,
    interval: Duration,
    cancel: CancellationToken,
}

impl ReviewPoller {
    pub fn new(
        store: Arc<Store>,
        dispatcher: Arc<Dispatcher>,
        ctxs: HashMap<i64, Arc<ActionCtx>>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            dispatcher,
            ctxs,
            interval,
            cancel,
        }
    }

    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = self.cancel.cancelled() => {
                    info!("review poller stopping");
                    return;
                }
            }
        }
    }

    pub async fn tick(&self) {
        for ctx in self.ctxs.values() {
            if let Err(err) = poll_reviews_for_project(&self.store, &self.dispatcher, ctx).await {
                warn!(project = %ctx.project.name, error = %err, "review poll failed");
            }
        }
    }
}

pub async fn poll_reviews_for_project(
    store: &Arc<Store>,
    dispatcher: &Dispatcher,
    ctx: &Arc<ActionCtx>,
) -> Result<(), StoreError> {
    let issues = store.list_issues(&IssueFilter {
        project_id: Some(ctx.project.id),
        states: Some(vec![IssueState::InReview, IssueState::AddressingFeedback]),
        ..Default::default()
    })?;
    for issue in issues.into_iter().filter(|i| i.pr_number > 0) {
        if let Err(err) = poll_issue_reviews(store, dispatcher, ctx, &issue).await {
            warn!(issue_id = issue.id, error = %err, "review check failed");
        }
    }
    Ok(())
}

async fn poll_issue_reviews(
    store: &Arc<Store>,
    dispatcher: &Dispatcher,
    ctx: &Arc<ActionCtx>,
    issue: &Issue,
) -> anyhow::Result<()> {
    // Merge wins over concurrent review feedback: a merged PR completes the
    // issue even if a change-requesting review arrived alongside.
    let merged = ctx
        .retrier
        .run(&ctx.cancel, || ctx.merge.is_merged(issue.pr_number))
        .await?;
    if merged {
        complete_merged_issue(store, issue)?;
        return Ok(());
    }

    let reviews = ctx
        .retrier
        .run(&ctx.cancel, || ctx.reviews.list_reviews(issue.pr_number))
        .await?;
    if reviews.is_empty() {
        return Ok(());
    }

    let max_id = reviews
        .iter()
        .map(|r| r.id.as_str())
        .fold(issue.last_review_id.clone(), |acc, id| {
            if review_id_gt(id, &acc) {
                id.to_string()
            } else {
                acc
            }
        });
    let actionable: Vec<Review> = reviews
        .iter()
        .filter(|r| review_id_gt(&r.id, &issue.last_review_id))
        .filter(|r| !is_bot_author(&r.author_name) && r.verdict.requests_changes())
        .cloned()
        .collect();

    if issue.state == IssueState::InReview && !actionable.is_empty() {
        let mut authors: Vec<&str> = actionable.iter().map(|r| r.author_name.as_str()).collect();
        authors.dedup();
        let detail = format!("changes requested by {}", authors.join(", "));

        let worker_ctx = ctx.clone();
        let worker_issue = issue.clone();
        let worker_reviews = actionable.clone();
        match dispatcher.dispatch_action(issue, async move {
            actions::feedback::address_feedback(&worker_ctx, &worker_issue, &worker_reviews).await
        }) {
            Ok(()) => {
                store.transition_state(
                    issue.id,
                    IssueState::InReview,
                    IssueState::AddressingFeedback,
                    &detail,
                )?;
                store.log_activity(issue.id, EVENT_CHANGES_REQUESTED, "", "", &detail)?;
                store.set_last_review_id(issue.id, &max_id)?;
            }
            Err(err) => {
                // Cursor stays put so the next poll retries the dispatch.
                warn!(issue_id = issue.id, error = %err, "feedback dispatch deferred");
            }
        }
    } else if max_id != issue.last_review_id {
        // Bot reviews and already-handled feedback still advance the cursor.
        store.set_last_review_id(issue.id, &max_id)?;
    }
    Ok(())
}

fn complete_merged_issue(store: &Store, issue: &Issue) -> Result<(), StoreError> {
    if store.transition_state(
        issue.id,
        issue.state,
        IssueState::Completed,
        "pull request merged",
    )? {
        store.log_activity(
            issue.id,
            EVENT_PR_MERGED,
            "",
            "",
            &format!("PR #{} merged", issue.pr_number),
        )?;
        info!(issue_id = issue.id, pr = issue.pr_number, "issue completed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_ids_compare_numerically_when_possible() {
        assert!(review_id_gt("10", "9"));
        assert!(!review_id_gt("9", "10"));
        assert!(!review_id_gt("10", "10"));
        // Lexicographic fallback for opaque ids.
        assert!(review_id_gt("r-b", "r-a"));
        // Anything beats an unset cursor.
        assert!(review_id_gt("1", ""));
        assert!(review_id_gt("r-a", ""));
    }

    #[test]
    fn bot_authors_are_detected_by_suffix() {
        assert!(is_bot_author("linear-sync[bot]"));
        assert!(!is_bot_author("alice"));
        assert!(!is_bot_author("botany"));
    }
}
