//! The state machine engine.
//!
//! On every tick the engine lists issues in engine-owned states and
//! evaluates each state's transitions in order: the first condition that
//! holds selects the transition, its action runs, and on success the state
//! advances under a compare-and-set re-read guard. At most one transition
//! fires per issue per tick. Condition errors are swallowed as `false`;
//! action errors move the issue to `failed` unless it has already reached a
//! sticky terminal state; cancellation never fails an issue.

mod transitions;

pub use transitions::{ActionKind, Condition, Transition, transitions_for};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actions::{self, ActionCtx, ActionOutcome};
use crate::clients::{CachedComments, CommentClient};
use crate::comments::{find_approval, has_new_without_approval};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::errors::{ActionError, StoreError};
use crate::store::{EVENT_ACTION_FAILED, FailOutcome, Issue, IssueFilter, IssueState, Store};

/// States whose transitions the engine evaluates. `building` is owned by
/// the dispatcher, `in_review`/`addressing_feedback` merge- and
/// review-observation by the review poller.
pub const ENGINE_STATES: &[IssueState] = &[
    IssueState::Queued,
    IssueState::Refining,
    IssueState::Approved,
    IssueState::InReview,
    IssueState::AddressingFeedback,
];

pub struct Engine {
    store: Arc<Store>,
    dispatcher: Arc<Dispatcher>,
    ctxs: HashMap<i64, Arc<ActionCtx>>,
    tick_interval: Duration,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(
        store: Arc<Store>,
        dispatcher: Arc<Dispatcher>,
        ctxs: HashMap<i64, Arc<ActionCtx>>,
        tick_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            dispatcher,
            ctxs,
            tick_interval,
            cancel,
        }
    }

    /// Tick until cancelled. The first tick fires immediately.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "engine tick failed");
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("engine stopping");
                    return;
                }
            }
        }
    }

    /// One evaluation pass over every issue the engine owns.
    pub async fn tick(&self) -> Result<(), StoreError> {
        // One comment cache per project, discarded at tick end, so each
        // issue's thread is fetched at most once per tick.
        let caches: HashMap<i64, CachedComments> = self
            .ctxs
            .iter()
            .map(|(id, ctx)| (*id, CachedComments::new(ctx.comments.clone())))
            .collect();

        // Building issues whose worker died (crash, skipped recovery) are
        // re-dispatched opportunistically.
        let building = self.store.list_issues(&IssueFilter {
            state: Some(IssueState::Building),
            ..Default::default()
        })?;
        for issue in &building {
            if !self.dispatcher.is_running(issue.id) {
                match self.dispatcher.dispatch(issue) {
                    Ok(()) => info!(issue_id = issue.id, "re-dispatched orphaned build"),
                    Err(err) => debug!(issue_id = issue.id, error = %err, "build re-dispatch deferred"),
                }
            }
        }

        let issues = self.store.list_issues(&IssueFilter {
            states: Some(ENGINE_STATES.to_vec()),
            ..Default::default()
        })?;
        for issue in issues {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let Some(ctx) = self.ctxs.get(&issue.project_id) else {
                continue;
            };
            let Some(cache) = caches.get(&issue.project_id) else {
                continue;
            };
            self.evaluate_issue(ctx, cache, &issue).await;
        }
        Ok(())
    }

    async fn evaluate_issue(&self, ctx: &ActionCtx, cache: &CachedComments, issue: &Issue) {
        for transition in transitions_for(issue.state) {
            let fires = match self
                .eval_condition(ctx, cache, issue, transition.condition)
                .await
            {
                Ok(fires) => fires,
                Err(err) => {
                    warn!(
                        issue_id = issue.id,
                        condition = ?transition.condition,
                        error = %err,
                        "condition errored; treating as false"
                    );
                    false
                }
            };
            if !fires {
                continue;
            }

            match self.execute(ctx, cache, issue, transition.action).await {
                Ok(ActionOutcome::Done { detail }) => {
                    match self.store.transition_state(
                        issue.id,
                        transition.from,
                        transition.to,
                        &detail,
                    ) {
                        Ok(true) => {
                            info!(
                                issue_id = issue.id,
                                identifier = %issue.identifier,
                                from = transition.from.as_str(),
                                to = transition.to.as_str(),
                                "transition applied"
                            );
                        }
                        Ok(false) => {
                            info!(
                                issue_id = issue.id,
                                "state changed concurrently; dropping transition"
                            );
                        }
                        Err(err) => {
                            error!(issue_id = issue.id, error = %err, "state write failed");
                        }
                    }
                }
                Ok(ActionOutcome::Skip) => {}
                Err(err) if err.is_cancellation() => {
                    debug!(issue_id = issue.id, "action cancelled");
                }
                Err(err) => {
                    warn!(issue_id = issue.id, error = %err, "action failed");
                    match self
                        .store
                        .fail_issue(issue.id, EVENT_ACTION_FAILED, &err.to_string())
                    {
                        Ok(FailOutcome::Failed) => {}
                        Ok(FailOutcome::SkippedTerminal(state)) => {
                            info!(
                                issue_id = issue.id,
                                state = state.as_str(),
                                "failure after terminal state; not rewritten"
                            );
                        }
                        Err(store_err) => {
                            error!(issue_id = issue.id, error = %store_err, "failure write failed");
                        }
                    }
                }
            }
            // Only one transition fires per issue per tick.
            break;
        }
    }

    /// Conditions are side-effect-free apart from cached reads; errors are
    /// reported to the caller, which treats them as `false`.
    async fn eval_condition(
        &self,
        ctx: &ActionCtx,
        cache: &CachedComments,
        issue: &Issue,
        condition: Condition,
    ) -> anyhow::Result<bool> {
        Ok(match condition {
            Condition::Always => true,
            Condition::ApprovalPosted => {
                let thread = cache.list_comments(&issue.tracker_issue_id).await?;
                find_approval(&thread, &issue.last_comment_id).is_some()
            }
            Condition::NewCommentsWithoutApproval => {
                let thread = cache.list_comments(&issue.tracker_issue_id).await?;
                has_new_without_approval(&thread, &issue.last_comment_id)
            }
            Condition::RebaseNeeded => actions::pr::needs_rebase(ctx, issue).await?,
            Condition::FeedbackWorkerDone => !self.dispatcher.is_running(issue.id),
        })
    }

    async fn execute(
        &self,
        ctx: &ActionCtx,
        cache: &CachedComments,
        issue: &Issue,
        action: ActionKind,
    ) -> Result<ActionOutcome, ActionError> {
        match action {
            ActionKind::Refine => actions::refine::refine(ctx, cache, issue).await,
            ActionKind::Iterate => actions::refine::iterate(ctx, cache, issue).await,
            ActionKind::RecordApproval => {
                actions::approval::record_approval(ctx, cache, issue).await
            }
            ActionKind::StartBuild => {
                let outcome = actions::build::setup_build(ctx, issue).await?;
                if outcome == ActionOutcome::Skip {
                    return Ok(ActionOutcome::Skip);
                }
                // Setup stored the workspace fields; dispatch the fresh row.
                let fresh = self.store.get_issue(issue.id)?;
                match self.dispatcher.dispatch(&fresh) {
                    Ok(()) => Ok(outcome),
                    Err(DispatchError::AlreadyRunning(_)) => Ok(ActionOutcome::Skip),
                    Err(DispatchError::Saturated) => {
                        debug!(issue_id = issue.id, "worker pool saturated; retrying next tick");
                        Ok(ActionOutcome::Skip)
                    }
                }
            }
            ActionKind::AutoRebase => actions::pr::auto_rebase(ctx, issue).await,
            ActionKind::None => Ok(ActionOutcome::done("feedback worker finished")),
        }
    }
}
