//! Bounded worker pool for long-running actions.
//!
//! Reservation discipline: acquire the per-issue bit first, then try the
//! semaphore without blocking, rolling the bit back on failure. That order
//! cannot deadlock and keeps the no-duplicate-worker guarantee when the
//! pool is saturated.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::errors::ActionError;
use crate::store::{
    BuildFinish, EVENT_ACTION_FAILED, EVENT_BUILD_FAILED, FailOutcome, Issue, IssueFilter,
    IssueState, Store,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("issue {0} already has an active worker")]
    AlreadyRunning(i64),

    #[error("worker pool is saturated")]
    Saturated,
}

/// The build loop a worker runs for a `building` issue.
#[async_trait]
pub trait BuildAction: Send + Sync {
    async fn run_build(&self, cancel: &CancellationToken, issue: &Issue)
    -> Result<(), ActionError>;
}

/// Invoked after a successful build to push and open the pull request.
#[async_trait]
pub trait PrCreator: Send + Sync {
    async fn create_pr(&self, cancel: &CancellationToken, issue: &Issue)
    -> Result<(), ActionError>;
}

pub struct Dispatcher {
    store: Arc<Store>,
    build: Arc<dyn BuildAction>,
    pr_creator: Arc<dyn PrCreator>,
    semaphore: Arc<Semaphore>,
    active: Arc<Mutex<HashSet<i64>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Removes the issue from the active set when the worker exits, however it
/// exits.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<i64>>>,
    issue_id: i64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().unwrap().remove(&self.issue_id);
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        build: Arc<dyn BuildAction>,
        pr_creator: Arc<dyn PrCreator>,
        max_workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            build,
            pr_creator,
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            active: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Atomically reserve the per-issue slot and a pool permit.
    fn reserve(&self, issue_id: i64) -> Result<OwnedSemaphorePermit, DispatchError> {
        {
            let mut active = self.active.lock().unwrap();
            if !active.insert(issue_id) {
                return Err(DispatchError::AlreadyRunning(issue_id));
            }
        }
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(_) => {
                self.active.lock().unwrap().remove(&issue_id);
                Err(DispatchError::Saturated)
            }
        }
    }

    /// Start the build worker for an issue.
    pub fn dispatch(&self, issue: &Issue) -> Result<(), DispatchError> {
        let permit = self.reserve(issue.id)?;
        let guard = ActiveGuard {
            active: self.active.clone(),
            issue_id: issue.id,
        };
        let store = self.store.clone();
        let build = self.build.clone();
        let pr_creator = self.pr_creator.clone();
        let cancel = self.cancel.child_token();
        let issue = issue.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            run_build_worker(store, build, pr_creator, cancel, issue).await;
        });
        Ok(())
    }

    /// Run an arbitrary long-lived action under the same pool discipline.
    /// On a real failure the issue is moved to `failed`; cancellation leaves
    /// it untouched.
    pub fn dispatch_action<F>(&self, issue: &Issue, action: F) -> Result<(), DispatchError>
    where
        F: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let permit = self.reserve(issue.id)?;
        let guard = ActiveGuard {
            active: self.active.clone(),
            issue_id: issue.id,
        };
        let store = self.store.clone();
        let issue_id = issue.id;
        self.tracker.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            match action.await {
                Ok(()) => {}
                Err(err) if err.is_cancellation() => {
                    info!(issue_id, "action worker cancelled");
                }
                Err(err) => {
                    warn!(issue_id, error = %err, "action worker failed");
                    if let Err(store_err) =
                        store.fail_issue(issue_id, EVENT_ACTION_FAILED, &format!("{err}"))
                    {
                        error!(issue_id, error = %store_err, "failed to record action failure");
                    }
                }
            }
        });
        Ok(())
    }

    pub fn is_running(&self, issue_id: i64) -> bool {
        self.active.lock().unwrap().contains(&issue_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Block until every worker has exited.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Redispatch issues left in `building` by a previous process. Issues
    /// that cannot be dispatched are skipped with a warning; the engine
    /// retries them on its next tick.
    pub fn recover_building(&self) -> Result<usize, crate::errors::StoreError> {
        let stuck = self.store.list_issues(&IssueFilter {
            state: Some(IssueState::Building),
            ..Default::default()
        })?;
        let mut count = 0;
        for issue in &stuck {
            match self.dispatch(issue) {
                Ok(()) => {
                    info!(issue_id = issue.id, identifier = %issue.identifier, "resumed build");
                    count += 1;
                }
                Err(err) => {
                    warn!(issue_id = issue.id, error = %err, "could not resume build; will retry");
                }
            }
        }
        Ok(count)
    }
}

async fn run_build_worker(
    store: Arc<Store>,
    build: Arc<dyn BuildAction>,
    pr_creator: Arc<dyn PrCreator>,
    cancel: CancellationToken,
    issue: Issue,
) {
    let issue_id = issue.id;
    match build.run_build(&cancel, &issue).await {
        Ok(()) => {
            // The PR creator may write to the issue row; the guarded
            // finish_build re-reads under a transaction.
            match pr_creator.create_pr(&cancel, &issue).await {
                Ok(()) => {
                    finish(&store, issue_id, BuildFinish::Success {
                        detail: "build completed, PR ready".to_string(),
                    });
                }
                Err(err) if err.is_cancellation() => {
                    info!(issue_id, "PR creation cancelled; leaving issue for recovery");
                }
                Err(ActionError::Conflict { files }) => {
                    let message = ActionError::Conflict { files }.to_string();
                    finish(&store, issue_id, BuildFinish::Conflict { message });
                }
                Err(err) => {
                    record_failure(&store, issue_id, &err);
                }
            }
        }
        Err(err) if err.is_cancellation() => {
            // Typically still `building`; startup recovery resumes it.
            info!(issue_id, "build cancelled; leaving issue in place");
        }
        Err(err) => {
            record_failure(&store, issue_id, &err);
        }
    }
}

fn finish(store: &Store, issue_id: i64, finish: BuildFinish) {
    match store.finish_build(issue_id, &finish) {
        Ok(true) => {}
        Ok(false) => {
            info!(issue_id, "issue reached a terminal state during the build; leaving it");
        }
        Err(err) => {
            error!(issue_id, error = %err, "failed to record build outcome");
        }
    }
}

fn record_failure(store: &Store, issue_id: i64, err: &ActionError) {
    warn!(issue_id, error = %err, "build worker failed");
    match store.fail_issue(issue_id, EVENT_BUILD_FAILED, &format!("{err}")) {
        Ok(FailOutcome::Failed) => {}
        Ok(FailOutcome::SkippedTerminal(state)) => {
            info!(issue_id, state = state.as_str(), "failure after terminal state; not rewritten");
        }
        Err(store_err) => {
            error!(issue_id, error = %store_err, "failed to record build failure");
        }
    }
}
