//! Build setup (synchronous, engine-tick side) and the dispatched build
//! worker body, plus the production glue the dispatcher calls into.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ActionCtx, ActionOutcome, PRD_MAX_TURNS, external};
use crate::clients::{BuildRequest, EventSink, InvokeRequest};
use crate::dispatcher::{BuildAction, PrCreator};
use crate::errors::ActionError;
use crate::events::{ActivityNotice, EventBus};
use crate::prompts;
use crate::store::{EVENT_BUILD, EVENT_WORKSPACE_CREATED, Issue, Store};
use crate::workspace::{
    Prd, RunStatus, WorkspacePaths, remove_pid_file, sanitize_workspace_name, write_pid_file,
    write_status_file,
};

/// Prepare the issue's workspace: worktree, PRD, stored names, and a
/// best-effort tracker state change. Idempotent: existing worktrees and PRD
/// files are reused.
pub async fn setup_build(ctx: &ActionCtx, issue: &Issue) -> Result<ActionOutcome, ActionError> {
    let local = ctx.local_path();
    let workspace_name = sanitize_workspace_name(&issue.identifier);
    let branch_name = format!("{}{}", ctx.project.branch_prefix, workspace_name);
    let paths = WorkspacePaths::new(&local, &workspace_name);
    paths.ensure_dirs().map_err(ActionError::Other)?;

    if !paths.tree.exists() {
        ctx.worktree
            .worktree_add(
                &local,
                &paths.tree,
                &branch_name,
                &ctx.project.default_base_branch,
            )
            .await
            .map_err(external)?;
        copy_configured_files(&local, &paths.tree, &ctx.copy_files)?;
    }

    if !paths.prd_file.exists() {
        let prompt = prompts::prd_prompt(
            &issue.title,
            &issue.plan_text,
            &paths.prd_file.display().to_string(),
        );
        ctx.invoke_tracked(
            issue.id,
            InvokeRequest {
                prompt,
                max_turns: PRD_MAX_TURNS,
                working_dir: Some(paths.root.clone()),
            },
        )
        .await?;
    }
    let prd = Prd::load(&paths.prd_file).map_err(ActionError::Other)?;

    ctx.store
        .set_workspace(issue.id, &workspace_name, &branch_name)?;

    // Move the tracker card to "In Progress". Purely cosmetic; never fatal.
    match ctx
        .tracker_state
        .list_workflow_states(&ctx.project.linear_team_id)
        .await
    {
        Ok(states) => {
            if let Some(state) = states.iter().find(|s| s.name.eq_ignore_ascii_case("In Progress"))
            {
                if let Err(err) = ctx
                    .tracker_state
                    .update_issue_state(&issue.tracker_issue_id, &state.id)
                    .await
                {
                    tracing::warn!(issue_id = issue.id, error = %err, "tracker state update failed");
                }
            }
        }
        Err(err) => {
            tracing::warn!(issue_id = issue.id, error = %err, "workflow state fetch failed");
        }
    }

    ctx.store.log_activity(
        issue.id,
        EVENT_WORKSPACE_CREATED,
        "",
        "",
        &format!(
            "workspace {} on {} ({} stories)",
            workspace_name,
            branch_name,
            prd.stories.len()
        ),
    )?;
    Ok(ActionOutcome::done(format!(
        "workspace {} ready",
        workspace_name
    )))
}

fn copy_configured_files(
    from: &PathBuf,
    into: &PathBuf,
    files: &[String],
) -> Result<(), ActionError> {
    for rel in files {
        let src = from.join(rel);
        if !src.exists() {
            continue;
        }
        let dst = into.join(rel);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create directory for configured file")
                .map_err(ActionError::Other)?;
        }
        std::fs::copy(&src, &dst)
            .with_context(|| format!("Failed to copy {} into workspace", rel))
            .map_err(ActionError::Other)?;
    }
    Ok(())
}

/// Fan-out handler the build runner streams into: persist the activity row
/// first, then broadcast to live subscribers.
pub fn build_event_sink(store: Arc<Store>, bus: EventBus, issue_id: i64) -> EventSink {
    Arc::new(move |event| {
        let detail = event.detail();
        if let Err(err) = store.log_activity(issue_id, EVENT_BUILD, "", "", &detail) {
            tracing::warn!(issue_id, error = %err, "failed to persist build event");
        }
        bus.publish(ActivityNotice::now(issue_id, EVENT_BUILD, detail));
    })
}

/// The dispatched worker body: PID file, git identity, runner with streamed
/// events, terminal status file.
pub async fn run_build_worker(
    ctx: &ActionCtx,
    cancel: &CancellationToken,
    issue_id: i64,
) -> Result<(), ActionError> {
    let issue = ctx.store.get_issue(issue_id)?;
    let paths = WorkspacePaths::new(&ctx.local_path(), &issue.workspace_name);
    write_pid_file(&paths.run_dir).map_err(ActionError::Other)?;

    if let Some(author) = &ctx.git_author {
        if let Err(err) = ctx
            .worktree
            .config_identity(&paths.tree, &author.name, &author.email)
            .await
        {
            tracing::warn!(issue_id, error = %err, "git identity setup failed, continuing");
        }
    }

    let sink = build_event_sink(ctx.store.clone(), ctx.bus.clone(), issue.id);
    let result = ctx
        .builder
        .run(
            cancel,
            BuildRequest {
                workspace_dir: paths.root.clone(),
                tree_dir: paths.tree.clone(),
                knowledge_dir: ctx.knowledge_dir.as_ref().map(PathBuf::from),
                max_iterations: ctx.project.max_iterations.max(1) as u32,
            },
            sink,
        )
        .await
        .map_err(external);

    let status = match &result {
        Ok(()) => RunStatus::Success,
        Err(err) if err.is_cancellation() => RunStatus::Cancelled,
        Err(err) => RunStatus::Failed {
            error: format!("{err}"),
        },
    };
    if let Err(err) = write_status_file(&paths.run_dir, &status) {
        tracing::warn!(issue_id, error = %err, "failed to write status file");
    }
    remove_pid_file(&paths.run_dir);
    result
}

/// Production dispatcher callbacks: routes each issue to its project's
/// action context.
pub struct WorkerActions {
    ctxs: HashMap<i64, Arc<ActionCtx>>,
}

impl WorkerActions {
    pub fn new(ctxs: HashMap<i64, Arc<ActionCtx>>) -> Self {
        Self { ctxs }
    }

    fn ctx_for(&self, issue: &Issue) -> Result<&Arc<ActionCtx>, ActionError> {
        self.ctxs.get(&issue.project_id).ok_or_else(|| {
            ActionError::Other(anyhow::anyhow!(
                "no runtime configured for project {}",
                issue.project_id
            ))
        })
    }
}

#[async_trait]
impl BuildAction for WorkerActions {
    async fn run_build(
        &self,
        cancel: &CancellationToken,
        issue: &Issue,
    ) -> Result<(), ActionError> {
        let ctx = self.ctx_for(issue)?;
        run_build_worker(ctx, cancel, issue.id).await
    }
}

#[async_trait]
impl PrCreator for WorkerActions {
    async fn create_pr(
        &self,
        _cancel: &CancellationToken,
        issue: &Issue,
    ) -> Result<(), ActionError> {
        let ctx = self.ctx_for(issue)?;
        super::pr::create_pull_request_flow(ctx, issue.id).await
    }
}
