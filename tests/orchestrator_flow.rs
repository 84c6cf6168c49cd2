//! End-to-end orchestrator scenarios with mock collaborators: the engine,
//! dispatcher, and pollers run against an in-memory store and scripted
//! tracker/host/git/agent behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use autoralph::actions::ActionCtx;
use autoralph::actions::build::WorkerActions;
use autoralph::clients::{
    BuildRequest, BuildRunner, Comment, CommentClient, CreatePullRequest, EventSink,
    InvokeOutcome, InvokeRequest, Invoker, IssueFetcher, IssueQuery, IssueStateClient,
    MergeChecker, PrClient, PullRequest, Review, ReviewClient, ReviewVerdict, TrackerIssue,
    WorkflowState,
};
use autoralph::comments::APPROVAL_HINT;
use autoralph::dispatcher::Dispatcher;
use autoralph::engine::Engine;
use autoralph::events::{AgentEvent, EventBus};
use autoralph::git::{
    AncestorChecker, BranchFetcher, GitPusher, RebaseOutcome, RebaseRunner, WorktreeGit,
};
use autoralph::pollers::{ingest_assigned_issues, poll_reviews_for_project};
use autoralph::retry::Retrier;
use autoralph::store::{Issue, IssueState, Project, Store};

// ── Mock collaborators ────────────────────────────────────────────────

#[derive(Default)]
struct MockComments {
    thread: Mutex<Vec<Comment>>,
    next_id: AtomicI64,
    reactions: Mutex<Vec<(String, String)>>,
    fail_list: AtomicBool,
}

impl MockComments {
    fn seed(&self, comments: Vec<Comment>) {
        *self.thread.lock().unwrap() = comments;
    }
}

fn comment(id: &str, body: &str, author: &str) -> Comment {
    Comment {
        id: id.to_string(),
        body: body.to_string(),
        author_name: author.to_string(),
        author_is_bot: author == "autoralph",
        parent_id: None,
        created_at: "2026-07-01T10:00:00Z".to_string(),
    }
}

#[async_trait]
impl CommentClient for MockComments {
    async fn list_comments(&self, _issue_id: &str) -> Result<Vec<Comment>> {
        if self.fail_list.load(Ordering::SeqCst) {
            anyhow::bail!("tracker returned 502")
        }
        Ok(self.thread.lock().unwrap().clone())
    }

    async fn post_comment(&self, _issue_id: &str, body: &str) -> Result<Comment> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let posted = comment(&format!("posted-{n}"), body, "autoralph");
        self.thread.lock().unwrap().push(posted.clone());
        Ok(posted)
    }

    async fn post_reply(&self, issue_id: &str, parent_id: &str, body: &str) -> Result<Comment> {
        let mut posted = self.post_comment(issue_id, body).await?;
        posted.parent_id = Some(parent_id.to_string());
        self.thread.lock().unwrap().last_mut().unwrap().parent_id = Some(parent_id.to_string());
        Ok(posted)
    }

    async fn react(&self, comment_id: &str, emoji: &str) -> Result<()> {
        self.reactions
            .lock()
            .unwrap()
            .push((comment_id.to_string(), emoji.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct MockInvoker {
    prompts: Mutex<Vec<String>>,
    response: Mutex<String>,
}

impl MockInvoker {
    fn respond_with(&self, text: &str) {
        *self.response.lock().unwrap() = text.to_string();
    }
}

#[async_trait]
impl Invoker for MockInvoker {
    async fn invoke(
        &self,
        _cancel: &CancellationToken,
        req: InvokeRequest,
    ) -> Result<InvokeOutcome> {
        self.prompts.lock().unwrap().push(req.prompt);
        Ok(InvokeOutcome {
            text: self.response.lock().unwrap().clone(),
            input_tokens: 100,
            output_tokens: 25,
            num_turns: 2,
            duration_ms: 50,
        })
    }
}

struct MockFetcherClient {
    issues: Mutex<Vec<TrackerIssue>>,
}

#[async_trait]
impl IssueFetcher for MockFetcherClient {
    async fn list_assigned_issues(&self, _query: &IssueQuery) -> Result<Vec<TrackerIssue>> {
        Ok(self.issues.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct MockTrackerState {
    updates: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl IssueStateClient for MockTrackerState {
    async fn list_workflow_states(&self, _team_id: &str) -> Result<Vec<WorkflowState>> {
        Ok(vec![WorkflowState {
            id: "ws-progress".to_string(),
            name: "In Progress".to_string(),
        }])
    }

    async fn update_issue_state(&self, issue_id: &str, state_id: &str) -> Result<()> {
        self.updates
            .lock()
            .unwrap()
            .push((issue_id.to_string(), state_id.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct MockPr {
    open: Mutex<HashMap<String, PullRequest>>,
    created: Mutex<Vec<CreatePullRequest>>,
    next_number: AtomicI64,
}

#[async_trait]
impl PrClient for MockPr {
    async fn create_pull_request(&self, req: &CreatePullRequest) -> Result<PullRequest> {
        self.created.lock().unwrap().push(req.clone());
        let number = 100 + self.next_number.fetch_add(1, Ordering::SeqCst);
        let pull = PullRequest {
            number,
            html_url: format!("https://github.com/acme/widgets/pull/{number}"),
        };
        self.open
            .lock()
            .unwrap()
            .insert(req.head.clone(), pull.clone());
        Ok(pull)
    }

    async fn find_open_pull_request(
        &self,
        head: &str,
        _base: &str,
    ) -> Result<Option<PullRequest>> {
        Ok(self.open.lock().unwrap().get(head).cloned())
    }

    async fn edit_pull_request(&self, _number: i64, _title: &str, _body: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MockReviews {
    reviews: Mutex<Vec<Review>>,
}

#[async_trait]
impl ReviewClient for MockReviews {
    async fn list_reviews(&self, _pr_number: i64) -> Result<Vec<Review>> {
        Ok(self.reviews.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct MockMerge {
    merged: AtomicBool,
}

#[async_trait]
impl MergeChecker for MockMerge {
    async fn is_merged(&self, _pr_number: i64) -> Result<bool> {
        Ok(self.merged.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
struct MockPusher {
    fail_plain_push: AtomicBool,
    pushes: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl GitPusher for MockPusher {
    async fn push(&self, _repo: &std::path::Path, branch: &str, force: bool) -> Result<()> {
        if !force && self.fail_plain_push.load(Ordering::SeqCst) {
            anyhow::bail!("non-fast-forward: remote has diverged")
        }
        self.pushes
            .lock()
            .unwrap()
            .push((branch.to_string(), force));
        Ok(())
    }
}

struct MockFetcher;

#[async_trait]
impl BranchFetcher for MockFetcher {
    async fn fetch_branch(&self, _repo: &std::path::Path, _branch: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MockAncestry {
    base_is_ancestor: AtomicBool,
}

#[async_trait]
impl AncestorChecker for MockAncestry {
    async fn is_ancestor(
        &self,
        _repo: &std::path::Path,
        _ancestor: &str,
        _descendant: &str,
    ) -> Result<bool> {
        Ok(self.base_is_ancestor.load(Ordering::SeqCst))
    }
}

struct MockRebaser {
    outcome: Mutex<RebaseOutcome>,
}

#[async_trait]
impl RebaseRunner for MockRebaser {
    async fn rebase_onto(&self, _repo: &std::path::Path, _onto: &str) -> Result<RebaseOutcome> {
        Ok(self.outcome.lock().unwrap().clone())
    }
}

struct MockWorktree;

#[async_trait]
impl WorktreeGit for MockWorktree {
    async fn worktree_add(
        &self,
        _repo: &std::path::Path,
        path: &std::path::Path,
        _branch: &str,
        _base: &str,
    ) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    async fn pull_ff_only(&self, _repo: &std::path::Path, _branch: &str) -> Result<()> {
        Ok(())
    }

    async fn diff_stat(&self, _repo: &std::path::Path, _against: &str) -> Result<String> {
        Ok(" src/lib.rs | 12 ++++++------\n 1 file changed, 6 insertions(+), 6 deletions(-)"
            .to_string())
    }

    async fn config_identity(
        &self,
        _repo: &std::path::Path,
        _name: &str,
        _email: &str,
    ) -> Result<()> {
        Ok(())
    }
}

struct MockBuilder {
    succeed: AtomicBool,
}

#[async_trait]
impl BuildRunner for MockBuilder {
    async fn run(
        &self,
        _cancel: &CancellationToken,
        _req: BuildRequest,
        events: EventSink,
    ) -> Result<()> {
        events(AgentEvent::IterationStart {
            iteration: 1,
            max: 20,
        });
        events(AgentEvent::InvocationDone {
            num_turns: 4,
            duration_ms: 1200,
        });
        if self.succeed.load(Ordering::SeqCst) {
            Ok(())
        } else {
            anyhow::bail!("runner exited with code 2")
        }
    }
}

// ── Harness ───────────────────────────────────────────────────────────

struct Harness {
    store: Arc<Store>,
    project: Project,
    ctx: Arc<ActionCtx>,
    ctxs: HashMap<i64, Arc<ActionCtx>>,
    comments: Arc<MockComments>,
    invoker: Arc<MockInvoker>,
    fetcher_client: Arc<MockFetcherClient>,
    pr: Arc<MockPr>,
    reviews: Arc<MockReviews>,
    merge: Arc<MockMerge>,
    pusher: Arc<MockPusher>,
    rebaser: Arc<MockRebaser>,
    ancestry: Arc<MockAncestry>,
    builder: Arc<MockBuilder>,
    cancel: CancellationToken,
    _tmp: tempfile::TempDir,
}

fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    let project = store
        .create_project(&Project {
            id: 0,
            name: "widgets".to_string(),
            local_path: tmp.path().display().to_string(),
            github_owner: "acme".to_string(),
            github_repo: "widgets".to_string(),
            linear_team_id: "team-1".to_string(),
            linear_assignee_id: "bot-1".to_string(),
            linear_project_id: None,
            linear_label: None,
            default_base_branch: "main".to_string(),
            branch_prefix: "autoralph/".to_string(),
            max_iterations: 20,
            ralph_config_path: ".ralph/ralph.yaml".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        })
        .unwrap();

    let comments = Arc::new(MockComments::default());
    let invoker = Arc::new(MockInvoker::default());
    invoker.respond_with("<!-- type: plan -->\nProposed plan");
    let fetcher_client = Arc::new(MockFetcherClient {
        issues: Mutex::new(Vec::new()),
    });
    let pr = Arc::new(MockPr::default());
    let reviews = Arc::new(MockReviews::default());
    let merge = Arc::new(MockMerge::default());
    let pusher = Arc::new(MockPusher::default());
    let rebaser = Arc::new(MockRebaser {
        outcome: Mutex::new(RebaseOutcome::Clean),
    });
    let ancestry = Arc::new(MockAncestry {
        base_is_ancestor: AtomicBool::new(true),
    });
    let builder = Arc::new(MockBuilder {
        succeed: AtomicBool::new(true),
    });
    let cancel = CancellationToken::new();

    let ctx = Arc::new(ActionCtx {
        store: store.clone(),
        project: project.clone(),
        bus: EventBus::default(),
        retrier: Retrier::new(1, vec![]),
        cancel: cancel.child_token(),
        issue_fetcher: fetcher_client.clone(),
        comments: comments.clone(),
        tracker_state: Arc::new(MockTrackerState::default()),
        pr: pr.clone(),
        reviews: reviews.clone(),
        merge: merge.clone(),
        invoker: invoker.clone(),
        builder: builder.clone(),
        pusher: pusher.clone(),
        fetcher: Arc::new(MockFetcher),
        ancestry: ancestry.clone(),
        rebaser: Some(rebaser.clone()),
        worktree: Arc::new(MockWorktree),
        knowledge_dir: None,
        copy_files: Vec::new(),
        git_author: None,
    });
    let ctxs = HashMap::from([(project.id, ctx.clone())]);

    Harness {
        store,
        project,
        ctx,
        ctxs,
        comments,
        invoker,
        fetcher_client,
        pr,
        reviews,
        merge,
        pusher,
        rebaser,
        ancestry,
        builder,
        cancel,
        _tmp: tmp,
    }
}

impl Harness {
    fn dispatcher(&self, max_workers: usize) -> Arc<Dispatcher> {
        let actions = Arc::new(WorkerActions::new(self.ctxs.clone()));
        Arc::new(Dispatcher::new(
            self.store.clone(),
            actions.clone(),
            actions,
            max_workers,
            self.cancel.child_token(),
        ))
    }

    fn engine(&self, dispatcher: Arc<Dispatcher>) -> Engine {
        Engine::new(
            self.store.clone(),
            dispatcher,
            self.ctxs.clone(),
            Duration::from_secs(3600),
            self.cancel.child_token(),
        )
    }

    fn issue_in_state(&self, state: IssueState) -> Issue {
        let mut issue = self
            .store
            .create_issue(self.project.id, "trk-1", "WID-7", "Add storage layer", "use a db")
            .unwrap();
        issue.state = state;
        self.store.update_issue(&issue).unwrap()
    }
}

fn activity_types(store: &Store, issue_id: i64) -> Vec<String> {
    store
        .list_activity(issue_id, 50, 0)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

// ── Scenario 1: approve then build ────────────────────────────────────

#[tokio::test]
async fn approval_comment_moves_issue_to_approved_with_plan() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::Refining);
    issue.last_comment_id = "c1".to_string();
    h.store.update_issue(&issue).unwrap();
    h.comments.seed(vec![
        comment("c1", "plan draft", "autoralph"),
        comment("c2", "I approve this", "alice"),
    ]);

    let dispatcher = h.dispatcher(2);
    h.engine(dispatcher).tick().await.unwrap();

    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.state, IssueState::Approved);
    assert_eq!(updated.plan_text, "plan draft");
    assert_eq!(updated.last_comment_id, "c2");

    let entries = h.store.list_activity(issue.id, 50, 0).unwrap();
    let approval = entries
        .iter()
        .find(|e| e.event_type == "approval_detected")
        .expect("approval_detected entry");
    assert!(approval.detail.contains("alice"));

    // Exactly one state_change with matching endpoints.
    let changes: Vec<_> = entries
        .iter()
        .filter(|e| e.event_type == "state_change")
        .collect();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].from_state, "refining");
    assert_eq!(changes[0].to_state, "approved");
}

// ── Scenario 2: incremental iteration ─────────────────────────────────

#[tokio::test]
async fn iteration_prompt_carries_only_comments_after_the_cursor() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::Refining);
    issue.last_comment_id = "c5".to_string();
    h.store.update_issue(&issue).unwrap();

    let thread: Vec<Comment> = (1..=8)
        .map(|i| {
            let author = if i % 2 == 0 { "alice" } else { "autoralph" };
            comment(&format!("c{i}"), &format!("comment body {i}"), author)
        })
        .collect();
    h.comments.seed(thread);
    h.invoker.respond_with("<!-- type: plan -->\nRevised plan");

    let dispatcher = h.dispatcher(2);
    h.engine(dispatcher).tick().await.unwrap();

    let prompts = h.invoker.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    let prompt = &prompts[0];
    assert!(prompt.contains("Continuing refinement of: Add storage layer"));
    for i in 6..=8 {
        assert!(prompt.contains(&format!("comment body {i}")), "missing c{i}");
    }
    for i in 1..=5 {
        assert!(!prompt.contains(&format!("comment body {i}")), "leaked c{i}");
    }
    assert!(!prompt.contains("use a db"), "description leaked");
    drop(prompts);

    // Monotone cursor: the new cursor is a comment in the fetched list.
    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.state, IssueState::Refining);
    let thread = h.comments.thread.lock().unwrap();
    assert!(thread.iter().any(|c| c.id == updated.last_comment_id));
    assert!(updated.last_comment_id.starts_with("posted-"));
}

// ── Scenario 3: self-approval guard ───────────────────────────────────

#[tokio::test]
async fn bot_comments_with_hint_never_self_approve() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::Refining);
    issue.last_comment_id = "c2".to_string();
    h.store.update_issue(&issue).unwrap();
    h.comments.seed(vec![
        comment("c1", &format!("draft{APPROVAL_HINT}"), "autoralph"),
        comment("c2", &format!("updated{APPROVAL_HINT}"), "autoralph"),
    ]);

    let dispatcher = h.dispatcher(2);
    h.engine(dispatcher).tick().await.unwrap();

    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.state, IssueState::Refining);
    assert_eq!(updated.last_comment_id, "c2");
    assert!(
        !activity_types(&h.store, issue.id).contains(&"state_change".to_string()),
        "no transition may fire"
    );
    assert!(h.invoker.prompts.lock().unwrap().is_empty());
}

// Consistency lag: the cursor is missing from the fetched list entirely.
#[tokio::test]
async fn missing_cursor_triggers_no_transition() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::Refining);
    issue.last_comment_id = "c99".to_string();
    h.store.update_issue(&issue).unwrap();
    h.comments.seed(vec![
        comment("c1", "anything", "alice"),
        comment("c2", "I approve this", "alice"),
    ]);

    let dispatcher = h.dispatcher(2);
    h.engine(dispatcher).tick().await.unwrap();

    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.state, IssueState::Refining);
    assert_eq!(updated.last_comment_id, "c99");
}

// ── Scenario 4: merge completes before review feedback ────────────────

#[tokio::test]
async fn merged_pr_completes_even_with_pending_change_request() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::InReview);
    issue.pr_number = 17;
    issue.pr_url = "https://github.com/acme/widgets/pull/17".to_string();
    let issue = h.store.update_issue(&issue).unwrap();

    h.merge.merged.store(true, Ordering::SeqCst);
    *h.reviews.reviews.lock().unwrap() = vec![Review {
        id: "900".to_string(),
        author_name: "alice".to_string(),
        verdict: ReviewVerdict::ChangesRequested,
        body: "please split this".to_string(),
        submitted_at: "2026-07-01T12:00:00Z".to_string(),
    }];

    let dispatcher = h.dispatcher(2);
    poll_reviews_for_project(&h.store, &dispatcher, &h.ctx)
        .await
        .unwrap();

    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.state, IssueState::Completed);
    assert!(activity_types(&h.store, issue.id).contains(&"pr_merged".to_string()));
    assert!(!activity_types(&h.store, issue.id).contains(&"changes_requested".to_string()));
}

// ── Review feedback path ──────────────────────────────────────────────

#[tokio::test]
async fn human_change_request_moves_issue_to_addressing_feedback() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::InReview);
    issue.pr_number = 17;
    issue.pr_url = "u".to_string();
    issue.workspace_name = "wid-7".to_string();
    issue.branch_name = "autoralph/wid-7".to_string();
    let issue = h.store.update_issue(&issue).unwrap();

    *h.reviews.reviews.lock().unwrap() = vec![
        Review {
            id: "900".to_string(),
            author_name: "ci-runner[bot]".to_string(),
            verdict: ReviewVerdict::ChangesRequested,
            body: "lint failed".to_string(),
            submitted_at: String::new(),
        },
        Review {
            id: "901".to_string(),
            author_name: "alice".to_string(),
            verdict: ReviewVerdict::ChangesRequested,
            body: "please add tests".to_string(),
            submitted_at: String::new(),
        },
    ];

    let dispatcher = h.dispatcher(2);
    poll_reviews_for_project(&h.store, &dispatcher, &h.ctx)
        .await
        .unwrap();
    dispatcher.wait().await;

    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.last_review_id, "901");
    assert!(activity_types(&h.store, issue.id).contains(&"changes_requested".to_string()));

    // The feedback worker ran the agent and pushed the branch.
    assert_eq!(h.invoker.prompts.lock().unwrap().len(), 1);
    assert!(h.invoker.prompts.lock().unwrap()[0].contains("please add tests"));
    assert!(!h.pusher.pushes.lock().unwrap().is_empty());

    // Once the worker exits, the engine returns the issue to in_review.
    h.engine(dispatcher).tick().await.unwrap();
    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.state, IssueState::InReview);
}

#[tokio::test]
async fn bot_only_reviews_advance_cursor_without_transition() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::InReview);
    issue.pr_number = 17;
    issue.pr_url = "u".to_string();
    let issue = h.store.update_issue(&issue).unwrap();

    *h.reviews.reviews.lock().unwrap() = vec![Review {
        id: "900".to_string(),
        author_name: "ci-runner[bot]".to_string(),
        verdict: ReviewVerdict::ChangesRequested,
        body: "lint failed".to_string(),
        submitted_at: String::new(),
    }];

    let dispatcher = h.dispatcher(2);
    poll_reviews_for_project(&h.store, &dispatcher, &h.ctx)
        .await
        .unwrap();

    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.state, IssueState::InReview);
    assert_eq!(updated.last_review_id, "900");
}

// ── Scenario 5: build recovery on restart ─────────────────────────────

#[tokio::test]
async fn building_issues_are_recovered_and_reach_in_review() {
    let h = harness();
    let mut issues = Vec::new();
    for i in 0..2 {
        let mut issue = h
            .store
            .create_issue(
                h.project.id,
                &format!("trk-build-{i}"),
                &format!("WID-{i}"),
                "t",
                "",
            )
            .unwrap();
        issue.state = IssueState::Building;
        issue.workspace_name = format!("wid-{i}");
        issue.branch_name = format!("autoralph/wid-{i}");
        issues.push(h.store.update_issue(&issue).unwrap());
    }
    h.invoker.respond_with("Add feature\n\nImplements the thing.");

    let dispatcher = h.dispatcher(2);
    let resumed = dispatcher.recover_building().unwrap();
    assert_eq!(resumed, 2);
    dispatcher.wait().await;

    for issue in &issues {
        let updated = h.store.get_issue(issue.id).unwrap();
        assert_eq!(updated.state, IssueState::InReview, "issue {}", issue.id);
        assert!(updated.pr_number > 0);
        assert!(updated.pr_url.contains("/pull/"));
        let types = activity_types(&h.store, issue.id);
        assert!(types.contains(&"build_completed".to_string()));
        assert!(types.contains(&"pr_created".to_string()));
        assert!(types.contains(&"build_event".to_string()));
    }

    // Two distinct branches: one PR each.
    assert_eq!(h.pr.created.lock().unwrap().len(), 2);
}

// ── Idempotent PR creation ────────────────────────────────────────────

#[tokio::test]
async fn rerunning_pr_creation_reuses_the_open_pr() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::Building);
    issue.workspace_name = "wid-7".to_string();
    issue.branch_name = "autoralph/wid-7".to_string();
    let issue = h.store.update_issue(&issue).unwrap();
    h.invoker.respond_with("Add storage layer\n\nbody");

    autoralph::actions::pr::create_pull_request_flow(&h.ctx, issue.id)
        .await
        .unwrap();
    let first = h.store.get_issue(issue.id).unwrap();
    assert!(first.pr_number > 0);

    autoralph::actions::pr::create_pull_request_flow(&h.ctx, issue.id)
        .await
        .unwrap();
    let second = h.store.get_issue(issue.id).unwrap();
    assert_eq!(second.pr_number, first.pr_number);
    assert_eq!(second.pr_url, first.pr_url);
    assert_eq!(h.pr.created.lock().unwrap().len(), 1, "no duplicate PR");
}

// ── Build failure path ────────────────────────────────────────────────

#[tokio::test]
async fn build_runner_failure_moves_issue_to_failed_with_status_file() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::Building);
    issue.workspace_name = "wid-7".to_string();
    issue.branch_name = "autoralph/wid-7".to_string();
    let issue = h.store.update_issue(&issue).unwrap();
    h.builder.succeed.store(false, Ordering::SeqCst);

    let dispatcher = h.dispatcher(2);
    dispatcher.dispatch(&issue).unwrap();
    dispatcher.wait().await;

    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.state, IssueState::Failed);
    assert!(updated.error_message.contains("runner exited with code 2"));
    assert!(activity_types(&h.store, issue.id).contains(&"build_failed".to_string()));

    // Terminal status file for external observers.
    let status_path = h
        ._tmp
        .path()
        .join(".ralph/workspaces/wid-7/run/status.json");
    let raw = std::fs::read_to_string(status_path).unwrap();
    assert!(raw.contains("failed"));
    assert!(raw.contains("runner exited with code 2"));
}

// ── Scenario 6: conflict pauses the issue ─────────────────────────────

#[tokio::test]
async fn rebase_conflicts_pause_the_issue_with_file_count() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::Building);
    issue.workspace_name = "wid-7".to_string();
    issue.branch_name = "autoralph/wid-7".to_string();
    let issue = h.store.update_issue(&issue).unwrap();

    h.pusher.fail_plain_push.store(true, Ordering::SeqCst);
    *h.rebaser.outcome.lock().unwrap() =
        RebaseOutcome::Conflicts(vec!["a.go".to_string(), "b.go".to_string()]);

    let dispatcher = h.dispatcher(2);
    dispatcher.dispatch(&issue).unwrap();
    dispatcher.wait().await;

    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.state, IssueState::Paused);
    assert!(updated.error_message.contains("merge conflicts in 2 files"));
    assert!(activity_types(&h.store, issue.id).contains(&"merge_conflict".to_string()));
}

// ── Queued → refining → approved → building pipeline ──────────────────

#[tokio::test]
async fn queued_issue_gets_refined_and_posted_with_hint() {
    let h = harness();
    let issue = h.issue_in_state(IssueState::Queued);
    h.invoker.respond_with("<!-- type: plan -->\nHere is the plan");

    let dispatcher = h.dispatcher(2);
    h.engine(dispatcher).tick().await.unwrap();

    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.state, IssueState::Refining);
    let thread = h.comments.thread.lock().unwrap();
    assert_eq!(thread.len(), 1);
    assert!(thread[0].body.starts_with("Here is the plan"));
    assert!(thread[0].body.contains("I approve this"), "hint appended");
    assert_eq!(updated.last_comment_id, thread[0].id);
}

#[tokio::test]
async fn question_responses_are_posted_without_hint() {
    let h = harness();
    let issue = h.issue_in_state(IssueState::Queued);
    h.invoker
        .respond_with("<!-- type: questions -->\nWhich database should back this?");

    let dispatcher = h.dispatcher(2);
    h.engine(dispatcher).tick().await.unwrap();

    let _ = h.store.get_issue(issue.id).unwrap();
    let thread = h.comments.thread.lock().unwrap();
    assert_eq!(thread.len(), 1);
    assert!(!thread[0].body.contains("I approve this"));
}

#[tokio::test]
async fn approved_issue_builds_creates_workspace_and_dispatches() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::Approved);
    issue.plan_text = "the approved plan".to_string();
    let issue = h.store.update_issue(&issue).unwrap();

    // The PRD the agent would materialize.
    let prd_dir = h
        ._tmp
        .path()
        .join(".ralph")
        .join("workspaces")
        .join("wid-7");
    std::fs::create_dir_all(&prd_dir).unwrap();
    std::fs::write(
        prd_dir.join("prd.json"),
        r#"{"description": "adds storage", "stories": [{"id": "S1", "title": "schema"}]}"#,
    )
    .unwrap();
    h.invoker.respond_with("Add storage layer\n\nbody");

    let dispatcher = h.dispatcher(2);
    let engine = h.engine(dispatcher.clone());
    engine.tick().await.unwrap();
    dispatcher.wait().await;

    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.workspace_name, "wid-7");
    assert_eq!(updated.branch_name, "autoralph/wid-7");
    // The build worker ran to completion and the PR exists.
    assert_eq!(updated.state, IssueState::InReview);
    assert!(updated.pr_number > 0);
    let types = activity_types(&h.store, issue.id);
    assert!(types.contains(&"workspace_created".to_string()));
    assert!(types.contains(&"build_completed".to_string()));
}

// ── Ingestion ─────────────────────────────────────────────────────────

#[tokio::test]
async fn issue_poller_inserts_new_issues_once() {
    let h = harness();
    *h.fetcher_client.issues.lock().unwrap() = vec![TrackerIssue {
        id: "trk-9".to_string(),
        identifier: "WID-9".to_string(),
        title: "Fix the flaky test".to_string(),
        description: "it fails on tuesdays".to_string(),
    }];

    let ingested = ingest_assigned_issues(&h.store, &h.ctx).await.unwrap();
    assert_eq!(ingested, 1);
    let issue = h
        .store
        .get_issue_by_tracker_id_and_project("trk-9", h.project.id)
        .unwrap()
        .unwrap();
    assert_eq!(issue.state, IssueState::Queued);
    assert_eq!(issue.identifier, "WID-9");
    assert!(activity_types(&h.store, issue.id).contains(&"ingested".to_string()));

    // Second tick sees the same remote issue and inserts nothing.
    let ingested = ingest_assigned_issues(&h.store, &h.ctx).await.unwrap();
    assert_eq!(ingested, 0);
}

// ── Auto-rebase ───────────────────────────────────────────────────────

#[tokio::test]
async fn in_review_issue_rebases_when_base_moves() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::InReview);
    issue.pr_number = 17;
    issue.pr_url = "u".to_string();
    issue.workspace_name = "wid-7".to_string();
    issue.branch_name = "autoralph/wid-7".to_string();
    let issue = h.store.update_issue(&issue).unwrap();

    // Base is no longer an ancestor of HEAD: the rebase row fires.
    h.ancestry.base_is_ancestor.store(false, Ordering::SeqCst);

    let dispatcher = h.dispatcher(2);
    h.engine(dispatcher).tick().await.unwrap();

    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.state, IssueState::InReview);
    let force_pushes: Vec<_> = h
        .pusher
        .pushes
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, force)| *force)
        .cloned()
        .collect();
    assert_eq!(force_pushes.len(), 1);
    let types = activity_types(&h.store, issue.id);
    assert!(types.contains(&"rebase_start".to_string()));
    assert!(types.contains(&"rebase_finish".to_string()));
    // The self-transition still logs exactly one state_change.
    assert!(types.contains(&"state_change".to_string()));
}

// ── Failure semantics ─────────────────────────────────────────────────

#[tokio::test]
async fn condition_errors_are_swallowed_and_leave_the_issue_alone() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::Refining);
    issue.last_comment_id = "c1".to_string();
    h.store.update_issue(&issue).unwrap();
    h.comments.fail_list.store(true, Ordering::SeqCst);

    let dispatcher = h.dispatcher(2);
    h.engine(dispatcher).tick().await.unwrap();

    // Both refining conditions errored; neither fired and nothing failed.
    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.state, IssueState::Refining);
    assert!(updated.error_message.is_empty());
    assert!(h.store.list_activity(issue.id, 10, 0).unwrap().is_empty());
}

#[tokio::test]
async fn saturated_pool_defers_the_build_until_a_later_tick() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::Approved);
    issue.plan_text = "plan".to_string();
    let issue = h.store.update_issue(&issue).unwrap();

    let blocker = h
        .store
        .create_issue(h.project.id, "trk-blocker", "WID-99", "t", "")
        .unwrap();
    let prd_dir = h._tmp.path().join(".ralph/workspaces/wid-7");
    std::fs::create_dir_all(&prd_dir).unwrap();
    std::fs::write(prd_dir.join("prd.json"), r#"{"description": "d"}"#).unwrap();
    h.invoker.respond_with("Title\n\nbody");

    // Occupy the only slot with a worker that outlives the first tick.
    let dispatcher = h.dispatcher(1);
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    dispatcher
        .dispatch_action(&blocker, async move {
            let _ = release_rx.await;
            Ok(())
        })
        .unwrap();

    let engine = h.engine(dispatcher.clone());
    engine.tick().await.unwrap();

    // Setup ran but no slot was free: the issue stays approved.
    let mid = h.store.get_issue(issue.id).unwrap();
    assert_eq!(mid.state, IssueState::Approved);
    assert_eq!(mid.workspace_name, "wid-7");

    release_tx.send(()).unwrap();
    // Give the blocker time to release its permit.
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.tick().await.unwrap();
    dispatcher.wait().await;
    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.state, IssueState::InReview);
}

#[tokio::test]
async fn rebase_condition_is_false_without_a_pr() {
    let h = harness();
    let mut issue = h.issue_in_state(IssueState::InReview);
    issue.workspace_name = "wid-7".to_string();
    let issue = h.store.update_issue(&issue).unwrap();
    h.ancestry.base_is_ancestor.store(false, Ordering::SeqCst);

    let dispatcher = h.dispatcher(2);
    h.engine(dispatcher).tick().await.unwrap();

    let updated = h.store.get_issue(issue.id).unwrap();
    assert_eq!(updated.state, IssueState::InReview);
    assert!(h.pusher.pushes.lock().unwrap().is_empty());
}
