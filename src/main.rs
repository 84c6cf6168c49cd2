use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use autoralph::actions::{ActionCtx, GitAuthor, build::WorkerActions};
use autoralph::clients::github::GitHubClient;
use autoralph::clients::linear::LinearClient;
use autoralph::config::{
    GithubAuth, RalphConfig, db_path, default_config_dir, load_credentials, load_project_files,
    resolve_credentials, sync_projects,
};
use autoralph::dispatcher::Dispatcher;
use autoralph::engine::Engine;
use autoralph::events::EventBus;
use autoralph::git::CliGit;
use autoralph::pollers::{IssuePoller, ReviewPoller};
use autoralph::retry::Retrier;
use autoralph::runner::{AgentCli, BuildCli};
use autoralph::store::Store;

#[derive(Parser)]
#[command(name = "autoralph")]
#[command(version, about = "Autonomous issue-to-pull-request orchestrator")]
struct Cli {
    /// Configuration directory (defaults to the platform config dir).
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until interrupted
    Run {
        /// Maximum concurrent build workers
        #[arg(long, default_value = "3")]
        max_workers: usize,

        /// State engine tick interval in seconds
        #[arg(long, default_value = "15")]
        tick_secs: u64,

        /// Tracker and code-host poll interval in seconds
        #[arg(long, default_value = "60")]
        poll_secs: u64,
    },
    /// Show issue counts by state for each project
    Status,
    /// List configured projects
    Projects,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_dir = cli.config_dir.unwrap_or_else(default_config_dir);

    match cli.command {
        Commands::Run {
            max_workers,
            tick_secs,
            poll_secs,
        } => run(&config_dir, max_workers, tick_secs, poll_secs).await,
        Commands::Status => status(&config_dir),
        Commands::Projects => projects(&config_dir),
    }
}

async fn run(config_dir: &Path, max_workers: usize, tick_secs: u64, poll_secs: u64) -> Result<()> {
    std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
    let store = Arc::new(Store::open(&db_path(config_dir))?);

    let files = load_project_files(config_dir)?;
    if files.is_empty() {
        anyhow::bail!(
            "No projects configured. Add YAML files under {}/projects/",
            config_dir.display()
        );
    }
    let creds_file = load_credentials(config_dir)?;
    let synced = sync_projects(&store, &files)?;
    info!(projects = synced.len(), "projects synced");

    let cancel = CancellationToken::new();
    let bus = EventBus::default();
    let invoker = Arc::new(AgentCli::from_env());
    let builder = Arc::new(BuildCli::from_env());

    let mut ctxs: HashMap<i64, Arc<ActionCtx>> = HashMap::new();
    for (file, project) in files.iter().zip(&synced) {
        let resolved = resolve_credentials(&creds_file, file.credentials_profile.as_deref())?;
        let token = match resolved.github {
            GithubAuth::Token(token) => token,
            GithubAuth::App { .. } => anyhow::bail!(
                "project {}: GitHub App credentials need an externally minted token; \
                 export GITHUB_TOKEN",
                project.name
            ),
        };
        let linear = Arc::new(LinearClient::new(resolved.linear_api_key.clone()));
        let github = Arc::new(GitHubClient::new(
            token,
            project.github_owner.clone(),
            project.github_repo.clone(),
        ));
        let git = Arc::new(CliGit);
        let ralph = RalphConfig::load(Path::new(&project.local_path), &project.ralph_config_path);

        let ctx = Arc::new(ActionCtx {
            store: store.clone(),
            project: project.clone(),
            bus: bus.clone(),
            retrier: Retrier::default(),
            cancel: cancel.child_token(),
            issue_fetcher: linear.clone(),
            comments: linear.clone(),
            tracker_state: linear,
            pr: github.clone(),
            reviews: github.clone(),
            merge: github,
            invoker: invoker.clone(),
            builder: builder.clone(),
            pusher: git.clone(),
            fetcher: git.clone(),
            ancestry: git.clone(),
            rebaser: Some(git.clone()),
            worktree: git,
            knowledge_dir: ralph.knowledge_dir,
            copy_files: ralph.copy_files,
            git_author: resolved
                .git_author
                .map(|(name, email)| GitAuthor { name, email }),
        });
        ctxs.insert(project.id, ctx);
    }

    let worker_actions = Arc::new(WorkerActions::new(ctxs.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        worker_actions.clone(),
        worker_actions,
        max_workers,
        cancel.child_token(),
    ));

    let resumed = dispatcher.recover_building()?;
    if resumed > 0 {
        info!(resumed, "resumed interrupted builds");
    }

    let engine = Engine::new(
        store.clone(),
        dispatcher.clone(),
        ctxs.clone(),
        Duration::from_secs(tick_secs),
        cancel.child_token(),
    );
    let issue_poller = IssuePoller::new(
        store.clone(),
        ctxs.clone(),
        Duration::from_secs(poll_secs),
        cancel.child_token(),
    );
    let review_poller = ReviewPoller::new(
        store,
        dispatcher.clone(),
        ctxs,
        Duration::from_secs(poll_secs),
        cancel.child_token(),
    );

    let engine_task = tokio::spawn(async move { engine.run().await });
    let issue_task = tokio::spawn(async move { issue_poller.run().await });
    let review_task = tokio::spawn(async move { review_poller.run().await });
    info!(max_workers, tick_secs, poll_secs, "orchestrator running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutdown requested, draining workers");
    cancel.cancel();
    let _ = tokio::join!(engine_task, issue_task, review_task);
    dispatcher.wait().await;
    info!("shutdown complete");
    Ok(())
}

fn status(config_dir: &Path) -> Result<()> {
    let store = Store::open(&db_path(config_dir))?;
    let projects = store.list_projects()?;
    if projects.is_empty() {
        println!("No projects.");
        return Ok(());
    }
    for project in projects {
        println!("{} ({}/{})", project.name, project.github_owner, project.github_repo);
        let counts = store.count_issues_by_state_for_project(project.id)?;
        if counts.is_empty() {
            println!("  no issues");
            continue;
        }
        for (state, count) in counts {
            println!("  {:<20} {}", state.as_str(), count);
        }
    }
    println!("\nRecent activity:");
    for entry in store.list_recent_activity(10)? {
        println!(
            "  {} [{}] {}",
            entry.created_at, entry.event_type, entry.detail
        );
    }
    Ok(())
}

fn projects(config_dir: &Path) -> Result<()> {
    let files = load_project_files(config_dir)?;
    if files.is_empty() {
        println!(
            "No projects configured under {}/projects/",
            config_dir.display()
        );
        return Ok(());
    }
    for file in files {
        println!(
            "{}  {}  {}/{}  team {}",
            file.name,
            file.expanded_local_path().display(),
            file.github.owner,
            file.github.repo,
            file.linear.team_id
        );
    }
    Ok(())
}
