use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use super::models::*;
use crate::errors::StoreError;

const ISSUE_COLS: &str = "id, project_id, tracker_issue_id, identifier, title, description, state, \
     plan_text, workspace_name, branch_name, pr_number, pr_url, last_comment_id, last_review_id, \
     last_check_sha, check_fix_attempts, input_tokens, output_tokens, error_message, created_at, updated_at";

const PROJECT_COLS: &str = "id, name, local_path, github_owner, github_repo, linear_team_id, \
     linear_assignee_id, linear_project_id, linear_label, default_base_branch, branch_prefix, \
     max_iterations, ralph_config_path, created_at, updated_at";

/// Outcome of a guarded failure write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// The issue was moved to `failed` and the error recorded.
    Failed,
    /// The issue was already in a sticky terminal state; nothing was written.
    SkippedTerminal(IssueState),
}

/// How a dispatched build worker finished, for the guarded post-build write.
#[derive(Debug, Clone)]
pub enum BuildFinish {
    /// Runner and PR creation succeeded: move to `in_review`.
    Success { detail: String },
    /// PR creation hit merge conflicts: move to `paused`.
    Conflict { message: String },
}

/// Durable storage for projects, issues, the activity log, and settings.
///
/// The connection is serialized behind a mutex; every method takes `&self`
/// and the store is shared as `Arc<Store>`. Transactional helpers
/// (`transition_state`, `fail_issue`, `finish_build`) perform their
/// read-check-write under a single transaction.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    /// WAL journaling, enforced foreign keys, 5s busy timeout.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .context("Failed to open database")
            .map_err(StoreError::Other)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory database")
            .map_err(StoreError::Other)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("Failed to set database pragmas")
        .map_err(StoreError::Other)?;
        Self::run_migrations(&conn)?;
        Ok(())
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                local_path TEXT NOT NULL,
                github_owner TEXT NOT NULL,
                github_repo TEXT NOT NULL,
                linear_team_id TEXT NOT NULL,
                linear_assignee_id TEXT NOT NULL,
                linear_project_id TEXT,
                linear_label TEXT,
                default_base_branch TEXT NOT NULL DEFAULT 'main',
                branch_prefix TEXT NOT NULL DEFAULT 'autoralph/',
                max_iterations INTEGER NOT NULL DEFAULT 20,
                ralph_config_path TEXT NOT NULL DEFAULT '.ralph/ralph.yaml',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS issues (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                tracker_issue_id TEXT NOT NULL,
                identifier TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT 'queued',
                plan_text TEXT NOT NULL DEFAULT '',
                workspace_name TEXT NOT NULL DEFAULT '',
                branch_name TEXT NOT NULL DEFAULT '',
                pr_number INTEGER NOT NULL DEFAULT 0,
                pr_url TEXT NOT NULL DEFAULT '',
                last_comment_id TEXT NOT NULL DEFAULT '',
                last_review_id TEXT NOT NULL DEFAULT '',
                error_message TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(project_id, tracker_issue_id)
            );

            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                issue_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
                event_type TEXT NOT NULL,
                from_state TEXT NOT NULL DEFAULT '',
                to_state TEXT NOT NULL DEFAULT '',
                detail TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_issues_project ON issues(project_id);
            CREATE INDEX IF NOT EXISTS idx_issues_state ON issues(state);
            CREATE INDEX IF NOT EXISTS idx_activity_issue ON activity_log(issue_id);
            ",
        )
        .context("Failed to create tables")
        .map_err(StoreError::Other)?;

        // Columns added after the initial schema. Re-running is a no-op and
        // existing data is preserved.
        for (table, column, decl) in [
            ("issues", "last_check_sha", "TEXT NOT NULL DEFAULT ''"),
            ("issues", "check_fix_attempts", "INTEGER NOT NULL DEFAULT 0"),
            ("issues", "input_tokens", "INTEGER NOT NULL DEFAULT 0"),
            ("issues", "output_tokens", "INTEGER NOT NULL DEFAULT 0"),
        ] {
            Self::add_column_if_missing(conn, table, column, decl)?;
        }
        Ok(())
    }

    fn add_column_if_missing(
        conn: &Connection,
        table: &str,
        column: &str,
        decl: &str,
    ) -> Result<(), StoreError> {
        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
                params![table, column],
                |row| row.get::<_, i64>(0).map(|n| n > 0),
            )
            .map_err(StoreError::Sqlite)?;
        if !exists {
            conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};"))
                .map_err(StoreError::Sqlite)?;
        }
        Ok(())
    }

    /// Run `f` inside a single transaction; commit on `Ok`, roll back on `Err`.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(StoreError::Sqlite)?;
        let out = f(&tx)?;
        tx.commit().map_err(StoreError::Sqlite)?;
        Ok(out)
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    pub fn create_project(&self, p: &Project) -> Result<Project, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO projects (name, local_path, github_owner, github_repo, linear_team_id, \
             linear_assignee_id, linear_project_id, linear_label, default_base_branch, \
             branch_prefix, max_iterations, ralph_config_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                p.name,
                p.local_path,
                p.github_owner,
                p.github_repo,
                p.linear_team_id,
                p.linear_assignee_id,
                p.linear_project_id,
                p.linear_label,
                p.default_base_branch,
                p.branch_prefix,
                p.max_iterations,
                p.ralph_config_path,
            ],
        )
        .map_err(|e| StoreError::from_sqlite(e, "insert project"))?;
        let id = conn.last_insert_rowid();
        Self::get_project_inner(&conn, id)
    }

    pub fn get_project(&self, id: i64) -> Result<Project, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::get_project_inner(&conn, id)
    }

    fn get_project_inner(conn: &Connection, id: i64) -> Result<Project, StoreError> {
        conn.query_row(
            &format!("SELECT {PROJECT_COLS} FROM projects WHERE id = ?1"),
            params![id],
            Self::map_project,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("project", id),
            other => StoreError::Sqlite(other),
        })
    }

    pub fn get_project_by_name(&self, name: &str) -> Result<Project, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {PROJECT_COLS} FROM projects WHERE name = ?1"),
            params![name],
            Self::map_project,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("project", name),
            other => StoreError::Sqlite(other),
        })
    }

    pub fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!("SELECT {PROJECT_COLS} FROM projects ORDER BY name"))
            .map_err(StoreError::Sqlite)?;
        let rows = stmt
            .query_map([], Self::map_project)
            .map_err(StoreError::Sqlite)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn update_project(&self, p: &Project) -> Result<Project, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "UPDATE projects SET local_path = ?1, github_owner = ?2, github_repo = ?3, \
                 linear_team_id = ?4, linear_assignee_id = ?5, linear_project_id = ?6, \
                 linear_label = ?7, default_base_branch = ?8, branch_prefix = ?9, \
                 max_iterations = ?10, ralph_config_path = ?11, updated_at = datetime('now')
                 WHERE id = ?12",
                params![
                    p.local_path,
                    p.github_owner,
                    p.github_repo,
                    p.linear_team_id,
                    p.linear_assignee_id,
                    p.linear_project_id,
                    p.linear_label,
                    p.default_base_branch,
                    p.branch_prefix,
                    p.max_iterations,
                    p.ralph_config_path,
                    p.id,
                ],
            )
            .map_err(|e| StoreError::from_sqlite(e, "update project"))?;
        if n == 0 {
            return Err(StoreError::not_found("project", p.id));
        }
        Self::get_project_inner(&conn, p.id)
    }

    pub fn delete_project(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .map_err(StoreError::Sqlite)?;
        Ok(n > 0)
    }

    // ── Issue CRUD ────────────────────────────────────────────────────

    pub fn create_issue(
        &self,
        project_id: i64,
        tracker_issue_id: &str,
        identifier: &str,
        title: &str,
        description: &str,
    ) -> Result<Issue, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO issues (project_id, tracker_issue_id, identifier, title, description)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![project_id, tracker_issue_id, identifier, title, description],
        )
        .map_err(|e| StoreError::from_sqlite(e, "insert issue"))?;
        let id = conn.last_insert_rowid();
        Self::get_issue_inner(&conn, id)
    }

    pub fn get_issue(&self, id: i64) -> Result<Issue, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::get_issue_inner(&conn, id)
    }

    fn get_issue_inner(conn: &Connection, id: i64) -> Result<Issue, StoreError> {
        let row = conn
            .query_row(
                &format!("SELECT {ISSUE_COLS} FROM issues WHERE id = ?1"),
                params![id],
                Self::map_issue_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("issue", id),
                other => StoreError::Sqlite(other),
            })?;
        row.into_issue()
    }

    pub fn get_issue_by_tracker_id(&self, tracker_id: &str) -> Result<Option<Issue>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::optional_issue(conn.query_row(
            &format!("SELECT {ISSUE_COLS} FROM issues WHERE tracker_issue_id = ?1"),
            params![tracker_id],
            Self::map_issue_row,
        ))
    }

    pub fn get_issue_by_tracker_id_and_project(
        &self,
        tracker_id: &str,
        project_id: i64,
    ) -> Result<Option<Issue>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::optional_issue(conn.query_row(
            &format!(
                "SELECT {ISSUE_COLS} FROM issues WHERE tracker_issue_id = ?1 AND project_id = ?2"
            ),
            params![tracker_id, project_id],
            Self::map_issue_row,
        ))
    }

    fn optional_issue(res: rusqlite::Result<IssueRow>) -> Result<Option<Issue>, StoreError> {
        match res {
            Ok(row) => Ok(Some(row.into_issue()?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    pub fn list_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>, StoreError> {
        let mut sql = format!("SELECT {ISSUE_COLS} FROM issues WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(project_id) = filter.project_id {
            sql.push_str(&format!(" AND project_id = ?{}", args.len() + 1));
            args.push(Box::new(project_id));
        }
        if let Some(state) = filter.state {
            sql.push_str(&format!(" AND state = ?{}", args.len() + 1));
            args.push(Box::new(state.as_str().to_string()));
        }
        if let Some(states) = &filter.states {
            let placeholders: Vec<String> = states
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", args.len() + 1 + i))
                .collect();
            sql.push_str(&format!(" AND state IN ({})", placeholders.join(", ")));
            for state in states {
                args.push(Box::new(state.as_str().to_string()));
            }
        }
        sql.push_str(" ORDER BY id");

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql).map_err(StoreError::Sqlite)?;
        let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt
            .query_map(params.as_slice(), Self::map_issue_row)
            .map_err(StoreError::Sqlite)?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row.map_err(StoreError::Sqlite)?.into_issue()?);
        }
        Ok(issues)
    }

    /// Write every mutable field of the issue row. Returns the stored row.
    pub fn update_issue(&self, issue: &Issue) -> Result<Issue, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "UPDATE issues SET title = ?1, description = ?2, state = ?3, plan_text = ?4, \
                 workspace_name = ?5, branch_name = ?6, pr_number = ?7, pr_url = ?8, \
                 last_comment_id = ?9, last_review_id = ?10, last_check_sha = ?11, \
                 check_fix_attempts = ?12, error_message = ?13, updated_at = datetime('now')
                 WHERE id = ?14",
                params![
                    issue.title,
                    issue.description,
                    issue.state.as_str(),
                    issue.plan_text,
                    issue.workspace_name,
                    issue.branch_name,
                    issue.pr_number,
                    issue.pr_url,
                    issue.last_comment_id,
                    issue.last_review_id,
                    issue.last_check_sha,
                    issue.check_fix_attempts,
                    issue.error_message,
                    issue.id,
                ],
            )
            .map_err(|e| StoreError::from_sqlite(e, "update issue"))?;
        if n == 0 {
            return Err(StoreError::not_found("issue", issue.id));
        }
        Self::get_issue_inner(&conn, issue.id)
    }

    pub fn delete_issue(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute("DELETE FROM issues WHERE id = ?1", params![id])
            .map_err(StoreError::Sqlite)?;
        Ok(n > 0)
    }

    /// Advance the comment cursor to a comment known to be in the fetched
    /// list. Assigning an arbitrary value would break cursor monotonicity.
    pub fn set_last_comment_id(&self, issue_id: i64, comment_id: &str) -> Result<(), StoreError> {
        self.targeted_update(
            issue_id,
            "UPDATE issues SET last_comment_id = ?1, updated_at = datetime('now') WHERE id = ?2",
            comment_id,
        )
    }

    pub fn set_last_review_id(&self, issue_id: i64, review_id: &str) -> Result<(), StoreError> {
        self.targeted_update(
            issue_id,
            "UPDATE issues SET last_review_id = ?1, updated_at = datetime('now') WHERE id = ?2",
            review_id,
        )
    }

    /// Store the approved plan and move the cursor past the thread tail.
    pub fn record_approval(
        &self,
        issue_id: i64,
        plan_text: &str,
        last_comment_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "UPDATE issues SET plan_text = ?1, last_comment_id = ?2, \
                 updated_at = datetime('now') WHERE id = ?3",
                params![plan_text, last_comment_id, issue_id],
            )
            .map_err(StoreError::Sqlite)?;
        if n == 0 {
            return Err(StoreError::not_found("issue", issue_id));
        }
        Ok(())
    }

    pub fn set_workspace(
        &self,
        issue_id: i64,
        workspace_name: &str,
        branch_name: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "UPDATE issues SET workspace_name = ?1, branch_name = ?2, \
                 updated_at = datetime('now') WHERE id = ?3",
                params![workspace_name, branch_name, issue_id],
            )
            .map_err(StoreError::Sqlite)?;
        if n == 0 {
            return Err(StoreError::not_found("issue", issue_id));
        }
        Ok(())
    }

    pub fn set_pr(&self, issue_id: i64, pr_number: i64, pr_url: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "UPDATE issues SET pr_number = ?1, pr_url = ?2, \
                 updated_at = datetime('now') WHERE id = ?3",
                params![pr_number, pr_url, issue_id],
            )
            .map_err(StoreError::Sqlite)?;
        if n == 0 {
            return Err(StoreError::not_found("issue", issue_id));
        }
        Ok(())
    }

    fn targeted_update(
        &self,
        issue_id: i64,
        sql: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(sql, params![value, issue_id])
            .map_err(StoreError::Sqlite)?;
        if n == 0 {
            return Err(StoreError::not_found("issue", issue_id));
        }
        Ok(())
    }

    /// Atomic read-modify-write of the token counters.
    pub fn increment_tokens(
        &self,
        issue_id: i64,
        input: i64,
        output: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "UPDATE issues SET input_tokens = input_tokens + ?1, \
                 output_tokens = output_tokens + ?2 WHERE id = ?3",
                params![input, output, issue_id],
            )
            .map_err(StoreError::Sqlite)?;
        if n == 0 {
            return Err(StoreError::not_found("issue", issue_id));
        }
        Ok(())
    }

    // ── Guarded state writes ──────────────────────────────────────────

    /// Compare-and-set state change. Re-reads the row inside a transaction;
    /// if the current state no longer matches `from`, nothing is written and
    /// `false` is returned. On success writes exactly one `state_change`
    /// activity entry.
    pub fn transition_state(
        &self,
        issue_id: i64,
        from: IssueState,
        to: IssueState,
        detail: &str,
    ) -> Result<bool, StoreError> {
        self.transaction(|conn| {
            let current: String = conn
                .query_row(
                    "SELECT state FROM issues WHERE id = ?1",
                    params![issue_id],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("issue", issue_id),
                    other => StoreError::Sqlite(other),
                })?;
            if current != from.as_str() {
                return Ok(false);
            }
            conn.execute(
                "UPDATE issues SET state = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![to.as_str(), issue_id],
            )
            .map_err(StoreError::Sqlite)?;
            Self::insert_activity(conn, issue_id, EVENT_STATE_CHANGE, from.as_str(), to.as_str(), detail)?;
            Ok(true)
        })
    }

    /// Guarded failure write: re-reads the issue and skips sticky terminal
    /// states. Otherwise moves to `failed`, records the error message, and
    /// logs one activity entry of the given `event_type`.
    pub fn fail_issue(
        &self,
        issue_id: i64,
        event_type: &str,
        error: &str,
    ) -> Result<FailOutcome, StoreError> {
        self.transaction(|conn| {
            let current: String = conn
                .query_row(
                    "SELECT state FROM issues WHERE id = ?1",
                    params![issue_id],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("issue", issue_id),
                    other => StoreError::Sqlite(other),
                })?;
            let state = IssueState::from_str(&current)
                .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?;
            if state.is_sticky_terminal() {
                return Ok(FailOutcome::SkippedTerminal(state));
            }
            conn.execute(
                "UPDATE issues SET state = 'failed', error_message = ?1, \
                 updated_at = datetime('now') WHERE id = ?2",
                params![error, issue_id],
            )
            .map_err(StoreError::Sqlite)?;
            Self::insert_activity(conn, issue_id, event_type, &current, "failed", error)?;
            Ok(FailOutcome::Failed)
        })
    }

    /// Guarded post-build write from the dispatcher's success path.
    /// Returns `false` if the issue was already in a sticky terminal state.
    pub fn finish_build(&self, issue_id: i64, finish: &BuildFinish) -> Result<bool, StoreError> {
        self.transaction(|conn| {
            let current: String = conn
                .query_row(
                    "SELECT state FROM issues WHERE id = ?1",
                    params![issue_id],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("issue", issue_id),
                    other => StoreError::Sqlite(other),
                })?;
            let state = IssueState::from_str(&current)
                .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?;
            if state.is_sticky_terminal() {
                return Ok(false);
            }
            match finish {
                BuildFinish::Success { detail } => {
                    conn.execute(
                        "UPDATE issues SET state = 'in_review', updated_at = datetime('now') \
                         WHERE id = ?1",
                        params![issue_id],
                    )
                    .map_err(StoreError::Sqlite)?;
                    Self::insert_activity(
                        conn,
                        issue_id,
                        EVENT_BUILD_COMPLETED,
                        &current,
                        "in_review",
                        detail,
                    )?;
                }
                BuildFinish::Conflict { message } => {
                    conn.execute(
                        "UPDATE issues SET state = 'paused', error_message = ?1, \
                         updated_at = datetime('now') WHERE id = ?2",
                        params![message, issue_id],
                    )
                    .map_err(StoreError::Sqlite)?;
                    Self::insert_activity(
                        conn,
                        issue_id,
                        EVENT_MERGE_CONFLICT,
                        &current,
                        "paused",
                        message,
                    )?;
                }
            }
            Ok(true)
        })
    }

    // ── Activity log ──────────────────────────────────────────────────

    pub fn log_activity(
        &self,
        issue_id: i64,
        event_type: &str,
        from_state: &str,
        to_state: &str,
        detail: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::insert_activity(&conn, issue_id, event_type, from_state, to_state, detail)
    }

    fn insert_activity(
        conn: &Connection,
        issue_id: i64,
        event_type: &str,
        from_state: &str,
        to_state: &str,
        detail: &str,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO activity_log (issue_id, event_type, from_state, to_state, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![issue_id, event_type, from_state, to_state, detail],
        )
        .map_err(|e| StoreError::from_sqlite(e, "insert activity"))?;
        Ok(())
    }

    pub fn list_activity(
        &self,
        issue_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ActivityEntry>, StoreError> {
        self.query_activity(
            "SELECT id, issue_id, event_type, from_state, to_state, detail, created_at
             FROM activity_log WHERE issue_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            params![issue_id, limit, offset],
        )
    }

    /// Only `build_event` entries (the streamed runner output).
    pub fn list_build_activity(
        &self,
        issue_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ActivityEntry>, StoreError> {
        self.query_activity(
            "SELECT id, issue_id, event_type, from_state, to_state, detail, created_at
             FROM activity_log WHERE issue_id = ?1 AND event_type = 'build_event'
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            params![issue_id, limit, offset],
        )
    }

    /// Everything except `build_event` entries (the lifecycle timeline).
    pub fn list_timeline_activity(
        &self,
        issue_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ActivityEntry>, StoreError> {
        self.query_activity(
            "SELECT id, issue_id, event_type, from_state, to_state, detail, created_at
             FROM activity_log WHERE issue_id = ?1 AND event_type != 'build_event'
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            params![issue_id, limit, offset],
        )
    }

    /// Most recent entries across all issues.
    pub fn list_recent_activity(&self, limit: i64) -> Result<Vec<ActivityEntry>, StoreError> {
        self.query_activity(
            "SELECT id, issue_id, event_type, from_state, to_state, detail, created_at
             FROM activity_log ORDER BY created_at DESC, id DESC LIMIT ?1",
            params![limit],
        )
    }

    fn query_activity(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<ActivityEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql).map_err(StoreError::Sqlite)?;
        let rows = stmt
            .query_map(args, |row| {
                Ok(ActivityEntry {
                    id: row.get(0)?,
                    issue_id: row.get(1)?,
                    event_type: row.get(2)?,
                    from_state: row.get(3)?,
                    to_state: row.get(4)?,
                    detail: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .map_err(StoreError::Sqlite)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)
    }

    // ── Counters ──────────────────────────────────────────────────────

    /// Per-project count of issues not in {completed, failed, dismissed}.
    pub fn count_active_issues_by_project(&self) -> Result<Vec<(i64, i64)>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT project_id, COUNT(*) FROM issues
                 WHERE state NOT IN ('completed', 'failed', 'dismissed')
                 GROUP BY project_id ORDER BY project_id",
            )
            .map_err(StoreError::Sqlite)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(StoreError::Sqlite)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn count_issues_by_state_for_project(
        &self,
        project_id: i64,
    ) -> Result<Vec<(IssueState, i64)>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT state, COUNT(*) FROM issues WHERE project_id = ?1
                 GROUP BY state ORDER BY state",
            )
            .map_err(StoreError::Sqlite)?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(StoreError::Sqlite)?;
        let mut counts = Vec::new();
        for row in rows {
            let (state, count) = row.map_err(StoreError::Sqlite)?;
            let state =
                IssueState::from_str(&state).map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?;
            counts.push((state, count));
        }
        Ok(counts)
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        ) {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    // ── Row mapping ───────────────────────────────────────────────────

    fn map_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
        Ok(Project {
            id: row.get(0)?,
            name: row.get(1)?,
            local_path: row.get(2)?,
            github_owner: row.get(3)?,
            github_repo: row.get(4)?,
            linear_team_id: row.get(5)?,
            linear_assignee_id: row.get(6)?,
            linear_project_id: row.get(7)?,
            linear_label: row.get(8)?,
            default_base_branch: row.get(9)?,
            branch_prefix: row.get(10)?,
            max_iterations: row.get(11)?,
            ralph_config_path: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn map_issue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IssueRow> {
        Ok(IssueRow {
            id: row.get(0)?,
            project_id: row.get(1)?,
            tracker_issue_id: row.get(2)?,
            identifier: row.get(3)?,
            title: row.get(4)?,
            description: row.get(5)?,
            state: row.get(6)?,
            plan_text: row.get(7)?,
            workspace_name: row.get(8)?,
            branch_name: row.get(9)?,
            pr_number: row.get(10)?,
            pr_url: row.get(11)?,
            last_comment_id: row.get(12)?,
            last_review_id: row.get(13)?,
            last_check_sha: row.get(14)?,
            check_fix_attempts: row.get(15)?,
            input_tokens: row.get(16)?,
            output_tokens: row.get(17)?,
            error_message: row.get(18)?,
            created_at: row.get(19)?,
            updated_at: row.get(20)?,
        })
    }
}

/// Intermediate row struct for reading issues before parsing the state string.
struct IssueRow {
    id: i64,
    project_id: i64,
    tracker_issue_id: String,
    identifier: String,
    title: String,
    description: String,
    state: String,
    plan_text: String,
    workspace_name: String,
    branch_name: String,
    pr_number: i64,
    pr_url: String,
    last_comment_id: String,
    last_review_id: String,
    last_check_sha: String,
    check_fix_attempts: i64,
    input_tokens: i64,
    output_tokens: i64,
    error_message: String,
    created_at: String,
    updated_at: String,
}

impl IssueRow {
    fn into_issue(self) -> Result<Issue, StoreError> {
        let state = IssueState::from_str(&self.state)
            .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?;
        Ok(Issue {
            id: self.id,
            project_id: self.project_id,
            tracker_issue_id: self.tracker_issue_id,
            identifier: self.identifier,
            title: self.title,
            description: self.description,
            state,
            plan_text: self.plan_text,
            workspace_name: self.workspace_name,
            branch_name: self.branch_name,
            pr_number: self.pr_number,
            pr_url: self.pr_url,
            last_comment_id: self.last_comment_id,
            last_review_id: self.last_review_id,
            last_check_sha: self.last_check_sha,
            check_fix_attempts: self.check_fix_attempts,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
