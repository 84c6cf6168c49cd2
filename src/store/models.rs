use serde::{Deserialize, Serialize};

/// A configured project: one local repository wired to one Linear team and
/// one GitHub repo. Created and updated by config sync, referenced by issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub local_path: String,
    pub github_owner: String,
    pub github_repo: String,
    pub linear_team_id: String,
    pub linear_assignee_id: String,
    pub linear_project_id: Option<String>,
    pub linear_label: Option<String>,
    pub default_base_branch: String,
    pub branch_prefix: String,
    pub max_iterations: i64,
    pub ralph_config_path: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Queued,
    Refining,
    Approved,
    Building,
    InReview,
    AddressingFeedback,
    FixingChecks,
    Completed,
    Failed,
    Paused,
    Dismissed,
}

impl IssueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Refining => "refining",
            Self::Approved => "approved",
            Self::Building => "building",
            Self::InReview => "in_review",
            Self::AddressingFeedback => "addressing_feedback",
            Self::FixingChecks => "fixing_checks",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Dismissed => "dismissed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "queued" => Ok(Self::Queued),
            "refining" => Ok(Self::Refining),
            "approved" => Ok(Self::Approved),
            "building" => Ok(Self::Building),
            "in_review" => Ok(Self::InReview),
            "addressing_feedback" => Ok(Self::AddressingFeedback),
            "fixing_checks" => Ok(Self::FixingChecks),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "dismissed" => Ok(Self::Dismissed),
            _ => Err(format!("Invalid issue state: {}", s)),
        }
    }

    /// Sticky terminal states: a build failure observed after one of these
    /// must not overwrite it.
    pub fn is_sticky_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Paused | Self::Dismissed)
    }

    /// States counted as "active" for capacity reporting.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Completed | Self::Failed | Self::Dismissed)
    }
}

/// One tracked work item, mirrored from the external tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub project_id: i64,
    pub tracker_issue_id: String,
    pub identifier: String,
    pub title: String,
    pub description: String,
    pub state: IssueState,
    pub plan_text: String,
    pub workspace_name: String,
    pub branch_name: String,
    pub pr_number: i64,
    pub pr_url: String,
    pub last_comment_id: String,
    pub last_review_id: String,
    pub last_check_sha: String,
    pub check_fix_attempts: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub error_message: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Filter for issue listing. `states` is a disjunction.
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub project_id: Option<i64>,
    pub state: Option<IssueState>,
    pub states: Option<Vec<IssueState>>,
}

/// One append-only activity log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub issue_id: i64,
    pub event_type: String,
    pub from_state: String,
    pub to_state: String,
    pub detail: String,
    pub created_at: String,
}

// Activity event types. Free strings in the schema; constants here so call
// sites and queries agree.
pub const EVENT_INGESTED: &str = "ingested";
pub const EVENT_STATE_CHANGE: &str = "state_change";
pub const EVENT_AI_INVOCATION: &str = "ai_invocation";
pub const EVENT_AI_REFINEMENT: &str = "ai_refinement";
pub const EVENT_APPROVAL_DETECTED: &str = "approval_detected";
pub const EVENT_REPLY_RECEIVED: &str = "reply_received";
pub const EVENT_PLAN_ITERATION: &str = "plan_iteration";
pub const EVENT_WORKSPACE_CREATED: &str = "workspace_created";
pub const EVENT_PR_CREATED: &str = "pr_created";
pub const EVENT_CHANGES_REQUESTED: &str = "changes_requested";
pub const EVENT_PR_MERGED: &str = "pr_merged";
pub const EVENT_BUILD: &str = "build_event";
pub const EVENT_BUILD_COMPLETED: &str = "build_completed";
pub const EVENT_BUILD_FAILED: &str = "build_failed";
pub const EVENT_MERGE_CONFLICT: &str = "merge_conflict";
pub const EVENT_REBASE_START: &str = "rebase_start";
pub const EVENT_REBASE_FINISH: &str = "rebase_finish";
pub const EVENT_ACTION_FAILED: &str = "action_failed";
pub const EVENT_WARNING: &str = "warning";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_state_round_trips_through_strings() {
        let all = [
            IssueState::Queued,
            IssueState::Refining,
            IssueState::Approved,
            IssueState::Building,
            IssueState::InReview,
            IssueState::AddressingFeedback,
            IssueState::FixingChecks,
            IssueState::Completed,
            IssueState::Failed,
            IssueState::Paused,
            IssueState::Dismissed,
        ];
        for state in all {
            assert_eq!(IssueState::from_str(state.as_str()), Ok(state));
        }
        assert!(IssueState::from_str("bogus").is_err());
    }

    #[test]
    fn sticky_terminals_are_exactly_completed_paused_dismissed() {
        assert!(IssueState::Completed.is_sticky_terminal());
        assert!(IssueState::Paused.is_sticky_terminal());
        assert!(IssueState::Dismissed.is_sticky_terminal());
        assert!(!IssueState::Failed.is_sticky_terminal());
        assert!(!IssueState::Building.is_sticky_terminal());
    }

    #[test]
    fn active_excludes_completed_failed_dismissed() {
        assert!(IssueState::Paused.is_active());
        assert!(IssueState::Building.is_active());
        assert!(!IssueState::Completed.is_active());
        assert!(!IssueState::Failed.is_active());
        assert!(!IssueState::Dismissed.is_active());
    }
}
