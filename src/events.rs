//! Streamed agent events and the in-memory event bus.
//!
//! Events from the AI agent and build runner are rendered to one-line detail
//! strings, persisted to the activity log first, then broadcast to live
//! subscribers. Delivery is best-effort: slow or absent subscribers never
//! block a worker.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event kinds forwarded from the AI agent and build runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ToolUse {
        name: String,
        detail: String,
    },
    IterationStart {
        iteration: u32,
        max: u32,
    },
    StoryStarted {
        story_id: String,
        title: String,
    },
    QaPhaseStarted {
        phase: String,
    },
    LogMessage {
        level: String,
        message: String,
    },
    AgentText {
        text: String,
    },
    InvocationDone {
        num_turns: u32,
        duration_ms: u64,
    },
}

impl AgentEvent {
    /// Render to the one-line detail string stored as a `build_event`.
    pub fn detail(&self) -> String {
        match self {
            Self::ToolUse { name, detail } => format!("{}: {}", name, truncate(detail, 120)),
            Self::IterationStart { iteration, max } => {
                format!("iteration {}/{}", iteration, max)
            }
            Self::StoryStarted { story_id, title } => {
                format!("story {}: {}", story_id, truncate(title, 100))
            }
            Self::QaPhaseStarted { phase } => format!("qa phase: {}", phase),
            Self::LogMessage { level, message } => {
                format!("[{}] {}", level, truncate(message, 160))
            }
            Self::AgentText { text } => truncate(first_line(text), 160),
            Self::InvocationDone {
                num_turns,
                duration_ms,
            } => format!(
                "done: {} turns in {:.1}s",
                num_turns,
                *duration_ms as f64 / 1000.0
            ),
        }
    }
}

/// One bus notification: an activity row that was just persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityNotice {
    pub issue_id: i64,
    pub event_type: String,
    pub detail: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl ActivityNotice {
    pub fn now(issue_id: i64, event_type: &str, detail: String) -> Self {
        Self {
            issue_id,
            event_type: event_type.to_string(),
            detail,
            at: chrono::Utc::now(),
        }
    }
}

/// Fan-out notifier for live consumers. Lagging receivers drop messages;
/// the persisted activity log remains the record.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ActivityNotice>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, notice: ActivityNotice) {
        let _ = self.tx.send(notice); // Ignore error if no receivers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivityNotice> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
