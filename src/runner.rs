//! Subprocess-backed implementations of the AI agent contracts.
//!
//! `AgentCli` runs one bounded agentic invocation of the external coding
//! agent (`claude --print --output-format stream-json`), streaming events as
//! they arrive. `BuildCli` runs the external build runner and forwards its
//! JSON event lines into the caller's event sink.

use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::clients::{BuildRequest, BuildRunner, EventSink, InvokeOutcome, InvokeRequest, Invoker};
use crate::errors::Cancelled;
use crate::events::AgentEvent;

/// Events from the agent CLI's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        num_turns: u32,
        #[serde(default)]
        usage: Option<Usage>,
    },

    #[serde(rename = "system")]
    System {},

    #[serde(rename = "user")]
    User {},
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

/// Extract a short description from a tool-use input for the event stream.
fn describe_tool_input(input: &Value) -> String {
    for key in ["file_path", "command", "pattern", "description"] {
        if let Some(v) = input.get(key).and_then(Value::as_str) {
            return v.to_string();
        }
    }
    String::new()
}

/// Runs the external coding agent CLI for one bounded invocation.
pub struct AgentCli {
    command: String,
    skip_permissions: bool,
}

impl AgentCli {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            skip_permissions: true,
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("AUTORALPH_AGENT_CMD").unwrap_or_else(|_| "claude".to_string()))
    }

    fn build_command(&self, req: &InvokeRequest) -> Command {
        let mut cmd = Command::new(&self.command);
        if self.skip_permissions {
            cmd.arg("--dangerously-skip-permissions");
        }
        cmd.arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--max-turns")
            .arg(req.max_turns.to_string());
        if let Some(dir) = &req.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }
}

#[async_trait]
impl Invoker for AgentCli {
    async fn invoke(
        &self,
        cancel: &CancellationToken,
        req: InvokeRequest,
    ) -> Result<InvokeOutcome> {
        let start = Instant::now();
        let mut child = self
            .build_command(&req)
            .spawn()
            .context("Failed to spawn agent process")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(req.prompt.as_bytes())
                .await
                .context("Failed to write prompt to agent stdin")?;
            stdin.shutdown().await.context("Failed to close stdin")?;
        }

        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let mut lines = BufReader::new(stdout).lines();

        let mut accumulated = String::new();
        let mut final_result: Option<String> = None;
        let mut is_error = false;
        let mut num_turns = 0u32;
        let mut usage = Usage::default();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line.context("Failed to read agent output")?,
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(anyhow::Error::new(Cancelled));
                }
            };
            let Some(line) = line else { break };
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamEvent>(&line) {
                Ok(StreamEvent::Assistant { message }) => {
                    for block in message.content {
                        match block {
                            ContentBlock::Text { text } => {
                                accumulated.push_str(&text);
                                accumulated.push('\n');
                            }
                            ContentBlock::ToolUse { name, input } => {
                                tracing::debug!(
                                    tool = %name,
                                    detail = %describe_tool_input(&input),
                                    "agent tool use"
                                );
                            }
                        }
                    }
                }
                Ok(StreamEvent::Result {
                    result,
                    is_error: err,
                    num_turns: turns,
                    usage: u,
                }) => {
                    final_result = result;
                    is_error = err;
                    num_turns = turns;
                    usage = u.unwrap_or_default();
                }
                Ok(StreamEvent::System {}) | Ok(StreamEvent::User {}) => {}
                Err(_) => {
                    // Not stream JSON; keep it as plain output.
                    accumulated.push_str(&line);
                    accumulated.push('\n');
                }
            }
        }

        let status = child.wait().await.context("Failed to wait for agent")?;
        let text = final_result.unwrap_or(accumulated);
        if is_error || !status.success() {
            anyhow::bail!(
                "Agent invocation failed (exit {:?}): {}",
                status.code(),
                text.lines().last().unwrap_or("")
            );
        }
        Ok(InvokeOutcome {
            text,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            num_turns,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Runs the external build runner, forwarding its JSON event lines.
pub struct BuildCli {
    command: String,
}

impl BuildCli {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("AUTORALPH_BUILD_CMD").unwrap_or_else(|_| "ralph".to_string()))
    }
}

/// Parse one runner output line into an event. Non-JSON lines become
/// info-level log messages so progress is never silently dropped.
fn parse_runner_line(line: &str) -> Option<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(event) = serde_json::from_str::<AgentEvent>(trimmed) {
        return Some(event);
    }
    Some(AgentEvent::LogMessage {
        level: "info".to_string(),
        message: trimmed.to_string(),
    })
}

#[async_trait]
impl BuildRunner for BuildCli {
    async fn run(
        &self,
        cancel: &CancellationToken,
        req: BuildRequest,
        events: EventSink,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("build")
            .arg("--max-iterations")
            .arg(req.max_iterations.to_string())
            .arg("--workspace")
            .arg(&req.workspace_dir)
            .current_dir(&req.tree_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(knowledge) = &req.knowledge_dir {
            cmd.arg("--knowledge").arg(knowledge);
        }

        let mut child = cmd.spawn().context("Failed to spawn build runner")?;
        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line.context("Failed to read runner output")?,
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(anyhow::Error::new(Cancelled));
                }
            };
            let Some(line) = line else { break };
            if let Some(event) = parse_runner_line(&line) {
                events(event);
            }
        }

        let status = child.wait().await.context("Failed to wait for runner")?;
        if !status.success() {
            anyhow::bail!("Build runner exited with code {:?}", status.code());
        }
        Ok(())
    }
}
