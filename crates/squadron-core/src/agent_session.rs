//! The seam between the Agent Manager and a concrete coding-agent backend.
//! No concrete implementation lives in this crate — `squadron-agent`
//! provides the Claude Code-backed one; tests use an in-memory double.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a framework tool call should do to the agent's turn once it
/// returns. Distinct from the tool's own success/failure — a tool can
/// succeed and still ask the turn to suspend (`report_blocked`) or end
/// (`report_complete`, `escalate_to_human`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutcome {
    Continue,
    Suspend { reason: String },
    Complete,
    Escalate { reason: String },
}

/// Decision returned by the pre-tool-use hook, consulted before a tool call
/// is allowed to run. Circuit breakers (`L1` tool-count, `L2` duration)
/// deny here rather than letting the call through and cleaning up after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreToolUseDecision {
    Allow,
    Deny { reason: String },
}

/// One model turn's result: the text the agent produced plus whatever
/// `ToolOutcome` its last framework tool call requested.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub output_text: String,
    pub session_id: Option<String>,
    pub outcome: ToolOutcome,
    pub tool_call_count: u32,
}

/// A single conversation with a coding-agent CLI, scoped to one worktree.
/// `create` starts a fresh session; `resume` reattaches to a prior one by
/// session id (used when waking a sleeping agent or routing a mention to
/// an already-spawned one).
#[async_trait]
pub trait AgentSession: Send + Sync {
    async fn create(&self, worktree_path: &str, instruction: &str) -> Result<TurnResult>;

    async fn resume(&self, worktree_path: &str, session_id: &str, instruction: &str) -> Result<TurnResult>;

    /// Sends a follow-up message on an already-open session and waits for
    /// the agent's next turn to finish (mail delivery, mention routing).
    async fn send_and_wait(&self, worktree_path: &str, session_id: &str, message: &str) -> Result<TurnResult> {
        self.resume(worktree_path, session_id, message).await
    }

    /// Tears down whatever process/container backs a session. A no-op for
    /// backends with nothing to clean up.
    async fn delete(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }

    /// Consulted by the Agent Manager before forwarding a tool call to the
    /// backend; implementations that can't intercept tool calls (a CLI
    /// backend speaking stream-json) may always return `Allow` and let the
    /// Agent Manager's own circuit breakers do the denying instead.
    fn pre_tool_use(&self, _tool_name: &str) -> PreToolUseDecision {
        PreToolUseDecision::Allow
    }
}

/// Creates worktrees for spawned agents and tears them down on completion.
/// Grounded in `git.rs`'s CLI wrapper; kept as its own trait so the Agent
/// Manager can be tested without touching the filesystem.
#[async_trait]
pub trait WorktreeProvisioner: Send + Sync {
    async fn create_worktree(&self, agent_id: i64, role: &str, base_branch: &str) -> Result<(String, String)>;
    async fn remove_worktree(&self, worktree_path: &str, branch: &str) -> Result<()>;
}
