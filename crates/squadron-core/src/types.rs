use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Agent lifecycle ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Created,
    Active,
    Sleeping,
    Completed,
    Escalated,
    Failed,
    Cancelled,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Sleeping => "sleeping",
            Self::Completed => "completed",
            Self::Escalated => "escalated",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => Self::Created,
            "active" => Self::Active,
            "sleeping" => Self::Sleeping,
            "completed" => Self::Completed,
            "escalated" => Self::Escalated,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            other => anyhow::bail!("unknown agent status {other:?}"),
        })
    }
}

/// A single agent's full lifecycle record. One row per spawned agent,
/// never deleted except by explicit cascading delete of its pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: i64,
    pub role: String,
    pub issue_number: Option<i64>,
    pub pr_number: Option<i64>,
    pub session_id: Option<String>,
    pub status: AgentStatus,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    /// Issue/PR numbers this agent is blocked on. Agent stays `sleeping`
    /// until this set is empty.
    pub blocked_by: BTreeSet<i64>,
    pub iteration_count: i64,
    pub tool_call_count: i64,
    pub turn_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active_since: Option<DateTime<Utc>>,
    pub sleeping_since: Option<DateTime<Utc>>,
}

impl AgentRecord {
    pub fn new(agent_id: i64, role: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id,
            role: role.into(),
            issue_number: None,
            pr_number: None,
            session_id: None,
            status: AgentStatus::Created,
            branch: None,
            worktree_path: None,
            blocked_by: BTreeSet::new(),
            iteration_count: 0,
            tool_call_count: 0,
            turn_count: 0,
            created_at: now,
            updated_at: now,
            active_since: None,
            sleeping_since: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrApprovalState {
    Approved,
    ChangesRequested,
}

impl PrApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
        }
    }
}

impl std::str::FromStr for PrApprovalState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "approved" => Self::Approved,
            "changes_requested" => Self::ChangesRequested,
            other => anyhow::bail!("unknown pr approval state {other:?}"),
        })
    }
}

// ── Mail ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageProvenance {
    IssueComment,
    PrComment,
}

impl MessageProvenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IssueComment => "issue_comment",
            Self::PrComment => "pr_comment",
        }
    }
}

/// A piece of mail routed to a sleeping or active agent's inbox. Mail is
/// drained once: a single read of the queue empties it (push-delivered
/// semantics, no re-read).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub sender: String,
    pub body: String,
    pub provenance: MessageProvenance,
    pub received_at: DateTime<Utc>,
}

// ── Events ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SquadronEventType {
    IssueOpened,
    IssueComment,
    IssueClosed,
    IssueLabeled,
    PullRequestOpened,
    PullRequestSynchronize,
    PullRequestClosed,
    PullRequestComment,
    PullRequestReviewSubmitted,
    PullRequestReviewCommentCreated,
    CheckSuiteCompleted,
    WorkflowRunCompleted,
    Unknown,
}

impl SquadronEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IssueOpened => "issue_opened",
            Self::IssueComment => "issue_comment",
            Self::IssueClosed => "issue_closed",
            Self::IssueLabeled => "issue_labeled",
            Self::PullRequestOpened => "pull_request_opened",
            Self::PullRequestSynchronize => "pull_request_synchronize",
            Self::PullRequestClosed => "pull_request_closed",
            Self::PullRequestComment => "pull_request_comment",
            Self::PullRequestReviewSubmitted => "pull_request_review_submitted",
            Self::PullRequestReviewCommentCreated => "pull_request_review_comment_created",
            Self::CheckSuiteCompleted => "check_suite_completed",
            Self::WorkflowRunCompleted => "workflow_run_completed",
            Self::Unknown => "unknown",
        }
    }
}

/// A webhook delivery, already parsed and enriched by the Event Router.
/// `dedup_key` is the GitHub delivery ID and is unique per delivery;
/// retried deliveries carry the same ID and are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SquadronEvent {
    pub dedup_key: String,
    pub event_type: SquadronEventType,
    pub action: Option<String>,
    pub sender: String,
    pub is_bot_sender: bool,
    pub repo_full_name: String,
    pub issue_number: Option<i64>,
    pub pr_number: Option<i64>,
    pub comment_body: Option<String>,
    pub comment_id: Option<i64>,
    pub review_state: Option<String>,
    pub label: Option<String>,
    pub branch: Option<String>,
    pub raw: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

// ── Command parsing ──────────────────────────────────────────────────────

/// Result of parsing a single comment/issue body for a Squadron command or
/// mention. Either `action_name` (a built-in verb like `status`/`cancel`/
/// `retry`) or `agent_name` (a role to route to) is set, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedCommand {
    pub action_name: Option<String>,
    pub agent_name: Option<String>,
    pub message: Option<String>,
    pub mentioned_roles: Vec<String>,
}

impl ParsedCommand {
    pub fn is_action(&self) -> bool {
        self.action_name.is_some()
    }
}
