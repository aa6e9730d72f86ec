//! Append-only activity feed. Every lifecycle, tool-call and GitHub
//! interaction an agent has is recorded here for the dashboard's timeline
//! and SSE stream; storage is the `agent_activity` table owned by
//! [`Registry`], this module just adds the taxonomy and the fan-out.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::registry::{ActivityRow, AgentActivityStats, Registry};

/// The full event taxonomy an agent's run can emit. Stored as its
/// lowercase `snake_case` name in `agent_activity.event_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityEventType {
    SessionCreated,
    SessionResumed,
    PromptReady,
    ModelRequestStarted,
    ModelRequestCompleted,
    ToolCallStarted,
    ToolCallCompleted,
    AgentHeartbeat,
    AgentSlept,
    AgentWoke,
    AgentCompleted,
    AgentEscalated,
    AgentFailed,
    CircuitBreakerWarning,
    CircuitBreakerTriggered,
    GithubCommentPosted,
    GithubPrOpened,
    GithubReviewSubmitted,
    GithubLabelApplied,
    ReasoningStep,
}

impl ActivityEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::SessionResumed => "session_resumed",
            Self::PromptReady => "prompt_ready",
            Self::ModelRequestStarted => "model_request_started",
            Self::ModelRequestCompleted => "model_request_completed",
            Self::ToolCallStarted => "tool_call_started",
            Self::ToolCallCompleted => "tool_call_completed",
            Self::AgentHeartbeat => "agent_heartbeat",
            Self::AgentSlept => "agent_slept",
            Self::AgentWoke => "agent_woke",
            Self::AgentCompleted => "agent_completed",
            Self::AgentEscalated => "agent_escalated",
            Self::AgentFailed => "agent_failed",
            Self::CircuitBreakerWarning => "circuit_breaker_warning",
            Self::CircuitBreakerTriggered => "circuit_breaker_triggered",
            Self::GithubCommentPosted => "github_comment_posted",
            Self::GithubPrOpened => "github_pr_opened",
            Self::GithubReviewSubmitted => "github_review_submitted",
            Self::GithubLabelApplied => "github_label_applied",
            Self::ReasoningStep => "reasoning_step",
        }
    }
}

/// A single recorded event, shaped for the SSE wire as well as the
/// persisted row.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    pub id: i64,
    pub agent_id: Option<i64>,
    pub event_type: String,
    pub summary: String,
    pub detail: Option<String>,
    pub tool_name: Option<String>,
    pub tool_result: Option<String>,
    pub metadata: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<ActivityRow> for ActivityEvent {
    fn from(r: ActivityRow) -> Self {
        Self {
            id: r.id,
            agent_id: r.agent_id,
            event_type: r.event_type,
            summary: r.summary,
            detail: r.detail,
            tool_name: r.tool_name,
            tool_result: r.tool_result,
            metadata: r.metadata,
            timestamp: r.timestamp,
        }
    }
}

/// Builder-style set of optional fields attached to a single recorded
/// event. Most call sites only need `summary`.
#[derive(Debug, Clone, Default)]
pub struct ActivityDetail {
    pub detail: Option<String>,
    pub tool_name: Option<String>,
    pub tool_result: Option<String>,
    pub metadata: serde_json::Value,
}

/// Appends events to the registry's `agent_activity` table and fans them
/// out to dashboard subscribers over a bounded broadcast channel. Cloning
/// is cheap; every clone shares the same backing channel and registry.
#[derive(Clone)]
pub struct ActivityLog {
    registry: Arc<Registry>,
    tx: broadcast::Sender<ActivityEvent>,
}

impl ActivityLog {
    pub fn new(registry: Arc<Registry>) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { registry, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.tx.subscribe()
    }

    pub fn record(
        &self,
        agent_id: Option<i64>,
        event_type: ActivityEventType,
        summary: impl Into<String>,
        detail: ActivityDetail,
    ) -> Result<i64> {
        let metadata = if detail.metadata.is_null() {
            serde_json::json!({})
        } else {
            detail.metadata
        };
        let summary = summary.into();
        let id = self.registry.append_activity(
            agent_id,
            event_type.as_str(),
            &summary,
            detail.detail.as_deref(),
            detail.tool_name.as_deref(),
            detail.tool_result.as_deref(),
            &metadata,
        )?;
        let event = ActivityEvent {
            id,
            agent_id,
            event_type: event_type.as_str().to_string(),
            summary,
            detail: detail.detail,
            tool_name: detail.tool_name,
            tool_result: detail.tool_result,
            metadata,
            timestamp: chrono::Utc::now(),
        };
        // Dashboard may have no subscribers; a send error here just means
        // nobody's listening right now.
        let _ = self.tx.send(event);
        Ok(id)
    }

    pub fn agent_activity(&self, agent_id: i64, limit: i64) -> Result<Vec<ActivityEvent>> {
        Ok(self
            .registry
            .get_agent_activity(agent_id, limit)?
            .into_iter()
            .map(ActivityEvent::from)
            .collect())
    }

    pub fn recent(&self, limit: i64) -> Result<Vec<ActivityEvent>> {
        Ok(self
            .registry
            .get_recent_activity(limit)?
            .into_iter()
            .map(ActivityEvent::from)
            .collect())
    }

    pub fn agent_stats(&self, agent_id: i64) -> Result<AgentActivityStats> {
        self.registry.get_agent_stats(agent_id)
    }

    pub fn prune_older_than(&self, retain_days: i64) -> Result<usize> {
        self.registry.prune_old_activity(retain_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> ActivityLog {
        ActivityLog::new(Arc::new(Registry::open(":memory:").expect("open")))
    }

    #[test]
    fn record_and_read_round_trips() {
        let log = log();
        log.record(
            Some(1),
            ActivityEventType::AgentHeartbeat,
            "still working",
            ActivityDetail::default(),
        )
        .expect("record");
        let rows = log.agent_activity(1, 10).expect("read");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "agent_heartbeat");
    }

    #[test]
    fn subscribers_receive_broadcast() {
        let log = log();
        let mut rx = log.subscribe();
        log.record(None, ActivityEventType::SessionCreated, "hi", ActivityDetail::default())
            .expect("record");
        let event = rx.try_recv().expect("broadcast delivered");
        assert_eq!(event.event_type, "session_created");
    }

    #[test]
    fn stats_count_tool_calls() {
        let log = log();
        log.record(
            Some(2),
            ActivityEventType::ToolCallCompleted,
            "ran a tool",
            ActivityDetail {
                tool_name: Some("report_blocked".into()),
                ..Default::default()
            },
        )
        .expect("record");
        log.record(Some(2), ActivityEventType::AgentHeartbeat, "tick", ActivityDetail::default())
            .expect("record");
        let stats = log.agent_stats(2).expect("stats");
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.tool_calls, 1);
    }
}
