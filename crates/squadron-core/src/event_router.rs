//! Converts raw GitHub webhook payloads into [`SquadronEvent`]s and
//! dispatches them, in delivery order, to every registered handler. Handler
//! failures are isolated: one handler panicking or erroring never stops the
//! others from seeing the event.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::types::{SquadronEvent, SquadronEventType};

/// Bounded LRU-ish dedup cache of delivery IDs already processed. A plain
/// `VecDeque` with a max length is enough here: the only operation we need
/// is "is this ID in the last N we've seen", evicting the oldest.
struct DedupCache {
    seen: VecDeque<String>,
    capacity: usize,
}

impl DedupCache {
    fn new(capacity: usize) -> Self {
        Self { seen: VecDeque::with_capacity(capacity), capacity }
    }

    /// Returns `true` if `key` was already seen (and should be dropped).
    fn check_and_insert(&mut self, key: &str) -> bool {
        if self.seen.iter().any(|k| k == key) {
            return true;
        }
        if self.seen.len() >= self.capacity {
            self.seen.pop_front();
        }
        self.seen.push_back(key.to_string());
        false
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &SquadronEvent) -> Result<()>;
    fn name(&self) -> &str;
}

pub struct EventRouter {
    dedup: Mutex<DedupCache>,
    handlers: Mutex<Vec<std::sync::Arc<dyn EventHandler>>>,
    queue_tx: mpsc::Sender<serde_json::Value>,
}

/// Maps a GitHub `(event, action)` pair to Squadron's internal event type.
fn convert_event_type(github_event: &str, action: Option<&str>) -> SquadronEventType {
    match (github_event, action.unwrap_or("")) {
        ("issues", "opened") => SquadronEventType::IssueOpened,
        ("issues", "closed") => SquadronEventType::IssueClosed,
        ("issues", "labeled") => SquadronEventType::IssueLabeled,
        ("issue_comment", _) => SquadronEventType::IssueComment,
        ("pull_request", "opened") => SquadronEventType::PullRequestOpened,
        ("pull_request", "synchronize") => SquadronEventType::PullRequestSynchronize,
        ("pull_request", "closed") => SquadronEventType::PullRequestClosed,
        ("pull_request_review", "submitted") => SquadronEventType::PullRequestReviewSubmitted,
        ("pull_request_review_comment", _) => SquadronEventType::PullRequestReviewCommentCreated,
        ("check_suite", "completed") => SquadronEventType::CheckSuiteCompleted,
        ("workflow_run", "completed") => SquadronEventType::WorkflowRunCompleted,
        _ => SquadronEventType::Unknown,
    }
}

/// `pull_request` rows on `issue_comment` payloads are sparse; this falls
/// back to parsing the PR number out of `issue.pull_request.url` when the
/// top-level `issue.number` field alone doesn't disambiguate issue vs PR.
fn pull_request_number_from_url(url: &str) -> Option<i64> {
    let re = Regex::new(r"/pulls/(\d+)$").expect("valid regex");
    re.captures(url)?.get(1)?.as_str().parse().ok()
}

impl EventRouter {
    pub fn new(dedup_capacity: usize, queue_tx: mpsc::Sender<serde_json::Value>) -> Self {
        Self {
            dedup: Mutex::new(DedupCache::new(dedup_capacity)),
            handlers: Mutex::new(Vec::new()),
            queue_tx,
        }
    }

    pub fn register(&self, handler: std::sync::Arc<dyn EventHandler>) {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).push(handler);
    }

    /// Accepts a raw webhook delivery for later processing via `process_queued`,
    /// respecting the bounded queue's backpressure.
    pub async fn enqueue_raw(&self, delivery_id: &str, github_event: &str, payload: serde_json::Value) -> Result<()> {
        let envelope = serde_json::json!({
            "delivery_id": delivery_id,
            "github_event": github_event,
            "payload": payload,
        });
        self.queue_tx
            .send(envelope)
            .await
            .map_err(|_| anyhow::anyhow!("event queue closed"))
    }

    /// Parses a raw envelope (as produced by `enqueue_raw`) into a
    /// [`SquadronEvent`], deduplicating by delivery ID. `None` is returned
    /// for a dropped duplicate.
    pub fn parse_and_dedup(&self, envelope: &serde_json::Value) -> Option<SquadronEvent> {
        let delivery_id = envelope.get("delivery_id")?.as_str()?.to_string();
        {
            let mut dedup = self.dedup.lock().unwrap_or_else(|e| e.into_inner());
            if dedup.check_and_insert(&delivery_id) {
                return None;
            }
        }

        let github_event = envelope.get("github_event")?.as_str()?.to_string();
        let payload = envelope.get("payload")?.clone();
        let action = payload.get("action").and_then(|v| v.as_str()).map(str::to_string);
        let sender = payload
            .get("sender")
            .and_then(|s| s.get("login"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let is_bot_sender = payload
            .get("sender")
            .and_then(|s| s.get("type"))
            .and_then(|v| v.as_str())
            .map(|t| t.eq_ignore_ascii_case("bot"))
            .unwrap_or(false);
        let repo_full_name = payload
            .get("repository")
            .and_then(|r| r.get("full_name"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let issue = payload.get("issue");
        let mut issue_number = issue.and_then(|i| i.get("number")).and_then(|v| v.as_i64());
        let mut pr_number = payload
            .get("pull_request")
            .and_then(|p| p.get("number"))
            .and_then(|v| v.as_i64());

        // `issue_comment` on a PR: GitHub sets `issue.pull_request.url` but
        // not a top-level `pull_request` object. Fall back to parsing the
        // PR number out of that URL so comment routing still lands on the
        // PR-scoped handler instead of the issue-scoped one.
        if pr_number.is_none() {
            if let Some(pr_url) = issue
                .and_then(|i| i.get("pull_request"))
                .and_then(|p| p.get("url"))
                .and_then(|v| v.as_str())
            {
                pr_number = pull_request_number_from_url(pr_url);
                issue_number = None;
            }
        }

        let comment_body = payload
            .get("comment")
            .and_then(|c| c.get("body"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let comment_id = payload.get("comment").and_then(|c| c.get("id")).and_then(|v| v.as_i64());
        let review_state = payload
            .get("review")
            .and_then(|r| r.get("state"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let label = payload
            .get("label")
            .and_then(|l| l.get("name"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let branch = payload
            .get("pull_request")
            .and_then(|p| p.get("head"))
            .and_then(|h| h.get("ref"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Some(SquadronEvent {
            dedup_key: delivery_id,
            event_type: convert_event_type(&github_event, action.as_deref()),
            action,
            sender,
            is_bot_sender,
            repo_full_name,
            issue_number,
            pr_number,
            comment_body,
            comment_id,
            review_state,
            label,
            branch,
            raw: payload,
            received_at: Utc::now(),
        })
    }

    /// Dispatches one event to every registered handler in registration
    /// order. Per spec, there is no sender filtering here: bot-authored
    /// events are dispatched the same as human ones, so that e.g. a
    /// REQUEST_CHANGES review left by a bot reviewer still re-opens work.
    pub async fn dispatch(&self, event: &SquadronEvent) {
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if handlers.is_empty() {
            warn!(dedup_key = %event.dedup_key, "no event handlers registered");
            return;
        }
        for handler in handlers {
            if let Err(err) = handler.handle(event).await {
                error!(handler = handler.name(), error = %err, "event handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_drops_repeat_delivery() {
        let (tx, _rx) = mpsc::channel(8);
        let router = EventRouter::new(128, tx);
        let envelope = serde_json::json!({
            "delivery_id": "abc-123",
            "github_event": "issues",
            "payload": {"action": "opened", "sender": {"login": "alice", "type": "User"}},
        });
        assert!(router.parse_and_dedup(&envelope).is_some());
        assert!(router.parse_and_dedup(&envelope).is_none());
    }

    #[test]
    fn pull_request_url_fallback_extracts_number() {
        assert_eq!(
            pull_request_number_from_url("https://api.github.com/repos/o/r/pulls/42"),
            Some(42)
        );
    }

    #[test]
    fn bot_sender_is_not_filtered() {
        let (tx, _rx) = mpsc::channel(8);
        let router = EventRouter::new(128, tx);
        let envelope = serde_json::json!({
            "delivery_id": "bot-1",
            "github_event": "pull_request_review",
            "payload": {
                "action": "submitted",
                "sender": {"login": "some-bot", "type": "Bot"},
                "review": {"state": "changes_requested"},
            },
        });
        let event = router.parse_and_dedup(&envelope).unwrap();
        assert!(event.is_bot_sender);
        assert_eq!(event.review_state.as_deref(), Some("changes_requested"));
    }
}
