//! The GitHub wire client is an external collaborator: webhook signature
//! verification, REST calls, JWT→installation-token exchange and
//! rate-limit bookkeeping all live behind this trait. No networked
//! implementation ships in this crate — callers inject one (or a test
//! double) at the composition root.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrApprovalInfo {
    pub approver: String,
    pub role: Option<String>,
    pub is_human: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewInfo {
    pub reviewer: String,
    pub state: String,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusContext {
    pub context: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedStatus {
    pub overall_state: String,
    pub contexts: Vec<StatusContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestInfo {
    pub number: i64,
    pub title: String,
    pub base_branch: String,
    pub head_branch: String,
    pub mergeable_state: Option<String>,
    pub author: String,
    pub author_is_bot: bool,
}

/// Enough of an open issue for Recovery's label → role inference; avoids
/// forcing a second round-trip just to read the issue's own labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueSummary {
    pub number: i64,
    pub labels: Vec<String>,
}

/// Rate-limit headroom as tracked from the last response's
/// `X-RateLimit-Remaining`/`X-RateLimit-Reset` headers. Callers serialize
/// and sleep once `remaining` drops below a reserve (50 per spec §5).
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitStatus {
    pub remaining: u32,
    pub reset_unix: i64,
}

#[async_trait]
pub trait GitHubClient: Send + Sync {
    async fn get_pr_approvals(&self, owner: &str, repo: &str, pr_number: i64) -> Result<Vec<PrApprovalInfo>>;
    async fn get_pr_reviews(&self, owner: &str, repo: &str, pr_number: i64) -> Result<Vec<ReviewInfo>>;
    async fn get_pull_request(&self, owner: &str, repo: &str, pr_number: i64) -> Result<PullRequestInfo>;
    async fn get_pull_request_labels(&self, owner: &str, repo: &str, pr_number: i64) -> Result<Vec<String>>;
    async fn get_issue_labels(&self, owner: &str, repo: &str, issue_number: i64) -> Result<Vec<String>>;
    async fn get_combined_status(&self, owner: &str, repo: &str, pr_number: i64) -> Result<CombinedStatus>;

    /// Open issues carrying at least one lifecycle label. Recovery Phase 2
    /// uses this to reconstruct agent records after a restart; a non-GitHub
    /// test double may simply return an empty list.
    async fn list_open_issues(&self, owner: &str, repo: &str) -> Result<Vec<IssueSummary>>;
    /// Open pull requests, used the same way as `list_open_issues` but
    /// matched against configured branch prefixes instead of labels.
    async fn list_open_pull_requests(&self, owner: &str, repo: &str) -> Result<Vec<PullRequestInfo>>;

    async fn post_issue_comment(&self, owner: &str, repo: &str, issue_number: i64, body: &str) -> Result<i64>;
    async fn add_labels(&self, owner: &str, repo: &str, issue_number: i64, labels: &[String]) -> Result<()>;
    async fn create_issue(&self, owner: &str, repo: &str, title: &str, body: &str) -> Result<i64>;
    async fn open_pull_request(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<i64>;
    /// Submits a review; implementations fall back to a plain issue comment
    /// (HTTP 403 from the review endpoint, e.g. a bot author reviewing
    /// their own PR) when the review API rejects the call.
    async fn submit_pr_review(&self, owner: &str, repo: &str, pr_number: i64, event: &str, body: &str) -> Result<()>;

    fn rate_limit_status(&self) -> RateLimitStatus;
}
