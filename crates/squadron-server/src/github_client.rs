//! Thin REST implementation of [`GitHubClient`] over `reqwest`. Auth is a
//! single pre-obtained bearer token (a classic PAT, or an installation
//! token minted by whatever process runs ahead of this one) — per the
//! crate's stated scope, the JWT→installation-token exchange itself is not
//! implemented here; operators supply a token directly via `GITHUB_TOKEN`
//! (a classic PAT, or an installation token minted out of band) and refresh
//! it themselves.

use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use squadron_core::github::{
    CombinedStatus, GitHubClient, IssueSummary, PrApprovalInfo, PullRequestInfo, RateLimitStatus,
    ReviewInfo, StatusContext,
};
use tracing::warn;

pub struct RestGitHubClient {
    http: Client,
    token: String,
    rate_limit: Mutex<RateLimitStatus>,
}

impl RestGitHubClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            token: token.into(),
            rate_limit: Mutex::new(RateLimitStatus::default()),
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", "squadron-server")
    }

    fn note_rate_limit(&self, response: &reqwest::Response) {
        let remaining = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let reset_unix = response
            .headers()
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        if let (Some(remaining), Some(reset_unix)) = (remaining, reset_unix) {
            *self.rate_limit.lock().unwrap_or_else(|e| e.into_inner()) = RateLimitStatus { remaining, reset_unix };
        }
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let response = self.request(reqwest::Method::GET, url).send().await?;
        self.note_rate_limit(&response);
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            bail!("GET {url} returned {status}: {body}");
        }
        serde_json::from_str(&body).context("parsing GitHub response body")
    }

    fn repo_url(owner: &str, repo: &str) -> String {
        format!("https://api.github.com/repos/{owner}/{repo}")
    }
}

fn labels_from(value: &serde_json::Value) -> Vec<String> {
    value
        .get("labels")
        .and_then(|v| v.as_array())
        .map(|labels| {
            labels
                .iter()
                .filter_map(|l| l.get("name").and_then(|n| n.as_str()).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn pull_request_from_json(v: &serde_json::Value) -> PullRequestInfo {
    PullRequestInfo {
        number: v.get("number").and_then(|n| n.as_i64()).unwrap_or_default(),
        title: v.get("title").and_then(|t| t.as_str()).unwrap_or_default().to_string(),
        base_branch: v
            .get("base")
            .and_then(|b| b.get("ref"))
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string(),
        head_branch: v
            .get("head")
            .and_then(|h| h.get("ref"))
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string(),
        mergeable_state: v.get("mergeable_state").and_then(|m| m.as_str()).map(str::to_string),
        author: v
            .get("user")
            .and_then(|u| u.get("login"))
            .and_then(|l| l.as_str())
            .unwrap_or_default()
            .to_string(),
        author_is_bot: v
            .get("user")
            .and_then(|u| u.get("type"))
            .and_then(|t| t.as_str())
            .map(|t| t.eq_ignore_ascii_case("bot"))
            .unwrap_or(false),
    }
}

#[async_trait]
impl GitHubClient for RestGitHubClient {
    async fn get_pr_approvals(&self, owner: &str, repo: &str, pr_number: i64) -> Result<Vec<PrApprovalInfo>> {
        // Role attribution for an approval is a local concept (configured
        // label/role mapping); this client only reports who approved and
        // whether they're a bot, leaving role lookup to the caller.
        Ok(self
            .get_pr_reviews(owner, repo, pr_number)
            .await?
            .into_iter()
            .filter(|r| r.state.eq_ignore_ascii_case("approved"))
            .map(|r| PrApprovalInfo { approver: r.reviewer, role: None, is_human: !r.is_bot })
            .collect())
    }

    async fn get_pr_reviews(&self, owner: &str, repo: &str, pr_number: i64) -> Result<Vec<ReviewInfo>> {
        let url = format!("{}/pulls/{pr_number}/reviews", Self::repo_url(owner, repo));
        let body = self.get_json(&url).await?;
        let reviews = body
            .as_array()
            .context("expected a JSON array of reviews")?
            .iter()
            .map(|r| ReviewInfo {
                reviewer: r.get("user").and_then(|u| u.get("login")).and_then(|l| l.as_str()).unwrap_or_default().to_string(),
                state: r.get("state").and_then(|s| s.as_str()).unwrap_or_default().to_lowercase(),
                is_bot: r
                    .get("user")
                    .and_then(|u| u.get("type"))
                    .and_then(|t| t.as_str())
                    .map(|t| t.eq_ignore_ascii_case("bot"))
                    .unwrap_or(false),
            })
            .collect();
        Ok(reviews)
    }

    async fn get_pull_request(&self, owner: &str, repo: &str, pr_number: i64) -> Result<PullRequestInfo> {
        let url = format!("{}/pulls/{pr_number}", Self::repo_url(owner, repo));
        let body = self.get_json(&url).await?;
        Ok(pull_request_from_json(&body))
    }

    async fn get_pull_request_labels(&self, owner: &str, repo: &str, pr_number: i64) -> Result<Vec<String>> {
        self.get_issue_labels(owner, repo, pr_number).await
    }

    async fn get_issue_labels(&self, owner: &str, repo: &str, issue_number: i64) -> Result<Vec<String>> {
        let url = format!("{}/issues/{issue_number}", Self::repo_url(owner, repo));
        let body = self.get_json(&url).await?;
        Ok(labels_from(&body))
    }

    async fn get_combined_status(&self, owner: &str, repo: &str, pr_number: i64) -> Result<CombinedStatus> {
        let pr = self.get_pull_request(owner, repo, pr_number).await?;
        let sha_url = format!("{}/pulls/{pr_number}", Self::repo_url(owner, repo));
        let pr_json = self.get_json(&sha_url).await?;
        let sha = pr_json
            .get("head")
            .and_then(|h| h.get("sha"))
            .and_then(|s| s.as_str())
            .context("pull request response missing head.sha")?;
        let _ = pr; // already consulted for existence/validity
        let url = format!("{}/commits/{sha}/status", Self::repo_url(owner, repo));
        let body = self.get_json(&url).await?;
        let contexts = body
            .get("statuses")
            .and_then(|v| v.as_array())
            .map(|statuses| {
                statuses
                    .iter()
                    .map(|s| StatusContext {
                        context: s.get("context").and_then(|c| c.as_str()).unwrap_or_default().to_string(),
                        state: s.get("state").and_then(|c| c.as_str()).unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(CombinedStatus {
            overall_state: body.get("state").and_then(|s| s.as_str()).unwrap_or("pending").to_string(),
            contexts,
        })
    }

    async fn list_open_issues(&self, owner: &str, repo: &str) -> Result<Vec<IssueSummary>> {
        let url = format!("{}/issues?state=open&per_page=100", Self::repo_url(owner, repo));
        let body = self.get_json(&url).await?;
        let issues = body
            .as_array()
            .context("expected a JSON array of issues")?
            .iter()
            // GitHub's issues endpoint includes pull requests; those carry a
            // `pull_request` key and are excluded here since callers use
            // `list_open_pull_requests` for those.
            .filter(|i| i.get("pull_request").is_none())
            .map(|i| IssueSummary {
                number: i.get("number").and_then(|n| n.as_i64()).unwrap_or_default(),
                labels: labels_from(i),
            })
            .collect();
        Ok(issues)
    }

    async fn list_open_pull_requests(&self, owner: &str, repo: &str) -> Result<Vec<PullRequestInfo>> {
        let url = format!("{}/pulls?state=open&per_page=100", Self::repo_url(owner, repo));
        let body = self.get_json(&url).await?;
        let prs = body
            .as_array()
            .context("expected a JSON array of pull requests")?
            .iter()
            .map(pull_request_from_json)
            .collect();
        Ok(prs)
    }

    async fn post_issue_comment(&self, owner: &str, repo: &str, issue_number: i64, body: &str) -> Result<i64> {
        let url = format!("{}/issues/{issue_number}/comments", Self::repo_url(owner, repo));
        let response = self.request(reqwest::Method::POST, &url).json(&json!({ "body": body })).send().await?;
        self.note_rate_limit(&response);
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            bail!("POST {url} returned {status}: {text}");
        }
        let parsed: serde_json::Value = serde_json::from_str(&text)?;
        Ok(parsed.get("id").and_then(|i| i.as_i64()).unwrap_or_default())
    }

    async fn add_labels(&self, owner: &str, repo: &str, issue_number: i64, labels: &[String]) -> Result<()> {
        let url = format!("{}/issues/{issue_number}/labels", Self::repo_url(owner, repo));
        let response = self.request(reqwest::Method::POST, &url).json(&json!({ "labels": labels })).send().await?;
        self.note_rate_limit(&response);
        if !response.status().is_success() {
            bail!("POST {url} returned {}", response.status());
        }
        Ok(())
    }

    async fn create_issue(&self, owner: &str, repo: &str, title: &str, body: &str) -> Result<i64> {
        let url = format!("{}/issues", Self::repo_url(owner, repo));
        let response = self.request(reqwest::Method::POST, &url).json(&json!({ "title": title, "body": body })).send().await?;
        self.note_rate_limit(&response);
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            bail!("POST {url} returned {status}: {text}");
        }
        let parsed: serde_json::Value = serde_json::from_str(&text)?;
        Ok(parsed.get("number").and_then(|n| n.as_i64()).unwrap_or_default())
    }

    async fn open_pull_request(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<i64> {
        let url = format!("{}/pulls", Self::repo_url(owner, repo));
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(&json!({ "head": branch, "base": base, "title": title, "body": body }))
            .send()
            .await?;
        self.note_rate_limit(&response);
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            bail!("POST {url} returned {status}: {text}");
        }
        let parsed: serde_json::Value = serde_json::from_str(&text)?;
        Ok(parsed.get("number").and_then(|n| n.as_i64()).unwrap_or_default())
    }

    async fn submit_pr_review(&self, owner: &str, repo: &str, pr_number: i64, event: &str, body: &str) -> Result<()> {
        let url = format!("{}/pulls/{pr_number}/reviews", Self::repo_url(owner, repo));
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(&json!({ "event": event, "body": body }))
            .send()
            .await?;
        self.note_rate_limit(&response);
        // A bot reviewing its own PR gets a 403 from the reviews endpoint;
        // fall back to a plain comment so the feedback isn't silently lost.
        if response.status() == StatusCode::FORBIDDEN {
            warn!(pr_number, "review rejected (likely self-review), falling back to a comment");
            let prefixed = format!("**[{event}]**\n\n{body}");
            self.post_issue_comment(owner, repo, pr_number, &prefixed).await?;
            return Ok(());
        }
        if !response.status().is_success() {
            bail!("POST {url} returned {}", response.status());
        }
        Ok(())
    }

    fn rate_limit_status(&self) -> RateLimitStatus {
        *self.rate_limit.lock().unwrap_or_else(|e| e.into_inner())
    }
}
