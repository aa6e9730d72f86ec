//! Startup recovery: the registry may describe a world that no longer
//! matches reality (the process that owned a live agent's task died with
//! it), and GitHub may describe agents the registry never heard of (the
//! registry itself was wiped, or issues/PRs were opened while the service
//! was down). Two independent phases fix both.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::ProjectConfig;
use crate::github::GitHubClient;
use crate::registry::Registry;
use crate::types::{AgentRecord, AgentStatus};

pub struct Recovery {
    registry: Arc<Registry>,
    github: Arc<dyn GitHubClient>,
    config: Arc<ProjectConfig>,
}

impl Recovery {
    pub fn new(registry: Arc<Registry>, github: Arc<dyn GitHubClient>, config: Arc<ProjectConfig>) -> Self {
        Self { registry, github, config }
    }

    /// Runs both phases. Called once at startup, before the webhook server
    /// starts accepting traffic and before the reconciliation loop starts.
    pub async fn run(&self) -> Result<()> {
        self.phase1_fail_orphaned_agents().await;
        self.phase2_reconstruct_from_github().await;
        Ok(())
    }

    /// Phase 1: no process survives a restart holding an agent's LLM
    /// session, so every `active`/`created` record is necessarily stale.
    /// Mark it `failed`, clear `active_since`, and tell the issue (if any)
    /// what happened so a human isn't left guessing.
    async fn phase1_fail_orphaned_agents(&self) {
        let agents = match self.registry.list_agents() {
            Ok(a) => a,
            Err(err) => {
                warn!(error = %err, "recovery phase 1: failed to list agents, skipping");
                return;
            }
        };
        for agent in agents {
            if !matches!(agent.status, AgentStatus::Active | AgentStatus::Created) {
                continue;
            }
            if let Err(err) = self.registry.mark_failed_and_clear_active(agent.agent_id) {
                warn!(agent_id = agent.agent_id, error = %err, "recovery phase 1: failed to mark agent failed");
                continue;
            }
            info!(agent_id = agent.agent_id, role = %agent.role, "recovery: marked orphaned agent failed");
            if let Some(issue) = agent.issue_number {
                let body = format!(
                    "**[squadron:{}]** restarted; this agent's in-progress session was lost and has been marked failed.",
                    agent.role
                );
                if let Err(err) =
                    self.github.post_issue_comment(&self.config.runtime.owner, &self.config.runtime.repo, issue, &body).await
                {
                    warn!(agent_id = agent.agent_id, issue, error = %err, "recovery phase 1: failed to post restart comment");
                }
            }
        }
    }

    /// Phase 2: enumerate open issues/PRs carrying a configured lifecycle
    /// label or branch prefix, and upsert an agent record for any that the
    /// registry doesn't already track. Every per-item error is logged and
    /// skipped rather than aborting the whole reconstruction.
    async fn phase2_reconstruct_from_github(&self) {
        let owner = self.config.runtime.owner.clone();
        let repo = self.config.runtime.repo.clone();

        let issues = match self.github.list_open_issues(&owner, &repo).await {
            Ok(issues) => issues,
            Err(err) => {
                warn!(error = %err, "recovery phase 2: failed to list open issues, skipping");
                vec![]
            }
        };
        for issue in issues {
            if let Err(err) = self.reconstruct_issue(&owner, &repo, issue.number, &issue.labels) {
                warn!(issue = issue.number, error = %err, "recovery phase 2: failed to reconstruct issue, skipping");
            }
        }

        let prs = match self.github.list_open_pull_requests(&owner, &repo).await {
            Ok(prs) => prs,
            Err(err) => {
                warn!(error = %err, "recovery phase 2: failed to list open pull requests, skipping");
                vec![]
            }
        };
        for pr in prs {
            if let Err(err) = self.reconstruct_pr(&owner, &repo, &pr.number, &pr.head_branch).await {
                warn!(pr = pr.number, error = %err, "recovery phase 2: failed to reconstruct PR, skipping");
            }
        }
    }

    fn reconstruct_issue(&self, _owner: &str, _repo: &str, issue_number: i64, labels: &[String]) -> Result<()> {
        let Some(role_name) = self.role_for_labels(labels) else { return Ok(()) };
        if !self.config.roles.contains_key(&role_name) {
            return Ok(());
        }
        if !self.registry.find_by_role_and_target(&role_name, Some(issue_number), None)?.is_empty() {
            return Ok(());
        }
        let status = status_for_labels(labels);
        self.upsert_recovered_agent(&role_name, Some(issue_number), None, status)?;
        info!(issue = issue_number, role = %role_name, status = status.as_str(), "recovery: reconstructed agent from issue");
        Ok(())
    }

    async fn reconstruct_pr(&self, owner: &str, repo: &str, pr_number: &i64, head_branch: &str) -> Result<()> {
        let pr_number = *pr_number;
        let Some(role_name) = self.role_for_branch(head_branch) else { return Ok(()) };
        if !self.config.roles.contains_key(&role_name) {
            return Ok(());
        }
        if !self.registry.find_by_role_and_target(&role_name, None, Some(pr_number))?.is_empty() {
            return Ok(());
        }
        let labels = self.github.get_pull_request_labels(owner, repo, pr_number).await.unwrap_or_default();
        let status = status_for_labels(&labels);
        self.upsert_recovered_agent(&role_name, None, Some(pr_number), status)?;
        info!(pr = pr_number, role = %role_name, status = status.as_str(), "recovery: reconstructed agent from pull request");
        Ok(())
    }

    fn role_for_labels(&self, labels: &[String]) -> Option<String> {
        labels.iter().find_map(|l| self.config.labels.role_labels.get(l).cloned())
    }

    /// Longest matching branch prefix wins, so `feature/impl-` doesn't lose
    /// to an accidental overlap with a shorter `feature/` entry.
    fn role_for_branch(&self, branch: &str) -> Option<String> {
        self.config
            .labels
            .role_branch_prefixes
            .iter()
            .filter(|(prefix, _)| branch.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, role)| role.clone())
    }

    fn upsert_recovered_agent(
        &self,
        role_name: &str,
        issue_number: Option<i64>,
        pr_number: Option<i64>,
        status: AgentStatus,
    ) -> Result<()> {
        let mut record = AgentRecord::new(0, role_name);
        record.issue_number = issue_number;
        record.pr_number = pr_number;
        record.status = status;
        if status == AgentStatus::Sleeping {
            record.sleeping_since = Some(chrono::Utc::now());
        }
        self.registry.create_agent(&record)?;
        Ok(())
    }
}

/// Maps the status-implying lifecycle labels to the agent status Recovery
/// should record; any issue/PR carrying a role label but none of these is
/// assumed to have died mid-work, same as Phase 1's orphan handling.
fn status_for_labels(labels: &[String]) -> AgentStatus {
    if labels.iter().any(|l| l == "blocked") {
        AgentStatus::Sleeping
    } else if labels.iter().any(|l| l == "needs-human") {
        AgentStatus::Escalated
    } else if labels.iter().any(|l| l == "in-progress") {
        AgentStatus::Failed
    } else {
        AgentStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::config::{
        CircuitBreakerConfig, CommandsConfig, RoleConfig, RuntimeConfig, SandboxConfig,
    };
    use crate::github::{
        CombinedStatus, IssueSummary, PrApprovalInfo, PullRequestInfo, RateLimitStatus, ReviewInfo,
    };

    #[derive(Default)]
    struct FakeGitHub {
        open_issues: Vec<IssueSummary>,
        open_prs: Vec<PullRequestInfo>,
        pr_labels: HashMap<i64, Vec<String>>,
    }

    #[async_trait]
    impl GitHubClient for FakeGitHub {
        async fn get_pr_approvals(&self, _: &str, _: &str, _: i64) -> Result<Vec<PrApprovalInfo>> {
            Ok(vec![])
        }
        async fn get_pr_reviews(&self, _: &str, _: &str, _: i64) -> Result<Vec<ReviewInfo>> {
            Ok(vec![])
        }
        async fn get_pull_request(&self, _: &str, _: &str, pr: i64) -> Result<PullRequestInfo> {
            self.open_prs.iter().find(|p| p.number == pr).cloned().ok_or_else(|| anyhow::anyhow!("no such pr"))
        }
        async fn get_pull_request_labels(&self, _: &str, _: &str, pr: i64) -> Result<Vec<String>> {
            Ok(self.pr_labels.get(&pr).cloned().unwrap_or_default())
        }
        async fn get_issue_labels(&self, _: &str, _: &str, issue: i64) -> Result<Vec<String>> {
            Ok(self.open_issues.iter().find(|i| i.number == issue).map(|i| i.labels.clone()).unwrap_or_default())
        }
        async fn get_combined_status(&self, _: &str, _: &str, _: i64) -> Result<CombinedStatus> {
            Ok(CombinedStatus { overall_state: "success".into(), contexts: vec![] })
        }
        async fn list_open_issues(&self, _: &str, _: &str) -> Result<Vec<IssueSummary>> {
            Ok(self.open_issues.clone())
        }
        async fn list_open_pull_requests(&self, _: &str, _: &str) -> Result<Vec<PullRequestInfo>> {
            Ok(self.open_prs.clone())
        }
        async fn post_issue_comment(&self, _: &str, _: &str, _: i64, _: &str) -> Result<i64> {
            Ok(1)
        }
        async fn add_labels(&self, _: &str, _: &str, _: i64, _: &[String]) -> Result<()> {
            Ok(())
        }
        async fn create_issue(&self, _: &str, _: &str, _: &str, _: &str) -> Result<i64> {
            Ok(1)
        }
        async fn open_pull_request(&self, _: &str, _: &str, _: &str, _: &str, _: &str, _: &str) -> Result<i64> {
            Ok(1)
        }
        async fn submit_pr_review(&self, _: &str, _: &str, _: i64, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn rate_limit_status(&self) -> RateLimitStatus {
            RateLimitStatus::default()
        }
    }

    fn config() -> Arc<ProjectConfig> {
        let mut role_labels = HashMap::new();
        role_labels.insert("feature".to_string(), "feat-dev".to_string());
        let mut role_branch_prefixes = HashMap::new();
        role_branch_prefixes.insert("feat/".to_string(), "pr-review".to_string());

        let mut roles = HashMap::new();
        for name in ["feat-dev", "pr-review"] {
            roles.insert(
                name.to_string(),
                RoleConfig {
                    name: name.to_string(),
                    model: None,
                    allowed_tools: None,
                    wake_on_labels: vec![],
                    singleton: false,
                    triggers: vec![],
                    circuit_breaker: None,
                    prompt: String::new(),
                },
            );
        }

        Arc::new(ProjectConfig {
            runtime: RuntimeConfig {
                owner: "acme".into(),
                repo: "widgets".into(),
                default_branch: "main".into(),
                max_concurrent_agents: 0,
                reconcile_interval_s: 30,
                stale_sleeping_after_s: 86_400,
                activity_retain_days: 30,
            },
            circuit_breaker: CircuitBreakerConfig { max_tool_calls: 60, max_turn_duration_s: 1800 },
            commands: CommandsConfig::default(),
            labels: crate::config::LabelsConfig { role_labels, role_branch_prefixes },
            sandbox: SandboxConfig::default(),
            roles,
            pipelines: vec![],
        })
    }

    #[tokio::test]
    async fn phase1_fails_orphaned_active_and_created_agents() {
        let registry = Arc::new(Registry::open(":memory:").expect("open"));
        let mut active = AgentRecord::new(0, "feat-dev");
        active.status = AgentStatus::Active;
        active.issue_number = Some(1);
        let active_id = registry.create_agent(&active).unwrap();

        let mut sleeping = AgentRecord::new(0, "feat-dev");
        sleeping.status = AgentStatus::Sleeping;
        sleeping.issue_number = Some(2);
        let sleeping_id = registry.create_agent(&sleeping).unwrap();

        let recovery = Recovery::new(registry.clone(), Arc::new(FakeGitHub::default()), config());
        recovery.run().await.expect("recovery runs");

        assert_eq!(registry.get_agent(active_id).unwrap().status, AgentStatus::Failed);
        assert!(registry.get_agent(active_id).unwrap().active_since.is_none());
        // A sleeping agent is not orphaned by phase 1 — its session is
        // intentionally retained across restarts.
        assert_eq!(registry.get_agent(sleeping_id).unwrap().status, AgentStatus::Sleeping);
    }

    #[tokio::test]
    async fn phase2_reconstructs_agent_from_issue_label() {
        let registry = Arc::new(Registry::open(":memory:").expect("open"));
        let github = FakeGitHub {
            open_issues: vec![IssueSummary { number: 42, labels: vec!["feature".to_string(), "blocked".to_string()] }],
            ..Default::default()
        };
        let recovery = Recovery::new(registry.clone(), Arc::new(github), config());
        recovery.run().await.expect("recovery runs");

        let reconstructed = registry.find_by_role_and_target("feat-dev", Some(42), None).unwrap();
        assert_eq!(reconstructed.len(), 1);
        assert_eq!(reconstructed[0].status, AgentStatus::Sleeping);
    }

    #[tokio::test]
    async fn phase2_skips_issue_with_unconfigured_role_label() {
        let registry = Arc::new(Registry::open(":memory:").expect("open"));
        let github = FakeGitHub {
            open_issues: vec![IssueSummary { number: 9, labels: vec!["documentation".to_string()] }],
            ..Default::default()
        };
        let recovery = Recovery::new(registry.clone(), Arc::new(github), config());
        recovery.run().await.expect("recovery runs");

        assert!(registry.find_by_role_and_target("feat-dev", Some(9), None).unwrap().is_empty());
        assert!(registry.list_agents().unwrap().is_empty());
    }

    #[tokio::test]
    async fn phase2_skips_issue_already_tracked_in_registry() {
        let registry = Arc::new(Registry::open(":memory:").expect("open"));
        // Sleeping, not active: phase 1 only fails active/created records,
        // so this one must survive phase 1 unchanged for the phase 2
        // dedup check below to be exercised against it.
        let mut existing = AgentRecord::new(0, "feat-dev");
        existing.issue_number = Some(42);
        existing.status = AgentStatus::Sleeping;
        registry.create_agent(&existing).unwrap();

        let github = FakeGitHub {
            open_issues: vec![IssueSummary { number: 42, labels: vec!["feature".to_string()] }],
            ..Default::default()
        };
        let recovery = Recovery::new(registry.clone(), Arc::new(github), config());
        recovery.run().await.expect("recovery runs");

        // No second record for the same (role, issue) pair was inserted.
        assert_eq!(registry.find_by_role_and_target("feat-dev", Some(42), None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn phase2_reconstructs_agent_from_pr_branch_prefix() {
        let registry = Arc::new(Registry::open(":memory:").expect("open"));
        let pr = PullRequestInfo {
            number: 87,
            title: "t".into(),
            base_branch: "main".into(),
            head_branch: "feat/issue-86".into(),
            mergeable_state: None,
            author: "bot".into(),
            author_is_bot: true,
        };
        let github = FakeGitHub { open_prs: vec![pr], ..Default::default() };
        let recovery = Recovery::new(registry.clone(), Arc::new(github), config());
        recovery.run().await.expect("recovery runs");

        let reconstructed = registry.find_by_role_and_target("pr-review", None, Some(87)).unwrap();
        assert_eq!(reconstructed.len(), 1);
        // No labels on the PR: falls back to "failed" (presumed dead mid-work).
        assert_eq!(reconstructed[0].status, AgentStatus::Failed);
    }
}
