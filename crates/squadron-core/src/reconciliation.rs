//! Periodic background sweep that keeps the registry honest against
//! GitHub's actual state and against its own idle agents. Runs as one
//! long-lived task spawned by the composition root; every tick is
//! independent and a failed tick is logged, never fatal to the loop.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::agent_manager::AgentManager;
use crate::config::ProjectConfig;
use crate::github::GitHubClient;
use crate::registry::Registry;
use crate::types::AgentStatus;

/// Owns the sweep; holds the same collaborators the composition root wired
/// into the Agent Manager so a tick can wake, complete or relabel agents
/// without a second copy of that wiring.
pub struct ReconciliationLoop {
    registry: Arc<Registry>,
    agents: Arc<AgentManager>,
    github: Arc<dyn GitHubClient>,
    config: Arc<ProjectConfig>,
}

impl ReconciliationLoop {
    pub fn new(
        registry: Arc<Registry>,
        agents: Arc<AgentManager>,
        github: Arc<dyn GitHubClient>,
        config: Arc<ProjectConfig>,
    ) -> Self {
        Self { registry, agents, github, config }
    }

    /// Runs the sweep forever on `reconcile_interval_s` cadence. Intended to
    /// be `tokio::spawn`ed once at startup and left running for the life of
    /// the process.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.config.runtime.reconcile_interval_s));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                error!(error = %err, "reconciliation sweep failed");
            }
        }
    }

    /// One sweep. Every step is best-effort: a failure fetching GitHub
    /// state or waking one agent does not stop the rest of the sweep.
    pub async fn tick(&self) -> Result<()> {
        let owner = &self.config.runtime.owner;
        let repo = &self.config.runtime.repo;

        let open_issues: HashSet<i64> = match self.github.list_open_issues(owner, repo).await {
            Ok(issues) => issues.into_iter().map(|i| i.number).collect(),
            Err(err) => {
                warn!(error = %err, "reconciliation: failed to list open issues, skipping issue-state steps this tick");
                HashSet::new()
            }
        };
        let open_prs: HashSet<i64> = match self.github.list_open_pull_requests(owner, repo).await {
            Ok(prs) => prs.into_iter().map(|p| p.number).collect(),
            Err(err) => {
                warn!(error = %err, "reconciliation: failed to list open pull requests, skipping PR-state steps this tick");
                HashSet::new()
            }
        };

        self.resolve_blockers(&open_issues);
        self.wake_stale_sleepers().await;
        self.verify_github_invariants(&open_issues, &open_prs).await;
        self.purge_old_activity();

        Ok(())
    }

    /// Step 1: for each sleeping agent with a non-empty `blocked_by`, drop
    /// any blocker whose issue is no longer open; wake the agent once the
    /// set empties out.
    fn resolve_blockers(&self, open_issues: &HashSet<i64>) {
        let agents = match self.registry.list_active_agents() {
            Ok(a) => a,
            Err(err) => {
                warn!(error = %err, "reconciliation: failed to list agents for blocker resolution");
                return;
            }
        };
        for agent in agents {
            if agent.status != AgentStatus::Sleeping || agent.blocked_by.is_empty() {
                continue;
            }
            let resolved: Vec<i64> = agent.blocked_by.iter().copied().filter(|b| !open_issues.contains(b)).collect();
            if resolved.is_empty() {
                continue;
            }
            let mut remaining = agent.blocked_by.clone();
            for blocker in &resolved {
                match self.registry.remove_blocker(agent.agent_id, *blocker) {
                    Ok(set) => remaining = set,
                    Err(err) => warn!(agent_id = agent.agent_id, blocker, error = %err, "failed to clear resolved blocker"),
                }
            }
            if remaining.is_empty() {
                let agent_id = agent.agent_id;
                let manager = Arc::clone(&self.agents);
                tokio::spawn(async move {
                    if let Err(err) = manager.wake_agent(agent_id, "all blockers resolved".to_string()).await {
                        warn!(agent_id, error = %err, "failed to wake agent after blockers resolved");
                    }
                });
            }
        }
    }

    /// Step 2: sleeping agents idle past `stale_sleeping_after_s` wake with
    /// a timeout notification rather than sleeping forever.
    async fn wake_stale_sleepers(&self) {
        let agents = match self.registry.list_active_agents() {
            Ok(a) => a,
            Err(err) => {
                warn!(error = %err, "reconciliation: failed to list agents for stale-sleep check");
                return;
            }
        };
        let threshold = chrono::Utc::now() - chrono::Duration::seconds(self.config.runtime.stale_sleeping_after_s);
        for agent in agents {
            if agent.status != AgentStatus::Sleeping {
                continue;
            }
            let Some(sleeping_since) = agent.sleeping_since else {
                continue;
            };
            if sleeping_since > threshold {
                continue;
            }
            if let Err(err) = self.agents.wake_agent(agent.agent_id, "woke on sleep timeout".to_string()).await {
                warn!(agent_id = agent.agent_id, error = %err, "failed to wake stale-sleeping agent");
            }
        }
    }

    /// Step 3: a completed PR whose agent is still active, or a closed
    /// issue with an active agent, both imply the agent's work is done even
    /// though it never called `report_complete` itself.
    async fn verify_github_invariants(&self, open_issues: &HashSet<i64>, open_prs: &HashSet<i64>) {
        let agents = match self.registry.list_active_agents() {
            Ok(a) => a,
            Err(err) => {
                warn!(error = %err, "reconciliation: failed to list agents for invariant check");
                return;
            }
        };
        for agent in agents {
            if agent.status != AgentStatus::Active {
                continue;
            }
            let pr_closed = agent.pr_number.is_some_and(|pr| !open_prs.contains(&pr));
            let issue_closed = agent.issue_number.is_some_and(|issue| !open_issues.contains(&issue));
            if !pr_closed && !issue_closed {
                continue;
            }
            let summary = match (pr_closed, issue_closed) {
                (true, _) => "pull request closed or merged while agent was still active".to_string(),
                (false, true) => "issue closed while agent was still active".to_string(),
                (false, false) => continue,
            };
            match self.agents.report_complete(agent.agent_id, &summary).await {
                Ok(_) => info!(agent_id = agent.agent_id, "reconciliation forced completion: {summary}"),
                Err(err) => warn!(agent_id = agent.agent_id, error = %err, "failed to force-complete agent"),
            }
        }
    }

    /// Step 4: prunes the activity log past the retention window. Agent
    /// records themselves are kept (the registry never deletes an agent
    /// row except via cascading pipeline-run delete); this is the one piece
    /// of unbounded growth a long-running install actually accrues.
    fn purge_old_activity(&self) {
        match self.registry.prune_old_activity(self.config.runtime.activity_retain_days) {
            Ok(pruned) if pruned > 0 => info!(pruned, "reconciliation pruned old activity rows past retention"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "failed to prune old activity"),
        }
    }
}
