//! Owns every live agent: its registry record, its LLM session, its
//! inbox of internal events, its mail queue of inbound `@mentions`, its
//! background task and its worktree handle. Registers on the Event Router
//! as both a lifecycle-trigger handler and a mention/command router, and
//! implements [`StageDispatch`] so the Pipeline Engine can hand it agent
//! and action stages without knowing anything about sessions or sandboxes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock as AsyncRwLock, Semaphore};
use tracing::{error, info, warn};

use crate::activity::{ActivityDetail, ActivityEventType, ActivityLog};
use crate::agent_session::{AgentSession, ToolOutcome, WorktreeProvisioner};
use crate::command_parser::CommandParser;
use crate::config::{effective_circuit_breaker, ProjectConfig, RoleConfig, RoleTriggerConfig};
use crate::error::RegistryError;
use crate::event_router::EventHandler;
use crate::github::GitHubClient;
use crate::pipeline::engine::{StageContext, StageDispatch, StageOutcome, StageResult};
use crate::pipeline::models::StageDefinition;
use crate::registry::Registry;
use crate::sandbox::SandboxManager;
use crate::types::{
    AgentRecord, AgentStatus, MailMessage, MessageProvenance, PrApprovalState, SquadronEvent,
    SquadronEventType,
};

/// Maximum number of short inbox lines retained per agent before the
/// oldest is dropped; mirrors the bounded, drop-and-log inbox the spec
/// describes. The mail queue (owned by [`Registry`]) has no such cap —
/// mentions back-pressure the sender instead of being dropped.
const MAX_INBOX_LINES: usize = 64;

fn self_header_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*\[squadron:([A-Za-z0-9_-]+)\]\*\*").expect("valid regex"))
}

/// Assembles a turn's prompt from a role's base prompt, drained mail and
/// pending inbox lines. No implementation ships in this crate —
/// `squadron-agent` provides the concrete one; tests use a stub.
pub trait PromptBuilder: Send + Sync {
    fn build(
        &self,
        role: &RoleConfig,
        issue_number: Option<i64>,
        pr_number: Option<i64>,
        mail: &[MailMessage],
        inbox_lines: &[String],
        injected: Option<String>,
    ) -> String;
}

/// Runs before any transition to `sleeping`, e.g. a WIP commit-and-push.
/// Failures are logged but never block the transition.
#[async_trait]
pub trait PreSleepHook: Send + Sync {
    async fn run(&self, agent_id: i64, worktree_path: &str) -> Result<()>;
}

pub struct NoopPreSleepHook;

#[async_trait]
impl PreSleepHook for NoopPreSleepHook {
    async fn run(&self, _agent_id: i64, _worktree_path: &str) -> Result<()> {
        Ok(())
    }
}

/// Resumes a pipeline run's waiting agent stage once the dispatched agent
/// reaches a terminal state. Implemented by [`crate::pipeline::engine::PipelineEngine`];
/// held behind a trait (and set post-construction) because the engine
/// holds an `Arc<dyn StageDispatch>` pointing back at the Agent Manager —
/// a direct `Arc<PipelineEngine>` field here would be circular.
#[async_trait]
pub trait StageResumer: Send + Sync {
    async fn resume_stage(&self, run_id: i64, passed: bool, message: Option<String>) -> Result<()>;
}

/// What a framework tool call asks the agent's turn to do, plus the
/// human-readable message to surface back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub message: String,
    pub outcome: ToolOutcome,
}

struct Inboxes {
    lines: StdMutex<HashMap<i64, VecDeque<String>>>,
}

impl Inboxes {
    fn new() -> Self {
        Self { lines: StdMutex::new(HashMap::new()) }
    }

    fn push(&self, agent_id: i64, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let queue = lines.entry(agent_id).or_default();
        if queue.len() >= MAX_INBOX_LINES {
            queue.pop_front();
            warn!(agent_id, "inbox full, dropping oldest event");
        }
        queue.push_back(line);
    }

    fn drain(&self, agent_id: i64) -> Vec<String> {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.remove(&agent_id).map(|q| q.into_iter().collect()).unwrap_or_default()
    }

    fn clear(&self, agent_id: i64) {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).remove(&agent_id);
    }
}

pub struct AgentManager {
    registry: Arc<Registry>,
    activity: Arc<ActivityLog>,
    config: Arc<ProjectConfig>,
    github: Arc<dyn GitHubClient>,
    session_backend: Arc<dyn AgentSession>,
    worktrees: Arc<dyn WorktreeProvisioner>,
    sandbox: Arc<dyn SandboxManager>,
    prompts: Arc<dyn PromptBuilder>,
    pre_sleep: Arc<dyn PreSleepHook>,
    http: reqwest::Client,
    command_parser: CommandParser,
    concurrency: Option<Arc<Semaphore>>,
    inboxes: Inboxes,
    /// Maps an agent spawned (or reused) for a pipeline agent stage back
    /// to the run waiting on it, so `cleanup_agent` can call `resume_stage`.
    stage_runs: StdMutex<HashMap<i64, i64>>,
    resumer: AsyncRwLock<Option<Arc<dyn StageResumer>>>,
    weak_self: StdRwLock<Option<Weak<AgentManager>>>,
}

impl AgentManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        activity: Arc<ActivityLog>,
        config: Arc<ProjectConfig>,
        github: Arc<dyn GitHubClient>,
        session_backend: Arc<dyn AgentSession>,
        worktrees: Arc<dyn WorktreeProvisioner>,
        sandbox: Arc<dyn SandboxManager>,
        prompts: Arc<dyn PromptBuilder>,
        pre_sleep: Arc<dyn PreSleepHook>,
    ) -> Arc<Self> {
        let known_roles: Vec<String> = config.known_roles();
        let concurrency = if config.runtime.max_concurrent_agents == 0 {
            None
        } else {
            Some(Arc::new(Semaphore::new(config.runtime.max_concurrent_agents as usize)))
        };
        let command_parser = CommandParser::new(&config.commands.prefix, &known_roles);
        let manager = Arc::new(Self {
            registry,
            activity,
            config,
            github,
            session_backend,
            worktrees,
            sandbox,
            prompts,
            pre_sleep,
            http: reqwest::Client::new(),
            command_parser,
            concurrency,
            inboxes: Inboxes::new(),
            stage_runs: StdMutex::new(HashMap::new()),
            resumer: AsyncRwLock::new(None),
            weak_self: StdRwLock::new(None),
        });
        *manager.weak_self.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::downgrade(&manager));
        manager
    }

    pub async fn set_resumer(&self, resumer: Arc<dyn StageResumer>) {
        *self.resumer.write().await = Some(resumer);
    }

    fn arc_self(&self) -> Arc<Self> {
        self.weak_self
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
            .expect("AgentManager::new always initializes weak_self")
    }

    fn owner(&self) -> &str {
        &self.config.runtime.owner
    }

    fn repo(&self) -> &str {
        &self.config.runtime.repo
    }

    /// Signs posted text with the agent's role, e.g. for the self-loop
    /// guard and to make bot-authored comments attributable at a glance.
    fn sign(&self, role: &str, body: &str) -> String {
        format!("**[squadron:{role}]**\n\n{body}")
    }

    fn push_inbox_line(&self, agent_id: i64, line: impl Into<String>) {
        self.inboxes.push(agent_id, line.into());
    }

    fn drain_inbox_lines(&self, agent_id: i64) -> Vec<String> {
        self.inboxes.drain(agent_id)
    }

    fn take_stage_run(&self, agent_id: i64) -> Option<i64> {
        self.stage_runs.lock().unwrap_or_else(|e| e.into_inner()).remove(&agent_id)
    }

    // ── Spawn / wake ──────────────────────────────────────────────────────

    /// Spawn path per spec §4.5: singleton guard, duplicate guard,
    /// concurrency gate, worktree provisioning, then a background task
    /// running the per-turn state machine.
    pub async fn spawn_agent(
        &self,
        role_name: &str,
        issue_number: Option<i64>,
        pr_number: Option<i64>,
        override_branch: Option<String>,
        initial_message: Option<String>,
    ) -> Result<i64> {
        let role = self
            .config
            .roles
            .get(role_name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown role {role_name:?}"))?;

        if role.singleton && !self.registry.find_active_by_role(role_name)?.is_empty() {
            anyhow::bail!("singleton role {role_name:?} already has a live agent");
        }
        if !self.registry.find_by_role_and_target(role_name, issue_number, pr_number)?.is_empty() {
            anyhow::bail!(
                "an agent already exists for role {role_name:?} target (issue={issue_number:?}, pr={pr_number:?})"
            );
        }

        let permit = match &self.concurrency {
            Some(sem) => Some(Arc::clone(sem).acquire_owned().await.context("concurrency semaphore closed")?),
            None => None,
        };

        let record = AgentRecord::new(0, role_name);
        let agent_id = self.registry.create_agent(&record)?;

        let base_branch = self.config.runtime.default_branch.clone();
        let (generated_branch, worktree_path) = self
            .worktrees
            .create_worktree(agent_id, role_name, &base_branch)
            .await
            .context("provisioning agent worktree")?;
        let branch = override_branch.unwrap_or(generated_branch);
        self.registry.set_agent_branch(agent_id, &branch, &worktree_path)?;
        if let Some(issue) = issue_number {
            let _ = issue; // issue_number already stored via AgentRecord::new path below
        }
        self.set_agent_target(agent_id, issue_number, pr_number)?;
        self.sandbox
            .wrap_agent_task(agent_id, &worktree_path)
            .await
            .context("leasing sandbox for agent")?;

        self.activity.record(
            Some(agent_id),
            ActivityEventType::SessionCreated,
            format!("spawned role {role_name} (issue={issue_number:?}, pr={pr_number:?})"),
            ActivityDetail::default(),
        )?;

        let manager = self.arc_self();
        tokio::spawn(async move {
            if let Err(err) = manager.run_agent_loop(agent_id, initial_message, permit).await {
                error!(agent_id, error = %err, "agent loop exited with error");
            }
        });

        Ok(agent_id)
    }

    /// `create_agent` doesn't take issue/pr directly (it stores whatever is
    /// on the `AgentRecord` passed in); this patches them in immediately
    /// after insert so every later lookup sees the real target.
    fn set_agent_target(&self, agent_id: i64, issue_number: Option<i64>, pr_number: Option<i64>) -> Result<()> {
        if let Some(pr) = pr_number {
            self.registry.set_agent_pr(agent_id, pr)?;
        }
        if issue_number.is_some() {
            self.registry.set_agent_issue(agent_id, issue_number)?;
        }
        Ok(())
    }

    /// Wakes a sleeping agent: re-acquires a concurrency permit (sleeping
    /// released its task's permit on exit, per the concurrency model) and
    /// spawns a fresh task that resumes the agent's still-open session.
    pub async fn wake_agent(&self, agent_id: i64, reason: String) -> Result<()> {
        let permit = match &self.concurrency {
            Some(sem) => Some(Arc::clone(sem).acquire_owned().await.context("concurrency semaphore closed")?),
            None => None,
        };
        self.registry.update_agent_status(agent_id, AgentStatus::Active)?;
        self.activity.record(Some(agent_id), ActivityEventType::AgentWoke, reason.clone(), ActivityDetail::default())?;

        let manager = self.arc_self();
        tokio::spawn(async move {
            if let Err(err) = manager.run_agent_loop(agent_id, Some(reason), permit).await {
                error!(agent_id, error = %err, "agent loop exited with error after wake");
            }
        });
        Ok(())
    }

    fn find_agent_for_target(
        &self,
        role_name: &str,
        issue_number: Option<i64>,
        pr_number: Option<i64>,
    ) -> Result<Option<AgentRecord>> {
        if let Some(issue) = issue_number {
            if let Some(agent) = self.registry.find_by_role_and_target(role_name, Some(issue), None)?.into_iter().next()
            {
                return Ok(Some(agent));
            }
        }
        if let Some(pr) = pr_number {
            if let Some(agent) = self.registry.find_by_role_and_target(role_name, None, Some(pr))?.into_iter().next() {
                return Ok(Some(agent));
            }
        }
        Ok(None)
    }

    fn find_agent_for_event(&self, role_name: &str, event: &SquadronEvent) -> Result<Option<AgentRecord>> {
        self.find_agent_for_target(role_name, event.issue_number, event.pr_number)
    }

    async fn spawn_from_event(&self, role: &RoleConfig, event: &SquadronEvent) -> Result<()> {
        let override_branch = event.branch.clone().filter(|_| event.pr_number.is_some());
        match self
            .spawn_agent(&role.name, event.issue_number, event.pr_number, override_branch, event.comment_body.clone())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(role = %role.name, error = %err, "failed to spawn agent from event");
                Ok(())
            }
        }
    }

    // ── Per-agent loop ────────────────────────────────────────────────────

    async fn run_agent_loop(
        self: Arc<Self>,
        agent_id: i64,
        initial_message: Option<String>,
        permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) -> Result<()> {
        let outcome = self.drive_agent(agent_id, initial_message).await;
        if let Err(err) = &outcome {
            warn!(agent_id, error = %err, "agent loop failed, escalating");
            let _ = self.registry.update_agent_status(agent_id, AgentStatus::Escalated);
            let _ = self.activity.record(
                Some(agent_id),
                ActivityEventType::AgentFailed,
                format!("loop error: {err}"),
                ActivityDetail::default(),
            );
            self.cleanup_agent(agent_id).await;
        }
        drop(permit);
        outcome
    }

    async fn drive_agent(&self, agent_id: i64, mut injected: Option<String>) -> Result<()> {
        let record = self.registry.get_agent(agent_id)?;
        let role = self
            .config
            .roles
            .get(&record.role)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("role {:?} no longer configured", record.role))?;
        let worktree_path = record.worktree_path.clone().unwrap_or_default();
        let cb = effective_circuit_breaker(&role, &self.config.circuit_breaker);

        self.registry.update_agent_status(agent_id, AgentStatus::Active)?;

        let mut session_id = record.session_id.clone();
        let mut tool_calls_since_flush: i64 = 0;

        loop {
            let record = self.registry.get_agent(agent_id)?;
            let mail = self.registry.drain_mail(agent_id);
            let inbox_lines = self.drain_inbox_lines(agent_id);
            let prompt =
                self.prompts.build(&role, record.issue_number, record.pr_number, &mail, &inbox_lines, injected.take());

            self.activity.record(
                Some(agent_id),
                ActivityEventType::PromptReady,
                "turn prompt assembled",
                ActivityDetail::default(),
            )?;
            self.activity.record(
                Some(agent_id),
                ActivityEventType::ModelRequestStarted,
                "turn started",
                ActivityDetail::default(),
            )?;

            let turn_fut = {
                let worktree_path = worktree_path.clone();
                let session_id = session_id.clone();
                let prompt = prompt.clone();
                let backend = Arc::clone(&self.session_backend);
                async move {
                    match session_id {
                        None => backend.create(&worktree_path, &prompt).await,
                        Some(sid) => backend.send_and_wait(&worktree_path, &sid, &prompt).await,
                    }
                }
            };

            let turn = match tokio::time::timeout(Duration::from_secs(cb.max_turn_duration_s), turn_fut).await {
                Ok(Ok(turn)) => turn,
                Ok(Err(err)) => return Err(err).context("agent session turn failed"),
                Err(_) => {
                    warn!(agent_id, "turn duration watchdog fired");
                    self.activity.record(
                        Some(agent_id),
                        ActivityEventType::CircuitBreakerTriggered,
                        format!("turn exceeded {}s duration watchdog", cb.max_turn_duration_s),
                        ActivityDetail::default(),
                    )?;
                    if let Some(issue) = record.issue_number {
                        let body = self.sign(&role.name, "This turn exceeded the duration watchdog; escalating.");
                        if let Err(err) = self.github.post_issue_comment(self.owner(), self.repo(), issue, &body).await
                        {
                            warn!(agent_id, %err, "failed to post watchdog comment");
                        }
                    }
                    self.registry.update_agent_status(agent_id, AgentStatus::Escalated)?;
                    self.activity.record(
                        Some(agent_id),
                        ActivityEventType::AgentEscalated,
                        "duration watchdog",
                        ActivityDetail::default(),
                    )?;
                    self.cleanup_agent(agent_id).await;
                    return Ok(());
                }
            };
            self.activity.record(
                Some(agent_id),
                ActivityEventType::ModelRequestCompleted,
                "turn finished",
                ActivityDetail::default(),
            )?;

            self.registry.increment_turn(agent_id)?;
            if let Some(sid) = &turn.session_id {
                session_id = Some(sid.clone());
                self.registry.update_agent_session(agent_id, sid)?;
            }

            // Circuit breaker L1: batch-persist tool call count every 10 calls.
            tool_calls_since_flush += i64::from(turn.tool_call_count);
            if tool_calls_since_flush >= 10 {
                let total = self.registry.add_tool_calls(agent_id, tool_calls_since_flush)?;
                tool_calls_since_flush = 0;
                if total > i64::from(cb.max_tool_calls) {
                    warn!(agent_id, total, max = cb.max_tool_calls, "tool call budget exceeded");
                    self.registry.update_agent_status(agent_id, AgentStatus::Escalated)?;
                    self.activity.record(
                        Some(agent_id),
                        ActivityEventType::CircuitBreakerTriggered,
                        format!("tool call budget {} exceeded ({total} calls)", cb.max_tool_calls),
                        ActivityDetail::default(),
                    )?;
                }
            }

            match &turn.outcome {
                ToolOutcome::Continue => {}
                ToolOutcome::Suspend { reason } => {
                    info!(agent_id, reason, "turn suspended");
                }
                ToolOutcome::Complete => {
                    self.registry.update_agent_status(agent_id, AgentStatus::Completed)?;
                    self.activity.record(
                        Some(agent_id),
                        ActivityEventType::AgentCompleted,
                        "agent reported complete",
                        ActivityDetail::default(),
                    )?;
                }
                ToolOutcome::Escalate { reason } => {
                    self.registry.update_agent_status(agent_id, AgentStatus::Escalated)?;
                    self.activity.record(
                        Some(agent_id),
                        ActivityEventType::AgentEscalated,
                        reason.clone(),
                        ActivityDetail::default(),
                    )?;
                }
            }

            if tool_calls_since_flush > 0 {
                // flush leftover count so status reads below see an up to date record
                self.registry.add_tool_calls(agent_id, tool_calls_since_flush)?;
                tool_calls_since_flush = 0;
            }

            let status = self.registry.get_agent(agent_id)?.status;
            match status {
                AgentStatus::Active | AgentStatus::Created => continue,
                AgentStatus::Sleeping => {
                    info!(agent_id, "agent sleeping, task exiting, session retained");
                    self.activity.record(
                        Some(agent_id),
                        ActivityEventType::AgentSlept,
                        "task stopped, session retained",
                        ActivityDetail::default(),
                    )?;
                    return Ok(());
                }
                AgentStatus::Completed | AgentStatus::Escalated | AgentStatus::Failed | AgentStatus::Cancelled => {
                    self.cleanup_agent(agent_id).await;
                    return Ok(());
                }
            }
        }
    }

    /// `_cleanup_agent(destroy_session=true)`: delete the LLM session
    /// (ignore failures), remove the worktree (unless forensics retention
    /// applies), drop inbox/mail queues, and resolve any pipeline stage
    /// waiting on this agent. The concurrency permit is released by the
    /// caller dropping it after this returns.
    async fn cleanup_agent(&self, agent_id: i64) {
        let record = match self.registry.get_agent(agent_id) {
            Ok(r) => r,
            Err(err) => {
                error!(agent_id, error = %err, "cleanup: agent record missing");
                return;
            }
        };

        if let Some(sid) = &record.session_id {
            if let Err(err) = self.session_backend.delete(sid).await {
                warn!(agent_id, error = %err, "failed to delete agent session (ignored)");
            }
        }

        let retain_forensics = matches!(record.status, AgentStatus::Escalated | AgentStatus::Failed);
        if retain_forensics {
            if let Err(err) = self
                .sandbox
                .preserve_forensics(agent_id, &format!("agent ended in status {}", record.status.as_str()))
                .await
            {
                warn!(agent_id, error = %err, "failed to preserve forensics");
            }
        } else if let (Some(path), Some(branch)) = (&record.worktree_path, &record.branch) {
            if let Err(err) = self.worktrees.remove_worktree(path, branch).await {
                warn!(agent_id, error = %err, "failed to remove worktree");
            }
        }

        self.inboxes.clear(agent_id);
        self.registry.drain_mail(agent_id);

        if let Some(run_id) = self.take_stage_run(agent_id) {
            let passed = record.status == AgentStatus::Completed;
            let message = Some(format!("agent {agent_id} ended in status {}", record.status.as_str()));
            let resumer = self.resumer.read().await.clone();
            if let Some(resumer) = resumer {
                if let Err(err) = resumer.resume_stage(run_id, passed, message).await {
                    error!(run_id, agent_id, error = %err, "failed to resume pipeline stage after agent completion");
                }
            } else {
                warn!(run_id, agent_id, "agent stage completed but no StageResumer is wired up");
            }
        }
    }

    async fn run_pre_sleep_hook(&self, agent_id: i64) {
        let worktree_path = self.registry.get_agent(agent_id).ok().and_then(|r| r.worktree_path).unwrap_or_default();
        if let Err(err) = self.pre_sleep.run(agent_id, &worktree_path).await {
            warn!(agent_id, error = %err, "pre-sleep hook failed (ignored)");
        }
    }

    // ── Configuration-driven triggers ────────────────────────────────────

    async fn apply_triggers(&self, event: &SquadronEvent) -> Result<()> {
        let roles: Vec<RoleConfig> = self.config.roles.values().cloned().collect();
        for role in roles {
            for trigger in role.triggers.clone() {
                if trigger.event != event.event_type.as_str() {
                    continue;
                }
                if let Some(condition) = &trigger.condition {
                    if !trigger_condition_matches(condition, event) {
                        continue;
                    }
                }
                if let Err(err) = self.apply_trigger_action(&role, &trigger, event).await {
                    warn!(role = %role.name, action = %trigger.action, error = %err, "trigger action failed");
                }
            }
        }
        Ok(())
    }

    async fn apply_trigger_action(&self, role: &RoleConfig, trigger: &RoleTriggerConfig, event: &SquadronEvent) -> Result<()> {
        match trigger.action.as_str() {
            "spawn" => {
                if self.find_agent_for_event(&role.name, event)?.is_none() {
                    self.spawn_from_event(role, event).await?;
                }
            }
            "sleep" => {
                if let Some(agent) = self.find_agent_for_event(&role.name, event)? {
                    if agent.status == AgentStatus::Active {
                        self.registry.update_agent_status(agent.agent_id, AgentStatus::Sleeping)?;
                        self.activity.record(
                            Some(agent.agent_id),
                            ActivityEventType::AgentSlept,
                            "put to sleep by configured trigger",
                            ActivityDetail::default(),
                        )?;
                    }
                }
            }
            "wake" => {
                if let Some(agent) = self.find_agent_for_event(&role.name, event)? {
                    if agent.status == AgentStatus::Sleeping {
                        self.wake_agent(agent.agent_id, "woken by configured trigger".to_string()).await?;
                    }
                }
            }
            "complete" => {
                if let Some(agent) = self.find_agent_for_event(&role.name, event)? {
                    self.registry.update_agent_status(agent.agent_id, AgentStatus::Completed)?;
                    self.activity.record(
                        Some(agent.agent_id),
                        ActivityEventType::AgentCompleted,
                        "completed by configured trigger",
                        ActivityDetail::default(),
                    )?;
                }
            }
            other => warn!(action = other, "unknown trigger action, ignoring"),
        }
        Ok(())
    }

    // ── Mention and command routing ──────────────────────────────────────

    async fn route_mentions_and_commands(&self, event: &SquadronEvent) -> Result<()> {
        if !matches!(
            event.event_type,
            SquadronEventType::IssueComment
                | SquadronEventType::PullRequestComment
                | SquadronEventType::PullRequestReviewCommentCreated
        ) {
            return Ok(());
        }
        let Some(body) = &event.comment_body else { return Ok(()) };
        let Some(parsed) = self.command_parser.parse(body) else { return Ok(()) };
        let self_role = self_header_regex().captures(body).and_then(|c| c.get(1)).map(|m| m.as_str().to_string());

        if let Some(agent_role) = &parsed.agent_name {
            if Some(agent_role.as_str()) != self_role.as_deref() {
                self.route_to_role(agent_role, event, parsed.message.clone()).await?;
            }
            return Ok(());
        }

        for role in &parsed.mentioned_roles {
            if Some(role.as_str()) == self_role.as_deref() {
                continue; // self-loop guard: never reply to our own mention header
            }
            self.route_to_role(role, event, parsed.message.clone()).await?;
        }

        // Built-in actions (status/cancel/retry/list/help) are surfaced to
        // the dashboard/CLI layer rather than handled here; this handler's
        // job is agent routing only.
        Ok(())
    }

    async fn route_to_role(&self, role_name: &str, event: &SquadronEvent, message: Option<String>) -> Result<()> {
        let Some(role) = self.config.roles.get(role_name).cloned() else {
            warn!(role = role_name, "mention targets an unconfigured role, ignoring");
            return Ok(());
        };

        match self.find_agent_for_event(role_name, event)? {
            Some(agent) if !agent.status.is_terminal() => {
                let provenance =
                    if event.pr_number.is_some() { MessageProvenance::PrComment } else { MessageProvenance::IssueComment };
                self.registry.push_mail(
                    agent.agent_id,
                    MailMessage {
                        sender: format!("@{}", event.sender),
                        body: message.unwrap_or_else(|| event.comment_body.clone().unwrap_or_default()),
                        provenance,
                        received_at: chrono::Utc::now(),
                    },
                );
                if agent.status == AgentStatus::Sleeping {
                    self.wake_agent(agent.agent_id, "mention received".to_string()).await?;
                }
            }
            _ => self.spawn_from_event(&role, event).await?,
        }
        Ok(())
    }

    // ── Framework tools (what the agent calls back) ──────────────────────

    pub async fn report_blocked(&self, agent_id: i64, blocker_issue: i64, reason: &str) -> Result<ToolResult> {
        match self.registry.add_blocker(agent_id, blocker_issue) {
            Ok(()) => {
                self.run_pre_sleep_hook(agent_id).await;
                self.registry.update_agent_status(agent_id, AgentStatus::Sleeping)?;
                let record = self.registry.get_agent(agent_id)?;
                if let Some(issue) = record.issue_number {
                    let body = self.sign(&record.role, &format!("Blocked on #{blocker_issue}: {reason}"));
                    match self.github.post_issue_comment(self.owner(), self.repo(), issue, &body).await {
                        Ok(_) => {
                            self.activity.record(
                                Some(agent_id),
                                ActivityEventType::GithubCommentPosted,
                                "posted blocked notice",
                                ActivityDetail::default(),
                            )?;
                        }
                        Err(err) => warn!(agent_id, error = %err, "failed to post blocked comment"),
                    }
                }
                self.activity.record(
                    Some(agent_id),
                    ActivityEventType::AgentSlept,
                    format!("blocked on #{blocker_issue}"),
                    ActivityDetail::default(),
                )?;
                Ok(ToolResult {
                    message: format!("blocked on #{blocker_issue}, sleeping until resolved"),
                    outcome: ToolOutcome::Suspend { reason: reason.to_string() },
                })
            }
            Err(RegistryError::CycleDetected { .. }) => Ok(ToolResult {
                message: format!("refusing: #{blocker_issue} would create a blocker cycle"),
                outcome: ToolOutcome::Continue,
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn report_complete(&self, agent_id: i64, summary: &str) -> Result<ToolResult> {
        self.registry.update_agent_status(agent_id, AgentStatus::Completed)?;
        let record = self.registry.get_agent(agent_id)?;
        if let Some(issue) = record.issue_number {
            let body = self.sign(&record.role, summary);
            if let Err(err) = self.github.post_issue_comment(self.owner(), self.repo(), issue, &body).await {
                warn!(agent_id, error = %err, "failed to post completion comment");
            }
        }
        self.activity.record(Some(agent_id), ActivityEventType::AgentCompleted, summary.to_string(), ActivityDetail::default())?;
        Ok(ToolResult { message: "marked complete".to_string(), outcome: ToolOutcome::Complete })
    }

    pub async fn create_blocker_issue(&self, agent_id: i64, title: &str, body: &str, labels: &[String]) -> Result<ToolResult> {
        let record = self.registry.get_agent(agent_id)?;
        let signed_body = self.sign(&record.role, body);
        let issue_number = self.github.create_issue(self.owner(), self.repo(), title, &signed_body).await?;
        if !labels.is_empty() {
            if let Err(err) = self.github.add_labels(self.owner(), self.repo(), issue_number, labels).await {
                warn!(agent_id, error = %err, "failed to label new blocker issue");
            }
        }
        self.registry.add_blocker(agent_id, issue_number)?;
        self.run_pre_sleep_hook(agent_id).await;
        self.registry.update_agent_status(agent_id, AgentStatus::Sleeping)?;
        self.activity.record(
            Some(agent_id),
            ActivityEventType::GithubCommentPosted,
            format!("created blocker issue #{issue_number}"),
            ActivityDetail::default(),
        )?;
        Ok(ToolResult {
            message: format!("created blocker issue #{issue_number}, sleeping until resolved"),
            outcome: ToolOutcome::Suspend { reason: format!("blocked on new issue #{issue_number}") },
        })
    }

    pub async fn escalate_to_human(&self, agent_id: i64, reason: &str, category: &str) -> Result<ToolResult> {
        self.registry.update_agent_status(agent_id, AgentStatus::Escalated)?;
        let record = self.registry.get_agent(agent_id)?;
        if let Some(issue) = record.issue_number {
            let labels = vec!["needs-human".to_string(), format!("escalation:{category}")];
            if let Err(err) = self.github.add_labels(self.owner(), self.repo(), issue, &labels).await {
                warn!(agent_id, error = %err, "failed to label escalation");
            }
            let body = self.sign(&record.role, &format!("Escalating to a human ({category}): {reason}"));
            if let Err(err) = self.github.post_issue_comment(self.owner(), self.repo(), issue, &body).await {
                warn!(agent_id, error = %err, "failed to post escalation comment");
            }
        }
        self.activity.record(Some(agent_id), ActivityEventType::AgentEscalated, reason.to_string(), ActivityDetail::default())?;
        Ok(ToolResult { message: "escalated to human".to_string(), outcome: ToolOutcome::Escalate { reason: reason.to_string() } })
    }

    /// Read-only w.r.t. the mail queue: only drains the internal inbox.
    pub fn check_for_events(&self, agent_id: i64) -> Vec<String> {
        self.drain_inbox_lines(agent_id)
    }

    /// `submit_pr_review` relies on the injected `GitHubClient` to fall
    /// back to a plain comment on its own (see the trait's doc comment);
    /// the agent-visible fallback here only covers `REQUEST_CHANGES`
    /// calls the client still surfaced as an error (e.g. a genuine 403),
    /// applying the two independent internal fallbacks the spec names.
    pub async fn submit_pr_review(&self, agent_id: i64, pr_number: i64, body: &str, event: &str) -> Result<ToolResult> {
        let record = self.registry.get_agent(agent_id)?;
        let signed = self.sign(&record.role, body);
        match self.github.submit_pr_review(self.owner(), self.repo(), pr_number, event, &signed).await {
            Ok(()) => {
                self.activity.record(
                    Some(agent_id),
                    ActivityEventType::GithubReviewSubmitted,
                    format!("submitted {event} review on #{pr_number}"),
                    ActivityDetail::default(),
                )?;
                Ok(ToolResult { message: format!("submitted {event} review on #{pr_number}"), outcome: ToolOutcome::Continue })
            }
            Err(err) if event.eq_ignore_ascii_case("REQUEST_CHANGES") => {
                warn!(agent_id, pr_number, error = %err, "review submission rejected, applying fallbacks");
                let labeled =
                    self.github.add_labels(self.owner(), self.repo(), pr_number, &["needs-changes".to_string()]).await.is_ok();
                let recorded = self
                    .registry
                    .record_pr_approval(pr_number, &record.role, Some(&record.role), false, PrApprovalState::ChangesRequested)
                    .is_ok();
                self.activity.record(
                    Some(agent_id),
                    ActivityEventType::GithubLabelApplied,
                    format!("review fallback for #{pr_number}: labeled={labeled} recorded_changes_requested={recorded}"),
                    ActivityDetail::default(),
                )?;
                let notify = format!("notify the author of #{pr_number} that changes are required");
                let message = match (labeled, recorded) {
                    (true, true) => format!(
                        "review API rejected the call; applied the needs-changes label and recorded a changes_requested entry for #{pr_number} — {notify}"
                    ),
                    (true, false) => format!(
                        "review API rejected the call; applied the needs-changes label for #{pr_number} but failed to record the changes_requested entry — {notify}"
                    ),
                    (false, true) => format!(
                        "review API rejected the call; recorded a changes_requested entry for #{pr_number} but failed to apply the needs-changes label — {notify}"
                    ),
                    (false, false) => {
                        format!("review API rejected the call for #{pr_number} and both fallbacks failed — {notify}")
                    }
                };
                Ok(ToolResult { message, outcome: ToolOutcome::Continue })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn open_pr(&self, agent_id: i64, branch: &str, base: &str, title: &str, body: &str) -> Result<ToolResult> {
        let record = self.registry.get_agent(agent_id)?;
        let signed = self.sign(&record.role, body);
        let pr_number = self.github.open_pull_request(self.owner(), self.repo(), branch, base, title, &signed).await?;
        self.registry.set_agent_pr(agent_id, pr_number)?;
        self.activity.record(Some(agent_id), ActivityEventType::GithubPrOpened, format!("opened PR #{pr_number}"), ActivityDetail::default())?;
        Ok(ToolResult { message: format!("opened PR #{pr_number}"), outcome: ToolOutcome::Continue })
    }

    pub async fn comment_on_issue(&self, agent_id: i64, issue_number: i64, body: &str) -> Result<ToolResult> {
        let record = self.registry.get_agent(agent_id)?;
        let signed = self.sign(&record.role, body);
        self.github.post_issue_comment(self.owner(), self.repo(), issue_number, &signed).await?;
        self.activity.record(
            Some(agent_id),
            ActivityEventType::GithubCommentPosted,
            format!("commented on #{issue_number}"),
            ActivityDetail::default(),
        )?;
        Ok(ToolResult { message: format!("comment posted on #{issue_number}"), outcome: ToolOutcome::Continue })
    }

    /// GitHub models PR conversation comments as issue comments on the
    /// same number, so this is the same call as `comment_on_issue`.
    pub async fn comment_on_pr(&self, agent_id: i64, pr_number: i64, body: &str) -> Result<ToolResult> {
        self.comment_on_issue(agent_id, pr_number, body).await
    }

    pub async fn label_issue(&self, agent_id: i64, issue_number: i64, labels: &[String]) -> Result<ToolResult> {
        self.github.add_labels(self.owner(), self.repo(), issue_number, labels).await?;
        self.activity.record(
            Some(agent_id),
            ActivityEventType::GithubLabelApplied,
            format!("labeled #{issue_number}: {}", labels.join(", ")),
            ActivityDetail::default(),
        )?;
        Ok(ToolResult { message: format!("applied {} label(s) to #{issue_number}", labels.len()), outcome: ToolOutcome::Continue })
    }

    pub async fn create_issue(&self, _agent_id: i64, title: &str, body: &str) -> Result<ToolResult> {
        let issue_number = self.github.create_issue(self.owner(), self.repo(), title, body).await?;
        Ok(ToolResult { message: format!("created issue #{issue_number}"), outcome: ToolOutcome::Continue })
    }

    pub async fn read_issue(&self, _agent_id: i64, issue_number: i64) -> Result<ToolResult> {
        let labels = self.github.get_issue_labels(self.owner(), self.repo(), issue_number).await?;
        Ok(ToolResult { message: format!("#{issue_number} labels: {}", labels.join(", ")), outcome: ToolOutcome::Continue })
    }

    /// The `GitHubClient` trait carries no assignment endpoint (it wasn't
    /// needed for anything else this crate does); acknowledging without
    /// claiming an action that didn't happen is safer than faking it via
    /// a label.
    pub async fn assign_issue(&self, _agent_id: i64, issue_number: i64, _assignee: &str) -> Result<ToolResult> {
        warn!(issue_number, "assign_issue requested but no GitHubClient assignment capability is configured");
        Ok(ToolResult {
            message: format!("assignment is not supported by the configured GitHub client for #{issue_number}"),
            outcome: ToolOutcome::Continue,
        })
    }

    pub fn check_registry(&self, _agent_id: i64) -> Result<ToolResult> {
        let active = self.registry.list_active_agents()?;
        let summary = active
            .iter()
            .map(|a| format!("#{} {} ({})", a.agent_id, a.role, a.status.as_str()))
            .collect::<Vec<_>>()
            .join("; ");
        Ok(ToolResult {
            message: if summary.is_empty() { "no active agents".to_string() } else { summary },
            outcome: ToolOutcome::Continue,
        })
    }

    // ── Framework action registry (action stages) ────────────────────────

    async fn dispatch_framework_action(&self, ctx: &StageContext<'_>, stage: &StageDefinition) -> Result<StageResult> {
        let action = stage.action.as_deref().unwrap_or_default();
        let result = match action {
            "add_label" => self.action_add_label(ctx, &stage.action_params).await,
            "post_comment" => self.action_post_comment(ctx, &stage.action_params).await,
            other => Err(anyhow::anyhow!(
                "action {other:?} is not registered in the framework action registry"
            )),
        };
        match result {
            Ok(outputs) => Ok(StageResult { outcome: StageOutcome::Pass, message: Some(outputs) }),
            Err(err) => Ok(StageResult::fail(err.to_string())),
        }
    }

    async fn action_add_label(&self, ctx: &StageContext<'_>, params: &serde_json::Value) -> Result<String> {
        let target = ctx.pr_number.or(ctx.issue_number).context("action stage has no issue/pr target")?;
        let labels: Vec<String> = params
            .get("labels")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        self.github.add_labels(ctx.owner, ctx.repo, target, &labels).await?;
        Ok(format!("applied {} label(s) to {target}", labels.len()))
    }

    async fn action_post_comment(&self, ctx: &StageContext<'_>, params: &serde_json::Value) -> Result<String> {
        let target = ctx.pr_number.or(ctx.issue_number).context("action stage has no issue/pr target")?;
        let body = params.get("body").and_then(|v| v.as_str()).unwrap_or_default();
        self.github.post_issue_comment(ctx.owner, ctx.repo, target, body).await?;
        Ok(format!("commented on {target}"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex2;

    use super::*;
    use crate::config::{CircuitBreakerConfig, CommandsConfig, LabelsConfig, RuntimeConfig, SandboxConfig};
    use crate::github::{
        CombinedStatus, IssueSummary, PrApprovalInfo, PullRequestInfo, RateLimitStatus, ReviewInfo,
    };
    use crate::sandbox::{SandboxHandle, SandboxMode};

    struct FakeGitHub {
        fail_review: bool,
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
            Ok(PullRequestInfo {
                number: pr,
                title: "t".into(),
                base_branch: "main".into(),
                head_branch: "feature".into(),
                mergeable_state: None,
                author: "bot".into(),
                author_is_bot: true,
            })
        }
        async fn get_pull_request_labels(&self, _: &str, _: &str, _: i64) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn get_issue_labels(&self, _: &str, _: &str, _: i64) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn get_combined_status(&self, _: &str, _: &str, _: i64) -> Result<CombinedStatus> {
            Ok(CombinedStatus { overall_state: "success".into(), contexts: vec![] })
        }
        async fn list_open_issues(&self, _: &str, _: &str) -> Result<Vec<IssueSummary>> {
            Ok(vec![])
        }
        async fn list_open_pull_requests(&self, _: &str, _: &str) -> Result<Vec<PullRequestInfo>> {
            Ok(vec![])
        }
        async fn post_issue_comment(&self, _: &str, _: &str, _: i64, _: &str) -> Result<i64> {
            Ok(1)
        }
        async fn add_labels(&self, _: &str, _: &str, _: i64, _: &[String]) -> Result<()> {
            Ok(())
        }
        async fn create_issue(&self, _: &str, _: &str, _: &str, _: &str) -> Result<i64> {
            Ok(77)
        }
        async fn open_pull_request(&self, _: &str, _: &str, _: &str, _: &str, _: &str, _: &str) -> Result<i64> {
            Ok(10)
        }
        async fn submit_pr_review(&self, _: &str, _: &str, _: i64, event: &str, _: &str) -> Result<()> {
            if self.fail_review && event.eq_ignore_ascii_case("REQUEST_CHANGES") {
                anyhow::bail!("403 Forbidden: bot cannot request changes on its own PR");
            }
            Ok(())
        }
        fn rate_limit_status(&self) -> RateLimitStatus {
            RateLimitStatus::default()
        }
    }

    /// Scripted turns: each call to `create`/`resume` pops the next queued
    /// result, panicking if the script runs dry (a test bug, not a prod
    /// concern — a real backend never "runs out" of turns).
    struct ScriptedSession {
        turns: StdMutex2<VecDeque<TurnResult>>,
    }

    impl ScriptedSession {
        fn new(turns: Vec<TurnResult>) -> Self {
            Self { turns: StdMutex2::new(turns.into_iter().collect()) }
        }
    }

    #[async_trait]
    impl AgentSession for ScriptedSession {
        async fn create(&self, _worktree_path: &str, _instruction: &str) -> Result<TurnResult> {
            self.next_turn().await
        }
        async fn resume(&self, _worktree_path: &str, _session_id: &str, _instruction: &str) -> Result<TurnResult> {
            self.next_turn().await
        }
    }

    impl ScriptedSession {
        /// Once the script runs dry, parks forever instead of erroring —
        /// lets a test assert on synchronous guard behavior (singleton,
        /// duplicate) without racing the background turn loop to a
        /// terminal status it never intended to exercise.
        async fn next_turn(&self) -> Result<TurnResult> {
            let popped = self.turns.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            match popped {
                Some(t) => Ok(t),
                None => std::future::pending::<Result<TurnResult>>().await,
            }
        }
    }

    fn turn(outcome: ToolOutcome, tool_call_count: u32) -> TurnResult {
        TurnResult { output_text: String::new(), session_id: Some("sess-1".to_string()), outcome, tool_call_count }
    }

    struct FakeWorktrees;

    #[async_trait]
    impl WorktreeProvisioner for FakeWorktrees {
        async fn create_worktree(&self, agent_id: i64, role: &str, _base_branch: &str) -> Result<(String, String)> {
            Ok((format!("squadron/{role}-{agent_id}"), format!("/tmp/squadron-test/{agent_id}")))
        }
        async fn remove_worktree(&self, _worktree_path: &str, _branch: &str) -> Result<()> {
            Ok(())
        }
    }

    struct FakeSandbox;

    #[async_trait]
    impl SandboxManager for FakeSandbox {
        async fn wrap_agent_task(&self, agent_id: i64, worktree_path: &str) -> Result<SandboxHandle> {
            Ok(SandboxHandle { agent_id, mode: SandboxMode::Direct, worktree_path: worktree_path.to_string() })
        }
        fn authorize_tool_call(&self, _agent_id: i64, _tool_name: &str, _params: &serde_json::Value) -> crate::agent_session::PreToolUseDecision {
            crate::agent_session::PreToolUseDecision::Allow
        }
        async fn preserve_forensics(&self, _agent_id: i64, _reason: &str) -> Result<()> {
            Ok(())
        }
    }

    struct FakePrompts;

    impl PromptBuilder for FakePrompts {
        fn build(
            &self,
            role: &RoleConfig,
            _issue_number: Option<i64>,
            _pr_number: Option<i64>,
            _mail: &[MailMessage],
            _inbox_lines: &[String],
            _injected: Option<String>,
        ) -> String {
            format!("prompt for {}", role.name)
        }
    }

    fn role(name: &str, singleton: bool, max_tool_calls: Option<u32>) -> RoleConfig {
        RoleConfig {
            name: name.to_string(),
            model: None,
            allowed_tools: None,
            wake_on_labels: vec![],
            singleton,
            triggers: vec![],
            circuit_breaker: max_tool_calls
                .map(|max_tool_calls| CircuitBreakerConfig { max_tool_calls, max_turn_duration_s: 5 }),
            prompt: "base prompt".to_string(),
        }
    }

    fn config_with_roles(roles: Vec<RoleConfig>) -> Arc<ProjectConfig> {
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
            labels: LabelsConfig::default(),
            sandbox: SandboxConfig::default(),
            roles: roles.into_iter().map(|r| (r.name.clone(), r)).collect(),
            pipelines: vec![],
        })
    }

    fn manager(
        config: Arc<ProjectConfig>,
        session: ScriptedSession,
        fail_review: bool,
    ) -> (Arc<AgentManager>, Arc<Registry>) {
        let registry = Arc::new(Registry::open(":memory:").expect("open registry"));
        let activity = Arc::new(ActivityLog::new(Arc::clone(&registry)));
        let manager = AgentManager::new(
            Arc::clone(&registry),
            activity,
            config,
            Arc::new(FakeGitHub { fail_review }),
            Arc::new(session),
            Arc::new(FakeWorktrees),
            Arc::new(FakeSandbox),
            Arc::new(FakePrompts),
            Arc::new(NoopPreSleepHook),
        );
        (manager, registry)
    }

    #[tokio::test]
    async fn spawn_runs_one_turn_to_completion() {
        let config = config_with_roles(vec![role("implementer", false, None)]);
        let session = ScriptedSession::new(vec![turn(ToolOutcome::Complete, 1)]);
        let (manager, registry) = manager(config, session, false);

        let agent_id = manager.spawn_agent("implementer", Some(42), None, None, None).await.expect("spawn");
        // Give the background task a chance to run the single scripted turn.
        for _ in 0..50 {
            if registry.get_agent(agent_id).unwrap().status == AgentStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = registry.get_agent(agent_id).expect("agent exists");
        assert_eq!(record.status, AgentStatus::Completed);
        assert_eq!(record.issue_number, Some(42));
    }

    #[tokio::test]
    async fn singleton_role_rejects_second_spawn() {
        let config = config_with_roles(vec![role("pm", true, None)]);
        let session = ScriptedSession::new(vec![turn(ToolOutcome::Continue, 0), turn(ToolOutcome::Continue, 0)]);
        let (manager, _registry) = manager(config, session, false);

        manager.spawn_agent("pm", Some(1), None, None, None).await.expect("first spawn succeeds");
        let err = manager.spawn_agent("pm", Some(2), None, None, None).await.unwrap_err();
        assert!(err.to_string().contains("singleton"));
    }

    #[tokio::test]
    async fn duplicate_role_and_issue_rejects_spawn() {
        let config = config_with_roles(vec![role("implementer", false, None)]);
        let session = ScriptedSession::new(vec![turn(ToolOutcome::Continue, 0)]);
        let (manager, _registry) = manager(config, session, false);

        manager.spawn_agent("implementer", Some(9), None, None, None).await.expect("first spawn succeeds");
        let err = manager.spawn_agent("implementer", Some(9), None, None, None).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn report_blocked_cycle_is_refused_and_agent_stays_active() {
        // Mirrors scenario S2: A (issue 1) tries to block on B's issue (2),
        // but B is already blocked on A's issue (1) — closing the cycle.
        let config = config_with_roles(vec![role("implementer", false, None), role("reviewer", false, None)]);
        let session = ScriptedSession::new(vec![turn(ToolOutcome::Continue, 0)]);
        let (manager, registry) = manager(config, session, false);

        let mut a = AgentRecord::new(0, "implementer");
        a.issue_number = Some(1);
        a.status = AgentStatus::Active;
        let a_id = registry.create_agent(&a).unwrap();
        let mut b = AgentRecord::new(0, "reviewer");
        b.issue_number = Some(2);
        b.status = AgentStatus::Active;
        let b_id = registry.create_agent(&b).unwrap();
        registry.add_blocker(b_id, 1).unwrap();

        let result = manager.report_blocked(a_id, 2, "waiting on review").await.expect("tool call succeeds");
        assert!(result.message.contains("cycle"), "message was: {}", result.message);
        assert_eq!(result.outcome, ToolOutcome::Continue);
        let still_active = registry.get_agent(a_id).unwrap();
        assert_eq!(still_active.status, AgentStatus::Active);
        assert!(still_active.blocked_by.is_empty());
    }

    #[tokio::test]
    async fn report_blocked_without_a_cycle_sleeps_the_agent() {
        let config = config_with_roles(vec![role("implementer", false, None)]);
        let session = ScriptedSession::new(vec![turn(ToolOutcome::Continue, 0)]);
        let (manager, registry) = manager(config, session, false);

        let mut a = AgentRecord::new(0, "implementer");
        a.issue_number = Some(5);
        a.status = AgentStatus::Active;
        let a_id = registry.create_agent(&a).unwrap();

        let result = manager.report_blocked(a_id, 99, "waiting on a dependency").await.expect("tool call succeeds");
        assert_eq!(result.outcome, ToolOutcome::Suspend { reason: "waiting on a dependency".to_string() });
        let record = registry.get_agent(a_id).unwrap();
        assert_eq!(record.status, AgentStatus::Sleeping);
        assert!(record.blocked_by.contains(&99));
    }

    #[tokio::test]
    async fn submit_pr_review_403_applies_both_independent_fallbacks() {
        // Mirrors scenario S5: REQUEST_CHANGES on a bot-authored PR is
        // rejected by the review API; both fallbacks are independent and
        // the message must name exactly what succeeded.
        let config = config_with_roles(vec![role("reviewer", false, None)]);
        let session = ScriptedSession::new(vec![]);
        let (manager, registry) = manager(config, session, true);

        let mut agent = AgentRecord::new(0, "reviewer");
        agent.pr_number = Some(42);
        let agent_id = registry.create_agent(&agent).unwrap();

        let result = manager.submit_pr_review(agent_id, 42, "looks risky", "REQUEST_CHANGES").await.expect("tool handles 403");
        assert!(result.message.contains("needs-changes"));
        assert!(result.message.contains("changes_requested"));
        assert!(result.message.contains("notify"));
        assert_eq!(result.outcome, ToolOutcome::Continue);

        let approvals = registry.get_pr_approvals(42, false).unwrap();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].state, crate::types::PrApprovalState::ChangesRequested);
        assert!(!registry.check_pr_merge_ready(42).unwrap());
    }

    #[tokio::test]
    async fn circuit_breaker_l1_escalates_once_tool_calls_exceed_budget() {
        let config = config_with_roles(vec![role("implementer", false, Some(5))]);
        // A single turn reporting 11 tool calls trips a budget of 5.
        let session = ScriptedSession::new(vec![turn(ToolOutcome::Continue, 11)]);
        let (manager, registry) = manager(config, session, false);

        let agent_id = manager.spawn_agent("implementer", Some(7), None, None, None).await.expect("spawn");
        for _ in 0..50 {
            if registry.get_agent(agent_id).unwrap().status == AgentStatus::Escalated {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = registry.get_agent(agent_id).expect("agent exists");
        assert_eq!(record.status, AgentStatus::Escalated);
        assert!(record.tool_call_count >= 11);
    }
}

fn trigger_condition_matches(condition: &str, event: &SquadronEvent) -> bool {
    let Some((key, value)) = condition.split_once('=') else { return true };
    let key = key.trim();
    let value = value.trim();
    match key {
        "action" => event.action.as_deref() == Some(value),
        "label" => event.label.as_deref() == Some(value),
        "branch" => event.branch.as_deref() == Some(value),
        _ => true,
    }
}

#[async_trait]
impl EventHandler for AgentManager {
    fn name(&self) -> &str {
        "agent_manager"
    }

    async fn handle(&self, event: &SquadronEvent) -> Result<()> {
        self.apply_triggers(event).await?;
        self.route_mentions_and_commands(event).await?;
        Ok(())
    }
}

#[async_trait]
impl StageDispatch for AgentManager {
    async fn run_agent_stage(&self, ctx: &StageContext<'_>, stage: &StageDefinition) -> Result<StageResult> {
        let role_name = stage.role.clone().context("agent stage missing a role")?;
        let existing = self.find_agent_for_target(&role_name, ctx.issue_number, ctx.pr_number)?;
        let agent_id = match existing {
            Some(agent) if !agent.status.is_terminal() => {
                if agent.status == AgentStatus::Sleeping {
                    self.wake_agent(agent.agent_id, "resumed for pipeline stage".to_string()).await?;
                }
                agent.agent_id
            }
            _ => {
                let override_branch = ctx.pr_number.map(|_| ctx.head_branch.to_string());
                self.spawn_agent(&role_name, ctx.issue_number, ctx.pr_number, override_branch, stage.instruction.clone())
                    .await?
            }
        };
        self.stage_runs.lock().unwrap_or_else(|e| e.into_inner()).insert(agent_id, ctx.run_id);
        Ok(StageResult::pending())
    }

    async fn run_action_stage(&self, ctx: &StageContext<'_>, stage: &StageDefinition) -> Result<StageResult> {
        self.dispatch_framework_action(ctx, stage).await
    }

    async fn run_webhook_stage(&self, _ctx: &StageContext<'_>, stage: &StageDefinition) -> Result<StageResult> {
        let Some(webhook) = &stage.webhook else {
            return Ok(StageResult::fail("webhook stage missing a request config"));
        };
        let method = reqwest::Method::from_bytes(webhook.method.as_bytes()).unwrap_or(reqwest::Method::POST);
        let request = self.http.request(method, &webhook.url).json(&webhook.body);
        match request.send().await {
            Ok(response) if response.status().is_success() => Ok(StageResult::pass()),
            Ok(response) => Ok(StageResult::fail(format!("webhook returned status {}", response.status()))),
            Err(err) => Ok(StageResult::fail(format!("webhook request failed: {err}"))),
        }
    }
}
