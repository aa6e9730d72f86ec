//! Executes declarative pipeline definitions against registry state. A run
//! advances one stage at a time; each stage either resolves synchronously
//! (gate, delay, action, webhook) or suspends the run until an external
//! event completes it (agent turn finishes, a human responds).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Duration;

use crate::agent_manager::StageResumer;
use crate::error::PipelineError;
use crate::github::GitHubClient;
use crate::registry::Registry;
use crate::types::SquadronEvent;

use super::gates::{GateCheckContext, GateCheckRegistry};
use super::models::{
    HumanWaitType, JoinStrategy, PipelineDefinition, PipelineScope, StageDefinition, StageType,
    COMPLETE, ESCALATE, NEXT,
};

/// Sub-pipeline stages recurse through [`PipelineEngine::advance`] again;
/// this bounds how deep that recursion may go.
const MAX_NESTING_DEPTH: usize = 8;

/// What a single stage dispatch produced. `Pending` means the stage is
/// waiting on something external (an agent turn, a human response, a gate
/// timeout) and the run must not advance further until re-driven.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Pass,
    Fail,
    Pending,
}

#[derive(Debug, Clone)]
pub struct StageResult {
    pub outcome: StageOutcome,
    pub message: Option<String>,
}

impl StageResult {
    pub fn pass() -> Self {
        Self { outcome: StageOutcome::Pass, message: None }
    }
    pub fn fail(message: impl Into<String>) -> Self {
        Self { outcome: StageOutcome::Fail, message: Some(message.into()) }
    }
    pub fn pending() -> Self {
        Self { outcome: StageOutcome::Pending, message: None }
    }
}

/// Everything a stage dispatcher needs to know about the run it belongs to.
pub struct StageContext<'a> {
    pub run_id: i64,
    pub pipeline_name: &'a str,
    pub owner: &'a str,
    pub repo: &'a str,
    pub base_branch: &'a str,
    pub head_branch: &'a str,
    pub issue_number: Option<i64>,
    pub pr_number: Option<i64>,
    pub run_context: serde_json::Value,
}

/// Agent and action stages are dispatched out to the Agent Manager; the
/// engine itself has no notion of worktrees, sandboxes or model calls.
#[async_trait]
pub trait StageDispatch: Send + Sync {
    async fn run_agent_stage(
        &self,
        ctx: &StageContext<'_>,
        stage: &StageDefinition,
    ) -> Result<StageResult>;

    async fn run_action_stage(
        &self,
        ctx: &StageContext<'_>,
        stage: &StageDefinition,
    ) -> Result<StageResult>;

    async fn run_webhook_stage(
        &self,
        ctx: &StageContext<'_>,
        stage: &StageDefinition,
    ) -> Result<StageResult>;
}

pub struct PipelineEngine {
    registry: Arc<Registry>,
    gates: Arc<GateCheckRegistry>,
    github: Arc<dyn GitHubClient>,
    dispatch: Arc<dyn StageDispatch>,
    pipelines: RwLock<HashMap<String, PipelineDefinition>>,
    owner: String,
    repo: String,
    default_branch: String,
}

impl PipelineEngine {
    pub fn new(
        registry: Arc<Registry>,
        gates: Arc<GateCheckRegistry>,
        github: Arc<dyn GitHubClient>,
        dispatch: Arc<dyn StageDispatch>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        default_branch: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            gates,
            github,
            dispatch,
            pipelines: RwLock::new(HashMap::new()),
            owner: owner.into(),
            repo: repo.into(),
            default_branch: default_branch.into(),
        }
    }

    /// Replaces the loaded pipeline set. Every definition is validated
    /// (unique stage ids, resolvable transition targets, sub-pipeline refs
    /// exist) before any of them takes effect.
    pub fn load_pipelines(&self, defs: Vec<PipelineDefinition>) -> Result<()> {
        for def in &defs {
            def.validate_unique_stage_ids()?;
            for stage in &def.stages {
                stage.validate()?;
            }
            let dangling = def.validate_stage_references();
            if !dangling.is_empty() {
                return Err(PipelineError::InvalidTransition(def.name.clone(), dangling.join("; ")).into());
            }
            for reference in def.sub_pipeline_refs() {
                if !defs.iter().any(|d| d.name == reference) {
                    return Err(PipelineError::UnknownStage(reference.to_string()).into());
                }
            }
        }
        let mut map = HashMap::new();
        for def in defs {
            map.insert(def.name.clone(), def);
        }
        *self.pipelines.write().unwrap_or_else(|e| e.into_inner()) = map;
        Ok(())
    }

    pub fn get_pipeline(&self, name: &str) -> Option<PipelineDefinition> {
        self.pipelines.read().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }

    /// All currently loaded pipeline definitions, for the dashboard's
    /// `/dashboard/pipelines` listing.
    pub fn list_pipelines(&self) -> Vec<PipelineDefinition> {
        self.pipelines.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }

    /// Matches an incoming event against every loaded pipeline's trigger.
    /// A pipeline already running for the same PR/issue is not started
    /// again (the no-duplicate-active-run guard); returns the run ids
    /// created.
    pub async fn evaluate_event(&self, event: &SquadronEvent) -> Result<Vec<i64>> {
        let defs: Vec<PipelineDefinition> = self
            .pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut started = Vec::new();
        for def in &defs {
            if !def.trigger.matches(
                event.event_type.as_str(),
                event.action.as_deref(),
                event.label.as_deref(),
                event.branch.as_deref(),
            ) {
                continue;
            }

            if let Some(pr) = event.pr_number {
                let existing = self.registry.find_runs_for_pr(pr, Some(&def.name))?;
                if existing.iter().any(|r| r.status == "running") {
                    continue;
                }
            }

            let scope = match def.scope {
                PipelineScope::SinglePr | PipelineScope::MultiPr => "pr",
                PipelineScope::Issue => "issue",
            };
            let run_id = self.registry.create_run(
                &def.name,
                scope,
                event.issue_number,
                event.pr_number,
                &def.context,
            )?;
            if let Some(pr) = event.pr_number {
                self.registry.associate_pr(pr, run_id)?;
            }
            started.push(run_id);
            self.advance(run_id, 0).await?;
        }
        Ok(started)
    }

    /// Drives a run forward from its current stage until it completes,
    /// fails, or a stage suspends waiting on something external.
    pub async fn advance(&self, run_id: i64, nesting_depth: usize) -> Result<()> {
        if nesting_depth > MAX_NESTING_DEPTH {
            return Err(PipelineError::NestingTooDeep(MAX_NESTING_DEPTH).into());
        }

        loop {
            let run = self.registry.get_run(run_id)?;
            if run.status != "running" {
                return Ok(());
            }
            let def = self
                .get_pipeline(&run.pipeline_name)
                .ok_or_else(|| PipelineError::UnknownStage(run.pipeline_name.clone()))?;

            let stage_id = match &run.current_stage {
                Some(id) => id.clone(),
                None => match def.stages.first() {
                    Some(first) => first.id.clone(),
                    None => {
                        self.registry.complete_run(run_id, "completed")?;
                        return Ok(());
                    }
                },
            };
            let stage = def
                .get_stage(&stage_id)
                .ok_or_else(|| PipelineError::UnknownStage(stage_id.clone()))?
                .clone();

            self.registry.update_run_stage(run_id, &stage.id)?;
            let stage_run_id = self.registry.create_stage_run(run_id, &stage.id, stage_type_str(stage.stage_type))?;
            self.registry.start_stage_run(stage_run_id, None)?;

            let ctx = StageContext {
                run_id,
                pipeline_name: &def.name,
                owner: &self.owner,
                repo: &self.repo,
                base_branch: &self.default_branch,
                head_branch: &self.default_branch,
                issue_number: run.issue_number,
                pr_number: run.pr_number,
                run_context: run.context.clone(),
            };

            let result = self.dispatch_stage(&ctx, &stage, stage_run_id, nesting_depth).await?;

            match result.outcome {
                StageOutcome::Pending => {
                    // Stage is waiting on an external actor; the run stays
                    // `running` parked on this stage until re-driven by
                    // on_event or a completion callback.
                    return Ok(());
                }
                StageOutcome::Pass => {
                    self.registry.complete_stage_run(stage_run_id, "completed", result.message.as_deref(), None)?;
                    match stage.get_next_stage_id(true) {
                        Some(COMPLETE) => {
                            self.registry.complete_run(run_id, "completed")?;
                            return Ok(());
                        }
                        Some(ESCALATE) => {
                            self.registry.complete_run(run_id, "escalated")?;
                            return Ok(());
                        }
                        Some(NEXT) | None => {
                            match def.get_next_stage(&stage.id) {
                                Some(next) => {
                                    self.registry.update_run_stage(run_id, &next.id)?;
                                }
                                None => {
                                    self.registry.complete_run(run_id, "completed")?;
                                    return Ok(());
                                }
                            }
                        }
                        Some(target) => {
                            self.registry.update_run_stage(run_id, target)?;
                        }
                    }
                }
                StageOutcome::Fail => {
                    self.registry.complete_stage_run(
                        stage_run_id,
                        "failed",
                        None,
                        result.message.as_deref(),
                    )?;
                    if self.handle_stage_error(run_id, stage_run_id, &stage, &def)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Resolves `on_error`/`on_fail` for a failed stage: a retry budget
    /// restarts the same stage, `goto` jumps elsewhere, and exhausting both
    /// escalates the run. Returns `true` if the run should stop advancing
    /// this tick (escalated, or parked on a retry).
    fn handle_stage_error(
        &self,
        run_id: i64,
        stage_run_id: i64,
        stage: &StageDefinition,
        def: &PipelineDefinition,
    ) -> Result<bool> {
        if let Some(on_error) = &stage.on_error {
            let stage_run = self.registry.get_stage_run(stage_run_id)?;
            if let Some(max_retries) = on_error.retry {
                if stage_run.attempt <= i64::from(max_retries) {
                    self.registry.retry_stage_run(stage_run_id)?;
                    return Ok(false);
                }
            }
            if let Some(goto) = &on_error.goto {
                self.registry.update_run_stage(run_id, goto)?;
                return Ok(false);
            }
        }
        if let Some(target) = stage.get_next_stage_id(false) {
            match target {
                COMPLETE => {
                    self.registry.complete_run(run_id, "completed")?;
                }
                ESCALATE => {
                    self.registry.complete_run(run_id, "escalated")?;
                }
                NEXT => match def.get_next_stage(&stage.id) {
                    Some(next) => {
                        self.registry.update_run_stage(run_id, &next.id)?;
                        return Ok(false);
                    }
                    None => {
                        self.registry.complete_run(run_id, "completed")?;
                    }
                },
                other => {
                    self.registry.update_run_stage(run_id, other)?;
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        self.registry.complete_run(run_id, "escalated")?;
        Ok(true)
    }

    async fn dispatch_stage(
        &self,
        ctx: &StageContext<'_>,
        stage: &StageDefinition,
        stage_run_id: i64,
        nesting_depth: usize,
    ) -> Result<StageResult> {
        match stage.stage_type {
            StageType::Agent => self.dispatch.run_agent_stage(ctx, stage).await,
            StageType::Action => self.dispatch.run_action_stage(ctx, stage).await,
            StageType::Webhook => self.dispatch.run_webhook_stage(ctx, stage).await,
            StageType::Gate => self.dispatch_gate(ctx, stage, stage_run_id).await,
            StageType::Human => self.dispatch_human(stage_run_id, stage),
            StageType::Delay => Ok(self.dispatch_delay(stage)),
            StageType::Parallel => self.dispatch_parallel(ctx, stage, nesting_depth).await,
            StageType::Pipeline => self.dispatch_sub_pipeline(ctx, stage, nesting_depth).await,
        }
    }

    async fn dispatch_gate(
        &self,
        ctx: &StageContext<'_>,
        stage: &StageDefinition,
        stage_run_id: i64,
    ) -> Result<StageResult> {
        let gate = stage.gate.as_ref().expect("validated: gate stage carries a gate config");
        let check_ctx = GateCheckContext {
            params: gate.params.clone(),
            pr_number: ctx.pr_number,
            issue_number: ctx.issue_number,
            owner: ctx.owner.to_string(),
            repo: ctx.repo.to_string(),
            base_branch: ctx.base_branch.to_string(),
            head_branch: ctx.head_branch.to_string(),
            run_context: ctx.run_context.clone(),
            github: self.github.as_ref(),
            registry: self.registry.as_ref(),
        };
        let outcome = self.gates.evaluate(&gate.check, &check_ctx).await;
        self.registry
            .record_gate_check(stage_run_id, &gate.check, outcome.passed, outcome.error_message.as_deref())?;
        if outcome.passed {
            Ok(StageResult::pass())
        } else {
            Ok(StageResult::fail(outcome.error_message.unwrap_or_else(|| "gate check failed".into())))
        }
    }

    fn dispatch_human(&self, stage_run_id: i64, stage: &StageDefinition) -> Result<StageResult> {
        let human = stage.human.as_ref().expect("validated: human stage carries a human config");
        self.registry.upsert_human_stage_state(stage_run_id, wait_type_str(human.wait_type))?;
        Ok(StageResult::pending())
    }

    fn dispatch_delay(&self, stage: &StageDefinition) -> StageResult {
        // A real delay suspends the run until a reconciliation tick passes
        // the deadline; evaluating it synchronously here would block the
        // webhook handler for up to the full delay duration.
        match stage.delay.as_deref().and_then(super::models::parse_duration_seconds) {
            Some(_) => StageResult::pending(),
            None => StageResult::fail("delay stage has no parseable duration"),
        }
    }

    async fn dispatch_parallel(
        &self,
        ctx: &StageContext<'_>,
        stage: &StageDefinition,
        nesting_depth: usize,
    ) -> Result<StageResult> {
        let def = self
            .get_pipeline(ctx.pipeline_name)
            .ok_or_else(|| PipelineError::UnknownStage(ctx.pipeline_name.to_string()))?;
        let join = stage.join.unwrap_or(JoinStrategy::All);
        let mut outcomes = Vec::new();
        for branch in &stage.branches {
            let mut branch_passed = true;
            for branch_stage_id in &branch.stages {
                let branch_stage = def
                    .get_stage(branch_stage_id)
                    .ok_or_else(|| PipelineError::UnknownStage(branch_stage_id.clone()))?
                    .clone();
                let stage_run_id =
                    self.registry.create_stage_run(ctx.run_id, &branch_stage.id, stage_type_str(branch_stage.stage_type))?;
                self.registry.start_stage_run(stage_run_id, None)?;
                let result = Box::pin(self.dispatch_stage(ctx, &branch_stage, stage_run_id, nesting_depth + 1)).await?;
                match result.outcome {
                    StageOutcome::Pass => {
                        self.registry.complete_stage_run(stage_run_id, "completed", result.message.as_deref(), None)?;
                    }
                    StageOutcome::Fail => {
                        self.registry.complete_stage_run(stage_run_id, "failed", None, result.message.as_deref())?;
                        branch_passed = false;
                    }
                    StageOutcome::Pending => {
                        // A pending branch stage blocks the whole parallel
                        // gate; conservatively count it as not-yet-passed.
                        return Ok(StageResult::pending());
                    }
                }
            }
            outcomes.push(branch_passed);
        }
        let passed_count = outcomes.iter().filter(|p| **p).count();
        let passed = match join {
            JoinStrategy::All => outcomes.iter().all(|p| *p),
            JoinStrategy::Any => outcomes.iter().any(|p| *p),
            JoinStrategy::Majority => passed_count * 2 > outcomes.len(),
        };
        if passed {
            Ok(StageResult::pass())
        } else {
            Ok(StageResult::fail("parallel join strategy not satisfied"))
        }
    }

    async fn dispatch_sub_pipeline(
        &self,
        ctx: &StageContext<'_>,
        stage: &StageDefinition,
        nesting_depth: usize,
    ) -> Result<StageResult> {
        let sub_name = stage.sub_pipeline.as_ref().expect("validated: pipeline stage carries sub_pipeline");
        let sub_def = self
            .get_pipeline(sub_name)
            .ok_or_else(|| PipelineError::UnknownStage(sub_name.clone()))?;
        let sub_run_id = self.registry.create_run(
            &sub_def.name,
            scope_str(sub_def.scope),
            ctx.issue_number,
            ctx.pr_number,
            &ctx.run_context,
        )?;
        Box::pin(self.advance(sub_run_id, nesting_depth + 1)).await?;
        let sub_run = self.registry.get_run(sub_run_id)?;
        match sub_run.status.as_str() {
            "completed" => Ok(StageResult::pass()),
            "escalated" => Ok(StageResult::fail("sub-pipeline escalated")),
            _ => Ok(StageResult::pending()),
        }
    }

    /// Re-drives a parked run in response to something external finishing:
    /// an agent turn completed, a human responded, a gate timeout elapsed.
    /// `passed` decides whether the currently-parked stage resolves as a
    /// pass or a fail before the run continues advancing.
    pub async fn resume_stage(&self, run_id: i64, passed: bool, message: Option<String>) -> Result<()> {
        let run = self.registry.get_run(run_id)?;
        if run.status != "running" {
            return Ok(());
        }
        let Some(stage_id) = run.current_stage.clone() else {
            return Ok(());
        };
        let stage_runs = self.registry.list_stage_runs(run_id)?;
        let Some(stage_run) = stage_runs
            .iter()
            .rev()
            .find(|sr| sr.stage_id == stage_id && sr.status == "running")
        else {
            return Ok(());
        };
        let def = self
            .get_pipeline(&run.pipeline_name)
            .ok_or_else(|| PipelineError::UnknownStage(run.pipeline_name.clone()))?;
        let stage = def
            .get_stage(&stage_id)
            .ok_or_else(|| PipelineError::UnknownStage(stage_id.clone()))?
            .clone();

        if passed {
            self.registry.complete_stage_run(stage_run.stage_run_id, "completed", message.as_deref(), None)?;
            match stage.get_next_stage_id(true) {
                Some(COMPLETE) => {
                    self.registry.complete_run(run_id, "completed")?;
                }
                Some(ESCALATE) => {
                    self.registry.complete_run(run_id, "escalated")?;
                }
                Some(NEXT) | None => match def.get_next_stage(&stage_id) {
                    Some(next) => self.registry.update_run_stage(run_id, &next.id)?,
                    None => self.registry.complete_run(run_id, "completed")?,
                },
                Some(target) => self.registry.update_run_stage(run_id, target)?,
            }
        } else {
            self.registry.complete_stage_run(stage_run.stage_run_id, "failed", None, message.as_deref())?;
            self.handle_stage_error(run_id, stage_run.stage_run_id, &stage, &def)?;
        }

        Box::pin(self.advance(run_id, 0)).await
    }

    /// Handles a reactive `on_events` entry firing mid-run: cancels the run
    /// or jumps straight to the named stage, bypassing normal transition
    /// resolution.
    pub async fn on_event(&self, run_id: i64, event: &SquadronEvent) -> Result<bool> {
        let run = self.registry.get_run(run_id)?;
        if run.status != "running" {
            return Ok(false);
        }
        let def = self
            .get_pipeline(&run.pipeline_name)
            .ok_or_else(|| PipelineError::UnknownStage(run.pipeline_name.clone()))?;
        for reactive in &def.on_events {
            if reactive.event != event.event_type.as_str() {
                continue;
            }
            if let Some(want) = &reactive.action {
                if event.action.as_deref() != Some(want.as_str()) {
                    continue;
                }
            }
            if reactive.goto == COMPLETE {
                self.registry.complete_run(run_id, "completed")?;
            } else if reactive.goto == ESCALATE {
                self.registry.complete_run(run_id, "escalated")?;
            } else {
                self.registry.update_run_stage(run_id, &reactive.goto)?;
                self.advance(run_id, 0).await?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Cancels a run outright; used by the dashboard's cancel endpoint and
    /// by reconciliation when the underlying PR/issue closes.
    pub fn cancel_run(&self, run_id: i64) -> Result<()> {
        self.registry.complete_run(run_id, "cancelled")
    }
}

#[async_trait]
impl StageResumer for PipelineEngine {
    async fn resume_stage(&self, run_id: i64, passed: bool, message: Option<String>) -> Result<()> {
        PipelineEngine::resume_stage(self, run_id, passed, message).await
    }
}

fn stage_type_str(t: StageType) -> &'static str {
    match t {
        StageType::Agent => "agent",
        StageType::Gate => "gate",
        StageType::Human => "human",
        StageType::Parallel => "parallel",
        StageType::Delay => "delay",
        StageType::Action => "action",
        StageType::Webhook => "webhook",
        StageType::Pipeline => "pipeline",
    }
}

fn wait_type_str(t: HumanWaitType) -> &'static str {
    match t {
        HumanWaitType::Approval => "approval",
        HumanWaitType::Comment => "comment",
        HumanWaitType::Label => "label",
        HumanWaitType::Dismiss => "dismiss",
    }
}

fn scope_str(s: PipelineScope) -> &'static str {
    match s {
        PipelineScope::SinglePr | PipelineScope::MultiPr => "pr",
        PipelineScope::Issue => "issue",
    }
}

/// How long the reconciliation loop waits between sweeps for delay stages
/// and stale-sleeping agents. Kept here since both the engine's delay
/// stage and the reconciliation loop reason about the same cadence.
pub const RECONCILE_TICK: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{CombinedStatus, PrApprovalInfo, PullRequestInfo, RateLimitStatus, ReviewInfo};

    struct NullGitHub;

    #[async_trait]
    impl GitHubClient for NullGitHub {
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
                author: "a".into(),
                author_is_bot: false,
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
        async fn list_open_issues(&self, _: &str, _: &str) -> Result<Vec<crate::github::IssueSummary>> {
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

    struct NullDispatch;

    #[async_trait]
    impl StageDispatch for NullDispatch {
        async fn run_agent_stage(&self, _: &StageContext<'_>, _: &StageDefinition) -> Result<StageResult> {
            Ok(StageResult::pass())
        }
        async fn run_action_stage(&self, _: &StageContext<'_>, _: &StageDefinition) -> Result<StageResult> {
            Ok(StageResult::pass())
        }
        async fn run_webhook_stage(&self, _: &StageContext<'_>, _: &StageDefinition) -> Result<StageResult> {
            Ok(StageResult::pass())
        }
    }

    fn engine() -> PipelineEngine {
        PipelineEngine::new(
            Arc::new(Registry::open(":memory:").expect("open")),
            Arc::new(GateCheckRegistry::default()),
            Arc::new(NullGitHub),
            Arc::new(NullDispatch),
            "acme",
            "widgets",
            "main",
        )
    }

    fn sample_def() -> PipelineDefinition {
        serde_yaml::from_str(
            r#"
name: review
trigger:
  event: pull_request_opened
scope: single_pr
stages:
  - id: implement
    type: agent
    role: implementer
    on_pass: review_gate
  - id: review_gate
    type: gate
    gate:
      check: pr_approvals_met
    on_pass: __complete__
    on_fail: __escalate__
"#,
        )
        .expect("valid yaml")
    }

    #[tokio::test]
    async fn evaluate_event_starts_a_matching_run_and_parks_on_a_gate() {
        let engine = engine();
        engine.load_pipelines(vec![sample_def()]).expect("load");
        let event = crate::types::SquadronEvent {
            dedup_key: "d1".into(),
            event_type: crate::types::SquadronEventType::PullRequestOpened,
            action: Some("opened".into()),
            sender: "octocat".into(),
            is_bot_sender: false,
            repo_full_name: "acme/widgets".into(),
            issue_number: None,
            pr_number: Some(42),
            comment_body: None,
            comment_id: None,
            review_state: None,
            label: None,
            branch: None,
            raw: serde_json::json!({}),
            received_at: chrono::Utc::now(),
        };
        let started = engine.evaluate_event(&event).await.expect("evaluate");
        assert_eq!(started.len(), 1);
        let run = engine.registry.get_run(started[0]).expect("run");
        assert_eq!(run.status, "running");
        assert_eq!(run.current_stage.as_deref(), Some("review_gate"));
    }

    #[tokio::test]
    async fn duplicate_trigger_does_not_start_a_second_run() {
        let engine = engine();
        engine.load_pipelines(vec![sample_def()]).expect("load");
        let event = crate::types::SquadronEvent {
            dedup_key: "d1".into(),
            event_type: crate::types::SquadronEventType::PullRequestOpened,
            action: Some("opened".into()),
            sender: "octocat".into(),
            is_bot_sender: false,
            repo_full_name: "acme/widgets".into(),
            issue_number: None,
            pr_number: Some(42),
            comment_body: None,
            comment_id: None,
            review_state: None,
            label: None,
            branch: None,
            raw: serde_json::json!({}),
            received_at: chrono::Utc::now(),
        };
        engine.evaluate_event(&event).await.expect("first");
        let started_again = engine.evaluate_event(&event).await.expect("second");
        assert!(started_again.is_empty());
    }
}
