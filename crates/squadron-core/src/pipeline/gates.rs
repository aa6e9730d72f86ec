//! Pluggable gate-check registry. Each named check inspects GitHub/CI state
//! (or runs a shell command) and returns pass/fail plus an optional message;
//! an exception from a check is itself a failed check, never a crash.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::github::GitHubClient;
use crate::registry::Registry;

pub struct GateCheckContext<'a> {
    pub params: serde_json::Value,
    pub pr_number: Option<i64>,
    pub issue_number: Option<i64>,
    pub owner: String,
    pub repo: String,
    pub base_branch: String,
    pub head_branch: String,
    pub run_context: serde_json::Value,
    pub github: &'a dyn GitHubClient,
    pub registry: &'a Registry,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateCheckResult {
    pub passed: bool,
    pub error_message: Option<String>,
}

impl GateCheckResult {
    pub fn pass() -> Self {
        Self { passed: true, error_message: None }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self { passed: false, error_message: Some(message.into()) }
    }
}

#[async_trait]
pub trait GateCheckFn: Send + Sync {
    async fn evaluate(&self, ctx: &GateCheckContext<'_>) -> Result<GateCheckResult>;
}

pub struct GateCheckRegistry {
    checks: HashMap<String, Arc<dyn GateCheckFn>>,
}

impl Default for GateCheckRegistry {
    fn default() -> Self {
        let mut registry = Self { checks: HashMap::new() };
        registry.register("file_exists", Arc::new(FileExistsCheck));
        registry.register("pr_approvals_met", Arc::new(PrApprovalsMetCheck));
        registry.register("no_changes_requested", Arc::new(NoChangesRequestedCheck));
        registry.register("human_approved", Arc::new(HumanApprovedCheck));
        registry.register("label_present", Arc::new(LabelPresentCheck));
        registry.register("ci_status", Arc::new(CiStatusCheck));
        registry.register("branch_up_to_date", Arc::new(BranchUpToDateCheck));
        registry.register("command", Arc::new(CommandCheck));
        registry
    }
}

impl GateCheckRegistry {
    pub fn register(&mut self, name: &str, check: Arc<dyn GateCheckFn>) {
        self.checks.insert(name.to_string(), check);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GateCheckFn>> {
        self.checks.get(name).cloned()
    }

    pub fn list_checks(&self) -> Vec<&str> {
        self.checks.keys().map(String::as_str).collect()
    }

    /// Looks up and runs `name`; an unknown check name or a propagated error
    /// both collapse into a failed `GateCheckResult` rather than a panic —
    /// gate evaluation must never crash the Pipeline Engine's tick loop.
    pub async fn evaluate(&self, name: &str, ctx: &GateCheckContext<'_>) -> GateCheckResult {
        let Some(check) = self.get(name) else {
            return GateCheckResult::fail(format!("unknown gate check {name:?}"));
        };
        match check.evaluate(ctx).await {
            Ok(result) => result,
            Err(err) => GateCheckResult::fail(format!("gate check {name:?} raised: {err}")),
        }
    }
}

// ── Built-in checks ─────────────────────────────────────────────────────

struct FileExistsCheck;

#[async_trait]
impl GateCheckFn for FileExistsCheck {
    async fn evaluate(&self, ctx: &GateCheckContext<'_>) -> Result<GateCheckResult> {
        let path = ctx
            .params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("file_exists requires a `path` param"))?;
        let worktree_relative = ctx
            .params
            .get("worktree")
            .and_then(|v| v.as_str())
            .unwrap_or(".");
        let full = std::path::Path::new(worktree_relative).join(path);
        Ok(if full.exists() {
            GateCheckResult::pass()
        } else {
            GateCheckResult::fail(format!("file {path} does not exist"))
        })
    }
}

/// Drives invariant 5 directly: merge-readiness is decided from the
/// internal `pr_requirements`/`pr_approvals` tables, never from the raw
/// GitHub review list, since a rejected `submit_pr_review` call (S5) must
/// still be able to block merge via a recorded `changes_requested` row.
struct PrApprovalsMetCheck;

#[async_trait]
impl GateCheckFn for PrApprovalsMetCheck {
    async fn evaluate(&self, ctx: &GateCheckContext<'_>) -> Result<GateCheckResult> {
        let Some(pr_number) = ctx.pr_number else {
            return Ok(GateCheckResult::fail("no pr_number in context"));
        };
        if ctx.registry.check_pr_merge_ready(pr_number)? {
            Ok(GateCheckResult::pass())
        } else {
            Ok(GateCheckResult::fail(format!("pr #{pr_number} is not merge-ready")))
        }
    }
}

struct NoChangesRequestedCheck;

#[async_trait]
impl GateCheckFn for NoChangesRequestedCheck {
    async fn evaluate(&self, ctx: &GateCheckContext<'_>) -> Result<GateCheckResult> {
        let Some(pr_number) = ctx.pr_number else {
            return Ok(GateCheckResult::fail("no pr_number in context"));
        };
        let has_changes_requested = ctx
            .registry
            .get_pr_approvals(pr_number, false)?
            .iter()
            .any(|a| a.state == crate::types::PrApprovalState::ChangesRequested);
        if has_changes_requested {
            Ok(GateCheckResult::fail("a review is requesting changes"))
        } else {
            Ok(GateCheckResult::pass())
        }
    }
}

struct HumanApprovedCheck;

#[async_trait]
impl GateCheckFn for HumanApprovedCheck {
    async fn evaluate(&self, ctx: &GateCheckContext<'_>) -> Result<GateCheckResult> {
        let Some(pr_number) = ctx.pr_number else {
            return Ok(GateCheckResult::fail("no pr_number in context"));
        };
        let approvals = ctx.github.get_pr_approvals(&ctx.owner, &ctx.repo, pr_number).await?;
        if approvals.iter().any(|a| a.is_human) {
            Ok(GateCheckResult::pass())
        } else {
            Ok(GateCheckResult::fail("no human approval recorded"))
        }
    }
}

struct LabelPresentCheck;

#[async_trait]
impl GateCheckFn for LabelPresentCheck {
    async fn evaluate(&self, ctx: &GateCheckContext<'_>) -> Result<GateCheckResult> {
        let labels: Vec<String> = if let Some(pr) = ctx.pr_number {
            ctx.github.get_pull_request_labels(&ctx.owner, &ctx.repo, pr).await?
        } else if let Some(issue) = ctx.issue_number {
            ctx.github.get_issue_labels(&ctx.owner, &ctx.repo, issue).await?
        } else {
            return Ok(GateCheckResult::fail("no pr_number or issue_number in context"));
        };

        if let Some(label) = ctx.params.get("label").and_then(|v| v.as_str()) {
            return Ok(single_label_result(&labels, label));
        }
        if let Some(all_of) = ctx.params.get("all_of").and_then(|v| v.as_array()) {
            let names: Vec<&str> = all_of.iter().filter_map(|v| v.as_str()).collect();
            return Ok(if names.iter().all(|n| labels.iter().any(|l| l == n)) {
                GateCheckResult::pass()
            } else {
                GateCheckResult::fail(format!("missing one or more of labels {names:?}"))
            });
        }
        if let Some(any_of) = ctx.params.get("any_of").and_then(|v| v.as_array()) {
            let names: Vec<&str> = any_of.iter().filter_map(|v| v.as_str()).collect();
            return Ok(if names.iter().any(|n| labels.iter().any(|l| l == n)) {
                GateCheckResult::pass()
            } else {
                GateCheckResult::fail(format!("none of labels {names:?} present"))
            });
        }
        Ok(GateCheckResult::fail("label_present requires `label`, `all_of` or `any_of`"))
    }
}

fn single_label_result(labels: &[String], want: &str) -> GateCheckResult {
    if labels.iter().any(|l| l == want) {
        GateCheckResult::pass()
    } else {
        GateCheckResult::fail(format!("label {want:?} not present"))
    }
}

struct CiStatusCheck;

#[async_trait]
impl GateCheckFn for CiStatusCheck {
    async fn evaluate(&self, ctx: &GateCheckContext<'_>) -> Result<GateCheckResult> {
        let Some(pr_number) = ctx.pr_number else {
            return Ok(GateCheckResult::fail("no pr_number in context"));
        };
        let status = ctx.github.get_combined_status(&ctx.owner, &ctx.repo, pr_number).await?;
        if let Some(required) = ctx.params.get("required_contexts").and_then(|v| v.as_array()) {
            let names: Vec<&str> = required.iter().filter_map(|v| v.as_str()).collect();
            let all_success = names.iter().all(|name| {
                status.contexts.iter().any(|c| c.context == *name && c.state == "success")
            });
            return Ok(if all_success {
                GateCheckResult::pass()
            } else {
                GateCheckResult::fail(format!("required contexts not all green: {names:?}"))
            });
        }
        if status.overall_state == "success" {
            Ok(GateCheckResult::pass())
        } else {
            Ok(GateCheckResult::fail(format!("overall CI state is {}", status.overall_state)))
        }
    }
}

struct BranchUpToDateCheck;

#[async_trait]
impl GateCheckFn for BranchUpToDateCheck {
    async fn evaluate(&self, ctx: &GateCheckContext<'_>) -> Result<GateCheckResult> {
        let Some(pr_number) = ctx.pr_number else {
            return Ok(GateCheckResult::fail("no pr_number in context"));
        };
        let info = ctx.github.get_pull_request(&ctx.owner, &ctx.repo, pr_number).await?;
        match info.mergeable_state.as_deref() {
            Some("behind") => Ok(GateCheckResult::fail("branch is behind the base branch")),
            _ => Ok(GateCheckResult::pass()),
        }
    }
}

struct CommandCheck;

#[async_trait]
impl GateCheckFn for CommandCheck {
    async fn evaluate(&self, ctx: &GateCheckContext<'_>) -> Result<GateCheckResult> {
        let command = ctx
            .params
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("command gate requires a `command` param"))?;
        let cwd = ctx.params.get("cwd").and_then(|v| v.as_str()).unwrap_or(".");
        let expect = ctx.params.get("expect").and_then(|v| v.as_str()).unwrap_or("exit_code == 0");

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .output()
            .await?;
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        Ok(eval_command_expect(expect, exit_code, &stdout))
    }
}

/// Parses the small expectation grammar used by the `command` gate:
/// `"exit_code == 0"` or `"stdout_contains: <text>"`.
fn eval_command_expect(expect: &str, exit_code: i32, stdout: &str) -> GateCheckResult {
    if let Some(rest) = expect.strip_prefix("stdout_contains:") {
        let needle = rest.trim();
        return if stdout.contains(needle) {
            GateCheckResult::pass()
        } else {
            GateCheckResult::fail(format!("stdout did not contain {needle:?}"))
        };
    }
    if let Some(rest) = expect.strip_prefix("exit_code ==") {
        if let Ok(want) = rest.trim().parse::<i32>() {
            return if exit_code == want {
                GateCheckResult::pass()
            } else {
                GateCheckResult::fail(format!("exit code {exit_code} != {want}"))
            };
        }
    }
    GateCheckResult::fail(format!("unrecognised expect grammar: {expect:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_expect_exit_code() {
        let result = eval_command_expect("exit_code == 0", 0, "");
        assert!(result.passed);
        let result = eval_command_expect("exit_code == 0", 1, "");
        assert!(!result.passed);
    }

    #[test]
    fn command_expect_stdout_contains() {
        let result = eval_command_expect("stdout_contains: OK", 0, "build OK done");
        assert!(result.passed);
        let result = eval_command_expect("stdout_contains: FAIL", 0, "build OK done");
        assert!(!result.passed);
    }
}
