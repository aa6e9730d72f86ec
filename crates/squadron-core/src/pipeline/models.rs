//! Declarative pipeline/stage configuration, deserialized straight off
//! `pipelines/*.yaml`. One flat `StageDefinition` struct carries every
//! stage type's fields as `Option`s rather than a tagged enum — the YAML in
//! practice mixes fields loosely per stage, and this mirrors how the
//! teacher's own `PhaseConfig` models a phase: one struct, fields only
//! meaningful for the active `phase_type`.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    Agent,
    Gate,
    Human,
    Parallel,
    Delay,
    Action,
    Webhook,
    Pipeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineScope {
    SinglePr,
    MultiPr,
    Issue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    All,
    Any,
    Majority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanWaitType {
    Approval,
    Comment,
    Label,
    Dismiss,
}

/// Special stage-transition targets that do not name a real stage id.
pub const COMPLETE: &str = "__complete__";
pub const ESCALATE: &str = "__escalate__";
pub const NEXT: &str = "__next__";

/// `^[A-Za-z][A-Za-z0-9_-]*$`
pub fn is_valid_stage_id(id: &str) -> bool {
    let re = Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("valid regex");
    re.is_match(id)
}

/// `^\s*(\d+)\s*(s|m|h|d)\s*$`, e.g. `"30m"`, `"2h"`. Returns seconds.
pub fn parse_duration_seconds(spec: &str) -> Option<u64> {
    let re = Regex::new(r"^\s*(\d+)\s*(s|m|h|d)\s*$").expect("valid regex");
    let caps = re.captures(spec)?;
    let n: u64 = caps.get(1)?.as_str().parse().ok()?;
    let mult = match caps.get(2)?.as_str() {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return None,
    };
    Some(n * mult)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub event: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub branch_pattern: Option<String>,
}

impl TriggerDefinition {
    pub fn matches(&self, event_type: &str, action: Option<&str>, label: Option<&str>, branch: Option<&str>) -> bool {
        if self.event != event_type {
            return false;
        }
        if let Some(want) = &self.action {
            if action != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(want) = &self.label {
            if label != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(pattern) = &self.branch_pattern {
            let Some(branch) = branch else { return false };
            let re = match Regex::new(pattern) {
                Ok(re) => re,
                Err(_) => return false,
            };
            if !re.is_match(branch) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactiveEventConfig {
    pub event: String,
    #[serde(default)]
    pub action: Option<String>,
    /// Stage id (or special target) to jump to when this reactive event fires.
    pub goto: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConditionConfig {
    pub check: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateTimeoutConfig {
    pub after: String,
    pub goto: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorConfig {
    #[serde(default)]
    pub retry: Option<u32>,
    #[serde(default)]
    pub goto: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanNotifyConfig {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanStageConfig {
    pub wait_type: HumanWaitType,
    #[serde(default)]
    pub notify: Option<HumanNotifyConfig>,
    #[serde(default)]
    pub choices: Vec<String>,
    /// Role or team whose members' responses count (e.g. `maintainers`).
    #[serde(default)]
    pub from_group: Option<String>,
    /// Number of matching responses required before the stage completes.
    #[serde(default = "default_human_count")]
    pub count: u32,
    /// How often to re-post the entry notification while waiting.
    #[serde(default)]
    pub reminder_after: Option<String>,
}

fn default_human_count() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub id: String,
    pub stages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRequestConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

fn default_method() -> String {
    "POST".to_string()
}

/// One flat model covering all eight stage types. `@model_validator`-style
/// per-type required-field checks live in `StageDefinition::validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub stage_type: StageType,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub on_pass: Option<String>,
    #[serde(default)]
    pub on_fail: Option<String>,
    #[serde(default)]
    pub on_error: Option<ErrorConfig>,
    #[serde(default)]
    pub context: serde_json::Value,

    // agent
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub instruction: Option<String>,

    // gate
    #[serde(default)]
    pub gate: Option<GateConditionConfig>,
    #[serde(default)]
    pub gate_timeout: Option<GateTimeoutConfig>,

    // human
    #[serde(default)]
    pub human: Option<HumanStageConfig>,

    // parallel
    #[serde(default)]
    pub branches: Vec<ParallelBranch>,
    #[serde(default)]
    pub join: Option<JoinStrategy>,

    // delay
    #[serde(default)]
    pub delay: Option<String>,

    // action
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub action_params: serde_json::Value,

    // webhook
    #[serde(default)]
    pub webhook: Option<WebhookRequestConfig>,

    // pipeline (sub-pipeline)
    #[serde(default)]
    pub sub_pipeline: Option<String>,
}

impl StageDefinition {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !is_valid_stage_id(&self.id) {
            return Err(PipelineError::InvalidTransition(
                self.id.clone(),
                "stage id does not match [A-Za-z][A-Za-z0-9_-]*".into(),
            ));
        }
        let missing = |field: &str| {
            PipelineError::InvalidTransition(self.id.clone(), format!("missing required field {field:?} for stage type {:?}", self.stage_type))
        };
        match self.stage_type {
            StageType::Agent => {
                if self.role.is_none() {
                    return Err(missing("role"));
                }
            }
            StageType::Gate => {
                if self.gate.is_none() {
                    return Err(missing("gate"));
                }
            }
            StageType::Human => {
                if self.human.is_none() {
                    return Err(missing("human"));
                }
            }
            StageType::Parallel => {
                if self.branches.is_empty() {
                    return Err(missing("branches"));
                }
            }
            StageType::Delay => {
                if self.delay.is_none() {
                    return Err(missing("delay"));
                }
            }
            StageType::Action => {
                if self.action.is_none() {
                    return Err(missing("action"));
                }
            }
            StageType::Webhook => {
                if self.webhook.is_none() {
                    return Err(missing("webhook"));
                }
            }
            StageType::Pipeline => {
                if self.sub_pipeline.is_none() {
                    return Err(missing("sub_pipeline"));
                }
            }
        }
        Ok(())
    }

    pub fn timeout_seconds(&self) -> Option<u64> {
        self.timeout.as_deref().and_then(parse_duration_seconds)
    }

    /// Resolves the next stage id for a pass/fail outcome, honoring the
    /// special `__complete__`/`__escalate__`/`__next__` targets.
    pub fn get_next_stage_id(&self, passed: bool) -> Option<&str> {
        if passed {
            self.on_pass.as_deref()
        } else {
            self.on_fail.as_deref()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub trigger: TriggerDefinition,
    pub scope: PipelineScope,
    pub stages: Vec<StageDefinition>,
    #[serde(default)]
    pub on_events: Vec<ReactiveEventConfig>,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub on_complete: Option<String>,
    #[serde(default)]
    pub on_error: Option<String>,
}

impl PipelineDefinition {
    pub fn validate_unique_stage_ids(&self) -> Result<(), PipelineError> {
        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id.clone()) {
                return Err(PipelineError::DuplicateStageId(stage.id.clone(), self.name.clone()));
            }
        }
        Ok(())
    }

    pub fn get_stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn get_stage_index(&self, id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == id)
    }

    pub fn get_next_stage(&self, id: &str) -> Option<&StageDefinition> {
        let idx = self.get_stage_index(id)?;
        self.stages.get(idx + 1)
    }

    /// Every named transition target actually resolves to a real stage id
    /// or one of the three special targets.
    pub fn validate_stage_references(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let known: std::collections::HashSet<&str> = self.stages.iter().map(|s| s.id.as_str()).collect();
        let mut check = |from: &str, target: &str| {
            if target != COMPLETE && target != ESCALATE && target != NEXT && !known.contains(target) {
                errors.push(format!("stage {from:?} references unknown stage {target:?}"));
            }
        };
        for stage in &self.stages {
            if let Some(t) = &stage.on_pass {
                check(&stage.id, t);
            }
            if let Some(t) = &stage.on_fail {
                check(&stage.id, t);
            }
            if let Some(err) = &stage.on_error {
                if let Some(t) = &err.goto {
                    check(&stage.id, t);
                }
            }
            if let Some(gt) = &stage.gate_timeout {
                check(&stage.id, &gt.goto);
            }
            for branch in &stage.branches {
                for s in &branch.stages {
                    if !known.contains(s.as_str()) {
                        errors.push(format!("parallel branch {:?} references unknown stage {s:?}", branch.id));
                    }
                }
            }
        }
        for reactive in &self.on_events {
            check("on_events", &reactive.goto);
        }
        errors
    }

    pub fn sub_pipeline_refs(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.stage_type == StageType::Pipeline)
            .filter_map(|s| s.sub_pipeline.as_deref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_grammar_parses_units() {
        assert_eq!(parse_duration_seconds("30s"), Some(30));
        assert_eq!(parse_duration_seconds("5m"), Some(300));
        assert_eq!(parse_duration_seconds("2h"), Some(7200));
        assert_eq!(parse_duration_seconds("1d"), Some(86400));
        assert_eq!(parse_duration_seconds("nope"), None);
    }

    #[test]
    fn stage_id_grammar_rejects_leading_digit() {
        assert!(is_valid_stage_id("review_pr"));
        assert!(!is_valid_stage_id("1stage"));
        assert!(!is_valid_stage_id(""));
    }

    #[test]
    fn stage_reference_validation_flags_unknown_target() {
        let def = PipelineDefinition {
            name: "p".into(),
            trigger: TriggerDefinition { event: "pull_request".into(), action: None, label: None, branch_pattern: None },
            scope: PipelineScope::SinglePr,
            stages: vec![StageDefinition {
                id: "review".into(),
                stage_type: StageType::Agent,
                condition: None,
                timeout: None,
                on_pass: Some("does_not_exist".into()),
                on_fail: None,
                on_error: None,
                context: serde_json::json!({}),
                role: Some("reviewer".into()),
                instruction: None,
                gate: None,
                gate_timeout: None,
                human: None,
                branches: vec![],
                join: None,
                delay: None,
                action: None,
                action_params: serde_json::json!({}),
                webhook: None,
                sub_pipeline: None,
            }],
            on_events: vec![],
            context: serde_json::json!({}),
            on_complete: None,
            on_error: None,
        };
        let errors = def.validate_stage_references();
        assert_eq!(errors.len(), 1);
    }
}
