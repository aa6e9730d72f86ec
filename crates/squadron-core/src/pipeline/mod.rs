//! Declarative, event-driven pipeline execution: YAML-defined stage graphs
//! evaluated against GitHub webhook events and gate/human/agent outcomes.

pub mod engine;
pub mod gates;
pub mod models;

pub use engine::{PipelineEngine, StageOutcome, StageResult};
pub use gates::{GateCheckContext, GateCheckFn, GateCheckRegistry, GateCheckResult};
pub use models::{
    ErrorConfig, GateConditionConfig, GateTimeoutConfig, HumanNotifyConfig, HumanStageConfig,
    HumanWaitType, JoinStrategy, ParallelBranch, PipelineDefinition, PipelineScope,
    ReactiveEventConfig, StageDefinition, StageType, TriggerDefinition, WebhookRequestConfig,
    COMPLETE, ESCALATE, NEXT,
};
