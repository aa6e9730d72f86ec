use thiserror::Error;

/// Typed errors from the Registry, matched by callers rather than inspected
/// as opaque `anyhow::Error`s — the Agent Manager and Pipeline Engine both
/// branch on `AlreadyExists`/`NotFound`/`CycleDetected` to decide recovery
/// behavior rather than failing the whole turn.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("cycle detected adding blocker {blocker} to agent {agent_id}")]
    CycleDetected { agent_id: i64, blocker: i64 },
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown stage id {0:?}")]
    UnknownStage(String),
    #[error("invalid transition from stage {0:?}: {1}")]
    InvalidTransition(String, String),
    #[error("sub-pipeline nesting too deep (limit {0})")]
    NestingTooDeep(usize),
    #[error("duplicate stage id {0:?} in pipeline {1:?}")]
    DuplicateStageId(String, String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("missing required field {0:?}")]
    MissingField(String),
    #[error("unknown role {0:?} referenced in {1}")]
    UnknownRole(String, String),
}
