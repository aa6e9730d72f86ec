//! Project configuration: a `config.yaml` plus `agents/*.md` role files and
//! `pipelines/*.yaml` definitions, all read from a single project directory.
//! Secrets (GitHub App credentials, the dashboard API key) never live in
//! these files — they come from the environment, read with the same
//! dotenv-then-env-var layering the CLI backends use for credentials.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::pipeline::PipelineDefinition;

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: u32,
    #[serde(default = "default_reconcile_interval_s")]
    pub reconcile_interval_s: u64,
    #[serde(default = "default_stale_sleeping_after_s")]
    pub stale_sleeping_after_s: i64,
    #[serde(default = "default_activity_retain_days")]
    pub activity_retain_days: i64,
}

fn default_branch() -> String {
    "main".to_string()
}
fn default_max_concurrent_agents() -> u32 {
    4
}
fn default_reconcile_interval_s() -> u64 {
    30
}
fn default_stale_sleeping_after_s() -> i64 {
    86_400
}
fn default_activity_retain_days() -> i64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// L1: a single turn is suspended after this many tool calls.
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,
    /// L2: a single turn is killed after this many seconds regardless of
    /// tool-call count.
    #[serde(default = "default_max_turn_duration_s")]
    pub max_turn_duration_s: u64,
}

fn default_max_tool_calls() -> u32 {
    60
}
fn default_max_turn_duration_s() -> u64 {
    1800
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { max_tool_calls: default_max_tool_calls(), max_turn_duration_s: default_max_turn_duration_s() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandsConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "/squadron".to_string()
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self { prefix: default_prefix() }
    }
}

/// Drives Recovery's GitHub-state reconstruction: which label or branch
/// prefix identifies which role owns an issue/PR after a restart.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelsConfig {
    #[serde(default)]
    pub role_labels: HashMap<String, String>,
    #[serde(default)]
    pub role_branch_prefixes: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_mode")]
    pub mode: String,
    #[serde(default = "default_docker_image")]
    pub docker_image: String,
}

fn default_sandbox_mode() -> String {
    "auto".to_string()
}
fn default_docker_image() -> String {
    "squadron-agent".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self { mode: default_sandbox_mode(), docker_image: default_docker_image() }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigYaml {
    runtime: RuntimeConfig,
    #[serde(default)]
    circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    commands: CommandsConfig,
    #[serde(default)]
    labels: LabelsConfig,
    #[serde(default)]
    sandbox: SandboxConfig,
}

/// One of the Agent Manager's config-driven triggers: registered on the
/// Event Router for this role at startup. `action` picks which lifecycle
/// transition fires when `event` (and, if present, `condition`) matches —
/// `spawn` (default), `sleep`, `wake`, or `complete`.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleTriggerConfig {
    pub event: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default = "default_trigger_action")]
    pub action: String,
}

fn default_trigger_action() -> String {
    "spawn".to_string()
}

/// One `agents/<role>.md` file: YAML frontmatter between `---` markers,
/// then a markdown body used verbatim as the role's base system prompt.
#[derive(Debug, Clone)]
pub struct RoleConfig {
    pub name: String,
    pub model: Option<String>,
    pub allowed_tools: Option<String>,
    pub wake_on_labels: Vec<String>,
    /// At most one non-terminal agent of this role may exist at a time.
    pub singleton: bool,
    pub triggers: Vec<RoleTriggerConfig>,
    /// Overrides the project's `circuit_breaker` defaults for agents of
    /// this role only; `None` means inherit the global config.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub prompt: String,
}

/// Resolves a role's effective circuit breaker: its own override if
/// present, else the project-wide default.
pub fn effective_circuit_breaker(role: &RoleConfig, global: &CircuitBreakerConfig) -> CircuitBreakerConfig {
    role.circuit_breaker.clone().unwrap_or_else(|| global.clone())
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RoleFrontmatter {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    allowed_tools: Option<String>,
    #[serde(default)]
    wake_on_labels: Vec<String>,
    #[serde(default)]
    singleton: bool,
    #[serde(default)]
    triggers: Vec<RoleTriggerConfig>,
    #[serde(default)]
    circuit_breaker: Option<CircuitBreakerConfig>,
}

fn split_frontmatter(contents: &str) -> (&str, &str) {
    let Some(rest) = contents.strip_prefix("---\n") else {
        return ("", contents);
    };
    match rest.find("\n---\n") {
        Some(end) => (&rest[..end], rest[end + 5..].trim_start_matches('\n')),
        None => ("", contents),
    }
}

fn load_role(path: &Path) -> Result<RoleConfig> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string();
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let (frontmatter_src, body) = split_frontmatter(&contents);
    let frontmatter: RoleFrontmatter = if frontmatter_src.is_empty() {
        RoleFrontmatter::default()
    } else {
        serde_yaml::from_str(frontmatter_src)
            .map_err(|e| ConfigError::Parse { path: path.display().to_string(), source: e })?
    };
    Ok(RoleConfig {
        name,
        model: frontmatter.model,
        allowed_tools: frontmatter.allowed_tools,
        wake_on_labels: frontmatter.wake_on_labels,
        singleton: frontmatter.singleton,
        triggers: frontmatter.triggers,
        circuit_breaker: frontmatter.circuit_breaker,
        prompt: body.to_string(),
    })
}

fn load_roles(dir: &Path) -> Result<HashMap<String, RoleConfig>> {
    let mut roles = HashMap::new();
    if !dir.is_dir() {
        return Ok(roles);
    }
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let role = load_role(&path)?;
        roles.insert(role.name.clone(), role);
    }
    Ok(roles)
}

fn load_pipelines(dir: &Path) -> Result<Vec<PipelineDefinition>> {
    let mut defs = Vec::new();
    for candidate in ["pipelines", "workflows"] {
        let dir = dir.join(candidate);
        if !dir.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
            let entry = entry?;
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if ext != Some("yaml") && ext != Some("yml") {
                continue;
            }
            let contents = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let def: PipelineDefinition = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::Parse { path: path.display().to_string(), source: e })?;
            defs.push(def);
        }
    }
    Ok(defs)
}

/// Everything needed to run a project: runtime settings, role prompts and
/// the pipeline graph, all read from one directory tree.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub runtime: RuntimeConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub commands: CommandsConfig,
    pub labels: LabelsConfig,
    pub sandbox: SandboxConfig,
    pub roles: HashMap<String, RoleConfig>,
    pub pipelines: Vec<PipelineDefinition>,
}

impl ProjectConfig {
    pub fn load(project_dir: impl AsRef<Path>) -> Result<Self> {
        let project_dir = project_dir.as_ref();
        let config_path = project_dir.join("config.yaml");
        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        let parsed: ConfigYaml = serde_yaml::from_str(&contents)
            .map_err(|e| ConfigError::Parse { path: config_path.display().to_string(), source: e })?;
        let roles = load_roles(&project_dir.join("agents"))?;
        let pipelines = load_pipelines(project_dir)?;

        for def in &pipelines {
            for stage in &def.stages {
                if let Some(role) = &stage.role {
                    if !roles.contains_key(role) {
                        return Err(ConfigError::UnknownRole(role.clone(), def.name.clone()).into());
                    }
                }
            }
        }

        Ok(Self {
            runtime: parsed.runtime,
            circuit_breaker: parsed.circuit_breaker,
            commands: parsed.commands,
            labels: parsed.labels,
            sandbox: parsed.sandbox,
            roles,
            pipelines,
        })
    }

    pub fn known_roles(&self) -> Vec<String> {
        self.roles.keys().cloned().collect()
    }
}

/// GitHub App credentials and other secrets, layered env-var-over-dotenv
/// the same way the teacher's credential loader does.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub github_app_id: String,
    pub github_private_key: String,
    pub github_webhook_secret: String,
    pub github_installation_id: String,
    /// Pre-obtained token (a classic PAT, or an installation token minted
    /// out of band) handed straight to the REST client. This crate does
    /// not perform the JWT→installation-token exchange itself.
    pub github_token: String,
    pub repo_url: String,
    /// Local checkout the `WorktreeProvisioner` creates per-agent worktrees
    /// under; a pre-existing clone, not something this crate clones itself.
    pub repo_path: String,
    pub default_branch: String,
    pub data_dir: String,
    pub dashboard_api_key: Option<String>,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

impl Secrets {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();
        let data_dir = get_str("SQUADRON_DATA_DIR", &dotenv, "./data");
        let github_app_id = get_str("GITHUB_APP_ID", &dotenv, "");
        let github_private_key = get(
            "GITHUB_PRIVATE_KEY",
            &dotenv,
        )
        .or_else(|| {
            get("GITHUB_PRIVATE_KEY_PATH", &dotenv).and_then(|p| std::fs::read_to_string(PathBuf::from(p)).ok())
        })
        .unwrap_or_default();
        Ok(Self {
            github_app_id,
            github_private_key,
            github_webhook_secret: get_str("GITHUB_WEBHOOK_SECRET", &dotenv, ""),
            github_installation_id: get_str("GITHUB_INSTALLATION_ID", &dotenv, ""),
            github_token: get_str("GITHUB_TOKEN", &dotenv, ""),
            repo_url: get_str("SQUADRON_REPO_URL", &dotenv, ""),
            repo_path: get_str("SQUADRON_REPO_PATH", &dotenv, "./repo"),
            default_branch: get_str("SQUADRON_DEFAULT_BRANCH", &dotenv, "main"),
            data_dir,
            dashboard_api_key: get("SQUADRON_DASHBOARD_API_KEY", &dotenv).filter(|s| !s.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_frontmatter_and_body() {
        let doc = "---\nmodel: opus\n---\nYou are the reviewer.\n";
        let (fm, body) = split_frontmatter(doc);
        assert_eq!(fm, "model: opus");
        assert_eq!(body, "You are the reviewer.\n");
    }

    #[test]
    fn missing_frontmatter_is_treated_as_pure_body() {
        let doc = "You are the reviewer.\n";
        let (fm, body) = split_frontmatter(doc);
        assert_eq!(fm, "");
        assert_eq!(body, doc);
    }
}
