mod github_client;
mod logging;
mod routes;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use clap::Parser;
use squadron_agent::{ClaudeBackend, GitWorktreeProvisioner, RolePromptBuilder};
use squadron_core::activity::ActivityLog;
use squadron_core::agent_manager::{AgentManager, NoopPreSleepHook, StageResumer};
use squadron_core::config::{ProjectConfig, Secrets};
use squadron_core::event_router::{EventHandler, EventRouter};
use squadron_core::github::GitHubClient;
use squadron_core::pipeline::engine::{PipelineEngine, StageDispatch};
use squadron_core::pipeline::gates::GateCheckRegistry;
use squadron_core::reconciliation::ReconciliationLoop;
use squadron_core::recovery::Recovery;
use squadron_core::registry::Registry;
use squadron_core::sandbox::{AgentSandbox, Sandbox};
use squadron_core::types::SquadronEvent;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use github_client::RestGitHubClient;

/// Event dispatch queue depth: how many raw webhook deliveries can be
/// buffered between the HTTP handler accepting a POST and the processing
/// loop draining it. A delivery only blocks the HTTP response while this
/// is full, never while an individual handler runs.
const EVENT_QUEUE_CAPACITY: usize = 256;
const DEDUP_CAPACITY: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "squadron-server", about = "GitHub-native multi-agent orchestration server")]
struct Cli {
    /// Directory containing config.yaml, agents/*.md and pipelines/*.yaml.
    #[arg(long, default_value = "./project", env = "SQUADRON_PROJECT_DIR")]
    project_dir: String,

    /// Bind address for the HTTP server.
    #[arg(long, default_value = "0.0.0.0:8080", env = "SQUADRON_BIND")]
    bind: String,
}

pub struct AppState {
    pub registry: Arc<Registry>,
    pub activity: Arc<ActivityLog>,
    pub agents: Arc<AgentManager>,
    pub pipelines: Arc<PipelineEngine>,
    pub event_router: Arc<EventRouter>,
    pub config: Arc<ProjectConfig>,
    pub webhook_secret: String,
    pub dashboard_api_key: Option<String>,
    pub start_time: Instant,
}

/// Bridges the `EventRouter`'s handler-fan-out model to `PipelineEngine`,
/// which is driven by run id rather than being itself an `EventHandler`:
/// every event both can start new runs (`evaluate_event`) and can jump an
/// already-running run to a reactive `on_events` target (`on_event`).
struct PipelineEventHandler {
    engine: Arc<PipelineEngine>,
    registry: Arc<Registry>,
}

#[async_trait]
impl EventHandler for PipelineEventHandler {
    fn name(&self) -> &str {
        "pipeline_engine"
    }

    async fn handle(&self, event: &SquadronEvent) -> Result<()> {
        self.engine.evaluate_event(event).await?;

        let run_ids = if let Some(pr) = event.pr_number {
            self.registry.runs_for_pr(pr)?
        } else {
            self.registry.list_runs(Some("running"))?.into_iter().map(|r| r.run_id).collect()
        };
        for run_id in run_ids {
            if let Err(err) = self.engine.on_event(run_id, event).await {
                warn!(run_id, error = %err, "pipeline on_event handling failed");
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let (log_tx, _log_rx) = tokio::sync::broadcast::channel::<String>(1024);
    let log_ring = Arc::new(std::sync::Mutex::new(std::collections::VecDeque::with_capacity(500)));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "squadron_server=info,squadron_core=info,squadron_agent=info,tower_http=warn".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logging::BroadcastLayer { tx: log_tx.clone(), ring: Arc::clone(&log_ring) })
        .init();

    let cli = Cli::parse();
    let secrets = Secrets::from_env().context("loading secrets from environment")?;
    let config = Arc::new(ProjectConfig::load(&cli.project_dir).context("loading project config")?);

    std::fs::create_dir_all(&secrets.data_dir).context("creating data dir")?;
    let db_path = format!("{}/squadron.db", secrets.data_dir);
    let registry = Arc::new(Registry::open(&db_path).context("opening registry")?);
    registry.migrate().context("running registry migrations")?;

    let activity = Arc::new(ActivityLog::new(Arc::clone(&registry)));

    if secrets.github_token.is_empty() {
        warn!("GITHUB_TOKEN is not set; GitHub API calls will be made unauthenticated and will likely fail");
    }
    let github: Arc<dyn GitHubClient> = Arc::new(RestGitHubClient::new(secrets.github_token.clone()));

    let sandbox_mode = Sandbox::detect(&config.sandbox.mode).await;
    let sandbox = Arc::new(AgentSandbox::new(sandbox_mode.clone(), config.sandbox.docker_image.clone(), secrets.data_dir.clone()));

    let worktrees = Arc::new(GitWorktreeProvisioner::new(secrets.repo_path.clone()));
    let session_backend = Arc::new(ClaudeBackend::new("claude", sandbox_mode, config.sandbox.docker_image.clone()));
    let prompts = Arc::new(RolePromptBuilder);
    let pre_sleep = Arc::new(NoopPreSleepHook);

    let agents = AgentManager::new(
        Arc::clone(&registry),
        Arc::clone(&activity),
        Arc::clone(&config),
        Arc::clone(&github),
        session_backend,
        worktrees,
        sandbox,
        prompts,
        pre_sleep,
    );

    let gates = Arc::new(GateCheckRegistry::default());
    let pipelines = Arc::new(PipelineEngine::new(
        Arc::clone(&registry),
        gates,
        Arc::clone(&github),
        Arc::clone(&agents) as Arc<dyn StageDispatch>,
        config.runtime.owner.clone(),
        config.runtime.repo.clone(),
        config.runtime.default_branch.clone(),
    ));
    pipelines.load_pipelines(config.pipelines.clone()).context("loading pipeline definitions")?;
    agents.set_resumer(Arc::clone(&pipelines) as Arc<dyn StageResumer>).await;

    let (queue_tx, mut queue_rx) = tokio::sync::mpsc::channel(EVENT_QUEUE_CAPACITY);
    let event_router = Arc::new(EventRouter::new(DEDUP_CAPACITY, queue_tx));
    event_router.register(Arc::clone(&agents) as Arc<dyn EventHandler>);
    event_router.register(Arc::new(PipelineEventHandler { engine: Arc::clone(&pipelines), registry: Arc::clone(&registry) }));

    // Recovery runs once, to completion, before the server accepts webhook
    // traffic or the reconciliation loop starts sweeping.
    let recovery = Recovery::new(Arc::clone(&registry), Arc::clone(&github), Arc::clone(&config));
    recovery.run().await.context("startup recovery failed")?;

    {
        let router = Arc::clone(&event_router);
        tokio::spawn(async move {
            while let Some(envelope) = queue_rx.recv().await {
                let Some(event) = router.parse_and_dedup(&envelope) else { continue };
                router.dispatch(&event).await;
            }
        });
    }

    {
        let reconciliation =
            Arc::new(ReconciliationLoop::new(Arc::clone(&registry), Arc::clone(&agents), Arc::clone(&github), Arc::clone(&config)));
        tokio::spawn(reconciliation.run());
    }

    let state = Arc::new(AppState {
        registry,
        activity,
        agents,
        pipelines,
        event_router,
        config: Arc::clone(&config),
        webhook_secret: secrets.github_webhook_secret.clone(),
        dashboard_api_key: secrets.dashboard_api_key.clone(),
        start_time: Instant::now(),
    });

    let dashboard = Router::new()
        .route("/dashboard/pipelines", get(routes::list_pipeline_definitions))
        .route("/dashboard/pipelines/runs", get(routes::list_runs))
        .route("/dashboard/pipelines/runs/:id", get(routes::get_run))
        .route("/dashboard/pipelines/runs/:id/cancel", post(routes::cancel_run))
        .route("/dashboard/pipelines/stream", get(routes::stream_activity))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), routes::require_dashboard_auth));

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/agents", get(routes::list_agents))
        .route("/webhook", post(routes::webhook))
        .merge(dashboard)
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!(bind = %cli.bind, "squadron-server listening");
    let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
    axum::serve(listener, app).await.map_err(|e| {
        error!(error = %e, "server exited");
        anyhow::anyhow!(e)
    })
}
