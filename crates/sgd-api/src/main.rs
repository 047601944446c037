// SPDX-License-Identifier: MIT OR Apache-2.0
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sgd_api::{build_app, AppState};
use sgd_budget::{BudgetController, InMemoryBudgetBackend};
use sgd_cache::{Cache, InMemoryBackend, InMemoryLock};
use sgd_config::{load_config, validate_config};
use sgd_ingest::{FixedDimEmbedder, IngestPipeline};
use sgd_provider::{
    openrouter_style_invoke, ModelEndpoint, ProviderClient, ProviderTask, RateTable, RetryPolicy, TaskPolicy,
};
use sgd_queue::JobQueue;
use sgd_ratelimit::{EndpointLimits, RateLimiter};
use sgd_render::RenderPipeline;
use sgd_scanner::{require_scanner_in_production, NoopScanner, SecurityScanner};
use sgd_storage::LocalFsStorage;
use sgd_vector::InMemoryVectorIndex;
use sgd_workers::WorkerManager;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const EMBED_DIMENSION: usize = 16;
const DEFAULT_MODEL: &str = "openrouter/auto";

#[derive(Parser, Debug)]
#[command(name = "sgd-api", version, about = "Synthetic graphic designer HTTP API")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Path to a TOML config file; falls back to defaults plus env overrides
    /// when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root directory for the local filesystem storage adapter.
    #[arg(long, default_value = "./data/storage")]
    storage_root: PathBuf,

    /// Base URL local storage signs URLs against.
    #[arg(long, default_value = "http://127.0.0.1:8080/assets")]
    storage_base_url: String,

    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("sgd=debug,tower_http=debug")
    } else {
        EnvFilter::new("sgd=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(args.config.as_deref()).context("load configuration")?;
    for warning in validate_config(&config).context("validate configuration")? {
        warn!(%warning, "configuration warning");
    }
    require_scanner_in_production(&config.service_env, false)
        .map_err(anyhow::Error::msg)
        .context("antivirus scanner requirement")?;
    let config = Arc::new(config);

    let cache = Arc::new(Cache::new(Arc::new(InMemoryBackend::new()), Arc::new(InMemoryLock::new())));
    let storage = Arc::new(LocalFsStorage::new(args.storage_root.clone(), args.storage_base_url.clone()));
    let budget = Arc::new(BudgetController::new(
        Box::new(InMemoryBudgetBackend::new()),
        config.daily_budget_usd,
    ));
    let rate_limiter = Arc::new(RateLimiter::new(EndpointLimits {
        default_rpm: config.rate_limit_rpm,
        ..EndpointLimits::default()
    }));

    let provider = Arc::new(build_provider_client(&config));
    let render_pipeline = Arc::new(RenderPipeline::new(
        provider.clone(),
        cache.clone(),
        storage.clone(),
        budget.clone(),
    ));

    let queue = Arc::new(JobQueue::new(cache.clone()));
    let workers = Arc::new(WorkerManager::new(queue.clone(), render_pipeline.clone(), config.max_render_workers));
    workers.start(Some("render-0".to_string()));

    let scanner = Arc::new(SecurityScanner::new(Box::new(NoopScanner)));
    let ingest = Arc::new(IngestPipeline::new(
        storage.clone(),
        SecurityScanner::new(Box::new(NoopScanner)),
        Arc::new(InMemoryVectorIndex::new()),
        cache.clone(),
        Arc::new(FixedDimEmbedder { dimension: EMBED_DIMENSION }),
        None,
        config.ref_url_allow_hosts.clone(),
    ));

    let state = Arc::new(AppState {
        config: config.clone(),
        render_pipeline,
        provider,
        queue,
        workers,
        ingest,
        storage,
        scanner,
        cache,
        budget,
        rate_limiter,
        started_at: chrono::Utc::now(),
    });

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind).await.with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, service = %config.service_name, "sgd-api listening");

    axum::serve(listener, app).await.context("serve")
}

/// A single catch-all model across every task, routed through OpenRouter.
/// Deployments with differentiated per-task models override this via the
/// config's (currently absent from `SgdConfig`) provider policy surface —
/// tracked as an open question, see DESIGN.md.
fn build_provider_client(config: &sgd_config::SgdConfig) -> ProviderClient {
    let mut tasks = std::collections::HashMap::new();
    for task in [ProviderTask::Planner, ProviderTask::Critic, ProviderTask::Image, ProviderTask::Canon] {
        let timeout = match task {
            ProviderTask::Planner => config.task_timeouts.planner_secs,
            ProviderTask::Critic => config.task_timeouts.critic_secs,
            ProviderTask::Image => config.task_timeouts.image_secs,
            ProviderTask::Canon => config.task_timeouts.canon_secs,
        };
        tasks.insert(
            task,
            TaskPolicy {
                primary: DEFAULT_MODEL.to_string(),
                fallbacks: vec![],
                timeout: Duration::from_secs(timeout),
                max_cost_usd: None,
                retry: RetryPolicy {
                    max_attempts: 3,
                    backoff_ms: 200,
                },
            },
        );
    }
    let policy = sgd_provider::ProviderPolicy { tasks };

    let mut endpoints = std::collections::HashMap::new();
    endpoints.insert(
        DEFAULT_MODEL.to_string(),
        ModelEndpoint {
            url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            request_template: serde_json::json!({}),
        },
    );
    let invoke = openrouter_style_invoke(
        reqwest::Client::new(),
        config.openrouter_api_key.clone().unwrap_or_default(),
        endpoints,
    );

    ProviderClient::new(policy, RateTable::new(), invoke)
}
