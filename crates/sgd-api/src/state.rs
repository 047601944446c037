// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared application state wired once at startup and cloned (cheaply, via
//! `Arc`) into every request.

use std::sync::Arc;

use sgd_budget::BudgetController;
use sgd_cache::Cache;
use sgd_config::SgdConfig;
use sgd_ingest::IngestPipeline;
use sgd_provider::ProviderClient;
use sgd_queue::JobQueue;
use sgd_ratelimit::RateLimiter;
use sgd_render::RenderPipeline;
use sgd_scanner::SecurityScanner;
use sgd_storage::StorageAdapter;
use sgd_workers::WorkerManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SgdConfig>,
    pub render_pipeline: Arc<RenderPipeline>,
    pub provider: Arc<ProviderClient>,
    pub queue: Arc<JobQueue>,
    pub workers: Arc<WorkerManager>,
    pub ingest: Arc<IngestPipeline>,
    pub storage: Arc<dyn StorageAdapter>,
    pub scanner: Arc<SecurityScanner>,
    pub cache: Arc<Cache>,
    pub budget: Arc<BudgetController>,
    pub rate_limiter: Arc<RateLimiter>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}
