// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker pool manager — owns a set of consumer-group loop tasks draining
//! the render queue, with cooperative stop and queue-depth autoscaling.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sgd_core::{Job, JobOutcome, JobState};
use sgd_queue::JobQueue;
use tokio::task::JoinHandle;

const CONSUME_TIMEOUT: Duration = Duration::from_secs(2);

/// What a worker does with a job it has claimed. Implemented by the render
/// pipeline; a no-op/test implementation lives in this crate's test module.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// `Ok(JobOutcome::Result(..))`/`Ok(JobOutcome::Error{..})` for a
    /// handled domain outcome; `Err` for an unexpected processor failure
    /// (a bug, not a modeled render failure) — both still move the job to
    /// `Failed` in the latter case.
    async fn process(&self, job: Job) -> Result<JobOutcome, String>;

    /// Best-effort: produce a smaller, n=1 preview ahead of the final
    /// render and return its signed URL. `None` skips `preview_ready`
    /// entirely rather than failing the job.
    async fn produce_preview(&self, _job: &Job) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
    pub processed: u64,
    pub failed: u64,
}

struct WorkerHandle {
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<WorkerStats>>,
    join: JoinHandle<()>,
}

/// Target worker count for a given queue depth, per the documented
/// autoscaling table: 0 -> 1, 1-5 -> 1, 6-15 -> 2, >=16 -> min(3, max_workers).
pub fn autoscale_target(queue_depth: usize, max_workers: usize) -> usize {
    let target = match queue_depth {
        0..=5 => 1,
        6..=15 => 2,
        _ => 3,
    };
    target.min(max_workers)
}

pub struct WorkerManager {
    queue: Arc<JobQueue>,
    processor: Arc<dyn JobProcessor>,
    max_workers: usize,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    next_id: Mutex<u64>,
}

impl WorkerManager {
    pub fn new(queue: Arc<JobQueue>, processor: Arc<dyn JobProcessor>, max_workers: usize) -> Self {
        WorkerManager {
            queue,
            processor,
            max_workers,
            workers: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        }
    }

    fn fresh_id(&self) -> String {
        let mut next = self.next_id.lock().expect("next_id mutex poisoned");
        let id = format!("worker-{next}");
        *next += 1;
        id
    }

    /// Start a worker. If `id` is `None` a fresh id is generated. Returns the
    /// id of the started worker.
    pub fn start(&self, id: Option<String>) -> String {
        let id = id.unwrap_or_else(|| self.fresh_id());
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(WorkerStats {
            state: WorkerState::Running,
            started_at: Utc::now(),
            processed: 0,
            failed: 0,
        }));

        let queue = self.queue.clone();
        let processor = self.processor.clone();
        let stop_clone = stop.clone();
        let stats_clone = stats.clone();
        let join = tokio::spawn(async move {
            run_worker_loop(queue, processor, stop_clone, stats_clone).await;
        });

        let mut workers = self.workers.lock().expect("workers mutex poisoned");
        workers.insert(id.clone(), WorkerHandle { stop, stats, join });
        id
    }

    /// Request cooperative stop: the worker finishes its current job, then
    /// exits on its next poll of the stop flag. Does not block.
    pub fn stop(&self, id: &str) {
        let workers = self.workers.lock().expect("workers mutex poisoned");
        if let Some(handle) = workers.get(id) {
            handle.stop.store(true, Ordering::SeqCst);
            let mut stats = handle.stats.lock().expect("stats mutex poisoned");
            stats.state = WorkerState::Stopped;
        }
    }

    pub fn restart(&self, id: &str) {
        self.stop(id);
        self.start(Some(id.to_string()));
    }

    pub fn stats(&self, id: &str) -> Option<WorkerStats> {
        let workers = self.workers.lock().expect("workers mutex poisoned");
        workers.get(id).map(|h| h.stats.lock().expect("stats mutex poisoned").clone())
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.lock().expect("workers mutex poisoned").keys().cloned().collect()
    }

    /// Count of workers whose loop task has not yet observed its stop flag
    /// and finished — i.e. still eligible to pick up work.
    pub fn active_count(&self) -> usize {
        let workers = self.workers.lock().expect("workers mutex poisoned");
        workers
            .values()
            .filter(|h| {
                let stats = h.stats.lock().expect("stats mutex poisoned");
                stats.state == WorkerState::Running
            })
            .count()
    }

    /// Scale the pool to exactly `n` workers, clamped to `[0, max_workers]`.
    /// Starts fresh workers or stops existing ones as needed.
    pub fn scale_to(&self, n: usize) {
        let n = n.min(self.max_workers);
        let current = self.active_count();
        if n > current {
            for _ in current..n {
                self.start(None);
            }
        } else if n < current {
            let victims: Vec<String> = {
                let workers = self.workers.lock().expect("workers mutex poisoned");
                workers
                    .iter()
                    .filter(|(_, h)| h.stats.lock().expect("stats mutex poisoned").state == WorkerState::Running)
                    .take(current - n)
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for id in victims {
                self.stop(&id);
            }
        }
    }

    pub fn autoscale(&self, queue_depth: usize) {
        let target = autoscale_target(queue_depth, self.max_workers);
        self.scale_to(target);
    }

    /// Remove the bookkeeping for a worker whose task has fully exited.
    /// A stopped worker's `JoinHandle` is not awaited by `stop` itself
    /// (cooperative stop is fire-and-forget); call this once the caller
    /// knows the task has finished, e.g. during a graceful shutdown.
    pub async fn reap(&self, id: &str) {
        let handle = self.workers.lock().expect("workers mutex poisoned").remove(id);
        if let Some(handle) = handle {
            let _ = handle.join.await;
        }
    }
}

async fn run_worker_loop(
    queue: Arc<JobQueue>,
    processor: Arc<dyn JobProcessor>,
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let job = match queue.consume(CONSUME_TIMEOUT).await {
            Some(job) => job,
            None => continue,
        };

        let job_id = job.id;
        if queue.publish(job_id, JobState::Running).is_err() {
            queue.ack(job_id);
            continue;
        }

        if let Some(preview_url) = processor.produce_preview(&job).await
            && let Err(error) = queue.publish_preview(job_id, preview_url)
        {
            tracing::warn!(job_id = %job_id, %error, "failed to publish preview_ready");
        }

        match processor.process(job).await {
            Ok(JobOutcome::Result(result)) => {
                let _ = queue.complete(job_id, result).await;
                queue.ack(job_id);
                let mut s = stats.lock().expect("stats mutex poisoned");
                s.processed += 1;
            }
            Ok(JobOutcome::Error { error, message }) => {
                tracing::warn!(job_id = %job_id, %error, %message, "job failed");
                let _ = queue.fail(job_id, error, message);
                queue.ack(job_id);
                let mut s = stats.lock().expect("stats mutex poisoned");
                s.failed += 1;
            }
            Err(error) => {
                tracing::warn!(job_id = %job_id, %error, "job processing failed unexpectedly");
                let _ = queue.fail(job_id, "processor_error", error);
                queue.ack(job_id);
                let mut s = stats.lock().expect("stats mutex poisoned");
                s.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgd_cache::{Cache, InMemoryBackend, InMemoryLock};
    use std::sync::atomic::AtomicU32;

    struct CountingProcessor {
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl JobProcessor for CountingProcessor {
        async fn process(&self, _job: Job) -> Result<JobOutcome, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Ok(JobOutcome::Error {
                    error: "boom".to_string(),
                    message: "boom".to_string(),
                })
            } else {
                Ok(JobOutcome::Result(sgd_core::RenderResult {
                    assets: vec![],
                    audit: sgd_core::Audit {
                        trace_id: uuid::Uuid::new_v4(),
                        model_route: vec![],
                        cost_usd: 0.0,
                        guardrails_ok: true,
                        verified_by: sgd_core::VerifiedBy::None,
                    },
                }))
            }
        }
    }

    struct PreviewProcessor {
        preview_url: String,
    }

    #[async_trait]
    impl JobProcessor for PreviewProcessor {
        async fn process(&self, _job: Job) -> Result<JobOutcome, String> {
            Ok(JobOutcome::Result(sgd_core::RenderResult {
                assets: vec![],
                audit: sgd_core::Audit {
                    trace_id: uuid::Uuid::new_v4(),
                    model_route: vec![],
                    cost_usd: 0.0,
                    guardrails_ok: true,
                    verified_by: sgd_core::VerifiedBy::None,
                },
            }))
        }

        async fn produce_preview(&self, _job: &Job) -> Option<String> {
            Some(self.preview_url.clone())
        }
    }

    fn make_queue() -> Arc<JobQueue> {
        Arc::new(JobQueue::new(Arc::new(Cache::new(
            Arc::new(InMemoryBackend::new()),
            Arc::new(InMemoryLock::new()),
        ))))
    }

    #[test]
    fn autoscale_table_matches_documented_bands() {
        assert_eq!(autoscale_target(0, 3), 1);
        assert_eq!(autoscale_target(5, 3), 1);
        assert_eq!(autoscale_target(6, 3), 2);
        assert_eq!(autoscale_target(15, 3), 2);
        assert_eq!(autoscale_target(16, 3), 3);
        assert_eq!(autoscale_target(1000, 1), 1);
    }

    #[tokio::test]
    async fn worker_processes_enqueued_job() {
        let queue = make_queue();
        let calls = Arc::new(AtomicU32::new(0));
        let processor = Arc::new(CountingProcessor { calls: calls.clone(), fail: false });
        let manager = WorkerManager::new(queue.clone(), processor, 2);

        let id = manager.start(None);
        let enqueued = queue.enqueue(serde_json::json!({"a": 1})).await.unwrap();

        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let job_id = enqueued.job_id.unwrap();
        for _ in 0..50 {
            if queue.status(job_id).unwrap().state == JobState::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(queue.status(job_id).unwrap().state, JobState::Completed);

        manager.stop(&id);
        manager.reap(&id).await;
    }

    #[tokio::test]
    async fn worker_publishes_preview_before_completing() {
        let queue = make_queue();
        let processor = Arc::new(PreviewProcessor { preview_url: "https://cdn.example.test/preview.png".to_string() });
        let manager = WorkerManager::new(queue.clone(), processor, 1);

        let id = manager.start(None);
        let enqueued = queue.enqueue(serde_json::json!({"a": 1})).await.unwrap();
        let job_id = enqueued.job_id.unwrap();

        for _ in 0..50 {
            if queue.status(job_id).unwrap().state == JobState::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let job = queue.status(job_id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.preview_url.as_deref(), Some("https://cdn.example.test/preview.png"));

        manager.stop(&id);
        manager.reap(&id).await;
    }

    #[tokio::test]
    async fn failed_job_is_marked_failed_and_counted() {
        let queue = make_queue();
        let calls = Arc::new(AtomicU32::new(0));
        let processor = Arc::new(CountingProcessor { calls: calls.clone(), fail: true });
        let manager = WorkerManager::new(queue.clone(), processor, 1);

        let id = manager.start(None);
        let enqueued = queue.enqueue(serde_json::json!({"a": 1})).await.unwrap();

        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let job_id = enqueued.job_id.unwrap();
        assert_eq!(queue.status(job_id).unwrap().state, JobState::Failed);
        assert_eq!(manager.stats(&id).unwrap().failed, 1);

        manager.stop(&id);
        manager.reap(&id).await;
    }

    #[tokio::test]
    async fn scale_to_starts_and_stops_workers() {
        let queue = make_queue();
        let processor = Arc::new(CountingProcessor { calls: Arc::new(AtomicU32::new(0)), fail: false });
        let manager = WorkerManager::new(queue, processor, 5);

        manager.scale_to(3);
        assert_eq!(manager.active_count(), 3);

        manager.scale_to(1);
        assert_eq!(manager.active_count(), 1);

        manager.scale_to(10);
        assert_eq!(manager.active_count(), 5);
    }

    #[tokio::test]
    async fn stop_is_cooperative_and_marks_state() {
        let queue = make_queue();
        let processor = Arc::new(CountingProcessor { calls: Arc::new(AtomicU32::new(0)), fail: false });
        let manager = WorkerManager::new(queue, processor, 2);

        let id = manager.start(None);
        manager.stop(&id);
        assert_eq!(manager.stats(&id).unwrap().state, WorkerState::Stopped);
        manager.reap(&id).await;
    }
}
