// SPDX-License-Identifier: MIT OR Apache-2.0
//! Render job queue: content-hash deduplication via the cache, an
//! append-only bounded stream (`q:render`), per-job pub/sub, and a
//! `sgd-workers` consumer group with claim/ack/reclaim and a bounded DLQ.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sgd_cache::Cache;
use sgd_core::{Job, JobOutcome, JobState, RenderResult, content_hash};
use tokio::sync::broadcast;
use uuid::Uuid;

const STREAM_MAX_LEN: usize = 10_000;
const RESULT_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const JOB_TOPIC_CAPACITY: usize = 64;
pub const DEFAULT_MAX_REDELIVERIES: u32 = 3;
const DLQ_MAX_LEN: usize = 10_000;

#[derive(Debug, Clone)]
struct ClaimedEntry {
    job_id: Uuid,
    redeliveries: u32,
    claimed_at: std::time::Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResult {
    pub cached: bool,
    pub job_id: Option<Uuid>,
    pub content_hash: String,
    pub cached_result: Option<RenderResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job_id: Uuid,
    pub reason: String,
    pub redeliveries: u32,
    pub dead_at: chrono::DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job {0} is in a terminal state and cannot be cancelled")]
    JobTerminal(Uuid),
    #[error("unknown job {0}")]
    JobNotFound(Uuid),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, thiserror::Error)]
#[error("cache error: {0}")]
pub struct CacheError(pub String);

struct Inner {
    stream: VecDeque<Uuid>,
    jobs: HashMap<Uuid, Job>,
    topics: HashMap<Uuid, broadcast::Sender<Job>>,
    in_flight: HashMap<Uuid, ClaimedEntry>,
    dead_letters: VecDeque<DeadLetter>,
}

pub struct JobQueue {
    cache: std::sync::Arc<Cache>,
    state: Mutex<Inner>,
    max_redeliveries: u32,
}

impl JobQueue {
    pub fn new(cache: std::sync::Arc<Cache>) -> Self {
        JobQueue {
            cache,
            state: Mutex::new(Inner {
                stream: VecDeque::new(),
                jobs: HashMap::new(),
                topics: HashMap::new(),
                in_flight: HashMap::new(),
                dead_letters: VecDeque::new(),
            }),
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
        }
    }

    fn result_cache_key(content_hash: &str) -> String {
        format!("render:{content_hash}")
    }

    /// `enqueue(payload) -> {cached, job_id?, content_hash, cached_result?}`.
    pub async fn enqueue(&self, payload: serde_json::Value) -> Result<EnqueueResult, QueueError> {
        let hash = content_hash(&payload);
        let cache_key = Self::result_cache_key(&hash);

        if let Some(cached) = self
            .cache
            .peek::<RenderResult>(&cache_key)
            .await
            .map_err(CacheError)?
        {
            return Ok(EnqueueResult {
                cached: true,
                job_id: None,
                content_hash: hash,
                cached_result: Some(cached),
            });
        }

        let now = Utc::now();
        let job = Job::new(hash.clone(), payload, now);
        let job_id = job.id;

        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.stream.push_back(job_id);
        while state.stream.len() > STREAM_MAX_LEN {
            state.stream.pop_front();
        }
        state.jobs.insert(job_id, job.clone());
        let (tx, _) = broadcast::channel(JOB_TOPIC_CAPACITY);
        let _ = tx.send(job);
        state.topics.insert(job_id, tx);

        Ok(EnqueueResult {
            cached: false,
            job_id: Some(job_id),
            content_hash: hash,
            cached_result: None,
        })
    }

    pub fn status(&self, job_id: Uuid) -> Option<Job> {
        self.state.lock().expect("queue mutex poisoned").jobs.get(&job_id).cloned()
    }

    pub fn subscribe(&self, job_id: Uuid) -> Option<broadcast::Receiver<Job>> {
        self.state
            .lock()
            .expect("queue mutex poisoned")
            .topics
            .get(&job_id)
            .map(|tx| tx.subscribe())
    }

    /// Push a state transition and publish it to `job:{job_id}` subscribers.
    pub fn publish(&self, job_id: Uuid, new_state: JobState) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        let job = state.jobs.get_mut(&job_id).ok_or(QueueError::JobNotFound(job_id))?;
        job.transition(new_state, Utc::now())
            .map_err(QueueError::InvalidTransition)?;
        let job_clone = job.clone();
        if let Some(tx) = state.topics.get(&job_id) {
            let _ = tx.send(job_clone);
        }
        Ok(())
    }

    /// Transition a job to `PreviewReady`, attach the preview URL, and
    /// publish it to subscribers. Best-effort: a worker that could not
    /// produce a preview simply skips this call and moves straight to
    /// `complete`/`fail`.
    pub fn publish_preview(&self, job_id: Uuid, preview_url: String) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        let job = state.jobs.get_mut(&job_id).ok_or(QueueError::JobNotFound(job_id))?;
        job.preview_url = Some(preview_url);
        job.transition(JobState::PreviewReady, Utc::now())
            .map_err(QueueError::InvalidTransition)?;
        let job_clone = job.clone();
        if let Some(tx) = state.topics.get(&job_id) {
            let _ = tx.send(job_clone);
        }
        Ok(())
    }

    /// Transition a job to `Completed`, attach `outcome`, publish it to
    /// subscribers, and cache the result under the job's content hash so a
    /// concurrent `enqueue` with the same payload observes `cached=true`.
    pub async fn complete(&self, job_id: Uuid, result: RenderResult) -> Result<(), QueueError> {
        let content_hash = {
            let mut state = self.state.lock().expect("queue mutex poisoned");
            let job = state.jobs.get_mut(&job_id).ok_or(QueueError::JobNotFound(job_id))?;
            job.transition(JobState::Completed, Utc::now())
                .map_err(QueueError::InvalidTransition)?;
            job.outcome = Some(JobOutcome::Result(result.clone()));
            let job_clone = job.clone();
            if let Some(tx) = state.topics.get(&job_id) {
                let _ = tx.send(job_clone);
            }
            job.content_hash.clone()
        };
        self.cache_result(&content_hash, &result).await
    }

    /// Transition a job to `Failed` and attach the error, without touching
    /// the result cache (a failed render is never served as a cache hit).
    pub fn fail(&self, job_id: Uuid, error: impl Into<String>, message: impl Into<String>) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        let job = state.jobs.get_mut(&job_id).ok_or(QueueError::JobNotFound(job_id))?;
        job.transition(JobState::Failed, Utc::now())
            .map_err(QueueError::InvalidTransition)?;
        job.outcome = Some(JobOutcome::Error {
            error: error.into(),
            message: message.into(),
        });
        let job_clone = job.clone();
        if let Some(tx) = state.topics.get(&job_id) {
            let _ = tx.send(job_clone);
        }
        Ok(())
    }

    pub fn cancel(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        let job = state.jobs.get_mut(&job_id).ok_or(QueueError::JobNotFound(job_id))?;
        if job.state.is_terminal() {
            return Err(QueueError::JobTerminal(job_id));
        }
        job.transition(JobState::Cancelled, Utc::now())
            .map_err(QueueError::InvalidTransition)?;
        let job_clone = job.clone();
        if let Some(tx) = state.topics.get(&job_id) {
            let _ = tx.send(job_clone);
        }
        Ok(())
    }

    /// Blocking read with a `timeout`, as the `sgd-workers` consumer group.
    /// Returns `None` on timeout with nothing available.
    pub async fn consume(&self, timeout: Duration) -> Option<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().expect("queue mutex poisoned");
                if let Some(job_id) = state.stream.pop_front() {
                    let job = state.jobs.get(&job_id).cloned();
                    if let Some(job) = job {
                        state.in_flight.insert(
                            job_id,
                            ClaimedEntry {
                                job_id,
                                redeliveries: 0,
                                claimed_at: std::time::Instant::now(),
                            },
                        );
                        return Some(job);
                    }
                    continue;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn ack(&self, job_id: Uuid) {
        self.state.lock().expect("queue mutex poisoned").in_flight.remove(&job_id);
    }

    /// Requeue unacked messages older than `threshold`, incrementing their
    /// redelivery count; entries at `max_redeliveries` are routed to the DLQ
    /// instead, keyed by reason code.
    pub fn reclaim_stale(&self, threshold: Duration) -> usize {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        let stale_ids: Vec<Uuid> = state
            .in_flight
            .iter()
            .filter(|(_, claimed)| claimed.claimed_at.elapsed() >= threshold)
            .map(|(id, _)| *id)
            .collect();

        let max_redeliveries = self.max_redeliveries;
        let mut reclaimed = 0;
        for id in stale_ids {
            if let Some(mut claimed) = state.in_flight.remove(&id) {
                claimed.redeliveries += 1;
                if claimed.redeliveries > max_redeliveries {
                    let dead = DeadLetter {
                        job_id: claimed.job_id,
                        reason: "max_redeliveries_exceeded".to_string(),
                        redeliveries: claimed.redeliveries,
                        dead_at: Utc::now(),
                    };
                    state.dead_letters.push_back(dead);
                    while state.dead_letters.len() > DLQ_MAX_LEN {
                        state.dead_letters.pop_front();
                    }
                } else {
                    state.stream.push_back(id);
                    reclaimed += 1;
                }
            }
        }
        reclaimed
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().expect("queue mutex poisoned").dead_letters.iter().cloned().collect()
    }

    pub async fn cache_result(&self, content_hash: &str, result: &RenderResult) -> Result<(), QueueError> {
        self.cache
            .put(&Self::result_cache_key(content_hash), result, RESULT_CACHE_TTL)
            .await
            .map_err(CacheError)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgd_cache::{InMemoryBackend, InMemoryLock};
    use sgd_core::{Audit, VerifiedBy};

    fn queue() -> JobQueue {
        let cache = std::sync::Arc::new(Cache::new(
            std::sync::Arc::new(InMemoryBackend::new()),
            std::sync::Arc::new(InMemoryLock::new()),
        ));
        JobQueue::new(cache)
    }

    fn dummy_result() -> RenderResult {
        RenderResult {
            assets: vec![],
            audit: Audit {
                trace_id: Uuid::new_v4(),
                model_route: vec!["model-a".to_string()],
                cost_usd: 0.0,
                guardrails_ok: true,
                verified_by: VerifiedBy::None,
            },
        }
    }

    #[tokio::test]
    async fn enqueue_returns_fresh_job_when_not_cached() {
        let q = queue();
        let result = q.enqueue(serde_json::json!({"task": "create"})).await.unwrap();
        assert!(!result.cached);
        assert!(result.job_id.is_some());
    }

    #[tokio::test]
    async fn enqueue_returns_cached_result_for_same_content_hash() {
        let q = queue();
        let payload = serde_json::json!({"task": "create", "x": 1});
        let first = q.enqueue(payload.clone()).await.unwrap();
        q.cache_result(&first.content_hash, &dummy_result()).await.unwrap();

        let second = q.enqueue(payload).await.unwrap();
        assert!(second.cached);
        assert!(second.cached_result.is_some());
    }

    #[tokio::test]
    async fn status_reflects_transitions() {
        let q = queue();
        let enqueued = q.enqueue(serde_json::json!({"a": 1})).await.unwrap();
        let job_id = enqueued.job_id.unwrap();
        assert_eq!(q.status(job_id).unwrap().state, JobState::Queued);
        q.publish(job_id, JobState::Running).unwrap();
        assert_eq!(q.status(job_id).unwrap().state, JobState::Running);
    }

    #[tokio::test]
    async fn publish_preview_sets_url_and_transitions_to_preview_ready() {
        let q = queue();
        let enqueued = q.enqueue(serde_json::json!({"a": 1})).await.unwrap();
        let job_id = enqueued.job_id.unwrap();
        q.publish(job_id, JobState::Running).unwrap();
        q.publish_preview(job_id, "https://cdn.example.test/preview.png".to_string()).unwrap();

        let job = q.status(job_id).unwrap();
        assert_eq!(job.state, JobState::PreviewReady);
        assert_eq!(job.preview_url.as_deref(), Some("https://cdn.example.test/preview.png"));

        q.complete(job_id, dummy_result()).await.unwrap();
        assert_eq!(q.status(job_id).unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_jobs() {
        let q = queue();
        let enqueued = q.enqueue(serde_json::json!({"a": 1})).await.unwrap();
        let job_id = enqueued.job_id.unwrap();
        q.publish(job_id, JobState::Running).unwrap();
        q.publish(job_id, JobState::Completed).unwrap();
        assert!(matches!(q.cancel(job_id), Err(QueueError::JobTerminal(_))));
    }

    #[tokio::test]
    async fn consume_returns_entry_and_ack_clears_in_flight() {
        let q = queue();
        let enqueued = q.enqueue(serde_json::json!({"a": 1})).await.unwrap();
        let job = q.consume(Duration::from_millis(50)).await.unwrap();
        assert_eq!(job.id, enqueued.job_id.unwrap());
        q.ack(job.id);
        assert_eq!(q.reclaim_stale(Duration::from_millis(0)), 0);
    }

    #[tokio::test]
    async fn consume_times_out_on_empty_queue() {
        let q = queue();
        let result = q.consume(Duration::from_millis(30)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn stale_unacked_entry_is_reclaimed_and_requeued() {
        let q = queue();
        q.enqueue(serde_json::json!({"a": 1})).await.unwrap();
        let _job = q.consume(Duration::from_millis(50)).await.unwrap();
        let reclaimed = q.reclaim_stale(Duration::from_millis(0));
        assert_eq!(reclaimed, 1);
        let requeued = q.consume(Duration::from_millis(50)).await;
        assert!(requeued.is_some());
    }

    #[tokio::test]
    async fn entry_exceeding_max_redeliveries_goes_to_dlq() {
        let q = queue();
        q.enqueue(serde_json::json!({"a": 1})).await.unwrap();
        for _ in 0..=DEFAULT_MAX_REDELIVERIES {
            let _ = q.consume(Duration::from_millis(50)).await;
            q.reclaim_stale(Duration::from_millis(0));
        }
        assert_eq!(q.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn complete_caches_result_for_next_enqueue_with_same_payload() {
        let q = queue();
        let payload = serde_json::json!({"task": "create", "x": 2});
        let enqueued = q.enqueue(payload.clone()).await.unwrap();
        let job_id = enqueued.job_id.unwrap();
        q.publish(job_id, JobState::Running).unwrap();
        q.complete(job_id, dummy_result()).await.unwrap();

        assert_eq!(q.status(job_id).unwrap().state, JobState::Completed);
        assert!(q.status(job_id).unwrap().outcome.is_some());

        let second = q.enqueue(payload).await.unwrap();
        assert!(second.cached);
    }

    #[tokio::test]
    async fn fail_records_error_outcome_without_caching() {
        let q = queue();
        let payload = serde_json::json!({"task": "create", "x": 3});
        let enqueued = q.enqueue(payload.clone()).await.unwrap();
        let job_id = enqueued.job_id.unwrap();
        q.publish(job_id, JobState::Running).unwrap();
        q.fail(job_id, "provider_error", "upstream failed").unwrap();

        assert_eq!(q.status(job_id).unwrap().state, JobState::Failed);
        let second = q.enqueue(payload).await.unwrap();
        assert!(!second.cached);
    }
}
