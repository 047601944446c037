// SPDX-License-Identifier: MIT OR Apache-2.0
//! Atomic get-or-compute cache with a per-key distributed lock, a
//! stale-while-revalidate fallback, and a circuit breaker isolating a
//! misbehaving cache backend from the rest of the request path.

mod memory;

pub use memory::{InMemoryBackend, InMemoryLock};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sgd_breaker::{BreakerConfig, CircuitBreaker};
use sgd_core::keyed_hash;

/// A key-value cache backend. Implementations may be a real Redis client in
/// production or an in-process map for local development and tests — the
/// core only ever depends on this trait.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), String>;
    async fn ping(&self) -> bool;
}

/// A cross-process lock keyed by a lock name. `acquire` returns `true` if
/// this caller now holds the lease; callers must call `release` even on the
/// factory path failing, so the lease never outlives the caller's intent to
/// hold it (cancellation-safety is the caller's responsibility: hold the
/// guard across the whole factory invocation).
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn acquire(&self, key: &str, lease: Duration) -> bool;
    async fn release(&self, key: &str);
}

const MIN_LEASE: Duration = Duration::from_secs(30);
const STALE_TTL: Duration = Duration::from_secs(24 * 3600);
const LOCK_WAIT_BUDGET: Duration = Duration::from_secs(1);
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    lock: Arc<dyn DistributedLock>,
    breaker: CircuitBreaker,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>, lock: Arc<dyn DistributedLock>) -> Self {
        Cache {
            backend,
            lock,
            breaker: CircuitBreaker::new(
                "cache",
                BreakerConfig {
                    failure_threshold: 5,
                    success_threshold: 1,
                    reset_timeout: BREAKER_COOLDOWN,
                    failure_rate_threshold: 0.5,
                    min_calls: 5,
                    window_size: 20,
                },
            ),
        }
    }

    /// Derive a cache key from typed parts via SHA-256, never a naive
    /// concatenation of raw caller-supplied strings.
    pub fn derive_key(parts: &[&str]) -> String {
        keyed_hash(parts)
    }

    /// Directly write `value` at `key`, outside the get-or-compute path —
    /// for callers that produce a value some other way (e.g. a job queue
    /// caching a completed result) and only need the write half.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), String> {
        self.breaker.probe_if_ready();
        let bytes = serde_json::to_vec(value).map_err(|e| e.to_string())?;
        let outcome = self.backend.set(key, bytes, ttl).await;
        self.record(outcome.as_ref().map(|_| ()).map_err(|e| e.clone()));
        outcome
    }

    /// Read `key` without the lock/stale/factory machinery of
    /// [`Self::get_or_compute`] — for callers that only want a plain lookup.
    pub async fn peek<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, String> {
        self.try_get(key).await
    }

    /// `get_or_compute(key, ttl, factory)`. See the module docs for the
    /// full lock/stale/breaker contract.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        factory: F,
    ) -> Result<T, String>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, String>>,
    {
        self.breaker.probe_if_ready();
        if self.breaker.state() == sgd_breaker::BreakerState::Open
            && !self.probe_breaker().await
        {
            tracing::warn!(key, "cache breaker open, invoking factory directly");
            return factory().await;
        }

        match self.try_get(key).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key, error = %e, "cache get failed, invoking factory directly");
                return factory().await;
            }
        }

        let lock_key = format!("{key}:lock");
        let lease = MIN_LEASE;
        if self.lock.acquire(&lock_key, lease).await {
            let result = self.compute_and_store(key, ttl, factory).await;
            self.lock.release(&lock_key).await;
            return result;
        }

        // Another node holds the lock. Poll for up to LOCK_WAIT_BUDGET.
        let deadline = tokio::time::Instant::now() + LOCK_WAIT_BUDGET;
        let mut attempt: u64 = 0;
        while tokio::time::Instant::now() < deadline {
            if let Ok(Some(value)) = self.try_get(key).await {
                return Ok(value);
            }
            attempt += 1;
            tokio::time::sleep(jittered_poll_delay(attempt)).await;
        }

        if let Ok(Some(stale)) = self.try_get(&stale_key(key)).await {
            tracing::warn!(key, "lock wait timed out, serving stale value");
            return Ok(stale);
        }

        tracing::warn!(key, "lock wait timed out, no stale value, computing locally");
        factory().await
    }

    async fn compute_and_store<T, F, Fut>(&self, key: &str, ttl: Duration, factory: F) -> Result<T, String>
    where
        T: Serialize + Clone,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, String>>,
    {
        // Re-check: another node may have populated the key while we waited
        // for the lock acquisition itself to resolve.
        if let Ok(Some(value)) = self.try_get(key).await {
            return Ok(value);
        }

        let value = factory().await?;
        let bytes = serde_json::to_vec(&value).map_err(|e| e.to_string())?;
        self.record(self.backend.set(key, bytes.clone(), ttl).await);
        self.record(self.backend.set(&stale_key(key), bytes, STALE_TTL).await);
        Ok(value)
    }

    async fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, String> {
        let raw = self.backend.get(key).await;
        self.record(raw.as_ref().map(|_| ()).map_err(|e| e.clone()));
        match raw? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn record(&self, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => self.breaker.note_success(),
            Err(_) => self.breaker.note_failure(),
        }
    }

    async fn probe_breaker(&self) -> bool {
        if self.backend.ping().await {
            self.breaker.note_success();
            true
        } else {
            false
        }
    }
}

fn stale_key(key: &str) -> String {
    format!("{key}:stale")
}

/// Backoff used while polling for another node's lock to release, mirroring
/// the jittered-exponential style used by the provider client's retry loop
/// but capped tightly since the whole poll budget is one second.
fn jittered_poll_delay(attempt: u64) -> Duration {
    let base_ms = 50u64.saturating_mul(attempt).min(250);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let jitter_ms = (nanos % 25) as u64;
    Duration::from_millis(base_ms + jitter_ms)
}
