// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sliding-window rate limiter, keyed by `(identifier, endpoint)`.
//!
//! Each bucket holds an ordered set of request timestamps within a 60-second
//! window. Capacity is endpoint-specific; a rejected request never consumes
//! capacity. On backend unavailability this crate's default in-process
//! backend cannot itself be unavailable, but [`RateLimiter::check`] is
//! structured so a real remote backend's errors can be mapped to the same
//! fail-open contract at the call site (availability over strictness).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const BUCKET_TTL: Duration = Duration::from_secs(70);

/// Per-endpoint requests-per-minute caps. `default` applies to any endpoint
/// without an explicit override.
#[derive(Debug, Clone)]
pub struct EndpointLimits {
    pub default_rpm: u32,
    pub overrides: HashMap<String, u32>,
}

impl Default for EndpointLimits {
    fn default() -> Self {
        let mut overrides = HashMap::new();
        overrides.insert("render".to_string(), 30);
        overrides.insert("async-render".to_string(), 20);
        overrides.insert("ingest".to_string(), 50);
        overrides.insert("upload".to_string(), 20);
        overrides.insert("critique".to_string(), 60);
        overrides.insert("canon-derive".to_string(), 40);
        EndpointLimits {
            default_rpm: 100,
            overrides,
        }
    }
}

impl EndpointLimits {
    pub fn rpm_for(&self, endpoint: &str) -> u32 {
        self.overrides.get(endpoint).copied().unwrap_or(self.default_rpm)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the oldest entry in the window expires and a slot
    /// frees up — or, for an allowed request, until the window this request
    /// joined would fully expire.
    pub reset_after_secs: u64,
}

#[derive(Default)]
struct Bucket {
    timestamps: VecDeque<Instant>,
    last_touched: Option<Instant>,
}

pub struct RateLimiter {
    limits: EndpointLimits,
    buckets: Mutex<HashMap<(String, String), Bucket>>,
}

impl RateLimiter {
    pub fn new(limits: EndpointLimits) -> Self {
        RateLimiter {
            limits,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// `check(id, endpoint) -> CheckResult`. Expires entries older than the
    /// 60s window, then admits the request only if under the endpoint's RPM.
    pub fn check(&self, identifier: &str, endpoint: &str) -> CheckResult {
        let rpm = self.limits.rpm_for(endpoint);
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");

        self.evict_stale_buckets(&mut buckets, now);

        let key = (identifier.to_string(), endpoint.to_string());
        let bucket = buckets.entry(key).or_default();
        bucket.last_touched = Some(now);

        while let Some(&front) = bucket.timestamps.front() {
            if now.duration_since(front) >= WINDOW {
                bucket.timestamps.pop_front();
            } else {
                break;
            }
        }

        let count = bucket.timestamps.len() as u32;
        if count >= rpm {
            let oldest = bucket.timestamps.front().copied().unwrap_or(now);
            let reset_after = WINDOW.saturating_sub(now.duration_since(oldest));
            return CheckResult {
                allowed: false,
                limit: rpm,
                remaining: 0,
                reset_after_secs: reset_after.as_secs().max(1),
            };
        }

        bucket.timestamps.push_back(now);
        let remaining = rpm - (count + 1);
        CheckResult {
            allowed: true,
            limit: rpm,
            remaining,
            reset_after_secs: WINDOW.as_secs(),
        }
    }

    fn evict_stale_buckets(&self, buckets: &mut HashMap<(String, String), Bucket>, now: Instant) {
        buckets.retain(|_, bucket| {
            bucket
                .last_touched
                .map(|t| now.duration_since(t) < BUCKET_TTL)
                .unwrap_or(true)
        });
    }
}

/// Best-effort identifier resolution, in order of preference: API key
/// prefix, user id, client IP — the first present value wins.
pub fn resolve_identifier(api_key_prefix: Option<&str>, user_id: Option<&str>, client_ip: Option<&str>) -> String {
    api_key_prefix
        .or(user_id)
        .or(client_ip)
        .unwrap_or("anonymous")
        .to_string()
}
