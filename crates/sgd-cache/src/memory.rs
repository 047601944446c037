//! Process-local cache backend and lock, used for local development, tests,
//! and as the default when no external cache is configured.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{CacheBackend, DistributedLock};

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Ok(Some(entry.value.clone()));
            }
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), String> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}

#[derive(Default)]
pub struct InMemoryLock {
    held: Mutex<HashMap<String, Instant>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, key: &str, lease: Duration) -> bool {
        let mut held = self.held.lock().expect("lock map poisoned");
        let now = Instant::now();
        if let Some(expires_at) = held.get(key)
            && *expires_at > now
        {
            return false;
        }
        held.insert(key.to_string(), now + lease);
        true
    }

    async fn release(&self, key: &str) {
        self.held.lock().expect("lock map poisoned").remove(key);
    }
}
