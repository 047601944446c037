// SPDX-License-Identifier: MIT OR Apache-2.0
//! Object storage: put/get, signed URL issuance, quarantine-to-public
//! promotion.
//!
//! Layout (per tenant): `org/{org_id}/quarantine/{project_id}/{uuid}_{name}`,
//! `org/{org_id}/public/{project_id}/{uuid}.{ext}`,
//! `org/{org_id}/renders/{project_id}/{uuid}.{ext}`,
//! `org/{org_id}/previews/{project_id}/{uuid}.{ext}`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

pub const SIGNED_URL_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageArea {
    Quarantine,
    Public,
    Renders,
    Previews,
}

impl StorageArea {
    fn segment(self) -> &'static str {
        match self {
            StorageArea::Quarantine => "quarantine",
            StorageArea::Public => "public",
            StorageArea::Renders => "renders",
            StorageArea::Previews => "previews",
        }
    }
}

/// Build a storage key for `org_id`/`project_id` within `area`, ending in
/// `tail` (a filename, already carrying its extension or `{uuid}_{name}`).
pub fn object_key(org_id: &str, area: StorageArea, project_id: &str, tail: &str) -> String {
    format!("org/{org_id}/{}/{project_id}/{tail}", area.segment())
}

#[derive(Debug, Clone)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Uniform object storage interface. Implementations may be a cloud object
/// store in production or the local filesystem for development and tests.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Issue a time-bounded signed URL for `key`, valid for `ttl`.
    async fn sign(&self, key: &str, ttl: Duration) -> Result<SignedUrl>;
    /// Move an object from a quarantine key to its corresponding public key,
    /// same basename, `quarantine/` segment replaced with `public/`.
    async fn promote(&self, quarantine_key: &str) -> Result<String>;
}

/// Filesystem-backed adapter for local development and tests. Signed URLs
/// are a deterministic `file://` form with an expiry embedded in the query
/// string; there is no real access-control boundary — this is not meant for
/// production use.
pub struct LocalFsStorage {
    root: PathBuf,
    base_url: String,
}

impl LocalFsStorage {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        LocalFsStorage {
            root: root.into(),
            base_url: base_url.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl StorageAdapter for LocalFsStorage {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("write object to {}", path.display()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("read object from {}", path.display()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }

    async fn sign(&self, key: &str, ttl: Duration) -> Result<SignedUrl> {
        if !self.exists(key).await? {
            anyhow::bail!("cannot sign missing object: {key}");
        }
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let url = format!(
            "{}/{key}?expires={}",
            self.base_url.trim_end_matches('/'),
            expires_at.timestamp()
        );
        Ok(SignedUrl { url, expires_at })
    }

    async fn promote(&self, quarantine_key: &str) -> Result<String> {
        let public_key = promoted_key(quarantine_key)
            .with_context(|| format!("key not under quarantine/: {quarantine_key}"))?;
        let src = self.path_for(quarantine_key);
        let dst = self.path_for(&public_key);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src, &dst)
            .await
            .with_context(|| format!("promote {} -> {}", src.display(), dst.display()))?;
        Ok(public_key)
    }
}

/// Replace the first `quarantine/` path segment with `public/`, preserving
/// the rest of the key verbatim.
fn promoted_key(quarantine_key: &str) -> Option<String> {
    let mut segments: Vec<&str> = quarantine_key.split('/').collect();
    let idx = segments.iter().position(|s| *s == "quarantine")?;
    segments[idx] = "public";
    Some(segments.join("/"))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Quarantine key for bytes flagged with an executable signature: stored
/// under a threat-specific path keyed only by content hash, distinct from
/// per-upload quarantine keys, and never eligible for `promote`.
pub fn threat_quarantine_key(org_id: &str, bytes: &[u8]) -> String {
    format!("org/{org_id}/quarantine/threats/{}", sha256_hex(bytes))
}

pub fn extension_for_path(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}
