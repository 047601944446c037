// SPDX-License-Identifier: MIT OR Apache-2.0
//! Evidence ingest pipeline: fetch → scan → promote → parse → embed →
//! index → (after enough evidence) derive brand canon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sgd_cache::Cache;
use sgd_core::{BrandCanon, EvidencePayload, EvidenceVector};
use sgd_scanner::SecurityScanner;
use sgd_storage::{StorageAdapter, StorageArea, object_key};
use sgd_vector::VectorIndex;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const CANON_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const IDEMPOTENCY_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
const CANON_DERIVATION_MIN_ASSETS: usize = 2;
const CANON_DERIVATION_SAMPLE: usize = 5;

#[derive(Debug, Clone)]
pub enum AssetSource {
    StorageKey(String),
    Url(String),
}

/// Produces an embedding for text, cached upstream by SHA of the text.
/// Pluggable so tests and local development don't require a real embedding
/// model.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
    fn dimension(&self) -> usize;
}

/// Derives a [`BrandCanon`] from a sample of evidence vectors. Pluggable so
/// the ingest pipeline doesn't hard-depend on a specific provider call
/// shape; a real implementation routes through `sgd_provider` with task
/// `canon`.
pub trait CanonDeriver: Send + Sync {
    fn derive(&self, samples: &[EvidenceVector]) -> BrandCanon;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetIngestOutcome {
    pub asset_ref: String,
    pub vector_id: Uuid,
    pub exif_removed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub project_id: String,
    pub assets: Vec<AssetIngestOutcome>,
    pub canon: Option<BrandCanon>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("security threat detected: {threats:?}, quarantined at {quarantine_key}")]
    SecurityThreat {
        threats: Vec<String>,
        quarantine_key: String,
    },
    #[error("asset URL host not allowlisted: {host}")]
    DisallowedHost { host: String },
    #[error("unsupported asset URL scheme: {url}")]
    UnsupportedScheme { url: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct IngestPipeline {
    storage: Arc<dyn StorageAdapter>,
    scanner: SecurityScanner,
    vector: Arc<dyn VectorIndex>,
    cache: Arc<Cache>,
    embedder: Arc<dyn Embedder>,
    canon_deriver: Option<Arc<dyn CanonDeriver>>,
    http: reqwest::Client,
    allowed_hosts: Vec<String>,
}

impl IngestPipeline {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        scanner: SecurityScanner,
        vector: Arc<dyn VectorIndex>,
        cache: Arc<Cache>,
        embedder: Arc<dyn Embedder>,
        canon_deriver: Option<Arc<dyn CanonDeriver>>,
        allowed_hosts: Vec<String>,
    ) -> Self {
        IngestPipeline {
            storage,
            scanner,
            vector,
            cache,
            embedder,
            canon_deriver,
            http: reqwest::Client::new(),
            allowed_hosts,
        }
    }

    pub async fn ingest(
        &self,
        org_id: &str,
        project_id: &str,
        assets: Vec<AssetSource>,
    ) -> Result<IngestOutcome, IngestError> {
        self.vector
            .ensure_collection(org_id, self.embedder.dimension())
            .await
            .context("ensure vector collection")?;

        let mut outcomes = Vec::with_capacity(assets.len());
        let mut sampled_vectors = Vec::new();

        for source in assets {
            let outcome = self.ingest_one(org_id, project_id, source, &mut sampled_vectors).await?;
            outcomes.push(outcome);
        }

        let canon = if outcomes.len() >= CANON_DERIVATION_MIN_ASSETS {
            Some(self.derive_and_cache_canon(org_id, project_id, &sampled_vectors).await?)
        } else {
            None
        };

        Ok(IngestOutcome {
            project_id: project_id.to_string(),
            assets: outcomes,
            canon,
        })
    }

    async fn ingest_one(
        &self,
        org_id: &str,
        project_id: &str,
        source: AssetSource,
        sampled_vectors: &mut Vec<EvidenceVector>,
    ) -> Result<AssetIngestOutcome, IngestError> {
        let (bytes, filename, quarantine_key) = self.materialize(org_id, &source).await?;

        let (scan, clean_bytes) = self.scanner.scan(&bytes, None, filename.as_deref());
        if !scan.is_safe {
            let threat_key = sgd_storage::threat_quarantine_key(org_id, &bytes);
            self.storage
                .put(&threat_key, &bytes, "application/octet-stream")
                .await
                .context("quarantine unsafe asset")?;
            return Err(IngestError::SecurityThreat {
                threats: scan.threats,
                quarantine_key: threat_key,
            });
        }

        let asset_ref = if let Some(qkey) = quarantine_key {
            self.storage.put(&qkey, &clean_bytes, "application/octet-stream").await.context("write quarantined copy")?;
            self.storage.promote(&qkey).await.context("promote scanned asset to public")?
        } else {
            let uuid = Uuid::new_v4();
            let ext = filename
                .as_deref()
                .and_then(|f| f.rsplit_once('.'))
                .map(|(_, e)| e)
                .unwrap_or("bin");
            let key = object_key(org_id, StorageArea::Public, project_id, &format!("{uuid}.{ext}"));
            self.storage.put(&key, &clean_bytes, "application/octet-stream").await.context("write asset")?;
            key
        };

        let text = describe_asset(project_id, filename.as_deref(), &asset_ref);
        let vector = self.cached_embed(&text).await?;

        let id = Uuid::new_v4();
        let evidence = EvidenceVector {
            id,
            project_id: project_id.to_string(),
            org_id: org_id.to_string(),
            vector,
            payload: EvidencePayload {
                text_snippet: text,
                asset_ref: asset_ref.clone(),
                kind: scan.actual_mime.clone(),
            },
        }
        .truncate_snippet();

        if sampled_vectors.len() < CANON_DERIVATION_SAMPLE {
            sampled_vectors.push(evidence.clone());
        }

        self.vector
            .upsert(org_id, vec![evidence])
            .await
            .context("upsert evidence vector")?;

        Ok(AssetIngestOutcome {
            asset_ref,
            vector_id: id,
            exif_removed: scan.exif_removed,
        })
    }

    async fn materialize(
        &self,
        org_id: &str,
        source: &AssetSource,
    ) -> Result<(Vec<u8>, Option<String>, Option<String>), IngestError> {
        match source {
            AssetSource::StorageKey(key) => {
                let bytes = self.storage.get(key).await.context("read asset from storage")?;
                let filename = key.rsplit('/').next().map(String::from);
                let quarantine_key = key.contains("/quarantine/").then(|| key.clone());
                Ok((bytes, filename, quarantine_key))
            }
            AssetSource::Url(url) => {
                let parsed = reqwest::Url::parse(url)
                    .map_err(|e| IngestError::Other(anyhow::anyhow!("invalid asset URL: {e}")))?;
                if parsed.scheme() != "https" {
                    return Err(IngestError::UnsupportedScheme { url: url.clone() });
                }
                let host = parsed.host_str().unwrap_or_default().to_string();
                if !self.allowed_hosts.iter().any(|h| h == &host) {
                    return Err(IngestError::DisallowedHost { host });
                }

                let response = self
                    .http
                    .get(parsed)
                    .send()
                    .await
                    .map_err(|e| IngestError::Other(anyhow::anyhow!("fetch asset: {e}")))?;
                // `reqwest::Client::get` follows the default redirect policy, which
                // only chases same-scheme HTTPS redirects; a hop to a non-allowlisted
                // host still lands back here for the next asset attempt to re-validate.
                let final_host = response.url().host_str().unwrap_or_default();
                if !self.allowed_hosts.iter().any(|h| h == final_host) {
                    return Err(IngestError::DisallowedHost {
                        host: final_host.to_string(),
                    });
                }
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| IngestError::Other(anyhow::anyhow!("read asset body: {e}")))?
                    .to_vec();
                let _ = org_id;
                Ok((bytes, Some(host), None))
            }
        }
    }

    async fn cached_embed(&self, text: &str) -> Result<Vec<f32>, IngestError> {
        let key = Cache::derive_key(&["embed", &sha256_hex(text.as_bytes())]);
        let embedder = self.embedder.clone();
        let owned_text = text.to_string();
        let vector: Vec<f32> = self
            .cache
            .get_or_compute(&key, Duration::from_secs(7 * 24 * 3600), move || {
                let embedder = embedder.clone();
                let text = owned_text.clone();
                async move { Ok(embedder.embed(&text)) }
            })
            .await
            .map_err(|e| IngestError::Other(anyhow::anyhow!(e)))?;
        Ok(vector)
    }

    async fn derive_and_cache_canon(
        &self,
        org_id: &str,
        project_id: &str,
        sampled_vectors: &[EvidenceVector],
    ) -> Result<BrandCanon, IngestError> {
        let Some(deriver) = &self.canon_deriver else {
            return Ok(BrandCanon::conservative_default());
        };
        let key = Cache::derive_key(&["canon", org_id, project_id]);
        let deriver = deriver.clone();
        let samples = sampled_vectors.to_vec();
        let canon = self
            .cache
            .get_or_compute(&key, CANON_CACHE_TTL, move || {
                let deriver = deriver.clone();
                let samples = samples.clone();
                async move { Ok(deriver.derive(&samples)) }
            })
            .await
            .map_err(|e| IngestError::Other(anyhow::anyhow!(e)))?;
        Ok(canon)
    }

    /// `idem_key = f("idemp:ingest", key, project_id, SHA(request_body))`.
    pub fn idempotency_key(idempotency_key: &str, project_id: &str, request_body: &[u8]) -> String {
        Cache::derive_key(&[
            "idemp:ingest",
            idempotency_key,
            project_id,
            &sha256_hex(request_body),
        ])
    }

    pub fn idempotency_cache_ttl() -> Duration {
        IDEMPOTENCY_CACHE_TTL
    }
}

fn describe_asset(project_id: &str, filename: Option<&str>, asset_ref: &str) -> String {
    match filename {
        Some(name) => format!("asset `{name}` for project {project_id} (stored at {asset_ref})"),
        None => format!("asset for project {project_id} (stored at {asset_ref})"),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Default)]
pub struct FixedDimEmbedder {
    pub dimension: usize,
}

impl Embedder for FixedDimEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        (0..self.dimension)
            .map(|i| f32::from(digest[i % digest.len()]) / 255.0)
            .collect()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgd_cache::{InMemoryBackend, InMemoryLock};
    use sgd_scanner::NoopScanner;
    use sgd_vector::InMemoryVectorIndex;
    use tempfile::tempdir;

    fn pipeline(allowed_hosts: Vec<&str>) -> (IngestPipeline, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(sgd_storage::LocalFsStorage::new(dir.path(), "https://cdn.example.test"));
        let scanner = SecurityScanner::new(Box::new(NoopScanner));
        let vector = Arc::new(InMemoryVectorIndex::new());
        let cache = Arc::new(Cache::new(Arc::new(InMemoryBackend::new()), Arc::new(InMemoryLock::new())));
        let embedder = Arc::new(FixedDimEmbedder { dimension: 4 });
        let pipeline = IngestPipeline::new(
            storage,
            scanner,
            vector,
            cache,
            embedder,
            None,
            allowed_hosts.into_iter().map(String::from).collect(),
        );
        (pipeline, dir)
    }

    #[tokio::test]
    async fn ingests_storage_key_asset_and_indexes_it() {
        let (pipeline, dir) = pipeline(vec![]);
        let key = "org/org1/public/p1/preexisting.png";
        tokio::fs::create_dir_all(dir.path().join("org/org1/public/p1")).await.unwrap();
        tokio::fs::write(dir.path().join(key), b"fake png bytes").await.unwrap();

        let outcome = pipeline
            .ingest("org1", "p1", vec![AssetSource::StorageKey(key.to_string())])
            .await
            .unwrap();
        assert_eq!(outcome.assets.len(), 1);
        assert!(outcome.canon.is_none());
    }

    #[tokio::test]
    async fn canon_derived_after_two_assets() {
        let (pipeline, dir) = pipeline(vec![]);
        tokio::fs::create_dir_all(dir.path().join("org/org1/public/p1")).await.unwrap();
        tokio::fs::write(dir.path().join("org/org1/public/p1/a.png"), b"a").await.unwrap();
        tokio::fs::write(dir.path().join("org/org1/public/p1/b.png"), b"b").await.unwrap();

        let outcome = pipeline
            .ingest(
                "org1",
                "p1",
                vec![
                    AssetSource::StorageKey("org/org1/public/p1/a.png".to_string()),
                    AssetSource::StorageKey("org/org1/public/p1/b.png".to_string()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome.assets.len(), 2);
        assert!(outcome.canon.is_some());
    }

    #[tokio::test]
    async fn disallowed_scheme_is_rejected() {
        let (pipeline, _dir) = pipeline(vec!["trusted.example.test"]);
        let result = pipeline
            .ingest("org1", "p1", vec![AssetSource::Url("http://trusted.example.test/a.png".to_string())])
            .await;
        assert!(matches!(result, Err(IngestError::UnsupportedScheme { .. })));
    }

    #[tokio::test]
    async fn disallowed_host_is_rejected() {
        let (pipeline, _dir) = pipeline(vec!["trusted.example.test"]);
        let result = pipeline
            .ingest("org1", "p1", vec![AssetSource::Url("https://evil.example.test/a.png".to_string())])
            .await;
        assert!(matches!(result, Err(IngestError::DisallowedHost { .. })));
    }

    #[test]
    fn idempotency_key_is_deterministic_and_body_sensitive() {
        let k1 = IngestPipeline::idempotency_key("abc", "p1", b"body-1");
        let k2 = IngestPipeline::idempotency_key("abc", "p1", b"body-1");
        let k3 = IngestPipeline::idempotency_key("abc", "p1", b"body-2");
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }
}
