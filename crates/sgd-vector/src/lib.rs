// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-tenant vector collections: ensure, batch upsert, filtered similarity
//! search. Collection name, dimension, and distance metric follow
//! [`sgd_core::EvidenceVector::collection_name`] — one collection per org,
//! cosine distance, dimension fixed at build time.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;
use sgd_core::EvidenceVector;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: Uuid,
    pub score: f32,
    pub vector: EvidenceVector,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub project_id: Option<String>,
    pub kind: Option<String>,
}

impl SearchFilter {
    fn matches(&self, v: &EvidenceVector) -> bool {
        if let Some(project_id) = &self.project_id
            && &v.project_id != project_id
        {
            return false;
        }
        if let Some(kind) = &self.kind
            && &v.payload.kind != kind
        {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn ensure_collection(&self, org_id: &str, dimension: usize) -> Result<()>;
    async fn upsert(&self, org_id: &str, vectors: Vec<EvidenceVector>) -> Result<()>;
    async fn search(
        &self,
        org_id: &str,
        query: &[f32],
        top_k: usize,
        filter: SearchFilter,
    ) -> Result<Vec<SearchHit>>;
}

struct Collection {
    dimension: usize,
    vectors: Vec<EvidenceVector>,
}

/// In-process cosine-similarity index, used for local development and
/// tests. Suitable as the default adapter behind [`VectorIndex`] when no
/// external vector database is configured.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    collections: Mutex<HashMap<String, Collection>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn ensure_collection(&self, org_id: &str, dimension: usize) -> Result<()> {
        let name = EvidenceVector::collection_name(org_id);
        let mut collections = self.collections.lock().expect("vector mutex poisoned");
        collections.entry(name).or_insert_with(|| Collection {
            dimension,
            vectors: Vec::new(),
        });
        Ok(())
    }

    async fn upsert(&self, org_id: &str, vectors: Vec<EvidenceVector>) -> Result<()> {
        let name = EvidenceVector::collection_name(org_id);
        let mut collections = self.collections.lock().expect("vector mutex poisoned");
        let collection = collections
            .get_mut(&name)
            .ok_or_else(|| anyhow::anyhow!("collection not found for org {org_id}, call ensure_collection first"))?;

        for v in vectors {
            if v.vector.len() != collection.dimension {
                bail!(
                    "vector dimension mismatch: expected {}, got {}",
                    collection.dimension,
                    v.vector.len()
                );
            }
            if let Some(existing) = collection.vectors.iter_mut().find(|e| e.id == v.id) {
                *existing = v;
            } else {
                collection.vectors.push(v);
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        org_id: &str,
        query: &[f32],
        top_k: usize,
        filter: SearchFilter,
    ) -> Result<Vec<SearchHit>> {
        let name = EvidenceVector::collection_name(org_id);
        let collections = self.collections.lock().expect("vector mutex poisoned");
        let Some(collection) = collections.get(&name) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<SearchHit> = collection
            .vectors
            .iter()
            .filter(|v| filter.matches(v))
            .map(|v| SearchHit {
                id: v.id,
                score: cosine_similarity(query, &v.vector),
                vector: v.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgd_core::EvidencePayload;

    fn vector(id: Uuid, project_id: &str, v: Vec<f32>, kind: &str) -> EvidenceVector {
        EvidenceVector {
            id,
            project_id: project_id.to_string(),
            org_id: "org1".to_string(),
            vector: v,
            payload: EvidencePayload {
                text_snippet: "snippet".to_string(),
                asset_ref: "ref".to_string(),
                kind: kind.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn upsert_without_ensure_fails() {
        let index = InMemoryVectorIndex::new();
        let result = index
            .upsert("org1", vec![vector(Uuid::new_v4(), "p1", vec![1.0, 0.0], "logo")])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let index = InMemoryVectorIndex::new();
        index.ensure_collection("org1", 2).await.unwrap();
        let result = index
            .upsert("org1", vec![vector(Uuid::new_v4(), "p1", vec![1.0, 0.0, 0.0], "logo")])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_similarity() {
        let index = InMemoryVectorIndex::new();
        index.ensure_collection("org1", 2).await.unwrap();
        let close = vector(Uuid::new_v4(), "p1", vec![1.0, 0.0], "logo");
        let far = vector(Uuid::new_v4(), "p1", vec![0.0, 1.0], "logo");
        index.upsert("org1", vec![close.clone(), far]).await.unwrap();

        let hits = index
            .search("org1", &[1.0, 0.0], 1, SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, close.id);
    }

    #[tokio::test]
    async fn search_respects_project_filter() {
        let index = InMemoryVectorIndex::new();
        index.ensure_collection("org1", 2).await.unwrap();
        let p1 = vector(Uuid::new_v4(), "p1", vec![1.0, 0.0], "logo");
        let p2 = vector(Uuid::new_v4(), "p2", vec![1.0, 0.0], "logo");
        index.upsert("org1", vec![p1.clone(), p2]).await.unwrap();

        let hits = index
            .search(
                "org1",
                &[1.0, 0.0],
                10,
                SearchFilter {
                    project_id: Some("p1".to_string()),
                    kind: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, p1.id);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_id() {
        let index = InMemoryVectorIndex::new();
        index.ensure_collection("org1", 2).await.unwrap();
        let id = Uuid::new_v4();
        index.upsert("org1", vec![vector(id, "p1", vec![1.0, 0.0], "logo")]).await.unwrap();
        index.upsert("org1", vec![vector(id, "p1", vec![0.0, 1.0], "logo")]).await.unwrap();

        let hits = index
            .search("org1", &[0.0, 1.0], 10, SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn search_on_unknown_collection_returns_empty() {
        let index = InMemoryVectorIndex::new();
        let hits = index.search("no-such-org", &[1.0], 5, SearchFilter::default()).await.unwrap();
        assert!(hits.is_empty());
    }
}
