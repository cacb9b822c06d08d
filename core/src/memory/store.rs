//! Vector store interface and in-memory implementation.
//!
//! Driver internals for external stores stay behind the `VectorStore`
//! trait; the in-memory cosine-similarity store is the development and
//! test backend.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;

use crate::{MatrixError, Result};

/// Collection holding extracted knowledge facts.
pub const KNOWLEDGE_COLLECTION: &str = "matrix_knowledge";
/// Collection holding reasoning traces.
pub const REFLECTION_COLLECTION: &str = "matrix_reflection";

/// Knowledge ids live in `[1, 333_333]`; reflection ids start above so the
/// two ranges can never collide.
pub const KNOWLEDGE_ID_MAX: u64 = 333_333;
pub const REFLECTION_ID_BASE: u64 = 1_000_000;

/// One similarity hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: u64,
    pub score: f32,
    pub text: String,
    pub payload: Value,
}

/// Vector store seam. Writes use the store's own concurrency control;
/// UPDATE is last-writer-wins by id.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn insert(&self, collection: &str, id: u64, vector: Vec<f32>, payload: Value)
        -> Result<()>;

    async fn update(&self, collection: &str, id: u64, vector: Vec<f32>, payload: Value)
        -> Result<()>;

    async fn delete(&self, collection: &str, id: u64) -> Result<()>;

    async fn search(&self, collection: &str, vector: &[f32], limit: usize)
        -> Result<Vec<SearchHit>>;

    async fn contains(&self, collection: &str, id: u64) -> Result<bool>;

    async fn count(&self, collection: &str) -> Result<usize>;
}

/// Allocate an unused knowledge id in `[1, KNOWLEDGE_ID_MAX]`.
pub async fn allocate_knowledge_id(store: &dyn VectorStore) -> Result<u64> {
    let mut rng_draws: Vec<u64> = Vec::new();
    {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            rng_draws.push(rng.gen_range(1..=KNOWLEDGE_ID_MAX));
        }
    }
    for candidate in rng_draws {
        if !store.contains(KNOWLEDGE_COLLECTION, candidate).await? {
            return Ok(candidate);
        }
    }
    Err(MatrixError::MemoryPipeline(
        "could not allocate a free knowledge id".to_string(),
    ))
}

#[derive(Debug, Clone)]
struct VectorRecord {
    id: u64,
    vector: Vec<f32>,
    text: String,
    payload: Value,
}

/// In-memory vector store with cosine similarity search.
pub struct InMemoryVectorStore {
    collections: DashMap<String, Vec<VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
        }
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn insert(
        &self,
        collection: &str,
        id: u64,
        vector: Vec<f32>,
        payload: Value,
    ) -> Result<()> {
        let mut records = self.collections.entry(collection.to_string()).or_default();
        if records.iter().any(|r| r.id == id) {
            return Err(MatrixError::MemoryPipeline(format!(
                "duplicate id {id} in collection {collection}"
            )));
        }
        let text = payload
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        records.push(VectorRecord {
            id,
            vector,
            text,
            payload,
        });
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        id: u64,
        vector: Vec<f32>,
        payload: Value,
    ) -> Result<()> {
        let mut records = self.collections.entry(collection.to_string()).or_default();
        let text = payload
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        match records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.vector = vector;
                record.text = text;
                record.payload = payload;
                Ok(())
            }
            None => {
                // Last-writer-wins by id; an update against a vanished
                // record becomes an insert.
                records.push(VectorRecord {
                    id,
                    vector,
                    text,
                    payload,
                });
                Ok(())
            }
        }
    }

    async fn delete(&self, collection: &str, id: u64) -> Result<()> {
        if let Some(mut records) = self.collections.get_mut(collection) {
            records.retain(|r| r.id != id);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let Some(records) = self.collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<SearchHit> = records
            .iter()
            .map(|record| SearchHit {
                id: record.id,
                score: cosine_similarity(vector, &record.vector),
                text: record.text.clone(),
                payload: record.payload.clone(),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn contains(&self, collection: &str, id: u64) -> Result<bool> {
        Ok(self
            .collections
            .get(collection)
            .map(|records| records.iter().any(|r| r.id == id))
            .unwrap_or(false))
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        Ok(self
            .collections
            .get(collection)
            .map(|records| records.len())
            .unwrap_or(0))
    }
}

/// Calculate cosine similarity between two vectors
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn search_ranks_by_similarity() {
        let store = InMemoryVectorStore::new();
        store
            .insert(KNOWLEDGE_COLLECTION, 1, vec![1.0, 0.0, 0.0], json!({"text": "first"}))
            .await
            .unwrap();
        store
            .insert(KNOWLEDGE_COLLECTION, 2, vec![0.0, 1.0, 0.0], json!({"text": "second"}))
            .await
            .unwrap();
        store
            .insert(KNOWLEDGE_COLLECTION, 3, vec![0.9, 0.1, 0.0], json!({"text": "third"}))
            .await
            .unwrap();

        let hits = store
            .search(KNOWLEDGE_COLLECTION, &[1.0, 0.0, 0.0], 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 1);
        assert_eq!(hits[1].id, 3);
        assert!(hits[0].score > 0.99);
        assert!(hits[1].score > 0.5);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryVectorStore::new();
        store
            .insert(KNOWLEDGE_COLLECTION, 7, vec![1.0], json!({"text": "a"}))
            .await
            .unwrap();
        assert!(store
            .insert(KNOWLEDGE_COLLECTION, 7, vec![1.0], json!({"text": "b"}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn update_replaces_payload() {
        let store = InMemoryVectorStore::new();
        store
            .insert(KNOWLEDGE_COLLECTION, 5, vec![1.0], json!({"text": "old"}))
            .await
            .unwrap();
        store
            .update(KNOWLEDGE_COLLECTION, 5, vec![0.5], json!({"text": "new"}))
            .await
            .unwrap();

        let hits = store.search(KNOWLEDGE_COLLECTION, &[0.5], 1).await.unwrap();
        assert_eq!(hits[0].text, "new");
        assert_eq!(store.count(KNOWLEDGE_COLLECTION).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = InMemoryVectorStore::new();
        store
            .insert(KNOWLEDGE_COLLECTION, 9, vec![1.0], json!({"text": "x"}))
            .await
            .unwrap();
        store.delete(KNOWLEDGE_COLLECTION, 9).await.unwrap();
        assert!(!store.contains(KNOWLEDGE_COLLECTION, 9).await.unwrap());
    }

    #[tokio::test]
    async fn allocated_ids_stay_in_range() {
        let store = InMemoryVectorStore::new();
        for _ in 0..32 {
            let id = allocate_knowledge_id(&store).await.unwrap();
            assert!((1..=KNOWLEDGE_ID_MAX).contains(&id));
            store
                .insert(KNOWLEDGE_COLLECTION, id, vec![1.0], json!({"text": "t"}))
                .await
                .unwrap();
        }
    }

    #[test]
    fn cosine_similarity_basics() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&a, &c).abs() < 0.001);
    }
}
