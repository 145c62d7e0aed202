//! Pattern store: advisory precedent memory
//!
//! Holds embeddings of past successful runs and answers nearest-neighbor
//! queries. Strictly advisory: when the index is unavailable, `search`
//! returns nothing and `index` silently drops the entry. A run must never
//! fail because this store is down.

use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::PatternEntry;

/// A ranked search hit.
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub entry: PatternEntry,
    /// Cosine similarity in [-1, 1]; higher is closer.
    pub score: f64,
}

/// Similarity-searchable store of past successful configurations.
///
/// Shared across runs; interior locking makes it safe for concurrent
/// writers.
pub struct PatternStore {
    // None models the backing index being unavailable.
    index: Option<RwLock<Vec<PatternEntry>>>,
}

impl PatternStore {
    pub fn new() -> Self {
        Self {
            index: Some(RwLock::new(Vec::new())),
        }
    }

    /// A store whose backing index could not be reached. All operations
    /// degrade to no-ops.
    pub fn unavailable() -> Self {
        warn!("Pattern index unavailable; precedent search disabled");
        Self { index: None }
    }

    pub fn is_available(&self) -> bool {
        self.index.is_some()
    }

    /// Add an entry. No-op when the index is unavailable; never an error.
    pub async fn index(&self, entry: PatternEntry) {
        let Some(index) = &self.index else {
            debug!(pattern_id = %entry.pattern_id, "Dropping pattern entry, index unavailable");
            return;
        };

        if entry.embedding.is_empty() {
            warn!(pattern_id = %entry.pattern_id, "Refusing to index empty embedding");
            return;
        }

        let mut entries = index.write().await;
        entries.push(entry);
    }

    /// Up to `k` entries ranked by cosine similarity to `query`. Returns an
    /// empty list when the index is unavailable or the query is degenerate.
    pub async fn search(&self, query: &[f64], k: usize) -> Vec<PatternMatch> {
        let Some(index) = &self.index else {
            return Vec::new();
        };
        if query.is_empty() || k == 0 {
            return Vec::new();
        }

        let entries = index.read().await;
        let mut matches: Vec<PatternMatch> = entries
            .iter()
            .filter_map(|entry| {
                cosine_similarity(query, &entry.embedding).map(|score| PatternMatch {
                    entry: entry.clone(),
                    score,
                })
            })
            .collect();

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(k);
        matches
    }

    pub async fn len(&self) -> usize {
        match &self.index {
            Some(index) => index.read().await.len(),
            None => 0,
        }
    }

    pub async fn get(&self, pattern_id: Uuid) -> Option<PatternEntry> {
        let index = self.index.as_ref()?;
        let entries = index.read().await;
        entries.iter().find(|e| e.pattern_id == pattern_id).cloned()
    }
}

impl Default for PatternStore {
    fn default() -> Self {
        Self::new()
    }
}

/// None when the vectors differ in dimension or either has zero norm.
fn cosine_similarity(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() {
        return None;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(embedding: Vec<f64>, description: &str) -> PatternEntry {
        PatternEntry {
            pattern_id: Uuid::new_v4(),
            embedding,
            description: description.to_string(),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_search_ranks_by_similarity() {
        let store = PatternStore::new();
        store.index(entry(vec![1.0, 0.0, 0.0], "aligned")).await;
        store.index(entry(vec![0.0, 1.0, 0.0], "orthogonal")).await;
        store.index(entry(vec![0.9, 0.1, 0.0], "close")).await;

        let matches = store.search(&[1.0, 0.0, 0.0], 2).await;
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].entry.description, "aligned");
        assert_eq!(matches[1].entry.description, "close");
        assert!(matches[0].score > matches[1].score);
    }

    #[tokio::test]
    async fn test_unavailable_index_degrades_gracefully() {
        let store = PatternStore::unavailable();

        // index is a no-op, search returns empty; neither panics or errors.
        store.index(entry(vec![1.0, 0.0], "ignored")).await;
        let matches = store.search(&[1.0, 0.0], 5).await;
        assert!(matches.is_empty());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_entries_skipped() {
        let store = PatternStore::new();
        store.index(entry(vec![1.0, 0.0], "2d")).await;
        store.index(entry(vec![1.0, 0.0, 0.0], "3d")).await;

        let matches = store.search(&[1.0, 0.0], 5).await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].entry.description, "2d");
    }

    #[tokio::test]
    async fn test_empty_query_returns_empty() {
        let store = PatternStore::new();
        store.index(entry(vec![1.0], "x")).await;
        assert!(store.search(&[], 5).await.is_empty());
    }
}
