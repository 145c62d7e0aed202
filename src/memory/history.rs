//! History store: durable record of completed runs
//!
//! Records survive the run that produced them; the JSONL store also survives
//! process restarts. Outcome and reflection are each written at most once
//! per run, which is what makes concurrent last-writer-wins acceptable.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{HistoryRecord, Outcome, OutcomeClass, Reflection};
use crate::Result;

/// Query filter for history records. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub subject: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub outcome_class: Option<OutcomeClass>,
}

impl HistoryFilter {
    fn matches(&self, record: &HistoryRecord) -> bool {
        if let Some(subject) = &self.subject {
            if &record.subject != subject {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if record.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if record.created_at > before {
                return false;
            }
        }
        if let Some(class) = self.outcome_class {
            match &record.outcome {
                Some(outcome) if outcome.class == class => {}
                _ => return false,
            }
        }
        true
    }
}

/// Aggregate performance over closed records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub total_records: usize,
    pub closed_records: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
}

/// Trait for durable run history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create a new record. Fails if the run id already exists.
    async fn create(&self, record: HistoryRecord) -> Result<()>;

    async fn get(&self, run_id: Uuid) -> Result<Option<HistoryRecord>>;

    /// Fill in the realized outcome. At most once per run.
    async fn update_outcome(&self, run_id: Uuid, outcome: Outcome) -> Result<()>;

    /// Attach a reflection. At most once per run.
    async fn update_reflection(&self, run_id: Uuid, reflection: Reflection) -> Result<()>;

    /// Finite, restartable query: issuing the same filter again re-iterates
    /// from the start. Results sorted by creation time ascending.
    async fn query(&self, filter: HistoryFilter) -> Result<Vec<HistoryRecord>>;
}

/// Win rate and P&L over everything a store holds.
pub async fn performance_stats(store: &dyn HistoryStore) -> Result<PerformanceStats> {
    let records = store.query(HistoryFilter::default()).await?;
    let total_records = records.len();

    let closed: Vec<&Outcome> = records.iter().filter_map(|r| r.outcome.as_ref()).collect();
    if closed.is_empty() {
        return Ok(PerformanceStats {
            total_records,
            closed_records: 0,
            win_rate: 0.0,
            total_pnl: 0.0,
            avg_pnl: 0.0,
        });
    }

    let wins = closed
        .iter()
        .filter(|o| o.class == OutcomeClass::Win)
        .count();
    let total_pnl: f64 = closed.iter().map(|o| o.realized_pnl).sum();

    Ok(PerformanceStats {
        total_records,
        closed_records: closed.len(),
        win_rate: wins as f64 / closed.len() as f64,
        total_pnl,
        avg_pnl: total_pnl / closed.len() as f64,
    })
}

//
// ================= In-memory store =================
//

/// In-memory history store for development and tests.
pub struct InMemoryHistoryStore {
    records: RwLock<HashMap<Uuid, HistoryRecord>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_outcome(record: &mut HistoryRecord, outcome: Outcome) -> Result<()> {
    if record.outcome.is_some() {
        return Err(PipelineError::AlreadyRecorded {
            run_id: record.run_id,
            field: "outcome",
        });
    }
    record.outcome = Some(outcome);
    Ok(())
}

fn apply_reflection(record: &mut HistoryRecord, reflection: Reflection) -> Result<()> {
    if record.reflection.is_some() {
        return Err(PipelineError::AlreadyRecorded {
            run_id: record.run_id,
            field: "reflection",
        });
    }
    record.reflection = Some(reflection);
    Ok(())
}

fn sorted_matches(
    records: impl Iterator<Item = HistoryRecord>,
    filter: &HistoryFilter,
) -> Vec<HistoryRecord> {
    let mut matched: Vec<HistoryRecord> = records.filter(|r| filter.matches(r)).collect();
    matched.sort_by_key(|r| r.created_at);
    matched
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create(&self, record: HistoryRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.run_id) {
            return Err(PipelineError::PersistenceFailure(format!(
                "duplicate run id {}",
                record.run_id
            )));
        }
        debug!(run_id = %record.run_id, subject = %record.subject, "History record created");
        records.insert(record.run_id, record);
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<HistoryRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&run_id).cloned())
    }

    async fn update_outcome(&self, run_id: Uuid, outcome: Outcome) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&run_id)
            .ok_or(PipelineError::RecordNotFound(run_id))?;
        apply_outcome(record, outcome)
    }

    async fn update_reflection(&self, run_id: Uuid, reflection: Reflection) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&run_id)
            .ok_or(PipelineError::RecordNotFound(run_id))?;
        apply_reflection(record, reflection)
    }

    async fn query(&self, filter: HistoryFilter) -> Result<Vec<HistoryRecord>> {
        let records = self.records.read().await;
        Ok(sorted_matches(records.values().cloned(), &filter))
    }
}

//
// ================= JSONL store =================
//

/// File-backed history store: one JSON record per line.
///
/// The full map is held in memory and the file is rewritten inside the write
/// lock on every mutation, so a reader never observes a half-written record.
pub struct JsonlHistoryStore {
    path: PathBuf,
    records: RwLock<HashMap<Uuid, HistoryRecord>>,
}

impl JsonlHistoryStore {
    /// Open (or create) a store at `path`, loading any existing records.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut records = HashMap::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                    let record: HistoryRecord = serde_json::from_str(line).map_err(|e| {
                        PipelineError::PersistenceFailure(format!(
                            "corrupt history line in {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                    records.insert(record.run_id, record);
                }
                info!(path = %path.display(), count = records.len(), "History store loaded");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Starting empty history store");
            }
            Err(e) => return Err(PipelineError::PersistenceFailure(e.to_string())),
        }

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    /// Serialize every record and rewrite the file. Called with the write
    /// lock held so mutation and flush are one atomic step to readers.
    async fn flush(&self, records: &HashMap<Uuid, HistoryRecord>) -> Result<()> {
        let mut out = String::new();
        let mut sorted: Vec<&HistoryRecord> = records.values().collect();
        sorted.sort_by_key(|r| r.created_at);
        for record in sorted {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        tokio::fs::write(&self.path, out)
            .await
            .map_err(|e| PipelineError::PersistenceFailure(e.to_string()))
    }
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn create(&self, record: HistoryRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.run_id) {
            return Err(PipelineError::PersistenceFailure(format!(
                "duplicate run id {}",
                record.run_id
            )));
        }
        records.insert(record.run_id, record);
        self.flush(&records).await
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<HistoryRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&run_id).cloned())
    }

    async fn update_outcome(&self, run_id: Uuid, outcome: Outcome) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&run_id)
            .ok_or(PipelineError::RecordNotFound(run_id))?;
        apply_outcome(record, outcome)?;
        self.flush(&records).await
    }

    async fn update_reflection(&self, run_id: Uuid, reflection: Reflection) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&run_id)
            .ok_or(PipelineError::RecordNotFound(run_id))?;
        apply_reflection(record, reflection)?;
        self.flush(&records).await
    }

    async fn query(&self, filter: HistoryFilter) -> Result<Vec<HistoryRecord>> {
        let records = self.records.read().await;
        Ok(sorted_matches(records.values().cloned(), &filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, Proposal};

    fn sample_record(subject: &str) -> HistoryRecord {
        HistoryRecord {
            run_id: Uuid::new_v4(),
            subject: subject.to_string(),
            created_at: Utc::now(),
            approved_action: Some(Proposal {
                subject: subject.to_string(),
                direction: Direction::Long,
                strategy: "long_equity".to_string(),
                size: 0.03,
                expected_return_pct: 8.0,
                max_loss_pct: 4.0,
                rationale: "test".to_string(),
                confidence: 0.7,
                created_at: Utc::now(),
            }),
            conditions: vec!["stop loss at -4%".to_string()],
            outcome: None,
            reflection: None,
            context_hash: "abc".to_string(),
        }
    }

    fn win_outcome() -> Outcome {
        Outcome {
            realized_pnl: 120.0,
            return_pct: 2.4,
            class: OutcomeClass::Win,
            closed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_then_get_roundtrip() {
        let store = InMemoryHistoryStore::new();
        let record = sample_record("AAPL");
        let run_id = record.run_id;

        store.create(record.clone()).await.unwrap();
        let fetched = store.get(run_id).await.unwrap().unwrap();

        assert_eq!(fetched.subject, record.subject);
        assert_eq!(fetched.conditions, record.conditions);
        assert!(fetched.outcome.is_none());
        assert!(fetched.reflection.is_none());
    }

    #[tokio::test]
    async fn test_update_outcome_preserves_other_fields() {
        let store = InMemoryHistoryStore::new();
        let record = sample_record("AAPL");
        let run_id = record.run_id;
        store.create(record.clone()).await.unwrap();

        store.update_outcome(run_id, win_outcome()).await.unwrap();

        let fetched = store.get(run_id).await.unwrap().unwrap();
        assert_eq!(fetched.outcome.as_ref().unwrap().class, OutcomeClass::Win);
        assert_eq!(fetched.subject, record.subject);
        assert_eq!(fetched.conditions, record.conditions);
        assert!(fetched.approved_action.is_some());
        assert!(fetched.reflection.is_none());
    }

    #[tokio::test]
    async fn test_outcome_written_at_most_once() {
        let store = InMemoryHistoryStore::new();
        let record = sample_record("AAPL");
        let run_id = record.run_id;
        store.create(record).await.unwrap();

        store.update_outcome(run_id, win_outcome()).await.unwrap();
        let second = store.update_outcome(run_id, win_outcome()).await;
        assert!(matches!(
            second,
            Err(PipelineError::AlreadyRecorded { field: "outcome", .. })
        ));
    }

    #[tokio::test]
    async fn test_query_by_subject_and_outcome_class() {
        let store = InMemoryHistoryStore::new();
        let a = sample_record("AAPL");
        let b = sample_record("MSFT");
        let a_id = a.run_id;
        store.create(a).await.unwrap();
        store.create(b).await.unwrap();
        store.update_outcome(a_id, win_outcome()).await.unwrap();

        let by_subject = store
            .query(HistoryFilter {
                subject: Some("MSFT".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_subject.len(), 1);
        assert_eq!(by_subject[0].subject, "MSFT");

        let wins = store
            .query(HistoryFilter {
                outcome_class: Some(OutcomeClass::Win),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(wins.len(), 1);
        assert_eq!(wins[0].run_id, a_id);
    }

    #[tokio::test]
    async fn test_query_is_restartable() {
        let store = InMemoryHistoryStore::new();
        store.create(sample_record("AAPL")).await.unwrap();
        store.create(sample_record("AAPL")).await.unwrap();

        let filter = HistoryFilter {
            subject: Some("AAPL".to_string()),
            ..Default::default()
        };
        let first = store.query(filter.clone()).await.unwrap();
        let second = store.query(filter).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first.len(), second.len());
        let ids_first: Vec<Uuid> = first.iter().map(|r| r.run_id).collect();
        let ids_second: Vec<Uuid> = second.iter().map(|r| r.run_id).collect();
        assert_eq!(ids_first, ids_second);
    }

    #[tokio::test]
    async fn test_jsonl_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        let record = sample_record("AAPL");
        let run_id = record.run_id;
        {
            let store = JsonlHistoryStore::open(&path).await.unwrap();
            store.create(record).await.unwrap();
            store.update_outcome(run_id, win_outcome()).await.unwrap();
        }

        let reopened = JsonlHistoryStore::open(&path).await.unwrap();
        let fetched = reopened.get(run_id).await.unwrap().unwrap();
        assert_eq!(fetched.subject, "AAPL");
        assert_eq!(fetched.outcome.unwrap().class, OutcomeClass::Win);
    }

    #[tokio::test]
    async fn test_performance_stats() {
        let store = InMemoryHistoryStore::new();
        let a = sample_record("AAPL");
        let b = sample_record("MSFT");
        let a_id = a.run_id;
        let b_id = b.run_id;
        store.create(a).await.unwrap();
        store.create(b).await.unwrap();
        store.update_outcome(a_id, win_outcome()).await.unwrap();
        store
            .update_outcome(
                b_id,
                Outcome {
                    realized_pnl: -40.0,
                    return_pct: -0.8,
                    class: OutcomeClass::Loss,
                    closed_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let stats = performance_stats(&store).await.unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.closed_records, 2);
        assert!((stats.win_rate - 0.5).abs() < f64::EPSILON);
        assert!((stats.total_pnl - 80.0).abs() < f64::EPSILON);
    }
}
