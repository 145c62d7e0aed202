//! Worker call boundary
//!
//! Workers are external reasoning services. The core hands them an opaque
//! context bundle and gets back a typed Opinion or a failure; nothing
//! partially-parsed crosses this boundary.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::PipelineError;
use crate::models::{Opinion, WorkerRole};
use crate::Result;

pub mod remote;
pub use remote::RemoteWorker;

//
// ================= Context Bundle =================
//

/// Opaque context assembled from working-store contents plus run metadata.
///
/// The core never inspects what workers put in here beyond the typed Opinion
/// contract.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    entries: serde_json::Map<String, Value>,
}

impl ContextBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.entries.clone())
    }

    /// SHA-256 over the serialized bundle, streamed straight into the hasher.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        if serde_json::to_writer(&mut HashWriter(&mut hasher), &self.entries).is_err() {
            return String::new();
        }
        hex::encode(hasher.finalize())
    }
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

//
// ================= Worker Trait =================
//

/// An external reasoning service. Stateless per call.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn invoke(&self, role: WorkerRole, context: &ContextBundle) -> Result<Opinion>;
}

/// Validation boundary for worker output: either a well-typed Opinion comes
/// through, or the call counts as a worker failure.
pub fn validate_opinion(role: WorkerRole, subject: &str, opinion: Opinion) -> Result<Opinion> {
    if opinion.role != role {
        return Err(PipelineError::InvalidOpinion(format!(
            "expected role {}, got {}",
            role, opinion.role
        )));
    }
    if opinion.subject != subject {
        return Err(PipelineError::InvalidOpinion(format!(
            "expected subject {}, got {}",
            subject, opinion.subject
        )));
    }
    if !opinion.confidence.is_finite() || !(0.0..=1.0).contains(&opinion.confidence) {
        return Err(PipelineError::InvalidOpinion(format!(
            "confidence {} outside [0, 1]",
            opinion.confidence
        )));
    }
    Ok(opinion)
}

//
// ================= Registry =================
//

/// Maps roles to worker implementations and enforces per-call timeouts.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerRole, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, role: WorkerRole, worker: Arc<dyn Worker>) {
        self.workers.insert(role, worker);
    }

    pub fn contains(&self, role: WorkerRole) -> bool {
        self.workers.contains_key(&role)
    }

    /// Invoke a role's worker with a hard timeout. A timed-out call is
    /// indistinguishable from a failed one for transition purposes.
    pub async fn call_with_timeout(
        &self,
        role: WorkerRole,
        subject: &str,
        context: &ContextBundle,
        timeout: Duration,
    ) -> Result<Opinion> {
        let worker = self
            .workers
            .get(&role)
            .ok_or(PipelineError::WorkerNotRegistered(role))?;

        match tokio::time::timeout(timeout, worker.invoke(role, context)).await {
            Ok(Ok(opinion)) => validate_opinion(role, subject, opinion),
            Ok(Err(e)) => {
                warn!(role = %role, error = %e, "Worker call failed");
                Err(PipelineError::WorkerFailure {
                    role,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(role = %role, timeout_ms = timeout.as_millis() as u64, "Worker call timed out");
                Err(PipelineError::WorkerTimeout {
                    role,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

//
// ================= Scripted Worker (test double) =================
//

/// A worker that replays queued responses and counts invocations.
///
/// Used throughout the tests to verify zero-call properties (a rejected gate
/// must never reach the authority worker, a failed fan-out must never reach
/// the debate workers).
pub struct ScriptedWorker {
    script: Mutex<Vec<Result<Opinion>>>,
    calls: AtomicUsize,
    /// Repeated for every call once the script runs dry.
    fallback: Option<Opinion>,
    last_context: Mutex<Option<Value>>,
}

impl ScriptedWorker {
    pub fn new(script: Vec<Result<Opinion>>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
            fallback: None,
            last_context: Mutex::new(None),
        }
    }

    /// Always answer with the same opinion.
    pub fn always(opinion: Opinion) -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fallback: Some(opinion),
            last_context: Mutex::new(None),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The context bundle of the most recent invocation, for assertions.
    pub async fn last_context(&self) -> Option<Value> {
        self.last_context.lock().await.clone()
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn invoke(&self, role: WorkerRole, context: &ContextBundle) -> Result<Opinion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_context.lock().await = Some(context.as_value());
        let mut script = self.script.lock().await;
        if script.is_empty() {
            return match &self.fallback {
                Some(opinion) => Ok(opinion.clone()),
                None => Err(PipelineError::WorkerFailure {
                    role,
                    reason: "script exhausted".to_string(),
                }),
            };
        }
        script.remove(0)
    }
}

/// A worker that never answers inside any reasonable timeout.
pub struct StalledWorker;

#[async_trait]
impl Worker for StalledWorker {
    async fn invoke(&self, role: WorkerRole, _context: &ContextBundle) -> Result<Opinion> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(PipelineError::WorkerFailure {
            role,
            reason: "unreachable".to_string(),
        })
    }
}
