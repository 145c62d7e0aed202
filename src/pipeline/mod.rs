//! Pipeline orchestrator - the phase state machine
//!
//! FANOUT → DEBATE → SYNTHESIS → RISK GATE → AUTHORITY GATE → EXECUTION →
//! REFLECTION → DONE, with REJECTED and FAILED as absorbing states.
//!
//! Transitions are pure functions of phase outputs, so the machine can be
//! replayed deterministically given fixed opinions.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::debate::{DebateLoop, DebateOutcome, Verdict};
use crate::error::PipelineError;
use crate::gate::{Gate, GateOutcome};
use crate::memory::{HistoryStore, PatternStore, WorkingStore};
use crate::models::{
    Direction, GateDecision, HistoryRecord, Opinion, Outcome, OutcomeClass, PatternEntry,
    Proposal, Reflection, WorkerRole,
};
use crate::worker::{ContextBundle, WorkerRegistry};
use crate::Result;

/// Confidence multiplier applied to a proposal synthesized from an
/// incomplete debate, so the risk stage sees the discount.
const INCOMPLETE_DEBATE_DISCOUNT: f64 = 0.5;

/// How many pattern-store precedents to seed into the gate context.
const PRECEDENT_LIMIT: usize = 3;

//
// ================= Phase =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fanout,
    Debate,
    Synthesis,
    RiskGate,
    AuthorityGate,
    Execution,
    Reflection,
    Done,
    Rejected,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Rejected | Phase::Failed)
    }

    /// Legal edges of the state machine. Strictly forward, except that
    /// Failed is reachable from anywhere and Rejected only from the gates.
    pub fn can_transition(self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Phase::Failed {
            return true;
        }
        matches!(
            (self, next),
            (Phase::Fanout, Phase::Debate)
                | (Phase::Debate, Phase::Synthesis)
                | (Phase::Synthesis, Phase::RiskGate)
                | (Phase::RiskGate, Phase::AuthorityGate)
                | (Phase::RiskGate, Phase::Rejected)
                | (Phase::AuthorityGate, Phase::Execution)
                | (Phase::AuthorityGate, Phase::Rejected)
                | (Phase::Execution, Phase::Reflection)
                | (Phase::Reflection, Phase::Done)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Fanout => "fanout",
            Phase::Debate => "debate",
            Phase::Synthesis => "synthesis",
            Phase::RiskGate => "risk_gate",
            Phase::AuthorityGate => "authority_gate",
            Phase::Execution => "execution",
            Phase::Reflection => "reflection",
            Phase::Done => "done",
            Phase::Rejected => "rejected",
            Phase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Run =================
//

/// An error recorded against a run, with the phase it happened in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub phase: Phase,
    pub role: Option<WorkerRole>,
    pub message: String,
}

/// One execution of the pipeline for one subject. Owned exclusively by the
/// orchestrator; mutated only through phase transitions.
#[derive(Debug)]
pub struct Run {
    pub run_id: Uuid,
    pub subject: String,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub errors: Vec<RunError>,
    visited: Vec<Phase>,
}

impl Run {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            subject: subject.into(),
            phase: Phase::Fanout,
            started_at: Utc::now(),
            errors: Vec::new(),
            visited: vec![Phase::Fanout],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Phases in visit order, for the phase-order law.
    pub fn visited(&self) -> &[Phase] {
        &self.visited
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_transition(next),
            "illegal transition {} -> {}",
            self.phase,
            next
        );
        debug!(run_id = %self.run_id, from = %self.phase, to = %next, "Phase transition");
        self.phase = next;
        self.visited.push(next);
    }

    fn record_error(&mut self, role: Option<WorkerRole>, message: impl Into<String>) {
        self.errors.push(RunError {
            phase: self.phase,
            role,
            message: message.into(),
        });
    }

    fn fail(&mut self, role: Option<WorkerRole>, message: impl Into<String>) {
        let message = message.into();
        warn!(run_id = %self.run_id, phase = %self.phase, %message, "Run failed");
        self.record_error(role, message);
        self.advance(Phase::Failed);
    }
}

//
// ================= Pure transitions =================
//

/// Transition functions: pure in their inputs so they can be unit-tested
/// and replayed without the async machinery around them.
pub mod transition {
    use super::*;

    /// Any required role without an opinion fails the run.
    pub fn after_fanout(missing_required: &[WorkerRole]) -> Phase {
        if missing_required.is_empty() {
            Phase::Debate
        } else {
            Phase::Failed
        }
    }

    /// Debate termination always hands to synthesis; an incomplete
    /// transcript is handled there by discounting, not by skipping.
    pub fn after_debate(_outcome: &DebateOutcome) -> Phase {
        Phase::Synthesis
    }

    pub fn after_synthesis(result: &Result<Proposal>) -> Phase {
        match result {
            Ok(_) => Phase::RiskGate,
            Err(_) => Phase::Failed,
        }
    }

    /// Risk veto is final; approval hands to the authority stage.
    pub fn after_risk(decision: &GateDecision) -> Phase {
        if decision.approved {
            Phase::AuthorityGate
        } else {
            Phase::Rejected
        }
    }

    pub fn after_authority(decision: &GateDecision) -> Phase {
        if decision.approved {
            Phase::Execution
        } else {
            Phase::Rejected
        }
    }

    pub fn after_execution(succeeded: bool) -> Phase {
        if succeeded {
            Phase::Reflection
        } else {
            Phase::Failed
        }
    }

    /// Reflection is best-effort; the run reaches Done either way.
    pub fn after_reflection() -> Phase {
        Phase::Done
    }
}

//
// ================= Report =================
//

/// What a caller gets back: terminal phase, reason, and accumulated errors,
/// never a bare stack trace.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub subject: String,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub phases_visited: Vec<Phase>,
    pub verdict: Option<String>,
    pub proposal: Option<Proposal>,
    /// The proposal execution actually received (gate-reduced when the
    /// authority trimmed the scope).
    pub executed: Option<Proposal>,
    pub conditions: Vec<String>,
    pub history_recorded: bool,
    pub failure: Option<String>,
    pub errors: Vec<RunError>,
}

#[derive(Default)]
struct DriveOutcome {
    verdict: Option<Verdict>,
    proposal: Option<Proposal>,
    executed: Option<Proposal>,
    conditions: Vec<String>,
    history_recorded: bool,
    failure: Option<String>,
}

//
// ================= Orchestrator =================
//

/// Drives runs through the phase sequence, fanning out workers, running the
/// debate and the gate, and persisting outcomes.
pub struct Orchestrator {
    registry: WorkerRegistry,
    config: PipelineConfig,
    history: Arc<dyn HistoryStore>,
    patterns: Arc<PatternStore>,
}

impl Orchestrator {
    pub fn new(
        registry: WorkerRegistry,
        config: PipelineConfig,
        history: Arc<dyn HistoryStore>,
        patterns: Arc<PatternStore>,
    ) -> Self {
        Self {
            registry,
            config,
            history,
            patterns,
        }
    }

    /// Run the full pipeline for one subject. Multiple runs for different
    /// subjects may execute concurrently; only the history and pattern
    /// stores are shared between them.
    pub async fn run(&self, subject: &str) -> RunReport {
        let mut run = Run::new(subject);
        let mut working = WorkingStore::new(self.config.working_ttl);
        let mut out = DriveOutcome::default();

        info!(run_id = %run.run_id, subject, "Run starting");

        let drive = self.drive(&mut run, &mut working, &mut out);
        if tokio::time::timeout(self.config.run_deadline, drive)
            .await
            .is_err()
        {
            let phase = run.phase;
            out.failure = Some(format!("run deadline exceeded in phase {}", phase));
            run.fail(None, format!("run deadline exceeded in phase {}", phase));
        }

        // The working store is scoped to this run and dropped with it.
        working.clear();

        info!(
            run_id = %run.run_id,
            phase = %run.phase,
            errors = run.errors.len(),
            "Run finished"
        );

        RunReport {
            run_id: run.run_id,
            subject: run.subject.clone(),
            phase: run.phase,
            started_at: run.started_at,
            phases_visited: run.visited().to_vec(),
            verdict: out.verdict.map(|v| format!("{:?}", v).to_lowercase()),
            proposal: out.proposal,
            executed: out.executed,
            conditions: out.conditions,
            history_recorded: out.history_recorded,
            failure: out.failure,
            errors: run.errors,
        }
    }

    async fn drive(&self, run: &mut Run, working: &mut WorkingStore, out: &mut DriveOutcome) {
        // === FANOUT ===
        let missing_required = self.fanout(run, working).await;
        match transition::after_fanout(&missing_required) {
            Phase::Debate => run.advance(Phase::Debate),
            _ => {
                out.failure = Some(
                    PipelineError::RequiredInputMissing(missing_required.clone()).to_string(),
                );
                run.fail(
                    None,
                    PipelineError::RequiredInputMissing(missing_required).to_string(),
                );
                return;
            }
        }

        // === DEBATE ===
        let base_ctx = self.bundle(run, working);
        let debate = DebateLoop::new(
            &self.registry,
            &self.config.debate,
            self.config.worker_timeout,
            WorkerRole::BullResearcher,
            WorkerRole::BearResearcher,
        )
        .run(&run.subject, &base_ctx)
        .await;

        for message in &debate.errors {
            run.record_error(None, message.clone());
        }
        // The full transcript lands in the working store before the
        // transition, so synthesis can read it.
        working.put(
            "debate_transcript",
            serde_json::to_value(&debate.transcript).unwrap_or_default(),
        );
        working.put("debate_verdict", json!(format!("{:?}", debate.verdict).to_lowercase()));
        working.put("debate_incomplete", json!(debate.incomplete));
        out.verdict = Some(debate.verdict);
        run.advance(transition::after_debate(&debate));

        // === SYNTHESIS ===
        let ctx = self.bundle(run, working);
        let synthesis = match self
            .registry
            .call_with_timeout(
                WorkerRole::Strategist,
                &run.subject,
                &ctx,
                self.config.worker_timeout,
            )
            .await
        {
            Ok(opinion) => proposal_from_opinion(&opinion),
            Err(e) => Err(e),
        };

        let mut proposal = match synthesis {
            Ok(proposal) => proposal,
            Err(e) => {
                out.failure = Some(format!("synthesis failed: {}", e));
                run.fail(Some(WorkerRole::Strategist), e.to_string());
                return;
            }
        };

        if debate.incomplete {
            // Conservative handling of an incomplete transcript: the gates
            // see a discounted confidence, not a silently conclusive one.
            proposal.confidence *= INCOMPLETE_DEBATE_DISCOUNT;
            run.record_error(None, "debate incomplete; proposal confidence discounted");
        }

        working.put("proposal", serde_json::to_value(&proposal).unwrap_or_default());
        self.seed_precedents(&proposal, working).await;
        out.proposal = Some(proposal.clone());
        run.advance(Phase::RiskGate);

        // === GATES ===
        let gate_ctx = self.bundle(run, working);
        let context_hash = gate_ctx.hash();
        let gate = Gate::new(
            &self.registry,
            &self.config.risk_limits,
            self.config.worker_timeout,
        );
        let gate_outcome = gate.evaluate(&proposal, &gate_ctx).await;
        for message in &gate_outcome.errors {
            run.record_error(None, message.clone());
        }

        match transition::after_risk(&gate_outcome.risk) {
            Phase::AuthorityGate => run.advance(Phase::AuthorityGate),
            _ => {
                run.advance(Phase::Rejected);
                self.write_rejection_record(run, out, &gate_outcome, context_hash)
                    .await;
                return;
            }
        }

        // The gate always produces an authority decision after risk
        // approval; a missing one is treated as a rejection.
        let Some(authority) = gate_outcome.authority.clone() else {
            run.advance(Phase::Rejected);
            self.write_rejection_record(run, out, &gate_outcome, context_hash)
                .await;
            return;
        };
        match transition::after_authority(&authority) {
            Phase::Execution => run.advance(Phase::Execution),
            _ => {
                run.advance(Phase::Rejected);
                self.write_rejection_record(run, out, &gate_outcome, context_hash)
                    .await;
                return;
            }
        }

        // === HISTORY CREATE (at approval) ===
        let effective = gate_outcome.effective_proposal(&proposal);
        let conditions = gate_outcome.conditions();
        let record = HistoryRecord {
            run_id: run.run_id,
            subject: run.subject.clone(),
            created_at: Utc::now(),
            approved_action: Some(effective.clone()),
            conditions: conditions.clone(),
            outcome: None,
            reflection: None,
            context_hash,
        };
        if let Err(e) = self.history.create(record).await {
            // A lost approval record breaks auditability; this is fatal.
            out.failure = Some(e.to_string());
            run.fail(None, e.to_string());
            return;
        }
        out.history_recorded = true;
        out.conditions = conditions.clone();
        out.executed = Some(effective.clone());

        // === EXECUTION ===
        let mut exec_ctx = self.bundle(run, working);
        exec_ctx.insert("proposal", serde_json::to_value(&effective).unwrap_or_default());
        exec_ctx.insert("conditions", json!(conditions));

        let executed = self
            .registry
            .call_with_timeout(
                WorkerRole::Trader,
                &run.subject,
                &exec_ctx,
                self.config.worker_timeout,
            )
            .await;
        match transition::after_execution(executed.is_ok()) {
            Phase::Reflection => {
                if let Ok(opinion) = &executed {
                    working.put("execution", opinion.details.clone());
                }
                run.advance(Phase::Reflection);
            }
            _ => {
                let reason = executed.err().map(|e| e.to_string()).unwrap_or_default();
                out.failure = Some(format!("execution failed: {}", reason));
                run.fail(Some(WorkerRole::Trader), reason);
                return;
            }
        }

        // === REFLECTION (best-effort) ===
        let refl_ctx = self.bundle(run, working);
        match self
            .registry
            .call_with_timeout(
                WorkerRole::ReflectiveAgent,
                &run.subject,
                &refl_ctx,
                self.config.worker_timeout,
            )
            .await
        {
            Ok(opinion) => {
                let reflection = reflection_from_opinion(&opinion);
                if let Err(e) = self.history.update_reflection(run.run_id, reflection).await {
                    warn!(run_id = %run.run_id, error = %e, "Reflection write failed");
                    run.record_error(Some(WorkerRole::ReflectiveAgent), e.to_string());
                }
            }
            Err(e) => {
                run.record_error(Some(WorkerRole::ReflectiveAgent), e.to_string());
            }
        }
        run.advance(transition::after_reflection());
    }

    /// Fan out all declared roles concurrently; wait for every call to
    /// finish or time out. Returns the required roles with no opinion.
    async fn fanout(&self, run: &mut Run, working: &mut WorkingStore) -> Vec<WorkerRole> {
        let ctx = self.bundle(run, working);
        let mut tasks: JoinSet<(WorkerRole, bool, Result<Opinion>)> = JoinSet::new();

        for (role, required) in self.config.fanout_roles() {
            let registry = self.registry.clone();
            let subject = run.subject.clone();
            let ctx = ctx.clone();
            let timeout = self.config.worker_timeout;
            tasks.spawn(async move {
                let result = registry.call_with_timeout(role, &subject, &ctx, timeout).await;
                (role, required, result)
            });
        }

        let mut missing_required = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((role, _, Ok(opinion))) => {
                    debug!(role = %role, confidence = opinion.confidence, "Opinion collected");
                    working.put(
                        format!("opinion:{}", role),
                        serde_json::to_value(&opinion).unwrap_or_default(),
                    );
                }
                Ok((role, required, Err(e))) => {
                    // A timed-out call is treated identically to a failed
                    // one; best-effort roles are simply omitted.
                    run.record_error(Some(role), e.to_string());
                    if required {
                        missing_required.push(role);
                    }
                }
                Err(join_err) => {
                    run.record_error(None, format!("fanout task aborted: {}", join_err));
                }
            }
        }

        missing_required
    }

    /// Snapshot of run metadata plus all live working-store entries; what
    /// every worker call receives as its opaque context.
    fn bundle(&self, run: &Run, working: &mut WorkingStore) -> ContextBundle {
        let mut ctx = ContextBundle::new();
        ctx.insert("subject", json!(run.subject));
        ctx.insert("run_id", json!(run.run_id.to_string()));
        ctx.insert("started_at", json!(run.started_at.to_rfc3339()));
        for key in working.active_keys() {
            if let Some(value) = working.get(&key) {
                ctx.insert(key, value.clone());
            }
        }
        ctx
    }

    /// Advisory precedent seeding; never blocks or fails the run.
    async fn seed_precedents(&self, proposal: &Proposal, working: &mut WorkingStore) {
        let matches = self
            .patterns
            .search(&proposal_embedding(proposal), PRECEDENT_LIMIT)
            .await;
        if matches.is_empty() {
            return;
        }
        let precedents: Vec<_> = matches
            .iter()
            .map(|m| {
                json!({
                    "description": m.entry.description,
                    "score": m.score,
                    "metadata": m.entry.metadata,
                })
            })
            .collect();
        working.put("precedents", json!(precedents));
    }

    /// Rejected runs still leave an audit record, with no approved action
    /// and no outcome.
    async fn write_rejection_record(
        &self,
        run: &mut Run,
        out: &mut DriveOutcome,
        gate_outcome: &GateOutcome,
        context_hash: String,
    ) {
        out.conditions = gate_outcome.conditions();
        let record = HistoryRecord {
            run_id: run.run_id,
            subject: run.subject.clone(),
            created_at: Utc::now(),
            approved_action: None,
            conditions: gate_outcome.conditions(),
            outcome: None,
            reflection: None,
            context_hash,
        };
        match self.history.create(record).await {
            Ok(()) => out.history_recorded = true,
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "Rejection audit write failed");
                run.record_error(None, e.to_string());
            }
        }
    }

    /// Record the realized outcome of a completed run. Successful outcomes
    /// are indexed into the pattern store as precedent for future runs.
    pub async fn record_outcome(&self, run_id: Uuid, outcome: Outcome) -> Result<()> {
        self.history.update_outcome(run_id, outcome.clone()).await?;

        if outcome.class != OutcomeClass::Win {
            return Ok(());
        }
        let Some(record) = self.history.get(run_id).await? else {
            return Ok(());
        };
        let Some(proposal) = &record.approved_action else {
            return Ok(());
        };

        self.patterns
            .index(PatternEntry {
                pattern_id: Uuid::new_v4(),
                embedding: proposal_embedding(proposal),
                description: format!(
                    "{} {} {} sized {:.3}",
                    proposal.strategy, proposal.subject, direction_label(proposal.direction),
                    proposal.size
                ),
                metadata: json!({
                    "subject": proposal.subject,
                    "strategy": proposal.strategy,
                    "return_pct": outcome.return_pct,
                }),
                created_at: Utc::now(),
            })
            .await;
        Ok(())
    }
}

//
// ================= Typed boundaries =================
//

#[derive(Deserialize)]
struct ProposalPayload {
    direction: Direction,
    strategy: String,
    size: f64,
    expected_return_pct: f64,
    max_loss_pct: f64,
}

/// Either a fully-typed proposal comes out of the strategist's opinion, or
/// the synthesis counts as failed. No partially-valid proposal proceeds.
fn proposal_from_opinion(opinion: &Opinion) -> Result<Proposal> {
    let payload: ProposalPayload =
        serde_json::from_value(opinion.details.clone()).map_err(|e| {
            PipelineError::InvalidOpinion(format!("strategist payload: {}", e))
        })?;

    Ok(Proposal {
        subject: opinion.subject.clone(),
        direction: payload.direction,
        strategy: payload.strategy,
        size: payload.size,
        expected_return_pct: payload.expected_return_pct,
        max_loss_pct: payload.max_loss_pct,
        rationale: opinion.summary.clone(),
        confidence: opinion.confidence,
        created_at: opinion.created_at,
    })
}

fn reflection_from_opinion(opinion: &Opinion) -> Reflection {
    let list = |key: &str| -> Vec<String> {
        opinion
            .details
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    Reflection {
        summary: opinion.summary.clone(),
        what_worked: list("what_worked"),
        what_failed: list("what_failed"),
        lessons: list("lessons"),
        created_at: opinion.created_at,
    }
}

/// Feature vector for precedent similarity over approved proposals.
fn proposal_embedding(proposal: &Proposal) -> Vec<f64> {
    let direction = match proposal.direction {
        Direction::Long => 1.0,
        Direction::Short => -1.0,
        Direction::Neutral => 0.0,
    };
    vec![
        direction,
        proposal.size,
        proposal.expected_return_pct / 100.0,
        proposal.max_loss_pct / 100.0,
        proposal.confidence,
    ]
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "long",
        Direction::Short => "short",
        Direction::Neutral => "neutral",
    }
}
