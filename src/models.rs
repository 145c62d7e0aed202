//! Core data models for the decision pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

/// Roles a worker can hold in the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    FundamentalsAnalyst,
    TechnicalAnalyst,
    SentimentAnalyst,
    MacroNewsAnalyst,
    BullResearcher,
    BearResearcher,
    Strategist,
    RiskManager,
    PortfolioManager,
    Trader,
    ReflectiveAgent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

/// Side of the adversarial debate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DebateSide {
    For,
    Against,
}

impl DebateSide {
    pub fn opponent(self) -> Self {
        match self {
            DebateSide::For => DebateSide::Against,
            DebateSide::Against => DebateSide::For,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GateStage {
    Risk,
    Authority,
}

/// Classification of a realized outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeClass {
    Win,
    Loss,
    Breakeven,
}

//
// ================= Opinion =================
//

/// Immutable structured output of one worker call.
///
/// Constructed only at the worker-call validation boundary; never mutated
/// after that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opinion {
    pub opinion_id: Uuid,
    pub role: WorkerRole,
    pub subject: String,
    /// Bounded confidence in [0, 1].
    pub confidence: f64,
    pub summary: String,
    /// Worker-specific typed payload (indicator values, key events, ...).
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Opinion {
    pub fn new(role: WorkerRole, subject: impl Into<String>, confidence: f64) -> Self {
        Self {
            opinion_id: Uuid::new_v4(),
            role,
            subject: subject.into(),
            confidence,
            summary: String::new(),
            details: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

//
// ================= Debate =================
//

/// One contribution to the debate loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Argument {
    pub side: DebateSide,
    /// Round numbers per side are contiguous starting at 1.
    pub round: u32,
    pub claim: String,
    /// References to supporting opinions, by id (no copies).
    pub evidence: Vec<Uuid>,
    /// Opposing-side rounds this argument rebuts; always strictly earlier
    /// rounds, so the transcript stays acyclic.
    pub rebuts: Vec<u32>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

//
// ================= Gate =================
//

/// The outcome of one stage of the approval gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub stage: GateStage,
    pub approved: bool,
    pub rationale: String,
    /// Binding conditions attached to an approval.
    pub conditions: Vec<String>,
    /// Authority stage only: approve with a smaller size than proposed.
    pub reduced_size: Option<f64>,
    pub decided_at: DateTime<Utc>,
}

//
// ================= Proposal =================
//

/// The synthesized action the gate evaluates and execution carries out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub subject: String,
    pub direction: Direction,
    pub strategy: String,
    /// Position size as a fraction of portfolio value.
    pub size: f64,
    pub expected_return_pct: f64,
    pub max_loss_pct: f64,
    pub rationale: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl Proposal {
    /// Apply a gate-reduced scope; overrides the originally proposed size.
    pub fn with_size(mut self, size: f64) -> Self {
        self.size = size;
        self
    }
}

//
// ================= Outcome & Reflection =================
//

/// Realized result of an executed action, recorded after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub realized_pnl: f64,
    pub return_pct: f64,
    pub class: OutcomeClass,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub summary: String,
    pub what_worked: Vec<String>,
    pub what_failed: Vec<String>,
    pub lessons: Vec<String>,
    pub created_at: DateTime<Utc>,
}

//
// ================= History =================
//

/// Durable record of a completed run.
///
/// Created at gate time; `outcome` and `reflection` are each filled in
/// exactly once by later updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub run_id: Uuid,
    pub subject: String,
    pub created_at: DateTime<Utc>,
    /// None when the run was rejected at a gate.
    pub approved_action: Option<Proposal>,
    pub conditions: Vec<String>,
    pub outcome: Option<Outcome>,
    pub reflection: Option<Reflection>,
    /// SHA-256 of the context bundle the gates saw, for audit integrity.
    pub context_hash: String,
}

//
// ================= Pattern =================
//

/// An indexed precedent in the pattern store. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternEntry {
    pub pattern_id: Uuid,
    pub embedding: Vec<f64>,
    pub description: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

//
// ================= Display =================
//

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerRole::FundamentalsAnalyst => "fundamentals_analyst",
            WorkerRole::TechnicalAnalyst => "technical_analyst",
            WorkerRole::SentimentAnalyst => "sentiment_analyst",
            WorkerRole::MacroNewsAnalyst => "macro_news_analyst",
            WorkerRole::BullResearcher => "bull_researcher",
            WorkerRole::BearResearcher => "bear_researcher",
            WorkerRole::Strategist => "strategist",
            WorkerRole::RiskManager => "risk_manager",
            WorkerRole::PortfolioManager => "portfolio_manager",
            WorkerRole::Trader => "trader",
            WorkerRole::ReflectiveAgent => "reflective_agent",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for DebateSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebateSide::For => write!(f, "for"),
            DebateSide::Against => write!(f, "against"),
        }
    }
}

impl fmt::Display for GateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateStage::Risk => write!(f, "risk"),
            GateStage::Authority => write!(f, "authority"),
        }
    }
}
