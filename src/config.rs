//! Pipeline configuration
//!
//! All knobs are passed explicitly into the orchestrator per run; nothing
//! here is process-global, so tests can vary limits freely.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::WorkerRole;

/// Configuration for the adversarial debate loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateConfig {
    /// Hard ceiling on rounds per side; never exceeded.
    pub max_rounds: u32,
    /// Converged when both sides' aggregate-confidence deltas between
    /// consecutive rounds fall below this. None disables early exit.
    pub convergence_delta: Option<f64>,
    /// Aggregate confidences within this of each other are a tie, and the
    /// verdict is inconclusive rather than a default win.
    pub tie_tolerance: f64,
    /// Retries per side per round before the debate is marked incomplete.
    pub side_retries: u32,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            convergence_delta: None,
            tie_tolerance: 0.05,
            side_retries: 1,
        }
    }
}

/// Static limits the risk stage evaluates a proposal against.
///
/// The core does not interpret these; they ride into the risk worker's
/// context bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Maximum position size as a fraction of portfolio value.
    pub max_position_pct: f64,
    /// Maximum aggregate portfolio risk (VaR threshold).
    pub max_portfolio_risk: f64,
    /// Maximum concentration in any one sector.
    pub max_concentration: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_pct: 0.05,
            max_portfolio_risk: 0.02,
            max_concentration: 0.25,
        }
    }
}

/// Top-level configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Roles whose opinion must arrive or the run fails.
    pub required_roles: Vec<WorkerRole>,
    /// Roles whose failure merely omits their opinion.
    pub best_effort_roles: Vec<WorkerRole>,
    pub debate: DebateConfig,
    pub risk_limits: RiskLimits,
    /// Per worker call.
    pub worker_timeout: Duration,
    /// Whole-run ceiling; exceeding it fails the run regardless of phase.
    pub run_deadline: Duration,
    /// Default TTL for working-store entries.
    pub working_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            required_roles: vec![
                WorkerRole::FundamentalsAnalyst,
                WorkerRole::TechnicalAnalyst,
                WorkerRole::SentimentAnalyst,
            ],
            best_effort_roles: vec![WorkerRole::MacroNewsAnalyst],
            debate: DebateConfig::default(),
            risk_limits: RiskLimits::default(),
            worker_timeout: Duration::from_secs(30),
            run_deadline: Duration::from_secs(300),
            working_ttl: Duration::from_secs(3600),
        }
    }
}

impl PipelineConfig {
    /// All fan-out roles, required first.
    pub fn fanout_roles(&self) -> impl Iterator<Item = (WorkerRole, bool)> + '_ {
        self.required_roles
            .iter()
            .map(|r| (*r, true))
            .chain(self.best_effort_roles.iter().map(|r| (*r, false)))
    }
}
