//! Two-stage approval gate: risk veto, then authority decision
//!
//! The stages run strictly in sequence; the authority worker always sees the
//! risk verdict and only runs after an approval. The gate itself writes
//! nothing, so re-evaluating the same inputs is safe until execution
//! commits.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::config::RiskLimits;
use crate::models::{GateDecision, GateStage, Opinion, Proposal, WorkerRole};
use crate::worker::{ContextBundle, WorkerRegistry};

/// Result of driving the gate to completion.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub risk: GateDecision,
    /// Absent when the risk stage vetoed; it is never produced in that case.
    pub authority: Option<GateDecision>,
    /// Worker failures downgraded to rejections, for the run's error list.
    pub errors: Vec<String>,
}

impl GateOutcome {
    pub fn approved(&self) -> bool {
        self.risk.approved && self.authority.as_ref().is_some_and(|d| d.approved)
    }

    /// Binding conditions across both stages.
    pub fn conditions(&self) -> Vec<String> {
        let mut conditions = self.risk.conditions.clone();
        if let Some(authority) = &self.authority {
            conditions.extend(authority.conditions.clone());
        }
        conditions
    }

    /// The proposal execution should carry out: the authority's reduced
    /// scope, when present, overrides the original size.
    pub fn effective_proposal(&self, proposal: &Proposal) -> Proposal {
        match self.authority.as_ref().and_then(|d| d.reduced_size) {
            Some(size) => proposal.clone().with_size(size),
            None => proposal.clone(),
        }
    }
}

/// Sequential two-stage approval check.
pub struct Gate<'a> {
    registry: &'a WorkerRegistry,
    limits: &'a RiskLimits,
    worker_timeout: Duration,
}

impl<'a> Gate<'a> {
    pub fn new(registry: &'a WorkerRegistry, limits: &'a RiskLimits, worker_timeout: Duration) -> Self {
        Self {
            registry,
            limits,
            worker_timeout,
        }
    }

    /// Run stage 1 (risk) and, only on approval, stage 2 (authority).
    pub async fn evaluate(&self, proposal: &Proposal, base_context: &ContextBundle) -> GateOutcome {
        let mut errors = Vec::new();

        let mut risk_ctx = base_context.clone();
        risk_ctx.insert("proposal", serde_json::to_value(proposal).unwrap_or_default());
        risk_ctx.insert("risk_limits", serde_json::to_value(self.limits).unwrap_or_default());

        let risk = self
            .stage(GateStage::Risk, WorkerRole::RiskManager, proposal, &risk_ctx, &mut errors)
            .await;

        if !risk.approved {
            info!(subject = %proposal.subject, rationale = %risk.rationale, "Risk stage vetoed");
            return GateOutcome {
                risk,
                authority: None,
                errors,
            };
        }

        let mut authority_ctx = risk_ctx;
        authority_ctx.insert("risk_decision", serde_json::to_value(&risk).unwrap_or_default());

        let authority = self
            .stage(
                GateStage::Authority,
                WorkerRole::PortfolioManager,
                proposal,
                &authority_ctx,
                &mut errors,
            )
            .await;

        info!(
            subject = %proposal.subject,
            approved = authority.approved,
            reduced_size = ?authority.reduced_size,
            "Authority stage decided"
        );

        GateOutcome {
            risk,
            authority: Some(authority),
            errors,
        }
    }

    /// One stage is a single worker call. A failed or malformed call is
    /// downgraded to a rejection, never a silent approval.
    async fn stage(
        &self,
        stage: GateStage,
        role: WorkerRole,
        proposal: &Proposal,
        ctx: &ContextBundle,
        errors: &mut Vec<String>,
    ) -> GateDecision {
        match self
            .registry
            .call_with_timeout(role, &proposal.subject, ctx, self.worker_timeout)
            .await
        {
            Ok(opinion) => match decision_from_opinion(stage, &opinion) {
                Ok(decision) => decision,
                Err(reason) => {
                    warn!(stage = %stage, %reason, "Malformed gate opinion, rejecting");
                    errors.push(format!("{} gate: {}", stage, reason));
                    rejection(stage, reason)
                }
            },
            Err(e) => {
                warn!(stage = %stage, error = %e, "Gate worker failed, rejecting");
                errors.push(format!("{} gate: {}", stage, e));
                rejection(stage, format!("gate worker unavailable: {}", e))
            }
        }
    }
}

/// Typed boundary for a gate worker's answer. The `approved` field is
/// mandatory; everything else is optional.
fn decision_from_opinion(stage: GateStage, opinion: &Opinion) -> Result<GateDecision, String> {
    let approved = opinion
        .details
        .get("approved")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| "missing boolean 'approved' field".to_string())?;

    let conditions = opinion
        .details
        .get("conditions")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let reduced_size = match stage {
        // Scope reduction is an authority-stage prerogative.
        GateStage::Authority => opinion.details.get("reduced_size").and_then(|v| v.as_f64()),
        GateStage::Risk => None,
    };

    Ok(GateDecision {
        stage,
        approved,
        rationale: opinion.summary.clone(),
        conditions,
        reduced_size,
        decided_at: opinion.created_at,
    })
}

fn rejection(stage: GateStage, rationale: String) -> GateDecision {
    GateDecision {
        stage,
        approved: false,
        rationale,
        conditions: Vec::new(),
        reduced_size: None,
        decided_at: Utc::now(),
    }
}

/// Build the opinion payload a gate worker is expected to return. Shared by
/// tests and the demo binary's scripted workers.
pub fn gate_opinion(
    role: WorkerRole,
    subject: &str,
    approved: bool,
    rationale: &str,
    conditions: &[&str],
    reduced_size: Option<f64>,
) -> Opinion {
    let mut details = json!({
        "approved": approved,
        "conditions": conditions,
    });
    if let Some(size) = reduced_size {
        details["reduced_size"] = json!(size);
    }
    Opinion::new(role, subject, if approved { 0.9 } else { 0.95 })
        .with_summary(rationale)
        .with_details(details)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use crate::worker::ScriptedWorker;
    use std::sync::Arc;

    fn proposal() -> Proposal {
        Proposal {
            subject: "AAPL".to_string(),
            direction: Direction::Long,
            strategy: "bull_call_spread".to_string(),
            size: 0.05,
            expected_return_pct: 12.0,
            max_loss_pct: 5.0,
            rationale: "debate favored the long case".to_string(),
            confidence: 0.7,
            created_at: Utc::now(),
        }
    }

    fn registry(risk: Arc<ScriptedWorker>, authority: Arc<ScriptedWorker>) -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        registry.register(WorkerRole::RiskManager, risk);
        registry.register(WorkerRole::PortfolioManager, authority);
        registry
    }

    #[tokio::test]
    async fn test_risk_rejection_short_circuits_authority() {
        let risk = Arc::new(ScriptedWorker::always(gate_opinion(
            WorkerRole::RiskManager,
            "AAPL",
            false,
            "position exceeds VaR limit",
            &[],
            None,
        )));
        let authority = Arc::new(ScriptedWorker::always(gate_opinion(
            WorkerRole::PortfolioManager,
            "AAPL",
            true,
            "should never run",
            &[],
            None,
        )));
        let registry = registry(risk, authority.clone());
        let limits = RiskLimits::default();
        let gate = Gate::new(&registry, &limits, Duration::from_secs(5));

        let outcome = gate.evaluate(&proposal(), &ContextBundle::new()).await;

        assert!(!outcome.risk.approved);
        assert!(outcome.authority.is_none());
        assert!(!outcome.approved());
        // The authority worker was never invoked.
        assert_eq!(authority.call_count(), 0);
    }

    #[tokio::test]
    async fn test_authority_reduced_size_overrides_proposal() {
        let risk = Arc::new(ScriptedWorker::always(gate_opinion(
            WorkerRole::RiskManager,
            "AAPL",
            true,
            "within limits",
            &["stop loss at -5%"],
            None,
        )));
        let authority = Arc::new(ScriptedWorker::always(gate_opinion(
            WorkerRole::PortfolioManager,
            "AAPL",
            true,
            "approved at reduced size",
            &["review after earnings"],
            Some(0.02),
        )));
        let registry = registry(risk, authority);
        let limits = RiskLimits::default();
        let gate = Gate::new(&registry, &limits, Duration::from_secs(5));

        let original = proposal();
        let outcome = gate.evaluate(&original, &ContextBundle::new()).await;

        assert!(outcome.approved());
        let effective = outcome.effective_proposal(&original);
        assert_eq!(effective.size, 0.02);
        assert_eq!(original.size, 0.05);
        assert_eq!(
            outcome.conditions(),
            vec!["stop loss at -5%".to_string(), "review after earnings".to_string()]
        );
    }

    #[tokio::test]
    async fn test_gate_worker_failure_rejects_conservatively() {
        let risk = Arc::new(ScriptedWorker::new(vec![]));
        let authority = Arc::new(ScriptedWorker::always(gate_opinion(
            WorkerRole::PortfolioManager,
            "AAPL",
            true,
            "unreachable",
            &[],
            None,
        )));
        let registry = registry(risk, authority.clone());
        let limits = RiskLimits::default();
        let gate = Gate::new(&registry, &limits, Duration::from_secs(5));

        let outcome = gate.evaluate(&proposal(), &ContextBundle::new()).await;

        assert!(!outcome.risk.approved);
        assert!(outcome.authority.is_none());
        assert!(!outcome.errors.is_empty());
        assert_eq!(authority.call_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_gate_opinion_rejects() {
        // An opinion without the mandatory 'approved' field never passes.
        let risk = Arc::new(ScriptedWorker::always(
            Opinion::new(WorkerRole::RiskManager, "AAPL", 0.9).with_summary("looks fine"),
        ));
        let authority = Arc::new(ScriptedWorker::always(gate_opinion(
            WorkerRole::PortfolioManager,
            "AAPL",
            true,
            "unreachable",
            &[],
            None,
        )));
        let registry = registry(risk, authority.clone());
        let limits = RiskLimits::default();
        let gate = Gate::new(&registry, &limits, Duration::from_secs(5));

        let outcome = gate.evaluate(&proposal(), &ContextBundle::new()).await;
        assert!(!outcome.risk.approved);
        assert_eq!(authority.call_count(), 0);
    }

    #[tokio::test]
    async fn test_gate_is_idempotent_on_same_inputs() {
        let risk = Arc::new(ScriptedWorker::always(gate_opinion(
            WorkerRole::RiskManager,
            "AAPL",
            true,
            "within limits",
            &[],
            None,
        )));
        let authority = Arc::new(ScriptedWorker::always(gate_opinion(
            WorkerRole::PortfolioManager,
            "AAPL",
            true,
            "approved",
            &[],
            Some(0.03),
        )));
        let registry = registry(risk, authority);
        let limits = RiskLimits::default();
        let gate = Gate::new(&registry, &limits, Duration::from_secs(5));

        let p = proposal();
        let ctx = ContextBundle::new();
        let first = gate.evaluate(&p, &ctx).await;
        let second = gate.evaluate(&p, &ctx).await;

        assert_eq!(first.approved(), second.approved());
        assert_eq!(
            first.effective_proposal(&p).size,
            second.effective_proposal(&p).size
        );
    }
}
