//! Bounded adversarial debate between two opposing workers
//!
//! Each round both sides argue concurrently, seeing their own prior
//! arguments plus the opponent's latest. The round ceiling is hard; a tie
//! in aggregate confidence is an inconclusive verdict, not a default win.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::DebateConfig;
use crate::models::{Argument, DebateSide, Opinion, WorkerRole};
use crate::worker::{ContextBundle, WorkerRegistry};

/// Directional result of a concluded debate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    For,
    Against,
    /// Aggregate confidences within the tie tolerance. Callers must treat
    /// this as its own case, never as a win for either side.
    Inconclusive,
}

/// Full result of one debate.
#[derive(Debug, Clone)]
pub struct DebateOutcome {
    /// Arguments in the order they were produced.
    pub transcript: Vec<Argument>,
    pub rounds_for: u32,
    pub rounds_against: u32,
    pub verdict: Verdict,
    /// Set when a side gave up mid-debate; synthesis must treat the
    /// transcript conservatively.
    pub incomplete: bool,
    pub errors: Vec<String>,
}

impl DebateOutcome {
    fn aggregate(&self, side: DebateSide) -> Option<f64> {
        let confidences: Vec<f64> = self
            .transcript
            .iter()
            .filter(|a| a.side == side)
            .map(|a| a.confidence)
            .collect();
        if confidences.is_empty() {
            return None;
        }
        Some(confidences.iter().sum::<f64>() / confidences.len() as f64)
    }
}

/// Runs the bounded debate loop.
pub struct DebateLoop<'a> {
    registry: &'a WorkerRegistry,
    config: &'a DebateConfig,
    worker_timeout: Duration,
    for_role: WorkerRole,
    against_role: WorkerRole,
}

impl<'a> DebateLoop<'a> {
    pub fn new(
        registry: &'a WorkerRegistry,
        config: &'a DebateConfig,
        worker_timeout: Duration,
        for_role: WorkerRole,
        against_role: WorkerRole,
    ) -> Self {
        Self {
            registry,
            config,
            worker_timeout,
            for_role,
            against_role,
        }
    }

    fn role_for(&self, side: DebateSide) -> WorkerRole {
        match side {
            DebateSide::For => self.for_role,
            DebateSide::Against => self.against_role,
        }
    }

    /// Context a side sees for one round: the shared bundle, its own prior
    /// arguments, and the opponent's most recent argument.
    fn side_context(
        &self,
        base: &ContextBundle,
        transcript: &[Argument],
        side: DebateSide,
        round: u32,
    ) -> ContextBundle {
        let mut ctx = base.clone();
        let own: Vec<&Argument> = transcript.iter().filter(|a| a.side == side).collect();
        let opponent_latest = transcript
            .iter()
            .rev()
            .find(|a| a.side == side.opponent());

        ctx.insert("debate_round", json!(round));
        ctx.insert("debate_side", json!(side.to_string()));
        ctx.insert("own_arguments", serde_json::to_value(&own).unwrap_or_default());
        ctx.insert(
            "opponent_latest",
            serde_json::to_value(opponent_latest).unwrap_or_default(),
        );
        ctx
    }

    /// One side's contribution for one round, with bounded retries. The
    /// round counter only advances on success.
    async fn argue(
        &self,
        subject: &str,
        ctx: &ContextBundle,
        side: DebateSide,
        round: u32,
        errors: &mut Vec<String>,
    ) -> Option<Argument> {
        let role = self.role_for(side);
        let mut attempts = 0;

        loop {
            match self
                .registry
                .call_with_timeout(role, subject, ctx, self.worker_timeout)
                .await
            {
                Ok(opinion) => return Some(self.to_argument(opinion, side, round)),
                Err(e) => {
                    attempts += 1;
                    errors.push(format!("{} round {}: {}", side, round, e));
                    if attempts > self.config.side_retries {
                        warn!(side = %side, round, "Side gave up after retries");
                        return None;
                    }
                    debug!(side = %side, round, attempt = attempts, "Retrying side call");
                }
            }
        }
    }

    /// The loop constructs rebuttal references itself, so an argument can
    /// only point at strictly earlier opposing rounds.
    fn to_argument(&self, opinion: Opinion, side: DebateSide, round: u32) -> Argument {
        let evidence = opinion
            .details
            .get("evidence")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| s.parse().ok())
                    .collect()
            })
            .unwrap_or_default();

        Argument {
            side,
            round,
            claim: opinion.summary,
            evidence,
            rebuts: if round > 1 { vec![round - 1] } else { Vec::new() },
            confidence: opinion.confidence,
            created_at: opinion.created_at,
        }
    }

    /// Run the debate to termination: convergence, a side giving up, or the
    /// round ceiling. The ceiling is never exceeded.
    pub async fn run(&self, subject: &str, base_context: &ContextBundle) -> DebateOutcome {
        let mut outcome = DebateOutcome {
            transcript: Vec::new(),
            rounds_for: 0,
            rounds_against: 0,
            verdict: Verdict::Inconclusive,
            incomplete: false,
            errors: Vec::new(),
        };
        let mut prev_aggregates: Option<(f64, f64)> = None;

        info!(subject, max_rounds = self.config.max_rounds, "Debate starting");

        for round in 1..=self.config.max_rounds {
            let for_ctx = self.side_context(base_context, &outcome.transcript, DebateSide::For, round);
            let against_ctx =
                self.side_context(base_context, &outcome.transcript, DebateSide::Against, round);

            let mut for_errors = Vec::new();
            let mut against_errors = Vec::new();

            let (for_arg, against_arg) = tokio::join!(
                self.argue(subject, &for_ctx, DebateSide::For, round, &mut for_errors),
                self.argue(subject, &against_ctx, DebateSide::Against, round, &mut against_errors),
            );

            outcome.errors.extend(for_errors);
            outcome.errors.extend(against_errors);

            if let Some(arg) = for_arg {
                outcome.transcript.push(arg);
                outcome.rounds_for = round;
            }
            if let Some(arg) = against_arg {
                outcome.transcript.push(arg);
                outcome.rounds_against = round;
            }

            // A side that exhausted its retries terminates the debate early
            // with whatever transcript exists.
            if outcome.rounds_for < round || outcome.rounds_against < round {
                outcome.incomplete = true;
                warn!(round, "Debate terminated early, transcript incomplete");
                break;
            }

            let for_agg = outcome.aggregate(DebateSide::For).unwrap_or(0.0);
            let against_agg = outcome.aggregate(DebateSide::Against).unwrap_or(0.0);
            debug!(round, for_agg, against_agg, "Round complete");

            if let (Some(delta), Some((prev_for, prev_against))) =
                (self.config.convergence_delta, prev_aggregates)
            {
                if (for_agg - prev_for).abs() < delta && (against_agg - prev_against).abs() < delta {
                    info!(round, "Debate converged");
                    break;
                }
            }
            prev_aggregates = Some((for_agg, against_agg));
        }

        outcome.verdict = self.verdict(&outcome);
        info!(
            subject,
            rounds_for = outcome.rounds_for,
            rounds_against = outcome.rounds_against,
            incomplete = outcome.incomplete,
            verdict = ?outcome.verdict,
            "Debate concluded"
        );
        outcome
    }

    fn verdict(&self, outcome: &DebateOutcome) -> Verdict {
        let (for_agg, against_agg) =
            match (outcome.aggregate(DebateSide::For), outcome.aggregate(DebateSide::Against)) {
                (Some(f), Some(a)) => (f, a),
                // A side with no arguments at all cannot be judged against.
                _ => return Verdict::Inconclusive,
            };

        if (for_agg - against_agg).abs() <= self.config.tie_tolerance {
            Verdict::Inconclusive
        } else if for_agg > against_agg {
            Verdict::For
        } else {
            Verdict::Against
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::worker::ScriptedWorker;
    use std::sync::Arc;

    const SUBJECT: &str = "AAPL";

    fn opinion(role: WorkerRole, confidence: f64) -> Opinion {
        Opinion::new(role, SUBJECT, confidence).with_summary("case")
    }

    fn failure(role: WorkerRole) -> crate::Result<Opinion> {
        Err(PipelineError::WorkerFailure {
            role,
            reason: "remote error".to_string(),
        })
    }

    fn registry(bull: Arc<ScriptedWorker>, bear: Arc<ScriptedWorker>) -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        registry.register(WorkerRole::BullResearcher, bull);
        registry.register(WorkerRole::BearResearcher, bear);
        registry
    }

    fn debate_loop<'a>(registry: &'a WorkerRegistry, config: &'a DebateConfig) -> DebateLoop<'a> {
        DebateLoop::new(
            registry,
            config,
            Duration::from_secs(5),
            WorkerRole::BullResearcher,
            WorkerRole::BearResearcher,
        )
    }

    #[tokio::test]
    async fn test_runs_exactly_max_rounds_without_convergence() {
        let bull = Arc::new(ScriptedWorker::always(opinion(WorkerRole::BullResearcher, 0.8)));
        let bear = Arc::new(ScriptedWorker::always(opinion(WorkerRole::BearResearcher, 0.4)));
        let registry = registry(bull.clone(), bear.clone());
        let config = DebateConfig::default();

        let outcome = debate_loop(&registry, &config)
            .run(SUBJECT, &ContextBundle::new())
            .await;

        assert_eq!(outcome.rounds_for, 3);
        assert_eq!(outcome.rounds_against, 3);
        assert_eq!(outcome.transcript.len(), 6);
        assert_eq!(bull.call_count(), 3);
        assert_eq!(bear.call_count(), 3);
        assert!(!outcome.incomplete);
        assert_eq!(outcome.verdict, Verdict::For);
    }

    #[tokio::test]
    async fn test_round_numbers_contiguous_per_side() {
        let bull = Arc::new(ScriptedWorker::always(opinion(WorkerRole::BullResearcher, 0.7)));
        let bear = Arc::new(ScriptedWorker::always(opinion(WorkerRole::BearResearcher, 0.6)));
        let registry = registry(bull, bear);
        let config = DebateConfig::default();

        let outcome = debate_loop(&registry, &config)
            .run(SUBJECT, &ContextBundle::new())
            .await;

        for side in [DebateSide::For, DebateSide::Against] {
            let rounds: Vec<u32> = outcome
                .transcript
                .iter()
                .filter(|a| a.side == side)
                .map(|a| a.round)
                .collect();
            let expected: Vec<u32> = (1..=rounds.len() as u32).collect();
            assert_eq!(rounds, expected);
        }

        // Rebuttals only point at strictly earlier rounds.
        for arg in &outcome.transcript {
            for rebutted in &arg.rebuts {
                assert!(*rebutted < arg.round);
            }
        }
    }

    #[tokio::test]
    async fn test_tie_is_inconclusive_not_default_win() {
        let bull = Arc::new(ScriptedWorker::always(opinion(WorkerRole::BullResearcher, 0.62)));
        let bear = Arc::new(ScriptedWorker::always(opinion(WorkerRole::BearResearcher, 0.60)));
        let registry = registry(bull, bear);
        let config = DebateConfig {
            tie_tolerance: 0.05,
            ..Default::default()
        };

        let outcome = debate_loop(&registry, &config)
            .run(SUBJECT, &ContextBundle::new())
            .await;

        assert_eq!(outcome.verdict, Verdict::Inconclusive);
    }

    #[tokio::test]
    async fn test_side_failure_retries_then_terminates_incomplete() {
        // Bear fails round 1 twice (initial + one retry), so the debate
        // terminates early with only the bull's argument.
        let bull = Arc::new(ScriptedWorker::always(opinion(WorkerRole::BullResearcher, 0.8)));
        let bear = Arc::new(ScriptedWorker::new(vec![
            failure(WorkerRole::BearResearcher),
            failure(WorkerRole::BearResearcher),
        ]));
        let registry = registry(bull.clone(), bear.clone());
        let config = DebateConfig {
            side_retries: 1,
            ..Default::default()
        };

        let outcome = debate_loop(&registry, &config)
            .run(SUBJECT, &ContextBundle::new())
            .await;

        assert!(outcome.incomplete);
        assert_eq!(outcome.rounds_for, 1);
        assert_eq!(outcome.rounds_against, 0);
        assert_eq!(bear.call_count(), 2);
        assert_eq!(outcome.verdict, Verdict::Inconclusive);
        assert!(!outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn test_retry_within_round_recovers() {
        // Bear fails once in round 1, succeeds on retry; debate completes.
        let mut script = vec![failure(WorkerRole::BearResearcher)];
        for _ in 0..3 {
            script.push(Ok(opinion(WorkerRole::BearResearcher, 0.3)));
        }
        let bull = Arc::new(ScriptedWorker::always(opinion(WorkerRole::BullResearcher, 0.9)));
        let bear = Arc::new(ScriptedWorker::new(script));
        let registry = registry(bull, bear);
        let config = DebateConfig::default();

        let outcome = debate_loop(&registry, &config)
            .run(SUBJECT, &ContextBundle::new())
            .await;

        assert!(!outcome.incomplete);
        assert_eq!(outcome.rounds_against, 3);
        assert_eq!(outcome.verdict, Verdict::For);
    }

    #[tokio::test]
    async fn test_convergence_exits_before_ceiling() {
        let bull = Arc::new(ScriptedWorker::always(opinion(WorkerRole::BullResearcher, 0.8)));
        let bear = Arc::new(ScriptedWorker::always(opinion(WorkerRole::BearResearcher, 0.4)));
        let registry = registry(bull.clone(), bear.clone());
        let config = DebateConfig {
            max_rounds: 5,
            convergence_delta: Some(0.01),
            ..Default::default()
        };

        let outcome = debate_loop(&registry, &config)
            .run(SUBJECT, &ContextBundle::new())
            .await;

        // Constant confidences converge at round 2.
        assert_eq!(outcome.rounds_for, 2);
        assert!(outcome.rounds_for < config.max_rounds);
        assert!(!outcome.incomplete);
    }
}
