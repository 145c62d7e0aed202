use std::sync::Arc;

use trading_decision_pipeline::{
    config::PipelineConfig,
    gate::gate_opinion,
    memory::{performance_stats, JsonlHistoryStore, PatternStore},
    models::{Opinion, Outcome, OutcomeClass, WorkerRole},
    pipeline::Orchestrator,
    worker::{RemoteWorker, ScriptedWorker, Worker, WorkerRegistry},
};

use chrono::Utc;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Workers come from the remote reasoning service when
/// WORKER_SERVICE_URL is set; otherwise a scripted demo set is used.
fn build_registry(subject: &str) -> trading_decision_pipeline::Result<WorkerRegistry> {
    let mut registry = WorkerRegistry::new();

    if let Ok(base_url) = std::env::var("WORKER_SERVICE_URL") {
        let api_key = std::env::var("WORKER_SERVICE_API_KEY").unwrap_or_default();
        let remote: Arc<dyn Worker> = Arc::new(RemoteWorker::new(base_url, api_key)?);
        for role in [
            WorkerRole::FundamentalsAnalyst,
            WorkerRole::TechnicalAnalyst,
            WorkerRole::SentimentAnalyst,
            WorkerRole::MacroNewsAnalyst,
            WorkerRole::BullResearcher,
            WorkerRole::BearResearcher,
            WorkerRole::Strategist,
            WorkerRole::RiskManager,
            WorkerRole::PortfolioManager,
            WorkerRole::Trader,
            WorkerRole::ReflectiveAgent,
        ] {
            registry.register(role, remote.clone());
        }
        return Ok(registry);
    }

    let analyst = |role: WorkerRole, confidence: f64, summary: &str| {
        Arc::new(ScriptedWorker::always(
            Opinion::new(role, subject, confidence).with_summary(summary),
        ))
    };

    registry.register(
        WorkerRole::FundamentalsAnalyst,
        analyst(WorkerRole::FundamentalsAnalyst, 0.8, "earnings growth intact"),
    );
    registry.register(
        WorkerRole::TechnicalAnalyst,
        analyst(WorkerRole::TechnicalAnalyst, 0.6, "trend above 50-day average"),
    );
    registry.register(
        WorkerRole::SentimentAnalyst,
        analyst(WorkerRole::SentimentAnalyst, 0.7, "coverage skews positive"),
    );
    registry.register(
        WorkerRole::MacroNewsAnalyst,
        analyst(WorkerRole::MacroNewsAnalyst, 0.5, "rate path uncertain"),
    );
    registry.register(
        WorkerRole::BullResearcher,
        analyst(WorkerRole::BullResearcher, 0.75, "valuation supports upside"),
    );
    registry.register(
        WorkerRole::BearResearcher,
        analyst(WorkerRole::BearResearcher, 0.45, "margin pressure underpriced"),
    );

    registry.register(
        WorkerRole::Strategist,
        Arc::new(ScriptedWorker::always(
            Opinion::new(WorkerRole::Strategist, subject, 0.72)
                .with_summary("debate favored the long case; defined-risk spread")
                .with_details(json!({
                    "direction": "long",
                    "strategy": "bull_call_spread",
                    "size": 0.05,
                    "expected_return_pct": 12.0,
                    "max_loss_pct": 5.0,
                })),
        )),
    );

    registry.register(
        WorkerRole::RiskManager,
        Arc::new(ScriptedWorker::always(gate_opinion(
            WorkerRole::RiskManager,
            subject,
            true,
            "within position and VaR limits",
            &["stop loss at -5%"],
            None,
        ))),
    );
    registry.register(
        WorkerRole::PortfolioManager,
        Arc::new(ScriptedWorker::always(gate_opinion(
            WorkerRole::PortfolioManager,
            subject,
            true,
            "approved at reduced size given sector exposure",
            &["review after earnings"],
            Some(0.02),
        ))),
    );

    registry.register(
        WorkerRole::Trader,
        Arc::new(ScriptedWorker::always(
            Opinion::new(WorkerRole::Trader, subject, 0.9)
                .with_summary("orders placed")
                .with_details(json!({ "orders": 2, "fill": "complete" })),
        )),
    );
    registry.register(
        WorkerRole::ReflectiveAgent,
        Arc::new(ScriptedWorker::always(
            Opinion::new(WorkerRole::ReflectiveAgent, subject, 0.7)
                .with_summary("debate surfaced the key risk early")
                .with_details(json!({
                    "what_worked": ["adversarial review of the bull case"],
                    "lessons": ["size down when macro signal is weak"],
                })),
        )),
    );

    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Trading decision pipeline starting");

    let subject = std::env::args().nth(1).unwrap_or_else(|| "AAPL".to_string());
    let history_path =
        std::env::var("HISTORY_PATH").unwrap_or_else(|_| "history.jsonl".to_string());

    let registry = build_registry(&subject)?;
    let config = PipelineConfig::default();
    let history = Arc::new(JsonlHistoryStore::open(&history_path).await?);
    let patterns = Arc::new(PatternStore::new());

    let orchestrator = Orchestrator::new(registry, config, history.clone(), patterns);

    info!(%subject, "Running pipeline");
    let report = orchestrator.run(&subject).await;

    println!("\n=== RUN REPORT ===");
    println!("Run ID:   {}", report.run_id);
    println!("Subject:  {}", report.subject);
    println!("Phase:    {}", report.phase);
    if let Some(verdict) = &report.verdict {
        println!("Verdict:  {}", verdict);
    }
    if let Some(proposal) = &report.proposal {
        println!(
            "Proposal: {} {} at size {:.3} (confidence {:.2})",
            proposal.strategy, proposal.subject, proposal.size, proposal.confidence
        );
    }
    if let Some(executed) = &report.executed {
        println!("Executed: size {:.3}", executed.size);
    }
    for condition in &report.conditions {
        println!("Condition: {}", condition);
    }
    if let Some(failure) = &report.failure {
        println!("Failure:  {}", failure);
    }
    for error in &report.errors {
        println!("Error [{}]: {}", error.phase, error.message);
    }

    // Close out the position with a demo outcome so the record is complete.
    if report.executed.is_some() {
        orchestrator
            .record_outcome(
                report.run_id,
                Outcome {
                    realized_pnl: 250.0,
                    return_pct: 3.1,
                    class: OutcomeClass::Win,
                    closed_at: Utc::now(),
                },
            )
            .await?;
    }

    let stats = performance_stats(history.as_ref()).await?;
    println!("\n=== HISTORY ===");
    println!("Records:  {} ({} closed)", stats.total_records, stats.closed_records);
    println!("Win rate: {:.0}%", stats.win_rate * 100.0);
    println!("Total PnL: {:.2}", stats.total_pnl);

    Ok(())
}
