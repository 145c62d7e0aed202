//! Trading Decision Pipeline
//!
//! A multi-stage decision engine that:
//! - Fans out parallel analyst workers over a subject
//! - Runs a bounded adversarial debate between bull and bear researchers
//! - Synthesizes the debate into a single actionable proposal
//! - Gates the proposal through a risk veto and an authority decision
//! - Executes approved actions and records outcomes for later reflection
//!
//! PHASE SEQUENCE:
//! FANOUT → DEBATE → SYNTHESIS → RISK GATE → AUTHORITY GATE → EXECUTION →
//! REFLECTION → DONE

pub mod config;
pub mod debate;
pub mod error;
pub mod gate;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod worker;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use pipeline::{Orchestrator, Phase, RunReport};
