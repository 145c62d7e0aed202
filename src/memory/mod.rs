//! Three-tier memory subsystem
//!
//! - `working`: per-run TTL cache for intermediate phase outputs
//! - `history`: durable record of completed runs and their outcomes
//! - `pattern`: advisory similarity store of past successful configurations

pub mod history;
pub mod pattern;
pub mod working;

pub use history::{
    performance_stats, HistoryFilter, HistoryStore, InMemoryHistoryStore, JsonlHistoryStore,
    PerformanceStats,
};
pub use pattern::PatternStore;
pub use working::WorkingStore;
