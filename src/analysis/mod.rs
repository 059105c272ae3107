//! Session analysis module
//!
//! Runs synchronously over a finalized session's event log.
//!
//! Pipeline: Events → Stats → Metrics → Scoring → Recommendations + Progression → Report

pub mod adaptive;
pub mod metrics;
pub mod progression;
pub mod recommendation;
pub mod report;
pub mod scoring;
pub mod stats;

pub use adaptive::decide_difficulty;
pub use metrics::SessionMetrics;
pub use progression::{classify_trend, ProgressionTracker};
pub use recommendation::{rank_recommendations, DEFAULT_TOP_N};
pub use report::{learning_style, ReportAssembler};
pub use scoring::{RuleBasedScoring, ScoringStrategy};
pub use stats::WindowedStats;
