//! Cogniflux - Behavioral telemetry engine for adaptive learning activities
//!
//! Cogniflux turns the interactions of a learning activity into a per-session
//! cognitive profile through a deterministic pipeline: event validation →
//! session aggregation → windowed statistics → domain scoring → progression
//! and recommendations → analysis report.
//!
//! ## Modules
//!
//! - **Engine**: session lifecycle, background monitor and persistence hand-off
//! - **Analysis**: statistics, scoring, progression and report assembly
//! - **Persistence**: gateway boundary with retry and local fallback

pub mod analysis;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod persistence;
pub mod sanitize;
pub mod session;
pub mod types;

pub use analysis::{ReportAssembler, RuleBasedScoring, ScoringStrategy, SessionMetrics};
pub use config::{ActiveSessionPolicy, EngineConfig};
pub use engine::TelemetryEngine;
pub use error::{PersistenceError, TelemetryError};
pub use event::{parse_event, Event, EventPayload};
pub use persistence::{InMemoryGateway, JsonFileGateway, PersistenceGateway, SessionRecord};
pub use session::{Session, SessionStore};
pub use types::{AnalysisReport, Difficulty, Domain, Level, SessionStatus, SessionSummary};

/// Engine version embedded in every report
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name used in logs and persisted records
pub const PRODUCER_NAME: &str = "cogniflux";
