//! Shared data model
//!
//! Types that flow between the session store, the analysis pipeline and the
//! persistence boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::metrics::SessionMetrics;

/// Activity difficulty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "easy" => Some(Difficulty::Easy),
            "medium" => Some(Difficulty::Medium),
            "hard" => Some(Difficulty::Hard),
            _ => None,
        }
    }

    pub fn harder(self) -> Self {
        match self {
            Difficulty::Easy => Difficulty::Medium,
            Difficulty::Medium | Difficulty::Hard => Difficulty::Hard,
        }
    }

    pub fn easier(self) -> Self {
        match self {
            Difficulty::Hard => Difficulty::Medium,
            Difficulty::Medium | Difficulty::Easy => Difficulty::Easy,
        }
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

/// Cognitive domain scored independently per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Visual,
    Auditory,
    Executive,
    Memory,
    Attention,
    Speed,
}

impl Domain {
    /// Canonical domain order, also used as the recommendation tie-break
    pub const ALL: [Domain; 6] = [
        Domain::Visual,
        Domain::Auditory,
        Domain::Executive,
        Domain::Memory,
        Domain::Attention,
        Domain::Speed,
    ];
}

/// Qualitative level derived from a 0-100 domain score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Excelente,
    Bom,
    Adequado,
    EmDesenvolvimento,
    NecessitaSuporte,
}

impl Level {
    /// Map a score onto the fixed breakpoints 80 / 65 / 50 / 35
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Level::Excelente
        } else if score >= 65.0 {
            Level::Bom
        } else if score >= 50.0 {
            Level::Adequado
        } else if score >= 35.0 {
            Level::EmDesenvolvimento
        } else {
            Level::NecessitaSuporte
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationType {
    Intervention,
    Accommodation,
    Strength,
}

/// Recommendation priority, ordered `alta` > `média` > `baixa`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    #[serde(rename = "alta")]
    Alta,
    #[serde(rename = "média")]
    Media,
    #[serde(rename = "baixa")]
    Baixa,
}

impl Priority {
    /// Lower rank sorts first
    pub fn rank(self) -> u8 {
        match self {
            Priority::Alta => 0,
            Priority::Media => 1,
            Priority::Baixa => 2,
        }
    }
}

/// A typed suggestion emitted by a domain scorer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub kind: RecommendationType,
    pub priority: Priority,
    pub description: String,
    pub activities: Vec<String>,
    /// Domain whose scorer produced this recommendation
    pub domain: Domain,
}

/// A recommendation after de-duplication across domains and sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedRecommendation {
    #[serde(flatten)]
    pub recommendation: Recommendation,
    pub frequency: u32,
}

/// Score for a single cognitive domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainScore {
    pub domain: Domain,
    /// Score in [0, 100]
    pub score: f64,
    pub level: Level,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningStyle {
    Visual,
    Auditory,
    Kinesthetic,
    Mixed,
}

/// Cross-session progression classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressionTrend {
    NeedsSupport,
    Maintaining,
    Advancing,
    Mastered,
}

/// Per-domain comparison against the historical baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainProgress {
    Regression,
    Stable,
    Progression,
    Mastery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainProgression {
    pub domain: Domain,
    pub score: f64,
    /// Mean score for this domain across the lookback window
    pub baseline: Option<f64>,
    /// Deviation from baseline as a percentage
    pub deviation_pct: Option<f64>,
    pub progress: DomainProgress,
    pub sessions_in_baseline: u32,
}

/// Direction the next session's difficulty should move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifficultyAdjustment {
    Increase,
    Keep,
    Decrease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultyDecision {
    pub adjustment: DifficultyAdjustment,
    pub next: Difficulty,
}

/// Data quality flags attached to each report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    /// Fewer than 10 events recorded
    LowEventCount,
    /// Less than a minute between first and last event
    ShortSession,
    /// More than 80% of the session spent in pauses
    HighIdleRatio,
    /// No event carried a response time
    NoResponseTimes,
}

/// A pause between two consecutive events
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PausePattern {
    /// Index of the event the pause follows
    pub after_index: usize,
    pub duration_ms: i64,
}

/// Signals recomputed by the background monitor for active sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSignals {
    pub session_id: String,
    /// Accuracy drop between halves of the trailing window, in points
    pub fatigue_decline: f64,
    pub distraction_events: u32,
    pub consistency: f64,
    pub event_count: usize,
    pub computed_at: DateTime<Utc>,
}

/// Immutable analysis produced when a session is finalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub session_id: String,
    pub user_id: String,
    pub activity_id: String,
    pub status: SessionStatus,
    pub timestamp: DateTime<Utc>,
    pub engine_version: String,
    pub metrics: SessionMetrics,
    pub domain_scores: BTreeMap<Domain, DomainScore>,
    pub overall_score: f64,
    pub learning_style: LearningStyle,
    pub progression_trend: ProgressionTrend,
    pub domain_progression: Vec<DomainProgression>,
    /// Priority-sorted, de-duplicated
    pub recommendations: Vec<RankedRecommendation>,
    pub next_difficulty: DifficultyDecision,
    pub therapist_notes: Vec<String>,
    pub quality_flags: Vec<QualityFlag>,
}

/// Compact per-session record returned by history queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: String,
    pub activity_id: String,
    pub difficulty: Difficulty,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub accuracy: f64,
    pub overall_score: f64,
    pub domain_scores: BTreeMap<Domain, f64>,
}
