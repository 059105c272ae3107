//! Report assembly
//!
//! Composes metrics, domain scores, progression and recommendations into the
//! immutable [`AnalysisReport`] produced when a session is finalized.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::analysis::metrics::SessionMetrics;
use crate::analysis::progression::ProgressionTracker;
use crate::analysis::recommendation::{rank_recommendations, DEFAULT_TOP_N};
use crate::analysis::scoring::{RuleBasedScoring, ScoringStrategy};
use crate::config::StatsConfig;
use crate::sanitize::bounded_json;
use crate::session::Session;
use crate::types::{
    AnalysisReport, Domain, DomainProgress, DomainProgression, DomainScore, LearningStyle,
    ProgressionTrend, QualityFlag, SessionSummary,
};
use crate::ENGINE_VERSION;

/// Spread between modality scores under which the style is `mixed`
const MIXED_STYLE_SPREAD: f64 = 15.0;

/// Sessions, current included, whose recommendations are ranked together
const RECOMMENDATION_SESSIONS: usize = 3;

const NOTE_FATIGUE: f64 = 30.0;
const NOTE_DISTRACTIONS: u32 = 3;
const NOTE_IMPULSIVITY: f64 = 0.3;

/// Classify the learning style from the visual, auditory and executive scores.
///
/// Executive function stands in for the kinesthetic modality. A spread below
/// 15 points between the three is reported as `mixed`.
pub fn learning_style(scores: &BTreeMap<Domain, DomainScore>) -> LearningStyle {
    let score_of = |domain: Domain| scores.get(&domain).map(|s| s.score).unwrap_or(0.0);
    let candidates = [
        (LearningStyle::Visual, score_of(Domain::Visual)),
        (LearningStyle::Auditory, score_of(Domain::Auditory)),
        (LearningStyle::Kinesthetic, score_of(Domain::Executive)),
    ];

    let max = candidates.iter().map(|(_, s)| *s).fold(f64::MIN, f64::max);
    let min = candidates.iter().map(|(_, s)| *s).fold(f64::MAX, f64::min);
    if max - min < MIXED_STYLE_SPREAD {
        return LearningStyle::Mixed;
    }

    // first maximum wins so ties resolve in modality order
    candidates
        .iter()
        .find(|(_, s)| *s == max)
        .map(|(style, _)| *style)
        .unwrap_or(LearningStyle::Mixed)
}

/// Mean of all domain scores, 0 when there are none
pub fn overall_score(scores: &BTreeMap<Domain, DomainScore>) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.values().map(|s| s.score).sum::<f64>() / scores.len() as f64
}

fn domain_label(domain: Domain) -> &'static str {
    match domain {
        Domain::Visual => "processamento visual",
        Domain::Auditory => "processamento auditivo",
        Domain::Executive => "funções executivas",
        Domain::Memory => "memória de trabalho",
        Domain::Attention => "atenção",
        Domain::Speed => "velocidade de processamento",
    }
}

/// Short observations for the clinician reviewing the session
pub fn therapist_notes(
    metrics: &SessionMetrics,
    trend: ProgressionTrend,
    progression: &[DomainProgression],
    flags: &[QualityFlag],
) -> Vec<String> {
    let mut notes = Vec::new();

    if metrics.fatigue_decline >= NOTE_FATIGUE {
        notes.push(format!(
            "Queda de {:.0} pontos no desempenho ao final da sessão, sugerindo fadiga",
            metrics.fatigue_decline
        ));
    }
    if metrics.distraction_events >= NOTE_DISTRACTIONS {
        notes.push(format!(
            "{} pausas longas durante a atividade, possíveis distrações",
            metrics.distraction_events
        ));
    }
    if metrics.impulsivity_rate > NOTE_IMPULSIVITY {
        notes.push(format!(
            "{:.0}% dos erros foram respostas rápidas, indicando impulsividade",
            metrics.impulsivity_rate * 100.0
        ));
    }

    match trend {
        ProgressionTrend::Advancing => {
            notes.push("Evolução consistente nas últimas sessões".to_string())
        }
        ProgressionTrend::NeedsSupport => {
            notes.push("Desempenho em queda nas últimas sessões, considerar apoio adicional".to_string())
        }
        ProgressionTrend::Mastered => {
            notes.push("Atividade dominada, considerar novos desafios".to_string())
        }
        ProgressionTrend::Maintaining => {}
    }

    for entry in progression {
        if entry.progress == DomainProgress::Regression {
            if let Some(deviation) = entry.deviation_pct {
                notes.push(format!(
                    "Regressão em {} ({:.0}% abaixo da média recente)",
                    domain_label(entry.domain),
                    deviation.abs()
                ));
            }
        }
    }

    if flags.contains(&QualityFlag::LowEventCount) || flags.contains(&QualityFlag::ShortSession) {
        notes.push("Poucos dados coletados; interpretar os resultados com cautela".to_string());
    }
    if flags.contains(&QualityFlag::HighIdleRatio) {
        notes.push("Sessão com longos períodos de inatividade".to_string());
    }

    notes
}

/// Builds analysis reports from finalized sessions
#[derive(Clone)]
pub struct ReportAssembler {
    scoring: Arc<dyn ScoringStrategy>,
    tracker: ProgressionTracker,
    stats: StatsConfig,
    top_n: usize,
}

impl ReportAssembler {
    pub fn new(
        scoring: Arc<dyn ScoringStrategy>,
        tracker: ProgressionTracker,
        stats: StatsConfig,
    ) -> Self {
        Self {
            scoring,
            tracker,
            stats,
            top_n: DEFAULT_TOP_N,
        }
    }

    /// Number of ranked recommendations kept in each report
    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    pub fn tracker(&self) -> &ProgressionTracker {
        &self.tracker
    }

    /// Assemble the report for a session.
    ///
    /// Pure: the same session, history and timestamp always produce the same
    /// report. `history` is the user's prior sessions, in any order.
    pub fn assemble(
        &self,
        session: &Session,
        history: &[SessionSummary],
        now: DateTime<Utc>,
    ) -> AnalysisReport {
        self.assemble_with_prior(session, history, &[], now)
    }

    /// Like [`assemble`](Self::assemble), also ranking the recommendations of
    /// the two most recent `prior` reports on the same activity.
    pub fn assemble_with_prior(
        &self,
        session: &Session,
        history: &[SessionSummary],
        prior: &[AnalysisReport],
        now: DateTime<Utc>,
    ) -> AnalysisReport {
        let metrics = SessionMetrics::from_session(session, &self.stats);
        let domain_scores = self.scoring.score_all(&metrics);
        let overall = overall_score(&domain_scores);

        let relevant: Vec<SessionSummary> = history
            .iter()
            .filter(|s| s.activity_id == session.activity_id() && s.session_id != session.session_id())
            .cloned()
            .collect();
        let trend = self.tracker.overall_trend(&relevant, overall, now);
        let domain_progression = self.tracker.domain_progression(&relevant, &domain_scores, now);

        let mut earlier: Vec<&AnalysisReport> = prior
            .iter()
            .filter(|r| r.activity_id == session.activity_id() && r.session_id != session.session_id())
            .collect();
        earlier.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        earlier.truncate(RECOMMENDATION_SESSIONS - 1);

        // current session first so ties keep its domain order
        let recommendations = rank_recommendations(
            domain_scores
                .values()
                .chain(earlier.iter().flat_map(|r| r.domain_scores.values())),
            self.top_n,
        );
        let next_difficulty = self
            .scoring
            .next_difficulty(session.difficulty(), &metrics, trend);
        let quality_flags = metrics.quality_flags();
        let therapist_notes = therapist_notes(&metrics, trend, &domain_progression, &quality_flags);

        AnalysisReport {
            session_id: session.session_id().to_string(),
            user_id: session.user_id().to_string(),
            activity_id: session.activity_id().to_string(),
            status: session.status(),
            timestamp: now,
            engine_version: ENGINE_VERSION.to_string(),
            learning_style: learning_style(&domain_scores),
            overall_score: overall,
            progression_trend: trend,
            metrics,
            domain_scores,
            domain_progression,
            recommendations,
            next_difficulty,
            therapist_notes,
            quality_flags,
        }
    }

    /// Compact history record for a finalized session and its report
    pub fn summarize(session: &Session, report: &AnalysisReport) -> SessionSummary {
        SessionSummary {
            session_id: report.session_id.clone(),
            user_id: report.user_id.clone(),
            activity_id: report.activity_id.clone(),
            difficulty: session.difficulty(),
            status: report.status,
            start_time: session.start_time(),
            end_time: session.end_time().unwrap_or(report.timestamp),
            accuracy: report.metrics.accuracy,
            overall_score: report.overall_score,
            domain_scores: report
                .domain_scores
                .iter()
                .map(|(domain, score)| (*domain, score.score))
                .collect(),
        }
    }

    /// Depth-bounded JSON rendition of a report
    pub fn to_json(report: &AnalysisReport, max_depth: usize) -> Result<Value, serde_json::Error> {
        bounded_json(report, max_depth)
    }
}

impl Default for ReportAssembler {
    fn default() -> Self {
        Self::new(
            Arc::new(RuleBasedScoring),
            ProgressionTracker::new(30, 10),
            StatsConfig::default(),
        )
    }
}
