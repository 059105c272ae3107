//! Session metrics
//!
//! Flattens a finalized session's aggregates and windowed statistics into the
//! metrics vector consumed by the domain scorers, and flags sessions whose
//! data is too thin to interpret with confidence.

use serde::{Deserialize, Serialize};

use crate::analysis::stats::WindowedStats;
use crate::config::StatsConfig;
use crate::session::Session;
use crate::types::QualityFlag;

/// Sessions with fewer events are flagged
const MIN_EVENT_COUNT: usize = 10;

/// Sessions spanning less than this are flagged (1 minute)
const MIN_SESSION_SPAN_MS: i64 = 60_000;

/// Sessions idle for more than this share of their span are flagged
const MAX_IDLE_RATIO: f64 = 0.8;

/// Quantitative metrics for one session. All-zero is a valid input to every scorer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// 0-100
    pub accuracy: f64,
    pub attempts: u32,
    pub successes: u32,
    pub errors: u32,
    pub average_response_time_ms: f64,
    pub response_latency_variance: f64,
    pub response_time_variability_ms: f64,
    /// 0-100
    pub consistency: f64,
    /// -100..100
    pub learning_rate: f64,
    /// 0-100
    pub fatigue_decline: f64,
    pub distraction_events: u32,
    /// 0-1
    pub impulsivity_rate: f64,
    /// 0-100
    pub engagement_score: f64,
    /// 0-1
    pub idle_ratio: f64,
    pub pause_count: u32,
    pub event_count: u32,
    pub response_samples: u32,
    pub span_ms: i64,
}

impl SessionMetrics {
    /// Compute metrics from a session's event log and aggregates
    pub fn from_session(session: &Session, config: &StatsConfig) -> Self {
        let events = session.events();
        let aggregates = session.aggregates();
        let stats = WindowedStats::compute(events, config);

        let span_ms = match (events.first(), events.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).max(0),
            _ => 0,
        };
        let response_samples = events
            .iter()
            .filter(|e| e.response_time_ms().is_some())
            .count() as u32;

        Self {
            accuracy: aggregates.accuracy(),
            attempts: aggregates.attempts(),
            successes: aggregates.successes(),
            errors: aggregates.errors(),
            average_response_time_ms: aggregates.average_response_time(),
            response_latency_variance: aggregates.response_latency_variance(),
            response_time_variability_ms: stats.response_time_variability,
            consistency: stats.consistency,
            learning_rate: stats.learning_trend,
            fatigue_decline: stats.fatigue_decline.unwrap_or(0.0),
            distraction_events: stats.distraction_events,
            impulsivity_rate: stats.impulsivity_rate,
            engagement_score: stats.engagement_score,
            idle_ratio: stats.idle_ratio,
            pause_count: stats.pause_patterns.len() as u32,
            event_count: events.len() as u32,
            response_samples,
            span_ms,
        }
    }

    /// Data quality flags for these metrics
    pub fn quality_flags(&self) -> Vec<QualityFlag> {
        let mut flags = Vec::new();
        if (self.event_count as usize) < MIN_EVENT_COUNT {
            flags.push(QualityFlag::LowEventCount);
        }
        if self.span_ms < MIN_SESSION_SPAN_MS {
            flags.push(QualityFlag::ShortSession);
        }
        if self.idle_ratio > MAX_IDLE_RATIO {
            flags.push(QualityFlag::HighIdleRatio);
        }
        if self.response_samples == 0 {
            flags.push(QualityFlag::NoResponseTimes);
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ErrorPayload, Event, EventPayload, ResponsePayload};
    use crate::types::Difficulty;
    use chrono::{TimeZone, Utc};

    fn session_with(events: Vec<Event>) -> Session {
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        let config = StatsConfig::default();
        let mut session = Session::new("u1", "memory", Difficulty::Medium, now);
        for event in events {
            session.record(event, now, &config).unwrap();
        }
        session
    }

    fn round(ts: i64, ok: bool, rt: f64) -> Vec<Event> {
        let outcome = if ok {
            EventPayload::Success(ResponsePayload {
                response_time_ms: Some(rt),
                ..Default::default()
            })
        } else {
            EventPayload::Error(ErrorPayload {
                response_time_ms: Some(rt),
                ..Default::default()
            })
        };
        vec![
            Event::new(ts, EventPayload::Attempt(ResponsePayload::default())),
            Event::new(ts + 500, outcome),
        ]
    }

    #[test]
    fn test_fatigue_scenario_flows_into_metrics() {
        let mut events = Vec::new();
        for i in 0..12 {
            events.extend(round(i * 5_500, i < 6, 1_500.0));
        }
        let metrics = SessionMetrics::from_session(&session_with(events), &StatsConfig::default());

        assert_eq!(metrics.attempts, 12);
        assert_eq!(metrics.accuracy, 50.0);
        assert_eq!(metrics.fatigue_decline, 100.0);
        assert_eq!(metrics.learning_rate, -100.0);
        assert_eq!(metrics.event_count, 24);
        assert_eq!(metrics.response_samples, 12);
        assert!(metrics.quality_flags().is_empty());
    }

    #[test]
    fn test_empty_session_metrics() {
        let metrics = SessionMetrics::from_session(&session_with(vec![]), &StatsConfig::default());
        assert_eq!(metrics.accuracy, 0.0);
        assert_eq!(metrics.consistency, 100.0);
        assert_eq!(metrics.fatigue_decline, 0.0);
        assert_eq!(
            metrics.quality_flags(),
            vec![
                QualityFlag::LowEventCount,
                QualityFlag::ShortSession,
                QualityFlag::NoResponseTimes
            ]
        );
    }

    #[test]
    fn test_high_idle_flag() {
        let mut events = round(0, true, 800.0);
        events.extend(round(200_000, true, 800.0));
        let metrics = SessionMetrics::from_session(&session_with(events), &StatsConfig::default());
        assert!(metrics.quality_flags().contains(&QualityFlag::HighIdleRatio));
        assert_eq!(metrics.distraction_events, 1);
    }
}
