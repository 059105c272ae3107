//! Cross-session progression
//!
//! Compares the current session against the user's recent history. The
//! classification is recomputed for every analysis; only the score series
//! itself is ever stored.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};

use crate::analysis::stats::least_squares_slope;
use crate::types::{
    Domain, DomainProgress, DomainProgression, DomainScore, ProgressionTrend, SessionSummary,
};

/// Scores considered by the trend regression
const TREND_POINTS: usize = 5;

/// Minimum series length before anything other than `maintaining` is reported
const MIN_TREND_POINTS: usize = 3;

/// Slope, in points per session, beyond which the trend is directional
const TREND_SLOPE: f64 = 5.0;

const MASTERY_SCORE: f64 = 85.0;

/// Deviation from a domain's baseline, in percent, that counts as movement
const DOMAIN_DEVIATION_PCT: f64 = 10.0;

/// Classify a chronological series of overall scores (oldest first)
pub fn classify_trend(series: &[f64]) -> ProgressionTrend {
    if series.len() < MIN_TREND_POINTS {
        return ProgressionTrend::Maintaining;
    }
    let recent = &series[series.len().saturating_sub(TREND_POINTS)..];
    let slope = least_squares_slope(recent);
    let latest = recent.last().copied().unwrap_or(0.0);

    if slope > TREND_SLOPE {
        ProgressionTrend::Advancing
    } else if slope < -TREND_SLOPE {
        ProgressionTrend::NeedsSupport
    } else if latest > MASTERY_SCORE {
        ProgressionTrend::Mastered
    } else {
        ProgressionTrend::Maintaining
    }
}

/// Deviation of `current` from `baseline` as a percentage
fn deviation_pct(current: f64, baseline: Option<f64>) -> Option<f64> {
    match baseline {
        Some(base) if base > 0.0 => Some(((current - base) / base) * 100.0),
        Some(_) if current > 0.0 => Some(100.0),
        Some(_) => Some(0.0),
        None => None,
    }
}

/// Bounded view over a user's history
#[derive(Debug, Clone)]
pub struct ProgressionTracker {
    lookback: TimeDelta,
    limit: usize,
}

impl ProgressionTracker {
    pub fn new(lookback_days: i64, limit: usize) -> Self {
        Self {
            lookback: TimeDelta::try_days(lookback_days.max(0)).unwrap_or(TimeDelta::MAX),
            limit,
        }
    }

    /// Oldest end time inside the lookback window, saturating at the earliest date
    pub fn since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Sessions inside the lookback window, oldest first, at most `limit`
    pub fn window<'a>(
        &self,
        history: &'a [SessionSummary],
        now: DateTime<Utc>,
    ) -> Vec<&'a SessionSummary> {
        let since = self.since(now);
        let mut recent: Vec<&SessionSummary> =
            history.iter().filter(|s| s.end_time >= since).collect();
        recent.sort_by_key(|s| s.end_time);
        let skip = recent.len().saturating_sub(self.limit);
        recent.split_off(skip)
    }

    /// Overall trend across the window plus the current session's score
    pub fn overall_trend(
        &self,
        history: &[SessionSummary],
        current_overall: f64,
        now: DateTime<Utc>,
    ) -> ProgressionTrend {
        let mut series: Vec<f64> = self
            .window(history, now)
            .iter()
            .map(|s| s.overall_score)
            .collect();
        series.push(current_overall);
        classify_trend(&series)
    }

    /// Compare each current domain score against its mean over the window
    pub fn domain_progression(
        &self,
        history: &[SessionSummary],
        current: &BTreeMap<Domain, DomainScore>,
        now: DateTime<Utc>,
    ) -> Vec<DomainProgression> {
        let window = self.window(history, now);

        current
            .values()
            .map(|score| {
                let past: Vec<f64> = window
                    .iter()
                    .filter_map(|s| s.domain_scores.get(&score.domain).copied())
                    .collect();
                let baseline = if past.is_empty() {
                    None
                } else {
                    Some(past.iter().sum::<f64>() / past.len() as f64)
                };
                let deviation = deviation_pct(score.score, baseline);

                let progress = match deviation {
                    Some(d) if d <= -DOMAIN_DEVIATION_PCT => DomainProgress::Regression,
                    _ if score.score >= MASTERY_SCORE => DomainProgress::Mastery,
                    Some(d) if d >= DOMAIN_DEVIATION_PCT => DomainProgress::Progression,
                    _ => DomainProgress::Stable,
                };

                DomainProgression {
                    domain: score.domain,
                    score: score.score,
                    baseline,
                    deviation_pct: deviation,
                    progress,
                    sessions_in_baseline: past.len() as u32,
                }
            })
            .collect()
    }
}
