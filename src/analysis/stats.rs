//! Windowed statistics over a session's event log
//!
//! Every function here is pure and total. When there are not enough samples
//! the function returns its neutral value instead of failing: variability 0,
//! trend 0, consistency 100, fatigue `None`.

use serde::{Deserialize, Serialize};

use crate::config::StatsConfig;
use crate::event::Event;
use crate::types::PausePattern;

/// Signals derived from the whole event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowedStats {
    pub response_time_variability: f64,
    pub learning_trend: f64,
    /// `None` when the trailing window holds too few outcome events
    pub fatigue_decline: Option<f64>,
    pub distraction_events: u32,
    pub consistency: f64,
    pub impulsivity_rate: f64,
    pub engagement_score: f64,
    pub idle_ratio: f64,
    pub pause_patterns: Vec<PausePattern>,
}

impl WindowedStats {
    pub fn compute(events: &[Event], config: &StatsConfig) -> Self {
        let outcomes = outcomes(events);
        let times = response_times(events);

        Self {
            response_time_variability: response_time_variability(&times, config.variability_window),
            learning_trend: learning_trend(&outcomes, config.trend_min_events),
            fatigue_decline: fatigue_decline(
                &outcomes,
                config.fatigue_window,
                config.fatigue_min_events,
            ),
            distraction_events: count_distractions(events, config.distraction_gap_ms),
            consistency: performance_consistency(&outcomes, config.consistency_window),
            impulsivity_rate: impulsivity_rate(events, config.impulsive_response_ms),
            engagement_score: engagement_score(events, config.pause_gap_ms),
            idle_ratio: idle_ratio(events, config.pause_gap_ms),
            pause_patterns: pause_patterns(events, config.pause_gap_ms),
        }
    }
}

/// Outcomes in arrival order: `true` for success, `false` for error
pub fn outcomes(events: &[Event]) -> Vec<bool> {
    events.iter().filter_map(Event::outcome).collect()
}

/// Response times in arrival order, from any event that carries one
pub fn response_times(events: &[Event]) -> Vec<f64> {
    events.iter().filter_map(Event::response_time_ms).collect()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance
pub fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / values.len() as f64
}

pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

/// Least-squares slope of `values` against their index
pub fn least_squares_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let x_mean = mean(&xs);
    let y_mean = mean(values);

    let (num, den) = xs
        .iter()
        .zip(values)
        .fold((0.0, 0.0), |(num, den), (x, y)| {
            (num + (x - x_mean) * (y - y_mean), den + (x - x_mean).powi(2))
        });

    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

fn accuracy_fraction(outcomes: &[bool]) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    outcomes.iter().filter(|&&ok| ok).count() as f64 / outcomes.len() as f64
}

/// Standard deviation of the last `window` response times (all when `None`)
pub fn response_time_variability(times: &[f64], window: Option<usize>) -> f64 {
    let recent = match window {
        Some(n) if n < times.len() => &times[times.len() - n..],
        _ => times,
    };
    if recent.len() < 2 {
        return 0.0;
    }
    std_dev(recent)
}

/// Accuracy of the last third minus accuracy of the first third, in points.
///
/// Outcomes are split into three equal contiguous windows of `n / 3` events.
pub fn learning_trend(outcomes: &[bool], min_events: usize) -> f64 {
    let n = outcomes.len();
    if n < min_events.max(3) {
        return 0.0;
    }
    let width = n / 3;
    let first = accuracy_fraction(&outcomes[..width]);
    let last = accuracy_fraction(&outcomes[n - width..]);
    ((last - first) * 100.0).clamp(-100.0, 100.0)
}

/// Accuracy drop between the halves of the trailing outcome window, in points
pub fn fatigue_decline(outcomes: &[bool], window: usize, min_events: usize) -> Option<f64> {
    let start = outcomes.len().saturating_sub(window);
    let trailing = &outcomes[start..];
    if trailing.len() < min_events.max(2) {
        return None;
    }
    let half = trailing.len() / 2;
    let first = accuracy_fraction(&trailing[..half]);
    let second = accuracy_fraction(&trailing[half..]);
    Some(((first - second).max(0.0) * 100.0).min(100.0))
}

fn gaps(events: &[Event]) -> impl Iterator<Item = (usize, i64)> + '_ {
    events
        .windows(2)
        .enumerate()
        .map(|(i, pair)| (i, pair[1].timestamp - pair[0].timestamp))
        .filter(|(_, gap)| *gap >= 0)
}

/// Number of consecutive-event gaps longer than `gap_ms`
pub fn count_distractions(events: &[Event], gap_ms: i64) -> u32 {
    gaps(events).filter(|(_, gap)| *gap > gap_ms).count() as u32
}

pub fn pause_patterns(events: &[Event], gap_ms: i64) -> Vec<PausePattern> {
    gaps(events)
        .filter(|(_, gap)| *gap > gap_ms)
        .map(|(after_index, duration_ms)| PausePattern {
            after_index,
            duration_ms,
        })
        .collect()
}

/// `100 − 100 · stdev(window accuracies)` over a sliding window, floored at 0
pub fn performance_consistency(outcomes: &[bool], window: usize) -> f64 {
    if window == 0 || outcomes.len() < window {
        return 100.0;
    }
    let accuracies: Vec<f64> = outcomes.windows(window).map(accuracy_fraction).collect();
    (100.0 - 100.0 * std_dev(&accuracies)).max(0.0)
}

/// Share of outcome events that were errors answered faster than `threshold_ms`
pub fn impulsivity_rate(events: &[Event], threshold_ms: f64) -> f64 {
    let scored: Vec<&Event> = events.iter().filter(|e| e.outcome().is_some()).collect();
    if scored.is_empty() {
        return 0.0;
    }
    let impulsive = scored
        .iter()
        .filter(|e| e.outcome() == Some(false))
        .filter(|e| e.response_time_ms().is_some_and(|rt| rt < threshold_ms))
        .count();
    impulsive as f64 / scored.len() as f64
}

fn span_ms(events: &[Event]) -> i64 {
    match (events.first(), events.last()) {
        (Some(first), Some(last)) => (last.timestamp - first.timestamp).max(0),
        _ => 0,
    }
}

/// Fraction of the session span spent in pauses longer than `pause_gap_ms`
pub fn idle_ratio(events: &[Event], pause_gap_ms: i64) -> f64 {
    let span = span_ms(events);
    if span == 0 {
        return 0.0;
    }
    let idle: i64 = gaps(events)
        .filter(|(_, gap)| *gap > pause_gap_ms)
        .map(|(_, gap)| gap)
        .sum();
    (idle as f64 / span as f64).clamp(0.0, 1.0)
}

/// Active share of the session span, 0-100. Zero with fewer than two events.
pub fn engagement_score(events: &[Event], pause_gap_ms: i64) -> f64 {
    if span_ms(events) == 0 {
        return 0.0;
    }
    (100.0 * (1.0 - idle_ratio(events, pause_gap_ms))).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ErrorPayload, EventPayload, ResponsePayload};

    fn success(ts: i64, rt: Option<f64>) -> Event {
        Event::new(
            ts,
            EventPayload::Success(ResponsePayload {
                response_time_ms: rt,
                ..Default::default()
            }),
        )
    }

    fn error(ts: i64, rt: Option<f64>) -> Event {
        Event::new(
            ts,
            EventPayload::Error(ErrorPayload {
                response_time_ms: rt,
                ..Default::default()
            }),
        )
    }

    fn attempt(ts: i64) -> Event {
        Event::new(ts, EventPayload::Attempt(ResponsePayload::default()))
    }

    #[test]
    fn test_variability_needs_two_samples() {
        assert_eq!(response_time_variability(&[], None), 0.0);
        assert_eq!(response_time_variability(&[1200.0], None), 0.0);
        let sd = response_time_variability(&[1000.0, 3000.0], None);
        assert!((sd - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_variability_window() {
        let times = [100.0, 5000.0, 2000.0, 2000.0];
        assert_eq!(response_time_variability(&times, Some(2)), 0.0);
        assert!(response_time_variability(&times, None) > 0.0);
    }

    #[test]
    fn test_trend_neutral_below_minimum() {
        assert_eq!(learning_trend(&[false, false, true, true], 5), 0.0);
    }

    #[test]
    fn test_trend_window_difference() {
        // 6 outcomes -> windows of 2: first 0%, last 100%
        let outcomes = [false, false, true, false, true, true];
        assert_eq!(learning_trend(&outcomes, 5), 100.0);

        // declining
        let outcomes = [true, true, true, false, false, false];
        assert_eq!(learning_trend(&outcomes, 5), -100.0);

        // 7 outcomes -> width 2; first [T,F] = 50%, last [T,T] = 100%
        let outcomes = [true, false, false, false, false, true, true];
        assert_eq!(learning_trend(&outcomes, 5), 50.0);
    }

    #[test]
    fn test_fatigue_requires_minimum_events() {
        let outcomes = [true; 9];
        assert_eq!(fatigue_decline(&outcomes, 20, 10), None);
    }

    #[test]
    fn test_fatigue_full_decline() {
        let mut outcomes = vec![true; 6];
        outcomes.extend(vec![false; 6]);
        assert_eq!(fatigue_decline(&outcomes, 20, 10), Some(100.0));
    }

    #[test]
    fn test_fatigue_never_negative() {
        let mut outcomes = vec![false; 5];
        outcomes.extend(vec![true; 5]);
        assert_eq!(fatigue_decline(&outcomes, 20, 10), Some(0.0));
    }

    #[test]
    fn test_fatigue_uses_trailing_window() {
        // early errors fall outside a 10-event window
        let mut outcomes = vec![false; 10];
        outcomes.extend(vec![true; 5]);
        outcomes.extend(vec![false; 5]);
        assert_eq!(fatigue_decline(&outcomes, 10, 10), Some(100.0));
    }

    #[test]
    fn test_distractions_counted_above_threshold() {
        let events = vec![attempt(0), attempt(30_000), attempt(60_001), attempt(60_500)];
        // gaps: 30000 (not > 30000), 30001, 499
        assert_eq!(count_distractions(&events, 30_000), 1);
    }

    #[test]
    fn test_pause_patterns() {
        let events = vec![attempt(0), attempt(1_000), attempt(9_000), attempt(9_500)];
        let pauses = pause_patterns(&events, 5_000);
        assert_eq!(
            pauses,
            vec![PausePattern {
                after_index: 1,
                duration_ms: 8_000
            }]
        );
    }

    #[test]
    fn test_consistency() {
        assert_eq!(performance_consistency(&[true, false, true], 5), 100.0);
        assert_eq!(performance_consistency(&[true; 8], 5), 100.0);

        let alternating = [true, false, true, false, true, false];
        // windows of 60% and 40% -> stdev 0.1 -> 90
        let c = performance_consistency(&alternating, 5);
        assert!((c - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_consistency_floor() {
        let mut outcomes = vec![true; 5];
        outcomes.extend(vec![false; 5]);
        let c = performance_consistency(&outcomes, 5);
        assert!((0.0..=100.0).contains(&c));
    }

    #[test]
    fn test_impulsivity_rate() {
        let events = vec![
            error(0, Some(200.0)),
            error(1, Some(2_000.0)),
            success(2, Some(150.0)),
            attempt(3),
        ];
        let rate = impulsivity_rate(&events, 500.0);
        assert!((rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(impulsivity_rate(&[], 500.0), 0.0);
    }

    #[test]
    fn test_engagement_and_idle() {
        assert_eq!(engagement_score(&[], 5_000), 0.0);
        assert_eq!(engagement_score(&[attempt(10)], 5_000), 0.0);

        let events = vec![attempt(0), attempt(2_000), attempt(10_000)];
        // span 10s, one 8s pause
        assert!((idle_ratio(&events, 5_000) - 0.8).abs() < 1e-9);
        assert!((engagement_score(&events, 5_000) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_least_squares_slope() {
        assert_eq!(least_squares_slope(&[]), 0.0);
        assert_eq!(least_squares_slope(&[50.0]), 0.0);
        assert!((least_squares_slope(&[10.0, 20.0, 30.0]) - 10.0).abs() < 1e-9);
        assert!((least_squares_slope(&[80.0, 80.0, 80.0]) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_compute_on_empty_log() {
        let stats = WindowedStats::compute(&[], &StatsConfig::default());
        assert_eq!(stats.learning_trend, 0.0);
        assert_eq!(stats.consistency, 100.0);
        assert_eq!(stats.fatigue_decline, None);
        assert_eq!(stats.distraction_events, 0);
        assert!(stats.pause_patterns.is_empty());
    }
}
