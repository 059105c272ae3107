//! Adaptive difficulty decision

use crate::analysis::metrics::SessionMetrics;
use crate::types::{Difficulty, DifficultyAdjustment, DifficultyDecision, ProgressionTrend};

const RAISE_ACCURACY: f64 = 85.0;
const RAISE_CONSISTENCY: f64 = 70.0;
const LOWER_ACCURACY: f64 = 50.0;
const LOWER_FATIGUE: f64 = 40.0;

/// Rule-based choice of the next session's difficulty.
///
/// Fatigue or low accuracy steps down; sustained high accuracy with stable
/// performance steps up unless the cross-session trend asks for support.
pub fn decide_difficulty(
    current: Difficulty,
    metrics: &SessionMetrics,
    trend: ProgressionTrend,
) -> DifficultyDecision {
    let struggling = metrics.attempts > 0 && metrics.accuracy < LOWER_ACCURACY;
    let fatigued = metrics.fatigue_decline >= LOWER_FATIGUE;
    let excelling = metrics.accuracy >= RAISE_ACCURACY
        && metrics.consistency >= RAISE_CONSISTENCY
        && trend != ProgressionTrend::NeedsSupport;

    let regressing =
        trend == ProgressionTrend::NeedsSupport && metrics.accuracy < RAISE_ACCURACY;

    let adjustment = if struggling || fatigued || regressing {
        DifficultyAdjustment::Decrease
    } else if excelling {
        DifficultyAdjustment::Increase
    } else {
        DifficultyAdjustment::Keep
    };

    let next = match adjustment {
        DifficultyAdjustment::Increase => current.harder(),
        DifficultyAdjustment::Decrease => current.easier(),
        DifficultyAdjustment::Keep => current,
    };

    DifficultyDecision { adjustment, next }
}
