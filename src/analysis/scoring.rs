//! Cognitive domain scoring
//!
//! Each domain combines a few weighted sub-signals from [`SessionMetrics`]
//! into a 0-100 score, maps it onto the five-level scale and emits the
//! recommendations gated by that domain's threshold rules.
//!
//! Scorers are deterministic, defined for every input (including all-zero
//! metrics) and never decrease when accuracy increases with everything else
//! held constant.

use std::collections::BTreeMap;

use crate::analysis::adaptive::decide_difficulty;
use crate::analysis::metrics::SessionMetrics;
use crate::types::{
    Difficulty, DifficultyDecision, Domain, DomainScore, Level, Priority, ProgressionTrend,
    Recommendation, RecommendationType,
};

/// Score at or below which a domain asks for an intervention
const INTERVENTION_BELOW: f64 = 50.0;

/// Score from which a domain is reported as a strength
const STRENGTH_FROM: f64 = 80.0;

/// Mean response time above which extra time is recommended
const SLOW_RESPONSE_MS: f64 = 10_000.0;

/// Distraction events from which environment accommodations are recommended
const DISTRACTION_ALERT: u32 = 3;

const FATIGUE_ALERT: f64 = 30.0;
const IMPULSIVITY_ALERT: f64 = 0.3;
const DECLINING_LEARNING_RATE: f64 = -20.0;

const EXTEND_RESPONSE_TIME: &str =
    "Ampliar o tempo de resposta e reduzir estímulos simultâneos";
const REDUCE_DISTRACTIONS: &str =
    "Reduzir distrações do ambiente e usar instruções curtas e diretas";

/// Pluggable scoring model.
///
/// The default implementation is rule based; a learned model can implement the
/// same trait without touching the rest of the pipeline.
pub trait ScoringStrategy: Send + Sync {
    /// Score a single domain
    fn score_domain(&self, domain: Domain, metrics: &SessionMetrics) -> DomainScore;

    /// Score every domain in canonical order
    fn score_all(&self, metrics: &SessionMetrics) -> BTreeMap<Domain, DomainScore> {
        Domain::ALL
            .iter()
            .map(|&domain| (domain, self.score_domain(domain, metrics)))
            .collect()
    }

    /// Pick the difficulty for the next session
    fn next_difficulty(
        &self,
        current: Difficulty,
        metrics: &SessionMetrics,
        trend: ProgressionTrend,
    ) -> DifficultyDecision {
        decide_difficulty(current, metrics, trend)
    }
}

/// Threshold-rule scoring used by default
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedScoring;

impl ScoringStrategy for RuleBasedScoring {
    fn score_domain(&self, domain: Domain, metrics: &SessionMetrics) -> DomainScore {
        match domain {
            Domain::Visual => score_visual(metrics),
            Domain::Auditory => score_auditory(metrics),
            Domain::Executive => score_executive(metrics),
            Domain::Memory => score_memory(metrics),
            Domain::Attention => score_attention(metrics),
            Domain::Speed => score_speed(metrics),
        }
    }
}

fn finish(domain: Domain, raw: f64, recommendations: Vec<Recommendation>) -> DomainScore {
    let score = if raw.is_finite() {
        raw.clamp(0.0, 100.0)
    } else {
        0.0
    };
    DomainScore {
        domain,
        score,
        level: Level::from_score(score),
        recommendations,
    }
}

fn recommendation(
    domain: Domain,
    kind: RecommendationType,
    priority: Priority,
    description: &str,
    activities: &[&str],
) -> Recommendation {
    Recommendation {
        kind,
        priority,
        description: description.to_string(),
        activities: activities.iter().map(|a| a.to_string()).collect(),
        domain,
    }
}

fn strength(domain: Domain, description: &str) -> Recommendation {
    recommendation(
        domain,
        RecommendationType::Strength,
        Priority::Baixa,
        description,
        &[],
    )
}

fn accuracy(metrics: &SessionMetrics) -> f64 {
    metrics.accuracy.clamp(0.0, 100.0)
}

fn consistency(metrics: &SessionMetrics) -> f64 {
    metrics.consistency.clamp(0.0, 100.0)
}

/// Inverse of impulsivity on a 0-100 scale
fn restraint(metrics: &SessionMetrics) -> f64 {
    100.0 * (1.0 - metrics.impulsivity_rate.clamp(0.0, 1.0))
}

/// Bonus for the mean response-time band; 0 without response times
fn response_band_bonus(average_ms: f64) -> f64 {
    match average_ms {
        ms if ms <= 0.0 => 0.0,
        ms if ms <= 2_000.0 => 25.0,
        ms if ms <= 4_000.0 => 18.0,
        ms if ms <= 7_000.0 => 10.0,
        ms if ms <= SLOW_RESPONSE_MS => 5.0,
        _ => 0.0,
    }
}

fn score_visual(metrics: &SessionMetrics) -> DomainScore {
    let domain = Domain::Visual;
    let error_penalty = (metrics.errors as f64).min(15.0);
    let score = 0.65 * accuracy(metrics)
        + response_band_bonus(metrics.average_response_time_ms)
        + 10.0
        - error_penalty;

    let mut recs = Vec::new();
    if score < INTERVENTION_BELOW {
        recs.push(recommendation(
            domain,
            RecommendationType::Intervention,
            Priority::Alta,
            "Reforçar a discriminação visual com estímulos de alto contraste",
            &["Jogo da memória visual", "Associação de cores e formas"],
        ));
    }
    if metrics.average_response_time_ms > SLOW_RESPONSE_MS {
        recs.push(recommendation(
            domain,
            RecommendationType::Accommodation,
            Priority::Media,
            EXTEND_RESPONSE_TIME,
            &[],
        ));
    }
    if score >= STRENGTH_FROM {
        recs.push(strength(domain, "Processamento visual é um ponto forte"));
    }
    finish(domain, score, recs)
}

fn score_auditory(metrics: &SessionMetrics) -> DomainScore {
    let domain = Domain::Auditory;
    let distraction_penalty = (metrics.distraction_events as f64 * 4.0).min(20.0);
    let score = 0.7 * accuracy(metrics)
        + 0.2 * consistency(metrics)
        + 0.1 * metrics.engagement_score.clamp(0.0, 100.0)
        - distraction_penalty;

    let mut recs = Vec::new();
    if score < INTERVENTION_BELOW {
        recs.push(recommendation(
            domain,
            RecommendationType::Intervention,
            Priority::Alta,
            "Trabalhar a discriminação auditiva com sequências sonoras curtas",
            &["Sons dos animais", "Sequência musical"],
        ));
    }
    if metrics.distraction_events >= DISTRACTION_ALERT {
        recs.push(recommendation(
            domain,
            RecommendationType::Accommodation,
            Priority::Media,
            REDUCE_DISTRACTIONS,
            &[],
        ));
    }
    if score >= STRENGTH_FROM {
        recs.push(strength(domain, "Processamento auditivo é um ponto forte"));
    }
    finish(domain, score, recs)
}

fn score_executive(metrics: &SessionMetrics) -> DomainScore {
    let domain = Domain::Executive;
    let adaptation = (metrics.learning_rate.clamp(-100.0, 100.0) + 100.0) / 2.0;
    let score = 0.5 * accuracy(metrics)
        + 0.25 * consistency(metrics)
        + 0.15 * adaptation
        + 0.1 * restraint(metrics);

    let mut recs = Vec::new();
    if score < INTERVENTION_BELOW {
        recs.push(recommendation(
            domain,
            RecommendationType::Intervention,
            Priority::Alta,
            "Exercitar planejamento e controle inibitório com tarefas em etapas",
            &["Quebra-cabeça de sequências", "Padrões lógicos"],
        ));
    }
    if metrics.impulsivity_rate > IMPULSIVITY_ALERT {
        recs.push(recommendation(
            domain,
            RecommendationType::Intervention,
            Priority::Media,
            "Introduzir uma pausa antes de cada resposta para reduzir a impulsividade",
            &["Espere o sinal"],
        ));
    }
    if metrics.learning_rate < DECLINING_LEARNING_RATE {
        recs.push(recommendation(
            domain,
            RecommendationType::Accommodation,
            Priority::Media,
            "Reduzir a complexidade das regras ao longo da sessão",
            &[],
        ));
    }
    if score >= STRENGTH_FROM {
        recs.push(strength(domain, "Funções executivas são um ponto forte"));
    }
    finish(domain, score, recs)
}

fn score_memory(metrics: &SessionMetrics) -> DomainScore {
    let domain = Domain::Memory;
    let stamina = 100.0 - metrics.fatigue_decline.clamp(0.0, 100.0);
    let gain = metrics.learning_rate.clamp(0.0, 100.0);
    let score = (accuracy(metrics) * 60.0 + stamina * 20.0 + gain * 20.0) / 100.0;

    let mut recs = Vec::new();
    if score < INTERVENTION_BELOW {
        recs.push(recommendation(
            domain,
            RecommendationType::Intervention,
            Priority::Alta,
            "Praticar memória de trabalho com sequências progressivas",
            &["Jogo da memória", "Repetir a sequência"],
        ));
    }
    if metrics.fatigue_decline >= FATIGUE_ALERT {
        recs.push(recommendation(
            domain,
            RecommendationType::Accommodation,
            Priority::Media,
            "Dividir a atividade em blocos curtos com intervalos",
            &[],
        ));
    }
    if score >= STRENGTH_FROM {
        recs.push(strength(domain, "Memória de trabalho é um ponto forte"));
    }
    finish(domain, score, recs)
}

fn score_attention(metrics: &SessionMetrics) -> DomainScore {
    let domain = Domain::Attention;
    let focus = 100.0 - (metrics.distraction_events as f64 * 15.0).min(100.0);
    let score = (focus * 30.0
        + consistency(metrics) * 30.0
        + accuracy(metrics) * 30.0
        + restraint(metrics) * 10.0)
        / 100.0;

    let mut recs = Vec::new();
    if score < INTERVENTION_BELOW {
        recs.push(recommendation(
            domain,
            RecommendationType::Intervention,
            Priority::Alta,
            "Treinar atenção sustentada com tarefas de foco progressivo",
            &["Encontre o diferente", "Caça ao alvo"],
        ));
    }
    if metrics.distraction_events >= DISTRACTION_ALERT {
        recs.push(recommendation(
            domain,
            RecommendationType::Accommodation,
            Priority::Media,
            REDUCE_DISTRACTIONS,
            &[],
        ));
    }
    if score >= STRENGTH_FROM {
        recs.push(strength(domain, "Atenção sustentada é um ponto forte"));
    }
    finish(domain, score, recs)
}

fn score_speed(metrics: &SessionMetrics) -> DomainScore {
    let domain = Domain::Speed;
    let average = metrics.average_response_time_ms;
    let pace = match average {
        ms if ms <= 0.0 => 0.0,
        ms if ms <= 1_500.0 => 100.0,
        ms if ms >= SLOW_RESPONSE_MS => 0.0,
        ms => 100.0 * (SLOW_RESPONSE_MS - ms) / (SLOW_RESPONSE_MS - 1_500.0),
    };
    let steadiness = if average > 0.0 {
        100.0 - (100.0 * metrics.response_time_variability_ms.max(0.0) / average).min(100.0)
    } else {
        0.0
    };
    let score = (pace * 50.0 + accuracy(metrics) * 35.0 + steadiness * 15.0) / 100.0;

    let mut recs = Vec::new();
    if score < INTERVENTION_BELOW {
        recs.push(recommendation(
            domain,
            RecommendationType::Intervention,
            Priority::Alta,
            "Estimular a velocidade de processamento com desafios cronometrados leves",
            &["Corrida das cores", "Toque rápido"],
        ));
    }
    if average > SLOW_RESPONSE_MS {
        recs.push(recommendation(
            domain,
            RecommendationType::Accommodation,
            Priority::Media,
            EXTEND_RESPONSE_TIME,
            &[],
        ));
    }
    if score >= STRENGTH_FROM {
        recs.push(strength(domain, "Velocidade de processamento é um ponto forte"));
    }
    finish(domain, score, recs)
}
