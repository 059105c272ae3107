//! Engine facade
//!
//! This module provides the public API for Cogniflux. It owns the session
//! store, runs analysis when sessions end, hands finished records to the
//! persistence worker and drives the background monitor.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::analysis::stats::WindowedStats;
use crate::analysis::{ProgressionTracker, ReportAssembler, RuleBasedScoring, ScoringStrategy};
use crate::config::EngineConfig;
use crate::error::TelemetryError;
use crate::event::parse_event;
use crate::persistence::{
    InMemoryGateway, JsonFileGateway, PersistenceGateway, PersistenceHandle, PersistenceWorker,
    ReportCache, RetryPolicy, SessionRecord,
};
use crate::sanitize::bound_map;
use crate::session::{SessionStore, DEFAULT_RETAIN_CLOSED};
use crate::types::{AnalysisReport, Difficulty, LiveSignals, SessionStatus, SessionSummary};
use crate::{ENGINE_VERSION, PRODUCER_NAME};

/// Fatigue decline, in points, that raises an early warning
const WARN_FATIGUE: f64 = 30.0;

/// Distraction count that raises an early warning
const WARN_DISTRACTIONS: u32 = 3;

/// Extra records requested from gateways when filtering by activity
const ACTIVITY_OVERFETCH: usize = 5;

type ReportSlot = Arc<OnceCell<AnalysisReport>>;

/// Behavioral telemetry engine.
///
/// Interactions are recorded synchronously; ending a session analyzes it in
/// place and returns the report while persistence continues in the
/// background. Must be constructed inside a tokio runtime.
pub struct TelemetryEngine {
    config: EngineConfig,
    store: SessionStore,
    assembler: ReportAssembler,
    gateway: Arc<dyn PersistenceGateway>,
    fallback: Arc<dyn PersistenceGateway>,
    persistence: PersistenceHandle,
    /// Reports of ended sessions; one slot per session so concurrent ends share a result
    finished: Mutex<ReportCache<ReportSlot>>,
    live: RwLock<HashMap<String, LiveSignals>>,
}

impl TelemetryEngine {
    /// Create an engine backed by `gateway`.
    ///
    /// The local fallback is a JSON file store under
    /// `persistence.fallback_dir` when configured, otherwise in-memory.
    pub async fn new(
        config: EngineConfig,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Result<Self, TelemetryError> {
        config.validate()?;

        let fallback: Arc<dyn PersistenceGateway> = match &config.persistence.fallback_dir {
            Some(dir) => Arc::new(JsonFileGateway::new(dir).await?),
            None => Arc::new(InMemoryGateway::new()),
        };

        let persistence = PersistenceWorker::spawn(
            Arc::clone(&gateway),
            Arc::clone(&fallback),
            RetryPolicy::from_config(&config.persistence),
            config.persistence.cache_capacity,
        );

        let store = SessionStore::new(config.session.active_session_policy, config.stats.clone());
        let assembler = Self::build_assembler(&config, Arc::new(RuleBasedScoring));

        tracing::info!(
            target: "engine",
            producer = PRODUCER_NAME,
            version = ENGINE_VERSION,
            policy = ?config.session.active_session_policy,
            local_fallback = config.persistence.fallback_dir.is_some(),
            "telemetry engine ready"
        );

        Ok(Self {
            config,
            store,
            assembler,
            gateway,
            fallback,
            persistence,
            finished: Mutex::new(ReportCache::new(DEFAULT_RETAIN_CLOSED)),
            live: RwLock::new(HashMap::new()),
        })
    }

    /// Replace the rule-based scoring model
    pub fn with_scoring(mut self, scoring: Arc<dyn ScoringStrategy>) -> Self {
        self.assembler = Self::build_assembler(&self.config, scoring);
        self
    }

    fn build_assembler(config: &EngineConfig, scoring: Arc<dyn ScoringStrategy>) -> ReportAssembler {
        ReportAssembler::new(
            scoring,
            ProgressionTracker::new(
                config.persistence.history_lookback_days,
                config.persistence.history_limit,
            ),
            config.stats.clone(),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn persistence(&self) -> &PersistenceHandle {
        &self.persistence
    }

    pub fn active_sessions(&self) -> usize {
        self.store.active_count()
    }

    fn finished(&self) -> MutexGuard<'_, ReportCache<ReportSlot>> {
        self.finished.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a session for a user on an activity
    pub fn start_session(
        &self,
        user_id: &str,
        activity_id: &str,
        difficulty: Difficulty,
    ) -> Result<String, TelemetryError> {
        if user_id.trim().is_empty() {
            return Err(TelemetryError::MissingField("userId".to_string()));
        }
        if activity_id.trim().is_empty() {
            return Err(TelemetryError::MissingField("activityId".to_string()));
        }

        let result = self
            .store
            .start_session(user_id, activity_id, difficulty, Utc::now());
        if let Err(e) = &result {
            tracing::warn!(target: "engine", user_id, activity_id, error = %e, "session start rejected");
        }
        result
    }

    /// Validate and record one interaction.
    ///
    /// Rejections are logged and returned; the session stays usable.
    pub fn record_interaction(
        &self,
        session_id: &str,
        event_type: &str,
        payload: &Map<String, Value>,
    ) -> Result<(), TelemetryError> {
        let result = parse_event(event_type, payload, self.config.serialization.max_depth)
            .and_then(|event| self.store.record(session_id, event, Utc::now()));

        if let Err(e) = &result {
            tracing::warn!(target: "engine", session_id, event_type, error = %e, "interaction rejected");
        }
        result
    }

    /// Finalize a session and return its analysis.
    ///
    /// Calling this again for the same session returns the same report.
    pub async fn end_session(
        &self,
        session_id: &str,
        extra: Map<String, Value>,
    ) -> Result<AnalysisReport, TelemetryError> {
        self.close(session_id, SessionStatus::Completed, extra, Utc::now())
            .await
    }

    async fn close(
        &self,
        session_id: &str,
        status: SessionStatus,
        extra: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<AnalysisReport, TelemetryError> {
        let slot = {
            let mut finished = self.finished();
            let existing = finished.get(session_id).cloned();
            match existing {
                Some(slot) => slot,
                None => {
                    let slot: ReportSlot = Arc::new(OnceCell::new());
                    finished.insert(session_id, Arc::clone(&slot));
                    slot
                }
            }
        };

        let result = slot
            .get_or_try_init(|| self.analyze(session_id, status, extra, now))
            .await
            .cloned();

        if result.is_err() {
            let mut finished = self.finished();
            if finished
                .get(session_id)
                .is_some_and(|cached| Arc::ptr_eq(cached, &slot) && cached.get().is_none())
            {
                finished.remove(session_id);
            }
        }
        result
    }

    async fn analyze(
        &self,
        session_id: &str,
        status: SessionStatus,
        extra: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<AnalysisReport, TelemetryError> {
        // close before any I/O so late interactions are rejected at once
        let extra = bound_map(&extra, self.config.serialization.max_depth);
        let session = match self.store.finalize(session_id, status, extra, now) {
            Ok(session) => session,
            // closed by an earlier end that was dropped before its report was ready
            Err(TelemetryError::SessionClosed(_)) => self.store.snapshot(session_id)?,
            Err(e) => return Err(e),
        };
        let now = session.end_time().unwrap_or(now);

        let since = self.assembler.tracker().since(now);
        let prior = self
            .collect_records(
                session.user_id(),
                Some(session.activity_id()),
                since,
                self.config.persistence.history_limit,
            )
            .await;
        let history: Vec<SessionSummary> = prior.iter().map(|r| r.summary.clone()).collect();
        let prior_reports: Vec<AnalysisReport> = prior.into_iter().map(|r| r.report).collect();
        let report = self
            .assembler
            .assemble_with_prior(&session, &history, &prior_reports, now);

        self.live
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);

        let record = SessionRecord {
            summary: ReportAssembler::summarize(&session, &report),
            report: report.clone(),
            events: session.events().to_vec(),
        };
        self.persistence.submit(record);

        tracing::info!(
            target: "engine",
            session_id,
            status = ?session.status(),
            accuracy = report.metrics.accuracy,
            overall = report.overall_score,
            trend = ?report.progression_trend,
            "session analyzed"
        );
        Ok(report)
    }

    /// Recent sessions for a user, newest first
    pub async fn get_user_history(
        &self,
        user_id: &str,
        activity_filter: Option<&str>,
        limit: usize,
    ) -> Vec<SessionSummary> {
        self.collect_records(user_id, activity_filter, DateTime::<Utc>::MIN_UTC, limit)
            .await
            .into_iter()
            .map(|r| r.summary)
            .collect()
    }

    /// Records from one gateway, or nothing if it fails or stalls
    async fn load_from(
        &self,
        source: &'static str,
        gateway: &dyn PersistenceGateway,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Vec<SessionRecord> {
        let wait = Duration::from_millis(self.config.persistence.history_timeout_ms);
        match tokio::time::timeout(wait, gateway.load_recent_sessions(user_id, since, limit)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                tracing::warn!(target: "engine", user_id, source, error = %e, "history unavailable");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(
                    target: "engine",
                    user_id,
                    source,
                    timeout_ms = self.config.persistence.history_timeout_ms,
                    "history source timed out"
                );
                Vec::new()
            }
        }
    }

    /// Merge primary, local fallback and unsaved records, deduplicated by
    /// session, newest first
    async fn collect_records(
        &self,
        user_id: &str,
        activity_filter: Option<&str>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Vec<SessionRecord> {
        let fetch = match activity_filter {
            Some(_) => limit.saturating_mul(ACTIVITY_OVERFETCH),
            None => limit,
        };

        let (primary, fallback) = tokio::join!(
            self.load_from("primary", self.gateway.as_ref(), user_id, since, fetch),
            self.load_from("fallback", self.fallback.as_ref(), user_id, since, fetch),
        );
        let pending = self
            .persistence
            .pending()
            .into_iter()
            .filter(|r| r.user_id() == user_id && r.summary.end_time >= since);

        let mut seen = HashSet::new();
        let mut records: Vec<SessionRecord> = primary
            .into_iter()
            .chain(fallback)
            .chain(pending)
            .filter(|r| activity_filter.map_or(true, |a| r.summary.activity_id == a))
            .filter(|r| seen.insert(r.session_id().to_string()))
            .collect();

        records.sort_by(|a, b| b.summary.end_time.cmp(&a.summary.end_time));
        records.truncate(limit);
        records
    }

    /// Latest monitor signals for an active session
    pub fn live_signals(&self, session_id: &str) -> Option<LiveSignals> {
        self.live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    /// Recompute live signals for every active session, then sweep inactive ones
    pub async fn monitor_tick(&self, now: DateTime<Utc>) {
        let sessions = self.store.active_snapshots();
        let active: HashSet<&str> = sessions.iter().map(|s| s.session_id()).collect();

        let mut updated = Vec::with_capacity(sessions.len());
        for session in &sessions {
            let stats = WindowedStats::compute(session.events(), &self.config.stats);
            let prior = self.live_signals(session.session_id());

            // too few events keeps the previous fatigue reading
            let fatigue_decline = stats
                .fatigue_decline
                .or_else(|| prior.as_ref().map(|p| p.fatigue_decline))
                .unwrap_or(0.0);

            let signals = LiveSignals {
                session_id: session.session_id().to_string(),
                fatigue_decline,
                distraction_events: stats.distraction_events,
                consistency: stats.consistency,
                event_count: session.events().len(),
                computed_at: now,
            };
            Self::log_early_warnings(prior.as_ref(), &signals);
            updated.push(signals);
        }

        {
            let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
            live.retain(|id, _| active.contains(id.as_str()));
            for signals in updated {
                live.insert(signals.session_id.clone(), signals);
            }
        }

        tracing::debug!(target: "monitor", active = sessions.len(), "monitor tick");
        self.sweep_inactive(now).await;
    }

    fn log_early_warnings(prior: Option<&LiveSignals>, current: &LiveSignals) {
        let was_fatigued = prior.is_some_and(|p| p.fatigue_decline >= WARN_FATIGUE);
        if current.fatigue_decline >= WARN_FATIGUE && !was_fatigued {
            tracing::info!(
                target: "monitor",
                session_id = %current.session_id,
                fatigue_decline = current.fatigue_decline,
                "fatigue detected"
            );
        }

        let was_distracted = prior.is_some_and(|p| p.distraction_events >= WARN_DISTRACTIONS);
        if current.distraction_events >= WARN_DISTRACTIONS && !was_distracted {
            tracing::info!(
                target: "monitor",
                session_id = %current.session_id,
                distraction_events = current.distraction_events,
                "repeated distractions detected"
            );
        }
    }

    /// Finalize sessions idle past the inactivity timeout as abandoned
    pub async fn sweep_inactive(&self, now: DateTime<Utc>) -> Vec<AnalysisReport> {
        let timeout = i64::try_from(self.config.session.inactivity_timeout_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);

        let mut abandoned = Vec::new();
        for session_id in self.store.inactive_sessions(now, timeout) {
            match self
                .close(&session_id, SessionStatus::Abandoned, Map::new(), now)
                .await
            {
                Ok(report) => {
                    tracing::info!(target: "monitor", session_id = %session_id, "inactive session abandoned");
                    abandoned.push(report);
                }
                // ended by the user in the meantime
                Err(e) => {
                    tracing::debug!(target: "monitor", session_id = %session_id, error = %e, "sweep skipped session")
                }
            }
        }
        abandoned
    }

    /// Run [`monitor_tick`](Self::monitor_tick) on the configured interval.
    ///
    /// The task holds a weak reference and stops once the engine is dropped.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.monitor.interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.monitor_tick(Utc::now()).await;
            }
            tracing::debug!(target: "monitor", "monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    async fn engine() -> TelemetryEngine {
        TelemetryEngine::new(EngineConfig::default(), Arc::new(InMemoryGateway::new()))
            .await
            .unwrap()
    }

    fn record_round(engine: &TelemetryEngine, id: &str, ts: i64, ok: bool) {
        engine
            .record_interaction(id, "attempt", &payload(json!({ "timestamp": ts })))
            .unwrap();
        let kind = if ok { "success" } else { "error" };
        engine
            .record_interaction(
                id,
                kind,
                &payload(json!({ "timestamp": ts + 900, "responseTime": 900 })),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_session_requires_ids() {
        let engine = engine().await;
        assert!(matches!(
            engine.start_session("", "memory", Difficulty::Easy),
            Err(TelemetryError::MissingField(_))
        ));
        assert!(matches!(
            engine.start_session("u1", " ", Difficulty::Easy),
            Err(TelemetryError::MissingField(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_error_keeps_session_alive() {
        let engine = engine().await;
        let id = engine.start_session("u1", "memory", Difficulty::Easy).unwrap();

        let bad = engine.record_interaction(&id, "success", &payload(json!({ "responseTime": 100 })));
        assert!(bad.unwrap_err().is_validation());

        record_round(&engine, &id, 1_700_000_000_000, true);
        let report = engine.end_session(&id, Map::new()).await.unwrap();
        assert_eq!(report.metrics.attempts, 1);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let engine = engine().await;
        let err = engine
            .record_interaction("missing", "attempt", &payload(json!({ "timestamp": 1 })))
            .unwrap_err();
        assert!(matches!(err, TelemetryError::SessionNotFound(_)));

        let err = engine.end_session("missing", Map::new()).await.unwrap_err();
        assert!(matches!(err, TelemetryError::SessionNotFound(_)));
        assert!(engine.finished().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_end_shares_one_report() {
        let engine = Arc::new(engine().await);
        let id = engine.start_session("u1", "memory", Difficulty::Medium).unwrap();
        for i in 0..6 {
            record_round(&engine, &id, 1_700_000_000_000 + i * 4_000, i % 2 == 0);
        }

        let (a, b) = tokio::join!(
            engine.end_session(&id, Map::new()),
            engine.end_session(&id, Map::new())
        );
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn test_monitor_tick_publishes_live_signals() {
        let engine = engine().await;
        let id = engine.start_session("u1", "memory", Difficulty::Medium).unwrap();
        for i in 0..12 {
            record_round(&engine, &id, 1_700_000_000_000 + i * 4_000, i < 6);
        }

        engine.monitor_tick(Utc::now()).await;
        let signals = engine.live_signals(&id).unwrap();
        assert_eq!(signals.fatigue_decline, 100.0);
        assert_eq!(signals.event_count, 24);

        engine.end_session(&id, Map::new()).await.unwrap();
        assert!(engine.live_signals(&id).is_none());
    }

    #[tokio::test]
    async fn test_live_fatigue_keeps_prior_value_when_too_few_events() {
        let engine = engine().await;
        let id = engine.start_session("u1", "memory", Difficulty::Medium).unwrap();
        engine.live.write().unwrap().insert(
            id.clone(),
            LiveSignals {
                session_id: id.clone(),
                fatigue_decline: 42.0,
                distraction_events: 0,
                consistency: 100.0,
                event_count: 0,
                computed_at: Utc::now(),
            },
        );
        record_round(&engine, &id, 1_700_000_000_000, true);

        engine.monitor_tick(Utc::now()).await;
        assert_eq!(engine.live_signals(&id).unwrap().fatigue_decline, 42.0);
    }

    #[tokio::test]
    async fn test_sweep_abandons_idle_sessions() {
        let engine = engine().await;
        let idle = engine.start_session("u1", "memory", Difficulty::Easy).unwrap();

        assert!(engine.sweep_inactive(Utc::now()).await.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(901);
        let swept = engine.sweep_inactive(later).await;
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].status, SessionStatus::Abandoned);

        // ending after the sweep returns the abandoned report
        let report = engine.end_session(&idle, Map::new()).await.unwrap();
        assert_eq!(report, swept[0]);
        assert_eq!(engine.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_extreme_time_settings_do_not_panic() {
        let mut engine = engine().await;
        engine.config.session.inactivity_timeout_secs = u64::MAX;
        engine.assembler = ReportAssembler::new(
            Arc::new(RuleBasedScoring),
            ProgressionTracker::new(1_000_000_000, 10),
            engine.config.stats.clone(),
        );

        let id = engine.start_session("u1", "memory", Difficulty::Easy).unwrap();
        record_round(&engine, &id, 1_700_000_000_000, true);
        assert!(engine.sweep_inactive(Utc::now()).await.is_empty());

        let report = engine.end_session(&id, Map::new()).await.unwrap();
        assert_eq!(report.metrics.attempts, 1);
    }

    #[tokio::test]
    async fn test_closed_session_without_report_is_rebuilt() {
        let engine = engine().await;
        let id = engine.start_session("u1", "memory", Difficulty::Easy).unwrap();
        record_round(&engine, &id, 1_700_000_000_000, true);

        // as if an earlier end was dropped after closing the session
        let ended = Utc::now();
        engine
            .store
            .finalize(&id, SessionStatus::Completed, Map::new(), ended)
            .unwrap();

        let report = engine.end_session(&id, Map::new()).await.unwrap();
        assert_eq!(report.timestamp, ended);
        assert_eq!(report.metrics.successes, 1);
        assert_eq!(engine.get_user_history("u1", None, 10).await.len(), 1);
    }
}
