//! In-memory session registry
//!
//! The store owns every active session. Each session sits behind its own
//! mutex so interactions on one session are serialized while different
//! sessions proceed in parallel. The registry lock is only held long enough to
//! look up or insert a handle; lock order is always registry before session.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::{ActiveSessionPolicy, StatsConfig};
use crate::error::TelemetryError;
use crate::event::{Event, EventPayload};
use crate::types::{Difficulty, PausePattern, SessionStatus};

/// Closed sessions kept around so late interactions get `SessionClosed`
pub const DEFAULT_RETAIN_CLOSED: usize = 256;

/// Running aggregates for a session.
///
/// Fields are private: they only change when an event is appended, and
/// accuracy is always derived from the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregates {
    attempts: u32,
    successes: u32,
    errors: u32,
    response_samples: u32,
    average_response_time: f64,
    /// Welford running sum of squared deviations
    response_m2: f64,
    engagement_score: f64,
    pause_patterns: Vec<PausePattern>,
    learning_rate: f64,
    /// Events that only feed the generic counter
    other_events: u32,
    first_timestamp: Option<i64>,
    /// Sum of gaps longer than the pause threshold
    idle_ms: i64,
    /// Successes among the first `i + 1` outcome events
    #[serde(default)]
    success_prefix: Vec<u32>,
}

impl Aggregates {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn successes(&self) -> u32 {
        self.successes
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    pub fn other_events(&self) -> u32 {
        self.other_events
    }

    /// `round(100 · successes / attempts)`, 0 without attempts, never above 100
    pub fn accuracy(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        let successes = self.successes.min(self.attempts);
        (100.0 * successes as f64 / self.attempts as f64).round()
    }

    pub fn average_response_time(&self) -> f64 {
        self.average_response_time
    }

    /// Population variance of response times
    pub fn response_latency_variance(&self) -> f64 {
        if self.response_samples < 2 {
            return 0.0;
        }
        self.response_m2 / self.response_samples as f64
    }

    pub fn engagement_score(&self) -> f64 {
        self.engagement_score
    }

    pub fn pause_patterns(&self) -> &[PausePattern] {
        &self.pause_patterns
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Fold a newly appended event into the aggregates in constant time.
    /// `events` already contains it as its last element.
    fn observe(&mut self, events: &[Event], config: &StatsConfig) {
        let Some(event) = events.last() else {
            return;
        };

        if event.is_attempt() {
            self.attempts += 1;
        }
        match event.outcome() {
            Some(true) => self.successes += 1,
            Some(false) => self.errors += 1,
            None if !event.is_attempt() => self.other_events += 1,
            None => {}
        }
        if let Some(success) = event.outcome() {
            let before = self.success_prefix.last().copied().unwrap_or(0);
            self.success_prefix.push(before + u32::from(success));
            self.learning_rate = self.prefix_trend(config.trend_min_events);
        }

        if let Some(rt) = event.response_time_ms() {
            self.response_samples += 1;
            let delta = rt - self.average_response_time;
            self.average_response_time += delta / self.response_samples as f64;
            self.response_m2 += delta * (rt - self.average_response_time);
        }

        if let [.., previous, last] = events {
            let gap = last.timestamp - previous.timestamp;
            if gap > config.pause_gap_ms {
                self.idle_ms += gap;
                self.pause_patterns.push(PausePattern {
                    after_index: events.len() - 2,
                    duration_ms: gap,
                });
            }
        }

        let first = *self.first_timestamp.get_or_insert(event.timestamp);
        let span = (event.timestamp - first).max(0);
        self.engagement_score = if span == 0 {
            0.0
        } else {
            let idle = (self.idle_ms as f64 / span as f64).clamp(0.0, 1.0);
            (100.0 * (1.0 - idle)).clamp(0.0, 100.0)
        };
    }

    /// Accuracy change between the first and last thirds of the outcomes
    fn prefix_trend(&self, min_events: usize) -> f64 {
        let n = self.success_prefix.len();
        if n < min_events.max(3) {
            return 0.0;
        }
        let width = n / 3;
        let successes_before = |end: usize| if end == 0 { 0 } else { self.success_prefix[end - 1] };
        let first = successes_before(width) as f64 / width as f64;
        let last = (successes_before(n) - successes_before(n - width)) as f64 / width as f64;
        ((last - first) * 100.0).clamp(-100.0, 100.0)
    }
}

/// One play-through of an activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    session_id: String,
    user_id: String,
    activity_id: String,
    difficulty: Difficulty,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    status: SessionStatus,
    last_activity_at: DateTime<Utc>,
    aggregates: Aggregates,
    events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    final_payload: Map<String, Value>,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        activity_id: impl Into<String>,
        difficulty: Difficulty,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            activity_id: activity_id.into(),
            difficulty,
            start_time: now,
            end_time: None,
            status: SessionStatus::Active,
            last_activity_at: now,
            aggregates: Aggregates::default(),
            events: Vec::new(),
            final_payload: Map::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    pub fn difficulty(&self) -> Difficulty {
        self.difficulty
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    pub fn aggregates(&self) -> &Aggregates {
        &self.aggregates
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn final_payload(&self) -> &Map<String, Value> {
        &self.final_payload
    }

    /// Append an event and update aggregates in one step
    pub fn record(
        &mut self,
        event: Event,
        now: DateTime<Utc>,
        config: &StatsConfig,
    ) -> Result<(), TelemetryError> {
        if !self.is_active() {
            return Err(TelemetryError::SessionClosed(self.session_id.clone()));
        }
        if let EventPayload::DifficultyChange(change) = &event.payload {
            self.difficulty = change.difficulty;
        }
        self.events.push(event);
        self.aggregates.observe(&self.events, config);
        self.last_activity_at = now;
        Ok(())
    }

    /// Freeze the session. Fails if it is already closed.
    pub fn finalize(
        &mut self,
        status: SessionStatus,
        final_payload: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<(), TelemetryError> {
        if !self.is_active() {
            return Err(TelemetryError::SessionClosed(self.session_id.clone()));
        }
        self.status = status;
        self.end_time = Some(now);
        self.final_payload = final_payload;
        Ok(())
    }
}

type SessionHandle = Arc<Mutex<Session>>;

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, SessionHandle>,
    /// (user_id, activity_id) -> active session id
    active_by_owner: HashMap<(String, String), String>,
    closed_order: VecDeque<String>,
}

/// Thread-safe registry of sessions
pub struct SessionStore {
    registry: RwLock<Registry>,
    policy: ActiveSessionPolicy,
    stats: StatsConfig,
    retain_closed: usize,
}

fn lock(handle: &SessionHandle) -> MutexGuard<'_, Session> {
    handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionStore {
    pub fn new(policy: ActiveSessionPolicy, stats: StatsConfig) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            policy,
            stats,
            retain_closed: DEFAULT_RETAIN_CLOSED,
        }
    }

    pub fn with_retain_closed(mut self, retain_closed: usize) -> Self {
        self.retain_closed = retain_closed;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self, session_id: &str) -> Result<SessionHandle, TelemetryError> {
        self.read()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| TelemetryError::SessionNotFound(session_id.to_string()))
    }

    /// Open a session, or apply the duplicate policy if the owner already has one
    pub fn start_session(
        &self,
        user_id: &str,
        activity_id: &str,
        difficulty: Difficulty,
        now: DateTime<Utc>,
    ) -> Result<String, TelemetryError> {
        let mut registry = self.write();
        let owner = (user_id.to_string(), activity_id.to_string());

        if let Some(existing_id) = registry.active_by_owner.get(&owner).cloned() {
            let still_active = registry
                .sessions
                .get(&existing_id)
                .is_some_and(|handle| lock(handle).is_active());

            if still_active {
                return match self.policy {
                    ActiveSessionPolicy::Resume => {
                        tracing::debug!(
                            target: "session",
                            session_id = %existing_id,
                            user_id,
                            activity_id,
                            "resuming active session"
                        );
                        Ok(existing_id)
                    }
                    ActiveSessionPolicy::Reject => Err(TelemetryError::DuplicateActiveSession {
                        user_id: user_id.to_string(),
                        activity_id: activity_id.to_string(),
                        session_id: existing_id,
                    }),
                };
            }
            registry.active_by_owner.remove(&owner);
        }

        let session = Session::new(user_id, activity_id, difficulty, now);
        let session_id = session.session_id().to_string();
        registry
            .sessions
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));
        registry.active_by_owner.insert(owner, session_id.clone());

        tracing::info!(
            target: "session",
            session_id = %session_id,
            user_id,
            activity_id,
            ?difficulty,
            "session started"
        );
        Ok(session_id)
    }

    /// Append a validated event to an active session
    pub fn record(
        &self,
        session_id: &str,
        event: Event,
        now: DateTime<Utc>,
    ) -> Result<(), TelemetryError> {
        let handle = self.handle(session_id)?;
        let mut session = lock(&handle);
        session.record(event, now, &self.stats)
    }

    /// Close an active session and return its frozen value
    pub fn finalize(
        &self,
        session_id: &str,
        status: SessionStatus,
        final_payload: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Session, TelemetryError> {
        let handle = self.handle(session_id)?;
        let frozen = {
            let mut session = lock(&handle);
            session.finalize(status, final_payload, now)?;
            session.clone()
        };

        let mut registry = self.write();
        let owner = (frozen.user_id().to_string(), frozen.activity_id().to_string());
        if registry.active_by_owner.get(&owner).map(String::as_str) == Some(session_id) {
            registry.active_by_owner.remove(&owner);
        }
        registry.closed_order.push_back(session_id.to_string());
        while registry.closed_order.len() > self.retain_closed {
            if let Some(evicted) = registry.closed_order.pop_front() {
                registry.sessions.remove(&evicted);
            }
        }

        tracing::info!(
            target: "session",
            session_id,
            status = ?frozen.status(),
            events = frozen.events().len(),
            "session finalized"
        );
        Ok(frozen)
    }

    /// Clone of a session's current state
    pub fn snapshot(&self, session_id: &str) -> Result<Session, TelemetryError> {
        let handle = self.handle(session_id)?;
        let session = lock(&handle).clone();
        Ok(session)
    }

    /// Clones of every active session, taken one lock at a time
    pub fn active_snapshots(&self) -> Vec<Session> {
        let handles: Vec<SessionHandle> = self.read().sessions.values().cloned().collect();
        handles
            .iter()
            .filter_map(|handle| {
                let session = lock(handle);
                session.is_active().then(|| session.clone())
            })
            .collect()
    }

    /// Ids of active sessions with no interaction for longer than `timeout`
    pub fn inactive_sessions(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let handles: Vec<SessionHandle> = self.read().sessions.values().cloned().collect();
        handles
            .iter()
            .filter_map(|handle| {
                let session = lock(handle);
                (session.is_active() && now - session.last_activity_at() > timeout)
                    .then(|| session.session_id().to_string())
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.read().active_by_owner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::stats;
    use crate::event::{parse_event, ErrorPayload, ResponsePayload};
    use chrono::TimeZone;
    use serde_json::json;
    use std::thread;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
    }

    fn store(policy: ActiveSessionPolicy) -> SessionStore {
        SessionStore::new(policy, StatsConfig::default())
    }

    fn attempt(ts: i64) -> Event {
        Event::new(ts, EventPayload::Attempt(ResponsePayload::default()))
    }

    fn success(ts: i64, rt: f64) -> Event {
        Event::new(
            ts,
            EventPayload::Success(ResponsePayload {
                response_time_ms: Some(rt),
                ..Default::default()
            }),
        )
    }

    fn error(ts: i64) -> Event {
        Event::new(ts, EventPayload::Error(ErrorPayload::default()))
    }

    #[test]
    fn test_accuracy_scenario() {
        let store = store(ActiveSessionPolicy::Reject);
        let id = store
            .start_session("u1", "memory", Difficulty::Easy, now())
            .unwrap();

        let events = [
            attempt(1_000),
            error(2_000),
            attempt(3_000),
            success(4_000, 900.0),
            attempt(5_000),
            success(6_000, 1_100.0),
            attempt(7_000),
            success(8_000, 1_000.0),
        ];
        for event in events {
            store.record(&id, event, now()).unwrap();
        }

        let session = store.snapshot(&id).unwrap();
        let agg = session.aggregates();
        assert_eq!(agg.attempts(), 4);
        assert_eq!(agg.successes(), 3);
        assert_eq!(agg.errors(), 1);
        assert_eq!(agg.accuracy(), 75.0);
        assert!((agg.average_response_time() - 1_000.0).abs() < 1e-9);
        let expected_variance = (100.0f64.powi(2) * 2.0) / 3.0;
        assert!((agg.response_latency_variance() - expected_variance).abs() < 1e-6);
    }

    #[test]
    fn test_running_aggregates_match_full_recompute() {
        let mut session = Session::new("u", "a", Difficulty::Easy, now());
        let config = StatsConfig::default();
        let mut ts = 0;
        for i in 0..40 {
            ts += if i % 7 == 0 { 9_000 } else { 1_500 };
            let event = match i % 5 {
                0 => attempt(ts),
                1 | 2 if i > 20 => error(ts),
                _ => success(ts, 800.0),
            };
            session.record(event, now(), &config).unwrap();

            let agg = session.aggregates();
            let events = session.events();
            assert!(
                (agg.engagement_score() - stats::engagement_score(events, config.pause_gap_ms)).abs() < 1e-9
            );
            assert!(
                (agg.learning_rate()
                    - stats::learning_trend(&stats::outcomes(events), config.trend_min_events))
                .abs()
                    < 1e-9
            );
        }
        assert!(session.aggregates().learning_rate() < 0.0);
    }

    #[test]
    fn test_accuracy_zero_without_attempts() {
        let agg = Aggregates::default();
        assert_eq!(agg.accuracy(), 0.0);
    }

    #[test]
    fn test_accuracy_capped_when_successes_exceed_attempts() {
        let mut session = Session::new("u", "a", Difficulty::Easy, now());
        let config = StatsConfig::default();
        session.record(attempt(1), now(), &config).unwrap();
        session.record(success(2, 10.0), now(), &config).unwrap();
        session.record(success(3, 10.0), now(), &config).unwrap();
        assert_eq!(session.aggregates().accuracy(), 100.0);
    }

    #[test]
    fn test_unknown_events_count_generically() {
        let mut session = Session::new("u", "a", Difficulty::Easy, now());
        let config = StatsConfig::default();
        let event = parse_event("hint", json!({"timestamp": 5}).as_object().unwrap(), 8).unwrap();
        session.record(event, now(), &config).unwrap();
        assert_eq!(session.aggregates().other_events(), 1);
        assert_eq!(session.aggregates().attempts(), 0);
    }

    #[test]
    fn test_difficulty_change_updates_session() {
        let mut session = Session::new("u", "a", Difficulty::Easy, now());
        let event = parse_event(
            "difficulty_change",
            json!({"timestamp": 5, "difficulty": "hard"}).as_object().unwrap(),
            8,
        )
        .unwrap();
        session
            .record(event, now(), &StatsConfig::default())
            .unwrap();
        assert_eq!(session.difficulty(), Difficulty::Hard);
    }

    #[test]
    fn test_pause_patterns_tracked() {
        let mut session = Session::new("u", "a", Difficulty::Easy, now());
        let config = StatsConfig::default();
        session.record(attempt(0), now(), &config).unwrap();
        session.record(attempt(1_000), now(), &config).unwrap();
        session.record(attempt(20_000), now(), &config).unwrap();
        assert_eq!(
            session.aggregates().pause_patterns(),
            &[PausePattern {
                after_index: 1,
                duration_ms: 19_000
            }]
        );
    }

    #[test]
    fn test_duplicate_policy_reject() {
        let store = store(ActiveSessionPolicy::Reject);
        let first = store
            .start_session("u1", "memory", Difficulty::Easy, now())
            .unwrap();
        let err = store
            .start_session("u1", "memory", Difficulty::Easy, now())
            .unwrap_err();
        match err {
            TelemetryError::DuplicateActiveSession { session_id, .. } => {
                assert_eq!(session_id, first)
            }
            other => panic!("unexpected error {other:?}"),
        }

        // Different activity is fine
        assert!(store
            .start_session("u1", "colors", Difficulty::Easy, now())
            .is_ok());
    }

    #[test]
    fn test_duplicate_policy_resume() {
        let store = store(ActiveSessionPolicy::Resume);
        let first = store
            .start_session("u1", "memory", Difficulty::Easy, now())
            .unwrap();
        let second = store
            .start_session("u1", "memory", Difficulty::Hard, now())
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.active_count(), 1);
    }

    #[test]
    fn test_new_session_allowed_after_finalize() {
        let store = store(ActiveSessionPolicy::Reject);
        let first = store
            .start_session("u1", "memory", Difficulty::Easy, now())
            .unwrap();
        store
            .finalize(&first, SessionStatus::Completed, Map::new(), now())
            .unwrap();
        let second = store
            .start_session("u1", "memory", Difficulty::Easy, now())
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_record_on_closed_session() {
        let store = store(ActiveSessionPolicy::Reject);
        let id = store
            .start_session("u1", "memory", Difficulty::Easy, now())
            .unwrap();
        store.record(&id, attempt(1), now()).unwrap();
        let frozen = store
            .finalize(&id, SessionStatus::Completed, Map::new(), now())
            .unwrap();

        let err = store.record(&id, success(2, 100.0), now()).unwrap_err();
        assert!(matches!(err, TelemetryError::SessionClosed(_)));

        let after = store.snapshot(&id).unwrap();
        assert_eq!(after.aggregates(), frozen.aggregates());
        assert_eq!(after.events().len(), 1);
    }

    #[test]
    fn test_finalize_twice_fails() {
        let store = store(ActiveSessionPolicy::Reject);
        let id = store
            .start_session("u1", "memory", Difficulty::Easy, now())
            .unwrap();
        store
            .finalize(&id, SessionStatus::Completed, Map::new(), now())
            .unwrap();
        let err = store
            .finalize(&id, SessionStatus::Completed, Map::new(), now())
            .unwrap_err();
        assert!(matches!(err, TelemetryError::SessionClosed(_)));
    }

    #[test]
    fn test_unknown_session() {
        let store = store(ActiveSessionPolicy::Reject);
        let err = store.record("nope", attempt(1), now()).unwrap_err();
        assert!(matches!(err, TelemetryError::SessionNotFound(_)));
    }

    #[test]
    fn test_closed_sessions_evicted() {
        let store = store(ActiveSessionPolicy::Reject).with_retain_closed(1);
        let a = store.start_session("u1", "a", Difficulty::Easy, now()).unwrap();
        let b = store.start_session("u1", "b", Difficulty::Easy, now()).unwrap();
        store
            .finalize(&a, SessionStatus::Completed, Map::new(), now())
            .unwrap();
        store
            .finalize(&b, SessionStatus::Completed, Map::new(), now())
            .unwrap();

        assert!(matches!(
            store.snapshot(&a),
            Err(TelemetryError::SessionNotFound(_))
        ));
        assert!(store.snapshot(&b).is_ok());
    }

    #[test]
    fn test_inactive_sessions() {
        let store = store(ActiveSessionPolicy::Reject);
        let stale = store.start_session("u1", "a", Difficulty::Easy, now()).unwrap();
        let fresh = store.start_session("u2", "a", Difficulty::Easy, now()).unwrap();
        store
            .record(&fresh, attempt(1), now() + Duration::minutes(20))
            .unwrap();

        let ids = store.inactive_sessions(now() + Duration::minutes(21), Duration::minutes(15));
        assert_eq!(ids, vec![stale]);
    }

    #[test]
    fn test_concurrent_recording() {
        let store = Arc::new(store(ActiveSessionPolicy::Reject));
        let ids: Vec<String> = (0..4)
            .map(|i| {
                store
                    .start_session(&format!("u{i}"), "memory", Difficulty::Easy, now())
                    .unwrap()
            })
            .collect();

        let workers: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for ts in 0..100 {
                        store.record(&id, attempt(ts), now()).unwrap();
                        store.record(&id, success(ts, 500.0), now()).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        for id in ids {
            let session = store.snapshot(&id).unwrap();
            assert_eq!(session.events().len(), 200);
            assert_eq!(session.aggregates().accuracy(), 100.0);
        }
    }
}
