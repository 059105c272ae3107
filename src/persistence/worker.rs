//! Background persistence with retry and local fallback
//!
//! Records are handed to the worker without blocking the caller. Each record
//! is retried against the primary gateway with exponential backoff; when
//! retries run out (or the failure is not transient) the record is written to
//! the fallback gateway instead. A record only leaves the pending cache once
//! one of the two has accepted it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::{PersistenceGateway, ReportCache, SessionRecord};
use crate::config::PersistenceConfig;

/// Exponential backoff settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay after the given failed attempt (1-based): `base · 2^(attempt-1)`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PersistenceConfig::default())
    }
}

/// Where a record ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Accepted by the primary gateway
    Saved { attempts: u32 },
    /// Primary gave up; written to the local fallback
    SavedLocally { attempts: u32 },
    /// Neither gateway accepted it; still held in the pending cache
    Retained,
}

struct Job {
    record: SessionRecord,
    reply: Option<oneshot::Sender<SaveOutcome>>,
}

type PendingCache = Arc<Mutex<ReportCache<SessionRecord>>>;

fn lock_pending(pending: &PendingCache) -> MutexGuard<'_, ReportCache<SessionRecord>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Cheap handle used to submit records to a running worker
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<Job>,
    pending: PendingCache,
}

impl PersistenceHandle {
    /// Queue a record for saving. Never blocks.
    ///
    /// Returns `false` if the worker is gone; the record then stays in the
    /// pending cache.
    pub fn submit(&self, record: SessionRecord) -> bool {
        self.enqueue(record, None)
    }

    /// Queue a record and wait for its outcome
    pub async fn save(&self, record: SessionRecord) -> SaveOutcome {
        let (reply, outcome) = oneshot::channel();
        if !self.enqueue(record, Some(reply)) {
            return SaveOutcome::Retained;
        }
        outcome.await.unwrap_or(SaveOutcome::Retained)
    }

    fn enqueue(&self, record: SessionRecord, reply: Option<oneshot::Sender<SaveOutcome>>) -> bool {
        let session_id = record.session_id().to_string();
        if let Some((evicted, _)) = lock_pending(&self.pending).insert(session_id.clone(), record.clone()) {
            tracing::warn!(target: "persistence", session_id = %evicted, "Pending cache full, dropped oldest unsaved record");
        }

        match self.tx.send(Job { record, reply }) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(target: "persistence", session_id = %session_id, "Persistence worker stopped, record kept in memory");
                false
            }
        }
    }

    /// Records not yet accepted by any gateway, oldest first
    pub fn pending(&self) -> Vec<SessionRecord> {
        lock_pending(&self.pending).values().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }
}

/// Spawns the background persistence loop
pub struct PersistenceWorker {
    primary: Arc<dyn PersistenceGateway>,
    fallback: Arc<dyn PersistenceGateway>,
    policy: RetryPolicy,
    pending: PendingCache,
}

impl PersistenceWorker {
    /// Start the worker on the current tokio runtime.
    ///
    /// Must be called from within a runtime context.
    pub fn spawn(
        primary: Arc<dyn PersistenceGateway>,
        fallback: Arc<dyn PersistenceGateway>,
        policy: RetryPolicy,
        cache_capacity: usize,
    ) -> PersistenceHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: PendingCache = Arc::new(Mutex::new(ReportCache::new(cache_capacity)));

        let worker = Arc::new(Self {
            primary,
            fallback,
            policy,
            pending: Arc::clone(&pending),
        });
        tokio::spawn(worker.run(rx));

        PersistenceHandle { tx, pending }
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            // records retry independently of each other
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                let outcome = worker.persist(&job.record).await;
                if let Some(reply) = job.reply {
                    let _ = reply.send(outcome);
                }
            });
        }
        tracing::debug!(target: "persistence", "Persistence worker stopped");
    }

    async fn persist(&self, record: &SessionRecord) -> SaveOutcome {
        let session_id = record.session_id();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.primary.save_session(record).await {
                Ok(()) => {
                    lock_pending(&self.pending).remove(session_id);
                    tracing::debug!(target: "persistence", session_id = %session_id, attempts, "Session saved");
                    return SaveOutcome::Saved { attempts };
                }
                Err(e) if e.is_transient() && attempts < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempts);
                    tracing::debug!(
                        target: "persistence",
                        session_id = %session_id,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Save failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "persistence",
                        session_id = %session_id,
                        attempts,
                        error = %e,
                        "Save failed, falling back to local storage"
                    );
                    break;
                }
            }
        }

        match self.fallback.save_session(record).await {
            Ok(()) => {
                lock_pending(&self.pending).remove(session_id);
                SaveOutcome::SavedLocally { attempts }
            }
            Err(e) => {
                tracing::warn!(
                    target: "persistence",
                    session_id = %session_id,
                    error = %e,
                    "Local fallback failed, record kept in memory"
                );
                SaveOutcome::Retained
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceError;
    use crate::persistence::fixtures::record;
    use crate::persistence::InMemoryGateway;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` saves with the given error kind
    struct FlakyGateway {
        failures: u32,
        transient: bool,
        calls: AtomicU32,
        inner: InMemoryGateway,
    }

    impl FlakyGateway {
        fn new(failures: u32, transient: bool) -> Self {
            Self {
                failures,
                transient,
                calls: AtomicU32::new(0),
                inner: InMemoryGateway::new(),
            }
        }
    }

    #[async_trait]
    impl PersistenceGateway for FlakyGateway {
        async fn save_session(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(if self.transient {
                    PersistenceError::Unavailable("connection reset".to_string())
                } else {
                    PersistenceError::Rejected("schema mismatch".to_string())
                });
            }
            self.inner.save_session(record).await
        }

        async fn load_recent_sessions(
            &self,
            user_id: &str,
            since: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<SessionRecord>, PersistenceError> {
            self.inner.load_recent_sessions(user_id, since, limit).await
        }
    }

    fn sample() -> SessionRecord {
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap();
        record("u1", "memory", now, 1)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_600));
        assert_eq!(policy.delay_for(10), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let primary = Arc::new(FlakyGateway::new(2, true));
        let fallback = Arc::new(InMemoryGateway::new());
        let handle = PersistenceWorker::spawn(primary.clone(), fallback.clone(), RetryPolicy::default(), 10);

        let rec = sample();
        let outcome = handle.save(rec.clone()).await;

        assert_eq!(outcome, SaveOutcome::Saved { attempts: 3 });
        assert!(primary.inner.get(rec.session_id()).is_some());
        assert!(fallback.is_empty());
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fall_back_locally() {
        let primary = Arc::new(FlakyGateway::new(u32::MAX, true));
        let fallback = Arc::new(InMemoryGateway::new());
        let handle = PersistenceWorker::spawn(primary.clone(), fallback.clone(), RetryPolicy::default(), 10);

        let rec = sample();
        let outcome = handle.save(rec.clone()).await;

        assert_eq!(outcome, SaveOutcome::SavedLocally { attempts: 5 });
        assert_eq!(primary.calls.load(Ordering::SeqCst), 5);
        assert!(fallback.get(rec.session_id()).is_some());
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_skips_retries() {
        let primary = Arc::new(FlakyGateway::new(1, false));
        let fallback = Arc::new(InMemoryGateway::new());
        let handle = PersistenceWorker::spawn(primary.clone(), fallback.clone(), RetryPolicy::default(), 10);

        let outcome = handle.save(sample()).await;
        assert_eq!(outcome, SaveOutcome::SavedLocally { attempts: 1 });
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_retained_when_both_gateways_fail() {
        let primary = Arc::new(FlakyGateway::new(u32::MAX, false));
        let fallback = Arc::new(FlakyGateway::new(u32::MAX, true));
        let handle = PersistenceWorker::spawn(primary, fallback, RetryPolicy::default(), 10);

        let rec = sample();
        assert_eq!(handle.save(rec.clone()).await, SaveOutcome::Retained);
        let pending = handle.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].session_id(), rec.session_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_does_not_wait() {
        let primary = Arc::new(FlakyGateway::new(u32::MAX, true));
        let fallback = Arc::new(InMemoryGateway::new());
        let handle = PersistenceWorker::spawn(primary, fallback.clone(), RetryPolicy::default(), 10);

        assert!(handle.submit(sample()));
        assert_eq!(handle.pending_count(), 1);

        // total backoff is 200 + 400 + 800 + 1600 ms
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fallback.len(), 1);
        assert_eq!(handle.pending_count(), 0);
    }
}
