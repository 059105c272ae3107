//! In-process gateway for hosts without storage, and for tests

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{newest_first, PersistenceGateway, SessionRecord};
use crate::error::PersistenceError;

/// Records kept in a map keyed by session id
#[derive(Default)]
pub struct InMemoryGateway {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.lock().get(session_id).cloned()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn save_session(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        self.lock()
            .insert(record.session_id().to_string(), record.clone());
        Ok(())
    }

    async fn load_recent_sessions(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SessionRecord>, PersistenceError> {
        let matching: Vec<SessionRecord> = self
            .lock()
            .values()
            .filter(|r| r.user_id() == user_id && r.summary.end_time >= since)
            .cloned()
            .collect();
        Ok(newest_first(matching, limit))
    }
}
