//! Persistence boundary
//!
//! Finalized sessions leave the engine as [`SessionRecord`]s through a
//! [`PersistenceGateway`]. Durable storage is the gateway's concern; retries,
//! backoff and the local fallback belong to the [`PersistenceWorker`].

pub mod cache;
pub mod file;
pub mod memory;
pub mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::event::Event;
use crate::types::{AnalysisReport, SessionSummary};

pub use cache::ReportCache;
pub use file::JsonFileGateway;
pub use memory::InMemoryGateway;
pub use worker::{PersistenceHandle, PersistenceWorker, RetryPolicy, SaveOutcome};

/// Everything stored for one finalized session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub summary: SessionSummary,
    pub report: AnalysisReport,
    /// Frozen event log
    #[serde(default)]
    pub events: Vec<Event>,
}

impl SessionRecord {
    pub fn session_id(&self) -> &str {
        &self.summary.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.summary.user_id
    }
}

/// External storage collaborator
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Store a record, replacing any previous record for the same session
    async fn save_session(&self, record: &SessionRecord) -> Result<(), PersistenceError>;

    /// Records for `user_id` that ended at or after `since`, newest first
    async fn load_recent_sessions(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SessionRecord>, PersistenceError>;
}

/// Newest first, then truncate
pub(crate) fn newest_first(mut records: Vec<SessionRecord>, limit: usize) -> Vec<SessionRecord> {
    records.sort_by(|a, b| b.summary.end_time.cmp(&a.summary.end_time));
    records.truncate(limit);
    records
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::analysis::ReportAssembler;
    use crate::session::Session;
    use crate::types::{Difficulty, SessionStatus};
    use chrono::Duration;
    use serde_json::Map;

    /// A finalized record for `user_id` that ended `minutes_ago` before `now`
    pub fn record(user_id: &str, activity_id: &str, now: DateTime<Utc>, minutes_ago: i64) -> SessionRecord {
        let ended = now - Duration::minutes(minutes_ago);
        let mut session = Session::new(user_id, activity_id, Difficulty::Easy, ended);
        session
            .finalize(SessionStatus::Completed, Map::new(), ended)
            .unwrap();
        let report = ReportAssembler::default().assemble(&session, &[], ended);
        SessionRecord {
            summary: ReportAssembler::summarize(&session, &report),
            report,
            events: session.events().to_vec(),
        }
    }
}
