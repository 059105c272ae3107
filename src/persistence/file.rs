//! File-backed local fallback
//!
//! Directory structure:
//! ```text
//! base_dir/
//! ├── <session-id-1>.json
//! └── <session-id-2>.json
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;

use super::{newest_first, PersistenceGateway, SessionRecord};
use crate::error::PersistenceError;

const EXTENSION: &str = "json";

/// Stores one JSON document per session.
///
/// Records are written as typed documents; free-form fields inside them were
/// depth-bounded when the events and final payload were accepted.
pub struct JsonFileGateway {
    base_dir: PathBuf,
}

impl JsonFileGateway {
    /// Create the gateway, creating `base_dir` if needed
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        // session ids are uuids; strip anything that could escape the directory
        let file_name: String = session_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        self.base_dir.join(format!("{file_name}.{EXTENSION}"))
    }

    async fn read_record(path: &Path) -> Option<SessionRecord> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(target: "persistence", path = %path.display(), error = %e, "Failed to read fallback record");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(target: "persistence", path = %path.display(), error = %e, "Skipping unreadable fallback record");
                None
            }
        }
    }
}

#[async_trait]
impl PersistenceGateway for JsonFileGateway {
    async fn save_session(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(record)?;

        // write then rename so readers never see a partial file
        let path = self.path_for(record.session_id());
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;

        tracing::debug!(target: "persistence", session_id = %record.session_id(), path = %path.display(), "Record written locally");
        Ok(())
    }

    async fn load_recent_sessions(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SessionRecord>, PersistenceError> {
        let mut entries = fs::read_dir(&self.base_dir).await?;
        let mut matching = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(record) = Self::read_record(&path).await {
                if record.user_id() == user_id && record.summary.end_time >= since {
                    matching.push(record);
                }
            }
        }

        Ok(newest_first(matching, limit))
    }
}
