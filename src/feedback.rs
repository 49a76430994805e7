use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use std::path::Path;

use crate::append_log::AppendLog;
use crate::error::{Result, ServiceError};
use crate::types::FeedbackEntry;

/// Free-form user feedback, kept apart from prediction history.
pub struct FeedbackLog {
    log: Mutex<AppendLog>,
}

impl FeedbackLog {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let log = AppendLog::open(path, &["timestamp", "feedback"])
            .map_err(|e| anyhow::anyhow!("failed to open feedback log {}: {e}", path.display()))?;
        Ok(Self {
            log: Mutex::new(log),
        })
    }

    #[tracing::instrument(skip_all)]
    pub fn submit(&self, feedback: &str) -> Result<FeedbackEntry> {
        if feedback.trim().is_empty() {
            return Err(ServiceError::InvalidInput);
        }

        let entry = FeedbackEntry {
            timestamp: Utc::now(),
            feedback: feedback.to_string(),
        };
        let timestamp = entry.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true);

        let mut log = self.log.lock();
        log.append([timestamp.as_str(), entry.feedback.as_str()])
            .map_err(|source| ServiceError::StoreWrite {
                path: log.path().to_path_buf(),
                source,
            })?;

        tracing::info!(chars = entry.feedback.chars().count(), "Feedback recorded");
        Ok(entry)
    }
}
