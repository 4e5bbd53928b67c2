//! Job and dead-letter model.
//!
//! A job's status only advances pending → processing → {completed|failed}.
//! A failed attempt with retries left transitions back to pending exactly
//! once per retry. Payloads and results are stored encrypted; nothing in
//! this module ever sees plaintext messages.

use chrono::{DateTime, Utc};
use kindred_crypto::EncryptedData;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod store;

pub use store::{JobStore, JobStoreStats};

/// Retries before a job is dead-lettered.
pub const MAX_RETRIES: u32 = 3;

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Returns the string stored in the database
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A chat job. `payload` is the encrypted message list, `result` the
/// encrypted assistant response once completed.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub user_id: String,
    pub conversation_id: String,
    pub status: JobStatus,
    pub payload: EncryptedData,
    pub result: Option<EncryptedData>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Snapshot of a job that exhausted its retries.
///
/// The encrypted payload is copied verbatim so the work is never lost;
/// each entry may be re-submitted at most once.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub original_job_id: Uuid,
    pub user_id: String,
    pub conversation_id: String,
    pub payload: EncryptedData,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    pub retried: bool,
    pub retry_job_id: Option<Uuid>,
}

/// Filter for listing dead-letter entries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeadLetterFilter {
    /// Restrict to one user
    pub user_id: Option<String>,
    /// Restrict by retried flag
    pub retried: Option<bool>,
    /// Maximum rows returned (default 100)
    pub limit: Option<u32>,
}
