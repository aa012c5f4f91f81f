//! Storage engine seam: atomic queue operations, job records, and account
//! usage counters. The in-memory engine backs the tests; MongoDB backs
//! production.

pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use thiserror::Error;

use crate::auth::Account;
use crate::job::{Status, SubmittedJob};

pub use memory::MemoryStorage;
pub use mongo::MongoStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("job {0} not found")]
    JobNotFound(u64),

    #[error("malformed record: {0}")]
    Corrupt(String),
}

/// Query parameters for fetching jobs. All filters are optional.
#[derive(Debug, Clone)]
pub struct JobQuery {
    /// Restrict results to this account. `None` lifts the restriction and is
    /// only ever produced for an administrator acting with sudo.
    pub account: Option<String>,

    pub jids: Vec<u64>,
    pub names: Vec<String>,
    pub statuses: Vec<Status>,

    pub limit: usize,
    /// Exclusive upper jid bound.
    pub before: Option<u64>,
    /// Inclusive lower jid bound.
    pub after: Option<u64>,
}

impl Default for JobQuery {
    fn default() -> Self {
        JobQuery {
            account: None,
            jids: Vec::new(),
            names: Vec::new(),
            statuses: Vec::new(),
            limit: 1000,
            before: None,
            after: None,
        }
    }
}

impl JobQuery {
    /// Whether a jid survives the explicit `before`/`after` bounds.
    pub(crate) fn jid_in_bounds(&self, jid: u64) -> bool {
        if let Some(before) = self.before {
            if jid >= before {
                return false;
            }
        }
        if let Some(after) = self.after {
            if jid < after {
                return false;
            }
        }
        true
    }
}

/// Interactions with the storage engine. Alternate implementations stand in
/// for the real database under test.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Ensure the singleton root record and indices exist. Idempotent; safe
    /// to invoke on every process start.
    async fn bootstrap(&self) -> Result<(), StorageError>;

    /// Atomically allocate the next jid and insert the job under it.
    async fn insert_job(&self, job: SubmittedJob) -> Result<u64, StorageError>;

    /// Fetch jobs matching the query, at most `query.limit` of them.
    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<SubmittedJob>, StorageError>;

    /// Atomically take the oldest queued job, marking it processing. Returns
    /// `None` when the queue is empty. At most one caller receives any given
    /// job.
    async fn claim_job(&self) -> Result<Option<SubmittedJob>, StorageError>;

    /// Persist the job's current state, keyed by jid. A set kill flag and a
    /// recorded container id survive updates from writers holding a stale
    /// copy; both are write-once for the job's lifetime.
    async fn update_job(&self, job: &SubmittedJob) -> Result<(), StorageError>;

    /// Load an account by name.
    async fn get_account(&self, name: &str) -> Result<Option<Account>, StorageError>;

    /// Atomically fold a completed job into the account's usage counters.
    async fn update_account_usage(&self, name: &str, runtime: i64) -> Result<(), StorageError>;

    /// Read the job's current kill-request flag.
    async fn job_kill_requested(&self, jid: u64) -> Result<bool, StorageError>;
}
