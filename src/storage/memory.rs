//! In-memory storage engine. Mirrors the MongoDB engine's contracts closely
//! enough to back the integration tests and local development.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::auth::Account;
use crate::job::{Status, SubmittedJob};

use super::{JobQuery, Storage, StorageError};

#[derive(Default)]
struct MemoryInner {
    next_jid: u64,
    jobs: BTreeMap<u64, SubmittedJob>,
    accounts: HashMap<String, Account>,
}

/// A storage engine held entirely in process memory.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    fn matches(query: &JobQuery, job: &SubmittedJob) -> bool {
        if let Some(account) = &query.account {
            if &job.account != account {
                return false;
            }
        }
        if !query.jids.is_empty() && !query.jids.contains(&job.jid) {
            return false;
        }
        if !query.jid_in_bounds(job.jid) {
            return false;
        }
        if !query.names.is_empty() {
            match &job.job.name {
                Some(name) if query.names.contains(name) => {}
                _ => return false,
            }
        }
        if !query.statuses.is_empty() && !query.statuses.contains(&job.status) {
            return false;
        }
        true
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn bootstrap(&self) -> Result<(), StorageError> {
        // The jid counter is the whole root record; nothing to create.
        Ok(())
    }

    async fn insert_job(&self, mut job: SubmittedJob) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock().await;
        inner.next_jid += 1;
        let jid = inner.next_jid;
        job.jid = jid;
        inner.jobs.insert(jid, job);
        Ok(jid)
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<SubmittedJob>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|job| Self::matches(query, job))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn claim_job(&self) -> Result<Option<SubmittedJob>, StorageError> {
        let mut inner = self.inner.lock().await;
        let oldest = inner
            .jobs
            .values()
            .filter(|job| job.status == Status::Queued)
            .min_by_key(|job| (job.created_at, job.jid))
            .map(|job| job.jid);

        match oldest {
            Some(jid) => {
                let job = inner
                    .jobs
                    .get_mut(&jid)
                    .ok_or(StorageError::JobNotFound(jid))?;
                job.status = Status::Processing;
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn update_job(&self, job: &SubmittedJob) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&job.jid) {
            Some(stored) => {
                // kill_requested and container_id are write-once from the
                // caller's point of view; a stale copy must not erase them.
                let kill_requested = stored.kill_requested || job.kill_requested;
                let container_id = job.container_id.clone().or_else(|| stored.container_id.clone());
                *stored = job.clone();
                stored.kill_requested = kill_requested;
                stored.container_id = container_id;
                Ok(())
            }
            None => Err(StorageError::JobNotFound(job.jid)),
        }
    }

    async fn get_account(&self, name: &str) -> Result<Option<Account>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.accounts.get(name).cloned())
    }

    async fn update_account_usage(&self, name: &str, runtime: i64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let account = inner
            .accounts
            .entry(name.to_string())
            .or_insert_with(|| Account::named(name));
        account.total_runtime += runtime;
        account.total_jobs += 1;
        Ok(())
    }

    async fn job_kill_requested(&self, jid: u64) -> Result<bool, StorageError> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(&jid)
            .map(|job| job.kill_requested)
            .ok_or(StorageError::JobNotFound(jid))
    }
}
