//! MongoDB storage engine. The jid counter lives in a singleton document in
//! the `root` collection; `find_one_and_update` supplies the atomicity for
//! both jid allocation and queue claims.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, Database, IndexModel};

use crate::auth::Account;
use crate::config::Settings;
use crate::job::SubmittedJob;

use super::{JobQuery, Storage, StorageError};

const DATABASE: &str = "conveyor";

pub struct MongoStorage {
    database: Database,
}

impl MongoStorage {
    /// Establish a connection to the MongoDB cluster named by the settings.
    pub async fn connect(settings: &Settings) -> Result<Self, StorageError> {
        let client = Client::with_uri_str(settings.mongo_uri()).await?;
        Ok(MongoStorage {
            database: client.database(DATABASE),
        })
    }

    fn jobs(&self) -> Collection<SubmittedJob> {
        self.database.collection("jobs")
    }

    fn root(&self) -> Collection<Document> {
        self.database.collection("root")
    }

    fn accounts(&self) -> Collection<Account> {
        self.database.collection("accounts")
    }

    fn filter_for(query: &JobQuery) -> Option<Document> {
        let mut filter = Document::new();

        if let Some(account) = &query.account {
            filter.insert("account", account.as_str());
        }

        match query.jids.len() {
            0 => {
                let mut bounds = Document::new();
                if let Some(before) = query.before {
                    bounds.insert("$lt", before as i64);
                }
                if let Some(after) = query.after {
                    bounds.insert("$gte", after as i64);
                }
                if !bounds.is_empty() {
                    filter.insert("jid", bounds);
                }
            }
            1 => {
                let only = query.jids[0];
                if !query.jid_in_bounds(only) {
                    return None;
                }
                filter.insert("jid", only as i64);
            }
            _ => {
                let surviving: Vec<i64> = query
                    .jids
                    .iter()
                    .copied()
                    .filter(|jid| query.jid_in_bounds(*jid))
                    .map(|jid| jid as i64)
                    .collect();
                if surviving.is_empty() {
                    return None;
                }
                filter.insert("jid", doc! { "$in": surviving });
            }
        }

        match query.names.len() {
            0 => {}
            1 => {
                filter.insert("name", query.names[0].as_str());
            }
            _ => {
                filter.insert("name", doc! { "$in": query.names.clone() });
            }
        }

        match query.statuses.len() {
            0 => {}
            1 => {
                filter.insert("status", query.statuses[0].to_string());
            }
            _ => {
                let statuses: Vec<String> =
                    query.statuses.iter().map(|s| s.to_string()).collect();
                filter.insert("status", doc! { "$in": statuses });
            }
        }

        Some(filter)
    }
}

#[async_trait]
impl Storage for MongoStorage {
    async fn bootstrap(&self) -> Result<(), StorageError> {
        let options = FindOneAndUpdateOptions::builder().upsert(true).build();
        self.root()
            .find_one_and_update(
                doc! {},
                doc! { "$setOnInsert": { "job_id": 0_i64 } },
                options,
            )
            .await?;

        self.jobs()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "jid": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
                None,
            )
            .await?;
        self.jobs()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "status": 1, "created_at": 1 })
                    .build(),
                None,
            )
            .await?;
        self.accounts()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "name": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
                None,
            )
            .await?;

        tracing::debug!("storage root record and indices initialized");
        Ok(())
    }

    async fn insert_job(&self, mut job: SubmittedJob) -> Result<u64, StorageError> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let root = self
            .root()
            .find_one_and_update(doc! {}, doc! { "$inc": { "job_id": 1_i64 } }, options)
            .await?
            .ok_or_else(|| StorageError::Corrupt("root record missing".to_string()))?;

        let jid = root
            .get_i64("job_id")
            .map_err(|e| StorageError::Corrupt(format!("root job_id: {}", e)))?;
        job.jid = jid as u64;

        self.jobs().insert_one(&job, None).await?;
        Ok(job.jid)
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<SubmittedJob>, StorageError> {
        let filter = match Self::filter_for(query) {
            Some(filter) => filter,
            // The explicit jids all fall outside the before/after bounds.
            None => return Ok(Vec::new()),
        };

        let options = FindOptions::builder().limit(query.limit as i64).build();
        let cursor = self.jobs().find(filter, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn claim_job(&self) -> Result<Option<SubmittedJob>, StorageError> {
        let options = FindOneAndUpdateOptions::builder()
            .sort(doc! { "created_at": 1 })
            .return_document(ReturnDocument::After)
            .build();
        Ok(self
            .jobs()
            .find_one_and_update(
                doc! { "status": "queued" },
                doc! { "$set": { "status": "processing" } },
                options,
            )
            .await?)
    }

    async fn update_job(&self, job: &SubmittedJob) -> Result<(), StorageError> {
        // $set rather than replace: a false kill_requested and an absent
        // container_id are omitted from the serialized form, so a stale
        // executor copy cannot erase a kill request racing in through the
        // API (or vice versa).
        let fields = mongodb::bson::to_document(job)
            .map_err(|e| StorageError::Corrupt(format!("serialize job {}: {}", job.jid, e)))?;
        let result = self
            .jobs()
            .update_one(doc! { "jid": job.jid as i64 }, doc! { "$set": fields }, None)
            .await?;
        if result.matched_count == 0 {
            return Err(StorageError::JobNotFound(job.jid));
        }
        Ok(())
    }

    async fn get_account(&self, name: &str) -> Result<Option<Account>, StorageError> {
        Ok(self.accounts().find_one(doc! { "name": name }, None).await?)
    }

    async fn update_account_usage(&self, name: &str, runtime: i64) -> Result<(), StorageError> {
        let options = FindOneAndUpdateOptions::builder().upsert(true).build();
        self.accounts()
            .find_one_and_update(
                doc! { "name": name },
                doc! { "$inc": { "total_runtime": runtime, "total_jobs": 1_i64 } },
                options,
            )
            .await?;
        Ok(())
    }

    async fn job_kill_requested(&self, jid: u64) -> Result<bool, StorageError> {
        let job = self
            .jobs()
            .find_one(doc! { "jid": jid as i64 }, None)
            .await?
            .ok_or(StorageError::JobNotFound(jid))?;
        Ok(job.kill_requested)
    }
}
