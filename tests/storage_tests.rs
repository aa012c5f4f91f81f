//! Contract tests for the in-memory storage engine: jid allocation, the
//! atomic claim, filtering, and account usage counters.


use std::collections::HashSet;
use std::sync::Arc;

use conveyor::job::{Status, SubmittedJob, Timestamp};
use conveyor::storage::{JobQuery, MemoryStorage, Storage, StorageError};
use harness::{job, named_job};

fn submitted(cmd: &str, account: &str) -> SubmittedJob {
    SubmittedJob::new(job(cmd, "stdout"), account.to_string())
}

#[tokio::test]
async fn insert_allocates_monotonic_jids() {
    let storage = MemoryStorage::new();
    storage.bootstrap().await.unwrap();

    let mut last = 0;
    for i in 0..5 {
        let jid = storage
            .insert_job(submitted(&format!("echo {}", i), "someone"))
            .await
            .unwrap();
        assert!(jid > last, "jid {} should exceed {}", jid, last);
        last = jid;
    }
}

#[tokio::test]
async fn concurrent_inserts_never_share_a_jid() {
    let storage = Arc::new(MemoryStorage::new());
    storage.bootstrap().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move {
            storage
                .insert_job(submitted(&format!("echo {}", i), "someone"))
                .await
                .unwrap()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        assert!(seen.insert(handle.await.unwrap()), "duplicate jid observed");
    }
    assert_eq!(seen.len(), 20);
}

#[tokio::test]
async fn resubmitted_batches_get_disjoint_jids() {
    let storage = MemoryStorage::new();
    storage.bootstrap().await.unwrap();

    let mut first = HashSet::new();
    for _ in 0..3 {
        first.insert(storage.insert_job(submitted("id", "someone")).await.unwrap());
    }
    let mut second = HashSet::new();
    for _ in 0..3 {
        second.insert(storage.insert_job(submitted("id", "someone")).await.unwrap());
    }
    assert!(first.is_disjoint(&second));
}

#[tokio::test]
async fn bootstrap_is_idempotent() {
    let storage = MemoryStorage::new();
    storage.bootstrap().await.unwrap();
    storage.bootstrap().await.unwrap();

    let jid = storage.insert_job(submitted("id", "someone")).await.unwrap();
    assert_eq!(jid, 1);
}

#[tokio::test]
async fn claim_returns_none_on_an_empty_queue() {
    let storage = MemoryStorage::new();
    assert!(storage.claim_job().await.unwrap().is_none());
}

#[tokio::test]
async fn claim_takes_the_oldest_queued_job() {
    let storage = MemoryStorage::new();

    let mut newer = submitted("echo newer", "someone");
    newer.created_at = Timestamp::from_nanos(2_000_000_000_000_000_000);
    let mut older = submitted("echo older", "someone");
    older.created_at = Timestamp::from_nanos(1_000_000_000_000_000_000);

    storage.insert_job(newer).await.unwrap();
    let older_jid = storage.insert_job(older).await.unwrap();

    let claimed = storage.claim_job().await.unwrap().unwrap();
    assert_eq!(claimed.jid, older_jid);
    assert_eq!(claimed.status, Status::Processing);
}

#[tokio::test]
async fn claim_marks_the_job_processing_in_storage() {
    let storage = MemoryStorage::new();
    let jid = storage.insert_job(submitted("id", "someone")).await.unwrap();

    storage.claim_job().await.unwrap().unwrap();

    let query = JobQuery {
        jids: vec![jid],
        ..Default::default()
    };
    let jobs = storage.list_jobs(&query).await.unwrap();
    assert_eq!(jobs[0].status, Status::Processing);
}

#[tokio::test]
async fn concurrent_claims_are_mutually_exclusive() {
    let storage = Arc::new(MemoryStorage::new());
    storage.insert_job(submitted("id", "someone")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move { storage.claim_job().await.unwrap() }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one claimant should win the job");
}

#[tokio::test]
async fn claimed_jobs_are_not_claimable_again() {
    let storage = MemoryStorage::new();
    storage.insert_job(submitted("id", "someone")).await.unwrap();

    assert!(storage.claim_job().await.unwrap().is_some());
    assert!(storage.claim_job().await.unwrap().is_none());
}

#[tokio::test]
async fn update_job_persists_mutations() {
    let storage = MemoryStorage::new();
    let jid = storage.insert_job(submitted("id", "someone")).await.unwrap();

    let mut claimed = storage.claim_job().await.unwrap().unwrap();
    claimed.stdout.push_str("partial output");
    claimed.kill_requested = true;
    storage.update_job(&claimed).await.unwrap();

    assert!(storage.job_kill_requested(jid).await.unwrap());
    let query = JobQuery {
        jids: vec![jid],
        ..Default::default()
    };
    let jobs = storage.list_jobs(&query).await.unwrap();
    assert_eq!(jobs[0].stdout, "partial output");
}

#[tokio::test]
async fn stale_updates_cannot_erase_a_kill_request() {
    let storage = MemoryStorage::new();
    let jid = storage.insert_job(submitted("id", "someone")).await.unwrap();

    // The executor claims its own copy; the API sets the kill flag on another.
    let stale = storage.claim_job().await.unwrap().unwrap();

    let query = JobQuery {
        jids: vec![jid],
        ..Default::default()
    };
    let mut flagged = storage.list_jobs(&query).await.unwrap().remove(0);
    flagged.kill_requested = true;
    storage.update_job(&flagged).await.unwrap();

    // The executor persists its stale copy (flag unset, container id fresh).
    let mut stale = stale;
    stale.container_id = Some("c-1".to_string());
    storage.update_job(&stale).await.unwrap();

    assert!(storage.job_kill_requested(jid).await.unwrap());
    let stored = storage.list_jobs(&query).await.unwrap().remove(0);
    assert_eq!(stored.container_id.as_deref(), Some("c-1"));

    // And a stale copy without the container id cannot erase it either.
    let mut no_container = stored.clone();
    no_container.container_id = None;
    storage.update_job(&no_container).await.unwrap();
    let stored = storage.list_jobs(&query).await.unwrap().remove(0);
    assert_eq!(stored.container_id.as_deref(), Some("c-1"));
}

#[tokio::test]
async fn update_job_rejects_unknown_jids() {
    let storage = MemoryStorage::new();
    let mut ghost = submitted("id", "someone");
    ghost.jid = 99;
    assert!(matches!(
        storage.update_job(&ghost).await,
        Err(StorageError::JobNotFound(99))
    ));
}

#[tokio::test]
async fn kill_flag_read_rejects_unknown_jids() {
    let storage = MemoryStorage::new();
    assert!(matches!(
        storage.job_kill_requested(7).await,
        Err(StorageError::JobNotFound(7))
    ));
}

#[tokio::test]
async fn list_constrains_to_the_querying_account() {
    let storage = MemoryStorage::new();
    storage.insert_job(submitted("id", "alice")).await.unwrap();
    storage.insert_job(submitted("id", "bob")).await.unwrap();

    let query = JobQuery {
        account: Some("alice".to_string()),
        ..Default::default()
    };
    let jobs = storage.list_jobs(&query).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].account, "alice");

    // No account constraint: admin acting with sudo.
    let jobs = storage.list_jobs(&JobQuery::default()).await.unwrap();
    assert_eq!(jobs.len(), 2);
}

#[tokio::test]
async fn list_filters_by_name_and_status() {
    let storage = MemoryStorage::new();
    for name in ["a", "b", "c"] {
        storage
            .insert_job(SubmittedJob::new(named_job("id", name), "someone".to_string()))
            .await
            .unwrap();
    }

    let query = JobQuery {
        names: vec!["a".to_string(), "c".to_string()],
        ..Default::default()
    };
    let jobs = storage.list_jobs(&query).await.unwrap();
    let names: Vec<_> = jobs.iter().filter_map(|j| j.job.name.clone()).collect();
    assert_eq!(names, vec!["a", "c"]);

    // One job leaves the queue; a status filter notices.
    storage.claim_job().await.unwrap().unwrap();
    let query = JobQuery {
        statuses: vec![Status::Queued],
        ..Default::default()
    };
    assert_eq!(storage.list_jobs(&query).await.unwrap().len(), 2);
}

#[tokio::test]
async fn list_applies_jid_bounds_to_explicit_jids() {
    let storage = MemoryStorage::new();
    for i in 0..4 {
        storage
            .insert_job(submitted(&format!("echo {}", i), "someone"))
            .await
            .unwrap();
    }

    // before is exclusive, after inclusive
    let query = JobQuery {
        jids: vec![1, 2, 3, 4],
        before: Some(4),
        after: Some(2),
        ..Default::default()
    };
    let jids: Vec<u64> = storage
        .list_jobs(&query)
        .await
        .unwrap()
        .iter()
        .map(|j| j.jid)
        .collect();
    assert_eq!(jids, vec![2, 3]);
}

#[tokio::test]
async fn list_honors_the_limit() {
    let storage = MemoryStorage::new();
    for i in 0..10 {
        storage
            .insert_job(submitted(&format!("echo {}", i), "someone"))
            .await
            .unwrap();
    }

    let query = JobQuery {
        limit: 3,
        ..Default::default()
    };
    assert_eq!(storage.list_jobs(&query).await.unwrap().len(), 3);
}

#[tokio::test]
async fn account_usage_accumulates() {
    let storage = MemoryStorage::new();
    assert!(storage.get_account("someone").await.unwrap().is_none());

    storage.update_account_usage("someone", 1_000).await.unwrap();
    storage.update_account_usage("someone", 500).await.unwrap();

    let account = storage.get_account("someone").await.unwrap().unwrap();
    assert_eq!(account.name, "someone");
    assert_eq!(account.total_runtime, 1_500);
    assert_eq!(account.total_jobs, 2);
    assert!(!account.admin);
}
