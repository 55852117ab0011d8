//! Store integration tests. Each test runs under its own namespace so
//! parallel runs against a shared Redis do not interfere.

use std::sync::Arc;

use bridgemq_models::{
    BehaviorConfig, DependenciesConfig, IdempotencyConfig, JobConfig, JobErrorRecord, JobStatus,
    MatchMode, MeshId, NewJob, RateLimitConfig, RetryConfig, Schedule, ServerId, TargetConfig,
};
use bridgemq_models::ErrorCode;
use bridgemq_store::{
    CancelOutcome, ClaimRequest, JobRepository, Store, StoreConfig, Topology,
};

async fn test_repo(tag: &str) -> (Arc<Store>, JobRepository) {
    dotenvy::dotenv().ok();
    let config = StoreConfig {
        namespace: format!("bmqtest-{}-{}", tag, uuid_suffix()),
        ..StoreConfig::from_env()
    };
    let store = Arc::new(Store::connect(config).await.expect("connect store"));
    let repo = JobRepository::new(Arc::clone(&store));
    (store, repo)
}

fn uuid_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn mesh() -> MeshId {
    MeshId::from_string("mesh-test")
}

fn open_claim(server: &str) -> ClaimRequest {
    ClaimRequest {
        mesh_id: mesh(),
        server_id: ServerId::from_string(server),
        stack: "rust".to_string(),
        region: "eu-west".to_string(),
        capabilities: vec!["gpu:cuda".to_string(), "video:ffmpeg".to_string()],
    }
}

fn priority(p: u8) -> JobConfig {
    JobConfig {
        priority: Some(p),
        ..Default::default()
    }
}

/// S1: priorities beat insertion order; within a priority, earliest first.
#[tokio::test]
#[ignore = "requires Redis"]
async fn claim_ordering_by_priority_then_score() {
    let (_store, repo) = test_repo("order").await;

    let j1 = repo
        .create_job(NewJob::new("T", mesh()).with_config(priority(5)), 1_000)
        .await
        .unwrap()
        .job_id;
    let j2 = repo
        .create_job(NewJob::new("T", mesh()).with_config(priority(9)), 1_001)
        .await
        .unwrap()
        .job_id;
    let j3 = repo
        .create_job(NewJob::new("T", mesh()).with_config(priority(5)), 1_002)
        .await
        .unwrap()
        .job_id;

    let req = open_claim("srv-order");
    let first = repo.claim_job(&req, 2_000).await.unwrap();
    let second = repo.claim_job(&req, 2_000).await.unwrap();
    let third = repo.claim_job(&req, 2_000).await.unwrap();
    let none = repo.claim_job(&req, 2_000).await.unwrap();

    assert_eq!(first, Some(j2));
    assert_eq!(second, Some(j1));
    assert_eq!(third, Some(j3));
    assert_eq!(none, None);
}

/// S2: a second create under the same idempotency key returns the first job
/// and writes nothing.
#[tokio::test]
#[ignore = "requires Redis"]
async fn idempotent_create_returns_existing_job() {
    let (_store, repo) = test_repo("idem").await;

    let config = JobConfig {
        idempotency: Some(IdempotencyConfig {
            key: "k1".to_string(),
            window: 3_600,
        }),
        ..Default::default()
    };

    let first = repo
        .create_job(
            NewJob::new("X", mesh())
                .with_json_payload(&serde_json::json!({"n": 1}))
                .unwrap()
                .with_config(config.clone()),
            1_000,
        )
        .await
        .unwrap();
    assert!(first.deduplicated.is_none());

    let second = repo
        .create_job(
            NewJob::new("X", mesh())
                .with_json_payload(&serde_json::json!({"n": 2}))
                .unwrap()
                .with_config(config),
            1_001,
        )
        .await
        .unwrap();

    assert_eq!(second.job_id, first.job_id);
    assert!(second.deduplicated.is_some());

    let job = repo.get_job(&first.job_id).await.unwrap().unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&job.payload).unwrap();
    assert_eq!(payload, serde_json::json!({"n": 1}));
}

/// Fingerprint dedup: same (type, payload) with deduplication enabled maps
/// to one job inside the window.
#[tokio::test]
#[ignore = "requires Redis"]
async fn fingerprint_deduplicates_identical_payloads() {
    let (_store, repo) = test_repo("fp").await;

    let config = JobConfig {
        behavior: Some(BehaviorConfig {
            deduplication: true,
            ..Default::default()
        }),
        ..Default::default()
    };
    let make = || {
        NewJob::new("dup", mesh())
            .with_payload(b"same-bytes".to_vec())
            .with_config(config.clone())
    };

    let first = repo.create_job(make(), 1_000).await.unwrap();
    let second = repo.create_job(make(), 1_001).await.unwrap();
    assert_eq!(second.job_id, first.job_id);
    assert!(second.deduplicated.is_some());
}

/// S3: exponential retries land in the delayed set, then the DLQ.
#[tokio::test]
#[ignore = "requires Redis"]
async fn exponential_retry_to_dlq() {
    let (_store, repo) = test_repo("retry").await;

    let config = JobConfig {
        retry: Some(RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1_000,
            ..Default::default()
        }),
        ..Default::default()
    };
    let job_id = repo
        .create_job(NewJob::new("Y", mesh()).with_config(config), 1_000)
        .await
        .unwrap()
        .job_id;

    let req = open_claim("srv-retry");
    let server = req.server_id.clone();
    let err = JobErrorRecord::new(ErrorCode::Other(4500), "boom");

    // Attempt 1: jitter pinned to zero for exact delay assertions.
    assert_eq!(repo.claim_job(&req, 2_000).await.unwrap(), Some(job_id.clone()));
    let outcome = repo
        .retry_job(&job_id, &server, &err, 2_000, Some(0.0))
        .await
        .unwrap();
    assert!(outcome.will_retry);
    assert_eq!(outcome.delay_ms, 1_000);
    let meta = repo.get_meta(&job_id).await.unwrap().unwrap();
    assert_eq!(meta.status, JobStatus::Scheduled);
    assert_eq!(meta.scheduled_for, 3_000);

    // Attempt 2.
    repo.promote_delayed(100, 3_001).await.unwrap();
    assert_eq!(repo.claim_job(&req, 3_002).await.unwrap(), Some(job_id.clone()));
    let outcome = repo
        .retry_job(&job_id, &server, &err, 3_002, Some(0.0))
        .await
        .unwrap();
    assert_eq!(outcome.delay_ms, 2_000);

    // Attempt 3 exhausts the budget.
    repo.promote_delayed(100, 6_000).await.unwrap();
    assert_eq!(repo.claim_job(&req, 6_001).await.unwrap(), Some(job_id.clone()));
    let outcome = repo
        .retry_job(&job_id, &server, &err, 6_001, Some(0.0))
        .await
        .unwrap();
    assert!(!outcome.will_retry);
    assert!(outcome.moved_to_dlq);
    assert_eq!(outcome.attempt, 3);

    let meta = repo.get_meta(&job_id).await.unwrap().unwrap();
    assert_eq!(meta.status, JobStatus::Failed);
    assert_eq!(meta.attempt, 3);
    let dlq = repo.dlq_entries(&mesh(), 10).await.unwrap();
    assert!(dlq.contains(&job_id));
}

/// S4: a dependent job stays out of every queue until its parent completes.
#[tokio::test]
#[ignore = "requires Redis"]
async fn dependency_cascade_enqueues_waiter() {
    let (store, repo) = test_repo("deps").await;

    let a = repo
        .create_job(NewJob::new("parent", mesh()), 1_000)
        .await
        .unwrap()
        .job_id;
    let b = repo
        .create_job(
            NewJob::new("child", mesh()).with_config(JobConfig {
                dependencies: Some(DependenciesConfig {
                    wait_for: vec![a.clone()],
                }),
                ..Default::default()
            }),
            1_001,
        )
        .await
        .unwrap()
        .job_id;

    let meta_b = repo.get_meta(&b).await.unwrap().unwrap();
    assert_eq!(meta_b.status, JobStatus::Scheduled);

    // Only the parent is claimable.
    let req = open_claim("srv-deps");
    assert_eq!(repo.claim_job(&req, 2_000).await.unwrap(), Some(a.clone()));
    assert_eq!(repo.claim_job(&req, 2_000).await.unwrap(), None);

    let done = repo
        .complete_job(&a, &req.server_id, JobStatus::Completed, None, 2_500)
        .await
        .unwrap();
    assert_eq!(done.triggered, vec![b.clone()]);

    let meta_b = repo.get_meta(&b).await.unwrap().unwrap();
    assert_eq!(meta_b.status, JobStatus::Pending);
    assert!(meta_b.processed_by.is_none());

    let topology = Topology::new(Arc::clone(&store));
    assert!(topology.has_pending(&mesh()).await.unwrap());
    assert_eq!(repo.claim_job(&req, 3_000).await.unwrap(), Some(b));
}

/// P2: a delayed job is invisible until its time passes AND a promote tick
/// has run.
#[tokio::test]
#[ignore = "requires Redis"]
async fn delayed_job_needs_promotion() {
    let (_store, repo) = test_repo("delay").await;

    let job_id = repo
        .create_job(
            NewJob::new("later", mesh()).with_config(JobConfig {
                schedule: Some(Schedule::Delay(5_000)),
                ..Default::default()
            }),
            1_000,
        )
        .await
        .unwrap()
        .job_id;

    let req = open_claim("srv-delay");
    assert_eq!(repo.claim_job(&req, 2_000).await.unwrap(), None);

    // Promotion before the scheduled time is a no-op.
    let early = repo.promote_delayed(100, 3_000).await.unwrap();
    assert_eq!(early.processed, 0);
    assert_eq!(repo.claim_job(&req, 5_999).await.unwrap(), None);

    let due = repo.promote_delayed(100, 6_001).await.unwrap();
    assert_eq!(due.processed, 1);
    assert_eq!(due.job_ids, vec![job_id.clone()]);
    assert_eq!(repo.claim_job(&req, 6_002).await.unwrap(), Some(job_id));
}

/// Cancellation leaves the queue entry behind but makes the job unclaimable.
#[tokio::test]
#[ignore = "requires Redis"]
async fn cancelled_job_is_skipped_by_claim() {
    let (_store, repo) = test_repo("cancel").await;

    let job_id = repo
        .create_job(NewJob::new("doomed", mesh()), 1_000)
        .await
        .unwrap()
        .job_id;

    assert_eq!(
        repo.cancel_job(&job_id, 1_500).await.unwrap(),
        CancelOutcome::Cancelled
    );
    let meta = repo.get_meta(&job_id).await.unwrap().unwrap();
    assert_eq!(meta.status, JobStatus::Cancelled);

    let req = open_claim("srv-cancel");
    assert_eq!(repo.claim_job(&req, 2_000).await.unwrap(), None);

    assert_eq!(
        repo.cancel_job(&job_id, 2_500).await.unwrap(),
        CancelOutcome::NotCancellable(JobStatus::Cancelled)
    );
}

/// A saturated fixed window leaves jobs pending instead of claiming them.
#[tokio::test]
#[ignore = "requires Redis"]
async fn rate_limited_claims_skip_but_keep_jobs_pending() {
    let (_store, repo) = test_repo("rate").await;

    let config = JobConfig {
        rate_limit: Some(RateLimitConfig {
            key: "bucket-a".to_string(),
            max: 1,
            window_seconds: 600,
            max_concurrent: None,
        }),
        ..Default::default()
    };
    let first = repo
        .create_job(NewJob::new("R", mesh()).with_config(config.clone()), 1_000)
        .await
        .unwrap()
        .job_id;
    let second = repo
        .create_job(NewJob::new("R", mesh()).with_config(config), 1_001)
        .await
        .unwrap()
        .job_id;

    let req = open_claim("srv-rate");
    assert_eq!(repo.claim_job(&req, 2_000).await.unwrap(), Some(first));
    // Window of one is now consumed; the second job stays pending.
    assert_eq!(repo.claim_job(&req, 2_001).await.unwrap(), None);
    let meta = repo.get_meta(&second).await.unwrap().unwrap();
    assert_eq!(meta.status, JobStatus::Pending);
}

/// Routing: target pinned to a server id is only claimable by that server.
#[tokio::test]
#[ignore = "requires Redis"]
async fn server_pinned_target_restricts_claim() {
    let (_store, repo) = test_repo("pin").await;

    let config = JobConfig {
        target: Some(TargetConfig {
            server: Some("srv-right".to_string()),
            mode: MatchMode::Any,
            ..Default::default()
        }),
        ..Default::default()
    };
    let job_id = repo
        .create_job(NewJob::new("pinned", mesh()).with_config(config), 1_000)
        .await
        .unwrap()
        .job_id;

    assert_eq!(
        repo.claim_job(&open_claim("srv-wrong"), 2_000).await.unwrap(),
        None
    );
    assert_eq!(
        repo.claim_job(&open_claim("srv-right"), 2_001).await.unwrap(),
        Some(job_id)
    );
}

/// Batch finalization parks members and enqueues the batch id as one unit.
#[tokio::test]
#[ignore = "requires Redis"]
async fn finalize_batch_parks_members() {
    let (_store, repo) = test_repo("batch").await;

    let m1 = repo
        .create_job(NewJob::new("B", mesh()), 1_000)
        .await
        .unwrap()
        .job_id;
    let m2 = repo
        .create_job(NewJob::new("B", mesh()), 1_001)
        .await
        .unwrap()
        .job_id;
    repo.accumulate_batch(&mesh(), "B", &m1).await.unwrap();
    repo.accumulate_batch(&mesh(), "B", &m2).await.unwrap();

    let (batch_id, size) = repo
        .finalize_batch(&mesh(), "B", 5, 2_000)
        .await
        .unwrap()
        .expect("non-empty batch");
    assert_eq!(size, 2);

    let members = repo.batch_jobs(&batch_id).await.unwrap();
    assert_eq!(members, vec![m1.clone(), m2.clone()]);
    for member in [&m1, &m2] {
        let meta = repo.get_meta(member).await.unwrap().unwrap();
        assert_eq!(meta.status, JobStatus::Batched);
    }

    // The batch id is what gets claimed now.
    let req = open_claim("srv-batch");
    let claimed = repo.claim_job(&req, 3_000).await.unwrap().unwrap();
    assert_eq!(claimed.as_str(), batch_id.as_str());
    assert_eq!(repo.claim_job(&req, 3_001).await.unwrap(), None);

    // An empty accumulator does not create a batch.
    assert!(repo
        .finalize_batch(&mesh(), "B", 5, 4_000)
        .await
        .unwrap()
        .is_none());
}

/// DLQ requeue resets accounting and makes the job claimable again.
#[tokio::test]
#[ignore = "requires Redis"]
async fn dlq_requeue_resets_and_enqueues() {
    let (_store, repo) = test_repo("dlqreq").await;

    let config = JobConfig {
        retry: Some(RetryConfig {
            max_attempts: 1,
            ..Default::default()
        }),
        ..Default::default()
    };
    let job_id = repo
        .create_job(NewJob::new("flaky", mesh()).with_config(config), 1_000)
        .await
        .unwrap()
        .job_id;

    let req = open_claim("srv-dlq");
    assert_eq!(repo.claim_job(&req, 2_000).await.unwrap(), Some(job_id.clone()));
    let err = JobErrorRecord::new(ErrorCode::Other(4500), "fatal-ish");
    let outcome = repo
        .retry_job(&job_id, &req.server_id, &err, 2_000, Some(0.0))
        .await
        .unwrap();
    assert!(outcome.moved_to_dlq);
    assert_eq!(repo.dlq_len(&mesh()).await.unwrap(), 1);

    assert!(repo.requeue_from_dlq(&job_id, 3_000).await.unwrap());
    assert_eq!(repo.dlq_len(&mesh()).await.unwrap(), 0);
    let meta = repo.get_meta(&job_id).await.unwrap().unwrap();
    assert_eq!(meta.status, JobStatus::Pending);
    assert_eq!(meta.attempt, 0);
    assert_eq!(repo.claim_job(&req, 3_001).await.unwrap(), Some(job_id));
}

/// Ownership guard: a worker cannot finalize a job another worker owns.
#[tokio::test]
#[ignore = "requires Redis"]
async fn complete_requires_ownership() {
    let (_store, repo) = test_repo("own").await;

    let job_id = repo
        .create_job(NewJob::new("guarded", mesh()), 1_000)
        .await
        .unwrap()
        .job_id;
    let req = open_claim("srv-owner");
    assert_eq!(repo.claim_job(&req, 2_000).await.unwrap(), Some(job_id.clone()));

    let thief = ServerId::from_string("srv-thief");
    let result = repo
        .complete_job(&job_id, &thief, JobStatus::Completed, None, 2_500)
        .await;
    assert!(result.is_err());

    // The rightful owner still can.
    let done = repo
        .complete_job(&job_id, &req.server_id, JobStatus::Completed, None, 2_600)
        .await
        .unwrap();
    assert_eq!(done.processing_time_ms, 600);
}

/// Progress writes are single-key and clamped.
#[tokio::test]
#[ignore = "requires Redis"]
async fn progress_updates_are_clamped() {
    let (_store, repo) = test_repo("prog").await;

    let job_id = repo
        .create_job(NewJob::new("longrun", mesh()), 1_000)
        .await
        .unwrap()
        .job_id;
    repo.update_progress(&job_id, 150.0, 1_500).await.unwrap();
    let meta = repo.get_meta(&job_id).await.unwrap().unwrap();
    assert!((meta.progress - 100.0).abs() < f64::EPSILON);
}
