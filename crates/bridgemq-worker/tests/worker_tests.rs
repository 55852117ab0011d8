//! Worker/maintenance integration tests. Each test runs under its own
//! namespace so parallel runs against a shared Redis do not interfere.

use std::sync::Arc;
use std::time::Duration;

use bridgemq_models::{
    ErrorCode, JobConfig, JobErrorRecord, JobStatus, MatchMode, MeshId, NewJob, RetryConfig,
    ServerId, TargetConfig,
};
use bridgemq_store::{now_ms, ClaimRequest, JobRepository, Store, StoreConfig};
use bridgemq_worker::{HandlerOutcome, HandlerRegistry, Worker, WorkerConfig, WorkerEvent};

async fn test_repo(tag: &str) -> Arc<JobRepository> {
    dotenvy::dotenv().ok();
    let config = StoreConfig {
        namespace: format!("bmqwtest-{}-{}", tag, uuid::Uuid::new_v4().simple()),
        ..StoreConfig::from_env()
    };
    let store = Arc::new(Store::connect(config).await.expect("connect store"));
    Arc::new(JobRepository::new(store))
}

fn mesh() -> MeshId {
    MeshId::from_string("mesh-w")
}

fn claim_with_caps(server: &str, caps: &[&str]) -> ClaimRequest {
    ClaimRequest {
        mesh_id: mesh(),
        server_id: ServerId::from_string(server),
        stack: "rust".to_string(),
        region: "eu-west".to_string(),
        capabilities: caps.iter().map(|c| c.to_string()).collect(),
    }
}

/// S5: a crashed worker's job is recovered with stalledCount accounting,
/// then dead-lettered on the third stall.
#[tokio::test]
#[ignore = "requires Redis"]
async fn stall_recovery_then_dlq() {
    let repo = test_repo("stall").await;
    let stall_timeout_ms = 300_000i64;

    let job_id = repo
        .create_job(NewJob::new("sticky", mesh()), 1_000)
        .await
        .unwrap()
        .job_id;

    let req = claim_with_caps("srv-crashy", &[]);
    let mut t = 2_000i64;
    for round in 1..=2u32 {
        let claimed = repo.claim_job(&req, t).await.unwrap();
        assert_eq!(claimed, Some(job_id.clone()), "round {round}");

        // The worker "dies"; past the stall timeout the detector recovers it.
        t += stall_timeout_ms + 1;
        let outcome = repo.detect_stalled(stall_timeout_ms, 3, t).await.unwrap();
        assert_eq!(outcome.detected, 1);
        assert_eq!(outcome.recovered, 1);
        assert_eq!(outcome.moved_to_dlq, 0);

        let meta = repo.get_meta(&job_id).await.unwrap().unwrap();
        assert_eq!(meta.status, JobStatus::Pending);
        assert_eq!(meta.stalled_count, round);
        assert_eq!(meta.processed_by, None);

        // Re-queued at the recovery timestamp; claims must look past it.
        t += 1;
    }

    // Third stall hits the limit.
    let claimed = repo.claim_job(&req, t).await.unwrap();
    assert_eq!(claimed, Some(job_id.clone()));
    t += stall_timeout_ms + 1;
    let outcome = repo.detect_stalled(stall_timeout_ms, 3, t).await.unwrap();
    assert_eq!(outcome.moved_to_dlq, 1);

    let meta = repo.get_meta(&job_id).await.unwrap().unwrap();
    assert_eq!(meta.status, JobStatus::Failed);
    assert_eq!(meta.stalled_count, 3);
    let dlq = repo.dlq_entries(&mesh(), 10).await.unwrap();
    assert!(dlq.contains(&job_id));
}

/// S6: mode=all requires every listed capability.
#[tokio::test]
#[ignore = "requires Redis"]
async fn capability_routing_all_mode() {
    let repo = test_repo("route").await;

    let config = JobConfig {
        target: Some(TargetConfig {
            capabilities: vec!["gpu:cuda".to_string(), "video:ffmpeg".to_string()],
            mode: MatchMode::All,
            ..Default::default()
        }),
        ..Default::default()
    };
    let job_id = repo
        .create_job(NewJob::new("render", mesh()).with_config(config), 1_000)
        .await
        .unwrap()
        .job_id;

    // Worker A misses video:ffmpeg and must not claim.
    let a = claim_with_caps("srv-a", &["gpu:cuda"]);
    assert_eq!(repo.claim_job(&a, 2_000).await.unwrap(), None);

    // Worker B carries a superset and must claim.
    let b = claim_with_caps("srv-b", &["gpu:cuda", "video:ffmpeg", "email"]);
    assert_eq!(repo.claim_job(&b, 2_001).await.unwrap(), Some(job_id));
}

/// A duplicated value in a target dimension is set-like under mode=all: a
/// worker whose singleton value covers it must still claim.
#[tokio::test]
#[ignore = "requires Redis"]
async fn duplicated_target_dimension_all_mode_still_matches() {
    let repo = test_repo("dupdim").await;

    let config = JobConfig {
        target: Some(TargetConfig {
            stack: vec!["rust".to_string(), "rust".to_string()],
            mode: MatchMode::All,
            ..Default::default()
        }),
        ..Default::default()
    };
    let job_id = repo
        .create_job(NewJob::new("build", mesh()).with_config(config), 1_000)
        .await
        .unwrap()
        .job_id;

    // A worker on a different stack stays excluded.
    let mut other = claim_with_caps("srv-go", &[]);
    other.stack = "go".to_string();
    assert_eq!(repo.claim_job(&other, 2_000).await.unwrap(), None);

    // {rust} covers ["rust", "rust"] under all-mode set semantics.
    let rust = claim_with_caps("srv-rust", &[]);
    assert_eq!(repo.claim_job(&rust, 2_001).await.unwrap(), Some(job_id));
}

/// Wildcard capability targets resolve against worker capability strings.
#[tokio::test]
#[ignore = "requires Redis"]
async fn capability_routing_wildcards() {
    let repo = test_repo("wild").await;

    let config = JobConfig {
        target: Some(TargetConfig {
            capabilities: vec!["gpu:*".to_string()],
            mode: MatchMode::Any,
            ..Default::default()
        }),
        ..Default::default()
    };
    let job_id = repo
        .create_job(NewJob::new("gpuwork", mesh()).with_config(config), 1_000)
        .await
        .unwrap()
        .job_id;

    let cpu_only = claim_with_caps("srv-cpu", &["email", "cpu:avx2"]);
    assert_eq!(repo.claim_job(&cpu_only, 2_000).await.unwrap(), None);

    let gpu = claim_with_caps("srv-gpu", &["gpu:rocm"]);
    assert_eq!(repo.claim_job(&gpu, 2_001).await.unwrap(), Some(job_id));
}

/// End to end: a running worker claims, executes the registered handler,
/// stores the result, and shuts down gracefully.
#[tokio::test]
#[ignore = "requires Redis"]
async fn worker_executes_registered_handler() {
    let repo = test_repo("exec").await;

    let mut registry = HandlerRegistry::new();
    registry.register_fn("double", |job, ctx| async move {
        ctx.progress(50.0).await;
        let input: serde_json::Value = serde_json::from_slice(&job.payload).unwrap();
        let n = input["n"].as_i64().unwrap();
        HandlerOutcome::Success(Some(serde_json::json!({ "doubled": n * 2 })))
    });

    let config = WorkerConfig {
        server_id: ServerId::from_string("srv-exec"),
        mesh_id: mesh(),
        concurrency: 2,
        ..Default::default()
    };
    let worker = Arc::new(Worker::new(config, Arc::clone(&repo), registry));
    let mut events = worker.subscribe_events();

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    let job_id = repo
        .create_job(
            NewJob::new("double", mesh())
                .with_json_payload(&serde_json::json!({"n": 21}))
                .unwrap(),
            now_ms(),
        )
        .await
        .unwrap()
        .job_id;

    // Wait for the completion event.
    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::JobComplete { job_id: done, .. }) if done == job_id => break,
                Ok(_) => {}
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await;
    assert!(completed.is_ok(), "job did not complete in time");

    let job = repo.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.meta.status, JobStatus::Completed);
    assert_eq!(job.result.unwrap()["doubled"], 42);

    worker.shutdown();
    runner.await.unwrap().unwrap();
}

/// A failure with a non-retryable code is finalized, never retried.
#[tokio::test]
#[ignore = "requires Redis"]
async fn non_retryable_failure_is_terminal() {
    let repo = test_repo("terminal").await;

    let mut registry = HandlerRegistry::new();
    registry.register_fn("parse", |_job, _ctx| async move {
        HandlerOutcome::Retry(JobErrorRecord::new(
            ErrorCode::InvalidPayload,
            "payload did not decode",
        ))
    });

    let config = WorkerConfig {
        server_id: ServerId::from_string("srv-terminal"),
        mesh_id: mesh(),
        concurrency: 1,
        ..Default::default()
    };
    let worker = Arc::new(Worker::new(config, Arc::clone(&repo), registry));
    let mut events = worker.subscribe_events();

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    let job_id = repo
        .create_job(
            NewJob::new("parse", mesh()).with_config(JobConfig {
                retry: Some(RetryConfig {
                    max_attempts: 5,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            now_ms(),
        )
        .await
        .unwrap()
        .job_id;

    let failed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::JobFail {
                    job_id: done,
                    will_retry,
                    ..
                }) if done == job_id => {
                    assert!(!will_retry, "non-retryable code must not retry");
                    break;
                }
                Ok(_) => {}
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await;
    assert!(failed.is_ok(), "job did not fail in time");

    let job = repo.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.meta.status, JobStatus::Failed);
    // Attempt counter untouched: the retry script never ran.
    assert_eq!(job.meta.attempt, 0);
    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].code, ErrorCode::InvalidPayload);

    worker.shutdown();
    runner.await.unwrap().unwrap();
}

/// Retry accounting survives a real worker loop: an always-failing handler
/// walks the job into the DLQ.
#[tokio::test]
#[ignore = "requires Redis"]
async fn failing_handler_reaches_dlq_through_worker_loop() {
    let repo = test_repo("dlqloop").await;

    let mut registry = HandlerRegistry::new();
    registry.register_fn("always-fails", |_job, _ctx| async move {
        HandlerOutcome::Retry(JobErrorRecord::new(ErrorCode::Other(4500), "still broken"))
    });

    let config = WorkerConfig {
        server_id: ServerId::from_string("srv-dlqloop"),
        mesh_id: mesh(),
        concurrency: 1,
        ..Default::default()
    };
    let worker = Arc::new(Worker::new(config, Arc::clone(&repo), registry));

    let runner = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    let job_id = repo
        .create_job(
            NewJob::new("always-fails", mesh()).with_config(JobConfig {
                retry: Some(RetryConfig {
                    max_attempts: 2,
                    base_delay_ms: 100,
                    max_delay_ms: 200,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            now_ms(),
        )
        .await
        .unwrap()
        .job_id;

    // Drive promotion manually at the test's pace.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        repo.promote_delayed(100, now_ms()).await.unwrap();
        let meta = repo.get_meta(&job_id).await.unwrap().unwrap();
        if meta.status == JobStatus::Failed {
            assert_eq!(meta.attempt, 2);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job never reached the DLQ (status {:?})",
            meta.status
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let dlq = repo.dlq_entries(&mesh(), 10).await.unwrap();
    assert!(dlq.contains(&job_id));

    worker.shutdown();
    runner.await.unwrap().unwrap();
}
