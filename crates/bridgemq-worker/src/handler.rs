//! Job handlers and the type-keyed registry.
//!
//! Handlers return an explicit [`HandlerOutcome`] instead of signaling
//! through exceptions; the worker loop decides which store script the
//! outcome maps to.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use bridgemq_models::{Job, JobErrorRecord, JobId};
use bridgemq_store::{now_ms, JobRepository};

use crate::worker::WorkerEvent;

/// Per-execution context handed to handlers: progress reporting and the
/// job's identity. Detached contexts (tests, dry runs) report nowhere.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    repo: Option<Arc<JobRepository>>,
    events: Option<broadcast::Sender<WorkerEvent>>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        repo: Arc<JobRepository>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            job_id,
            repo: Some(repo),
            events: Some(events),
        }
    }

    /// A context wired to nothing; progress calls are dropped.
    pub fn detached(job_id: JobId) -> Self {
        Self {
            job_id,
            repo: None,
            events: None,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Report progress (0–100). Written to the job's meta and emitted as a
    /// worker event; failures are logged and swallowed.
    pub async fn progress(&self, progress: f64) {
        if let Some(repo) = &self.repo {
            if let Err(e) = repo
                .update_progress(&self.job_id, progress, now_ms())
                .await
            {
                warn!(job_id = %self.job_id, "Progress update failed: {}", e);
            }
        }
        if let Some(events) = &self.events {
            let _ = events.send(WorkerEvent::JobProgress {
                job_id: self.job_id.clone(),
                progress,
            });
        }
    }
}

/// What a handler decided about a job.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// Done; the optional value becomes the stored result.
    Success(Option<serde_json::Value>),
    /// Transient failure: retry subject to the job's retry policy and the
    /// eligibility classifier.
    Retry(JobErrorRecord),
    /// Terminal failure: no retry regardless of policy.
    Fail(JobErrorRecord),
}

/// A registered job handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: Job, ctx: JobContext) -> HandlerOutcome;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send,
{
    async fn run(&self, job: Job, ctx: JobContext) -> HandlerOutcome {
        (self.f)(job, ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Handlers keyed by job type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type, replacing any previous one.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    /// Register an async closure for a job type.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F)
    where
        F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        self.register(job_type, handler_fn(f));
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
