//! Enumerated job configuration.
//!
//! Every behavior knob a job can carry is spelled out here as a typed field;
//! there is no freeform option bag. The JSON shape (camelCase, nested
//! sections) is what gets stored under the job's config key and what the
//! claim/complete/retry scripts decode.

use serde::{Deserialize, Serialize};

use crate::id::JobId;

/// Lowest schedulable priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest schedulable priority (claimed first).
pub const MAX_PRIORITY: u8 = 10;
/// Priority assigned when none is requested.
pub const DEFAULT_PRIORITY: u8 = 5;

/// When a job should first become eligible to run.
///
/// `Cron` is carried for external schedulers; the core only ever honors the
/// resolved `scheduledFor` timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Schedule {
    /// Run after a relative delay in milliseconds.
    Delay(i64),
    /// Run at an absolute millisecond timestamp.
    RunAt(i64),
    /// Cron expression, evaluated outside the core.
    #[serde(rename_all = "camelCase")]
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
}

impl Schedule {
    /// Resolve to an absolute `scheduledFor` timestamp, given `now`.
    /// `Cron` resolves to `now`; callers that want cron semantics compute the
    /// next occurrence themselves and pass `RunAt`.
    pub fn resolve(&self, now_ms: i64) -> i64 {
        match self {
            Schedule::Delay(ms) => now_ms + (*ms).max(0),
            Schedule::RunAt(at) => *at,
            Schedule::Cron { .. } => now_ms,
        }
    }
}

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

impl Backoff {
    pub fn as_str(self) -> &'static str {
        match self {
            Backoff::Exponential => "exponential",
            Backoff::Linear => "linear",
            Backoff::Fixed => "fixed",
        }
    }
}

/// Retry behavior for handler failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Attempts before the job is dead-lettered.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
    /// When false, any failure is terminal.
    pub enabled: bool,
    /// Uniform jitter applied to computed delays, as a fraction in [0, 1].
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            enabled: true,
            jitter_factor: 0.2,
        }
    }
}

/// How target dimensions are combined when matching a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Non-empty intersection per dimension.
    #[default]
    Any,
    /// Required set must be a subset of the worker's set.
    All,
}

/// Routing target restricting which workers may claim the job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetConfig {
    /// Pin to one specific server id; overrides every other dimension.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<String>,
    /// Required capabilities; `*` and `prefix:*` wildcards are honored.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub region: Vec<String>,
    pub mode: MatchMode,
}

impl TargetConfig {
    /// True when no dimension restricts routing.
    pub fn is_open(&self) -> bool {
        self.server.as_deref().map_or(true, str::is_empty)
            && self.stack.is_empty()
            && self.capabilities.is_empty()
            && self.region.is_empty()
    }
}

/// Fixed-window rate limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Bucket key; jobs sharing a key share a window.
    pub key: String,
    pub max: u32,
    pub window_seconds: u32,
    /// Cap on concurrently active jobs in this bucket, checked at claim time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
}

/// Idempotent-create window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyConfig {
    pub key: String,
    /// Seconds the key maps to the first job id. Default one hour.
    #[serde(default = "default_idempotency_window")]
    pub window: u32,
}

fn default_idempotency_window() -> u32 {
    3_600
}

/// Key TTLs for the job's stored state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleConfig {
    /// Seconds applied to meta/config/payload/result keys. None = keep.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
}

/// Miscellaneous storage behavior.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BehaviorConfig {
    /// Delete all job keys once the job completes successfully.
    pub remove_on_complete: bool,
    /// Enable fingerprint-based deduplication of (type, payload).
    pub deduplication: bool,
}

/// Template for a successor job enqueued when a chain entry fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplate {
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Successor payload as JSON; serialized to bytes at creation.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Box<JobConfig>>,
}

/// Successor templates selected by the parent's final status.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<JobTemplate>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<JobTemplate>,
}

impl ChainConfig {
    pub fn is_empty(&self) -> bool {
        self.on_success.is_empty() && self.on_failure.is_empty()
    }
}

/// Jobs that must complete before this one becomes pending.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DependenciesConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wait_for: Vec<JobId>,
}

/// The full enumerated configuration of a job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency: Option<IdempotencyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub behavior: Option<BehaviorConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<DependenciesConfig>,
}

impl JobConfig {
    /// Effective priority, clamped to the valid range.
    pub fn effective_priority(&self) -> u8 {
        self.priority
            .unwrap_or(DEFAULT_PRIORITY)
            .clamp(MIN_PRIORITY, MAX_PRIORITY)
    }

    /// Retry settings with defaults filled in.
    pub fn effective_retry(&self) -> RetryConfig {
        self.retry.clone().unwrap_or_default()
    }

    /// True when the schedule carries both a delay and an absolute time.
    /// (`delay` and `runAt` are mutually exclusive; the sum-typed schedule
    /// makes the conflict unrepresentable, so this only flags the legacy
    /// double-keyed JSON form rejected at decode time.)
    pub fn validate(&self) -> Result<(), String> {
        if let Some(p) = self.priority {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&p) {
                return Err(format!("priority {p} outside {MIN_PRIORITY}..={MAX_PRIORITY}"));
            }
        }
        if let Some(retry) = &self.retry {
            if retry.max_attempts == 0 {
                return Err("retry.maxAttempts must be >= 1".into());
            }
            if !(0.0..=1.0).contains(&retry.jitter_factor) {
                return Err("retry.jitterFactor must be in [0, 1]".into());
            }
        }
        if let Some(rl) = &self.rate_limit {
            if rl.key.is_empty() {
                return Err("rateLimit.key must be non-empty".into());
            }
            if rl.max == 0 || rl.window_seconds == 0 {
                return Err("rateLimit.max and windowSeconds must be >= 1".into());
            }
        }
        if let Some(idem) = &self.idempotency {
            if idem.key.is_empty() {
                return Err("idempotency.key must be non-empty".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_json_shape() {
        let delay = Schedule::Delay(5_000);
        assert_eq!(serde_json::to_string(&delay).unwrap(), r#"{"delay":5000}"#);

        let run_at = Schedule::RunAt(1_700_000_000_000);
        assert_eq!(
            serde_json::to_string(&run_at).unwrap(),
            r#"{"runAt":1700000000000}"#
        );

        let parsed: Schedule = serde_json::from_str(r#"{"delay":250}"#).unwrap();
        assert_eq!(parsed.resolve(1_000), 1_250);
    }

    #[test]
    fn retry_defaults() {
        let retry: RetryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.backoff, Backoff::Exponential);
        assert_eq!(retry.base_delay_ms, 1_000);
        assert_eq!(retry.max_delay_ms, 60_000);
        assert!(retry.enabled);
        assert!((retry.jitter_factor - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn config_camel_case_wire_shape() {
        let cfg = JobConfig {
            retry: Some(RetryConfig {
                max_attempts: 5,
                ..Default::default()
            }),
            rate_limit: Some(RateLimitConfig {
                key: "emails".into(),
                max: 10,
                window_seconds: 60,
                max_concurrent: None,
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["retry"]["maxAttempts"], 5);
        assert_eq!(json["rateLimit"]["windowSeconds"], 60);
    }

    #[test]
    fn priority_validation() {
        let cfg = JobConfig {
            priority: Some(11),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = JobConfig {
            priority: Some(10),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.effective_priority(), 10);
        assert_eq!(JobConfig::default().effective_priority(), DEFAULT_PRIORITY);
    }

    #[test]
    fn target_openness() {
        assert!(TargetConfig::default().is_open());
        let t = TargetConfig {
            capabilities: vec!["gpu:*".into()],
            ..Default::default()
        };
        assert!(!t.is_open());
    }
}
