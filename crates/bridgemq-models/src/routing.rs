//! Worker/target matching.
//!
//! The claim script evaluates this same logic server-side; this module is the
//! canonical Rust expression of it, used for client-side validation and for
//! tests of the matching semantics.

use crate::config::{MatchMode, TargetConfig};
use crate::id::ServerId;

/// The routing-relevant identity of a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProfile {
    pub server_id: ServerId,
    /// Single-valued; treated as a singleton set when matching.
    pub stack: String,
    /// Single-valued; treated as a singleton set when matching.
    pub region: String,
    pub capabilities: Vec<String>,
}

impl WorkerProfile {
    pub fn new(server_id: impl Into<ServerId>) -> Self {
        Self {
            server_id: server_id.into(),
            stack: String::new(),
            region: String::new(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// True when this worker qualifies for the target.
    pub fn matches(&self, target: &TargetConfig) -> bool {
        // A pinned server short-circuits every other dimension.
        if let Some(server) = target.server.as_deref() {
            if !server.is_empty() {
                return self.server_id.as_str() == server;
            }
        }

        if !target.stack.is_empty()
            && !dimension_matches(target.mode, &target.stack, std::slice::from_ref(&self.stack))
        {
            return false;
        }
        if !target.region.is_empty()
            && !dimension_matches(
                target.mode,
                &target.region,
                std::slice::from_ref(&self.region),
            )
        {
            return false;
        }
        if !target.capabilities.is_empty() {
            let ok = match target.mode {
                MatchMode::Any => target
                    .capabilities
                    .iter()
                    .any(|pat| self.has_capability(pat)),
                MatchMode::All => target
                    .capabilities
                    .iter()
                    .all(|pat| self.has_capability(pat)),
            };
            if !ok {
                return false;
            }
        }
        true
    }

    fn has_capability(&self, pattern: &str) -> bool {
        self.capabilities
            .iter()
            .any(|cap| capability_matches(pattern, cap))
    }
}

fn dimension_matches(mode: MatchMode, required: &[String], worker: &[String]) -> bool {
    match mode {
        MatchMode::Any => required.iter().any(|r| worker.iter().any(|w| w == r)),
        MatchMode::All => required.iter().all(|r| worker.iter().any(|w| w == r)),
    }
}

/// Capability pattern matching: `*` matches any non-empty capability,
/// `prefix:*` matches any capability sharing the prefix, anything else is an
/// exact comparison.
pub fn capability_matches(pattern: &str, capability: &str) -> bool {
    if pattern == "*" {
        return !capability.is_empty();
    }
    if let Some(prefix) = pattern.strip_suffix(":*") {
        return capability
            .strip_prefix(prefix)
            .map_or(false, |rest| rest.starts_with(':'));
    }
    pattern == capability
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(caps: &[&str]) -> WorkerProfile {
        WorkerProfile::new("srv-1")
            .with_stack("rust")
            .with_region("eu-west")
            .with_capabilities(caps.iter().copied())
    }

    #[test]
    fn open_target_matches_everyone() {
        assert!(worker(&[]).matches(&TargetConfig::default()));
    }

    #[test]
    fn pinned_server_overrides_dimensions() {
        let target = TargetConfig {
            server: Some("srv-1".into()),
            capabilities: vec!["does-not-have".into()],
            ..Default::default()
        };
        assert!(worker(&[]).matches(&target));

        let target = TargetConfig {
            server: Some("srv-2".into()),
            ..Default::default()
        };
        assert!(!worker(&["anything"]).matches(&target));
    }

    #[test]
    fn all_mode_requires_subset() {
        let target = TargetConfig {
            capabilities: vec!["gpu:cuda".into(), "video:ffmpeg".into()],
            mode: MatchMode::All,
            ..Default::default()
        };
        // Missing one required capability.
        assert!(!worker(&["gpu:cuda"]).matches(&target));
        // Superset qualifies.
        assert!(worker(&["gpu:cuda", "video:ffmpeg", "email"]).matches(&target));
    }

    #[test]
    fn any_mode_requires_intersection() {
        let target = TargetConfig {
            capabilities: vec!["gpu:cuda".into(), "video:ffmpeg".into()],
            mode: MatchMode::Any,
            ..Default::default()
        };
        assert!(worker(&["video:ffmpeg"]).matches(&target));
        assert!(!worker(&["email"]).matches(&target));
    }

    #[test]
    fn wildcard_capabilities() {
        assert!(capability_matches("*", "anything"));
        assert!(!capability_matches("*", ""));
        assert!(capability_matches("gpu:*", "gpu:cuda"));
        assert!(capability_matches("gpu:*", "gpu:rocm:v6"));
        assert!(!capability_matches("gpu:*", "gpux:cuda"));
        assert!(!capability_matches("gpu:*", "gpu"));
        assert!(capability_matches("exact", "exact"));
        assert!(!capability_matches("exact", "exactly"));
    }

    #[test]
    fn stack_and_region_are_singleton_sets() {
        let target = TargetConfig {
            stack: vec!["rust".into(), "go".into()],
            region: vec!["eu-west".into()],
            mode: MatchMode::Any,
            ..Default::default()
        };
        assert!(worker(&[]).matches(&target));

        let target_all = TargetConfig {
            stack: vec!["rust".into(), "go".into()],
            mode: MatchMode::All,
            ..Default::default()
        };
        // A single-valued worker stack can never cover a two-element set.
        assert!(!worker(&[]).matches(&target_all));

        // A duplicated requirement is still one set element.
        let target_dup = TargetConfig {
            stack: vec!["rust".into(), "rust".into()],
            mode: MatchMode::All,
            ..Default::default()
        };
        assert!(worker(&[]).matches(&target_dup));
    }
}
