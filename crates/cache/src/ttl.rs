//! Per-entity expiry policy.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

pub const MODULE: &str = "module";
pub const VERSION: &str = "version";
pub const VERSION_FULL: &str = "version-full";
pub const VERSION_LIST: &str = "version-list";
pub const LATEST: &str = "latest";
pub const COMPILED: &str = "compiled";
pub const PROTO_CONTENT: &str = "proto-content";
pub const DEPENDENCY_TREE: &str = "dependency-tree";

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Built-in expiry per entity type.
pub const DEFAULTS: [(&str, Duration); 8] = [
    (MODULE, Duration::from_secs(HOUR)),
    (VERSION, Duration::from_secs(HOUR)),
    (VERSION_FULL, Duration::from_secs(30 * MINUTE)),
    (VERSION_LIST, Duration::from_secs(5 * MINUTE)),
    (LATEST, Duration::from_secs(MINUTE)),
    (COMPILED, Duration::from_secs(24 * HOUR)),
    (PROTO_CONTENT, Duration::from_secs(24 * HOUR)),
    (DEPENDENCY_TREE, Duration::from_secs(HOUR)),
];

/// Mutable mapping from entity type to time-to-live.
///
/// An unknown entity type has a zero TTL, which the cache layer reads as
/// "do not cache".
#[derive(Debug)]
pub struct TtlPolicy {
    ttls: RwLock<HashMap<String, Duration>>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from_iter(DEFAULTS.iter().map(|&(kind, ttl)| (kind.to_string(), ttl)))
    }
}

impl FromIterator<(String, Duration)> for TtlPolicy {
    fn from_iter<I: IntoIterator<Item = (String, Duration)>>(iter: I) -> Self {
        Self { ttls: RwLock::new(iter.into_iter().collect()) }
    }
}

impl TtlPolicy {
    /// The defaults, with `overrides` applied on top.
    pub fn with_overrides(overrides: impl IntoIterator<Item = (String, Duration)>) -> Self {
        let policy = Self::default();
        for (kind, ttl) in overrides {
            policy.set(&kind, ttl);
        }
        policy
    }

    pub fn get(&self, kind: &str) -> Duration {
        // A poisoned lock still holds a usable map; a writer cannot leave it
        // half-updated.
        let ttls = self.ttls.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        ttls.get(kind).copied().unwrap_or(Duration::ZERO)
    }

    pub fn set(&self, kind: &str, ttl: Duration) {
        let mut ttls = self.ttls.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        ttls.insert(kind.to_string(), ttl);
    }

    /// Snapshot of every configured type.
    pub fn all(&self) -> HashMap<String, Duration> {
        self.ttls.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(MODULE, 3600)]
    #[case(VERSION, 3600)]
    #[case(VERSION_FULL, 1800)]
    #[case(VERSION_LIST, 300)]
    #[case(LATEST, 60)]
    #[case(COMPILED, 86400)]
    #[case(PROTO_CONTENT, 86400)]
    #[case(DEPENDENCY_TREE, 3600)]
    fn test_defaults(#[case] kind: &str, #[case] secs: u64) {
        assert_eq!(TtlPolicy::default().get(kind), Duration::from_secs(secs));
    }

    #[test]
    fn test_unknown_kind_is_zero() {
        assert_eq!(TtlPolicy::default().get("webhook"), Duration::ZERO);
    }

    #[test]
    fn test_set_at_runtime() {
        let policy = TtlPolicy::default();
        policy.set(LATEST, Duration::from_secs(5));
        policy.set("webhook", Duration::from_secs(10));
        assert_eq!(policy.get(LATEST), Duration::from_secs(5));
        assert_eq!(policy.get("webhook"), Duration::from_secs(10));
        assert_eq!(policy.get(MODULE), Duration::from_secs(3600));
    }

    #[test]
    fn test_overrides() {
        let policy = TtlPolicy::with_overrides([(MODULE.to_string(), Duration::ZERO)]);
        assert_eq!(policy.get(MODULE), Duration::ZERO);
        assert_eq!(policy.all().len(), DEFAULTS.len());
    }
}
