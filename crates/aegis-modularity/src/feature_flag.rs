//! Feature flags: named predicates evaluated against a caller-supplied
//! context key, with deterministic percentage bucketing (§4.10).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// How a [`FeatureFlag`] decides its outcome for a given context key.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FlagStrategy {
    AlwaysOn,
    AlwaysOff,
    /// `0..=100`, the percentage of context keys that evaluate true.
    Percentage(u8),
    Whitelist(BTreeSet<String>),
    /// An operator-triggered emergency off, distinct from a configured
    /// `AlwaysOff` for audit purposes — it always evaluates false.
    KillSwitch,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FeatureFlag {
    pub name: String,
    pub strategy: FlagStrategy,
}

impl FeatureFlag {
    pub fn new(name: impl Into<String>, strategy: FlagStrategy) -> Self {
        FeatureFlag {
            name: name.into(),
            strategy,
        }
    }

    /// Evaluate this flag for `context_key` (e.g. an instrument symbol or
    /// operator id). Percentage bucketing hashes `name|context_key` with
    /// SHA-256 so the same key always lands in the same bucket — using
    /// `DefaultHasher` here would make evaluation unstable across Rust
    /// releases, and `sha2` is already a workspace dependency for audit
    /// hashing.
    pub fn evaluate(&self, context_key: &str) -> bool {
        match &self.strategy {
            FlagStrategy::AlwaysOn => true,
            FlagStrategy::AlwaysOff => false,
            FlagStrategy::KillSwitch => false,
            FlagStrategy::Whitelist(set) => set.contains(context_key),
            FlagStrategy::Percentage(pct) => {
                let pct = (*pct).min(100);
                bucket(&self.name, context_key) < pct as u64
            }
        }
    }
}

/// Deterministic bucket in `0..100` for `name|context_key`.
fn bucket(name: &str, context_key: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    hasher.update(context_key.as_bytes());
    let digest = hasher.finalize();
    let mut acc = [0u8; 8];
    acc.copy_from_slice(&digest[0..8]);
    u64::from_be_bytes(acc) % 100
}

/// A before/after change to a flag, recorded for `flag_audit`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FlagTransition {
    pub flag_name: String,
    pub before: Option<FlagStrategy>,
    pub after: FlagStrategy,
    pub operator: String,
    pub at: DateTime<Utc>,
}

/// Read-mostly map of active flags, with a pending-transition log that
/// `aegis-runtime` drains into `flag_audit` and `aegis-audit`.
#[derive(Default)]
pub struct FlagRegistry {
    flags: BTreeMap<String, FeatureFlag>,
    pending: Vec<FlagTransition>,
}

impl FlagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown flags default to off — evaluating an unregistered flag never
    /// silently enables behavior.
    pub fn evaluate(&self, name: &str, context_key: &str) -> bool {
        self.flags
            .get(name)
            .map(|f| f.evaluate(context_key))
            .unwrap_or(false)
    }

    pub fn set_flag(&mut self, name: &str, strategy: FlagStrategy, operator: &str) {
        let before = self.flags.get(name).map(|f| f.strategy.clone());
        self.flags
            .insert(name.to_string(), FeatureFlag::new(name, strategy.clone()));
        self.pending.push(FlagTransition {
            flag_name: name.to_string(),
            before,
            after: strategy,
            operator: operator.to_string(),
            at: Utc::now(),
        });
    }

    pub fn get(&self, name: &str) -> Option<&FeatureFlag> {
        self.flags.get(name)
    }

    /// Drain transitions recorded since the last drain, for persistence.
    pub fn drain_transitions(&mut self) -> Vec<FlagTransition> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_on_and_off() {
        assert!(FeatureFlag::new("f", FlagStrategy::AlwaysOn).evaluate("any"));
        assert!(!FeatureFlag::new("f", FlagStrategy::AlwaysOff).evaluate("any"));
        assert!(!FeatureFlag::new("f", FlagStrategy::KillSwitch).evaluate("any"));
    }

    #[test]
    fn whitelist_membership() {
        let mut set = BTreeSet::new();
        set.insert("BTCZAR".to_string());
        let flag = FeatureFlag::new("f", FlagStrategy::Whitelist(set));
        assert!(flag.evaluate("BTCZAR"));
        assert!(!flag.evaluate("ETHZAR"));
    }

    #[test]
    fn percentage_is_deterministic_per_key() {
        let flag = FeatureFlag::new("f", FlagStrategy::Percentage(50));
        let first = flag.evaluate("operator-1");
        let second = flag.evaluate("operator-1");
        assert_eq!(first, second);
    }

    #[test]
    fn percentage_zero_is_always_off_and_hundred_always_on() {
        let off = FeatureFlag::new("f", FlagStrategy::Percentage(0));
        let on = FeatureFlag::new("f", FlagStrategy::Percentage(100));
        for key in ["a", "b", "c", "operator-9"] {
            assert!(!off.evaluate(key));
            assert!(on.evaluate(key));
        }
    }

    #[test]
    fn registry_unknown_flag_defaults_off() {
        let reg = FlagRegistry::new();
        assert!(!reg.evaluate("nonexistent", "any"));
    }

    #[test]
    fn registry_records_transition_on_set() {
        let mut reg = FlagRegistry::new();
        reg.set_flag("killswitch_live", FlagStrategy::AlwaysOn, "operator-1");
        assert!(reg.evaluate("killswitch_live", "any"));
        let drained = reg.drain_transitions();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].before, None);
        assert!(reg.drain_transitions().is_empty());
    }
}
