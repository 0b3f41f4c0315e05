//! In-memory policy cache.
//!
//! The loaded policy set is treated as immutable; `swap` replaces the whole
//! map atomically under the write lock, so readers observe either the old
//! set or the new one, never a mix.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ade_core::policy::{Policy, PolicyError};

/// Read-mostly cache of active policies, keyed by policy ID.
#[derive(Default)]
pub struct PolicyCache {
    inner: RwLock<HashMap<String, Arc<Policy>>>,
}

impl PolicyCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches a policy by ID.
    #[must_use]
    pub fn get(&self, policy_id: &str) -> Option<Arc<Policy>> {
        self.read().get(policy_id).cloned()
    }

    /// Inserts or replaces one policy. The policy is validated first; an
    /// invalid policy never enters the cache.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] when validation fails.
    pub fn put(&self, policy: Policy) -> Result<(), PolicyError> {
        policy.validate()?;
        self.write().insert(policy.policy_id.clone(), Arc::new(policy));
        Ok(())
    }

    /// Removes a policy. Returns whether it was present.
    pub fn remove(&self, policy_id: &str) -> bool {
        self.write().remove(policy_id).is_some()
    }

    /// Atomically replaces the whole cached set. Invalid policies reject
    /// the entire swap, leaving the current set in place.
    ///
    /// # Errors
    ///
    /// Returns the first [`PolicyError`] found in the new set.
    pub fn swap(&self, policies: Vec<Policy>) -> Result<(), PolicyError> {
        let mut next = HashMap::with_capacity(policies.len());
        for policy in policies {
            policy.validate()?;
            next.insert(policy.policy_id.clone(), Arc::new(policy));
        }
        *self.write() = next;
        Ok(())
    }

    /// Number of cached policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Policy>>> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Policy>>> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ade_core::policy::{
        ActionType, Condition, PolicyType, Rule, RuleAction,
    };

    use super::*;

    fn policy(id: &str) -> Policy {
        Policy {
            policy_id: id.to_string(),
            version: "1".to_string(),
            name: format!("policy {id}"),
            description: String::new(),
            policy_type: PolicyType::Autoscale,
            rules: vec![Rule {
                id: "r1".to_string(),
                name: "rule".to_string(),
                priority: 10,
                when: Condition::default(),
                action: RuleAction {
                    action_type: ActionType::ScaleUp,
                    target: None,
                    params: serde_json::Map::new(),
                    cost: 0.0,
                    risk: 0.0,
                },
                cooldown: None,
            }],
            defaults: BTreeMap::new(),
            effective_from: None,
            effective_until: None,
            is_active: true,
        }
    }

    #[test]
    fn test_put_get_remove() {
        let cache = PolicyCache::new();
        cache.put(policy("a")).unwrap();
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let cache = PolicyCache::new();
        let mut bad = policy("a");
        bad.rules.clear();
        assert!(cache.put(bad).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_swap_is_whole_map_replace() {
        let cache = PolicyCache::new();
        cache.put(policy("a")).unwrap();
        cache.put(policy("b")).unwrap();

        cache.swap(vec![policy("c")]).unwrap();
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_swap_keeps_current_set() {
        let cache = PolicyCache::new();
        cache.put(policy("a")).unwrap();

        let mut bad = policy("b");
        bad.rules.clear();
        assert!(cache.swap(vec![policy("c"), bad]).is_err());

        // The old set is untouched.
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_none());
    }
}
