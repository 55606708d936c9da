//! In-memory per-user rule state.
//!
//! Written only by the control plane, read on every flow. Keys are compiled
//! before the write lock is taken and stored behind an `Arc`, so a writer
//! holds the lock only for a pointer swap and readers clone the `Arc` and
//! release the lock immediately.

use super::keys::{CompiledKey, FilterKey};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Per-user keys plus the exempt-user set.
///
/// Users exempted by local configuration stay exempt whatever set the app
/// pushes later.
#[derive(Debug, Default)]
pub struct RuleStore {
    keys: RwLock<HashMap<u32, Arc<Vec<CompiledKey>>>>,
    exempt: RwLock<HashSet<u32>>,
    configured_exempt: HashSet<u32>,
}

impl RuleStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store whose exempt set always includes `user_ids`.
    pub fn with_configured_exempt(user_ids: impl IntoIterator<Item = u32>) -> Self {
        let configured_exempt: HashSet<u32> = user_ids.into_iter().collect();
        Self {
            exempt: RwLock::new(configured_exempt.clone()),
            configured_exempt,
            ..Self::default()
        }
    }

    /// Replace all keys for a user, preserving their order.
    ///
    /// Keys that fail to compile are skipped with a warning. Returns the
    /// number of keys stored.
    pub fn replace_keys(&self, user_id: u32, keys: &[FilterKey]) -> usize {
        let compiled: Vec<CompiledKey> = keys
            .iter()
            .filter_map(|key| match CompiledKey::compile(key) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    warn!("Skipping key {} for user {}: {}", key.id, user_id, e);
                    None
                }
            })
            .collect();
        let count = compiled.len();

        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id, Arc::new(compiled));

        debug!("Stored {} of {} keys for user {}", count, keys.len(), user_id);
        count
    }

    /// Snapshot of a user's keys in stored order.
    pub fn keys_for(&self, user_id: u32) -> Option<Arc<Vec<CompiledKey>>> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .cloned()
    }

    /// Drop all keys for a user. Returns whether the user had any stored.
    pub fn remove_user(&self, user_id: u32) -> bool {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user_id)
            .is_some()
    }

    /// Replace the pushed exempt users. Configured exemptions are kept.
    pub fn set_exempt_users(&self, user_ids: impl IntoIterator<Item = u32>) {
        let next: HashSet<u32> = user_ids
            .into_iter()
            .chain(self.configured_exempt.iter().copied())
            .collect();
        *self.exempt.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Whether a user is exempt from filtering.
    pub fn is_exempt(&self, user_id: u32) -> bool {
        self.exempt
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&user_id)
    }

    /// Current exempt users, sorted.
    pub fn exempt_users(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .exempt
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Users with stored keys.
    pub fn user_ids(&self) -> Vec<u32> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::keys::{AppScope, Key};
    use uuid::Uuid;

    fn domain_key(domain: &str) -> FilterKey {
        FilterKey {
            id: Uuid::new_v4(),
            key: Key::Domain {
                domain: domain.to_string(),
                scope: AppScope::Unrestricted,
            },
        }
    }

    #[test]
    fn test_replace_keys_preserves_order() {
        let store = RuleStore::new();
        let keys = vec![domain_key("a.com"), domain_key("b.com")];
        assert_eq!(store.replace_keys(501, &keys), 2);

        let stored = store.keys_for(501).unwrap();
        assert_eq!(stored[0].id, keys[0].id);
        assert_eq!(stored[1].id, keys[1].id);
        assert!(store.keys_for(502).is_none());
    }

    #[test]
    fn test_invalid_keys_are_skipped() {
        let store = RuleStore::new();
        let bad = FilterKey {
            id: Uuid::new_v4(),
            key: Key::DomainRegex {
                pattern: "[".to_string(),
                scope: AppScope::Unrestricted,
            },
        };
        assert_eq!(store.replace_keys(501, &[bad, domain_key("ok.com")]), 1);
        assert_eq!(store.keys_for(501).unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let store = RuleStore::new();
        store.replace_keys(501, &[domain_key("a.com")]);
        let snapshot = store.keys_for(501).unwrap();

        store.replace_keys(501, &[]);
        assert_eq!(snapshot.len(), 1);
        assert!(store.keys_for(501).unwrap().is_empty());
    }

    #[test]
    fn test_exempt_users() {
        let store = RuleStore::new();
        store.set_exempt_users([503, 501]);
        assert!(store.is_exempt(501));
        assert!(!store.is_exempt(502));
        assert_eq!(store.exempt_users(), vec![501, 503]);

        store.set_exempt_users([]);
        assert!(!store.is_exempt(501));
    }

    #[test]
    fn test_configured_exemptions_survive_pushes() {
        let store = RuleStore::with_configured_exempt([1002]);
        assert!(store.is_exempt(1002));

        store.set_exempt_users([501]);
        assert_eq!(store.exempt_users(), vec![501, 1002]);

        store.set_exempt_users([]);
        assert_eq!(store.exempt_users(), vec![1002]);
    }

    #[test]
    fn test_remove_user() {
        let store = RuleStore::new();
        store.replace_keys(501, &[domain_key("a.com")]);
        assert_eq!(store.user_ids(), vec![501]);
        assert!(store.remove_user(501));
        assert!(!store.remove_user(501));
        assert!(store.keys_for(501).is_none());
    }
}
