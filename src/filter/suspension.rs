//! Per-user, time-boxed filter suspensions.
//!
//! At most one suspension exists per user. There is no background timer:
//! validity is computed from the wall clock on every read, and a read that
//! finds an expired entry evicts it. Reads after that simply find nothing.

use super::keys::AppScope;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// A temporary override that disables filtering for a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSuspension {
    /// Apps the suspension covers.
    pub scope: AppScope,
    /// Requested length in seconds.
    pub duration_seconds: u64,
    /// Wall-clock expiry.
    pub expires_at: DateTime<Utc>,
}

impl FilterSuspension {
    /// Suspension starting now and lasting `duration_seconds`.
    pub fn starting_now(scope: AppScope, duration_seconds: u64) -> Self {
        Self::starting_at(scope, duration_seconds, Utc::now())
    }

    /// Suspension starting at `now` and lasting `duration_seconds`.
    pub fn starting_at(scope: AppScope, duration_seconds: u64, now: DateTime<Utc>) -> Self {
        let seconds = i64::try_from(duration_seconds).unwrap_or(i64::MAX);
        let expires_at = ChronoDuration::try_seconds(seconds)
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            scope,
            duration_seconds,
            expires_at,
        }
    }

    /// Whether the suspension is still in force at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Registry of suspensions keyed by OS user id.
#[derive(Debug, Default)]
pub struct FilterSuspensions {
    entries: RwLock<HashMap<u32, FilterSuspension>>,
}

impl FilterSuspensions {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a suspension for a user, replacing any existing one.
    pub fn set(&self, suspension: FilterSuspension, user_id: u32) {
        debug!(
            "Suspension for user {} until {}",
            user_id, suspension.expires_at
        );
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id, suspension);
    }

    /// Active suspension for a user, evicting it if it has expired.
    pub fn get(&self, user_id: u32) -> Option<FilterSuspension> {
        self.get_at(user_id, Utc::now())
    }

    /// Like [`get`](Self::get) with an explicit clock reading.
    pub fn get_at(&self, user_id: u32, now: DateTime<Utc>) -> Option<FilterSuspension> {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(&user_id) {
                None => return None,
                Some(s) if s.is_active_at(now) => return Some(s.clone()),
                Some(_) => {}
            }
        }

        // Expired: re-check under the write lock, a concurrent `set` may
        // have replaced the entry in between.
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&user_id) {
            Some(s) if s.is_active_at(now) => Some(s.clone()),
            Some(_) => {
                entries.remove(&user_id);
                debug!("Suspension for user {} expired and was evicted", user_id);
                None
            }
            None => None,
        }
    }

    /// Remove a user's suspension. Returns whether one existed.
    pub fn remove(&self, user_id: u32) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user_id)
            .is_some()
    }

    /// Number of stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_get_returns_active_suspension() {
        let suspensions = FilterSuspensions::new();
        suspensions.set(
            FilterSuspension::starting_at(AppScope::Unrestricted, 60, at(0)),
            501,
        );

        let found = suspensions.get_at(501, at(30)).unwrap();
        assert_eq!(found.scope, AppScope::Unrestricted);
        assert_eq!(found.expires_at, at(60));
        assert!(suspensions.get_at(502, at(30)).is_none());
    }

    #[test]
    fn test_expired_read_evicts_idempotently() {
        let suspensions = FilterSuspensions::new();
        suspensions.set(
            FilterSuspension::starting_at(AppScope::WebBrowsers, 60, at(0)),
            501,
        );
        assert_eq!(suspensions.len(), 1);

        assert!(suspensions.get_at(501, at(60)).is_none());
        assert!(suspensions.is_empty());

        // Still gone, even if the clock were to read earlier again.
        assert!(suspensions.get_at(501, at(61)).is_none());
        assert!(suspensions.get_at(501, at(10)).is_none());
    }

    #[test]
    fn test_set_overwrites() {
        let suspensions = FilterSuspensions::new();
        suspensions.set(
            FilterSuspension::starting_at(AppScope::Unrestricted, 60, at(0)),
            501,
        );
        suspensions.set(
            FilterSuspension::starting_at(AppScope::WebBrowsers, 600, at(0)),
            501,
        );

        let found = suspensions.get_at(501, at(120)).unwrap();
        assert_eq!(found.scope, AppScope::WebBrowsers);
        assert_eq!(suspensions.len(), 1);
    }

    #[test]
    fn test_remove() {
        let suspensions = FilterSuspensions::new();
        suspensions.set(FilterSuspension::starting_now(AppScope::Unrestricted, 60), 501);
        assert!(suspensions.remove(501));
        assert!(!suspensions.remove(501));
        assert!(suspensions.get(501).is_none());
    }

    #[test]
    fn test_huge_duration_saturates() {
        let s = FilterSuspension::starting_at(AppScope::Unrestricted, u64::MAX, at(0));
        assert!(s.is_active_at(at(10_000_000)));
    }

    #[test]
    fn test_wire_format() {
        let s = FilterSuspension::starting_at(AppScope::Unrestricted, 300, at(0));
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"durationSeconds\":300"));
        assert!(json.contains("\"expiresAt\""));
    }
}
