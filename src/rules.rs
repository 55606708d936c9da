//! Where the app gets a user's rules from.
//!
//! The backend API that owns rules sits outside this crate; the app only
//! needs "fetch the full current rule set". [`FileRuleSource`] serves a
//! JSON rule set from disk and backs the CLI.

use crate::filter::{AppIdManifest, FilterKey, FilterSuspension};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors fetching a rule set.
#[derive(Debug, Error)]
pub enum RulesError {
    /// The rule file couldn't be read.
    #[error("Failed to read rules from {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The rule file isn't a valid rule set.
    #[error("Failed to parse rules from {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// The source is temporarily unable to answer.
    #[error("Rule source unavailable: {0}")]
    Unavailable(String),
}

/// Result type for rule fetching.
pub type RulesResult<T> = Result<T, RulesError>;

/// Everything the filter needs to enforce one user's rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    /// OS user the rules apply to.
    pub user_id: u32,
    /// App-id manifest.
    #[serde(default)]
    pub manifest: AppIdManifest,
    /// Keys in evaluation order.
    #[serde(default)]
    pub keys: Vec<FilterKey>,
    /// Current suspension, if any.
    #[serde(default)]
    pub suspension: Option<FilterSuspension>,
    /// Users excluded from filtering on this machine.
    #[serde(default)]
    pub exempt_users: Vec<u32>,
}

impl RuleSet {
    /// Read a rule set from a JSON file.
    pub fn load(path: &Path) -> RulesResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| RulesError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(path, &contents)
    }

    fn parse(path: &Path, contents: &str) -> RulesResult<Self> {
        serde_json::from_str(contents).map_err(|e| RulesError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Provider of the current rule set.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Fetch the full current rule set.
    async fn fetch(&self) -> RulesResult<RuleSet>;
}

/// Rule set read from a JSON file on every fetch.
#[derive(Debug, Clone)]
pub struct FileRuleSource {
    path: PathBuf,
}

impl FileRuleSource {
    /// Serve rules from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RuleSource for FileRuleSource {
    async fn fetch(&self) -> RulesResult<RuleSet> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RulesError::Read {
                path: self.path.clone(),
                source: e,
            })?;
        let rules = RuleSet::parse(&self.path, &contents)?;
        debug!(
            "Read {} keys for user {} from {:?}",
            rules.keys.len(),
            rules.user_id,
            self.path
        );
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AppScope, Key};
    use tempfile::tempdir;

    const RULES: &str = r#"{
        "userId": 1001,
        "keys": [
            {"id": "5f0c6f5e-0d3c-4d59-9a5e-3c1d8f0a2b11",
             "key": {"type": "domain", "domain": "example.com", "scope": {"type": "unrestricted"}}}
        ],
        "exemptUsers": [1002]
    }"#;

    #[tokio::test]
    async fn test_file_source_reads_rules() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, RULES).unwrap();

        let rules = FileRuleSource::new(&path).fetch().await.unwrap();
        assert_eq!(rules.user_id, 1001);
        assert_eq!(rules.exempt_users, vec![1002]);
        assert_eq!(rules.keys.len(), 1);
        assert_eq!(rules.keys[0].key.scope(), &AppScope::Unrestricted);
        assert!(matches!(rules.keys[0].key, Key::Domain { .. }));
        assert!(rules.suspension.is_none());
        assert_eq!(rules.manifest, AppIdManifest::default());
    }

    #[tokio::test]
    async fn test_file_source_rereads_on_every_fetch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, RULES).unwrap();
        let source = FileRuleSource::new(&path);
        assert_eq!(source.fetch().await.unwrap().keys.len(), 1);

        std::fs::write(&path, r#"{"userId": 1001}"#).unwrap();
        assert!(source.fetch().await.unwrap().keys.is_empty());
    }

    #[test]
    fn test_load_errors_name_the_file() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(RuleSet::load(&missing), Err(RulesError::Read { .. })));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        match RuleSet::load(&bad) {
            Err(RulesError::Parse { path, .. }) => assert_eq!(path, bad),
            other => unreachable!("Expected parse error, got {:?}", other),
        }
    }
}
