//! Error types for filter engine setup.
//!
//! Flow evaluation itself never fails; these errors only come from
//! compiling pushed keys and loading the app-id manifest.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from preparing filter state.
#[derive(Debug, Error)]
pub enum FilterError {
    /// A `domainRegex` key carried a pattern that does not compile.
    #[error("Invalid domain regex '{pattern}': {source}")]
    InvalidRegex {
        /// The offending pattern.
        pattern: String,
        /// The underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// A `domain` or `anySubdomain` key named no domain.
    #[error("Invalid domain key '{0}': empty domain")]
    InvalidDomain(String),

    /// A `path` key was not of the form `host/path`.
    #[error("Invalid path key '{0}': expected host/path")]
    InvalidPath(String),

    /// Failed to read the app-id manifest.
    #[error("Failed to read app manifest {path}: {source}")]
    ManifestRead {
        /// Manifest location.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the app-id manifest.
    #[error("Failed to parse app manifest {path}: {source}")]
    ManifestParse {
        /// Manifest location.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for filter setup operations.
pub type FilterResult<T> = Result<T, FilterError>;
