//! Backend wire messages.
//!
//! JSON objects tagged by `type`, field names in camelCase.

use crate::control::FilterState;
use crate::filter::AppScope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Close code the backend uses when it doesn't recognize the user token.
/// Reconnecting with the same token is pointless.
pub const USER_TOKEN_NOT_FOUND_CLOSE_CODE: u16 = 4999;

/// Messages sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AppToBackend {
    /// Current filtering status.
    CurrentFilterState {
        /// The status.
        state: FilterState,
    },
}

/// Outcome of an unlock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestStatus {
    /// Awaiting a parent's decision.
    Pending,
    /// Granted.
    Accepted,
    /// Denied.
    Rejected,
}

/// Suspension granted by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspensionGrant {
    /// Apps the suspension covers.
    pub scope: AppScope,
    /// Length in seconds.
    pub duration_seconds: u64,
    /// Wall-clock expiry.
    pub expires_at: DateTime<Utc>,
}

/// Messages received from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BackendToApp {
    /// The user's rules changed; fetch them again.
    UserUpdated,
    /// A request to unlock a site changed status.
    UnlockRequestUpdated {
        /// New status.
        status: RequestStatus,
        /// What was requested (hostname or URL).
        target: String,
        /// Child's comment.
        #[serde(default)]
        comment: Option<String>,
        /// Parent's reply.
        #[serde(default)]
        response_comment: Option<String>,
    },
    /// The backend wants a `currentFilterState` message.
    RequestFilterState,
    /// A suspension request was turned down.
    SuspendFilterRequestDenied {
        /// Child's comment.
        #[serde(default)]
        request_comment: Option<String>,
        /// Parent's reply.
        #[serde(default)]
        response_comment: Option<String>,
    },
    /// A suspension was granted.
    SuspendFilter {
        /// The grant.
        suspension: SuspensionGrant,
        /// Parent's comment.
        #[serde(default)]
        comment: Option<String>,
    },
}
