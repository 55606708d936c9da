//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `FAMILY_FILTER` tag.

use crate::filter::DecisionReason;
use crate::sync::ConnectionState;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events for security logging.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A flow was blocked.
    FlowBlock {
        /// OS user the flow belongs to.
        user_id: Option<u32>,
        /// Originating app.
        bundle_id: Option<String>,
        /// Remote hostname.
        hostname: Option<String>,
        /// Why it was blocked.
        reason: DecisionReason,
    },

    /// A user's keys were replaced.
    RulesUpdated {
        /// OS user id.
        user_id: u32,
        /// Number of keys now active.
        key_count: usize,
    },

    /// The exempt-user set was replaced.
    ExemptUsersChanged {
        /// New exempt users.
        user_ids: Vec<u32>,
    },

    /// Filtering was suspended for a user.
    SuspensionStarted {
        /// OS user id.
        user_id: u32,
        /// Suspension length in seconds.
        duration_seconds: u64,
        /// When it lapses.
        expires_at: DateTime<Utc>,
    },

    /// A suspension was ended before expiry.
    SuspensionEnded {
        /// OS user id.
        user_id: u32,
    },

    /// All rule state for a user was dropped.
    UserDisconnected {
        /// OS user id.
        user_id: u32,
    },

    /// Backend connection state changed.
    SyncStateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },

    /// The backend refused the user token.
    UserTokenRejected {
        /// WebSocket close code.
        close_code: u16,
    },
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
