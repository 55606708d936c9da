//! Control channel message types.
//!
//! Exchanged between the companion app and the filter process:
//! - App -> Filter: requests, each tagged with a call id
//! - Filter -> App: replies carrying the same id, plus unsolicited
//!   decision reports while streaming is enabled
//!
//! # Message Flow
//!
//! ```text
//! ┌─────────────────┐     AppToFilter     ┌─────────────────┐
//! │                 │────────────────────>│                 │
//! │  Companion app  │                     │     Filter      │
//! │                 │<────────────────────│                 │
//! └─────────────────┘     FilterToApp     └─────────────────┘
//! ```

use crate::filter::{AppIdManifest, AppScope, FilterKey, FilterSuspension, ReportedDecision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlRequest {
    /// Health probe; the filter echoes the nonce back.
    Echo {
        /// Random value to round-trip.
        nonce: u64,
    },
    /// Replace a user's full rule state.
    PushRules {
        /// OS user id.
        user_id: u32,
        /// App-id manifest.
        manifest: AppIdManifest,
        /// Keys in evaluation order.
        keys: Vec<FilterKey>,
        /// Current suspension, if any.
        suspension: Option<FilterSuspension>,
    },
    /// Replace the exempt-user set.
    SetExemptUsers {
        /// Users excluded from filtering.
        user_ids: Vec<u32>,
    },
    /// Suspend filtering for a user.
    SuspendFilter {
        /// OS user id.
        user_id: u32,
        /// Apps the suspension covers.
        scope: AppScope,
        /// Length in seconds.
        duration_seconds: u64,
    },
    /// End a user's suspension early.
    EndSuspension {
        /// OS user id.
        user_id: u32,
    },
    /// Drop all rule state for a user.
    DisconnectUser {
        /// OS user id.
        user_id: u32,
    },
    /// Toggle decision streaming on this connection.
    SetStreaming {
        /// Whether to stream.
        enabled: bool,
    },
    /// Ask whether filtering is active for a user.
    FilterState {
        /// OS user id.
        user_id: u32,
    },
}

impl ControlRequest {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::Echo { .. } => "echo",
            ControlRequest::PushRules { .. } => "pushRules",
            ControlRequest::SetExemptUsers { .. } => "setExemptUsers",
            ControlRequest::SuspendFilter { .. } => "suspendFilter",
            ControlRequest::EndSuspension { .. } => "endSuspension",
            ControlRequest::DisconnectUser { .. } => "disconnectUser",
            ControlRequest::SetStreaming { .. } => "setStreaming",
            ControlRequest::FilterState { .. } => "filterState",
        }
    }
}

/// Filtering status for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FilterState {
    /// Flows are filtered.
    On,
    /// User is exempt.
    Off,
    /// Filtering is suspended.
    Suspended {
        /// When filtering resumes.
        resuming: DateTime<Utc>,
    },
}

/// A successful reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlReply {
    /// The request was applied.
    Ack,
    /// Echoed probe nonce.
    Echo(u64),
    /// Answer to a filter-state query.
    State(FilterState),
}

/// Messages sent from the app to the filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppToFilter {
    /// A call awaiting a reply with the same id.
    Request {
        /// Call id, unique per connection.
        id: u64,
        /// The request.
        request: ControlRequest,
    },
}

/// Messages sent from the filter to the app.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterToApp {
    /// Reply to the request with the same id.
    Reply {
        /// Call id being answered.
        id: u64,
        /// Reply, or the filter's error message.
        result: Result<ControlReply, String>,
    },
    /// Drained decisions, most recent first.
    Decisions(Vec<ReportedDecision>),
}
