//! Telemetry and audit logging for family-filter.
//!
//! Security-relevant events (blocked flows, rule changes, suspensions,
//! backend connection changes) are written to syslog with the
//! `FAMILY_FILTER` tag as one JSON object per line.
//!
//! # Architecture
//!
//! - **Audit logging** (syslog): an [`AuditLogger`] built once at start-up
//!   and handed to the components that emit events as an `Arc`
//! - **Debug logging** (tracing): development logs go to stderr via `tracing`
//! - These are completely separate concerns
//!
//! # Usage
//!
//! ```no_run
//! use family_filter::telemetry::{AuditEvent, AuditLogger};
//! use std::sync::Arc;
//!
//! let audit = Arc::new(AuditLogger::new().unwrap_or_else(|_| AuditLogger::new_null()));
//! audit.log(AuditEvent::SuspensionEnded { user_id: 501 });
//! ```
//!
//! # Event Format
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"rules_updated","user_id":501,"key_count":12}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::AuditEvent;
pub use syslog::{AuditLogger, SYSLOG_TAG};
