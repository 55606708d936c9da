//! Syslog integration for audit logging.
//!
//! All audit events are logged to syslog with the `FAMILY_FILTER` tag.

use std::sync::{Mutex, PoisonError};

use syslog::{Facility, Formatter3164};
use tracing::{debug, error};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "FAMILY_FILTER";

enum Sink {
    Syslog(Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>),
    Memory(Mutex<Vec<String>>),
    Null,
}

/// Audit logger that writes structured JSON events to syslog.
///
/// Shared by reference (`Arc<AuditLogger>`); the writer sits behind a
/// mutex so logging only needs `&self`.
pub struct AuditLogger {
    sink: Sink,
}

impl AuditLogger {
    /// Create a new audit logger connected to syslog.
    ///
    /// Uses Unix socket connection to local syslog daemon.
    pub fn new() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter).map_err(|e| {
            TelemetryError::SyslogConnection(format!("Failed to connect to syslog: {}", e))
        })?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            sink: Sink::Syslog(Mutex::new(writer)),
        })
    }

    /// Create a null audit logger that discards all events.
    pub fn new_null() -> Self {
        Self { sink: Sink::Null }
    }

    /// Create a logger that keeps serialized events in memory.
    ///
    /// Used by tests to assert on what was audited.
    pub fn new_recording() -> Self {
        Self {
            sink: Sink::Memory(Mutex::new(Vec::new())),
        }
    }

    /// Log an audit event.
    ///
    /// The event is serialized to JSON with an ISO8601 timestamp.
    /// If this is a null logger, the event is silently discarded.
    pub fn log(&self, event: AuditEvent) {
        if matches!(self.sink, Sink::Null) {
            return;
        }

        let json = match serde_json::to_string(&event.with_timestamp()) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        match &self.sink {
            Sink::Syslog(writer) => {
                let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(e) = writer.info(&json) {
                    error!("Failed to write to syslog: {}", e);
                }
            }
            Sink::Memory(lines) => {
                lines
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(json.clone());
            }
            Sink::Null => {}
        }
        debug!("Logged audit event: {}", json);
    }

    /// Events recorded so far (recording loggers only).
    pub fn recorded(&self) -> Vec<String> {
        match &self.sink {
            Sink::Memory(lines) => lines.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            _ => Vec::new(),
        }
    }

    /// Check if this is a null logger.
    pub fn is_null(&self) -> bool {
        matches!(self.sink, Sink::Null)
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.sink {
            Sink::Syslog(_) => "syslog",
            Sink::Memory(_) => "memory",
            Sink::Null => "null",
        };
        f.debug_struct("AuditLogger").field("sink", &kind).finish()
    }
}
