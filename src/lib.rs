//! family-filter: per-user network content filter
//!
//! This crate decides, flow by flow, whether a user's outbound network
//! traffic is allowed, using rules that a parent manages through a backend
//! service.
//!
//! # Security Model
//!
//! The filter is **fail-closed** for filtered users: a user with no rules is
//! blocked, and a flow nothing permits is blocked. Every block is audited.
//!
//! # Architecture
//!
//! - **Filter**: decision engine, rule store, suspensions, app identity
//! - **Control**: Unix socket RPC between the app and the filter process
//! - **Sync**: WebSocket connection to the backend with heartbeat
//! - **Rules**: where the app fetches a user's rule set from
//! - **Config**: Hierarchical TOML configuration
//! - **Telemetry**: Structured syslog logging for audit trails

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod control;
pub mod filter;
pub mod orchestrator;
pub mod rules;
pub mod sync;
pub mod telemetry;
