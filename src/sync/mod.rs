//! Backend sync channel.
//!
//! A persistent WebSocket to the family-filter backend, authenticated with
//! the user token in the handshake:
//! - [`state`]: connection state machine
//! - [`message`]: JSON messages in both directions
//! - [`channel`]: [`SyncChannel`] with heartbeat and teardown

pub mod channel;
mod error;
pub mod message;
pub mod state;

pub use channel::{SyncChannel, SyncNotice, SyncSettings, USER_TOKEN_HEADER};
pub use error::{SyncError, SyncResult};
pub use message::{
    AppToBackend, BackendToApp, RequestStatus, SuspensionGrant, USER_TOKEN_NOT_FOUND_CLOSE_CODE,
};
pub use state::{ConnectionState, SyncEvent};
