//! Control channel between the companion app and the filter process.
//!
//! Request/reply RPC over a Unix socket:
//! - [`protocol`]: message types
//! - [`socket`]: length-prefixed framing, server and live client connection
//! - [`channel`]: app-side [`ControlChannel`] with health probe, timeout
//!   and reconnect
//! - [`plane`]: filter-side [`ControlPlane`] that applies requests to the
//!   engine state

pub mod channel;
mod error;
pub mod plane;
pub mod protocol;
pub mod socket;

pub use channel::{ConnectionFactory, ControlChannel, ControlConnection, DEFAULT_RPC_TIMEOUT};
pub use error::{ControlError, ControlResult};
pub use plane::{ControlPlane, DEFAULT_REPORT_INTERVAL, FilterStateHandles};
pub use protocol::{AppToFilter, ControlReply, ControlRequest, FilterState, FilterToApp};
pub use socket::{ControlSocketServer, ServerConnection, SocketConnection, SocketConnectionFactory};
