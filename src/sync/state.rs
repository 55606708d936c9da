//! Backend connection state machine.
//!
//! The transition function is total: any (state, event) pair not listed
//! below leaves the state unchanged.
//!
//! ```text
//! idle            + openingSocket              -> connecting
//! idle            + receivedConnected          -> connected
//! idle            + initiatingDisconnect       -> disconnected
//! connecting      + receivedConnected          -> connected
//! connecting      + receivedCancelled          -> disconnected
//! connecting      + receivedDisconnected       -> disconnected
//! connected       + receivedDisconnected       -> disconnected
//! connected       + receivedCancelled          -> disconnected
//! connected       + initiatingDisconnect       -> disconnected
//! connected       + sentPing                   -> waitingForPong
//! waitingForPong  + receivedPong               -> connected
//! waitingForPong  + failedToReceiveTimelyPong  -> disconnected
//! waitingForPong  + initiatingDisconnect       -> disconnected
//! disconnected    + initiatingConnection       -> idle
//! ```

use serde::{Deserialize, Serialize};

/// State of the backend connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// No socket, ready to connect.
    #[default]
    Idle,
    /// Socket opening.
    Connecting,
    /// Socket open and healthy.
    Connected,
    /// Ping sent, pong outstanding.
    WaitingForPong,
    /// Socket closed or declared dead.
    Disconnected,
}

impl ConnectionState {
    /// Apply one event.
    pub fn next(self, event: SyncEvent) -> Self {
        use ConnectionState::*;
        use SyncEvent::*;

        match (self, event) {
            (Idle, OpeningSocket) => Connecting,
            (Idle, ReceivedConnected) => Connected,
            (Idle, InitiatingDisconnect) => Disconnected,
            (Connecting, ReceivedConnected) => Connected,
            (Connecting, ReceivedCancelled | ReceivedDisconnected { .. }) => Disconnected,
            (
                Connected,
                ReceivedDisconnected { .. } | ReceivedCancelled | InitiatingDisconnect,
            ) => Disconnected,
            (Connected, SentPing) => WaitingForPong,
            (WaitingForPong, ReceivedPong) => Connected,
            (WaitingForPong, FailedToReceiveTimelyPong | InitiatingDisconnect) => Disconnected,
            (Disconnected, InitiatingConnection) => Idle,
            (state, _) => state,
        }
    }

    /// Whether messages can be sent.
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::WaitingForPong)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::WaitingForPong => "waitingForPong",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Something that happened to the backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// Heartbeat ping written.
    SentPing,
    /// Heartbeat pong received.
    ReceivedPong,
    /// Pong grace period elapsed.
    FailedToReceiveTimelyPong,
    /// A new connection is about to start.
    InitiatingConnection,
    /// The local side is closing the connection.
    InitiatingDisconnect,
    /// Handshake completed.
    ReceivedConnected,
    /// The transport failed or was torn down.
    ReceivedCancelled,
    /// The peer closed the socket.
    ReceivedDisconnected {
        /// Close code, when the peer sent one.
        code: Option<u16>,
    },
    /// The socket is being opened.
    OpeningSocket,
}
