//! Persistent WebSocket connection to the backend.
//!
//! One [`SyncChannel`] holds at most one socket. [`SyncChannel::connect`]
//! always tears the previous socket down first. All socket work (reads,
//! writes, heartbeat) runs in a single task per connection, so dropping or
//! aborting that task also cancels its heartbeat timer.
//!
//! Each connection gets a generation number. Events from a socket task
//! whose generation is no longer current are ignored, so a torn-down
//! socket can never move the state machine of its replacement.
//!
//! # Heartbeat
//!
//! While `connected`, every `heartbeat_interval` a ping is written and the
//! state moves to `waitingForPong`. If no pong arrives within `pong_grace`
//! the connection is declared dead (`failedToReceiveTimelyPong`), even if
//! the transport never reported a problem.

use super::error::{SyncError, SyncResult};
use super::message::{AppToBackend, BackendToApp};
use super::state::{ConnectionState, SyncEvent};
use crate::telemetry::{AuditEvent, AuditLogger};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

/// Handshake header carrying the user token.
pub const USER_TOKEN_HEADER: &str = "x-user-token";

/// Timing and endpoint for the sync channel.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Backend WebSocket URL.
    pub url: String,
    /// Time between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// How long to wait for a pong.
    pub pong_grace: Duration,
    /// Pause after tearing down a previous connection.
    pub teardown_delay: Duration,
    /// Wait before the first state report from `connect`.
    pub early_report: Duration,
    /// Additional wait before the final state report.
    pub final_report: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            url: "wss://api.family-filter.app/app-socket".to_string(),
            heartbeat_interval: Duration::from_secs(300),
            pong_grace: Duration::from_secs(5),
            teardown_delay: Duration::from_millis(500),
            early_report: Duration::from_millis(1000),
            final_report: Duration::from_millis(500),
        }
    }
}

/// Things the channel reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// The connection state changed.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// A message arrived from the backend.
    Message(BackendToApp),
    /// A frame arrived that isn't a known message.
    DecodeFailed {
        /// Decoder error.
        error: String,
    },
    /// The socket ended without being asked to.
    Closed {
        /// Close code, when the backend sent one.
        code: Option<u16>,
    },
}

#[derive(Debug)]
struct Slot {
    state: ConnectionState,
    generation: u64,
}

struct Shared {
    slot: Mutex<Slot>,
    notices: mpsc::UnboundedSender<SyncNotice>,
    audit: Arc<AuditLogger>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        self.lock().state
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Start a new generation; events from older sockets are ignored.
    fn next_generation(&self) -> u64 {
        let mut slot = self.lock();
        slot.generation += 1;
        slot.generation
    }

    fn apply(&self, generation: u64, event: SyncEvent) -> ConnectionState {
        let (from, to) = {
            let mut slot = self.lock();
            if slot.generation != generation {
                return slot.state;
            }
            let from = slot.state;
            slot.state = from.next(event);
            (from, slot.state)
        };

        if from != to {
            info!("Backend connection {} -> {} ({:?})", from, to, event);
            self.audit.log(AuditEvent::SyncStateChanged { from, to });
            let _ = self.notices.send(SyncNotice::StateChanged { from, to });
        }
        to
    }

    fn notify(&self, generation: u64, notice: SyncNotice) {
        if self.generation() == generation {
            let _ = self.notices.send(notice);
        }
    }

    fn deliver(&self, generation: u64, text: &str) {
        let notice = match serde_json::from_str::<BackendToApp>(text) {
            Ok(message) => {
                debug!("Backend message: {:?}", message);
                SyncNotice::Message(message)
            }
            Err(e) => {
                warn!("Undecodable backend message: {}", e);
                SyncNotice::DecodeFailed {
                    error: e.to_string(),
                }
            }
        };
        self.notify(generation, notice);
    }
}

/// Backend connection with explicit state, heartbeat and teardown.
pub struct SyncChannel {
    settings: SyncSettings,
    shared: Arc<Shared>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl SyncChannel {
    /// Create a channel and the receiver for its notices.
    pub fn new(
        settings: SyncSettings,
        audit: Arc<AuditLogger>,
    ) -> (Self, mpsc::UnboundedReceiver<SyncNotice>) {
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                state: ConnectionState::Idle,
                generation: 0,
            }),
            notices,
            audit,
        });
        let channel = Self {
            settings,
            shared,
            outgoing: Mutex::new(None),
            task: AsyncMutex::new(None),
        };
        (channel, notices_rx)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Open an authenticated socket, replacing any previous one.
    ///
    /// Returns the state after `early_report` if the socket is still
    /// connecting, otherwise the state after a further `final_report`.
    pub async fn connect(&self, token: &str) -> SyncResult<ConnectionState> {
        let request = self.handshake_request(token)?;

        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            self.close(previous).await;
            tokio::time::sleep(self.settings.teardown_delay).await;
        }

        let generation = self.shared.next_generation();
        self.shared.apply(generation, SyncEvent::InitiatingConnection);
        self.shared.apply(generation, SyncEvent::OpeningSocket);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.outgoing.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        *task = Some(tokio::spawn(run_socket(
            self.shared.clone(),
            generation,
            request,
            rx,
            self.settings.clone(),
        )));
        drop(task);

        tokio::time::sleep(self.settings.early_report).await;
        let state = self.state();
        if state == ConnectionState::Connecting {
            debug!("Backend still connecting after {:?}", self.settings.early_report);
            return Ok(state);
        }
        tokio::time::sleep(self.settings.final_report).await;
        Ok(self.state())
    }

    /// Close the socket, if any.
    pub async fn disconnect(&self) {
        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            self.close(previous).await;
        }
    }

    /// Send a message. Fails immediately when no socket is open.
    pub fn send(&self, message: &AppToBackend) -> SyncResult<()> {
        if !self.state().is_open() {
            return Err(SyncError::NotConnected);
        }
        let json = serde_json::to_string(message)?;
        let outgoing = self.outgoing.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = outgoing.as_ref().ok_or(SyncError::NotConnected)?;
        sender
            .send(Message::Text(json))
            .map_err(|_| SyncError::NotConnected)
    }

    fn handshake_request(&self, token: &str) -> SyncResult<Request> {
        let mut request = self
            .settings
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::InvalidRequest(e.to_string()))?;
        let value = HeaderValue::from_str(token).map_err(|_| SyncError::InvalidToken)?;
        request.headers_mut().insert(USER_TOKEN_HEADER, value);
        Ok(request)
    }

    async fn close(&self, mut task: JoinHandle<()>) {
        let generation = self.shared.generation();
        self.shared.apply(generation, SyncEvent::InitiatingDisconnect);

        // From here on the old socket can't touch state or send notices.
        let generation = self.shared.next_generation();
        self.shared.apply(generation, SyncEvent::ReceivedCancelled);

        // Dropping the sender makes the socket task send a close frame.
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if tokio::time::timeout(self.settings.teardown_delay, &mut task)
            .await
            .is_err()
        {
            task.abort();
        }
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn run_socket(
    shared: Arc<Shared>,
    generation: u64,
    request: Request,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    settings: SyncSettings,
) {
    let socket = match connect_async(request).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            warn!("Backend connection failed: {}", e);
            shared.apply(generation, SyncEvent::ReceivedCancelled);
            shared.notify(generation, SyncNotice::Closed { code: None });
            return;
        }
    };
    shared.apply(generation, SyncEvent::ReceivedConnected);

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    let code = loop {
        tokio::select! {
            outbound = outgoing.recv() => match outbound {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        warn!("Backend send failed: {}", e);
                        shared.apply(generation, SyncEvent::ReceivedCancelled);
                        break None;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    debug!("Backend socket closed locally");
                    return;
                }
            },
            _ = heartbeat.tick() => {
                if shared.state() == ConnectionState::Connected {
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        warn!("Heartbeat ping failed: {}", e);
                        shared.apply(generation, SyncEvent::ReceivedCancelled);
                        break None;
                    }
                    shared.apply(generation, SyncEvent::SentPing);
                    pong_deadline = Some(Instant::now() + settings.pong_grace);
                }
            }
            _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)),
                if pong_deadline.is_some() =>
            {
                pong_deadline = None;
                if shared.state() == ConnectionState::WaitingForPong {
                    warn!("No pong within {:?}", settings.pong_grace);
                    shared.apply(generation, SyncEvent::FailedToReceiveTimelyPong);
                    break None;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.deliver(generation, &text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => shared.deliver(generation, &text),
                    Err(_) => warn!("Ignoring non-UTF8 binary frame from backend"),
                },
                Some(Ok(Message::Pong(_))) => {
                    pong_deadline = None;
                    shared.apply(generation, SyncEvent::ReceivedPong);
                }
                Some(Ok(Message::Ping(_))) => debug!("Backend ping"),
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    info!("Backend closed the connection: {:?}", code);
                    shared.apply(generation, SyncEvent::ReceivedDisconnected { code });
                    break code;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    warn!("Backend socket error: {}", e);
                    shared.apply(generation, SyncEvent::ReceivedCancelled);
                    break None;
                }
                None => {
                    shared.apply(generation, SyncEvent::ReceivedDisconnected { code: None });
                    break None;
                }
            },
        }
    };

    shared.notify(generation, SyncNotice::Closed { code });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::FilterState;

    fn make_channel(url: &str) -> (SyncChannel, mpsc::UnboundedReceiver<SyncNotice>) {
        let settings = SyncSettings {
            url: url.to_string(),
            ..Default::default()
        };
        SyncChannel::new(settings, Arc::new(AuditLogger::new_null()))
    }

    #[test]
    fn test_send_without_connection_fails_fast() {
        let (channel, _notices) = make_channel("ws://127.0.0.1:9/");
        let result = channel.send(&AppToBackend::CurrentFilterState {
            state: FilterState::On,
        });
        assert!(matches!(result, Err(SyncError::NotConnected)));
    }

    #[test]
    fn test_handshake_carries_token() {
        let (channel, _notices) = make_channel("ws://127.0.0.1:9/socket");
        let request = channel.handshake_request("abc123").unwrap();
        assert_eq!(request.headers()[USER_TOKEN_HEADER], "abc123");
    }

    #[test]
    fn test_bad_token_and_url_rejected() {
        let (channel, _notices) = make_channel("ws://127.0.0.1:9/");
        assert!(matches!(
            channel.handshake_request("bad\ntoken"),
            Err(SyncError::InvalidToken)
        ));

        let (channel, _notices) = make_channel("not a url");
        assert!(matches!(
            channel.handshake_request("abc"),
            Err(SyncError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_stale_generation_ignored() {
        let (channel, mut notices) = make_channel("ws://127.0.0.1:9/");
        let old = channel.shared.next_generation();
        let current = channel.shared.next_generation();

        channel.shared.apply(old, SyncEvent::OpeningSocket);
        assert_eq!(channel.state(), ConnectionState::Idle);
        assert!(notices.try_recv().is_err());

        channel.shared.apply(current, SyncEvent::OpeningSocket);
        assert_eq!(channel.state(), ConnectionState::Connecting);
        assert_eq!(
            notices.try_recv().unwrap(),
            SyncNotice::StateChanged {
                from: ConnectionState::Idle,
                to: ConnectionState::Connecting,
            }
        );
    }

    #[test]
    fn test_decode_failure_is_a_notice() {
        let (channel, mut notices) = make_channel("ws://127.0.0.1:9/");
        let generation = channel.shared.generation();
        channel.shared.deliver(generation, "{\"type\":\"nonsense\"}");
        assert!(matches!(
            notices.try_recv().unwrap(),
            SyncNotice::DecodeFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_ends_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let settings = SyncSettings {
            url: format!("ws://{}/", addr),
            early_report: Duration::from_millis(200),
            final_report: Duration::from_millis(50),
            ..Default::default()
        };
        let (channel, mut notices) = SyncChannel::new(settings, Arc::new(AuditLogger::new_null()));
        let state = channel.connect("token").await.unwrap();
        assert_eq!(state, ConnectionState::Disconnected);

        let mut saw_closed = false;
        while let Ok(notice) = notices.try_recv() {
            saw_closed |= matches!(notice, SyncNotice::Closed { code: None });
        }
        assert!(saw_closed);
    }
}
