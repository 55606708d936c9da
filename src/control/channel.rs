//! App-side control channel.
//!
//! [`ControlChannel`] owns at most one [`ControlConnection`] and replaces it
//! wholesale when it stops working. Every operation first calls
//! [`ControlChannel::establish_connection`], which health-probes the current
//! connection with a random nonce and only recreates (and re-probes) it when
//! the probe fails. The probe is retried at most once per call.
//!
//! Calls run under a timeout. When the budget elapses the in-flight call
//! future is dropped, which cancels the wait and releases its reply slot.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐  establish  ┌──────────────────┐   call   ┌────────┐
//! │ ControlChannel │────────────>│ConnectionFactory │─────────>│ Filter │
//! │   (one slot)   │<────────────│  (live or fake)  │<─────────│        │
//! └────────────────┘ connection  └──────────────────┘  reply   └────────┘
//! ```

use super::error::{ControlError, ControlResult};
use super::protocol::{ControlReply, ControlRequest, FilterState};
use crate::filter::{AppIdManifest, AppScope, FilterKey, FilterSuspension};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default budget for one control call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// One request/reply connection to the filter.
#[async_trait]
pub trait ControlConnection: Send + Sync {
    /// Issue a request and wait for its reply.
    async fn call(&self, request: ControlRequest) -> ControlResult<ControlReply>;
}

/// Creates fresh connections to the filter.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> ControlResult<Arc<dyn ControlConnection>>;
}

/// Self-healing request/reply channel to the filter.
pub struct ControlChannel {
    factory: Arc<dyn ConnectionFactory>,
    connection: Mutex<Option<Arc<dyn ControlConnection>>>,
    timeout: Duration,
    streaming: AtomicBool,
}

impl ControlChannel {
    /// Channel using `factory` and the default call budget.
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::with_timeout(factory, DEFAULT_RPC_TIMEOUT)
    }

    /// Channel with a custom call budget.
    pub fn with_timeout(factory: Arc<dyn ConnectionFactory>, timeout: Duration) -> Self {
        Self {
            factory,
            connection: Mutex::new(None),
            timeout,
            streaming: AtomicBool::new(false),
        }
    }

    /// Return a connection that just passed a health probe.
    ///
    /// Probes the current connection first. If that fails (or there is
    /// none), creates one new connection and probes it. A second failure is
    /// returned and leaves the channel without a connection.
    pub async fn establish_connection(&self) -> ControlResult<Arc<dyn ControlConnection>> {
        let mut slot = self.connection.lock().await;

        if let Some(current) = slot.clone() {
            match self.probe(current.as_ref()).await {
                Ok(()) => return Ok(current),
                Err(e) => {
                    debug!("Control connection failed health probe: {}", e);
                    *slot = None;
                }
            }
        }

        let fresh = self.factory.connect().await?;
        self.probe(fresh.as_ref()).await?;
        info!("Control connection established");

        if self.streaming.load(Ordering::Relaxed)
            && let Err(e) = self
                .timed_call(fresh.as_ref(), ControlRequest::SetStreaming { enabled: true })
                .await
        {
            warn!("Failed to restore decision streaming: {}", e);
        }

        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    /// Round-trip a nonce through the filter.
    pub async fn echo(&self, nonce: u64) -> ControlResult<u64> {
        match self.request(ControlRequest::Echo { nonce }).await? {
            ControlReply::Echo(echoed) => Ok(echoed),
            other => Err(unexpected(&other)),
        }
    }

    /// Replace a user's keys, manifest and suspension state.
    pub async fn push_rules(
        &self,
        user_id: u32,
        manifest: AppIdManifest,
        keys: Vec<FilterKey>,
        suspension: Option<FilterSuspension>,
    ) -> ControlResult<()> {
        self.request_ack(ControlRequest::PushRules {
            user_id,
            manifest,
            keys,
            suspension,
        })
        .await
    }

    /// Replace the exempt-user set.
    pub async fn set_exempt_users(&self, user_ids: Vec<u32>) -> ControlResult<()> {
        self.request_ack(ControlRequest::SetExemptUsers { user_ids })
            .await
    }

    /// Suspend filtering for a user.
    pub async fn suspend_filter(
        &self,
        user_id: u32,
        scope: AppScope,
        duration_seconds: u64,
    ) -> ControlResult<()> {
        self.request_ack(ControlRequest::SuspendFilter {
            user_id,
            scope,
            duration_seconds,
        })
        .await
    }

    /// End a user's suspension.
    pub async fn end_suspension(&self, user_id: u32) -> ControlResult<()> {
        self.request_ack(ControlRequest::EndSuspension { user_id })
            .await
    }

    /// Drop all rule state for a user.
    pub async fn disconnect_user(&self, user_id: u32) -> ControlResult<()> {
        self.request_ack(ControlRequest::DisconnectUser { user_id })
            .await
    }

    /// Toggle decision streaming. Re-applied after every reconnect.
    pub async fn set_streaming(&self, enabled: bool) -> ControlResult<()> {
        self.request_ack(ControlRequest::SetStreaming { enabled })
            .await?;
        self.streaming.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    /// Ask whether filtering is active for a user.
    pub async fn filter_state(&self, user_id: u32) -> ControlResult<FilterState> {
        match self.request(ControlRequest::FilterState { user_id }).await? {
            ControlReply::State(state) => Ok(state),
            other => Err(unexpected(&other)),
        }
    }

    /// Whether a connection is currently held.
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    async fn request_ack(&self, request: ControlRequest) -> ControlResult<()> {
        match self.request(request).await? {
            ControlReply::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn request(&self, request: ControlRequest) -> ControlResult<ControlReply> {
        let name = request.name();
        let connection = self.establish_connection().await?;
        let result = self.timed_call(connection.as_ref(), request).await;

        if let Err(e) = &result {
            warn!("Control call {} failed: {}", name, e);
            if invalidates_connection(e) {
                self.discard(&connection).await;
            }
        }
        result
    }

    async fn timed_call(
        &self,
        connection: &dyn ControlConnection,
        request: ControlRequest,
    ) -> ControlResult<ControlReply> {
        match tokio::time::timeout(self.timeout, connection.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::Timeout),
        }
    }

    async fn probe(&self, connection: &dyn ControlConnection) -> ControlResult<()> {
        let nonce: u64 = rand::random();
        match self
            .timed_call(connection, ControlRequest::Echo { nonce })
            .await?
        {
            ControlReply::Echo(received) if received == nonce => Ok(()),
            ControlReply::Echo(received) => Err(ControlError::UnexpectedIncorrectAck {
                expected: nonce,
                received,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Drop `connection` if it is still the current one.
    async fn discard(&self, connection: &Arc<dyn ControlConnection>) {
        let mut slot = self.connection.lock().await;
        if slot
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, connection))
        {
            *slot = None;
        }
    }
}

/// Errors that say nothing about the transport keep the connection.
fn invalidates_connection(e: &ControlError) -> bool {
    e.is_recoverable() && !matches!(e, ControlError::ReplyError(_))
}

fn unexpected(reply: &ControlReply) -> ControlError {
    ControlError::Decode(format!("unexpected reply {:?}", reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Copy)]
    enum Behavior {
        Honest,
        WrongNonce,
        Silent,
    }

    struct FakeConnection {
        behavior: Behavior,
        calls: StdMutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ControlConnection for FakeConnection {
        async fn call(&self, request: ControlRequest) -> ControlResult<ControlReply> {
            self.calls.lock().unwrap().push(request.name());
            match (self.behavior, request) {
                (Behavior::Silent, _) => std::future::pending().await,
                (Behavior::WrongNonce, ControlRequest::Echo { nonce }) => {
                    Ok(ControlReply::Echo(nonce.wrapping_add(1)))
                }
                (_, ControlRequest::Echo { nonce }) => Ok(ControlReply::Echo(nonce)),
                (_, ControlRequest::FilterState { .. }) => Ok(ControlReply::State(FilterState::On)),
                _ => Ok(ControlReply::Ack),
            }
        }
    }

    /// Hands out connections with scripted behaviors, then honest ones.
    struct FakeFactory {
        script: StdMutex<Vec<Behavior>>,
        created: AtomicUsize,
        last: StdMutex<Option<Arc<FakeConnection>>>,
    }

    impl FakeFactory {
        fn new(mut script: Vec<Behavior>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: StdMutex::new(script),
                created: AtomicUsize::new(0),
                last: StdMutex::new(None),
            })
        }

        fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        fn last_calls(&self) -> Vec<&'static str> {
            self.last
                .lock()
                .unwrap()
                .as_ref()
                .map(|c| c.calls.lock().unwrap().clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        async fn connect(&self) -> ControlResult<Arc<dyn ControlConnection>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let behavior = self.script.lock().unwrap().pop().unwrap_or(Behavior::Honest);
            let connection = Arc::new(FakeConnection {
                behavior,
                calls: StdMutex::new(Vec::new()),
            });
            *self.last.lock().unwrap() = Some(connection.clone());
            Ok(connection)
        }
    }

    struct NotInstalled;

    #[async_trait]
    impl ConnectionFactory for NotInstalled {
        async fn connect(&self) -> ControlResult<Arc<dyn ControlConnection>> {
            Err(ControlError::FilterNotInstalled)
        }
    }

    #[tokio::test]
    async fn test_healthy_connection_is_reused() {
        let factory = FakeFactory::new(vec![]);
        let channel = ControlChannel::new(factory.clone());

        channel.set_exempt_users(vec![501]).await.unwrap();
        channel.end_suspension(501).await.unwrap();
        assert_eq!(factory.created(), 1);

        // Every operation is preceded by a probe.
        assert_eq!(
            factory.last_calls(),
            vec!["echo", "setExemptUsers", "echo", "endSuspension"]
        );
    }

    #[tokio::test]
    async fn test_mismatched_nonce_then_recreate() {
        let factory = FakeFactory::new(vec![Behavior::WrongNonce]);
        let channel = ControlChannel::new(factory.clone());

        let err = channel.disconnect_user(501).await.unwrap_err();
        assert!(matches!(err, ControlError::UnexpectedIncorrectAck { .. }));
        assert!(!channel.is_connected().await);

        // The next call builds a fresh connection and succeeds.
        channel.disconnect_user(501).await.unwrap();
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_stale_connection_recreated_once() {
        let factory = FakeFactory::new(vec![Behavior::Honest, Behavior::WrongNonce]);
        let channel = ControlChannel::new(factory.clone());
        channel.establish_connection().await.unwrap();

        // Poison the held connection by swapping in a bad one.
        {
            let bad: Arc<dyn ControlConnection> = Arc::new(FakeConnection {
                behavior: Behavior::WrongNonce,
                calls: StdMutex::new(Vec::new()),
            });
            *channel.connection.lock().await = Some(bad);
        }

        // Probe fails, one recreate, its probe fails too: give up.
        let Err(err) = channel.establish_connection().await else {
            panic!("establish_connection accepted a wrong nonce");
        };
        assert!(matches!(err, ControlError::UnexpectedIncorrectAck { .. }));
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let factory = FakeFactory::new(vec![Behavior::Silent]);
        let channel = ControlChannel::with_timeout(factory.clone(), Duration::from_secs(3));

        let started = tokio::time::Instant::now();
        let err = channel.set_streaming(true).await.unwrap_err();
        assert_eq!(err, ControlError::Timeout);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(!channel.is_connected().await);
    }

    #[tokio::test]
    async fn test_not_installed_surfaces() {
        let channel = ControlChannel::new(Arc::new(NotInstalled));
        let err = channel.echo(5).await.unwrap_err();
        assert_eq!(err, ControlError::FilterNotInstalled);
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_streaming_restored_after_reconnect() {
        let factory = FakeFactory::new(vec![]);
        let channel = ControlChannel::new(factory.clone());
        channel.set_streaming(true).await.unwrap();

        *channel.connection.lock().await = None;
        let state = channel.filter_state(501).await.unwrap();
        assert_eq!(state, FilterState::On);
        assert_eq!(
            factory.last_calls(),
            vec!["echo", "setStreaming", "filterState"]
        );
    }

    #[test]
    fn test_reply_errors_keep_connection() {
        assert!(!invalidates_connection(&ControlError::ReplyError("x".into())));
        assert!(!invalidates_connection(&ControlError::FilterNotInstalled));
        assert!(invalidates_connection(&ControlError::Timeout));
    }
}
