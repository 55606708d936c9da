use family_filter::control::{
    AppToFilter, ControlChannel, ControlConnection, ControlError, ControlPlane, ControlReply,
    ControlRequest, ControlSocketServer, FilterState, FilterStateHandles, FilterToApp,
    SocketConnection, SocketConnectionFactory,
};
use family_filter::filter::{
    AppDescriptorFactory, AppIdManifest, AppScope, DecisionBag, DecisionReason, FilterDecision,
    FilterKey, FilterSuspensions, Flow, Key, RuleStore,
};
use family_filter::telemetry::AuditLogger;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

struct RunningFilter {
    handles: FilterStateHandles,
    audit: Arc<AuditLogger>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RunningFilter {
    fn start(socket_path: &Path) -> Self {
        let handles = FilterStateHandles {
            rules: Arc::new(RuleStore::new()),
            suspensions: Arc::new(FilterSuspensions::new()),
            apps: Arc::new(AppDescriptorFactory::new(AppIdManifest::default())),
            bag: Arc::new(DecisionBag::default()),
        };
        let audit = Arc::new(AuditLogger::new_recording());
        let server = ControlSocketServer::new(socket_path).expect("Failed to bind control socket");
        let plane = Arc::new(
            ControlPlane::new(handles.clone(), audit.clone(), 500)
                .with_report_interval(Duration::from_millis(20)),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(plane.serve(server, shutdown_rx));

        Self {
            handles,
            audit,
            shutdown_tx,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown_tx.send(true).unwrap();
        self.task.await.unwrap();
    }
}

/// Filter stand-in that answers echoes and holds every other request
/// until its id is released.
struct SilentFilter {
    held_rx: mpsc::UnboundedReceiver<u64>,
    release_tx: mpsc::UnboundedSender<u64>,
}

impl SilentFilter {
    fn start(socket_path: &Path) -> Self {
        let mut server =
            ControlSocketServer::new(socket_path).expect("Failed to bind control socket");
        let (held_tx, held_rx) = mpsc::unbounded_channel();
        let (release_tx, mut release_rx) = mpsc::unbounded_channel::<u64>();

        tokio::spawn(async move {
            let Ok(mut connection) = server.accept().await else {
                return;
            };
            loop {
                let reply = tokio::select! {
                    msg = connection.rx.recv() => {
                        let Some(AppToFilter::Request { id, request }) = msg else {
                            break;
                        };
                        match request {
                            ControlRequest::Echo { nonce } => FilterToApp::Reply {
                                id,
                                result: Ok(ControlReply::Echo(nonce)),
                            },
                            _ => {
                                let _ = held_tx.send(id);
                                continue;
                            }
                        }
                    }
                    Some(id) = release_rx.recv() => FilterToApp::Reply {
                        id,
                        result: Ok(ControlReply::Ack),
                    },
                };
                if connection.tx.send(reply).await.is_err() {
                    break;
                }
            }
        });

        Self { held_rx, release_tx }
    }
}

fn socket_path(dir: &TempDir) -> PathBuf {
    dir.path().join("control.sock")
}

fn channel(path: &Path) -> ControlChannel {
    ControlChannel::with_timeout(
        Arc::new(SocketConnectionFactory::new(path)),
        Duration::from_millis(500),
    )
}

fn domain_key(domain: &str) -> FilterKey {
    FilterKey {
        id: Uuid::new_v4(),
        key: Key::Domain {
            domain: domain.to_string(),
            scope: AppScope::Unrestricted,
        },
    }
}

#[tokio::test]
async fn test_rule_lifecycle_over_socket() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);
    let filter = RunningFilter::start(&path);
    let channel = channel(&path);

    channel
        .push_rules(
            1001,
            AppIdManifest::default(),
            vec![domain_key("example.com"), domain_key("example.org")],
            None,
        )
        .await
        .unwrap();
    assert_eq!(filter.handles.rules.keys_for(1001).unwrap().len(), 2);
    assert_eq!(channel.filter_state(1001).await.unwrap(), FilterState::On);
    assert_eq!(channel.filter_state(42).await.unwrap(), FilterState::Off);

    channel.suspend_filter(1001, AppScope::Unrestricted, 600).await.unwrap();
    assert!(matches!(
        channel.filter_state(1001).await.unwrap(),
        FilterState::Suspended { .. }
    ));

    channel.end_suspension(1001).await.unwrap();
    assert_eq!(channel.filter_state(1001).await.unwrap(), FilterState::On);

    channel.set_exempt_users(vec![1001]).await.unwrap();
    assert_eq!(channel.filter_state(1001).await.unwrap(), FilterState::Off);
    channel.set_exempt_users(vec![]).await.unwrap();

    channel.disconnect_user(1001).await.unwrap();
    assert!(filter.handles.rules.keys_for(1001).is_none());

    let recorded = filter.audit.recorded().join("\n");
    for event in [
        "rules_updated",
        "suspension_started",
        "suspension_ended",
        "exempt_users_changed",
        "user_disconnected",
    ] {
        assert!(recorded.contains(event), "missing {} in {}", event, recorded);
    }

    filter.stop().await;
}

#[tokio::test]
async fn test_rejected_request_keeps_connection() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);
    let filter = RunningFilter::start(&path);
    let channel = channel(&path);

    let err = channel
        .suspend_filter(1001, AppScope::Unrestricted, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::ReplyError(_)));
    assert!(channel.is_connected().await);

    filter.stop().await;
}

#[tokio::test]
async fn test_missing_filter_is_not_installed() {
    let dir = TempDir::new().unwrap();
    let channel = channel(&socket_path(&dir));

    let err = channel.echo(7).await.unwrap_err();
    assert_eq!(err, ControlError::FilterNotInstalled);
    assert!(!err.is_recoverable());
    assert!(!channel.is_connected().await);
}

#[tokio::test]
async fn test_channel_recovers_after_filter_restart() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);
    let channel = channel(&path);

    let filter = RunningFilter::start(&path);
    assert_eq!(channel.echo(1).await.unwrap(), 1);
    filter.stop().await;

    // Give the per-connection task a moment to close its end.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let filter = RunningFilter::start(&path);
    assert_eq!(channel.echo(2).await.unwrap(), 2);
    filter.stop().await;
}

#[tokio::test]
async fn test_streamed_decisions_reach_the_app() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);
    let filter = RunningFilter::start(&path);

    let (sink_tx, mut sink_rx) = mpsc::channel(4);
    let channel = ControlChannel::with_timeout(
        Arc::new(SocketConnectionFactory::new(&path).with_decision_sink(sink_tx)),
        Duration::from_millis(500),
    );
    channel.set_streaming(true).await.unwrap();

    let flow = Flow {
        user_id: Some(1001),
        ..Flow::for_hostname("blocked.example")
    };
    filter.handles.bag.push(
        FilterDecision::block(DecisionReason::DefaultNotAllowed).with_flow(&flow, None),
    );

    let batch = tokio::time::timeout(Duration::from_secs(2), sink_rx.recv())
        .await
        .expect("No decisions streamed")
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].hostname.as_deref(), Some("blocked.example"));
    assert_eq!(batch[0].reason, DecisionReason::DefaultNotAllowed);
    assert!(filter.handles.bag.is_empty());

    filter.stop().await;
}

#[tokio::test]
async fn test_abandoned_call_leaves_no_trace_on_socket() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);
    let mut filter = SilentFilter::start(&path);
    let connection = SocketConnection::connect(&path, None).await.unwrap();

    let call = connection.call(ControlRequest::SetExemptUsers {
        user_ids: vec![1001],
    });
    assert!(
        tokio::time::timeout(Duration::from_millis(100), call)
            .await
            .is_err()
    );
    assert_eq!(connection.pending_count(), 0);

    // The filter answers after the caller stopped waiting.
    let held = filter.held_rx.recv().await.unwrap();
    filter.release_tx.send(held).unwrap();

    assert_eq!(
        connection
            .call(ControlRequest::Echo { nonce: 7 })
            .await
            .unwrap(),
        ControlReply::Echo(7)
    );
    assert_eq!(connection.pending_count(), 0);
}

#[tokio::test]
async fn test_silent_filter_times_out_and_drops_connection() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(&dir);
    let mut filter = SilentFilter::start(&path);
    let channel = channel(&path);

    let started = tokio::time::Instant::now();
    let err = channel.set_exempt_users(vec![1001]).await.unwrap_err();
    assert_eq!(err, ControlError::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(!channel.is_connected().await);

    // The request did reach the filter; only the reply never came.
    assert!(filter.held_rx.recv().await.is_some());
}
