//! Filter-side control plane.
//!
//! The `ControlPlane` is the only writer of the engine's rule state. It
//! accepts app connections on the control socket, applies each request to
//! the [`RuleStore`], [`FilterSuspensions`] and [`AppDescriptorFactory`],
//! and answers with a reply carrying the request's id.
//!
//! # Responsibilities
//!
//! - Apply rule, exemption and suspension changes
//! - Answer health probes and filter-state queries
//! - Stream drained decisions to connections that asked for them
//! - Audit every state change
//! - Handle graceful shutdown

use super::protocol::{AppToFilter, ControlReply, ControlRequest, FilterState, FilterToApp};
use super::socket::{ControlSocketServer, ServerConnection};
use crate::filter::{
    AppDescriptorFactory, AppIdManifest, DecisionBag, FilterKey, FilterSuspension,
    FilterSuspensions, ReportedDecision, RuleStore,
};
use crate::telemetry::{AuditEvent, AuditLogger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Default interval between decision reports on a streaming connection.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_millis(1000);

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before the next accept after a failure, doubling up to a cap.
fn next_accept_backoff(previous: Option<Duration>) -> Duration {
    previous.map_or(ACCEPT_BACKOFF_MIN, |d| (d * 2).min(ACCEPT_BACKOFF_MAX))
}

/// Shared engine state the control plane writes to.
#[derive(Debug, Clone)]
pub struct FilterStateHandles {
    /// Per-user keys and exempt users.
    pub rules: Arc<RuleStore>,
    /// Per-user suspensions.
    pub suspensions: Arc<FilterSuspensions>,
    /// App identity resolution.
    pub apps: Arc<AppDescriptorFactory>,
    /// Decisions awaiting report.
    pub bag: Arc<DecisionBag>,
}

/// The control plane coordinator.
pub struct ControlPlane {
    state: FilterStateHandles,
    audit: Arc<AuditLogger>,
    system_user_threshold: u32,
    report_interval: Duration,
}

impl ControlPlane {
    /// Create a control plane over shared engine state.
    pub fn new(
        state: FilterStateHandles,
        audit: Arc<AuditLogger>,
        system_user_threshold: u32,
    ) -> Self {
        Self {
            state,
            audit,
            system_user_threshold,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }

    /// Override the decision report interval.
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Accept connections until shutdown is signaled.
    pub async fn serve(
        self: Arc<Self>,
        mut server: ControlSocketServer,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Control plane started on {:?}", server.path());
        let mut backoff = None;

        loop {
            tokio::select! {
                accepted = server.accept() => {
                    match accepted {
                        Ok(connection) => {
                            backoff = None;
                            let plane = self.clone();
                            let shutdown = shutdown_rx.clone();
                            tokio::spawn(async move {
                                plane.run_connection(connection, shutdown).await;
                            });
                        }
                        Err(e) => {
                            let delay = next_accept_backoff(backoff);
                            backoff = Some(delay);
                            error!(
                                "Failed to accept control connection, retrying in {:?}: {}",
                                delay, e
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Control plane received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!("Control plane stopped");
    }

    /// Serve one app connection until it closes or shutdown is signaled.
    pub async fn run_connection(
        &self,
        mut connection: ServerConnection,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut streaming = false;
        let mut ticker = tokio::time::interval(self.report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = connection.rx.recv() => {
                    let Some(AppToFilter::Request { id, request }) = msg else {
                        debug!("App closed control connection");
                        break;
                    };
                    let result = match request {
                        ControlRequest::SetStreaming { enabled } => {
                            debug!("Decision streaming {}", if enabled { "on" } else { "off" });
                            streaming = enabled;
                            Ok(ControlReply::Ack)
                        }
                        other => self.handle_request(other),
                    };
                    if connection.tx.send(FilterToApp::Reply { id, result }).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick(), if streaming => {
                    if !self.report(&connection.tx).await {
                        break;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Apply one request to the engine state.
    ///
    /// `setStreaming` is per-connection and only acknowledged here.
    pub fn handle_request(&self, request: ControlRequest) -> Result<ControlReply, String> {
        match request {
            ControlRequest::Echo { nonce } => Ok(ControlReply::Echo(nonce)),
            ControlRequest::PushRules {
                user_id,
                manifest,
                keys,
                suspension,
            } => {
                self.push_rules(user_id, manifest, &keys, suspension);
                Ok(ControlReply::Ack)
            }
            ControlRequest::SetExemptUsers { user_ids } => {
                self.state.rules.set_exempt_users(user_ids.iter().copied());
                info!("Exempt users now {:?}", user_ids);
                self.audit.log(AuditEvent::ExemptUsersChanged {
                    user_ids: self.state.rules.exempt_users(),
                });
                Ok(ControlReply::Ack)
            }
            ControlRequest::SuspendFilter {
                user_id,
                scope,
                duration_seconds,
            } => {
                if duration_seconds == 0 {
                    return Err("suspension duration must be positive".to_string());
                }
                let suspension = FilterSuspension::starting_now(scope, duration_seconds);
                self.start_suspension(user_id, suspension);
                Ok(ControlReply::Ack)
            }
            ControlRequest::EndSuspension { user_id } => {
                if self.state.suspensions.remove(user_id) {
                    info!("Suspension ended for user {}", user_id);
                    self.audit.log(AuditEvent::SuspensionEnded { user_id });
                }
                Ok(ControlReply::Ack)
            }
            ControlRequest::DisconnectUser { user_id } => {
                self.state.rules.remove_user(user_id);
                self.state.suspensions.remove(user_id);
                info!("Dropped rule state for user {}", user_id);
                self.audit.log(AuditEvent::UserDisconnected { user_id });
                Ok(ControlReply::Ack)
            }
            ControlRequest::SetStreaming { .. } => Ok(ControlReply::Ack),
            ControlRequest::FilterState { user_id } => {
                Ok(ControlReply::State(self.filter_state(user_id)))
            }
        }
    }

    /// Filtering status for one user.
    pub fn filter_state(&self, user_id: u32) -> FilterState {
        if user_id < self.system_user_threshold || self.state.rules.is_exempt(user_id) {
            return FilterState::Off;
        }
        match self.state.suspensions.get(user_id) {
            Some(suspension) => FilterState::Suspended {
                resuming: suspension.expires_at,
            },
            None => FilterState::On,
        }
    }

    fn push_rules(
        &self,
        user_id: u32,
        manifest: AppIdManifest,
        keys: &[FilterKey],
        suspension: Option<FilterSuspension>,
    ) {
        self.state.apps.replace_manifest(manifest);
        let key_count = self.state.rules.replace_keys(user_id, keys);
        info!("Rules updated for user {}: {} keys", user_id, key_count);
        self.audit.log(AuditEvent::RulesUpdated { user_id, key_count });

        match suspension {
            Some(suspension) if suspension.is_active_at(chrono::Utc::now()) => {
                self.start_suspension(user_id, suspension);
            }
            _ => {
                self.state.suspensions.remove(user_id);
            }
        }
    }

    fn start_suspension(&self, user_id: u32, suspension: FilterSuspension) {
        info!(
            "Filter suspended for user {} until {}",
            user_id, suspension.expires_at
        );
        self.audit.log(AuditEvent::SuspensionStarted {
            user_id,
            duration_seconds: suspension.duration_seconds,
            expires_at: suspension.expires_at,
        });
        self.state.suspensions.set(suspension, user_id);
    }

    /// Drain the bag to a streaming connection. Returns false once the
    /// connection is gone.
    async fn report(&self, tx: &mpsc::Sender<FilterToApp>) -> bool {
        let drained = self.state.bag.flush_recent_first();
        if drained.is_empty() {
            return true;
        }
        let batch: Vec<ReportedDecision> = drained.iter().map(ReportedDecision::from).collect();
        debug!("Reporting {} decisions", batch.len());
        if tx.send(FilterToApp::Decisions(batch)).await.is_err() {
            warn!("Streaming connection closed while reporting");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AppScope, DecisionReason, FilterDecision, Flow, Key};
    use uuid::Uuid;

    const USER: u32 = 501;

    fn setup() -> (ControlPlane, FilterStateHandles, Arc<AuditLogger>) {
        let state = FilterStateHandles {
            rules: Arc::new(RuleStore::new()),
            suspensions: Arc::new(FilterSuspensions::new()),
            apps: Arc::new(AppDescriptorFactory::new(AppIdManifest::default())),
            bag: Arc::new(DecisionBag::default()),
        };
        let audit = Arc::new(AuditLogger::new_recording());
        let plane = ControlPlane::new(state.clone(), audit.clone(), 500)
            .with_report_interval(Duration::from_millis(100));
        (plane, state, audit)
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

    #[test]
    fn test_accept_backoff_doubles_up_to_cap() {
        let first = next_accept_backoff(None);
        assert_eq!(first, ACCEPT_BACKOFF_MIN);
        assert_eq!(next_accept_backoff(Some(first)), ACCEPT_BACKOFF_MIN * 2);

        let mut delay = first;
        for _ in 0..20 {
            delay = next_accept_backoff(Some(delay));
        }
        assert_eq!(delay, ACCEPT_BACKOFF_MAX);
    }

    #[test]
    fn test_echo() {
        let (plane, _, _) = setup();
        assert_eq!(
            plane.handle_request(ControlRequest::Echo { nonce: 99 }),
            Ok(ControlReply::Echo(99))
        );
    }

    #[test]
    fn test_push_rules_replaces_state() {
        let (plane, state, audit) = setup();
        let request = ControlRequest::PushRules {
            user_id: USER,
            manifest: AppIdManifest::default(),
            keys: vec![domain_key("a.com"), domain_key("b.com")],
            suspension: Some(FilterSuspension::starting_now(AppScope::Unrestricted, 600)),
        };
        assert_eq!(plane.handle_request(request), Ok(ControlReply::Ack));
        assert_eq!(state.rules.keys_for(USER).unwrap().len(), 2);
        assert!(state.suspensions.get(USER).is_some());

        // A push without a suspension clears the old one.
        let request = ControlRequest::PushRules {
            user_id: USER,
            manifest: AppIdManifest::default(),
            keys: vec![],
            suspension: None,
        };
        plane.handle_request(request).unwrap();
        assert!(state.suspensions.get(USER).is_none());
        assert!(state.rules.keys_for(USER).unwrap().is_empty());

        let recorded = audit.recorded();
        assert!(recorded.iter().any(|l| l.contains("\"key_count\":2")));
        assert!(recorded.iter().any(|l| l.contains("suspension_started")));
    }

    #[test]
    fn test_suspend_and_end() {
        let (plane, state, audit) = setup();
        let request = ControlRequest::SuspendFilter {
            user_id: USER,
            scope: AppScope::WebBrowsers,
            duration_seconds: 900,
        };
        plane.handle_request(request).unwrap();
        assert!(matches!(
            plane.filter_state(USER),
            FilterState::Suspended { .. }
        ));

        plane
            .handle_request(ControlRequest::EndSuspension { user_id: USER })
            .unwrap();
        assert!(state.suspensions.get(USER).is_none());
        assert_eq!(plane.filter_state(USER), FilterState::On);
        assert!(audit.recorded().iter().any(|l| l.contains("suspension_ended")));
    }

    #[test]
    fn test_zero_duration_suspension_rejected() {
        let (plane, state, _) = setup();
        let result = plane.handle_request(ControlRequest::SuspendFilter {
            user_id: USER,
            scope: AppScope::Unrestricted,
            duration_seconds: 0,
        });
        assert!(result.is_err());
        assert!(state.suspensions.is_empty());
    }

    #[test]
    fn test_exempt_and_system_users_are_off() {
        let (plane, _, _) = setup();
        assert_eq!(plane.filter_state(0), FilterState::Off);
        assert_eq!(plane.filter_state(USER), FilterState::On);

        plane
            .handle_request(ControlRequest::SetExemptUsers {
                user_ids: vec![USER],
            })
            .unwrap();
        assert_eq!(plane.filter_state(USER), FilterState::Off);
    }

    #[test]
    fn test_disconnect_user_drops_state() {
        let (plane, state, audit) = setup();
        state.rules.replace_keys(USER, &[domain_key("a.com")]);
        state
            .suspensions
            .set(FilterSuspension::starting_now(AppScope::Unrestricted, 60), USER);

        plane
            .handle_request(ControlRequest::DisconnectUser { user_id: USER })
            .unwrap();
        assert!(state.rules.keys_for(USER).is_none());
        assert!(state.suspensions.get(USER).is_none());
        assert!(audit.recorded().iter().any(|l| l.contains("user_disconnected")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_connection_reports_decisions() {
        let (plane, state, _) = setup();
        let (to_app_tx, mut to_app_rx) = mpsc::channel(8);
        let (from_app_tx, from_app_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let connection = ServerConnection {
            tx: to_app_tx,
            rx: from_app_rx,
        };
        let plane = Arc::new(plane);
        let runner = {
            let plane = plane.clone();
            tokio::spawn(async move { plane.run_connection(connection, shutdown_rx).await })
        };

        from_app_tx
            .send(AppToFilter::Request {
                id: 1,
                request: ControlRequest::SetStreaming { enabled: true },
            })
            .await
            .unwrap();
        assert!(matches!(
            to_app_rx.recv().await,
            Some(FilterToApp::Reply { id: 1, result: Ok(ControlReply::Ack) })
        ));

        let flow = Flow::for_hostname("blocked.example");
        state.bag.push(
            FilterDecision::block(DecisionReason::DefaultNotAllowed).with_flow(&flow, None),
        );

        match to_app_rx.recv().await {
            Some(FilterToApp::Decisions(batch)) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].hostname.as_deref(), Some("blocked.example"));
            }
            other => unreachable!("Expected Decisions, got {:?}", other),
        }
        assert!(state.bag.is_empty());

        drop(from_app_tx);
        runner.await.unwrap();
    }
}
