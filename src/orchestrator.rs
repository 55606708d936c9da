//! Process orchestration and lifecycle management.
//!
//! family-filter runs as two processes that talk over the control socket:
//!
//! - the **filter** ([`run_filter`]): owns the decision engine, answers
//!   flows from a [`FlowSource`] and serves the [`ControlPlane`]
//! - the **app** ([`run_app`]): holds the backend [`SyncChannel`] and keeps
//!   the filter's rules current through a [`ControlChannel`]
//!
//! [`SyncChannel`]: crate::sync::SyncChannel

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{Config, FilterConfig};
use crate::control::{
    ControlChannel, ControlError, ControlPlane, ControlSocketServer, FilterStateHandles,
    SocketConnectionFactory,
};
use crate::filter::{
    AppDescriptorFactory, AppIdManifest, DecisionBag, FilterDecision, FilterDecisionMaker,
    FilterSuspensions, Flow, FlowOutcome, FlowSource, FlowSubmitter, ProcRootAppQuery, RuleStore,
    channel_flow_source,
};
use crate::rules::{FileRuleSource, RuleSet, RuleSource};
use crate::sync::{
    AppToBackend, BackendToApp, ConnectionState, SyncChannel, SyncNotice, SyncResult,
    SyncSettings, USER_TOKEN_NOT_FOUND_CLOSE_CODE,
};
use crate::telemetry::{AuditEvent, AuditLogger};

/// Capacity of the in-process flow queue.
const FLOW_QUEUE_SIZE: usize = 256;

/// Decision batches buffered between the control socket and the app.
const DECISION_SINK_SIZE: usize = 16;

/// Engine state plus the decision maker reading it.
pub struct FilterEngine {
    /// Handles shared with the control plane.
    pub handles: FilterStateHandles,
    /// The decision maker.
    pub maker: Arc<FilterDecisionMaker>,
}

impl FilterEngine {
    /// Fresh engine with no user rules.
    pub fn new(config: &FilterConfig, manifest: AppIdManifest) -> Self {
        let rules = Arc::new(RuleStore::with_configured_exempt(
            config.exempt_users.iter().copied(),
        ));

        let suspensions = Arc::new(FilterSuspensions::new());
        let apps = Arc::new(
            AppDescriptorFactory::new(manifest)
                .with_root_app_query(Arc::new(ProcRootAppQuery::new())),
        );
        let bag = Arc::new(DecisionBag::new(config.decision_bag_capacity));

        let maker = Arc::new(FilterDecisionMaker::new(
            rules.clone(),
            suspensions.clone(),
            apps.clone(),
            config.decision_config(),
        ));

        Self {
            handles: FilterStateHandles {
                rules,
                suspensions,
                apps,
                bag,
            },
            maker,
        }
    }

    /// Engine preloaded with one rule set, for offline evaluation.
    pub fn from_rule_set(config: &FilterConfig, rules: RuleSet) -> Self {
        let engine = Self::new(config, rules.manifest);
        let handles = &engine.handles;

        handles.rules.replace_keys(rules.user_id, &rules.keys);
        handles.rules.set_exempt_users(rules.exempt_users.iter().copied());
        if let Some(suspension) = rules.suspension {
            handles.suspensions.set(suspension, rules.user_id);
        }
        engine
    }
}

/// Answers flows from a [`FlowSource`].
///
/// Every decision goes into the decision bag; blocks are also audited.
pub struct FilterRunner {
    maker: Arc<FilterDecisionMaker>,
    bag: Arc<DecisionBag>,
    audit: Arc<AuditLogger>,
}

impl FilterRunner {
    /// Create a runner over an engine.
    pub fn new(engine: &FilterEngine, audit: Arc<AuditLogger>) -> Self {
        Self {
            maker: engine.maker.clone(),
            bag: engine.handles.bag.clone(),
            audit,
        }
    }

    /// Decide one flow.
    pub fn decide(&self, flow: &Flow, can_defer: bool) -> FlowOutcome {
        let Some(decision) = self.maker.evaluate(flow, can_defer) else {
            return FlowOutcome::Deferred;
        };

        let verdict = decision.verdict;
        if !decision.is_allowed() {
            debug!("{} {:?}: {:?}", verdict, flow.hostname, decision.reason);
            self.audit.log(AuditEvent::FlowBlock {
                user_id: flow.user_id,
                bundle_id: decision.bundle_id().map(str::to_string),
                hostname: flow.normalized_hostname(),
                reason: decision.reason,
            });
        }
        self.bag.push(decision);
        FlowOutcome::Decided(verdict)
    }

    /// Answer flows until the source ends or shutdown is signaled.
    pub async fn run<S: FlowSource>(&self, mut source: S, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                request = source.next_flow() => {
                    let Some(request) = request else {
                        debug!("Flow source exhausted");
                        break;
                    };
                    let outcome = self.decide(&request.flow, request.can_defer);
                    if !request.respond(outcome) {
                        debug!("Flow submitter stopped waiting");
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
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlowLine {
    flow: Flow,
    #[serde(default)]
    can_defer: bool,
}

/// Submit JSON-line flows from `reader`, writing one JSON verdict line each.
///
/// Input lines look like `{"flow": {...}, "canDefer": false}`. Malformed
/// lines get an `error` line back and are otherwise skipped.
pub async fn feed_flow_lines<R, W>(reader: R, mut writer: W, submitter: FlowSubmitter) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut answered = 0;

    while let Some(line) = lines.next_line().await.context("Failed to read flow line")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<FlowLine>(line) {
            Ok(FlowLine { flow, can_defer }) => {
                let hostname = flow.normalized_hostname();
                let outcome = submitter
                    .submit(flow, can_defer)
                    .await
                    .context("Filter stopped answering flows")?;
                answered += 1;
                match outcome {
                    FlowOutcome::Decided(verdict) => json!({"hostname": hostname, "verdict": verdict}),
                    FlowOutcome::Deferred => json!({"hostname": hostname, "deferred": true}),
                }
            }
            Err(e) => {
                warn!("Ignoring malformed flow line: {}", e);
                json!({"error": e.to_string()})
            }
        };

        writer.write_all(format!("{}\n", reply).as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(answered)
}

/// Run the filter process until shutdown.
///
/// Serves the control socket and answers flows read from stdin. The control
/// socket stays up after stdin closes.
pub async fn run_filter(
    config: &Config,
    audit: Arc<AuditLogger>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let manifest = match &config.apps.manifest_path {
        Some(path) => AppIdManifest::load(path)
            .with_context(|| format!("Failed to load app manifest {:?}", path))?,
        None => {
            info!("No app manifest configured; apps are unidentified until rules are pushed");
            AppIdManifest::default()
        }
    };

    let engine = FilterEngine::new(&config.filter, manifest);
    let socket_path = config
        .control
        .socket_path
        .as_ref()
        .context("control.socket_path is not set")?;
    let server = ControlSocketServer::new(socket_path)
        .with_context(|| format!("Failed to bind control socket {:?}", socket_path))?;

    let plane = Arc::new(
        ControlPlane::new(
            engine.handles.clone(),
            audit.clone(),
            config.filter.system_user_threshold,
        )
        .with_report_interval(config.filter.report_interval()),
    );
    let plane_task = tokio::spawn(plane.serve(server, shutdown_rx.clone()));

    let (submitter, source) = channel_flow_source(FLOW_QUEUE_SIZE);
    let runner = FilterRunner::new(&engine, audit);
    let runner_shutdown = shutdown_rx.clone();
    let runner_task = tokio::spawn(async move { runner.run(source, runner_shutdown).await });

    info!("Filter running; reading flows from stdin");
    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = feed_flow_lines(stdin, tokio::io::stdout(), submitter) => {
            let answered = result?;
            info!("stdin closed after {} flows; control socket stays up", answered);
        }
        _ = wait_for_shutdown(&mut shutdown_rx) => {}
    }

    wait_for_shutdown(&mut shutdown_rx).await;
    let _ = runner_task.await;
    let _ = plane_task.await;
    info!("Filter stopped");
    Ok(())
}

async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Evaluate one flow offline against a rule set.
///
/// Never defers: a flow that matches nothing is blocked.
pub fn check_flow(config: &FilterConfig, rules: RuleSet, flow: &Flow) -> Option<FilterDecision> {
    let engine = FilterEngine::from_rule_set(config, rules);
    engine.maker.evaluate(flow, false)
}

/// Why the app supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Shutdown was requested.
    Shutdown,
    /// The backend doesn't know the user token.
    TokenRejected,
}

enum NextStep {
    Continue,
    Reconnect,
    Stop(SupervisorExit),
}

/// Keeps the backend connection up and the filter's rules current.
///
/// - connection (re)established: fetch rules and push them
/// - `userUpdated`: fetch rules and push them
/// - `requestFilterState`: ask the filter and answer `currentFilterState`
/// - `suspendFilter`: suspend filtering in the filter
/// - unexpected disconnect: reconnect after a delay, unless the backend
///   rejected the token
pub struct AppSupervisor {
    sync: SyncChannel,
    notices: mpsc::UnboundedReceiver<SyncNotice>,
    control: Arc<ControlChannel>,
    rules: Arc<dyn RuleSource>,
    audit: Arc<AuditLogger>,
    token: String,
    reconnect_delay: Duration,
    user_id: Option<u32>,
}

impl AppSupervisor {
    /// Create a supervisor. Nothing connects until [`AppSupervisor::run`].
    pub fn new(
        settings: SyncSettings,
        control: Arc<ControlChannel>,
        rules: Arc<dyn RuleSource>,
        audit: Arc<AuditLogger>,
        token: impl Into<String>,
    ) -> Self {
        let (sync, notices) = SyncChannel::new(settings, audit.clone());
        Self {
            sync,
            notices,
            control,
            rules,
            audit,
            token: token.into(),
            reconnect_delay: Duration::from_secs(10),
            user_id: None,
        }
    }

    /// Override the reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Run until shutdown or token rejection.
    ///
    /// Fails only when the token or URL can't form a handshake at all.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> SyncResult<SupervisorExit> {
        self.connect().await?;

        loop {
            let step = tokio::select! {
                notice = self.notices.recv() => match notice {
                    Some(notice) => self.handle_notice(notice).await,
                    None => NextStep::Stop(SupervisorExit::Shutdown),
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        NextStep::Stop(SupervisorExit::Shutdown)
                    } else {
                        NextStep::Continue
                    }
                }
            };

            match step {
                NextStep::Continue => {}
                NextStep::Reconnect => {
                    info!("Reconnecting to backend in {:?}", self.reconnect_delay);
                    if shutdown_within(self.reconnect_delay, &mut shutdown_rx).await {
                        self.sync.disconnect().await;
                        return Ok(SupervisorExit::Shutdown);
                    }
                    self.connect().await?;
                }
                NextStep::Stop(exit) => {
                    self.sync.disconnect().await;
                    info!("App supervisor stopped: {:?}", exit);
                    return Ok(exit);
                }
            }
        }
    }

    async fn connect(&mut self) -> SyncResult<()> {
        let state = self.sync.connect(&self.token).await?;
        info!("Backend connection is {} after connect", state);
        Ok(())
    }

    async fn handle_notice(&mut self, notice: SyncNotice) -> NextStep {
        match notice {
            SyncNotice::StateChanged {
                from,
                to: ConnectionState::Connected,
            } if from != ConnectionState::WaitingForPong => {
                self.refresh_rules().await;
                NextStep::Continue
            }
            SyncNotice::StateChanged { .. } => NextStep::Continue,
            SyncNotice::Message(message) => {
                self.handle_message(message).await;
                NextStep::Continue
            }
            SyncNotice::DecodeFailed { error } => {
                debug!("Skipped backend frame: {}", error);
                NextStep::Continue
            }
            SyncNotice::Closed {
                code: Some(USER_TOKEN_NOT_FOUND_CLOSE_CODE),
            } => {
                error!("Backend does not recognize the user token; not reconnecting");
                self.audit.log(AuditEvent::UserTokenRejected {
                    close_code: USER_TOKEN_NOT_FOUND_CLOSE_CODE,
                });
                NextStep::Stop(SupervisorExit::TokenRejected)
            }
            SyncNotice::Closed { code } => {
                warn!("Backend connection lost (close code {:?})", code);
                NextStep::Reconnect
            }
        }
    }

    async fn handle_message(&mut self, message: BackendToApp) {
        match message {
            BackendToApp::UserUpdated => self.refresh_rules().await,
            BackendToApp::RequestFilterState => self.report_filter_state().await,
            BackendToApp::SuspendFilter {
                suspension,
                comment,
            } => {
                info!(
                    "Suspension granted for {}s ({:?})",
                    suspension.duration_seconds, comment
                );
                let Some(user_id) = self.current_user().await else {
                    return;
                };
                match self
                    .control
                    .suspend_filter(user_id, suspension.scope, suspension.duration_seconds)
                    .await
                {
                    Ok(()) => self.report_filter_state().await,
                    Err(e) => log_control_failure("suspendFilter", &e),
                }
            }
            BackendToApp::SuspendFilterRequestDenied {
                response_comment, ..
            } => info!("Suspension request denied ({:?})", response_comment),
            BackendToApp::UnlockRequestUpdated { status, target, .. } => {
                info!("Unlock request for {} is now {:?}", target, status)
            }
        }
    }

    async fn refresh_rules(&mut self) {
        let rules = match self.rules.fetch().await {
            Ok(rules) => rules,
            Err(e) => {
                warn!("Failed to fetch rules: {}", e);
                return;
            }
        };
        self.user_id = Some(rules.user_id);

        if let Err(e) = self.control.set_exempt_users(rules.exempt_users).await {
            log_control_failure("setExemptUsers", &e);
            return;
        }

        let user_id = rules.user_id;
        let key_count = rules.keys.len();
        match self
            .control
            .push_rules(user_id, rules.manifest, rules.keys, rules.suspension)
            .await
        {
            Ok(()) => info!("Pushed {} keys for user {}", key_count, user_id),
            Err(e) => log_control_failure("pushRules", &e),
        }
    }

    async fn current_user(&mut self) -> Option<u32> {
        if self.user_id.is_none() {
            self.refresh_rules().await;
        }
        if self.user_id.is_none() {
            warn!("No rules loaded yet; user is unknown");
        }
        self.user_id
    }

    async fn report_filter_state(&mut self) {
        let Some(user_id) = self.current_user().await else {
            return;
        };
        match self.control.filter_state(user_id).await {
            Ok(state) => {
                if let Err(e) = self.sync.send(&AppToBackend::CurrentFilterState { state }) {
                    warn!("Failed to report filter state: {}", e);
                }
            }
            Err(e) => log_control_failure("filterState", &e),
        }
    }
}

/// Sleep for `delay`, returning early with `true` if shutdown is signaled.
async fn shutdown_within(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    let deadline = tokio::time::sleep(delay);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return false,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return true;
                }
            }
        }
    }
}

fn log_control_failure(call: &str, e: &ControlError) {
    if e.is_recoverable() {
        warn!("Control call {} failed: {}", call, e);
    } else {
        error!("Control call {} failed: {}", call, e);
    }
}

/// Run the app process until shutdown or token rejection.
pub async fn run_app(
    config: &Config,
    audit: Arc<AuditLogger>,
    token: String,
    rules_path: PathBuf,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<SupervisorExit> {
    let socket_path = config
        .control
        .socket_path
        .clone()
        .context("control.socket_path is not set")?;

    let (decisions_tx, mut decisions_rx) = mpsc::channel(DECISION_SINK_SIZE);
    let factory = SocketConnectionFactory::new(socket_path).with_decision_sink(decisions_tx);
    let control = Arc::new(ControlChannel::with_timeout(
        Arc::new(factory),
        config.control.rpc_timeout(),
    ));

    match control.establish_connection().await {
        Ok(_) => info!("Connected to filter"),
        Err(e) if !e.is_recoverable() => return Err(e).context("Cannot reach the filter"),
        Err(e) => warn!("Filter not reachable yet: {}", e),
    }
    if let Err(e) = control.set_streaming(true).await {
        log_control_failure("setStreaming", &e);
    }

    tokio::spawn(async move {
        while let Some(batch) = decisions_rx.recv().await {
            for decision in batch {
                info!(
                    "{} {} {:?} x{}",
                    decision.verdict, decision.app.bundle_id, decision.hostname, decision.count
                );
            }
        }
    });

    let supervisor = AppSupervisor::new(
        config.sync.settings(),
        control,
        Arc::new(FileRuleSource::new(rules_path)),
        audit,
        token,
    )
    .with_reconnect_delay(config.sync.reconnect_delay());

    supervisor
        .run(shutdown_rx)
        .await
        .context("Backend sync failed")
}
