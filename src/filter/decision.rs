//! Flow decision engine.
//!
//! # Evaluation Order
//!
//! User-level pre-check ([`FilterDecisionMaker::make_for_user`]):
//!
//! 1. uid below the reserved threshold (system user) -> allow
//! 2. uid in the exempt set -> allow
//! 3. active unrestricted suspension -> allow
//! 4. otherwise defer to the per-flow check
//!
//! Per-flow check ([`FilterDecisionMaker::make_for_flow`]), first match wins:
//!
//! 1. DNS request -> allow
//! 2. internal system process on a private network -> allow
//! 3. the filter's own companion app -> allow
//! 4. active suspension whose scope permits the app -> allow
//! 5. user has no keys -> block (`missingKeychains`)
//! 6. first key (in stored order) whose predicate and scope match -> allow
//! 7. no match: block (`defaultNotAllowed`) if the URL is already known or
//!    the caller can't defer; otherwise `None`, meaning "ask again once
//!    more of the flow is known"
//!
//! Evaluation is synchronous and never fails. It takes short read locks
//! on the rule store and never waits on I/O.

use super::apps::AppDescriptorFactory;
use super::model::{AppDescriptor, DecisionReason, Flow, FilterDecision};
use super::store::RuleStore;
use super::suspension::FilterSuspensions;
use super::keys::AppScope;
use std::sync::Arc;
use tracing::trace;

/// Default uid below which a user is treated as a system account.
pub const DEFAULT_SYSTEM_USER_THRESHOLD: u32 = 500;

/// Static knobs for the decision engine.
#[derive(Debug, Clone)]
pub struct DecisionConfig {
    /// uids below this are system accounts and never filtered.
    pub system_user_threshold: u32,
    /// Bundle ids of the filter's own companion app.
    pub own_bundle_ids: Vec<String>,
    /// Bundle id prefixes identifying internal system processes.
    pub system_bundle_prefixes: Vec<String>,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            system_user_threshold: DEFAULT_SYSTEM_USER_THRESHOLD,
            own_bundle_ids: Vec::new(),
            system_bundle_prefixes: Vec::new(),
        }
    }
}

/// Produces verdicts from the current rule state.
pub struct FilterDecisionMaker {
    rules: Arc<RuleStore>,
    suspensions: Arc<FilterSuspensions>,
    apps: Arc<AppDescriptorFactory>,
    config: DecisionConfig,
}

impl FilterDecisionMaker {
    /// Create a decision maker over shared state.
    pub fn new(
        rules: Arc<RuleStore>,
        suspensions: Arc<FilterSuspensions>,
        apps: Arc<AppDescriptorFactory>,
        config: DecisionConfig,
    ) -> Self {
        Self {
            rules,
            suspensions,
            apps,
            config,
        }
    }

    /// Coarse user-level check. `None` means "evaluate the flow".
    pub fn make_for_user(&self, user_id: u32) -> Option<FilterDecision> {
        if user_id < self.config.system_user_threshold {
            return Some(FilterDecision::allow(DecisionReason::SystemUser));
        }
        if self.rules.is_exempt(user_id) {
            return Some(FilterDecision::allow(DecisionReason::UserIsExempt));
        }
        if let Some(suspension) = self.suspensions.get(user_id)
            && suspension.scope == AppScope::Unrestricted
        {
            return Some(FilterDecision::allow(DecisionReason::FilterSuspended));
        }
        None
    }

    /// Per-flow check. `None` means the decision is deferred.
    pub fn make_for_flow(&self, flow: &Flow, can_defer: bool) -> Option<FilterDecision> {
        let app = flow
            .bundle_id
            .as_deref()
            .map(|id| self.apps.make(id, flow.process_token));
        let decide = |d: FilterDecision| Some(d.with_flow(flow, app.clone()));

        if flow.is_dns_request {
            return decide(FilterDecision::allow(DecisionReason::Dns));
        }

        let bundle_id = flow.bundle_id.as_deref().unwrap_or_default();

        if flow.is_private_network && self.is_system_process(bundle_id) {
            return decide(FilterDecision::allow(
                DecisionReason::SystemProcessPrivateNetwork,
            ));
        }

        if self.config.own_bundle_ids.iter().any(|id| id == bundle_id) {
            return decide(FilterDecision::allow(DecisionReason::FromFilterApp));
        }

        let unidentified;
        let app_ref: &AppDescriptor = match &app {
            Some(app) => app,
            None => {
                unidentified = AppDescriptor::unidentified(bundle_id);
                &unidentified
            }
        };

        if let Some(user_id) = flow.user_id
            && let Some(suspension) = self.suspensions.get(user_id)
            && suspension.scope.permits(app_ref)
        {
            return decide(FilterDecision::allow(DecisionReason::FilterSuspended));
        }

        let keys = flow.user_id.and_then(|uid| self.rules.keys_for(uid));
        let Some(keys) = keys.filter(|k| !k.is_empty()) else {
            return decide(FilterDecision::block(DecisionReason::MissingKeychains));
        };

        let hostname = flow.normalized_hostname();
        if let Some(key) = keys
            .iter()
            .find(|key| key.matches(flow, hostname.as_deref(), app_ref))
        {
            return decide(FilterDecision::allow(DecisionReason::AllowedByKey).with_key(key.id));
        }

        if flow.url.is_some() || !can_defer {
            return decide(FilterDecision::block(DecisionReason::DefaultNotAllowed));
        }

        trace!("Deferring decision for {:?}", hostname);
        None
    }

    /// User pre-check followed by the per-flow check.
    pub fn evaluate(&self, flow: &Flow, can_defer: bool) -> Option<FilterDecision> {
        if let Some(user_id) = flow.user_id
            && let Some(decision) = self.make_for_user(user_id)
        {
            let app = flow
                .bundle_id
                .as_deref()
                .map(|id| self.apps.make(id, flow.process_token));
            return Some(decision.with_flow(flow, app));
        }
        self.make_for_flow(flow, can_defer)
    }

    /// App descriptor factory shared with this engine.
    pub fn apps(&self) -> &Arc<AppDescriptorFactory> {
        &self.apps
    }

    fn is_system_process(&self, bundle_id: &str) -> bool {
        !bundle_id.is_empty()
            && self
                .config
                .system_bundle_prefixes
                .iter()
                .any(|prefix| bundle_id.starts_with(prefix.as_str()))
    }
}
