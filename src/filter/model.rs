//! Core data types shared by the decision engine, the control plane and
//! the reporting path.
//!
//! A [`Flow`] is one outbound connection attempt as handed over by the
//! flow source. It may be partial: the hostname is often known before the
//! URL, and some flows never carry a URL at all. A [`FilterDecision`] is
//! the engine's answer for one flow, and [`ReportedDecision`] is the wire
//! shape that decision takes once it leaves the filter process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Category name that marks an app as a web browser.
pub const BROWSER_CATEGORY: &str = "browser";

/// Opaque OS identity of the process that opened a flow.
///
/// On Linux this is the pid; other platforms map their own process
/// tokens onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessToken(pub u32);

/// Kind of flow reported by the flow source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowType {
    /// Raw socket flow (hostname and ip, rarely a URL).
    #[default]
    Socket,
    /// Browser flow, which eventually carries a full URL.
    Browser,
}

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IpProtocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// Any other IP protocol number.
    Other(u8),
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpProtocol::Tcp => write!(f, "tcp"),
            IpProtocol::Udp => write!(f, "udp"),
            IpProtocol::Other(n) => write!(f, "ip/{}", n),
        }
    }
}

/// One outbound connection attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    /// Remote hostname, if resolved.
    pub hostname: Option<String>,
    /// Full URL, usually only known for browser flows.
    pub url: Option<String>,
    /// Bundle id (or executable identity) of the originating app.
    pub bundle_id: Option<String>,
    /// Remote IP address as reported by the OS.
    pub ip_address: Option<String>,
    /// OS user id that owns the originating process.
    pub user_id: Option<u32>,
    /// Socket or browser flow.
    #[serde(default)]
    pub flow_type: FlowType,
    /// Transport protocol.
    pub ip_protocol: Option<IpProtocol>,
    /// Whether this is a DNS lookup.
    #[serde(default)]
    pub is_dns_request: bool,
    /// Whether the remote endpoint is on a private network.
    #[serde(default)]
    pub is_private_network: bool,
    /// Identity of the originating process, used for parent-app lookup.
    pub process_token: Option<ProcessToken>,
}

impl Flow {
    /// Create a flow for a hostname, with everything else unknown.
    pub fn for_hostname(hostname: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            ..Default::default()
        }
    }

    /// Lower-cased hostname, falling back to the URL's host.
    pub fn normalized_hostname(&self) -> Option<String> {
        if let Some(host) = &self.hostname {
            return Some(host.trim_end_matches('.').to_lowercase());
        }
        let url = self.url.as_deref()?;
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
    }
}

/// Resolved identity of the app behind a flow.
///
/// Immutable once built; the descriptor cache replaces entries rather
/// than mutating them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDescriptor {
    /// Bundle id (or executable identity).
    pub bundle_id: String,
    /// Manifest slug, when the app is known.
    pub slug: Option<String>,
    /// Human-readable name.
    pub display_name: Option<String>,
    /// Manifest categories (e.g. `browser`).
    #[serde(default)]
    pub categories: BTreeSet<String>,
}

impl AppDescriptor {
    /// Descriptor for an app nothing is known about.
    pub fn unidentified(bundle_id: impl Into<String>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            slug: None,
            display_name: None,
            categories: BTreeSet::new(),
        }
    }

    /// Whether the manifest classifies this app as a web browser.
    pub fn is_browser(&self) -> bool {
        self.categories.contains(BROWSER_CATEGORY)
    }

    /// Copy of this descriptor with the given display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Allow/block outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Verdict {
    /// Let the flow through.
    Allow,
    /// Drop the flow.
    Block,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Allow => write!(f, "ALLOW"),
            Verdict::Block => write!(f, "BLOCK"),
        }
    }
}

/// Why the engine reached a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecisionReason {
    /// OS user id below the reserved threshold.
    SystemUser,
    /// OS user id explicitly exempted from filtering.
    UserIsExempt,
    /// An active suspension covers the flow.
    FilterSuspended,
    /// DNS lookups always pass.
    Dns,
    /// Internal system process talking to the private network.
    SystemProcessPrivateNetwork,
    /// The filter's own companion app.
    FromFilterApp,
    /// The user has no keys at all.
    MissingKeychains,
    /// A key permitted the flow.
    AllowedByKey,
    /// Nothing permitted the flow.
    DefaultNotAllowed,
}

/// The engine's answer for one flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDecision {
    /// Unique id, assigned at creation.
    pub id: Uuid,
    /// Allow or block.
    pub verdict: Verdict,
    /// Why.
    pub reason: DecisionReason,
    /// App the flow came from, when known.
    pub app: Option<AppDescriptor>,
    /// The evaluated flow (absent for user-level pre-checks).
    pub flow: Option<Flow>,
    /// Key that permitted the flow.
    pub responsible_key_id: Option<Uuid>,
    /// How many near-identical decisions this entry stands for.
    pub count: u32,
    /// When the first of those decisions was made.
    pub created_at: DateTime<Utc>,
}

impl FilterDecision {
    /// New decision with a count of one.
    pub fn new(verdict: Verdict, reason: DecisionReason) -> Self {
        Self {
            id: Uuid::new_v4(),
            verdict,
            reason,
            app: None,
            flow: None,
            responsible_key_id: None,
            count: 1,
            created_at: Utc::now(),
        }
    }

    /// Allow with the given reason.
    pub fn allow(reason: DecisionReason) -> Self {
        Self::new(Verdict::Allow, reason)
    }

    /// Block with the given reason.
    pub fn block(reason: DecisionReason) -> Self {
        Self::new(Verdict::Block, reason)
    }

    /// Attach the flow and its app.
    #[must_use]
    pub fn with_flow(mut self, flow: &Flow, app: Option<AppDescriptor>) -> Self {
        self.flow = Some(flow.clone());
        self.app = app;
        self
    }

    /// Attach the key that permitted the flow.
    #[must_use]
    pub fn with_key(mut self, key_id: Uuid) -> Self {
        self.responsible_key_id = Some(key_id);
        self
    }

    /// Whether the verdict is allow.
    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    /// Bundle id of the originating app, from the descriptor or the flow.
    pub fn bundle_id(&self) -> Option<&str> {
        self.app
            .as_ref()
            .map(|a| a.bundle_id.as_str())
            .or_else(|| self.flow.as_ref().and_then(|f| f.bundle_id.as_deref()))
    }
}

/// App identity as reported alongside a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedApp {
    /// Bundle id.
    pub bundle_id: String,
    /// Display name, when known.
    pub display_name: Option<String>,
}

/// Wire shape of a decision sent to the companion app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedDecision {
    /// Decision id.
    pub id: Uuid,
    /// Allow or block.
    pub verdict: Verdict,
    /// Why.
    pub reason: DecisionReason,
    /// Originating app.
    pub app: ReportedApp,
    /// Remote hostname.
    pub hostname: Option<String>,
    /// Full URL.
    pub url: Option<String>,
    /// Remote IP.
    pub ip_address: Option<String>,
    /// Transport protocol.
    pub ip_protocol: Option<IpProtocol>,
    /// Key that permitted the flow.
    pub responsible_key_id: Option<Uuid>,
    /// Number of merged decisions.
    pub count: u32,
    /// Creation time of the first merged decision.
    pub created_at: DateTime<Utc>,
}

impl From<&FilterDecision> for ReportedDecision {
    fn from(decision: &FilterDecision) -> Self {
        let flow = decision.flow.as_ref();
        let app = match &decision.app {
            Some(app) => ReportedApp {
                bundle_id: app.bundle_id.clone(),
                display_name: app.display_name.clone(),
            },
            None => ReportedApp {
                bundle_id: decision.bundle_id().unwrap_or_default().to_string(),
                display_name: None,
            },
        };

        Self {
            id: decision.id,
            verdict: decision.verdict,
            reason: decision.reason,
            app,
            hostname: flow.and_then(|f| f.hostname.clone()),
            url: flow.and_then(|f| f.url.clone()),
            ip_address: flow.and_then(|f| f.ip_address.clone()),
            ip_protocol: flow.and_then(|f| f.ip_protocol),
            responsible_key_id: decision.responsible_key_id,
            count: decision.count,
            created_at: decision.created_at,
        }
    }
}
