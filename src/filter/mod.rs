//! Flow decision engine.
//!
//! Everything needed to turn an observed [`Flow`] into an allow/block
//! verdict: per-user keys in a [`RuleStore`], time-boxed
//! [`FilterSuspensions`], app identity via [`AppDescriptorFactory`], the
//! [`FilterDecisionMaker`] itself, and the [`DecisionBag`] that coalesces
//! decisions for reporting.
//!
//! Rule state is written only by the control plane and read on every flow.
//! All shared state uses reader-writer locks with short write sections.

pub mod apps;
pub mod bag;
pub mod decision;
mod error;
pub mod keys;
pub mod model;
pub mod source;
pub mod store;
pub mod suspension;

pub use apps::{AppDescriptorFactory, AppIdManifest, ProcRootAppQuery, RootApp, RootAppQuery};
pub use bag::{DEFAULT_BAG_CAPACITY, DecisionBag};
pub use decision::{DEFAULT_SYSTEM_USER_THRESHOLD, DecisionConfig, FilterDecisionMaker};
pub use error::{FilterError, FilterResult};
pub use keys::{AppScope, CompiledKey, FilterKey, Key, SingleAppScope};
pub use model::{
    AppDescriptor, BROWSER_CATEGORY, DecisionReason, FilterDecision, Flow, FlowType, IpProtocol,
    ProcessToken, ReportedApp, ReportedDecision, Verdict,
};
pub use source::{
    ChannelFlowSource, FlowOutcome, FlowRequest, FlowSource, FlowSubmitter, SubmitError,
    channel_flow_source,
};
pub use store::RuleStore;
pub use suspension::{FilterSuspension, FilterSuspensions};
