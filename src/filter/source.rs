//! Flow intake from the OS capture layer.
//!
//! Packet capture itself lives outside this crate. Whatever observes
//! connection attempts hands them over as [`FlowRequest`]s, each carrying a
//! one-shot reply channel. The filter answers every request exactly once,
//! either with a verdict or with [`FlowOutcome::Deferred`], in which case
//! the capture layer should submit the flow again once it knows more (for
//! example the resolved URL), normally with `can_defer = false`.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use family_filter::filter::{Flow, FlowOutcome, channel_flow_source};
//!
//! let (submitter, _source) = channel_flow_source(64);
//! let outcome = submitter.submit(Flow::for_hostname("example.com"), true).await?;
//! if let FlowOutcome::Deferred = outcome {
//!     // resubmit once the URL is known
//! }
//! # Ok(())
//! # }
//! ```

use super::model::{Flow, Verdict};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Answer to one flow request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    /// Final verdict.
    Decided(Verdict),
    /// Not enough information yet; resubmit with more flow data.
    Deferred,
}

/// A flow waiting for a verdict.
#[derive(Debug)]
pub struct FlowRequest {
    /// The observed flow.
    pub flow: Flow,
    /// Whether the caller can come back later with more data.
    pub can_defer: bool,
    reply: oneshot::Sender<FlowOutcome>,
}

impl FlowRequest {
    /// Create a request and the receiver its outcome will arrive on.
    pub fn new(flow: Flow, can_defer: bool) -> (Self, oneshot::Receiver<FlowOutcome>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                flow,
                can_defer,
                reply,
            },
            rx,
        )
    }

    /// Send the outcome. Consumes the request, so it can only happen once.
    ///
    /// Returns false if the submitter stopped waiting.
    pub fn respond(self, outcome: FlowOutcome) -> bool {
        self.reply.send(outcome).is_ok()
    }
}

/// Source of flows to evaluate.
#[async_trait]
pub trait FlowSource: Send {
    /// Next flow, or `None` once the source is exhausted.
    async fn next_flow(&mut self) -> Option<FlowRequest>;
}

/// Errors seen by a flow submitter.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The filter is no longer consuming flows.
    #[error("Filter is not accepting flows")]
    Closed,
    /// The filter dropped the request without answering.
    #[error("Flow request was dropped without a verdict")]
    Dropped,
}

/// Capture-side handle that feeds a [`ChannelFlowSource`].
#[derive(Debug, Clone)]
pub struct FlowSubmitter {
    tx: mpsc::Sender<FlowRequest>,
}

impl FlowSubmitter {
    /// Submit a flow and wait for its outcome.
    pub async fn submit(&self, flow: Flow, can_defer: bool) -> Result<FlowOutcome, SubmitError> {
        let (request, rx) = FlowRequest::new(flow, can_defer);
        self.tx.send(request).await.map_err(|_| SubmitError::Closed)?;
        rx.await.map_err(|_| SubmitError::Dropped)
    }
}

/// Filter-side end of an in-process flow queue.
#[derive(Debug)]
pub struct ChannelFlowSource {
    rx: mpsc::Receiver<FlowRequest>,
}

#[async_trait]
impl FlowSource for ChannelFlowSource {
    async fn next_flow(&mut self) -> Option<FlowRequest> {
        self.rx.recv().await
    }
}

/// Create a bounded in-process flow queue.
pub fn channel_flow_source(capacity: usize) -> (FlowSubmitter, ChannelFlowSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (FlowSubmitter { tx }, ChannelFlowSource { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_and_respond() {
        let (submitter, mut source) = channel_flow_source(4);

        let handle = tokio::spawn(async move {
            submitter
                .submit(Flow::for_hostname("example.com"), true)
                .await
        });

        let request = source.next_flow().await.unwrap();
        assert_eq!(request.flow.hostname.as_deref(), Some("example.com"));
        assert!(request.can_defer);
        assert!(request.respond(FlowOutcome::Deferred));

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, FlowOutcome::Deferred);
    }

    #[tokio::test]
    async fn test_dropped_request() {
        let (submitter, mut source) = channel_flow_source(4);
        let handle = tokio::spawn(async move {
            submitter.submit(Flow::default(), false).await
        });

        drop(source.next_flow().await.unwrap());
        assert!(matches!(handle.await.unwrap(), Err(SubmitError::Dropped)));
    }

    #[tokio::test]
    async fn test_closed_source() {
        let (submitter, source) = channel_flow_source(4);
        drop(source);
        let result = submitter.submit(Flow::default(), false).await;
        assert!(matches!(result, Err(SubmitError::Closed)));
    }

    #[test]
    fn test_respond_after_receiver_dropped() {
        let (request, rx) = FlowRequest::new(Flow::default(), false);
        drop(rx);
        assert!(!request.respond(FlowOutcome::Decided(Verdict::Block)));
    }
}
