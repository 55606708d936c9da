//! Bounded accumulator for decisions awaiting report.
//!
//! Bursty traffic produces long runs of practically identical decisions
//! (same app hammering the same CDN). Consecutive mergeable decisions are
//! folded into one entry whose `count` records how many there were.
//!
//! Two decisions are mergeable when bundle id, protocol, verdict, reason
//! and responsible key all agree, AND either
//! - ip and url are both equal, or
//! - url is present and equal (ip may differ, which folds multi-IP/CDN
//!   traffic for the same URL).

use super::model::{FilterDecision, Flow};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Default maximum number of distinct entries held between drains.
pub const DEFAULT_BAG_CAPACITY: usize = 1000;

/// Accumulator written by the flow path and drained by the reporter.
#[derive(Debug)]
pub struct DecisionBag {
    entries: Mutex<VecDeque<FilterDecision>>,
    capacity: usize,
}

impl DecisionBag {
    /// Bag holding at most `capacity` distinct entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Add a decision, merging it into the last entry when possible.
    ///
    /// When the bag is full the oldest entry is dropped.
    pub fn push(&self, decision: FilterDecision) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = entries.back_mut()
            && mergeable(last, &decision)
        {
            last.count = last.count.saturating_add(decision.count);
            return;
        }
        if entries.len() >= self.capacity {
            entries.pop_front();
            debug!("Decision bag full, dropped oldest entry");
        }
        entries.push_back(decision);
    }

    /// Take every entry, most recent first, leaving the bag empty.
    pub fn flush_recent_first(&self) -> Vec<FilterDecision> {
        let drained =
            std::mem::take(&mut *self.entries.lock().unwrap_or_else(PoisonError::into_inner));
        drained.into_iter().rev().collect()
    }

    /// Number of distinct entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DecisionBag {
    fn default() -> Self {
        Self::new(DEFAULT_BAG_CAPACITY)
    }
}

fn mergeable(a: &FilterDecision, b: &FilterDecision) -> bool {
    let (fa, fb) = (a.flow.as_ref(), b.flow.as_ref());
    let protocol = |f: Option<&Flow>| f.and_then(|f| f.ip_protocol);
    let ip = |f: Option<&Flow>| f.and_then(|f| f.ip_address.clone());
    let url = |f: Option<&Flow>| f.and_then(|f| f.url.clone());

    if a.bundle_id() != b.bundle_id()
        || protocol(fa) != protocol(fb)
        || a.verdict != b.verdict
        || a.reason != b.reason
        || a.responsible_key_id != b.responsible_key_id
    {
        return false;
    }

    let same_url = url(fa) == url(fb);
    let same_ip_and_url = same_url && ip(fa) == ip(fb);
    let same_known_url = same_url && url(fa).is_some();
    same_ip_and_url || same_known_url
}
