use std::collections::VecDeque;

use serde_json::Value;

/// Candidate blobs held until they can be used, in arrival order.
///
/// Inbound: waiting for a remote description. Outbound: waiting for the
/// relay channel to reopen.
#[derive(Debug, Default, Clone)]
pub struct CandidateBuffer {
    items: VecDeque<Value>,
    limit: Option<usize>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer that drops its oldest entry once `limit` is reached.
    pub fn bounded(limit: usize) -> Self {
        Self {
            items: VecDeque::new(),
            limit: Some(limit),
        }
    }

    /// Returns false when an older entry had to be evicted.
    pub fn push(&mut self, candidate: Value) -> bool {
        let mut kept_all = true;
        if let Some(limit) = self.limit {
            while self.items.len() >= limit.max(1) {
                self.items.pop_front();
                kept_all = false;
            }
        }
        self.items.push_back(candidate);
        kept_all
    }

    /// Appends everything from `other`, keeping order.
    pub fn extend(&mut self, other: CandidateBuffer) {
        for c in other.items {
            self.push(c);
        }
    }

    pub fn drain(&mut self) -> Vec<Value> {
        self.items.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
