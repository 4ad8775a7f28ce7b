//! Delivery tracker: at-least-once delivery for outbound messages and duplicate
//! suppression for inbound ones.
//!
//! Every ack-requiring send is registered as a [`PendingDelivery`] and re-sent
//! unmodified (same bytes, same message id) each time its retry interval elapses,
//! until a matching ACK arrives or the retry budget is spent. All pending
//! deliveries share one timer driven by the host's tick.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::core::Destination;
use crate::protocol::MessageKind;

/// Retry interval in host ticks (2 s with the daemon's 500 ms tick).
pub const DEFAULT_RETRY_INTERVAL_TICKS: u64 = 4;

/// Re-sends after the initial transmission before a delivery is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Message ids remembered for duplicate suppression.
pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;

/// One outbound message awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub message_id: String,
    pub kind: MessageKind,
    pub bytes: Vec<u8>,
    pub to: Destination,
    /// Re-sends performed so far (0 right after the initial send).
    pub retries: u32,
    pub next_retry_tick: u64,
    /// File id for file-transfer control messages, so exhaustion can clean up the session.
    pub file_id: Option<String>,
}

/// What the timer decided for one due delivery.
#[derive(Debug)]
pub enum RetryDecision {
    Resend {
        message_id: String,
        to: Destination,
        bytes: Vec<u8>,
        attempt: u32,
    },
    Exhausted(PendingDelivery),
}

pub struct DeliveryTracker {
    pending: HashMap<String, PendingDelivery>,
    retry_interval_ticks: u64,
    max_retries: u32,
}

impl DeliveryTracker {
    pub fn new(retry_interval_ticks: u64, max_retries: u32) -> Self {
        Self {
            pending: HashMap::new(),
            retry_interval_ticks: retry_interval_ticks.max(1),
            max_retries,
        }
    }

    /// Register a message that was just transmitted for the first time.
    pub fn track(
        &mut self,
        message_id: &str,
        kind: MessageKind,
        bytes: Vec<u8>,
        to: Destination,
        file_id: Option<String>,
        now_tick: u64,
    ) {
        let pending = PendingDelivery {
            message_id: message_id.to_string(),
            kind,
            bytes,
            to,
            retries: 0,
            next_retry_tick: now_tick + self.retry_interval_ticks,
            file_id,
        };
        if self.pending.insert(message_id.to_string(), pending).is_some() {
            debug!(message_id, "re-tracking message id that was already pending");
        }
    }

    /// Resolve the delivery for an ACK. Unknown ids yield `None` and are otherwise ignored.
    pub fn acknowledge(&mut self, message_id: &str) -> Option<PendingDelivery> {
        let acked = self.pending.remove(message_id);
        match &acked {
            Some(p) => debug!(message_id, kind = %p.kind, retries = p.retries, "delivery acknowledged"),
            None => debug!(message_id, "ACK for unknown message id"),
        }
        acked
    }

    /// Resolve the pending delivery of `kind` for a file, when a later message
    /// of the transfer proves it arrived even though its ACK did not.
    pub fn acknowledge_file(&mut self, kind: &MessageKind, file_id: &str) -> Option<PendingDelivery> {
        let id = self
            .pending
            .values()
            .find(|p| &p.kind == kind && p.file_id.as_deref() == Some(file_id))?
            .message_id
            .clone();
        debug!(message_id = %id, file_id, "delivery implied by a later message");
        self.pending.remove(&id)
    }

    /// Fire every timer that is due at `now_tick`.
    pub fn due(&mut self, now_tick: u64) -> Vec<RetryDecision> {
        let due_ids: Vec<String> = self
            .pending
            .values()
            .filter(|p| p.next_retry_tick <= now_tick)
            .map(|p| p.message_id.clone())
            .collect();

        let mut decisions = Vec::with_capacity(due_ids.len());
        for id in due_ids {
            let Some(p) = self.pending.get_mut(&id) else {
                continue;
            };
            if p.retries >= self.max_retries {
                if let Some(p) = self.pending.remove(&id) {
                    warn!(
                        message_id = %p.message_id,
                        kind = %p.kind,
                        retries = p.retries,
                        "no ACK received, message considered lost"
                    );
                    decisions.push(RetryDecision::Exhausted(p));
                }
                continue;
            }
            p.retries += 1;
            p.next_retry_tick = now_tick + self.retry_interval_ticks;
            debug!(message_id = %p.message_id, attempt = p.retries, "retrying delivery");
            decisions.push(RetryDecision::Resend {
                message_id: p.message_id.clone(),
                to: p.to,
                bytes: p.bytes.clone(),
                attempt: p.retries,
            });
        }
        decisions
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Bounded set of inbound message ids already routed; the oldest id is forgotten first.
pub struct DedupCache {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.seen.contains(message_id)
    }

    /// Record `message_id`. Returns false if it had already been seen.
    pub fn insert(&mut self, message_id: &str) -> bool {
        if !self.seen.insert(message_id.to_string()) {
            return false;
        }
        self.order.push_back(message_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
