//! Pending-request table for request/response correlation.
//!
//! A request registers a oneshot slot keyed by its message id. The slot is
//! completed at most once: by a matching response, by timeout eviction, or by
//! cancellation when the hub stops. Recently resolved ids are remembered (up
//! to a bounded capacity) so a second response can be told apart from an
//! unrelated one and reported as an anomaly.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use crate::message::{AgentRole, Message};
use crate::{HubError, Result};

/// Final outcome handed to a waiting requester.
#[derive(Debug)]
pub enum RequestOutcome {
    Response(Message),
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
struct PendingRequest {
    responder: AgentRole,
    sent_at: Instant,
    deadline: Instant,
    response_tx: oneshot::Sender<RequestOutcome>,
}

/// Completion slot claimed for a matching response.
#[derive(Debug)]
pub struct PendingSlot {
    request_id: String,
    sent_at: Instant,
    response_tx: oneshot::Sender<RequestOutcome>,
}

impl PendingSlot {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn waited(&self) -> Duration {
        self.sent_at.elapsed()
    }

    /// Releases the waiting requester. Returns false if it already went away.
    pub fn fulfil(self, response: Message) -> bool {
        self.response_tx
            .send(RequestOutcome::Response(response))
            .is_ok()
    }
}

/// Result of matching a response against the table.
#[derive(Debug)]
pub enum Claim {
    Matched(PendingSlot),
    /// The request already had an outcome
    AlreadyResolved,
    /// Correlation matches but the response came from someone else
    WrongResponder { expected: AgentRole },
    /// Not a response to any known request
    Unknown,
}

#[derive(Debug)]
pub struct PendingRequests {
    pending: HashMap<String, PendingRequest>,
    resolved: VecDeque<String>,
    resolved_index: HashSet<String>,
    resolved_capacity: usize,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl PendingRequests {
    pub fn new(resolved_capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            resolved: VecDeque::new(),
            resolved_index: HashSet::new(),
            resolved_capacity,
        }
    }

    pub fn register(
        &mut self,
        request_id: &str,
        responder: AgentRole,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<RequestOutcome>> {
        if request_id.is_empty() {
            return Err(HubError::Validation(
                "request messages need a non-empty id for correlation".into(),
            ));
        }
        if self.pending.contains_key(request_id) || self.resolved_index.contains(request_id) {
            return Err(HubError::Validation(format!(
                "duplicate request id: {request_id}"
            )));
        }

        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        self.pending.insert(
            request_id.to_string(),
            PendingRequest {
                responder,
                sent_at: now,
                deadline: now + timeout,
                response_tx: tx,
            },
        );
        Ok(rx)
    }

    /// Matches `response` against a live request and takes its slot.
    pub fn claim(&mut self, response: &Message) -> Claim {
        let Some(request_id) = response.correlation_id() else {
            return Claim::Unknown;
        };

        match self.pending.get(request_id) {
            Some(req) if req.responder != response.sender => {
                return Claim::WrongResponder {
                    expected: req.responder,
                }
            }
            Some(_) => {}
            None if self.resolved_index.contains(request_id) => return Claim::AlreadyResolved,
            None => return Claim::Unknown,
        }

        let request_id = request_id.to_string();
        match self.pending.remove(&request_id) {
            Some(req) => {
                self.mark_resolved(request_id.clone());
                Claim::Matched(PendingSlot {
                    request_id,
                    sent_at: req.sent_at,
                    response_tx: req.response_tx,
                })
            }
            None => Claim::Unknown,
        }
    }

    /// Drops a request whose caller gave up waiting. Returns false if the
    /// request already had an outcome.
    pub fn evict(&mut self, request_id: &str) -> bool {
        if self.pending.remove(request_id).is_some() {
            self.mark_resolved(request_id.to_string());
            true
        } else {
            false
        }
    }

    /// Times out every request past its deadline and forgets requests whose
    /// caller is gone. Returns the evicted ids.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, req)| req.deadline <= now || req.response_tx.is_closed())
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(req) = self.pending.remove(id) {
                let _ = req.response_tx.send(RequestOutcome::TimedOut);
                self.mark_resolved(id.clone());
            }
        }
        expired
    }

    /// Completes every live request with a cancellation.
    pub fn cancel_all(&mut self) -> usize {
        let ids: Vec<String> = self.pending.keys().cloned().collect();
        for id in &ids {
            if let Some(req) = self.pending.remove(id) {
                let _ = req.response_tx.send(RequestOutcome::Cancelled);
                self.mark_resolved(id.clone());
            }
        }
        ids.len()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn mark_resolved(&mut self, request_id: String) {
        if self.resolved_capacity == 0 {
            return;
        }
        if self.resolved.len() >= self.resolved_capacity {
            if let Some(oldest) = self.resolved.pop_front() {
                self.resolved_index.remove(&oldest);
            }
        }
        self.resolved_index.insert(request_id.clone());
        self.resolved.push_back(request_id);
    }
}
