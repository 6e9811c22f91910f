//! Communication hub: router, dispatch loop and the public operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::conversation::{ConversationThread, ConversationTracker};
use crate::message::{keys, monotonic_ms, new_id, AgentRole, Message, MessageKind};
use crate::negotiation::{
    AbortReason, NegotiationManager, NegotiationOutcome, NegotiationSession, NegotiationState,
    Vote, VoteEffect,
};
use crate::pending::{Claim, PendingRequests, PendingSlot, RequestOutcome};
use crate::queue::PriorityQueue;
use crate::registry::{DeliveryTarget, MessageHandler, SubscriberRegistry};
use crate::stats::{HubStats, StatsCollector};
use crate::{HubError, Result};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

// Conversation archive and counters change together, under one lock
#[derive(Default)]
struct Ledger {
    conversations: ConversationTracker,
    stats: StatsCollector,
}

struct HubInner {
    config: HubConfig,
    queue: Mutex<PriorityQueue>,
    registry: SubscriberRegistry,
    ledger: RwLock<Ledger>,
    pending: Mutex<PendingRequests>,
    negotiations: Mutex<NegotiationManager>,
    wake: Notify,
    state: AtomicU8,
    worker: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

/// In-process message router for collaborating agents.
///
/// Producers hand messages to the hub, which queues them by priority. A single
/// dispatch worker drains the queue, delivers each message to the recipient's
/// registered target, archives it in its conversation thread and updates the
/// statistics. On top of this the hub offers correlated request/response,
/// broadcast fan-out and multi-party negotiation.
///
/// The hub is cheap to clone; clones share the same queue, registry and
/// dispatch worker, so agent handlers can keep a clone to send replies.
///
/// # Handlers
///
/// Handlers run on the dispatch worker. They may call `send_message` freely,
/// but must not wait on the hub's own dispatch inline (for instance by calling
/// `send_request`); spawn a task for that instead.
///
/// # Examples
///
/// ```no_run
/// use commhub_core::{AgentRole, CommunicationHub, HubConfig, MessageKind};
/// use std::time::Duration;
///
/// # async fn example() -> commhub_core::Result<()> {
/// let hub = CommunicationHub::new(HubConfig::default());
/// hub.start().await?;
///
/// // The developer answers every request it receives
/// let mut inbox = hub.subscribe_inbox(AgentRole::Developer);
/// let responder = hub.clone();
/// tokio::spawn(async move {
///     while let Some(msg) = inbox.recv().await {
///         if msg.kind == MessageKind::TaskRequest {
///             let _ = responder.send_message(msg.reply("on it")).await;
///         }
///     }
/// });
///
/// let reply = hub
///     .send_request(
///         AgentRole::ProductManager,
///         AgentRole::Developer,
///         "Implement login API endpoint",
///         Some(Duration::from_secs(5)),
///     )
///     .await?;
/// assert_eq!(reply.content, "on it");
///
/// hub.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CommunicationHub {
    inner: Arc<HubInner>,
}

impl Default for CommunicationHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl CommunicationHub {
    pub fn new(config: HubConfig) -> Self {
        let resolved_memory = config.resolved_memory;
        info!("Communication Hub initialized");
        Self {
            inner: Arc::new(HubInner {
                config,
                queue: Mutex::new(PriorityQueue::new()),
                registry: SubscriberRegistry::new(),
                ledger: RwLock::new(Ledger::default()),
                pending: Mutex::new(PendingRequests::new(resolved_memory)),
                negotiations: Mutex::new(NegotiationManager::new()),
                wake: Notify::new(),
                state: AtomicU8::new(IDLE),
                worker: Mutex::new(None),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Starts the dispatch worker. Calling it again while running is a no-op;
    /// a stopped hub cannot be restarted.
    pub async fn start(&self) -> Result<()> {
        let mut worker = self.inner.worker.lock().await;
        match self.inner.state.load(Ordering::Acquire) {
            RUNNING => return Ok(()),
            STOPPING | STOPPED => return Err(HubError::Stopped),
            _ => {}
        }

        self.inner.state.store(RUNNING, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        *worker = Some(tokio::spawn(async move { inner.run().await }));
        info!("Communication Hub started");
        Ok(())
    }

    /// Stops the hub for good.
    ///
    /// Queued messages are delivered first when `drain_on_stop` is set and
    /// discarded otherwise. Pending requests are then released with a
    /// cancellation and live negotiations are aborted. Further sends fail
    /// with [`HubError::Stopped`].
    pub async fn stop(&self) -> Result<()> {
        let mut worker = self.inner.worker.lock().await;
        if self.inner.state.load(Ordering::Acquire) == STOPPED {
            return Ok(());
        }
        self.inner.state.store(STOPPING, Ordering::Release);

        let handle = worker.take();
        if !self.inner.config.drain_on_stop || handle.is_none() {
            self.inner.discard_queued().await;
        }
        self.inner.wake.notify_one();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Dispatch worker ended abnormally: {}", e);
            }
            // Anything the worker left behind can no longer be delivered
            self.inner.discard_queued().await;
        }

        let cancelled = self.inner.pending.lock().await.cancel_all();
        let live = self.inner.negotiations.lock().await.live_ids();
        for session_id in &live {
            let _ = self
                .inner
                .abort_negotiation(session_id, AbortReason::HubStopped, false)
                .await;
        }

        self.inner.state.store(STOPPED, Ordering::Release);
        info!(
            cancelled_requests = cancelled,
            aborted_negotiations = live.len(),
            "Communication Hub stopped"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == RUNNING
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    /// Registers the delivery target of `role`. A previous target is replaced
    /// (with a warning) and returned.
    pub fn subscribe(&self, role: AgentRole, target: DeliveryTarget) -> Option<DeliveryTarget> {
        self.inner.registry.subscribe(role, target)
    }

    /// Subscribes `role` with a fresh bounded inbox and returns its receiver.
    pub fn subscribe_inbox(&self, role: AgentRole) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.inner.config.inbox_capacity.max(1));
        self.inner.registry.subscribe(role, DeliveryTarget::Inbox(tx));
        rx
    }

    pub fn subscribe_handler(&self, role: AgentRole, handler: Arc<dyn MessageHandler>) {
        self.inner
            .registry
            .subscribe(role, DeliveryTarget::Handler(handler));
    }

    pub fn unsubscribe(&self, role: AgentRole) -> bool {
        self.inner.registry.unsubscribe(role)
    }

    /// Adds a tap that sees every dispatched message, whoever it is for.
    pub fn add_monitor(&self, handler: Arc<dyn MessageHandler>) -> String {
        self.inner.registry.add_monitor(handler)
    }

    pub fn remove_monitor(&self, monitor_id: &str) -> bool {
        self.inner.registry.remove_monitor(monitor_id)
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.inner.registry
    }

    // ---------------------------------------------------------------------
    // Messaging
    // ---------------------------------------------------------------------

    /// Validates, stamps and queues `message`. Returns once it is accepted;
    /// delivery happens later on the dispatch worker.
    pub async fn send_message(&self, mut message: Message) -> Result<()> {
        self.inner.ensure_accepting()?;
        message.validate()?;
        if message.timestamp_ms <= 0 {
            message.timestamp_ms = monotonic_ms();
        }
        if message.conversation_id.is_empty() {
            message.conversation_id = new_id();
        }

        debug!(
            "Message queued: {} {} -> {} ({}, {})",
            message.id, message.sender, message.recipient, message.kind, message.priority
        );
        self.inner.enqueue(vec![message]).await
    }

    /// Sends a task request and waits for the correlated response.
    ///
    /// `timeout_after` defaults to the configured request timeout.
    pub async fn send_request(
        &self,
        sender: AgentRole,
        recipient: AgentRole,
        content: impl Into<String>,
        timeout_after: Option<Duration>,
    ) -> Result<Message> {
        let request = Message::new(sender, recipient, MessageKind::TaskRequest, content);
        self.request(request, timeout_after).await
    }

    /// Sends a caller-built request and waits for the response whose
    /// `response_to` metadata names the request id.
    ///
    /// Exactly one outcome is returned: the response, [`HubError::RequestTimeout`]
    /// (never before `timeout_after` has elapsed), or
    /// [`HubError::RequestCancelled`] when the hub stops first.
    pub async fn request(
        &self,
        message: Message,
        timeout_after: Option<Duration>,
    ) -> Result<Message> {
        let wait = timeout_after.unwrap_or_else(|| self.inner.config.request_timeout());
        let message = message.with_requires_response(true);
        self.inner.ensure_accepting()?;
        message.validate()?;

        let request_id = message.id.clone();
        let route = format!("{} -> {}", message.sender, message.recipient);
        let mut rx = self
            .inner
            .pending
            .lock()
            .await
            .register(&request_id, message.recipient, wait)?;

        if let Err(e) = self.send_message(message).await {
            self.inner.pending.lock().await.evict(&request_id);
            return Err(e);
        }

        match timeout(wait, &mut rx).await {
            Ok(outcome) => finish_request(&request_id, wait, outcome),
            Err(_) => {
                if self.inner.pending.lock().await.evict(&request_id) {
                    warn!("Request timeout: {} ({})", request_id, route);
                    return Err(HubError::RequestTimeout {
                        request_id,
                        timeout_ms: wait.as_millis() as u64,
                    });
                }
                // Claimed by the dispatch worker just now; its outcome is on the way
                finish_request(&request_id, wait, rx.await)
            }
        }
    }

    /// Sends `content` to every registered participant except `sender`.
    /// Returns how many copies were queued.
    pub async fn broadcast_message(
        &self,
        sender: AgentRole,
        content: impl Into<String>,
    ) -> Result<usize> {
        self.broadcast_with_kind(sender, content, MessageKind::Broadcast)
            .await
    }

    pub async fn broadcast_with_kind(
        &self,
        sender: AgentRole,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Result<usize> {
        self.inner.ensure_accepting()?;
        let content = content.into();
        if content.trim().is_empty() {
            return Err(HubError::Validation(format!(
                "broadcast from {sender} has no content"
            )));
        }

        let conversation_id = new_id();
        let copies: Vec<Message> = self
            .inner
            .registry
            .recipients()
            .into_iter()
            .filter(|r| *r != sender)
            .map(|recipient| {
                Message::new(sender, recipient, kind, content.clone())
                    .with_conversation_id(conversation_id.clone())
                    .with_meta(keys::BROADCAST, true)
            })
            .collect();

        let count = copies.len();
        self.inner.enqueue(copies).await?;
        info!("Broadcast sent from {} to {} recipients", sender, count);
        Ok(count)
    }

    // ---------------------------------------------------------------------
    // Negotiation
    // ---------------------------------------------------------------------

    /// Opens a negotiation session and notifies every participant.
    pub async fn start_negotiation(
        &self,
        participants: Vec<AgentRole>,
        topic: impl Into<String>,
        initial_data: Option<HashMap<String, Value>>,
    ) -> Result<String> {
        self.inner.ensure_accepting()?;
        let session_id = new_id();
        let topic = topic.into();
        let session = NegotiationSession::new(
            session_id.clone(),
            participants,
            topic.clone(),
            initial_data.unwrap_or_default(),
            self.inner.config.negotiation_timeout(),
        )?;

        let labels: Vec<Value> = session
            .participants
            .iter()
            .map(|p| Value::from(p.as_str()))
            .collect();
        let initial: serde_json::Map<String, Value> = session
            .initial_data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let notices: Vec<Message> = session
            .participants
            .iter()
            .map(|p| {
                negotiation_message(
                    &session_id,
                    AgentRole::Orchestrator,
                    *p,
                    MessageKind::NegotiationStart,
                    format!("Negotiation started: {topic}"),
                    "start",
                )
                .with_meta(keys::PARTICIPANTS, labels.clone())
                .with_meta(keys::TOPIC, topic.clone())
                .with_meta(keys::INITIAL_DATA, Value::Object(initial.clone()))
            })
            .collect();

        // Participants reacting to the notices wait on this lock until the
        // session is registered
        let mut negotiations = self.inner.negotiations.lock().await;
        self.inner.enqueue(notices).await?;
        negotiations.insert(session);
        drop(negotiations);

        info!("Negotiation started: {} ({})", session_id, topic);
        Ok(session_id)
    }

    /// Submits a proposal and opens a vote on it. Returns the round number.
    pub async fn propose(
        &self,
        session_id: &str,
        participant: AgentRole,
        proposal: impl Into<Value>,
    ) -> Result<u32> {
        self.inner.ensure_accepting()?;
        let proposal = proposal.into();

        let mut negotiations = self.inner.negotiations.lock().await;
        let (round, others) = negotiations.with_session(session_id, |s| {
            let round = s.propose(participant, proposal.clone())?;
            Ok((round, s.others(participant)))
        })?;

        let content = format!("Proposal (round {round}): {}", render(&proposal));
        let messages: Vec<Message> = others
            .into_iter()
            .map(|recipient| {
                negotiation_message(
                    session_id,
                    participant,
                    recipient,
                    MessageKind::NegotiationProposal,
                    content.clone(),
                    "propose",
                )
                .with_meta(keys::ROUND, round)
                .with_meta(keys::PROPOSAL, proposal.clone())
            })
            .collect();
        self.inner.enqueue(messages).await?;

        info!(
            "Negotiation {}: {} proposed round {}",
            session_id, participant, round
        );
        Ok(round)
    }

    /// Records a vote on the proposal under consideration and returns the
    /// session's resulting state.
    pub async fn vote(
        &self,
        session_id: &str,
        participant: AgentRole,
        vote: Vote,
    ) -> Result<NegotiationState> {
        self.inner.ensure_accepting()?;

        let mut negotiations = self.inner.negotiations.lock().await;
        let (effect, round, state, participants) = negotiations.with_session(session_id, |s| {
            let effect = s.vote(participant, vote)?;
            Ok((effect, s.round, s.state, s.participants.clone()))
        })?;

        if effect == VoteEffect::Duplicate {
            warn!(
                "Duplicate vote from {} on negotiation {} round {} discarded",
                participant, session_id, round
            );
            return Ok(state);
        }

        let mut messages: Vec<Message> = participants
            .iter()
            .filter(|p| **p != participant)
            .map(|recipient| {
                negotiation_message(
                    session_id,
                    participant,
                    *recipient,
                    MessageKind::NegotiationVote,
                    format!("{participant} votes {} on round {round}", vote.as_str()),
                    "vote",
                )
                .with_meta(keys::ROUND, round)
                .with_meta(keys::VOTE, vote.as_str())
            })
            .collect();

        let resolved = match &effect {
            VoteEffect::Resolved { round, proposal } => {
                messages.extend(participants.iter().map(|recipient| {
                    negotiation_message(
                        session_id,
                        AgentRole::Orchestrator,
                        *recipient,
                        MessageKind::NegotiationResult,
                        format!("Negotiation resolved in round {round}: {}", render(proposal)),
                        "resolved",
                    )
                    .with_meta(keys::OUTCOME, "resolved")
                    .with_meta(keys::ROUND, *round)
                    .with_meta(keys::PROPOSAL, proposal.clone())
                }));
                true
            }
            VoteEffect::Rejected | VoteEffect::Pending { .. } | VoteEffect::Duplicate => false,
        };
        self.inner.enqueue(messages).await?;

        if resolved {
            self.inner
                .ledger
                .write()
                .await
                .conversations
                .close(session_id);
            info!("Negotiation {} resolved in round {}", session_id, round);
        } else {
            debug!(
                "Negotiation {}: {} voted {} on round {}",
                session_id,
                participant,
                vote.as_str(),
                round
            );
        }
        Ok(state)
    }

    /// A participant leaves the session, aborting it.
    pub async fn withdraw(&self, session_id: &str, participant: AgentRole) -> Result<()> {
        self.inner.ensure_accepting()?;

        let mut negotiations = self.inner.negotiations.lock().await;
        let participants = negotiations.with_session(session_id, |s| {
            s.withdraw(participant)?;
            Ok(s.participants.clone())
        })?;
        self.inner
            .finish_abort(
                session_id,
                &participants,
                &AbortReason::Withdrawn(participant),
                true,
            )
            .await;
        Ok(())
    }

    /// Waits until the session resolves or aborts.
    ///
    /// `timeout_after` defaults to the configured negotiation timeout.
    pub async fn await_negotiation(
        &self,
        session_id: &str,
        timeout_after: Option<Duration>,
    ) -> Result<NegotiationOutcome> {
        let wait = timeout_after.unwrap_or_else(|| self.inner.config.negotiation_timeout());
        let mut rx = self.inner.negotiations.lock().await.watch(session_id)?;

        let waited = timeout(wait, async {
            rx.wait_for(|s| s.is_terminal()).await.map(|_| ())
        })
        .await;
        match waited {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(HubError::NegotiationNotFound(session_id.to_string())),
            Err(_) => {
                return Err(HubError::NegotiationTimeout {
                    session_id: session_id.to_string(),
                    timeout_ms: wait.as_millis() as u64,
                })
            }
        }

        self.inner
            .negotiations
            .lock()
            .await
            .get(session_id)
            .and_then(|s| s.outcome.clone())
            .ok_or_else(|| HubError::NegotiationNotFound(session_id.to_string()))
    }

    /// Snapshot of a negotiation session.
    pub async fn negotiation(&self, session_id: &str) -> Option<NegotiationSession> {
        self.inner
            .negotiations
            .lock()
            .await
            .get(session_id)
            .cloned()
    }

    // ---------------------------------------------------------------------
    // Conversations & stats
    // ---------------------------------------------------------------------

    /// Most recent messages of a thread, oldest first. `limit` defaults to
    /// the configured context limit.
    pub async fn get_context(&self, conversation_id: &str, limit: Option<usize>) -> Vec<Message> {
        let limit = limit.unwrap_or(self.inner.config.context_limit);
        self.inner
            .ledger
            .read()
            .await
            .conversations
            .get_context(conversation_id, limit)
    }

    /// Messages exchanged between `a` and `b` in either direction.
    pub async fn get_conversation_history(
        &self,
        a: AgentRole,
        b: AgentRole,
        limit: Option<usize>,
    ) -> Vec<Message> {
        let limit = limit.unwrap_or(self.inner.config.history_limit);
        self.inner
            .ledger
            .read()
            .await
            .conversations
            .history_between(a, b, limit)
    }

    pub async fn conversation(&self, conversation_id: &str) -> Option<ConversationThread> {
        self.inner
            .ledger
            .read()
            .await
            .conversations
            .thread(conversation_id)
    }

    pub async fn close_conversation(&self, conversation_id: &str) {
        self.inner
            .ledger
            .write()
            .await
            .conversations
            .close(conversation_id);
        debug!("Conversation {} closed", conversation_id);
    }

    pub async fn get_stats(&self) -> HubStats {
        let mut stats = {
            let ledger = self.inner.ledger.read().await;
            let mut s = HubStats::from(&ledger.stats);
            s.total_archived = ledger.conversations.total_archived();
            s.active_conversations = ledger.conversations.active_count();
            s
        };
        stats.active_negotiations = self.inner.negotiations.lock().await.active_count();
        stats.pending_requests = self.inner.pending.lock().await.len();
        stats.queue_size = self.inner.queue.lock().await.len();
        stats.subscriber_count = self.inner.registry.len();
        stats.monitor_count = self.inner.registry.monitor_count();
        stats.uptime_secs = self.inner.started_at.elapsed().as_secs_f64();
        stats
    }
}

impl HubInner {
    fn ensure_accepting(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            IDLE | RUNNING => Ok(()),
            _ => Err(HubError::Stopped),
        }
    }

    /// Accepts `messages` as one contiguous batch.
    ///
    /// The state is checked again under the queue lock so nothing lands in the
    /// queue once `stop()` has begun; a stopping worker never sees it otherwise.
    async fn enqueue(&self, messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        // Lock order: queue, then ledger
        let mut queue = self.queue.lock().await;
        self.ensure_accepting()?;
        {
            let mut ledger = self.ledger.write().await;
            for _ in &messages {
                ledger.stats.record_accepted();
            }
        }
        for message in messages {
            queue.enqueue(message);
        }
        drop(queue);
        self.wake.notify_one();
        Ok(())
    }

    async fn discard_queued(&self) {
        let mut queue = self.queue.lock().await;
        let discarded = queue.clear();
        if discarded > 0 {
            self.ledger.write().await.stats.record_discarded(discarded);
            warn!("Discarded {} queued messages on stop", discarded);
        }
    }

    /// Dispatch worker: the only consumer of the queue.
    async fn run(self: Arc<Self>) {
        info!("Message dispatch loop started");
        let sweep_every = self.config.sweep_interval();
        let mut last_sweep = Instant::now();

        loop {
            if last_sweep.elapsed() >= sweep_every {
                self.sweep().await;
                last_sweep = Instant::now();
            }

            let next = self.queue.lock().await.dequeue_next();
            match next {
                Some(message) => self.dispatch(message).await,
                None => {
                    if self.state.load(Ordering::Acquire) >= STOPPING {
                        break;
                    }
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(sweep_every) => {}
                    }
                }
            }
        }
        info!("Message dispatch loop stopped");
    }

    /// Delivers, archives and accounts for one message.
    async fn dispatch(&self, message: Message) {
        debug!(
            "Dispatching {} ({}) {} -> {}",
            message.id, message.kind, message.sender, message.recipient
        );

        let slot = match message.kind {
            MessageKind::TaskResponse => self.claim_pending(&message).await,
            MessageKind::TaskRequest
            | MessageKind::CollaborationRequest
            | MessageKind::StatusUpdate
            | MessageKind::ErrorReport
            | MessageKind::Broadcast
            | MessageKind::NegotiationStart
            | MessageKind::NegotiationProposal
            | MessageKind::NegotiationVote
            | MessageKind::NegotiationResult => None,
        };

        let delivered = match self.registry.target(message.recipient) {
            Some(target) => match target.deliver(message.clone()).await {
                Ok(()) => {
                    debug!("Message delivered: {}", message.id);
                    true
                }
                Err(e) => {
                    warn!(
                        "Delivery of {} to {} failed: {}",
                        message.id, message.recipient, e
                    );
                    false
                }
            },
            None => {
                if slot.is_none() {
                    warn!(
                        "No subscriber for {}; message {} marked failed",
                        message.recipient, message.id
                    );
                }
                false
            }
        };
        // A waiting requester counts as the response's delivery target
        let delivered = delivered || slot.is_some();

        for monitor in self.registry.monitors() {
            if let Err(e) = monitor.handle(message.clone()).await {
                warn!("Monitor error on message {}: {}", message.id, e);
            }
        }

        let release = slot.map(|s| (s, message.clone()));
        {
            let mut ledger = self.ledger.write().await;
            ledger
                .stats
                .record_outcome(&message.conversation_id, delivered);
            ledger.conversations.archive(message);
        }

        if let Some((slot, response)) = release {
            let request_id = slot.request_id().to_string();
            let waited = slot.waited();
            if slot.fulfil(response) {
                debug!("Request {} answered after {:?}", request_id, waited);
            } else {
                debug!("Requester of {} went away before its response", request_id);
            }
        }
    }

    async fn claim_pending(&self, response: &Message) -> Option<PendingSlot> {
        let claim = self.pending.lock().await.claim(response);
        match claim {
            Claim::Matched(slot) => Some(slot),
            Claim::AlreadyResolved => {
                warn!(
                    "Duplicate response {} for already resolved request {}; discarded",
                    response.id,
                    response.correlation_id().unwrap_or_default()
                );
                None
            }
            Claim::WrongResponder { expected } => {
                warn!(
                    "Response {} from {} does not match request {} sent to {}",
                    response.id,
                    response.sender,
                    response.correlation_id().unwrap_or_default(),
                    expected
                );
                None
            }
            Claim::Unknown => None,
        }
    }

    /// Evicts expired requests and aborts negotiations past their deadline.
    async fn sweep(&self) {
        let now = Instant::now();
        let expired = self.pending.lock().await.sweep_expired(now);
        for request_id in &expired {
            warn!("Request {} evicted (deadline elapsed or caller gone)", request_id);
        }

        let overdue = self.negotiations.lock().await.expired(now);
        for session_id in overdue {
            let _ = self
                .abort_negotiation(&session_id, AbortReason::DeadlineElapsed, true)
                .await;
        }
    }

    async fn abort_negotiation(
        &self,
        session_id: &str,
        reason: AbortReason,
        announce: bool,
    ) -> Result<()> {
        let mut negotiations = self.negotiations.lock().await;
        let participants = negotiations.with_session(session_id, |s| {
            s.abort(reason.clone())?;
            Ok(s.participants.clone())
        })?;
        self.finish_abort(session_id, &participants, &reason, announce)
            .await;
        Ok(())
    }

    async fn finish_abort(
        &self,
        session_id: &str,
        participants: &[AgentRole],
        reason: &AbortReason,
        announce: bool,
    ) {
        if announce {
            let notices: Vec<Message> = participants
                .iter()
                .map(|recipient| {
                    negotiation_message(
                        session_id,
                        AgentRole::Orchestrator,
                        *recipient,
                        MessageKind::NegotiationResult,
                        format!("Negotiation aborted: {reason}"),
                        "aborted",
                    )
                    .with_meta(keys::OUTCOME, "aborted")
                    .with_meta(keys::REASON, reason.to_string())
                })
                .collect();
            if let Err(e) = self.enqueue(notices).await {
                debug!("Abort notices for negotiation {} not sent: {}", session_id, e);
            }
        }
        self.ledger.write().await.conversations.close(session_id);
        warn!("Negotiation {} aborted: {}", session_id, reason);
    }
}

fn finish_request(
    request_id: &str,
    wait: Duration,
    outcome: std::result::Result<RequestOutcome, oneshot::error::RecvError>,
) -> Result<Message> {
    match outcome {
        Ok(RequestOutcome::Response(response)) => Ok(response),
        Ok(RequestOutcome::TimedOut) => Err(HubError::RequestTimeout {
            request_id: request_id.to_string(),
            timeout_ms: wait.as_millis() as u64,
        }),
        Ok(RequestOutcome::Cancelled) | Err(_) => {
            Err(HubError::RequestCancelled(request_id.to_string()))
        }
    }
}

fn negotiation_message(
    session_id: &str,
    sender: AgentRole,
    recipient: AgentRole,
    kind: MessageKind,
    content: String,
    action: &str,
) -> Message {
    Message::new(sender, recipient, kind, content)
        .with_conversation_id(session_id)
        .with_meta(keys::NEGOTIATION_ID, session_id)
        .with_meta(keys::ACTION, action)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
