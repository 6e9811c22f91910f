//! Subscriber registry: participant identity -> delivery target.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

use crate::message::{new_id, AgentRole, Message};
use crate::{HubError, Result};

/// Message handler trait
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, message: Message) -> Result<()> {
        (self.0)(message).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Where messages addressed to a participant end up.
///
/// Inbox delivery never blocks: a full inbox fails the delivery.
#[derive(Clone)]
pub enum DeliveryTarget {
    /// Bounded inbox drained by the participant
    Inbox(mpsc::Sender<Message>),
    /// Callback invoked on the dispatch worker
    Handler(Arc<dyn MessageHandler>),
}

impl DeliveryTarget {
    pub async fn deliver(&self, message: Message) -> Result<()> {
        match self {
            // Never wait on a full inbox: the dispatch worker is shared
            DeliveryTarget::Inbox(tx) => tx.try_send(message).map_err(|e| match e {
                TrySendError::Full(m) => {
                    HubError::DeliveryFailed(format!("inbox full, dropped message {}", m.id))
                }
                TrySendError::Closed(m) => {
                    HubError::DeliveryFailed(format!("inbox closed for message {}", m.id))
                }
            }),
            DeliveryTarget::Handler(handler) => handler.handle(message).await,
        }
    }
}

impl fmt::Debug for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryTarget::Inbox(tx) => f
                .debug_struct("Inbox")
                .field("closed", &tx.is_closed())
                .finish(),
            DeliveryTarget::Handler(_) => f.write_str("Handler"),
        }
    }
}

/// Registry owned by one hub instance.
#[derive(Default)]
pub struct SubscriberRegistry {
    targets: DashMap<AgentRole, DeliveryTarget>,
    // Taps that observe every dispatched message
    monitors: DashMap<String, Arc<dyn MessageHandler>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `target` for `role`, replacing (and returning) any previous one.
    pub fn subscribe(&self, role: AgentRole, target: DeliveryTarget) -> Option<DeliveryTarget> {
        let previous = self.targets.insert(role, target);
        if previous.is_some() {
            warn!("Agent {} re-subscribed; previous delivery target replaced", role);
        } else {
            info!("Agent {} subscribed to communication hub", role);
        }
        previous
    }

    pub fn unsubscribe(&self, role: AgentRole) -> bool {
        let removed = self.targets.remove(&role).is_some();
        if removed {
            info!("Agent {} unsubscribed", role);
        }
        removed
    }

    pub fn target(&self, role: AgentRole) -> Option<DeliveryTarget> {
        self.targets.get(&role).map(|e| e.value().clone())
    }

    pub fn contains(&self, role: AgentRole) -> bool {
        self.targets.contains_key(&role)
    }

    /// Registered roles in role order.
    pub fn recipients(&self) -> Vec<AgentRole> {
        let mut roles: Vec<AgentRole> = self.targets.iter().map(|e| *e.key()).collect();
        roles.sort();
        roles
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn add_monitor(&self, handler: Arc<dyn MessageHandler>) -> String {
        let id = format!("monitor_{}", new_id());
        self.monitors.insert(id.clone(), handler);
        info!("Monitor {} added", id);
        id
    }

    pub fn remove_monitor(&self, monitor_id: &str) -> bool {
        self.monitors.remove(monitor_id).is_some()
    }

    pub fn monitors(&self) -> Vec<Arc<dyn MessageHandler>> {
        self.monitors.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }
}
