// CodeCollab Communication Hub
// In-process message router for collaborating agents

pub mod config;
pub mod conversation;
pub mod hub;
pub mod message;
pub mod negotiation;
pub mod pending;
pub mod queue;
pub mod registry;
pub mod stats;
pub mod telemetry;

// Export core types
pub use config::HubConfig;
pub use conversation::{ConversationThread, ConversationTracker, ThreadStatus};
pub use hub::CommunicationHub;
pub use message::{keys as meta_keys, AgentRole, Message, MessageKind, Priority};
pub use negotiation::{
    AbortReason, NegotiationEntry, NegotiationOutcome, NegotiationSession, NegotiationState, Vote,
};
pub use pending::{PendingRequests, RequestOutcome};
pub use queue::PriorityQueue;
pub use registry::{handler_fn, DeliveryTarget, MessageHandler, SubscriberRegistry};
pub use stats::{HubStats, StatsCollector};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Invalid message: {0}")]
    Validation(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: String, timeout_ms: u64 },

    #[error("Request {0} was cancelled")]
    RequestCancelled(String),

    #[error("Negotiation state conflict: {0}")]
    StateConflict(String),

    #[error("Negotiation {session_id} still undecided after {timeout_ms}ms")]
    NegotiationTimeout { session_id: String, timeout_ms: u64 },

    #[error("Negotiation not found: {0}")]
    NegotiationNotFound(String),

    #[error("Communication hub is stopped")]
    Stopped,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, HubError>;
