//! Message model carried through the hub.
//!
//! A [`Message`] is built by a producer (agent code or the hub's own request,
//! broadcast and negotiation helpers), handed to the hub, and from then on is
//! never mutated: the dispatch worker delivers it and the conversation tracker
//! archives it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{HubError, Result};

/// Reserved metadata keys used by the hub's own protocols.
pub mod keys {
    /// Correlation key: id of the request a response answers
    pub const RESPONSE_TO: &str = "response_to";
    /// Set on every copy produced by a broadcast fan-out
    pub const BROADCAST: &str = "broadcast";
    /// Negotiation session a message belongs to
    pub const NEGOTIATION_ID: &str = "negotiation_id";
    /// Negotiation action (start, propose, vote, resolved, aborted)
    pub const ACTION: &str = "action";
    pub const PARTICIPANTS: &str = "participants";
    pub const TOPIC: &str = "topic";
    pub const INITIAL_DATA: &str = "initial_data";
    pub const ROUND: &str = "round";
    pub const PROPOSAL: &str = "proposal";
    pub const VOTE: &str = "vote";
    pub const OUTCOME: &str = "outcome";
    pub const REASON: &str = "reason";
}

/// Participant identities known to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgentRole {
    #[serde(rename = "pm")]
    ProductManager,
    #[serde(rename = "dev")]
    Developer,
    #[serde(rename = "reviewer")]
    Reviewer,
    #[serde(rename = "tester")]
    Tester,
    #[serde(rename = "orchestrator")]
    Orchestrator,
}

impl AgentRole {
    pub const ALL: [AgentRole; 5] = [
        AgentRole::ProductManager,
        AgentRole::Developer,
        AgentRole::Reviewer,
        AgentRole::Tester,
        AgentRole::Orchestrator,
    ];

    /// Canonical label used on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::ProductManager => "pm",
            AgentRole::Developer => "dev",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Tester => "tester",
            AgentRole::Orchestrator => "orchestrator",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        AgentRole::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| HubError::Validation(format!("unknown agent role: {s}")))
    }
}

/// Closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskRequest,
    TaskResponse,
    CollaborationRequest,
    StatusUpdate,
    ErrorReport,
    Broadcast,
    NegotiationStart,
    NegotiationProposal,
    NegotiationVote,
    NegotiationResult,
}

impl MessageKind {
    pub const ALL: [MessageKind; 10] = [
        MessageKind::TaskRequest,
        MessageKind::TaskResponse,
        MessageKind::CollaborationRequest,
        MessageKind::StatusUpdate,
        MessageKind::ErrorReport,
        MessageKind::Broadcast,
        MessageKind::NegotiationStart,
        MessageKind::NegotiationProposal,
        MessageKind::NegotiationVote,
        MessageKind::NegotiationResult,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::TaskRequest => "task_request",
            MessageKind::TaskResponse => "task_response",
            MessageKind::CollaborationRequest => "collaboration_request",
            MessageKind::StatusUpdate => "status_update",
            MessageKind::ErrorReport => "error_report",
            MessageKind::Broadcast => "broadcast",
            MessageKind::NegotiationStart => "negotiation_start",
            MessageKind::NegotiationProposal => "negotiation_proposal",
            MessageKind::NegotiationVote => "negotiation_vote",
            MessageKind::NegotiationResult => "negotiation_result",
        }
    }

    pub fn is_negotiation(self) -> bool {
        matches!(
            self,
            MessageKind::NegotiationStart
                | MessageKind::NegotiationProposal
                | MessageKind::NegotiationVote
                | MessageKind::NegotiationResult
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        MessageKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| HubError::Validation(format!("unknown message kind: {s}")))
    }
}

/// Dispatch priority. Ordered `Low < Medium < High < Urgent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Drain order of the dispatch queue
    pub const DESCENDING: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Legacy numeric rank (1 = low .. 4 = urgent)
    pub fn rank(self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Medium => 2,
            Priority::High => 3,
            Priority::Urgent => 4,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            1 => Some(Priority::Low),
            2 => Some(Priority::Medium),
            3 => Some(Priority::High),
            4 => Some(Priority::Urgent),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(HubError::Validation(format!("unknown priority: {other}"))),
        }
    }
}

// Accepts the canonical label or the legacy numeric rank
impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Label(String),
            Rank(u8),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Label(label) => label.parse().map_err(serde::de::Error::custom),
            Repr::Rank(rank) => Priority::from_rank(rank).ok_or_else(|| {
                serde::de::Error::custom(format!("unknown priority rank: {rank}"))
            }),
        }
    }
}

/// A structured message exchanged between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message identity, generated when absent. An explicitly empty id is
    /// kept as-is.
    #[serde(default = "new_id")]
    pub id: String,
    pub sender: AgentRole,
    pub recipient: AgentRole,
    #[serde(alias = "message_type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub priority: Priority,
    /// Creation time in milliseconds since epoch, non-decreasing per process
    #[serde(default = "monotonic_ms")]
    pub timestamp_ms: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub requires_response: bool,
    #[serde(default = "new_id", deserialize_with = "null_as_fresh_id")]
    pub conversation_id: String,
}

impl Message {
    pub fn new(
        sender: AgentRole,
        recipient: AgentRole,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            sender,
            recipient,
            kind,
            content: content.into(),
            priority: Priority::Medium,
            timestamp_ms: monotonic_ms(),
            metadata: HashMap::new(),
            requires_response: false,
            conversation_id: new_id(),
        }
    }

    /// Use a caller-supplied id (an empty string is preserved, not replaced).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Replace the metadata map; `None` yields an empty map.
    pub fn with_metadata(mut self, metadata: Option<HashMap<String, Value>>) -> Self {
        self.metadata = metadata.unwrap_or_default();
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Join an existing conversation thread.
    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }

    pub fn with_requires_response(mut self, requires_response: bool) -> Self {
        self.requires_response = requires_response;
        self
    }

    /// Builds the task response answering this message.
    ///
    /// The reply goes back to this message's sender, joins its conversation and
    /// carries this message's id under [`keys::RESPONSE_TO`].
    pub fn reply(&self, content: impl Into<String>) -> Message {
        Message::new(
            self.recipient,
            self.sender,
            MessageKind::TaskResponse,
            content,
        )
        .with_priority(self.priority)
        .with_conversation_id(self.conversation_id.clone())
        .with_meta(keys::RESPONSE_TO, self.id.clone())
    }

    /// Id of the request this message answers, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.get(keys::RESPONSE_TO).and_then(Value::as_str)
    }

    /// Negotiation session this message belongs to, if any.
    pub fn negotiation_id(&self) -> Option<&str> {
        self.metadata
            .get(keys::NEGOTIATION_ID)
            .and_then(Value::as_str)
    }

    pub fn is_broadcast(&self) -> bool {
        self.metadata
            .get(keys::BROADCAST)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Checks that the message can be accepted by the hub.
    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(HubError::Validation(format!(
                "message {} from {} to {} has no content",
                self.id, self.sender, self.recipient
            )));
        }
        Ok(())
    }

    /// Flat key/value form with enum fields as canonical labels.
    pub fn to_map(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(HubError::Validation(format!(
                "message did not serialize to an object: {other}"
            ))),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(map))
            .map_err(|e| HubError::Validation(format!("malformed message: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| HubError::Validation(format!("malformed message: {e}")))
    }
}

/// Collision-resistant random identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

static LAST_TIMESTAMP_MS: AtomicI64 = AtomicI64::new(0);

/// Wall-clock milliseconds that never go backwards within the process.
pub fn monotonic_ms() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let prev = LAST_TIMESTAMP_MS.fetch_max(now, Ordering::AcqRel);
    now.max(prev)
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<HashMap<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_fresh_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(new_id))
}
