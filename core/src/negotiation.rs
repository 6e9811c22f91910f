//! Multi-party negotiation sessions.
//!
//! A session walks `Open -> Proposing -> Voting -> Resolved`, falling back to
//! `Proposing` whenever a participant rejects the proposal under vote, and
//! ending in `Aborted` on withdrawal, deadline or hub shutdown. The proposer
//! of a round implicitly accepts its own proposal. Terminal sessions never
//! change again.
//!
//! This module only holds the state machine. The hub turns every transition
//! into ordinary messages carrying the session id as conversation id.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

use crate::message::{monotonic_ms, AgentRole};
use crate::{HubError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationState {
    Open,
    Proposing,
    Voting,
    Resolved,
    Aborted,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Resolved | NegotiationState::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Open => "open",
            NegotiationState::Proposing => "proposing",
            NegotiationState::Voting => "voting",
            NegotiationState::Resolved => "resolved",
            NegotiationState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Accept,
    Reject,
}

impl Vote {
    pub fn as_str(self) -> &'static str {
        match self {
            Vote::Accept => "accept",
            Vote::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Withdrawn(AgentRole),
    DeadlineElapsed,
    HubStopped,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Withdrawn(role) => write!(f, "{role} withdrew"),
            AbortReason::DeadlineElapsed => f.write_str("deadline elapsed"),
            AbortReason::HubStopped => f.write_str("hub stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NegotiationOutcome {
    Resolved { round: u32, proposal: Value },
    Aborted { reason: AbortReason },
}

/// One line of a session's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum NegotiationEntry {
    Proposal {
        round: u32,
        participant: AgentRole,
        proposal: Value,
        at_ms: i64,
    },
    Vote {
        round: u32,
        participant: AgentRole,
        vote: Vote,
        at_ms: i64,
    },
    Withdrawal {
        participant: AgentRole,
        at_ms: i64,
    },
}

/// What a vote did to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum VoteEffect {
    /// Still waiting on these participants
    Pending { awaiting: Vec<AgentRole> },
    /// Back to proposing
    Rejected,
    Resolved { round: u32, proposal: Value },
    /// Participant already voted this round; nothing changed
    Duplicate,
}

#[derive(Debug, Clone, Serialize)]
pub struct NegotiationSession {
    pub id: String,
    pub participants: Vec<AgentRole>,
    pub topic: String,
    pub initial_data: HashMap<String, Value>,
    pub state: NegotiationState,
    pub round: u32,
    pub current_proposal: Option<Value>,
    pub log: Vec<NegotiationEntry>,
    pub outcome: Option<NegotiationOutcome>,
    pub created_at_ms: i64,
    #[serde(skip)]
    votes: HashMap<AgentRole, Vote>,
    #[serde(skip)]
    deadline: Instant,
}

impl NegotiationSession {
    pub fn new(
        id: impl Into<String>,
        participants: Vec<AgentRole>,
        topic: impl Into<String>,
        initial_data: HashMap<String, Value>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        if let Some(dup) = participants.iter().find(|p| !seen.insert(**p)) {
            return Err(HubError::Validation(format!(
                "participant {dup} listed twice"
            )));
        }
        if participants.len() < 2 {
            return Err(HubError::Validation(
                "a negotiation needs at least two participants".into(),
            ));
        }

        Ok(Self {
            id: id.into(),
            participants,
            topic: topic.into(),
            initial_data,
            state: NegotiationState::Open,
            round: 0,
            current_proposal: None,
            log: Vec::new(),
            outcome: None,
            created_at_ms: monotonic_ms(),
            votes: HashMap::new(),
            deadline: Instant::now() + timeout,
        })
    }

    /// Submits a proposal and opens a vote on it. Returns the round number.
    pub fn propose(&mut self, participant: AgentRole, proposal: Value) -> Result<u32> {
        self.ensure_live()?;
        self.ensure_participant(participant)?;
        if self.state == NegotiationState::Voting {
            return Err(HubError::StateConflict(format!(
                "negotiation {} is voting on round {}; wait for the votes",
                self.id, self.round
            )));
        }

        self.round += 1;
        self.log.push(NegotiationEntry::Proposal {
            round: self.round,
            participant,
            proposal: proposal.clone(),
            at_ms: monotonic_ms(),
        });
        self.current_proposal = Some(proposal);
        self.votes.clear();
        self.votes.insert(participant, Vote::Accept);
        self.state = NegotiationState::Voting;
        Ok(self.round)
    }

    pub fn vote(&mut self, participant: AgentRole, vote: Vote) -> Result<VoteEffect> {
        self.ensure_live()?;
        self.ensure_participant(participant)?;
        if self.state != NegotiationState::Voting {
            return Err(HubError::StateConflict(format!(
                "negotiation {} has no proposal under vote (state: {})",
                self.id, self.state
            )));
        }
        if self.votes.contains_key(&participant) {
            return Ok(VoteEffect::Duplicate);
        }

        self.votes.insert(participant, vote);
        self.log.push(NegotiationEntry::Vote {
            round: self.round,
            participant,
            vote,
            at_ms: monotonic_ms(),
        });

        if vote == Vote::Reject {
            self.state = NegotiationState::Proposing;
            return Ok(VoteEffect::Rejected);
        }

        let awaiting = self.awaiting_votes();
        if !awaiting.is_empty() {
            return Ok(VoteEffect::Pending { awaiting });
        }

        let proposal = self.current_proposal.clone().unwrap_or(Value::Null);
        self.state = NegotiationState::Resolved;
        self.outcome = Some(NegotiationOutcome::Resolved {
            round: self.round,
            proposal: proposal.clone(),
        });
        Ok(VoteEffect::Resolved {
            round: self.round,
            proposal,
        })
    }

    pub fn withdraw(&mut self, participant: AgentRole) -> Result<()> {
        self.ensure_live()?;
        self.ensure_participant(participant)?;
        self.log.push(NegotiationEntry::Withdrawal {
            participant,
            at_ms: monotonic_ms(),
        });
        self.abort(AbortReason::Withdrawn(participant))
    }

    pub fn abort(&mut self, reason: AbortReason) -> Result<()> {
        self.ensure_live()?;
        self.state = NegotiationState::Aborted;
        self.outcome = Some(NegotiationOutcome::Aborted { reason });
        Ok(())
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        !self.state.is_terminal() && now >= self.deadline
    }

    /// Participants that have not voted on the current proposal.
    pub fn awaiting_votes(&self) -> Vec<AgentRole> {
        if self.state != NegotiationState::Voting {
            return Vec::new();
        }
        self.participants
            .iter()
            .filter(|p| !self.votes.contains_key(p))
            .copied()
            .collect()
    }

    /// Every participant except `participant`.
    pub fn others(&self, participant: AgentRole) -> Vec<AgentRole> {
        self.participants
            .iter()
            .filter(|p| **p != participant)
            .copied()
            .collect()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(HubError::StateConflict(format!(
                "negotiation {} is already {}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    fn ensure_participant(&self, participant: AgentRole) -> Result<()> {
        if !self.participants.contains(&participant) {
            return Err(HubError::Validation(format!(
                "{participant} is not a participant of negotiation {}",
                self.id
            )));
        }
        Ok(())
    }
}

struct SessionSlot {
    session: NegotiationSession,
    state_tx: watch::Sender<NegotiationState>,
}

/// All negotiation sessions of one hub.
#[derive(Default)]
pub struct NegotiationManager {
    sessions: HashMap<String, SessionSlot>,
}

impl NegotiationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: NegotiationSession) {
        let (state_tx, _) = watch::channel(session.state);
        self.sessions
            .insert(session.id.clone(), SessionSlot { session, state_tx });
    }

    pub fn get(&self, session_id: &str) -> Option<&NegotiationSession> {
        self.sessions.get(session_id).map(|s| &s.session)
    }

    /// Runs `f` against a session and publishes its resulting state.
    pub fn with_session<T, F>(&mut self, session_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut NegotiationSession) -> Result<T>,
    {
        let slot = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| HubError::NegotiationNotFound(session_id.to_string()))?;
        let result = f(&mut slot.session);
        slot.state_tx.send_replace(slot.session.state);
        result
    }

    pub fn watch(&self, session_id: &str) -> Result<watch::Receiver<NegotiationState>> {
        self.sessions
            .get(session_id)
            .map(|s| s.state_tx.subscribe())
            .ok_or_else(|| HubError::NegotiationNotFound(session_id.to_string()))
    }

    pub fn expired(&self, now: Instant) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.session.is_expired(now))
            .map(|s| s.session.id.clone())
            .collect()
    }

    pub fn live_ids(&self) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| !s.session.state.is_terminal())
            .map(|s| s.session.id.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| !s.session.state.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const A: AgentRole = AgentRole::ProductManager;
    const B: AgentRole = AgentRole::Developer;
    const C: AgentRole = AgentRole::Reviewer;

    fn session(participants: Vec<AgentRole>) -> NegotiationSession {
        NegotiationSession::new(
            "neg-1",
            participants,
            "API design",
            HashMap::new(),
            Duration::from_secs(60),
        )
        .unwrap()
    }

    #[test]
    fn test_reject_then_accept_resolves_with_second_proposal() {
        let mut s = session(vec![A, B]);
        assert_eq!(s.state, NegotiationState::Open);

        assert_eq!(s.propose(A, json!("P1")).unwrap(), 1);
        assert_eq!(s.state, NegotiationState::Voting);
        assert_eq!(s.vote(B, Vote::Reject).unwrap(), VoteEffect::Rejected);
        assert_eq!(s.state, NegotiationState::Proposing);

        assert_eq!(s.propose(A, json!("P2")).unwrap(), 2);
        assert_eq!(
            s.vote(B, Vote::Accept).unwrap(),
            VoteEffect::Resolved {
                round: 2,
                proposal: json!("P2")
            }
        );
        assert_eq!(s.state, NegotiationState::Resolved);
        assert_eq!(
            s.outcome,
            Some(NegotiationOutcome::Resolved {
                round: 2,
                proposal: json!("P2")
            })
        );

        let err = s.propose(A, json!("P3")).unwrap_err();
        assert!(matches!(err, HubError::StateConflict(_)));
        assert!(matches!(
            s.vote(B, Vote::Accept).unwrap_err(),
            HubError::StateConflict(_)
        ));
        assert_eq!(s.log.len(), 4);
    }

    #[test]
    fn test_three_party_waits_for_everyone() {
        let mut s = session(vec![A, B, C]);
        s.propose(B, json!({"plan": "rest"})).unwrap();

        assert_eq!(
            s.vote(A, Vote::Accept).unwrap(),
            VoteEffect::Pending { awaiting: vec![C] }
        );
        assert!(matches!(
            s.vote(C, Vote::Accept).unwrap(),
            VoteEffect::Resolved { round: 1, .. }
        ));
    }

    #[test]
    fn test_duplicate_vote_changes_nothing() {
        let mut s = session(vec![A, B, C]);
        s.propose(A, json!("P1")).unwrap();
        s.vote(B, Vote::Accept).unwrap();

        assert_eq!(s.vote(B, Vote::Reject).unwrap(), VoteEffect::Duplicate);
        assert_eq!(s.vote(A, Vote::Reject).unwrap(), VoteEffect::Duplicate);
        assert_eq!(s.state, NegotiationState::Voting);
        assert_eq!(s.awaiting_votes(), vec![C]);
    }

    #[test]
    fn test_out_of_turn_actions_conflict() {
        let mut s = session(vec![A, B]);
        assert!(matches!(
            s.vote(B, Vote::Accept).unwrap_err(),
            HubError::StateConflict(_)
        ));

        s.propose(A, json!("P1")).unwrap();
        assert!(matches!(
            s.propose(B, json!("P2")).unwrap_err(),
            HubError::StateConflict(_)
        ));
        assert_eq!(s.round, 1);
    }

    #[test]
    fn test_withdraw_aborts() {
        let mut s = session(vec![A, B]);
        s.withdraw(B).unwrap();

        assert_eq!(s.state, NegotiationState::Aborted);
        assert_eq!(
            s.outcome,
            Some(NegotiationOutcome::Aborted {
                reason: AbortReason::Withdrawn(B)
            })
        );
        assert!(s.withdraw(A).is_err());
    }

    #[test]
    fn test_participant_validation() {
        let open = |participants| {
            NegotiationSession::new("x", participants, "t", HashMap::new(), Duration::from_secs(1))
        };
        assert!(open(vec![A]).is_err());
        assert!(open(vec![A, A]).is_err());

        let mut s = session(vec![A, B]);
        assert!(matches!(
            s.propose(C, json!("P1")).unwrap_err(),
            HubError::Validation(_)
        ));
    }

    #[test]
    fn test_deadline_expiry() {
        let s = NegotiationSession::new(
            "x",
            vec![A, B],
            "t",
            HashMap::new(),
            Duration::from_millis(5),
        )
        .unwrap();
        assert!(!s.is_expired(Instant::now()));
        assert!(s.is_expired(Instant::now() + Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_manager_publishes_state() {
        let mut manager = NegotiationManager::new();
        manager.insert(session(vec![A, B]));
        let mut rx = manager.watch("neg-1").unwrap();

        manager
            .with_session("neg-1", |s| s.propose(A, json!("P1")))
            .unwrap();
        manager
            .with_session("neg-1", |s| s.vote(B, Vote::Accept))
            .unwrap();

        let state = *rx.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(state, NegotiationState::Resolved);
        assert_eq!(manager.active_count(), 0);
        assert!(matches!(
            manager.with_session("missing", |_| Ok(())),
            Err(HubError::NegotiationNotFound(_))
        ));
    }
}
