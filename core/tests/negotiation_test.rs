use std::time::Duration;

use commhub_core::{
    meta_keys, AbortReason, AgentRole, CommunicationHub, HubConfig, HubError, MessageKind,
    NegotiationOutcome, NegotiationState, ThreadStatus, Vote,
};
use serde_json::json;

mod common;
use common::{drain, settle};

const PM: AgentRole = AgentRole::ProductManager;
const DEV: AgentRole = AgentRole::Developer;
const QA: AgentRole = AgentRole::Tester;

#[tokio::test]
async fn reject_then_counter_proposal_resolves() {
    commhub_core::telemetry::init_test_tracing();
    let hub = CommunicationHub::default();
    let mut pm_inbox = hub.subscribe_inbox(PM);
    let mut dev_inbox = hub.subscribe_inbox(DEV);
    hub.start().await.unwrap();

    let id = hub
        .start_negotiation(
            vec![PM, DEV],
            "Release date",
            Some([("sprint".to_string(), json!(14))].into_iter().collect()),
        )
        .await
        .unwrap();

    let round = hub.propose(&id, PM, json!({"release": "Friday"})).await.unwrap();
    assert_eq!(round, 1);
    assert_eq!(
        hub.vote(&id, DEV, Vote::Reject).await.unwrap(),
        NegotiationState::Proposing
    );

    let round = hub.propose(&id, DEV, json!({"release": "Monday"})).await.unwrap();
    assert_eq!(round, 2);
    assert_eq!(
        hub.vote(&id, PM, Vote::Accept).await.unwrap(),
        NegotiationState::Resolved
    );

    let outcome = hub
        .await_negotiation(&id, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        NegotiationOutcome::Resolved {
            round: 2,
            proposal: json!({"release": "Monday"}),
        }
    );

    let session = hub.negotiation(&id).await.unwrap();
    assert_eq!(session.state, NegotiationState::Resolved);
    assert_eq!(session.log.len(), 4);

    settle(&hub).await;
    let thread = hub.conversation(&id).await.unwrap();
    assert_eq!(thread.status, ThreadStatus::Closed);

    let pm_kinds: Vec<MessageKind> = drain(&mut pm_inbox).into_iter().map(|m| m.kind).collect();
    assert_eq!(
        pm_kinds,
        vec![
            MessageKind::NegotiationStart,
            MessageKind::NegotiationVote,
            MessageKind::NegotiationProposal,
            MessageKind::NegotiationResult,
        ]
    );

    let dev_msgs = drain(&mut dev_inbox);
    assert_eq!(dev_msgs.len(), 4);
    let start = &dev_msgs[0];
    assert_eq!(start.kind, MessageKind::NegotiationStart);
    assert_eq!(start.negotiation_id(), Some(id.as_str()));
    assert_eq!(start.metadata[meta_keys::TOPIC], json!("Release date"));
    assert_eq!(start.metadata[meta_keys::PARTICIPANTS], json!(["pm", "dev"]));
    assert_eq!(start.metadata[meta_keys::INITIAL_DATA], json!({"sprint": 14}));
    let result = dev_msgs.last().unwrap();
    assert_eq!(result.kind, MessageKind::NegotiationResult);
    assert_eq!(result.metadata[meta_keys::OUTCOME], json!("resolved"));

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn every_participant_must_accept() {
    let hub = CommunicationHub::default();
    hub.start().await.unwrap();
    let id = hub
        .start_negotiation(vec![PM, DEV, QA], "Test scope", None)
        .await
        .unwrap();

    hub.propose(&id, PM, "unit and integration").await.unwrap();
    assert_eq!(
        hub.vote(&id, DEV, Vote::Accept).await.unwrap(),
        NegotiationState::Voting
    );
    // A second vote in the same round changes nothing
    assert_eq!(
        hub.vote(&id, DEV, Vote::Reject).await.unwrap(),
        NegotiationState::Voting
    );
    assert_eq!(
        hub.vote(&id, QA, Vote::Accept).await.unwrap(),
        NegotiationState::Resolved
    );

    let session = hub.negotiation(&id).await.unwrap();
    assert_eq!(session.log.len(), 3);
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn out_of_turn_actions_conflict() {
    let hub = CommunicationHub::default();
    hub.start().await.unwrap();
    let id = hub
        .start_negotiation(vec![PM, DEV], "API shape", None)
        .await
        .unwrap();

    assert!(matches!(
        hub.vote(&id, DEV, Vote::Accept).await,
        Err(HubError::StateConflict(_))
    ));
    hub.propose(&id, PM, "REST").await.unwrap();
    assert!(matches!(
        hub.propose(&id, DEV, "gRPC").await,
        Err(HubError::StateConflict(_))
    ));
    assert!(matches!(
        hub.propose(&id, QA, "GraphQL").await,
        Err(HubError::Validation(_))
    ));

    hub.vote(&id, DEV, Vote::Accept).await.unwrap();
    assert!(matches!(
        hub.propose(&id, DEV, "too late").await,
        Err(HubError::StateConflict(_))
    ));
    assert!(matches!(
        hub.withdraw(&id, DEV).await,
        Err(HubError::StateConflict(_))
    ));
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn withdrawal_aborts_the_session() {
    let hub = CommunicationHub::default();
    let mut pm_inbox = hub.subscribe_inbox(PM);
    hub.start().await.unwrap();
    let id = hub
        .start_negotiation(vec![PM, DEV], "Tech debt budget", None)
        .await
        .unwrap();

    hub.withdraw(&id, DEV).await.unwrap();
    let outcome = hub.await_negotiation(&id, None).await.unwrap();
    assert_eq!(
        outcome,
        NegotiationOutcome::Aborted {
            reason: AbortReason::Withdrawn(DEV)
        }
    );

    settle(&hub).await;
    let last = drain(&mut pm_inbox).pop().unwrap();
    assert_eq!(last.kind, MessageKind::NegotiationResult);
    assert_eq!(last.metadata[meta_keys::OUTCOME], json!("aborted"));
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn deadline_aborts_stalled_session() {
    let hub = CommunicationHub::new(HubConfig {
        negotiation_timeout_ms: 50,
        sweep_interval_ms: 10,
        ..Default::default()
    });
    hub.start().await.unwrap();
    let id = hub
        .start_negotiation(vec![PM, DEV], "Nobody answers", None)
        .await
        .unwrap();

    let outcome = hub
        .await_negotiation(&id, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        NegotiationOutcome::Aborted {
            reason: AbortReason::DeadlineElapsed
        }
    );
    assert_eq!(hub.get_stats().await.active_negotiations, 0);
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn stop_aborts_live_sessions() {
    let hub = CommunicationHub::default();
    hub.start().await.unwrap();
    let id = hub
        .start_negotiation(vec![PM, DEV], "Interrupted", None)
        .await
        .unwrap();
    hub.propose(&id, PM, "something").await.unwrap();

    hub.stop().await.unwrap();
    let session = hub.negotiation(&id).await.unwrap();
    assert_eq!(session.state, NegotiationState::Aborted);
    assert_eq!(
        session.outcome,
        Some(NegotiationOutcome::Aborted {
            reason: AbortReason::HubStopped
        })
    );
    assert!(matches!(
        hub.vote(&id, DEV, Vote::Accept).await,
        Err(HubError::Stopped)
    ));
}

#[tokio::test]
async fn invalid_sessions_are_rejected() {
    let hub = CommunicationHub::default();
    hub.start().await.unwrap();

    assert!(matches!(
        hub.start_negotiation(vec![PM], "Alone", None).await,
        Err(HubError::Validation(_))
    ));
    assert!(matches!(
        hub.start_negotiation(vec![PM, PM], "Twins", None).await,
        Err(HubError::Validation(_))
    ));
    assert!(matches!(
        hub.propose("no-such-session", PM, "x").await,
        Err(HubError::NegotiationNotFound(_))
    ));
    assert!(matches!(
        hub.await_negotiation("no-such-session", None).await,
        Err(HubError::NegotiationNotFound(_))
    ));
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn waiting_on_an_undecided_session_times_out() {
    let hub = CommunicationHub::default();
    hub.start().await.unwrap();
    let id = hub
        .start_negotiation(vec![PM, DEV], "Still thinking", None)
        .await
        .unwrap();

    let result = hub
        .await_negotiation(&id, Some(Duration::from_millis(50)))
        .await;
    match result {
        Err(HubError::NegotiationTimeout {
            session_id,
            timeout_ms,
        }) => {
            assert_eq!(session_id, id);
            assert_eq!(timeout_ms, 50);
        }
        other => panic!("expected a negotiation timeout, got {:?}", other),
    }
    assert_eq!(
        hub.negotiation(&id).await.unwrap().state,
        NegotiationState::Open
    );
    hub.stop().await.unwrap();
}
