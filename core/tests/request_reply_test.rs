use std::time::{Duration, Instant};

use commhub_core::{
    handler_fn, meta_keys, AgentRole, CommunicationHub, HubError, Message, MessageKind,
};
use tokio::task::JoinSet;

mod common;
use common::{drain, settle};

/// Developer that answers every task request with `done: <content>`.
fn echo_developer(hub: &CommunicationHub) {
    let responder = hub.clone();
    hub.subscribe_handler(
        AgentRole::Developer,
        handler_fn(move |msg: Message| {
            let hub = responder.clone();
            async move {
                if msg.kind == MessageKind::TaskRequest {
                    let reply = msg.reply(format!("done: {}", msg.content));
                    hub.send_message(reply).await?;
                }
                Ok(())
            }
        }),
    );
}

#[tokio::test]
async fn request_reply_basic() {
    commhub_core::telemetry::init_test_tracing();
    let hub = CommunicationHub::default();
    echo_developer(&hub);
    hub.start().await.unwrap();

    let reply = hub
        .send_request(
            AgentRole::ProductManager,
            AgentRole::Developer,
            "Implement login API endpoint",
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    assert_eq!(reply.kind, MessageKind::TaskResponse);
    assert_eq!(reply.sender, AgentRole::Developer);
    assert_eq!(reply.content, "done: Implement login API endpoint");
    assert!(reply.metadata.contains_key(meta_keys::RESPONSE_TO));

    // The requester has no subscriber, yet the response still counts as delivered
    let stats = settle(&hub).await;
    assert_eq!(stats.total_failed, 0);
    assert_eq!(stats.pending_requests, 0);
    let thread = hub.get_context(&reply.conversation_id, None).await;
    assert_eq!(thread.len(), 2);
    assert!(thread[0].requires_response);

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn request_times_out_no_earlier_than_configured() {
    let hub = CommunicationHub::default();
    hub.start().await.unwrap();

    let started = Instant::now();
    let result = hub
        .send_request(
            AgentRole::ProductManager,
            AgentRole::Developer,
            "nobody is listening",
            Some(Duration::from_millis(150)),
        )
        .await;

    assert!(matches!(
        result,
        Err(HubError::RequestTimeout {
            timeout_ms: 150,
            ..
        })
    ));
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(hub.get_stats().await.pending_requests, 0);
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn late_response_is_routed_as_plain_message() {
    let hub = CommunicationHub::default();
    let mut pm_inbox = hub.subscribe_inbox(AgentRole::ProductManager);
    let responder = hub.clone();
    hub.subscribe_handler(
        AgentRole::Developer,
        handler_fn(move |msg: Message| {
            let hub = responder.clone();
            async move {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    let _ = hub.send_message(msg.reply("sorry, late")).await;
                });
                Ok(())
            }
        }),
    );
    hub.start().await.unwrap();

    let result = hub
        .send_request(
            AgentRole::ProductManager,
            AgentRole::Developer,
            "quick question",
            Some(Duration::from_millis(30)),
        )
        .await;
    assert!(matches!(result, Err(HubError::RequestTimeout { .. })));

    tokio::time::sleep(Duration::from_millis(250)).await;
    settle(&hub).await;
    let got = drain(&mut pm_inbox);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].content, "sorry, late");
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn response_from_wrong_participant_is_ignored() {
    let hub = CommunicationHub::default();
    hub.start().await.unwrap();

    let request = Message::new(
        AgentRole::ProductManager,
        AgentRole::Developer,
        MessageKind::TaskRequest,
        "estimate the story",
    )
    .with_id("req-estimate");
    let mut forged = request.reply("forged");
    forged.sender = AgentRole::Tester;
    let genuine = request.reply("genuine");

    let sender = hub.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        sender.send_message(forged).await.unwrap();
        sender.send_message(genuine).await.unwrap();
    });

    let reply = hub
        .request(request, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply.content, "genuine");
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn request_ids_must_be_usable_for_correlation() {
    let hub = CommunicationHub::default();
    hub.start().await.unwrap();

    let unnamed = Message::new(
        AgentRole::ProductManager,
        AgentRole::Developer,
        MessageKind::TaskRequest,
        "no id",
    )
    .with_id("");
    assert!(matches!(
        hub.request(unnamed, Some(Duration::from_millis(50))).await,
        Err(HubError::Validation(_))
    ));

    let first = Message::new(
        AgentRole::ProductManager,
        AgentRole::Developer,
        MessageKind::TaskRequest,
        "first",
    )
    .with_id("req-dup");
    let again = first.clone();
    let waiter = hub.clone();
    let pending = tokio::spawn(async move {
        waiter.request(first, Some(Duration::from_secs(5))).await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(matches!(
        hub.request(again, Some(Duration::from_millis(50))).await,
        Err(HubError::Validation(_))
    ));

    hub.stop().await.unwrap();
    assert!(matches!(
        pending.await.unwrap(),
        Err(HubError::RequestCancelled(_))
    ));
}

#[tokio::test]
async fn stop_cancels_waiting_requests() {
    let hub = CommunicationHub::default();
    hub.start().await.unwrap();

    let waiter = hub.clone();
    let pending = tokio::spawn(async move {
        waiter
            .send_request(
                AgentRole::ProductManager,
                AgentRole::Reviewer,
                "review when you can",
                Some(Duration::from_secs(10)),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.get_stats().await.pending_requests, 1);

    let started = Instant::now();
    hub.stop().await.unwrap();
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(HubError::RequestCancelled(_))));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(hub.get_stats().await.pending_requests, 0);
}

#[tokio::test]
async fn concurrent_requests_get_their_own_responses() {
    let hub = CommunicationHub::default();
    echo_developer(&hub);
    hub.start().await.unwrap();

    let mut set = JoinSet::new();
    for i in 0..10 {
        let hub = hub.clone();
        set.spawn(async move {
            let reply = hub
                .send_request(
                    AgentRole::ProductManager,
                    AgentRole::Developer,
                    format!("task {i}"),
                    Some(Duration::from_secs(2)),
                )
                .await
                .unwrap();
            (i, reply.content)
        });
    }

    let mut answered = 0;
    while let Some(joined) = set.join_next().await {
        let (i, content) = joined.unwrap();
        assert_eq!(content, format!("done: task {i}"));
        answered += 1;
    }
    assert_eq!(answered, 10);
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn duplicate_response_is_not_delivered_twice_to_the_caller() {
    let hub = CommunicationHub::default();
    let mut pm_inbox = hub.subscribe_inbox(AgentRole::ProductManager);
    let responder = hub.clone();
    hub.subscribe_handler(
        AgentRole::Developer,
        handler_fn(move |msg: Message| {
            let hub = responder.clone();
            async move {
                if msg.kind == MessageKind::TaskRequest {
                    hub.send_message(msg.reply("first")).await?;
                    hub.send_message(msg.reply("second")).await?;
                }
                Ok(())
            }
        }),
    );
    hub.start().await.unwrap();

    let reply = hub
        .send_request(
            AgentRole::ProductManager,
            AgentRole::Developer,
            "answer twice",
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap();
    assert_eq!(reply.content, "first");

    settle(&hub).await;
    // Both copies still reach the requester's inbox as ordinary traffic
    let contents: Vec<String> = drain(&mut pm_inbox).into_iter().map(|m| m.content).collect();
    assert_eq!(contents, vec!["first", "second"]);
    hub.stop().await.unwrap();
}
