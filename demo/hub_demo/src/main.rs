mod config;
use config::DemoConfig;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use commhub_core::telemetry::init_tracing;
use commhub_core::{
    handler_fn, AgentRole, CommunicationHub, Message, MessageKind, NegotiationState, Vote,
};
use serde_json::json;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Logging / tracing
    init_tracing(Some("info,commhub_core=info,hub_demo=info"))?;
    info!(target = "hub_demo", "Starting Communication Hub demo");

    // Load configuration (env defaults + optional TOML overlay)
    let cfg = DemoConfig::load();
    let hub = CommunicationHub::new(cfg.hub.clone());

    // 1) Developer: answers task requests, acknowledges everything else
    let dev_hub = hub.clone();
    hub.subscribe_handler(
        AgentRole::Developer,
        handler_fn(move |msg: Message| {
            let hub = dev_hub.clone();
            async move {
                match msg.kind {
                    MessageKind::TaskRequest => {
                        info!(target = "hub_demo", task = %msg.content, "dev picked up task");
                        let reply = msg.reply(format!(
                            "Done: {}. Endpoint live behind a feature flag.",
                            msg.content
                        ));
                        hub.send_message(reply).await?;
                    }
                    _ => info!(
                        target = "hub_demo",
                        kind = %msg.kind,
                        from = %msg.sender,
                        "dev received"
                    ),
                }
                Ok(())
            }
        }),
    );

    // 2) PM and tester: plain inboxes drained by background tasks
    for role in [AgentRole::ProductManager, AgentRole::Tester] {
        let mut inbox = hub.subscribe_inbox(role);
        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                info!(
                    target = "hub_demo",
                    to = %role,
                    from = %msg.sender,
                    kind = %msg.kind,
                    "{}",
                    msg.content
                );
            }
        });
    }

    // 3) Monitor counting all traffic
    let observed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&observed);
    hub.add_monitor(handler_fn(move |_msg: Message| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }));

    hub.start().await?;

    // 4) Request/response
    match hub
        .send_request(
            AgentRole::ProductManager,
            AgentRole::Developer,
            cfg.feature.clone(),
            Some(Duration::from_millis(cfg.request_timeout_ms)),
        )
        .await
    {
        Ok(reply) => {
            info!(target = "hub_demo", reply = %reply.content, "PM got an answer");
            let context = hub.get_context(&reply.conversation_id, None).await;
            info!(target = "hub_demo", messages = context.len(), "task conversation archived");
        }
        Err(e) => error!(target = "hub_demo", error = %e, "request failed"),
    }

    // 5) Broadcast
    let sent = hub
        .broadcast_message(AgentRole::ProductManager, "Sprint review moved to Thursday")
        .await?;
    info!(target = "hub_demo", recipients = sent, "broadcast sent");

    // 6) Negotiation: PM proposes, dev rejects and counters, PM accepts
    let session = hub
        .start_negotiation(
            vec![AgentRole::ProductManager, AgentRole::Developer],
            cfg.negotiation_topic.clone(),
            Some([("feature".to_string(), json!(cfg.feature))].into_iter().collect()),
        )
        .await?;
    hub.propose(&session, AgentRole::ProductManager, json!({"release": "Friday"}))
        .await?;
    hub.vote(&session, AgentRole::Developer, Vote::Reject).await?;
    hub.propose(&session, AgentRole::Developer, json!({"release": "next Monday"}))
        .await?;
    let state = hub
        .vote(&session, AgentRole::ProductManager, Vote::Accept)
        .await?;
    if state == NegotiationState::Resolved {
        let outcome = hub
            .await_negotiation(&session, Some(Duration::from_secs(1)))
            .await?;
        let outcome = serde_json::to_string(&outcome)?;
        info!(target = "hub_demo", outcome = %outcome, "negotiation finished");
    }

    // 7) Drain and report
    hub.stop().await?;
    let stats = hub.get_stats().await;
    info!(
        target = "hub_demo",
        observed = observed.load(Ordering::Relaxed),
        "final stats: {}",
        serde_json::to_string_pretty(&stats)?
    );

    Ok(())
}
