#![allow(dead_code)]

use std::time::Duration;

use commhub_core::{CommunicationHub, HubStats, Message};
use tokio::sync::mpsc;

/// Waits until every accepted message has a final outcome.
pub async fn settle(hub: &CommunicationHub) -> HubStats {
    for _ in 0..400 {
        let stats = hub.get_stats().await;
        if stats.queue_size == 0 && stats.in_flight() == 0 {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("hub did not settle");
}

/// Everything currently sitting in an inbox.
pub fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}
