// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Actor owning the single Redis pub/sub connection backing the hub.
//! Bridges `ws:section:{id}`, `ws:adhoc:{uid}`, `ws:device:{code}` channels
//! to locally-connected devices. Mirrors the reconnect-with-backoff shape of
//! a single shared upstream connection multiplexed to many local
//! subscribers, generalized from a WebSocket bridge to a pub/sub bridge.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::hub::Registry;

/// Minimal inbound pub/sub envelope, matching the `{"type": ...}` shape
/// every hub-published payload carries (`REFRESH_SCORES_PAYLOAD`,
/// `disconnect_payload`, `reconnect_payload`). Parsed only to validate
/// shape before forwarding; the original payload string is what's actually
/// delivered to devices.
#[derive(Deserialize)]
struct Message {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    kind: String,
}

pub enum PubSubCommand {
    Subscribe { channels: Vec<String>, ack: oneshot::Sender<Result<(), AppError>> },
    Unsubscribe { channels: Vec<String> },
}

/// Spawns the actor and returns a command handle. The actor reconnects with
/// exponential backoff and resubscribes to every channel the registry
/// currently has subscribers for.
pub fn spawn(
    redis_url: String,
    registry: Arc<RwLock<Registry>>,
    cancel: CancellationToken,
) -> mpsc::Sender<PubSubCommand> {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    tokio::spawn(run(redis_url, registry, cancel, cmd_rx));
    cmd_tx
}

async fn run(
    redis_url: String,
    registry: Arc<RwLock<Registry>>,
    cancel: CancellationToken,
    mut cmd_rx: mpsc::Receiver<PubSubCommand>,
) {
    let mut backoff = Duration::from_millis(100);
    let max_backoff = Duration::from_secs(5);
    // Channels the actor believes it holds a live subscription for; used to
    // resubscribe after a reconnect.
    let mut subscribed: HashSet<String> = HashSet::new();

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let client = match redis::Client::open(redis_url.as_str()) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(err = %e, "invalid redis URL for pub/sub hub, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                continue;
            }
        };

        let conn = match client.get_async_pubsub().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(err = %e, backoff_ms = backoff.as_millis() as u64, "hub pub/sub connect failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(max_backoff);
                continue;
            }
        };
        backoff = Duration::from_millis(100);
        let mut pubsub = conn;

        // Resubscribe to everything the registry currently needs, in case
        // this is a reconnect after a drop.
        let needed: Vec<String> = {
            let guard = registry.read().await;
            guard.by_key.keys().map(|k| channel_for_key(k)).collect()
        };
        for channel in &needed {
            if let Err(e) = pubsub.subscribe(channel).await {
                tracing::warn!(err = %e, channel, "resubscribe failed after reconnect");
            } else {
                subscribed.insert(channel.clone());
            }
        }

        'conn: loop {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(cmd) => {
                                drop(stream);
                                handle_command(&mut pubsub, &mut subscribed, cmd).await;
                                break;
                            }
                            None => return,
                        }
                    }
                    msg = stream.next() => {
                        match msg {
                            Some(msg) => {
                                let channel: String = msg.get_channel_name().to_owned();
                                let payload: String = msg.get_payload().unwrap_or_default();
                                drop_and_deliver(&registry, &channel, &payload).await;
                            }
                            None => {
                                tracing::warn!("hub pub/sub connection closed, reconnecting");
                                break 'conn;
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn handle_command(
    pubsub: &mut redis::aio::PubSub,
    subscribed: &mut HashSet<String>,
    cmd: PubSubCommand,
) {
    match cmd {
        PubSubCommand::Subscribe { channels, ack } => {
            let mut result = Ok(());
            for channel in &channels {
                if subscribed.contains(channel) {
                    continue;
                }
                if let Err(e) = pubsub.subscribe(channel).await {
                    result = Err(AppError::Internal(format!("subscribe {channel}: {e}")));
                    break;
                }
                subscribed.insert(channel.clone());
            }
            let _ = ack.send(result);
        }
        PubSubCommand::Unsubscribe { channels } => {
            for channel in &channels {
                if let Err(e) = pubsub.unsubscribe(channel).await {
                    tracing::warn!(err = %e, channel, "unsubscribe failed (best-effort)");
                } else {
                    subscribed.remove(channel);
                }
            }
        }
    }
}

async fn drop_and_deliver(registry: &Arc<RwLock<Registry>>, channel: &str, payload: &str) {
    let Some(routing_key) = channel.strip_prefix("ws:") else { return };
    if let Err(e) = serde_json::from_str::<Message>(payload) {
        tracing::warn!(err = %e, channel, "dropping unparseable hub message");
        return;
    }
    let guard = registry.read().await;
    guard.deliver(routing_key, payload);
}

pub fn channel_for_key(routing_key: &str) -> String {
    format!("ws:{routing_key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Conn;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn registry_with_subscriber(routing_key: &str, device_code: &str) -> (Arc<RwLock<Registry>>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        let mut registry = Registry::default();
        registry.by_device.insert(
            device_code.to_owned(),
            Conn { id: Uuid::new_v4(), tx, routing_keys: vec![routing_key.to_owned()] },
        );
        registry.by_key.entry(routing_key.to_owned()).or_default().insert(device_code.to_owned());
        (Arc::new(RwLock::new(registry)), rx)
    }

    #[test]
    fn channel_for_key_adds_ws_prefix() {
        assert_eq!(channel_for_key("section:1"), "ws:section:1");
        assert_eq!(channel_for_key("adhoc:9"), "ws:adhoc:9");
    }

    #[tokio::test]
    async fn drop_and_deliver_forwards_a_well_formed_message() {
        let (registry, mut rx) = registry_with_subscriber("section:1", "ABC12345");
        drop_and_deliver(&registry, "ws:section:1", r#"{"type":"refresh-scores"}"#).await;
        assert_eq!(rx.try_recv().unwrap(), r#"{"type":"refresh-scores"}"#);
    }

    #[tokio::test]
    async fn drop_and_deliver_drops_an_unparseable_payload() {
        let (registry, mut rx) = registry_with_subscriber("section:1", "ABC12345");
        drop_and_deliver(&registry, "ws:section:1", "not json").await;
        assert!(rx.try_recv().is_err());
    }
}
