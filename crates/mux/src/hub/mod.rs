// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! C9 - WebSocket Hub: bridges the external Redis pub/sub channels to
//! locally-connected devices. See spec §4.9.

mod pubsub;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::kv::Kv;

/// Outbound channel capacity per connection. Overflow drops the new message
/// and logs WARN; the next refresh tick repairs any missed state.
const OUTBOUND_BUFFER: usize = 16;

struct Conn {
    id: Uuid,
    tx: mpsc::Sender<String>,
    routing_keys: Vec<String>,
}

/// Two flat maps, as required by spec §4.9: device code -> connection, and
/// routing key -> set of subscribed device codes. Both protected by the
/// same lock; hold time must stay O(keys per connection) and never wrap I/O.
#[derive(Default)]
pub(crate) struct Registry {
    by_device: HashMap<String, Conn>,
    pub(crate) by_key: HashMap<String, HashSet<String>>,
}

impl Registry {
    /// Delivers a payload to every connection subscribed to `routing_key`.
    /// Non-blocking per connection: a full outbound buffer drops the
    /// message rather than stalling other connections.
    fn deliver(&self, routing_key: &str, payload: &str) {
        let Some(devices) = self.by_key.get(routing_key) else { return };
        for device_code in devices {
            if let Some(conn) = self.by_device.get(device_code) {
                if conn.tx.try_send(payload.to_owned()).is_err() {
                    tracing::warn!(
                        device_code = %redact(device_code),
                        routing_key,
                        "outbound buffer full, dropping message"
                    );
                }
            }
        }
    }
}

fn redact(device_code: &str) -> String {
    device_code.chars().take(8).collect()
}

/// A registered connection's handle to the hub, returned from
/// [`Hub::register`]. Dropping it does not unregister; callers must call
/// [`Hub::unregister`] explicitly on disconnect.
pub struct Registration {
    pub conn_id: Uuid,
    pub inbox: mpsc::Receiver<String>,
}

pub struct Hub {
    kv: Kv,
    registry: Arc<RwLock<Registry>>,
    cmd_tx: mpsc::Sender<pubsub::PubSubCommand>,
}

impl Hub {
    pub fn new(kv: Kv, redis_url: String, cancel: CancellationToken) -> Self {
        let registry = Arc::new(RwLock::new(Registry::default()));
        let cmd_tx = pubsub::spawn(redis_url, Arc::clone(&registry), cancel);
        Self { kv, registry, cmd_tx }
    }

    /// Routing key for a configured section.
    pub fn section_key(section_id: i64) -> String {
        format!("section:{section_id}")
    }

    /// Routing key for a sentinel ad-hoc section, scoped by user to avoid
    /// cross-user leakage.
    pub fn adhoc_key(osm_user_id: i64) -> String {
        format!("adhoc:{osm_user_id}")
    }

    fn device_key(device_code: &str) -> String {
        format!("device:{device_code}")
    }

    /// Registers a new device connection. Synchronous: blocks until the
    /// external pub/sub backend confirms subscription to every routing key
    /// gaining its first subscriber. On subscribe failure the registration
    /// is rolled back and the connection must be rejected. A reconnection
    /// of an already-connected device code displaces and closes the prior
    /// connection.
    pub async fn register(
        &self,
        device_code: String,
        section_routing_key: String,
    ) -> Result<Registration, AppError> {
        let routing_keys = vec![section_routing_key, Self::device_key(&device_code)];
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let conn_id = Uuid::new_v4();

        let (displaced, newly_needed) = {
            let mut guard = self.registry.write().await;

            let displaced = guard.by_device.remove(&device_code);
            if let Some(ref old) = displaced {
                for key in &old.routing_keys {
                    if let Some(set) = guard.by_key.get_mut(key) {
                        set.remove(&device_code);
                    }
                }
            }

            let mut newly_needed = Vec::new();
            for key in &routing_keys {
                let set = guard.by_key.entry(key.clone()).or_default();
                if set.is_empty() {
                    newly_needed.push(key.clone());
                }
                set.insert(device_code.clone());
            }

            guard.by_device.insert(
                device_code.clone(),
                Conn { id: conn_id, tx: tx.clone(), routing_keys: routing_keys.clone() },
            );

            (displaced, newly_needed)
        };

        if !newly_needed.is_empty() {
            let channels = newly_needed.iter().map(|k| pubsub::channel_for_key(k)).collect();
            let (ack_tx, ack_rx) = oneshot::channel();
            let sent = self.cmd_tx.send(pubsub::PubSubCommand::Subscribe { channels, ack: ack_tx }).await;
            let subscribed = match sent {
                Ok(()) => ack_rx.await.unwrap_or_else(|_| {
                    Err(AppError::Internal("pub/sub actor dropped ack channel".into()))
                }),
                Err(_) => Err(AppError::Internal("pub/sub actor unavailable".into())),
            };

            if let Err(e) = subscribed {
                self.rollback_register(&device_code, &routing_keys, conn_id).await;
                return Err(e);
            }
        }

        if let Some(old) = displaced {
            let _ = old.tx.try_send(disconnect_payload("replaced by new connection"));
        }

        Ok(Registration { conn_id, inbox: rx })
    }

    async fn rollback_register(&self, device_code: &str, routing_keys: &[String], conn_id: Uuid) {
        let mut guard = self.registry.write().await;
        if guard.by_device.get(device_code).map(|c| c.id) == Some(conn_id) {
            guard.by_device.remove(device_code);
        }
        for key in routing_keys {
            if let Some(set) = guard.by_key.get_mut(key) {
                set.remove(device_code);
            }
        }
    }

    /// Removes the registry entry only if it still points to `conn_id`
    /// (prevents a stale reader from unregistering a replacement
    /// connection). Requests unsubscription for any routing key left with
    /// no subscribers; unsubscribe is best-effort.
    pub async fn unregister(&self, device_code: &str, conn_id: Uuid) {
        let orphaned = {
            let mut guard = self.registry.write().await;
            let Some(conn) = guard.by_device.get(device_code) else { return };
            if conn.id != conn_id {
                return;
            }
            let routing_keys = guard.by_device.remove(device_code).map(|c| c.routing_keys).unwrap_or_default();
            let mut orphaned = Vec::new();
            for key in routing_keys {
                if let Some(set) = guard.by_key.get_mut(&key) {
                    set.remove(device_code);
                    if set.is_empty() {
                        guard.by_key.remove(&key);
                        orphaned.push(key);
                    }
                }
            }
            orphaned
        };

        if !orphaned.is_empty() {
            let channels = orphaned.iter().map(|k| pubsub::channel_for_key(k)).collect();
            let _ = self.cmd_tx.send(pubsub::PubSubCommand::Unsubscribe { channels }).await;
        }
    }

    pub async fn publish_section_refresh(&self, section_id: i64) {
        self.publish_routing_key(&Self::section_key(section_id), REFRESH_SCORES_PAYLOAD).await;
    }

    pub async fn publish_adhoc_refresh(&self, osm_user_id: i64) {
        self.publish_routing_key(&Self::adhoc_key(osm_user_id), REFRESH_SCORES_PAYLOAD).await;
    }

    async fn publish_routing_key(&self, routing_key: &str, payload: &str) {
        let channel = pubsub::channel_for_key(routing_key);
        if let Err(e) = self.kv.publish(&channel, payload).await {
            tracing::warn!(err = %e, channel, "hub publish failed");
        }
    }
}

const REFRESH_SCORES_PAYLOAD: &str = r#"{"type":"refresh-scores"}"#;

pub fn disconnect_payload(reason: &str) -> String {
    serde_json::json!({"type": "disconnect", "reason": reason}).to_string()
}

pub fn reconnect_payload() -> String {
    r#"{"type":"reconnect"}"#.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_formats_match_spec() {
        assert_eq!(Hub::section_key(42), "section:42");
        assert_eq!(Hub::adhoc_key(7), "adhoc:7");
        assert_eq!(Hub::device_key("abc123"), "device:abc123");
    }

    #[test]
    fn disconnect_payload_carries_reason() {
        let payload = disconnect_payload("replaced by new connection");
        assert!(payload.contains("\"type\":\"disconnect\""));
        assert!(payload.contains("replaced by new connection"));
    }

    #[test]
    fn redact_keeps_only_first_eight_chars() {
        assert_eq!(redact("0123456789abcdef"), "01234567");
    }
}
