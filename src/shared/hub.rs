use log::debug;
use std::collections::HashMap;
use tokio::sync::{broadcast, Mutex};

const GROUP_BUFFER: usize = 64;

/// Named broadcast groups backing the WebSocket hubs. Delivery is
/// at-most-once: lagged or disconnected receivers drop frames and clients
/// resynchronize through the REST snapshot endpoints.
pub struct HubRegistry {
    groups: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, group: &str) -> broadcast::Receiver<String> {
        let mut groups = self.groups.lock().await;
        groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(GROUP_BUFFER).0)
            .subscribe()
    }

    /// Publishes a frame to a group. A group nobody joined is not an error.
    pub async fn publish(&self, group: &str, frame: &serde_json::Value) {
        let mut groups = self.groups.lock().await;
        if let Some(tx) = groups.get(group) {
            if tx.send(frame.to_string()).is_err() {
                debug!("hub group {} has no receivers, dropping", group);
                groups.remove(group);
            }
        }
    }

    pub async fn group_count(&self) -> usize {
        self.groups.lock().await.len()
    }
}

impl Default for HubRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn conversation_group(id: uuid::Uuid) -> String {
    format!("conversation:{}", id)
}

pub fn agent_group(id: uuid::Uuid) -> String {
    format!("agent:{}", id)
}

pub fn user_group(id: uuid::Uuid) -> String {
    format!("user:{}", id)
}

pub fn queue_group(tenant_id: uuid::Uuid) -> String {
    format!("queue:{}", tenant_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_frames() {
        let hub = HubRegistry::new();
        let mut rx = hub.subscribe("conversation:abc").await;
        hub.publish("conversation:abc", &serde_json::json!({"type": "ping"}))
            .await;
        let frame = rx.recv().await.expect("frame");
        assert!(frame.contains("ping"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let hub = HubRegistry::new();
        hub.publish("nobody:here", &serde_json::json!({"type": "ping"}))
            .await;
        assert_eq!(hub.group_count().await, 0);
    }

    #[tokio::test]
    async fn dead_group_is_pruned() {
        let hub = HubRegistry::new();
        let rx = hub.subscribe("agent:1").await;
        drop(rx);
        hub.publish("agent:1", &serde_json::json!({"type": "x"})).await;
        assert_eq!(hub.group_count().await, 0);
    }
}
