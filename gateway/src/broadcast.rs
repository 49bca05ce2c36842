//! Broadcast & Topic Router (spec §4.5, C9). Topics are opaque strings
//! (`game:<name>`); each subscribed socket owns a FIFO queue that a
//! periodic flush task drains in publish order. A socket not subscribed to
//! a topic never sees a message published to it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};

use protocol::messages::OutboundMessage;

struct SocketEntry {
    sender: mpsc::UnboundedSender<OutboundMessage>,
    queue: Mutex<VecDeque<OutboundMessage>>,
}

#[derive(Default)]
pub struct BroadcastManager {
    topics: RwLock<HashMap<String, HashSet<String>>>,
    socket_topics: RwLock<HashMap<String, HashSet<String>>>,
    sockets: RwLock<HashMap<String, Arc<SocketEntry>>>,
}

impl BroadcastManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a socket's delivery channel. Must be called once per
    /// connection before any `subscribe`/`publish_to_topic` touches it.
    pub async fn register_socket(&self, socket_id: &str) -> mpsc::UnboundedReceiver<OutboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets.write().await.insert(
            socket_id.to_string(),
            Arc::new(SocketEntry {
                sender: tx,
                queue: Mutex::new(VecDeque::new()),
            }),
        );
        rx
    }

    pub async fn subscribe(&self, socket_id: &str, topics: &[String]) {
        let mut topic_map = self.topics.write().await;
        let mut socket_map = self.socket_topics.write().await;
        let owned = socket_map.entry(socket_id.to_string()).or_default();
        for topic in topics {
            topic_map
                .entry(topic.clone())
                .or_default()
                .insert(socket_id.to_string());
            owned.insert(topic.clone());
        }
    }

    pub async fn unsubscribe_from_topic(&self, socket_id: &str, topic: &str) {
        let mut topic_map = self.topics.write().await;
        let mut socket_map = self.socket_topics.write().await;
        if let Some(subs) = topic_map.get_mut(topic) {
            subs.remove(socket_id);
            if subs.is_empty() {
                topic_map.remove(topic);
            }
        }
        if let Some(owned) = socket_map.get_mut(socket_id) {
            owned.remove(topic);
        }
    }

    /// Removes a socket from every subscription and its delivery channel
    /// (spec §8 invariant 4, §9 "destroy always flows session → broadcast").
    pub async fn unsubscribe_all(&self, socket_id: &str) {
        let topics: Vec<String> = self
            .socket_topics
            .write()
            .await
            .remove(socket_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        let mut topic_map = self.topics.write().await;
        for topic in topics {
            if let Some(subs) = topic_map.get_mut(&topic) {
                subs.remove(socket_id);
                if subs.is_empty() {
                    topic_map.remove(&topic);
                }
            }
        }
        self.sockets.write().await.remove(socket_id);
    }

    pub async fn get_subscriptions(&self, socket_id: &str) -> Vec<String> {
        self.socket_topics
            .read()
            .await
            .get(socket_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_subscribed(&self, socket_id: &str, topic: &str) -> bool {
        self.socket_topics
            .read()
            .await
            .get(socket_id)
            .map(|set| set.contains(topic))
            .unwrap_or(false)
    }

    /// Enqueues `msg` for every current subscriber of `topic`. Delivery
    /// happens on the next flush, preserving FIFO per `(topic, socket)`.
    pub async fn publish_to_topic(&self, topic: &str, msg: OutboundMessage) {
        let subscriber_ids: Vec<String> = {
            let topic_map = self.topics.read().await;
            match topic_map.get(topic) {
                Some(subs) => subs.iter().cloned().collect(),
                None => return,
            }
        };
        let sockets = self.sockets.read().await;
        for socket_id in subscriber_ids {
            if let Some(entry) = sockets.get(&socket_id) {
                entry.queue.lock().await.push_back(msg.clone());
            }
        }
    }

    /// Drains every socket's queue into its delivery channel. Sockets whose
    /// receiver has been dropped (closed connection) are reaped.
    pub async fn flush(&self) {
        let dead: Vec<String> = {
            let sockets = self.sockets.read().await;
            let mut dead = Vec::new();
            for (socket_id, entry) in sockets.iter() {
                let mut queue = entry.queue.lock().await;
                while let Some(msg) = queue.pop_front() {
                    if entry.sender.send(msg).is_err() {
                        dead.push(socket_id.clone());
                        break;
                    }
                }
            }
            dead
        };
        for socket_id in dead {
            self.unsubscribe_all(&socket_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_message_non_subscriber_does_not() {
        let manager = BroadcastManager::new();
        let mut rx_a = manager.register_socket("a").await;
        let _rx_b = manager.register_socket("b").await;
        manager.subscribe("a", &["game:roulette".to_string()]).await;

        manager
            .publish_to_topic("game:roulette", OutboundMessage::Pong)
            .await;
        manager.flush().await;

        let received = rx_a.try_recv();
        assert!(received.is_ok());
    }

    #[tokio::test]
    async fn unsubscribed_socket_never_receives_topic_messages() {
        let manager = BroadcastManager::new();
        let mut rx_b = manager.register_socket("b").await;
        manager
            .publish_to_topic("game:roulette", OutboundMessage::Pong)
            .await;
        manager.flush().await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_all_removes_every_topic_membership() {
        let manager = BroadcastManager::new();
        manager.register_socket("a").await;
        manager
            .subscribe("a", &["game:roulette".to_string(), "game:craps".to_string()])
            .await;
        manager.unsubscribe_all("a").await;
        assert!(manager.get_subscriptions("a").await.is_empty());
    }
}
