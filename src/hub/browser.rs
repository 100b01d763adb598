use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::protocol::BrowserEvent;

/// Registry of browser connections and their per-process subscriptions.
///
/// Fan-out never blocks: frames are enqueued with `try_send` and a browser
/// whose queue is full is evicted so it cannot delay the daemon reader.
#[derive(Debug, Default)]
pub struct BrowserHub {
    conns: RwLock<HashMap<Uuid, mpsc::Sender<Message>>>,
    /// process id -> subscribed connections
    subscribers: RwLock<HashMap<String, HashSet<Uuid>>>,
    /// connection -> attached process ids (reverse map for cleanup)
    attachments: RwLock<HashMap<Uuid, HashSet<String>>>,
}

impl BrowserHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tx: mpsc::Sender<Message>) -> Uuid {
        let conn_id = Uuid::new_v4();
        let mut conns = self.conns.write().unwrap_or_else(|e| e.into_inner());
        conns.insert(conn_id, tx);
        conn_id
    }

    /// Remove a connection from the registry and from every reverse map.
    pub fn unregister(&self, conn_id: Uuid) {
        {
            let mut conns = self.conns.write().unwrap_or_else(|e| e.into_inner());
            conns.remove(&conn_id);
        }
        let attached = {
            let mut attachments = self.attachments.write().unwrap_or_else(|e| e.into_inner());
            attachments.remove(&conn_id).unwrap_or_default()
        };
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        for process_id in attached {
            if let Some(set) = subscribers.get_mut(&process_id) {
                set.remove(&conn_id);
                if set.is_empty() {
                    subscribers.remove(&process_id);
                }
            }
        }
    }

    pub fn attach(&self, conn_id: Uuid, process_id: &str) {
        {
            let conns = self.conns.read().unwrap_or_else(|e| e.into_inner());
            if !conns.contains_key(&conn_id) {
                return;
            }
        }
        {
            let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
            subscribers
                .entry(process_id.to_string())
                .or_default()
                .insert(conn_id);
        }
        let mut attachments = self.attachments.write().unwrap_or_else(|e| e.into_inner());
        attachments
            .entry(conn_id)
            .or_default()
            .insert(process_id.to_string());
    }

    pub fn detach(&self, conn_id: Uuid, process_id: &str) {
        {
            let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
            if let Some(set) = subscribers.get_mut(process_id) {
                set.remove(&conn_id);
                if set.is_empty() {
                    subscribers.remove(process_id);
                }
            }
        }
        let mut attachments = self.attachments.write().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = attachments.get_mut(&conn_id) {
            set.remove(process_id);
        }
    }

    /// Clear every subscription for a deleted process.
    pub fn drop_process(&self, process_id: &str) {
        let subscribed = {
            let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
            subscribers.remove(process_id).unwrap_or_default()
        };
        let mut attachments = self.attachments.write().unwrap_or_else(|e| e.into_inner());
        for conn_id in subscribed {
            if let Some(set) = attachments.get_mut(&conn_id) {
                set.remove(process_id);
            }
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, process_id: &str) -> usize {
        let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        subscribers.get(process_id).map_or(0, HashSet::len)
    }

    /// Enqueue an event for a single connection. Returns false (and evicts
    /// the connection) when its queue is full or closed.
    pub fn send_to(&self, conn_id: Uuid, event: &BrowserEvent) -> bool {
        let Ok(payload) = serde_json::to_string(event) else {
            return false;
        };
        let tx = {
            let conns = self.conns.read().unwrap_or_else(|e| e.into_inner());
            conns.get(&conn_id).cloned()
        };
        let Some(tx) = tx else {
            return false;
        };
        if tx.try_send(Message::Text(payload.into())).is_err() {
            tracing::warn!(conn_id = %conn_id, "Browser outbound queue unusable, evicting");
            self.unregister(conn_id);
            return false;
        }
        true
    }

    /// Broadcast a state event to every connection.
    pub fn broadcast(&self, event: &BrowserEvent) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        let targets: Vec<(Uuid, mpsc::Sender<Message>)> = {
            let conns = self.conns.read().unwrap_or_else(|e| e.into_inner());
            conns.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };
        self.deliver(&targets, &payload);
    }

    /// Deliver an event to the subscribers of one process.
    pub fn send_to_subscribers(&self, process_id: &str, event: &BrowserEvent) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        // Snapshot the subscriber set; subscription changes during delivery
        // must not observe partial iteration.
        let targets: Vec<(Uuid, mpsc::Sender<Message>)> = {
            let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            let conns = self.conns.read().unwrap_or_else(|e| e.into_inner());
            subscribers
                .get(process_id)
                .map(|set| {
                    set.iter()
                        .filter_map(|id| conns.get(id).map(|tx| (*id, tx.clone())))
                        .collect()
                })
                .unwrap_or_default()
        };
        self.deliver(&targets, &payload);
    }

    fn deliver(&self, targets: &[(Uuid, mpsc::Sender<Message>)], payload: &str) {
        let mut evicted = Vec::new();
        for (conn_id, tx) in targets {
            if tx.try_send(Message::Text(payload.to_string().into())).is_err() {
                evicted.push(*conn_id);
            }
        }
        for conn_id in evicted {
            tracing::warn!(conn_id = %conn_id, "Browser cannot keep up with fan-out, evicting");
            self.unregister(conn_id);
        }
    }
}
