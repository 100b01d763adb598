use std::collections::HashMap;
use std::sync::RwLock;

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use uuid::Uuid;

/// State the hub keeps per daemon connection.
#[derive(Debug)]
struct DaemonConn {
    tx: mpsc::Sender<Message>,
    /// Set once a `register` frame has been matched to an environment.
    env_id: Option<String>,
}

/// Registry of live daemon connections.
///
/// Invariant: at most one connection is authoritative for an environment
/// id. A re-registration removes the previous connection from the registry
/// before recording the new one, so the old socket's eventual close does
/// not disturb the replacement.
#[derive(Debug, Default)]
pub struct DaemonHub {
    conns: RwLock<HashMap<Uuid, DaemonConn>>,
    by_env: RwLock<HashMap<String, Uuid>>,
}

impl DaemonHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly upgraded socket; no environment assigned yet.
    pub fn register(&self, tx: mpsc::Sender<Message>) -> Uuid {
        let conn_id = Uuid::new_v4();
        let mut conns = self.conns.write().unwrap_or_else(|e| e.into_inner());
        conns.insert(conn_id, DaemonConn { tx, env_id: None });
        conn_id
    }

    /// Record `conn_id` as the authoritative connection for `env_id`.
    ///
    /// Returns the sender of the connection it displaced, if any, so the
    /// caller can enqueue an orderly close on it.
    pub fn claim_env(&self, conn_id: Uuid, env_id: &str) -> Option<mpsc::Sender<Message>> {
        let mut conns = self.conns.write().unwrap_or_else(|e| e.into_inner());
        let mut by_env = self.by_env.write().unwrap_or_else(|e| e.into_inner());

        if let Some(conn) = conns.get_mut(&conn_id) {
            conn.env_id = Some(env_id.to_string());
        }

        let previous = by_env.insert(env_id.to_string(), conn_id);
        match previous {
            Some(old_id) if old_id != conn_id => conns.remove(&old_id).map(|old| old.tx),
            _ => None,
        }
    }

    /// The environment this connection registered for, if any.
    #[must_use]
    pub fn env_of(&self, conn_id: Uuid) -> Option<String> {
        let conns = self.conns.read().unwrap_or_else(|e| e.into_inner());
        conns.get(&conn_id).and_then(|conn| conn.env_id.clone())
    }

    /// Remove a connection on socket close.
    ///
    /// Returns the environment id this connection was authoritative for,
    /// or `None` when the connection never registered or was already
    /// displaced by a newer registration.
    pub fn unregister(&self, conn_id: Uuid) -> Option<String> {
        let mut conns = self.conns.write().unwrap_or_else(|e| e.into_inner());
        let mut by_env = self.by_env.write().unwrap_or_else(|e| e.into_inner());

        let conn = conns.remove(&conn_id)?;
        let env_id = conn.env_id?;
        if by_env.get(&env_id) == Some(&conn_id) {
            by_env.remove(&env_id);
            return Some(env_id);
        }
        None
    }

    /// Detach and return the authoritative sender for an environment, if
    /// connected (used when an environment is deleted).
    pub fn take_env(&self, env_id: &str) -> Option<mpsc::Sender<Message>> {
        let mut conns = self.conns.write().unwrap_or_else(|e| e.into_inner());
        let mut by_env = self.by_env.write().unwrap_or_else(|e| e.into_inner());
        let conn_id = by_env.remove(env_id)?;
        conns.remove(&conn_id).map(|conn| conn.tx)
    }

    #[must_use]
    pub fn is_connected(&self, env_id: &str) -> bool {
        let by_env = self.by_env.read().unwrap_or_else(|e| e.into_inner());
        by_env.contains_key(env_id)
    }

    /// Enqueue a frame for the environment's daemon.
    ///
    /// Returns false when no daemon is connected or its outbound queue is
    /// unusable; the HTTP layer uses that to roll back and surface a 5xx.
    pub fn try_send_to_env(&self, env_id: &str, message: Message) -> bool {
        let tx = {
            let conns = self.conns.read().unwrap_or_else(|e| e.into_inner());
            let by_env = self.by_env.read().unwrap_or_else(|e| e.into_inner());
            let Some(conn_id) = by_env.get(env_id) else {
                return false;
            };
            let Some(conn) = conns.get(conn_id) else {
                return false;
            };
            conn.tx.clone()
        };
        tx.try_send(message).is_ok()
    }
}
