use crate::broker::{ApprovedChat, Broker, FinishApproval};
use crate::error::BrokerError;
use crate::messages::{EventData, EventPayload, ServerFrame};
use crate::store::{Identity, SessionValidator, Store};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Identifies one live connection; a user may hold several.
pub type ConnectionId = Uuid;

struct ClientEntry {
    id: ConnectionId,
    identity: Identity,
    tx: mpsc::UnboundedSender<String>,
}

/// Live authenticated connections, keyed by user id.
#[derive(Default)]
pub struct Registry {
    clients: DashMap<String, Vec<ClientEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `identity`.
    pub fn add_client(&self, identity: Identity, tx: mpsc::UnboundedSender<String>) -> ConnectionId {
        let id = Uuid::new_v4();
        self.clients
            .entry(identity.id.clone())
            .or_default()
            .push(ClientEntry { id, identity, tx });
        id
    }

    /// Remove one connection. Returns false if it was not registered.
    pub fn remove_client(&self, user_id: &str, connection_id: ConnectionId) -> bool {
        let Some(mut entry) = self.clients.get_mut(user_id) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|client| client.id != connection_id);
        let removed = entry.len() != before;
        if entry.is_empty() {
            drop(entry);
            self.clients.remove_if(user_id, |_, clients| clients.is_empty());
        }
        removed
    }

    /// Deliver `message` to every connection whose identity matches.
    /// Returns the number of connections it was handed to.
    pub fn relay(&self, predicate: impl Fn(&Identity) -> bool, message: &str) -> usize {
        let mut sent = 0;
        for entry in self.clients.iter() {
            for client in entry.value() {
                if predicate(&client.identity) && client.tx.send(message.to_string()).is_ok() {
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Send to all connections of one user. Offline users are skipped.
    pub fn send_to_user(&self, user_id: &str, message: &str) -> usize {
        let Some(clients) = self.clients.get(user_id) else {
            return 0;
        };
        clients
            .iter()
            .filter(|client| client.tx.send(message.to_string()).is_ok())
            .count()
    }

    pub fn relay_to_users(&self, user_ids: &[String], message: &str) -> usize {
        user_ids
            .iter()
            .map(|user_id| self.send_to_user(user_id, message))
            .sum()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.connection_count(user_id) > 0
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.clients.get(user_id).map(|c| c.len()).unwrap_or(0)
    }

    pub fn online_users(&self) -> Vec<String> {
        self.clients
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect()
    }
}

/// Everything a connection handler needs: who is online, the broker and
/// the session check.
pub struct ServerState {
    pub registry: Registry,
    pub broker: Broker,
    sessions: Arc<dyn SessionValidator>,
}

impl ServerState {
    pub fn new(broker: Broker, sessions: Arc<dyn SessionValidator>) -> Self {
        Self {
            registry: Registry::new(),
            broker,
            sessions,
        }
    }

    /// Broker and sessions backed by the same store.
    pub fn with_store(store: Arc<Store>) -> Self {
        Self::new(Broker::new(store.clone()), store)
    }

    pub fn validate_session(&self, token: &str) -> Option<Identity> {
        self.sessions.validate(token)
    }

    /// Serialize once and send to every connection of `user_id`.
    pub fn send_frame_to_user(&self, user_id: &str, frame: &ServerFrame) -> usize {
        match frame.to_json() {
            Ok(json) => self.registry.send_to_user(user_id, &json),
            Err(e) => {
                error!(error = %e, "Failed to serialize frame");
                0
            }
        }
    }

    /// Finish a handshake approval and tell the requester to reload.
    pub fn approve_chat_request(
        &self,
        recipient_id: &str,
        input: &FinishApproval,
    ) -> Result<ApprovedChat, BrokerError> {
        let approved = self.broker.finish_approval(recipient_id, input)?;
        let delivered = self.send_frame_to_user(&approved.sender_id, &ServerFrame::OverviewReload);
        debug!(sender_id = %approved.sender_id, delivered, "Relayed overview-reload");
        Ok(approved)
    }

    /// Persist a chat event from `from` and relay it to the chat's participants.
    /// Returns the number of connections reached.
    pub fn post_event(&self, from: &Identity, data: &EventData) -> Result<usize, BrokerError> {
        let posted = self.broker.post_event(&from.id, &data.chat, &data.content)?;

        let frame = ServerFrame::Event(EventPayload {
            id: posted.event.id,
            timestamp: posted.event.timestamp,
            from: posted.event.from,
            chat: posted.event.chat_id,
            content: posted.event.content,
        });
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize event");
                return Ok(0);
            }
        };

        let delivered = self.registry.relay_to_users(&posted.participants, &json);
        info!(chat = %data.chat, from = %from.id, delivered, "Relayed chat event");
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> Identity {
        Identity {
            id: id.to_string(),
            username: format!("{}-name", id),
            name: id.to_uppercase(),
        }
    }

    #[test]
    fn test_add_and_remove_client() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let conn_id = registry.add_client(identity("user1"), tx);
        assert!(registry.is_online("user1"));
        assert_eq!(registry.online_users(), vec!["user1".to_string()]);

        assert!(registry.remove_client("user1", conn_id));
        assert!(!registry.remove_client("user1", conn_id));
        assert!(!registry.is_online("user1"));
        assert!(registry.online_users().is_empty());
    }

    #[test]
    fn test_multiple_connections_per_user() {
        let registry = Registry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let first = registry.add_client(identity("user1"), tx1);
        registry.add_client(identity("user1"), tx2);
        assert_eq!(registry.connection_count("user1"), 2);

        assert_eq!(registry.send_to_user("user1", "hello"), 2);
        assert_eq!(rx1.try_recv().unwrap(), "hello");
        assert_eq!(rx2.try_recv().unwrap(), "hello");

        // Removing one connection leaves the other registered
        registry.remove_client("user1", first);
        assert_eq!(registry.connection_count("user1"), 1);
        assert_eq!(registry.send_to_user("user1", "again"), 1);
        assert_eq!(rx2.try_recv().unwrap(), "again");
    }

    #[test]
    fn test_send_to_offline_user_is_dropped() {
        let registry = Registry::new();
        assert_eq!(registry.send_to_user("nobody", "hello"), 0);
    }

    #[test]
    fn test_relay_by_predicate() {
        let registry = Registry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        registry.add_client(identity("user1"), tx1);
        registry.add_client(identity("user2"), tx2);
        registry.add_client(identity("user3"), tx3);

        let sent = registry.relay(|who| who.id != "user2", "ping");
        assert_eq!(sent, 2);
        assert_eq!(rx1.try_recv().unwrap(), "ping");
        assert!(rx2.try_recv().is_err());
        assert_eq!(rx3.try_recv().unwrap(), "ping");

        let sent = registry.relay_to_users(&["user2".to_string(), "user4".to_string()], "direct");
        assert_eq!(sent, 1);
        assert_eq!(rx2.try_recv().unwrap(), "direct");
    }

    #[test]
    fn test_closed_receiver_not_counted() {
        let registry = Registry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.add_client(identity("user1"), tx);
        drop(rx);
        assert_eq!(registry.send_to_user("user1", "hello"), 0);
    }
}
