//! Server side of the chat-key handshake, plus the chat reads and writes
//! that go with it.
//!
//! The broker never sees a chat key: approval stores the two copies the
//! approver wrapped locally, one per participant.

use crate::error::BrokerError;
use crate::store::{is_constraint_violation, now_millis, Store};
use garde::Validate;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Events returned per page by [`Broker::get_events`].
pub const EVENT_PAGE_SIZE: usize = 20;

const MAX_USERNAME_LENGTH: usize = 32;
const MAX_ID_LENGTH: usize = 64;
const MAX_WRAPPED_KEY_LENGTH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Pending,
    Approved,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "APPROVED" => Some(Self::Approved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[garde(context(()))]
pub struct ChatRequestInput {
    #[garde(length(min = 1, max = MAX_USERNAME_LENGTH))]
    pub username: String,
}

/// The approver's submission: both wrapped copies of the new chat key.
#[derive(Debug, Clone, Deserialize, Validate)]
#[garde(context(()))]
#[serde(rename_all = "camelCase")]
pub struct FinishApproval {
    #[garde(length(min = 1, max = MAX_ID_LENGTH))]
    pub request_id: String,
    #[garde(length(min = 1, max = MAX_WRAPPED_KEY_LENGTH))]
    pub encrypted_recipient_key: String,
    #[garde(length(min = 1, max = MAX_WRAPPED_KEY_LENGTH))]
    pub encrypted_sender_key: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[garde(context(()))]
pub struct GetEvents {
    /// The other participant.
    #[garde(length(min = 1, max = MAX_USERNAME_LENGTH))]
    pub username: String,
    /// First load of the chat: also return the caller's wrapped chat key.
    #[garde(skip)]
    #[serde(default)]
    pub initial: bool,
    /// Only events strictly older than this timestamp (millis).
    #[garde(skip)]
    #[serde(default)]
    pub before: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub status: RequestStatus,
    pub created_at: i64,
}

/// What the approver needs to wrap the chat key for the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStart {
    pub request_id: String,
    pub sender_id: String,
    pub sender_username: String,
    /// The requester's public identity key.
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedChat {
    pub chat_id: String,
    pub sender_id: String,
    pub recipient_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    pub peer_id: String,
    pub peer_username: String,
    pub peer_name: String,
    /// Events from the peer not yet marked read.
    pub unread: i64,
    /// Latest event timestamp, or chat creation time.
    pub last_activity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub sender_name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub chats: Vec<ChatSummary>,
    pub chat_requests: Vec<PendingRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub id: String,
    pub chat_id: String,
    pub from: String,
    /// Sealed envelope; opaque to the server.
    pub content: String,
    pub timestamp: i64,
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub chat_id: String,
    /// Newest first.
    pub events: Vec<StoredEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<String>,
}

/// A persisted event and the users it must be relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedEvent {
    pub event: StoredEvent,
    pub participants: Vec<String>,
}

fn chat_between(conn: &Connection, a: &str, b: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT pa.chat_id
         FROM chat_participants pa
         JOIN chat_participants pb ON pb.chat_id = pa.chat_id
         WHERE pa.user_id = ?1 AND pb.user_id = ?2
         LIMIT 1",
        params![a, b],
        |row| row.get(0),
    )
    .optional()
}

fn request_between(conn: &Connection, a: &str, b: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(
             SELECT 1 FROM chat_requests
             WHERE (sender_id = ?1 AND recipient_id = ?2)
                OR (sender_id = ?2 AND recipient_id = ?1))",
        params![a, b],
        |row| row.get(0),
    )
}

#[derive(Clone)]
pub struct Broker {
    store: Arc<Store>,
}

impl Broker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Initiate: `sender` asks `input.username` for a chat.
    pub fn send_chat_request(
        &self,
        sender_id: &str,
        input: &ChatRequestInput,
    ) -> Result<ChatRequest, BrokerError> {
        input.validate()?;

        let recipient = self
            .store
            .user_by_username(&input.username)?
            .ok_or(BrokerError::NotFound("User"))?;

        if recipient.id == sender_id {
            warn!(%sender_id, "Rejected chat request to self");
            return Err(BrokerError::StateConflict("Cannot send a chat request to yourself"));
        }

        let conn = self.store.conn();
        if chat_between(&conn, sender_id, &recipient.id)?.is_some() {
            return Err(BrokerError::StateConflict("Chat already exists"));
        }
        if request_between(&conn, sender_id, &recipient.id)? {
            return Err(BrokerError::StateConflict("Chat request already exists"));
        }

        let request = ChatRequest {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            recipient_id: recipient.id,
            status: RequestStatus::Pending,
            created_at: now_millis(),
        };

        let result = conn.execute(
            "INSERT INTO chat_requests (id, sender_id, recipient_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request.id,
                request.sender_id,
                request.recipient_id,
                request.status.as_str(),
                request.created_at
            ],
        );
        match result {
            Ok(_) => {}
            // Lost a race with the other side's request
            Err(e) if is_constraint_violation(&e) => {
                return Err(BrokerError::StateConflict("Chat request already exists"));
            }
            Err(e) => return Err(e.into()),
        }

        info!(request_id = %request.id, %sender_id, recipient_id = %request.recipient_id, "Chat request created");
        Ok(request)
    }

    /// Approve, step one: return the requester's public key to the approver.
    pub fn start_approval(
        &self,
        recipient_id: &str,
        request_id: &str,
    ) -> Result<ApprovalStart, BrokerError> {
        let start = self
            .store
            .conn()
            .query_row(
                "SELECT r.id, u.id, u.username, u.public_key
                 FROM chat_requests r JOIN users u ON u.id = r.sender_id
                 WHERE r.id = ?1 AND r.recipient_id = ?2 AND r.status = 'PENDING'",
                params![request_id, recipient_id],
                |row| {
                    Ok(ApprovalStart {
                        request_id: row.get(0)?,
                        sender_id: row.get(1)?,
                        sender_username: row.get(2)?,
                        public_key: row.get(3)?,
                    })
                },
            )
            .optional()?;

        start.ok_or(BrokerError::NotFound("Request"))
    }

    /// Approve, step two: store both wrapped keys and create the chat.
    ///
    /// Runs as one immediate transaction; of several concurrent approvals of
    /// the same request exactly one succeeds.
    pub fn finish_approval(
        &self,
        recipient_id: &str,
        input: &FinishApproval,
    ) -> Result<ApprovedChat, BrokerError> {
        input.validate()?;

        let mut conn = self.store.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let request: Option<(String, String, String)> = tx
            .query_row(
                "SELECT sender_id, recipient_id, status FROM chat_requests WHERE id = ?1",
                [&input.request_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (sender_id, request_recipient, status) = match request {
            Some(request) if request.1 == recipient_id => request,
            _ => return Err(BrokerError::NotFound("Request")),
        };
        if RequestStatus::parse(&status) != Some(RequestStatus::Pending) {
            return Err(BrokerError::StateConflict("Request already answered"));
        }
        if chat_between(&tx, &sender_id, &request_recipient)?.is_some() {
            return Err(BrokerError::StateConflict("Chat already exists"));
        }

        let updated = tx.execute(
            "UPDATE chat_requests SET status = 'APPROVED' WHERE id = ?1 AND status = 'PENDING'",
            [&input.request_id],
        )?;
        if updated != 1 {
            return Err(BrokerError::StateConflict("Request already answered"));
        }

        let chat_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO chats (id, created_at) VALUES (?1, ?2)",
            params![chat_id, now_millis()],
        )?;
        tx.execute(
            "INSERT INTO chat_participants (chat_id, user_id, encrypted_key) VALUES (?1, ?2, ?3)",
            params![chat_id, sender_id, input.encrypted_sender_key],
        )?;
        tx.execute(
            "INSERT INTO chat_participants (chat_id, user_id, encrypted_key) VALUES (?1, ?2, ?3)",
            params![chat_id, request_recipient, input.encrypted_recipient_key],
        )?;
        tx.commit()?;

        info!(%chat_id, %sender_id, recipient_id = %request_recipient, "Chat request approved");
        Ok(ApprovedChat {
            chat_id,
            sender_id,
            recipient_id: request_recipient,
        })
    }

    /// The caller's wrapped copy of a chat key.
    pub fn chat_key_for(&self, user_id: &str, chat_id: &str) -> Result<String, BrokerError> {
        self.store
            .conn()
            .query_row(
                "SELECT encrypted_key FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(BrokerError::NotFound("Chat"))
    }

    /// Chats of the user, most recently active first, and the pending
    /// requests addressed to them.
    pub fn overview(&self, user_id: &str) -> Result<Overview, BrokerError> {
        let conn = self.store.conn();

        let mut stmt = conn.prepare(
            "SELECT c.id, u.id, u.username, u.name,
                    (SELECT COUNT(*) FROM events e
                     WHERE e.chat_id = c.id AND e.user_id != ?1 AND e.read = 0),
                    COALESCE((SELECT MAX(e.timestamp) FROM events e WHERE e.chat_id = c.id),
                             c.created_at) AS last_activity
             FROM chats c
             JOIN chat_participants me ON me.chat_id = c.id AND me.user_id = ?1
             JOIN chat_participants peer ON peer.chat_id = c.id AND peer.user_id != ?1
             JOIN users u ON u.id = peer.user_id
             ORDER BY last_activity DESC",
        )?;
        let chats = stmt
            .query_map([user_id], |row| {
                Ok(ChatSummary {
                    id: row.get(0)?,
                    peer_id: row.get(1)?,
                    peer_username: row.get(2)?,
                    peer_name: row.get(3)?,
                    unread: row.get(4)?,
                    last_activity: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT r.id, u.id, u.username, u.name, r.created_at
             FROM chat_requests r JOIN users u ON u.id = r.sender_id
             WHERE r.recipient_id = ?1 AND r.status = 'PENDING'
             ORDER BY r.created_at DESC",
        )?;
        let chat_requests = stmt
            .query_map([user_id], |row| {
                Ok(PendingRequest {
                    id: row.get(0)?,
                    sender_id: row.get(1)?,
                    sender_username: row.get(2)?,
                    sender_name: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Overview {
            chats,
            chat_requests,
        })
    }

    /// A page of events of the chat with `input.username`, newest first.
    pub fn get_events(&self, user_id: &str, input: &GetEvents) -> Result<EventPage, BrokerError> {
        input.validate()?;

        let peer = self
            .store
            .user_by_username(&input.username)?
            .ok_or(BrokerError::NotFound("Chat"))?;

        let conn = self.store.conn();
        let chat_id = chat_between(&conn, user_id, &peer.id)?.ok_or(BrokerError::NotFound("Chat"))?;

        let encrypted_key = if input.initial {
            let key: String = conn.query_row(
                "SELECT encrypted_key FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
                |row| row.get(0),
            )?;
            Some(key)
        } else {
            None
        };

        let before = match (input.initial, input.before) {
            (false, Some(before)) => before,
            _ => i64::MAX,
        };

        let mut stmt = conn.prepare(
            "SELECT id, chat_id, user_id, content, timestamp, read
             FROM events
             WHERE chat_id = ?1 AND timestamp < ?2
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?3",
        )?;
        let events = stmt
            .query_map(params![chat_id, before, EVENT_PAGE_SIZE as i64], |row| {
                Ok(StoredEvent {
                    id: row.get(0)?,
                    chat_id: row.get(1)?,
                    from: row.get(2)?,
                    content: row.get(3)?,
                    timestamp: row.get(4)?,
                    read: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(EventPage {
            chat_id,
            events,
            encrypted_key,
        })
    }

    /// Persist an event from a participant of `chat_id`.
    pub fn post_event(
        &self,
        user_id: &str,
        chat_id: &str,
        content: &str,
    ) -> Result<PostedEvent, BrokerError> {
        let conn = self.store.conn();

        let mut stmt = conn.prepare("SELECT user_id FROM chat_participants WHERE chat_id = ?1")?;
        let participants = stmt
            .query_map([chat_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        if !participants.iter().any(|p| p == user_id) {
            warn!(%user_id, %chat_id, "Event for a chat the user is not part of");
            return Err(BrokerError::NotFound("Chat"));
        }

        let event = StoredEvent {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            from: user_id.to_string(),
            content: content.to_string(),
            timestamp: now_millis(),
            read: false,
        };
        conn.execute(
            "INSERT INTO events (id, chat_id, user_id, content, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![event.id, event.chat_id, event.from, event.content, event.timestamp],
        )?;

        Ok(PostedEvent {
            event,
            participants,
        })
    }

    /// Mark the peer's events in `chat_id` as read. Returns how many changed.
    pub fn mark_read(&self, user_id: &str, chat_id: &str) -> Result<usize, BrokerError> {
        let conn = self.store.conn();
        let is_participant: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2)",
            params![chat_id, user_id],
            |row| row.get(0),
        )?;
        if !is_participant {
            return Err(BrokerError::NotFound("Chat"));
        }

        let changed = conn.execute(
            "UPDATE events SET read = 1 WHERE chat_id = ?1 AND user_id != ?2 AND read = 0",
            params![chat_id, user_id],
        )?;
        Ok(changed)
    }
}
