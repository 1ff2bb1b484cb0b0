//! SQLite persistence for users, sessions and the chat-key handshake.

use crate::error::BrokerError;
use garde::Validate;
use rand::RngCore;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

const SESSION_TOKEN_BYTES: usize = 32;
const MAX_USERNAME_LENGTH: usize = 32;
const MAX_NAME_LENGTH: usize = 64;
const MAX_PUBLIC_KEY_LENGTH: usize = 4096;
const MAX_WRAPPED_KEY_LENGTH: usize = 16384;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        public_key TEXT NOT NULL,
        wrapped_private_key TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions (
        token TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        expires_at INTEGER NOT NULL
    );

    -- One request per unordered pair of users
    CREATE TABLE IF NOT EXISTS chat_requests (
        id TEXT PRIMARY KEY,
        sender_id TEXT NOT NULL REFERENCES users(id),
        recipient_id TEXT NOT NULL REFERENCES users(id),
        status TEXT CHECK(status IN ('PENDING', 'APPROVED')) NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS chats (
        id TEXT PRIMARY KEY,
        created_at INTEGER NOT NULL
    );

    -- Each participant holds their own wrapped copy of the chat key
    CREATE TABLE IF NOT EXISTS chat_participants (
        chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES users(id),
        encrypted_key TEXT NOT NULL,
        PRIMARY KEY (chat_id, user_id)
    );

    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES users(id),
        content TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        read INTEGER NOT NULL DEFAULT 0
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_chat_requests_pair
        ON chat_requests(MIN(sender_id, recipient_id), MAX(sender_id, recipient_id));
    CREATE INDEX IF NOT EXISTS idx_chat_participants_user ON chat_participants(user_id);
    CREATE INDEX IF NOT EXISTS idx_events_chat_timestamp ON events(chat_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
";

/// The authenticated user behind a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: String,
    pub username: String,
    pub name: String,
}

/// Resolves a session token to the identity it authenticates.
pub trait SessionValidator: Send + Sync {
    /// `None` for missing, unknown or expired tokens.
    fn validate(&self, token: &str) -> Option<Identity>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub name: String,
    pub public_key: String,
    pub wrapped_private_key: String,
}

impl User {
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id.clone(),
            username: self.username.clone(),
            name: self.name.clone(),
        }
    }
}

fn validate_username(value: &str, _ctx: &()) -> garde::Result {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        Ok(())
    } else {
        Err(garde::Error::new("Invalid username"))
    }
}

/// Registration payload for a new user.
#[derive(Debug, Clone, Deserialize, Validate)]
#[garde(context(()))]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    #[garde(length(min = 3, max = MAX_USERNAME_LENGTH), custom(validate_username))]
    pub username: String,
    #[garde(length(min = 1, max = MAX_NAME_LENGTH))]
    pub name: String,
    #[garde(length(min = 1, max = MAX_PUBLIC_KEY_LENGTH))]
    pub public_key: String,
    #[garde(length(min = 1, max = MAX_WRAPPED_KEY_LENGTH))]
    pub wrapped_private_key: String,
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        // WAL lets several connections (and processes) share the file
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        let store = Self::init(conn)?;
        info!(path = %path.as_ref().display(), "Database opened");
        Ok(store)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> rusqlite::Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_user(&self, input: &NewUser) -> Result<User, BrokerError> {
        input.validate()?;

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: input.username.clone(),
            name: input.name.clone(),
            public_key: input.public_key.clone(),
            wrapped_private_key: input.wrapped_private_key.clone(),
        };

        let result = self.conn().execute(
            "INSERT INTO users (id, username, name, public_key, wrapped_private_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.id,
                user.username,
                user.name,
                user.public_key,
                user.wrapped_private_key,
                now_millis()
            ],
        );

        match result {
            Ok(_) => {
                info!(user_id = %user.id, username = %user.username, "User created");
                Ok(user)
            }
            Err(e) if is_constraint_violation(&e) => {
                Err(BrokerError::StateConflict("Username already taken"))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn user_by_username(&self, username: &str) -> Result<Option<User>, BrokerError> {
        self.find_user("username", username)
    }

    pub fn user(&self, id: &str) -> Result<Option<User>, BrokerError> {
        self.find_user("id", id)
    }

    fn find_user(&self, column: &str, value: &str) -> Result<Option<User>, BrokerError> {
        let sql = format!(
            "SELECT id, username, name, public_key, wrapped_private_key FROM users WHERE {} = ?1",
            column
        );
        let user = self
            .conn()
            .query_row(&sql, [value], |row| {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    name: row.get(2)?,
                    public_key: row.get(3)?,
                    wrapped_private_key: row.get(4)?,
                })
            })
            .optional()?;
        Ok(user)
    }

    /// Issue a session token for `user_id`, valid for `ttl`.
    pub fn create_session(&self, user_id: &str, ttl: Duration) -> Result<String, BrokerError> {
        let mut bytes = [0u8; SESSION_TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now_millis().saturating_add(ttl_millis);

        let result = self.conn().execute(
            "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
            params![token, user_id, expires_at],
        );
        match result {
            Ok(_) => {
                info!(%user_id, "Session created");
                Ok(token)
            }
            Err(e) if is_constraint_violation(&e) => Err(BrokerError::NotFound("User")),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns false if the token did not exist.
    pub fn revoke_session(&self, token: &str) -> Result<bool, BrokerError> {
        let removed = self
            .conn()
            .execute("DELETE FROM sessions WHERE token = ?1", [token])?;
        Ok(removed > 0)
    }

    /// Drop expired sessions. Returns how many were removed.
    pub fn purge_expired_sessions(&self) -> Result<usize, BrokerError> {
        let removed = self
            .conn()
            .execute("DELETE FROM sessions WHERE expires_at <= ?1", [now_millis()])?;
        Ok(removed)
    }
}

impl SessionValidator for Store {
    fn validate(&self, token: &str) -> Option<Identity> {
        if token.is_empty() {
            return None;
        }

        let result = self
            .conn()
            .query_row(
                "SELECT u.id, u.username, u.name
                 FROM sessions s JOIN users u ON u.id = s.user_id
                 WHERE s.token = ?1 AND s.expires_at > ?2",
                params![token, now_millis()],
                |row| {
                    Ok(Identity {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional();

        match result {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "Session lookup failed");
                None
            }
        }
    }
}
