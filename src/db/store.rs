use async_trait::async_trait;
use diesel::prelude::*;

use crate::db::pool::DbPool;
use crate::db::schema::{notifications, sessions, users};
use crate::error::ApiError;

/// A user row as returned by the session-token lookup.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct UserRecord {
    pub id: String,
    pub name: Option<String>,
    pub role: Option<String>,
}

/// The two read operations the gateway needs from the relational store.
///
/// Backed by Postgres in production and an in-memory map in tests.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up the user owning a session by the hashed session token.
    async fn user_by_token(&self, token_hash: &str) -> Result<Option<UserRecord>, ApiError>;

    /// Count unread notifications addressed to a user.
    async fn unread_count(&self, user_id: &str) -> Result<i64, ApiError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn user_by_token(&self, token_hash: &str) -> Result<Option<UserRecord>, ApiError> {
        let mut conn = self.pool.get().await?;

        let user = diesel_async::RunQueryDsl::first(
            sessions::table
                .inner_join(users::table)
                .filter(sessions::token.eq(token_hash))
                .select(UserRecord::as_select()),
            &mut conn,
        )
        .await
        .optional()?;

        Ok(user)
    }

    async fn unread_count(&self, user_id: &str) -> Result<i64, ApiError> {
        let mut conn = self.pool.get().await?;

        let count = diesel_async::RunQueryDsl::get_result::<i64>(
            notifications::table
                .filter(notifications::recipient_id.eq(user_id))
                .filter(notifications::read_at.is_null())
                .count(),
            &mut conn,
        )
        .await?;

        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (for tests)
// ---------------------------------------------------------------------------

pub struct MemoryStore {
    users: parking_lot::Mutex<std::collections::HashMap<String, UserRecord>>,
    counts: parking_lot::Mutex<std::collections::HashMap<String, i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            users: parking_lot::Mutex::new(std::collections::HashMap::new()),
            counts: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Seed a user reachable via the given (already hashed) session token.
    pub fn insert_user(&self, token_hash: &str, user: UserRecord) {
        self.users.lock().insert(token_hash.to_string(), user);
    }

    /// Seed an unread-notification count for a user.
    pub fn set_unread(&self, user_id: &str, count: i64) {
        self.counts.lock().insert(user_id.to_string(), count);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn user_by_token(&self, token_hash: &str) -> Result<Option<UserRecord>, ApiError> {
        Ok(self.users.lock().get(token_hash).cloned())
    }

    async fn unread_count(&self, user_id: &str) -> Result<i64, ApiError> {
        Ok(self.counts.lock().get(user_id).copied().unwrap_or(0))
    }
}
