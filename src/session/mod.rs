//! Per-session dialogue history.
//!
//! Turns are stored in SQLite and only ever appended. A session is Active
//! while turns keep arriving within the idle timeout, Idle once the timeout
//! has elapsed, and Expired when the manager discards it — a query with an
//! expired session id silently starts over with empty history.
//!
//! Concurrent requests for one session must not interleave appends, so the
//! manager hands out a per-session mutex; requests for different sessions
//! never block each other.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::core::errors::RagError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Idle,
    Expired,
}

/// SQLite-backed store for sessions and their turns.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub async fn with_path(db_path: &Path) -> Result<Self, RagError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(RagError::internal)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), RagError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(RagError::internal)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(RagError::internal)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_turns_session_id ON turns(session_id)")
            .execute(&self.pool)
            .await
            .map_err(RagError::internal)?;

        Ok(())
    }

    /// Append a turn, creating the session row on first use.
    pub async fn append_turn(
        &self,
        session_id: &str,
        role: Role,
        text: &str,
    ) -> Result<(), RagError> {
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await.map_err(RagError::internal)?;

        sqlx::query("INSERT OR IGNORE INTO sessions (id, created_at, updated_at) VALUES (?, ?, ?)")
            .bind(session_id)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(RagError::internal)?;

        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(RagError::internal)?;

        sqlx::query(
            "INSERT INTO turns (session_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(role.as_str())
        .bind(text)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(RagError::internal)?;

        tx.commit().await.map_err(RagError::internal)?;
        Ok(())
    }

    /// The most recent `max_turns` turns, oldest first.
    pub async fn history(&self, session_id: &str, max_turns: usize) -> Result<Vec<Turn>, RagError> {
        let rows = sqlx::query(
            "SELECT role, content, created_at FROM
                (SELECT * FROM turns WHERE session_id = ? ORDER BY id DESC LIMIT ?)
             ORDER BY id ASC",
        )
        .bind(session_id)
        .bind(max_turns as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(RagError::internal)?;

        let mut turns = Vec::with_capacity(rows.len());
        for row in rows {
            let role: String = row.get("role");
            let created_at: String = row.get("created_at");
            turns.push(Turn {
                role: Role::parse(&role),
                text: row.get("content"),
                timestamp: created_at
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(turns)
    }

    /// Timestamp of the session's last activity, if the session exists.
    pub async fn last_activity(&self, session_id: &str) -> Result<Option<DateTime<Utc>>, RagError> {
        let updated: Option<String> =
            sqlx::query_scalar("SELECT updated_at FROM sessions WHERE id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(RagError::internal)?;

        Ok(updated.and_then(|s| s.parse::<DateTime<Utc>>().ok()))
    }

    /// Discard a session and all its turns.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), RagError> {
        sqlx::query("DELETE FROM turns WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(RagError::internal)?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(RagError::internal)?;
        Ok(())
    }
}

/// Session lifecycle and append serialization on top of the store.
pub struct ConversationManager {
    store: SessionStore,
    idle_timeout: Duration,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationManager {
    pub fn new(store: SessionStore, idle_timeout: Duration) -> Self {
        Self {
            store,
            idle_timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Per-session mutex; the engine holds it across an entire request so
    /// two concurrent messages in one session cannot interleave appends.
    pub async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Current lifecycle state of a session id.
    pub async fn state(&self, session_id: &str) -> Result<SessionState, RagError> {
        match self.store.last_activity(session_id).await? {
            None => Ok(SessionState::Expired),
            Some(last) => {
                let elapsed = Utc::now().signed_duration_since(last);
                if elapsed.num_milliseconds().max(0) as u128 <= self.idle_timeout.as_millis() {
                    Ok(SessionState::Active)
                } else {
                    Ok(SessionState::Idle)
                }
            }
        }
    }

    /// Prepare a session for a new request. An Idle session is discarded
    /// here (becoming Expired), so the caller proceeds with empty history
    /// under the same session id.
    pub async fn resolve(&self, session_id: &str) -> Result<(), RagError> {
        self.evict_released_locks().await;
        if self.state(session_id).await? == SessionState::Idle {
            tracing::info!("session {} expired after idle timeout, starting fresh", session_id);
            self.store.delete_session(session_id).await?;
        }
        Ok(())
    }

    /// Drop lock entries no caller holds anymore, so the map stays bounded
    /// by in-flight sessions instead of growing by one entry per session id
    /// ever seen. A lock is recreated on demand if its session returns.
    async fn evict_released_locks(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn append_turn(
        &self,
        session_id: &str,
        role: Role,
        text: &str,
    ) -> Result<(), RagError> {
        self.store.append_turn(session_id, role, text).await
    }

    pub async fn history(&self, session_id: &str, max_turns: usize) -> Result<Vec<Turn>, RagError> {
        self.store.history(session_id, max_turns).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SessionStore {
        let path = std::env::temp_dir().join(format!(
            "bancassure-sessions-{}.db",
            uuid::Uuid::new_v4()
        ));
        SessionStore::with_path(&path).await.unwrap()
    }

    #[tokio::test]
    async fn history_returns_most_recent_oldest_first() {
        let store = test_store().await;
        for i in 0..5 {
            store
                .append_turn("s1", Role::User, &format!("question {}", i))
                .await
                .unwrap();
        }

        let turns = store.history("s1", 3).await.unwrap();
        assert_eq!(turns.len(), 3);
        let texts: Vec<&str> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["question 2", "question 3", "question 4"]);
    }

    #[tokio::test]
    async fn turns_are_never_reordered() {
        let store = test_store().await;
        store.append_turn("s1", Role::User, "q1").await.unwrap();
        store.append_turn("s1", Role::Assistant, "a1").await.unwrap();
        store.append_turn("s1", Role::User, "q2").await.unwrap();

        let turns = store.history("s1", 10).await.unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[2].text, "q2");
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let store = test_store().await;
        store.append_turn("s1", Role::User, "for s1").await.unwrap();
        store.append_turn("s2", Role::User, "for s2").await.unwrap();

        let turns = store.history("s1", 10).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text, "for s1");
    }

    #[tokio::test]
    async fn idle_session_is_discarded_on_resolve() {
        let store = test_store().await;
        let manager = ConversationManager::new(store, Duration::from_millis(50));

        manager.append_turn("s1", Role::User, "hello").await.unwrap();
        assert_eq!(manager.state("s1").await.unwrap(), SessionState::Active);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(manager.state("s1").await.unwrap(), SessionState::Idle);

        manager.resolve("s1").await.unwrap();
        assert_eq!(manager.state("s1").await.unwrap(), SessionState::Expired);
        assert!(manager.history("s1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn active_session_survives_resolve() {
        let store = test_store().await;
        let manager = ConversationManager::new(store, Duration::from_secs(60));

        manager.append_turn("s1", Role::User, "hello").await.unwrap();
        manager.resolve("s1").await.unwrap();
        assert_eq!(manager.history("s1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_session_releases_its_lock_entry() {
        let store = test_store().await;
        let manager = ConversationManager::new(store, Duration::from_millis(50));

        manager.append_turn("s1", Role::User, "hello").await.unwrap();
        {
            let lock = manager.session_lock("s1").await;
            let _guard = lock.lock().await;
        }
        assert_eq!(manager.tracked_locks().await, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        manager.resolve("s1").await.unwrap();
        assert_eq!(manager.tracked_locks().await, 0);
    }

    #[tokio::test]
    async fn held_lock_entries_are_not_evicted() {
        let store = test_store().await;
        let manager = ConversationManager::new(store, Duration::from_secs(60));

        let lock = manager.session_lock("s1").await;
        let _guard = lock.lock().await;

        manager.resolve("s2").await.unwrap();
        assert_eq!(manager.tracked_locks().await, 1);
    }

    #[tokio::test]
    async fn sequential_appends_under_lock_are_not_lost() {
        let store = test_store().await;
        let manager = Arc::new(ConversationManager::new(store, Duration::from_secs(60)));

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let lock = manager.session_lock("s1").await;
                let _guard = lock.lock().await;
                manager
                    .append_turn("s1", Role::User, &format!("msg {}", i))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let turns = manager.history("s1", 20).await.unwrap();
        assert_eq!(turns.len(), 8);
    }
}
