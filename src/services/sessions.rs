use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{sync::RwLock, task::JoinHandle, time::interval};
use tracing::{debug, info, warn};

use crate::{
    db::DbPool,
    error::AppError,
    models::session::AUTH_USER_KEY,
};

pub type SessionMap = HashMap<String, String>;

/// Backing store for server-side sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the values of a live session; expired sessions are treated as missing.
    async fn load(&self, key: &str) -> Result<Option<SessionMap>, AppError>;

    async fn save(
        &self,
        key: &str,
        values: &SessionMap,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    async fn delete(&self, key: &str) -> Result<(), AppError>;

    /// Removes every session authenticated as `user_id` and returns their keys.
    async fn delete_user_sessions(&self, user_id: i64) -> Result<Vec<String>, AppError>;

    async fn clear_expired(&self) -> Result<u64, AppError>;
}

/// Purges expired sessions every `every` until the task is aborted.
pub fn spawn_expiry_sweeper(store: Arc<dyn SessionStore>, every: Duration) -> JoinHandle<()> {
    info!(every_secs = every.as_secs(), "starting expired session sweeper");

    tokio::spawn(async move {
        let mut ticker = interval(every);
        loop {
            ticker.tick().await;
            match store.clear_expired().await {
                Ok(0) => {}
                Ok(purged) => info!("purged {purged} expired sessions"),
                Err(err) => warn!("could not purge expired sessions: {err}"),
            }
        }
    })
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    db: DbPool,
}

impl SqliteSessionStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, key: &str) -> Result<Option<SessionMap>, AppError> {
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT session_data FROM sessions WHERE session_key = ?1 AND expires_at > ?2",
        )
        .bind(key)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.db)
        .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let values: SessionMap =
            serde_json::from_str(&raw).map_err(|err| AppError::Other(err.into()))?;
        Ok(Some(values))
    }

    async fn save(
        &self,
        key: &str,
        values: &SessionMap,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let data = serde_json::to_string(values).map_err(|err| AppError::Other(err.into()))?;
        sqlx::query(
            r#"INSERT INTO sessions (session_key, session_data, expires_at) VALUES (?1, ?2, ?3)
               ON CONFLICT(session_key) DO UPDATE SET
                   session_data = excluded.session_data,
                   expires_at = excluded.expires_at"#,
        )
        .bind(key)
        .bind(data)
        .bind(expires_at.timestamp())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM sessions WHERE session_key = ?1")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_user_sessions(&self, user_id: i64) -> Result<Vec<String>, AppError> {
        let path = format!("$.{AUTH_USER_KEY}");
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT session_key FROM sessions WHERE json_extract(session_data, ?1) = ?2",
        )
        .bind(&path)
        .bind(user_id.to_string())
        .fetch_all(&self.db)
        .await?;

        for key in &keys {
            self.delete(key).await?;
        }
        debug!("deleted {} sessions of user {user_id}", keys.len());
        Ok(keys)
    }

    async fn clear_expired(&self) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?1")
            .bind(Utc::now().timestamp())
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
struct StoredSession {
    values: SessionMap,
    expires_at: DateTime<Utc>,
}

/// Process-local store; sessions vanish on restart.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, StoredSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, key: &str) -> Result<Option<SessionMap>, AppError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(key)
            .filter(|stored| stored.expires_at > Utc::now())
            .map(|stored| stored.values.clone()))
    }

    async fn save(
        &self,
        key: &str,
        values: &SessionMap,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            key.to_string(),
            StoredSession {
                values: values.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.sessions.write().await.remove(key);
        Ok(())
    }

    async fn delete_user_sessions(&self, user_id: i64) -> Result<Vec<String>, AppError> {
        let wanted = user_id.to_string();
        let mut sessions = self.sessions.write().await;
        let keys: Vec<String> = sessions
            .iter()
            .filter(|(_, stored)| stored.values.get(AUTH_USER_KEY) == Some(&wanted))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            sessions.remove(key);
        }
        Ok(keys)
    }

    async fn clear_expired(&self) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, stored| stored.expires_at > now);
        Ok((before - sessions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn values(pairs: &[(&str, &str)]) -> SessionMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn memory_store_hides_expired_sessions() {
        let store = MemorySessionStore::new();
        let past = Utc::now() - Duration::seconds(5);
        store.save("gone", &values(&[("a", "b")]), past).await.unwrap();

        assert!(store.load("gone").await.unwrap().is_none());
        assert_eq!(store.clear_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sweeper_purges_sessions_that_expire_later() {
        let memory = MemorySessionStore::new();
        let store: Arc<dyn SessionStore> = Arc::new(memory.clone());
        let soon = Utc::now() + Duration::milliseconds(50);
        store.save("short", &values(&[("a", "b")]), soon).await.unwrap();
        store
            .save("long", &values(&[("a", "b")]), Utc::now() + Duration::hours(1))
            .await
            .unwrap();

        let sweeper = spawn_expiry_sweeper(store, std::time::Duration::from_millis(20));
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        sweeper.abort();

        let remaining = memory.sessions.read().await;
        assert!(!remaining.contains_key("short"));
        assert!(remaining.contains_key("long"));
    }

    #[tokio::test]
    async fn memory_store_deletes_sessions_by_user() {
        let store = MemorySessionStore::new();
        let later = Utc::now() + Duration::hours(1);
        store
            .save("one", &values(&[(AUTH_USER_KEY, "4")]), later)
            .await
            .unwrap();
        store
            .save("two", &values(&[(AUTH_USER_KEY, "5")]), later)
            .await
            .unwrap();

        let removed = store.delete_user_sessions(4).await.unwrap();

        assert_eq!(removed, vec!["one".to_string()]);
        assert!(store.load("one").await.unwrap().is_none());
        assert!(store.load("two").await.unwrap().is_some());
    }
}
