use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use flowbot_core::error::Result;
use flowbot_core::traits::SessionLock;
use flowbot_core::types::ConversationKey;

use crate::store::{db_err, parse_ts, SqliteStore};

impl SqliteStore {
    /// Try to take the lock for `key` as of `now`.
    ///
    /// A row older than `stale_after` is treated as abandoned and taken over.
    /// Contention at the database level reports `false` rather than an error.
    pub fn acquire_at(
        &self,
        key: &ConversationKey,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(e) if is_contention(&e) => return Ok(false),
            Err(e) => return Err(db_err(e)),
        };

        let held_since: Option<String> = tx
            .query_row(
                "SELECT acquired_at FROM session_locks WHERE phone = ?1 AND device = ?2",
                params![key.phone, key.device],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let stale = chrono::Duration::milliseconds(stale_after.as_millis() as i64);
        match held_since {
            None => {
                tx.execute(
                    "INSERT INTO session_locks (phone, device, acquired_at) VALUES (?1, ?2, ?3)",
                    params![key.phone, key.device, now.to_rfc3339()],
                )
                .map_err(db_err)?;
            }
            Some(raw) => {
                let held_for = now.signed_duration_since(parse_ts(&raw));
                if held_for <= stale {
                    return Ok(false);
                }
                warn!(
                    key = %key,
                    held_secs = held_for.num_seconds(),
                    "Taking over stale session lock"
                );
                tx.execute(
                    "UPDATE session_locks SET acquired_at = ?3 WHERE phone = ?1 AND device = ?2",
                    params![key.phone, key.device, now.to_rfc3339()],
                )
                .map_err(db_err)?;
            }
        }

        match tx.commit() {
            Ok(()) => {
                debug!(key = %key, "Session lock acquired");
                Ok(true)
            }
            Err(e) if is_contention(&e) => Ok(false),
            Err(e) => Err(db_err(e)),
        }
    }

    fn release_sync(&self, key: &ConversationKey) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM session_locks WHERE phone = ?1 AND device = ?2",
            params![key.phone, key.device],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

fn is_contention(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::DatabaseBusy || err.code == ErrorCode::DatabaseLocked
    )
}

impl SessionLock for SqliteStore {
    fn acquire(&self, key: &ConversationKey) -> BoxFuture<'_, Result<bool>> {
        let key = key.clone();
        Box::pin(async move { self.acquire_at(&key, Utc::now(), self.lock_stale_after) })
    }

    fn release(&self, key: &ConversationKey) -> BoxFuture<'_, Result<()>> {
        let key = key.clone();
        Box::pin(async move { self.release_sync(&key) })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn key() -> ConversationKey {
        ConversationKey::new("628111", "dev-1")
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.acquire(&key()).await.unwrap());
        assert!(!store.acquire(&key()).await.unwrap());
        store.release(&key()).await.unwrap();
        assert!(store.acquire(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_unheld_is_ok() {
        let store = SqliteStore::in_memory().unwrap();
        store.release(&key()).await.unwrap();
        store.release(&key()).await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.acquire(&key()).await.unwrap());
        assert!(store
            .acquire(&ConversationKey::new("628111", "dev-2"))
            .await
            .unwrap());
        assert!(store
            .acquire(&ConversationKey::new("628222", "dev-1"))
            .await
            .unwrap());
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let store = SqliteStore::in_memory().unwrap();
        let stale = Duration::from_secs(30);
        let t0 = Utc::now();
        assert!(store.acquire_at(&key(), t0, stale).unwrap());
        assert!(!store
            .acquire_at(&key(), t0 + chrono::Duration::seconds(10), stale)
            .unwrap());
        assert!(store
            .acquire_at(&key(), t0 + chrono::Duration::seconds(31), stale)
            .unwrap());
        // Takeover refreshes the timestamp.
        assert!(!store
            .acquire_at(&key(), t0 + chrono::Duration::seconds(40), stale)
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_has_one_winner() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.acquire(&key()).await.unwrap() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_file_backed_lock_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks.db");
        let a = SqliteStore::open(&path).unwrap();
        let b = SqliteStore::open(&path).unwrap();
        assert!(a.acquire(&key()).await.unwrap());
        assert!(!b.acquire(&key()).await.unwrap());
        a.release(&key()).await.unwrap();
        assert!(b.acquire(&key()).await.unwrap());
    }
}
