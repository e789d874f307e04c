use futures::future::BoxFuture;
use rusqlite::params;

use flowbot_core::error::Result;
use flowbot_core::traits::ConversationHistory;
use flowbot_core::types::{ConversationKey, HistoryEntry};

use crate::store::{db_err, parse_ts, SqliteStore};

impl ConversationHistory for SqliteStore {
    fn append(&self, key: &ConversationKey, entry: HistoryEntry) -> BoxFuture<'_, Result<()>> {
        let key = key.clone();
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO conversation_history
                    (phone, device, user_text, bot_text, stage, display_name, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    key.phone,
                    key.device,
                    entry.user_text,
                    entry.bot_text,
                    entry.stage,
                    entry.display_name,
                    entry.timestamp.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn read(
        &self,
        key: &ConversationKey,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<HistoryEntry>>> {
        let key = key.clone();
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(
                    "SELECT user_text, bot_text, stage, display_name, timestamp
                     FROM conversation_history
                     WHERE phone = ?1 AND device = ?2
                     ORDER BY id DESC LIMIT ?3",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![key.phone, key.device, limit as i64], |row| {
                    let ts: String = row.get(4)?;
                    Ok(HistoryEntry {
                        user_text: row.get(0)?,
                        bot_text: row.get(1)?,
                        stage: row.get(2)?,
                        display_name: row.get(3)?,
                        timestamp: parse_ts(&ts),
                    })
                })
                .map_err(db_err)?;

            let mut entries = rows
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            entries.reverse();
            Ok(entries)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_returns_most_recent_oldest_first() {
        let store = SqliteStore::in_memory().unwrap();
        let key = ConversationKey::new("628111", "dev-1");
        for i in 0..5 {
            store
                .append(&key, HistoryEntry::new(format!("u{i}"), format!("b{i}")))
                .await
                .unwrap();
        }

        let recent = store.read(&key, 3).await.unwrap();
        let users: Vec<_> = recent.iter().map(|e| e.user_text.as_str()).collect();
        assert_eq!(users, vec!["u2", "u3", "u4"]);
    }

    #[tokio::test]
    async fn test_history_is_per_conversation() {
        let store = SqliteStore::in_memory().unwrap();
        let a = ConversationKey::new("628111", "dev-1");
        let b = ConversationKey::new("628111", "dev-2");
        let mut entry = HistoryEntry::new("hi", "hello");
        entry.stage = Some("greeting".into());
        entry.display_name = Some("Ana".into());
        store.append(&a, entry).await.unwrap();

        assert!(store.read(&b, 10).await.unwrap().is_empty());
        let got = store.read(&a, 10).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].stage.as_deref(), Some("greeting"));
        assert_eq!(got[0].display_name.as_deref(), Some("Ana"));
    }
}
