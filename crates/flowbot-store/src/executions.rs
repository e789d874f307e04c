use std::collections::BTreeMap;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use flowbot_core::error::{FlowbotError, Result};
use flowbot_core::traits::ExecutionStore;
use flowbot_core::types::{ConversationKey, ExecutionState, ExecutionStatus};

use crate::store::{db_err, parse_ts, SqliteStore};

const COLUMNS: &str = "execution_id, flow_id, phone, device, current_node_id, last_node_id, \
     waiting_for_reply, stage, status, variables, created_at, updated_at";

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<ExecutionState> {
    let variables: String = row.get(9)?;
    let status: String = row.get(8)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;
    Ok(ExecutionState {
        execution_id: row.get(0)?,
        flow_id: row.get(1)?,
        key: ConversationKey::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
        current_node_id: row.get(4)?,
        last_node_id: row.get(5)?,
        waiting_for_reply: row.get::<_, i64>(6)? != 0,
        stage: row.get(7)?,
        status: ExecutionStatus::parse(&status),
        variables: serde_json::from_str(&variables).unwrap_or_default(),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn query_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<ExecutionState>> {
    conn.query_row(sql, params, row_to_execution)
        .optional()
        .map_err(db_err)
}

fn active(conn: &Connection, key: &ConversationKey, flow_id: &str) -> Result<Option<ExecutionState>> {
    query_one(
        conn,
        &format!(
            "SELECT {COLUMNS} FROM executions
             WHERE phone = ?1 AND device = ?2 AND flow_id = ?3 AND status = 'active'"
        ),
        params![key.phone, key.device, flow_id],
    )
}

/// Insert a fresh active row unless one already exists for (key, flow).
fn insert_active(
    conn: &Connection,
    key: &ConversationKey,
    flow_id: &str,
    node_id: &str,
    waiting_for_reply: bool,
) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO executions
                (execution_id, flow_id, phone, device, current_node_id, waiting_for_reply,
                 status, variables, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', '{}', ?7, ?7)",
            params![
                Uuid::new_v4().to_string(),
                flow_id,
                key.phone,
                key.device,
                node_id,
                waiting_for_reply as i64,
                now,
            ],
        )
        .map_err(db_err)?;
    Ok(inserted > 0)
}

impl SqliteStore {
    /// Every execution for a conversation, most recent first.
    pub fn list_executions(&self, key: &ConversationKey, limit: usize) -> Result<Vec<ExecutionState>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM executions
                 WHERE phone = ?1 AND device = ?2
                 ORDER BY updated_at DESC, rowid DESC LIMIT ?3"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![key.phone, key.device, limit as i64], row_to_execution)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

impl ExecutionStore for SqliteStore {
    fn get(&self, key: &ConversationKey) -> BoxFuture<'_, Result<Option<ExecutionState>>> {
        let key = key.clone();
        Box::pin(async move {
            let conn = self.conn()?;
            query_one(
                &conn,
                &format!(
                    "SELECT {COLUMNS} FROM executions
                     WHERE phone = ?1 AND device = ?2 AND status = 'active'
                     ORDER BY updated_at DESC, rowid DESC LIMIT 1"
                ),
                params![key.phone, key.device],
            )
        })
    }

    fn get_by_id(&self, execution_id: &str) -> BoxFuture<'_, Result<Option<ExecutionState>>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            query_one(
                &conn,
                &format!("SELECT {COLUMNS} FROM executions WHERE execution_id = ?1"),
                params![execution_id],
            )
        })
    }

    fn latest(
        &self,
        key: &ConversationKey,
        flow_id: &str,
    ) -> BoxFuture<'_, Result<Option<ExecutionState>>> {
        let key = key.clone();
        let flow_id = flow_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            query_one(
                &conn,
                &format!(
                    "SELECT {COLUMNS} FROM executions
                     WHERE phone = ?1 AND device = ?2 AND flow_id = ?3
                     ORDER BY updated_at DESC, rowid DESC LIMIT 1"
                ),
                params![key.phone, key.device, flow_id],
            )
        })
    }

    fn create(
        &self,
        key: &ConversationKey,
        flow_id: &str,
        start_node_id: &str,
    ) -> BoxFuture<'_, Result<ExecutionState>> {
        let key = key.clone();
        let flow_id = flow_id.to_string();
        let start_node_id = start_node_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            if insert_active(&conn, &key, &flow_id, &start_node_id, false)? {
                debug!(key = %key, flow_id = %flow_id, "Execution created");
            }
            active(&conn, &key, &flow_id)?.ok_or_else(|| {
                FlowbotError::ExecutionNotFound(format!("{} in flow {}", key, flow_id))
            })
        })
    }

    fn upsert_advance(
        &self,
        key: &ConversationKey,
        flow_id: &str,
        node_id: &str,
        waiting_for_reply: bool,
    ) -> BoxFuture<'_, Result<()>> {
        let key = key.clone();
        let flow_id = flow_id.to_string();
        let node_id = node_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let updated = conn
                .execute(
                    "UPDATE executions
                     SET last_node_id = current_node_id,
                         current_node_id = ?4,
                         waiting_for_reply = ?5,
                         updated_at = ?6
                     WHERE phone = ?1 AND device = ?2 AND flow_id = ?3 AND status = 'active'",
                    params![
                        key.phone,
                        key.device,
                        flow_id,
                        node_id,
                        waiting_for_reply as i64,
                        Utc::now().to_rfc3339(),
                    ],
                )
                .map_err(db_err)?;
            if updated == 0 {
                insert_active(&conn, &key, &flow_id, &node_id, waiting_for_reply)?;
            }
            Ok(())
        })
    }

    fn set_waiting(
        &self,
        key: &ConversationKey,
        flow_id: &str,
        waiting_for_reply: bool,
    ) -> BoxFuture<'_, Result<()>> {
        let key = key.clone();
        let flow_id = flow_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let updated = conn
                .execute(
                    "UPDATE executions
                     SET waiting_for_reply = ?4, updated_at = ?5
                     WHERE phone = ?1 AND device = ?2 AND flow_id = ?3 AND status = 'active'",
                    params![
                        key.phone,
                        key.device,
                        flow_id,
                        waiting_for_reply as i64,
                        Utc::now().to_rfc3339(),
                    ],
                )
                .map_err(db_err)?;
            if updated == 0 {
                return Err(FlowbotError::ExecutionNotFound(format!(
                    "{} in flow {}",
                    key, flow_id
                )));
            }
            Ok(())
        })
    }

    fn set_stage(&self, execution_id: &str, stage: Option<String>) -> BoxFuture<'_, Result<()>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE executions SET stage = ?2, updated_at = ?3 WHERE execution_id = ?1",
                params![execution_id, stage, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn save_variables(
        &self,
        execution_id: &str,
        variables: &BTreeMap<String, String>,
    ) -> BoxFuture<'_, Result<()>> {
        let execution_id = execution_id.to_string();
        let variables = variables.clone();
        Box::pin(async move {
            let json = serde_json::to_string(&variables)?;
            let conn = self.conn()?;
            conn.execute(
                "UPDATE executions SET variables = ?2, updated_at = ?3 WHERE execution_id = ?1",
                params![execution_id, json, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn complete(&self, key: &ConversationKey, flow_id: &str) -> BoxFuture<'_, Result<()>> {
        let key = key.clone();
        let flow_id = flow_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let updated = conn
                .execute(
                    "UPDATE executions
                     SET status = 'completed',
                         last_node_id = current_node_id,
                         current_node_id = 'end',
                         waiting_for_reply = 0,
                         updated_at = ?4
                     WHERE phone = ?1 AND device = ?2 AND flow_id = ?3 AND status = 'active'",
                    params![key.phone, key.device, flow_id, Utc::now().to_rfc3339()],
                )
                .map_err(db_err)?;
            debug!(key = %key, flow_id = %flow_id, rows = updated, "Execution completed");
            Ok(())
        })
    }
}
