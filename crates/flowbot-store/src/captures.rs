use futures::future::BoxFuture;
use rusqlite::params;

use flowbot_core::error::Result;
use flowbot_core::traits::FieldCaptureSource;
use flowbot_core::types::{CaptureInput, FieldCapture};

use crate::store::{db_err, SqliteStore};

impl SqliteStore {
    /// Register a capture rule for `stage` on `device`.
    pub fn add_capture(&self, device: &str, stage: &str, capture: &FieldCapture) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO field_captures (device, stage, input_kind, fixed_value, target_field)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                device,
                stage.trim(),
                capture.input_kind.as_str(),
                capture.fixed_value,
                capture.target_field,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

impl FieldCaptureSource for SqliteStore {
    fn lookup(&self, device: &str, stage: &str) -> BoxFuture<'_, Result<Vec<FieldCapture>>> {
        let device = device.to_string();
        let stage = stage.trim().to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(
                    "SELECT input_kind, fixed_value, target_field FROM field_captures
                     WHERE device = ?1 AND stage = ?2
                     ORDER BY id",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![device, stage], |row| {
                    let kind: String = row.get(0)?;
                    Ok(FieldCapture {
                        input_kind: CaptureInput::parse(&kind),
                        fixed_value: row.get(1)?,
                        target_field: row.get(2)?,
                    })
                })
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
    }
}
