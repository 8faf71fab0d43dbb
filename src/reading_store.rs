use crate::db::{DatabaseService, StoreError};
use crate::models::{from_millis, to_millis, Reading};
use log::info;
use rusqlite::{params, Connection};
use std::sync::Arc;
use time::OffsetDateTime;

const MAX_RANGE_ROWS: usize = 10_000;

/// Append-only time series of ingested values.
pub struct ReadingStore {
    db: Arc<DatabaseService>,
}

impl ReadingStore {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self { db }
    }

    #[cfg(test)]
    pub fn append(
        &self,
        sensor_id: i64,
        value: &str,
        recorded_at: OffsetDateTime,
    ) -> Result<Reading, StoreError> {
        let conn = self.db.conn()?;
        append(&conn, sensor_id, value, recorded_at)
    }

    /// Readings of one sensor within `[from, to]`, newest first. Soft-deleted
    /// rows are excluded.
    pub fn range(
        &self,
        sensor_id: i64,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
        limit: usize,
    ) -> Result<Vec<Reading>, StoreError> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, sensor_id, value, recorded_at FROM readings
            WHERE sensor_id = ?1
              AND deleted_at IS NULL
              AND (?2 IS NULL OR recorded_at >= ?2)
              AND (?3 IS NULL OR recorded_at <= ?3)
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?4
            "#,
        )?;
        let rows = stmt.query_map(
            params![
                sensor_id,
                from.map(to_millis),
                to.map(to_millis),
                limit.min(MAX_RANGE_ROWS) as i64
            ],
            |row| {
                Ok(Reading {
                    id: row.get(0)?,
                    sensor_id: row.get(1)?,
                    value: row.get(2)?,
                    recorded_at: from_millis(row.get(3)?),
                })
            },
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    #[cfg(test)]
    pub fn count_for_sensor(&self, sensor_id: i64) -> Result<i64, StoreError> {
        let conn = self.db.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM readings WHERE sensor_id = ?1 AND deleted_at IS NULL",
            params![sensor_id],
            |row| row.get(0),
        )?)
    }

    /// Soft-deletes every reading recorded before `now - horizon`.
    pub fn sweep_retention(
        &self,
        horizon: time::Duration,
        now: OffsetDateTime,
    ) -> Result<usize, StoreError> {
        let conn = self.db.conn()?;
        let cutoff = now - horizon;
        let deleted = conn.execute(
            "UPDATE readings SET deleted_at = ?2 WHERE deleted_at IS NULL AND recorded_at < ?1",
            params![to_millis(cutoff), to_millis(now)],
        )?;
        if deleted > 0 {
            info!("Retention sweep soft-deleted {} reading(s) older than {}.", deleted, cutoff);
        }
        Ok(deleted)
    }
}

pub(crate) fn append(
    conn: &Connection,
    sensor_id: i64,
    value: &str,
    recorded_at: OffsetDateTime,
) -> Result<Reading, StoreError> {
    conn.execute(
        "INSERT INTO readings (sensor_id, value, recorded_at) VALUES (?1, ?2, ?3)",
        params![sensor_id, value, to_millis(recorded_at)],
    )?;
    Ok(Reading {
        id: conn.last_insert_rowid(),
        sensor_id,
        value: value.to_string(),
        recorded_at: from_millis(to_millis(recorded_at)),
    })
}
