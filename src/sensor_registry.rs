//! Persistent mapping from (topic, broker config) to sensor identity, plus the
//! sensor-type catalogue and per-sensor thresholds.
//!
//! Every lookup that can race with another writer is a conflict-safe
//! find-or-create: `INSERT .. ON CONFLICT DO NOTHING` followed by a fetch, so
//! two first messages on the same new topic end up on the same row.
//!
//! The connection-level functions take a `&Connection` so the dispatcher can
//! run a whole ingest inside one transaction; [`SensorRegistry`] wraps them
//! for callers that do not need that.

use crate::connectivity::SweepCandidate;
use crate::db::{parse_protocol, DatabaseService, StoreError};
use crate::models::{
    from_millis, to_millis, BrokerConfig, ConnectivityState, NewSensorType, Protocol, Sensor,
    SensorFilter, SensorType, ThresholdAlert, GENERIC_SENSOR_TYPE,
};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;
use std::sync::Arc;
use time::OffsetDateTime;

const DEFAULT_DECIMALS: i64 = 2;

/// Fields needed to create a sensor row.
#[derive(Debug, Clone)]
pub struct NewSensor {
    pub name: String,
    pub sensor_type_id: i64,
    pub protocol: Protocol,
    pub topic: String,
    pub broker_config_id: Option<i64>,
    pub plot_id: Option<i64>,
    pub sub_plot_id: Option<i64>,
    pub min_threshold: Option<f64>,
    pub max_threshold: Option<f64>,
}

/// Admin request to register a sensor by hand (the HTTP ingestion path has
/// no discovery, so its sensors are created this way).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRegistration {
    pub name: String,
    pub sensor_type: String,
    #[serde(default = "http_protocol")]
    pub protocol: Protocol,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default, alias = "loteId")]
    pub plot_id: Option<i64>,
    #[serde(default, alias = "subLoteId")]
    pub sub_plot_id: Option<i64>,
    #[serde(default)]
    pub min_threshold: Option<f64>,
    #[serde(default)]
    pub max_threshold: Option<f64>,
}

fn http_protocol() -> Protocol {
    Protocol::Http
}

/// Editable sensor settings. Connectivity state is deliberately absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSettings {
    pub name: Option<String>,
    pub min_threshold: Option<f64>,
    pub max_threshold: Option<f64>,
    pub active: Option<bool>,
}

/// Result of applying one message to a sensor row.
#[derive(Debug, Clone)]
pub struct MessageUpdate<'a> {
    pub value: &'a str,
    pub recorded_at: OffsetDateTime,
    pub seen_at: OffsetDateTime,
    pub state: ConnectivityState,
    pub alert: Option<ThresholdAlert>,
    pub sensor_type_id: Option<i64>,
}

pub struct SensorRegistry {
    db: Arc<DatabaseService>,
    default_ttl_minutes: i64,
}

impl SensorRegistry {
    pub fn new(db: Arc<DatabaseService>, default_ttl_minutes: i64) -> Self {
        Self {
            db,
            default_ttl_minutes,
        }
    }

    #[cfg(test)]
    pub fn database(&self) -> &Arc<DatabaseService> {
        &self.db
    }

    pub fn create_type(&self, input: &NewSensorType) -> Result<SensorType, StoreError> {
        let name = normalize_type_name(&input.name);
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO sensor_types (name, unit, decimals, ttl_minutes) VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                input.unit,
                input.decimals.unwrap_or(DEFAULT_DECIMALS),
                input.ttl_minutes.unwrap_or(self.default_ttl_minutes),
            ],
        )
        .map_err(|e| StoreError::from_write(e, &format!("sensor type '{}'", name)))?;
        let id = conn.last_insert_rowid();
        get_type(&conn, id)
    }

    #[cfg(test)]
    pub fn find_or_create_type(
        &self,
        name: &str,
        unit: Option<&str>,
    ) -> Result<(SensorType, bool), StoreError> {
        let conn = self.db.conn()?;
        find_or_create_type(&conn, name, unit, self.default_ttl_minutes)
    }

    pub fn get_type(&self, id: i64) -> Result<SensorType, StoreError> {
        let conn = self.db.conn()?;
        get_type(&conn, id)
    }

    pub fn list_types(&self) -> Result<Vec<SensorType>, StoreError> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sensor_types ORDER BY name",
            SENSOR_TYPE_COLUMNS
        ))?;
        let rows = stmt.query_map([], sensor_type_from_row)?;
        let mut types = Vec::new();
        for row in rows {
            types.push(row?);
        }
        Ok(types)
    }

    pub fn get_sensor(&self, id: i64) -> Result<Sensor, StoreError> {
        let conn = self.db.conn()?;
        get_sensor(&conn, id)
    }

    #[cfg(test)]
    pub fn find_or_create_sensor(&self, new: &NewSensor) -> Result<(Sensor, bool), StoreError> {
        let conn = self.db.conn()?;
        find_or_create_sensor(&conn, new)
    }

    /// Registers a sensor that is not tied to a broker configuration. A topic
    /// that is already registered is a conflict.
    pub fn register_sensor(&self, input: &SensorRegistration) -> Result<Sensor, StoreError> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let (sensor_type, _) =
            find_or_create_type(&tx, &input.sensor_type, None, self.default_ttl_minutes)?;
        let topic = input
            .topic
            .clone()
            .unwrap_or_else(|| format!("http/{}", uuid::Uuid::new_v4().simple()));
        let new = NewSensor {
            name: input.name.clone(),
            sensor_type_id: sensor_type.id,
            protocol: input.protocol,
            topic,
            broker_config_id: None,
            plot_id: input.plot_id,
            sub_plot_id: input.sub_plot_id,
            min_threshold: input.min_threshold,
            max_threshold: input.max_threshold,
        };
        let (sensor, created) = find_or_create_sensor(&tx, &new)?;
        if !created {
            return Err(StoreError::Conflict(format!(
                "sensor for topic '{}' already exists",
                sensor.topic
            )));
        }
        tx.commit()?;
        Ok(sensor)
    }

    pub fn update_settings(&self, id: i64, settings: &SensorSettings) -> Result<Sensor, StoreError> {
        let conn = self.db.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE sensors SET
                name = COALESCE(?2, name),
                min_threshold = COALESCE(?3, min_threshold),
                max_threshold = COALESCE(?4, max_threshold),
                active = COALESCE(?5, active)
            WHERE id = ?1
            "#,
            params![
                id,
                settings.name,
                settings.min_threshold,
                settings.max_threshold,
                settings.active
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound { entity: "sensor", id });
        }
        get_sensor(&conn, id)
    }

    pub fn list_sensors(&self, filter: &SensorFilter) -> Result<Vec<Sensor>, StoreError> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM sensors
            WHERE (?1 IS NULL OR broker_config_id = ?1)
              AND (?2 IS NULL OR sensor_type_id = ?2)
              AND (?3 IS NULL OR plot_id = ?3)
              AND (?4 IS NULL OR sub_plot_id = ?4)
              AND (?5 IS NULL OR state = ?5)
              AND (?6 IS NULL OR active = ?6)
            ORDER BY id
            "#,
            SENSOR_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![
                filter.broker_config_id,
                filter.sensor_type_id,
                filter.plot_id,
                filter.sub_plot_id,
                filter.state.map(|s| s.as_str()),
                filter.active,
            ],
            sensor_from_row,
        )?;
        let mut sensors = Vec::new();
        for row in rows {
            sensors.push(row?);
        }
        Ok(sensors)
    }

    /// Creates a sensor for every topic of `config` listed in `entries` that
    /// has no sensor yet. Returns only the rows that were created.
    pub fn provision_topics(
        &self,
        config: &BrokerConfig,
        entries: &[String],
    ) -> Result<Vec<Sensor>, StoreError> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let (generic, _) =
            find_or_create_type(&tx, GENERIC_SENSOR_TYPE, None, self.default_ttl_minutes)?;

        let mut created = Vec::new();
        for entry in entries {
            let topic = config.full_topic(entry);
            let new = NewSensor {
                name: topic.clone(),
                sensor_type_id: generic.id,
                protocol: config.protocol,
                topic,
                broker_config_id: Some(config.id),
                plot_id: config.plot_id,
                sub_plot_id: config.sub_plot_id,
                min_threshold: None,
                max_threshold: None,
            };
            let (sensor, was_created) = find_or_create_sensor(&tx, &new)?;
            if was_created {
                created.push(sensor);
            }
        }
        tx.commit()?;

        if !created.is_empty() {
            info!(
                "Provisioned {} sensor(s) for broker config {}.",
                created.len(),
                config.id
            );
        }
        Ok(created)
    }

    /// Active sensors with the TTL of their type, for the reconciliation sweep.
    pub fn sweep_candidates(&self) -> Result<Vec<SweepCandidate>, StoreError> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT s.id, s.state, s.last_seen_at, t.ttl_minutes
            FROM sensors s
            JOIN sensor_types t ON t.id = s.sensor_type_id
            WHERE s.active = 1
            ORDER BY s.id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            let state: String = row.get(1)?;
            Ok(SweepCandidate {
                sensor_id: row.get(0)?,
                state: parse_state(1, state)?,
                last_seen_at: row.get::<_, Option<i64>>(2)?.map(from_millis),
                ttl: time::Duration::minutes(row.get(3)?),
            })
        })?;
        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row?);
        }
        Ok(candidates)
    }

    /// Writes a reconciled state. The row is re-checked against `cutoff`
    /// (now minus TTL) inside the UPDATE, so a message that refreshed the
    /// sensor after the sweep read it is never overwritten. Returns whether a
    /// row changed.
    pub fn apply_reconciled_state(
        &self,
        sensor_id: i64,
        state: ConnectivityState,
        cutoff: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let conn = self.db.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE sensors SET state = ?2
            WHERE id = ?1
              AND state <> ?2
              AND (
                (?2 = 'CONNECTED' AND last_seen_at >= ?3)
                OR (?2 = 'DISCONNECTED' AND (last_seen_at IS NULL OR last_seen_at < ?3))
              )
            "#,
            params![sensor_id, state.as_str(), to_millis(cutoff)],
        )?;
        Ok(changed == 1)
    }
}

pub fn normalize_type_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        GENERIC_SENSOR_TYPE.to_string()
    } else {
        trimmed.to_uppercase()
    }
}

pub(crate) fn find_or_create_type(
    conn: &Connection,
    name: &str,
    unit: Option<&str>,
    default_ttl_minutes: i64,
) -> Result<(SensorType, bool), StoreError> {
    let name = normalize_type_name(name);
    let inserted = conn.execute(
        r#"
        INSERT INTO sensor_types (name, unit, decimals, ttl_minutes)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(name) DO NOTHING
        "#,
        params![name, unit, DEFAULT_DECIMALS, default_ttl_minutes],
    )?;
    let sensor_type = conn
        .query_row(
            &format!("SELECT {} FROM sensor_types WHERE name = ?1", SENSOR_TYPE_COLUMNS),
            params![name],
            sensor_type_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::Corrupt(format!("sensor type '{}' vanished after upsert", name)))?;
    if inserted == 1 {
        info!("Created sensor type '{}' (id {}).", sensor_type.name, sensor_type.id);
    }
    Ok((sensor_type, inserted == 1))
}

pub(crate) fn get_type(conn: &Connection, id: i64) -> Result<SensorType, StoreError> {
    conn.query_row(
        &format!("SELECT {} FROM sensor_types WHERE id = ?1", SENSOR_TYPE_COLUMNS),
        params![id],
        sensor_type_from_row,
    )
    .optional()?
    .ok_or(StoreError::NotFound { entity: "sensor type", id })
}

pub(crate) fn get_sensor(conn: &Connection, id: i64) -> Result<Sensor, StoreError> {
    conn.query_row(
        &format!("SELECT {} FROM sensors WHERE id = ?1", SENSOR_COLUMNS),
        params![id],
        sensor_from_row,
    )
    .optional()?
    .ok_or(StoreError::NotFound { entity: "sensor", id })
}

pub(crate) fn find_by_topic(
    conn: &Connection,
    topic: &str,
    broker_config_id: Option<i64>,
) -> Result<Option<Sensor>, StoreError> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM sensors WHERE topic = ?1 AND broker_config_id IS ?2",
                SENSOR_COLUMNS
            ),
            params![topic, broker_config_id],
            sensor_from_row,
        )
        .optional()?)
}

pub(crate) fn find_or_create_sensor(
    conn: &Connection,
    new: &NewSensor,
) -> Result<(Sensor, bool), StoreError> {
    let inserted = conn.execute(
        r#"
        INSERT INTO sensors (
            name, sensor_type_id, protocol, topic, broker_config_id, plot_id, sub_plot_id,
            min_threshold, max_threshold, state
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'DISCONNECTED')
        ON CONFLICT DO NOTHING
        "#,
        params![
            new.name,
            new.sensor_type_id,
            new.protocol.as_str(),
            new.topic,
            new.broker_config_id,
            new.plot_id,
            new.sub_plot_id,
            new.min_threshold,
            new.max_threshold,
        ],
    )?;
    let sensor = find_by_topic(conn, &new.topic, new.broker_config_id)?.ok_or_else(|| {
        StoreError::Corrupt(format!("sensor for topic '{}' vanished after upsert", new.topic))
    })?;
    if inserted == 1 {
        debug!("Created sensor {} for topic '{}'.", sensor.id, sensor.topic);
    }
    Ok((sensor, inserted == 1))
}

/// Applies one message to the sensor row and returns the stored snapshot.
/// Timestamps only move forward so out-of-order writers converge.
pub(crate) fn record_message(
    conn: &Connection,
    sensor_id: i64,
    update: &MessageUpdate<'_>,
) -> Result<Sensor, StoreError> {
    let changed = conn.execute(
        r#"
        UPDATE sensors SET
            last_value = CASE WHEN ?3 >= COALESCE(last_reading_at, 0) THEN ?2 ELSE last_value END,
            last_reading_at = MAX(COALESCE(last_reading_at, 0), ?3),
            last_seen_at = MAX(COALESCE(last_seen_at, 0), ?4),
            state = ?5,
            alert = ?6,
            sensor_type_id = COALESCE(?7, sensor_type_id)
        WHERE id = ?1
        "#,
        params![
            sensor_id,
            update.value,
            to_millis(update.recorded_at),
            to_millis(update.seen_at),
            update.state.as_str(),
            update.alert.map(|a| a.as_str()),
            update.sensor_type_id,
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound { entity: "sensor", id: sensor_id });
    }
    get_sensor(conn, sensor_id)
}

const SENSOR_TYPE_COLUMNS: &str = "id, name, unit, decimals, ttl_minutes";

const SENSOR_COLUMNS: &str = "id, name, sensor_type_id, protocol, topic, broker_config_id, plot_id, \
     sub_plot_id, min_threshold, max_threshold, last_value, last_reading_at, last_seen_at, state, \
     alert, active";

fn sensor_type_from_row(row: &Row<'_>) -> rusqlite::Result<SensorType> {
    Ok(SensorType {
        id: row.get(0)?,
        name: row.get(1)?,
        unit: row.get(2)?,
        decimals: row.get(3)?,
        ttl_minutes: row.get(4)?,
    })
}

fn parse_state(idx: usize, raw: String) -> rusqlite::Result<ConnectivityState> {
    ConnectivityState::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown connectivity state '{}'", raw).into(),
        )
    })
}

fn sensor_from_row(row: &Row<'_>) -> rusqlite::Result<Sensor> {
    let alert: Option<String> = row.get(14)?;
    Ok(Sensor {
        id: row.get(0)?,
        name: row.get(1)?,
        sensor_type_id: row.get(2)?,
        protocol: parse_protocol(3, row.get(3)?)?,
        topic: row.get(4)?,
        broker_config_id: row.get(5)?,
        plot_id: row.get(6)?,
        sub_plot_id: row.get(7)?,
        min_threshold: row.get(8)?,
        max_threshold: row.get(9)?,
        last_value: row.get(10)?,
        last_reading_at: row.get::<_, Option<i64>>(11)?.map(from_millis),
        last_seen_at: row.get::<_, Option<i64>>(12)?.map(from_millis),
        state: parse_state(13, row.get(13)?)?,
        alert: alert.as_deref().and_then(ThresholdAlert::parse),
        active: row.get(15)?,
    })
}
