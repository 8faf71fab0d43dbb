use crate::models::{BrokerConfig, BrokerConfigInput, Protocol};
use log::{error, info};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, ErrorCode, OptionalExtension, Row};
use std::time::Duration;
use thiserror::Error;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Busy/locked failures clear up on their own and are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            }
            StoreError::Pool(_) => true,
            _ => false,
        }
    }

    /// Turns unique-constraint violations into `Conflict`.
    pub(crate) fn from_write(err: rusqlite::Error, what: &str) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                StoreError::Conflict(format!("{} already exists", what))
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

pub struct DatabaseService {
    pool: DbPool,
}

impl DatabaseService {
    /// Opens (or creates) the database file behind a connection pool.
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            // journal_mode answers with a row.
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
        });
        let pool = r2d2::Pool::builder().max_size(8).build(manager)?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database. Every pooled connection to
    /// `:memory:` is its own database, so the pool holds exactly one.
    pub fn in_memory() -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
        Ok(Self { pool })
    }

    pub fn conn(&self) -> Result<PooledConnection, StoreError> {
        Ok(self.pool.get()?)
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS broker_configs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            broker TEXT NOT NULL,
            port INTEGER NOT NULL,
            protocol TEXT NOT NULL DEFAULT 'MQTT',
            topic_prefix TEXT NOT NULL DEFAULT '',
            default_topics TEXT NOT NULL DEFAULT '[]',
            custom_topics TEXT NOT NULL DEFAULT '[]',
            plot_id INTEGER,
            sub_plot_id INTEGER,
            username TEXT,
            password TEXT,
            active BOOLEAN NOT NULL DEFAULT 1,
            default_sensors_initialized BOOLEAN NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS sensor_types (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            unit TEXT,
            decimals INTEGER NOT NULL DEFAULT 2,
            ttl_minutes INTEGER NOT NULL DEFAULT 5
        );

        CREATE TABLE IF NOT EXISTS sensors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            sensor_type_id INTEGER NOT NULL,
            protocol TEXT NOT NULL DEFAULT 'MQTT',
            topic TEXT NOT NULL,
            broker_config_id INTEGER,
            plot_id INTEGER,
            sub_plot_id INTEGER,
            min_threshold REAL,
            max_threshold REAL,
            last_value TEXT,
            last_reading_at INTEGER,
            last_seen_at INTEGER,
            state TEXT NOT NULL DEFAULT 'DISCONNECTED',
            alert TEXT,
            active BOOLEAN NOT NULL DEFAULT 1,
            FOREIGN KEY (sensor_type_id) REFERENCES sensor_types(id),
            FOREIGN KEY (broker_config_id) REFERENCES broker_configs(id),
            UNIQUE (topic, broker_config_id)
        );

        CREATE TABLE IF NOT EXISTS readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sensor_id INTEGER NOT NULL,
            value TEXT NOT NULL,
            recorded_at INTEGER NOT NULL,
            deleted_at INTEGER,
            FOREIGN KEY (sensor_id) REFERENCES sensors(id) ON DELETE CASCADE
        );

        -- NULLs are distinct in UNIQUE, so sensors without a broker config
        -- need their own index.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sensors_unbound_topic
            ON sensors (topic) WHERE broker_config_id IS NULL;

        CREATE INDEX IF NOT EXISTS idx_readings_sensor_time
            ON readings (sensor_id, recorded_at);
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    pub fn insert_broker_config(&self, input: &BrokerConfigInput) -> Result<BrokerConfig, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO broker_configs (
                name, broker, port, protocol, topic_prefix, default_topics, custom_topics,
                plot_id, sub_plot_id, username, password, active
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                input.name,
                input.broker,
                input.port,
                input.protocol.as_str(),
                input.topic_prefix,
                encode_topics(&input.default_topics)?,
                encode_topics(&input.custom_topics)?,
                input.plot_id,
                input.sub_plot_id,
                input.username,
                input.password,
                input.active.unwrap_or(true),
            ],
        )
        .map_err(|e| StoreError::from_write(e, &format!("broker config '{}'", input.name)))?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_broker_config(id)
    }

    /// Replaces every admin-editable field. The provisioning flag is kept.
    pub fn replace_broker_config(
        &self,
        id: i64,
        input: &BrokerConfigInput,
    ) -> Result<BrokerConfig, StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                r#"
            UPDATE broker_configs SET
                name = ?2, broker = ?3, port = ?4, protocol = ?5, topic_prefix = ?6,
                default_topics = ?7, custom_topics = ?8, plot_id = ?9, sub_plot_id = ?10,
                username = ?11, password = ?12, active = COALESCE(?13, active)
            WHERE id = ?1
            "#,
                params![
                    id,
                    input.name,
                    input.broker,
                    input.port,
                    input.protocol.as_str(),
                    input.topic_prefix,
                    encode_topics(&input.default_topics)?,
                    encode_topics(&input.custom_topics)?,
                    input.plot_id,
                    input.sub_plot_id,
                    input.username,
                    input.password,
                    input.active,
                ],
            )
            .map_err(|e| StoreError::from_write(e, &format!("broker config '{}'", input.name)))?;
        if changed == 0 {
            return Err(StoreError::NotFound { entity: "broker config", id });
        }
        drop(conn);
        self.get_broker_config(id)
    }

    pub fn get_broker_config(&self, id: i64) -> Result<BrokerConfig, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM broker_configs WHERE id = ?1", BROKER_CONFIG_COLUMNS),
            params![id],
            broker_config_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound { entity: "broker config", id })
    }

    pub fn list_broker_configs(&self, active_only: bool) -> Result<Vec<BrokerConfig>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM broker_configs WHERE (?1 = 0 OR active = 1) ORDER BY id",
            BROKER_CONFIG_COLUMNS
        ))?;
        let rows = stmt.query_map(params![active_only], broker_config_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn set_broker_config_active(&self, id: i64, active: bool) -> Result<BrokerConfig, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE broker_configs SET active = ?2 WHERE id = ?1",
            params![id, active],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound { entity: "broker config", id });
        }
        drop(conn);
        self.get_broker_config(id)
    }

    pub fn mark_default_sensors_initialized(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE broker_configs SET default_sensors_initialized = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

const BROKER_CONFIG_COLUMNS: &str = "id, name, broker, port, protocol, topic_prefix, default_topics, \
     custom_topics, plot_id, sub_plot_id, username, password, active, default_sensors_initialized";

fn encode_topics(topics: &[String]) -> Result<String, StoreError> {
    serde_json::to_string(topics).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn decode_topics(idx: usize, raw: String) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_protocol(idx: usize, raw: String) -> rusqlite::Result<Protocol> {
    Protocol::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown protocol '{}'", raw).into(),
        )
    })
}

fn broker_config_from_row(row: &Row<'_>) -> rusqlite::Result<BrokerConfig> {
    Ok(BrokerConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        broker: row.get(2)?,
        port: row.get(3)?,
        protocol: parse_protocol(4, row.get(4)?)?,
        topic_prefix: row.get(5)?,
        default_topics: decode_topics(6, row.get(6)?)?,
        custom_topics: decode_topics(7, row.get(7)?)?,
        plot_id: row.get(8)?,
        sub_plot_id: row.get(9)?,
        username: row.get(10)?,
        password: row.get(11)?,
        active: row.get(12)?,
        default_sensors_initialized: row.get(13)?,
    })
}
