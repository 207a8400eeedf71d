use std::collections::BTreeMap;
use std::time::Duration;

use chrono::prelude::*;
use log::{debug, info};
use rusqlite::{params, Connection};

use crate::sinks::*;

pub const DEFAULT_DB_PATH: &str = "./kflow_db.sqlite";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_JOURNAL_MODE: &str = "WAL";
pub const IN_MEMORY: &str = ":memory:";

/// Opens the database named by `path` in `props` and makes sure the
/// flows table exists. Recognised props: `path`, `busy_timeout.ms`,
/// `journal_mode`.
pub fn setup_db(props: &BTreeMap<String, String>) -> Result<Connection, SinkError> {
    let path = props.get("path").map(String::as_str).unwrap_or(DEFAULT_DB_PATH);
    let db_conn = if path == IN_MEMORY {
        Connection::open_in_memory()?
    } else {
        Connection::open(path)?
    };

    let busy_timeout = match props.get("busy_timeout.ms") {
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| SinkError::InvalidConfig(format!("busy_timeout.ms: {value:?} is not a number")))?,
        None => DEFAULT_BUSY_TIMEOUT_MS,
    };
    db_conn.busy_timeout(Duration::from_millis(busy_timeout))?;

    let journal_mode = props
        .get("journal_mode")
        .map(String::as_str)
        .unwrap_or(DEFAULT_JOURNAL_MODE);
    if journal_mode.is_empty() || !journal_mode.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(SinkError::InvalidConfig(format!("journal_mode: {journal_mode:?}")));
    }
    //in-memory databases only know "memory"
    if path != IN_MEMORY {
        let mode: String = db_conn.pragma_update_and_check(None, "journal_mode", journal_mode, |row| row.get(0))?;
        debug!("Database {path} journal mode is {mode}");
    }

    db_conn.execute(
        "CREATE TABLE IF NOT EXISTS flows (
        id INTEGER PRIMARY KEY,
        topic TEXT NOT NULL,
        payload TEXT NOT NULL,
        received_at INTEGER NOT NULL
        )",
        [],
    )?;

    info!("Opened flow database {path}");
    Ok(db_conn)
}

pub fn insert_payload_in_db(db_conn: &Connection, topic: &str, payload: &[u8]) -> Result<(), SinkError> {
    let received_at = Utc::now().timestamp_millis();
    db_conn.execute(
        "INSERT INTO flows (topic, payload, received_at) VALUES (?1, ?2, ?3)",
        params![topic, String::from_utf8_lossy(payload), received_at],
    )?;
    Ok(())
}

/// Most recent payloads for `topic`, newest first.
pub fn get_payloads_from_db(db_conn: &Connection, topic: &str, limit: usize) -> Result<Vec<String>, SinkError> {
    let mut stmt = db_conn.prepare("SELECT payload FROM flows WHERE topic = ?1 ORDER BY id DESC LIMIT ?2")?;
    let rows = stmt.query_map(params![topic, limit as i64], |row| row.get::<_, String>(0))?;
    let mut payloads = Vec::new();
    for payload in rows {
        payloads.push(payload?);
    }
    Ok(payloads)
}

pub fn count_flows_in_db(db_conn: &Connection) -> Result<u64, SinkError> {
    let count: i64 = db_conn.query_row("SELECT COUNT(*) FROM flows", [], |row| row.get(0))?;
    Ok(count as u64)
}

/// Publishes each payload as a row of the `flows` table.
pub struct SqlitePublisher {
    db_conn: Option<Connection>,
}

impl SqlitePublisher {
    pub fn open(props: &BTreeMap<String, String>) -> Result<Self, SinkError> {
        Ok(Self::from_connection(setup_db(props)?))
    }

    pub fn from_connection(db_conn: Connection) -> Self {
        SqlitePublisher { db_conn: Some(db_conn) }
    }

    /// `None` once the publisher has been closed.
    pub fn connection(&self) -> Option<&Connection> {
        self.db_conn.as_ref()
    }
}

impl FlowPublisher for SqlitePublisher {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SinkError> {
        match &self.db_conn {
            Some(db_conn) => insert_payload_in_db(db_conn, topic, payload),
            None => Err(SinkError::InvalidConfig("publisher is closed".to_string())),
        }
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(db_conn) = self.db_conn.take() {
            db_conn.close().map_err(|(_, e)| SinkError::Sqlite(e))?;
        }
        Ok(())
    }
}
