//! # Storage Module - Node Tracking
//!
//! Persists what the gateway has learned about mesh nodes in a single SQLite table:
//!
//! ```text
//! nodes(node_id, long_name, short_name, last_heard, latitude, longitude, welcome_message_sent)
//! ```
//!
//! Every observed packet refreshes `last_heard`; NodeInfo and Position packets fill in
//! names and coordinates. Updates merge: a field left as `None` in a [`NodeUpdate`] keeps
//! the stored value. The store also remembers whether a node has been sent the welcome
//! message so it is sent at most once per node.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshgate::storage::{NodeStore, NodeUpdate};
//!
//! fn main() -> anyhow::Result<()> {
//!     let store = NodeStore::open("data/nodes.sqlite")?;
//!     store.upsert(&NodeUpdate::heard(0x7f4dbc79).with_names(Some("Alice"), Some("AL")))?;
//!     assert_eq!(store.display_name(0x7f4dbc79)?, "Alice");
//!     Ok(())
//! }
//! ```
//!
//! The connection sits behind a `std::sync::Mutex`; every call holds it only for one
//! short statement, so it is safe to call from async tasks.

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Serialize, Serializer};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::meshtastic::fmt_node_id;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("node store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Fields learned from one packet. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub node_id: u32,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl NodeUpdate {
    /// Update that only refreshes `last_heard`.
    pub fn heard(node_id: u32) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn with_names(mut self, long_name: Option<&str>, short_name: Option<&str>) -> Self {
        let clean = |s: Option<&str>| s.map(str::trim).filter(|s| !s.is_empty()).map(String::from);
        self.long_name = clean(long_name);
        self.short_name = clean(short_name);
        self
    }

    pub fn with_position(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRecord {
    #[serde(serialize_with = "serialize_node_id")]
    pub node_id: u32,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub last_heard: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub welcome_message_sent: bool,
}

fn serialize_node_id<S: Serializer>(id: &u32, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&fmt_node_id(*id))
}

pub struct NodeStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStore").finish_non_exhaustive()
    }
}

fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS nodes (
            node_id INTEGER PRIMARY KEY,
            long_name TEXT,
            short_name TEXT,
            last_heard INTEGER NOT NULL,
            latitude REAL,
            longitude REAL,
            welcome_message_sent INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_nodes_last_heard ON nodes(last_heard)",
        [],
    )?;
    Ok(())
}

fn parse_node_row(row: &rusqlite::Row) -> rusqlite::Result<NodeRecord> {
    let node_id: i64 = row.get(0)?;
    let last_heard: i64 = row.get(3)?;
    let welcomed: i64 = row.get(6)?;
    Ok(NodeRecord {
        node_id: node_id as u32,
        long_name: row.get(1)?,
        short_name: row.get(2)?,
        last_heard: Utc
            .timestamp_opt(last_heard, 0)
            .single()
            .unwrap_or_default(),
        latitude: row.get(4)?,
        longitude: row.get(5)?,
        welcome_message_sent: welcomed != 0,
    })
}

impl NodeStore {
    /// Open (or create) the database file, creating parent directories as needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        create_tables(&conn)?;
        info!("Node database ready at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Insert or merge a node, setting `last_heard` to now.
    pub fn upsert(&self, update: &NodeUpdate) -> Result<()> {
        self.upsert_at(update, Utc::now())
    }

    pub fn upsert_at(&self, update: &NodeUpdate, heard_at: DateTime<Utc>) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO nodes (node_id, long_name, short_name, last_heard, latitude, longitude)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(node_id) DO UPDATE SET
                long_name = COALESCE(excluded.long_name, long_name),
                short_name = COALESCE(excluded.short_name, short_name),
                last_heard = excluded.last_heard,
                latitude = COALESCE(excluded.latitude, latitude),
                longitude = COALESCE(excluded.longitude, longitude)",
            params![
                update.node_id as i64,
                update.long_name,
                update.short_name,
                heard_at.timestamp(),
                update.latitude,
                update.longitude,
            ],
        )?;
        debug!("Updated node {}", fmt_node_id(update.node_id));
        Ok(())
    }

    pub fn get(&self, node_id: u32) -> Result<Option<NodeRecord>> {
        let record = self
            .conn()?
            .query_row(
                "SELECT node_id, long_name, short_name, last_heard, latitude, longitude,
                        welcome_message_sent
                 FROM nodes WHERE node_id = ?1",
                params![node_id as i64],
                parse_node_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Best known name: long name, then short name. `None` when neither is known.
    pub fn lookup_name(&self, node_id: u32) -> Result<Option<String>> {
        let names: Option<(Option<String>, Option<String>)> = self
            .conn()?
            .query_row(
                "SELECT long_name, short_name FROM nodes WHERE node_id = ?1",
                params![node_id as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(names.and_then(|(long, short)| long.or(short)))
    }

    /// Name for display, falling back to `!xxxxxxxx`.
    pub fn display_name(&self, node_id: u32) -> Result<String> {
        Ok(self
            .lookup_name(node_id)?
            .unwrap_or_else(|| fmt_node_id(node_id)))
    }

    /// Find a node by exact long or short name. The most recently heard match wins.
    pub fn lookup_id(&self, name: &str) -> Result<Option<u32>> {
        let id: Option<i64> = self
            .conn()?
            .query_row(
                "SELECT node_id FROM nodes WHERE long_name = ?1 OR short_name = ?1
                 ORDER BY last_heard DESC LIMIT 1",
                params![name.trim()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(|id| id as u32))
    }

    /// True while the node has not been sent the welcome message, including nodes
    /// with no row yet.
    pub fn is_first_observation(&self, node_id: u32) -> Result<bool> {
        let welcomed: Option<i64> = self
            .conn()?
            .query_row(
                "SELECT welcome_message_sent FROM nodes WHERE node_id = ?1",
                params![node_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(welcomed.map_or(true, |w| w == 0))
    }

    pub fn mark_welcome_sent(&self, node_id: u32) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO nodes (node_id, last_heard, welcome_message_sent)
             VALUES (?1, ?2, 1)
             ON CONFLICT(node_id) DO UPDATE SET welcome_message_sent = 1",
            params![node_id as i64, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Every known node, most recently heard first.
    pub fn all_nodes(&self) -> Result<Vec<NodeRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, long_name, short_name, last_heard, latitude, longitude,
                    welcome_message_sent
             FROM nodes ORDER BY last_heard DESC, node_id ASC",
        )?;
        let rows = stmt.query_map([], parse_node_row)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }
        Ok(nodes)
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}
