//! SQLite store behind the rendezvous directory

use crate::directory::{HistoryEntry, PeerAddress};
use crate::{Error, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

/// One row of the request log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLogEntry {
    /// HTTP method
    pub method: String,
    /// Request path without query
    pub path: String,
    /// Status code that was answered
    pub status: u16,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

/// Peers, friendships, messages and the request log
pub struct DirectoryStore {
    conn: Connection,
}

impl DirectoryStore {
    /// Open (or create) the database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Storage(format!("Failed to create database directory: {}", e)))?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a throwaway in-memory database
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS peers (
                username TEXT PRIMARY KEY,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                last_seen INTEGER NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS friendships (
                owner TEXT NOT NULL,
                friend TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (owner, friend),
                FOREIGN KEY (owner) REFERENCES peers(username),
                FOREIGN KEY (friend) REFERENCES peers(username)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender TEXT NOT NULL,
                receiver TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(sender, receiver)",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS request_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                status INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    // ========== Peers ==========

    /// Insert or update a registration; returns `true` when it was new
    pub fn upsert_peer(&self, username: &str, ip: &str, port: u16) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let updated = self.conn.execute(
            "UPDATE peers SET ip = ?2, port = ?3, last_seen = ?4 WHERE username = ?1",
            params![username, ip, port, now],
        )?;
        if updated > 0 {
            debug!("Updated registration for {}", username);
            return Ok(false);
        }

        self.conn.execute(
            "INSERT INTO peers (username, ip, port, last_seen) VALUES (?1, ?2, ?3, ?4)",
            params![username, ip, port, now],
        )?;
        debug!("Created registration for {}", username);
        Ok(true)
    }

    /// Registration of `username`
    pub fn peer(&self, username: &str) -> Result<Option<PeerAddress>> {
        let peer = self
            .conn
            .query_row(
                "SELECT username, ip, port FROM peers WHERE username = ?1",
                params![username],
                |row| {
                    Ok(PeerAddress {
                        username: row.get(0)?,
                        ip: row.get(1)?,
                        port: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(peer)
    }

    /// Every registered username, sorted
    pub fn peers(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT username FROM peers ORDER BY username")?;
        let peers = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(peers)
    }

    // ========== Friendships ==========

    /// Record `owner -> friend`; repeating it changes nothing
    pub fn add_friendship(&self, owner: &str, friend: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO friendships (owner, friend, created_at) VALUES (?1, ?2, ?3)",
            params![owner, friend, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Friends recorded for `owner`, in the order they were added
    pub fn friends(&self, owner: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT friend FROM friendships WHERE owner = ?1 ORDER BY created_at, rowid")?;
        let friends = stmt
            .query_map(params![owner], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(friends)
    }

    // ========== Messages ==========

    /// Persist one chat line and return its id
    pub fn add_message(&self, sender: &str, receiver: &str, content: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO messages (sender, receiver, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![sender, receiver, content, Utc::now().timestamp_millis()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Messages in either direction between `a` and `b`, oldest first
    pub fn messages_between(&self, a: &str, b: &str) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT content, sender FROM messages
             WHERE (sender = ?1 AND receiver = ?2) OR (sender = ?2 AND receiver = ?1)
             ORDER BY timestamp ASC, id ASC",
        )?;

        let messages = stmt
            .query_map(params![a, b], |row| {
                Ok(HistoryEntry {
                    content: row.get(0)?,
                    from: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    // ========== Request log ==========

    /// Append one handled request to the log
    pub fn log_request(&self, method: &str, path: &str, status: u16) -> Result<()> {
        self.conn.execute(
            "INSERT INTO request_log (method, path, status, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![method, path, status, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Number of logged requests for `method path`
    pub fn request_count(&self, method: &str, path: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM request_log WHERE method = ?1 AND path = ?2",
            params![method, path],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// The most recent `limit` log entries, newest first
    pub fn request_logs(&self, limit: usize) -> Result<Vec<RequestLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT method, path, status, timestamp FROM request_log ORDER BY id DESC LIMIT ?1",
        )?;

        let entries = stmt
            .query_map(params![limit as i64], |row| {
                Ok(RequestLogEntry {
                    method: row.get(0)?,
                    path: row.get(1)?,
                    status: row.get(2)?,
                    timestamp: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}
