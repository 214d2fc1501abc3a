//! Key-value storage adapter and the persisted selection record.

use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::clock::millis;
use crate::constants::STORAGE_PREFIX;
use crate::error::Result;

/// Trait for durable key-value backends.
///
/// Implementations must be thread-safe (`Send + Sync`).
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// In-memory storage backed by DashMap. Fast but lost on restart.
#[derive(Default)]
pub struct InMemoryStorage {
    values: DashMap<String, String>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Persistent storage backed by SQLite. Survives restarts and is safe to
/// share between processes (WAL journal).
pub struct SqliteStorage {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at the given path.
    ///
    /// On Unix systems, the database file permissions are restricted to 0600.
    pub fn open(path: &str) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            PRAGMA journal_mode=WAL;",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(
                    path = %path,
                    error = %e,
                    "failed to set storage database file permissions to 0600"
                );
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("storage mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Storage for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, value, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }
}

/// Durable record of the last primary chosen for a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRecord {
    pub rpc_url: String,
    pub timestamp_millis: i64,
}

/// Storage key for a chain's selection. The tier is part of the key so
/// private and public accounts never read each other's choice.
pub fn selection_key(chain_id: &str, prefer_private: bool) -> String {
    let tier = if prefer_private { "private" } else { "public" };
    format!("{STORAGE_PREFIX}:{chain_id}:{tier}")
}

/// Read a cached primary that is still within `ttl`.
///
/// Missing, unreadable, malformed, and expired records all mean "no cached
/// selection".
pub fn load_selection(
    storage: &dyn Storage,
    key: &str,
    now_millis: i64,
    ttl: Duration,
) -> Option<String> {
    let raw = match storage.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "failed to read cached selection");
            return None;
        }
    };

    let record: SelectionRecord = match serde_json::from_str(&raw) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "ignoring malformed cached selection");
            return None;
        }
    };

    let age = now_millis.saturating_sub(record.timestamp_millis);
    if age < 0 {
        tracing::warn!(key = %key, age_ms = age, "ignoring cached selection dated in the future");
        return None;
    }
    if age > millis(ttl) || record.rpc_url.is_empty() {
        tracing::debug!(key = %key, age_ms = age, "cached selection expired");
        return None;
    }
    Some(record.rpc_url)
}

/// Persist `rpc_url` as the chain's current primary.
pub fn store_selection(
    storage: &dyn Storage,
    key: &str,
    rpc_url: &str,
    now_millis: i64,
) -> Result<()> {
    let record = SelectionRecord {
        rpc_url: rpc_url.to_string(),
        timestamp_millis: now_millis,
    };
    storage.set(key, &serde_json::to_string(&record)?)
}
