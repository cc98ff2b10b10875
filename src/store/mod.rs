//! Persistent Store
//!
//! Embedded SQLite database holding the five durable record sets: device
//! identity, peer roster, IP pool, server configuration and the multihop
//! tunnel roster. It is the only state surviving a process restart and the
//! sole input to crash recovery.

mod device;
mod multihop;
mod peers;
mod pool;
mod server;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;

use crate::error::{Error, Result};

pub use device::DeviceRecord;
pub use multihop::{validate_allowed_ips, MultihopTunnel, MultihopUpdate, NewMultihopTunnel, TunnelStatus};
pub use peers::{ClientList, ClientRecord, NewClient, PeerStats};
pub use pool::{expand_subnet, AddressFamily, PoolUsage};
pub use server::ServerConfig;

/// Current schema version (`PRAGMA user_version`)
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS device (
    id              INTEGER PRIMARY KEY CHECK (id = 1),
    name            TEXT NOT NULL,
    private_key     TEXT NOT NULL,
    public_key      TEXT NOT NULL,
    listen_port     INTEGER NOT NULL,
    started_at      INTEGER
);

CREATE TABLE IF NOT EXISTS peers (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    public_key      TEXT NOT NULL UNIQUE,
    preshared_key   TEXT,
    private_key     TEXT NOT NULL,
    allowed_ip      TEXT NOT NULL UNIQUE,
    allowed_ip_v6   TEXT UNIQUE,
    keepalive       INTEGER NOT NULL DEFAULT 25,
    enabled         INTEGER NOT NULL DEFAULT 1,
    created_at      INTEGER NOT NULL,
    peer_index      INTEGER,
    endpoint        TEXT,
    last_handshake  INTEGER,
    rx_bytes        INTEGER NOT NULL DEFAULT 0,
    tx_bytes        INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS ip_pool (
    ip              TEXT NOT NULL UNIQUE,
    family          INTEGER NOT NULL DEFAULT 4,
    assigned        INTEGER NOT NULL DEFAULT 0,
    peer_id         INTEGER,
    FOREIGN KEY (peer_id) REFERENCES peers(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_ip_pool_free ON ip_pool(family, assigned);

CREATE TABLE IF NOT EXISTS server_config (
    device_id       INTEGER PRIMARY KEY DEFAULT 1,
    endpoint        TEXT,
    endpoint_v6     TEXT,
    network         TEXT NOT NULL DEFAULT '10.8.0.0/24',
    network_v6      TEXT,
    dns_primary     TEXT NOT NULL DEFAULT '1.1.1.1',
    dns_secondary   TEXT DEFAULT '9.9.9.9',
    dns_v6          TEXT,
    mtu             INTEGER NOT NULL DEFAULT 1420,
    fwmark          INTEGER NOT NULL DEFAULT 0,
    post_up         TEXT,
    post_down       TEXT,
    FOREIGN KEY (device_id) REFERENCES device(id)
);

CREATE TABLE IF NOT EXISTS multihop_tunnels (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    name                 TEXT NOT NULL UNIQUE,
    enabled              INTEGER NOT NULL DEFAULT 0,
    interface_name       TEXT NOT NULL UNIQUE,
    listen_port          INTEGER NOT NULL DEFAULT 0,
    private_key          TEXT NOT NULL,
    public_key           TEXT NOT NULL,
    remote_endpoint      TEXT NOT NULL,
    remote_public_key    TEXT NOT NULL,
    remote_preshared_key TEXT,
    remote_allowed_ips   TEXT NOT NULL DEFAULT '0.0.0.0/0',
    remote_keepalive     INTEGER NOT NULL DEFAULT 25,
    fwmark               INTEGER NOT NULL DEFAULT 0,
    routing_table        TEXT NOT NULL DEFAULT 'wolfbridge_multihop',
    routing_table_id     INTEGER NOT NULL DEFAULT 100,
    priority             INTEGER NOT NULL DEFAULT 100,
    status               TEXT NOT NULL DEFAULT 'stopped',
    error_msg            TEXT,
    started_at           INTEGER,
    created_at           INTEGER NOT NULL
);
"#;

/// Nullable columns added after the first release. Older files get them
/// through `ALTER TABLE ... ADD COLUMN` on open; nothing is ever dropped.
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("peers", "allowed_ip_v6", "TEXT"),
    ("peers", "peer_index", "INTEGER"),
    ("server_config", "endpoint_v6", "TEXT"),
    ("server_config", "network_v6", "TEXT"),
    ("server_config", "dns_v6", "TEXT"),
    ("server_config", "post_up", "TEXT"),
    ("server_config", "post_down", "TEXT"),
    ("multihop_tunnels", "remote_preshared_key", "TEXT"),
    ("multihop_tunnels", "error_msg", "TEXT"),
];

/// Record counts used for status reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub has_device: bool,
    pub has_config: bool,
    pub peer_count: i64,
    pub multihop_count: i64,
}

/// Persistent bridge store backed by SQLite
pub struct Store {
    /// Database connection
    conn: Mutex<Connection>,
    /// Path of the database file
    path: PathBuf,
}

impl Store {
    /// Create or open the bridge database
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::StoreOpen(format!("{}: {}", parent.display(), e)))?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::StoreOpen(format!("{}: {}", path.display(), e)))?;
        Self::prepare(&conn, busy_timeout)
            .map_err(|e| Error::StoreOpen(format!("{}: {}", path.display(), e)))?;

        tracing::debug!("Store opened at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    fn prepare(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Self::migrate(conn)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    fn migrate(conn: &Connection) -> rusqlite::Result<()> {
        for (table, column, decl) in ADDITIVE_COLUMNS {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
            let columns = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            if !columns.iter().any(|c| c == column) {
                tracing::info!("Migrating store: adding {}.{}", table, column);
                conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    table, column, decl
                ))?;
            }
        }
        Ok(())
    }

    /// Lock the connection
    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("store connection lock poisoned".into()))
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schema version recorded in the file
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.conn()?;
        let version = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    /// Presence flags and record counts
    pub fn summary(&self) -> Result<StoreSummary> {
        let conn = self.conn()?;
        let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };

        Ok(StoreSummary {
            has_device: count("SELECT COUNT(*) FROM device WHERE id = 1")? > 0,
            has_config: count("SELECT COUNT(*) FROM server_config WHERE device_id = 1")? > 0,
            peer_count: count("SELECT COUNT(*) FROM peers")?,
            multihop_count: count("SELECT COUNT(*) FROM multihop_tunnels")?,
        })
    }

    /// Close the connection, flushing the WAL
    pub fn close(self) -> Result<()> {
        let conn = self
            .conn
            .into_inner()
            .map_err(|_| Error::Internal("store connection lock poisoned".into()))?;
        conn.close().map_err(|(_, e)| Error::from(e))
    }
}

/// Current Unix time in seconds
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Map empty strings to NULL
pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    /// Open a throwaway store; keep the TempDir alive for the test's duration
    pub(crate) fn temp_store() -> (TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("bridge.db"), Duration::from_secs(5)).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_creates_schema() {
        let (_dir, store) = temp_store();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);

        let summary = store.summary().unwrap();
        assert_eq!(summary, StoreSummary::default());
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("bridge.db");

        let store = Store::open(&path, Duration::from_secs(1)).unwrap();
        store
            .upsert_device("wg0", &"11".repeat(32), &"22".repeat(32), 51820)
            .unwrap();
        store.close().unwrap();

        let store = Store::open(&path, Duration::from_secs(1)).unwrap();
        assert!(store.summary().unwrap().has_device);
    }

    #[test]
    fn test_pragmas_applied() {
        let (_dir, store) = temp_store();
        let conn = store.conn().unwrap();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
        let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0)).unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_additive_migration_on_old_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE server_config (
                    device_id INTEGER PRIMARY KEY DEFAULT 1,
                    endpoint TEXT,
                    network TEXT NOT NULL DEFAULT '10.8.0.0/24',
                    dns_primary TEXT NOT NULL DEFAULT '1.1.1.1',
                    dns_secondary TEXT,
                    mtu INTEGER NOT NULL DEFAULT 1420,
                    fwmark INTEGER NOT NULL DEFAULT 0
                );",
            )
            .unwrap();
        }

        let store = Store::open(&path, Duration::from_secs(1)).unwrap();
        let conn = store.conn().unwrap();
        let columns: Vec<String> = conn
            .prepare("PRAGMA table_info(server_config)")
            .unwrap()
            .query_map([], |row| row.get(1))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert!(columns.iter().any(|c| c == "network_v6"));
        assert!(columns.iter().any(|c| c == "post_down"));
    }

    #[test]
    fn test_open_failure_is_store_open() {
        let dir = tempdir().unwrap();
        // A directory cannot be opened as a database file
        let err = Store::open(dir.path(), Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, Error::StoreOpen(_)));
    }
}
