//! Peer roster

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{non_empty, now, Store};
use crate::error::{Error, Result};

/// Canonical column list for the peers table
const PEER_COLUMNS: &str = "id, public_key, preshared_key, private_key, allowed_ip, allowed_ip_v6, \
     keepalive, enabled, created_at, peer_index, endpoint, last_handshake, rx_bytes, tx_bytes";

/// Default page size for client listings
pub const DEFAULT_PAGE_LIMIT: u32 = 50;
/// Largest page a caller may request
pub const MAX_PAGE_LIMIT: u32 = 100;

/// A VPN client as persisted in the peer roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: i64,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    pub private_key: String,
    pub allowed_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_ip_v6: Option<String>,
    pub keepalive: u32,
    pub enabled: bool,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_handshake: Option<i64>,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
}

impl ClientRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            public_key: row.get(1)?,
            preshared_key: row.get(2)?,
            private_key: row.get(3)?,
            allowed_ip: row.get(4)?,
            allowed_ip_v6: row.get(5)?,
            keepalive: row.get(6)?,
            enabled: row.get(7)?,
            created_at: row.get(8)?,
            peer_index: row.get(9)?,
            endpoint: row.get(10)?,
            last_handshake: row.get(11)?,
            rx_bytes: row.get(12)?,
            tx_bytes: row.get(13)?,
        })
    }
}

/// Fields supplied when a client is first written
#[derive(Debug, Clone)]
pub struct NewClient {
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub private_key: String,
    pub allowed_ip: String,
    pub allowed_ip_v6: Option<String>,
    pub keepalive: u32,
}

/// One page of the peer roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientList {
    pub clients: Vec<ClientRecord>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

/// Live counters for one peer, as read from a device dump
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub last_handshake: Option<i64>,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
}

/// Clamp caller-supplied pagination onto the accepted range
pub fn normalize_page(page: i64, limit: i64) -> (u32, u32) {
    let page = if page < 1 { 1 } else { page.min(u32::MAX as i64) as u32 };
    let limit = if (1..=MAX_PAGE_LIMIT as i64).contains(&limit) {
        limit as u32
    } else {
        DEFAULT_PAGE_LIMIT
    };
    (page, limit)
}

impl Store {
    /// Insert a new client, returning its row id
    pub fn insert_client(&self, client: &NewClient) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO peers (public_key, preshared_key, private_key, allowed_ip,
                                allowed_ip_v6, keepalive, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
            params![
                client.public_key,
                non_empty(client.preshared_key.as_deref()),
                client.private_key,
                client.allowed_ip,
                non_empty(client.allowed_ip_v6.as_deref()),
                client.keepalive,
                now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Set the IPv4 address of a client
    pub fn set_client_address(&self, id: i64, allowed_ip: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE peers SET allowed_ip = ?1 WHERE id = ?2",
            params![allowed_ip, id],
        )?;
        Ok(())
    }

    /// Set the IPv6 address of a client
    pub fn set_client_address_v6(&self, id: i64, allowed_ip_v6: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE peers SET allowed_ip_v6 = ?1 WHERE id = ?2",
            params![allowed_ip_v6, id],
        )?;
        Ok(())
    }

    /// Delete a client and release every pool address it owned
    pub fn delete_client(&self, public_key: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE ip_pool SET assigned = 0, peer_id = NULL
             WHERE peer_id = (SELECT id FROM peers WHERE public_key = ?1)",
            params![public_key],
        )?;
        let deleted = tx.execute("DELETE FROM peers WHERE public_key = ?1", params![public_key])?;
        if deleted == 0 {
            return Err(Error::ClientNotFound(public_key.to_string()));
        }

        tx.commit()?;
        Ok(())
    }

    /// Get a client by public key
    pub fn client(&self, public_key: &str) -> Result<ClientRecord> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM peers WHERE public_key = ?1", PEER_COLUMNS),
            params![public_key],
            ClientRecord::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::ClientNotFound(public_key.to_string()))
    }

    /// List clients ordered by id. Out-of-range paging falls back to defaults.
    pub fn list_clients(&self, page: i64, limit: i64) -> Result<ClientList> {
        let (page, limit) = normalize_page(page, limit);
        let offset = (page as i64 - 1) * limit as i64;

        let conn = self.conn()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM peers", [], |row| row.get(0))?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM peers ORDER BY id LIMIT ?1 OFFSET ?2",
            PEER_COLUMNS
        ))?;
        let clients = stmt
            .query_map(params![limit, offset], ClientRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(ClientList {
            clients,
            total,
            page,
            limit,
        })
    }

    /// Number of clients in the roster
    pub fn client_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM peers", [], |row| row.get(0))?)
    }

    /// Every enabled client, ordered by id
    pub fn enabled_clients(&self) -> Result<Vec<ClientRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM peers WHERE enabled = 1 ORDER BY id",
            PEER_COLUMNS
        ))?;
        let clients = stmt
            .query_map([], ClientRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(clients)
    }

    /// Flip the enabled flag. The device index is always cleared.
    pub fn set_client_enabled(&self, public_key: &str, enabled: bool) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE peers SET enabled = ?1, peer_index = NULL WHERE public_key = ?2",
            params![enabled, public_key],
        )?;
        if updated == 0 {
            return Err(Error::ClientNotFound(public_key.to_string()));
        }
        Ok(())
    }

    /// Record the ephemeral device index of a live peer
    pub fn set_peer_index(&self, public_key: &str, index: Option<i64>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE peers SET peer_index = ?1 WHERE public_key = ?2",
            params![index, public_key],
        )?;
        Ok(())
    }

    /// Write live counters for one peer. Unknown keys are ignored.
    pub fn update_peer_stats(&self, stats: &PeerStats) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE peers SET endpoint = ?1, last_handshake = ?2, rx_bytes = ?3, tx_bytes = ?4
             WHERE public_key = ?5",
            params![
                non_empty(stats.endpoint.as_deref()),
                stats.last_handshake,
                stats.rx_bytes,
                stats.tx_bytes,
                stats.public_key,
            ],
        )?;
        Ok(())
    }

    /// Wipe device indexes left behind by a previous run
    pub fn clear_runtime_state(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("UPDATE peers SET peer_index = NULL", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::temp_store;

    fn new_client(key: &str, ip: &str) -> NewClient {
        NewClient {
            public_key: key.to_string(),
            preshared_key: Some("cc".repeat(32)),
            private_key: "dd".repeat(32),
            allowed_ip: ip.to_string(),
            allowed_ip_v6: None,
            keepalive: 25,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let (_dir, store) = temp_store();
        let id = store.insert_client(&new_client("k1", "10.8.0.2/32")).unwrap();

        let client = store.client("k1").unwrap();
        assert_eq!(client.id, id);
        assert!(client.enabled);
        assert_eq!(client.keepalive, 25);
        assert_eq!(client.rx_bytes, 0);
        assert!(client.peer_index.is_none());

        assert!(matches!(store.client("missing"), Err(Error::ClientNotFound(_))));
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let (_dir, store) = temp_store();
        store.insert_client(&new_client("k1", "10.8.0.2/32")).unwrap();
        let err = store.insert_client(&new_client("k1", "10.8.0.3/32")).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_pagination_defaults() {
        let (_dir, store) = temp_store();
        for i in 0..5 {
            store
                .insert_client(&new_client(&format!("k{}", i), &format!("10.8.0.{}/32", i + 2)))
                .unwrap();
        }

        let list = store.list_clients(0, 0).unwrap();
        assert_eq!((list.page, list.limit, list.total), (1, 50, 5));
        assert_eq!(list.clients.len(), 5);

        let list = store.list_clients(2, 2).unwrap();
        assert_eq!(list.clients.len(), 2);
        assert_eq!(list.clients[0].public_key, "k2");

        assert_eq!(normalize_page(-3, 101), (1, DEFAULT_PAGE_LIMIT));
        assert_eq!(normalize_page(4, 100), (4, 100));
    }

    #[test]
    fn test_enable_clears_index() {
        let (_dir, store) = temp_store();
        store.insert_client(&new_client("k1", "10.8.0.2/32")).unwrap();
        store.set_peer_index("k1", Some(7)).unwrap();

        store.set_client_enabled("k1", false).unwrap();
        let client = store.client("k1").unwrap();
        assert!(!client.enabled);
        assert!(client.peer_index.is_none());
        assert_eq!(store.enabled_clients().unwrap().len(), 0);

        assert!(matches!(
            store.set_client_enabled("nope", true),
            Err(Error::ClientNotFound(_))
        ));
    }

    #[test]
    fn test_stats_and_runtime_reset() {
        let (_dir, store) = temp_store();
        store.insert_client(&new_client("k1", "10.8.0.2/32")).unwrap();
        store.set_peer_index("k1", Some(3)).unwrap();

        store
            .update_peer_stats(&PeerStats {
                public_key: "k1".into(),
                endpoint: Some("203.0.113.9:40000".into()),
                last_handshake: Some(1_700_000_123),
                rx_bytes: 1024,
                tx_bytes: 2048,
            })
            .unwrap();
        store.clear_runtime_state().unwrap();

        let client = store.client("k1").unwrap();
        assert_eq!(client.endpoint.as_deref(), Some("203.0.113.9:40000"));
        assert_eq!(client.last_handshake, Some(1_700_000_123));
        assert_eq!((client.rx_bytes, client.tx_bytes), (1024, 2048));
        assert!(client.peer_index.is_none());
    }

    #[test]
    fn test_delete_missing_client() {
        let (_dir, store) = temp_store();
        assert!(matches!(store.delete_client("k9"), Err(Error::ClientNotFound(_))));
    }
}
