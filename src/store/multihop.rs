//! Multihop tunnel roster

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{non_empty, now, Store};
use crate::error::{Error, Result};

const TUNNEL_COLUMNS: &str = "id, name, enabled, interface_name, listen_port, private_key, public_key, \
     remote_endpoint, remote_public_key, remote_preshared_key, remote_allowed_ips, remote_keepalive, \
     fwmark, routing_table, routing_table_id, priority, status, error_msg, started_at, created_at";

/// Last observed outcome of a tunnel. Reset to `Stopped` on every start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Stopped,
    Running,
    Error,
}

impl TunnelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelStatus::Stopped => "stopped",
            TunnelStatus::Running => "running",
            TunnelStatus::Error => "error",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stopped" => Ok(TunnelStatus::Stopped),
            "running" => Ok(TunnelStatus::Running),
            "error" => Ok(TunnelStatus::Error),
            other => Err(Error::StoreQuery(format!("unknown tunnel status: {}", other))),
        }
    }
}

impl ToSql for TunnelStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TunnelStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
    }
}

/// An upstream tunnel in a multihop chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultihopTunnel {
    pub id: i64,
    pub name: String,
    /// Durable intent: restored by crash recovery when set
    pub enabled: bool,
    pub interface_name: String,
    pub listen_port: u16,
    pub private_key: String,
    pub public_key: String,
    pub remote_endpoint: String,
    pub remote_public_key: String,
    pub remote_preshared_key: Option<String>,
    pub remote_allowed_ips: String,
    pub remote_keepalive: u32,
    pub fwmark: u32,
    pub routing_table: String,
    pub routing_table_id: u32,
    pub priority: u32,
    pub status: TunnelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    pub created_at: i64,
}

impl MultihopTunnel {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            enabled: row.get(2)?,
            interface_name: row.get(3)?,
            listen_port: row.get(4)?,
            private_key: row.get(5)?,
            public_key: row.get(6)?,
            remote_endpoint: row.get(7)?,
            remote_public_key: row.get(8)?,
            remote_preshared_key: row.get(9)?,
            remote_allowed_ips: row.get(10)?,
            remote_keepalive: row.get(11)?,
            fwmark: row.get(12)?,
            routing_table: row.get(13)?,
            routing_table_id: row.get(14)?,
            priority: row.get(15)?,
            status: row.get(16)?,
            error_msg: row.get(17)?,
            started_at: row.get(18)?,
            created_at: row.get(19)?,
        })
    }

    /// Remote allowed ranges, one per entry
    pub fn allowed_ranges(&self) -> impl Iterator<Item = &str> {
        self.remote_allowed_ips
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }
}

/// Check a comma-separated list of CIDR ranges; at least one is required
pub fn validate_allowed_ips(list: &str) -> Result<()> {
    let mut count = 0;
    for range in list.split(',').map(str::trim).filter(|r| !r.is_empty()) {
        range
            .parse::<ipnet::IpNet>()
            .map_err(|e| Error::InvalidParam(format!("allowed range {}: {}", range, e)))?;
        count += 1;
    }
    if count == 0 {
        return Err(Error::InvalidParam("at least one allowed range is required".into()));
    }
    Ok(())
}

/// Fields supplied when a tunnel is created
#[derive(Debug, Clone)]
pub struct NewMultihopTunnel {
    pub name: String,
    pub interface_name: String,
    pub listen_port: u16,
    pub private_key: String,
    pub public_key: String,
    pub remote_endpoint: String,
    pub remote_public_key: String,
    pub remote_preshared_key: Option<String>,
    pub remote_allowed_ips: String,
    pub remote_keepalive: u32,
    pub fwmark: u32,
    pub routing_table: String,
    pub routing_table_id: u32,
    pub priority: u32,
}

/// Partial update of a tunnel's configuration. Absent fields are kept;
/// an empty `remote_preshared_key` clears it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MultihopUpdate {
    pub listen_port: Option<u16>,
    pub remote_endpoint: Option<String>,
    pub remote_public_key: Option<String>,
    pub remote_preshared_key: Option<String>,
    pub remote_allowed_ips: Option<String>,
    pub remote_keepalive: Option<u32>,
    pub fwmark: Option<u32>,
    pub routing_table: Option<String>,
    pub routing_table_id: Option<u32>,
    pub priority: Option<u32>,
}

impl MultihopUpdate {
    /// Apply the update onto an existing record
    pub fn apply(self, tunnel: &mut MultihopTunnel) {
        if let Some(v) = self.listen_port {
            tunnel.listen_port = v;
        }
        if let Some(v) = self.remote_endpoint {
            tunnel.remote_endpoint = v;
        }
        if let Some(v) = self.remote_public_key {
            tunnel.remote_public_key = v;
        }
        if let Some(v) = self.remote_preshared_key {
            tunnel.remote_preshared_key = non_empty(Some(v.as_str())).map(str::to_string);
        }
        if let Some(v) = self.remote_allowed_ips {
            tunnel.remote_allowed_ips = v;
        }
        if let Some(v) = self.remote_keepalive {
            tunnel.remote_keepalive = v;
        }
        if let Some(v) = self.fwmark {
            tunnel.fwmark = v;
        }
        if let Some(v) = self.routing_table {
            tunnel.routing_table = v;
        }
        if let Some(v) = self.routing_table_id {
            tunnel.routing_table_id = v;
        }
        if let Some(v) = self.priority {
            tunnel.priority = v;
        }
    }
}

impl Store {
    /// Insert a new tunnel (disabled, stopped) and return the stored record
    pub fn insert_multihop_tunnel(&self, tunnel: &NewMultihopTunnel) -> Result<MultihopTunnel> {
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO multihop_tunnels
                    (name, enabled, interface_name, listen_port, private_key, public_key,
                     remote_endpoint, remote_public_key, remote_preshared_key,
                     remote_allowed_ips, remote_keepalive, fwmark, routing_table,
                     routing_table_id, priority, status, created_at)
                 VALUES (?1, 0, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    tunnel.name,
                    tunnel.interface_name,
                    tunnel.listen_port,
                    tunnel.private_key,
                    tunnel.public_key,
                    tunnel.remote_endpoint,
                    tunnel.remote_public_key,
                    non_empty(tunnel.remote_preshared_key.as_deref()),
                    tunnel.remote_allowed_ips,
                    tunnel.remote_keepalive,
                    tunnel.fwmark,
                    tunnel.routing_table,
                    tunnel.routing_table_id,
                    tunnel.priority,
                    TunnelStatus::Stopped,
                    now(),
                ],
            )?;
        }
        self.multihop_tunnel(&tunnel.name)
    }

    /// Get a tunnel by name
    pub fn multihop_tunnel(&self, name: &str) -> Result<MultihopTunnel> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM multihop_tunnels WHERE name = ?1", TUNNEL_COLUMNS),
            params![name],
            MultihopTunnel::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::TunnelNotFound(name.to_string()))
    }

    /// Every tunnel, ordered by id
    pub fn list_multihop_tunnels(&self) -> Result<Vec<MultihopTunnel>> {
        self.query_tunnels(&format!(
            "SELECT {} FROM multihop_tunnels ORDER BY id",
            TUNNEL_COLUMNS
        ))
    }

    /// Tunnels flagged for restore, in rule priority order
    pub fn enabled_multihop_tunnels(&self) -> Result<Vec<MultihopTunnel>> {
        self.query_tunnels(&format!(
            "SELECT {} FROM multihop_tunnels WHERE enabled = 1 ORDER BY priority, id",
            TUNNEL_COLUMNS
        ))
    }

    fn query_tunnels(&self, sql: &str) -> Result<Vec<MultihopTunnel>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let tunnels = stmt
            .query_map([], MultihopTunnel::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tunnels)
    }

    /// Number of tunnels in the roster
    pub fn multihop_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM multihop_tunnels", [], |row| row.get(0))?)
    }

    /// Delete a tunnel
    pub fn delete_multihop_tunnel(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM multihop_tunnels WHERE name = ?1", params![name])?;
        if deleted == 0 {
            return Err(Error::TunnelNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Set the durable restore intent
    pub fn set_multihop_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE multihop_tunnels SET enabled = ?1 WHERE name = ?2",
            params![enabled, name],
        )?;
        if updated == 0 {
            return Err(Error::TunnelNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Record the runtime outcome of a tunnel
    pub fn set_multihop_status(
        &self,
        name: &str,
        status: TunnelStatus,
        error_msg: Option<&str>,
        started_at: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE multihop_tunnels SET status = ?1, error_msg = ?2, started_at = ?3
             WHERE name = ?4",
            params![status, non_empty(error_msg), started_at, name],
        )?;
        Ok(())
    }

    /// Write back the configurable fields of a tunnel
    pub fn update_multihop_tunnel(&self, tunnel: &MultihopTunnel) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE multihop_tunnels SET
                listen_port = ?1, remote_endpoint = ?2, remote_public_key = ?3,
                remote_preshared_key = ?4, remote_allowed_ips = ?5, remote_keepalive = ?6,
                fwmark = ?7, routing_table = ?8, routing_table_id = ?9, priority = ?10
             WHERE name = ?11",
            params![
                tunnel.listen_port,
                tunnel.remote_endpoint,
                tunnel.remote_public_key,
                non_empty(tunnel.remote_preshared_key.as_deref()),
                tunnel.remote_allowed_ips,
                tunnel.remote_keepalive,
                tunnel.fwmark,
                tunnel.routing_table,
                tunnel.routing_table_id,
                tunnel.priority,
                tunnel.name,
            ],
        )?;
        if updated == 0 {
            return Err(Error::TunnelNotFound(tunnel.name.clone()));
        }
        Ok(())
    }

    /// Reset every tunnel's runtime fields to stopped
    pub fn clear_multihop_runtime_state(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE multihop_tunnels SET status = 'stopped', error_msg = NULL, started_at = NULL",
            [],
        )?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::tests::temp_store;

    pub(crate) fn new_tunnel(name: &str, iface: &str, priority: u32) -> NewMultihopTunnel {
        NewMultihopTunnel {
            name: name.to_string(),
            interface_name: iface.to_string(),
            listen_port: 0,
            private_key: "11".repeat(32),
            public_key: "22".repeat(32),
            remote_endpoint: "203.0.113.5:51820".to_string(),
            remote_public_key: "33".repeat(32),
            remote_preshared_key: None,
            remote_allowed_ips: "0.0.0.0/0".to_string(),
            remote_keepalive: 25,
            fwmark: 0,
            routing_table: "wolfbridge_multihop".to_string(),
            routing_table_id: 100,
            priority,
        }
    }

    #[test]
    fn test_insert_defaults() {
        let (_dir, store) = temp_store();
        let tunnel = store.insert_multihop_tunnel(&new_tunnel("hop-us", "wg-hop0", 100)).unwrap();
        assert!(!tunnel.enabled);
        assert_eq!(tunnel.status, TunnelStatus::Stopped);
        assert!(tunnel.started_at.is_none());
        assert!(tunnel.created_at > 0);

        let err = store
            .insert_multihop_tunnel(&new_tunnel("hop-us", "wg-hop1", 100))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        let err = store
            .insert_multihop_tunnel(&new_tunnel("hop-de", "wg-hop0", 100))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_enabled_ordering_and_runtime_reset() {
        let (_dir, store) = temp_store();
        store.insert_multihop_tunnel(&new_tunnel("a", "wg-a", 200)).unwrap();
        store.insert_multihop_tunnel(&new_tunnel("b", "wg-b", 50)).unwrap();
        store.insert_multihop_tunnel(&new_tunnel("c", "wg-c", 10)).unwrap();
        store.set_multihop_enabled("a", true).unwrap();
        store.set_multihop_enabled("b", true).unwrap();

        let names: Vec<_> = store
            .enabled_multihop_tunnels()
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["b", "a"]);

        store
            .set_multihop_status("a", TunnelStatus::Error, Some("boom"), None)
            .unwrap();
        store
            .set_multihop_status("b", TunnelStatus::Running, None, Some(1_700_000_000))
            .unwrap();
        assert_eq!(store.multihop_tunnel("a").unwrap().error_msg.as_deref(), Some("boom"));

        store.clear_multihop_runtime_state().unwrap();
        for tunnel in store.list_multihop_tunnels().unwrap() {
            assert_eq!(tunnel.status, TunnelStatus::Stopped);
            assert!(tunnel.error_msg.is_none());
            assert!(tunnel.started_at.is_none());
        }
        // Intent survives the runtime reset
        assert_eq!(store.enabled_multihop_tunnels().unwrap().len(), 2);
    }

    #[test]
    fn test_update_and_delete() {
        let (_dir, store) = temp_store();
        let mut tunnel = store.insert_multihop_tunnel(&new_tunnel("a", "wg-a", 100)).unwrap();

        let update: MultihopUpdate = serde_json::from_str(
            r#"{"remote_endpoint":"198.51.100.7:51820","remote_preshared_key":"","fwmark":51820}"#,
        )
        .unwrap();
        update.apply(&mut tunnel);
        store.update_multihop_tunnel(&tunnel).unwrap();

        let stored = store.multihop_tunnel("a").unwrap();
        assert_eq!(stored.remote_endpoint, "198.51.100.7:51820");
        assert_eq!(stored.fwmark, 51820);
        assert!(stored.remote_preshared_key.is_none());

        assert!(serde_json::from_str::<MultihopUpdate>(r#"{"name":"x"}"#).is_err());

        store.delete_multihop_tunnel("a").unwrap();
        assert!(matches!(store.multihop_tunnel("a"), Err(Error::TunnelNotFound(_))));
        assert!(matches!(store.delete_multihop_tunnel("a"), Err(Error::TunnelNotFound(_))));
    }

    #[test]
    fn test_allowed_ranges_split() {
        let (_dir, store) = temp_store();
        let mut new = new_tunnel("a", "wg-a", 100);
        new.remote_allowed_ips = "0.0.0.0/0, ::/0,".into();
        let tunnel = store.insert_multihop_tunnel(&new).unwrap();
        assert_eq!(tunnel.allowed_ranges().collect::<Vec<_>>(), vec!["0.0.0.0/0", "::/0"]);

        let json = serde_json::to_value(&tunnel).unwrap();
        assert_eq!(json["status"], "stopped");
        assert!(json["remote_preshared_key"].is_null());
        assert!(json.get("error_msg").is_none());
    }

    #[test]
    fn test_validate_allowed_ips() {
        validate_allowed_ips("0.0.0.0/0").unwrap();
        validate_allowed_ips("10.0.0.0/8, fd00::/64,").unwrap();
        assert!(validate_allowed_ips("10.0.0.0/33").is_err());
        assert!(validate_allowed_ips("10.0.0.1").is_err());
        assert!(validate_allowed_ips(" , ").is_err());
    }
}
