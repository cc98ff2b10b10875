//! IP pool allocator
//!
//! One row per usable host address. Rows are never deleted, so a released
//! address is the next one handed out for its family.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::Store;
use crate::error::{Error, Result};

/// Smallest IPv4 prefix accepted for a pool (a /16 is 65534 rows)
pub(crate) const MIN_V4_PREFIX: u8 = 16;

/// Last host byte used for IPv6 pools (::2 through ::fe)
const V6_LAST_HOST: u8 = 254;

/// Address family of a pool entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Numeric family as stored in the `family` column
    pub fn as_u8(self) -> u8 {
        match self {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 6,
        }
    }

    /// Host prefix suffix
    pub fn host_suffix(self) -> &'static str {
        match self {
            AddressFamily::V4 => "/32",
            AddressFamily::V6 => "/128",
        }
    }
}

/// Assigned/total counts for one family
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    pub family: u8,
    pub total: i64,
    pub assigned: i64,
}

/// Expand a subnet into its usable host addresses.
///
/// IPv4 skips the network address and the first host (gateway).
/// IPv6 yields at most 253 addresses, `::2` through `::fe` of the network.
pub fn expand_subnet(cidr: &str, family: AddressFamily) -> Result<Vec<String>> {
    let net: IpNet = cidr
        .trim()
        .parse()
        .map_err(|e| Error::InvalidParam(format!("invalid network {}: {}", cidr, e)))?;

    match (family, net) {
        (AddressFamily::V4, IpNet::V4(net)) => expand_v4(net),
        (AddressFamily::V6, IpNet::V6(net)) => Ok(expand_v6(net)),
        _ => Err(Error::InvalidParam(format!(
            "network {} is not IPv{}",
            cidr,
            family.as_u8()
        ))),
    }
}

fn expand_v4(net: Ipv4Net) -> Result<Vec<String>> {
    if net.prefix_len() < MIN_V4_PREFIX {
        return Err(Error::InvalidParam(format!(
            "IPv4 network {} too large (minimum prefix /{})",
            net, MIN_V4_PREFIX
        )));
    }

    let host_count: u32 = (1u32 << (32 - net.prefix_len() as u32)).saturating_sub(2);
    if host_count <= 1 {
        return Ok(Vec::new());
    }

    let base = u32::from(net.network());
    Ok((2..=host_count)
        .map(|i| Ipv4Addr::from(base + i))
        .filter(|ip| net.contains(ip))
        .map(|ip| ip.to_string())
        .collect())
}

fn expand_v6(net: Ipv6Net) -> Vec<String> {
    let base = net.network().octets();
    (2..=V6_LAST_HOST)
        .map(|i| {
            let mut octets = base;
            octets[15] = i;
            Ipv6Addr::from(octets)
        })
        .filter(|ip| net.contains(ip))
        .map(|ip| ip.to_string())
        .collect()
}

/// Strip a `/prefix` suffix
fn host_part(ip: &str) -> &str {
    ip.split('/').next().unwrap_or(ip).trim()
}

/// Family of an address string, with or without prefix
pub(crate) fn family_of(ip: &str) -> Option<AddressFamily> {
    match host_part(ip).parse::<IpAddr>().ok()? {
        IpAddr::V4(_) => Some(AddressFamily::V4),
        IpAddr::V6(_) => Some(AddressFamily::V6),
    }
}

impl Store {
    /// Populate the pool for each configured subnet. A family that already
    /// has rows is left untouched, so repeated calls are no-ops.
    pub fn init_ip_pool(&self, network: &str, network_v6: Option<&str>) -> Result<()> {
        self.init_family(network, AddressFamily::V4)?;
        if let Some(v6) = super::non_empty(network_v6) {
            self.init_family(v6, AddressFamily::V6)?;
        }
        Ok(())
    }

    fn init_family(&self, cidr: &str, family: AddressFamily) -> Result<()> {
        if self.pool_count(family)? > 0 {
            return Ok(());
        }

        let ips = expand_subnet(cidr, family)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO ip_pool (ip, family, assigned) VALUES (?1, ?2, 0)")?;
            for ip in &ips {
                stmt.execute(params![ip, family.as_u8()])?;
            }
        }
        tx.commit()?;

        tracing::info!("IP pool initialized: {} ({} addresses)", cidr, ips.len());
        Ok(())
    }

    /// Number of pool rows for a family
    pub fn pool_count(&self, family: AddressFamily) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM ip_pool WHERE family = ?1",
            params![family.as_u8()],
            |row| row.get(0),
        )?)
    }

    /// Claim the first free address of a family for a peer.
    /// Returns it in host-prefix notation (`/32` or `/128`).
    pub fn allocate_ip(&self, peer_id: i64, family: AddressFamily) -> Result<String> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let ip: Option<String> = tx
            .query_row(
                "SELECT ip FROM ip_pool WHERE family = ?1 AND assigned = 0
                 ORDER BY rowid LIMIT 1",
                params![family.as_u8()],
                |row| row.get(0),
            )
            .optional()?;
        let ip = ip.ok_or(Error::PoolExhausted {
            family: family.as_u8(),
        })?;

        tx.execute(
            "UPDATE ip_pool SET assigned = 1, peer_id = ?1 WHERE ip = ?2",
            params![peer_id, ip],
        )?;
        tx.commit()?;

        Ok(format!("{}{}", ip, family.host_suffix()))
    }

    /// Claim a specific address for a peer.
    ///
    /// Returns `false` when the address is not part of any pool (the caller
    /// chose an address outside the managed range). An address that is in
    /// the pool but already assigned is an error.
    pub fn claim_ip(&self, peer_id: i64, ip: &str) -> Result<bool> {
        let host = host_part(ip);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let assigned: Option<bool> = tx
            .query_row(
                "SELECT assigned FROM ip_pool WHERE ip = ?1",
                params![host],
                |row| row.get(0),
            )
            .optional()?;

        match assigned {
            None => Ok(false),
            Some(true) => Err(Error::AlreadyExists(format!("address {} is assigned", host))),
            Some(false) => {
                tx.execute(
                    "UPDATE ip_pool SET assigned = 1, peer_id = ?1 WHERE ip = ?2",
                    params![peer_id, host],
                )?;
                tx.commit()?;
                Ok(true)
            }
        }
    }

    /// Return an address to the pool
    pub fn release_ip(&self, ip: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE ip_pool SET assigned = 0, peer_id = NULL WHERE ip = ?1",
            params![host_part(ip)],
        )?;
        Ok(())
    }

    /// Assigned/total counts for each populated family
    pub fn pool_usage(&self) -> Result<Vec<PoolUsage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT family, COUNT(*), COALESCE(SUM(assigned), 0)
             FROM ip_pool GROUP BY family ORDER BY family",
        )?;
        let usage = stmt
            .query_map([], |row| {
                Ok(PoolUsage {
                    family: row.get(0)?,
                    total: row.get(1)?,
                    assigned: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(usage)
    }
}
