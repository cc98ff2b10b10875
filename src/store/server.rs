//! Server configuration (singleton row keyed by device id 1)

use ipnet::{Ipv4Net, Ipv6Net};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::pool::MIN_V4_PREFIX;
use super::{non_empty, Store};
use crate::config::defaults;
use crate::error::{Error, Result};

/// Server-side settings read at Start to bootstrap the primary device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_device_id")]
    pub device_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_v6: Option<String>,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_v6: Option<String>,
    #[serde(default = "default_dns_primary")]
    pub dns_primary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_secondary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_v6: Option<String>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub fwmark: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_up: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_down: Option<String>,
}

fn default_device_id() -> i64 {
    1
}

fn default_network() -> String {
    defaults::NETWORK.to_string()
}

fn default_dns_primary() -> String {
    defaults::DNS_PRIMARY.to_string()
}

fn default_mtu() -> u32 {
    defaults::MTU
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            endpoint: None,
            endpoint_v6: None,
            network: default_network(),
            network_v6: None,
            dns_primary: default_dns_primary(),
            dns_secondary: None,
            dns_v6: None,
            mtu: default_mtu(),
            fwmark: 0,
            post_up: None,
            post_down: None,
        }
    }
}

impl ServerConfig {
    /// Fill unset fields with defaults and turn empty strings into None
    pub fn normalize(&mut self) {
        self.device_id = 1;
        for field in [
            &mut self.endpoint,
            &mut self.endpoint_v6,
            &mut self.network_v6,
            &mut self.dns_secondary,
            &mut self.dns_v6,
            &mut self.post_up,
            &mut self.post_down,
        ] {
            if field.as_deref().map_or(false, |v| v.trim().is_empty()) {
                *field = None;
            }
        }
        if self.network.trim().is_empty() {
            self.network = default_network();
        }
        if self.dns_primary.trim().is_empty() {
            self.dns_primary = default_dns_primary();
        }
        if self.mtu == 0 {
            self.mtu = default_mtu();
        }
    }

    /// Check that subnets parse and fit the pool, and the MTU is usable
    pub fn validate(&self) -> Result<()> {
        let network = self
            .network
            .parse::<Ipv4Net>()
            .map_err(|e| Error::InvalidParam(format!("network {}: {}", self.network, e)))?;
        if network.prefix_len() < MIN_V4_PREFIX {
            return Err(Error::InvalidParam(format!(
                "network {} too large (minimum prefix /{})",
                self.network, MIN_V4_PREFIX
            )));
        }

        if let Some(v6) = &self.network_v6 {
            v6.parse::<Ipv6Net>()
                .map_err(|e| Error::InvalidParam(format!("network_v6 {}: {}", v6, e)))?;
        }

        if !(576..=65535).contains(&self.mtu) {
            return Err(Error::InvalidParam(format!("mtu out of range: {}", self.mtu)));
        }

        Ok(())
    }

    /// DNS servers as a comma-separated list (primary, secondary, v6)
    pub fn dns_string(&self) -> String {
        std::iter::once(self.dns_primary.as_str())
            .chain(self.dns_secondary.as_deref())
            .chain(self.dns_v6.as_deref())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// True when an IPv6 subnet is configured
    pub fn has_ipv6(&self) -> bool {
        non_empty(self.network_v6.as_deref()).is_some()
    }

    /// Prefix length of the IPv4 subnet
    pub fn prefix_len_v4(&self) -> Option<u8> {
        self.network.parse::<Ipv4Net>().ok().map(|n| n.prefix_len())
    }

    /// True when an IPv4 address (with or without prefix) is inside the subnet
    pub fn contains_v4(&self, ip: &str) -> bool {
        let host = ip.split('/').next().unwrap_or(ip).trim();
        match (self.network.parse::<Ipv4Net>(), host.parse::<std::net::Ipv4Addr>()) {
            (Ok(net), Ok(addr)) => net.contains(&addr),
            _ => false,
        }
    }

    /// Prefix length of the IPv6 subnet
    pub fn prefix_len_v6(&self) -> Option<u8> {
        self.network_v6
            .as_deref()?
            .parse::<Ipv6Net>()
            .ok()
            .map(|n| n.prefix_len())
    }
}

impl Store {
    /// Get the server configuration, if Setup has run
    pub fn server_config(&self) -> Result<Option<ServerConfig>> {
        let conn = self.conn()?;
        let config = conn
            .query_row(
                "SELECT device_id, endpoint, endpoint_v6, network, network_v6, dns_primary,
                        dns_secondary, dns_v6, mtu, fwmark, post_up, post_down
                 FROM server_config WHERE device_id = 1",
                [],
                |row| {
                    Ok(ServerConfig {
                        device_id: row.get(0)?,
                        endpoint: row.get(1)?,
                        endpoint_v6: row.get(2)?,
                        network: row.get(3)?,
                        network_v6: row.get(4)?,
                        dns_primary: row.get(5)?,
                        dns_secondary: row.get(6)?,
                        dns_v6: row.get(7)?,
                        mtu: row.get(8)?,
                        fwmark: row.get(9)?,
                        post_up: row.get(10)?,
                        post_down: row.get(11)?,
                    })
                },
            )
            .optional()?;
        Ok(config)
    }

    /// Create or replace the server configuration
    pub fn upsert_server_config(&self, config: &ServerConfig) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO server_config (device_id, endpoint, endpoint_v6, network, network_v6,
                 dns_primary, dns_secondary, dns_v6, mtu, fwmark, post_up, post_down)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(device_id) DO UPDATE SET
                endpoint = excluded.endpoint,
                endpoint_v6 = excluded.endpoint_v6,
                network = excluded.network,
                network_v6 = excluded.network_v6,
                dns_primary = excluded.dns_primary,
                dns_secondary = excluded.dns_secondary,
                dns_v6 = excluded.dns_v6,
                mtu = excluded.mtu,
                fwmark = excluded.fwmark,
                post_up = excluded.post_up,
                post_down = excluded.post_down",
            params![
                non_empty(config.endpoint.as_deref()),
                non_empty(config.endpoint_v6.as_deref()),
                config.network,
                non_empty(config.network_v6.as_deref()),
                config.dns_primary,
                non_empty(config.dns_secondary.as_deref()),
                non_empty(config.dns_v6.as_deref()),
                config.mtu,
                config.fwmark,
                non_empty(config.post_up.as_deref()),
                non_empty(config.post_down.as_deref()),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::temp_store;

    #[test]
    fn test_missing_config() {
        let (_dir, store) = temp_store();
        assert!(store.server_config().unwrap().is_none());
    }

    #[test]
    fn test_upsert_requires_device() {
        let (_dir, store) = temp_store();
        // device_id references device(id), which does not exist yet
        assert!(store.upsert_server_config(&ServerConfig::default()).is_err());

        store
            .upsert_device("wg0", &"11".repeat(32), &"22".repeat(32), 51820)
            .unwrap();
        let mut config = ServerConfig {
            endpoint: Some("vpn.example.com:51820".into()),
            network_v6: Some(String::new()),
            fwmark: 51820,
            ..Default::default()
        };
        config.normalize();
        store.upsert_server_config(&config).unwrap();

        let stored = store.server_config().unwrap().unwrap();
        assert_eq!(stored, config);
        assert!(stored.network_v6.is_none());
        assert!(!stored.has_ipv6());
    }

    #[test]
    fn test_json_defaults() {
        let mut config: ServerConfig =
            serde_json::from_str(r#"{"endpoint":"1.2.3.4:51820","mtu":0,"dns_secondary":""}"#)
                .unwrap();
        config.normalize();
        assert_eq!(config.network, "10.8.0.0/24");
        assert_eq!(config.dns_primary, "1.1.1.1");
        assert_eq!(config.mtu, 1420);
        assert!(config.dns_secondary.is_none());

        let json = serde_json::to_value(&config).unwrap();
        assert!(json.get("network_v6").is_none());
        assert_eq!(json["fwmark"], 0);
    }

    #[test]
    fn test_dns_string_and_prefixes() {
        let config = ServerConfig {
            dns_secondary: Some("9.9.9.9".into()),
            dns_v6: Some("2606:4700:4700::1111".into()),
            network_v6: Some("fd00:8::/64".into()),
            ..Default::default()
        };
        assert_eq!(config.dns_string(), "1.1.1.1, 9.9.9.9, 2606:4700:4700::1111");
        assert_eq!(config.prefix_len_v4(), Some(24));
        assert_eq!(config.prefix_len_v6(), Some(64));
        assert!(config.has_ipv6());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_garbage() {
        let config = ServerConfig {
            network: "10.8.0.0/33".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidParam(_))));

        let config = ServerConfig {
            network_v6: Some("10.0.0.0/8".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // Parses, but is larger than the pool will expand
        let config = ServerConfig {
            network: "10.0.0.0/8".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidParam(_))));
    }

    #[test]
    fn test_contains_v4() {
        let config = ServerConfig::default();
        assert!(config.contains_v4("10.8.0.1/32"));
        assert!(config.contains_v4("10.8.0.255"));
        assert!(!config.contains_v4("10.9.0.1/32"));
        assert!(!config.contains_v4("fd00::1"));
    }
}
