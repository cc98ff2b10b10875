//! Device configuration protocol
//!
//! Newline-separated `key=value` lines. "set" bodies carry device-level
//! directives first, then one block per peer introduced by `public_key`.
//! "get" dumps use the same layout plus read-only counters.

use std::fmt::Write as _;

use crate::error::{Error, Result};

/// Device-level directives of a "set" operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub private_key: Option<String>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub replace_peers: bool,
}

impl InterfaceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn private_key(mut self, key: impl Into<String>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Zero is left out: an unset mark and a cleared mark look the same
    pub fn fwmark(mut self, mark: u32) -> Self {
        self.fwmark = (mark != 0).then_some(mark);
        self
    }

    pub fn replace_peers(mut self) -> Self {
        self.replace_peers = true;
        self
    }

    /// Render as "set" lines
    pub fn to_uapi(&self) -> String {
        let mut out = String::new();
        if let Some(key) = &self.private_key {
            let _ = writeln!(out, "private_key={}", key);
        }
        if let Some(port) = self.listen_port {
            let _ = writeln!(out, "listen_port={}", port);
        }
        if let Some(mark) = self.fwmark {
            let _ = writeln!(out, "fwmark={}", mark);
        }
        if self.replace_peers {
            out.push_str("replace_peers=true\n");
        }
        out
    }
}

/// One peer block of a "set" operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub endpoint: Option<String>,
    pub persistent_keepalive: Option<u32>,
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<String>,
}

impl PeerConfig {
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            ..Default::default()
        }
    }

    pub fn preshared_key(mut self, key: Option<&str>) -> Self {
        self.preshared_key = key.filter(|k| !k.is_empty()).map(str::to_string);
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn persistent_keepalive(mut self, secs: u32) -> Self {
        self.persistent_keepalive = Some(secs);
        self
    }

    /// Drop whatever ranges the peer had before adding ours
    pub fn replace_allowed_ips(mut self) -> Self {
        self.replace_allowed_ips = true;
        self
    }

    pub fn allowed_ip(mut self, range: impl Into<String>) -> Self {
        self.allowed_ips.push(range.into());
        self
    }

    /// Render as "set" lines
    pub fn to_uapi(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "public_key={}", self.public_key);
        if let Some(psk) = &self.preshared_key {
            let _ = writeln!(out, "preshared_key={}", psk);
        }
        if let Some(endpoint) = &self.endpoint {
            let _ = writeln!(out, "endpoint={}", endpoint);
        }
        if let Some(secs) = self.persistent_keepalive {
            let _ = writeln!(out, "persistent_keepalive_interval={}", secs);
        }
        if self.replace_allowed_ips {
            out.push_str("replace_allowed_ips=true\n");
        }
        for range in &self.allowed_ips {
            let _ = writeln!(out, "allowed_ip={}", range);
        }
        out
    }
}

/// "set" lines removing a peer
pub fn remove_peer(public_key: &str) -> String {
    format!("public_key={}\nremove=true\n", public_key)
}

/// "set" line changing the socket mark
pub fn fwmark(mark: u32) -> String {
    format!("fwmark={}\n", mark)
}

/// Parsed "get" dump of a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDump {
    pub private_key: Option<String>,
    pub listen_port: u16,
    pub fwmark: u32,
    pub peers: Vec<PeerDump>,
}

impl DeviceDump {
    pub fn peer(&self, public_key: &str) -> Option<&PeerDump> {
        self.peers.iter().find(|p| p.public_key == public_key)
    }
}

/// One peer section of a "get" dump
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDump {
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub endpoint: Option<String>,
    pub persistent_keepalive: u32,
    pub allowed_ips: Vec<String>,
    pub last_handshake_sec: i64,
    pub last_handshake_nsec: i64,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
    pub protocol_version: u32,
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid {}: {}", key, value)))
}

/// Parse a "get" dump.
///
/// Unknown keys are skipped so newer device versions stay readable; a
/// non-zero `errno` or a line without `=` is an error.
pub fn parse_dump(text: &str) -> Result<DeviceDump> {
    let mut dump = DeviceDump::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| Error::Protocol(format!("malformed line: {}", line)))?;

        if key == "public_key" {
            dump.peers.push(PeerDump {
                public_key: value.to_string(),
                ..Default::default()
            });
            continue;
        }
        if key == "errno" {
            check_errno(value)?;
            continue;
        }

        match dump.peers.last_mut() {
            None => match key {
                "private_key" => dump.private_key = Some(value.to_string()),
                "listen_port" => dump.listen_port = parse_num(key, value)?,
                "fwmark" => dump.fwmark = parse_num(key, value)?,
                _ => {}
            },
            Some(peer) => match key {
                "preshared_key" => {
                    peer.preshared_key = (!crate::keys::is_zero(value)).then(|| value.to_string())
                }
                "endpoint" => peer.endpoint = Some(value.to_string()),
                "persistent_keepalive_interval" => {
                    peer.persistent_keepalive = parse_num(key, value)?
                }
                "allowed_ip" => peer.allowed_ips.push(value.to_string()),
                "last_handshake_time_sec" => peer.last_handshake_sec = parse_num(key, value)?,
                "last_handshake_time_nsec" => peer.last_handshake_nsec = parse_num(key, value)?,
                "rx_bytes" => peer.rx_bytes = parse_num(key, value)?,
                "tx_bytes" => peer.tx_bytes = parse_num(key, value)?,
                "protocol_version" => peer.protocol_version = parse_num(key, value)?,
                _ => {}
            },
        }
    }

    Ok(dump)
}

fn check_errno(value: &str) -> Result<()> {
    match value.trim().parse::<i64>() {
        Ok(0) => Ok(()),
        Ok(errno) => Err(Error::Protocol(format!("device returned errno={}", errno))),
        Err(_) => Err(Error::Protocol(format!("invalid errno: {}", value))),
    }
}

/// Check the `errno=N` trailer of a socket response
pub fn parse_errno(response: &str) -> Result<()> {
    response
        .lines()
        .find_map(|line| line.trim().strip_prefix("errno="))
        .ok_or_else(|| Error::Protocol("response carried no errno".into()))
        .and_then(check_errno)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_lines() {
        let set = InterfaceConfig::new()
            .private_key("ab".repeat(32))
            .listen_port(51820)
            .fwmark(0)
            .to_uapi();
        assert_eq!(set, format!("private_key={}\nlisten_port=51820\n", "ab".repeat(32)));

        assert_eq!(InterfaceConfig::new().fwmark(42).to_uapi(), "fwmark=42\n");
    }

    #[test]
    fn test_peer_lines() {
        let set = PeerConfig::new("pk")
            .preshared_key(Some("psk"))
            .persistent_keepalive(25)
            .allowed_ip("10.8.0.2/32")
            .allowed_ip("fd00::2/128")
            .to_uapi();
        assert_eq!(
            set,
            "public_key=pk\npreshared_key=psk\npersistent_keepalive_interval=25\n\
             allowed_ip=10.8.0.2/32\nallowed_ip=fd00::2/128\n"
        );

        let set = PeerConfig::new("pk")
            .preshared_key(Some(""))
            .endpoint("203.0.113.5:51820")
            .replace_allowed_ips()
            .allowed_ip("0.0.0.0/0")
            .to_uapi();
        assert_eq!(
            set,
            "public_key=pk\nendpoint=203.0.113.5:51820\nreplace_allowed_ips=true\nallowed_ip=0.0.0.0/0\n"
        );

        assert_eq!(remove_peer("pk"), "public_key=pk\nremove=true\n");
    }

    #[test]
    fn test_parse_dump() {
        let text = format!(
            "private_key={priv}\nlisten_port=51820\nfwmark=51820\n\
             public_key={a}\npreshared_key={zero}\nprotocol_version=1\n\
             last_handshake_time_sec=0\nlast_handshake_time_nsec=0\ntx_bytes=0\nrx_bytes=0\n\
             persistent_keepalive_interval=25\nallowed_ip=10.8.0.2/32\n\
             public_key={b}\nendpoint=198.51.100.4:41000\nlast_handshake_time_sec=1700000000\n\
             tx_bytes=42\nrx_bytes=84\nallowed_ip=10.8.0.3/32\nallowed_ip=fd00::3/128\nfuture_key=1\n\
             errno=0\n\n",
            priv = "11".repeat(32),
            a = "aa".repeat(32),
            b = "bb".repeat(32),
            zero = "00".repeat(32),
        );

        let dump = parse_dump(&text).unwrap();
        assert_eq!(dump.listen_port, 51820);
        assert_eq!(dump.fwmark, 51820);
        assert_eq!(dump.peers.len(), 2);

        let a = dump.peer(&"aa".repeat(32)).unwrap();
        assert!(a.preshared_key.is_none());
        assert_eq!(a.persistent_keepalive, 25);
        assert_eq!(a.allowed_ips, vec!["10.8.0.2/32"]);

        let b = dump.peer(&"bb".repeat(32)).unwrap();
        assert_eq!(b.endpoint.as_deref(), Some("198.51.100.4:41000"));
        assert_eq!(b.last_handshake_sec, 1_700_000_000);
        assert_eq!((b.rx_bytes, b.tx_bytes), (84, 42));
        assert_eq!(b.allowed_ips.len(), 2);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_dump("listen_port\n"), Err(Error::Protocol(_))));
        assert!(matches!(parse_dump("listen_port=abc\n"), Err(Error::Protocol(_))));
        assert!(matches!(parse_dump("errno=1\n"), Err(Error::Protocol(_))));

        parse_errno("errno=0\n\n").unwrap();
        assert!(parse_errno("errno=-22\n").is_err());
        assert!(parse_errno("").is_err());
    }
}
