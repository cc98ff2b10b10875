//! Client configuration documents
//!
//! Renders the INI-style file a client imports, and parses one back.
//! Keys are base64 in the document and hex everywhere else.

use std::fmt::Write as _;

use crate::config::defaults;
use crate::error::{Error, Result};
use crate::keys;
use crate::store::ClientRecord;

/// Everything needed to render one client's document
#[derive(Debug, Clone, Copy)]
pub struct ClientExport<'a> {
    pub client: &'a ClientRecord,
    /// Server public key, hex
    pub server_public_key: &'a str,
    pub endpoint: &'a str,
    pub dns: &'a str,
    pub mtu: u32,
    /// Prefix of the server's IPv4 subnet, used in the client's Address
    pub prefix_v4: u8,
    pub prefix_v6: u8,
}

/// Rewrite `host/32` (or any prefix) as `host/<prefix>`
fn with_prefix(address: &str, prefix: u8) -> String {
    let host = address.split('/').next().unwrap_or(address);
    format!("{}/{}", host, prefix)
}

/// Render a client's configuration document
pub fn render_client_config(export: &ClientExport<'_>) -> Result<String> {
    let client = export.client;

    let mut addresses = vec![with_prefix(&client.allowed_ip, export.prefix_v4)];
    if let Some(v6) = &client.allowed_ip_v6 {
        addresses.push(with_prefix(v6, export.prefix_v6));
    }
    let allowed_ips = if client.allowed_ip_v6.is_some() {
        defaults::CLIENT_ALLOWED_IPS_DUAL
    } else {
        defaults::CLIENT_ALLOWED_IPS
    };

    let mut out = String::new();
    out.push_str("[Interface]\n");
    let _ = writeln!(out, "PrivateKey = {}", keys::hex_to_base64(&client.private_key)?);
    let _ = writeln!(out, "Address = {}", addresses.join(", "));
    if !export.dns.is_empty() {
        let _ = writeln!(out, "DNS = {}", export.dns);
    }
    let _ = writeln!(out, "MTU = {}", export.mtu);

    out.push_str("\n[Peer]\n");
    let _ = writeln!(out, "PublicKey = {}", keys::hex_to_base64(export.server_public_key)?);
    if let Some(psk) = &client.preshared_key {
        let _ = writeln!(out, "PresharedKey = {}", keys::hex_to_base64(psk)?);
    }
    let _ = writeln!(out, "AllowedIPs = {}", allowed_ips);
    let _ = writeln!(out, "Endpoint = {}", export.endpoint);
    if client.keepalive > 0 {
        let _ = writeln!(out, "PersistentKeepalive = {}", client.keepalive);
    }

    Ok(out)
}

/// A client configuration document read back. Keys are hex.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedClientConfig {
    pub private_key: String,
    pub addresses: Vec<String>,
    pub dns: Vec<String>,
    pub mtu: Option<u32>,
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub allowed_ips: Vec<String>,
    pub endpoint: Option<String>,
    pub persistent_keepalive: Option<u32>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number(key: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| Error::InvalidParam(format!("{}: not a number: {}", key, value)))
}

/// Parse a single-peer client configuration document
pub fn parse_client_config(text: &str) -> Result<ParsedClientConfig> {
    let mut parsed = ParsedClientConfig::default();
    let mut section = Section::None;
    let mut peers = 0;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "[Interface]" => {
                section = Section::Interface;
                continue;
            }
            "[Peer]" => {
                peers += 1;
                if peers > 1 {
                    return Err(Error::InvalidParam("more than one [Peer] section".into()));
                }
                section = Section::Peer;
                continue;
            }
            _ => {}
        }

        let (key, value) = line
            .split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .ok_or_else(|| Error::InvalidParam(format!("line {}: expected key = value", lineno + 1)))?;

        match (section, key) {
            (Section::Interface, "PrivateKey") => parsed.private_key = keys::base64_to_hex(value)?,
            (Section::Interface, "Address") => parsed.addresses = split_list(value),
            (Section::Interface, "DNS") => parsed.dns = split_list(value),
            (Section::Interface, "MTU") => parsed.mtu = Some(parse_number(key, value)?),
            (Section::Peer, "PublicKey") => parsed.public_key = keys::base64_to_hex(value)?,
            (Section::Peer, "PresharedKey") => parsed.preshared_key = Some(keys::base64_to_hex(value)?),
            (Section::Peer, "AllowedIPs") => parsed.allowed_ips = split_list(value),
            (Section::Peer, "Endpoint") => parsed.endpoint = Some(value.to_string()),
            (Section::Peer, "PersistentKeepalive") => {
                parsed.persistent_keepalive = Some(parse_number(key, value)?)
            }
            (Section::None, _) => {
                return Err(Error::InvalidParam(format!(
                    "line {}: {} outside of a section",
                    lineno + 1,
                    key
                )))
            }
            // Unknown keys (ListenPort, PostUp, ...) are tolerated
            _ => {}
        }
    }

    if parsed.private_key.is_empty() {
        return Err(Error::InvalidParam("missing [Interface] PrivateKey".into()));
    }
    if parsed.public_key.is_empty() {
        return Err(Error::InvalidParam("missing [Peer] PublicKey".into()));
    }
    Ok(parsed)
}
