//! In-process device model
//!
//! Interprets "set" bodies against an in-memory interface and renders "get"
//! dumps in the same shape a userspace implementation produces. No kernel
//! interface is created, so it runs anywhere.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};

use ipnet::IpNet;

use super::{DeviceFactory, TunnelBackend};
use crate::error::{Error, Result};
use crate::keys;

#[derive(Debug, Clone, Default)]
struct PeerModel {
    public_key: String,
    preshared_key: Option<String>,
    endpoint: Option<String>,
    persistent_keepalive: u32,
    allowed_ips: Vec<String>,
    last_handshake_sec: i64,
    rx_bytes: i64,
    tx_bytes: i64,
}

#[derive(Debug, Default)]
struct Model {
    private_key: Option<String>,
    listen_port: u16,
    fwmark: u32,
    peers: Vec<PeerModel>,
    up: bool,
    closed: bool,
}

/// In-memory tunnel device
pub struct MemoryBackend {
    name: String,
    mtu: u32,
    model: Mutex<Model>,
}

impl MemoryBackend {
    pub fn new(name: &str, mtu: u32) -> Self {
        Self {
            name: name.to_string(),
            mtu,
            model: Mutex::new(Model::default()),
        }
    }

    fn model(&self) -> Result<MutexGuard<'_, Model>> {
        self.model
            .lock()
            .map_err(|_| Error::Internal(format!("{}: device model lock poisoned", self.name)))
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn is_up(&self) -> bool {
        self.model().map(|m| m.up && !m.closed).unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.model().map(|m| m.closed).unwrap_or(true)
    }

    pub fn peer_keys(&self) -> Vec<String> {
        self.model()
            .map(|m| m.peers.iter().map(|p| p.public_key.clone()).collect())
            .unwrap_or_default()
    }

    /// Simulate traffic on a peer, as the packet path would
    pub fn record_traffic(
        &self,
        public_key: &str,
        endpoint: &str,
        handshake_sec: i64,
        rx: i64,
        tx: i64,
    ) -> Result<()> {
        let mut model = self.model()?;
        let peer = model
            .peers
            .iter_mut()
            .find(|p| p.public_key == public_key)
            .ok_or_else(|| Error::Device(format!("{}: no peer {}", self.name, public_key)))?;
        peer.endpoint = Some(endpoint.to_string());
        peer.last_handshake_sec = handshake_sec;
        peer.rx_bytes += rx;
        peer.tx_bytes += tx;
        Ok(())
    }

    fn apply(&self, model: &mut Model, body: &str) -> Result<()> {
        // Index of the peer being configured; None while in device section
        let mut current: Option<usize> = None;
        let mut removing = false;

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::Protocol(format!("malformed line: {}", line)))?;

            if key == "public_key" {
                finish_peer(model, &mut current, &mut removing);
                keys::parse_key(value).map_err(|e| Error::Protocol(e.to_string()))?;
                let idx = match model.peers.iter().position(|p| p.public_key == value) {
                    Some(idx) => idx,
                    None => {
                        model.peers.push(PeerModel {
                            public_key: value.to_string(),
                            ..Default::default()
                        });
                        model.peers.len() - 1
                    }
                };
                current = Some(idx);
                continue;
            }

            match current {
                None => apply_device_key(model, key, value)?,
                Some(idx) => {
                    let peer = &mut model.peers[idx];
                    match key {
                        "remove" => removing = value == "true",
                        "update_only" => {}
                        "preshared_key" => {
                            keys::parse_key(value).map_err(|e| Error::Protocol(e.to_string()))?;
                            peer.preshared_key =
                                (!keys::is_zero(value)).then(|| value.to_string());
                        }
                        "endpoint" => peer.endpoint = Some(value.to_string()),
                        "persistent_keepalive_interval" => {
                            peer.persistent_keepalive = value.parse().map_err(|_| {
                                Error::Protocol(format!("invalid keepalive: {}", value))
                            })?
                        }
                        "replace_allowed_ips" => {
                            if value == "true" {
                                peer.allowed_ips.clear();
                            }
                        }
                        "allowed_ip" => {
                            let net: IpNet = value.parse().map_err(|_| {
                                Error::Protocol(format!("invalid allowed_ip: {}", value))
                            })?;
                            let net = net.to_string();
                            // A range belongs to at most one peer
                            for (i, other) in model.peers.iter_mut().enumerate() {
                                if i != idx {
                                    other.allowed_ips.retain(|r| *r != net);
                                }
                            }
                            let peer = &mut model.peers[idx];
                            if !peer.allowed_ips.contains(&net) {
                                peer.allowed_ips.push(net);
                            }
                        }
                        "protocol_version" => {
                            if value != "1" {
                                return Err(Error::Protocol(format!(
                                    "unsupported protocol_version: {}",
                                    value
                                )));
                            }
                        }
                        other => {
                            return Err(Error::Protocol(format!("unknown peer key: {}", other)))
                        }
                    }
                }
            }
        }

        finish_peer(model, &mut current, &mut removing);
        Ok(())
    }

    fn render(&self, model: &Model) -> String {
        let mut out = String::new();
        if let Some(key) = &model.private_key {
            let _ = writeln!(out, "private_key={}", key);
        }
        let _ = writeln!(out, "listen_port={}", model.listen_port);
        if model.fwmark != 0 {
            let _ = writeln!(out, "fwmark={}", model.fwmark);
        }
        for peer in &model.peers {
            let _ = writeln!(out, "public_key={}", peer.public_key);
            let psk = peer.preshared_key.clone().unwrap_or_else(|| "00".repeat(keys::KEY_LEN));
            let _ = writeln!(out, "preshared_key={}", psk);
            out.push_str("protocol_version=1\n");
            if let Some(endpoint) = &peer.endpoint {
                let _ = writeln!(out, "endpoint={}", endpoint);
            }
            let _ = writeln!(out, "last_handshake_time_sec={}", peer.last_handshake_sec);
            out.push_str("last_handshake_time_nsec=0\n");
            let _ = writeln!(out, "tx_bytes={}", peer.tx_bytes);
            let _ = writeln!(out, "rx_bytes={}", peer.rx_bytes);
            let _ = writeln!(out, "persistent_keepalive_interval={}", peer.persistent_keepalive);
            for range in &peer.allowed_ips {
                let _ = writeln!(out, "allowed_ip={}", range);
            }
        }
        out.push_str("errno=0\n");
        out
    }
}

fn apply_device_key(model: &mut Model, key: &str, value: &str) -> Result<()> {
    match key {
        "private_key" => {
            keys::parse_key(value).map_err(|e| Error::Protocol(e.to_string()))?;
            model.private_key = (!keys::is_zero(value)).then(|| value.to_string());
        }
        "listen_port" => {
            model.listen_port = value
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid listen_port: {}", value)))?
        }
        "fwmark" => {
            model.fwmark = value
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid fwmark: {}", value)))?
        }
        "replace_peers" => {
            if value == "true" {
                model.peers.clear();
            }
        }
        other => return Err(Error::Protocol(format!("unknown device key: {}", other))),
    }
    Ok(())
}

fn finish_peer(model: &mut Model, current: &mut Option<usize>, removing: &mut bool) {
    if let Some(idx) = current.take() {
        if *removing {
            model.peers.remove(idx);
        }
    }
    *removing = false;
}

impl TunnelBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn ipc_set(&self, config: &str) -> Result<()> {
        let mut model = self.model()?;
        if model.closed {
            return Err(Error::DeviceClosed(self.name.clone()));
        }
        // Apply to a scratch copy so a rejected body leaves the device as it was
        let mut scratch = Model {
            private_key: model.private_key.clone(),
            listen_port: model.listen_port,
            fwmark: model.fwmark,
            peers: model.peers.clone(),
            up: model.up,
            closed: false,
        };
        self.apply(&mut scratch, config)?;
        *model = scratch;
        Ok(())
    }

    fn ipc_get(&self) -> Result<String> {
        let model = self.model()?;
        if model.closed {
            return Err(Error::DeviceClosed(self.name.clone()));
        }
        Ok(self.render(&model))
    }

    fn up(&self) -> Result<()> {
        let mut model = self.model()?;
        if model.closed {
            return Err(Error::DeviceUp(format!("{} is closed", self.name)));
        }
        model.up = true;
        Ok(())
    }

    fn down(&self) -> Result<()> {
        let mut model = self.model()?;
        if model.closed {
            return Err(Error::DeviceDown(format!("{} is closed", self.name)));
        }
        model.up = false;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut model = self.model()?;
        model.up = false;
        model.closed = true;
        Ok(())
    }
}

/// Creates [`MemoryBackend`]s and keeps a handle on each for inspection
#[derive(Default)]
pub struct MemoryFactory {
    devices: Mutex<HashMap<String, Arc<MemoryBackend>>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent device created for an interface
    pub fn backend(&self, ifname: &str) -> Option<Arc<MemoryBackend>> {
        self.devices.lock().ok()?.get(ifname).cloned()
    }

    /// Make future creations of an interface fail
    pub fn fail_interface(&self, ifname: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(ifname.to_string());
        }
    }

    /// Undo [`fail_interface`](Self::fail_interface)
    pub fn heal_interface(&self, ifname: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.remove(ifname);
        }
    }
}

/// Shares a registered backend with the device that owns it
struct SharedBackend(Arc<MemoryBackend>);

impl TunnelBackend for SharedBackend {
    fn name(&self) -> &str {
        self.0.name()
    }
    fn ipc_set(&self, config: &str) -> Result<()> {
        self.0.ipc_set(config)
    }
    fn ipc_get(&self) -> Result<String> {
        self.0.ipc_get()
    }
    fn up(&self) -> Result<()> {
        self.0.up()
    }
    fn down(&self) -> Result<()> {
        self.0.down()
    }
    fn close(&self) -> Result<()> {
        self.0.close()
    }
}

impl DeviceFactory for MemoryFactory {
    fn create(&self, ifname: &str, mtu: u32) -> Result<Box<dyn TunnelBackend>> {
        let failing = self
            .failing
            .lock()
            .map_err(|_| Error::Internal("memory factory lock poisoned".into()))?
            .contains(ifname);
        if failing {
            return Err(Error::TunCreate {
                name: ifname.to_string(),
                reason: "interface creation refused".into(),
            });
        }

        let mut devices = self
            .devices
            .lock()
            .map_err(|_| Error::Internal("memory factory lock poisoned".into()))?;
        if devices.get(ifname).map_or(false, |d| !d.is_closed()) {
            return Err(Error::TunCreate {
                name: ifname.to_string(),
                reason: "interface already exists".into(),
            });
        }

        let backend = Arc::new(MemoryBackend::new(ifname, mtu));
        devices.insert(ifname.to_string(), backend.clone());
        Ok(Box::new(SharedBackend(backend)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::protocol::{parse_dump, InterfaceConfig, PeerConfig};

    fn key(byte: &str) -> String {
        byte.repeat(32)
    }

    #[test]
    fn test_set_then_get() {
        let dev = MemoryBackend::new("wg0", 1420);
        dev.ipc_set(
            &InterfaceConfig::new()
                .private_key(key("11"))
                .listen_port(51820)
                .fwmark(7)
                .to_uapi(),
        )
        .unwrap();
        dev.ipc_set(
            &PeerConfig::new(key("aa"))
                .persistent_keepalive(25)
                .allowed_ip("10.8.0.2/32")
                .to_uapi(),
        )
        .unwrap();

        let dump = parse_dump(&dev.ipc_get().unwrap()).unwrap();
        assert_eq!(dump.private_key, Some(key("11")));
        assert_eq!(dump.listen_port, 51820);
        assert_eq!(dump.fwmark, 7);
        assert_eq!(dump.peers.len(), 1);
        assert_eq!(dump.peers[0].allowed_ips, vec!["10.8.0.2/32"]);
    }

    #[test]
    fn test_remove_and_replace() {
        let dev = MemoryBackend::new("wg0", 1420);
        dev.ipc_set(&PeerConfig::new(key("aa")).allowed_ip("10.8.0.2/32").to_uapi())
            .unwrap();
        dev.ipc_set(&PeerConfig::new(key("bb")).allowed_ip("10.8.0.3/32").to_uapi())
            .unwrap();
        dev.ipc_set(&crate::device::protocol::remove_peer(&key("aa")))
            .unwrap();
        assert_eq!(dev.peer_keys(), vec![key("bb")]);

        dev.ipc_set(
            &PeerConfig::new(key("bb"))
                .replace_allowed_ips()
                .allowed_ip("10.8.0.9/32")
                .to_uapi(),
        )
        .unwrap();
        let dump = parse_dump(&dev.ipc_get().unwrap()).unwrap();
        assert_eq!(dump.peers[0].allowed_ips, vec!["10.8.0.9/32"]);
    }

    #[test]
    fn test_rejected_body_is_atomic() {
        let dev = MemoryBackend::new("wg0", 1420);
        let err = dev
            .ipc_set(&format!("listen_port=1234\npublic_key={}\nbogus=1\n", key("aa")))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(dev.peer_keys().is_empty());
        assert!(!dev.ipc_get().unwrap().contains("listen_port=1234"));

        assert!(dev.ipc_set("public_key=nothex\n").is_err());
        assert!(dev.ipc_set("mtu=1400\n").is_err());
    }

    #[test]
    fn test_allowed_ip_moves_between_peers() {
        let dev = MemoryBackend::new("wg0", 1420);
        dev.ipc_set(&PeerConfig::new(key("aa")).allowed_ip("10.8.0.2/32").to_uapi())
            .unwrap();
        dev.ipc_set(&PeerConfig::new(key("bb")).allowed_ip("10.8.0.2/32").to_uapi())
            .unwrap();
        let dump = parse_dump(&dev.ipc_get().unwrap()).unwrap();
        assert!(dump.peer(&key("aa")).unwrap().allowed_ips.is_empty());
        assert_eq!(dump.peer(&key("bb")).unwrap().allowed_ips, vec!["10.8.0.2/32"]);
    }

    #[test]
    fn test_closed_device_rejects_io() {
        let dev = MemoryBackend::new("wg0", 1420);
        dev.up().unwrap();
        assert!(dev.is_up());
        dev.close().unwrap();
        assert!(!dev.is_up());
        assert!(matches!(dev.ipc_get(), Err(Error::DeviceClosed(_))));
        assert!(matches!(dev.up(), Err(Error::DeviceUp(_))));
    }

    #[test]
    fn test_factory_failure_injection() {
        let factory = MemoryFactory::new();
        factory.fail_interface("wg-hop0");
        assert!(matches!(
            factory.create("wg-hop0", 1420),
            Err(Error::TunCreate { .. })
        ));
        factory.heal_interface("wg-hop0");

        let dev = factory.create("wg-hop0", 1380).unwrap();
        assert!(factory.create("wg-hop0", 1380).is_err());
        assert_eq!(factory.backend("wg-hop0").unwrap().mtu(), 1380);

        dev.close().unwrap();
        assert!(factory.create("wg-hop0", 1380).is_ok());
    }
}
