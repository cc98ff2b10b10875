//! Multihop tunnel lifecycle
//!
//! Each tunnel gets its own device whose single peer is the upstream
//! server. `enabled` in the store is the durable intent restored after a
//! restart; `status` is the runtime outcome and is reset on every start.

use std::sync::Arc;

use tracing::{info, warn};

use super::{BridgeState, Inner};
use crate::config::defaults;
use crate::device::{Device, DeviceFactory, InterfaceConfig, PeerConfig};
use crate::error::{Error, Result};
use crate::keys::{self, KeyPair};
use crate::store::{self, MultihopTunnel, MultihopUpdate, NewMultihopTunnel, TunnelStatus};

/// Parameters for a new multihop tunnel. Unset optionals get defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateTunnel {
    pub name: String,
    pub interface_name: String,
    pub remote_endpoint: String,
    /// Upstream server key, hex or base64
    pub remote_public_key: String,
    pub fwmark: u32,
    pub listen_port: u16,
    pub remote_preshared_key: Option<String>,
    pub remote_allowed_ips: Option<String>,
    pub remote_keepalive: Option<u32>,
    pub priority: Option<u32>,
}

/// Create, configure and raise the device for one tunnel
fn bring_up(factory: &dyn DeviceFactory, tunnel: &MultihopTunnel, mtu: u32) -> Result<Device> {
    let device = Device::create(factory, &tunnel.interface_name, mtu)?;
    device.configure(
        &InterfaceConfig::new()
            .private_key(tunnel.private_key.as_str())
            .listen_port(tunnel.listen_port)
            .fwmark(tunnel.fwmark),
    )?;
    device.add_peer(&upstream_peer(tunnel))?;
    device.up()?;
    Ok(device)
}

fn upstream_peer(tunnel: &MultihopTunnel) -> PeerConfig {
    tunnel.allowed_ranges().fold(
        PeerConfig::new(tunnel.remote_public_key.as_str())
            .preshared_key(tunnel.remote_preshared_key.as_deref())
            .endpoint(tunnel.remote_endpoint.as_str())
            .persistent_keepalive(tunnel.remote_keepalive)
            .replace_allowed_ips(),
        |peer, range| peer.allowed_ip(range),
    )
}

impl Inner {
    /// Start a tunnel's device and record the outcome in the store
    fn start_tunnel(&mut self, tunnel: &MultihopTunnel) -> Result<()> {
        let store = Arc::clone(self.store()?);
        let factory = Arc::clone(self.factory()?);

        match bring_up(&*factory, tunnel, self.config.device.default_mtu) {
            Ok(device) => {
                self.multihop.insert(tunnel.name.clone(), device);
                store.set_multihop_status(&tunnel.name, TunnelStatus::Running, None, Some(store::now()))?;
                info!("Multihop tunnel {} up on {}", tunnel.name, tunnel.interface_name);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(write_err) =
                    store.set_multihop_status(&tunnel.name, TunnelStatus::Error, Some(&message), None)
                {
                    warn!("Failed to record status of {}: {}", tunnel.name, write_err);
                }
                Err(e)
            }
        }
    }

    /// Close a tunnel's device if it is live. Returns whether it was.
    fn stop_tunnel(&mut self, name: &str) -> bool {
        match self.multihop.remove(name) {
            Some(device) => {
                if let Err(e) = device.close() {
                    warn!("Failed to close multihop tunnel {}: {}", name, e);
                }
                true
            }
            None => false,
        }
    }

    /// Bring up every enabled tunnel; failures are recorded per tunnel
    pub(super) fn restore_multihop_tunnels(&mut self) {
        let tunnels = match self.store().and_then(|s| s.enabled_multihop_tunnels()) {
            Ok(tunnels) => tunnels,
            Err(e) => {
                warn!("Failed to read enabled multihop tunnels: {}", e);
                return;
            }
        };

        let mut restored = 0;
        for tunnel in &tunnels {
            if self.multihop.contains_key(&tunnel.name) {
                continue;
            }
            match self.start_tunnel(tunnel) {
                Ok(()) => restored += 1,
                Err(e) => warn!("Failed to restore multihop tunnel {}: {}", tunnel.name, e),
            }
        }
        if !tunnels.is_empty() {
            info!("Restored {}/{} multihop tunnels", restored, tunnels.len());
        }
    }
}

impl BridgeState {
    /// Create a tunnel record with a fresh local keypair. The tunnel starts
    /// disabled and stopped.
    pub fn create_multihop_tunnel(&self, request: &CreateTunnel) -> Result<MultihopTunnel> {
        let inner = self.read()?;
        let store = inner.require_initialized()?;

        let name = request.name.trim();
        if name.is_empty() {
            return Err(Error::InvalidParam("tunnel name is required".into()));
        }
        let iface = request.interface_name.trim();
        if iface.is_empty() || iface.len() > 15 {
            return Err(Error::InvalidParam(format!("invalid interface name: {:?}", iface)));
        }
        if iface == inner.ifname {
            return Err(Error::InvalidParam(format!("{} is the primary interface", iface)));
        }
        if request.remote_endpoint.trim().is_empty() {
            return Err(Error::InvalidParam("remote endpoint is required".into()));
        }
        let remote_public_key = keys::normalize_key(&request.remote_public_key)?;
        let remote_preshared_key = match store::non_empty(request.remote_preshared_key.as_deref()) {
            Some(psk) => Some(keys::normalize_key(psk)?),
            None => None,
        };
        let remote_allowed_ips = store::non_empty(request.remote_allowed_ips.as_deref())
            .unwrap_or(defaults::MULTIHOP_ALLOWED_IPS)
            .to_string();
        store::validate_allowed_ips(&remote_allowed_ips)?;

        let pair = KeyPair::generate()?;
        let tunnel = store.insert_multihop_tunnel(&NewMultihopTunnel {
            name: name.to_string(),
            interface_name: iface.to_string(),
            listen_port: request.listen_port,
            private_key: pair.private_key,
            public_key: pair.public_key,
            remote_endpoint: request.remote_endpoint.trim().to_string(),
            remote_public_key,
            remote_preshared_key,
            remote_allowed_ips,
            remote_keepalive: request.remote_keepalive.unwrap_or(defaults::KEEPALIVE),
            fwmark: request.fwmark,
            routing_table: defaults::MULTIHOP_ROUTING_TABLE.to_string(),
            routing_table_id: defaults::MULTIHOP_ROUTING_TABLE_ID,
            priority: request.priority.unwrap_or(defaults::MULTIHOP_PRIORITY),
        })?;

        info!("Multihop tunnel created: {} ({})", tunnel.name, tunnel.interface_name);
        Ok(tunnel)
    }

    /// Bring a tunnel up and mark it enabled. Requires a running bridge.
    pub fn start_multihop_tunnel(&self, name: &str) -> Result<()> {
        let mut inner = self.write()?;
        inner.require_running("start_multihop_tunnel")?;
        let store = Arc::clone(inner.store()?);
        let tunnel = store.multihop_tunnel(name)?;

        if inner.multihop.contains_key(name) {
            return Err(Error::AlreadyExists(format!("multihop tunnel {} is running", name)));
        }

        inner.start_tunnel(&tunnel)?;
        store.set_multihop_enabled(name, true)?;
        Ok(())
    }

    /// Take a tunnel down. Its restore intent is kept.
    pub fn stop_multihop_tunnel(&self, name: &str) -> Result<()> {
        let mut inner = self.write()?;
        let store = Arc::clone(inner.require_initialized()?);
        store.multihop_tunnel(name)?;

        if inner.stop_tunnel(name) {
            info!("Multihop tunnel {} stopped", name);
        }
        store.set_multihop_status(name, TunnelStatus::Stopped, None, None)
    }

    /// Take a tunnel down and clear its restore intent
    pub fn disable_multihop_tunnel(&self, name: &str) -> Result<()> {
        let mut inner = self.write()?;
        let store = Arc::clone(inner.require_initialized()?);
        store.multihop_tunnel(name)?;

        inner.stop_tunnel(name);
        store.set_multihop_status(name, TunnelStatus::Stopped, None, None)?;
        store.set_multihop_enabled(name, false)?;
        info!("Multihop tunnel {} disabled", name);
        Ok(())
    }

    /// Stop a tunnel if live and remove it from the roster
    pub fn delete_multihop_tunnel(&self, name: &str) -> Result<()> {
        let mut inner = self.write()?;
        let store = Arc::clone(inner.require_initialized()?);
        store.multihop_tunnel(name)?;

        inner.stop_tunnel(name);
        store.delete_multihop_tunnel(name)?;
        info!("Multihop tunnel {} deleted", name);
        Ok(())
    }

    /// Apply a partial JSON update. A live tunnel is reconfigured in place.
    pub fn update_multihop_tunnel(&self, name: &str, json: &str) -> Result<MultihopTunnel> {
        let inner = self.write()?;
        let store = inner.require_initialized()?;
        let mut tunnel = store.multihop_tunnel(name)?;
        let previous_remote = tunnel.remote_public_key.clone();

        let mut update: MultihopUpdate = serde_json::from_str(json)?;
        if let Some(key) = update.remote_public_key.take() {
            update.remote_public_key = Some(keys::normalize_key(&key)?);
        }
        if let Some(psk) = update.remote_preshared_key.take() {
            update.remote_preshared_key = Some(match store::non_empty(Some(psk.as_str())) {
                Some(psk) => keys::normalize_key(psk)?,
                None => String::new(),
            });
        }
        if let Some(ranges) = &update.remote_allowed_ips {
            store::validate_allowed_ips(ranges)?;
        }
        if let Some(endpoint) = update.remote_endpoint.take() {
            if endpoint.trim().is_empty() {
                return Err(Error::InvalidParam("remote endpoint is required".into()));
            }
            update.remote_endpoint = Some(endpoint.trim().to_string());
        }
        update.apply(&mut tunnel);
        store.update_multihop_tunnel(&tunnel)?;

        if let Some(device) = inner.multihop.get(name) {
            if previous_remote != tunnel.remote_public_key {
                device.remove_peer(&previous_remote)?;
            }
            device.configure(&InterfaceConfig::new().listen_port(tunnel.listen_port))?;
            device.set_fwmark(tunnel.fwmark)?;
            device.add_peer(&upstream_peer(&tunnel))?;
            info!("Multihop tunnel {} reconfigured", name);
        }

        store.multihop_tunnel(name)
    }

    pub fn get_multihop_tunnel(&self, name: &str) -> Result<MultihopTunnel> {
        let inner = self.read()?;
        inner.require_initialized()?.multihop_tunnel(name)
    }

    pub fn list_multihop_tunnels(&self) -> Result<Vec<MultihopTunnel>> {
        let inner = self.read()?;
        inner.require_initialized()?.list_multihop_tunnels()
    }

    /// Names of tunnels with a live device
    pub fn live_multihop_tunnels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .map(|inner| inner.multihop.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
