//! Tunnel devices
//!
//! A [`Device`] owns one backend bound to one interface name and tracks
//! its lifecycle. Backends speak the textual configuration protocol in
//! [`protocol`]; the packet path and handshakes live behind them.

pub mod memory;
pub mod protocol;
pub mod userspace;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{BackendKind, BridgeConfig};
use crate::error::{Error, Result};

pub use memory::{MemoryBackend, MemoryFactory};
pub use protocol::{DeviceDump, InterfaceConfig, PeerConfig, PeerDump};
pub use userspace::{UserspaceBackend, UserspaceFactory};

/// A live tunnel device implementation
pub trait TunnelBackend: Send + Sync {
    /// Interface name
    fn name(&self) -> &str;

    /// Apply a "set" body
    fn ipc_set(&self, config: &str) -> Result<()>;

    /// Read a "get" dump
    fn ipc_get(&self) -> Result<String>;

    /// Bring the interface up
    fn up(&self) -> Result<()>;

    /// Take the interface down
    fn down(&self) -> Result<()>;

    /// Release the interface. Called at most once by [`Device`].
    fn close(&self) -> Result<()>;
}

/// Creates backends for interface names
pub trait DeviceFactory: Send + Sync {
    fn create(&self, ifname: &str, mtu: u32) -> Result<Box<dyn TunnelBackend>>;
}

/// Factory selected by `[device] backend`
pub fn factory_for(config: &BridgeConfig) -> Arc<dyn DeviceFactory> {
    match config.device.backend {
        BackendKind::Userspace => Arc::new(UserspaceFactory::new(config)),
        BackendKind::Memory => Arc::new(MemoryFactory::new()),
    }
}

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Created,
    Up,
    Down,
    Closed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Created => "created",
            DeviceState::Up => "up",
            DeviceState::Down => "down",
            DeviceState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Lifecycle wrapper around one backend
pub struct Device {
    name: String,
    backend: Box<dyn TunnelBackend>,
    state: Mutex<DeviceState>,
}

impl Device {
    /// Create the interface through a factory
    pub fn create(factory: &dyn DeviceFactory, ifname: &str, mtu: u32) -> Result<Self> {
        if ifname.is_empty() || ifname.len() > 15 {
            return Err(Error::InvalidParam(format!("invalid interface name: {:?}", ifname)));
        }
        let backend = factory.create(ifname, mtu)?;
        tracing::debug!("Device {} created (mtu {})", ifname, mtu);
        Ok(Self::from_backend(backend))
    }

    /// Wrap an existing backend
    pub fn from_backend(backend: Box<dyn TunnelBackend>) -> Self {
        Self {
            name: backend.name().to_string(),
            backend,
            state: Mutex::new(DeviceState::Created),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state_guard(&self) -> Result<MutexGuard<'_, DeviceState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal(format!("{}: device state lock poisoned", self.name)))
    }

    pub fn state(&self) -> DeviceState {
        self.state_guard().map(|s| *s).unwrap_or(DeviceState::Closed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == DeviceState::Closed {
            return Err(Error::DeviceClosed(self.name.clone()));
        }
        Ok(())
    }

    /// Apply a raw "set" body
    pub fn ipc_set(&self, config: &str) -> Result<()> {
        self.ensure_open()?;
        self.backend.ipc_set(config)
    }

    /// Read the raw "get" dump
    pub fn ipc_get(&self) -> Result<String> {
        self.ensure_open()?;
        self.backend.ipc_get()
    }

    /// Apply device-level settings
    pub fn configure(&self, config: &InterfaceConfig) -> Result<()> {
        self.ipc_set(&config.to_uapi())
    }

    /// Add or update a peer
    pub fn add_peer(&self, peer: &PeerConfig) -> Result<()> {
        self.ipc_set(&peer.to_uapi())
    }

    /// Remove a peer. Removing an unknown peer is not an error.
    pub fn remove_peer(&self, public_key: &str) -> Result<()> {
        self.ipc_set(&protocol::remove_peer(public_key))
    }

    /// Change the socket mark of the device's sockets
    pub fn set_fwmark(&self, mark: u32) -> Result<()> {
        self.ipc_set(&protocol::fwmark(mark))
    }

    /// Parsed "get" dump
    pub fn dump(&self) -> Result<DeviceDump> {
        protocol::parse_dump(&self.ipc_get()?)
    }

    pub fn up(&self) -> Result<()> {
        let mut state = self.state_guard()?;
        match *state {
            DeviceState::Closed => Err(Error::DeviceUp(format!("{} is closed", self.name))),
            DeviceState::Up => Ok(()),
            _ => {
                self.backend.up()?;
                *state = DeviceState::Up;
                Ok(())
            }
        }
    }

    pub fn down(&self) -> Result<()> {
        let mut state = self.state_guard()?;
        match *state {
            DeviceState::Closed => Err(Error::DeviceDown(format!("{} is closed", self.name))),
            DeviceState::Up => {
                self.backend.down()?;
                *state = DeviceState::Down;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Release the interface. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state_guard()?;
        if *state == DeviceState::Closed {
            return Ok(());
        }
        *state = DeviceState::Closed;
        drop(state);

        tracing::debug!("Device {} closed", self.name);
        self.backend.close()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close device {}: {}", self.name, e);
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let factory = MemoryFactory::new();
        let dev = Device::create(&factory, "wg0", 1420).unwrap();
        assert_eq!(dev.state(), DeviceState::Created);

        dev.configure(&InterfaceConfig::new().listen_port(51820)).unwrap();
        dev.up().unwrap();
        dev.up().unwrap();
        assert!(factory.backend("wg0").unwrap().is_up());

        dev.down().unwrap();
        assert_eq!(dev.state(), DeviceState::Down);
        dev.up().unwrap();

        dev.close().unwrap();
        dev.close().unwrap();
        assert_eq!(dev.state(), DeviceState::Closed);
        assert!(factory.backend("wg0").unwrap().is_closed());
        assert!(matches!(dev.dump(), Err(Error::DeviceClosed(_))));
        assert!(matches!(dev.up(), Err(Error::DeviceUp(_))));
    }

    #[test]
    fn test_drop_closes_backend() {
        let factory = MemoryFactory::new();
        {
            let _dev = Device::create(&factory, "wg1", 1420).unwrap();
        }
        assert!(factory.backend("wg1").unwrap().is_closed());
    }

    #[test]
    fn test_peer_helpers() {
        let factory = MemoryFactory::new();
        let dev = Device::create(&factory, "wg0", 1420).unwrap();
        let key = "ab".repeat(32);

        dev.add_peer(&PeerConfig::new(&key).allowed_ip("10.8.0.2/32")).unwrap();
        dev.set_fwmark(51820).unwrap();
        let dump = dev.dump().unwrap();
        assert_eq!(dump.fwmark, 51820);
        assert!(dump.peer(&key).is_some());

        dev.remove_peer(&key).unwrap();
        dev.remove_peer(&key).unwrap();
        assert!(dev.dump().unwrap().peers.is_empty());
    }

    #[test]
    fn test_rejects_bad_interface_name() {
        let factory = MemoryFactory::new();
        assert!(matches!(
            Device::create(&factory, "", 1420),
            Err(Error::InvalidParam(_))
        ));
        assert!(Device::create(&factory, "a-very-long-interface", 1420).is_err());
    }
}
