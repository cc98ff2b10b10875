//! State Orchestrator
//!
//! Sequences the store, the IP pool, the primary device, multihop devices
//! and the stats syncer into one lifecycle:
//!
//! ```text
//! Uninitialized -> NeedsSetup -> Ready <-> Running
//!        ^              any failed transition -> Error
//!        +---- Close / re-Init from any state
//! ```
//!
//! Every mutating operation holds the write lock for its full duration;
//! reads take the shared lock. Device and store calls inside are blocking.

mod export;
mod multihop;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{defaults, BridgeConfig};
use crate::device::{self, Device, DeviceFactory, InterfaceConfig, PeerConfig};
use crate::error::{Error, Result};
use crate::keys::{self, KeyPair};
use crate::logging;
use crate::stats::{DeviceSlot, StatsSyncer};
use crate::store::{self, AddressFamily, ClientList, ClientRecord, NewClient, ServerConfig, Store};

pub use export::{parse_client_config, render_client_config, ClientExport, ParsedClientConfig};
pub use multihop::CreateTunnel;

/// Lifecycle state of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Uninitialized,
    NeedsSetup,
    Ready,
    Running,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Uninitialized => "uninitialized",
            Status::NeedsSetup => "needs_setup",
            Status::Ready => "ready",
            Status::Running => "running",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bridge status plus store diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusInfo {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub has_device: bool,
    pub has_config: bool,
    pub peer_count: i64,
    pub multihop_count: i64,
}

/// Primary device metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub public_key: String,
    pub listen_port: u16,
    pub peer_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
}

/// Initial server settings. Unset fields get defaults.
#[derive(Debug, Clone, Default)]
pub struct SetupRequest {
    pub endpoint: Option<String>,
    pub network: Option<String>,
    pub dns_primary: Option<String>,
    pub dns_secondary: Option<String>,
    pub mtu: u32,
    pub fwmark: u32,
}

struct Inner {
    status: Status,
    last_error: Option<String>,
    config: BridgeConfig,
    store: Option<Arc<Store>>,
    factory: Option<Arc<dyn DeviceFactory>>,
    ifname: String,
    /// Primary device, shared with the stats syncer
    device: DeviceSlot,
    /// Live multihop devices by tunnel name
    multihop: HashMap<String, Device>,
    syncer: Option<StatsSyncer>,
    next_peer_index: i64,
}

impl Inner {
    fn new() -> Self {
        Self {
            status: Status::Uninitialized,
            last_error: None,
            config: BridgeConfig::default(),
            store: None,
            factory: None,
            ifname: String::new(),
            device: Arc::new(RwLock::new(None)),
            multihop: HashMap::new(),
            syncer: None,
            next_peer_index: 0,
        }
    }

    fn store(&self) -> Result<&Arc<Store>> {
        self.store.as_ref().ok_or(Error::NotInitialized)
    }

    fn factory(&self) -> Result<&Arc<dyn DeviceFactory>> {
        self.factory.as_ref().ok_or(Error::NotInitialized)
    }

    /// Fail unless the bridge is in one of `allowed`
    fn require(&self, op: &'static str, allowed: &[Status]) -> Result<()> {
        if self.status == Status::Uninitialized {
            return Err(Error::NotInitialized);
        }
        if !allowed.contains(&self.status) {
            return Err(Error::InvalidState {
                op,
                status: self.status.to_string(),
            });
        }
        Ok(())
    }

    fn require_running(&self, op: &'static str) -> Result<()> {
        self.require(op, &[Status::Running])
    }

    fn require_initialized(&self) -> Result<&Arc<Store>> {
        if self.status == Status::Uninitialized {
            return Err(Error::NotInitialized);
        }
        self.store()
    }

    fn device(&self) -> Result<Arc<Device>> {
        self.device
            .read()
            .map_err(|_| Error::Internal("device slot lock poisoned".into()))?
            .clone()
            .ok_or_else(|| Error::InvalidState {
                op: "device",
                status: self.status.to_string(),
            })
    }

    fn take_device(&self) -> Option<Arc<Device>> {
        match self.device.write() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn set_device(&self, device: Arc<Device>) {
        match self.device.write() {
            Ok(mut slot) => *slot = Some(device),
            Err(poisoned) => *poisoned.into_inner() = Some(device),
        }
    }

    fn set_error(&mut self, message: String) {
        warn!("Bridge error: {}", message);
        self.status = Status::Error;
        self.last_error = Some(message);
    }

    /// Put a client on the primary device
    fn apply_peer(&self, device: &Device, client: &ClientRecord) -> Result<()> {
        let mut peer = PeerConfig::new(&client.public_key)
            .preshared_key(client.preshared_key.as_deref())
            .persistent_keepalive(client.keepalive)
            .replace_allowed_ips()
            .allowed_ip(&client.allowed_ip);
        if let Some(v6) = &client.allowed_ip_v6 {
            peer = peer.allowed_ip(v6);
        }
        device.add_peer(&peer)
    }

    /// Record the device index of a peer that just went live
    fn mark_live(&mut self, public_key: &str) {
        self.next_peer_index += 1;
        if let Ok(store) = self.store() {
            if let Err(e) = store.set_peer_index(public_key, Some(self.next_peer_index)) {
                debug!("Failed to record peer index for {}: {}", public_key, e);
            }
        }
    }

    fn stop_syncer(&mut self) {
        if let Some(mut syncer) = self.syncer.take() {
            syncer.stop();
        }
    }

    fn close_multihop_devices(&mut self) {
        for (name, device) in self.multihop.drain() {
            if let Err(e) = device.close() {
                warn!("Failed to close multihop tunnel {}: {}", name, e);
            }
        }
    }

    fn close_primary_device(&self) {
        if let Some(device) = self.take_device() {
            if let Err(e) = device.down() {
                debug!("Device {} down: {}", device.name(), e);
            }
            if let Err(e) = device.close() {
                warn!("Failed to close device {}: {}", device.name(), e);
            }
        }
    }

    /// Wipe ephemeral state written by a running bridge
    fn clear_runtime(&self) {
        if let Some(store) = &self.store {
            let results = [
                store.clear_runtime_state(),
                store.clear_multihop_runtime_state(),
                store.set_device_started_at(None),
            ];
            for result in results {
                if let Err(e) = result {
                    warn!("Failed to clear runtime state: {}", e);
                }
            }
        }
    }

    /// Tear everything down and return to Uninitialized
    fn close(&mut self) {
        self.stop_syncer();
        self.close_multihop_devices();
        self.clear_runtime();
        self.close_primary_device();

        if let Some(store) = self.store.take() {
            match Arc::try_unwrap(store) {
                Ok(store) => {
                    if let Err(e) = store.close() {
                        warn!("Failed to close store: {}", e);
                    }
                }
                Err(_) => debug!("Store still referenced; dropped without explicit close"),
            }
        }

        self.factory = None;
        self.status = Status::Uninitialized;
        self.last_error = None;
        self.next_peer_index = 0;
    }
}

/// The process-wide bridge
pub struct BridgeState {
    inner: RwLock<Inner>,
    config_override: Mutex<Option<BridgeConfig>>,
    factory_override: Mutex<Option<Arc<dyn DeviceFactory>>>,
}

impl BridgeState {
    /// An uninitialized bridge using the configured device backend
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
            config_override: Mutex::new(None),
            factory_override: Mutex::new(None),
        }
    }

    /// An uninitialized bridge creating devices through `factory`
    pub fn with_factory(factory: Arc<dyn DeviceFactory>) -> Self {
        let bridge = Self::new();
        if let Ok(mut slot) = bridge.factory_override.lock() {
            *slot = Some(factory);
        }
        bridge
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::Internal("bridge lock poisoned".into()))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Internal("bridge lock poisoned".into()))
    }

    /// Use `config` from the next Init on, instead of `WOLFBRIDGE_CONFIG`
    pub fn load_config(&self, config: BridgeConfig) -> Result<()> {
        config.validate()?;
        *self
            .config_override
            .lock()
            .map_err(|_| Error::Internal("config lock poisoned".into()))? = Some(config);
        Ok(())
    }

    fn resolve_config(&self) -> Result<BridgeConfig> {
        let explicit = self
            .config_override
            .lock()
            .map_err(|_| Error::Internal("config lock poisoned".into()))?
            .clone();
        match explicit {
            Some(config) => Ok(config),
            None => BridgeConfig::from_env(),
        }
    }

    fn resolve_factory(&self, config: &BridgeConfig) -> Result<Arc<dyn DeviceFactory>> {
        let explicit = self
            .factory_override
            .lock()
            .map_err(|_| Error::Internal("factory lock poisoned".into()))?
            .clone();
        Ok(explicit.unwrap_or_else(|| device::factory_for(config)))
    }

    /// Factory for standalone devices: the initialized bridge's, else the
    /// one the current configuration selects
    pub fn device_factory(&self) -> Result<Arc<dyn DeviceFactory>> {
        if let Some(factory) = self.read()?.factory.clone() {
            return Ok(factory);
        }
        let config = self.resolve_config()?;
        self.resolve_factory(&config)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Open the store and determine whether setup is needed.
    ///
    /// Re-initializing an initialized bridge closes it first. The tunnel
    /// device is not created until Start. A negative `log_level` falls back
    /// to `[logging] level`.
    pub fn init(&self, db_path: &Path, ifname: &str, listen_port: u16, log_level: i32) -> Result<()> {
        let mut inner = self.write()?;

        if inner.status != Status::Uninitialized {
            info!("Re-initializing bridge; closing previous instance");
            inner.close();
        }

        if ifname.is_empty() || ifname.len() > 15 {
            return Err(Error::InvalidParam(format!("invalid interface name: {:?}", ifname)));
        }

        let config = self.resolve_config()?;
        logging::global().set_max_level(config.log_level(log_level));
        let factory = self.resolve_factory(&config)?;

        let store = match Store::open(db_path, config.busy_timeout()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                inner.set_error(e.to_string());
                return Err(e);
            }
        };

        let configured = match prepare_store(&store, ifname, listen_port) {
            Ok(configured) => configured,
            Err(e) => {
                inner.set_error(format!("init {}: {}", db_path.display(), e));
                return Err(e);
            }
        };

        inner.config = config;
        inner.factory = Some(factory);
        inner.store = Some(store);
        inner.ifname = ifname.to_string();
        inner.last_error = None;
        inner.status = if configured { Status::Ready } else { Status::NeedsSetup };

        info!("Bridge initialized: {} ({})", db_path.display(), inner.status);
        Ok(())
    }

    /// Write the server configuration and populate the IP pool
    pub fn setup(&self, request: &SetupRequest) -> Result<()> {
        let mut inner = self.write()?;
        inner.require("setup", &[Status::NeedsSetup, Status::Ready])?;
        let store = Arc::clone(inner.store()?);

        let existing = store.server_config()?;
        let mut config = existing.clone().unwrap_or_default();
        config.endpoint = request.endpoint.clone();
        config.network = request.network.clone().unwrap_or_default();
        config.dns_primary = request.dns_primary.clone().unwrap_or_default();
        config.dns_secondary = request.dns_secondary.clone();
        config.mtu = request.mtu;
        config.fwmark = request.fwmark;
        config.normalize();
        config.validate()?;

        if let Some(old) = &existing {
            if old.network != config.network && store.pool_count(AddressFamily::V4)? > 0 {
                warn!(
                    "Network changed from {} to {}; existing pool entries are kept",
                    old.network, config.network
                );
            }
        }

        // The pool goes first so a refused subnet leaves no config behind
        store.init_ip_pool(&config.network, config.network_v6.as_deref())?;
        store.upsert_server_config(&config)?;

        inner.status = Status::Ready;
        info!("Bridge setup complete (network {})", config.network);
        Ok(())
    }

    /// Create the primary device from stored state and restore peers and
    /// enabled multihop tunnels
    pub fn start(&self) -> Result<()> {
        let mut inner = self.write()?;
        inner.require("start", &[Status::Ready])?;
        let store = Arc::clone(inner.store()?);
        let factory = Arc::clone(inner.factory()?);

        let stored = store.device().and_then(|record| Ok((record, store.server_config()?)));
        let (record, server) = match stored {
            Ok((Some(record), Some(server))) => (record, server),
            Ok((_, None)) => {
                return Err(Error::InvalidState {
                    op: "start",
                    status: Status::NeedsSetup.to_string(),
                })
            }
            Ok((None, _)) => {
                let e = Error::Internal("device record missing".into());
                inner.set_error(format!("start: {}", e));
                return Err(e);
            }
            Err(e) => {
                inner.set_error(format!("start: {}", e));
                return Err(e);
            }
        };

        let device = match Self::bring_up(&*factory, &inner.ifname, &record.private_key, record.listen_port, &server) {
            Ok(device) => Arc::new(device),
            Err(e) => {
                let message = format!("start {}: {}", inner.ifname, e);
                inner.set_error(message);
                return Err(e);
            }
        };

        // The device is up; nothing below may fail the transition
        inner.set_device(Arc::clone(&device));
        inner.next_peer_index = 0;
        if let Err(e) = store.set_device_started_at(Some(store::now())) {
            warn!("Failed to record start time: {}", e);
        }

        match store.enabled_clients() {
            Ok(clients) => {
                let mut restored = 0;
                for client in &clients {
                    match inner.apply_peer(&device, client) {
                        Ok(()) => {
                            inner.mark_live(&client.public_key);
                            restored += 1;
                        }
                        Err(e) => warn!("Failed to restore peer {}: {}", client.public_key, e),
                    }
                }
                info!("Restored {}/{} enabled peers", restored, clients.len());
            }
            Err(e) => warn!("Failed to read enabled peers: {}", e),
        }

        inner.restore_multihop_tunnels();

        inner.status = Status::Running;
        inner.last_error = None;
        info!("Bridge running on {}", device.name());
        Ok(())
    }

    fn bring_up(
        factory: &dyn DeviceFactory,
        ifname: &str,
        private_key: &str,
        listen_port: u16,
        server: &ServerConfig,
    ) -> Result<Device> {
        let device = Device::create(factory, ifname, server.mtu)?;
        device.configure(
            &InterfaceConfig::new()
                .private_key(private_key)
                .listen_port(listen_port)
                .fwmark(server.fwmark),
        )?;
        device.up()?;
        Ok(device)
    }

    /// Tear down live devices and return to Ready. Stored configuration
    /// and multihop intent are untouched.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.write()?;
        inner.require_running("stop")?;

        inner.close_multihop_devices();
        inner.close_primary_device();
        inner.clear_runtime();

        inner.status = Status::Ready;
        info!("Bridge stopped");
        Ok(())
    }

    /// Release everything and return to Uninitialized
    pub fn close(&self) -> Result<()> {
        let mut inner = self.write()?;
        if inner.status == Status::Uninitialized {
            return Err(Error::NotInitialized);
        }
        inner.close();
        info!("Bridge closed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Clients
    // ---------------------------------------------------------------------

    /// Create a client with fresh keys and put it on the device.
    ///
    /// Without `requested_ip` an IPv4 address is taken from the pool. An
    /// IPv6 address is added when the server has an IPv6 subnet; failing to
    /// get one does not fail the call.
    pub fn add_client(&self, requested_ip: Option<&str>) -> Result<ClientRecord> {
        let mut inner = self.write()?;
        inner.require_running("add_client")?;
        let store = Arc::clone(inner.store()?);
        let device = inner.device()?;
        let server = store.server_config()?.unwrap_or_default();

        let requested = match requested_ip.map(str::trim).filter(|ip| !ip.is_empty()) {
            Some(ip) => Some(normalize_v4_host(ip)?),
            None => None,
        };

        let pair = KeyPair::generate()?;
        let psk = keys::generate_preshared_key();
        let public_key = pair.public_key.clone();

        let id = store.insert_client(&NewClient {
            public_key: public_key.clone(),
            preshared_key: Some(psk),
            private_key: pair.private_key,
            allowed_ip: requested
                .clone()
                .unwrap_or_else(|| format!("pending:{}", public_key)),
            allowed_ip_v6: None,
            keepalive: defaults::KEEPALIVE,
        })?;

        // Any failure from here on must not leave the row or its addresses behind
        let applied = assign_addresses(&store, &server, id, requested.as_deref())
            .and_then(|()| store.client(&public_key))
            .and_then(|client| inner.apply_peer(&device, &client));
        if let Err(e) = applied {
            rollback_client(&store, &public_key);
            return Err(e);
        }
        inner.mark_live(&public_key);

        let client = store.client(&public_key)?;
        info!("Client added: {} ({})", public_key, client.allowed_ip);
        Ok(client)
    }

    /// Remove a client from the device and the roster, releasing its addresses
    pub fn remove_client(&self, public_key: &str) -> Result<()> {
        let inner = self.write()?;
        inner.require_running("remove_client")?;
        let store = inner.store()?;
        store.client(public_key)?;

        if let Err(e) = inner.device()?.remove_peer(public_key) {
            warn!("Failed to remove peer {} from device: {}", public_key, e);
        }
        store.delete_client(public_key)?;

        info!("Client removed: {}", public_key);
        Ok(())
    }

    /// Put a client back on the device and flag it enabled
    pub fn enable_client(&self, public_key: &str) -> Result<()> {
        let mut inner = self.write()?;
        inner.require_running("enable_client")?;
        let store = Arc::clone(inner.store()?);
        let client = store.client(public_key)?;

        inner.apply_peer(&*inner.device()?, &client)?;
        store.set_client_enabled(public_key, true)?;
        inner.mark_live(public_key);

        info!("Client enabled: {}", public_key);
        Ok(())
    }

    /// Take a client off the device and flag it disabled. Keys and
    /// addresses are kept.
    pub fn disable_client(&self, public_key: &str) -> Result<()> {
        let inner = self.write()?;
        inner.require_running("disable_client")?;
        let store = inner.store()?;
        store.client(public_key)?;

        inner.device()?.remove_peer(public_key)?;
        store.set_client_enabled(public_key, false)?;

        info!("Client disabled: {}", public_key);
        Ok(())
    }

    pub fn get_client(&self, public_key: &str) -> Result<ClientRecord> {
        let inner = self.read()?;
        inner.require_initialized()?.client(public_key)
    }

    /// One page of clients. Page and limit are clamped, never rejected.
    pub fn list_clients(&self, page: i64, limit: i64) -> Result<ClientList> {
        let inner = self.read()?;
        inner.require_initialized()?.list_clients(page, limit)
    }

    /// Client configuration document for a client.
    ///
    /// `endpoint` and `dns` override the stored server values when given.
    pub fn export_client_config(
        &self,
        public_key: &str,
        endpoint: Option<&str>,
        dns: Option<&str>,
    ) -> Result<String> {
        let inner = self.read()?;
        let store = inner.require_initialized()?;

        let client = store.client(public_key)?;
        let record = store
            .device()?
            .ok_or_else(|| Error::Internal("device record missing".into()))?;
        let server = store.server_config()?.unwrap_or_default();

        let endpoint = store::non_empty(endpoint)
            .map(str::to_string)
            .or_else(|| server.endpoint.clone())
            .ok_or_else(|| Error::InvalidParam("no server endpoint configured".into()))?;
        let dns = store::non_empty(dns)
            .map(str::to_string)
            .unwrap_or_else(|| server.dns_string());

        render_client_config(&ClientExport {
            client: &client,
            server_public_key: &record.public_key,
            endpoint: &endpoint,
            dns: &dns,
            mtu: server.mtu,
            prefix_v4: server.prefix_len_v4().unwrap_or(24),
            prefix_v6: server.prefix_len_v6().unwrap_or(64),
        })
    }

    // ---------------------------------------------------------------------
    // Server configuration
    // ---------------------------------------------------------------------

    pub fn get_server_config(&self) -> Result<ServerConfig> {
        let inner = self.read()?;
        inner
            .require_initialized()?
            .server_config()?
            .ok_or(Error::InvalidState {
                op: "get_server_config",
                status: Status::NeedsSetup.to_string(),
            })
    }

    /// Replace the server configuration from JSON.
    ///
    /// A newly configured IPv6 subnet populates its pool. While running, a
    /// changed socket mark is applied to the live device.
    pub fn set_server_config(&self, json: &str) -> Result<()> {
        let mut inner = self.write()?;
        let store = Arc::clone(inner.require_initialized()?);

        let mut config: ServerConfig = serde_json::from_str(json)?;
        config.normalize();
        config.validate()?;

        let previous = store.server_config()?;
        // The pool goes first so a refused subnet leaves no config behind
        store.init_ip_pool(&config.network, config.network_v6.as_deref())?;
        store.upsert_server_config(&config)?;

        if inner.status == Status::NeedsSetup {
            inner.status = Status::Ready;
        }

        let previous_mark = previous.map(|p| p.fwmark).unwrap_or(0);
        if inner.status == Status::Running && config.fwmark != previous_mark {
            match inner.device().and_then(|d| d.set_fwmark(config.fwmark)) {
                Ok(()) => info!("Applied fwmark {} to live device", config.fwmark),
                Err(e) => warn!("Failed to apply fwmark {}: {}", config.fwmark, e),
            }
        }

        Ok(())
    }

    // ---------------------------------------------------------------------
    // Stats
    // ---------------------------------------------------------------------

    /// Start the stats syncer. A non-positive interval uses `[stats] interval_secs`.
    pub fn start_stats_sync(&self, interval_secs: i64) -> Result<()> {
        let mut inner = self.write()?;
        let store = Arc::clone(inner.require_initialized()?);
        if inner.syncer.is_some() {
            return Err(Error::StatsRunning);
        }

        let interval = if interval_secs > 0 {
            Duration::from_secs(interval_secs as u64)
        } else {
            inner.config.stats_interval()
        };
        let syncer = StatsSyncer::start(store, Arc::clone(&inner.device), interval)?;
        inner.syncer = Some(syncer);
        Ok(())
    }

    /// Stop the stats syncer if it runs
    pub fn stop_stats_sync(&self) -> Result<()> {
        let mut inner = self.write()?;
        inner.stop_syncer();
        Ok(())
    }

    pub fn stats_running(&self) -> bool {
        self.read().map(|i| i.syncer.is_some()).unwrap_or(false)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn get_device_info(&self) -> Result<DeviceInfo> {
        let inner = self.read()?;
        let store = inner.require_initialized()?;
        let record = store
            .device()?
            .ok_or_else(|| Error::Internal("device record missing".into()))?;

        Ok(DeviceInfo {
            name: record.name,
            public_key: record.public_key,
            listen_port: record.listen_port,
            peer_count: store.client_count()?,
            started_at: record.started_at,
        })
    }

    /// Raw "get" dump of the live primary device
    pub fn get_device_dump(&self) -> Result<String> {
        let inner = self.read()?;
        inner.require_running("get_device_dump")?;
        inner.device()?.ipc_get()
    }

    /// Current status. Store counts are best effort and reported in any state.
    pub fn get_status(&self) -> StatusInfo {
        let inner = match self.read() {
            Ok(inner) => inner,
            Err(e) => {
                return StatusInfo {
                    status: Status::Error,
                    error: Some(e.to_string()),
                    has_device: false,
                    has_config: false,
                    peer_count: 0,
                    multihop_count: 0,
                }
            }
        };

        let summary = inner
            .store
            .as_ref()
            .and_then(|store| store.summary().ok())
            .unwrap_or_default();

        StatusInfo {
            status: inner.status,
            error: inner.last_error.clone(),
            has_device: summary.has_device,
            has_config: summary.has_config,
            peer_count: summary.peer_count,
            multihop_count: summary.multihop_count,
        }
    }

    pub fn status(&self) -> Status {
        self.read().map(|i| i.status).unwrap_or(Status::Error)
    }
}

impl Default for BridgeState {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BridgeState {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut() {
            if inner.status != Status::Uninitialized {
                inner.close();
            }
        }
    }
}

/// Give a freshly inserted client its IPv4 address (requested or pooled)
/// and, when the server has an IPv6 subnet, an IPv6 address.
///
/// A requested address inside the server subnet must be a pool address, so
/// the network, gateway and broadcast addresses are refused. Failing to get
/// an IPv6 address is only logged.
fn assign_addresses(store: &Store, server: &ServerConfig, id: i64, requested: Option<&str>) -> Result<()> {
    match requested {
        Some(ip) => {
            if !store.claim_ip(id, ip)? && server.contains_v4(ip) {
                return Err(Error::InvalidParam(format!(
                    "{} is reserved in {}",
                    ip, server.network
                )));
            }
        }
        None => {
            let ip = store.allocate_ip(id, AddressFamily::V4)?;
            store.set_client_address(id, &ip)?;
        }
    }

    if server.has_ipv6() {
        match store
            .allocate_ip(id, AddressFamily::V6)
            .and_then(|ip| store.set_client_address_v6(id, Some(&ip)))
        {
            Ok(()) => {}
            Err(e) => warn!("No IPv6 address for peer {}: {}", id, e),
        }
    }
    Ok(())
}

/// Clear state left by a crash and make sure the device record matches the
/// requested binding. Returns whether a server config is stored.
fn prepare_store(store: &Store, ifname: &str, listen_port: u16) -> Result<bool> {
    store.clear_runtime_state()?;
    store.clear_multihop_runtime_state()?;
    store.set_device_started_at(None)?;

    match store.device()? {
        None => {
            let pair = KeyPair::generate()?;
            store.upsert_device(ifname, &pair.private_key, &pair.public_key, listen_port)?;
            info!("Generated device keypair for {}", ifname);
        }
        Some(record) if record.name != ifname || record.listen_port != listen_port => {
            store.update_device_binding(ifname, listen_port)?;
            info!(
                "Device binding changed: {}:{} -> {}:{}",
                record.name, record.listen_port, ifname, listen_port
            );
        }
        Some(_) => {}
    }

    Ok(store.server_config()?.is_some())
}

/// Undo a partially created client
fn rollback_client(store: &Store, public_key: &str) {
    if let Err(e) = store.delete_client(public_key) {
        warn!("Rollback of client {} failed: {}", public_key, e);
    }
}

/// Accept `a.b.c.d` or `a.b.c.d/32` and return the host-prefix form
fn normalize_v4_host(ip: &str) -> Result<String> {
    let host = ip.split('/').next().unwrap_or(ip);
    let addr: std::net::Ipv4Addr = host
        .parse()
        .map_err(|_| Error::InvalidParam(format!("invalid IPv4 address: {}", ip)))?;
    if let Some(prefix) = ip.split('/').nth(1) {
        if prefix != "32" {
            return Err(Error::InvalidParam(format!("client address must be a /32: {}", ip)));
        }
    }
    Ok(format!("{}/32", addr))
}
