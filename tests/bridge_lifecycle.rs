//! End-to-end orchestrator behaviour over the in-memory device backend

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::{tempdir, TempDir};

use wolfbridge::bridge::{parse_client_config, CreateTunnel, SetupRequest};
use wolfbridge::device::{MemoryFactory, TunnelBackend};
use wolfbridge::keys;
use wolfbridge::store::{AddressFamily, Store, TunnelStatus};
use wolfbridge::{BridgeConfig, BridgeState, Error, Status};

struct Harness {
    dir: TempDir,
    factory: Arc<MemoryFactory>,
    bridge: BridgeState,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        Self::with_dir(dir)
    }

    fn with_dir(dir: TempDir) -> Self {
        let factory = Arc::new(MemoryFactory::new());
        let bridge = BridgeState::with_factory(factory.clone());
        bridge.load_config(BridgeConfig::default()).unwrap();
        Self { dir, factory, bridge }
    }

    fn db(&self) -> PathBuf {
        self.dir.path().join("bridge.db")
    }

    fn init(&self) {
        self.bridge.init(&self.db(), "wg0", 51820, 2).unwrap();
    }

    fn setup(&self, network: &str) {
        self.bridge
            .setup(&SetupRequest {
                endpoint: Some("vpn.example.com:51820".into()),
                network: Some(network.into()),
                dns_primary: Some("9.9.9.9".into()),
                ..Default::default()
            })
            .unwrap();
    }

    fn running(network: &str) -> Self {
        let harness = Self::new();
        harness.init();
        harness.setup(network);
        harness.bridge.start().unwrap();
        harness
    }

    fn store(&self) -> Store {
        Store::open(&self.db(), Duration::from_secs(5)).unwrap()
    }
}

fn hop(name: &str, iface: &str, priority: u32) -> CreateTunnel {
    CreateTunnel {
        name: name.into(),
        interface_name: iface.into(),
        remote_endpoint: "203.0.113.5:51820".into(),
        remote_public_key: keys::KeyPair::generate().unwrap().public_key,
        fwmark: 51821,
        priority: Some(priority),
        ..Default::default()
    }
}

#[test]
fn operations_outside_their_states_are_rejected() {
    let h = Harness::new();
    assert!(matches!(h.bridge.add_client(None), Err(Error::NotInitialized)));
    assert!(matches!(h.bridge.list_clients(1, 10), Err(Error::NotInitialized)));
    assert_eq!(h.bridge.get_status().status, Status::Uninitialized);

    h.init();
    let status = h.bridge.get_status();
    assert_eq!(status.status, Status::NeedsSetup);
    assert!(status.has_device);
    assert!(!status.has_config);

    for result in [h.bridge.start(), h.bridge.stop(), h.bridge.remove_client("ab")] {
        assert!(result.unwrap_err().is_state_error());
    }

    h.setup("10.8.0.0/24");
    assert!(h.bridge.add_client(None).unwrap_err().is_state_error());
    assert!(h.bridge.get_device_dump().unwrap_err().is_state_error());

    h.bridge.start().unwrap();
    assert_eq!(h.bridge.status(), Status::Running);
    h.bridge.close().unwrap();
    assert_eq!(h.bridge.status(), Status::Uninitialized);
    assert!(h.factory.backend("wg0").unwrap().is_closed());
}

#[test]
fn allocation_is_injective_and_sequential() {
    let h = Harness::running("10.8.0.0/24");

    let clients: Vec<_> = (0..20).map(|_| h.bridge.add_client(None).unwrap()).collect();
    let addresses: HashSet<_> = clients.iter().map(|c| c.allowed_ip.clone()).collect();
    assert_eq!(addresses.len(), clients.len());
    assert_eq!(clients[0].allowed_ip, "10.8.0.2/32");
    assert_eq!(clients[19].allowed_ip, "10.8.0.21/32");

    let usage = h.store().pool_usage().unwrap();
    assert_eq!((usage[0].total, usage[0].assigned), (253, 20));
}

#[test]
fn freed_address_is_reused_first() {
    let h = Harness::running("10.8.0.0/24");
    let a = h.bridge.add_client(None).unwrap();
    let b = h.bridge.add_client(None).unwrap();
    let c = h.bridge.add_client(None).unwrap();
    assert_eq!(b.allowed_ip, "10.8.0.3/32");

    h.bridge.remove_client(&b.public_key).unwrap();
    let d = h.bridge.add_client(None).unwrap();
    assert_eq!(d.allowed_ip, b.allowed_ip);

    let live: HashSet<_> = h.factory.backend("wg0").unwrap().peer_keys().into_iter().collect();
    let expected: HashSet<_> = [a.public_key, c.public_key, d.public_key].into_iter().collect();
    assert_eq!(live, expected);
}

#[test]
fn pool_population_is_idempotent() {
    let h = Harness::new();
    h.init();
    h.setup("10.8.0.0/24");
    let store = h.store();
    assert_eq!(store.pool_count(AddressFamily::V4).unwrap(), 253);

    h.setup("10.8.0.0/24");
    h.bridge.init(&h.db(), "wg0", 51820, 0).unwrap();
    h.setup("10.8.0.0/24");
    assert_eq!(store.pool_count(AddressFamily::V4).unwrap(), 253);
    assert_eq!(h.bridge.status(), Status::Ready);
}

#[test]
fn crash_recovery_restores_enabled_state_only() {
    let h = Harness::running("10.8.0.0/24");
    let client = h.bridge.add_client(None).unwrap();
    let disabled = h.bridge.add_client(None).unwrap();
    h.bridge.disable_client(&disabled.public_key).unwrap();

    h.bridge.create_multihop_tunnel(&hop("hop-us", "wg-hop0", 100)).unwrap();
    h.bridge.create_multihop_tunnel(&hop("hop-eu", "wg-hop1", 200)).unwrap();
    h.bridge.create_multihop_tunnel(&hop("hop-idle", "wg-hop2", 300)).unwrap();
    h.bridge.start_multihop_tunnel("hop-us").unwrap();
    h.bridge.start_multihop_tunnel("hop-eu").unwrap();

    // Simulate a crash: nothing gets torn down or cleaned up
    let Harness { dir, bridge, .. } = h;
    std::mem::forget(bridge);

    let h = Harness::with_dir(dir);
    h.init();
    assert_eq!(h.bridge.status(), Status::Ready);
    let stale = h.bridge.get_multihop_tunnel("hop-us").unwrap();
    assert_eq!(stale.status, TunnelStatus::Stopped);
    assert!(stale.started_at.is_none());
    assert!(stale.enabled);
    assert!(h.bridge.get_client(&client.public_key).unwrap().peer_index.is_none());
    assert!(h.bridge.get_device_info().unwrap().started_at.is_none());

    h.bridge.start().unwrap();
    assert_eq!(
        h.factory.backend("wg0").unwrap().peer_keys(),
        vec![client.public_key.clone()]
    );
    for name in ["hop-us", "hop-eu"] {
        assert_eq!(
            h.bridge.get_multihop_tunnel(name).unwrap().status,
            TunnelStatus::Running
        );
    }
    assert_eq!(
        h.bridge.get_multihop_tunnel("hop-idle").unwrap().status,
        TunnelStatus::Stopped
    );
    assert!(h.factory.backend("wg-hop2").is_none());
    assert_eq!(h.bridge.live_multihop_tunnels(), vec!["hop-eu", "hop-us"]);
}

#[test]
fn exported_config_round_trips() {
    let h = Harness::running("10.8.0.0/24");
    let client = h.bridge.add_client(None).unwrap();
    let server_key = h.bridge.get_device_info().unwrap().public_key;

    let text = h.bridge.export_client_config(&client.public_key, None, None).unwrap();
    let parsed = parse_client_config(&text).unwrap();

    assert_eq!(parsed.public_key, server_key);
    assert_eq!(parsed.private_key, client.private_key);
    assert_eq!(keys::derive_public_key(&parsed.private_key).unwrap(), client.public_key);
    assert_eq!(parsed.preshared_key, client.preshared_key);
    assert_eq!(parsed.addresses, vec!["10.8.0.2/24"]);
    assert_eq!(parsed.allowed_ips, vec!["0.0.0.0/0"]);
    assert_eq!(parsed.endpoint.as_deref(), Some("vpn.example.com:51820"));
    assert_eq!(parsed.dns, vec!["9.9.9.9"]);

    let overridden = h
        .bridge
        .export_client_config(&client.public_key, Some("198.51.100.1:443"), Some("10.0.0.53"))
        .unwrap();
    let parsed = parse_client_config(&overridden).unwrap();
    assert_eq!(parsed.endpoint.as_deref(), Some("198.51.100.1:443"));
    assert_eq!(parsed.dns, vec!["10.0.0.53"]);

    assert!(matches!(
        h.bridge.export_client_config(&"ff".repeat(32), None, None),
        Err(Error::ClientNotFound(_))
    ));
}

#[test]
fn disable_then_enable_preserves_client() {
    let h = Harness::running("10.8.0.0/24");
    let client = h.bridge.add_client(None).unwrap();
    let backend = h.factory.backend("wg0").unwrap();

    h.bridge.disable_client(&client.public_key).unwrap();
    assert!(backend.peer_keys().is_empty());
    let disabled = h.bridge.get_client(&client.public_key).unwrap();
    assert!(!disabled.enabled);
    assert!(disabled.peer_index.is_none());

    h.bridge.enable_client(&client.public_key).unwrap();
    let enabled = h.bridge.get_client(&client.public_key).unwrap();
    assert!(enabled.enabled);
    assert!(enabled.peer_index.is_some());
    assert_eq!(backend.peer_keys(), vec![client.public_key.clone()]);

    assert_eq!(enabled.private_key, client.private_key);
    assert_eq!(enabled.preshared_key, client.preshared_key);
    assert_eq!(enabled.allowed_ip, client.allowed_ip);
    assert_eq!(enabled.allowed_ip_v6, client.allowed_ip_v6);
    assert_eq!(enabled.created_at, client.created_at);

    let dump = backend.ipc_get().unwrap();
    assert!(dump.contains("allowed_ip=10.8.0.2/32"));
}

#[test]
fn removing_a_client_releases_its_address() {
    let h = Harness::running("10.8.0.0/30");
    let client = h.bridge.add_client(None).unwrap();
    assert!(matches!(
        h.bridge.add_client(None),
        Err(Error::PoolExhausted { family: 4 })
    ));

    h.bridge.remove_client(&client.public_key).unwrap();
    assert!(matches!(
        h.bridge.get_client(&client.public_key),
        Err(Error::ClientNotFound(_))
    ));
    assert!(matches!(
        h.bridge.remove_client(&client.public_key),
        Err(Error::ClientNotFound(_))
    ));

    let next = h.bridge.add_client(None).unwrap();
    assert_eq!(next.allowed_ip, client.allowed_ip);
}

#[test]
fn fwmark_change_reaches_live_device() {
    let h = Harness::running("10.8.0.0/24");
    assert!(!h.bridge.get_device_dump().unwrap().contains("fwmark="));

    let mut config = h.bridge.get_server_config().unwrap();
    config.fwmark = 51820;
    h.bridge
        .set_server_config(&serde_json::to_string(&config).unwrap())
        .unwrap();

    assert!(h.bridge.get_device_dump().unwrap().contains("fwmark=51820"));
    assert_eq!(h.bridge.get_server_config().unwrap().fwmark, 51820);

    // Restart applies the stored mark from the start
    h.bridge.stop().unwrap();
    h.bridge.start().unwrap();
    assert!(h.bridge.get_device_dump().unwrap().contains("fwmark=51820"));
}

#[test]
fn stats_syncer_writes_live_counters() {
    let h = Harness::running("10.8.0.0/24");
    let client = h.bridge.add_client(None).unwrap();
    h.factory
        .backend("wg0")
        .unwrap()
        .record_traffic(&client.public_key, "198.51.100.7:50000", 1_700_000_000, 4096, 1024)
        .unwrap();

    h.bridge.start_stats_sync(1).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let current = h.bridge.get_client(&client.public_key).unwrap();
        if current.rx_bytes > 0 {
            assert_eq!((current.rx_bytes, current.tx_bytes), (4096, 1024));
            assert_eq!(current.endpoint.as_deref(), Some("198.51.100.7:50000"));
            assert_eq!(current.last_handshake, Some(1_700_000_000));
            break;
        }
        assert!(Instant::now() < deadline, "stats never synced");
        std::thread::sleep(Duration::from_millis(50));
    }

    // Stop keeps the syncer alive but leaves it nothing to read
    h.bridge.stop().unwrap();
    assert!(h.bridge.stats_running());
    h.bridge.stop_stats_sync().unwrap();
}
