//! Stats Syncer
//!
//! Background worker that periodically reads the primary device's live
//! counters and writes them into the peer roster. Runs on its own small
//! tokio runtime so it works regardless of the host's threading model.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::device::{Device, DeviceDump};
use crate::error::{Error, Result};
use crate::store::{PeerStats, Store};

/// The primary device as seen by the syncer. Empty while the bridge is
/// not running; ticks with no device are skipped.
pub type DeviceSlot = Arc<RwLock<Option<Arc<Device>>>>;

/// Per-peer counters from a device dump
pub fn peer_stats(dump: &DeviceDump) -> Vec<PeerStats> {
    dump.peers
        .iter()
        .map(|peer| PeerStats {
            public_key: peer.public_key.clone(),
            endpoint: peer.endpoint.clone(),
            last_handshake: (peer.last_handshake_sec > 0).then_some(peer.last_handshake_sec),
            rx_bytes: peer.rx_bytes,
            tx_bytes: peer.tx_bytes,
        })
        .collect()
}

/// Run one sync pass, returning how many peers were written
pub fn sync_once(store: &Store, slot: &DeviceSlot) -> Result<usize> {
    let device = match slot.read() {
        Ok(guard) => guard.clone(),
        Err(_) => return Err(Error::Internal("device slot lock poisoned".into())),
    };
    let Some(device) = device else {
        return Ok(0);
    };

    let dump = device.dump()?;
    let mut written = 0;
    for stats in peer_stats(&dump) {
        match store.update_peer_stats(&stats) {
            Ok(()) => written += 1,
            Err(e) => tracing::debug!("Stats write for {} skipped: {}", stats.public_key, e),
        }
    }
    Ok(written)
}

/// Handle on a running syncer
pub struct StatsSyncer {
    runtime: Option<Runtime>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    interval: Duration,
}

impl StatsSyncer {
    /// Start ticking every `interval`. The first tick fires one interval
    /// after start.
    pub fn start(store: Arc<Store>, slot: DeviceSlot, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::InvalidParam("stats interval must be positive".into()));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .thread_name("wolfbridge-stats")
            .enable_time()
            .build()?;

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let store = Arc::clone(&store);
                        let slot = Arc::clone(&slot);
                        match tokio::task::spawn_blocking(move || sync_once(&store, &slot)).await {
                            Ok(Ok(written)) => tracing::trace!("Stats synced for {} peers", written),
                            Ok(Err(e)) => tracing::debug!("Stats tick skipped: {}", e),
                            Err(e) => tracing::warn!("Stats tick panicked: {}", e),
                        }
                    }
                }
            }
            tracing::debug!("Stats syncer stopped");
        });

        tracing::info!("Stats syncer started (interval {:?})", interval);

        Ok(Self {
            runtime: Some(runtime),
            stop_tx: Some(stop_tx),
            task: Some(task),
            interval,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Signal the worker and wait for any in-flight tick to finish.
    ///
    /// Blocks the calling thread; must not be called from inside an async
    /// context.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let (Some(runtime), Some(task)) = (self.runtime.as_ref(), self.task.take()) {
            if let Err(e) = runtime.block_on(task) {
                tracing::warn!("Stats syncer task failed: {}", e);
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

impl Drop for StatsSyncer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemoryFactory, PeerConfig};
    use crate::store::tests::temp_store;
    use crate::store::NewClient;

    fn seed(store: &Store, key: &str) {
        store
            .insert_client(&NewClient {
                public_key: key.to_string(),
                preshared_key: None,
                private_key: "ee".repeat(32),
                allowed_ip: "10.8.0.2/32".to_string(),
                allowed_ip_v6: None,
                keepalive: 25,
            })
            .unwrap();
    }

    fn live_device(factory: &MemoryFactory, key: &str) -> Arc<Device> {
        let device = Device::create(factory, "wg0", 1420).unwrap();
        device
            .add_peer(&PeerConfig::new(key).allowed_ip("10.8.0.2/32"))
            .unwrap();
        factory
            .backend("wg0")
            .unwrap()
            .record_traffic(key, "198.51.100.20:40000", 1_700_000_500, 300, 700)
            .unwrap();
        Arc::new(device)
    }

    #[test]
    fn test_sync_once_writes_counters() {
        let (_dir, store) = temp_store();
        let key = "ab".repeat(32);
        seed(&store, &key);

        let factory = MemoryFactory::new();
        let slot: DeviceSlot = Arc::new(RwLock::new(Some(live_device(&factory, &key))));

        assert_eq!(sync_once(&store, &slot).unwrap(), 1);
        let client = store.client(&key).unwrap();
        assert_eq!(client.endpoint.as_deref(), Some("198.51.100.20:40000"));
        assert_eq!(client.last_handshake, Some(1_700_000_500));
        assert_eq!((client.rx_bytes, client.tx_bytes), (300, 700));
    }

    #[test]
    fn test_empty_slot_and_closed_device() {
        let (_dir, store) = temp_store();
        let slot: DeviceSlot = Arc::new(RwLock::new(None));
        assert_eq!(sync_once(&store, &slot).unwrap(), 0);

        let factory = MemoryFactory::new();
        let device = live_device(&factory, &"ab".repeat(32));
        device.close().unwrap();
        *slot.write().unwrap() = Some(device);
        assert!(sync_once(&store, &slot).is_err());
    }

    #[test]
    fn test_zero_handshake_is_null() {
        let dump = crate::device::protocol::parse_dump(
            "listen_port=1\npublic_key=aa\nlast_handshake_time_sec=0\nrx_bytes=5\n",
        )
        .unwrap();
        let stats = peer_stats(&dump);
        assert_eq!(stats.len(), 1);
        assert!(stats[0].last_handshake.is_none());
        assert_eq!(stats[0].rx_bytes, 5);
    }

    #[test]
    fn test_background_ticks_and_stop() {
        let (_dir, store) = temp_store();
        let key = "cd".repeat(32);
        seed(&store, &key);

        let factory = MemoryFactory::new();
        let slot: DeviceSlot = Arc::new(RwLock::new(Some(live_device(&factory, &key))));
        let store = Arc::new(store);

        let mut syncer =
            StatsSyncer::start(Arc::clone(&store), slot, Duration::from_millis(20)).unwrap();
        assert_eq!(syncer.interval(), Duration::from_millis(20));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.client(&key).unwrap().rx_bytes == 0 {
            assert!(std::time::Instant::now() < deadline, "syncer never ticked");
            std::thread::sleep(Duration::from_millis(10));
        }
        syncer.stop();
        syncer.stop();
    }

    #[test]
    fn test_zero_interval_rejected() {
        let (_dir, store) = temp_store();
        let slot: DeviceSlot = Arc::new(RwLock::new(None));
        assert!(StatsSyncer::start(Arc::new(store), slot, Duration::ZERO).is_err());
    }
}
