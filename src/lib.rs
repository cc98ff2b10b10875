//! WolfBridge - Native Tunnel-Device Bridge
//!
//! A shared library that a host control process loads to manage a tunnel
//! server: it owns the persistent state (device keys, server settings, the
//! client roster, the IP pool and multihop tunnels), drives the tunnel
//! devices through their configuration protocol, and exposes it all over a
//! flat C ABI.
//!
//! # Architecture
//!
//! ```text
//!   host process
//!       |  C ABI (ffi)
//!   BridgeState ---- Store (SQLite, WAL)
//!       |                 ^
//!   Device(s) <---- StatsSyncer (tokio)
//!       |
//!   TunnelBackend: userspace process over UAPI socket | in-memory model
//! ```
//!
//! # Features
//!
//! - Lifecycle state machine with crash recovery from durable `enabled` flags
//! - Sequential IPv4/IPv6 pool allocation with gap reuse
//! - Multihop tunnels chained through upstream servers
//! - Periodic traffic statistics into the client roster
//! - Client configuration export
//! - Host log callback fed by `tracing`

pub mod bridge;
pub mod config;
pub mod device;
pub mod error;
pub mod ffi;
pub mod keys;
pub mod logging;
pub mod registry;
pub mod stats;
pub mod store;

pub use bridge::{BridgeState, Status, StatusInfo};
pub use config::BridgeConfig;
pub use error::{Error, Result};

/// Version reported by `BridgeVersion`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
