//! Userspace tunnel implementation driven over its UAPI socket
//!
//! Spawns the configured implementation in the foreground for one
//! interface, waits for `<socket_dir>/<ifname>.sock`, then exchanges
//! "set"/"get" operations over the Unix socket. Link state is changed with
//! `ip link`.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::protocol::parse_errno;
use super::{DeviceFactory, TunnelBackend};
use crate::config::{BridgeConfig, DeviceConfig};
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns one userspace process per interface
pub struct UserspaceFactory {
    device: DeviceConfig,
}

impl UserspaceFactory {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            device: config.device.clone(),
        }
    }

    fn wait_for_socket(&self, ifname: &str, socket: &Path, child: &mut Child) -> Result<()> {
        let timeout = self.device.startup_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if socket.exists() {
                return Ok(());
            }
            let exited = match child.try_wait() {
                Ok(exited) => exited,
                Err(e) => {
                    stop_child(child);
                    return Err(e.into());
                }
            };
            if let Some(status) = exited {
                return Err(Error::TunCreate {
                    name: ifname.to_string(),
                    reason: format!("{} exited with {}", self.device.userspace_command, status),
                });
            }
            if Instant::now() >= deadline {
                stop_child(child);
                return Err(Error::TunCreate {
                    name: ifname.to_string(),
                    reason: format!("no UAPI socket at {} after {:?}", socket.display(), timeout),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Kill and reap a child that will not be handed to a backend
fn stop_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("kill {}: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        debug!("wait {}: {}", child.id(), e);
    }
}

impl DeviceFactory for UserspaceFactory {
    fn create(&self, ifname: &str, mtu: u32) -> Result<Box<dyn TunnelBackend>> {
        let socket = self.device.socket_path(ifname);
        if socket.exists() {
            return Err(Error::TunCreate {
                name: ifname.to_string(),
                reason: format!("{} already in use", socket.display()),
            });
        }

        let command = &self.device.userspace_command;
        let mut child = Command::new(command)
            .args(["-f", ifname])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::TunCreate {
                name: ifname.to_string(),
                reason: format!("failed to start {}: {}", command, e),
            })?;

        self.wait_for_socket(ifname, &socket, &mut child)?;
        debug!("{} listening on {}", ifname, socket.display());

        if let Err(e) = ip_link(ifname, &["mtu", &mtu.to_string()]) {
            warn!("Failed to set MTU on {}: {}", ifname, e);
        }

        Ok(Box::new(UserspaceBackend {
            name: ifname.to_string(),
            socket,
            child: Mutex::new(Some(child)),
        }))
    }
}

/// One running userspace device
pub struct UserspaceBackend {
    name: String,
    socket: PathBuf,
    child: Mutex<Option<Child>>,
}

impl UserspaceBackend {
    /// Send one operation and collect the response up to its blank line
    fn transact(&self, request: &str) -> Result<String> {
        let mut stream = UnixStream::connect(&self.socket)
            .map_err(|e| Error::Device(format!("{}: connect {}: {}", self.name, self.socket.display(), e)))?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        stream.write_all(request.as_bytes())?;

        let mut response = String::new();
        for line in BufReader::new(stream).lines() {
            let line = line?;
            if line.is_empty() {
                break;
            }
            response.push_str(&line);
            response.push('\n');
        }
        Ok(response)
    }
}

fn ip_link(ifname: &str, args: &[&str]) -> Result<()> {
    let status = Command::new("ip")
        .args(["link", "set", "dev", ifname])
        .args(args)
        .status()?;
    if !status.success() {
        return Err(Error::Device(format!(
            "ip link set dev {} {} failed: {}",
            ifname,
            args.join(" "),
            status
        )));
    }
    Ok(())
}

impl TunnelBackend for UserspaceBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn ipc_set(&self, config: &str) -> Result<()> {
        let body = config.trim_end_matches('\n');
        let response = self.transact(&format!("set=1\n{}\n\n", body))?;
        parse_errno(&response)
    }

    fn ipc_get(&self) -> Result<String> {
        let response = self.transact("get=1\n\n")?;
        parse_errno(&response)?;
        Ok(response)
    }

    fn up(&self) -> Result<()> {
        ip_link(&self.name, &["up"]).map_err(|e| Error::DeviceUp(e.to_string()))
    }

    fn down(&self) -> Result<()> {
        ip_link(&self.name, &["down"]).map_err(|e| Error::DeviceDown(e.to_string()))
    }

    fn close(&self) -> Result<()> {
        let child = self
            .child
            .lock()
            .map_err(|_| Error::Internal(format!("{}: child lock poisoned", self.name)))?
            .take();

        if let Some(mut child) = child {
            if child.try_wait()?.is_none() {
                child.kill()?;
            }
            child.wait()?;
        }
        if self.socket.exists() {
            std::fs::remove_file(&self.socket)?;
        }
        Ok(())
    }
}
