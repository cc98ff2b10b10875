//! C ABI
//!
//! Flat entry points over the process-wide [`BridgeState`] and the device
//! handle registry.
//!
//! Conventions:
//! - `int32_t` results are `0` on success or a negative status code (see
//!   [`crate::error::code`]).
//! - `char*` results are heap strings owned by the caller and released with
//!   [`FreeString`]; null means failure.
//! - After any failure the message is available from [`BridgeGetLastError`]
//!   on the same thread.
//! - No panic crosses the boundary; one is reported as an internal error.

use std::cell::RefCell;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::OnceLock;

use serde::Serialize;

use crate::bridge::{BridgeState, CreateTunnel, SetupRequest};
use crate::config::BridgeConfig;
use crate::device::Device;
use crate::error::{code, Error, Result};
use crate::keys;
use crate::logging::{self, LogCallback};
use crate::registry::HandleRegistry;

fn bridge() -> &'static BridgeState {
    static BRIDGE: OnceLock<BridgeState> = OnceLock::new();
    BRIDGE.get_or_init(BridgeState::new)
}

fn devices() -> &'static HandleRegistry<Device> {
    static DEVICES: OnceLock<HandleRegistry<Device>> = OnceLock::new();
    DEVICES.get_or_init(HandleRegistry::new)
}

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_last_error(message: String) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

/// Run `f`, converting an error or a panic into a recorded message
fn guarded<T>(f: impl FnOnce() -> Result<T>) -> std::result::Result<T, i32> {
    clear_last_error();
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            set_last_error(e.to_string());
            Err(e.code())
        }
        Err(_) => {
            set_last_error("internal panic".to_string());
            Err(code::INTERNAL)
        }
    }
}

fn status(f: impl FnOnce() -> Result<()>) -> i32 {
    match guarded(f) {
        Ok(()) => code::OK,
        Err(code) => code,
    }
}

fn into_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(s) => s.into_raw(),
        Err(_) => {
            set_last_error("result contains an interior NUL byte".to_string());
            std::ptr::null_mut()
        }
    }
}

fn string_result(f: impl FnOnce() -> Result<String>) -> *mut c_char {
    match guarded(f) {
        Ok(s) => into_c_string(s),
        Err(_) => std::ptr::null_mut(),
    }
}

fn json_result<T: Serialize>(f: impl FnOnce() -> Result<T>) -> *mut c_char {
    string_result(|| Ok(serde_json::to_string(&f()?)?))
}

/// Borrow a required string argument
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives
/// the call.
unsafe fn required<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(Error::InvalidParam(format!("{} is required", what)));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| Error::InvalidParam(format!("{} is not valid UTF-8", what)))
}

/// Borrow an optional string argument; null and empty are both None
///
/// # Safety
/// As [`required`].
unsafe fn optional<'a>(ptr: *const c_char, what: &str) -> Result<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    let value = required(ptr, what)?;
    Ok((!value.is_empty()).then_some(value))
}

fn non_negative_u32(value: c_int, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::InvalidParam(format!("{} must not be negative: {}", what, value)))
}

fn port(value: c_int) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::InvalidParam(format!("invalid listen port: {}", value)))
}

// -------------------------------------------------------------------------
// Logging and process configuration
// -------------------------------------------------------------------------

/// Register the log callback, or remove it with null
///
/// # Safety
/// `context` is passed back to `callback` untouched and must stay valid for
/// as long as the callback is registered.
#[no_mangle]
pub unsafe extern "C" fn BridgeSetLogCallback(callback: Option<LogCallback>, context: *mut c_void) {
    logging::install();
    logging::global().set_callback(callback, context);
}

/// Load process settings from a TOML file for the next Init
///
/// # Safety
/// `path` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn BridgeLoadConfig(path: *const c_char) -> i32 {
    status(|| {
        let path = required(path, "path")?;
        bridge().load_config(BridgeConfig::from_file(Path::new(path))?)
    })
}

/// Message of the last failure on this thread, or null
#[no_mangle]
pub extern "C" fn BridgeGetLastError() -> *mut c_char {
    match LAST_ERROR.with(|slot| slot.borrow().clone()) {
        Some(message) => into_c_string(message),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn BridgeVersion() -> *mut c_char {
    into_c_string(crate::VERSION.to_string())
}

/// Release a string returned by this library
///
/// # Safety
/// `ptr` must be null or a pointer returned by this library that has not
/// been freed yet.
#[no_mangle]
pub unsafe extern "C" fn FreeString(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// -------------------------------------------------------------------------
// Lifecycle
// -------------------------------------------------------------------------

/// # Safety
/// String arguments must be valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn BridgeInit(
    db_path: *const c_char,
    ifname: *const c_char,
    listen_port: c_int,
    log_level: c_int,
) -> i32 {
    logging::install();
    status(|| {
        let db_path = required(db_path, "db_path")?;
        let ifname = required(ifname, "ifname")?;
        bridge().init(Path::new(db_path), ifname, port(listen_port)?, log_level)
    })
}

#[no_mangle]
pub extern "C" fn BridgeGetStatus() -> *mut c_char {
    json_result(|| Ok(bridge().get_status()))
}

/// # Safety
/// String arguments must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn BridgeSetup(
    endpoint: *const c_char,
    network: *const c_char,
    dns_primary: *const c_char,
    dns_secondary: *const c_char,
    mtu: c_int,
    fwmark: c_int,
) -> i32 {
    status(|| {
        let request = SetupRequest {
            endpoint: optional(endpoint, "endpoint")?.map(str::to_string),
            network: optional(network, "network")?.map(str::to_string),
            dns_primary: optional(dns_primary, "dns_primary")?.map(str::to_string),
            dns_secondary: optional(dns_secondary, "dns_secondary")?.map(str::to_string),
            mtu: non_negative_u32(mtu, "mtu")?,
            // Marks use the full 32 bits
            fwmark: fwmark as u32,
        };
        bridge().setup(&request)
    })
}

#[no_mangle]
pub extern "C" fn BridgeStart() -> i32 {
    status(|| bridge().start())
}

#[no_mangle]
pub extern "C" fn BridgeStop() -> i32 {
    status(|| bridge().stop())
}

#[no_mangle]
pub extern "C" fn BridgeClose() -> i32 {
    status(|| bridge().close())
}

// -------------------------------------------------------------------------
// Clients
// -------------------------------------------------------------------------

/// Add a client; `allowed_ip` may be null to allocate from the pool.
/// Returns the client as JSON.
///
/// # Safety
/// `allowed_ip` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn BridgeAddClient(allowed_ip: *const c_char) -> *mut c_char {
    json_result(|| {
        let requested = optional(allowed_ip, "allowed_ip")?;
        bridge().add_client(requested)
    })
}

/// # Safety
/// `public_key` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn BridgeRemoveClient(public_key: *const c_char) -> i32 {
    status(|| bridge().remove_client(required(public_key, "public_key")?))
}

/// # Safety
/// `public_key` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn BridgeEnableClient(public_key: *const c_char) -> i32 {
    status(|| bridge().enable_client(required(public_key, "public_key")?))
}

/// # Safety
/// `public_key` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn BridgeDisableClient(public_key: *const c_char) -> i32 {
    status(|| bridge().disable_client(required(public_key, "public_key")?))
}

/// # Safety
/// `public_key` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn BridgeGetClient(public_key: *const c_char) -> *mut c_char {
    json_result(|| bridge().get_client(required(public_key, "public_key")?))
}

#[no_mangle]
pub extern "C" fn BridgeListClients(page: c_int, limit: c_int) -> *mut c_char {
    json_result(|| bridge().list_clients(page.into(), limit.into()))
}

/// # Safety
/// `public_key` must be a valid NUL-terminated string; `endpoint` and `dns`
/// may be null to use the stored server values.
#[no_mangle]
pub unsafe extern "C" fn BridgeExportClientConfig(
    public_key: *const c_char,
    endpoint: *const c_char,
    dns: *const c_char,
) -> *mut c_char {
    string_result(|| {
        bridge().export_client_config(
            required(public_key, "public_key")?,
            optional(endpoint, "endpoint")?,
            optional(dns, "dns")?,
        )
    })
}

// -------------------------------------------------------------------------
// Server configuration, stats, device info
// -------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn BridgeGetServerConfig() -> *mut c_char {
    json_result(|| bridge().get_server_config())
}

/// # Safety
/// `json` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn BridgeSetServerConfig(json: *const c_char) -> i32 {
    status(|| bridge().set_server_config(required(json, "config")?))
}

#[no_mangle]
pub extern "C" fn BridgeStartStatsSync(interval_secs: c_int) -> i32 {
    status(|| bridge().start_stats_sync(interval_secs.into()))
}

#[no_mangle]
pub extern "C" fn BridgeStopStatsSync() -> i32 {
    status(|| bridge().stop_stats_sync())
}

#[no_mangle]
pub extern "C" fn BridgeGetDeviceInfo() -> *mut c_char {
    json_result(|| bridge().get_device_info())
}

#[no_mangle]
pub extern "C" fn BridgeGetDeviceDump() -> *mut c_char {
    string_result(|| bridge().get_device_dump())
}

// -------------------------------------------------------------------------
// Multihop
// -------------------------------------------------------------------------

/// Create a multihop tunnel; returns it as JSON
///
/// # Safety
/// String arguments must be valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn BridgeCreateMultihopTunnel(
    name: *const c_char,
    interface_name: *const c_char,
    remote_endpoint: *const c_char,
    remote_public_key: *const c_char,
    fwmark: c_int,
) -> *mut c_char {
    json_result(|| {
        let request = CreateTunnel {
            name: required(name, "name")?.to_string(),
            interface_name: required(interface_name, "interface_name")?.to_string(),
            remote_endpoint: required(remote_endpoint, "remote_endpoint")?.to_string(),
            remote_public_key: required(remote_public_key, "remote_public_key")?.to_string(),
            fwmark: fwmark as u32,
            ..Default::default()
        };
        bridge().create_multihop_tunnel(&request)
    })
}

/// # Safety
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn BridgeStartMultihopTunnel(name: *const c_char) -> i32 {
    status(|| bridge().start_multihop_tunnel(required(name, "name")?))
}

/// # Safety
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn BridgeStopMultihopTunnel(name: *const c_char) -> i32 {
    status(|| bridge().stop_multihop_tunnel(required(name, "name")?))
}

/// # Safety
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn BridgeDisableMultihopTunnel(name: *const c_char) -> i32 {
    status(|| bridge().disable_multihop_tunnel(required(name, "name")?))
}

/// # Safety
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn BridgeDeleteMultihopTunnel(name: *const c_char) -> i32 {
    status(|| bridge().delete_multihop_tunnel(required(name, "name")?))
}

/// Apply a partial JSON update; returns the updated tunnel as JSON
///
/// # Safety
/// Both arguments must be valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn BridgeUpdateMultihopTunnel(name: *const c_char, json: *const c_char) -> *mut c_char {
    json_result(|| bridge().update_multihop_tunnel(required(name, "name")?, required(json, "update")?))
}

#[no_mangle]
pub extern "C" fn BridgeListMultihopTunnels() -> *mut c_char {
    json_result(|| bridge().list_multihop_tunnels())
}

/// # Safety
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn BridgeGetMultihopTunnel(name: *const c_char) -> *mut c_char {
    json_result(|| bridge().get_multihop_tunnel(required(name, "name")?))
}

// -------------------------------------------------------------------------
// Low-level devices
// -------------------------------------------------------------------------

fn with_device<T>(handle: i64, f: impl FnOnce(&Device) -> Result<T>) -> Result<T> {
    let device = devices().get(handle).ok_or(Error::HandleNotFound(handle))?;
    f(&device)
}

/// Create a standalone device; returns a positive handle or a negative
/// status code
///
/// # Safety
/// `ifname` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn NewDevice(ifname: *const c_char, mtu: c_int) -> i64 {
    let result = guarded(|| {
        let ifname = required(ifname, "ifname")?;
        let factory = bridge().device_factory()?;
        let device = Device::create(&*factory, ifname, non_negative_u32(mtu, "mtu")?)?;
        Ok(devices().add(device))
    });
    match result {
        Ok(handle) => handle,
        Err(code) => code.into(),
    }
}

#[no_mangle]
pub extern "C" fn DeviceClose(handle: i64) -> i32 {
    status(|| {
        let device = devices().remove(handle).ok_or(Error::HandleNotFound(handle))?;
        device.close()
    })
}

#[no_mangle]
pub extern "C" fn DeviceUp(handle: i64) -> i32 {
    status(|| with_device(handle, Device::up))
}

#[no_mangle]
pub extern "C" fn DeviceDown(handle: i64) -> i32 {
    status(|| with_device(handle, Device::down))
}

/// # Safety
/// `config` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn DeviceIpcSet(handle: i64, config: *const c_char) -> i32 {
    status(|| {
        let config = required(config, "config")?;
        with_device(handle, |device| device.ipc_set(config))
    })
}

#[no_mangle]
pub extern "C" fn DeviceIpcGet(handle: i64) -> *mut c_char {
    string_result(|| with_device(handle, Device::ipc_get))
}

/// Set the socket mark of a device's bind
#[no_mangle]
pub extern "C" fn DeviceBindSetMark(handle: i64, mark: u32) -> i32 {
    match guarded(|| with_device(handle, |device| device.set_fwmark(mark))) {
        Ok(()) => code::OK,
        Err(code::NOT_FOUND) => code::NOT_FOUND,
        Err(_) => code::BIND,
    }
}

// -------------------------------------------------------------------------
// Keys
// -------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn GeneratePrivateKey() -> *mut c_char {
    string_result(|| Ok(keys::generate_private_key()))
}

/// # Safety
/// `private_key` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn DerivePublicKey(private_key: *const c_char) -> *mut c_char {
    string_result(|| keys::derive_public_key(required(private_key, "private_key")?))
}

#[no_mangle]
pub extern "C" fn GeneratePresharedKey() -> *mut c_char {
    string_result(|| Ok(keys::generate_preshared_key()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take(ptr: *mut c_char) -> String {
        assert!(!ptr.is_null());
        let text = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        unsafe { FreeString(ptr) };
        text
    }

    fn last_error() -> String {
        take(BridgeGetLastError())
    }

    #[test]
    fn test_key_exports() {
        let private = take(GeneratePrivateKey());
        assert_eq!(private.len(), 64);

        let c_private = CString::new(private.clone()).unwrap();
        let public = take(unsafe { DerivePublicKey(c_private.as_ptr()) });
        assert_eq!(public, keys::derive_public_key(&private).unwrap());

        let bad = CString::new("xyz").unwrap();
        assert!(unsafe { DerivePublicKey(bad.as_ptr()) }.is_null());
        assert!(last_error().contains("key"));
        assert_eq!(take(GeneratePresharedKey()).len(), 64);
    }

    #[test]
    fn test_null_arguments_are_invalid_params() {
        assert_eq!(unsafe { BridgeRemoveClient(std::ptr::null()) }, code::INVALID_PARAM);
        assert!(last_error().contains("public_key"));
        assert!(unsafe { DerivePublicKey(std::ptr::null()) }.is_null());
        unsafe { FreeString(std::ptr::null_mut()) };
    }

    #[test]
    fn test_unknown_handles() {
        assert_eq!(DeviceUp(9_999), code::NOT_FOUND);
        assert_eq!(DeviceClose(-1), code::NOT_FOUND);
        assert!(DeviceIpcGet(0).is_null());
        assert_eq!(DeviceBindSetMark(9_999, 7), code::NOT_FOUND);
    }

    #[test]
    fn test_version_and_errors_are_per_thread() {
        assert_eq!(take(BridgeVersion()), crate::VERSION);
        assert_eq!(unsafe { BridgeRemoveClient(std::ptr::null()) }, code::INVALID_PARAM);
        let other = std::thread::spawn(|| BridgeGetLastError().is_null()).join().unwrap();
        assert!(other);
        assert!(!last_error().is_empty());
    }

    #[test]
    fn test_guarded_catches_panics() {
        let code = status(|| panic!("boom"));
        assert_eq!(code, code::INTERNAL);
        assert_eq!(last_error(), "internal panic");
    }
}
