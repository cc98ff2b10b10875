//! WolfBridge Error Types

use thiserror::Error;

/// Result type alias for WolfBridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes handed across the C boundary.
pub mod code {
    pub const OK: i32 = 0;
    pub const INVALID_PARAM: i32 = -1;
    pub const TUN_CREATE: i32 = -2;
    pub const DEVICE_CREATE: i32 = -3;
    pub const IPC_SET: i32 = -4;
    pub const NOT_FOUND: i32 = -5;
    pub const ALREADY_EXISTS: i32 = -6;
    pub const DEVICE_UP: i32 = -7;
    pub const DEVICE_DOWN: i32 = -8;
    pub const BIND: i32 = -9;
    pub const KEY_PARSE: i32 = -10;
    pub const DB_OPEN: i32 = -20;
    pub const DB_QUERY: i32 = -21;
    pub const DB_WRITE: i32 = -22;
    pub const IP_EXHAUSTED: i32 = -23;
    pub const NOT_INITIALIZED: i32 = -24;
    pub const STATS_RUNNING: i32 = -25;
    pub const INVALID_STATE: i32 = -26;
    pub const INTERNAL: i32 = -99;
}

/// WolfBridge error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    // Store errors
    #[error("Failed to open store: {0}")]
    StoreOpen(String),

    #[error("Store query failed: {0}")]
    StoreQuery(String),

    #[error("Store write failed: {0}")]
    StoreWrite(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    // Device errors
    #[error("TUN creation failed for {name}: {reason}")]
    TunCreate { name: String, reason: String },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Device up failed: {0}")]
    DeviceUp(String),

    #[error("Device down failed: {0}")]
    DeviceDown(String),

    #[error("Device is closed: {0}")]
    DeviceClosed(String),

    // Protocol errors
    #[error("Configuration directive rejected: {0}")]
    Protocol(String),

    #[error("Malformed key: {0}")]
    KeyParse(String),

    // Allocation errors
    #[error("IP pool exhausted (family={family})")]
    PoolExhausted { family: u8 },

    // State errors
    #[error("Bridge not initialized")]
    NotInitialized,

    #[error("Invalid state for {op}: {status}")]
    InvalidState { op: &'static str, status: String },

    #[error("Stats syncer already running")]
    StatsRunning,

    // Not-found errors
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    #[error("Multihop tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("Handle not found: {0}")]
    HandleNotFound(i64),

    // Encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Status code reported across the C boundary for this error
    pub fn code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::ConfigParse(_) | Error::InvalidParam(_) | Error::Json(_) => {
                code::INVALID_PARAM
            }
            Error::StoreOpen(_) => code::DB_OPEN,
            Error::StoreQuery(_) => code::DB_QUERY,
            Error::StoreWrite(_) => code::DB_WRITE,
            Error::AlreadyExists(_) => code::ALREADY_EXISTS,
            Error::TunCreate { .. } => code::TUN_CREATE,
            Error::Device(_) | Error::DeviceClosed(_) => code::DEVICE_CREATE,
            Error::DeviceUp(_) => code::DEVICE_UP,
            Error::DeviceDown(_) => code::DEVICE_DOWN,
            Error::Protocol(_) => code::IPC_SET,
            Error::KeyParse(_) => code::KEY_PARSE,
            Error::PoolExhausted { .. } => code::IP_EXHAUSTED,
            Error::NotInitialized => code::NOT_INITIALIZED,
            Error::InvalidState { .. } => code::INVALID_STATE,
            Error::StatsRunning => code::STATS_RUNNING,
            Error::ClientNotFound(_) | Error::TunnelNotFound(_) | Error::HandleNotFound(_) => {
                code::NOT_FOUND
            }
            Error::Io(_) | Error::Internal(_) => code::INTERNAL,
        }
    }

    /// Check if this error was raised because of the bridge lifecycle state
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Error::NotInitialized | Error::InvalidState { .. } | Error::StatsRunning
        )
    }

    /// Check if this error refers to a missing client, tunnel or handle
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ClientNotFound(_) | Error::TunnelNotFound(_) | Error::HandleNotFound(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation
                    && err.extended_code != rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
            {
                Error::AlreadyExists(e.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::FromSqlConversionFailure(..) => Error::StoreQuery(e.to_string()),
            _ => Error::StoreWrite(e.to_string()),
        }
    }
}
