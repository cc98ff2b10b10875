//! Log delivery to the host process
//!
//! Every `tracing` event emitted by the bridge is formatted into one line
//! and handed to a function pointer registered by the host, together with
//! the opaque context value it registered. The buffer is only valid for the
//! duration of the call.

use std::ffi::{c_char, c_void, CString};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{OnceLock, RwLock};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Host log callback: `(level, NUL-terminated message, context)`
pub type LogCallback = extern "C" fn(level: i32, msg: *const c_char, ctx: *mut c_void);

/// Verbosity understood by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum LogLevel {
    Silent = 0,
    Error = 1,
    Verbose = 2,
}

impl LogLevel {
    /// Map a host-supplied integer, clamping out-of-range values
    pub fn from_i32(level: i32) -> Self {
        match level {
            i32::MIN..=0 => LogLevel::Silent,
            1 => LogLevel::Error,
            _ => LogLevel::Verbose,
        }
    }

    /// `EnvFilter` directive admitting the same events
    pub fn filter_directive(self) -> &'static str {
        match self {
            LogLevel::Silent => "off",
            LogLevel::Error => "warn",
            LogLevel::Verbose => "debug",
        }
    }

    /// WARN and ERROR events are delivered as errors, everything else as verbose
    pub fn from_tracing(level: &Level) -> Self {
        if *level <= Level::WARN {
            LogLevel::Error
        } else {
            LogLevel::Verbose
        }
    }
}

/// Parse a level name (`silent`, `error`, `verbose`) or its number
pub fn parse_level(s: &str) -> Option<LogLevel> {
    match s.trim().to_ascii_lowercase().as_str() {
        "silent" | "off" | "0" => Some(LogLevel::Silent),
        "error" | "1" => Some(LogLevel::Error),
        "verbose" | "debug" | "2" => Some(LogLevel::Verbose),
        _ => None,
    }
}

#[derive(Clone, Copy)]
struct Registered {
    callback: LogCallback,
    // Opaque to us; only ever handed back to the host
    context: usize,
}

/// Registered callback plus the maximum level to deliver
pub struct LogSink {
    callback: RwLock<Option<Registered>>,
    max_level: AtomicI32,
}

impl LogSink {
    pub const fn new() -> Self {
        Self {
            callback: RwLock::new(None),
            max_level: AtomicI32::new(LogLevel::Error as i32),
        }
    }

    /// Register (or with `None`, remove) the host callback
    pub fn set_callback(&self, callback: Option<LogCallback>, context: *mut c_void) {
        let registered = callback.map(|callback| Registered {
            callback,
            context: context as usize,
        });
        match self.callback.write() {
            Ok(mut slot) => *slot = registered,
            Err(poisoned) => *poisoned.into_inner() = registered,
        }
    }

    pub fn set_max_level(&self, level: LogLevel) {
        self.max_level.store(level as i32, Ordering::Relaxed);
    }

    pub fn max_level(&self) -> LogLevel {
        LogLevel::from_i32(self.max_level.load(Ordering::Relaxed))
    }

    /// Check whether a message at `level` would reach the host
    pub fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::Silent
            && level <= self.max_level()
            && self.callback.read().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Hand one line to the host
    pub fn deliver(&self, level: LogLevel, message: &str) {
        let registered = match self.callback.read() {
            Ok(slot) => *slot,
            Err(_) => return,
        };
        let Some(registered) = registered else {
            return;
        };

        let line = match CString::new(message) {
            Ok(line) => line,
            Err(_) => match CString::new(message.replace('\0', "\\0")) {
                Ok(line) => line,
                Err(_) => return,
            },
        };
        (registered.callback)(level as i32, line.as_ptr(), registered.context as *mut c_void);
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_SINK: LogSink = LogSink::new();

/// Process-wide sink used by the exported entry points
pub fn global() -> &'static LogSink {
    &GLOBAL_SINK
}

/// Install the callback layer as the global subscriber.
///
/// Only the first call has an effect; returns false if another subscriber
/// already owns the process (for example the ctl binary's fmt layer).
pub fn install() -> bool {
    static INSTALLED: OnceLock<bool> = OnceLock::new();
    *INSTALLED.get_or_init(|| {
        tracing_subscriber::registry()
            .with(CallbackLayer::new(global()))
            .try_init()
            .is_ok()
    })
}

/// A tracing layer forwarding events to a [`LogSink`]
#[derive(Clone, Copy)]
pub struct CallbackLayer {
    sink: &'static LogSink,
}

impl CallbackLayer {
    pub fn new(sink: &'static LogSink) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for CallbackLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = LogLevel::from_tracing(event.metadata().level());
        if !self.sink.enabled(level) {
            return;
        }

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        self.sink.deliver(level, &visitor.finish());
    }
}

/// Collects an event into `message key=value ...`
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}
