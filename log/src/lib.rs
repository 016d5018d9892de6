//! Simple logging crate for the `cimd` daemon, inspired by OpenBSD's `log.c`
//!
//! The daemon logs to syslog unless it runs in the foreground, in which
//! case every message is written to stderr with the program name as a
//! prefix.  Messages are filtered with `module=level` directives; see
//! [`Config::filter`].

mod envlogger;

use derive_more::{Display, From};
use libc::openlog;
use serde_derive::{Deserialize, Serialize};
use slog::{Drain, Level, OwnedKVList, Record, KV};
use slog_scope::GlobalLoggerGuard;
use std::{
    ffi::{CStr, CString},
    fmt,
    io::{self, Write},
    pin::Pin,
    sync::{Mutex, Once},
};

/// Re-export the scoped logging macros.
pub use slog_scope::{crit, debug, error, info, trace, warn};

static LOG_BRIDGE: Once = Once::new();

/// Default filter directive if nothing else was configured.
pub const DEFAULT_FILTER: &str = "warn";

/// Configuration for the logging crate.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log to the foreground or to syslog (default: syslog).
    pub foreground: bool,
    /// Default filter directives, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            foreground: false,
            filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl From<bool> for Config {
    fn from(foreground: bool) -> Self {
        Self {
            foreground,
            ..Default::default()
        }
    }
}

impl Config {
    /// Set the default filter directives.
    pub fn with_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.filter = filter.into();
        self
    }
}

/// Logging errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "{}", "_0")]
    NulError(std::ffi::NulError),
    #[display(fmt = "{}", "_0")]
    IoError(io::Error),
}

impl std::error::Error for Error {}

fn init(
    drain: Box<dyn Drain<Err = slog::Never, Ok = ()> + Send>,
    config: &Config,
) -> GlobalLoggerGuard {
    let kv = slog::o!();

    let drain = envlogger::Logger::with_default_filter(drain, &config.filter);

    // This is required to make the drain `UnwindSafe`.
    let drain = Mutex::new(drain.fuse());

    let logger = slog::Logger::root(drain.fuse(), kv).into_erased();

    let guard = slog_scope::set_global_logger(logger);
    LOG_BRIDGE.call_once(|| {
        let _ = slog_stdlog::init();
    });

    guard
}

/// Return a new global logger.
///
/// The logger stays installed as long as the returned guard is alive.
pub fn sync_logger<C: Into<Config>>(name: &str, config: C) -> Result<GlobalLoggerGuard, Error> {
    let config = config.into();

    let guard = if config.foreground {
        init(Box::new(Stderr::new(name)?.fuse()), &config)
    } else {
        init(Box::new(Syslog::new(name)?.fuse()), &config)
    };

    Ok(guard)
}

/// Local trait for the supported log targets.
pub trait Target: Send + Sync {
    fn new(name: &str) -> Result<Self, Error>
    where
        Self: Sized;
    fn log_str(&self, level: Level, message: &str) -> Result<(), Error>;
}

/// Foreground logger that logs to stderr.
pub struct Stderr {
    name: String,
}

impl Target for Stderr {
    /// Create a new foreground logger.
    fn new(name: &str) -> Result<Self, Error> {
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Log the pre-formatted string.
    fn log_str(&self, level: Level, message: &str) -> Result<(), Error> {
        let message = format!("{}: {}: {}\n", self.name, level.as_str(), message);
        io::stderr()
            .write_all(message.as_bytes())
            .map_err(Into::into)
    }
}

impl Drain for Stderr {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let message = format_log(record, values);
        self.log_str(record.level(), &message)
    }
}

/// Background logger to log to syslog.
pub struct Syslog {
    /// We need to keep a reference to the const char * around.
    _name: Pin<CString>,
}

impl Target for Syslog {
    /// Create a new background logger.
    fn new(name: &str) -> Result<Self, Error> {
        let name = name.to_string();
        let _name = CString::new(&name[..name.find('(').unwrap_or_else(|| name.len())])?;
        let c_str: &CStr = _name.as_c_str();

        unsafe {
            openlog(
                c_str.as_ptr(),
                libc::LOG_PID | libc::LOG_NDELAY,
                libc::LOG_DAEMON,
            )
        };

        Ok(Self {
            _name: Pin::new(_name),
        })
    }

    /// Convert the log string into a syslog message.
    fn log_str(&self, level: Level, message: &str) -> Result<(), Error> {
        let c_string: CString = CString::new(message.as_bytes())?;
        let c_message: &CStr = c_string.as_c_str();

        unsafe {
            libc::syslog(
                syslog_priority(level),
                b"%s\0".as_ptr() as *const libc::c_char,
                c_message.as_ptr(),
            );
        }

        Ok(())
    }
}

impl Drop for Syslog {
    /// Close syslog on shutdown.
    fn drop(&mut self) {
        unsafe {
            libc::closelog();
        }
    }
}

impl Drain for Syslog {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let message = format_log(record, values);
        self.log_str(record.level(), &message)
    }
}

fn syslog_priority(level: Level) -> libc::c_int {
    match level {
        Level::Critical => libc::LOG_CRIT,
        Level::Error => libc::LOG_ERR,
        Level::Warning => libc::LOG_WARNING,
        Level::Info => libc::LOG_INFO,
        Level::Debug | Level::Trace => libc::LOG_DEBUG,
    }
}

/// Format the log message to a string.
#[inline]
fn format_log(record: &Record<'_>, values: &OwnedKVList) -> String {
    let mut formatter = Formatter::new(record);
    let _ = record.kv().serialize(record, &mut formatter);
    let _ = values.serialize(record, &mut formatter);
    formatter.buf
}

/// Formatter to create a log message from a record.
struct Formatter {
    buf: String,
}

impl Formatter {
    /// Return a new formatter.
    fn new(record: &Record<'_>) -> Self {
        let mut buf = format!("{}", record.msg());

        if record.level() >= Level::Debug {
            buf.push_str(&format!(
                ", source: {}:{}, module: {}",
                record.file(),
                record.line(),
                record.module()
            ));
        };

        Self { buf }
    }
}

/// Serializer for key-value fields.
impl slog::Serializer for Formatter {
    fn emit_arguments(&mut self, key: &str, val: &fmt::Arguments<'_>) -> slog::Result {
        self.buf.push_str(&format!(", {}: {}", key, val));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_stderr() {
        let _guard = sync_logger("test", Config::from(true).with_filter("debug")).unwrap();

        for i in 1..=100 {
            info!("Hello, World! {}", i);
            debug!("Hello, World! {}", i);
        }
    }

    #[test]
    fn test_syslog_priority() {
        assert_eq!(syslog_priority(Level::Critical), libc::LOG_CRIT);
        assert_eq!(syslog_priority(Level::Warning), libc::LOG_WARNING);
        assert_eq!(syslog_priority(Level::Trace), libc::LOG_DEBUG);
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.foreground);
        assert_eq!(config.filter, DEFAULT_FILTER);
    }
}
