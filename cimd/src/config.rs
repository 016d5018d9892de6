//! Command line and configuration file options.
//!
//! Options are resolved once at startup into an immutable [`RunOptions`]:
//! the configuration file is read first and the command line overrides
//! it.  A configuration reload repeats the same resolution with the
//! original command line.

use crate::{error::Error, paths::Paths, signal::ControlSignal};
use cimd_log::debug;
use clap::{CommandFactory, Parser};
use nix::unistd::{Gid, Uid, User};
use std::{
    ffi::OsString,
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Default service account of the unprivileged engine.
pub const DEFAULT_SERVICE_ACCOUNT: &str = "cimd";
/// Default WS-Management HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 5985;
/// Default WS-Management HTTPS port.
pub const DEFAULT_HTTPS_PORT: u16 = 5986;
/// Default idle timeout before providers are unloaded.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Option that selects privilege-split mode; it is not forwarded to the engine.
const NONROOT_FLAG: &str = "--nonroot";

/// Logging verbosity, by name or number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
    Verbose,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Warning
    }
}

impl LogLevel {
    const NAMES: [(&'static str, LogLevel); 6] = [
        ("fatal", LogLevel::Fatal),
        ("error", LogLevel::Error),
        ("warning", LogLevel::Warning),
        ("info", LogLevel::Info),
        ("debug", LogLevel::Debug),
        ("verbose", LogLevel::Verbose),
    ];

    /// The matching directive for the log filter.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Fatal => "critical",
            Self::Error => "error",
            Self::Warning => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Verbose => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::NAMES
            .iter()
            .enumerate()
            .find(|(number, (name, _))| {
                name.eq_ignore_ascii_case(s) || s.parse::<usize>().ok() == Some(*number)
            })
            .map(|(_, (_, level))| *level)
            .ok_or_else(|| format!("invalid log level '{}'", s))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = Self::NAMES
            .iter()
            .find(|(_, level)| level == self)
            .map(|(name, _)| *name)
            .unwrap_or("warning");
        f.write_str(name)
    }
}

/// Command line of the server.
#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "cimd",
    about = "This program starts the server.",
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct Cli {
    /// Print this help message.
    #[arg(short = 'h', long = "help")]
    pub help: bool,
    /// Daemonize the server process.
    #[arg(short = 'd')]
    pub daemonize: bool,
    /// Stop the server process.
    #[arg(short = 's')]
    pub stop: bool,
    /// Re-read configuration by the running server.
    #[arg(short = 'r')]
    pub reload_config: bool,
    /// Re-read configuration by the running server, but don't unload providers.
    #[arg(long = "reload-dispatcher")]
    pub reload_dispatcher: bool,
    /// HTTP protocol listener port.
    #[arg(long = "httpport", value_name = "PORT", value_delimiter = ',')]
    pub http_ports: Vec<u16>,
    /// HTTPS protocol listener port.
    #[arg(long = "httpsport", value_name = "PORT", value_delimiter = ',')]
    pub https_ports: Vec<u16>,
    /// Idle providers unload timeout (in seconds).
    #[arg(long = "idletimeout", value_name = "TIMEOUT")]
    pub idle_timeout: Option<u64>,
    /// Terminate the server after the given number of seconds.
    #[arg(long = "livetime", value_name = "TIMEOUT")]
    pub live_time: Option<u64>,
    /// Print version information.
    #[arg(short = 'v', long = "version")]
    pub version: bool,
    /// Send log output to standard error.
    #[arg(short = 'l', long = "logstderr")]
    pub log_stderr: bool,
    /// Set logging level: fatal/0, error/1, warning/2, info/3, debug/4, verbose/5.
    #[arg(long = "loglevel", value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
    /// Enable logging of HTTP traffic.
    #[arg(long = "httptrace")]
    pub http_trace: bool,
    /// Print timestamp server was built with.
    #[arg(long = "timestamp")]
    pub timestamp: bool,
    /// Run in non-root mode.
    #[arg(long = "nonroot")]
    pub non_root: bool,
    /// Use ACCT as the service account.
    #[arg(long = "service", value_name = "ACCT")]
    pub service: Option<String>,
    /// Ignore authentication (testing only).
    #[arg(short = 'i', long = "ignoreauthentication")]
    pub ignore_authentication: bool,
    /// Print locations of files and directories.
    #[arg(short = 'p', long = "locations")]
    pub locations: bool,
    /// Relocate all files and directories below DIR.
    #[arg(long = "destdir", value_name = "DIR")]
    pub destdir: Option<PathBuf>,
    /// Arguments that are passed on to the engine.
    #[arg(skip)]
    pub forward_args: Vec<String>,
}

impl Cli {
    /// Parse the command line, keeping the arguments for the engine.
    pub fn try_from_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let args = args.into_iter().map(Into::into).collect::<Vec<OsString>>();
        let mut cli = Self::try_parse_from(&args)?;
        cli.forward_args = args
            .iter()
            .skip(1)
            .map(|arg| arg.to_string_lossy().into_owned())
            .filter(|arg| arg != NONROOT_FLAG)
            .collect();
        Ok(cli)
    }

    /// Render the usage message.
    pub fn help_text() -> String {
        Self::command().render_help().to_string()
    }
}

/// TLS protocol restrictions for the HTTPS listeners.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslOptions {
    pub cipher_suite: Option<String>,
    pub no_ssl_v2: bool,
    pub no_ssl_v3: bool,
    pub no_tls_v1_0: bool,
    pub no_tls_v1_1: bool,
    pub no_tls_v1_2: bool,
}

/// Values read from the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub http_ports: Option<Vec<u16>>,
    pub https_ports: Option<Vec<u16>>,
    pub idle_timeout: Option<u64>,
    pub live_time: Option<u64>,
    pub log_level: Option<LogLevel>,
    pub http_trace: Option<bool>,
    pub credential_file: Option<PathBuf>,
    pub ssl: SslOptions,
}

impl ConfigFile {
    /// Read the configuration file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, Error> {
        match fs::read_to_string(path) {
            Ok(content) => content.parse().map_err(|err| {
                Error::Configuration(format!("{}: {}", path.display(), err))
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("no configuration file {}", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl FromStr for ConfigFile {
    type Err = String;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let mut config = Self::default();

        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => return Err(format!("line {}: expected 'key=value'", number + 1)),
            };
            let invalid = |err: String| format!("line {}: {}: {}", number + 1, key, err);

            match key {
                "httpport" => config.http_ports = Some(parse_ports(value).map_err(invalid)?),
                "httpsport" => config.https_ports = Some(parse_ports(value).map_err(invalid)?),
                "idletimeout" => config.idle_timeout = Some(parse_number(value).map_err(invalid)?),
                "livetime" => config.live_time = Some(parse_number(value).map_err(invalid)?),
                "loglevel" => config.log_level = Some(value.parse().map_err(invalid)?),
                "httptrace" => config.http_trace = Some(parse_bool(value).map_err(invalid)?),
                "NtlmCredsFile" => config.credential_file = Some(value.into()),
                "sslciphersuite" => config.ssl.cipher_suite = Some(value.to_string()),
                "NoSSLv2" => config.ssl.no_ssl_v2 = parse_bool(value).map_err(invalid)?,
                "NoSSLv3" => config.ssl.no_ssl_v3 = parse_bool(value).map_err(invalid)?,
                "NoTLSv1_0" => config.ssl.no_tls_v1_0 = parse_bool(value).map_err(invalid)?,
                "NoTLSv1_1" => config.ssl.no_tls_v1_1 = parse_bool(value).map_err(invalid)?,
                "NoTLSv1_2" => config.ssl.no_tls_v1_2 = parse_bool(value).map_err(invalid)?,
                _ => return Err(format!("line {}: unknown option '{}'", number + 1, key)),
            }
        }

        Ok(config)
    }
}

fn parse_ports(value: &str) -> Result<Vec<u16>, String> {
    value
        .split(',')
        .map(|port| {
            port.trim()
                .parse::<u16>()
                .map_err(|err| format!("invalid port '{}': {}", port.trim(), err))
        })
        .collect()
}

fn parse_number(value: &str) -> Result<u64, String> {
    value
        .parse()
        .map_err(|err| format!("invalid number '{}': {}", value, err))
}

fn parse_bool(value: &str) -> Result<bool, String> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(format!("expected 'true' or 'false', got '{}'", value))
    }
}

/// The account the unprivileged engine runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccount {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
}

impl ServiceAccount {
    /// Look up the account in the password database.
    pub fn lookup(name: &str) -> Result<Self, Error> {
        let user = User::from_name(name)?.ok_or_else(|| Error::UserNotFound(name.to_string()))?;
        Ok(Self {
            name: user.name,
            uid: user.uid,
            gid: user.gid,
        })
    }
}

/// What this invocation of the program does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Help,
    Version,
    Timestamp,
    Locations,
    /// Send a control signal to the running daemon and exit.
    Control(ControlSignal),
    Daemon,
}

/// Options resolved from the configuration file and the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub help: bool,
    pub version: bool,
    pub timestamp: bool,
    pub locations: bool,
    pub daemonize: bool,
    pub stop: bool,
    pub reload_config: bool,
    pub reload_dispatcher: bool,
    /// Run the engine as a separate unprivileged process.
    pub non_root: bool,
    /// Testing only: bypass the root and credential checks.
    pub ignore_authentication: bool,
    pub log_stderr: bool,
    pub log_level: LogLevel,
    pub http_trace: bool,
    pub http_ports: Vec<u16>,
    pub https_ports: Vec<u16>,
    pub idle_timeout: Duration,
    pub live_time: Option<Duration>,
    pub credential_file: Option<PathBuf>,
    pub ssl: SslOptions,
    pub service_name: String,
    /// Resolved service account, only in non-root mode.
    pub service: Option<ServiceAccount>,
    pub paths: Paths,
    pub engine_args: Vec<String>,
}

impl RunOptions {
    /// Resolve the options from the configuration file and the command line.
    pub fn load(cli: &Cli) -> Result<Self, Error> {
        let paths = cli
            .destdir
            .as_ref()
            .map(Paths::with_destdir)
            .unwrap_or_default();
        let file = ConfigFile::load(&paths.config_file())?;
        Self::merge(cli, file, paths)
    }

    fn merge(cli: &Cli, file: ConfigFile, paths: Paths) -> Result<Self, Error> {
        let ports = |cli: &[u16], file: Option<Vec<u16>>, default: u16| {
            let mut ports = if !cli.is_empty() {
                cli.to_vec()
            } else {
                file.unwrap_or_else(|| vec![default])
            };
            // Port 0 disables the listener.
            ports.retain(|port| *port != 0);
            ports.sort_unstable();
            ports.dedup();
            ports
        };

        let service_name = cli
            .service
            .clone()
            .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT.to_string());
        if service_name.is_empty() {
            return Err(Error::Configuration("empty service account".to_string()));
        }
        let service = if cli.non_root {
            Some(ServiceAccount::lookup(&service_name)?)
        } else {
            None
        };

        Ok(Self {
            help: cli.help,
            version: cli.version,
            timestamp: cli.timestamp,
            locations: cli.locations,
            daemonize: cli.daemonize,
            stop: cli.stop,
            reload_config: cli.reload_config,
            reload_dispatcher: cli.reload_dispatcher,
            non_root: cli.non_root,
            ignore_authentication: cli.ignore_authentication,
            log_stderr: cli.log_stderr,
            log_level: cli.log_level.or(file.log_level).unwrap_or_default(),
            http_trace: cli.http_trace || file.http_trace.unwrap_or_default(),
            http_ports: ports(&cli.http_ports, file.http_ports, DEFAULT_HTTP_PORT),
            https_ports: ports(&cli.https_ports, file.https_ports, DEFAULT_HTTPS_PORT),
            idle_timeout: cli
                .idle_timeout
                .or(file.idle_timeout)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_IDLE_TIMEOUT),
            live_time: cli
                .live_time
                .or(file.live_time)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            credential_file: file.credential_file,
            ssl: file.ssl,
            service_name,
            service,
            paths,
            engine_args: cli.forward_args.clone(),
        })
    }

    /// Decide what this invocation does.
    pub fn mode(&self) -> Mode {
        if self.help {
            Mode::Help
        } else if self.version {
            Mode::Version
        } else if self.timestamp {
            Mode::Timestamp
        } else if self.locations {
            Mode::Locations
        } else if self.stop {
            Mode::Control(ControlSignal::Terminate)
        } else if self.reload_config {
            Mode::Control(ControlSignal::ReloadConfig)
        } else if self.reload_dispatcher {
            Mode::Control(ControlSignal::ReloadDispatcher)
        } else {
            Mode::Daemon
        }
    }

    /// Logger configuration.
    pub fn log_config(&self) -> cimd_log::Config {
        cimd_log::Config::from(self.log_stderr).with_filter(self.log_level.as_filter())
    }
}
