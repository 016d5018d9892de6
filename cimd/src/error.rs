use derive_more::{Display, From};
use nix::{sys::wait::WaitStatus, unistd::Pid};
use std::{io, path::PathBuf};

/// Common errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    IoError(io::Error),
    #[display(fmt = "{}", "_0")]
    UnixError(nix::Error),
    #[display(fmt = "Invalid configuration: {}", "_0")]
    #[from(ignore)]
    Configuration(String),
    #[display(fmt = "Server is already running (pid {})", "_0")]
    #[from(ignore)]
    AlreadyRunning(Pid),
    #[display(fmt = "Server is not running")]
    NotRunning,
    #[display(fmt = "Permission denied, must run as root")]
    PermissionDenied,
    #[display(fmt = "Service account '{}' not found", "_0")]
    #[from(ignore)]
    UserNotFound(String),
    #[display(fmt = "Failed to drop privileges ({}) - {}", "_0", "_1")]
    #[from(ignore)]
    Privdrop(&'static str, nix::Error),
    #[display(fmt = "Failed to create directory {}: {}", "_0.display()", "_1")]
    #[from(ignore)]
    DirectoryCreate(PathBuf, io::Error),
    #[display(fmt = "Failed to change ownership of {}: {}", "_0.display()", "_1")]
    #[from(ignore)]
    OwnershipChange(PathBuf, nix::Error),
    #[display(fmt = "Failed to set up engine channel ({}) - {}", "_0", "_1")]
    #[from(ignore)]
    ChannelSetup(&'static str, nix::Error),
    #[display(fmt = "Fork failed: {}", "_0")]
    #[from(ignore)]
    Fork(nix::Error),
    #[display(fmt = "Failed to execute {}: {}", "_0.display()", "_1")]
    #[from(ignore)]
    Exec(PathBuf, nix::Error),
    #[display(fmt = "Failed to signal process {}: {}", "_0", "_1")]
    #[from(ignore)]
    SignalDelivery(Pid, nix::Error),
    #[display(fmt = "Engine process {} terminated: {:?}", "_0", "_1")]
    #[from(ignore)]
    EngineExited(Pid, WaitStatus),
    #[display(fmt = "Could not create pid file {}: {}", "_0.display()", "_1")]
    #[from(ignore)]
    Lock(PathBuf, io::Error),
    #[display(fmt = "Failed to daemonize server process: {}", "_0")]
    #[from(ignore)]
    Daemonize(nix::Error),
}

impl std::error::Error for Error {}

impl Error {
    /// Process exit code for a daemon or controller that failed with this error.
    ///
    /// A stop or reload request against a daemon that is not running is
    /// informational and exits successfully.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotRunning => 0,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::NotRunning.exit_code(), 0);
        assert_eq!(Error::AlreadyRunning(Pid::from_raw(1)).exit_code(), 1);
        assert_eq!(Error::Fork(nix::Error::EAGAIN).exit_code(), 1);
    }

    #[test]
    fn test_display() {
        let err = Error::Privdrop("setresuid", nix::Error::EPERM);
        assert!(err.to_string().starts_with("Failed to drop privileges (setresuid)"));
        let err = Error::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.to_string(), "I/O error: boom");
    }
}
