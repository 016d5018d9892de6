//! Deployment locations of the daemon's files and directories.

use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Directory of the engine binary.
pub const BINDIR: &str = "/usr/libexec/cimd";
/// Directory of the configuration file and the rendezvous sockets.
pub const SYSCONFDIR: &str = "/etc/cimd";
/// Working directory of the running daemon.
pub const RUNDIR: &str = "/var/run/cimd";

/// Name of the unprivileged engine binary in `BINDIR`.
pub const ENGINE: &str = "cimd-engine";
/// Name of the configuration file in `SYSCONFDIR`.
pub const CONFIG_FILE: &str = "cimd.conf";
/// Name of the singleton lock file in `RUNDIR`.
pub const PID_FILE: &str = "cimd.pid";
/// Name of the binary protocol socket in `RUNDIR`.
pub const SOCKET_FILE: &str = "cimd.sock";
/// Name of the rendezvous socket directory in `SYSCONFDIR`.
pub const SOCKET_DIR: &str = "sockets";

/// The resolved file system layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub bindir: PathBuf,
    pub sysconfdir: PathBuf,
    pub rundir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            bindir: BINDIR.into(),
            sysconfdir: SYSCONFDIR.into(),
            rundir: RUNDIR.into(),
        }
    }
}

impl Paths {
    /// Relocate all paths below `destdir`.
    pub fn with_destdir<P: AsRef<Path>>(destdir: P) -> Self {
        let destdir = destdir.as_ref();
        let rebase = |path: &str| destdir.join(path.trim_start_matches('/'));
        Self {
            bindir: rebase(BINDIR),
            sysconfdir: rebase(SYSCONFDIR),
            rundir: rebase(RUNDIR),
        }
    }

    pub fn engine(&self) -> PathBuf {
        self.bindir.join(ENGINE)
    }

    pub fn config_file(&self) -> PathBuf {
        self.sysconfdir.join(CONFIG_FILE)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.rundir.join(PID_FILE)
    }

    pub fn socket_file(&self) -> PathBuf {
        self.rundir.join(SOCKET_FILE)
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.sysconfdir.join(SOCKET_DIR)
    }
}

impl fmt::Display for Paths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "bindir: {}", self.bindir.display())?;
        writeln!(f, "sysconfdir: {}", self.sysconfdir.display())?;
        writeln!(f, "rundir: {}", self.rundir.display())?;
        writeln!(f, "engine: {}", self.engine().display())?;
        writeln!(f, "configfile: {}", self.config_file().display())?;
        writeln!(f, "pidfile: {}", self.pid_file().display())?;
        writeln!(f, "socketfile: {}", self.socket_file().display())?;
        write!(f, "socketdir: {}", self.socket_dir().display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destdir() {
        let paths = Paths::with_destdir("/tmp/stage");
        assert_eq!(paths.pid_file(), Path::new("/tmp/stage/var/run/cimd/cimd.pid"));
        assert_eq!(paths.socket_dir(), Path::new("/tmp/stage/etc/cimd/sockets"));
        assert_eq!(
            paths.engine(),
            Path::new("/tmp/stage/usr/libexec/cimd/cimd-engine")
        );
    }

    #[test]
    fn test_locations() {
        let locations = Paths::default().to_string();
        assert!(locations.contains("pidfile: /var/run/cimd/cimd.pid"));
        assert_eq!(locations.lines().count(), 8);
    }
}
