//! Singleton lock and external control file.
//!
//! The pid file records the process ID of the running daemon.  It
//! prevents a second instance from starting and tells a controller
//! invocation (`-s`, `-r`, `--reload-dispatcher`) which process to signal.

use crate::{error::Error, signal::ControlSignal};
use cimd_log::{info, warn};
use nix::{
    errno::Errno,
    sys::signal::kill,
    unistd::{getpid, Pid},
};
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

/// Mode of a newly created pid file.
const PID_FILE_MODE: u32 = 0o644;

/// The singleton lock record.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    acquired: bool,
}

impl PidFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            acquired: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Return the pid of the running instance, if there is one.
    ///
    /// A missing file, a file without a valid pid and a pid of a dead
    /// process all mean that no instance is running.
    pub fn running(&self) -> Result<Option<Pid>, Error> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let pid = match content.trim().parse::<libc::pid_t>() {
            Ok(pid) if pid > 0 => Pid::from_raw(pid),
            _ => return Ok(None),
        };

        match kill(pid, None) {
            Ok(()) | Err(Errno::EPERM) => Ok(Some(pid)),
            Err(Errno::ESRCH) => Ok(None),
            Err(err) => Err(Error::SignalDelivery(pid, err)),
        }
    }

    /// Create the pid file for the current process.
    pub fn acquire(&mut self) -> Result<(), Error> {
        if let Some(pid) = self.running()? {
            return Err(Error::AlreadyRunning(pid));
        }

        // Remove a stale record of a process that is gone.
        match fs::remove_file(&self.path) {
            Ok(()) => warn!("removed stale pid file {}", self.path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::Lock(self.path.clone(), err)),
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(PID_FILE_MODE)
            .open(&self.path)
            .map_err(|err| match err.kind() {
                // Lost the race against another instance.
                io::ErrorKind::AlreadyExists => match self.running() {
                    Ok(Some(pid)) => Error::AlreadyRunning(pid),
                    _ => Error::Lock(self.path.clone(), err),
                },
                _ => Error::Lock(self.path.clone(), err),
            })?;
        self.acquired = true;

        writeln!(file, "{}", getpid())
            .and_then(|_| file.sync_all())
            .map_err(|err| Error::Lock(self.path.clone(), err))?;

        info!("created pid file {}", self.path.display());

        Ok(())
    }

    /// Remove the pid file if it was created by this process.
    pub fn release(&mut self) -> Result<(), Error> {
        if !self.acquired {
            return Ok(());
        }
        self.acquired = false;

        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Lock(self.path.clone(), err)),
        }
    }

    /// Deliver a control signal to the running instance.
    pub fn signal(&self, kind: ControlSignal) -> Result<Pid, Error> {
        let pid = self.running()?.ok_or(Error::NotRunning)?;

        match kill(pid, kind.signal()) {
            Ok(()) => Ok(pid),
            // The daemon exited after we read the file.
            Err(Errno::ESRCH) => Err(Error::NotRunning),
            Err(err) => Err(Error::SignalDelivery(pid, err)),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!("{}", err);
        }
    }
}
