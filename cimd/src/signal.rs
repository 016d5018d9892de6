//! Signal control plane.
//!
//! OS signals only record intent: the handler sets one flag per kind of
//! request and writes a byte to a self-pipe to wake up the main loop.
//! The lifecycle driver reads and clears the flags between iterations
//! and does the actual work outside of signal context.

use crate::{error::Error, net::Fd};
use cimd_log::debug;
use nix::{
    errno::Errno,
    sys::{
        signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{read, write, Pid},
};
use std::{
    fmt, io,
    os::unix::io::AsRawFd,
    sync::atomic::{AtomicBool, AtomicI32, Ordering},
};
use tokio::io::unix::AsyncFd;

/// Requests that can be delivered to the daemon by signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Graceful termination (`SIGTERM`).
    Terminate,
    /// Reload the configuration and rebuild the listeners (`SIGHUP`).
    ReloadConfig,
    /// Reload the request dispatcher only (`SIGUSR1`).
    ReloadDispatcher,
    /// A child process changed state (`SIGCHLD`).
    Child,
}

impl ControlSignal {
    pub const ALL: [ControlSignal; 4] = [
        ControlSignal::Terminate,
        ControlSignal::ReloadConfig,
        ControlSignal::ReloadDispatcher,
        ControlSignal::Child,
    ];

    /// The OS signal that carries this request.
    pub fn signal(self) -> Signal {
        match self {
            Self::Terminate => Signal::SIGTERM,
            Self::ReloadConfig => Signal::SIGHUP,
            Self::ReloadDispatcher => Signal::SIGUSR1,
            Self::Child => Signal::SIGCHLD,
        }
    }

    fn from_raw(signo: libc::c_int) -> Option<Self> {
        match signo {
            libc::SIGTERM => Some(Self::Terminate),
            libc::SIGHUP => Some(Self::ReloadConfig),
            libc::SIGUSR1 => Some(Self::ReloadDispatcher),
            libc::SIGCHLD => Some(Self::Child),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// One pending flag per `ControlSignal`.
static PENDING: [AtomicBool; 4] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];

/// Write end of the self-pipe, `-1` if no handlers are installed.
static WAKEUP: AtomicI32 = AtomicI32::new(-1);

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__errno_location()
        }
    } else if #[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))] {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__errno()
        }
    } else {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__error()
        }
    }
}

extern "C" fn handle_signal(signo: libc::c_int) {
    // Only async-signal-safe operations in here.
    let saved_errno = unsafe { *errno_location() };

    if let Some(kind) = ControlSignal::from_raw(signo) {
        PENDING[kind.index()].store(true, Ordering::SeqCst);
    }
    let fd = WAKEUP.load(Ordering::SeqCst);
    if fd >= 0 {
        let _ = write(fd, &[signo as u8]);
    }

    unsafe { *errno_location() = saved_errno };
}

/// Record a request as if the signal had been delivered.
pub fn raise(kind: ControlSignal) {
    handle_signal(kind.signal() as libc::c_int);
}

/// Forget the self-pipe in a forked child before its descriptors are
/// closed or replaced.
pub(crate) fn detach_in_child() {
    WAKEUP.store(-1, Ordering::SeqCst);
}

/// Installed signal handlers and the wakeup side of the self-pipe.
///
/// Only one instance can exist per process; dropping it restores the
/// previous signal dispositions.
pub struct SignalControl {
    wakeup: AsyncFd<Fd>,
    notify: Fd,
    previous: Vec<(Signal, SigAction)>,
}

impl SignalControl {
    /// Install the handlers.  Must be called within a tokio runtime.
    pub fn install() -> Result<Self, Error> {
        let (wakeup, notify) = Fd::pipe()?;
        for fd in &[&wakeup, &notify] {
            fd.set_nonblocking(true)?;
            fd.set_cloexec(true)?;
        }
        let wakeup = AsyncFd::new(wakeup)?;

        if WAKEUP
            .compare_exchange(-1, notify.as_raw_fd(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "signal handlers are already installed",
            )
            .into());
        }
        for pending in &PENDING {
            pending.store(false, Ordering::SeqCst);
        }

        let mut control = Self {
            wakeup,
            notify,
            previous: Vec::with_capacity(ControlSignal::ALL.len()),
        };

        let action = SigAction::new(
            SigHandler::Handler(handle_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for kind in ControlSignal::ALL.iter() {
            let signal = kind.signal();
            // Dropping `control` on error restores the handlers installed so far.
            let previous = unsafe { sigaction(signal, &action) }?;
            control.previous.push((signal, previous));
        }

        Ok(control)
    }

    /// Read and clear the pending flag of a request.
    pub fn take(&self, kind: ControlSignal) -> bool {
        PENDING[kind.index()].swap(false, Ordering::SeqCst)
    }

    /// Check if a request is pending without clearing it.
    pub fn is_pending(&self, kind: ControlSignal) -> bool {
        PENDING[kind.index()].load(Ordering::SeqCst)
    }

    /// Wait until a request is pending.
    pub async fn wait(&self) -> Result<(), Error> {
        loop {
            if ControlSignal::ALL.iter().any(|kind| self.is_pending(*kind)) {
                self.drain();
                return Ok(());
            }

            let mut guard = self.wakeup.readable().await?;
            let drained = self.drain();
            guard.clear_ready();
            if drained > 0 {
                return Ok(());
            }
        }
    }

    /// Empty the self-pipe, returns the number of bytes read.
    fn drain(&self) -> usize {
        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            match read(self.wakeup.get_ref().as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(length) => total += length,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        total
    }
}

impl fmt::Debug for SignalControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalControl")
            .field("wakeup", self.wakeup.get_ref())
            .field("notify", &self.notify)
            .finish()
    }
}

impl Drop for SignalControl {
    fn drop(&mut self) {
        for (signal, action) in self.previous.drain(..).rev() {
            let _ = unsafe { sigaction(signal, &action) };
        }
        let _ = WAKEUP.compare_exchange(
            self.notify.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// Reap all terminated children without blocking.
///
/// Returns the exit status of `engine` if it was among them.
pub fn reap_children(engine: Option<Pid>) -> Result<Option<WaitStatus>, Error> {
    let mut engine_status = None;

    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                debug!("child process changed state: {:?}", status);
                if status.pid().is_some() && status.pid() == engine {
                    engine_status = Some(status);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(err) => return Err(err.into()),
        }
    }

    Ok(engine_status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_mapping() {
        for kind in ControlSignal::ALL.iter() {
            assert_eq!(
                ControlSignal::from_raw(kind.signal() as libc::c_int),
                Some(*kind)
            );
        }
        assert_eq!(ControlSignal::from_raw(libc::SIGINT), None);
        assert_eq!(ControlSignal::Terminate.signal(), Signal::SIGTERM);
        assert_eq!(ControlSignal::ReloadDispatcher.signal(), Signal::SIGUSR1);
    }
}
