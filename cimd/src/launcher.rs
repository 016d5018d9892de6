//! Start of the unprivileged engine process.
//!
//! The front-end creates a socket pair, forks, and the child drops to
//! the service account, moves its end of the pair to descriptor 3 and
//! executes the engine binary.  Failures in the child are reported back
//! through a close-on-exec status pipe, so the front-end only registers
//! its listeners once the engine binary is running.

use crate::{
    config::{RunOptions, ServiceAccount},
    error::Error,
    imsg::Handler,
    net::Fd,
    signal,
    transport::Transport,
};
use cimd_log::{debug, info, warn};
use close_fds::close_open_fds;
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, FdFlag},
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{self, dup2, execv, fork, read, write, ForkResult, Gid, Pid, Uid},
};
use std::{
    ffi::CString,
    os::unix::{
        ffi::OsStrExt,
        io::{AsRawFd, RawFd},
    },
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

/// Descriptor number of the engine's end of the channel.
pub const CHANNEL_FD: RawFd = 3;

/// Option that tells the engine which descriptor to use.
pub const SOCKETPAIR_FLAG: &str = "--socketpair";

/// Number of polls for the engine to exit after `SIGTERM`.
const TERMINATE_POLLS: usize = 50;
const TERMINATE_INTERVAL: Duration = Duration::from_millis(100);

/// Everything the child needs to start the engine, prepared before forking.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    path: PathBuf,
    program: CString,
    argv: Vec<CString>,
    uid: Uid,
    gid: Gid,
}

impl EngineCommand {
    pub fn new<S: AsRef<str>>(
        path: &Path,
        args: &[S],
        account: &ServiceAccount,
    ) -> Result<Self, Error> {
        let invalid =
            |what: &str| Error::Configuration(format!("invalid engine {} (NUL byte)", what));
        let program =
            CString::new(path.as_os_str().as_bytes()).map_err(|_| invalid("path"))?;

        let mut argv = Vec::with_capacity(args.len() + 3);
        argv.push(program.clone());
        for arg in args {
            argv.push(CString::new(arg.as_ref()).map_err(|_| invalid("argument"))?);
        }
        argv.push(CString::new(SOCKETPAIR_FLAG).map_err(|_| invalid("argument"))?);
        argv.push(CString::new(CHANNEL_FD.to_string()).map_err(|_| invalid("argument"))?);

        Ok(Self {
            path: path.to_path_buf(),
            program,
            argv,
            uid: account.uid,
            gid: account.gid,
        })
    }

    /// The engine command of a non-root configuration.
    pub fn from_options(options: &RunOptions) -> Result<Self, Error> {
        let account = options.service.as_ref().ok_or_else(|| {
            Error::Configuration("no service account for the engine".to_string())
        })?;
        Self::new(&options.paths.engine(), &options.engine_args, account)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }
}

/// The running engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Engine {
    pub pid: Pid,
}

impl Engine {
    /// Terminate the engine and reap it.
    ///
    /// The engine gets `SIGTERM` and a few seconds to exit before it is
    /// killed.  Returns `None` if the process was already gone.
    pub fn terminate(&self) -> Result<Option<WaitStatus>, Error> {
        match kill(self.pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(self.reap()),
            Err(err) => return Err(Error::SignalDelivery(self.pid, err)),
        }

        for _ in 0..TERMINATE_POLLS {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => thread::sleep(TERMINATE_INTERVAL),
                Ok(status) => return Ok(Some(status)),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }

        warn!("engine {} did not terminate, killing it", self.pid);
        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => return Err(Error::SignalDelivery(self.pid, err)),
        }
        match waitpid(self.pid, None) {
            Ok(status) => Ok(Some(status)),
            Err(Errno::ECHILD) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn reap(&self) -> Option<WaitStatus> {
        waitpid(self.pid, Some(WaitPidFlag::WNOHANG)).ok()
    }
}

/// Steps in the child that can fail before the engine is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Stage {
    Setgroups = 1,
    Setgid,
    Setuid,
    Dup2,
    Cloexec,
    Exec,
}

impl Stage {
    fn from_u8(value: u8) -> Option<Self> {
        [
            Self::Setgroups,
            Self::Setgid,
            Self::Setuid,
            Self::Dup2,
            Self::Cloexec,
            Self::Exec,
        ]
        .iter()
        .copied()
        .find(|stage| *stage as u8 == value)
    }

    fn into_error(self, command: &EngineCommand, errno: Errno) -> Error {
        match self {
            Self::Setgroups => Error::Privdrop("setgroups", errno),
            Self::Setgid => Error::Privdrop(SETGID, errno),
            Self::Setuid => Error::Privdrop(SETUID, errno),
            Self::Dup2 => Error::ChannelSetup("dup2", errno),
            Self::Cloexec => Error::ChannelSetup("fcntl", errno),
            Self::Exec => Error::Exec(command.path.clone(), errno),
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "android", target_os = "freebsd",
                 target_os = "linux", target_os = "openbsd"))] {
        const SETGID: &str = "setresgid";
        const SETUID: &str = "setresuid";

        fn set_ids(uid: Uid, gid: Gid) -> Result<(), (Stage, Errno)> {
            unistd::setresgid(gid, gid, gid).map_err(|err| (Stage::Setgid, err))?;
            unistd::setresuid(uid, uid, uid).map_err(|err| (Stage::Setuid, err))
        }
    } else {
        const SETGID: &str = "setgid";
        const SETUID: &str = "setuid";

        fn set_ids(uid: Uid, gid: Gid) -> Result<(), (Stage, Errno)> {
            unistd::setegid(gid).map_err(|err| (Stage::Setgid, err))?;
            unistd::setgid(gid).map_err(|err| (Stage::Setgid, err))?;
            // seteuid before setuid fails on macOS
            #[cfg(not(any(target_os = "ios", target_os = "macos")))]
            unistd::seteuid(uid).map_err(|err| (Stage::Setuid, err))?;
            unistd::setuid(uid).map_err(|err| (Stage::Setuid, err))
        }
    }
}

/// Switch to the service account, unless the process already runs as it.
fn drop_privileges(uid: Uid, gid: Gid) -> Result<(), (Stage, Errno)> {
    if unistd::getuid() == uid
        && unistd::geteuid() == uid
        && unistd::getgid() == gid
        && unistd::getegid() == gid
    {
        return Ok(());
    }

    #[cfg(not(any(target_os = "ios", target_os = "macos", target_os = "redox")))]
    unistd::setgroups(&[gid]).map_err(|err| (Stage::Setgroups, err))?;

    set_ids(uid, gid)
}

/// Runs in the forked child; only returns if starting the engine failed.
fn exec_engine(command: &EngineCommand, channel: RawFd, status: &mut RawFd) -> (Stage, Errno) {
    if let Err(err) = drop_privileges(command.uid, command.gid) {
        return err;
    }

    if *status == CHANNEL_FD {
        *status = match fcntl(*status, FcntlArg::F_DUPFD_CLOEXEC(CHANNEL_FD + 1)) {
            Ok(fd) => fd,
            Err(err) => return (Stage::Cloexec, err),
        };
    }
    if channel != CHANNEL_FD {
        // The duplicate does not inherit close-on-exec.
        if let Err(err) = dup2(channel, CHANNEL_FD) {
            return (Stage::Dup2, err);
        }
    } else if let Err(err) = fcntl(CHANNEL_FD, FcntlArg::F_SETFD(FdFlag::empty())) {
        return (Stage::Cloexec, err);
    }

    unsafe {
        close_open_fds(CHANNEL_FD + 1, &[*status]);
    }

    match execv(&command.program, &command.argv) {
        Ok(never) => match never {},
        Err(err) => (Stage::Exec, err),
    }
}

fn report_failure(status: RawFd, stage: Stage, errno: Errno) {
    let mut buf = [0u8; 5];
    buf[0] = stage as u8;
    buf[1..].copy_from_slice(&(errno as i32).to_ne_bytes());
    let _ = write(status, &buf);
}

/// Wait for the child to either execute the engine or report a failure.
fn read_status(status: &Fd) -> Result<Option<(Stage, Errno)>, Error> {
    let mut buf = [0u8; 5];
    let mut length = 0;
    while length < buf.len() {
        match read(status.as_raw_fd(), &mut buf[length..]) {
            Ok(0) => break,
            Ok(n) => length += n,
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(Error::ChannelSetup("read", err)),
        }
    }

    match length {
        // Closed on exec.
        0 => Ok(None),
        5 => {
            let mut errno = [0u8; 4];
            errno.copy_from_slice(&buf[1..]);
            let errno = Errno::from_i32(i32::from_ne_bytes(errno));
            let stage = Stage::from_u8(buf[0]).unwrap_or(Stage::Exec);
            Ok(Some((stage, errno)))
        }
        _ => Err(Error::ChannelSetup("read", Errno::EIO)),
    }
}

fn channel_error(stage: &'static str) -> impl Fn(Error) -> Error {
    move |err| match err {
        Error::UnixError(err) => Error::ChannelSetup(stage, err),
        err => err,
    }
}

/// Start the engine and register the rendezvous socket and the channel.
///
/// Nothing is registered with `transport` if the engine could not be
/// started.
pub fn launch<T: Transport + ?Sized>(
    command: &EngineCommand,
    rendezvous: &Path,
    transport: &mut T,
) -> Result<Engine, Error> {
    let (parent, child) = Fd::socketpair().map_err(channel_error("socketpair"))?;
    for fd in &[&parent, &child] {
        fd.set_nonblocking(true).map_err(channel_error("fcntl"))?;
        fd.set_cloexec(true).map_err(channel_error("fcntl"))?;
    }
    let (status_read, status_write) = Fd::pipe().map_err(channel_error("pipe"))?;
    status_read.set_cloexec(true).map_err(channel_error("fcntl"))?;
    status_write.set_cloexec(true).map_err(channel_error("fcntl"))?;

    let pid = match unsafe { fork() }.map_err(Error::Fork)? {
        ForkResult::Child => {
            signal::detach_in_child();
            drop(parent);
            drop(status_read);
            let mut status = status_write.as_raw_fd();
            let (stage, errno) = exec_engine(command, child.as_raw_fd(), &mut status);
            report_failure(status, stage, errno);
            unsafe { libc::_exit(1) }
        }
        ForkResult::Parent { child: pid } => pid,
    };

    drop(child);
    drop(status_write);

    if let Some((stage, errno)) = read_status(&status_read)? {
        let _ = waitpid(pid, None);
        return Err(stage.into_error(command, errno));
    }
    info!("started engine {} as pid {}", command.path.display(), pid);

    let engine = Engine { pid };
    let registered = transport
        .listen_path(rendezvous)
        .and_then(|()| Handler::from_raw_fd(parent).map_err(Error::from))
        .and_then(|handler| transport.listen_channel(handler));
    if let Err(err) = registered {
        debug!("terminating engine {}: {}", pid, err);
        if let Err(err) = engine.terminate() {
            warn!("{}", err);
        }
        return Err(err);
    }

    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{getgid, getuid};

    fn account() -> ServiceAccount {
        ServiceAccount {
            name: "test".to_string(),
            uid: getuid(),
            gid: getgid(),
        }
    }

    #[test]
    fn test_engine_argv() {
        let command = EngineCommand::new(
            Path::new("/usr/libexec/cimd/cimd-engine"),
            &["--httpport", "80"],
            &account(),
        )
        .unwrap();
        let argv = command
            .argv()
            .iter()
            .map(|arg| arg.to_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(
            argv,
            vec![
                "/usr/libexec/cimd/cimd-engine",
                "--httpport",
                "80",
                "--socketpair",
                "3"
            ]
        );
    }

    #[test]
    fn test_engine_argv_nul() {
        let err = EngineCommand::new(Path::new("/bin/true"), &["a\0b"], &account()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_stage_errors() {
        let command = EngineCommand::new(Path::new("/bin/true"), &[] as &[&str], &account())
            .unwrap();
        for value in 1..=6 {
            assert_eq!(Stage::from_u8(value).map(|stage| stage as u8), Some(value));
        }
        assert_eq!(Stage::from_u8(0), None);
        assert!(matches!(
            Stage::Setuid.into_error(&command, Errno::EPERM),
            Error::Privdrop(_, Errno::EPERM)
        ));
        assert!(matches!(
            Stage::Exec.into_error(&command, Errno::ENOENT),
            Error::Exec(_, Errno::ENOENT)
        ));
    }

    #[test]
    fn test_drop_privileges_noop() {
        // Already running as the target account.
        assert_eq!(drop_privileges(getuid(), getgid()), Ok(()));
    }
}
