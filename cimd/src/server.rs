//! Daemon lifecycle driver.
//!
//! `Starting → LockAcquired → Listening → Running`, with
//! `Running → ReloadingTransports → Running` on a configuration reload
//! and `Running → Terminating → Stopped` on the way out.  Daemonizing
//! happens in [`prepare`], before the runtime is built.  All work
//! requested by signals happens here, between two scheduling slices of
//! the transport.

use crate::{
    config::{Cli, RunOptions},
    error::Error,
    launcher::{self, Engine, EngineCommand},
    pidfile::PidFile,
    signal::{self, ControlSignal, SignalControl},
    sockdir,
    transport::{Multiplexer, NullDispatcher, Transport},
};
use cimd_log::{debug, error, info, warn};
use derive_more::Display;
use nix::unistd::{chdir, getuid, Pid};
use std::{
    env,
    fs::{self, DirBuilder},
    io, mem,
    os::unix::fs::{DirBuilderExt, MetadataExt},
    path::PathBuf,
    time::Duration,
};
use tokio::time::Instant;

/// Upper bound of one transport slice.
pub const SLICE: Duration = Duration::from_secs(1);

/// Credential path that must never be inherited by the daemon.
pub const NTLM_USER_FILE: &str = "NTLM_USER_FILE";

const RUNDIR_MODE: u32 = 0o755;

/// Lifecycle states of the daemon.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Starting,
    LockAcquired,
    Listening,
    Running,
    ReloadingTransports,
    Terminating,
    Stopped,
}

/// Deliver a stop or reload request to the running daemon.
pub fn control(options: &RunOptions, kind: ControlSignal) -> Result<Pid, Error> {
    PidFile::new(options.paths.pid_file()).signal(kind)
}

/// Startup checks that run before the async runtime exists.
///
/// Refuses to start next to a running instance, requires root unless
/// authentication is explicitly ignored, changes into the run
/// directory and detaches from the terminal if requested.
pub fn prepare(options: &RunOptions) -> Result<(), Error> {
    let pidfile = PidFile::new(options.paths.pid_file());
    if let Some(pid) = pidfile.running()? {
        return Err(Error::AlreadyRunning(pid));
    }

    if !options.ignore_authentication && !getuid().is_root() {
        return Err(Error::PermissionDenied);
    }

    let rundir = &options.paths.rundir;
    DirBuilder::new()
        .recursive(true)
        .mode(RUNDIR_MODE)
        .create(rundir)
        .map_err(|err| Error::DirectoryCreate(rundir.clone(), err))?;
    chdir(rundir.as_path())?;

    if options.daemonize {
        daemonize()?;
    }

    Ok(())
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "android", target_os = "dragonfly", target_os = "freebsd",
                 target_os = "linux", target_os = "netbsd", target_os = "openbsd"))] {
        fn daemonize() -> Result<(), Error> {
            // Keep the working directory, detach the standard streams.
            nix::unistd::daemon(true, false).map_err(Error::Daemonize)
        }
    } else {
        fn daemonize() -> Result<(), Error> {
            Err(Error::Daemonize(nix::Error::ENOTSUP))
        }
    }
}

/// Run the daemon with the default transport until it terminates.
pub fn run(cli: Cli, options: RunOptions) -> Result<(), Error> {
    prepare(&options)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let mut server = Server::new(cli, options, Multiplexer::new(NullDispatcher::default()));
        server.run().await
    })
}

/// The daemon context, owned by the lifecycle driver.
#[derive(Debug)]
pub struct Server<T> {
    cli: Cli,
    options: RunOptions,
    transport: T,
    state: State,
    engine: Option<Engine>,
    rendezvous: Option<PathBuf>,
    deadline: Option<Instant>,
}

impl<T: Transport> Server<T> {
    pub fn new(cli: Cli, options: RunOptions, transport: T) -> Self {
        Self {
            cli,
            options,
            transport,
            state: State::Starting,
            engine: None,
            rendezvous: None,
            deadline: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn engine(&self) -> Option<Engine> {
        self.engine
    }

    /// Acquire the lock, serve until terminated and clean up.
    ///
    /// The listeners, the engine and the lock are released on every
    /// path out of this function.
    pub async fn run(&mut self) -> Result<(), Error> {
        let mut pidfile = PidFile::new(self.options.paths.pid_file());
        pidfile.acquire()?;
        self.state = State::LockAcquired;

        let result = self.serve().await;
        if let Err(err) = &result {
            error!("{}", err);
        }

        self.shutdown();
        if let Err(err) = pidfile.release() {
            warn!("{}", err);
        }
        self.state = State::Stopped;
        info!("server stopped");

        result
    }

    async fn serve(&mut self) -> Result<(), Error> {
        scrub_environment();
        if !self.options.ignore_authentication {
            check_credential_file(&self.options);
        }

        let signals = SignalControl::install()?;
        self.listen()?;

        self.state = State::Running;
        self.deadline = self.options.live_time.map(|time| Instant::now() + time);
        info!("server running");

        loop {
            // A pending stop wins over a pending engine exit; the engine
            // is collected by the shutdown path.
            if signals.take(ControlSignal::Terminate) {
                info!("terminate requested");
                break;
            }
            if signals.take(ControlSignal::Child) {
                self.reap()?;
            }
            if signals.take(ControlSignal::ReloadConfig) {
                self.reload_transports().await?;
            }
            if signals.take(ControlSignal::ReloadDispatcher) {
                info!("dispatcher reload requested");
                if let Err(err) = self.transport.reload_dispatcher().await {
                    warn!("failed to reload dispatcher: {}", err);
                }
            }

            let slice = match self.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        info!("live time expired");
                        break;
                    }
                    SLICE.min(deadline - now)
                }
                None => SLICE,
            };

            tokio::select! {
                result = self.transport.run(slice) => result?,
                result = signals.wait() => result?,
            }
        }

        self.state = State::Terminating;
        Ok(())
    }

    /// Set up the listeners of the configured mode.
    fn listen(&mut self) -> Result<(), Error> {
        if self.options.non_root {
            let rendezvous = sockdir::provision(
                &self.options.paths.socket_dir(),
                self.options.service.as_ref(),
            )?;
            self.transport.initialize_network(&self.options)?;

            let command = EngineCommand::from_options(&self.options)?;
            let engine = launcher::launch(&command, &rendezvous, &mut self.transport)?;
            self.engine = Some(engine);
            self.rendezvous = Some(rendezvous);
        } else {
            self.transport.initialize_network(&self.options)?;
            self.open_listeners()?;
        }

        self.state = State::Listening;
        Ok(())
    }

    fn open_listeners(&mut self) -> Result<(), Error> {
        self.transport.listen_wsman(&self.options)?;
        self.transport.listen_path(&self.options.paths.socket_file())
    }

    /// Reload the configuration and rebuild the listeners.
    ///
    /// Invalid configuration keeps the previous options.  Only a failure
    /// to restore the previous listeners is fatal.
    async fn reload_transports(&mut self) -> Result<(), Error> {
        self.state = State::ReloadingTransports;
        info!("reloading configuration");

        let options = match RunOptions::load(&self.cli) {
            Ok(options) => options,
            Err(err) => {
                error!("failed to reload configuration, keeping the current one: {}", err);
                self.state = State::Running;
                return Ok(());
            }
        };

        if self.options.non_root {
            // The engine owns request handling; keep the rendezvous and
            // channel listeners and let it rebuild its dispatcher.
            self.options = options;
            if let Err(err) = self.transport.initialize_network(&self.options) {
                warn!("failed to apply network options: {}", err);
            }
            if let Err(err) = self.transport.reload_dispatcher().await {
                warn!("failed to reload dispatcher: {}", err);
            }
        } else {
            self.transport.close_listeners();
            let previous = mem::replace(&mut self.options, options);

            if let Err(err) = self
                .transport
                .initialize_network(&self.options)
                .and_then(|()| self.open_listeners())
            {
                error!("failed to apply new configuration, restoring listeners: {}", err);
                self.transport.close_listeners();
                self.options = previous;
                self.transport.initialize_network(&self.options)?;
                self.open_listeners()?;
            }
        }

        self.state = State::Running;
        info!("configuration reloaded");
        Ok(())
    }

    /// Reap children; the death of the engine is fatal.
    fn reap(&mut self) -> Result<(), Error> {
        let pid = self.engine.map(|engine| engine.pid);
        if let Some(status) = signal::reap_children(pid)? {
            self.engine = None;
            if let Some(pid) = pid {
                return Err(Error::EngineExited(pid, status));
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.state = State::Terminating;
        self.transport.close();

        if let Some(engine) = self.engine.take() {
            match engine.terminate() {
                Ok(status) => debug!("engine {} stopped: {:?}", engine.pid, status),
                Err(err) => warn!("{}", err),
            }
        }

        if let Some(path) = self.rendezvous.take() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("failed to remove {}: {}", path.display(), err),
            }
        }
    }
}

/// Drop a credential path inherited from the environment.
fn scrub_environment() {
    if env::var_os(NTLM_USER_FILE).is_some() {
        warn!("ignoring {} from the environment", NTLM_USER_FILE);
        env::remove_var(NTLM_USER_FILE);
    }
}

/// Warn if the credential file is missing or readable by others.
fn check_credential_file(options: &RunOptions) {
    let path = match &options.credential_file {
        Some(path) => path,
        None => return,
    };

    match fs::metadata(path) {
        Ok(metadata) => {
            if metadata.uid() != getuid().as_raw() {
                warn!("credential file {} is not owned by the server user", path.display());
            }
            if metadata.mode() & 0o077 != 0 {
                warn!("credential file {} is accessible by other users", path.display());
            }
        }
        Err(err) => warn!("credential file {}: {}", path.display(), err),
    }
}
