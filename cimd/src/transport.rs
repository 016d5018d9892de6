//! Interfaces to the protocol and transport layer.
//!
//! The lifecycle driver only needs to register listeners, run the
//! protocol engine for one scheduling slice at a time and trigger a
//! dispatcher reload.  [`Multiplexer`] implements this on top of tokio
//! and hands every accepted connection to a [`Dispatcher`].

use crate::{
    config::RunOptions,
    error::Error,
    imsg::{Handler, Message},
};
use async_trait::async_trait;
use cimd_log::{debug, info, warn};
use derive_more::Display;
use serde_derive::{Deserialize, Serialize};
use std::{
    fs, future, io,
    net::{SocketAddr, TcpListener as StdTcpListener},
    path::{Path, PathBuf},
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream, UnixListener, UnixStream},
    time::sleep,
};

/// Message ID of control requests from the front-end to the engine.
pub const ENGINE_CONTROL: u32 = Message::RESERVED + 1;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The role of a listener.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Binary protocol on a UNIX socket file.
    #[display(fmt = "binary")]
    Binary,
    /// Binary protocol on the anonymous channel to the engine.
    #[display(fmt = "split")]
    Split,
    /// WS-Management over HTTP.
    #[display(fmt = "http")]
    Http,
    /// WS-Management over HTTPS.
    #[display(fmt = "https")]
    Https,
}

/// Control requests sent to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    ReloadDispatcher,
}

/// An accepted client connection.
#[derive(Debug)]
pub enum Connection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

/// The request dispatcher behind the listeners.
pub trait Dispatcher {
    /// Apply the (re)loaded options.
    fn configure(&mut self, options: &RunOptions) -> Result<(), Error>;

    /// Take over an accepted connection.
    fn connection(&mut self, role: Role, connection: Connection) -> Result<(), Error>;

    /// Handle a message from the engine.
    fn engine_message(&mut self, message: Message, payload: Vec<u8>) -> Result<(), Error>;

    /// Rebuild the dispatcher state without touching the listeners.
    fn reload(&mut self) -> Result<(), Error>;
}

/// The protocol engine as seen by the lifecycle driver.
#[async_trait(?Send)]
pub trait Transport {
    /// Prepare the network stack.
    fn initialize_network(&mut self, options: &RunOptions) -> Result<(), Error>;

    /// Listen for binary protocol connections on a socket file.
    fn listen_path(&mut self, path: &Path) -> Result<(), Error>;

    /// Register the front-end's end of the engine channel.
    fn listen_channel(&mut self, channel: Handler) -> Result<(), Error>;

    /// Listen on the configured WS-Management ports.
    fn listen_wsman(&mut self, options: &RunOptions) -> Result<(), Error>;

    /// Run the protocol engine for at most one scheduling slice.
    async fn run(&mut self, slice: Duration) -> Result<(), Error>;

    /// Reload the dispatcher state.
    async fn reload_dispatcher(&mut self) -> Result<(), Error>;

    /// Close all listeners except the engine channel.
    fn close_listeners(&mut self);

    /// Close all listeners and the engine channel.
    fn close(&mut self);
}

#[derive(Debug)]
enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp { listener: TcpListener, role: Role },
}

impl Listener {
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(Role, Connection)>> {
        match self {
            Self::Unix { listener, .. } => listener
                .poll_accept(cx)
                .map_ok(|(stream, _)| (Role::Binary, Connection::Unix(stream))),
            Self::Tcp { listener, role } => listener
                .poll_accept(cx)
                .map_ok(|(stream, _)| (*role, Connection::Tcp(stream))),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            let _ = fs::remove_file(path);
        }
    }
}

/// Default transport: tokio listeners and the engine channel.
#[derive(Debug)]
pub struct Multiplexer<D> {
    dispatcher: D,
    listeners: Vec<Listener>,
    channel: Option<Handler>,
    http_trace: bool,
}

impl<D: Dispatcher> Multiplexer<D> {
    pub fn new(dispatcher: D) -> Self {
        Self {
            dispatcher,
            listeners: Vec::new(),
            channel: None,
            http_trace: false,
        }
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Number of open listeners, not counting the engine channel.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    fn bind_tcp(&mut self, port: u16, role: Role) -> Result<(), Error> {
        let address = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = StdTcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let port = listener.local_addr()?.port();
        info!("listening on {} port {}", role, port);
        self.listeners.push(Listener::Tcp { listener, role });
        Ok(())
    }
}

/// Accept errors that leave the listening socket unusable.
fn listener_failed(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBADF) | Some(libc::EINVAL) | Some(libc::ENOTSOCK) | Some(libc::EOPNOTSUPP)
    )
}

async fn accept_any(listeners: &[Listener]) -> io::Result<(Role, Connection)> {
    future::poll_fn(|cx| {
        for listener in listeners {
            if let Poll::Ready(result) = listener.poll_accept(cx) {
                return Poll::Ready(result);
            }
        }
        Poll::Pending
    })
    .await
}

async fn recv_engine(channel: Option<&Handler>) -> io::Result<Option<(Message, Vec<u8>)>> {
    match channel {
        Some(channel) => channel.recv_message().await,
        None => future::pending().await,
    }
}

#[async_trait(?Send)]
impl<D: Dispatcher> Transport for Multiplexer<D> {
    fn initialize_network(&mut self, options: &RunOptions) -> Result<(), Error> {
        self.http_trace = options.http_trace;
        self.dispatcher.configure(options)
    }

    fn listen_path(&mut self, path: &Path) -> Result<(), Error> {
        match fs::remove_file(path) {
            Ok(()) => debug!("removed stale socket {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let listener = UnixListener::bind(path)?;
        info!("listening on {}", path.display());
        self.listeners.push(Listener::Unix {
            listener,
            path: path.to_path_buf(),
        });
        Ok(())
    }

    fn listen_channel(&mut self, channel: Handler) -> Result<(), Error> {
        if self.channel.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "engine channel is already registered",
            )
            .into());
        }
        self.channel = Some(channel);
        Ok(())
    }

    fn listen_wsman(&mut self, options: &RunOptions) -> Result<(), Error> {
        for port in &options.http_ports {
            self.bind_tcp(*port, Role::Http)?;
        }
        for port in &options.https_ports {
            self.bind_tcp(*port, Role::Https)?;
        }
        Ok(())
    }

    async fn run(&mut self, slice: Duration) -> Result<(), Error> {
        tokio::select! {
            accepted = accept_any(&self.listeners) => {
                let (role, connection) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) if listener_failed(&err) => return Err(err.into()),
                    Err(err) => {
                        // Out of descriptors or an aborted handshake.
                        warn!("accept failed: {}", err);
                        sleep(ACCEPT_BACKOFF.min(slice)).await;
                        return Ok(());
                    }
                };
                if self.http_trace && matches!(role, Role::Http | Role::Https) {
                    if let Connection::Tcp(stream) = &connection {
                        info!("{}: connection from {:?}", role, stream.peer_addr().ok());
                    }
                }
                self.dispatcher.connection(role, connection)?;
            }
            received = recv_engine(self.channel.as_ref()) => match received? {
                Some((message, payload)) => self.dispatcher.engine_message(message, payload)?,
                None => {
                    warn!("engine closed the channel");
                    self.channel = None;
                }
            },
            _ = sleep(slice) => {}
        }
        Ok(())
    }

    async fn reload_dispatcher(&mut self) -> Result<(), Error> {
        self.dispatcher.reload()?;
        if let Some(channel) = &self.channel {
            channel
                .send_message(Message::new(ENGINE_CONTROL), &Control::ReloadDispatcher)
                .await?;
        }
        Ok(())
    }

    fn close_listeners(&mut self) {
        self.listeners.clear();
    }

    fn close(&mut self) {
        self.close_listeners();
        if let Some(channel) = self.channel.take() {
            channel.shutdown();
        }
    }
}

/// Dispatcher that accepts and closes every connection.
///
/// It runs the control plane without a provider stack behind it.
#[derive(Debug, Default)]
pub struct NullDispatcher {
    pub connections: usize,
    pub reloads: usize,
}

impl Dispatcher for NullDispatcher {
    fn configure(&mut self, options: &RunOptions) -> Result<(), Error> {
        debug!(
            "dispatcher configured, idle timeout {}s",
            options.idle_timeout.as_secs()
        );
        Ok(())
    }

    fn connection(&mut self, role: Role, connection: Connection) -> Result<(), Error> {
        self.connections += 1;
        debug!("{}: closing connection {:?}", role, connection);
        Ok(())
    }

    fn engine_message(&mut self, message: Message, payload: Vec<u8>) -> Result<(), Error> {
        debug!(
            "engine message {} from pid {}, {} bytes",
            message.id,
            message.pid,
            payload.len()
        );
        Ok(())
    }

    fn reload(&mut self) -> Result<(), Error> {
        self.reloads += 1;
        info!("dispatcher reloaded");
        Ok(())
    }
}
