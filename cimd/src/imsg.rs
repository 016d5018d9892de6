//! Internal message handling on the channel between the front-end and
//! the engine.

use bytes::{Buf, BytesMut};
use nix::unistd::getpid;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    convert::TryFrom,
    io::{self, Result},
    mem,
    os::unix::{
        io::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
        net as std_net,
    },
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::net::UnixStream;
use zerocopy::{AsBytes, FromBytes};

/// `imsg` handler.
#[derive(Debug)]
pub struct Handler {
    /// Async half of a UNIX socketpair.
    socket: UnixStream,
    /// Set after the stream was shut down.
    shutdown: AtomicBool,
    /// Read buffer.
    read_buffer: Mutex<BytesMut>,
}

impl From<UnixStream> for Handler {
    fn from(socket: UnixStream) -> Self {
        Self {
            socket,
            shutdown: Default::default(),
            read_buffer: Mutex::new(BytesMut::with_capacity(Self::BUFFER_LENGTH)),
        }
    }
}

impl Handler {
    pub const BUFFER_LENGTH: usize = 0xffff;

    /// Create new handler pair.
    pub fn pair() -> Result<(Self, Self)> {
        UnixStream::pair().map(|(a, b)| (a.into(), b.into()))
    }

    /// Create half of a handler pair from a file descriptor.
    ///
    /// Must be called within a tokio runtime.
    pub fn from_raw_fd<T: IntoRawFd>(fd: T) -> Result<Handler> {
        let stream = unsafe { std_net::UnixStream::from_raw_fd(fd.into_raw_fd()) };
        stream.set_nonblocking(true)?;
        UnixStream::from_std(stream).map(Into::into)
    }

    /// Send message to remote end.
    pub async fn send_message<T: Serialize>(&self, message: Message, data: &T) -> Result<()> {
        if message.id < Message::RESERVED {
            return Err(io::Error::new(io::ErrorKind::Other, "Reserved message ID"));
        }
        self.send_message_internal(message, data).await
    }

    /// Send message to the remote end.
    pub(crate) async fn send_message_internal<T: Serialize>(
        &self,
        mut message: Message,
        data: &T,
    ) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "Handler is closed",
            ));
        }
        let data = bincode::serialize(data)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        message.pid = getpid().as_raw();
        message.length = u16::try_from(data.len() + Message::HEADER_LENGTH)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let mut buf = Vec::with_capacity(message.length as usize);
        buf.extend_from_slice(message.as_bytes());
        buf.extend_from_slice(&data);

        let mut written = 0;
        while written < buf.len() {
            self.socket.writable().await?;

            match self.socket.try_write(&buf[written..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "short message")),
                Ok(length) => written += length,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Receive message from the remote end.
    ///
    /// Returns `None` when the remote end closed the channel.  Partial
    /// messages stay in the read buffer, so the returned future can be
    /// dropped and the call repeated.
    pub async fn recv_message<T: DeserializeOwned>(&self) -> Result<Option<(Message, T)>> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "Handler is closed",
            ));
        }

        let mut message = Message::default();

        let received_buf = loop {
            {
                let mut buf = self.read_buffer.lock();

                if buf.len() >= Message::HEADER_LENGTH {
                    message
                        .as_bytes_mut()
                        .copy_from_slice(&buf[..Message::HEADER_LENGTH]);
                    let message_length = message.length as usize;

                    if message_length < Message::HEADER_LENGTH {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid message length",
                        ));
                    }

                    // We have a complete message, break out of the loop.
                    if buf.len() >= message_length {
                        break buf.split_to(message_length);
                    }
                }
            }

            // Read more data.  This is also our yield point in the loop.
            self.socket.readable().await?;

            let mut buf = self.read_buffer.lock();
            buf.reserve(Self::BUFFER_LENGTH);
            match self.socket.try_read_buf(&mut *buf) {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }
        };

        let mut payload = received_buf;
        payload.advance(Message::HEADER_LENGTH);

        let result = bincode::deserialize(&payload)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        Ok(Some((message, result)))
    }

    /// Mark the handler as closed; further sends and receives fail.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl AsRawFd for Handler {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Internal message header.
#[derive(Debug, AsBytes, FromBytes, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Message {
    /// Request type.
    pub id: u32,
    /// Total message length (header + payload).
    pub length: u16,
    /// Optional flags.
    pub flags: u16,
    /// Optional peer ID.
    pub peer_id: u32,
    /// Local PID.
    pub pid: libc::pid_t,
}

impl Message {
    /// Reserved IDs 0-10
    pub const RESERVED: u32 = 10;

    /// Message header length.
    pub const HEADER_LENGTH: usize = mem::size_of::<Self>();

    /// Create new message header.
    pub fn new<T: Into<u32>>(id: T) -> Self {
        let length = Self::HEADER_LENGTH as u16;
        Message {
            id: id.into(),
            pid: getpid().as_raw(),
            length,
            ..Default::default()
        }
    }

    pub fn min() -> Self {
        Self::RESERVED.into()
    }
}

impl<T: Into<u32>> From<T> for Message {
    fn from(id: T) -> Self {
        Message::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        id: usize,
        name: String,
    }

    #[test]
    fn test_empty_data() {
        let data = bincode::serialize(&()).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_header_length() {
        assert_eq!(Message::HEADER_LENGTH, 16);
    }

    #[tokio::test]
    async fn test_reserved_id() {
        let (a, _b) = Handler::pair().unwrap();
        let err = a.send_message(Message::new(1u32), &()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[tokio::test]
    async fn test_messages_in_order() {
        let (a, b) = Handler::pair().unwrap();

        for id in 1..=3 {
            let ping = Ping {
                id,
                name: "ping".to_string(),
            };
            a.send_message(Message::min(), &ping).await.unwrap();
        }
        a.send_message(Message::new(42u32), &()).await.unwrap();
        drop(a);

        for id in 1..=3 {
            let (message, ping) = b.recv_message::<Ping>().await.unwrap().unwrap();
            assert_eq!(message.id, Message::RESERVED);
            assert_eq!(message.pid, getpid().as_raw());
            assert_eq!(ping.id, id);
        }
        let (message, ()) = b.recv_message::<()>().await.unwrap().unwrap();
        assert_eq!(message.id, 42);
        assert_eq!(message.length as usize, Message::HEADER_LENGTH);

        assert!(b.recv_message::<()>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (a, _b) = Handler::pair().unwrap();
        a.shutdown();
        let err = a.send_message(Message::min(), &()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
