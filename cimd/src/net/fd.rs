//! Owned, droppable file descriptors.

use crate::error::Error;
use derive_more::From;
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag, OFlag},
    sys::socket::{socketpair, AddressFamily, SockFlag, SockType},
    unistd::{close, dup, pipe},
};
use std::{
    io, mem,
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
};

/// Wrapper for `RawFd` that closes the file descriptor when dropped.
#[derive(Debug, From)]
pub struct Fd(RawFd);

impl Fd {
    /// Create a connected pair of UNIX stream sockets.
    pub fn socketpair() -> Result<(Self, Self), Error> {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map(|(a, b)| (a.into(), b.into()))
        .map_err(Error::from)
    }

    /// Create a pipe, returns the read and the write end.
    pub fn pipe() -> Result<(Self, Self), Error> {
        pipe()
            .map(|(read, write)| (read.into(), write.into()))
            .map_err(Error::from)
    }

    /// Duplicate the file descriptor into an independent `Fd`.
    pub fn duplicate(&self) -> Result<Self, Error> {
        dup(self.0).map(Self::from).map_err(Error::from)
    }

    /// Check if the file descriptor is valid,
    pub fn is_open(&self) -> Result<(), Error> {
        fcntl(self.0, FcntlArg::F_GETFD)
            .map(|_| ())
            .map_err(|err| io::Error::new(io::ErrorKind::NotConnected, err).into())
    }

    /// Set or clear the close-on-exec flag.
    pub fn set_cloexec(&self, add: bool) -> Result<(), Error> {
        set_cloexec(self.0, add)
    }

    /// Set or clear the non-blocking flag.
    pub fn set_nonblocking(&self, add: bool) -> Result<(), Error> {
        let mut flags = OFlag::from_bits_truncate(fcntl(self.0, FcntlArg::F_GETFL)?);
        flags.set(OFlag::O_NONBLOCK, add);
        fcntl(self.0, FcntlArg::F_SETFL(flags))?;
        Ok(())
    }
}

/// Set or clear the close-on-exec flag of a raw descriptor.
pub(crate) fn set_cloexec(fd: RawFd, add: bool) -> Result<(), Error> {
    let mut flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    flags.set(FdFlag::FD_CLOEXEC, add);
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let (a, b) = Fd::socketpair().unwrap();
        a.set_nonblocking(true).unwrap();
        a.set_cloexec(true).unwrap();

        let flags = OFlag::from_bits_truncate(fcntl(a.as_raw_fd(), FcntlArg::F_GETFL).unwrap());
        assert!(flags.contains(OFlag::O_NONBLOCK));
        let flags = FdFlag::from_bits_truncate(fcntl(a.as_raw_fd(), FcntlArg::F_GETFD).unwrap());
        assert!(flags.contains(FdFlag::FD_CLOEXEC));

        let flags = OFlag::from_bits_truncate(fcntl(b.as_raw_fd(), FcntlArg::F_GETFL).unwrap());
        assert!(!flags.contains(OFlag::O_NONBLOCK));
    }

    #[test]
    fn test_into_raw_fd() {
        let (read, write) = Fd::pipe().unwrap();
        let dup = write.duplicate().unwrap();
        assert!(dup.is_open().is_ok());
        assert_ne!(dup.as_raw_fd(), write.as_raw_fd());

        // The descriptor stays open after the wrapper is released.
        let raw = read.into_raw_fd();
        let read = Fd::from(raw);
        assert!(read.is_open().is_ok());
    }
}
