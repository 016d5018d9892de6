//! Owned file descriptors for the engine channel and the signal pipe.

mod fd;

pub use fd::Fd;
