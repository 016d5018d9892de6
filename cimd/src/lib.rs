//! Front-end of a privilege-separated management service daemon.
//!
//! The daemon runs either as a single privileged process or, in
//! non-root mode, as a privileged front-end that starts an unprivileged
//! engine process.  The front-end owns everything that needs
//! privileges: the singleton lock, the rendezvous socket directory and
//! the signal-driven control plane.  The engine is connected through an
//! anonymous socket pair on descriptor 3 and talks to the front-end
//! with framed `imsg` messages.
//!
//! ```text
//!  cimd -s / -r / --reload-dispatcher      (controller)
//!        |  kill(pid from cimd.pid)
//!        v
//!  +-------------+   socketpair (fd 3)   +-------------+
//!  |  front-end  | <-------------------> | cimd-engine |
//!  |   (root)    |                       |  (service)  |
//!  +-------------+                       +-------------+
//!        |
//!   sockets/cimd_XXXXXXXX
//! ```
//!
//! The lifecycle driver in [`server`] strings the components together.

pub mod config;
mod error;
pub mod imsg;
pub mod launcher;
pub mod net;
pub mod paths;
pub mod pidfile;
pub mod server;
pub mod signal;
pub mod sockdir;
pub mod transport;

pub use {
    config::{Cli, Mode, RunOptions},
    error::Error,
};
