#![deny(missing_docs)]

//! Mio readiness loop and event registrar for keel.
//!
//! The `Registrar` is the only code path that adds, modifies, or removes a socket's
//! multiplexer registration. Connection registrations are edge-triggered and one-shot: once an
//! event has been claimed for a socket, no further events are delivered for it until the
//! current owner explicitly re-arms it.

mod event_loop;
mod net;
mod registrar;

pub use self::{
    event_loop::{run_event_loop, EventHandler},
    net::check_io,
    registrar::{Direction, Ready, RegisterError, Registrar, Registration},
};

/// Token reserved for the listening socket.
pub const LISTENER_TOKEN: mio::Token = mio::Token(usize::MAX);

/// Token reserved for waking the event loop.
pub const WAKER_TOKEN: mio::Token = mio::Token(usize::MAX - 1);
