use std::{io::ErrorKind, net::SocketAddr};

use anyhow::{Context as _, Error};
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token,
};
use tracing::{event, instrument, Level};

use crate::{check_io, Ready, Registrar, LISTENER_TOKEN, WAKER_TOKEN};

/// Receiver of event loop notifications.
///
/// All methods are called on the event loop thread.
pub trait EventHandler {
    /// A new peer was accepted on the listener.
    fn accepted(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<(), Error>;

    /// A registered source reported readiness.
    fn ready(&mut self, token: Token, ready: Ready) -> Result<(), Error>;

    /// A source was unregistered, its token will not be delivered again.
    fn retired(&mut self, token: Token);
}

/// Run the readiness loop until the registrar is told to stop.
///
/// Accepts every pending peer on listener readiness, routes source readiness to the handler,
/// and hands retired tokens back to the handler after every poll.
#[instrument("keel-event-loop", skip_all)]
pub fn run_event_loop<H>(
    poll: &mut Poll,
    listener: &mut TcpListener,
    registrar: &Registrar,
    handler: &mut H,
) -> Result<(), Error>
where
    H: EventHandler,
{
    poll.registry()
        .register(listener, LISTENER_TOKEN, Interest::READABLE)
        .context("failed to register listener")?;

    let result = run_poll_loop(poll, listener, registrar, handler);
    if let Err(error) = &result {
        event!(Level::ERROR, "error in event loop: {:#}", error);
    }

    let _ = poll.registry().deregister(listener);

    result
}

fn run_poll_loop<H>(
    poll: &mut Poll,
    listener: &TcpListener,
    registrar: &Registrar,
    handler: &mut H,
) -> Result<(), Error>
where
    H: EventHandler,
{
    let mut events = Events::with_capacity(1024);

    loop {
        if let Err(error) = poll.poll(&mut events, None) {
            if error.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(error).context("failed to poll");
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => accept_pending(listener, handler)?,
                WAKER_TOKEN => event!(Level::TRACE, "woken"),
                token => handler.ready(token, Ready::from(event))?,
            }
        }

        for token in registrar.take_retired() {
            handler.retired(token);
        }

        if registrar.is_stopping() {
            event!(Level::DEBUG, "stopping");
            return Ok(());
        }
    }
}

fn accept_pending<H>(listener: &TcpListener, handler: &mut H) -> Result<(), Error>
where
    H: EventHandler,
{
    // Edge-triggered, so accept everything that's pending
    loop {
        let (stream, peer) = match check_io(listener.accept()) {
            Ok(Some(value)) => value,
            Ok(None) => break,
            Err(error) => {
                // Out of descriptors and similar, the peer stays in the backlog
                event!(Level::WARN, ?error, "failed to accept");
                break;
            }
        };

        event!(Level::DEBUG, ?peer, "accepted");
        handler.accepted(stream, peer)?;
    }

    Ok(())
}
