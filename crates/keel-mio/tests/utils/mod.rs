use std::{
    net::{TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Error};
use keel_mio::Registrar;
use mio::{Events, Poll, Token};

pub fn given_poll() -> Result<(Poll, Registrar), Error> {
    let poll = Poll::new()?;
    let registrar = Registrar::new(poll.registry())?;
    Ok((poll, registrar))
}

/// Connected loopback pair, the server side converted to a non-blocking mio stream.
pub fn given_stream_pair() -> Result<(TcpStream, mio::net::TcpStream), Error> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let client = TcpStream::connect(listener.local_addr()?)?;
    let (server, _) = listener.accept()?;

    server.set_nonblocking(true)?;
    let server = mio::net::TcpStream::from_std(server);

    Ok((client, server))
}

pub fn when_polled_for(poll: &mut Poll, token: Token) -> Result<keel_mio::Ready, Error> {
    let mut events = Events::with_capacity(16);

    for _ in 0..50 {
        poll.poll(&mut events, Some(Duration::from_millis(100)))?;

        let found = events.iter().find(|event| event.token() == token);
        if let Some(event) = found {
            return Ok(keel_mio::Ready::from(event));
        }
    }

    None.context("no event delivered for token")
}

#[allow(dead_code)]
pub fn then_eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);

    while !check() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}
