use std::{
    io::{self, ErrorKind, Read},
    net::SocketAddr,
    os::fd::AsRawFd,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use keel::Task;
use keel_mio::{Direction, Ready, RegisterError, Registrar, Registration};
use mio::{net::TcpStream, Token};
use thiserror::Error;
use tracing::{event, instrument, Level};

use crate::{
    parser::{HttpParser, ParseOutcome, Request},
    resource::{DocumentRoot, ResolveError},
    response::{Progress, Response, ResponseError, Status},
};

/// Server-wide state shared by every connection.
pub struct HttpContext {
    registrar: Registrar,
    root: DocumentRoot,
    peak_handlers: AtomicUsize,
}

impl HttpContext {
    pub fn new(registrar: Registrar, root: DocumentRoot) -> Self {
        Self {
            registrar,
            root,
            peak_handlers: AtomicUsize::new(0),
        }
    }

    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    pub fn root(&self) -> &DocumentRoot {
        &self.root
    }

    /// Highest number of handlers seen running at once on any single connection.
    pub fn peak_handlers(&self) -> usize {
        self.peak_handlers.load(Ordering::Acquire)
    }
}

/// One accepted peer, and the state of the request it's currently making.
///
/// A connection's registration is one-shot. Between an event being claimed and the owner
/// re-arming, no other thread is handed this connection, so `read`, `process` and `write`
/// never run concurrently for it. The inner lock is never contended while that holds, and is
/// always released before re-arming.
// TODO: Sweep connections that stay idle past a timeout, a stalled peer currently holds its
// connection and buffers until it disconnects.
pub struct Connection {
    context: Arc<HttpContext>,
    registration: Registration,
    peer_addr: SocketAddr,
    handlers: AtomicUsize,
    peak_handlers: AtomicUsize,
    inner: Mutex<Inner>,
}

struct Inner {
    stream: Option<TcpStream>,
    parser: HttpParser,
    response: Response,
}

impl Connection {
    /// Register an accepted stream for read-readiness, and wrap it in a fresh connection.
    #[instrument("Connection::initialize", level = "debug", skip(context, stream))]
    pub fn initialize(
        context: Arc<HttpContext>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<Arc<Self>, RegisterError> {
        let registration = context.registrar.register(stream.as_raw_fd(), true)?;

        event!(Level::DEBUG, token = ?registration.token(), "connection opened");

        let inner = Inner {
            stream: Some(stream),
            parser: HttpParser::new(),
            response: Response::new(),
        };
        let connection = Self {
            context,
            registration,
            peer_addr,
            handlers: AtomicUsize::new(0),
            peak_handlers: AtomicUsize::new(0),
            inner: Mutex::new(inner),
        };

        Ok(Arc::new(connection))
    }

    pub fn token(&self) -> Token {
        self.registration.token()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Claim a readiness event delivered for this connection.
    pub fn claim(&self, ready: &Ready) -> Option<Direction> {
        self.registration.claim(ready)
    }

    /// Highest number of handlers seen running at once on this connection.
    pub fn peak_handlers(&self) -> usize {
        self.peak_handlers.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().stream.is_none()
    }

    /// Returns true while a response is waiting to be sent.
    pub fn is_sending(&self) -> bool {
        self.lock().response.bytes_to_send() > 0
    }

    /// Drain everything the socket has available into the read buffer.
    ///
    /// Readiness is edge-triggered, so stopping before the socket would block could miss the
    /// only notification for the remaining bytes.
    pub fn read(&self) -> Result<usize, ReadError> {
        let _handler = self.enter();
        let mut inner = self.lock();
        let Inner { stream, parser, .. } = &mut *inner;

        let stream = stream.as_mut().ok_or(ReadError::Closed)?;
        if parser.is_full() {
            return Err(ReadError::BufferFull);
        }

        let mut bytes_read = 0;
        while !parser.is_full() {
            match stream.read(parser.unfilled()) {
                Ok(0) => return Err(ReadError::Closed),
                Ok(count) => {
                    parser.advance(count);
                    bytes_read += count;
                }
                Err(error) => match error.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    _ => return Err(ReadError::Io(error)),
                },
            }
        }

        event!(Level::TRACE, bytes_read, "received data");

        Ok(bytes_read)
    }

    /// Run the parser, and build a response once the request is complete.
    ///
    /// Re-arms for read-interest if more data is needed, or write-interest once a response is
    /// ready. Tears the connection down if neither is possible.
    #[instrument("Connection::process", level = "trace", skip_all)]
    pub fn process(&self) {
        let next = {
            let _handler = self.enter();
            self.process_request()
        };

        let Some(direction) = next else {
            self.teardown();
            return;
        };

        if let Err(error) = self.context.registrar.rearm(&self.registration, direction) {
            event!(Level::WARN, ?error, "failed to re-arm connection");
            self.teardown();
        }
    }

    fn process_request(&self) -> Option<Direction> {
        let mut inner = self.lock();
        let Inner {
            parser, response, ..
        } = &mut *inner;

        let status = match parser.parse() {
            ParseOutcome::Incomplete => return Some(Direction::Read),
            ParseOutcome::Complete => None,
            ParseOutcome::BadRequest => Some(Status::BadRequest),
            ParseOutcome::InternalError => Some(Status::InternalError),
        };

        // Protocol and internal errors always close
        let result = match status {
            Some(status) => response.build_status(status, false),
            None => serve(&self.context.root, parser.request(), response),
        };

        match result {
            Ok(()) => Some(Direction::Write),
            Err(error) => {
                event!(Level::WARN, ?error, "failed to build response");
                None
            }
        }
    }

    /// Send as much of the pending response as the socket accepts.
    ///
    /// Re-arms for write-interest if the socket would block. Once everything is sent, a
    /// keep-alive connection is reset and re-armed for the next request, any other connection
    /// reports `Flow::Close`.
    pub fn write(&self) -> Result<Flow, WriteError> {
        let next = {
            let _handler = self.enter();
            self.send_response()?
        };

        match next {
            Some(direction) => {
                self.context.registrar.rearm(&self.registration, direction)?;
                Ok(Flow::Open)
            }
            None => Ok(Flow::Close),
        }
    }

    fn send_response(&self) -> Result<Option<Direction>, WriteError> {
        let mut inner = self.lock();
        let Inner {
            stream,
            parser,
            response,
        } = &mut *inner;

        let stream = stream.as_mut().ok_or(WriteError::Closed)?;

        let progress = match response.send(stream) {
            Ok(progress) => progress,
            Err(error) => {
                response.release_body();
                return Err(WriteError::Io(error));
            }
        };

        if progress == Progress::Blocked {
            event!(Level::TRACE, remaining = response.bytes_to_send(), "send blocked");
            return Ok(Some(Direction::Write));
        }

        response.release_body();
        if !response.keep_alive() {
            return Ok(None);
        }

        event!(Level::DEBUG, "response sent, awaiting next request");
        parser.reset();
        response.reset();

        Ok(Some(Direction::Read))
    }

    /// Unregister and close the socket, releasing any file mapping.
    ///
    /// Safe to call more than once, only the first call has any effect.
    pub fn teardown(&self) {
        let stream = {
            let mut inner = self.lock();
            inner.response.release_body();
            inner.stream.take()
        };
        let Some(stream) = stream else { return };

        event!(Level::DEBUG, peer = ?self.peer_addr, "closing connection");

        if let Err(error) = self.context.registrar.unregister(stream, &self.registration) {
            event!(Level::WARN, ?error, "failed to unregister connection");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self) -> HandlerGuard<'_> {
        let active = self.handlers.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_handlers.fetch_max(active, Ordering::AcqRel);
        self.context.peak_handlers.fetch_max(active, Ordering::AcqRel);

        if active > 1 {
            event!(Level::ERROR, active, "concurrent handlers on one connection");
        }

        HandlerGuard {
            handlers: &self.handlers,
        }
    }
}

impl Task for Connection {
    fn process(&self) {
        // A connection is submitted once per claimed event, the pending response tells which
        if !self.is_sending() {
            Connection::process(self);
            return;
        }

        match self.write() {
            Ok(Flow::Open) => {}
            Ok(Flow::Close) => self.teardown(),
            Err(error) => {
                event!(Level::DEBUG, ?error, "failed to write response");
                self.teardown();
            }
        }
    }
}

struct HandlerGuard<'a> {
    handlers: &'a AtomicUsize,
}

impl Drop for HandlerGuard<'_> {
    fn drop(&mut self) {
        self.handlers.fetch_sub(1, Ordering::AcqRel);
    }
}

fn serve(
    root: &DocumentRoot,
    request: &Request,
    response: &mut Response,
) -> Result<(), ResponseError> {
    let keep_alive = request.keep_alive;

    let status = match root.resolve(&request.url) {
        Ok(file) => return response.build_file(file, keep_alive),
        Err(ResolveError::NotFound) => Status::NotFound,
        Err(ResolveError::Forbidden) => Status::Forbidden,
        Err(ResolveError::Directory) => Status::BadRequest,
        Err(ResolveError::Io(error)) => {
            event!(Level::WARN, ?error, url = %request.url, "failed to map file");
            return response.build_status(Status::InternalError, false);
        }
    };

    response.build_status(status, keep_alive)
}

/// Connection state after a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The connection is re-armed and stays open.
    Open,
    /// The response is sent and the connection should be torn down.
    Close,
}

/// Failed to read from a connection.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("read buffer is full")]
    BufferFull,
    #[error("connection closed by peer")]
    Closed,
    #[error("failed to receive data")]
    Io(#[source] io::Error),
}

/// Failed to write to a connection.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("connection closed")]
    Closed,
    #[error("failed to send response")]
    Io(#[source] io::Error),
    #[error("failed to re-arm connection")]
    Rearm(#[from] RegisterError),
}
