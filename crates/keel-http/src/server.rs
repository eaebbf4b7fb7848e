use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use anyhow::{Context, Error};
use keel::{DispatchQueue, WorkerPool};
use keel_mio::{run_event_loop, Direction, EventHandler, Ready, Registrar};
use mio::{
    net::{TcpListener, TcpStream},
    Poll, Token,
};
use tracing::{event, instrument, Level};

use crate::{Connection, DocumentRoot, HttpContext, ServerConfig};

/// Event handler routing readiness between connections and the worker pool.
///
/// Reads happen on the event loop thread, everything else is handed to a worker.
pub struct HttpServer {
    context: Arc<HttpContext>,
    queue: DispatchQueue<Connection>,
    max_connections: usize,
    connections: HashMap<Token, Arc<Connection>>,
}

impl HttpServer {
    pub fn new(
        context: Arc<HttpContext>,
        queue: DispatchQueue<Connection>,
        max_connections: usize,
    ) -> Self {
        Self {
            context,
            queue,
            max_connections,
            connections: HashMap::new(),
        }
    }

    /// Number of connections not yet retired.
    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    /// Tear down every remaining connection.
    pub fn close_all(&mut self) {
        for (_, connection) in self.connections.drain() {
            connection.teardown();
        }
    }

    fn on_readable(&self, connection: &Arc<Connection>) {
        if let Err(error) = connection.read() {
            event!(Level::DEBUG, ?error, "failed to read, closing connection");
            connection.teardown();
            return;
        }

        // A disarmed connection that's never processed would stall forever
        if let Err(error) = self.queue.submit(connection.clone()) {
            event!(Level::WARN, ?error, "failed to dispatch connection");
            connection.teardown();
        }
    }
}

impl EventHandler for HttpServer {
    fn accepted(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<(), Error> {
        let live = self.context.registrar().live_connections();
        if live >= self.max_connections {
            event!(Level::WARN, ?peer, live, "server busy, refusing connection");
            return Ok(());
        }

        match Connection::initialize(self.context.clone(), stream, peer) {
            Ok(connection) => {
                self.connections.insert(connection.token(), connection);
            }
            Err(error) => event!(Level::WARN, ?error, "failed to register connection"),
        }

        Ok(())
    }

    fn ready(&mut self, token: Token, ready: Ready) -> Result<(), Error> {
        let Some(connection) = self.connections.get(&token) else {
            event!(Level::TRACE, ?token, "readiness for unknown token");
            return Ok(());
        };

        let Some(direction) = connection.claim(&ready) else {
            return Ok(());
        };

        if ready.hangup {
            event!(Level::DEBUG, ?token, "peer hung up");
            connection.teardown();
            return Ok(());
        }

        match direction {
            Direction::Read => self.on_readable(connection),
            Direction::Write => {
                if let Err(error) = self.queue.submit(connection.clone()) {
                    event!(Level::WARN, ?error, "failed to dispatch connection");
                    connection.teardown();
                }
            }
        }

        Ok(())
    }

    fn retired(&mut self, token: Token) {
        self.connections.remove(&token);
    }
}

/// A bound static file server, ready to run.
pub struct Server {
    config: ServerConfig,
    poll: Poll,
    listener: TcpListener,
    context: Arc<HttpContext>,
}

impl Server {
    /// Bind the listening socket, and set up the shared server context.
    pub fn bind(config: ServerConfig) -> Result<Self, Error> {
        let poll = Poll::new().context("failed to create poll")?;
        let listener = TcpListener::bind(config.addr)
            .with_context(|| format!("failed to bind {}", config.addr))?;

        let registrar = Registrar::new(poll.registry())?;
        let root = DocumentRoot::new(config.root.clone());
        let context = Arc::new(HttpContext::new(registrar, root));

        event!(Level::INFO, addr = ?config.addr, root = ?config.root, "server bound");

        Ok(Self {
            config,
            poll,
            listener,
            context,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let addr = self
            .listener
            .local_addr()
            .context("failed to get listener address")?;
        Ok(addr)
    }

    /// Handle for controlling the server from another thread.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            context: self.context.clone(),
        }
    }

    /// Serve until stopped through a `ServerHandle`.
    #[instrument("Server::run", skip_all)]
    pub fn run(mut self) -> Result<(), Error> {
        let queue = DispatchQueue::new(self.config.max_requests);
        let pool = WorkerPool::start(self.config.workers, queue.clone())?;

        let mut server = HttpServer::new(self.context.clone(), queue, self.config.max_connections);
        let result = run_event_loop(
            &mut self.poll,
            &mut self.listener,
            self.context.registrar(),
            &mut server,
        );

        pool.shutdown();
        event!(
            Level::DEBUG,
            remaining = server.connections(),
            "closing remaining connections"
        );
        server.close_all();

        result
    }
}

/// Controls a running `Server`.
#[derive(Clone)]
pub struct ServerHandle {
    context: Arc<HttpContext>,
}

impl ServerHandle {
    /// Stop the event loop, which then stops the worker pool.
    pub fn stop(&self) -> Result<(), Error> {
        self.context.registrar().stop()?;
        Ok(())
    }

    /// Number of currently open connections.
    pub fn live_connections(&self) -> usize {
        self.context.registrar().live_connections()
    }

    /// Highest number of handlers seen running at once on any single connection.
    pub fn peak_handlers(&self) -> usize {
        self.context.peak_handlers()
    }
}
