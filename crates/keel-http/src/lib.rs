//! Static file HTTP/1.1 server on keel.
//!
//! Connections are parsed incrementally as bytes arrive, and files are sent straight from a
//! read-only memory mapping with vectored writes. Each connection is handled by at most one
//! thread at a time, handed from the event loop to the worker pool through one-shot
//! registrations.

mod config;
mod connection;
mod parser;
mod resource;
mod response;
mod server;

pub use self::{
    config::ServerConfig,
    connection::{Connection, Flow, HttpContext, ReadError, WriteError},
    parser::{
        HttpParser, Method, ParseOutcome, ParseState, Request, Version, READ_BUFFER_SIZE,
    },
    resource::{DocumentRoot, MappedFile, ResolveError, MAX_PATH_LEN},
    response::{Progress, Response, ResponseError, Status, WRITE_BUFFER_SIZE},
    server::{HttpServer, Server, ServerHandle},
};
