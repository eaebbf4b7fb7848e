#![allow(dead_code)]

use std::{
    fs::{self, Permissions},
    io::{BufRead, BufReader, ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream},
    os::unix::fs::PermissionsExt,
    path::Path,
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{bail, Context, Error};
use keel_http::{Server, ServerConfig, ServerHandle};
use tempfile::TempDir;

pub const INDEX: &[u8] = b"<html><body><h1>keel</h1></body></html>\n";

pub const KEEP_ALIVE_REQUEST: &[u8] =
    b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n";

/// Temporary document root, holding the given files.
pub fn given_document_root(files: &[(&str, &[u8])]) -> Result<TempDir, Error> {
    let root = tempfile::tempdir()?;

    for (name, content) in files {
        let path = root.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
            fs::set_permissions(parent, Permissions::from_mode(0o755))?;
        }
        fs::write(&path, content)?;
        fs::set_permissions(&path, Permissions::from_mode(0o644))?;
    }

    Ok(root)
}

pub fn given_server(root: &Path) -> Result<TestServer, Error> {
    let config = ServerConfig {
        addr: "127.0.0.1:0".parse()?,
        root: root.to_path_buf(),
        workers: 4,
        ..ServerConfig::default()
    };
    given_server_with(config)
}

pub fn given_server_with(config: ServerConfig) -> Result<TestServer, Error> {
    let server = Server::bind(config)?;
    let addr = server.local_addr()?;
    let handle = server.handle();
    let thread = thread::spawn(move || server.run());

    Ok(TestServer {
        addr,
        handle,
        thread,
    })
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    thread: JoinHandle<Result<(), Error>>,
}

impl TestServer {
    pub fn connect(&self) -> Result<Client, Error> {
        let stream = TcpStream::connect(self.addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;

        Ok(Client {
            reader: BufReader::new(stream),
        })
    }

    pub fn stop(self) -> Result<(), Error> {
        self.handle.stop()?;
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => bail!("server thread panicked"),
        }
    }
}

pub struct Client {
    reader: BufReader<TcpStream>,
}

impl Client {
    pub fn when_sent(&mut self, data: &[u8]) -> Result<(), Error> {
        self.reader.get_mut().write_all(data)?;
        Ok(())
    }

    pub fn when_requested(&mut self, request: &[u8]) -> Result<Reply, Error> {
        self.when_sent(request)?;
        self.read_reply()
    }

    pub fn read_reply(&mut self) -> Result<Reply, Error> {
        let mut line = String::new();
        self.reader.read_line(&mut line)?;

        let status = line
            .split(' ')
            .nth(1)
            .context("missing status code")?
            .parse()?;

        let mut headers = Vec::new();
        loop {
            line.clear();
            self.reader.read_line(&mut line)?;

            let line = line.trim_end_matches("\r\n");
            if line.is_empty() {
                break;
            }

            let (name, value) = line.split_once(": ").context("malformed header")?;
            headers.push((name.to_string(), value.to_string()));
        }

        let mut reply = Reply {
            status,
            headers,
            body: Vec::new(),
        };

        let length = reply
            .header("Content-Length")
            .context("missing content length")?
            .parse()?;
        reply.body = vec![0; length];
        self.reader.read_exact(&mut reply.body)?;

        Ok(reply)
    }

    /// Returns true if the server closed the connection.
    pub fn is_closed(&mut self) -> bool {
        let mut buffer = [0; 1];
        match self.reader.read(&mut buffer) {
            Ok(count) => count == 0,
            Err(error) => !matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
        }
    }
}

#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}
