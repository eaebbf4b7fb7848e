use std::io::{self, ErrorKind, IoSlice, Write};

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tracing::{event, Level};

use crate::MappedFile;

/// Capacity of a connection's write buffer, holding the status line and headers.
pub const WRITE_BUFFER_SIZE: usize = 1024;

/// Response status produced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Error",
        }
    }

    /// Fixed body sent with an error status.
    pub fn body(self) -> &'static str {
        match self {
            Status::Ok => "",
            Status::BadRequest => {
                "Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            Status::Forbidden => "You do not have permission to get file from this server.\n",
            Status::NotFound => "The requested file was not found on this server.\n",
            Status::InternalError => "There was an unusual problem serving the requested file.\n",
        }
    }
}

/// An outgoing response, sent as two segments: the write buffer, then the mapped file.
///
/// File content is never copied into the write buffer. Sending consumes bytes from the front
/// of the head segment first, then the file segment.
pub struct Response {
    head: BytesMut,
    body: Option<MappedFile>,
    bytes_sent: usize,
    bytes_to_send: usize,
    keep_alive: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            head: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
            body: None,
            bytes_sent: 0,
            bytes_to_send: 0,
            keep_alive: false,
        }
    }
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an error response, with the status' fixed body in the write buffer.
    pub fn build_status(&mut self, status: Status, keep_alive: bool) -> Result<(), ResponseError> {
        let body = status.body();

        self.keep_alive = keep_alive;
        self.put_head(status, body.len())?;
        self.put(body.as_bytes())?;

        self.bytes_to_send = self.head.len();

        Ok(())
    }

    /// Build a 200 response serving a mapped file.
    pub fn build_file(&mut self, file: MappedFile, keep_alive: bool) -> Result<(), ResponseError> {
        self.keep_alive = keep_alive;
        self.put_head(Status::Ok, file.len())?;

        self.bytes_to_send = self.head.len() + file.len();
        self.body = Some(file);

        Ok(())
    }

    fn put_head(&mut self, status: Status, content_length: usize) -> Result<(), ResponseError> {
        let connection = if self.keep_alive { "keep-alive" } else { "close" };

        self.put(format!("HTTP/1.1 {} {}\r\n", status.code(), status.reason()).as_bytes())?;
        self.put(format!("Content-Length: {}\r\n", content_length).as_bytes())?;
        self.put(b"Content-Type: text/html\r\n")?;
        self.put(format!("Connection: {}\r\n", connection).as_bytes())?;
        self.put(b"\r\n")?;

        Ok(())
    }

    fn put(&mut self, data: &[u8]) -> Result<(), ResponseError> {
        if self.head.len() + data.len() > WRITE_BUFFER_SIZE {
            return Err(ResponseError::Overflow);
        }

        self.head.put_slice(data);
        Ok(())
    }

    /// Status line and headers, plus the body for error responses.
    pub fn head(&self) -> &[u8] {
        &self.head
    }

    pub fn body(&self) -> &[u8] {
        self.body.as_ref().map(MappedFile::as_bytes).unwrap_or_default()
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn bytes_to_send(&self) -> usize {
        self.bytes_to_send
    }

    /// Segments still to be sent, head first.
    pub fn remaining(&self) -> (&[u8], &[u8]) {
        let head = self.head();
        let body = self.body();

        if self.bytes_sent < head.len() {
            (&head[self.bytes_sent..], body)
        } else {
            let offset = (self.bytes_sent - head.len()).min(body.len());
            (&[], &body[offset..])
        }
    }

    /// Mark `count` bytes as sent.
    pub fn advance(&mut self, count: usize) {
        let count = count.min(self.bytes_to_send);
        self.bytes_sent += count;
        self.bytes_to_send -= count;
    }

    /// Send remaining segments with vectored writes, until done or the writer would block.
    pub fn send<W>(&mut self, writer: &mut W) -> Result<Progress, io::Error>
    where
        W: Write,
    {
        while self.bytes_to_send > 0 {
            let (head, body) = self.remaining();
            let slices = [IoSlice::new(head), IoSlice::new(body)];

            match writer.write_vectored(&slices) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(count) => {
                    event!(Level::TRACE, count, "sent data");
                    self.advance(count);
                }
                Err(error) => match error.kind() {
                    ErrorKind::WouldBlock => return Ok(Progress::Blocked),
                    ErrorKind::Interrupted => continue,
                    _ => return Err(error),
                },
            }
        }

        Ok(Progress::Done)
    }

    /// Drop the file mapping, if any.
    pub fn release_body(&mut self) {
        self.body = None;
    }

    /// Clear the response for the next request, keeping the buffer's allocation.
    pub fn reset(&mut self) {
        self.head.clear();
        self.body = None;
        self.bytes_sent = 0;
        self.bytes_to_send = 0;
        self.keep_alive = false;
    }
}

/// Result of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Everything has been sent.
    Done,
    /// The writer would block, send again on the next write-readiness.
    Blocked,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResponseError {
    #[error("response head exceeds write buffer")]
    Overflow,
}
