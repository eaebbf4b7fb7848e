use std::ops::Range;

use tracing::{event, Level};

/// Capacity of a connection's read buffer.
pub const READ_BUFFER_SIZE: usize = 2048;

/// Incremental HTTP/1.1 request parser over a fixed-capacity read buffer.
///
/// Bytes are received directly into `unfilled`, and committed with `advance`. `parse` can be
/// called after every receive; it resumes where the previous call stopped, so a request split
/// across any number of reads parses the same as one received at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpParser {
    buffer: Box<[u8]>,
    /// Bytes received so far.
    read_index: usize,
    /// Bytes already scanned by the line scanner.
    check_index: usize,
    /// Start of the line currently being scanned.
    line_start: usize,
    state: ParseState,
    request: Request,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self {
            buffer: vec![0; READ_BUFFER_SIZE].into_boxed_slice(),
            read_index: 0,
            check_index: 0,
            line_start: 0,
            state: ParseState::default(),
            request: Request::default(),
        }
    }
}

impl HttpParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// The part of the buffer not yet holding received bytes.
    pub fn unfilled(&mut self) -> &mut [u8] {
        &mut self.buffer[self.read_index..]
    }

    /// Commit `count` bytes received into `unfilled`.
    pub fn advance(&mut self, count: usize) {
        self.read_index = (self.read_index + count).min(self.buffer.len());
    }

    /// Copy bytes into the buffer, returning how many fit.
    pub fn receive(&mut self, data: &[u8]) -> usize {
        let unfilled = self.unfilled();
        let count = data.len().min(unfilled.len());
        unfilled[..count].copy_from_slice(&data[..count]);
        self.advance(count);

        count
    }

    pub fn is_full(&self) -> bool {
        self.read_index >= self.buffer.len()
    }

    pub fn read_index(&self) -> usize {
        self.read_index
    }

    pub fn check_index(&self) -> usize {
        self.check_index
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Fields parsed so far.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Body bytes of a complete request.
    pub fn body(&self) -> &[u8] {
        let end = (self.check_index + self.request.content_length).min(self.read_index);
        &self.buffer[self.check_index..end]
    }

    /// Rewind to the state of a freshly created parser, clearing the buffer.
    pub fn reset(&mut self) {
        self.buffer.fill(0);
        self.read_index = 0;
        self.check_index = 0;
        self.line_start = 0;
        self.state = ParseState::RequestLine;
        self.request = Request::default();
    }

    /// Run the parser over everything received so far.
    pub fn parse(&mut self) -> ParseOutcome {
        loop {
            // The body isn't line-oriented, it's complete once enough bytes arrived
            if self.state == ParseState::Body {
                let end = self.check_index + self.request.content_length;
                if self.read_index >= end {
                    return ParseOutcome::Complete;
                }
                return ParseOutcome::Incomplete;
            }

            let line = match self.scan_line() {
                LineStatus::Complete(line) => line,
                // A full buffer can't receive the rest of the line
                LineStatus::Open if self.is_full() => {
                    event!(Level::DEBUG, "line exceeds read buffer");
                    return ParseOutcome::BadRequest;
                }
                LineStatus::Open => return ParseOutcome::Incomplete,
                LineStatus::Bad => {
                    event!(Level::DEBUG, "malformed line terminator");
                    return ParseOutcome::BadRequest;
                }
            };
            self.line_start = self.check_index;

            let text = &self.buffer[line];
            match self.state {
                ParseState::RequestLine => {
                    if parse_request_line(text, &mut self.request).is_err() {
                        event!(Level::DEBUG, "malformed request line");
                        return ParseOutcome::BadRequest;
                    }
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    if !text.is_empty() {
                        if parse_header(text, &mut self.request).is_err() {
                            event!(Level::DEBUG, "malformed header");
                            return ParseOutcome::BadRequest;
                        }
                        continue;
                    }

                    // Blank line, end of headers
                    let length = self.request.content_length;
                    if length == 0 {
                        return ParseOutcome::Complete;
                    }

                    // A body that can never fit would never complete
                    match self.check_index.checked_add(length) {
                        Some(end) if end <= self.buffer.len() => {}
                        _ => {
                            event!(Level::DEBUG, length, "body exceeds read buffer");
                            return ParseOutcome::BadRequest;
                        }
                    }

                    self.state = ParseState::Body;
                }
                ParseState::Body => return ParseOutcome::InternalError,
            }
        }
    }

    /// Scan from `check_index` for the end of the current line.
    fn scan_line(&mut self) -> LineStatus {
        while self.check_index < self.read_index {
            let index = self.check_index;

            match self.buffer[index] {
                b'\r' => {
                    // The LF may still be on its way
                    if index + 1 == self.read_index {
                        return LineStatus::Open;
                    }

                    if self.buffer[index + 1] == b'\n' {
                        self.check_index = index + 2;
                        return LineStatus::Complete(self.line_start..index);
                    }

                    return LineStatus::Bad;
                }
                b'\n' => {
                    if index > self.line_start && self.buffer[index - 1] == b'\r' {
                        self.check_index = index + 1;
                        return LineStatus::Complete(self.line_start..index - 1);
                    }

                    return LineStatus::Bad;
                }
                _ => self.check_index += 1,
            }
        }

        LineStatus::Open
    }
}

/// Position of the parser in a request.
///
/// Only moves forward, until the parser is reset for the next request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    #[default]
    RequestLine,
    Headers,
    Body,
}

/// Result of running the parser over the received bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// More bytes are needed.
    Incomplete,
    /// A full request has been parsed.
    Complete,
    /// The request is malformed or unsupported.
    BadRequest,
    /// The parser reached a state it can't continue from.
    InternalError,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    #[default]
    Get,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    #[default]
    Http11,
}

/// Fields of a parsed request.
///
/// Everything is owned, nothing refers back into the read buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Target path, starting with `/`, with any absolute-form authority removed.
    pub url: String,
    pub version: Version,
    pub host: Option<String>,
    pub content_length: usize,
    pub keep_alive: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum LineStatus {
    Complete(Range<usize>),
    Open,
    Bad,
}

struct Malformed;

fn parse_request_line(text: &[u8], request: &mut Request) -> Result<(), Malformed> {
    let (method, rest) = split_whitespace(text).ok_or(Malformed)?;
    if !method.eq_ignore_ascii_case(b"GET") {
        return Err(Malformed);
    }

    let (url, version) = split_whitespace(rest).ok_or(Malformed)?;
    if !version.eq_ignore_ascii_case(b"HTTP/1.1") {
        return Err(Malformed);
    }

    let url = strip_authority(url).ok_or(Malformed)?;
    if url.first() != Some(&b'/') {
        return Err(Malformed);
    }

    request.method = Method::Get;
    request.version = Version::Http11;
    request.url = std::str::from_utf8(url).map_err(|_| Malformed)?.to_owned();

    Ok(())
}

fn parse_header(text: &[u8], request: &mut Request) -> Result<(), Malformed> {
    if let Some(value) = header_value(text, b"Connection:") {
        if value.eq_ignore_ascii_case(b"keep-alive") {
            request.keep_alive = true;
        }
    } else if let Some(value) = header_value(text, b"Content-Length:") {
        let value = std::str::from_utf8(value).map_err(|_| Malformed)?;
        request.content_length = value.parse().map_err(|_| Malformed)?;
    } else if let Some(value) = header_value(text, b"Host:") {
        request.host = Some(String::from_utf8_lossy(value).into_owned());
    } else {
        event!(Level::TRACE, header = %String::from_utf8_lossy(text), "ignoring header");
    }

    Ok(())
}

/// Split on the first space or tab.
fn split_whitespace(text: &[u8]) -> Option<(&[u8], &[u8])> {
    let index = text.iter().position(|b| *b == b' ' || *b == b'\t')?;
    Some((&text[..index], &text[index + 1..]))
}

/// Remove a leading `http://host[:port]`, if present.
fn strip_authority(url: &[u8]) -> Option<&[u8]> {
    const SCHEME: &[u8] = b"http://";

    if url.len() < SCHEME.len() || !url[..SCHEME.len()].eq_ignore_ascii_case(SCHEME) {
        return Some(url);
    }

    let rest = &url[SCHEME.len()..];
    let index = rest.iter().position(|b| *b == b'/')?;
    Some(&rest[index..])
}

fn header_value<'a>(text: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if text.len() < name.len() || !text[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }

    Some(trim(&text[name.len()..]))
}

fn trim(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}
