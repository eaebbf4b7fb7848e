use anyhow::Error;
use keel_http::{HttpParser, ParseOutcome, ParseState, Request, READ_BUFFER_SIZE};
use tracing_test::traced_test;

const REQUEST: &[u8] =
    b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n";

#[test]
#[traced_test]
fn complete_request_parses() -> Result<(), Error> {
    let request = when_parsed_whole(REQUEST)?;

    assert_eq!(request.url, "/index.html");
    assert_eq!(request.host.as_deref(), Some("example.com"));
    assert!(request.keep_alive);
    assert_eq!(request.content_length, 0);

    Ok(())
}

#[test]
#[traced_test]
fn fragmented_request_parses_the_same() -> Result<(), Error> {
    let expected = when_parsed_whole(REQUEST)?;

    for split in 1..REQUEST.len() {
        let mut parser = HttpParser::new();

        parser.receive(&REQUEST[..split]);
        assert_eq!(parser.parse(), ParseOutcome::Incomplete, "split at {}", split);

        parser.receive(&REQUEST[split..]);
        assert_eq!(parser.parse(), ParseOutcome::Complete, "split at {}", split);
        assert_eq!(parser.request(), &expected);
    }

    Ok(())
}

#[test]
#[traced_test]
fn byte_by_byte_request_parses_the_same() -> Result<(), Error> {
    let expected = when_parsed_whole(REQUEST)?;
    let mut parser = HttpParser::new();

    let (last, rest) = REQUEST.split_last().unwrap();
    for byte in rest {
        parser.receive(&[*byte]);
        assert_eq!(parser.parse(), ParseOutcome::Incomplete);
    }

    parser.receive(&[*last]);
    assert_eq!(parser.parse(), ParseOutcome::Complete);
    assert_eq!(parser.request(), &expected);

    Ok(())
}

#[test]
#[traced_test]
fn lone_carriage_return_needs_more_data() {
    let mut parser = HttpParser::new();

    parser.receive(b"GET / HTTP/1.1\r");
    assert_eq!(parser.parse(), ParseOutcome::Incomplete);
    assert_eq!(parser.state(), ParseState::RequestLine);

    parser.receive(b"\n\r");
    assert_eq!(parser.parse(), ParseOutcome::Incomplete);
    assert_eq!(parser.state(), ParseState::Headers);

    parser.receive(b"\n");
    assert_eq!(parser.parse(), ParseOutcome::Complete);
}

#[test]
#[traced_test]
fn malformed_terminators_are_rejected() {
    let cases: &[&[u8]] = &[
        b"GET / HTTP/1.1\n\r\n",
        b"GET / HTTP/1.1\rX\r\n\r\n",
        b"GET / HTTP/1.1\r\nHost: x\n\r\n",
    ];

    for case in cases {
        when_parsed_then(case, ParseOutcome::BadRequest);
    }
}

#[test]
#[traced_test]
fn unsupported_request_lines_are_rejected() {
    let cases: &[&[u8]] = &[
        b"POST /a HTTP/1.1\r\n\r\n",
        b"GET /a HTTP/1.0\r\n\r\n",
        b"GET a HTTP/1.1\r\n\r\n",
        b"GET http://example.com HTTP/1.1\r\n\r\n",
        b"GET\r\n\r\n",
    ];

    for case in cases {
        when_parsed_then(case, ParseOutcome::BadRequest);
    }
}

#[test]
#[traced_test]
fn method_and_version_are_case_insensitive() -> Result<(), Error> {
    let request = when_parsed_whole(b"get /a.html http/1.1\r\n\r\n")?;

    assert_eq!(request.url, "/a.html");
    assert!(!request.keep_alive);

    Ok(())
}

#[test]
#[traced_test]
fn absolute_url_authority_is_stripped() -> Result<(), Error> {
    let request = when_parsed_whole(b"GET http://example.com:8080/docs/a.html HTTP/1.1\r\n\r\n")?;

    assert_eq!(request.url, "/docs/a.html");

    Ok(())
}

#[test]
#[traced_test]
fn unknown_headers_are_ignored() -> Result<(), Error> {
    let request = when_parsed_whole(
        b"GET / HTTP/1.1\r\nUser-Agent: test\r\nAccept: */*\r\nconnection: Keep-Alive\r\n\r\n",
    )?;

    assert!(request.keep_alive);
    assert_eq!(request.host, None);

    Ok(())
}

#[test]
#[traced_test]
fn body_completes_once_received() {
    let mut parser = HttpParser::new();

    parser.receive(b"GET / HTTP/1.1\r\nContent-Length: 4\r\n\r\nab");
    assert_eq!(parser.parse(), ParseOutcome::Incomplete);
    assert_eq!(parser.state(), ParseState::Body);

    parser.receive(b"cd");
    assert_eq!(parser.parse(), ParseOutcome::Complete);
    assert_eq!(parser.body(), b"abcd");
}

#[test]
#[traced_test]
fn invalid_content_length_is_rejected() {
    when_parsed_then(
        b"GET / HTTP/1.1\r\nContent-Length: many\r\n\r\n",
        ParseOutcome::BadRequest,
    );
    when_parsed_then(
        b"GET / HTTP/1.1\r\nContent-Length: -1\r\n\r\n",
        ParseOutcome::BadRequest,
    );
}

#[test]
#[traced_test]
fn body_larger_than_buffer_is_rejected() {
    let request = format!(
        "GET / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
        READ_BUFFER_SIZE
    );

    when_parsed_then(request.as_bytes(), ParseOutcome::BadRequest);
}

#[test]
#[traced_test]
fn receive_stops_at_capacity() {
    let mut parser = HttpParser::new();

    let accepted = parser.receive(&vec![b'a'; READ_BUFFER_SIZE + 100]);

    assert_eq!(accepted, READ_BUFFER_SIZE);
    assert!(parser.is_full());
    assert_eq!(parser.receive(b"more"), 0);
}

#[test]
#[traced_test]
fn indices_stay_ordered() {
    let mut parser = HttpParser::new();

    for chunk in REQUEST.chunks(7) {
        parser.receive(chunk);
        parser.parse();

        assert!(parser.check_index() <= parser.read_index());
        assert!(parser.read_index() <= READ_BUFFER_SIZE);
    }
}

#[test]
#[traced_test]
fn unterminated_line_filling_buffer_is_rejected() {
    let mut parser = HttpParser::new();
    let mut request = b"GET /index.html HTTP/1.1\r\nX-Padding: ".to_vec();

    parser.receive(&request);
    assert_eq!(parser.parse(), ParseOutcome::Incomplete);

    request.resize(READ_BUFFER_SIZE, b'a');
    let mut parser = HttpParser::new();
    parser.receive(&request);
    assert!(parser.is_full());

    assert_eq!(parser.parse(), ParseOutcome::BadRequest);
}

#[test]
#[traced_test]
fn reset_matches_new_parser() -> Result<(), Error> {
    let mut parser = HttpParser::new();
    parser.receive(REQUEST);
    assert_eq!(parser.parse(), ParseOutcome::Complete);

    parser.reset();

    assert_eq!(parser, HttpParser::new());

    Ok(())
}

fn when_parsed_whole(data: &[u8]) -> Result<Request, Error> {
    let mut parser = HttpParser::new();
    parser.receive(data);

    let outcome = parser.parse();
    if outcome != ParseOutcome::Complete {
        anyhow::bail!("unexpected outcome {:?}", outcome);
    }

    Ok(parser.request().clone())
}

fn when_parsed_then(data: &[u8], expected: ParseOutcome) {
    let mut parser = HttpParser::new();
    parser.receive(data);

    assert_eq!(
        parser.parse(),
        expected,
        "{}",
        String::from_utf8_lossy(data)
    );
}
