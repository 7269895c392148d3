use super::*;

fn limits() -> ParserLimits {
	ParserLimits {
		max_request_line: 1024,
		max_header_size: 2048,
		max_body_size: 64,
	}
}

/// Drives the parser over `input`, collecting (head, body, completed).
fn drive(input: &[u8], chunk_size: usize) -> Result<(RequestHead, Vec<u8>, bool), ParseError> {
	let mut p = RequestParser::new(limits());
	let mut head = None;
	let mut body = Vec::new();
	let mut complete = false;
	for chunk in input.chunks(chunk_size.max(1)) {
		p.push(chunk);
		while let Some(ev) = p.next_event()? {
			match ev {
				RequestEvent::HeadersComplete(h) => head = Some(h),
				RequestEvent::BodyChunk(b) => body.extend_from_slice(&b),
				RequestEvent::Complete => complete = true,
			}
		}
	}
	Ok((head.expect("headers"), body, complete))
}

#[test]
fn simple_get() {
	let (head, body, complete) =
		drive(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n", 1024).unwrap();
	assert_eq!(head.method, Method::GET);
	assert_eq!(head.target, "/index.html");
	assert_eq!(head.version, Version::HTTP_11);
	assert_eq!(head.headers.get("host").unwrap(), "example.com");
	assert!(body.is_empty());
	assert!(complete);
}

#[test]
fn byte_by_byte_arrival() {
	let input = b"POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello";
	let (head, body, complete) = drive(input, 1).unwrap();
	assert_eq!(head.method, Method::POST);
	assert_eq!(body, b"hello");
	assert!(complete);
}

#[test]
fn connect_completes_after_headers() {
	let (head, body, complete) =
		drive(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n", 16).unwrap();
	assert_eq!(head.method, Method::CONNECT);
	assert_eq!(head.target, "example.com:443");
	assert!(body.is_empty());
	assert!(complete);
}

#[test]
fn bodyless_method_with_content_length() {
	// A declared body on a normally-bodyless method is consumed rather than
	// left in the buffer, where it would be misread as a pipelined request.
	let input = b"GET /search HTTP/1.1\r\nHost: a\r\nContent-Length: 9\r\n\r\n{\"q\":\"x\"}";
	let (head, body, complete) = drive(input, 8).unwrap();
	assert_eq!(head.method, Method::GET);
	assert_eq!(body, b"{\"q\":\"x\"}");
	assert!(complete);

	// Without framing headers the method completes right after its headers.
	let mut p = RequestParser::new(limits());
	p.push(b"DELETE /item HTTP/1.1\r\nHost: a\r\n\r\n");
	assert!(matches!(
		p.next_event().unwrap(),
		Some(RequestEvent::HeadersComplete(_))
	));
	assert!(matches!(p.next_event().unwrap(), Some(RequestEvent::Complete)));
	// Nothing was left behind for the next request on this connection.
	p.reset();
	assert!(p.is_idle());
}

#[test]
fn header_names_lowercased_and_duplicates_joined() {
	let input = b"GET / HTTP/1.1\r\nHost: a\r\nX-Tag: one\r\nx-TAG: two\r\n\r\n";
	let (head, _, _) = drive(input, 7).unwrap();
	assert_eq!(head.headers.get("x-tag").unwrap(), "one, two");
}

#[test]
fn chunked_body_reassembled() {
	let input = b"POST /c HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
	              4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
	let (_, body, complete) = drive(input, 3).unwrap();
	assert_eq!(body, b"Wikipedia");
	assert!(complete);
}

#[test]
fn chunk_extensions_tolerated() {
	let input = b"POST /c HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
	              4;ext=1\r\nWiki\r\n0\r\n\r\n";
	let (_, body, complete) = drive(input, 1024).unwrap();
	assert_eq!(body, b"Wiki");
	assert!(complete);
}

#[test]
fn request_line_too_long() {
	let mut input = b"GET /".to_vec();
	input.extend(std::iter::repeat_n(b'a', 2000));
	let err = drive(&input, 1024).unwrap_err();
	assert_eq!(err, ParseError::RequestLineTooLong);
}

#[test]
fn headers_too_large() {
	let mut input = b"GET / HTTP/1.1\r\n".to_vec();
	for i in 0..200 {
		input.extend_from_slice(format!("X-Header-{i}: {}\r\n", "v".repeat(64)).as_bytes());
	}
	input.extend_from_slice(b"\r\n");
	let err = drive(&input, 256).unwrap_err();
	assert_eq!(err, ParseError::HeadersTooLarge);
}

#[test]
fn content_length_over_limit_rejected_before_body() {
	let input = b"POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 100000\r\n\r\n";
	let err = drive(input, 1024).unwrap_err();
	assert_eq!(err, ParseError::BodyTooLarge);
}

#[test]
fn chunked_body_over_limit_rejected() {
	// Limit is 64 bytes; two 40-byte chunks exceed it at the second size line.
	let mut input = b"POST /c HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
	input.extend_from_slice(b"28\r\n");
	input.extend(std::iter::repeat_n(b'x', 0x28));
	input.extend_from_slice(b"\r\n28\r\n");
	input.extend(std::iter::repeat_n(b'x', 0x28));
	input.extend_from_slice(b"\r\n0\r\n\r\n");
	let err = drive(&input, 1024).unwrap_err();
	assert_eq!(err, ParseError::BodyTooLarge);
}

#[test]
fn never_completes_over_limit() {
	// The parser must never report complete for an over-limit request.
	let mut input = b"POST /c HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
	input.extend_from_slice(b"ff\r\n");
	input.extend(std::iter::repeat_n(b'x', 0xff));
	input.extend_from_slice(b"\r\n0\r\n\r\n");
	let mut p = RequestParser::new(limits());
	p.push(&input);
	let mut saw_complete = false;
	let result = loop {
		match p.next_event() {
			Ok(Some(RequestEvent::Complete)) => saw_complete = true,
			Ok(Some(_)) => {},
			Ok(None) => break Ok(()),
			Err(e) => break Err(e),
		}
	};
	assert!(result.is_err());
	assert!(!saw_complete);
}

#[test]
fn invalid_method() {
	assert_eq!(
		drive(b"G3T / HTTP/1.1\r\n\r\n", 1024).unwrap_err(),
		ParseError::InvalidMethod
	);
}

#[test]
fn invalid_version() {
	assert_eq!(
		drive(b"GET / HTTP/2.5\r\n\r\n", 1024).unwrap_err(),
		ParseError::InvalidVersion
	);
}

#[test]
fn invalid_header_rejected() {
	assert_eq!(
		drive(b"GET / HTTP/1.1\r\nBad Header Name: x\r\n\r\n", 1024).unwrap_err(),
		ParseError::InvalidHeader
	);
}

#[test]
fn invalid_content_length() {
	assert_eq!(
		drive(b"POST / HTTP/1.1\r\nContent-Length: banana\r\n\r\n", 1024).unwrap_err(),
		ParseError::InvalidContentLength
	);
}

#[test]
fn invalid_chunk_size() {
	let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
	assert_eq!(drive(input, 1024).unwrap_err(), ParseError::InvalidChunkSize);
}

#[test]
fn invalid_chunk_format() {
	let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabcXX";
	assert_eq!(drive(input, 1024).unwrap_err(), ParseError::InvalidChunkFormat);
}

#[test]
fn reset_supports_keepalive_pipeline() {
	let mut p = RequestParser::new(limits());
	p.push(b"GET /one HTTP/1.1\r\nHost: a\r\n\r\nGET /two HTTP/1.1\r\nHost: a\r\n\r\n");
	let mut targets = Vec::new();
	for _ in 0..2 {
		loop {
			match p.next_event().unwrap() {
				Some(RequestEvent::HeadersComplete(h)) => targets.push(h.target),
				Some(RequestEvent::Complete) => break,
				Some(_) => {},
				None => panic!("expected buffered event"),
			}
		}
		p.reset();
	}
	assert_eq!(targets, vec!["/one".to_string(), "/two".to_string()]);
	assert!(p.is_idle());
}

#[test]
fn take_remaining_returns_tunnel_preface() {
	let mut p = RequestParser::new(limits());
	p.push(b"CONNECT h:443 HTTP/1.1\r\n\r\n\x16\x03\x01\x00");
	loop {
		match p.next_event().unwrap() {
			Some(RequestEvent::Complete) => break,
			Some(_) => {},
			None => panic!("expected event"),
		}
	}
	assert_eq!(p.take_remaining().as_ref(), b"\x16\x03\x01\x00");
}

fn drive_response(
	input: &[u8],
	head_request: bool,
	eof_at_end: bool,
	chunk_size: usize,
) -> Result<(ResponseHead, Vec<u8>, bool), ParseError> {
	let mut p = ResponseParser::new(limits(), head_request);
	let mut head = None;
	let mut body = Vec::new();
	let mut complete = false;
	let mut feed = |p: &mut ResponseParser| -> Result<(), ParseError> {
		while let Some(ev) = p.next_event()? {
			match ev {
				ResponseEvent::HeadersComplete(h) => head = Some(h),
				ResponseEvent::BodyChunk(b) => body.extend_from_slice(&b),
				ResponseEvent::Complete => complete = true,
			}
		}
		Ok(())
	};
	for chunk in input.chunks(chunk_size.max(1)) {
		p.push(chunk);
		feed(&mut p)?;
	}
	if eof_at_end {
		p.eof();
		feed(&mut p)?;
	}
	Ok((head.expect("headers"), body, complete))
}

#[test]
fn response_content_length() {
	let (head, body, complete) =
		drive_response(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi", false, false, 5).unwrap();
	assert_eq!(head.status, StatusCode::OK);
	assert_eq!(body, b"hi");
	assert!(complete);
}

#[test]
fn response_chunked() {
	let input = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\n\r\n";
	let (_, body, complete) = drive_response(input, false, false, 4).unwrap();
	assert_eq!(body, b"ok");
	assert!(complete);
}

#[test]
fn response_to_eof() {
	let input = b"HTTP/1.1 200 OK\r\n\r\nstreamed until close";
	let (_, body, complete) = drive_response(input, false, true, 1024).unwrap();
	assert_eq!(body, b"streamed until close");
	assert!(complete);
}

#[test]
fn head_response_has_no_body() {
	let input = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
	let (_, body, complete) = drive_response(input, true, false, 1024).unwrap();
	assert!(body.is_empty());
	assert!(complete);
}

#[test]
fn response_204_has_no_body() {
	let input = b"HTTP/1.1 204 No Content\r\n\r\n";
	let (_, body, complete) = drive_response(input, false, false, 1024).unwrap();
	assert!(body.is_empty());
	assert!(complete);
}

#[test]
fn bad_status_line() {
	let err = drive_response(b"HTTP/1.1 banana OK\r\n\r\n", false, false, 1024).unwrap_err();
	assert_eq!(err, ParseError::InvalidStatusLine);
}
