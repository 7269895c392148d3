//! Streaming HTTP/1.x message parsing.
//!
//! Pure buffer-fed state machines: callers push bytes in and drain events
//! out. No I/O happens here, which keeps the size accounting exact and makes
//! the parser testable byte-by-byte. [`RequestParser`] drives the client side
//! of a connection (including keep-alive reuse via [`RequestParser::reset`]);
//! [`ResponseParser`] drives the upstream side.

use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};

use crate::http::{RequestHead, ResponseHead};

#[derive(thiserror::Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum ParseError {
	#[error("REQUEST_LINE_TOO_LONG")]
	RequestLineTooLong,
	#[error("HEADERS_TOO_LARGE")]
	HeadersTooLarge,
	#[error("BODY_TOO_LARGE")]
	BodyTooLarge,
	#[error("INVALID_METHOD")]
	InvalidMethod,
	#[error("INVALID_VERSION")]
	InvalidVersion,
	#[error("INVALID_HEADER")]
	InvalidHeader,
	#[error("INVALID_CHUNK_SIZE")]
	InvalidChunkSize,
	#[error("INVALID_CHUNK_FORMAT")]
	InvalidChunkFormat,
	#[error("INVALID_CONTENT_LENGTH")]
	InvalidContentLength,
	#[error("INVALID_STATUS_LINE")]
	InvalidStatusLine,
}

#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
	pub max_request_line: usize,
	pub max_header_size: usize,
	pub max_body_size: u64,
}

impl Default for ParserLimits {
	fn default() -> Self {
		ParserLimits {
			max_request_line: 8 * 1024,
			max_header_size: 64 * 1024,
			max_body_size: 32 * 1024 * 1024,
		}
	}
}

#[derive(Debug)]
pub enum RequestEvent {
	HeadersComplete(RequestHead),
	BodyChunk(Bytes),
	Complete,
}

#[derive(Debug)]
pub enum ResponseEvent {
	HeadersComplete(ResponseHead),
	BodyChunk(Bytes),
	Complete,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum State {
	StartLine,
	Headers,
	BodyContentLength,
	BodyChunkSize,
	BodyChunkData,
	BodyChunkDataEnd,
	BodyChunkTrailer,
	/// Response-only: body runs until the peer closes.
	BodyToEof,
	Complete,
	Error,
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
	buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_version(v: &[u8]) -> Result<Version, ParseError> {
	match v {
		b"HTTP/1.1" => Ok(Version::HTTP_11),
		b"HTTP/1.0" => Ok(Version::HTTP_10),
		_ => Err(ParseError::InvalidVersion),
	}
}

/// Appends one header line into the map, lowercasing the name and
/// comma-joining duplicate values.
fn insert_header(headers: &mut HeaderMap, line: &[u8]) -> Result<(), ParseError> {
	let colon = line
		.iter()
		.position(|&b| b == b':')
		.ok_or(ParseError::InvalidHeader)?;
	let (name, rest) = line.split_at(colon);
	if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace()) {
		return Err(ParseError::InvalidHeader);
	}
	let name = HeaderName::from_bytes(name).map_err(|_| ParseError::InvalidHeader)?;
	let value = trim_ows(&rest[1..]);
	let value = HeaderValue::from_bytes(value).map_err(|_| ParseError::InvalidHeader)?;
	match headers.get(&name) {
		Some(existing) => {
			let mut joined = existing.as_bytes().to_vec();
			joined.extend_from_slice(b", ");
			joined.extend_from_slice(value.as_bytes());
			let joined = HeaderValue::from_bytes(&joined).map_err(|_| ParseError::InvalidHeader)?;
			headers.insert(name, joined);
		},
		None => {
			headers.insert(name, value);
		},
	}
	Ok(())
}

fn trim_ows(mut v: &[u8]) -> &[u8] {
	while let Some((b' ' | b'\t', rest)) = v.split_first() {
		v = rest;
	}
	while let Some((b' ' | b'\t', rest)) = v.split_last() {
		v = rest;
	}
	v
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
	// Chunk extensions after ';' are tolerated and ignored.
	let digits = match line.iter().position(|&b| b == b';') {
		Some(i) => &line[..i],
		None => line,
	};
	let digits = trim_ows(digits);
	if digits.is_empty() || digits.len() > 16 {
		return Err(ParseError::InvalidChunkSize);
	}
	let s = std::str::from_utf8(digits).map_err(|_| ParseError::InvalidChunkSize)?;
	u64::from_str_radix(s, 16).map_err(|_| ParseError::InvalidChunkSize)
}

fn parse_content_length(headers: &HeaderMap) -> Result<Option<u64>, ParseError> {
	let Some(cl) = headers.get(http::header::CONTENT_LENGTH) else {
		return Ok(None);
	};
	cl.to_str()
		.ok()
		.and_then(|s| s.trim().parse::<u64>().ok())
		.map(Some)
		.ok_or(ParseError::InvalidContentLength)
}

fn is_chunked(headers: &HeaderMap) -> Result<bool, ParseError> {
	let Some(te) = headers.get(http::header::TRANSFER_ENCODING) else {
		return Ok(false);
	};
	let chunked = te
		.to_str()
		.map(|s| s.to_ascii_lowercase().contains("chunked"))
		.unwrap_or(false);
	if chunked {
		Ok(true)
	} else {
		// Other transfer codings are not supported through the proxy.
		Err(ParseError::InvalidHeader)
	}
}

/// Shared line/body machinery for the two parsers.
struct Machine {
	limits: ParserLimits,
	buf: BytesMut,
	state: State,
	error: Option<ParseError>,
	header_bytes: usize,
	body_bytes: u64,
	remaining: u64,
	done_emitted: bool,
}

impl Machine {
	fn new(limits: ParserLimits) -> Machine {
		Machine {
			limits,
			buf: BytesMut::with_capacity(8 * 1024),
			state: State::StartLine,
			error: None,
			header_bytes: 0,
			body_bytes: 0,
			remaining: 0,
			done_emitted: false,
		}
	}

	fn reset(&mut self) {
		self.state = State::StartLine;
		self.error = None;
		self.header_bytes = 0;
		self.body_bytes = 0;
		self.remaining = 0;
		self.done_emitted = false;
	}

	fn fail(&mut self, e: ParseError) -> ParseError {
		self.state = State::Error;
		self.error = Some(e);
		e
	}

	fn take_line(&mut self, max: usize, overflow: ParseError) -> Result<Option<Vec<u8>>, ParseError> {
		match find_crlf(&self.buf) {
			Some(i) => {
				if i > max {
					return Err(self.fail(overflow));
				}
				let line = self.buf.split_to(i).to_vec();
				self.buf.advance(2);
				Ok(Some(line))
			},
			None => {
				if self.buf.len() > max {
					return Err(self.fail(overflow));
				}
				Ok(None)
			},
		}
	}

	fn take_header_line(&mut self) -> Result<Option<Vec<u8>>, ParseError> {
		let budget = self.limits.max_header_size.saturating_sub(self.header_bytes);
		let line = self.take_line(budget, ParseError::HeadersTooLarge)?;
		if let Some(l) = &line {
			self.header_bytes += l.len() + 2;
		}
		Ok(line)
	}

	/// Emits the next slice of a sized (content-length or chunk) body.
	/// Returns None when more input is needed.
	fn take_sized(&mut self, next: State) -> Option<Bytes> {
		if self.buf.is_empty() {
			return None;
		}
		let take = (self.buf.len() as u64).min(self.remaining) as usize;
		let chunk = self.buf.split_to(take).freeze();
		self.remaining -= chunk.len() as u64;
		self.body_bytes += chunk.len() as u64;
		if self.remaining == 0 {
			self.state = next;
		}
		Some(chunk)
	}

	/// Runs the body sub-machine shared by requests and responses. Returns
	/// `Some(Some(chunk))` for data, `Some(None)` for "message complete",
	/// `None` when more input is needed.
	fn body_step(&mut self, eof: bool) -> Result<Option<Option<Bytes>>, ParseError> {
		loop {
			match self.state {
				State::BodyContentLength => {
					return Ok(self.take_sized(State::Complete).map(Some));
				},
				State::BodyChunkSize => {
					let Some(line) = self.take_line(128, ParseError::InvalidChunkSize)? else {
						return Ok(None);
					};
					let size = match parse_chunk_size(&line) {
						Ok(s) => s,
						Err(e) => return Err(self.fail(e)),
					};
					if size == 0 {
						self.state = State::BodyChunkTrailer;
						continue;
					}
					if self.body_bytes + size > self.limits.max_body_size {
						return Err(self.fail(ParseError::BodyTooLarge));
					}
					self.remaining = size;
					self.state = State::BodyChunkData;
				},
				State::BodyChunkData => {
					return Ok(self.take_sized(State::BodyChunkDataEnd).map(Some));
				},
				State::BodyChunkDataEnd => {
					if self.buf.len() < 2 {
						return Ok(None);
					}
					if &self.buf[..2] != b"\r\n" {
						return Err(self.fail(ParseError::InvalidChunkFormat));
					}
					self.buf.advance(2);
					self.state = State::BodyChunkSize;
				},
				State::BodyChunkTrailer => {
					let Some(line) = self.take_header_line()? else {
						return Ok(None);
					};
					if line.is_empty() {
						self.state = State::Complete;
						return Ok(Some(None));
					}
					// Trailer fields are consumed but not surfaced.
				},
				State::BodyToEof => {
					if !self.buf.is_empty() {
						let chunk = self.buf.split().freeze();
						self.body_bytes += chunk.len() as u64;
						return Ok(Some(Some(chunk)));
					}
					if eof {
						self.state = State::Complete;
						return Ok(Some(None));
					}
					return Ok(None);
				},
				State::Complete => return Ok(Some(None)),
				_ => unreachable!("body_step entered outside a body state"),
			}
		}
	}
}

/// Streaming parser for HTTP/1.x requests.
pub struct RequestParser {
	m: Machine,
	head: Option<RequestHead>,
}

impl RequestParser {
	pub fn new(limits: ParserLimits) -> RequestParser {
		RequestParser {
			m: Machine::new(limits),
			head: None,
		}
	}

	/// Feeds more bytes from the connection.
	pub fn push(&mut self, data: &[u8]) {
		self.m.buf.extend_from_slice(data);
	}

	/// Returns the parser to its initial state for keep-alive reuse on the
	/// same connection. Buffered bytes (a pipelined next request) survive.
	pub fn reset(&mut self) {
		self.m.reset();
		self.head = None;
	}

	/// Takes every buffered-but-unparsed byte. Used when the connection stops
	/// being HTTP (a CONNECT tunnel hands these to the upstream).
	pub fn take_remaining(&mut self) -> Bytes {
		self.m.buf.split().freeze()
	}

	pub fn is_complete(&self) -> bool {
		self.m.state == State::Complete
	}

	/// True when no partial message is buffered; between keep-alive requests
	/// this distinguishes a clean close from a truncated one.
	pub fn is_idle(&self) -> bool {
		self.m.state == State::StartLine && self.m.buf.is_empty()
	}

	pub fn body_bytes(&self) -> u64 {
		self.m.body_bytes
	}

	/// Advances the state machine, returning the next event if one is ready.
	/// `Ok(None)` means more bytes are needed.
	pub fn next_event(&mut self) -> Result<Option<RequestEvent>, ParseError> {
		loop {
			match self.m.state {
				State::Error => {
					return Err(self.m.error.unwrap_or(ParseError::InvalidHeader));
				},
				State::Complete => {
					if !self.m.done_emitted {
						self.m.done_emitted = true;
						return Ok(Some(RequestEvent::Complete));
					}
					return Ok(None);
				},
				State::StartLine => {
					let Some(line) = self
						.m
						.take_line(self.m.limits.max_request_line, ParseError::RequestLineTooLong)?
					else {
						return Ok(None);
					};
					if line.is_empty() {
						// Tolerate a stray CRLF before the request line.
						continue;
					}
					let head = self.parse_request_line(&line)?;
					self.head = Some(head);
					self.m.state = State::Headers;
				},
				State::Headers => {
					let Some(line) = self.m.take_header_line()? else {
						return Ok(None);
					};
					if line.is_empty() {
						let head = self.head.take().expect("head is set in StartLine");
						self.m.state = self.body_state(&head)?;
						return Ok(Some(RequestEvent::HeadersComplete(head)));
					}
					let head = self.head.as_mut().expect("head is set in StartLine");
					if let Err(e) = insert_header(&mut head.headers, &line) {
						return Err(self.m.fail(e));
					}
				},
				_ => {
					return match self.m.body_step(false)? {
						Some(Some(chunk)) => Ok(Some(RequestEvent::BodyChunk(chunk))),
						Some(None) => {
							self.m.done_emitted = true;
							Ok(Some(RequestEvent::Complete))
						},
						None => Ok(None),
					};
				},
			}
		}
	}

	fn body_state(&mut self, head: &RequestHead) -> Result<State, ParseError> {
		if is_chunked(&head.headers).map_err(|e| self.m.fail(e))? {
			return Ok(State::BodyChunkSize);
		}
		match parse_content_length(&head.headers).map_err(|e| self.m.fail(e))? {
			// A request without framing headers has no body; GET, HEAD, DELETE,
			// OPTIONS, TRACE, and CONNECT complete right after their headers.
			// An explicit Content-Length is honored even on those methods so the
			// body bytes are not misread as a pipelined next request.
			Some(0) | None => Ok(State::Complete),
			Some(n) => {
				if n > self.m.limits.max_body_size {
					return Err(self.m.fail(ParseError::BodyTooLarge));
				}
				self.m.remaining = n;
				Ok(State::BodyContentLength)
			},
		}
	}

	fn parse_request_line(&mut self, line: &[u8]) -> Result<RequestHead, ParseError> {
		let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
		let (Some(method), Some(target), Some(version), None) =
			(parts.next(), parts.next(), parts.next(), parts.next())
		else {
			return Err(self.m.fail(ParseError::InvalidVersion));
		};
		if method.is_empty() || !method.iter().all(|b| b.is_ascii_alphabetic()) {
			return Err(self.m.fail(ParseError::InvalidMethod));
		}
		let method = match Method::from_bytes(method) {
			Ok(m) => m,
			Err(_) => return Err(self.m.fail(ParseError::InvalidMethod)),
		};
		let version = match parse_version(version) {
			Ok(v) => v,
			Err(e) => return Err(self.m.fail(e)),
		};
		let target = match std::str::from_utf8(target) {
			Ok(t) => t.to_string(),
			Err(_) => return Err(self.m.fail(ParseError::InvalidMethod)),
		};
		Ok(RequestHead {
			method,
			target,
			version,
			headers: HeaderMap::new(),
		})
	}
}

/// Streaming parser for HTTP/1.x responses read from an upstream.
///
/// Construct one per exchange, telling it whether the request was a HEAD
/// (whose responses never carry a body). Responses without explicit framing
/// are delimited by upstream close; signal that with [`ResponseParser::eof`].
pub struct ResponseParser {
	m: Machine,
	head_request: bool,
	headers: HeaderMap,
	status: Option<StatusCode>,
	version: Version,
	saw_eof: bool,
}

impl ResponseParser {
	pub fn new(limits: ParserLimits, head_request: bool) -> ResponseParser {
		ResponseParser {
			m: Machine::new(limits),
			head_request,
			headers: HeaderMap::new(),
			status: None,
			version: Version::HTTP_11,
			saw_eof: false,
		}
	}

	pub fn push(&mut self, data: &[u8]) {
		self.m.buf.extend_from_slice(data);
	}

	/// Signals that the upstream closed its write side.
	pub fn eof(&mut self) {
		self.saw_eof = true;
	}

	pub fn is_complete(&self) -> bool {
		self.m.state == State::Complete
	}

	pub fn body_bytes(&self) -> u64 {
		self.m.body_bytes
	}

	/// True when the response was delimited by connection close; such an
	/// upstream socket cannot be reused.
	pub fn consumed_connection(&self) -> bool {
		self.saw_eof
	}

	pub fn next_event(&mut self) -> Result<Option<ResponseEvent>, ParseError> {
		loop {
			match self.m.state {
				State::Error => {
					return Err(self.m.error.unwrap_or(ParseError::InvalidHeader));
				},
				State::Complete => {
					if !self.m.done_emitted {
						self.m.done_emitted = true;
						return Ok(Some(ResponseEvent::Complete));
					}
					return Ok(None);
				},
				State::StartLine => {
					let Some(line) = self
						.m
						.take_line(self.m.limits.max_request_line, ParseError::InvalidStatusLine)?
					else {
						return Ok(None);
					};
					if line.is_empty() {
						continue;
					}
					self.parse_status_line(&line)?;
					self.m.state = State::Headers;
				},
				State::Headers => {
					let Some(line) = self.m.take_header_line()? else {
						return Ok(None);
					};
					if line.is_empty() {
						let status = self.status.take().expect("status set in StartLine");
						let headers = std::mem::take(&mut self.headers);
						self.m.state = self.body_state(status, &headers)?;
						return Ok(Some(ResponseEvent::HeadersComplete(ResponseHead {
							status,
							version: self.version,
							headers,
						})));
					}
					if let Err(e) = insert_header(&mut self.headers, &line) {
						return Err(self.m.fail(e));
					}
				},
				_ => {
					let eof = self.saw_eof;
					return match self.m.body_step(eof)? {
						Some(Some(chunk)) => Ok(Some(ResponseEvent::BodyChunk(chunk))),
						Some(None) => {
							self.m.done_emitted = true;
							Ok(Some(ResponseEvent::Complete))
						},
						None => Ok(None),
					};
				},
			}
		}
	}

	fn body_state(&mut self, status: StatusCode, headers: &HeaderMap) -> Result<State, ParseError> {
		if self.head_request
			|| status == StatusCode::NO_CONTENT
			|| status == StatusCode::NOT_MODIFIED
			|| status.is_informational()
		{
			return Ok(State::Complete);
		}
		if is_chunked(headers).map_err(|e| self.m.fail(e))? {
			return Ok(State::BodyChunkSize);
		}
		match parse_content_length(headers).map_err(|e| self.m.fail(e))? {
			Some(0) => Ok(State::Complete),
			Some(n) => {
				self.m.remaining = n;
				Ok(State::BodyContentLength)
			},
			None => Ok(State::BodyToEof),
		}
	}

	fn parse_status_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
		let mut parts = line.splitn(3, |&b| b == b' ');
		let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
			return Err(self.m.fail(ParseError::InvalidStatusLine));
		};
		self.version = match parse_version(version) {
			Ok(v) => v,
			Err(_) => return Err(self.m.fail(ParseError::InvalidStatusLine)),
		};
		let status = std::str::from_utf8(code)
			.ok()
			.and_then(|s| s.parse::<u16>().ok())
			.and_then(|c| StatusCode::from_u16(c).ok());
		let Some(status) = status else {
			return Err(self.m.fail(ParseError::InvalidStatusLine));
		};
		self.status = Some(status);
		Ok(())
	}
}

#[cfg(test)]
#[path = "parser_tests.rs"]
mod tests;
