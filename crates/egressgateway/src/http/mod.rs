pub mod parser;

use egress_core::prelude::*;
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version, header};

/// Parsed request line plus headers, produced by the streaming parser.
#[derive(Debug, Clone)]
pub struct RequestHead {
	pub method: Method,
	/// The raw request-target: origin-form (`/path`), absolute-form
	/// (`http://host/path`), or authority-form (`host:port` for CONNECT).
	pub target: String,
	pub version: Version,
	pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
	pub status: StatusCode,
	pub version: Version,
	pub headers: HeaderMap,
}

/// A normalized upstream target.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct HostPort {
	pub host: Strng,
	pub port: u16,
}

impl HostPort {
	pub fn new(host: impl AsRef<str>, port: u16) -> HostPort {
		HostPort {
			host: strng::new(host.as_ref().to_ascii_lowercase()),
			port,
		}
	}

	/// Parses `host[:port]`, lowercasing the host and handling bracketed IPv6
	/// literals. `[::1]:8443`, `example.com:443`, and `example.com` all work.
	pub fn parse(authority: &str, default_port: u16) -> Option<HostPort> {
		let authority = authority.trim();
		if authority.is_empty() {
			return None;
		}
		if let Some(rest) = authority.strip_prefix('[') {
			let end = rest.find(']')?;
			let host = &rest[..end];
			let port = match rest[end + 1..].strip_prefix(':') {
				Some(p) => p.parse::<u16>().ok()?,
				None => default_port,
			};
			return Some(HostPort::new(host, port));
		}
		match authority.rsplit_once(':') {
			// A second ':' means an unbracketed IPv6 literal, not a port.
			Some((host, port)) if !host.contains(':') => {
				let port = port.parse::<u16>().ok()?;
				if host.is_empty() {
					return None;
				}
				Some(HostPort::new(host, port))
			},
			_ => Some(HostPort::new(authority, default_port)),
		}
	}

	pub fn key(&self) -> Strng {
		strng::format!("{}:{}", self.host, self.port)
	}
}

impl Display for HostPort {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// Hop-by-hop headers a proxy must not forward (RFC 9110 §7.6.1, plus
/// the non-standard `proxy-connection` still sent by some clients).
pub static HOP_HEADERS: &[HeaderName] = &[
	header::CONNECTION,
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

/// Strips hop-by-hop headers, including anything nominated by `Connection`
/// and any `proxy-*` header.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
	let nominated: Vec<HeaderName> = headers
		.get_all(header::CONNECTION)
		.iter()
		.flat_map(|v| v.to_str().unwrap_or_default().split(','))
		.filter_map(|name| HeaderName::try_from(name.trim()).ok())
		.collect();
	for name in nominated {
		headers.remove(name);
	}
	for name in HOP_HEADERS {
		headers.remove(name);
	}
	let keep_alive = HeaderName::from_static("keep-alive");
	headers.remove(keep_alive);
	let proxyish: Vec<HeaderName> = headers
		.keys()
		.filter(|k| k.as_str().starts_with("proxy-"))
		.cloned()
		.collect();
	for name in proxyish {
		headers.remove(name);
	}
}

/// Whether the client connection should stay open after this exchange.
pub fn wants_keepalive(version: Version, headers: &HeaderMap) -> bool {
	let connection = headers
		.get(header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.unwrap_or_default()
		.to_ascii_lowercase();
	match version {
		Version::HTTP_10 => connection.contains("keep-alive"),
		_ => !connection.contains("close"),
	}
}

/// Detects a `Connection: upgrade` + `Upgrade: websocket` handshake.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
	let upgrading = headers
		.get(header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase().contains("upgrade"))
		.unwrap_or(false);
	upgrading
		&& headers
			.get(header::UPGRADE)
			.and_then(|v| v.to_str().ok())
			.map(|v| v.eq_ignore_ascii_case("websocket"))
			.unwrap_or(false)
}

/// Serializes a request head in origin-form for an upstream.
pub fn encode_request_head(method: &Method, path: &str, headers: &HeaderMap) -> Vec<u8> {
	let mut out = Vec::with_capacity(256);
	out.extend_from_slice(method.as_str().as_bytes());
	out.push(b' ');
	out.extend_from_slice(path.as_bytes());
	out.extend_from_slice(b" HTTP/1.1\r\n");
	encode_headers(&mut out, headers);
	out.extend_from_slice(b"\r\n");
	out
}

/// Serializes a response head toward the client.
pub fn encode_response_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
	let mut out = Vec::with_capacity(256);
	out.extend_from_slice(b"HTTP/1.1 ");
	out.extend_from_slice(status.as_str().as_bytes());
	out.push(b' ');
	out.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
	out.extend_from_slice(b"\r\n");
	encode_headers(&mut out, headers);
	out.extend_from_slice(b"\r\n");
	out
}

fn encode_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
	for (name, value) in headers {
		out.extend_from_slice(name.as_str().as_bytes());
		out.extend_from_slice(b": ");
		out.extend_from_slice(value.as_bytes());
		out.extend_from_slice(b"\r\n");
	}
}

/// A complete, self-delimited plain-text response for error paths on raw
/// sockets. Always closes the connection.
pub fn simple_response(status: StatusCode, body: &str) -> Vec<u8> {
	simple_response_with(status, body, &[])
}

pub fn simple_response_with(
	status: StatusCode,
	body: &str,
	extra_headers: &[(&str, String)],
) -> Vec<u8> {
	let mut out = Vec::with_capacity(128 + body.len());
	out.extend_from_slice(b"HTTP/1.1 ");
	out.extend_from_slice(status.as_str().as_bytes());
	out.push(b' ');
	out.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
	out.extend_from_slice(b"\r\nContent-Type: text/plain\r\nConnection: close\r\n");
	for (name, value) in extra_headers {
		out.extend_from_slice(name.as_bytes());
		out.extend_from_slice(b": ");
		out.extend_from_slice(value.as_bytes());
		out.extend_from_slice(b"\r\n");
	}
	out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
	out.extend_from_slice(body.as_bytes());
	out
}

/// Like [`simple_response`] but leaves the connection usable, for deny
/// responses on intercepted keep-alive connections.
pub fn simple_response_keepalive(
	status: StatusCode,
	body: &str,
	extra_headers: &[(&str, String)],
) -> Vec<u8> {
	let mut out = Vec::with_capacity(128 + body.len());
	out.extend_from_slice(b"HTTP/1.1 ");
	out.extend_from_slice(status.as_str().as_bytes());
	out.push(b' ');
	out.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
	out.extend_from_slice(b"\r\nContent-Type: text/plain\r\n");
	for (name, value) in extra_headers {
		out.extend_from_slice(name.as_bytes());
		out.extend_from_slice(b": ");
		out.extend_from_slice(value.as_bytes());
		out.extend_from_slice(b"\r\n");
	}
	out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
	out.extend_from_slice(body.as_bytes());
	out
}

/// The CONNECT success preamble.
pub fn connection_established(proxy_agent: &str) -> Vec<u8> {
	format!("HTTP/1.1 200 Connection Established\r\nProxy-Agent: {proxy_agent}\r\n\r\n").into_bytes()
}

/// Re-encodes one body chunk in chunked transfer coding.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(data.len() + 16);
	out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
	out.extend_from_slice(data);
	out.extend_from_slice(b"\r\n");
	out
}

pub const CHUNKED_EOF: &[u8] = b"0\r\n\r\n";
