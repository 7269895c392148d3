//! gRPC wire plumbing shared by the native HTTP/2 proxy and the gRPC-Web
//! translator: length-prefixed message framing, the `grpc-timeout` codec,
//! metadata mapping, and status/trailer helpers.

use bytes::{BufMut, Bytes, BytesMut};
use egress_core::prelude::*;
use http::{HeaderMap, HeaderName, HeaderValue};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

/// Frame flag bit 0: message is compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;
/// Frame flag bit 7: gRPC-Web trailer frame.
pub const FLAG_TRAILERS: u8 = 0x80;

const FRAME_HEADER_LEN: usize = 5;

#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum GrpcError {
	#[error("frame exceeds maximum size: {0}")]
	FrameTooLarge(u32),
	#[error("invalid grpc path: {0}")]
	InvalidPath(String),
	#[error("invalid grpc-timeout: {0}")]
	InvalidTimeout(String),
	#[error("invalid metadata key: {0}")]
	InvalidMetadata(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GrpcFrame {
	pub compressed: bool,
	pub trailers: bool,
	pub data: Bytes,
}

/// Splits every complete length-prefixed frame out of `buf`, leaving any
/// partial frame in place for the next read.
pub fn decode_frames(buf: &mut BytesMut, max_frame: u32) -> Result<Vec<GrpcFrame>, GrpcError> {
	let mut frames = Vec::new();
	loop {
		if buf.len() < FRAME_HEADER_LEN {
			return Ok(frames);
		}
		let flags = buf[0];
		let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
		if len > max_frame {
			return Err(GrpcError::FrameTooLarge(len));
		}
		if buf.len() < FRAME_HEADER_LEN + len as usize {
			return Ok(frames);
		}
		let _ = buf.split_to(FRAME_HEADER_LEN);
		let data = buf.split_to(len as usize).freeze();
		frames.push(GrpcFrame {
			compressed: flags & FLAG_COMPRESSED != 0,
			trailers: flags & FLAG_TRAILERS != 0,
			data,
		});
	}
}

pub fn encode_frame(flags: u8, data: &[u8]) -> Bytes {
	let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + data.len());
	out.put_u8(flags);
	out.put_u32(data.len() as u32);
	out.extend_from_slice(data);
	out.freeze()
}

/// `/package.Service/Method`, split. An empty package is permitted.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GrpcPath {
	/// Fully-qualified service (`package.Service`).
	pub service: Strng,
	pub package: Strng,
	pub method: Strng,
}

pub fn parse_path(path: &str) -> Result<GrpcPath, GrpcError> {
	let trimmed = path.split('?').next().unwrap_or(path);
	let mut parts = trimmed.trim_start_matches('/').split('/');
	let (Some(service), Some(method), None) = (parts.next(), parts.next(), parts.next()) else {
		return Err(GrpcError::InvalidPath(path.to_string()));
	};
	if service.is_empty() || method.is_empty() {
		return Err(GrpcError::InvalidPath(path.to_string()));
	}
	let package = match service.rsplit_once('.') {
		Some((pkg, _)) => pkg,
		None => "",
	};
	Ok(GrpcPath {
		service: strng::new(service),
		package: strng::new(package),
		method: strng::new(method),
	})
}

/// Decodes a `grpc-timeout` header value to a duration, rounding sub-ms
/// units up to the next millisecond.
pub fn parse_timeout(value: &str) -> Result<Duration, GrpcError> {
	let err = || GrpcError::InvalidTimeout(value.to_string());
	if value.len() < 2 || value.len() > 9 {
		return Err(err());
	}
	let (digits, unit) = value.split_at(value.len() - 1);
	let amount: u64 = digits.parse().map_err(|_| err())?;
	let millis = match unit {
		"H" => amount.checked_mul(3_600_000),
		"M" => amount.checked_mul(60_000),
		"S" => amount.checked_mul(1_000),
		"m" => Some(amount),
		"u" => Some(amount.div_ceil(1_000)),
		"n" => Some(amount.div_ceil(1_000_000)),
		_ => return Err(err()),
	}
	.ok_or_else(err)?;
	Ok(Duration::from_millis(millis))
}

/// Encodes a duration as a `grpc-timeout` header value.
pub fn format_timeout(d: Duration) -> String {
	let millis = d.as_millis().min(u128::from(u64::MAX)) as u64;
	if millis < 100_000_000 {
		format!("{millis}m")
	} else {
		format!("{}S", millis / 1000)
	}
}

/// Canonical gRPC status codes the proxy emits.
pub mod status {
	pub const OK: u32 = 0;
	pub const INVALID_ARGUMENT: u32 = 3;
	pub const DEADLINE_EXCEEDED: u32 = 4;
	pub const PERMISSION_DENIED: u32 = 7;
	pub const RESOURCE_EXHAUSTED: u32 = 8;
	pub const UNIMPLEMENTED: u32 = 12;
	pub const INTERNAL: u32 = 13;
	pub const UNAVAILABLE: u32 = 14;
}

// Percent-encode set for grpc-message: spaces and non-ASCII stay readable
// enough while control bytes and '%' itself are escaped.
const MESSAGE_ESCAPES: &AsciiSet = &CONTROLS.add(b'%');

pub fn encode_grpc_message(msg: &str) -> String {
	utf8_percent_encode(msg, MESSAGE_ESCAPES).to_string()
}

pub fn decode_grpc_message(msg: &str) -> String {
	percent_decode_str(msg).decode_utf8_lossy().to_string()
}

/// Headers that are protocol machinery rather than user metadata.
fn is_reserved_metadata(name: &str) -> bool {
	matches!(
		name,
		"content-type"
			| "content-length"
			| "user-agent"
			| "host"
			| "te"
			| "connection"
			| "keep-alive"
			| "transfer-encoding"
			| "upgrade"
			| "accept-encoding"
			| "grpc-encoding"
			| "grpc-accept-encoding"
			| "grpc-timeout"
	) || name.starts_with(':')
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MetadataValue {
	Ascii(String),
	/// `-bin` keys: decoded bytes.
	Binary(Vec<u8>),
}

/// Extracts user metadata from an HTTP/2 header map: pseudo-headers and
/// protocol headers are excluded, `-bin` suffixed keys are base64-decoded.
pub fn metadata_from_headers(headers: &HeaderMap) -> Vec<(Strng, MetadataValue)> {
	use base64::Engine;
	let mut out = Vec::new();
	for (name, value) in headers {
		let name_str = name.as_str();
		if is_reserved_metadata(name_str) {
			continue;
		}
		if let Some(stripped) = name_str.strip_suffix("-bin") {
			let engine = base64::engine::general_purpose::STANDARD_NO_PAD;
			// Tolerate padded values too; the spec says emitters should omit it.
			let decoded = engine
				.decode(value.as_bytes())
				.or_else(|_| base64::engine::general_purpose::STANDARD.decode(value.as_bytes()));
			if let Ok(bytes) = decoded {
				out.push((strng::format!("{stripped}-bin"), MetadataValue::Binary(bytes)));
			}
		} else if let Ok(v) = value.to_str() {
			out.push((strng::new(name_str), MetadataValue::Ascii(v.to_string())));
		}
	}
	out
}

/// Inserts metadata into an outgoing header map, base64-encoding `-bin` keys.
pub fn metadata_into_headers(metadata: &[(Strng, MetadataValue)], headers: &mut HeaderMap) {
	use base64::Engine;
	for (key, value) in metadata {
		let Ok(name) = HeaderName::try_from(key.as_str()) else {
			continue;
		};
		let encoded = match value {
			MetadataValue::Ascii(s) => HeaderValue::try_from(s.as_str()).ok(),
			MetadataValue::Binary(b) => {
				let engine = base64::engine::general_purpose::STANDARD_NO_PAD;
				HeaderValue::try_from(engine.encode(b)).ok()
			},
		};
		if let Some(v) = encoded {
			headers.append(name, v);
		}
	}
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GrpcContentType {
	/// `application/grpc[+proto|+json]` over HTTP/2.
	Native,
	/// `application/grpc-web[+proto|+json]`, binary body.
	Web,
	/// `application/grpc-web-text[+proto|+json]`, base64 body.
	WebText,
}

pub fn classify_content_type(content_type: &str) -> Option<GrpcContentType> {
	let ct = content_type
		.split(';')
		.next()
		.unwrap_or(content_type)
		.trim()
		.to_ascii_lowercase();
	if let Some(rest) = ct.strip_prefix("application/grpc-web-text") {
		if rest.is_empty() || rest.starts_with('+') {
			return Some(GrpcContentType::WebText);
		}
	}
	if let Some(rest) = ct.strip_prefix("application/grpc-web") {
		if rest.is_empty() || rest.starts_with('+') {
			return Some(GrpcContentType::Web);
		}
	}
	if let Some(rest) = ct.strip_prefix("application/grpc") {
		if rest.is_empty() || rest.starts_with('+') {
			return Some(GrpcContentType::Native);
		}
	}
	None
}

/// Matches a fully-qualified service against a restriction pattern:
/// exact, `package.*` (any service in the package), or `**` (everything).
pub fn service_matches(pattern: &str, service: &str) -> bool {
	if pattern == "**" {
		return true;
	}
	if let Some(pkg) = pattern.strip_suffix(".*") {
		return service
			.rsplit_once('.')
			.map(|(p, _)| p == pkg)
			.unwrap_or(false);
	}
	pattern == service
}

/// Matches `service/method` against a method restriction: exact
/// `pkg.Service/Method` or `pkg.Service/*`.
pub fn method_matches(pattern: &str, service: &str, method: &str) -> bool {
	let Some((svc_pat, m_pat)) = pattern.rsplit_once('/') else {
		return false;
	};
	if !service_matches(svc_pat, service) {
		return false;
	}
	m_pat == "*" || m_pat == method
}

pub const REFLECTION_SERVICES: &[&str] = &[
	"grpc.reflection.v1.ServerReflection",
	"grpc.reflection.v1alpha.ServerReflection",
];

pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";

/// Builds the `grpc-status`/`grpc-message` trailer block for an error.
pub fn status_trailers(code: u32, message: &str) -> HeaderMap {
	let mut trailers = HeaderMap::new();
	trailers.insert(
		HeaderName::from_static("grpc-status"),
		HeaderValue::try_from(code.to_string()).expect("status code is a valid header value"),
	);
	if !message.is_empty()
		&& let Ok(v) = HeaderValue::try_from(encode_grpc_message(message))
	{
		trailers.insert(HeaderName::from_static("grpc-message"), v);
	}
	trailers
}

/// Encodes a trailer block as a gRPC-Web trailer frame (flag byte 0x80).
pub fn encode_web_trailers(trailers: &HeaderMap) -> Bytes {
	let mut block = Vec::new();
	for (name, value) in trailers {
		block.extend_from_slice(name.as_str().as_bytes());
		block.extend_from_slice(b": ");
		block.extend_from_slice(value.as_bytes());
		block.extend_from_slice(b"\r\n");
	}
	encode_frame(FLAG_TRAILERS, &block)
}

#[cfg(test)]
#[path = "grpc_tests.rs"]
mod tests;
