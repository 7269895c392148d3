//! The HTTP/1.1 request/response exchange shared by the MITM and plain
//! forward paths: serialize the filtered request head, stream the request
//! body upstream with size enforcement, then stream the response back with
//! its own size cap and deadline.

use egress_core::prelude::*;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::http::parser::{
	ParserLimits, RequestEvent, RequestParser, ResponseEvent, ResponseParser,
};
use crate::http::{CHUNKED_EOF, encode_chunk, encode_request_head, encode_response_head};
use crate::policy::HeaderTransform;
use crate::proxy::ProxyError;
use crate::transport::stream::Socket;

const READ_BUF: usize = 16 * 1024;

/// The request to place on the upstream connection. Headers arrive already
/// policy-filtered (hop-by-hop stripped, transforms applied, Host set).
pub struct UpstreamRequest {
	pub method: Method,
	pub path: String,
	pub headers: HeaderMap,
	/// Original request body framing was chunked; re-chunk upstream.
	pub chunked: bool,
	/// The request carries a body (chunked or positive content-length).
	pub has_body: bool,
}

pub struct ExchangeSettings {
	pub response_limits: ParserLimits,
	pub max_response_body: u64,
	pub response_timeout: Duration,
}

pub struct Outcome {
	pub status: StatusCode,
	pub bytes_sent: u64,
	pub bytes_received: u64,
	pub upstream_reusable: bool,
	/// The client wants another request on this connection.
	pub client_keepalive: bool,
}

/// A failed exchange. Once `response_started` the client head is already on
/// the wire and the only safe recovery is tearing the connection down.
pub struct Failure {
	pub error: ProxyError,
	pub response_started: bool,
}

impl Failure {
	fn early(error: ProxyError) -> Failure {
		Failure {
			error,
			response_started: false,
		}
	}

	fn late(error: ProxyError) -> Failure {
		Failure {
			error,
			response_started: true,
		}
	}
}

/// Runs one exchange. `parser` must be positioned immediately after the
/// request's `HeadersComplete` event; the request body is pulled through it.
pub async fn run(
	client: &mut Socket,
	parser: &mut RequestParser,
	upstream: &mut Socket,
	request: UpstreamRequest,
	settings: &ExchangeSettings,
	response_transform: Option<&HeaderTransform>,
	client_keepalive: bool,
) -> Result<Outcome, Failure> {
	let bytes_sent = send_request(client, parser, upstream, &request)
		.await
		.map_err(Failure::early)?;

	let head_request = request.method == Method::HEAD;
	let mut rp = ResponseParser::new(
		ParserLimits {
			max_body_size: u64::MAX,
			..settings.response_limits
		},
		head_request,
	);

	let mut buf = vec![0u8; READ_BUF];
	let mut response_started = false;
	let mut chunked_out = false;
	let mut bytes_received: u64 = 0;
	let mut upstream_keepalive = true;
	let mut status = StatusCode::BAD_GATEWAY;
	let mut deadline = tokio::time::Instant::now() + settings.response_timeout;
	let mut first_byte = false;
	let mut eof_seen = false;

	'read: loop {
		loop {
			let event = rp.next_event().map_err(|e| Failure {
				error: ProxyError::UpstreamIo(std::io::Error::other(e)),
				response_started,
			})?;
			let Some(event) = event else {
				break;
			};
			match event {
				ResponseEvent::HeadersComplete(head) => {
					status = head.status;
					if let Some(cl) = head
						.headers
						.get(header::CONTENT_LENGTH)
						.and_then(|v| v.to_str().ok())
						.and_then(|v| v.trim().parse::<u64>().ok())
						&& cl > settings.max_response_body
					{
						return Err(Failure::early(ProxyError::ResponseTooLarge));
					}
					upstream_keepalive = !head
						.headers
						.get(header::CONNECTION)
						.and_then(|v| v.to_str().ok())
						.map(|v| v.to_ascii_lowercase().contains("close"))
						.unwrap_or(false);

					let mut out_headers = head.headers.clone();
					crate::http::strip_hop_by_hop(&mut out_headers);
					if let Some(t) = response_transform {
						t.apply(&mut out_headers);
					}
					// Responses without explicit framing are re-chunked so the
					// client connection can stay usable.
					let had_cl = out_headers.contains_key(header::CONTENT_LENGTH);
					chunked_out = !had_cl && !bodyless_response(head_request, status);
					if chunked_out {
						out_headers.insert(
							header::TRANSFER_ENCODING,
							HeaderValue::from_static("chunked"),
						);
					}
					if !client_keepalive {
						out_headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
					}
					client
						.write_all(&encode_response_head(status, &out_headers))
						.await
						.map_err(|e| Failure {
							error: ProxyError::ClientIo(e),
							response_started,
						})?;
					response_started = true;
				},
				ResponseEvent::BodyChunk(chunk) => {
					bytes_received += chunk.len() as u64;
					if bytes_received > settings.max_response_body {
						return Err(Failure::late(ProxyError::ResponseTooLarge));
					}
					let write = if chunked_out {
						client.write_all(&encode_chunk(&chunk)).await
					} else {
						client.write_all(&chunk).await
					};
					write.map_err(|e| Failure {
						error: ProxyError::ClientIo(e),
						response_started,
					})?;
				},
				ResponseEvent::Complete => {
					if chunked_out {
						client.write_all(CHUNKED_EOF).await.map_err(|e| Failure {
							error: ProxyError::ClientIo(e),
							response_started,
						})?;
					}
					client.flush().await.map_err(|e| Failure {
						error: ProxyError::ClientIo(e),
						response_started,
					})?;
					break 'read;
				},
			}
		}

		let n = tokio::time::timeout_at(deadline, upstream.read(&mut buf))
			.await
			.map_err(|_| Failure {
				error: ProxyError::ResponseTimeout,
				response_started,
			})?
			.map_err(|e| Failure {
				error: ProxyError::UpstreamIo(e),
				response_started,
			})?;
		if n == 0 {
			rp.eof();
			// A second visit here after EOF means the events could not finish
			// the message: the upstream truncated it.
			if eof_seen {
				return Err(Failure {
					error: ProxyError::UpstreamIo(std::io::Error::new(
						std::io::ErrorKind::UnexpectedEof,
						"upstream closed mid-response",
					)),
					response_started,
				});
			}
			eof_seen = true;
		} else {
			if !first_byte {
				// The response window runs from first byte to last byte.
				first_byte = true;
				deadline = tokio::time::Instant::now() + settings.response_timeout;
			}
			rp.push(&buf[..n]);
		}
	}

	let upstream_reusable = upstream_keepalive && rp.is_complete() && !rp.consumed_connection();
	Ok(Outcome {
		status,
		bytes_sent,
		bytes_received,
		upstream_reusable,
		client_keepalive,
	})
}

fn bodyless_response(head_request: bool, status: StatusCode) -> bool {
	head_request
		|| status.is_informational()
		|| status == StatusCode::NO_CONTENT
		|| status == StatusCode::NOT_MODIFIED
}

/// Writes the request head and streams the body (if any) upstream, enforcing
/// the request size limits through the parser.
async fn send_request(
	client: &mut Socket,
	parser: &mut RequestParser,
	upstream: &mut Socket,
	request: &UpstreamRequest,
) -> Result<u64, ProxyError> {
	let mut headers = request.headers.clone();
	if request.chunked {
		headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
	}
	let head = encode_request_head(&request.method, &request.path, &headers);
	upstream
		.write_all(&head)
		.await
		.map_err(ProxyError::UpstreamIo)?;

	let mut sent: u64 = 0;
	if request.has_body {
		let mut buf = vec![0u8; READ_BUF];
		'body: loop {
			loop {
				let event = parser.next_event()?;
				let Some(event) = event else {
					break;
				};
				match event {
					RequestEvent::BodyChunk(chunk) => {
						sent += chunk.len() as u64;
						if request.chunked {
							upstream
								.write_all(&encode_chunk(&chunk))
								.await
								.map_err(ProxyError::UpstreamIo)?;
						} else {
							upstream
								.write_all(&chunk)
								.await
								.map_err(ProxyError::UpstreamIo)?;
						}
					},
					RequestEvent::Complete => {
						if request.chunked {
							upstream
								.write_all(CHUNKED_EOF)
								.await
								.map_err(ProxyError::UpstreamIo)?;
						}
						break 'body;
					},
					RequestEvent::HeadersComplete(_) => {
						unreachable!("parser is past headers when an exchange starts")
					},
				}
			}
			let n = client.read(&mut buf).await.map_err(ProxyError::ClientIo)?;
			if n == 0 {
				return Err(ProxyError::ClientIo(std::io::Error::new(
					std::io::ErrorKind::UnexpectedEof,
					"client closed mid-request",
				)));
			}
			parser.push(&buf[..n]);
		}
	} else {
		// Drain the Complete event for bodyless requests.
		while let Some(event) = parser.next_event()? {
			if matches!(event, RequestEvent::Complete) {
				break;
			}
		}
	}
	upstream.flush().await.map_err(ProxyError::UpstreamIo)?;
	Ok(sent)
}

/// Derives the upstream request framing from parsed request headers.
pub fn request_framing(headers: &HeaderMap) -> (bool, bool) {
	let chunked = headers
		.get(header::TRANSFER_ENCODING)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase().contains("chunked"))
		.unwrap_or(false);
	let content_length = headers
		.get(header::CONTENT_LENGTH)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.trim().parse::<u64>().ok())
		.unwrap_or(0);
	(chunked, chunked || content_length > 0)
}

/// Appends the client address to `X-Forwarded-For`.
pub fn append_forwarded_for(headers: &mut HeaderMap, client: std::net::IpAddr) {
	let name = HeaderName::from_static("x-forwarded-for");
	let value = match headers.get(&name).and_then(|v| v.to_str().ok()) {
		Some(existing) => format!("{existing}, {client}"),
		None => client.to_string(),
	};
	if let Ok(v) = HeaderValue::try_from(value) {
		headers.insert(name, v);
	}
}
