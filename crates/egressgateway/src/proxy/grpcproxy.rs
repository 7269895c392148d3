//! gRPC proxying: native HTTP/2 streams piped end-to-end with trailer
//! propagation and deadlines, plus the gRPC-Web-over-HTTP/1.1 translation.

use std::collections::HashMap;

use base64::Engine;
use bytes::BytesMut;
use egress_core::prelude::*;
use h2::client::SendRequest;
use h2::{RecvStream, SendStream};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, header};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::grpc::{self, GrpcContentType, status};
use crate::http::parser::{RequestEvent, RequestParser};
use crate::http::{HostPort, RequestHead, wants_keepalive};
use crate::policy::RequestInfo;
use crate::proxy::ProxyError;
use crate::proxy::forward::Flow;
use crate::telemetry::audit::{AuditRecord, Decision};
use crate::telemetry::metrics::{DecisionLabels, Handler, ReasonLabels, Verdict};
use crate::transport::stream::Socket;
use crate::ProxyInputs;

/// Multiplexed upstream HTTP/2 sessions, one per `host:port`. A dead session
/// is replaced on next use.
pub struct H2Sessions {
	sessions: AsyncMutex<HashMap<Strng, SendRequest<Bytes>>>,
}

impl Default for H2Sessions {
	fn default() -> Self {
		H2Sessions {
			sessions: AsyncMutex::new(HashMap::new()),
		}
	}
}

impl Debug for H2Sessions {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("H2Sessions").finish_non_exhaustive()
	}
}

impl H2Sessions {
	pub async fn get(
		&self,
		inputs: &ProxyInputs,
		target: &HostPort,
	) -> Result<SendRequest<Bytes>, ProxyError> {
		let key = target.key();
		let mut sessions = self.sessions.lock().await;
		if let Some(existing) = sessions.get(&key) {
			match existing.clone().ready().await {
				Ok(ready) => return Ok(ready),
				Err(_) => {
					// Session died (GOAWAY, reset); dial a fresh one.
					sessions.remove(&key);
				},
			}
		}
		let socket = inputs.connector.dial_h2(target).await?;
		let (send, connection) = h2::client::Builder::new()
			.initial_window_size(4 * 1024 * 1024)
			.initial_connection_window_size(16 * 1024 * 1024)
			.enable_push(false)
			.handshake::<_, Bytes>(socket)
			.await
			.map_err(|e| ProxyError::Upstream(crate::client::ClientError::Connect(
				key.clone(),
				std::io::Error::other(e),
			)))?;
		let drive_key = key.clone();
		tokio::spawn(async move {
			if let Err(e) = connection.await {
				debug!(upstream = %drive_key, "h2 session ended: {e}");
			}
		});
		let ready = send
			.ready()
			.await
			.map_err(|e| ProxyError::Upstream(crate::client::ClientError::Connect(
				key.clone(),
				std::io::Error::other(e),
			)))?;
		sessions.insert(key, ready.clone());
		Ok(ready)
	}
}

/// Serves a client connection that opened with the HTTP/2 preface. Only gRPC
/// content is proxied over h2; anything else is refused per stream.
pub async fn serve_h2(inputs: Arc<ProxyInputs>, client: Socket) {
	let peer = client.peer_ip();
	let mut conn = match h2::server::Builder::new()
		.initial_window_size(4 * 1024 * 1024)
		.initial_connection_window_size(16 * 1024 * 1024)
		.handshake::<_, Bytes>(client)
		.await
	{
		Ok(c) => c,
		Err(e) => {
			debug!("h2 handshake failed: {e}");
			return;
		},
	};
	while let Some(stream) = conn.accept().await {
		match stream {
			Ok((req, respond)) => {
				let inputs = inputs.clone();
				tokio::spawn(async move {
					handle_stream(inputs, peer, req, respond).await;
				});
			},
			Err(e) => {
				debug!("h2 connection error: {e}");
				return;
			},
		}
	}
}

/// Sends a gRPC trailer-only response: HEADERS with `grpc-status`,
/// end-of-stream set. The canonical gRPC error form.
fn trailer_only(
	respond: &mut h2::server::SendResponse<Bytes>,
	code: u32,
	message: &str,
) {
	let mut builder = Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "application/grpc")
		.header("grpc-status", code.to_string());
	if !message.is_empty() {
		builder = builder.header("grpc-message", grpc::encode_grpc_message(message));
	}
	let resp = builder.body(()).expect("static response builds");
	if let Err(e) = respond.send_response(resp, true) {
		debug!("failed to send trailer-only response: {e}");
	}
}

fn grpc_error_for(e: &ProxyError) -> (u32, String) {
	let code = match e {
		ProxyError::Denied { .. } | ProxyError::AuthRequired | ProxyError::Tenant(_) => {
			status::PERMISSION_DENIED
		},
		ProxyError::RateLimited { .. } => status::RESOURCE_EXHAUSTED,
		ProxyError::CircuitOpen => status::UNAVAILABLE,
		ProxyError::ConnectTimeout | ProxyError::ResponseTimeout => status::DEADLINE_EXCEEDED,
		ProxyError::Parse(_) | ProxyError::UrlTooLong => status::INVALID_ARGUMENT,
		ProxyError::Internal(_) => status::INTERNAL,
		_ => status::UNAVAILABLE,
	};
	(code, e.to_string())
}

struct StreamVerdict {
	info: RequestInfo,
	rule_id: Strng,
	tenant: Option<Strng>,
	reason: Strng,
}

/// The policy pipeline for one gRPC stream (native or web).
fn authorize_grpc(
	inputs: &ProxyInputs,
	headers: &HeaderMap,
	target: &HostPort,
	path: &grpc::GrpcPath,
	source_ip: std::net::IpAddr,
) -> Result<StreamVerdict, ProxyError> {
	inputs.check_proxy_auth(headers)?;
	let tenant = inputs.resolve_tenant(headers, &target.host, None)?;
	let info = RequestInfo {
		host: target.host.clone(),
		port: target.port,
		path: Some(format!("/{}/{}", path.service, path.method)),
		method: Some(Method::POST),
		source_ip,
		grpc: Some((path.service.clone(), path.method.clone())),
		is_grpc: true,
	};
	let decision = tenant.policy().match_request(&info);
	if !decision.allowed {
		return Err(ProxyError::Denied {
			reason: decision.denial(),
			detail: decision.reason.clone(),
		});
	}
	let (rule_id, rate_spec) = decision
		.rule
		.as_ref()
		.map(|r| (r.id.clone(), r.rate_limit))
		.unwrap_or((strng::literal!("default"), None));
	let rate = tenant.limiter.consume(&rule_id, info.source_ip, rate_spec);
	if !rate.allowed {
		return Err(ProxyError::RateLimited {
			retry_after_secs: rate.reset_ms.div_ceil(1000),
		});
	}
	if !inputs.breaker.can_execute(&info.upstream_key()).allowed {
		return Err(ProxyError::CircuitOpen);
	}
	Ok(StreamVerdict {
		reason: decision.reason.clone(),
		info,
		rule_id,
		tenant: (tenant.id.as_str() != "default").then(|| tenant.id.clone()),
	})
}

/// The per-stream deadline: the configured ceiling, shortened by any
/// `grpc-timeout` the client sent.
fn stream_deadline(inputs: &ProxyInputs, headers: &HeaderMap) -> Duration {
	let configured = inputs.cfg.server.timeouts.grpc_deadline;
	headers
		.get("grpc-timeout")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| grpc::parse_timeout(v).ok())
		.map(|requested| requested.min(configured))
		.unwrap_or(configured)
}

/// Headers h2 forbids or that must not cross the proxy.
fn sanitize_h2_headers(headers: &HeaderMap) -> HeaderMap {
	let mut out = HeaderMap::new();
	for (name, value) in headers {
		match name.as_str() {
			"connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
			| "host" | "proxy-authorization" | "content-length" => {},
			_ => {
				out.append(name.clone(), value.clone());
			},
		}
	}
	out.insert("te", HeaderValue::from_static("trailers"));
	out
}

async fn handle_stream(
	inputs: Arc<ProxyInputs>,
	peer: std::net::IpAddr,
	req: Request<RecvStream>,
	mut respond: h2::server::SendResponse<Bytes>,
) {
	let start = Instant::now();
	let (parts, client_body) = req.into_parts();
	let headers = parts.headers;

	let is_grpc = headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.and_then(grpc::classify_content_type)
		== Some(GrpcContentType::Native);
	if !is_grpc {
		let resp = Response::builder()
			.status(StatusCode::UNSUPPORTED_MEDIA_TYPE)
			.body(())
			.expect("static response builds");
		let _ = respond.send_response(resp, true);
		return;
	}

	let authority = parts
		.uri
		.authority()
		.map(|a| a.as_str().to_string())
		.or_else(|| {
			headers
				.get(header::HOST)
				.and_then(|v| v.to_str().ok())
				.map(|v| v.to_string())
		});
	let Some(target) = authority.as_deref().and_then(|a| HostPort::parse(a, 443)) else {
		trailer_only(&mut respond, status::INVALID_ARGUMENT, "missing authority");
		return;
	};
	let grpc_path = match grpc::parse_path(parts.uri.path()) {
		Ok(p) => p,
		Err(e) => {
			trailer_only(&mut respond, status::INVALID_ARGUMENT, &e.to_string());
			return;
		},
	};
	let source_ip = inputs.source_ip(peer, &headers);
	let mut record = AuditRecord::new("grpc", target.host.clone(), target.port, source_ip)
		.with_trace(&headers);
	record.method = Some("POST".to_string());
	record.path = Some(parts.uri.path().to_string());
	record.grpc_service = Some(grpc_path.service.clone());
	record.grpc_method = Some(grpc_path.method.clone());
	record.headers = inputs.auditor.capture_headers(&headers);

	let verdict = match authorize_grpc(&inputs, &headers, &target, &grpc_path, source_ip) {
		Ok(v) => v,
		Err(e) => {
			let (code, msg) = grpc_error_for(&e);
			trailer_only(&mut respond, code, &msg);
			emit_grpc(&inputs, Handler::grpc, record, start, Err(&e));
			return;
		},
	};
	record.tenant = verdict.tenant.clone();
	record.rule_id = Some(verdict.rule_id.clone());
	record.reason = verdict.reason.clone();

	let deadline = stream_deadline(&inputs, &headers);
	let upstream_key = verdict.info.upstream_key();

	let outcome = tokio::time::timeout(
		deadline,
		proxy_stream(
			&inputs,
			&target,
			&grpc_path,
			&headers,
			client_body,
			&mut respond,
			deadline,
		),
	)
	.await;

	match outcome {
		Ok(Ok((sent, received))) => {
			inputs.breaker.record_success(&upstream_key);
			emit_grpc(&inputs, Handler::grpc, record, start, Ok((sent, received)));
		},
		Ok(Err(e)) => {
			if e.is_upstream_failure() {
				inputs.breaker.record_failure(&upstream_key);
			}
			let (code, msg) = grpc_error_for(&e);
			trailer_only(&mut respond, code, &msg);
			emit_grpc(&inputs, Handler::grpc, record, start, Err(&e));
		},
		Err(_) => {
			// Deadline expired: DEADLINE_EXCEEDED to the client, abort upstream.
			inputs.breaker.record_failure(&upstream_key);
			let e = ProxyError::ResponseTimeout;
			trailer_only(&mut respond, status::DEADLINE_EXCEEDED, "deadline exceeded");
			emit_grpc(&inputs, Handler::grpc, record, start, Err(&e));
		},
	}
}

/// Opens the upstream stream and pipes bytes both ways, returning
/// (request bytes, response bytes).
async fn proxy_stream(
	inputs: &Arc<ProxyInputs>,
	target: &HostPort,
	grpc_path: &grpc::GrpcPath,
	headers: &HeaderMap,
	client_body: RecvStream,
	respond: &mut h2::server::SendResponse<Bytes>,
	deadline: Duration,
) -> Result<(u64, u64), ProxyError> {
	let mut session = inputs.h2_sessions.get(inputs, target).await?;

	let mut upstream_headers = sanitize_h2_headers(headers);
	upstream_headers.insert(
		HeaderName::from_static("grpc-timeout"),
		HeaderValue::try_from(grpc::format_timeout(deadline)).expect("timeout is a valid value"),
	);
	let uri = format!(
		"https://{}:{}/{}/{}",
		target.host, target.port, grpc_path.service, grpc_path.method
	);
	let mut upstream_req = Request::builder()
		.method(Method::POST)
		.uri(uri)
		.body(())
		.map_err(|e| ProxyError::Internal(e.into()))?;
	*upstream_req.headers_mut() = upstream_headers;

	let (upstream_resp, upstream_send) = session
		.send_request(upstream_req, false)
		.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?;

	// Pump the request side concurrently; bidirectional streams deliver
	// response bytes while the request is still flowing.
	let request_pipe = tokio::spawn(pipe_h2(client_body, upstream_send));
	let resp = upstream_resp
		.await
		.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?;

	let (resp_parts, mut upstream_body) = resp.into_parts();
	let mut resp_out = Response::builder()
		.status(resp_parts.status)
		.body(())
		.map_err(|e| ProxyError::Internal(e.into()))?;
	*resp_out.headers_mut() = sanitize_h2_headers(&resp_parts.headers);

	let trailer_only_response = upstream_body.is_end_stream();
	let mut client_send = respond
		.send_response(resp_out, trailer_only_response)
		.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?;
	if trailer_only_response {
		// The upstream is done; stop feeding it.
		request_pipe.abort();
		let sent = match request_pipe.await {
			Ok(Ok(n)) => n,
			_ => 0,
		};
		return Ok((sent, 0));
	}

	let mut received: u64 = 0;
	while let Some(chunk) = upstream_body.data().await {
		let chunk = chunk.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?;
		received += chunk.len() as u64;
		let _ = upstream_body.flow_control().release_capacity(chunk.len());
		send_all(&mut client_send, chunk, false)
			.await
			.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?;
	}
	let trailers = upstream_body
		.trailers()
		.await
		.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?;
	match trailers {
		Some(t) => client_send
			.send_trailers(t)
			.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?,
		None => send_all(&mut client_send, Bytes::new(), true)
			.await
			.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?,
	}
	// The request side normally finished long ago; a reset after the response
	// completed is not an error worth surfacing.
	let sent = match request_pipe.await {
		Ok(Ok(n)) => n,
		_ => 0,
	};
	Ok((sent, received))
}

/// Pipes one h2 body into an h2 send stream, honoring both windows.
async fn pipe_h2(mut from: RecvStream, mut to: SendStream<Bytes>) -> Result<u64, ProxyError> {
	let mut total: u64 = 0;
	while let Some(chunk) = from.data().await {
		let chunk = chunk.map_err(|e| ProxyError::ClientIo(std::io::Error::other(e)))?;
		total += chunk.len() as u64;
		let _ = from.flow_control().release_capacity(chunk.len());
		send_all(&mut to, chunk, false)
			.await
			.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?;
	}
	// gRPC clients end the request with end-of-stream, not trailers.
	send_all(&mut to, Bytes::new(), true)
		.await
		.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?;
	Ok(total)
}

/// Writes a buffer to an h2 stream, reserving window capacity as it goes.
async fn send_all(
	stream: &mut SendStream<Bytes>,
	mut data: Bytes,
	end_of_stream: bool,
) -> Result<(), h2::Error> {
	if data.is_empty() {
		stream.send_data(data, end_of_stream)?;
		return Ok(());
	}
	while !data.is_empty() {
		stream.reserve_capacity(data.len());
		let available = futures_util::future::poll_fn(|cx| stream.poll_capacity(cx))
			.await
			.transpose()?
			.unwrap_or(0);
		if available == 0 {
			// Stream was reset before capacity arrived.
			return Err(h2::Error::from(h2::Reason::CANCEL));
		}
		let take = available.min(data.len());
		let chunk = data.split_to(take);
		let end = end_of_stream && data.is_empty();
		stream.send_data(chunk, end)?;
	}
	Ok(())
}

fn emit_grpc(
	inputs: &ProxyInputs,
	handler: Handler,
	mut record: AuditRecord,
	start: Instant,
	outcome: Result<(u64, u64), &ProxyError>,
) {
	record.duration_ms = start.elapsed().as_millis() as u64;
	let verdict = match &outcome {
		Ok((sent, received)) => {
			record.decision = Decision::Allowed;
			record.status = Some(200);
			record.bytes_sent = *sent;
			record.bytes_received = *received;
			inputs.metrics.bytes_sent.inc_by(*sent);
			inputs.metrics.bytes_received.inc_by(*received);
			Verdict::allowed
		},
		Err(e) => {
			record.decision = e.decision();
			record.denial = Some(e.denial_reason());
			if record.reason.is_empty() {
				record.reason = strng::new(e.to_string());
			}
			inputs
				.metrics
				.denials
				.get_or_create(&ReasonLabels {
					reason: e.denial_reason().code().to_string(),
				})
				.inc();
			match e.decision() {
				Decision::Denied => Verdict::denied,
				Decision::RateLimited => Verdict::rate_limited,
				Decision::CircuitOpen => Verdict::circuit_open,
				_ => Verdict::error,
			}
		},
	};
	inputs
		.metrics
		.decisions
		.get_or_create(&DecisionLabels { verdict, handler })
		.inc();
	inputs.auditor.emit(record);
}

/// Permissive CORS for gRPC-Web preflights.
pub fn cors_preflight_response() -> Vec<u8> {
	let headers = "HTTP/1.1 204 No Content\r\n\
		Access-Control-Allow-Origin: *\r\n\
		Access-Control-Allow-Methods: POST, OPTIONS\r\n\
		Access-Control-Allow-Headers: Content-Type, X-Grpc-Web, X-User-Agent, Grpc-Timeout, Authorization\r\n\
		Access-Control-Max-Age: 86400\r\n\
		Content-Length: 0\r\n\r\n";
	headers.as_bytes().to_vec()
}

const GRPC_WEB_CORS: &[(&str, &str)] = &[
	("Access-Control-Allow-Origin", "*"),
	("Access-Control-Expose-Headers", "grpc-status,grpc-message"),
];

fn grpc_web_response(content_type: &str, body: &[u8], text: bool) -> Vec<u8> {
	let body = if text {
		base64::engine::general_purpose::STANDARD.encode(body).into_bytes()
	} else {
		body.to_vec()
	};
	let mut out = Vec::with_capacity(body.len() + 256);
	out.extend_from_slice(b"HTTP/1.1 200 OK\r\nContent-Type: ");
	out.extend_from_slice(content_type.as_bytes());
	out.extend_from_slice(b"\r\n");
	for (name, value) in GRPC_WEB_CORS {
		out.extend_from_slice(name.as_bytes());
		out.extend_from_slice(b": ");
		out.extend_from_slice(value.as_bytes());
		out.extend_from_slice(b"\r\n");
	}
	out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
	out.extend_from_slice(&body);
	out
}

/// A body that is only a trailer frame, used for gRPC-Web errors.
fn grpc_web_error_body(code: u32, message: &str) -> Vec<u8> {
	grpc::encode_web_trailers(&grpc::status_trailers(code, message)).to_vec()
}

/// Translates one gRPC-Web request into a native gRPC upstream call.
#[allow(clippy::too_many_arguments)]
pub async fn handle_grpc_web(
	inputs: &Arc<ProxyInputs>,
	client: &mut Socket,
	parser: &mut RequestParser,
	head: RequestHead,
	target: HostPort,
	path: String,
	source_ip: std::net::IpAddr,
	variant: GrpcContentType,
	start: Instant,
) -> Flow {
	let text = variant == GrpcContentType::WebText;
	let content_type = head
		.headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("application/grpc-web")
		.to_string();
	let client_keepalive = wants_keepalive(head.version, &head.headers);

	// gRPC-Web requests are unary; collect the whole (size-capped) body.
	let raw_body = match read_full_body(client, parser).await {
		Ok(b) => b,
		Err(e) => {
			let _ = client.write_all(&e.response_bytes()).await;
			return Flow::Close;
		},
	};
	let body = if text {
		match base64::engine::general_purpose::STANDARD.decode(&raw_body) {
			Ok(b) => Bytes::from(b),
			Err(_) => {
				let _ = client
					.write_all(&grpc_web_response(
						&content_type,
						&grpc_web_error_body(status::INVALID_ARGUMENT, "invalid base64 body"),
						text,
					))
					.await;
				return if client_keepalive { Flow::Continue } else { Flow::Close };
			},
		}
	} else {
		raw_body.freeze()
	};

	let grpc_path = match grpc::parse_path(&path) {
		Ok(p) => p,
		Err(e) => {
			let _ = client
				.write_all(&grpc_web_response(
					&content_type,
					&grpc_web_error_body(status::INVALID_ARGUMENT, &e.to_string()),
					text,
				))
				.await;
			return if client_keepalive { Flow::Continue } else { Flow::Close };
		},
	};

	let mut record = AuditRecord::new("grpc_web", target.host.clone(), target.port, source_ip)
		.with_trace(&head.headers);
	record.method = Some(head.method.to_string());
	record.path = Some(path.clone());
	record.grpc_service = Some(grpc_path.service.clone());
	record.grpc_method = Some(grpc_path.method.clone());
	record.headers = inputs.auditor.capture_headers(&head.headers);
	record.body = inputs.auditor.capture_body(&body);

	let verdict = match authorize_grpc(inputs, &head.headers, &target, &grpc_path, source_ip) {
		Ok(v) => v,
		Err(e) => {
			let (code, msg) = grpc_error_for(&e);
			let _ = client
				.write_all(&grpc_web_response(
					&content_type,
					&grpc_web_error_body(code, &msg),
					text,
				))
				.await;
			emit_grpc(inputs, Handler::grpc_web, record, start, Err(&e));
			return if client_keepalive { Flow::Continue } else { Flow::Close };
		},
	};
	record.tenant = verdict.tenant.clone();
	record.rule_id = Some(verdict.rule_id.clone());
	record.reason = verdict.reason.clone();

	let deadline = stream_deadline(inputs, &head.headers);
	let upstream_key = verdict.info.upstream_key();
	let result = tokio::time::timeout(
		deadline,
		call_native(inputs, &target, &grpc_path, &head.headers, body.clone(), deadline),
	)
	.await;

	let (response_bytes, outcome): (Vec<u8>, Result<(u64, u64), ProxyError>) = match result {
		Ok(Ok((data, trailers))) => {
			inputs.breaker.record_success(&upstream_key);
			let mut out = BytesMut::with_capacity(data.len() + 64);
			out.extend_from_slice(&data);
			out.extend_from_slice(&grpc::encode_web_trailers(&trailers));
			let received = out.len() as u64;
			(
				grpc_web_response(&content_type, &out, text),
				Ok((body.len() as u64, received)),
			)
		},
		Ok(Err(e)) => {
			if e.is_upstream_failure() {
				inputs.breaker.record_failure(&upstream_key);
			}
			let (code, msg) = grpc_error_for(&e);
			(
				grpc_web_response(&content_type, &grpc_web_error_body(code, &msg), text),
				Err(e),
			)
		},
		Err(_) => {
			inputs.breaker.record_failure(&upstream_key);
			let e = ProxyError::ResponseTimeout;
			(
				grpc_web_response(
					&content_type,
					&grpc_web_error_body(status::DEADLINE_EXCEEDED, "deadline exceeded"),
					text,
				),
				Err(e),
			)
		},
	};
	let _ = client.write_all(&response_bytes).await;
	match outcome {
		Ok(counts) => emit_grpc(inputs, Handler::grpc_web, record, start, Ok(counts)),
		Err(e) => emit_grpc(inputs, Handler::grpc_web, record, start, Err(&e)),
	}
	if client_keepalive { Flow::Continue } else { Flow::Close }
}

/// Reads the current request's body to completion through the parser.
async fn read_full_body(
	client: &mut Socket,
	parser: &mut RequestParser,
) -> Result<BytesMut, ProxyError> {
	let mut body = BytesMut::new();
	let mut buf = vec![0u8; 16 * 1024];
	loop {
		match parser.next_event()? {
			Some(RequestEvent::BodyChunk(chunk)) => body.extend_from_slice(&chunk),
			Some(RequestEvent::Complete) => return Ok(body),
			Some(RequestEvent::HeadersComplete(_)) => {},
			None => {
				let n = client.read(&mut buf).await.map_err(ProxyError::ClientIo)?;
				if n == 0 {
					return Err(ProxyError::ClientIo(std::io::Error::new(
						std::io::ErrorKind::UnexpectedEof,
						"client closed mid-request",
					)));
				}
				parser.push(&buf[..n]);
			},
		}
	}
}

/// Performs the native unary exchange for a translated gRPC-Web call:
/// returns the concatenated response DATA and the trailer block.
async fn call_native(
	inputs: &Arc<ProxyInputs>,
	target: &HostPort,
	grpc_path: &grpc::GrpcPath,
	headers: &HeaderMap,
	body: Bytes,
	deadline: Duration,
) -> Result<(Bytes, HeaderMap), ProxyError> {
	let mut session = inputs.h2_sessions.get(inputs, target).await?;

	let mut upstream_headers = sanitize_h2_headers(headers);
	upstream_headers.insert(
		header::CONTENT_TYPE,
		HeaderValue::from_static("application/grpc"),
	);
	upstream_headers.remove("x-grpc-web");
	upstream_headers.remove(header::ORIGIN);
	upstream_headers.insert(
		HeaderName::from_static("grpc-timeout"),
		HeaderValue::try_from(grpc::format_timeout(deadline)).expect("timeout is a valid value"),
	);
	let uri = format!(
		"https://{}:{}/{}/{}",
		target.host, target.port, grpc_path.service, grpc_path.method
	);
	let mut upstream_req = Request::builder()
		.method(Method::POST)
		.uri(uri)
		.body(())
		.map_err(|e| ProxyError::Internal(e.into()))?;
	*upstream_req.headers_mut() = upstream_headers;

	let (resp, mut send) = session
		.send_request(upstream_req, false)
		.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?;
	send_all(&mut send, body, true)
		.await
		.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?;

	let resp = resp
		.await
		.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?;
	let (resp_parts, mut resp_body) = resp.into_parts();

	let max = inputs.cfg.server.limits.max_response_body_size;
	let mut data = BytesMut::new();
	while let Some(chunk) = resp_body.data().await {
		let chunk = chunk.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?;
		let _ = resp_body.flow_control().release_capacity(chunk.len());
		data.extend_from_slice(&chunk);
		if data.len() as u64 > max {
			return Err(ProxyError::ResponseTooLarge);
		}
	}
	let trailers = resp_body
		.trailers()
		.await
		.map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))?;
	// Trailer-only responses carry grpc-status in the initial headers.
	let trailers = trailers.unwrap_or_else(|| {
		let mut t = HeaderMap::new();
		for key in ["grpc-status", "grpc-message"] {
			if let Some(v) = resp_parts.headers.get(key) {
				t.insert(HeaderName::from_static(key), v.clone());
			}
		}
		if !t.contains_key("grpc-status") {
			t.insert(
				HeaderName::from_static("grpc-status"),
				HeaderValue::from_static("0"),
			);
		}
		t
	});
	Ok((data.freeze(), trailers))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn preflight_carries_required_cors_headers() {
		let raw = String::from_utf8(cors_preflight_response()).unwrap();
		assert!(raw.contains("Access-Control-Allow-Methods: POST, OPTIONS\r\n"));
		assert!(raw.contains("Access-Control-Max-Age: 86400\r\n"));
		assert!(raw.contains("Grpc-Timeout"));
	}

	#[test]
	fn web_error_body_is_trailer_frame() {
		let body = grpc_web_error_body(status::PERMISSION_DENIED, "denied");
		assert_eq!(body[0], grpc::FLAG_TRAILERS);
		let text = String::from_utf8_lossy(&body[5..]);
		assert!(text.contains("grpc-status: 7"));
	}

	#[test]
	fn web_response_text_variant_is_base64() {
		let raw = grpc_web_response("application/grpc-web-text+proto", b"\x00\x01\x02", true);
		let raw = String::from_utf8(raw).unwrap();
		let body = raw.split("\r\n\r\n").nth(1).unwrap();
		assert!(base64::engine::general_purpose::STANDARD.decode(body).is_ok());
		assert!(raw.contains("Access-Control-Expose-Headers: grpc-status,grpc-message"));
	}

	#[test]
	fn h2_header_sanitizer() {
		let mut h = HeaderMap::new();
		h.insert("connection", HeaderValue::from_static("keep-alive"));
		h.insert("host", HeaderValue::from_static("a"));
		h.insert("content-length", HeaderValue::from_static("5"));
		h.insert("x-meta", HeaderValue::from_static("1"));
		let out = sanitize_h2_headers(&h);
		assert!(!out.contains_key("connection"));
		assert!(!out.contains_key("host"));
		assert!(!out.contains_key("content-length"));
		assert_eq!(out.get("x-meta").unwrap(), "1");
		assert_eq!(out.get("te").unwrap(), "trailers");
	}

	#[test]
	fn deadline_is_min_of_configured_and_header() {
		let inputs = crate::ProxyInputs::new(crate::Config::default()).unwrap();
		let mut h = HeaderMap::new();
		assert_eq!(stream_deadline(&inputs, &h), Duration::from_secs(60));
		h.insert("grpc-timeout", HeaderValue::from_static("5S"));
		assert_eq!(stream_deadline(&inputs, &h), Duration::from_secs(5));
		h.insert("grpc-timeout", HeaderValue::from_static("10M"));
		assert_eq!(stream_deadline(&inputs, &h), Duration::from_secs(60));
	}
}
