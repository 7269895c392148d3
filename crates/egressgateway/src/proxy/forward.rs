//! Plain-HTTP proxying: absolute-form request URIs (or `Host`-derived
//! targets), policy enforcement, pooled upstream I/O, and streaming with
//! size limits. Also hosts the WebSocket upgrade path and hands gRPC-Web
//! requests to the translator.

use egress_core::copy;
use egress_core::prelude::*;
use http::{Method, header};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::client::pool::{PooledConn, Protocol};
use crate::grpc::{self, GrpcContentType};
use crate::http::parser::{RequestEvent, RequestParser};
use crate::http::{HostPort, RequestHead, strip_hop_by_hop, wants_keepalive};
use crate::policy::{CompiledRule, RequestInfo};
use crate::proxy::exchange::{self, ExchangeSettings, UpstreamRequest};
use crate::proxy::{ProxyError, grpcproxy};
use crate::telemetry::audit::{AuditRecord, Decision};
use crate::telemetry::metrics::{DecisionLabels, Handler, ReasonLabels, Verdict};
use crate::tenant::TenantSlot;
use crate::transport::stream::Socket;
use crate::{ProxyInputs, http};

pub enum Flow {
	Continue,
	Close,
}

/// Serves a plain-HTTP client connection: the first parsed request plus any
/// keep-alive successors.
pub async fn serve(
	inputs: Arc<ProxyInputs>,
	mut client: Socket,
	mut parser: RequestParser,
	first_head: RequestHead,
) {
	let mut pending = Some(first_head);
	loop {
		let head = match pending.take() {
			Some(h) => h,
			None => match next_head(&inputs, &mut client, &mut parser).await {
				Ok(Some(h)) => h,
				Ok(None) => return,
				Err(e) => {
					let _ = client.write_all(&e.response_bytes()).await;
					let _ = client.shutdown().await;
					return;
				},
			},
		};
		match handle_request(&inputs, &mut client, &mut parser, head).await {
			Flow::Continue => parser.reset(),
			Flow::Close => {
				let _ = client.shutdown().await;
				return;
			},
		}
	}
}

/// Reads until the next request head on a keep-alive connection. `Ok(None)`
/// is a clean close (or keep-alive idle expiry) between requests.
async fn next_head(
	inputs: &ProxyInputs,
	client: &mut Socket,
	parser: &mut RequestParser,
) -> Result<Option<RequestHead>, ProxyError> {
	let idle = inputs.cfg.server.timeouts.idle_timeout;
	let mut buf = vec![0u8; 8 * 1024];
	loop {
		if let Some(RequestEvent::HeadersComplete(head)) = parser.next_event()? {
			return Ok(Some(head));
		}
		let read = match tokio::time::timeout(idle, client.read(&mut buf)).await {
			Ok(r) => r,
			Err(_) => return Ok(None),
		};
		let n = read.map_err(ProxyError::ClientIo)?;
		if n == 0 {
			if parser.is_idle() {
				return Ok(None);
			}
			return Err(ProxyError::ClientIo(std::io::Error::new(
				std::io::ErrorKind::UnexpectedEof,
				"client closed mid-request",
			)));
		}
		parser.push(&buf[..n]);
	}
}

struct Authorized {
	rule: Option<Arc<CompiledRule>>,
	_slot: TenantSlot,
	tenant: Option<Strng>,
}

/// The policy pipeline shared by the forward paths: tenant, proxy auth,
/// match, rate limit, circuit. Returns the matched rule for transforms.
fn authorize(
	inputs: &ProxyInputs,
	head: &RequestHead,
	info: &RequestInfo,
) -> Result<Authorized, ProxyError> {
	inputs.check_proxy_auth(&head.headers)?;
	let tenant = inputs.resolve_tenant(&head.headers, &info.host, info.path.as_deref())?;
	let slot = tenant.acquire_connection()?;
	let decision = tenant.policy().match_request(info);
	if !decision.allowed {
		return Err(ProxyError::Denied {
			reason: decision.denial(),
			detail: decision.reason.clone(),
		});
	}
	let (rule_id, rate_spec) = decision
		.rule
		.as_ref()
		.map(|r| (r.id.as_str(), r.rate_limit))
		.unwrap_or(("default", None));
	let rate = tenant.limiter.consume(rule_id, info.source_ip, rate_spec);
	if !rate.allowed {
		return Err(ProxyError::RateLimited {
			retry_after_secs: rate.reset_ms.div_ceil(1000),
		});
	}
	if !inputs.breaker.can_execute(&info.upstream_key()).allowed {
		return Err(ProxyError::CircuitOpen);
	}
	Ok(Authorized {
		rule: decision.rule,
		_slot: slot,
		tenant: (tenant.id.as_str() != "default").then(|| tenant.id.clone()),
	})
}

/// Splits the request target into (protocol, target, origin-form path).
fn resolve_target(head: &RequestHead) -> Result<(Protocol, HostPort, String), ProxyError> {
	let target = head.target.as_str();
	for (prefix, proto, default_port) in [
		("http://", Protocol::Http, 80u16),
		("https://", Protocol::Https, 443u16),
	] {
		if let Some(rest) = target.strip_prefix(prefix) {
			let (authority, path) = match rest.find('/') {
				Some(i) => (&rest[..i], &rest[i..]),
				None => (rest, "/"),
			};
			let hp = HostPort::parse(authority, default_port)
				.ok_or(ProxyError::Parse(crate::http::parser::ParseError::InvalidHeader))?;
			return Ok((proto, hp, path.to_string()));
		}
	}
	// Origin-form: the authority comes from Host.
	let host = head
		.headers
		.get(header::HOST)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| HostPort::parse(v, 80))
		.ok_or(ProxyError::Parse(crate::http::parser::ParseError::InvalidHeader))?;
	Ok((Protocol::Http, host, target.to_string()))
}

fn emit(
	inputs: &ProxyInputs,
	handler: Handler,
	mut record: AuditRecord,
	start: Instant,
	outcome: Result<(u16, u64, u64), &ProxyError>,
) {
	record.duration_ms = start.elapsed().as_millis() as u64;
	let verdict = match &outcome {
		Ok((status, sent, received)) => {
			record.decision = Decision::Allowed;
			record.status = Some(*status);
			record.bytes_sent = *sent;
			record.bytes_received = *received;
			inputs.metrics.bytes_sent.inc_by(*sent);
			inputs.metrics.bytes_received.inc_by(*received);
			Verdict::allowed
		},
		Err(e) => {
			record.decision = e.decision();
			record.denial = Some(e.denial_reason());
			record.status = Some(e.status().as_u16());
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

async fn handle_request(
	inputs: &Arc<ProxyInputs>,
	client: &mut Socket,
	parser: &mut RequestParser,
	head: RequestHead,
) -> Flow {
	let start = Instant::now();

	// gRPC-Web preflights get permissive CORS without touching policy; the
	// actual call that follows is still decided normally.
	if head.method == Method::OPTIONS
		&& head.headers.contains_key("access-control-request-method")
	{
		let keep = wants_keepalive(head.version, &head.headers);
		let _ = client.write_all(&grpcproxy::cors_preflight_response()).await;
		return if keep { Flow::Continue } else { Flow::Close };
	}

	let (proto, target, path) = match resolve_target(&head) {
		Ok(t) => t,
		Err(e) => {
			let _ = client.write_all(&e.response_bytes()).await;
			return Flow::Close;
		},
	};
	let source_ip = inputs.source_ip(client.peer_ip(), &head.headers);

	let grpc_ct = head
		.headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.and_then(grpc::classify_content_type);
	if matches!(grpc_ct, Some(GrpcContentType::Web | GrpcContentType::WebText)) {
		return grpcproxy::handle_grpc_web(
			inputs, client, parser, head, target, path, source_ip, grpc_ct.unwrap(), start,
		)
		.await;
	}

	let grpc_path = if grpc_ct == Some(GrpcContentType::Native) {
		grpc::parse_path(&path).ok()
	} else {
		None
	};
	let info = RequestInfo {
		host: target.host.clone(),
		port: target.port,
		path: Some(path.clone()),
		method: Some(head.method.clone()),
		source_ip,
		grpc: grpc_path
			.as_ref()
			.map(|p| (p.service.clone(), p.method.clone())),
		is_grpc: grpc_path.is_some(),
	};
	let mut record = AuditRecord::new("forward", info.host.clone(), info.port, source_ip)
		.with_trace(&head.headers);
	record.method = Some(head.method.to_string());
	record.path = Some(path.clone());
	record.headers = inputs.auditor.capture_headers(&head.headers);

	// URL and body limits are enforced before any upstream dial.
	if head.target.len() > inputs.cfg.server.limits.max_url_length {
		let e = ProxyError::UrlTooLong;
		let _ = client.write_all(&e.response_bytes()).await;
		emit(inputs, Handler::forward, record, start, Err(&e));
		return Flow::Close;
	}
	let (chunked, has_body) = exchange::request_framing(&head.headers);
	let declared = head
		.headers
		.get(header::CONTENT_LENGTH)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.trim().parse::<u64>().ok())
		.unwrap_or(0);
	if declared > inputs.cfg.server.limits.max_request_body_size {
		let e = ProxyError::RequestBodyTooLarge;
		let _ = client.write_all(&e.response_bytes()).await;
		emit(inputs, Handler::forward, record, start, Err(&e));
		return Flow::Close;
	}

	if crate::http::is_websocket_upgrade(&head.headers) {
		return websocket_upgrade(inputs, client, parser, head, target, path, info, record, start)
			.await;
	}

	let authorized = match authorize(inputs, &head, &info) {
		Ok(a) => a,
		Err(e) => {
			record.reason = match &e {
				ProxyError::Denied { detail, .. } => detail.clone(),
				_ => strng::new(e.to_string()),
			};
			let _ = client.write_all(&e.response_bytes()).await;
			emit(inputs, Handler::forward, record, start, Err(&e));
			return Flow::Close;
		},
	};
	record.tenant = authorized.tenant.clone();
	if let Some(rule) = &authorized.rule {
		record.rule_id = Some(rule.id.clone());
		record.reason = strng::format!("matched rule {}", rule.id);
	} else {
		record.reason = strng::literal!("default action allow");
	}

	let upstream_key = info.upstream_key();
	let mut upstream = match inputs.pool.acquire(proto, &target).await {
		Ok(u) => u,
		Err(e) => {
			inputs.breaker.record_failure(&upstream_key);
			let e = ProxyError::from(e);
			let _ = client.write_all(&e.response_bytes()).await;
			emit(inputs, Handler::forward, record, start, Err(&e));
			return Flow::Close;
		},
	};

	// Build the upstream request: hop-by-hop stripped, Host restored, client
	// address appended, rule transforms applied.
	let mut headers = head.headers.clone();
	strip_hop_by_hop(&mut headers);
	headers.insert(
		header::HOST,
		http::HeaderValue::try_from(target.key().as_str()).expect("host:port is a valid value"),
	);
	exchange::append_forwarded_for(&mut headers, info.source_ip);
	if let Some(rule) = &authorized.rule
		&& let Some(t) = &rule.request_headers
	{
		t.apply(&mut headers);
	}

	let client_keepalive = wants_keepalive(head.version, &head.headers);
	let settings = ExchangeSettings {
		response_limits: inputs.cfg.server.limits.parser_limits(),
		max_response_body: inputs.cfg.server.limits.max_response_body_size,
		response_timeout: inputs.cfg.server.timeouts.response_timeout,
	};
	let request = UpstreamRequest {
		method: head.method.clone(),
		path,
		headers,
		chunked,
		has_body,
	};
	let response_transform = authorized
		.rule
		.as_ref()
		.and_then(|r| r.response_headers.as_ref());

	match exchange::run(
		client,
		parser,
		upstream.socket_mut(),
		request,
		&settings,
		response_transform,
		client_keepalive,
	)
	.await
	{
		Ok(outcome) => {
			inputs.breaker.record_success(&upstream_key);
			finish_upstream(upstream, outcome.upstream_reusable);
			emit(
				inputs,
				Handler::forward,
				record,
				start,
				Ok((
					outcome.status.as_u16(),
					outcome.bytes_sent,
					outcome.bytes_received,
				)),
			);
			if outcome.client_keepalive {
				Flow::Continue
			} else {
				Flow::Close
			}
		},
		Err(failure) => {
			if failure.error.is_upstream_failure() {
				inputs.breaker.record_failure(&upstream_key);
			}
			upstream.discard();
			if !failure.response_started {
				let _ = client.write_all(&failure.error.response_bytes()).await;
			}
			emit(inputs, Handler::forward, record, start, Err(&failure.error));
			Flow::Close
		},
	}
}

pub(super) fn finish_upstream(upstream: PooledConn, reusable: bool) {
	if reusable {
		upstream.release();
	} else {
		upstream.discard();
	}
}

/// WebSocket upgrade: policy-check the handshake, forward it verbatim, then
/// splice the framed stream opaquely. Upgraded connections never pool.
#[allow(clippy::too_many_arguments)]
async fn websocket_upgrade(
	inputs: &Arc<ProxyInputs>,
	client: &mut Socket,
	parser: &mut RequestParser,
	head: RequestHead,
	target: HostPort,
	path: String,
	info: RequestInfo,
	mut record: AuditRecord,
	start: Instant,
) -> Flow {
	record.handler = "websocket";
	let authorized = match authorize(inputs, &head, &info) {
		Ok(a) => a,
		Err(e) => {
			record.reason = match &e {
				ProxyError::Denied { detail, .. } => detail.clone(),
				_ => strng::new(e.to_string()),
			};
			let _ = client.write_all(&e.response_bytes()).await;
			emit(inputs, Handler::websocket, record, start, Err(&e));
			return Flow::Close;
		},
	};
	record.tenant = authorized.tenant.clone();
	record.rule_id = authorized.rule.as_ref().map(|r| r.id.clone());
	record.reason = strng::literal!("websocket upgrade allowed");

	let upstream_key = info.upstream_key();
	let mut upstream = match inputs.connector.dial(&target).await {
		Ok(s) => s,
		Err(e) => {
			inputs.breaker.record_failure(&upstream_key);
			let e = ProxyError::from(e);
			let _ = client.write_all(&e.response_bytes()).await;
			emit(inputs, Handler::websocket, record, start, Err(&e));
			return Flow::Close;
		},
	};
	inputs.breaker.record_success(&upstream_key);

	// Forward the handshake as-is (upgrade headers must survive), with only
	// proxy-internal headers removed and the client address appended.
	let mut headers = head.headers.clone();
	headers.remove(header::PROXY_AUTHORIZATION);
	exchange::append_forwarded_for(&mut headers, info.source_ip);
	headers.insert(
		header::HOST,
		http::HeaderValue::try_from(target.key().as_str()).expect("host:port is a valid value"),
	);
	let handshake = crate::http::encode_request_head(&head.method, &path, &headers);
	if let Err(e) = upstream.write_all(&handshake).await {
		let e = ProxyError::UpstreamIo(e);
		let _ = client.write_all(&e.response_bytes()).await;
		emit(inputs, Handler::websocket, record, start, Err(&e));
		return Flow::Close;
	}
	// Any bytes the client sent past the handshake belong to the socket.
	let buffered = parser.take_remaining();
	if !buffered.is_empty() && upstream.write_all(&buffered).await.is_err() {
		return Flow::Close;
	}

	// From here the stream is opaque; frames are not inspected.
	let mut totals = copy::Transferred::default();
	let idle = inputs.cfg.server.timeouts.idle_timeout;
	let result = copy::splice(client, &mut upstream, idle, &mut totals).await;
	if let Err(e) = result {
		debug!("websocket tunnel closed: {e}");
	}
	emit(
		inputs,
		Handler::websocket,
		record,
		start,
		Ok((101, totals.sent, totals.received)),
	);
	Flow::Close
}
