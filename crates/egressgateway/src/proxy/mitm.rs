//! TLS-terminating interception. The CONNECT is answered with a minted leaf
//! certificate; every decrypted request then runs the full policy pipeline
//! and is re-issued over a pooled upstream TLS connection.

use egress_core::prelude::*;
use http::header;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::client::pool::Protocol;
use crate::http::parser::{ParserLimits, RequestEvent, RequestParser};
use crate::http::{
	HostPort, RequestHead, connection_established, simple_response, simple_response_keepalive,
	strip_hop_by_hop, wants_keepalive,
};
use crate::policy::RequestInfo;
use crate::proxy::exchange::{self, ExchangeSettings, UpstreamRequest};
use crate::proxy::{ProxyError, forward};
use crate::telemetry::audit::{AuditRecord, Decision};
use crate::telemetry::metrics::{DecisionLabels, Handler, ReasonLabels, Verdict};
use crate::tenant::TenantContext;
use crate::transport::stream::Socket;
use crate::{ProxyInputs, tls};

/// Serves a `CONNECT` in interception mode.
pub async fn handle(inputs: Arc<ProxyInputs>, mut client: Socket, head: RequestHead, preface: Bytes) {
	let peer = client.peer_ip();
	let Some(target) = HostPort::parse(&head.target, 443) else {
		let _ = client
			.write_all(&simple_response(
				http::StatusCode::BAD_REQUEST,
				"Malformed CONNECT target",
			))
			.await;
		return;
	};
	let source_ip = inputs.source_ip(peer, &head.headers);

	// Domain-level decision before any TLS work, as in the opaque tunnel.
	let mut record = AuditRecord::new("mitm", target.host.clone(), target.port, source_ip)
		.with_trace(&head.headers);
	record.method = Some("CONNECT".to_string());

	let tenant = match connect_policy(&inputs, &head, &target, source_ip, &mut record).await {
		Ok(t) => t,
		Err(e) => {
			record.decision = e.decision();
			record.denial = Some(e.denial_reason());
			if record.reason.is_empty() {
				record.reason = strng::new(e.to_string());
			}
			inputs.auditor.emit(record);
			inputs
				.metrics
				.decisions
				.get_or_create(&DecisionLabels {
					verdict: Verdict::denied,
					handler: Handler::mitm,
				})
				.inc();
			let body = match &e {
				ProxyError::Denied { .. } => simple_response(
					e.status(),
					&format!("Domain not allowed: {}", target.host),
				),
				other => other.response_bytes(),
			};
			let _ = client.write_all(&body).await;
			let _ = client.shutdown().await;
			return;
		},
	};

	let ca = inputs.ca.as_ref().expect("mitm mode always builds a CA");
	let before = ca.minted_total();
	let minted = match ca.mint(&target.host) {
		Ok(m) => m,
		Err(e) => {
			warn!(domain = %target.host, "certificate mint failed: {e}");
			inputs.metrics.internal_errors.inc();
			record.decision = Decision::Error;
			record.reason = strng::literal!("certificate generation failed");
			inputs.auditor.emit(record);
			let _ = client
				.write_all(&simple_response(
					http::StatusCode::INTERNAL_SERVER_ERROR,
					"certificate generation failed",
				))
				.await;
			return;
		},
	};
	inputs
		.metrics
		.certificates_minted
		.inc_by(ca.minted_total() - before);

	if client
		.write_all(&connection_established(&inputs.cfg.server.proxy_agent))
		.await
		.is_err()
	{
		return;
	}
	// Bytes past the CONNECT head are the client's TLS hello.
	client.set_prefix(preface);
	let tls_client = match tls::accept(client, minted.server_config.clone()).await {
		Ok(s) => s,
		Err(e) => {
			debug!(domain = %target.host, "mitm handshake failed: {e}");
			return;
		},
	};
	// Each decrypted request writes its own audit record; the CONNECT-stage
	// record is only emitted when the CONNECT itself is refused.
	drop(record);

	serve_decrypted(inputs, tls_client, tenant, target).await
}

/// CONNECT-stage checks: proxy auth, tenant, domain-only policy.
async fn connect_policy(
	inputs: &Arc<ProxyInputs>,
	head: &RequestHead,
	target: &HostPort,
	source_ip: std::net::IpAddr,
	record: &mut AuditRecord,
) -> Result<Arc<TenantContext>, ProxyError> {
	inputs.check_proxy_auth(&head.headers)?;
	let tenant = inputs.resolve_tenant(&head.headers, &target.host, None)?;
	if tenant.id.as_str() != "default" {
		record.tenant = Some(tenant.id.clone());
	}
	let decision = tenant.policy().is_domain_allowed(&target.host, source_ip);
	record.reason = decision.reason.clone();
	record.rule_id = decision.rule.as_ref().map(|r| r.id.clone());
	if !decision.allowed {
		return Err(ProxyError::Denied {
			reason: decision.denial(),
			detail: decision.reason.clone(),
		});
	}
	Ok(tenant)
}

/// The decrypted request loop: parse, decide, forward, audit, reset.
async fn serve_decrypted(
	inputs: Arc<ProxyInputs>,
	mut client: Socket,
	tenant: Arc<TenantContext>,
	target: HostPort,
) {
	let _slot = match tenant.acquire_connection() {
		Ok(s) => s,
		Err(e) => {
			let e = ProxyError::Tenant(e);
			let _ = client.write_all(&e.response_bytes()).await;
			return;
		},
	};
	let limits = ParserLimits {
		max_request_line: inputs.cfg.server.limits.max_url_length,
		max_header_size: inputs.cfg.server.limits.max_header_size,
		max_body_size: inputs.cfg.server.limits.max_request_body_size,
	};
	let mut parser = RequestParser::new(limits);
	let idle = inputs.cfg.server.timeouts.idle_timeout;
	let mut buf = vec![0u8; 16 * 1024];

	loop {
		// Wait for the next decrypted request head.
		let head = loop {
			match parser.next_event() {
				Ok(Some(RequestEvent::HeadersComplete(h))) => break h,
				Ok(Some(_)) => continue,
				Ok(None) => {},
				Err(e) => {
					let err = ProxyError::from(e);
					let _ = client.write_all(&err.response_bytes()).await;
					audit_protocol_fault(&inputs, &target, &client, &err);
					return;
				},
			}
			let n = match tokio::time::timeout(idle, client.read(&mut buf)).await {
				Ok(Ok(n)) => n,
				Ok(Err(_)) | Err(_) => return,
			};
			if n == 0 {
				return;
			}
			parser.push(&buf[..n]);
		};
		match handle_decrypted(&inputs, &mut client, &mut parser, &tenant, &target, head).await {
			forward::Flow::Continue => parser.reset(),
			forward::Flow::Close => {
				let _ = client.shutdown().await;
				return;
			},
		}
	}
}

fn audit_protocol_fault(inputs: &ProxyInputs, target: &HostPort, client: &Socket, e: &ProxyError) {
	let mut record = AuditRecord::new("mitm", target.host.clone(), target.port, client.peer_ip());
	record.decision = e.decision();
	record.denial = Some(e.denial_reason());
	record.reason = strng::new(e.to_string());
	record.status = Some(e.status().as_u16());
	inputs.auditor.emit(record);
}

async fn handle_decrypted(
	inputs: &Arc<ProxyInputs>,
	client: &mut Socket,
	parser: &mut RequestParser,
	tenant: &Arc<TenantContext>,
	target: &HostPort,
	head: RequestHead,
) -> forward::Flow {
	let start = Instant::now();
	let source_ip = inputs.source_ip(client.peer_ip(), &head.headers);
	let path = head.target.clone();
	let info = RequestInfo {
		host: target.host.clone(),
		port: target.port,
		path: Some(path.clone()),
		method: Some(head.method.clone()),
		source_ip,
		grpc: None,
		is_grpc: false,
	};
	let mut record = AuditRecord::new("mitm", info.host.clone(), info.port, source_ip)
		.with_trace(&head.headers);
	record.method = Some(head.method.to_string());
	record.path = Some(path.clone());
	record.headers = inputs.auditor.capture_headers(&head.headers);
	if tenant.id.as_str() != "default" {
		record.tenant = Some(tenant.id.clone());
	}
	let client_keepalive = wants_keepalive(head.version, &head.headers);

	// Policy, rate limit, and circuit, in pipeline order. Denials answer on
	// the TLS stream and leave it usable for the next request.
	let decision = tenant.policy().match_request(&info);
	record.rule_id = decision.rule.as_ref().map(|r| r.id.clone());
	record.reason = decision.reason.clone();
	if !decision.allowed {
		let e = ProxyError::Denied {
			reason: decision.denial(),
			detail: decision.reason.clone(),
		};
		return deny_keepalive(inputs, client, parser, record, start, e, client_keepalive).await;
	}
	let (rule_id, rate_spec) = decision
		.rule
		.as_ref()
		.map(|r| (r.id.as_str(), r.rate_limit))
		.unwrap_or(("default", None));
	let rate = tenant.limiter.consume(rule_id, info.source_ip, rate_spec);
	if !rate.allowed {
		let e = ProxyError::RateLimited {
			retry_after_secs: rate.reset_ms.div_ceil(1000),
		};
		return deny_keepalive(inputs, client, parser, record, start, e, client_keepalive).await;
	}
	let upstream_key = info.upstream_key();
	if !inputs.breaker.can_execute(&upstream_key).allowed {
		let e = ProxyError::CircuitOpen;
		return deny_keepalive(inputs, client, parser, record, start, e, client_keepalive).await;
	}

	let mut upstream = match inputs.pool.acquire(Protocol::Https, target).await {
		Ok(u) => u,
		Err(e) => {
			inputs.breaker.record_failure(&upstream_key);
			let e = ProxyError::from(e);
			let _ = client.write_all(&e.response_bytes()).await;
			emit_mitm(inputs, record, start, Err(&e));
			return forward::Flow::Close;
		},
	};

	let (chunked, has_body) = exchange::request_framing(&head.headers);
	let mut headers = head.headers.clone();
	strip_hop_by_hop(&mut headers);
	headers.insert(
		header::HOST,
		http::HeaderValue::try_from(target.host.as_str()).expect("host is a valid header value"),
	);
	if let Some(rule) = &decision.rule
		&& let Some(t) = &rule.request_headers
	{
		t.apply(&mut headers);
	}

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
	let response_transform = decision
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
			forward::finish_upstream(upstream, outcome.upstream_reusable);
			emit_mitm(
				inputs,
				record,
				start,
				Ok((
					outcome.status.as_u16(),
					outcome.bytes_sent,
					outcome.bytes_received,
				)),
			);
			if outcome.client_keepalive {
				forward::Flow::Continue
			} else {
				forward::Flow::Close
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
			emit_mitm(inputs, record, start, Err(&failure.error));
			forward::Flow::Close
		},
	}
}

/// Answers a policy denial on the intercepted stream without closing it,
/// after draining the denied request's body so the next request parses
/// cleanly.
async fn deny_keepalive(
	inputs: &Arc<ProxyInputs>,
	client: &mut Socket,
	parser: &mut RequestParser,
	record: AuditRecord,
	start: Instant,
	e: ProxyError,
	client_keepalive: bool,
) -> forward::Flow {
	let mut extra: Vec<(&str, String)> = Vec::new();
	if let ProxyError::RateLimited { retry_after_secs } = &e {
		extra.push(("Retry-After", retry_after_secs.to_string()));
	}
	let body = format!("Request not allowed: {}", record.reason);
	let response = simple_response_keepalive(e.status(), &body, &extra);
	// The audit record is written before any chance of the socket closing.
	emit_mitm(inputs, record, start, Err(&e));
	if client.write_all(&response).await.is_err() {
		return forward::Flow::Close;
	}
	if !client_keepalive {
		return forward::Flow::Close;
	}
	if drain_body(client, parser).await.is_err() {
		return forward::Flow::Close;
	}
	forward::Flow::Continue
}

/// Consumes the remainder of the current request's body.
async fn drain_body(client: &mut Socket, parser: &mut RequestParser) -> Result<(), ProxyError> {
	let mut buf = vec![0u8; 16 * 1024];
	loop {
		match parser.next_event()? {
			Some(RequestEvent::Complete) => return Ok(()),
			Some(_) => continue,
			None => {},
		}
		if parser.is_complete() {
			return Ok(());
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
}

fn emit_mitm(
	inputs: &ProxyInputs,
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
		.get_or_create(&DecisionLabels {
			verdict,
			handler: Handler::mitm,
		})
		.inc();
	inputs.auditor.emit(record);
}
