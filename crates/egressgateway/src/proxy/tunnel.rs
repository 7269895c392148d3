//! Opaque CONNECT tunneling: domain-level policy, then a raw byte splice.

use egress_core::copy;
use egress_core::prelude::*;
use tokio::io::AsyncWriteExt;

use crate::http::{HostPort, RequestHead, connection_established, simple_response, simple_response_with};
use crate::policy::RequestInfo;
use crate::proxy::ProxyError;
use crate::telemetry::audit::{AuditRecord, Decision};
use crate::telemetry::metrics::{DecisionLabels, Handler, Verdict};
use crate::transport::stream::Socket;
use crate::{ProxyInputs, http};

/// Serves one `CONNECT host:port` request as an opaque tunnel. `preface`
/// carries any client bytes buffered past the CONNECT head (typically the
/// start of the TLS handshake), which are flushed to the upstream first.
pub async fn handle(
	inputs: Arc<ProxyInputs>,
	mut client: Socket,
	head: RequestHead,
	preface: Bytes,
) {
	let start = Instant::now();
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
	let info = RequestInfo {
		host: target.host.clone(),
		port: target.port,
		path: None,
		method: None,
		source_ip,
		grpc: None,
		is_grpc: false,
	};
	let mut record = AuditRecord::new("tunnel", info.host.clone(), info.port, source_ip)
		.with_trace(&head.headers);
	record.method = Some("CONNECT".to_string());

	match establish(&inputs, &mut client, &head, &target, &info, &mut record, preface).await {
		Ok((upstream, slot)) => {
			inputs
				.metrics
				.decisions
				.get_or_create(&DecisionLabels {
					verdict: Verdict::allowed,
					handler: Handler::tunnel,
				})
				.inc();
			splice_and_audit(inputs, client, upstream, record, start).await;
			drop(slot);
		},
		Err(e) => {
			let verdict = match e.decision() {
				Decision::Denied => Verdict::denied,
				Decision::RateLimited => Verdict::rate_limited,
				Decision::CircuitOpen => Verdict::circuit_open,
				_ => Verdict::error,
			};
			inputs
				.metrics
				.decisions
				.get_or_create(&DecisionLabels {
					verdict,
					handler: Handler::tunnel,
				})
				.inc();
			record.decision = e.decision();
			record.denial = Some(e.denial_reason());
			if record.reason.is_empty() {
				record.reason = strng::new(e.to_string());
			}
			record.duration_ms = start.elapsed().as_millis() as u64;
			// The audit record lands before the socket closes.
			inputs.auditor.emit(record);
			inputs
				.metrics
				.denials
				.get_or_create(&crate::telemetry::metrics::ReasonLabels {
					reason: e.denial_reason().code().to_string(),
				})
				.inc();
			let body = match &e {
				ProxyError::Denied { .. } => {
					simple_response(e.status(), &format!("Domain not allowed: {}", info.host))
				},
				ProxyError::RateLimited { retry_after_secs } => simple_response_with(
					e.status(),
					"Too many requests",
					&[("Retry-After", retry_after_secs.to_string())],
				),
				other => other.response_bytes(),
			};
			let _ = client.write_all(&body).await;
			let _ = client.shutdown().await;
		},
	}
}

/// Runs the policy pipeline and dials the upstream.
async fn establish(
	inputs: &Arc<ProxyInputs>,
	client: &mut Socket,
	head: &RequestHead,
	target: &HostPort,
	info: &RequestInfo,
	record: &mut AuditRecord,
	preface: Bytes,
) -> Result<(Socket, crate::tenant::TenantSlot), ProxyError> {
	inputs.check_proxy_auth(&head.headers)?;
	let tenant = inputs.resolve_tenant(&head.headers, &info.host, None)?;
	if tenant.id.as_str() != "default" {
		record.tenant = Some(tenant.id.clone());
	}
	let slot = tenant.acquire_connection()?;

	let decision = tenant.policy().is_domain_allowed(&info.host, info.source_ip);
	record.reason = decision.reason.clone();
	record.rule_id = decision.rule.as_ref().map(|r| r.id.clone());
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

	let upstream_key = info.upstream_key();
	if !inputs.breaker.can_execute(&upstream_key).allowed {
		return Err(ProxyError::CircuitOpen);
	}

	let mut upstream = match inputs.connector.dial(target).await {
		Ok(s) => s,
		Err(e) => {
			inputs.breaker.record_failure(&upstream_key);
			return Err(e.into());
		},
	};
	inputs.breaker.record_success(&upstream_key);

	client
		.write_all(&connection_established(&inputs.cfg.server.proxy_agent))
		.await
		.map_err(ProxyError::ClientIo)?;
	if !preface.is_empty() {
		upstream
			.write_all(&preface)
			.await
			.map_err(ProxyError::UpstreamIo)?;
	}
	Ok((upstream, slot))
}

async fn splice_and_audit(
	inputs: Arc<ProxyInputs>,
	mut client: Socket,
	mut upstream: Socket,
	mut record: AuditRecord,
	start: Instant,
) {
	let idle = inputs.cfg.server.timeouts.idle_timeout;
	let mut totals = copy::Transferred::default();
	let result = copy::splice(&mut client, &mut upstream, idle, &mut totals).await;
	record.decision = Decision::Allowed;
	record.duration_ms = start.elapsed().as_millis() as u64;
	record.bytes_sent = totals.sent;
	record.bytes_received = totals.received;
	inputs.metrics.bytes_sent.inc_by(totals.sent);
	inputs.metrics.bytes_received.inc_by(totals.received);
	if let Err(e) = result {
		debug!("tunnel closed: {e}");
	}
	inputs.auditor.emit(record);
}
