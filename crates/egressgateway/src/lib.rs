pub mod client;
pub mod config;
pub mod grpc;
pub mod http;
pub mod policy;
pub mod proxy;
pub mod telemetry;
pub mod tenant;
pub mod tls;
pub mod transport;

use std::net::IpAddr;

use egress_core::prelude::*;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};

use crate::client::pool::{ConnectionPool, PoolConfig};
use crate::client::{Connector, ConnectorConfig};
use crate::http::HeaderMap;
use crate::http::parser::ParserLimits;
use crate::policy::Allowlist;
use crate::policy::breaker::{BreakerConfig, CircuitBreaker};
use crate::proxy::limiter::{ConnectionLimiter, LimiterConfig};
use crate::telemetry::audit::{AuditConfig, Auditor};
use crate::telemetry::metrics::{Metrics, TransitionLabels};
use crate::tenant::{ExtractInput, TenancyConfig, TenantContext, TenantError, TenantRegistry};
use crate::tls::ca::{CaConfig, CertAuthority};

/// Duration fields in config files accept human strings (`30s`, `500ms`, `2m`).
pub mod serde_dur {
	use std::time::Duration;

	use serde::de::Error;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		if d.subsec_nanos() == 0 {
			s.serialize_str(&format!("{}s", d.as_secs()))
		} else {
			s.serialize_str(&format!("{}ms", d.as_millis()))
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(d)?;
		duration_str::parse(&raw).map_err(D::Error::custom)
	}
}

/// How CONNECT requests are served.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
	/// Opaque TCP splice after the policy check.
	#[default]
	Tunnel,
	/// TLS-terminating interception under the proxy CA.
	Mitm,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[serde(default)]
pub struct Limits {
	pub max_url_length: usize,
	pub max_header_size: usize,
	pub max_request_body_size: u64,
	pub max_response_body_size: u64,
	pub max_grpc_frame_size: u32,
}

impl Default for Limits {
	fn default() -> Self {
		Limits {
			max_url_length: 8 * 1024,
			max_header_size: 64 * 1024,
			max_request_body_size: 32 * 1024 * 1024,
			max_response_body_size: 128 * 1024 * 1024,
			max_grpc_frame_size: 4 * 1024 * 1024,
		}
	}
}

impl Limits {
	pub fn parser_limits(&self) -> ParserLimits {
		ParserLimits {
			max_request_line: self.max_url_length,
			max_header_size: self.max_header_size,
			max_body_size: self.max_request_body_size,
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[serde(default)]
pub struct Timeouts {
	/// Maximum time between the first and last byte of an upstream response.
	#[serde(with = "serde_dur")]
	pub response_timeout: Duration,
	/// Tunnel/keep-alive idle teardown.
	#[serde(with = "serde_dur")]
	pub idle_timeout: Duration,
	/// Per-stream deadline ceiling for gRPC (the `grpc-timeout` header can
	/// only shorten it).
	#[serde(with = "serde_dur")]
	pub grpc_deadline: Duration,
}

impl Default for Timeouts {
	fn default() -> Self {
		Timeouts {
			response_timeout: Duration::from_secs(60),
			idle_timeout: Duration::from_secs(300),
			grpc_deadline: Duration::from_secs(60),
		}
	}
}

/// Optional proxy authentication: clients must present
/// `Proxy-Authorization: Bearer <token>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProxyAuth {
	pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[serde(default)]
pub struct ServerSettings {
	pub host: String,
	pub port: u16,
	pub mode: ProxyMode,
	/// Name surfaced in the CONNECT success `Proxy-Agent` header.
	pub proxy_agent: String,
	/// Honor the first `X-Forwarded-For` element as the client address.
	pub trust_x_forwarded_for: bool,
	pub auth: Option<ProxyAuth>,
	pub limits: Limits,
	pub timeouts: Timeouts,
	pub connector: ConnectorConfig,
	pub pool: PoolConfig,
	pub limiter: LimiterConfig,
	pub breaker: BreakerConfig,
	pub tls: CaConfig,
}

impl Default for ServerSettings {
	fn default() -> Self {
		ServerSettings {
			host: "127.0.0.1".to_string(),
			port: 8080,
			mode: ProxyMode::default(),
			proxy_agent: "egressgateway".to_string(),
			trust_x_forwarded_for: false,
			auth: None,
			limits: Limits::default(),
			timeouts: Timeouts::default(),
			connector: ConnectorConfig::default(),
			pool: PoolConfig::default(),
			limiter: LimiterConfig::default(),
			breaker: BreakerConfig::default(),
			tls: CaConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[serde(default)]
pub struct Config {
	pub server: ServerSettings,
	pub allowlist: Allowlist,
	pub tenancy: TenancyConfig,
	pub audit: AuditConfig,
}

impl Config {
	pub fn bind_addr(&self) -> String {
		format!("{}:{}", self.server.host, self.server.port)
	}
}

/// Everything the request path needs, built once at startup and shared.
pub struct ProxyInputs {
	pub cfg: Config,
	pub default_tenant: Arc<TenantContext>,
	pub tenants: Option<TenantRegistry>,
	pub breaker: CircuitBreaker,
	pub connector: Arc<Connector>,
	pub pool: Arc<ConnectionPool>,
	/// Present in MITM mode.
	pub ca: Option<Arc<CertAuthority>>,
	pub auditor: Auditor,
	pub metrics: Metrics,
	pub limiter: ConnectionLimiter,
	pub h2_sessions: proxy::grpcproxy::H2Sessions,
	pub registry: parking_lot::Mutex<Registry>,
}

impl ProxyInputs {
	pub fn new(cfg: Config) -> anyhow::Result<Arc<ProxyInputs>> {
		tls::install_provider();
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);

		let default_tenant = Arc::new(
			TenantContext::new(strng::literal!("default"), &cfg.allowlist, None)
				.context("compiling allowlist")?,
		);
		let tenants = if cfg.tenancy.enabled {
			Some(TenantRegistry::new(&cfg.tenancy).context("compiling tenant allowlists")?)
		} else {
			None
		};

		let transitions = metrics.circuit_transitions.clone();
		let breaker =
			CircuitBreaker::new(cfg.server.breaker).with_transition_hook(Arc::new(move |key, from, to| {
				trace!(upstream = %key, "circuit {from} -> {to}");
				transitions
					.get_or_create(&TransitionLabels {
						from: from.to_string(),
						to: to.to_string(),
					})
					.inc();
			}));

		let connector = Arc::new(Connector::new(cfg.server.connector.clone())?);
		let pool = Arc::new(ConnectionPool::new(connector.clone(), cfg.server.pool));

		let ca = if cfg.server.mode == ProxyMode::Mitm {
			let ca = Arc::new(CertAuthority::new(&cfg.server.tls)?);
			ca.prewarm(&cfg.server.tls.prewarm_domains);
			Some(ca)
		} else {
			None
		};

		let auditor = Auditor::new(&cfg.audit)?;
		let limiter = ConnectionLimiter::new(cfg.server.limiter);

		Ok(Arc::new(ProxyInputs {
			cfg,
			default_tenant,
			tenants,
			breaker,
			connector,
			pool,
			ca,
			auditor,
			metrics,
			limiter,
			h2_sessions: proxy::grpcproxy::H2Sessions::default(),
			registry: parking_lot::Mutex::new(registry),
		}))
	}

	/// Resolves the tenant context for a request. With tenancy disabled every
	/// request shares the default context.
	pub fn resolve_tenant(
		&self,
		headers: &HeaderMap,
		host: &str,
		path: Option<&str>,
	) -> Result<Arc<TenantContext>, TenantError> {
		match &self.tenants {
			None => Ok(self.default_tenant.clone()),
			Some(registry) => registry.resolve(&ExtractInput {
				headers,
				host,
				path,
			}),
		}
	}

	/// The effective client address: the first `X-Forwarded-For` element when
	/// trusted and present, else the socket peer.
	pub fn source_ip(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
		if !self.cfg.server.trust_x_forwarded_for {
			return peer;
		}
		headers
			.get("x-forwarded-for")
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.split(',').next())
			.and_then(|v| v.trim().parse::<IpAddr>().ok())
			.unwrap_or(peer)
	}

	/// Enforces optional proxy authentication.
	pub fn check_proxy_auth(&self, headers: &HeaderMap) -> Result<(), proxy::ProxyError> {
		let Some(auth) = &self.cfg.server.auth else {
			return Ok(());
		};
		let presented = headers
			.get(http::header::PROXY_AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.strip_prefix("Bearer "));
		match presented {
			Some(token) if token == auth.token => Ok(()),
			_ => Err(proxy::ProxyError::AuthRequired),
		}
	}
}
