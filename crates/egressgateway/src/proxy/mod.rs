mod exchange;
pub mod forward;
pub mod gateway;
pub mod grpcproxy;
pub mod limiter;
pub mod mitm;
pub mod tunnel;

use egress_core::prelude::*;
use http::StatusCode;

use crate::client::ClientError;
use crate::http::parser::ParseError;
use crate::http::simple_response_with;
use crate::policy::DenialReason;
use crate::telemetry::audit::Decision;
use crate::tenant::TenantError;

/// Every way a request can fail, mapped onto the wire statuses of the proxy
/// protocol. Handlers never let errors cross the connection boundary; they
/// render them here and close up.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("request not allowed: {detail}")]
	Denied {
		reason: DenialReason,
		detail: Strng,
	},
	#[error("rate limit exceeded")]
	RateLimited { retry_after_secs: u64 },
	#[error("upstream circuit open")]
	CircuitOpen,
	#[error("proxy authentication required")]
	AuthRequired,
	#[error("{0}")]
	Tenant(#[from] TenantError),
	#[error("malformed request: {0}")]
	Parse(ParseError),
	#[error("request uri too long")]
	UrlTooLong,
	#[error("request body too large")]
	RequestBodyTooLarge,
	#[error("response too large")]
	ResponseTooLarge,
	#[error("upstream connect timeout")]
	ConnectTimeout,
	#[error("upstream response timeout")]
	ResponseTimeout,
	#[error("upstream error: {0}")]
	Upstream(ClientError),
	#[error("upstream io error: {0}")]
	UpstreamIo(std::io::Error),
	#[error("client io error: {0}")]
	ClientIo(std::io::Error),
	#[error("internal error: {0}")]
	Internal(#[from] anyhow::Error),
}

impl From<ParseError> for ProxyError {
	fn from(e: ParseError) -> Self {
		match e {
			ParseError::BodyTooLarge => ProxyError::RequestBodyTooLarge,
			ParseError::RequestLineTooLong => ProxyError::UrlTooLong,
			other => ProxyError::Parse(other),
		}
	}
}

impl From<ClientError> for ProxyError {
	fn from(e: ClientError) -> Self {
		match e {
			ClientError::ConnectTimeout(_) => ProxyError::ConnectTimeout,
			other => ProxyError::Upstream(other),
		}
	}
}

impl ProxyError {
	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::Denied { .. } => StatusCode::FORBIDDEN,
			ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			ProxyError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::AuthRequired => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
			ProxyError::Tenant(TenantError::ConnectionLimit(_)) => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::Tenant(_) => StatusCode::FORBIDDEN,
			ProxyError::Parse(ParseError::HeadersTooLarge) => {
				StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
			},
			ProxyError::Parse(_) => StatusCode::BAD_REQUEST,
			ProxyError::UrlTooLong => StatusCode::URI_TOO_LONG,
			ProxyError::RequestBodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			ProxyError::ResponseTooLarge => StatusCode::BAD_GATEWAY,
			ProxyError::ConnectTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::ResponseTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
			ProxyError::UpstreamIo(_) => StatusCode::BAD_GATEWAY,
			ProxyError::ClientIo(_) => StatusCode::BAD_REQUEST,
			ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// The audit decision this failure records.
	pub fn decision(&self) -> Decision {
		match self {
			ProxyError::Denied { .. }
			| ProxyError::AuthRequired
			| ProxyError::Tenant(_)
			| ProxyError::RequestBodyTooLarge => Decision::Denied,
			ProxyError::RateLimited { .. } => Decision::RateLimited,
			ProxyError::CircuitOpen => Decision::CircuitOpen,
			_ => Decision::Error,
		}
	}

	pub fn denial_reason(&self) -> DenialReason {
		match self {
			ProxyError::Denied { reason, .. } => *reason,
			ProxyError::RateLimited { .. } => DenialReason::RateLimited,
			ProxyError::CircuitOpen => DenialReason::CircuitOpen,
			ProxyError::AuthRequired | ProxyError::Tenant(_) => DenialReason::NoMatchingRule,
			ProxyError::Parse(_) | ProxyError::UrlTooLong => DenialReason::InternalError,
			ProxyError::RequestBodyTooLarge => DenialReason::RequestTooLarge,
			ProxyError::ResponseTooLarge => DenialReason::UpstreamError,
			ProxyError::ConnectTimeout | ProxyError::ResponseTimeout => DenialReason::Timeout,
			ProxyError::Upstream(_) | ProxyError::UpstreamIo(_) => DenialReason::UpstreamError,
			ProxyError::ClientIo(_) | ProxyError::Internal(_) => DenialReason::InternalError,
		}
	}

	/// True when the failure counts against the upstream's circuit.
	pub fn is_upstream_failure(&self) -> bool {
		matches!(
			self,
			ProxyError::ConnectTimeout
				| ProxyError::ResponseTimeout
				| ProxyError::Upstream(_)
				| ProxyError::UpstreamIo(_)
				| ProxyError::ResponseTooLarge
		)
	}

	/// Serializes the protocol-appropriate HTTP/1.1 error response.
	pub fn response_bytes(&self) -> Vec<u8> {
		let status = self.status();
		let body = match self {
			ProxyError::Denied { detail, .. } => format!("Request not allowed: {detail}"),
			ProxyError::RateLimited { .. } => "Too many requests".to_string(),
			ProxyError::ResponseTooLarge => "Response too large".to_string(),
			other => other.to_string(),
		};
		let mut extra: Vec<(&str, String)> = Vec::new();
		match self {
			ProxyError::RateLimited { retry_after_secs } => {
				extra.push(("Retry-After", retry_after_secs.to_string()));
			},
			ProxyError::AuthRequired => {
				extra.push(("Proxy-Authenticate", "Bearer".to_string()));
			},
			_ => {},
		}
		simple_response_with(status, &body, &extra)
	}
}
