//! Multi-tenant isolation: resolving a tenant from request shape and holding
//! per-tenant compiled policy, rate limits, and connection accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use egress_core::prelude::*;
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::policy::ratelimit::{DEFAULT_REQUESTS_PER_MINUTE, RateLimiter};
use crate::policy::{Allowlist, PolicyEngine, PolicyError};

#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum TenantError {
	#[error("tenant not identified")]
	NotIdentified,
	#[error("unknown tenant {0}")]
	Unknown(Strng),
	#[error("tenant {0} is disabled")]
	Disabled(Strng),
	#[error("tenant {0} connection limit reached")]
	ConnectionLimit(Strng),
}

/// How to pull a tenant id out of a request. Extractors can be chained; the
/// first one that yields an id wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TenantExtractor {
	/// A dedicated header carries the tenant id.
	Header { name: String },
	/// `<tenant>.<separator-rest>` in an API key header, e.g. `acme_k123`.
	ApiKeyPrefix { header: String, separator: String },
	/// `<tenant>.base.domain` in the target host.
	Subdomain { base_domain: String },
	/// `/t/<tenant>/...` as the first path segments.
	PathPrefix { prefix: String },
}

/// The request shape extractors inspect.
pub struct ExtractInput<'a> {
	pub headers: &'a HeaderMap,
	pub host: &'a str,
	pub path: Option<&'a str>,
}

impl TenantExtractor {
	pub fn extract(&self, input: &ExtractInput<'_>) -> Option<Strng> {
		match self {
			TenantExtractor::Header { name } => input
				.headers
				.get(name.as_str())
				.and_then(|v| v.to_str().ok())
				.filter(|v| !v.is_empty())
				.map(strng::new),
			TenantExtractor::ApiKeyPrefix { header, separator } => input
				.headers
				.get(header.as_str())
				.and_then(|v| v.to_str().ok())
				.and_then(|v| v.split_once(separator.as_str()))
				.map(|(tenant, _)| strng::new(tenant))
				.filter(|t| !t.is_empty()),
			TenantExtractor::Subdomain { base_domain } => {
				let suffix = format!(".{}", base_domain.to_ascii_lowercase());
				input
					.host
					.to_ascii_lowercase()
					.strip_suffix(&suffix)
					.filter(|rest| !rest.is_empty() && !rest.contains('.'))
					.map(strng::new)
			},
			TenantExtractor::PathPrefix { prefix } => {
				let path = input.path?;
				let rest = path
					.strip_prefix(prefix.as_str())
					.or_else(|| path.trim_start_matches('/').strip_prefix(prefix.trim_start_matches('/')))?;
				let rest = rest.trim_start_matches('/');
				let tenant = rest.split('/').next().unwrap_or("");
				if tenant.is_empty() {
					None
				} else {
					Some(strng::new(tenant))
				}
			},
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TenantConfig {
	pub id: String,
	#[serde(default = "crate::policy::default_enabled")]
	pub enabled: bool,
	#[serde(default)]
	pub max_connections: Option<usize>,
	pub allowlist: Allowlist,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[serde(default)]
pub struct TenancyConfig {
	pub enabled: bool,
	/// Tried in order; first extractor producing an id wins.
	pub extractors: Vec<TenantExtractor>,
	pub tenants: Vec<TenantConfig>,
}

/// Everything request handling needs for one tenant: its compiled policy
/// (atomically replaceable), its own rate limiter, and connection counters.
pub struct TenantContext {
	pub id: Strng,
	policy: ArcSwap<PolicyEngine>,
	pub limiter: RateLimiter,
	active: AtomicUsize,
	max_active: Option<usize>,
}

impl Debug for TenantContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TenantContext")
			.field("id", &self.id)
			.field("active", &self.active.load(Ordering::Relaxed))
			.finish()
	}
}

impl TenantContext {
	pub fn new(
		id: Strng,
		allowlist: &Allowlist,
		max_active: Option<usize>,
	) -> Result<TenantContext, PolicyError> {
		Ok(TenantContext {
			id,
			policy: ArcSwap::from_pointee(PolicyEngine::compile(allowlist)?),
			limiter: RateLimiter::new(DEFAULT_REQUESTS_PER_MINUTE),
			active: AtomicUsize::new(0),
			max_active,
		})
	}

	/// The current compiled policy. Readers never observe a partial tree;
	/// updates swap the whole engine.
	pub fn policy(&self) -> Arc<PolicyEngine> {
		self.policy.load_full()
	}

	/// Replaces the allowlist atomically (the external rules API calls this).
	pub fn replace_allowlist(&self, allowlist: &Allowlist) -> Result<(), PolicyError> {
		let engine = PolicyEngine::compile(allowlist)?;
		self.policy.store(Arc::new(engine));
		Ok(())
	}

	/// Claims a per-tenant connection slot; the guard releases it on drop.
	pub fn acquire_connection(self: &Arc<Self>) -> Result<TenantSlot, TenantError> {
		if let Some(max) = self.max_active {
			let mut current = self.active.load(Ordering::Relaxed);
			loop {
				if current >= max {
					return Err(TenantError::ConnectionLimit(self.id.clone()));
				}
				match self.active.compare_exchange_weak(
					current,
					current + 1,
					Ordering::AcqRel,
					Ordering::Relaxed,
				) {
					Ok(_) => break,
					Err(observed) => current = observed,
				}
			}
		} else {
			self.active.fetch_add(1, Ordering::Relaxed);
		}
		Ok(TenantSlot(self.clone()))
	}

	pub fn active_connections(&self) -> usize {
		self.active.load(Ordering::Relaxed)
	}
}

#[derive(Debug)]
pub struct TenantSlot(Arc<TenantContext>);

impl Drop for TenantSlot {
	fn drop(&mut self) {
		self.0.active.fetch_sub(1, Ordering::Relaxed);
	}
}

/// Maps tenant ids to contexts and runs the configured extractors.
pub struct TenantRegistry {
	extractors: Vec<TenantExtractor>,
	tenants: HashMap<Strng, Arc<TenantContext>>,
	disabled: HashMap<Strng, ()>,
}

impl TenantRegistry {
	pub fn new(cfg: &TenancyConfig) -> Result<TenantRegistry, PolicyError> {
		let mut tenants = HashMap::new();
		let mut disabled = HashMap::new();
		for t in &cfg.tenants {
			let id = strng::new(&t.id);
			if !t.enabled {
				disabled.insert(id, ());
				continue;
			}
			let ctx = TenantContext::new(id.clone(), &t.allowlist, t.max_connections)?;
			tenants.insert(id, Arc::new(ctx));
		}
		Ok(TenantRegistry {
			extractors: cfg.extractors.clone(),
			tenants,
			disabled,
		})
	}

	pub fn resolve(&self, input: &ExtractInput<'_>) -> Result<Arc<TenantContext>, TenantError> {
		let id = self
			.extractors
			.iter()
			.find_map(|e| e.extract(input))
			.ok_or(TenantError::NotIdentified)?;
		if self.disabled.contains_key(&id) {
			return Err(TenantError::Disabled(id));
		}
		self
			.tenants
			.get(&id)
			.cloned()
			.ok_or(TenantError::Unknown(id))
	}

	pub fn get(&self, id: &str) -> Option<Arc<TenantContext>> {
		self.tenants.get(&strng::new(id)).cloned()
	}

	/// Every enabled tenant context (for background maintenance).
	pub fn contexts(&self) -> Vec<Arc<TenantContext>> {
		self.tenants.values().cloned().collect()
	}
}

#[cfg(test)]
mod tests {
	use http::HeaderValue;

	use super::*;
	use crate::policy::{AllowlistMode, DefaultAction, Rule};

	fn allowlist(domain: &str) -> Allowlist {
		Allowlist {
			mode: AllowlistMode::Strict,
			default_action: DefaultAction::Deny,
			rules: vec![Rule {
				id: "r1".to_string(),
				domain: domain.to_string(),
				paths: Vec::new(),
				methods: Vec::new(),
				rate_limit: None,
				client_ips: Vec::new(),
				exclude_client_ips: Vec::new(),
				request_headers: None,
				response_headers: None,
				grpc: None,
				enabled: true,
			}],
		}
	}

	fn registry() -> TenantRegistry {
		TenantRegistry::new(&TenancyConfig {
			enabled: true,
			extractors: vec![
				TenantExtractor::Header {
					name: "x-tenant-id".to_string(),
				},
				TenantExtractor::Subdomain {
					base_domain: "proxy.local".to_string(),
				},
			],
			tenants: vec![
				TenantConfig {
					id: "acme".to_string(),
					enabled: true,
					max_connections: Some(2),
					allowlist: allowlist("api.example.com"),
				},
				TenantConfig {
					id: "dormant".to_string(),
					enabled: false,
					max_connections: None,
					allowlist: allowlist("api.example.com"),
				},
			],
		})
		.unwrap()
	}

	fn input<'a>(headers: &'a HeaderMap, host: &'a str) -> ExtractInput<'a> {
		ExtractInput {
			headers,
			host,
			path: None,
		}
	}

	#[test]
	fn header_extractor_wins_first() {
		let r = registry();
		let mut headers = HeaderMap::new();
		headers.insert("x-tenant-id", HeaderValue::from_static("acme"));
		let ctx = r.resolve(&input(&headers, "ignored.example.com")).unwrap();
		assert_eq!(ctx.id.as_str(), "acme");
	}

	#[test]
	fn subdomain_extractor_fallback() {
		let r = registry();
		let headers = HeaderMap::new();
		let ctx = r.resolve(&input(&headers, "acme.proxy.local")).unwrap();
		assert_eq!(ctx.id.as_str(), "acme");
	}

	#[test]
	fn unidentified_and_unknown_and_disabled() {
		let r = registry();
		let headers = HeaderMap::new();
		assert_eq!(
			r.resolve(&input(&headers, "plain.example.com")).unwrap_err(),
			TenantError::NotIdentified
		);
		let mut headers = HeaderMap::new();
		headers.insert("x-tenant-id", HeaderValue::from_static("ghost"));
		assert!(matches!(
			r.resolve(&input(&headers, "h")).unwrap_err(),
			TenantError::Unknown(_)
		));
		let mut headers = HeaderMap::new();
		headers.insert("x-tenant-id", HeaderValue::from_static("dormant"));
		assert!(matches!(
			r.resolve(&input(&headers, "h")).unwrap_err(),
			TenantError::Disabled(_)
		));
	}

	#[test]
	fn api_key_prefix_extractor() {
		let e = TenantExtractor::ApiKeyPrefix {
			header: "x-api-key".to_string(),
			separator: "_".to_string(),
		};
		let mut headers = HeaderMap::new();
		headers.insert("x-api-key", HeaderValue::from_static("acme_k123"));
		let got = e.extract(&ExtractInput {
			headers: &headers,
			host: "h",
			path: None,
		});
		assert_eq!(got.unwrap().as_str(), "acme");
	}

	#[test]
	fn path_prefix_extractor() {
		let e = TenantExtractor::PathPrefix {
			prefix: "/t".to_string(),
		};
		let headers = HeaderMap::new();
		let got = e.extract(&ExtractInput {
			headers: &headers,
			host: "h",
			path: Some("/t/acme/v1/data"),
		});
		assert_eq!(got.unwrap().as_str(), "acme");
	}

	#[test]
	fn connection_slots_enforced() {
		let r = registry();
		let ctx = r.get("acme").unwrap();
		let a = ctx.acquire_connection().unwrap();
		let _b = ctx.acquire_connection().unwrap();
		assert!(matches!(
			ctx.acquire_connection().unwrap_err(),
			TenantError::ConnectionLimit(_)
		));
		drop(a);
		assert!(ctx.acquire_connection().is_ok());
	}

	#[test]
	fn allowlist_swap_is_atomic() {
		let r = registry();
		let ctx = r.get("acme").unwrap();
		assert!(
			ctx.policy()
				.is_domain_allowed("api.example.com", "10.0.0.1".parse().unwrap())
				.allowed
		);
		ctx.replace_allowlist(&allowlist("other.example.com")).unwrap();
		assert!(
			!ctx
				.policy()
				.is_domain_allowed("api.example.com", "10.0.0.1".parse().unwrap())
				.allowed
		);
		assert!(
			ctx.policy()
				.is_domain_allowed("other.example.com", "10.0.0.1".parse().unwrap())
				.allowed
		);
	}
}
