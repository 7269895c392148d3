pub mod breaker;
pub mod matcher;
pub mod ratelimit;
pub mod trie;

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

use egress_core::prelude::*;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};

use crate::policy::matcher::{IpMatcher, IpVerdict, MethodMatcher, PathMatcher};
use crate::policy::ratelimit::RateLimitSpec;
use crate::policy::trie::{DomainPattern, DomainTrie};

pub(crate) fn default_enabled() -> bool {
	true
}

/// One allowlist rule, as configured. Rules are immutable once compiled;
/// updates swap the whole engine atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Rule {
	pub id: String,
	pub domain: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub paths: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub methods: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rate_limit: Option<RateLimitSpec>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub client_ips: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub exclude_client_ips: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub request_headers: Option<HeaderTransform>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response_headers: Option<HeaderTransform>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub grpc: Option<GrpcRestriction>,
	#[serde(default = "default_enabled")]
	pub enabled: bool,
}

/// Header rewrites a rule may apply to forwarded traffic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[serde(default)]
pub struct HeaderTransform {
	pub set: BTreeMap<String, String>,
	pub remove: Vec<String>,
	pub rename: Vec<HeaderRename>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HeaderRename {
	pub from: String,
	pub to: String,
}

impl HeaderTransform {
	pub fn apply(&self, headers: &mut HeaderMap) {
		for HeaderRename { from, to } in &self.rename {
			let (Ok(from), Ok(to)) = (
				HeaderName::try_from(from.as_str()),
				HeaderName::try_from(to.as_str()),
			) else {
				continue;
			};
			if let Some(v) = headers.remove(from) {
				headers.insert(to, v);
			}
		}
		for name in &self.remove {
			if let Ok(name) = HeaderName::try_from(name.as_str()) {
				headers.remove(name);
			}
		}
		for (name, value) in &self.set {
			let (Ok(name), Ok(value)) = (
				HeaderName::try_from(name.as_str()),
				HeaderValue::try_from(value.as_str()),
			) else {
				continue;
			};
			headers.insert(name, value);
		}
	}

	pub fn is_empty(&self) -> bool {
		self.set.is_empty() && self.remove.is_empty() && self.rename.is_empty()
	}
}

/// Per-rule gRPC service/method restrictions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[serde(default)]
pub struct GrpcRestriction {
	/// Service patterns: exact, `package.*`, or `**`.
	pub services: Vec<String>,
	/// Method patterns: `pkg.Service/Method` or `pkg.Service/*`.
	pub methods: Vec<String>,
	pub allow_reflection: bool,
	#[serde(default = "default_enabled")]
	pub allow_health: bool,
}

impl GrpcRestriction {
	pub fn permits(&self, service: &str, method: &str) -> bool {
		if crate::grpc::REFLECTION_SERVICES.contains(&service) {
			return self.allow_reflection;
		}
		if service == crate::grpc::HEALTH_SERVICE {
			return self.allow_health;
		}
		let service_ok = self.services.is_empty()
			|| self
				.services
				.iter()
				.any(|p| crate::grpc::service_matches(p, service));
		if !service_ok {
			return false;
		}
		self.methods.is_empty()
			|| self
				.methods
				.iter()
				.any(|p| crate::grpc::method_matches(p, service, method))
	}
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowlistMode {
	#[default]
	Strict,
	Permissive,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
	Allow,
	#[default]
	Deny,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[serde(default)]
pub struct Allowlist {
	pub mode: AllowlistMode,
	pub default_action: DefaultAction,
	pub rules: Vec<Rule>,
}

/// Machine-readable denial codes surfaced in audits and error bodies.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialReason {
	NoMatchingRule,
	DomainNotAllowed,
	PathNotAllowed,
	MethodNotAllowed,
	IpNotAllowed,
	IpExcluded,
	RateLimited,
	CircuitOpen,
	RequestTooLarge,
	Timeout,
	UpstreamError,
	InternalError,
}

impl DenialReason {
	pub fn code(&self) -> &'static str {
		match self {
			DenialReason::NoMatchingRule => "NO_MATCHING_RULE",
			DenialReason::DomainNotAllowed => "DOMAIN_NOT_ALLOWED",
			DenialReason::PathNotAllowed => "PATH_NOT_ALLOWED",
			DenialReason::MethodNotAllowed => "METHOD_NOT_ALLOWED",
			DenialReason::IpNotAllowed => "IP_NOT_ALLOWED",
			DenialReason::IpExcluded => "IP_EXCLUDED",
			DenialReason::RateLimited => "RATE_LIMITED",
			DenialReason::CircuitOpen => "CIRCUIT_OPEN",
			DenialReason::RequestTooLarge => "REQUEST_TOO_LARGE",
			DenialReason::Timeout => "TIMEOUT",
			DenialReason::UpstreamError => "UPSTREAM_ERROR",
			DenialReason::InternalError => "INTERNAL_ERROR",
		}
	}

	/// The human phrasing used in client-facing bodies.
	pub fn message(&self) -> &'static str {
		match self {
			DenialReason::NoMatchingRule => "no matching rule",
			DenialReason::DomainNotAllowed => "domain not allowed",
			DenialReason::PathNotAllowed => "path not allowed",
			DenialReason::MethodNotAllowed => "method not allowed",
			DenialReason::IpNotAllowed => "client ip not allowed",
			DenialReason::IpExcluded => "client ip excluded",
			DenialReason::RateLimited => "rate limit exceeded",
			DenialReason::CircuitOpen => "upstream circuit open",
			DenialReason::RequestTooLarge => "request too large",
			DenialReason::Timeout => "upstream timeout",
			DenialReason::UpstreamError => "upstream error",
			DenialReason::InternalError => "internal error",
		}
	}
}

impl Display for DenialReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.code())
	}
}

/// The normalized request descriptor the decision engine consumes.
#[derive(Debug, Clone)]
pub struct RequestInfo {
	/// Lowercased, no port.
	pub host: Strng,
	pub port: u16,
	/// Absent for CONNECT.
	pub path: Option<String>,
	pub method: Option<Method>,
	pub source_ip: IpAddr,
	/// `(service, method)` when `is_grpc`.
	pub grpc: Option<(Strng, Strng)>,
	pub is_grpc: bool,
}

impl RequestInfo {
	pub fn upstream_key(&self) -> Strng {
		strng::format!("{}:{}", self.host, self.port)
	}
}

/// The engine's verdict. A reason is always present, even on allow.
#[derive(Debug, Clone)]
pub struct MatchResult {
	pub allowed: bool,
	pub rule: Option<Arc<CompiledRule>>,
	pub reason: Strng,
	pub denial: Option<DenialReason>,
}

impl MatchResult {
	fn allow(rule: Arc<CompiledRule>) -> MatchResult {
		let reason = strng::format!("matched rule {}", rule.id);
		MatchResult {
			allowed: true,
			rule: Some(rule),
			reason,
			denial: None,
		}
	}

	fn deny(denial: DenialReason) -> MatchResult {
		MatchResult {
			allowed: false,
			rule: None,
			reason: strng::new(denial.message()),
			denial: Some(denial),
		}
	}

	pub fn denial(&self) -> DenialReason {
		self.denial.unwrap_or(DenialReason::InternalError)
	}
}

#[derive(Debug)]
pub struct CompiledRule {
	pub id: Strng,
	pub domain: DomainPattern,
	paths: Vec<PathMatcher>,
	methods: MethodMatcher,
	client_ips: IpMatcher,
	exclude_client_ips: IpMatcher,
	pub rate_limit: Option<RateLimitSpec>,
	pub request_headers: Option<HeaderTransform>,
	pub response_headers: Option<HeaderTransform>,
	pub grpc: Option<GrpcRestriction>,
}

#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
	#[error("invalid rule id {0:?}: must be 1-64 chars of [A-Za-z0-9_-]")]
	InvalidRuleId(String),
	#[error("duplicate rule id {0:?}")]
	DuplicateRuleId(String),
	#[error("rule {id}: rate limit {rpm} exceeds the 10000/min cap")]
	RateLimitTooHigh { id: String, rpm: u32 },
	#[error("rule {0}: {1}")]
	Domain(String, trie::InvalidPattern),
	#[error("rule {0}: {1}")]
	Matcher(String, matcher::MatcherError),
}

fn valid_rule_id(id: &str) -> bool {
	!id.is_empty()
		&& id.len() <= 64
		&& id
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// How far a candidate rule got before a predicate rejected it; the furthest
/// stage across candidates picks the most specific denial reason.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
enum FailStage {
	Method,
	Path,
	IpNotAllowed,
	IpExcluded,
	Grpc,
}

impl FailStage {
	fn reason(self) -> DenialReason {
		match self {
			FailStage::Method => DenialReason::MethodNotAllowed,
			FailStage::Path => DenialReason::PathNotAllowed,
			FailStage::IpNotAllowed => DenialReason::IpNotAllowed,
			FailStage::IpExcluded => DenialReason::IpExcluded,
			FailStage::Grpc => DenialReason::NoMatchingRule,
		}
	}
}

/// The compiled allowlist: domain trie plus per-rule predicate matchers.
/// Read-only once built; updates replace the engine wholesale.
#[derive(Debug)]
pub struct PolicyEngine {
	trie: DomainTrie<usize>,
	rules: Vec<Arc<CompiledRule>>,
	mode: AllowlistMode,
	default_action: DefaultAction,
}

impl PolicyEngine {
	pub fn compile(allowlist: &Allowlist) -> Result<PolicyEngine, PolicyError> {
		let mut trie = DomainTrie::new();
		let mut rules = Vec::new();
		let mut seen: HashSet<&str> = HashSet::new();
		for rule in &allowlist.rules {
			if !valid_rule_id(&rule.id) {
				return Err(PolicyError::InvalidRuleId(rule.id.clone()));
			}
			if !seen.insert(rule.id.as_str()) {
				return Err(PolicyError::DuplicateRuleId(rule.id.clone()));
			}
			if let Some(rl) = &rule.rate_limit
				&& rl.requests_per_minute > 10_000
			{
				return Err(PolicyError::RateLimitTooHigh {
					id: rule.id.clone(),
					rpm: rl.requests_per_minute,
				});
			}
			// Disabled rules are absent from the decision tree entirely.
			if !rule.enabled {
				continue;
			}
			let domain = DomainPattern::parse(&rule.domain)
				.map_err(|e| PolicyError::Domain(rule.id.clone(), e))?;
			let paths = rule
				.paths
				.iter()
				.map(|p| PathMatcher::compile(p))
				.collect::<Result<Vec<_>, _>>()
				.map_err(|e| PolicyError::Matcher(rule.id.clone(), e))?;
			let client_ips = IpMatcher::compile(&rule.client_ips)
				.map_err(|e| PolicyError::Matcher(rule.id.clone(), e))?;
			let exclude_client_ips = IpMatcher::compile(&rule.exclude_client_ips)
				.map_err(|e| PolicyError::Matcher(rule.id.clone(), e))?;
			let compiled = Arc::new(CompiledRule {
				id: strng::new(&rule.id),
				domain,
				paths,
				methods: MethodMatcher::new(&rule.methods),
				client_ips,
				exclude_client_ips,
				rate_limit: rule.rate_limit,
				request_headers: rule.request_headers.clone(),
				response_headers: rule.response_headers.clone(),
				grpc: rule.grpc.clone(),
			});
			trie.insert(&compiled.domain, rules.len());
			rules.push(compiled);
		}
		Ok(PolicyEngine {
			trie,
			rules,
			mode: allowlist.mode,
			default_action: allowlist.default_action,
		})
	}

	/// The verdict when no rule decides: strict mode always denies; in
	/// permissive mode the configured default action wins.
	fn default_verdict(&self, denial: DenialReason) -> MatchResult {
		let allowed = self.mode == AllowlistMode::Permissive && self.default_action == DefaultAction::Allow;
		if allowed {
			MatchResult {
				allowed: true,
				rule: None,
				reason: strng::literal!("no matching rule; default action allow"),
				denial: None,
			}
		} else {
			MatchResult::deny(denial)
		}
	}

	/// Full decision: domain, then per-rule method/path/client-ip/gRPC
	/// predicates, then specificity tie-break.
	pub fn match_request(&self, req: &RequestInfo) -> MatchResult {
		let candidates = self.trie.find(&req.host);
		if candidates.is_empty() {
			return self.default_verdict(DenialReason::DomainNotAllowed);
		}
		let mut survivors: Vec<&Arc<CompiledRule>> = Vec::new();
		let mut furthest: Option<FailStage> = None;
		for idx in candidates {
			let rule = &self.rules[idx];
			match self.filter(rule, req) {
				Ok(()) => survivors.push(rule),
				Err(stage) => furthest = furthest.max(Some(stage)),
			}
		}
		let Some(best) = self.tie_break(&survivors, req) else {
			return match furthest {
				Some(stage) => MatchResult::deny(stage.reason()),
				None => self.default_verdict(DenialReason::NoMatchingRule),
			};
		};
		MatchResult::allow(best.clone())
	}

	/// Domain-only decision for opaque tunnels: path/method predicates are
	/// skipped (CONNECT has neither), client-ip predicates still apply.
	pub fn is_domain_allowed(&self, host: &str, source_ip: IpAddr) -> MatchResult {
		let candidates = self.trie.find(host);
		if candidates.is_empty() {
			return self.default_verdict(DenialReason::DomainNotAllowed);
		}
		let mut survivors: Vec<&Arc<CompiledRule>> = Vec::new();
		let mut furthest: Option<FailStage> = None;
		for idx in candidates {
			let rule = &self.rules[idx];
			match matcher::ip_allowed(source_ip, &rule.client_ips, &rule.exclude_client_ips) {
				IpVerdict::Allowed => survivors.push(rule),
				IpVerdict::NotInAllowList => furthest = furthest.max(Some(FailStage::IpNotAllowed)),
				IpVerdict::Excluded => furthest = furthest.max(Some(FailStage::IpExcluded)),
			}
		}
		let Some(best) = self.tie_break(&survivors, &RequestInfo {
			host: strng::new(host),
			port: 0,
			path: None,
			method: None,
			source_ip,
			grpc: None,
			is_grpc: false,
		}) else {
			return match furthest {
				Some(stage) => MatchResult::deny(stage.reason()),
				None => self.default_verdict(DenialReason::DomainNotAllowed),
			};
		};
		MatchResult::allow(best.clone())
	}

	fn filter(&self, rule: &CompiledRule, req: &RequestInfo) -> Result<(), FailStage> {
		if let Some(method) = &req.method
			&& !rule.methods.matches(method.as_str())
		{
			return Err(FailStage::Method);
		}
		if !rule.paths.is_empty() {
			let path = req.path.as_deref().unwrap_or("/");
			if !rule.paths.iter().any(|p| p.matches(path)) {
				return Err(FailStage::Path);
			}
		}
		match matcher::ip_allowed(req.source_ip, &rule.client_ips, &rule.exclude_client_ips) {
			IpVerdict::Allowed => {},
			IpVerdict::NotInAllowList => return Err(FailStage::IpNotAllowed),
			IpVerdict::Excluded => return Err(FailStage::IpExcluded),
		}
		if req.is_grpc
			&& let Some(restriction) = &rule.grpc
		{
			let (service, method) = req
				.grpc
				.as_ref()
				.map(|(s, m)| (s.as_str(), m.as_str()))
				.unwrap_or(("", ""));
			if !restriction.permits(service, method) {
				return Err(FailStage::Grpc);
			}
		}
		Ok(())
	}

	/// Most specific domain first (exact > `*.` > `**.`, longer suffix wins),
	/// then the longest matching path pattern, then rule id, ascending.
	fn tie_break<'a>(
		&self,
		survivors: &[&'a Arc<CompiledRule>],
		req: &RequestInfo,
	) -> Option<&'a Arc<CompiledRule>> {
		survivors
			.iter()
			.max_by_key(|r| {
				let path_len = req
					.path
					.as_deref()
					.map(|path| {
						r.paths
							.iter()
							.filter(|p| p.matches(path))
							.map(|p| p.pattern().len())
							.max()
							.unwrap_or(0)
					})
					.unwrap_or(0);
				(
					r.domain.specificity(),
					path_len,
					std::cmp::Reverse(r.id.clone()),
				)
			})
			.copied()
	}

	pub fn rule_count(&self) -> usize {
		self.rules.len()
	}
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;
