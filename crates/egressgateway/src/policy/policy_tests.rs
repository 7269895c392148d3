use super::*;

fn rule(id: &str, domain: &str) -> Rule {
	Rule {
		id: id.to_string(),
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
	}
}

fn engine(rules: Vec<Rule>) -> PolicyEngine {
	PolicyEngine::compile(&Allowlist {
		mode: AllowlistMode::Strict,
		default_action: DefaultAction::Deny,
		rules,
	})
	.unwrap()
}

fn request(host: &str, path: &str, method: Method) -> RequestInfo {
	RequestInfo {
		host: strng::new(host),
		port: 443,
		path: Some(path.to_string()),
		method: Some(method),
		source_ip: "10.0.0.1".parse().unwrap(),
		grpc: None,
		is_grpc: false,
	}
}

#[test]
fn strict_empty_allowlist_denies() {
	let e = engine(vec![]);
	let res = e.match_request(&request("evil.com", "/", Method::GET));
	assert!(!res.allowed);
	assert_eq!(res.denial(), DenialReason::DomainNotAllowed);
	assert_eq!(res.reason.as_str(), "domain not allowed");
}

#[test]
fn permissive_default_allow() {
	let e = PolicyEngine::compile(&Allowlist {
		mode: AllowlistMode::Permissive,
		default_action: DefaultAction::Allow,
		rules: vec![],
	})
	.unwrap();
	let res = e.match_request(&request("anything.com", "/", Method::GET));
	assert!(res.allowed);
	assert!(res.rule.is_none());
	assert!(!res.reason.is_empty());
}

#[test]
fn permissive_default_deny() {
	let e = PolicyEngine::compile(&Allowlist {
		mode: AllowlistMode::Permissive,
		default_action: DefaultAction::Deny,
		rules: vec![],
	})
	.unwrap();
	assert!(!e.match_request(&request("x.com", "/", Method::GET)).allowed);
}

#[test]
fn exact_domain_allows() {
	let e = engine(vec![rule("r1", "api.example.com")]);
	let res = e.match_request(&request("api.example.com", "/users", Method::GET));
	assert!(res.allowed);
	assert_eq!(res.rule.unwrap().id.as_str(), "r1");
	let res = e.match_request(&request("other.example.com", "/", Method::GET));
	assert!(!res.allowed);
}

#[test]
fn path_restriction() {
	let mut r = rule("r1", "api.example.com");
	r.paths = vec!["/public/**".to_string()];
	let e = engine(vec![r]);
	assert!(
		e.match_request(&request("api.example.com", "/public/data", Method::GET))
			.allowed
	);
	let res = e.match_request(&request("api.example.com", "/admin", Method::GET));
	assert!(!res.allowed);
	assert_eq!(res.denial(), DenialReason::PathNotAllowed);
}

#[test]
fn method_restriction() {
	let mut r = rule("r1", "api.example.com");
	r.methods = vec!["GET".to_string(), "HEAD".to_string()];
	let e = engine(vec![r]);
	assert!(
		e.match_request(&request("api.example.com", "/", Method::GET))
			.allowed
	);
	let res = e.match_request(&request("api.example.com", "/", Method::POST));
	assert!(!res.allowed);
	assert_eq!(res.denial(), DenialReason::MethodNotAllowed);
}

#[test]
fn ip_allow_and_exclude() {
	let mut r = rule("r1", "api.example.com");
	r.client_ips = vec!["10.0.0.0/8".to_string()];
	r.exclude_client_ips = vec!["10.9.0.0/16".to_string()];
	let e = engine(vec![r]);
	let mut req = request("api.example.com", "/", Method::GET);
	assert!(e.match_request(&req).allowed);
	req.source_ip = "10.9.1.1".parse().unwrap();
	let res = e.match_request(&req);
	assert_eq!(res.denial(), DenialReason::IpExcluded);
	req.source_ip = "192.168.0.1".parse().unwrap();
	let res = e.match_request(&req);
	assert_eq!(res.denial(), DenialReason::IpNotAllowed);
}

#[test]
fn disabled_rule_is_absent() {
	let mut r = rule("r1", "api.example.com");
	r.enabled = false;
	let e = engine(vec![r]);
	assert_eq!(e.rule_count(), 0);
	assert!(
		!e.match_request(&request("api.example.com", "/", Method::GET))
			.allowed
	);
}

#[test]
fn most_specific_domain_wins() {
	let e = engine(vec![
		rule("wild", "**.example.com"),
		rule("single", "*.example.com"),
		rule("exact", "api.example.com"),
	]);
	let res = e.match_request(&request("api.example.com", "/", Method::GET));
	assert_eq!(res.rule.unwrap().id.as_str(), "exact");
	let res = e.match_request(&request("www.example.com", "/", Method::GET));
	assert_eq!(res.rule.unwrap().id.as_str(), "single");
	let res = e.match_request(&request("a.b.example.com", "/", Method::GET));
	assert_eq!(res.rule.unwrap().id.as_str(), "wild");
}

#[test]
fn longer_path_pattern_breaks_ties() {
	let mut a = rule("a", "api.example.com");
	a.paths = vec!["/v1/**".to_string()];
	let mut b = rule("b", "api.example.com");
	b.paths = vec!["/v1/users/**".to_string()];
	let e = engine(vec![a, b]);
	let res = e.match_request(&request("api.example.com", "/v1/users/42", Method::GET));
	assert_eq!(res.rule.unwrap().id.as_str(), "b");
}

#[test]
fn rule_id_breaks_final_ties() {
	let e = engine(vec![rule("bbb", "api.example.com"), rule("aaa", "api.example.com")]);
	let res = e.match_request(&request("api.example.com", "/", Method::GET));
	assert_eq!(res.rule.unwrap().id.as_str(), "aaa");
}

#[test]
fn duplicate_rule_ids_rejected() {
	let result = PolicyEngine::compile(&Allowlist {
		mode: AllowlistMode::Strict,
		default_action: DefaultAction::Deny,
		rules: vec![rule("dup", "a.com"), rule("dup", "b.com")],
	});
	assert!(matches!(result, Err(PolicyError::DuplicateRuleId(_))));
}

#[test]
fn invalid_rule_ids_rejected() {
	for bad in ["", "has space", "way-too-long-".repeat(10).as_str(), "semi;colon"] {
		let result = PolicyEngine::compile(&Allowlist {
			mode: AllowlistMode::Strict,
			default_action: DefaultAction::Deny,
			rules: vec![rule(bad, "a.com")],
		});
		assert!(matches!(result, Err(PolicyError::InvalidRuleId(_))), "{bad:?}");
	}
}

#[test]
fn rate_limit_cap_enforced() {
	let mut r = rule("r1", "a.com");
	r.rate_limit = Some(RateLimitSpec {
		requests_per_minute: 20_000,
	});
	let result = PolicyEngine::compile(&Allowlist {
		mode: AllowlistMode::Strict,
		default_action: DefaultAction::Deny,
		rules: vec![r],
	});
	assert!(matches!(result, Err(PolicyError::RateLimitTooHigh { .. })));
}

#[test]
fn domain_only_variant_skips_path_and_method() {
	let mut r = rule("r1", "api.example.com");
	r.paths = vec!["/never-matches/**".to_string()];
	r.methods = vec!["PATCH".to_string()];
	let e = engine(vec![r]);
	let res = e.is_domain_allowed("api.example.com", "10.0.0.1".parse().unwrap());
	assert!(res.allowed);
	let res = e.is_domain_allowed("evil.com", "10.0.0.1".parse().unwrap());
	assert!(!res.allowed);
	assert_eq!(res.denial(), DenialReason::DomainNotAllowed);
}

#[test]
fn domain_only_variant_still_checks_ips() {
	let mut r = rule("r1", "api.example.com");
	r.client_ips = vec!["10.0.0.0/8".to_string()];
	let e = engine(vec![r]);
	let res = e.is_domain_allowed("api.example.com", "172.16.0.1".parse().unwrap());
	assert!(!res.allowed);
	assert_eq!(res.denial(), DenialReason::IpNotAllowed);
}

#[test]
fn grpc_restrictions() {
	let mut r = rule("r1", "grpc.example.com");
	r.grpc = Some(GrpcRestriction {
		services: vec!["pkg.*".to_string()],
		methods: Vec::new(),
		allow_reflection: false,
		allow_health: true,
	});
	let e = engine(vec![r]);
	let mut req = request("grpc.example.com", "/pkg.Svc/Method", Method::POST);
	req.is_grpc = true;
	req.grpc = Some((strng::new("pkg.Svc"), strng::new("Method")));
	assert!(e.match_request(&req).allowed);

	req.grpc = Some((strng::new("other.Svc"), strng::new("Method")));
	let res = e.match_request(&req);
	assert!(!res.allowed);
	assert_eq!(res.denial(), DenialReason::NoMatchingRule);

	// Reflection is refused unless opted in.
	req.grpc = Some((
		strng::new("grpc.reflection.v1alpha.ServerReflection"),
		strng::new("ServerReflectionInfo"),
	));
	assert!(!e.match_request(&req).allowed);

	// The standard health service rides along by default.
	req.grpc = Some((strng::new("grpc.health.v1.Health"), strng::new("Check")));
	assert!(e.match_request(&req).allowed);
}

#[test]
fn header_transform_apply() {
	let t = HeaderTransform {
		set: [("x-added".to_string(), "1".to_string())].into_iter().collect(),
		remove: vec!["x-internal".to_string()],
		rename: vec![HeaderRename {
			from: "x-old".to_string(),
			to: "x-new".to_string(),
		}],
	};
	let mut headers = HeaderMap::new();
	headers.insert("x-internal", "secret".parse().unwrap());
	headers.insert("x-old", "v".parse().unwrap());
	t.apply(&mut headers);
	assert!(!headers.contains_key("x-internal"));
	assert!(!headers.contains_key("x-old"));
	assert_eq!(headers.get("x-new").unwrap(), "v");
	assert_eq!(headers.get("x-added").unwrap(), "1");
}
