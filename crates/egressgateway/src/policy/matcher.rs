use std::net::IpAddr;

use egress_core::prelude::*;
use ipnet::IpNet;

#[derive(thiserror::Error, Debug)]
pub enum MatcherError {
	#[error("invalid ip or cidr pattern: {0}")]
	InvalidIp(String),
	#[error("invalid path pattern: {0}")]
	InvalidPath(String),
}

/// Compiled list of bare IPs and CIDR blocks. Mixed v4/v6 lists are fine;
/// v4-mapped-v6 addresses are matched as v4.
#[derive(Debug, Clone, Default)]
pub struct IpMatcher {
	nets: Vec<IpNet>,
}

impl IpMatcher {
	pub fn compile(patterns: &[String]) -> Result<IpMatcher, MatcherError> {
		let mut nets = Vec::with_capacity(patterns.len());
		for p in patterns {
			let p = p.trim();
			let net = if p.contains('/') {
				p.parse::<IpNet>()
					.map_err(|_| MatcherError::InvalidIp(p.to_string()))?
			} else {
				let addr = p
					.parse::<IpAddr>()
					.map_err(|_| MatcherError::InvalidIp(p.to_string()))?;
				IpNet::from(canonical(addr))
			};
			nets.push(net);
		}
		Ok(IpMatcher { nets })
	}

	pub fn matches(&self, ip: IpAddr) -> bool {
		let ip = canonical(ip);
		self.nets.iter().any(|n| n.contains(&ip))
	}

	pub fn is_empty(&self) -> bool {
		self.nets.is_empty()
	}
}

fn canonical(ip: IpAddr) -> IpAddr {
	match ip {
		IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
			Some(v4) => IpAddr::V4(v4),
			None => ip,
		},
		v4 => v4,
	}
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IpVerdict {
	Allowed,
	NotInAllowList,
	Excluded,
}

/// An empty allow list defaults to allow; any hit in the exclude list
/// overrides and denies.
pub fn ip_allowed(ip: IpAddr, allow: &IpMatcher, exclude: &IpMatcher) -> IpVerdict {
	if exclude.matches(ip) {
		return IpVerdict::Excluded;
	}
	if allow.is_empty() || allow.matches(ip) {
		IpVerdict::Allowed
	} else {
		IpVerdict::NotInAllowList
	}
}

/// Glob-style path pattern, anchored at both ends.
///
/// `**` matches any number of segments, a bare or embedded `*` matches within
/// one segment, `?` matches one character. Literals compare case-sensitively.
#[derive(Debug, Clone)]
pub struct PathMatcher {
	pattern: Strng,
	segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
	/// Any number of segments, including zero.
	Globstar,
	/// A single segment matched char-wise (`*`/`?` do not cross `/`).
	Glob(String),
}

impl PathMatcher {
	pub fn compile(pattern: &str) -> Result<PathMatcher, MatcherError> {
		if pattern.is_empty() {
			return Err(MatcherError::InvalidPath(pattern.to_string()));
		}
		let segments = pattern
			.trim_matches('/')
			.split('/')
			.map(|s| {
				if s == "**" {
					Segment::Globstar
				} else {
					Segment::Glob(s.to_string())
				}
			})
			.collect();
		Ok(PathMatcher {
			pattern: strng::new(pattern),
			segments,
		})
	}

	pub fn pattern(&self) -> &Strng {
		&self.pattern
	}

	pub fn matches(&self, path: &str) -> bool {
		let path = path.split('?').next().unwrap_or(path);
		let segs: Vec<&str> = if path.trim_matches('/').is_empty() {
			Vec::new()
		} else {
			path.trim_matches('/').split('/').collect()
		};
		match_segments(&self.segments, &segs)
	}
}

fn match_segments(pat: &[Segment], segs: &[&str]) -> bool {
	match pat.first() {
		None => segs.is_empty(),
		Some(Segment::Globstar) => {
			// Zero or more segments; try every split point.
			(0..=segs.len()).any(|skip| match_segments(&pat[1..], &segs[skip..]))
		},
		Some(Segment::Glob(g)) => match segs.first() {
			Some(s) => glob_match(g.as_bytes(), s.as_bytes()) && match_segments(&pat[1..], &segs[1..]),
			None => false,
		},
	}
}

fn glob_match(pat: &[u8], text: &[u8]) -> bool {
	match pat.first() {
		None => text.is_empty(),
		Some(b'*') => (0..=text.len()).any(|skip| glob_match(&pat[1..], &text[skip..])),
		Some(b'?') => !text.is_empty() && glob_match(&pat[1..], &text[1..]),
		Some(&c) => text.first() == Some(&c) && glob_match(&pat[1..], &text[1..]),
	}
}

/// Uppercased method-set membership. An empty set matches everything.
#[derive(Debug, Clone, Default)]
pub struct MethodMatcher {
	methods: Vec<Strng>,
}

impl MethodMatcher {
	pub fn new(methods: &[String]) -> MethodMatcher {
		MethodMatcher {
			methods: methods
				.iter()
				.map(|m| strng::new(m.to_ascii_uppercase()))
				.collect(),
		}
	}

	pub fn matches(&self, method: &str) -> bool {
		if self.methods.is_empty() {
			return true;
		}
		let m = method.to_ascii_uppercase();
		self.methods.iter().any(|allowed| allowed.as_str() == m)
	}

	pub fn is_empty(&self) -> bool {
		self.methods.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ips(patterns: &[&str]) -> IpMatcher {
		IpMatcher::compile(&patterns.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
	}

	#[test]
	fn cidr_v4() {
		let m = ips(&["10.0.0.0/8", "192.168.1.5"]);
		assert!(m.matches("10.1.2.3".parse().unwrap()));
		assert!(m.matches("192.168.1.5".parse().unwrap()));
		assert!(!m.matches("192.168.1.6".parse().unwrap()));
	}

	#[test]
	fn cidr_v6_and_mapped() {
		let m = ips(&["2001:db8::/32", "10.0.0.0/8"]);
		assert!(m.matches("2001:db8::1".parse().unwrap()));
		assert!(!m.matches("2001:db9::1".parse().unwrap()));
		// v4-mapped-v6 is treated as v4
		assert!(m.matches("::ffff:10.0.0.1".parse().unwrap()));
	}

	#[test]
	fn exclusion_overrides_allow() {
		let allow = ips(&["10.0.0.0/8"]);
		let exclude = ips(&["10.5.0.0/16"]);
		assert_eq!(
			ip_allowed("10.1.1.1".parse().unwrap(), &allow, &exclude),
			IpVerdict::Allowed
		);
		assert_eq!(
			ip_allowed("10.5.1.1".parse().unwrap(), &allow, &exclude),
			IpVerdict::Excluded
		);
		assert_eq!(
			ip_allowed("11.0.0.1".parse().unwrap(), &allow, &exclude),
			IpVerdict::NotInAllowList
		);
	}

	#[test]
	fn empty_allow_defaults_to_allow() {
		let allow = IpMatcher::default();
		let exclude = ips(&["10.0.0.1"]);
		assert_eq!(
			ip_allowed("1.2.3.4".parse().unwrap(), &allow, &exclude),
			IpVerdict::Allowed
		);
		assert_eq!(
			ip_allowed("10.0.0.1".parse().unwrap(), &allow, &exclude),
			IpVerdict::Excluded
		);
	}

	#[test]
	fn invalid_patterns_rejected() {
		assert!(IpMatcher::compile(&["not-an-ip".to_string()]).is_err());
		assert!(IpMatcher::compile(&["10.0.0.0/40".to_string()]).is_err());
	}

	#[test]
	fn path_single_star_one_segment() {
		let m = PathMatcher::compile("/api/*/status").unwrap();
		assert!(m.matches("/api/v1/status"));
		assert!(!m.matches("/api/v1/extra/status"));
		assert!(!m.matches("/api/status"));
	}

	#[test]
	fn path_globstar_spans_segments() {
		let m = PathMatcher::compile("/public/**").unwrap();
		assert!(m.matches("/public"));
		assert!(m.matches("/public/a"));
		assert!(m.matches("/public/a/b/c"));
		assert!(!m.matches("/private/a"));
	}

	#[test]
	fn path_question_mark_and_case() {
		let m = PathMatcher::compile("/v?/data").unwrap();
		assert!(m.matches("/v1/data"));
		assert!(m.matches("/v2/data"));
		assert!(!m.matches("/v10/data"));
		assert!(!m.matches("/V1/data"));
	}

	#[test]
	fn path_embedded_star_stays_in_segment() {
		let m = PathMatcher::compile("/files/*.json").unwrap();
		assert!(m.matches("/files/a.json"));
		assert!(!m.matches("/files/a/b.json"));
	}

	#[test]
	fn path_query_string_ignored() {
		let m = PathMatcher::compile("/api/*").unwrap();
		assert!(m.matches("/api/users?page=2"));
	}

	#[test]
	fn methods_uppercase_membership() {
		let m = MethodMatcher::new(&["get".to_string(), "POST".to_string()]);
		assert!(m.matches("GET"));
		assert!(m.matches("get"));
		assert!(m.matches("POST"));
		assert!(!m.matches("DELETE"));
		assert!(MethodMatcher::default().matches("ANYTHING"));
	}
}
