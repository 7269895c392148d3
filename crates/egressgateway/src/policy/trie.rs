use std::collections::HashMap;

use egress_core::prelude::*;

/// A domain pattern attached to a rule.
///
/// * `a.b.c` matches only `a.b.c`.
/// * `*.b.c` matches `x.b.c` but not `b.c` nor `y.x.b.c`.
/// * `**.b.c` matches any depth of subdomain of `b.c`.
///
/// Matching is case-insensitive, per DNS semantics.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DomainPattern {
	Exact(Strng),
	/// Suffix after the `*.`; fires for exactly one extra label.
	Wildcard(Strng),
	/// Suffix after the `**.`; fires for one or more extra labels.
	MultiWildcard(Strng),
}

#[derive(thiserror::Error, Debug)]
pub enum InvalidPattern {
	#[error("empty domain pattern")]
	Empty,
	#[error("wildcard must be the leftmost label: {0}")]
	MisplacedWildcard(String),
	#[error("empty label in domain pattern: {0}")]
	EmptyLabel(String),
}

impl DomainPattern {
	pub fn parse(raw: &str) -> Result<DomainPattern, InvalidPattern> {
		let raw = raw.trim().to_ascii_lowercase();
		if raw.is_empty() {
			return Err(InvalidPattern::Empty);
		}
		let (kind, suffix): (fn(Strng) -> DomainPattern, &str) =
			if let Some(rest) = raw.strip_prefix("**.") {
				(DomainPattern::MultiWildcard, rest)
			} else if let Some(rest) = raw.strip_prefix("*.") {
				(DomainPattern::Wildcard, rest)
			} else {
				(DomainPattern::Exact, raw.as_str())
			};
		if suffix.is_empty() {
			return Err(InvalidPattern::Empty);
		}
		if suffix.contains('*') {
			return Err(InvalidPattern::MisplacedWildcard(raw.clone()));
		}
		if suffix.split('.').any(|l| l.is_empty()) {
			return Err(InvalidPattern::EmptyLabel(raw.clone()));
		}
		Ok(kind(strng::new(suffix)))
	}

	pub fn matches(&self, host: &str) -> bool {
		let host = host.to_ascii_lowercase();
		match self {
			DomainPattern::Exact(d) => host == d.as_str(),
			DomainPattern::Wildcard(suffix) => match host.strip_suffix(suffix.as_str()) {
				Some(rest) => {
					let Some(rest) = rest.strip_suffix('.') else {
						return false;
					};
					!rest.is_empty() && !rest.contains('.')
				},
				None => false,
			},
			DomainPattern::MultiWildcard(suffix) => match host.strip_suffix(suffix.as_str()) {
				Some(rest) => rest.ends_with('.') && rest.len() > 1,
				None => false,
			},
		}
	}

	/// Specificity for tie-breaks: exact > single-wildcard > multi-wildcard;
	/// among the same kind, the longer suffix wins.
	pub fn specificity(&self) -> (u8, usize) {
		match self {
			DomainPattern::Exact(d) => (2, d.len()),
			DomainPattern::Wildcard(s) => (1, s.len()),
			DomainPattern::MultiWildcard(s) => (0, s.len()),
		}
	}

	fn suffix(&self) -> &Strng {
		match self {
			DomainPattern::Exact(d) => d,
			DomainPattern::Wildcard(s) => s,
			DomainPattern::MultiWildcard(s) => s,
		}
	}
}

impl Display for DomainPattern {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			DomainPattern::Exact(d) => write!(f, "{d}"),
			DomainPattern::Wildcard(s) => write!(f, "*.{s}"),
			DomainPattern::MultiWildcard(s) => write!(f, "**.{s}"),
		}
	}
}

#[derive(Debug, Default)]
struct Node<T> {
	children: HashMap<Strng, Node<T>>,
	/// `*.suffix` rules anchored at this node.
	single: Vec<T>,
	/// `**.suffix` rules anchored at this node.
	multi: Vec<T>,
}

impl<T> Node<T> {
	fn new() -> Node<T> {
		Node {
			children: HashMap::new(),
			single: Vec::new(),
			multi: Vec::new(),
		}
	}
}

/// Suffix trie over reversed dot-labels (`a.b.c` is keyed as `[c, b, a]`).
///
/// Exact patterns are additionally held in a hash map so the common case is a
/// single lookup. Wildcard rules are anchored at the trie node whose path
/// equals their suffix. Lookup cost is linear in the query's label count.
#[derive(Debug)]
pub struct DomainTrie<T> {
	exact: HashMap<Strng, Vec<T>>,
	root: Node<T>,
}

impl<T> Default for DomainTrie<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> DomainTrie<T> {
	pub fn new() -> DomainTrie<T> {
		DomainTrie {
			exact: HashMap::new(),
			root: Node::new(),
		}
	}
}

impl<T: Copy> DomainTrie<T> {
	pub fn insert(&mut self, pattern: &DomainPattern, value: T) {
		match pattern {
			DomainPattern::Exact(d) => {
				self.exact.entry(d.clone()).or_default().push(value);
			},
			DomainPattern::Wildcard(_) | DomainPattern::MultiWildcard(_) => {
				let mut node = &mut self.root;
				for label in pattern.suffix().split('.').rev() {
					node = node
						.children
						.entry(strng::new(label))
						.or_insert_with(Node::new);
				}
				match pattern {
					DomainPattern::Wildcard(_) => node.single.push(value),
					DomainPattern::MultiWildcard(_) => node.multi.push(value),
					DomainPattern::Exact(_) => unreachable!(),
				}
			},
		}
	}

	/// Returns every rule whose pattern matches `host`. Ordering among the
	/// results is insertion order; callers apply their own precedence.
	pub fn find(&self, host: &str) -> Vec<T> {
		let host = host.to_ascii_lowercase();
		let mut out = Vec::new();
		if let Some(vs) = self.exact.get(host.as_str()) {
			out.extend(vs.iter().copied());
		}
		let labels: Vec<&str> = host.split('.').rev().collect();
		let mut node = &self.root;
		for (i, label) in labels.iter().enumerate() {
			let Some(next) = node.children.get(*label) else {
				break;
			};
			node = next;
			let extra = labels.len() - (i + 1);
			// Multi-wildcards fire for any positive number of extra labels;
			// single wildcards only when exactly one remains.
			if extra >= 1 {
				out.extend(node.multi.iter().copied());
			}
			if extra == 1 {
				out.extend(node.single.iter().copied());
			}
		}
		out
	}

	pub fn is_empty(&self) -> bool {
		self.exact.is_empty() && self.root.children.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn trie(patterns: &[&str]) -> DomainTrie<usize> {
		let mut t = DomainTrie::new();
		for (i, p) in patterns.iter().enumerate() {
			t.insert(&DomainPattern::parse(p).unwrap(), i);
		}
		t
	}

	#[test]
	fn exact_match() {
		let t = trie(&["api.example.com"]);
		assert_eq!(t.find("api.example.com"), vec![0]);
		assert_eq!(t.find("API.EXAMPLE.COM"), vec![0]);
		assert!(t.find("example.com").is_empty());
		assert!(t.find("www.api.example.com").is_empty());
	}

	#[test]
	fn single_wildcard_exactly_one_label() {
		let t = trie(&["*.example.com"]);
		assert_eq!(t.find("api.example.com"), vec![0]);
		assert!(t.find("example.com").is_empty());
		assert!(t.find("a.b.example.com").is_empty());
	}

	#[test]
	fn multi_wildcard_any_depth() {
		let t = trie(&["**.example.com"]);
		assert_eq!(t.find("api.example.com"), vec![0]);
		assert_eq!(t.find("a.b.c.example.com"), vec![0]);
		assert!(t.find("example.com").is_empty());
		assert!(t.find("badexample.com").is_empty());
	}

	#[test]
	fn overlapping_patterns_all_returned() {
		let t = trie(&["api.example.com", "*.example.com", "**.example.com"]);
		let mut found = t.find("api.example.com");
		found.sort();
		assert_eq!(found, vec![0, 1, 2]);
		assert_eq!(t.find("a.b.example.com"), vec![2]);
	}

	#[test]
	fn suffix_must_align_on_label_boundary() {
		let t = trie(&["*.example.com"]);
		assert!(t.find("xexample.com").is_empty());
		let t = trie(&["**.b.c"]);
		assert!(t.find("a.xb.c").is_empty());
		assert_eq!(t.find("a.b.c"), vec![0]);
	}

	#[test]
	fn parse_rejects_malformed() {
		assert!(DomainPattern::parse("").is_err());
		assert!(DomainPattern::parse("a.*.com").is_err());
		assert!(DomainPattern::parse("*.").is_err());
		assert!(DomainPattern::parse("a..com").is_err());
	}

	#[test]
	fn specificity_ordering() {
		let e = DomainPattern::parse("a.b.c").unwrap();
		let w = DomainPattern::parse("*.b.c").unwrap();
		let m = DomainPattern::parse("**.b.c").unwrap();
		assert!(e.specificity() > w.specificity());
		assert!(w.specificity() > m.specificity());
		let long = DomainPattern::parse("*.x.b.c").unwrap();
		assert!(long.specificity() > w.specificity());
	}
}
