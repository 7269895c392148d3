//! Cheaply cloneable, immutable strings. Keys in the proxy (domains, rule ids,
//! upstream addresses) are cloned into maps, audit records, and metric labels
//! constantly; `ArcStr` makes those clones a refcount bump.

pub use arcstr::{ArcStr, format, literal};

pub type Strng = ArcStr;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}

pub const EMPTY: Strng = literal!("");

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roundtrip() {
		let s = new("example.com");
		assert_eq!(s.as_str(), "example.com");
		let s2 = s.clone();
		assert_eq!(s, s2);
	}
}
