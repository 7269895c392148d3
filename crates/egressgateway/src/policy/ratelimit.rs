use std::net::IpAddr;

use egress_core::prelude::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Per-rule limit, expressed as the config surface expresses it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitSpec {
	pub requests_per_minute: u32,
}

/// Outcome of a single token consumption. `reset_ms` is how long until one
/// token is available again; zero when the call was admitted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
	pub allowed: bool,
	pub remaining: u64,
	pub reset_ms: u64,
}

#[derive(Debug)]
struct Bucket {
	tokens: f64,
	capacity: f64,
	refill_per_sec: f64,
	last_refill: Instant,
	last_access: Instant,
}

impl Bucket {
	fn new(rpm: u32, now: Instant) -> Bucket {
		let capacity = f64::from(rpm.max(1));
		Bucket {
			tokens: capacity,
			capacity,
			refill_per_sec: capacity / 60.0,
			last_refill: now,
			last_access: now,
		}
	}

	fn consume(&mut self, now: Instant) -> RateDecision {
		let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
		self.last_refill = now;
		self.last_access = now;
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			RateDecision {
				allowed: true,
				remaining: self.tokens.floor() as u64,
				reset_ms: 0,
			}
		} else {
			RateDecision {
				allowed: false,
				remaining: 0,
				reset_ms: ((1.0 - self.tokens) / self.refill_per_sec * 1000.0).ceil() as u64,
			}
		}
	}

	/// Idle cutoff: ten full refill periods (capacity / rate).
	fn idle_deadline(&self) -> Duration {
		Duration::from_secs_f64(10.0 * self.capacity / self.refill_per_sec)
	}
}

/// Token-bucket rate limiter keyed by `(rule-id, client-ip)`.
///
/// The key table is a concurrent map so unrelated keys never contend; each
/// bucket has its own lock, which is what makes a concurrent N-caller race
/// admit exactly `min(N, remaining)` requests. Consumption never blocks;
/// callers surface `reset_ms` to the client instead of waiting.
pub struct RateLimiter {
	buckets: flurry::HashMap<Strng, Arc<Mutex<Bucket>>>,
	default_rpm: u32,
}

impl Debug for RateLimiter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RateLimiter")
			.field("keys", &self.buckets.len())
			.finish()
	}
}

pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;

impl RateLimiter {
	pub fn new(default_rpm: u32) -> RateLimiter {
		RateLimiter {
			buckets: flurry::HashMap::new(),
			default_rpm,
		}
	}

	pub fn consume(
		&self,
		rule_id: &str,
		client_ip: IpAddr,
		spec: Option<RateLimitSpec>,
	) -> RateDecision {
		self.consume_at(rule_id, client_ip, spec, Instant::now())
	}

	fn consume_at(
		&self,
		rule_id: &str,
		client_ip: IpAddr,
		spec: Option<RateLimitSpec>,
		now: Instant,
	) -> RateDecision {
		let key = strng::format!("{rule_id}:{client_ip}");
		let rpm = spec
			.map(|s| s.requests_per_minute)
			.unwrap_or(self.default_rpm);
		let guard = self.buckets.guard();
		let bucket = match self.buckets.get(&key, &guard) {
			Some(b) => b.clone(),
			None => {
				let fresh = Arc::new(Mutex::new(Bucket::new(rpm, now)));
				match self.buckets.try_insert(key, fresh.clone(), &guard) {
					Ok(_) => fresh,
					// Lost the race; use the winner's bucket.
					Err(e) => e.current.clone(),
				}
			},
		};
		drop(guard);
		let mut b = bucket.lock();
		b.consume(now)
	}

	/// Removes buckets idle longer than 10x their refill period.
	pub fn prune_idle(&self) -> usize {
		self.prune_idle_at(Instant::now())
	}

	fn prune_idle_at(&self, now: Instant) -> usize {
		let mut removed = 0;
		let guard = self.buckets.guard();
		let stale: Vec<Strng> = self
			.buckets
			.iter(&guard)
			.filter(|(_, b)| {
				let b = b.lock();
				now.saturating_duration_since(b.last_access) > b.idle_deadline()
			})
			.map(|(k, _)| k.clone())
			.collect();
		for k in stale {
			if self.buckets.remove(&k, &guard).is_some() {
				removed += 1;
			}
		}
		removed
	}

	pub fn len(&self) -> usize {
		self.buckets.len()
	}

	pub fn is_empty(&self) -> bool {
		self.buckets.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

	fn spec(rpm: u32) -> Option<RateLimitSpec> {
		Some(RateLimitSpec {
			requests_per_minute: rpm,
		})
	}

	#[test]
	fn consumes_one_token_per_call() {
		let rl = RateLimiter::new(60);
		let start = Instant::now();
		let first = rl.consume_at("r", IP, spec(2), start);
		assert!(first.allowed);
		assert_eq!(first.remaining, 1);
		let second = rl.consume_at("r", IP, spec(2), start);
		assert!(second.allowed);
		assert_eq!(second.remaining, 0);
		let third = rl.consume_at("r", IP, spec(2), start);
		assert!(!third.allowed);
		// 2/min refills a token every 30s.
		assert!(third.reset_ms > 29_000 && third.reset_ms <= 30_000);
	}

	#[test]
	fn refills_over_time() {
		let rl = RateLimiter::new(60);
		let start = Instant::now();
		assert!(rl.consume_at("r", IP, spec(1), start).allowed);
		assert!(!rl.consume_at("r", IP, spec(1), start).allowed);
		// One minute later the bucket has one token again.
		let later = start + Duration::from_secs(61);
		assert!(rl.consume_at("r", IP, spec(1), later).allowed);
	}

	#[test]
	fn keys_are_isolated() {
		let rl = RateLimiter::new(60);
		let start = Instant::now();
		let other: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
		assert!(rl.consume_at("r", IP, spec(1), start).allowed);
		assert!(!rl.consume_at("r", IP, spec(1), start).allowed);
		assert!(rl.consume_at("r", other, spec(1), start).allowed);
		assert!(rl.consume_at("other-rule", IP, spec(1), start).allowed);
	}

	#[test]
	fn unknown_rule_uses_default_bucket() {
		let rl = RateLimiter::new(2);
		let start = Instant::now();
		assert!(rl.consume_at("unknown", IP, None, start).allowed);
		assert!(rl.consume_at("unknown", IP, None, start).allowed);
		assert!(!rl.consume_at("unknown", IP, None, start).allowed);
	}

	#[test]
	fn concurrent_callers_admit_exactly_remaining() {
		let rl = Arc::new(RateLimiter::new(60));
		let start = Instant::now();
		let admitted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
		let threads: Vec<_> = (0..16)
			.map(|_| {
				let rl = rl.clone();
				let admitted = admitted.clone();
				std::thread::spawn(move || {
					if rl.consume_at("r", IP, spec(5), start).allowed {
						admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
					}
				})
			})
			.collect();
		for t in threads {
			t.join().unwrap();
		}
		assert_eq!(admitted.load(std::sync::atomic::Ordering::SeqCst), 5);
	}

	#[test]
	fn prune_removes_idle_buckets() {
		let rl = RateLimiter::new(60);
		let start = Instant::now();
		rl.consume_at("r", IP, spec(10), start);
		assert_eq!(rl.len(), 1);
		// 10 rpm -> refill period 60s -> idle cutoff 600s.
		assert_eq!(rl.prune_idle_at(start + Duration::from_secs(30)), 0);
		assert_eq!(rl.prune_idle_at(start + Duration::from_secs(3600)), 1);
		assert!(rl.is_empty());
	}
}
