use std::collections::VecDeque;

use egress_core::prelude::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
	Closed,
	Open,
	HalfOpen,
}

impl Display for CircuitState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			CircuitState::Closed => f.write_str("closed"),
			CircuitState::Open => f.write_str("open"),
			CircuitState::HalfOpen => f.write_str("half_open"),
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BreakerConfig {
	/// Failures within `failure_window` before the circuit opens.
	pub failure_threshold: u32,
	#[serde(with = "crate::serde_dur")]
	pub failure_window: Duration,
	/// How long an open circuit rejects before probing again.
	#[serde(with = "crate::serde_dur")]
	pub reset_timeout: Duration,
	/// Consecutive half-open successes before closing.
	pub success_threshold: u32,
	/// Concurrent probes admitted while half-open.
	pub half_open_max_concurrent: u32,
}

impl Default for BreakerConfig {
	fn default() -> Self {
		BreakerConfig {
			failure_threshold: 5,
			failure_window: Duration::from_secs(30),
			reset_timeout: Duration::from_secs(30),
			success_threshold: 2,
			half_open_max_concurrent: 1,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitDecision {
	pub allowed: bool,
	pub state: CircuitState,
}

#[derive(Debug)]
struct Entry {
	state: CircuitState,
	failures: VecDeque<Instant>,
	consecutive_successes: u32,
	opened_at: Option<Instant>,
	half_open_inflight: u32,
	last_access: Instant,
	// cumulative, for stats/metrics
	total_allowed: u64,
	total_rejected: u64,
	total_failures: u64,
}

impl Entry {
	fn new(now: Instant) -> Entry {
		Entry {
			state: CircuitState::Closed,
			failures: VecDeque::new(),
			consecutive_successes: 0,
			opened_at: None,
			half_open_inflight: 0,
			last_access: now,
			total_allowed: 0,
			total_rejected: 0,
			total_failures: 0,
		}
	}

	/// Drops failures that have aged out of the window.
	fn expire_failures(&mut self, now: Instant, window: Duration) {
		while let Some(first) = self.failures.front() {
			if now.saturating_duration_since(*first) > window {
				self.failures.pop_front();
			} else {
				break;
			}
		}
	}
}

pub type TransitionHook = Arc<dyn Fn(&Strng, CircuitState, CircuitState) + Send + Sync>;

/// Per-upstream circuit breaker, keyed by `host:port`.
///
/// CLOSED trips to OPEN once `failure_threshold` failures land inside
/// `failure_window`. OPEN rejects everything until `reset_timeout` has
/// elapsed, at which point the first caller is admitted as a HALF_OPEN probe.
/// `success_threshold` consecutive probe successes close the circuit; any
/// probe failure reopens it. No timers are scheduled; state advances lazily
/// on access.
pub struct CircuitBreaker {
	entries: flurry::HashMap<Strng, Arc<Mutex<Entry>>>,
	cfg: BreakerConfig,
	on_transition: Option<TransitionHook>,
}

impl Debug for CircuitBreaker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CircuitBreaker")
			.field("upstreams", &self.entries.len())
			.finish()
	}
}

impl CircuitBreaker {
	pub fn new(cfg: BreakerConfig) -> CircuitBreaker {
		CircuitBreaker {
			entries: flurry::HashMap::new(),
			cfg,
			on_transition: None,
		}
	}

	pub fn with_transition_hook(mut self, hook: TransitionHook) -> CircuitBreaker {
		self.on_transition = Some(hook);
		self
	}

	fn entry(&self, key: &Strng, now: Instant) -> Arc<Mutex<Entry>> {
		let guard = self.entries.guard();
		match self.entries.get(key, &guard) {
			Some(e) => e.clone(),
			None => {
				let fresh = Arc::new(Mutex::new(Entry::new(now)));
				match self.entries.try_insert(key.clone(), fresh.clone(), &guard) {
					Ok(_) => fresh,
					Err(e) => e.current.clone(),
				}
			},
		}
	}

	fn transition(&self, key: &Strng, e: &mut Entry, to: CircuitState, now: Instant) {
		let from = e.state;
		if from == to {
			return;
		}
		debug!(upstream = %key, %from, %to, "circuit transition");
		e.state = to;
		match to {
			CircuitState::Open => {
				e.opened_at = Some(now);
				e.consecutive_successes = 0;
			},
			CircuitState::HalfOpen => {
				e.consecutive_successes = 0;
			},
			CircuitState::Closed => {
				e.failures.clear();
				e.consecutive_successes = 0;
				e.opened_at = None;
			},
		}
		if let Some(hook) = &self.on_transition {
			hook(key, from, to);
		}
	}

	pub fn can_execute(&self, key: &Strng) -> CircuitDecision {
		self.can_execute_at(key, Instant::now())
	}

	fn can_execute_at(&self, key: &Strng, now: Instant) -> CircuitDecision {
		let entry = self.entry(key, now);
		let mut e = entry.lock();
		e.last_access = now;
		e.expire_failures(now, self.cfg.failure_window);
		match e.state {
			CircuitState::Closed => {
				e.total_allowed += 1;
				CircuitDecision {
					allowed: true,
					state: CircuitState::Closed,
				}
			},
			CircuitState::Open => {
				let elapsed = e
					.opened_at
					.map(|t| now.saturating_duration_since(t))
					.unwrap_or_default();
				if elapsed >= self.cfg.reset_timeout {
					self.transition(key, &mut e, CircuitState::HalfOpen, now);
					e.half_open_inflight = 1;
					e.total_allowed += 1;
					CircuitDecision {
						allowed: true,
						state: CircuitState::HalfOpen,
					}
				} else {
					e.total_rejected += 1;
					CircuitDecision {
						allowed: false,
						state: CircuitState::Open,
					}
				}
			},
			CircuitState::HalfOpen => {
				if e.half_open_inflight < self.cfg.half_open_max_concurrent {
					e.half_open_inflight += 1;
					e.total_allowed += 1;
					CircuitDecision {
						allowed: true,
						state: CircuitState::HalfOpen,
					}
				} else {
					e.total_rejected += 1;
					CircuitDecision {
						allowed: false,
						state: CircuitState::HalfOpen,
					}
				}
			},
		}
	}

	pub fn record_success(&self, key: &Strng) {
		self.record_success_at(key, Instant::now())
	}

	fn record_success_at(&self, key: &Strng, now: Instant) {
		let entry = self.entry(key, now);
		let mut e = entry.lock();
		e.last_access = now;
		match e.state {
			CircuitState::HalfOpen => {
				e.half_open_inflight = e.half_open_inflight.saturating_sub(1);
				e.consecutive_successes += 1;
				if e.consecutive_successes >= self.cfg.success_threshold {
					self.transition(key, &mut e, CircuitState::Closed, now);
				}
			},
			CircuitState::Closed => {
				e.consecutive_successes += 1;
			},
			CircuitState::Open => {},
		}
	}

	pub fn record_failure(&self, key: &Strng) {
		self.record_failure_at(key, Instant::now())
	}

	fn record_failure_at(&self, key: &Strng, now: Instant) {
		let entry = self.entry(key, now);
		let mut e = entry.lock();
		e.last_access = now;
		e.total_failures += 1;
		e.consecutive_successes = 0;
		match e.state {
			CircuitState::HalfOpen => {
				e.half_open_inflight = e.half_open_inflight.saturating_sub(1);
				self.transition(key, &mut e, CircuitState::Open, now);
			},
			CircuitState::Closed => {
				e.failures.push_back(now);
				e.expire_failures(now, self.cfg.failure_window);
				if e.failures.len() >= self.cfg.failure_threshold as usize {
					self.transition(key, &mut e, CircuitState::Open, now);
				}
			},
			CircuitState::Open => {},
		}
	}

	/// Administrative override. Clears failures, successes, and half-open
	/// probe accounting.
	pub fn force_state(&self, key: &Strng, state: CircuitState) {
		let now = Instant::now();
		let entry = self.entry(key, now);
		let mut e = entry.lock();
		self.transition(key, &mut e, state, now);
		e.half_open_inflight = 0;
	}

	pub fn state(&self, key: &Strng) -> CircuitState {
		let entry = self.entry(key, Instant::now());
		let state = entry.lock().state;
		state
	}

	/// Removes entries idle for longer than `cutoff`.
	pub fn prune_idle(&self, cutoff: Duration) -> usize {
		let now = Instant::now();
		let mut removed = 0;
		let guard = self.entries.guard();
		let stale: Vec<Strng> = self
			.entries
			.iter(&guard)
			.filter(|(_, e)| now.saturating_duration_since(e.lock().last_access) > cutoff)
			.map(|(k, _)| k.clone())
			.collect();
		for k in stale {
			if self.entries.remove(&k, &guard).is_some() {
				removed += 1;
			}
		}
		removed
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg() -> BreakerConfig {
		BreakerConfig {
			failure_threshold: 3,
			failure_window: Duration::from_secs(10),
			reset_timeout: Duration::from_secs(30),
			success_threshold: 2,
			half_open_max_concurrent: 1,
		}
	}

	fn key() -> Strng {
		strng::new("upstream.example.com:443")
	}

	#[test]
	fn opens_after_threshold_within_window() {
		let cb = CircuitBreaker::new(cfg());
		let k = key();
		let t0 = Instant::now();
		cb.record_failure_at(&k, t0);
		cb.record_failure_at(&k, t0 + Duration::from_secs(1));
		assert_eq!(cb.state(&k), CircuitState::Closed);
		cb.record_failure_at(&k, t0 + Duration::from_secs(2));
		assert_eq!(cb.state(&k), CircuitState::Open);
		assert!(!cb.can_execute_at(&k, t0 + Duration::from_secs(3)).allowed);
	}

	#[test]
	fn stale_failures_age_out() {
		let cb = CircuitBreaker::new(cfg());
		let k = key();
		let t0 = Instant::now();
		cb.record_failure_at(&k, t0);
		cb.record_failure_at(&k, t0 + Duration::from_secs(1));
		// Third failure lands after the first two left the window.
		cb.record_failure_at(&k, t0 + Duration::from_secs(30));
		assert_eq!(cb.state(&k), CircuitState::Closed);
	}

	#[test]
	fn half_open_after_reset_timeout() {
		let cb = CircuitBreaker::new(cfg());
		let k = key();
		let t0 = Instant::now();
		for i in 0..3 {
			cb.record_failure_at(&k, t0 + Duration::from_secs(i));
		}
		let d = cb.can_execute_at(&k, t0 + Duration::from_secs(5));
		assert!(!d.allowed);
		assert_eq!(d.state, CircuitState::Open);
		let d = cb.can_execute_at(&k, t0 + Duration::from_secs(40));
		assert!(d.allowed);
		assert_eq!(d.state, CircuitState::HalfOpen);
	}

	#[test]
	fn half_open_limits_concurrent_probes() {
		let cb = CircuitBreaker::new(cfg());
		let k = key();
		let t0 = Instant::now();
		for i in 0..3 {
			cb.record_failure_at(&k, t0 + Duration::from_secs(i));
		}
		let probe_at = t0 + Duration::from_secs(40);
		assert!(cb.can_execute_at(&k, probe_at).allowed);
		let second = cb.can_execute_at(&k, probe_at);
		assert!(!second.allowed);
		assert_eq!(second.state, CircuitState::HalfOpen);
		// Finishing the probe frees the slot.
		cb.record_success_at(&k, probe_at);
		assert!(cb.can_execute_at(&k, probe_at).allowed);
	}

	#[test]
	fn closes_after_success_threshold() {
		let cb = CircuitBreaker::new(cfg());
		let k = key();
		let t0 = Instant::now();
		for i in 0..3 {
			cb.record_failure_at(&k, t0 + Duration::from_secs(i));
		}
		let probe_at = t0 + Duration::from_secs(40);
		assert!(cb.can_execute_at(&k, probe_at).allowed);
		cb.record_success_at(&k, probe_at);
		assert_eq!(cb.state(&k), CircuitState::HalfOpen);
		assert!(cb.can_execute_at(&k, probe_at).allowed);
		cb.record_success_at(&k, probe_at);
		assert_eq!(cb.state(&k), CircuitState::Closed);
	}

	#[test]
	fn half_open_failure_reopens() {
		let cb = CircuitBreaker::new(cfg());
		let k = key();
		let t0 = Instant::now();
		for i in 0..3 {
			cb.record_failure_at(&k, t0 + Duration::from_secs(i));
		}
		let probe_at = t0 + Duration::from_secs(40);
		assert!(cb.can_execute_at(&k, probe_at).allowed);
		cb.record_failure_at(&k, probe_at);
		assert_eq!(cb.state(&k), CircuitState::Open);
		// The reopen resets the clock; still rejecting shortly after.
		assert!(
			!cb
				.can_execute_at(&k, probe_at + Duration::from_secs(5))
				.allowed
		);
		// And admits a new probe after another full reset timeout.
		assert!(
			cb.can_execute_at(&k, probe_at + Duration::from_secs(31))
				.allowed
		);
	}

	#[test]
	fn transition_hook_fires() {
		let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
		let hook_seen = seen.clone();
		let cb = CircuitBreaker::new(cfg()).with_transition_hook(Arc::new(move |k, from, to| {
			hook_seen.lock().push((k.clone(), from, to));
		}));
		let k = key();
		let t0 = Instant::now();
		for i in 0..3 {
			cb.record_failure_at(&k, t0 + Duration::from_secs(i));
		}
		let events = seen.lock();
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].1, CircuitState::Closed);
		assert_eq!(events[0].2, CircuitState::Open);
	}

	#[test]
	fn force_closed_clears_probe_accounting() {
		let cb = CircuitBreaker::new(cfg());
		let k = key();
		let t0 = Instant::now();
		for i in 0..3 {
			cb.record_failure_at(&k, t0 + Duration::from_secs(i));
		}
		assert!(cb.can_execute_at(&k, t0 + Duration::from_secs(40)).allowed);
		cb.force_state(&k, CircuitState::Closed);
		assert_eq!(cb.state(&k), CircuitState::Closed);
		assert!(cb.can_execute_at(&k, t0 + Duration::from_secs(41)).allowed);
	}
}
