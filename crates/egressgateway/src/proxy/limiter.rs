//! Admission control: per-client-IP and global concurrent-connection caps,
//! enforced at accept time before any bytes are read.

use std::collections::HashMap;
use std::net::IpAddr;

use egress_core::prelude::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[serde(default)]
pub struct LimiterConfig {
	pub max_connections: usize,
	pub max_connections_per_ip: usize,
}

impl Default for LimiterConfig {
	fn default() -> Self {
		LimiterConfig {
			max_connections: 4096,
			max_connections_per_ip: 256,
		}
	}
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Admission {
	Admitted,
	GlobalLimit,
	PerIpLimit,
}

#[derive(Debug, Default)]
struct Counts {
	total: usize,
	per_ip: HashMap<IpAddr, usize>,
}

/// Tracks open connections. `try_acquire` hands out a guard that releases its
/// slot on drop, so counts stay exact through every error path.
pub struct ConnectionLimiter {
	cfg: LimiterConfig,
	counts: Arc<Mutex<Counts>>,
}

impl ConnectionLimiter {
	pub fn new(cfg: LimiterConfig) -> ConnectionLimiter {
		ConnectionLimiter {
			cfg,
			counts: Arc::new(Mutex::new(Counts::default())),
		}
	}

	pub fn try_acquire(&self, ip: IpAddr) -> Result<ConnectionPermit, Admission> {
		let mut counts = self.counts.lock();
		if counts.total >= self.cfg.max_connections {
			return Err(Admission::GlobalLimit);
		}
		let per_ip = counts.per_ip.get(&ip).copied().unwrap_or(0);
		if per_ip >= self.cfg.max_connections_per_ip {
			return Err(Admission::PerIpLimit);
		}
		counts.total += 1;
		*counts.per_ip.entry(ip).or_insert(0) += 1;
		Ok(ConnectionPermit {
			ip,
			counts: self.counts.clone(),
		})
	}

	pub fn active(&self) -> usize {
		self.counts.lock().total
	}

	pub fn active_for(&self, ip: IpAddr) -> usize {
		self.counts.lock().per_ip.get(&ip).copied().unwrap_or(0)
	}
}

#[derive(Debug)]
pub struct ConnectionPermit {
	ip: IpAddr,
	counts: Arc<Mutex<Counts>>,
}

impl Drop for ConnectionPermit {
	fn drop(&mut self) {
		let mut counts = self.counts.lock();
		counts.total = counts.total.saturating_sub(1);
		if let Some(n) = counts.per_ip.get_mut(&self.ip) {
			*n = n.saturating_sub(1);
			if *n == 0 {
				counts.per_ip.remove(&self.ip);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
	const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

	#[test]
	fn per_ip_cap() {
		let l = ConnectionLimiter::new(LimiterConfig {
			max_connections: 100,
			max_connections_per_ip: 2,
		});
		let _p1 = l.try_acquire(A).unwrap();
		let _p2 = l.try_acquire(A).unwrap();
		assert_eq!(l.try_acquire(A).unwrap_err(), Admission::PerIpLimit);
		// A different client is unaffected.
		assert!(l.try_acquire(B).is_ok());
	}

	#[test]
	fn global_cap() {
		let l = ConnectionLimiter::new(LimiterConfig {
			max_connections: 2,
			max_connections_per_ip: 100,
		});
		let _p1 = l.try_acquire(A).unwrap();
		let _p2 = l.try_acquire(B).unwrap();
		assert_eq!(l.try_acquire(A).unwrap_err(), Admission::GlobalLimit);
	}

	#[test]
	fn permits_release_on_drop() {
		let l = ConnectionLimiter::new(LimiterConfig {
			max_connections: 1,
			max_connections_per_ip: 1,
		});
		let p = l.try_acquire(A).unwrap();
		assert_eq!(l.active(), 1);
		drop(p);
		assert_eq!(l.active(), 0);
		assert_eq!(l.active_for(A), 0);
		assert!(l.try_acquire(A).is_ok());
	}
}
