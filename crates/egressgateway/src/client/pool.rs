//! Keep-alive pooling of upstream connections.
//!
//! Two sub-pools (HTTP and HTTPS) hold idle sockets keyed by `host:port`.
//! Idle sockets count toward the per-host and total caps, so the global
//! invariant "total upstream sockets never exceeds the cap" holds whether a
//! socket is checked out or parked. Callers at capacity wait for a slot; a
//! release or discard wakes exactly one waiter.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use egress_core::prelude::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::client::{ClientError, Connector};
use crate::http::HostPort;
use crate::transport::stream::Socket;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Http,
	Https,
}

impl Display for Protocol {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Protocol::Http => f.write_str("http"),
			Protocol::Https => f.write_str("https"),
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[serde(default)]
pub struct PoolConfig {
	pub max_sockets_per_host: usize,
	pub max_free_sockets_per_host: usize,
	pub max_total_sockets: usize,
	/// Idle sockets are closed after this long parked.
	#[serde(with = "crate::serde_dur")]
	pub free_socket_timeout: Duration,
	/// Pooled sockets are closed this long after their last use.
	#[serde(with = "crate::serde_dur")]
	pub keepalive_timeout: Duration,
	pub scheduling: Scheduling,
}

impl Default for PoolConfig {
	fn default() -> Self {
		PoolConfig {
			max_sockets_per_host: 32,
			max_free_sockets_per_host: 8,
			max_total_sockets: 512,
			free_socket_timeout: Duration::from_secs(30),
			keepalive_timeout: Duration::from_secs(60),
			scheduling: Scheduling::Lifo,
		}
	}
}

/// LIFO hands out the hottest socket first (default); FIFO rotates.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheduling {
	Lifo,
	Fifo,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct PoolSnapshot {
	pub created: u64,
	pub reused: u64,
	pub active: usize,
	pub free: usize,
	pub pending: u64,
}

#[derive(Debug)]
struct Idle {
	socket: Socket,
	idle_since: Instant,
	last_used: Instant,
}

#[derive(Debug, Default)]
struct State {
	idle: HashMap<Strng, VecDeque<Idle>>,
	per_host: HashMap<Strng, usize>,
	total: usize,
}

impl State {
	fn forget(&mut self, key: &Strng) {
		self.total = self.total.saturating_sub(1);
		if let Some(n) = self.per_host.get_mut(key) {
			*n = n.saturating_sub(1);
			if *n == 0 {
				self.per_host.remove(key);
			}
		}
	}
}

#[derive(Debug)]
struct Shared {
	cfg: PoolConfig,
	state: Mutex<State>,
	notify: Notify,
	created: AtomicU64,
	reused: AtomicU64,
	pending: AtomicU64,
}

impl Shared {
	fn new(cfg: PoolConfig) -> Arc<Shared> {
		Arc::new(Shared {
			cfg,
			state: Mutex::new(State::default()),
			notify: Notify::new(),
			created: AtomicU64::new(0),
			reused: AtomicU64::new(0),
			pending: AtomicU64::new(0),
		})
	}

	/// Pops a fresh idle socket, dropping any that sat too long.
	fn try_reuse(&self, key: &Strng) -> Option<Idle> {
		let mut state = self.state.lock();
		loop {
			let popped = state.idle.get_mut(key).and_then(|q| q.pop_front());
			let Some(idle) = popped else {
				state.idle.remove(key);
				return None;
			};
			let stale = idle.idle_since.elapsed() > self.cfg.free_socket_timeout
				|| idle.last_used.elapsed() > self.cfg.keepalive_timeout;
			if stale {
				state.forget(key);
				self.notify.notify_one();
				continue;
			}
			if state.idle.get(key).is_some_and(|q| q.is_empty()) {
				state.idle.remove(key);
			}
			return Some(idle);
		}
	}

	/// Reserves a slot for a new dial if the caps allow it.
	fn try_reserve(&self, key: &Strng) -> bool {
		let mut state = self.state.lock();
		let host = state.per_host.get(key).copied().unwrap_or(0);
		if host >= self.cfg.max_sockets_per_host || state.total >= self.cfg.max_total_sockets {
			return false;
		}
		*state.per_host.entry(key.clone()).or_insert(0) += 1;
		state.total += 1;
		true
	}

	fn unreserve(&self, key: &Strng) {
		self.state.lock().forget(key);
		self.notify.notify_one();
	}

	fn park(&self, key: &Strng, socket: Socket) {
		let mut state = self.state.lock();
		let parked = state.idle.get(key).map(|q| q.len()).unwrap_or(0);
		if parked >= self.cfg.max_free_sockets_per_host {
			state.forget(key);
			self.notify.notify_one();
			return;
		}
		let queue = state.idle.entry(key.clone()).or_default();
		let idle = Idle {
			socket,
			idle_since: Instant::now(),
			last_used: Instant::now(),
		};
		match self.cfg.scheduling {
			Scheduling::Lifo => queue.push_front(idle),
			Scheduling::Fifo => queue.push_back(idle),
		}
		drop(state);
		// A capacity waiter can take the parked socket.
		self.notify.notify_one();
	}

	fn reap(&self) -> usize {
		let mut state = self.state.lock();
		let mut reaped = 0;
		let keys: Vec<Strng> = state.idle.keys().cloned().collect();
		for key in keys {
			let Some(queue) = state.idle.get_mut(&key) else {
				continue;
			};
			let cfg = self.cfg;
			let before = queue.len();
			queue.retain(|idle| {
				idle.idle_since.elapsed() <= cfg.free_socket_timeout
					&& idle.last_used.elapsed() <= cfg.keepalive_timeout
			});
			let dropped = before - queue.len();
			if queue.is_empty() {
				state.idle.remove(&key);
			}
			for _ in 0..dropped {
				state.forget(&key);
				self.notify.notify_one();
			}
			reaped += dropped;
		}
		reaped
	}

	fn snapshot(&self) -> PoolSnapshot {
		let state = self.state.lock();
		let free = state.idle.values().map(|q| q.len()).sum();
		PoolSnapshot {
			created: self.created.load(Ordering::Relaxed),
			reused: self.reused.load(Ordering::Relaxed),
			active: state.total.saturating_sub(free),
			free,
			pending: self.pending.load(Ordering::Relaxed),
		}
	}
}

/// A checked-out upstream connection. Dropping it releases the slot and
/// destroys the socket; call [`PooledConn::release`] to park it for reuse.
#[derive(Debug)]
pub struct PooledConn {
	pub socket: Option<Socket>,
	key: Strng,
	reused: bool,
	shared: Arc<Shared>,
}

impl PooledConn {
	pub fn reused(&self) -> bool {
		self.reused
	}

	pub fn socket_mut(&mut self) -> &mut Socket {
		self.socket.as_mut().expect("socket present until released")
	}

	/// Parks the socket for keep-alive reuse.
	pub fn release(mut self) {
		if let Some(socket) = self.socket.take() {
			self.shared.park(&self.key, socket);
		}
	}

	/// Destroys the socket. Half-consumed connections must not be reused.
	pub fn discard(self) {
		drop(self)
	}
}

impl Drop for PooledConn {
	fn drop(&mut self) {
		if self.socket.take().is_some() {
			self.shared.unreserve(&self.key);
		}
	}
}

/// The two keep-alive sub-pools, sharing one connector.
pub struct ConnectionPool {
	connector: Arc<Connector>,
	http: Arc<Shared>,
	https: Arc<Shared>,
}

impl ConnectionPool {
	pub fn new(connector: Arc<Connector>, cfg: PoolConfig) -> ConnectionPool {
		ConnectionPool {
			connector,
			http: Shared::new(cfg),
			https: Shared::new(cfg),
		}
	}

	fn shared(&self, proto: Protocol) -> &Arc<Shared> {
		match proto {
			Protocol::Http => &self.http,
			Protocol::Https => &self.https,
		}
	}

	/// Borrows a connection to `target`: an idle pooled socket when one is
	/// fresh, otherwise a new dial. At capacity, waits up to the connect
	/// timeout for a slot before failing.
	pub async fn acquire(
		&self,
		proto: Protocol,
		target: &HostPort,
	) -> Result<PooledConn, ClientError> {
		let shared = self.shared(proto).clone();
		let key = target.key();
		loop {
			if let Some(idle) = shared.try_reuse(&key) {
				shared.reused.fetch_add(1, Ordering::Relaxed);
				trace!(target = %key, %proto, "reusing pooled connection");
				return Ok(PooledConn {
					socket: Some(idle.socket),
					key,
					reused: true,
					shared,
				});
			}
			if shared.try_reserve(&key) {
				break;
			}
			shared.pending.fetch_add(1, Ordering::Relaxed);
			let waited =
				tokio::time::timeout(self.connector.connect_timeout(), shared.notify.notified()).await;
			shared.pending.fetch_sub(1, Ordering::Relaxed);
			if waited.is_err() {
				return Err(ClientError::PoolExhausted(key));
			}
		}
		let dialed = match proto {
			Protocol::Http => self.connector.dial(target).await,
			Protocol::Https => self.connector.dial_tls(target).await,
		};
		match dialed {
			Ok(socket) => {
				shared.created.fetch_add(1, Ordering::Relaxed);
				debug!(target = %key, %proto, "dialed upstream connection");
				Ok(PooledConn {
					socket: Some(socket),
					key,
					reused: false,
					shared,
				})
			},
			Err(e) => {
				shared.unreserve(&key);
				Err(e)
			},
		}
	}

	pub fn stats(&self, proto: Protocol) -> PoolSnapshot {
		self.shared(proto).snapshot()
	}

	/// Closes idle sockets past their deadlines. Returns sockets reaped.
	pub fn reap_idle(&self) -> usize {
		self.http.reap() + self.https.reap()
	}
}

/// Periodic idle reaper, in the spirit of the rate-limit sweeper.
pub fn spawn_reaper(pool: Arc<ConnectionPool>, interval: Duration) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(interval);
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tick.tick().await;
			let reaped = pool.reap_idle();
			if reaped > 0 {
				debug!(reaped, "closed idle upstream sockets");
			}
		}
	})
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpListener;

	use super::*;
	use crate::client::ConnectorConfig;

	async fn echo_listener() -> (HostPort, tokio::task::JoinHandle<()>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let handle = tokio::spawn(async move {
			loop {
				let Ok((mut sock, _)) = listener.accept().await else {
					return;
				};
				tokio::spawn(async move {
					let mut buf = [0u8; 1024];
					while let Ok(n) = sock.read(&mut buf).await {
						if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
							break;
						}
					}
				});
			}
		});
		(HostPort::new("127.0.0.1", addr.port()), handle)
	}

	fn pool(cfg: PoolConfig) -> Arc<ConnectionPool> {
		let connector = Arc::new(
			Connector::new(ConnectorConfig {
				connect_timeout: Duration::from_millis(500),
				..Default::default()
			})
			.unwrap(),
		);
		Arc::new(ConnectionPool::new(connector, cfg))
	}

	#[tokio::test]
	async fn released_socket_is_reused() {
		let (target, _guard) = echo_listener().await;
		let p = pool(PoolConfig::default());
		let conn = p.acquire(Protocol::Http, &target).await.unwrap();
		assert!(!conn.reused());
		conn.release();
		let conn = p.acquire(Protocol::Http, &target).await.unwrap();
		assert!(conn.reused());
		let stats = p.stats(Protocol::Http);
		assert_eq!(stats.created, 1);
		assert_eq!(stats.reused, 1);
	}

	#[tokio::test]
	async fn dropped_socket_is_not_reused() {
		let (target, _guard) = echo_listener().await;
		let p = pool(PoolConfig::default());
		let conn = p.acquire(Protocol::Http, &target).await.unwrap();
		conn.discard();
		let conn = p.acquire(Protocol::Http, &target).await.unwrap();
		assert!(!conn.reused());
		assert_eq!(p.stats(Protocol::Http).created, 2);
	}

	#[tokio::test]
	async fn per_host_cap_blocks_then_admits() {
		let (target, _guard) = echo_listener().await;
		let p = pool(PoolConfig {
			max_sockets_per_host: 1,
			..Default::default()
		});
		let held = p.acquire(Protocol::Http, &target).await.unwrap();
		let p2 = p.clone();
		let target2 = target.clone();
		let waiter =
			tokio::spawn(async move { p2.acquire(Protocol::Http, &target2).await.map(|c| c.reused()) });
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(!waiter.is_finished());
		// Releasing parks the socket; the waiter picks it up as a reuse.
		held.release();
		assert_eq!(waiter.await.unwrap().unwrap(), true);
	}

	#[tokio::test]
	async fn exhaustion_times_out() {
		let (target, _guard) = echo_listener().await;
		let p = pool(PoolConfig {
			max_total_sockets: 1,
			..Default::default()
		});
		let _held = p.acquire(Protocol::Http, &target).await.unwrap();
		let err = p.acquire(Protocol::Http, &target).await.unwrap_err();
		assert!(matches!(err, ClientError::PoolExhausted(_)));
	}

	#[tokio::test]
	async fn total_cap_never_exceeded() {
		let (target, _guard) = echo_listener().await;
		let cap = 4;
		let p = pool(PoolConfig {
			max_sockets_per_host: 16,
			max_total_sockets: cap,
			..Default::default()
		});
		let mut held = Vec::new();
		for _ in 0..cap {
			held.push(p.acquire(Protocol::Http, &target).await.unwrap());
		}
		let stats = p.stats(Protocol::Http);
		assert_eq!(stats.active, cap);
		assert!(p.acquire(Protocol::Http, &target).await.is_err());
		held.clear();
	}

	#[tokio::test]
	async fn reaper_closes_stale_idle() {
		let (target, _guard) = echo_listener().await;
		let p = pool(PoolConfig {
			free_socket_timeout: Duration::from_millis(10),
			..Default::default()
		});
		p.acquire(Protocol::Http, &target).await.unwrap().release();
		assert_eq!(p.stats(Protocol::Http).free, 1);
		tokio::time::sleep(Duration::from_millis(30)).await;
		assert_eq!(p.reap_idle(), 1);
		let stats = p.stats(Protocol::Http);
		assert_eq!(stats.free, 0);
		assert_eq!(stats.active, 0);
	}

	#[tokio::test]
	async fn free_sockets_per_host_cap() {
		let (target, _guard) = echo_listener().await;
		let p = pool(PoolConfig {
			max_free_sockets_per_host: 1,
			..Default::default()
		});
		let a = p.acquire(Protocol::Http, &target).await.unwrap();
		let b = p.acquire(Protocol::Http, &target).await.unwrap();
		a.release();
		b.release();
		// Second release exceeded the free cap and was destroyed.
		assert_eq!(p.stats(Protocol::Http).free, 1);
	}
}
