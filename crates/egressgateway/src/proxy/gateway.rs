//! The accept loop: admission control, protocol sniffing, and dispatch to
//! the tunnel/MITM/forward/gRPC handlers, with graceful drain on shutdown.

use bytes::BytesMut;
use egress_core::drain::{self, DrainWatcher};
use egress_core::prelude::*;
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::http::parser::{RequestEvent, RequestParser};
use crate::http::{RequestHead, simple_response};
use crate::proxy::limiter::ConnectionPermit;
use crate::proxy::{ProxyError, forward, grpcproxy, mitm, tunnel};
use crate::transport::stream::Socket;
use crate::{ProxyInputs, ProxyMode};

const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub struct Gateway {
	inputs: Arc<ProxyInputs>,
	drain: DrainWatcher,
}

impl Gateway {
	pub fn new(inputs: Arc<ProxyInputs>, drain: DrainWatcher) -> Gateway {
		Gateway { inputs, drain }
	}

	pub async fn run(self) -> anyhow::Result<()> {
		let addr = self.inputs.cfg.bind_addr();
		let listener = TcpListener::bind(&addr)
			.await
			.with_context(|| format!("binding {addr}"))?;
		self.run_on(listener).await
	}

	/// Runs the accept loop on an already-bound listener.
	pub async fn run_on(self, listener: TcpListener) -> anyhow::Result<()> {
		info!(addr = %listener.local_addr()?, mode = ?self.inputs.cfg.server.mode, "listener started");
		let inputs = self.inputs;

		let accept = |drain: DrainWatcher, force_shutdown: watch::Receiver<()>| async move {
			let wait = drain.clone().wait_for_drain();
			tokio::pin!(wait);
			loop {
				tokio::select! {
					res = listener.accept() => {
						let Ok((stream, _peer)) = res else {
							continue;
						};
						Self::admit(&inputs, stream, &drain, &force_shutdown);
					}
					_ = &mut wait => {
						info!("drain started; no longer accepting connections");
						return;
					}
				}
			}
		};
		drain::run_with_drain(
			"listener".to_string(),
			self.drain,
			Duration::from_secs(30),
			accept,
		)
		.await;
		Ok(())
	}

	/// Admission control happens before any read. Rejected connections get a
	/// bare 503 and are closed.
	fn admit(
		inputs: &Arc<ProxyInputs>,
		stream: tokio::net::TcpStream,
		drain: &DrainWatcher,
		force_shutdown: &watch::Receiver<()>,
	) {
		let mut socket = match Socket::from_tcp(stream) {
			Ok(s) => s,
			Err(e) => {
				debug!("failed to set up accepted socket: {e}");
				return;
			},
		};
		let peer = socket.peer_ip();
		let permit = match inputs.limiter.try_acquire(peer) {
			Ok(p) => p,
			Err(rejection) => {
				debug!(%peer, ?rejection, "connection rejected at admission");
				inputs.metrics.connections_rejected.inc();
				tokio::spawn(async move {
					let _ = socket
						.write_all(&simple_response(
							http::StatusCode::SERVICE_UNAVAILABLE,
							"Connection limit reached",
						))
						.await;
					let _ = socket.shutdown().await;
				});
				return;
			},
		};
		inputs.metrics.downstream_connections.inc();
		let inputs = inputs.clone();
		// Hold a drain clone so shutdown waits for this connection.
		let connection_drain = drain.clone();
		let mut force_shutdown = force_shutdown.clone();
		tokio::spawn(async move {
			inputs.metrics.active_connections.inc();
			let start = Instant::now();
			tokio::select! {
				_ = force_shutdown.changed() => {
					debug!(%peer, "connection forcefully terminated by shutdown");
				}
				_ = Self::dispatch(inputs.clone(), socket, permit) => {}
			}
			inputs.metrics.active_connections.dec();
			debug!(%peer, dur = ?start.elapsed(), "connection completed");
			drop(connection_drain);
		});
	}

	/// Reads enough of the first bytes to pick a handler: HTTP/2 preface,
	/// CONNECT, or a plain HTTP/1.x request.
	async fn dispatch(inputs: Arc<ProxyInputs>, mut socket: Socket, permit: ConnectionPermit) {
		let _permit = permit;
		let sniffed = match Self::sniff(&inputs, &mut socket).await {
			Ok(s) => s,
			Err(e) => {
				if let Some(e) = e {
					let _ = socket.write_all(&e.response_bytes()).await;
				}
				let _ = socket.shutdown().await;
				return;
			},
		};
		match sniffed {
			Sniffed::H2(buffered) => {
				socket.set_prefix(buffered);
				grpcproxy::serve_h2(inputs, socket).await;
			},
			Sniffed::Http(mut parser, head) => {
				if head.method == Method::CONNECT {
					let preface = parser.take_remaining();
					match inputs.cfg.server.mode {
						ProxyMode::Tunnel => tunnel::handle(inputs, socket, head, preface).await,
						ProxyMode::Mitm => mitm::handle(inputs, socket, head, preface).await,
					}
				} else {
					forward::serve(inputs, socket, parser, head).await;
				}
			},
		}
	}

	/// `Err(None)` means the peer went away silently; `Err(Some(e))` carries
	/// a response to write before closing.
	async fn sniff(
		inputs: &Arc<ProxyInputs>,
		socket: &mut Socket,
	) -> Result<Sniffed, Option<ProxyError>> {
		let limits = inputs.cfg.server.limits.parser_limits();
		let idle = inputs.cfg.server.timeouts.idle_timeout;
		let mut sniffed = BytesMut::with_capacity(1024);
		let mut buf = vec![0u8; 8 * 1024];
		let mut parser: Option<RequestParser> = None;
		loop {
			// Still deciding whether this is the HTTP/2 preface.
			if parser.is_none() {
				let n = sniffed.len().min(H2_PREFACE.len());
				if sniffed[..n] == H2_PREFACE[..n] {
					if n == H2_PREFACE.len() {
						return Ok(Sniffed::H2(sniffed.freeze()));
					}
				} else {
					let mut p = RequestParser::new(limits);
					p.push(&sniffed);
					parser = Some(p);
				}
			}
			if let Some(p) = parser.as_mut() {
				match p.next_event() {
					Ok(Some(RequestEvent::HeadersComplete(head))) => {
						let parser = parser.take().expect("parser is set");
						return Ok(Sniffed::Http(parser, head));
					},
					Ok(Some(_)) => {},
					Ok(None) => {},
					Err(e) => return Err(Some(e.into())),
				}
			}
			let n = match tokio::time::timeout(idle, socket.read(&mut buf)).await {
				Ok(Ok(n)) => n,
				Ok(Err(_)) | Err(_) => return Err(None),
			};
			if n == 0 {
				return Err(None);
			}
			match parser.as_mut() {
				Some(p) => p.push(&buf[..n]),
				None => sniffed.extend_from_slice(&buf[..n]),
			}
		}
	}
}

enum Sniffed {
	H2(Bytes),
	Http(RequestParser, RequestHead),
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;
