pub mod pool;

use egress_core::prelude::*;
use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::http::HostPort;
use crate::tls;
use crate::transport::stream::Socket;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
	#[error("dns resolution failed for {0}")]
	DnsResolution(Strng),
	#[error("connect timeout to {0}")]
	ConnectTimeout(Strng),
	#[error("connect failed to {0}: {1}")]
	Connect(Strng, std::io::Error),
	#[error("tls failure to {0}: {1}")]
	Tls(Strng, tls::TlsError),
	#[error("upstream pool exhausted for {0}")]
	PoolExhausted(Strng),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[serde(default)]
pub struct ConnectorConfig {
	#[serde(with = "crate::serde_dur")]
	pub connect_timeout: Duration,
	/// TCP keep-alive probe interval for upstream sockets.
	#[serde(with = "crate::serde_dur")]
	pub tcp_keepalive: Duration,
}

impl Default for ConnectorConfig {
	fn default() -> Self {
		ConnectorConfig {
			connect_timeout: Duration::from_secs(10),
			tcp_keepalive: Duration::from_secs(30),
		}
	}
}

/// Dials upstream sockets: TCP with a connect deadline, optionally wrapped in
/// TLS. One per process, shared by the pool and the tunnel path.
pub struct Connector {
	cfg: ConnectorConfig,
	tls_http1: Arc<ClientConfig>,
	tls_h2: Arc<ClientConfig>,
}

impl Connector {
	pub fn new(cfg: ConnectorConfig) -> anyhow::Result<Connector> {
		Ok(Connector {
			cfg,
			tls_http1: tls::upstream_client_config(false)?,
			tls_h2: tls::upstream_client_config(true)?,
		})
	}

	pub fn connect_timeout(&self) -> Duration {
		self.cfg.connect_timeout
	}

	/// Dials a plain TCP connection with the configured deadline.
	pub async fn dial(&self, target: &HostPort) -> Result<Socket, ClientError> {
		let key = target.key();
		let addr = format!("{}:{}", target.host, target.port);
		let connect = async {
			let stream = TcpStream::connect(addr.as_str())
				.await
				.map_err(|e| match e.kind() {
					std::io::ErrorKind::NotFound | std::io::ErrorKind::InvalidInput => {
						ClientError::DnsResolution(key.clone())
					},
					_ => ClientError::Connect(key.clone(), e),
				})?;
			self.apply_keepalive(&stream);
			Socket::from_tcp(stream).map_err(|e| {
				ClientError::Connect(
					key.clone(),
					std::io::Error::other(e.to_string()),
				)
			})
		};
		match tokio::time::timeout(self.cfg.connect_timeout, connect).await {
			Ok(res) => res,
			Err(_) => Err(ClientError::ConnectTimeout(key)),
		}
	}

	/// Dials and wraps in TLS, SNI set to the target host.
	pub async fn dial_tls(&self, target: &HostPort) -> Result<Socket, ClientError> {
		let tcp = self.dial(target).await?;
		tls::connect(tcp, &target.host, self.tls_http1.clone())
			.await
			.map_err(|e| ClientError::Tls(target.key(), e))
	}

	/// Dials a TLS connection negotiating HTTP/2, for native gRPC upstreams.
	pub async fn dial_h2(&self, target: &HostPort) -> Result<Socket, ClientError> {
		let tcp = self.dial(target).await?;
		tls::connect(tcp, &target.host, self.tls_h2.clone())
			.await
			.map_err(|e| ClientError::Tls(target.key(), e))
	}

	fn apply_keepalive(&self, stream: &TcpStream) {
		let ka = socket2::TcpKeepalive::new()
			.with_time(self.cfg.tcp_keepalive)
			.with_interval(self.cfg.tcp_keepalive);
		let sf = socket2::SockRef::from(stream);
		if let Err(e) = sf.set_tcp_keepalive(&ka) {
			debug!("failed to enable tcp keepalive: {e}");
		}
	}
}
