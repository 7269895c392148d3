pub mod ca;

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::transport::stream::Socket;

#[derive(thiserror::Error, Debug)]
pub enum TlsError {
	#[error("tls handshake error: {0}")]
	Handshake(std::io::Error),
	#[error("invalid server name: {0}")]
	ServerName(String),
	#[error("certificate generation failed: {0}")]
	CertGeneration(#[from] rcgen::Error),
	#[error("rustls: {0}")]
	Rustls(#[from] rustls::Error),
	#[error("{0}")]
	Anyhow(#[from] anyhow::Error),
}

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

/// Installs the process-wide crypto provider. Safe to call more than once.
pub fn install_provider() {
	if CryptoProvider::get_default().is_none() {
		let _ = rustls::crypto::ring::default_provider().install_default();
	}
}

/// Terminates TLS on an accepted connection.
pub async fn accept(conn: Socket, cfg: Arc<ServerConfig>) -> Result<Socket, TlsError> {
	let stream = TlsAcceptor::from(cfg)
		.accept(Box::new(conn))
		.await
		.map_err(TlsError::Handshake)?;
	Ok(Socket::from_server_tls(stream))
}

/// Opens TLS toward an upstream, verifying against the system roots.
pub async fn connect(
	conn: Socket,
	server_name: &str,
	cfg: Arc<ClientConfig>,
) -> Result<Socket, TlsError> {
	let name = rustls_pki_types::ServerName::try_from(server_name.to_string())
		.map_err(|_| TlsError::ServerName(server_name.to_string()))?;
	let stream = TlsConnector::from(cfg)
		.connect(name, Box::new(conn))
		.await
		.map_err(TlsError::Handshake)?;
	Ok(Socket::from_client_tls(stream))
}

/// Client config for upstream TLS. `alpn_h2` restricts the handshake to
/// HTTP/2 (native gRPC); otherwise HTTP/1.1 is negotiated.
pub fn upstream_client_config(alpn_h2: bool) -> anyhow::Result<Arc<ClientConfig>> {
	let mut roots = RootCertStore::empty();
	let native = rustls_native_certs::load_native_certs();
	for cert in native.certs {
		// Ignore individual parse failures; platforms ship odd certs.
		let _ = roots.add(cert);
	}
	let mut cfg = ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	cfg.alpn_protocols = if alpn_h2 {
		vec![b"h2".to_vec()]
	} else {
		vec![b"http/1.1".to_vec()]
	};
	Ok(Arc::new(cfg))
}
