use std::io::IoSlice;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// L4 facts about a connection, captured at accept/dial time.
#[derive(Debug, Clone)]
pub struct TcpConnectionInfo {
	pub peer_addr: SocketAddr,
	pub local_addr: SocketAddr,
	pub start: Instant,
}

/// TLS facts, present once a stream has been wrapped.
#[derive(Debug, Clone, Default)]
pub struct TlsConnectionInfo {
	pub server_name: Option<String>,
	pub negotiated_alpn: Option<Vec<u8>>,
}

#[derive(Debug)]
pub enum SocketKind {
	Tcp(TcpStream),
	/// Server-side TLS (a terminated downstream connection).
	Tls(Box<tokio_rustls::server::TlsStream<Box<Socket>>>),
	/// Client-side TLS (an upstream connection we initiated).
	ClientTls(Box<tokio_rustls::client::TlsStream<Box<Socket>>>),
	/// In-memory pipe, for tests.
	Memory(DuplexStream),
}

/// A connection of any provenance: accepted or dialed, plain or TLS.
///
/// Carries its connection metadata with it and can replay a prefix of bytes
/// that were consumed for protocol sniffing (the HTTP/2 preface check, or
/// TLS bytes buffered while parsing a CONNECT head).
#[derive(Debug)]
pub struct Socket {
	tcp: TcpConnectionInfo,
	tls: Option<TlsConnectionInfo>,
	prefix: Option<Bytes>,
	inner: SocketKind,
}

impl Socket {
	pub fn from_tcp(stream: TcpStream) -> anyhow::Result<Socket> {
		stream.set_nodelay(true)?;
		let info = TcpConnectionInfo {
			peer_addr: to_canonical(stream.peer_addr()?),
			local_addr: to_canonical(stream.local_addr()?),
			start: Instant::now(),
		};
		Ok(Socket {
			tcp: info,
			tls: None,
			prefix: None,
			inner: SocketKind::Tcp(stream),
		})
	}

	pub fn from_memory(stream: DuplexStream, info: TcpConnectionInfo) -> Socket {
		Socket {
			tcp: info,
			tls: None,
			prefix: None,
			inner: SocketKind::Memory(stream),
		}
	}

	/// Wraps an accepted server-side TLS stream, preserving the original
	/// connection info and recording the negotiated TLS parameters.
	pub fn from_server_tls(tls: tokio_rustls::server::TlsStream<Box<Socket>>) -> Socket {
		let tcp = tls.get_ref().0.tcp.clone();
		let info = {
			let (_, conn) = tls.get_ref();
			TlsConnectionInfo {
				server_name: conn.server_name().map(|s| s.to_string()),
				negotiated_alpn: conn.alpn_protocol().map(|p| p.to_vec()),
			}
		};
		Socket {
			tcp,
			tls: Some(info),
			prefix: None,
			inner: SocketKind::Tls(Box::new(tls)),
		}
	}

	/// Wraps a client-side TLS stream toward an upstream.
	pub fn from_client_tls(tls: tokio_rustls::client::TlsStream<Box<Socket>>) -> Socket {
		let tcp = tls.get_ref().0.tcp.clone();
		let info = {
			let (_, conn) = tls.get_ref();
			TlsConnectionInfo {
				server_name: None,
				negotiated_alpn: conn.alpn_protocol().map(|p| p.to_vec()),
			}
		};
		Socket {
			tcp,
			tls: Some(info),
			prefix: None,
			inner: SocketKind::ClientTls(Box::new(tls)),
		}
	}

	/// Queues bytes to be returned by the next reads, ahead of the wire.
	pub fn set_prefix(&mut self, prefix: Bytes) {
		if prefix.is_empty() {
			return;
		}
		debug_assert!(self.prefix.is_none(), "prefix already pending");
		self.prefix = Some(prefix);
	}

	pub fn tcp(&self) -> &TcpConnectionInfo {
		&self.tcp
	}

	pub fn tls(&self) -> Option<&TlsConnectionInfo> {
		self.tls.as_ref()
	}

	pub fn peer_ip(&self) -> std::net::IpAddr {
		self.tcp.peer_addr.ip()
	}
}

pub fn to_canonical(addr: SocketAddr) -> SocketAddr {
	// v4-mapped v6 addresses compare and log as their v4 form.
	SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

impl AsyncRead for Socket {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		let this = self.get_mut();
		if let Some(prefix) = &mut this.prefix {
			let n = prefix.len().min(buf.remaining());
			buf.put_slice(&prefix.split_to(n));
			if prefix.is_empty() {
				this.prefix = None;
			}
			return Poll::Ready(Ok(()));
		}
		match &mut this.inner {
			SocketKind::Tcp(s) => Pin::new(s).poll_read(cx, buf),
			SocketKind::Tls(s) => Pin::new(s).poll_read(cx, buf),
			SocketKind::ClientTls(s) => Pin::new(s).poll_read(cx, buf),
			SocketKind::Memory(s) => Pin::new(s).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Socket {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		match &mut self.get_mut().inner {
			SocketKind::Tcp(s) => Pin::new(s).poll_write(cx, buf),
			SocketKind::Tls(s) => Pin::new(s).poll_write(cx, buf),
			SocketKind::ClientTls(s) => Pin::new(s).poll_write(cx, buf),
			SocketKind::Memory(s) => Pin::new(s).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match &mut self.get_mut().inner {
			SocketKind::Tcp(s) => Pin::new(s).poll_flush(cx),
			SocketKind::Tls(s) => Pin::new(s).poll_flush(cx),
			SocketKind::ClientTls(s) => Pin::new(s).poll_flush(cx),
			SocketKind::Memory(s) => Pin::new(s).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match &mut self.get_mut().inner {
			SocketKind::Tcp(s) => Pin::new(s).poll_shutdown(cx),
			SocketKind::Tls(s) => Pin::new(s).poll_shutdown(cx),
			SocketKind::ClientTls(s) => Pin::new(s).poll_shutdown(cx),
			SocketKind::Memory(s) => Pin::new(s).poll_shutdown(cx),
		}
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<std::io::Result<usize>> {
		match &mut self.get_mut().inner {
			SocketKind::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
			SocketKind::Tls(s) => Pin::new(s).poll_write_vectored(cx, bufs),
			SocketKind::ClientTls(s) => Pin::new(s).poll_write_vectored(cx, bufs),
			SocketKind::Memory(s) => Pin::new(s).poll_write_vectored(cx, bufs),
		}
	}

	fn is_write_vectored(&self) -> bool {
		match &self.inner {
			SocketKind::Tcp(s) => s.is_write_vectored(),
			SocketKind::Tls(s) => s.is_write_vectored(),
			SocketKind::ClientTls(s) => s.is_write_vectored(),
			SocketKind::Memory(s) => s.is_write_vectored(),
		}
	}
}

#[cfg(test)]
pub fn memory_pair() -> (Socket, Socket) {
	let (a, b) = tokio::io::duplex(64 * 1024);
	let info = |port: u16| TcpConnectionInfo {
		peer_addr: SocketAddr::from(([127, 0, 0, 1], port)),
		local_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
		start: Instant::now(),
	};
	(
		Socket::from_memory(a, info(40001)),
		Socket::from_memory(b, info(40002)),
	)
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;

	#[tokio::test]
	async fn prefix_is_replayed_before_wire_bytes() {
		let (mut a, mut b) = memory_pair();
		b.set_prefix(Bytes::from_static(b"GET "));
		a.write_all(b"/ HTTP/1.1\r\n").await.unwrap();
		let mut buf = vec![0u8; 16];
		let n = b.read(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"GET ");
		let n = b.read(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"/ HTTP/1.1\r\n");
	}

	#[tokio::test]
	async fn canonicalizes_mapped_addresses() {
		let addr: SocketAddr = "[::ffff:10.0.0.1]:80".parse().unwrap();
		assert_eq!(to_canonical(addr).to_string(), "10.0.0.1:80");
	}
}
