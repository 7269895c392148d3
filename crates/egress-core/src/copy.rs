//! Bidirectional byte splicing for opaque tunnels and upgraded connections.
//!
//! Unlike `tokio::io::copy_bidirectional`, this tracks an idle deadline that is
//! reset whenever a byte moves in either direction, and reports per-direction
//! totals so callers can audit traffic volumes.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUFFER_SIZE: usize = 16 * 1024;

/// Byte totals moved by [`splice`], named from the perspective of the first
/// argument (the downstream/client side).
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct Transferred {
	pub sent: u64,
	pub received: u64,
}

/// Splices bytes between `client` and `upstream` until either side closes,
/// errors, or no byte moves for `idle_timeout`. Totals accumulate into
/// `totals` even when the splice ends in an error, so callers can audit
/// traffic volumes on every path.
///
/// A clean half-close propagates a write shutdown to the other side; the
/// splice finishes once both directions are done. Writes apply natural
/// back-pressure: while one direction's write is in flight, no further reads
/// are issued on it.
pub async fn splice<A, B>(
	client: &mut A,
	upstream: &mut B,
	idle_timeout: Duration,
	totals: &mut Transferred,
) -> io::Result<()>
where
	A: AsyncRead + AsyncWrite + Unpin + ?Sized,
	B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
	let mut client_buf = vec![0u8; BUFFER_SIZE];
	let mut upstream_buf = vec![0u8; BUFFER_SIZE];
	let mut client_open = true;
	let mut upstream_open = true;

	while client_open || upstream_open {
		let idle = tokio::time::sleep(idle_timeout);
		tokio::pin!(idle);
		tokio::select! {
			res = client.read(&mut client_buf), if client_open => {
				match res? {
					0 => {
						client_open = false;
						upstream.shutdown().await?;
					},
					n => {
						upstream.write_all(&client_buf[..n]).await?;
						totals.sent += n as u64;
					},
				}
			}
			res = upstream.read(&mut upstream_buf), if upstream_open => {
				match res? {
					0 => {
						upstream_open = false;
						client.shutdown().await?;
					},
					n => {
						client.write_all(&upstream_buf[..n]).await?;
						totals.received += n as u64;
					},
				}
			}
			_ = &mut idle => {
				return Err(io::Error::new(io::ErrorKind::TimedOut, "tunnel idle timeout"));
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn splices_both_directions() {
		let (mut c1, mut c2) = tokio::io::duplex(64);
		let (mut u1, mut u2) = tokio::io::duplex(64);

		let task = tokio::spawn(async move {
			let mut totals = Transferred::default();
			splice(&mut c2, &mut u1, Duration::from_secs(5), &mut totals)
				.await
				.map(|_| totals)
		});

		c1.write_all(b"ping").await.unwrap();
		let mut buf = [0u8; 4];
		u2.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"ping");

		u2.write_all(b"pong!").await.unwrap();
		let mut buf = [0u8; 5];
		c1.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"pong!");

		drop(c1);
		drop(u2);
		let totals = task.await.unwrap().unwrap();
		assert_eq!(totals.sent, 4);
		assert_eq!(totals.received, 5);
	}

	#[tokio::test]
	async fn idle_timeout_fires() {
		let (_c1, mut c2) = tokio::io::duplex(64);
		let (mut u1, _u2) = tokio::io::duplex(64);
		let mut totals = Transferred::default();
		let err = splice(&mut c2, &mut u1, Duration::from_millis(30), &mut totals)
			.await
			.unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::TimedOut);
	}
}
