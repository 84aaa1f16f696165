//! Bidirectional byte pumping between the two halves of a connection.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

pub(crate) const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Replays `prefix` before reading from the inner stream; writes pass
/// straight through. Used when the request-head read consumed bytes that
/// belong to the tunneled protocol.
#[derive(Debug)]
pub(crate) struct PrefixedStream<S> {
    prefix: Vec<u8>,
    consumed: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub(crate) fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            consumed: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.consumed < self.prefix.len() {
            let pending = &self.prefix[self.consumed..];
            let take = pending.len().min(buf.remaining());
            buf.put_slice(&pending[..take]);
            self.consumed += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn ignorable_shutdown_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

async fn read_with_idle_timeout<R>(
    stream: &mut R,
    buffer: &mut [u8],
    idle_timeout: Duration,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(idle_timeout, stream.read(buffer)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "relay idle timeout",
        )),
    }
}

async fn write_all_with_timeout<W>(
    stream: &mut W,
    bytes: &[u8],
    idle_timeout: Duration,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(idle_timeout, stream.write_all(bytes)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "relay write timeout",
        )),
    }
}

async fn shutdown_quietly<W>(stream: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match stream.shutdown().await {
        Ok(()) => Ok(()),
        Err(error) if ignorable_shutdown_error(&error) => Ok(()),
        Err(error) => Err(error),
    }
}

/// Pumps both directions until both sides reach EOF, either side errors,
/// or nothing moves for `idle_timeout`. Within each direction, bytes are
/// written in arrival order; a read is only re-armed after the paired
/// write completed, so TCP flow control is the only buffering.
pub(crate) async fn copy_bidirectional<A, B>(
    client: &mut A,
    origin: &mut B,
    idle_timeout: Duration,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buffer = vec![0_u8; RELAY_BUFFER_SIZE];
    let mut origin_buffer = vec![0_u8; RELAY_BUFFER_SIZE];
    let mut from_client = 0_u64;
    let mut from_origin = 0_u64;
    let mut client_done = false;
    let mut origin_done = false;

    loop {
        if client_done && origin_done {
            return Ok((from_client, from_origin));
        }

        tokio::select! {
            result = read_with_idle_timeout(client, &mut client_buffer, idle_timeout), if !client_done => {
                let read = result?;
                if read == 0 {
                    client_done = true;
                    shutdown_quietly(origin).await?;
                } else {
                    write_all_with_timeout(origin, &client_buffer[..read], idle_timeout).await?;
                    from_client += read as u64;
                }
            }
            result = read_with_idle_timeout(origin, &mut origin_buffer, idle_timeout), if !origin_done => {
                let read = result?;
                if read == 0 {
                    origin_done = true;
                    shutdown_quietly(client).await?;
                } else {
                    write_all_with_timeout(client, &origin_buffer[..read], idle_timeout).await?;
                    from_origin += read as u64;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{copy_bidirectional, PrefixedStream};

    #[tokio::test]
    async fn prefix_is_replayed_before_inner_reads() {
        let (client, mut server) = tokio::io::duplex(256);
        server.write_all(b" world").await.expect("write");
        drop(server);

        let mut prefixed = PrefixedStream::new(b"hello".to_vec(), client);
        let mut out = Vec::new();
        prefixed.read_to_end(&mut out).await.expect("read");
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn bytes_cross_in_order_both_ways() {
        let (mut proxy_client, mut peer_client) = tokio::io::duplex(64);
        let (mut proxy_origin, mut peer_origin) = tokio::io::duplex(64);

        let relay = tokio::spawn(async move {
            copy_bidirectional(
                &mut proxy_client,
                &mut proxy_origin,
                Duration::from_secs(5),
            )
            .await
        });

        peer_client.write_all(b"request-bytes").await.expect("write");
        let mut seen = vec![0_u8; 13];
        peer_origin.read_exact(&mut seen).await.expect("read");
        assert_eq!(&seen, b"request-bytes");

        peer_origin.write_all(b"response").await.expect("write");
        let mut answer = vec![0_u8; 8];
        peer_client.read_exact(&mut answer).await.expect("read");
        assert_eq!(&answer, b"response");

        drop(peer_client);
        drop(peer_origin);
        let (from_client, from_origin) = relay
            .await
            .expect("join")
            .expect("relay result");
        assert_eq!(from_client, 13);
        assert_eq!(from_origin, 8);
    }

    #[tokio::test]
    async fn idle_relay_times_out() {
        let (mut proxy_client, _peer_client) = tokio::io::duplex(64);
        let (mut proxy_origin, _peer_origin) = tokio::io::duplex(64);

        let error = copy_bidirectional(
            &mut proxy_client,
            &mut proxy_origin,
            Duration::from_millis(50),
        )
        .await
        .expect_err("must time out");
        assert_eq!(error.kind(), std::io::ErrorKind::TimedOut);
    }
}
