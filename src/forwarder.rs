//! This module is responsible for the I/O layer of the application.
//!
//! It forwards one raw HTTP request to a selected upstream server over a
//! fresh TCP connection, relays the response back to the client unmodified,
//! and classifies the outcome so the caller can feed health and statistics
//! back into the registry. The server's configured timeout bounds every
//! socket operation; deadline overruns are distinguished from other I/O
//! errors because they map to different client-facing statuses.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::http;
use crate::registry::ServerHandle;
use crate::upstream::{BalancerError, ForwardOutcome};

/// Read chunk granularity for upstream responses.
const READ_CHUNK: usize = 4096;
/// Hard cap on a relayed response; anything longer is truncated at the cap.
const MAX_RESPONSE: usize = 64 * 1024;

/// Forwards `raw_request` to `server` and relays the response to `client`.
///
/// The exchange: connect, write the request verbatim, read one complete
/// HTTP message (or until the upstream closes), relay it. Elapsed time is
/// measured from connect-start until the response is fully read, so it is the
/// figure least-time selection ranks servers by.
pub async fn forward<C>(
    client: &mut C,
    server: &ServerHandle,
    raw_request: &[u8],
) -> Result<ForwardOutcome, BalancerError>
where
    C: AsyncWrite + Unpin,
{
    let addr = server.addr();
    let start = Instant::now();

    let mut upstream = io_step(
        timeout(server.timeout, TcpStream::connect((server.host.as_str(), server.port))).await,
        &addr,
    )?;

    io_step(timeout(server.timeout, upstream.write_all(raw_request)).await, &addr)?;

    let response = read_response(&mut upstream, server.timeout, &addr).await?;
    let elapsed = start.elapsed();

    debug!(server = %addr, bytes = response.len(), elapsed_ms = elapsed.as_millis() as u64, "Relayed upstream response");

    // The upstream exchange already succeeded; a client that went away does
    // not make the server unhealthy.
    if let Err(e) = client.write_all(&response).await {
        warn!(server = %addr, error = %e, "Client connection lost while relaying response");
    }

    Ok(ForwardOutcome { elapsed, response })
}

/// Flattens a timed I/O step into the error taxonomy: deadline overrun maps
/// to `UpstreamTimeout`, everything else to `UpstreamError`.
fn io_step<T>(
    result: Result<std::io::Result<T>, tokio::time::error::Elapsed>,
    addr: &str,
) -> Result<T, BalancerError> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(BalancerError::UpstreamError(format!("{}: {}", addr, e))),
        Err(_) => Err(BalancerError::UpstreamTimeout(addr.to_string())),
    }
}

/// Reads one complete HTTP/1.x response.
///
/// First the header section, then a body of the declared `Content-Length`;
/// without one, reads until the upstream closes (connection-close framing).
/// Each read carries the per-server deadline, and the total is capped at
/// `MAX_RESPONSE`: an overlong response is truncated at the cap and relayed
/// as-is.
async fn read_response(
    upstream: &mut TcpStream,
    deadline: Duration,
    addr: &str,
) -> Result<Bytes, BalancerError> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let head_end = loop {
        if let Some(end) = http::header_end(&buf) {
            break end;
        }
        if buf.len() >= MAX_RESPONSE {
            return Ok(buf.freeze());
        }
        let n = io_step(timeout(deadline, upstream.read_buf(&mut buf)).await, addr)?;
        if n == 0 {
            // Upstream closed before a full header section arrived; relay
            // whatever it sent.
            return Ok(buf.freeze());
        }
    };

    let wanted = match http::content_length(&buf[..head_end]) {
        Some(len) => head_end.saturating_add(len).min(MAX_RESPONSE),
        None => MAX_RESPONSE,
    };

    while buf.len() < wanted {
        let n = io_step(timeout(deadline, upstream.read_buf(&mut buf)).await, addr)?;
        if n == 0 {
            break;
        }
    }

    buf.truncate(wanted.max(head_end));
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const BACKEND_RESPONSE: &str = "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

    fn handle(addr: SocketAddr) -> ServerHandle {
        ServerHandle {
            index: 0,
            host: addr.ip().to_string(),
            port: addr.port(),
            timeout: Duration::from_secs(2),
        }
    }

    /// One-shot backend: accepts a single connection, optionally reads the
    /// request, writes `response`, and closes.
    async fn spawn_backend(response: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut req = vec![0u8; 4096];
            let _ = socket.read(&mut req).await;
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_forward_relays_response_and_measures_time() {
        let addr = spawn_backend(BACKEND_RESPONSE).await;
        let (mut client_write, mut client_read) = tokio::io::duplex(4096);

        let outcome = forward(
            &mut client_write,
            &handle(addr),
            b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n",
        )
        .await
        .unwrap();

        assert_eq!(outcome.response, Bytes::from_static(BACKEND_RESPONSE.as_bytes()));
        assert!(outcome.elapsed > Duration::ZERO);

        drop(client_write);
        let mut relayed = Vec::new();
        client_read.read_to_end(&mut relayed).await.unwrap();
        assert_eq!(relayed, BACKEND_RESPONSE.as_bytes());
    }

    #[tokio::test]
    async fn test_forward_reads_body_split_across_segments() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut req = vec![0u8; 4096];
            let _ = socket.read(&mut req).await;
            socket.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n12345").await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            socket.write_all(b"67890").await.unwrap();
        });

        let (mut client_write, _client_read) = tokio::io::duplex(4096);
        let outcome =
            forward(&mut client_write, &handle(addr), b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
                .await
                .unwrap();
        assert!(outcome.response.ends_with(b"1234567890"));
    }

    #[tokio::test]
    async fn test_forward_without_content_length_reads_to_close() {
        let addr = spawn_backend("HTTP/1.1 200 OK\r\n\r\nstreamed until close").await;
        let (mut client_write, _client_read) = tokio::io::duplex(4096);

        let outcome =
            forward(&mut client_write, &handle(addr), b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
                .await
                .unwrap();
        assert!(outcome.response.ends_with(b"streamed until close"));
    }

    #[tokio::test]
    async fn test_connect_refused_is_upstream_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mut client_write, _client_read) = tokio::io::duplex(4096);
        let err = forward(&mut client_write, &handle(addr), b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::UpstreamError(_)));
    }

    #[tokio::test]
    async fn test_silent_upstream_is_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold the connection open without responding.
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut server = handle(addr);
        server.timeout = Duration::from_millis(100);

        let (mut client_write, _client_read) = tokio::io::duplex(4096);
        let err = forward(&mut client_write, &server, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::UpstreamTimeout(_)));
    }
}
