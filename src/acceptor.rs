//! Client-facing TCP accept loop and per-connection request handling.
//!
//! Every accepted connection is served by its own task for exactly one
//! request/response cycle: read a single bounded chunk, route on the `Host`
//! header, select an upstream, forward, record the outcome, close. Any stage
//! failure short-circuits into the matching error response; none of them
//! disturb the accept loop itself.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::forwarder;
use crate::http;
use crate::metrics::REQUESTS_REJECTED;
use crate::registry::Registry;
use crate::upstream::BalancerError;

/// Size of the single receive that must hold the request line and headers.
const REQUEST_BUFFER: usize = 4096;

/// Accepts client connections until the shutdown signal fires.
///
/// Accept errors are logged and the loop continues; in-flight handlers are
/// left to finish on their own after shutdown.
pub async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased; // Prioritize the shutdown signal
            _ = shutdown_rx.changed() => {
                info!("Acceptor received shutdown signal, releasing listener.");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let registry = registry.clone();
                        tokio::spawn(handle_connection(stream, peer, registry));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }
}

/// Serves one client connection, writing an error response when any stage of
/// the route → select → forward pipeline fails. The connection closes when
/// the stream drops at the end of this function.
pub async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, registry: Arc<Registry>) {
    if let Err(err) = handle_request(&mut stream, &registry).await {
        debug!(peer = %peer, error = %err, "Request failed");
        REQUESTS_REJECTED.with_label_values(&[rejection_label(&err)]).inc();
        respond_error(&mut stream, &err).await;
    }
}

async fn handle_request(stream: &mut TcpStream, registry: &Registry) -> Result<(), BalancerError> {
    let mut buf = vec![0u8; REQUEST_BUFFER];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| BalancerError::Internal(format!("client read: {}", e)))?;
    if n == 0 {
        // Client connected and hung up without sending anything.
        return Ok(());
    }
    let request = &buf[..n];

    let domain = http::extract_host(request).ok_or(BalancerError::MissingHost)?;
    let server = registry.select(&domain)?;
    debug!(domain = %domain, server = %server.addr(), "Routed request");

    match forwarder::forward(stream, &server, request).await {
        Ok(outcome) => {
            registry.record_success(&domain, server.index, outcome.elapsed);
            Ok(())
        }
        Err(err) => {
            registry.record_failure(&domain, server.index);
            Err(err)
        }
    }
}

async fn respond_error(stream: &mut TcpStream, err: &BalancerError) {
    let (status, reason) = err.status();
    let response = http::plain_response(status, reason, &err.to_string());
    if let Err(e) = stream.write_all(&response).await {
        warn!(error = %e, "Failed to write error response to client");
    }
}

fn rejection_label(err: &BalancerError) -> &'static str {
    match err {
        BalancerError::MissingHost => "missing_host",
        BalancerError::UnknownDomain(_) => "unknown_domain",
        BalancerError::NoHealthyUpstream(_) => "no_healthy_upstream",
        BalancerError::UpstreamTimeout(_) => "upstream_timeout",
        BalancerError::UpstreamError(_) => "upstream_error",
        BalancerError::ConfigError(_) | BalancerError::Internal(_) => "internal",
    }
}
