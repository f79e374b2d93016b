//! This module contains the logic for the background health probing task.
//!
//! It runs in a loop, and on each tick it assesses the health of every server
//! in every group by sending a synthetic `GET /healthz` request over a
//! short-lived connection. A server is healthy exactly when its probe
//! response contains `200 OK`; any connect or I/O failure marks it unhealthy.
//! Probe verdicts overwrite the passive marks left by forwarding outcomes,
//! so a recovered server re-enters rotation within one probe interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::registry::Registry;
use crate::upstream::BalancerError;

/// Upper bound on how much of a probe response is read.
const PROBE_READ_LIMIT: usize = 1024;

/// The main background loop for performing periodic health probes.
///
/// Ticks on `interval_secs` for the life of the process. A failed cycle is
/// logged and followed by `backoff_secs` of quiet before the normal cadence
/// resumes; only the shutdown signal ends the loop.
pub async fn probe_loop(
    registry: Arc<Registry>,
    interval_secs: u64,
    backoff_secs: u64,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut ticker = interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased; // Prioritize the shutdown signal
            _ = shutdown_rx.changed() => {
                info!("Health prober received shutdown signal, exiting.");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = run_probe_cycle(&registry).await {
                    warn!(error = %e, backoff_secs, "Health probe cycle failed, backing off");
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            info!("Health prober received shutdown signal, exiting.");
                            return;
                        }
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                }
            }
        }
    }
}

/// Executes one round of probes against every registered server.
///
/// Probes fan out concurrently; verdicts are applied under the group locks as
/// they arrive. A panicked probe task is reported as a cycle failure after
/// the remaining verdicts have still been applied.
pub async fn run_probe_cycle(registry: &Registry) -> Result<(), BalancerError> {
    let targets = registry.probe_targets();

    let mut set = JoinSet::new();
    for target in targets {
        set.spawn(async move {
            let healthy = probe_server(&target.host, target.port, target.timeout).await;
            (target, healthy)
        });
    }

    let mut cycle_error = None;
    while let Some(res) = set.join_next().await {
        match res {
            Ok((target, healthy)) => {
                debug!(domain = %target.domain, server = %format!("{}:{}", target.host, target.port), healthy, "Probe verdict");
                registry.apply_probe(&target.domain, target.index, healthy);
            }
            Err(e) => cycle_error = Some(BalancerError::Internal(format!("probe task failed: {}", e))),
        }
    }

    registry.refresh_health_gauge();

    match cycle_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Probes one server: connect, send `GET /healthz`, and scan the response for
/// the literal `200 OK`. Every step is bounded by the server's timeout; any
/// failure is an unhealthy verdict, never an error.
pub async fn probe_server(host: &str, port: u16, deadline: Duration) -> bool {
    let request = format!("GET /healthz HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host);

    let attempt = async {
        let mut stream = timeout(deadline, TcpStream::connect((host, port))).await.ok()?.ok()?;
        timeout(deadline, stream.write_all(request.as_bytes())).await.ok()?.ok()?;

        let mut response = Vec::with_capacity(PROBE_READ_LIMIT);
        let mut chunk = [0u8; 256];
        loop {
            if contains_200_ok(&response) {
                return Some(true);
            }
            if response.len() >= PROBE_READ_LIMIT {
                return Some(false);
            }
            let n = timeout(deadline, stream.read(&mut chunk)).await.ok()?.ok()?;
            if n == 0 {
                return Some(contains_200_ok(&response));
            }
            response.extend_from_slice(&chunk[..n]);
        }
    };

    attempt.await.unwrap_or(false)
}

fn contains_200_ok(response: &[u8]) -> bool {
    response.windows(6).any(|w| w == b"200 OK")
}
