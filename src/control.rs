//! Operator command loop, independent of request handling.
//!
//! Reads line commands from standard input: `list` dumps the registry state,
//! `metrics` dumps the Prometheus text exposition, `quit` triggers the
//! process-wide shutdown signal. Reaching end of input behaves like `quit`,
//! mirroring an operator closing the console. Command execution is split from
//! the I/O loop so it can be tested without a terminal.

use std::io::Write as _;
use std::sync::Arc;

use prometheus::{Encoder, TextEncoder};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::registry::{GroupSnapshot, Registry};
use crate::shutdown::ShutdownHandle;

/// What the loop should do after one command.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Nothing to print (blank input).
    Silent,
    /// Print this and keep going.
    Output(String),
    /// Stop the balancer.
    Quit,
}

/// The main loop for the operator console task.
pub async fn control_loop(
    registry: Arc<Registry>,
    shutdown: ShutdownHandle,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt();
        tokio::select! {
            biased; // Prioritize the shutdown signal
            _ = shutdown_rx.changed() => {
                info!("Control surface received shutdown signal, exiting.");
                return;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match run_command(line.trim(), &registry) {
                        CommandOutcome::Silent => {}
                        CommandOutcome::Output(text) => println!("{}", text),
                        CommandOutcome::Quit => {
                            info!("Operator requested shutdown.");
                            shutdown.trigger();
                            return;
                        }
                    },
                    Ok(None) => {
                        info!("Operator input closed, shutting down.");
                        shutdown.trigger();
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read operator input, control surface exiting");
                        return;
                    }
                }
            }
        }
    }
}

fn prompt() {
    print!("lb> ");
    let _ = std::io::stdout().flush();
}

/// Executes one operator command against the registry.
pub fn run_command(line: &str, registry: &Registry) -> CommandOutcome {
    match line {
        "" => CommandOutcome::Silent,
        "list" => CommandOutcome::Output(render_status(&registry.snapshot())),
        "metrics" => CommandOutcome::Output(render_metrics()),
        "quit" => CommandOutcome::Quit,
        other => CommandOutcome::Output(format!("Unknown command: {}", other)),
    }
}

/// Renders the `list` output: per domain, the algorithm, aggregate request
/// counters, and each server's configuration and runtime state.
fn render_status(snapshots: &[GroupSnapshot]) -> String {
    let mut out = String::new();
    out.push_str("Upstream Servers Status:\n");
    out.push_str(&"=".repeat(40));
    out.push('\n');

    for group in snapshots {
        out.push_str(&format!("Domain: {}\n", group.domain));
        out.push_str(&format!("Algorithm: {}\n", group.algorithm));
        out.push_str(&format!(
            "  Requests: total={} failed={}\n",
            group.stats.total_requests, group.stats.failed_requests
        ));
        for (i, server) in group.servers.iter().enumerate() {
            let status = if server.healthy { "Healthy" } else { "Unhealthy" };
            let last_rt = match server.last_response_time {
                Some(rt) => format!("{:.4}s", rt.as_secs_f64()),
                None => "n/a".to_string(),
            };
            out.push_str(&format!(
                "    [{}] {}:{} weight={} timeout={}s status={} last_rt={}\n",
                i + 1,
                server.host,
                server.port,
                server.weight,
                server.timeout.as_secs(),
                status,
                last_rt,
            ));
        }
        out.push('\n');
    }

    // Drop the trailing blank line; the console adds its own newline.
    out.trim_end().to_string()
}

/// Renders the process metrics in the Prometheus text exposition format.
fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("Error encoding metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
