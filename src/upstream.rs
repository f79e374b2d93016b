//! This module defines the core data structures for the load balancer.
//!
//! It contains the `UpstreamServer` struct, which represents the state and
//! configuration of a single backend server, the `Algorithm` enum naming the
//! per-group selection policies, and the `BalancerError` enum for handling
//! all possible error conditions within the application.

use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("Bad Request: Missing Host header")]
    MissingHost,
    #[error("Domain Not Found: {0}")]
    UnknownDomain(String),
    #[error("No Healthy Upstream: {0}")]
    NoHealthyUpstream(String),
    #[error("Gateway Timeout: {0}")]
    UpstreamTimeout(String),
    #[error("Bad Gateway: {0}")]
    UpstreamError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl From<ConfigError> for BalancerError {
    fn from(err: ConfigError) -> Self {
        BalancerError::ConfigError(err.to_string())
    }
}

impl BalancerError {
    /// The HTTP status line this error maps to on the client-facing side.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            BalancerError::MissingHost => (400, "Bad Request"),
            BalancerError::UnknownDomain(_) => (404, "Domain Not Found"),
            BalancerError::NoHealthyUpstream(_) => (503, "No Healthy Upstream"),
            BalancerError::UpstreamTimeout(_) => (504, "Gateway Timeout"),
            BalancerError::UpstreamError(_) => (502, "Bad Gateway"),
            BalancerError::ConfigError(_) | BalancerError::Internal(_) => {
                (500, "Internal Server Error")
            }
        }
    }
}

/// Selection policy for one upstream group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[serde(alias = "round_robin")]
    WeightedRoundRobin,
    #[serde(alias = "least_time")]
    LeastResponseTime,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Algorithm::WeightedRoundRobin => f.write_str("weighted_round_robin"),
            Algorithm::LeastResponseTime => f.write_str("least_response_time"),
        }
    }
}

/// Represents the state and configuration of a single upstream server.
///
/// Identity and configuration are fixed at load time; `healthy` and
/// `last_response_time` are runtime state written by the forwarding feedback
/// path and the health prober, always under the owning group's lock.
#[derive(Debug, Clone)]
pub struct UpstreamServer {
    pub host: String,
    pub port: u16,
    /// Manual share for weighted round-robin. Always >= 1 after config load.
    pub weight: u32,
    /// Connect and I/O deadline for any socket operation against this server.
    pub timeout: Duration,
    /// Whether the server is currently in rotation.
    pub healthy: bool,
    /// Duration of the last successfully forwarded exchange. `None` until the
    /// first success; least-time selection treats `None` as infinitely slow.
    pub last_response_time: Option<Duration>,
}

impl UpstreamServer {
    pub fn new(host: impl Into<String>, port: u16, weight: u32, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
            timeout,
            healthy: true,
            last_response_time: None,
        }
    }

    /// `host:port`, used for logging and metric labels.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The result of one successfully forwarded request/response exchange.
#[derive(Debug)]
pub struct ForwardOutcome {
    /// Wall-clock time from connect-start until the response was fully read.
    pub elapsed: Duration,
    /// The upstream response as relayed to the client.
    pub response: Bytes,
}
