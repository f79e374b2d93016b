//! The core state of the load balancer: the domain-keyed map of upstream
//! groups, with selection, passive outcome recording, and probe application.
//!
//! The group map is fixed after startup. All mutable per-group state (server
//! health and timing, the rotation cursor, request counters) lives behind one
//! `parking_lot::Mutex` per group, so selection's filter-pick-advance sequence
//! and every health/stats write are serialized with each other. Connection
//! handlers and the health prober share this structure through an `Arc`; no
//! lock is ever held across an await point.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{Config, GroupConfig};
use crate::metrics::{
    FORWARD_LATENCY, HEALTHY_SERVERS, PROBE_FAILED, REQUESTS_FAILED, REQUESTS_TOTAL, TOTAL_SERVERS,
};
use crate::strategy;
use crate::upstream::{Algorithm, BalancerError, UpstreamServer};

/// Per-domain request counters, mutated only by forwarding outcomes.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupStats {
    pub total_requests: u64,
    pub failed_requests: u64,
}

/// All mutable state of one upstream group, guarded as a unit.
#[derive(Debug)]
pub struct GroupState {
    pub algorithm: Algorithm,
    pub servers: Vec<UpstreamServer>,
    /// Weighted round-robin rotation cursor; scoped to this group.
    pub cursor: u64,
    pub stats: GroupStats,
}

/// A selected server, detached from the registry lock.
///
/// `index` identifies the server within its group for outcome recording;
/// the member list never changes after startup, so the index stays valid.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    pub index: usize,
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl ServerHandle {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One server to be probed, snapshotted outside the group lock.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub domain: String,
    pub index: usize,
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

/// Point-in-time view of a group for the control surface.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub domain: String,
    pub algorithm: Algorithm,
    pub stats: GroupStats,
    pub servers: Vec<ServerSnapshot>,
}

#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub timeout: Duration,
    pub healthy: bool,
    pub last_response_time: Option<Duration>,
}

#[derive(Debug)]
pub struct Registry {
    groups: HashMap<String, Mutex<GroupState>>,
}

impl Registry {
    /// Builds the registry from a finalized configuration.
    pub fn from_config(config: &Config) -> Self {
        // Finalize guarantees the groups map is present and every entry valid.
        let group_configs = config.groups.as_ref().expect("configuration was not finalized");

        let mut groups = HashMap::with_capacity(group_configs.len());
        let mut server_count = 0usize;
        for (domain, group_cfg) in group_configs {
            let state = GroupState::from_config(group_cfg);
            server_count += state.servers.len();
            info!(
                domain = %domain,
                algorithm = %state.algorithm,
                servers = state.servers.len(),
                "Registered upstream group"
            );
            groups.insert(domain.clone(), Mutex::new(state));
        }

        TOTAL_SERVERS.set(server_count as i64);
        HEALTHY_SERVERS.set(server_count as i64);

        Self { groups }
    }

    /// Selects a healthy server for `domain` using the group's algorithm and
    /// advances the group's rotation state.
    pub fn select(&self, domain: &str) -> Result<ServerHandle, BalancerError> {
        let group = self
            .groups
            .get(domain)
            .ok_or_else(|| BalancerError::UnknownDomain(domain.to_string()))?;

        let mut state = group.lock();
        let algorithm = state.algorithm;
        let GroupState { servers, cursor, .. } = &mut *state;
        let index = strategy::select(servers, algorithm, cursor)
            .ok_or_else(|| BalancerError::NoHealthyUpstream(domain.to_string()))?;

        let server = &servers[index];
        Ok(ServerHandle {
            index,
            host: server.host.clone(),
            port: server.port,
            timeout: server.timeout,
        })
    }

    /// Passive feedback: a forwarded exchange completed. Marks the server
    /// healthy and records the measured response time.
    pub fn record_success(&self, domain: &str, index: usize, elapsed: Duration) {
        let Some(group) = self.groups.get(domain) else { return };
        let mut state = group.lock();
        state.stats.total_requests += 1;
        if let Some(server) = state.servers.get_mut(index) {
            server.healthy = true;
            server.last_response_time = Some(elapsed);
        }
        REQUESTS_TOTAL.with_label_values(&[domain]).inc();
        FORWARD_LATENCY.with_label_values(&[domain]).observe(elapsed.as_secs_f64());
    }

    /// Passive feedback: forwarding failed. Takes the server out of rotation
    /// until a probe or a later success brings it back.
    pub fn record_failure(&self, domain: &str, index: usize) {
        let Some(group) = self.groups.get(domain) else { return };
        let mut state = group.lock();
        state.stats.failed_requests += 1;
        if let Some(server) = state.servers.get_mut(index) {
            if server.healthy {
                warn!(domain = %domain, server = %server.addr(), "Marked server unhealthy after failed forward");
            }
            server.healthy = false;
        }
        REQUESTS_FAILED.with_label_values(&[domain]).inc();
    }

    /// Snapshots every server for one probe cycle.
    pub fn probe_targets(&self) -> Vec<ProbeTarget> {
        let mut targets = Vec::new();
        for (domain, group) in &self.groups {
            let state = group.lock();
            for (index, server) in state.servers.iter().enumerate() {
                targets.push(ProbeTarget {
                    domain: domain.clone(),
                    index,
                    host: server.host.clone(),
                    port: server.port,
                    timeout: server.timeout,
                });
            }
        }
        targets
    }

    /// Applies one active probe verdict, logging health transitions.
    pub fn apply_probe(&self, domain: &str, index: usize, healthy: bool) {
        let Some(group) = self.groups.get(domain) else { return };
        let mut state = group.lock();
        let Some(server) = state.servers.get_mut(index) else { return };

        let was_healthy = server.healthy;
        server.healthy = healthy;
        if healthy && !was_healthy {
            info!(domain = %domain, server = %server.addr(), "Server recovered, back in rotation");
        } else if !healthy {
            PROBE_FAILED.with_label_values(&[&server.addr()]).inc();
            if was_healthy {
                warn!(domain = %domain, server = %server.addr(), "Server failed health probe, out of rotation");
            }
        }
    }

    /// Recomputes the healthy-server gauge. Called once per probe cycle.
    pub fn refresh_health_gauge(&self) {
        let healthy: usize = self
            .groups
            .values()
            .map(|group| group.lock().servers.iter().filter(|s| s.healthy).count())
            .sum();
        HEALTHY_SERVERS.set(healthy as i64);
    }

    /// Point-in-time view of every group, ordered by domain for stable output.
    pub fn snapshot(&self) -> Vec<GroupSnapshot> {
        let mut snapshots: Vec<GroupSnapshot> = self
            .groups
            .iter()
            .map(|(domain, group)| {
                let state = group.lock();
                GroupSnapshot {
                    domain: domain.clone(),
                    algorithm: state.algorithm,
                    stats: state.stats,
                    servers: state
                        .servers
                        .iter()
                        .map(|s| ServerSnapshot {
                            host: s.host.clone(),
                            port: s.port,
                            weight: s.weight,
                            timeout: s.timeout,
                            healthy: s.healthy,
                            last_response_time: s.last_response_time,
                        })
                        .collect(),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.domain.cmp(&b.domain));
        snapshots
    }
}

impl GroupState {
    fn from_config(config: &GroupConfig) -> Self {
        let servers = config
            .servers
            .iter()
            .map(|entry| UpstreamServer::new(entry.host.clone(), entry.port, entry.weight, entry.timeout()))
            .collect();
        Self { algorithm: config.algorithm, servers, cursor: 0, stats: GroupStats::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerEntry;

    fn test_registry() -> Registry {
        let mut groups = HashMap::new();
        groups.insert(
            "a.example".to_string(),
            GroupConfig {
                algorithm: Algorithm::WeightedRoundRobin,
                servers: vec![
                    ServerEntry {
                        host: "127.0.0.1".to_string(),
                        port: 9001,
                        weight: 1,
                        timeout_secs: 2,
                    },
                    ServerEntry {
                        host: "127.0.0.1".to_string(),
                        port: 9002,
                        weight: 3,
                        timeout_secs: 2,
                    },
                ],
            },
        );
        groups.insert(
            "b.example".to_string(),
            GroupConfig {
                algorithm: Algorithm::LeastResponseTime,
                servers: vec![
                    ServerEntry {
                        host: "127.0.0.1".to_string(),
                        port: 9003,
                        weight: 1,
                        timeout_secs: 2,
                    },
                    ServerEntry {
                        host: "127.0.0.1".to_string(),
                        port: 9004,
                        weight: 1,
                        timeout_secs: 2,
                    },
                ],
            },
        );
        let config = Config { server: None, balancer: None, groups: Some(groups) };
        Registry::from_config(&config)
    }

    #[test]
    fn test_unknown_domain() {
        let registry = test_registry();
        assert!(matches!(
            registry.select("missing.example"),
            Err(BalancerError::UnknownDomain(_))
        ));
    }

    #[test]
    fn test_selection_advances_rotation() {
        let registry = test_registry();
        // Weights [1, 3]: one rotation serves 9001 once and 9002 three times.
        let picks: Vec<u16> =
            (0..4).map(|_| registry.select("a.example").unwrap().port).collect();
        assert_eq!(picks, vec![9001, 9002, 9002, 9002]);
    }

    #[test]
    fn test_record_failure_removes_from_rotation() {
        let registry = test_registry();
        let first = registry.select("a.example").unwrap();
        registry.record_failure("a.example", first.index);

        for _ in 0..4 {
            let next = registry.select("a.example").unwrap();
            assert_ne!(next.index, first.index);
        }

        let snapshot = &registry.snapshot()[0];
        assert_eq!(snapshot.stats.failed_requests, 1);
        assert!(!snapshot.servers[first.index].healthy);
    }

    #[test]
    fn test_record_success_restores_and_times() {
        let registry = test_registry();
        registry.record_failure("a.example", 0);
        registry.record_success("a.example", 0, Duration::from_millis(25));

        let snapshot = &registry.snapshot()[0];
        assert!(snapshot.servers[0].healthy);
        assert_eq!(snapshot.servers[0].last_response_time, Some(Duration::from_millis(25)));
        assert_eq!(snapshot.stats.total_requests, 1);
        assert_eq!(snapshot.stats.failed_requests, 1);
    }

    #[test]
    fn test_all_unhealthy_reports_no_healthy_upstream() {
        let registry = test_registry();
        registry.record_failure("a.example", 0);
        registry.record_failure("a.example", 1);
        assert!(matches!(
            registry.select("a.example"),
            Err(BalancerError::NoHealthyUpstream(_))
        ));
    }

    #[test]
    fn test_least_time_uses_recorded_measurements() {
        let registry = test_registry();
        registry.record_success("b.example", 0, Duration::from_millis(50));
        registry.record_success("b.example", 1, Duration::from_millis(20));
        assert_eq!(registry.select("b.example").unwrap().port, 9004);
    }

    #[test]
    fn test_probe_flips_health_both_ways() {
        let registry = test_registry();
        registry.apply_probe("a.example", 0, false);
        let snapshot = &registry.snapshot()[0];
        assert!(!snapshot.servers[0].healthy);

        registry.apply_probe("a.example", 0, true);
        let snapshot = &registry.snapshot()[0];
        assert!(snapshot.servers[0].healthy);
    }

    #[test]
    fn test_probe_targets_cover_every_server() {
        let registry = test_registry();
        let targets = registry.probe_targets();
        assert_eq!(targets.len(), 4);
        assert!(targets.iter().any(|t| t.domain == "a.example" && t.port == 9001));
        assert!(targets.iter().any(|t| t.domain == "b.example" && t.port == 9004));
    }

    #[test]
    fn test_snapshot_is_sorted_by_domain() {
        let registry = test_registry();
        let snapshots = registry.snapshot();
        assert_eq!(snapshots[0].domain, "a.example");
        assert_eq!(snapshots[1].domain, "b.example");
    }
}
