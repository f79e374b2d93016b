//! This module contains the server selection strategies for the load balancer.
//!
//! The primary goal is to decouple the logic of *how* a server is chosen from
//! the `registry` module, which is responsible for managing state. Both
//! strategies operate on a plain server slice plus the group's rotation
//! cursor, so they can be tested in isolation without locks or sockets.

use std::time::Duration;

use crate::upstream::{Algorithm, UpstreamServer};

/// Selects one healthy server from `servers`, returning its index.
///
/// Both strategies consider only servers with `healthy == true`; `None` means
/// the group currently has no healthy member.
///
/// - **Weighted round-robin** walks the healthy list accumulating weight and
///   picks the first server whose cumulative weight exceeds `cursor mod T`,
///   where `T` is the weight sum of the *currently healthy* set. The cursor
///   then advances by one, modulo `T`. Recomputing `T` per call keeps each
///   server's share proportional to its weight among presently-healthy peers,
///   at the cost of a rotation-phase reset whenever the healthy set changes.
/// - **Least response time** picks the healthy server with the smallest
///   recorded response time. Servers that have never been measured sort as
///   infinitely slow, so they are chosen only when no measured server exists.
///
/// Ties break toward the earliest list position in both strategies.
pub fn select(servers: &[UpstreamServer], algorithm: Algorithm, cursor: &mut u64) -> Option<usize> {
    let healthy: Vec<usize> = servers
        .iter()
        .enumerate()
        .filter(|(_, s)| s.healthy)
        .map(|(i, _)| i)
        .collect();

    if healthy.is_empty() {
        return None;
    }

    match algorithm {
        Algorithm::WeightedRoundRobin => select_weighted_round_robin(servers, &healthy, cursor),
        Algorithm::LeastResponseTime => select_least_response_time(servers, &healthy),
    }
}

fn select_weighted_round_robin(
    servers: &[UpstreamServer],
    healthy: &[usize],
    cursor: &mut u64,
) -> Option<usize> {
    let total: u64 = healthy.iter().map(|&i| u64::from(servers[i].weight)).sum();
    if total == 0 {
        // Config validation guarantees positive weights; hand-built state
        // without them degrades to plain first-healthy.
        return healthy.first().copied();
    }

    let slot = *cursor % total;
    let mut cumulative = 0u64;
    let mut selected = *healthy.last().expect("healthy set is non-empty");
    for &i in healthy {
        cumulative += u64::from(servers[i].weight);
        if slot < cumulative {
            selected = i;
            break;
        }
    }

    *cursor = (*cursor + 1) % total;
    Some(selected)
}

fn select_least_response_time(servers: &[UpstreamServer], healthy: &[usize]) -> Option<usize> {
    let measured = |i: usize| servers[i].last_response_time.unwrap_or(Duration::MAX);

    let mut best = *healthy.first()?;
    let mut best_time = measured(best);
    for &i in &healthy[1..] {
        let time = measured(i);
        // Strict comparison keeps the earliest position on ties.
        if time < best_time {
            best = i;
            best_time = time;
        }
    }
    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn server(port: u16, weight: u32, healthy: bool, last_rt_ms: Option<u64>) -> UpstreamServer {
        UpstreamServer {
            host: "127.0.0.1".to_string(),
            port,
            weight,
            timeout: Duration::from_secs(2),
            healthy,
            last_response_time: last_rt_ms.map(Duration::from_millis),
        }
    }

    fn select_n(
        servers: &[UpstreamServer],
        algorithm: Algorithm,
        cursor: &mut u64,
        n: usize,
    ) -> Vec<usize> {
        (0..n).map(|_| select(servers, algorithm, cursor).unwrap()).collect()
    }

    // --- Weighted round-robin ---

    #[test]
    fn test_wrr_counts_match_weight_ratio_exactly() {
        let servers = vec![
            server(8080, 1, true, None),
            server(8081, 3, true, None),
            server(8082, 2, true, None),
        ];
        let mut cursor = 0;

        let mut counts: HashMap<usize, usize> = HashMap::new();
        for _ in 0..60 {
            let idx = select(&servers, Algorithm::WeightedRoundRobin, &mut cursor).unwrap();
            *counts.entry(idx).or_default() += 1;
        }

        assert_eq!(counts[&0], 10);
        assert_eq!(counts[&1], 30);
        assert_eq!(counts[&2], 20);
    }

    #[test]
    fn test_wrr_selection_sequence_follows_cumulative_walk() {
        // Weights [1, 3]: cumulative bounds 1 and 4, so slots 0..4 map to
        // the first server once and the second three times per rotation.
        let servers = vec![server(8080, 1, true, None), server(8081, 3, true, None)];
        let mut cursor = 0;

        let picks = select_n(&servers, Algorithm::WeightedRoundRobin, &mut cursor, 8);
        assert_eq!(picks, vec![0, 1, 1, 1, 0, 1, 1, 1]);
    }

    #[test]
    fn test_wrr_cursor_wraps_at_healthy_weight_total() {
        let servers = vec![server(8080, 1, true, None), server(8081, 3, true, None)];
        let mut cursor = 0;

        for _ in 0..4 {
            select(&servers, Algorithm::WeightedRoundRobin, &mut cursor).unwrap();
        }
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_wrr_skips_unhealthy_and_recomputes_total() {
        // With the heavy server out, the remaining weights are 1 and 2.
        let servers = vec![
            server(8080, 1, true, None),
            server(8081, 3, false, None),
            server(8082, 2, true, None),
        ];
        let mut cursor = 0;

        let picks = select_n(&servers, Algorithm::WeightedRoundRobin, &mut cursor, 6);
        assert_eq!(picks, vec![0, 2, 2, 0, 2, 2]);
    }

    #[test]
    fn test_wrr_single_healthy_server_always_selected() {
        let servers = vec![
            server(8080, 1, false, None),
            server(8081, 3, true, None),
            server(8082, 2, false, None),
        ];
        let mut cursor = 0;

        for _ in 0..10 {
            assert_eq!(select(&servers, Algorithm::WeightedRoundRobin, &mut cursor), Some(1));
        }
    }

    #[test]
    fn test_wrr_zero_weight_degrades_to_first_healthy() {
        let servers = vec![server(8080, 0, true, None), server(8081, 0, true, None)];
        let mut cursor = 0;
        assert_eq!(select(&servers, Algorithm::WeightedRoundRobin, &mut cursor), Some(0));
    }

    // --- Least response time ---

    #[test]
    fn test_least_time_picks_smallest_measured() {
        let servers = vec![
            server(8083, 1, true, Some(50)),
            server(8084, 1, true, Some(20)),
            server(8085, 1, true, Some(90)),
        ];
        let mut cursor = 0;
        assert_eq!(select(&servers, Algorithm::LeastResponseTime, &mut cursor), Some(1));
    }

    #[test]
    fn test_least_time_tie_breaks_to_earliest_position() {
        let servers = vec![
            server(8083, 1, true, Some(20)),
            server(8084, 1, true, Some(20)),
            server(8085, 1, true, Some(20)),
        ];
        let mut cursor = 0;
        assert_eq!(select(&servers, Algorithm::LeastResponseTime, &mut cursor), Some(0));
    }

    #[test]
    fn test_least_time_unmeasured_is_last_resort() {
        let servers = vec![server(8083, 1, true, None), server(8084, 1, true, Some(900))];
        let mut cursor = 0;
        assert_eq!(select(&servers, Algorithm::LeastResponseTime, &mut cursor), Some(1));
    }

    #[test]
    fn test_least_time_all_unmeasured_picks_first() {
        let servers = vec![server(8083, 1, true, None), server(8084, 1, true, None)];
        let mut cursor = 0;
        assert_eq!(select(&servers, Algorithm::LeastResponseTime, &mut cursor), Some(0));
    }

    #[test]
    fn test_least_time_ignores_unhealthy_fast_server() {
        let servers = vec![server(8083, 1, false, Some(5)), server(8084, 1, true, Some(500))];
        let mut cursor = 0;
        assert_eq!(select(&servers, Algorithm::LeastResponseTime, &mut cursor), Some(1));
    }

    // --- Edge cases common to both ---

    #[test]
    fn test_all_unhealthy_selects_nothing() {
        let servers = vec![server(8080, 1, false, Some(10)), server(8081, 3, false, None)];
        let mut cursor = 0;
        assert_eq!(select(&servers, Algorithm::WeightedRoundRobin, &mut cursor), None);
        assert_eq!(select(&servers, Algorithm::LeastResponseTime, &mut cursor), None);
    }

    #[test]
    fn test_empty_server_list() {
        let mut cursor = 0;
        assert_eq!(select(&[], Algorithm::WeightedRoundRobin, &mut cursor), None);
        assert_eq!(select(&[], Algorithm::LeastResponseTime, &mut cursor), None);
    }

    #[test]
    fn test_cursor_is_left_untouched_when_nothing_selectable() {
        let servers = vec![server(8080, 1, false, None)];
        let mut cursor = 7;
        assert_eq!(select(&servers, Algorithm::WeightedRoundRobin, &mut cursor), None);
        assert_eq!(cursor, 7);
    }
}
