//! Per-connection and per-process traffic accounting.
//!
//! Connections are tracked in a `DashMap` keyed by protocol plus
//! [`make_connection_key`], so repeated observations of one socket across
//! polling cycles update a single entry. Per-process byte totals are kept
//! separately and survive pruning of the connections that produced them.
//! Callers only ever receive rebuilt snapshots.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::core::process_mapper::{ProcessMapper, Protocol};

/// Render a directional 4-tuple as `"{local}:{port}-{remote}:{port}"`.
///
/// Swapping local and remote yields a different key.
pub fn make_connection_key(
    local_addr: IpAddr,
    local_port: u16,
    remote_addr: IpAddr,
    remote_port: u16,
) -> String {
    format!("{local_addr}:{local_port}-{remote_addr}:{remote_port}")
}

/// Byte counters of one connection, as handed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionByteStats {
    pub connection_key: String,
    pub protocol: Protocol,
    pub local_address: IpAddr,
    pub local_port: u16,
    pub remote_address: IpAddr,
    pub remote_port: u16,
    pub state: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One process with its live connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConnectionStats {
    pub process_id: u32,
    pub process_name: String,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub active_connection_count: u32,
    pub connections: Vec<ConnectionByteStats>,
}

/// One process's byte totals without the connection list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessByteStats {
    pub process_id: u32,
    pub process_name: String,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub active_connection_count: u32,
}

/// A socket seen in an OS table scan, already attributed to a PID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedConnection {
    pub pid: u32,
    pub protocol: Protocol,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: String,
}

#[derive(Debug)]
struct TrackedConnection {
    pid: u32,
    protocol: Protocol,
    local: SocketAddr,
    remote: SocketAddr,
    state: String,
    bytes_sent: u64,
    bytes_received: u64,
    last_activity: Instant,
}

#[derive(Debug)]
struct ProcessTotals {
    bytes_sent: u64,
    bytes_received: u64,
    last_activity: Instant,
}

type TableKey = (Protocol, String);

fn table_key(protocol: Protocol, local: SocketAddr, remote: SocketAddr) -> TableKey {
    (
        protocol,
        make_connection_key(local.ip(), local.port(), remote.ip(), remote.port()),
    )
}

/// Thread-safe connection table. Written by one ingestion loop, read by any number of clients.
pub struct ConnectionTable {
    connections: DashMap<TableKey, TrackedConnection>,
    totals: DashMap<u32, ProcessTotals>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            totals: DashMap::new(),
        }
    }

    /// Add observed bytes for one connection. Called from the capture loop.
    pub fn record_bytes(
        &self,
        pid: u32,
        protocol: Protocol,
        local: SocketAddr,
        remote: SocketAddr,
        sent: u64,
        received: u64,
    ) {
        let now = Instant::now();
        self.connections
            .entry(table_key(protocol, local, remote))
            .and_modify(|c| {
                c.pid = pid;
                c.bytes_sent = c.bytes_sent.saturating_add(sent);
                c.bytes_received = c.bytes_received.saturating_add(received);
                c.last_activity = now;
            })
            .or_insert_with(|| TrackedConnection {
                pid,
                protocol,
                local,
                remote,
                state: "ACTIVE".to_string(),
                bytes_sent: sent,
                bytes_received: received,
                last_activity: now,
            });
        self.add_totals(pid, sent, received, now);
    }

    /// Reconcile the table with a full OS table scan: upsert what was seen,
    /// drop connections that disappeared. Returns the number of live entries.
    pub fn sync_connections(&self, observed: &[ObservedConnection]) -> usize {
        let now = Instant::now();
        let mut seen = HashSet::with_capacity(observed.len());
        for conn in observed {
            let key = table_key(conn.protocol, conn.local, conn.remote);
            seen.insert(key.clone());
            self.connections
                .entry(key)
                .and_modify(|c| {
                    // Presence in the OS table counts as activity.
                    c.last_activity = now;
                    c.pid = conn.pid;
                    c.state.clone_from(&conn.state);
                })
                .or_insert_with(|| TrackedConnection {
                    pid: conn.pid,
                    protocol: conn.protocol,
                    local: conn.local,
                    remote: conn.remote,
                    state: conn.state.clone(),
                    bytes_sent: 0,
                    bytes_received: 0,
                    last_activity: now,
                });
            self.add_totals(conn.pid, 0, 0, now);
        }
        self.connections.retain(|key, _| seen.contains(key));
        self.connections.len()
    }

    /// Prune idle connections, then processes with no connections left that
    /// have also been idle.
    pub fn remove_stale(&self, max_connection_idle: Duration, max_process_idle: Duration) {
        self.connections
            .retain(|_, c| c.last_activity.elapsed() < max_connection_idle);
        let live = self.live_pids();
        self.totals.retain(|pid, t| {
            live.contains(pid) || t.last_activity.elapsed() < max_process_idle
        });
    }

    /// PIDs owning at least one live connection.
    pub fn live_pids(&self) -> HashSet<u32> {
        self.connections.iter().map(|c| c.pid).collect()
    }

    /// PIDs with any recorded state.
    pub fn known_pids(&self) -> HashSet<u32> {
        let mut pids = self.live_pids();
        pids.extend(self.totals.iter().map(|t| *t.key()));
        pids
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn clear(&self) {
        self.connections.clear();
        self.totals.clear();
    }

    /// Per-process snapshot including every live connection, ordered by PID.
    pub fn connection_stats(&self, mapper: &ProcessMapper) -> Vec<ProcessConnectionStats> {
        let mut by_pid: BTreeMap<u32, Vec<ConnectionByteStats>> = BTreeMap::new();
        for entry in self.connections.iter() {
            let c = entry.value();
            by_pid.entry(c.pid).or_default().push(ConnectionByteStats {
                connection_key: entry.key().1.clone(),
                protocol: c.protocol,
                local_address: c.local.ip(),
                local_port: c.local.port(),
                remote_address: c.remote.ip(),
                remote_port: c.remote.port(),
                state: c.state.clone(),
                bytes_sent: c.bytes_sent,
                bytes_received: c.bytes_received,
            });
        }
        for pid in self.totals.iter().map(|t| *t.key()) {
            by_pid.entry(pid).or_default();
        }

        by_pid
            .into_iter()
            .map(|(pid, mut connections)| {
                connections.sort_by(|a, b| a.connection_key.cmp(&b.connection_key));
                let (sent, received) = self.totals_for(pid);
                ProcessConnectionStats {
                    process_id: pid,
                    process_name: mapper.process_name(pid),
                    total_bytes_sent: sent,
                    total_bytes_received: received,
                    active_connection_count: connections.len() as u32,
                    connections,
                }
            })
            .collect()
    }

    /// Per-process totals, optionally restricted to `pid_filter` (empty = all).
    pub fn process_stats(&self, mapper: &ProcessMapper, pid_filter: &[u32]) -> Vec<ProcessByteStats> {
        let mut counts: BTreeMap<u32, u32> = BTreeMap::new();
        for entry in self.connections.iter() {
            *counts.entry(entry.pid).or_default() += 1;
        }
        for pid in self.totals.iter().map(|t| *t.key()) {
            counts.entry(pid).or_default();
        }

        counts
            .into_iter()
            .filter(|(pid, _)| pid_filter.is_empty() || pid_filter.contains(pid))
            .map(|(pid, active)| {
                let (sent, received) = self.totals_for(pid);
                ProcessByteStats {
                    process_id: pid,
                    process_name: mapper.process_name(pid),
                    total_bytes_sent: sent,
                    total_bytes_received: received,
                    active_connection_count: active,
                }
            })
            .collect()
    }

    fn add_totals(&self, pid: u32, sent: u64, received: u64, now: Instant) {
        let mut totals = self.totals.entry(pid).or_insert_with(|| ProcessTotals {
            bytes_sent: 0,
            bytes_received: 0,
            last_activity: now,
        });
        totals.bytes_sent = totals.bytes_sent.saturating_add(sent);
        totals.bytes_received = totals.bytes_received.saturating_add(received);
        if sent > 0 || received > 0 {
            totals.last_activity = now;
        }
    }

    fn totals_for(&self, pid: u32) -> (u64, u64) {
        self.totals
            .get(&pid)
            .map(|t| (t.bytes_sent, t.bytes_received))
            .unwrap_or((0, 0))
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{Ipv4Addr, Ipv6Addr};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn observed(pid: u32, local: &str, remote: &str) -> ObservedConnection {
        ObservedConnection {
            pid,
            protocol: Protocol::Tcp,
            local: addr(local),
            remote: addr(remote),
            state: "ESTABLISHED".into(),
        }
    }

    #[test]
    fn test_connection_key_format() {
        let key = make_connection_key(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            51000,
            IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            443,
        );
        assert_eq!(key, "10.0.0.2:51000-93.184.216.34:443");
    }

    #[test]
    fn test_swapped_endpoints_produce_different_keys() {
        let a = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let b = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_ne!(
            make_connection_key(a, 1000, b, 2000),
            make_connection_key(b, 2000, a, 1000)
        );
        assert_ne!(
            make_connection_key(a, 1000, a, 2000),
            make_connection_key(a, 2000, a, 1000)
        );
    }

    #[test]
    fn test_record_bytes_accumulates_per_connection_and_process() {
        let table = ConnectionTable::new();
        let mapper = ProcessMapper::new();
        let local = addr("10.0.0.2:51000");
        let remote = addr("1.1.1.1:443");
        table.record_bytes(7, Protocol::Tcp, local, remote, 100, 0);
        table.record_bytes(7, Protocol::Tcp, local, remote, 50, 400);
        table.record_bytes(7, Protocol::Udp, addr("10.0.0.2:5353"), addr("8.8.8.8:53"), 60, 120);

        let stats = table.connection_stats(&mapper);
        assert_eq!(stats.len(), 1);
        let proc = &stats[0];
        assert_eq!(proc.process_id, 7);
        assert_eq!(proc.process_name, "PID 7");
        assert_eq!(proc.total_bytes_sent, 210);
        assert_eq!(proc.total_bytes_received, 520);
        assert_eq!(proc.active_connection_count, 2);
        let tcp = proc
            .connections
            .iter()
            .find(|c| c.protocol == Protocol::Tcp)
            .unwrap();
        assert_eq!(tcp.bytes_sent, 150);
        assert_eq!(tcp.bytes_received, 400);
        assert_eq!(tcp.connection_key, "10.0.0.2:51000-1.1.1.1:443");
    }

    #[test]
    fn test_sync_upserts_and_drops_closed_connections() {
        let table = ConnectionTable::new();
        let first = vec![
            observed(1, "127.0.0.1:5000", "127.0.0.1:80"),
            observed(2, "127.0.0.1:5001", "127.0.0.1:443"),
        ];
        assert_eq!(table.sync_connections(&first), 2);
        assert_eq!(table.sync_connections(&first), 2, "re-sync deduplicates");

        let second = vec![observed(2, "127.0.0.1:5001", "127.0.0.1:443")];
        assert_eq!(table.sync_connections(&second), 1);
        assert_eq!(table.live_pids(), HashSet::from([2]));
        assert_eq!(table.known_pids(), HashSet::from([1, 2]));
    }

    #[test]
    fn test_resynced_connection_survives_idle_prune() {
        let table = ConnectionTable::new();
        let seen = vec![observed(1, "127.0.0.1:5000", "127.0.0.1:80")];
        table.sync_connections(&seen);
        std::thread::sleep(Duration::from_millis(150));
        table.sync_connections(&seen);

        table.remove_stale(Duration::from_millis(100), Duration::from_secs(3600));
        assert_eq!(table.connection_count(), 1);
        assert_eq!(table.live_pids(), HashSet::from([1]));
    }

    #[test]
    fn test_unseen_connection_is_pruned_when_idle() {
        let table = ConnectionTable::new();
        table.sync_connections(&[observed(1, "127.0.0.1:5000", "127.0.0.1:80")]);
        std::thread::sleep(Duration::from_millis(150));
        table.remove_stale(Duration::from_millis(100), Duration::from_secs(3600));
        assert_eq!(table.connection_count(), 0);
    }

    #[test]
    fn test_process_stats_filter_and_counts() {
        let table = ConnectionTable::new();
        let mapper = ProcessMapper::new();
        table.sync_connections(&[
            observed(1, "127.0.0.1:5000", "127.0.0.1:80"),
            observed(1, "127.0.0.1:5002", "127.0.0.1:81"),
            observed(2, "127.0.0.1:5001", "127.0.0.1:443"),
        ]);

        let all = table.process_stats(&mapper, &[]);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].process_id, 1);
        assert_eq!(all[0].active_connection_count, 2);

        let only_two = table.process_stats(&mapper, &[2]);
        assert_eq!(only_two.len(), 1);
        assert_eq!(only_two[0].process_id, 2);

        assert!(table.process_stats(&mapper, &[99]).is_empty());
    }

    #[test]
    fn test_totals_survive_connection_pruning() {
        let table = ConnectionTable::new();
        let mapper = ProcessMapper::new();
        table.record_bytes(3, Protocol::Tcp, addr("10.0.0.2:1"), addr("1.1.1.1:2"), 10, 20);
        table.remove_stale(Duration::ZERO, Duration::from_secs(3600));
        assert_eq!(table.connection_count(), 0);

        let stats = table.process_stats(&mapper, &[]);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total_bytes_sent, 10);
        assert_eq!(stats[0].active_connection_count, 0);

        table.remove_stale(Duration::ZERO, Duration::ZERO);
        assert!(table.process_stats(&mapper, &[]).is_empty());
    }

    #[test]
    fn test_empty_table_yields_empty_snapshots() {
        let table = ConnectionTable::new();
        let mapper = ProcessMapper::new();
        assert!(table.connection_stats(&mapper).is_empty());
        assert!(table.process_stats(&mapper, &[]).is_empty());
    }

    #[test]
    fn test_clear_resets_everything() {
        let table = ConnectionTable::new();
        table.record_bytes(3, Protocol::Tcp, addr("10.0.0.2:1"), addr("1.1.1.1:2"), 10, 20);
        table.clear();
        assert_eq!(table.connection_count(), 0);
        assert!(table.known_pids().is_empty());
    }
}
