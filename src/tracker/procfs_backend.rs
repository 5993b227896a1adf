//! Linux connection tracking by polling `/proc/net/{tcp,tcp6,udp,udp6}`.
//!
//! Each cycle parses the socket tables, attributes sockets to PIDs through
//! the `/proc/<pid>/fd` socket links, and reconciles the connection table.
//! The tables carry no byte counters, so per-connection bytes stay at zero;
//! the backend reports which processes hold which connections.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::PROCESS_SCAN_INTERVAL_MS;
use crate::core::proc_net::{read_socket_tables, scan_socket_owners};
use crate::core::process_mapper::ProcessMapper;
use crate::core::traffic::{ConnectionTable, ObservedConnection};
use crate::tracker::{sleep_until_shutdown, ConnectionTracker, TrackerCore};

pub struct ProcfsTracker {
    core: TrackerCore,
    proc_root: PathBuf,
    poll_interval: Duration,
}

impl ProcfsTracker {
    pub fn new() -> Self {
        Self::with_options(
            PathBuf::from("/proc"),
            Duration::from_millis(PROCESS_SCAN_INTERVAL_MS),
        )
    }

    /// Poll an alternative procfs root, e.g. a fixture directory.
    pub fn with_options(proc_root: PathBuf, poll_interval: Duration) -> Self {
        Self {
            core: TrackerCore::new(),
            proc_root,
            poll_interval,
        }
    }
}

impl Default for ProcfsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker for ProcfsTracker {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn start(&self) -> Result<()> {
        self.core.start_with(self.name(), || {
            let shutdown = self.core.shutdown_flag();
            let table = Arc::clone(&self.core.table);
            let mapper = Arc::clone(&self.core.mapper);
            let proc_root = self.proc_root.clone();
            let interval = self.poll_interval;

            let handle = std::thread::Builder::new()
                .name("procfs-poll".into())
                .spawn(move || run_poll_loop(&proc_root, &table, &mapper, &shutdown, interval))?;
            Ok(vec![handle])
        })
    }

    fn core(&self) -> &TrackerCore {
        &self.core
    }
}

fn run_poll_loop(
    proc_root: &Path,
    table: &ConnectionTable,
    mapper: &ProcessMapper,
    shutdown: &AtomicBool,
    interval: Duration,
) {
    tracing::info!("procfs polling started on {}", proc_root.display());
    while !shutdown.load(Ordering::Relaxed) {
        let live = poll_once(proc_root, table, mapper);
        tracing::trace!(connections = live, "procfs poll cycle complete");
        sleep_until_shutdown(shutdown, interval);
    }
    tracing::info!("procfs polling stopped");
}

/// One scan-attribute-reconcile cycle. Returns the live connection count.
pub fn poll_once(proc_root: &Path, table: &ConnectionTable, mapper: &ProcessMapper) -> usize {
    let entries = read_socket_tables(proc_root);
    let owners = scan_socket_owners(proc_root);

    let observed: Vec<ObservedConnection> = entries
        .iter()
        .filter(|e| e.is_connection() && e.inode != 0)
        .filter_map(|e| {
            let pid = *owners.get(&e.inode)?;
            Some(ObservedConnection {
                pid,
                protocol: e.protocol,
                local: e.local,
                remote: e.remote,
                state: e.state_name().to_string(),
            })
        })
        .collect();

    let live = table.sync_connections(&observed);
    for pid in table.live_pids() {
        mapper.resolve(pid);
    }
    live
}
