//! Maps sockets to owning process IDs and process IDs to names.
//!
//! The socket side is a `DashMap<(Protocol, port), PID>` rebuilt by the
//! platform scanner every [`PROCESS_SCAN_INTERVAL_MS`](crate::config::PROCESS_SCAN_INTERVAL_MS).
//! Process names come from the `sysinfo` crate and are cached per PID so a
//! client poll only ever reads the cache.

use std::collections::HashSet;
use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Transport protocol of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Cached identity of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: String,
}

pub struct ProcessMapper {
    port_map: DashMap<(Protocol, u16), u32>,
    info_cache: DashMap<u32, ProcessInfo>,
    system: Mutex<System>,
}

impl ProcessMapper {
    pub fn new() -> Self {
        Self {
            port_map: DashMap::new(),
            info_cache: DashMap::new(),
            system: Mutex::new(System::new()),
        }
    }

    /// Owning PID of a local port, if the last scan saw one.
    pub fn lookup_pid(&self, protocol: Protocol, local_port: u16) -> Option<u32> {
        self.port_map.get(&(protocol, local_port)).map(|r| *r)
    }

    /// Replace the port map with the result of a fresh socket-table scan.
    ///
    /// New entries are inserted before stale ones are dropped so concurrent
    /// lookups never observe an empty map mid-refresh.
    pub fn replace_port_map(&self, entries: impl IntoIterator<Item = ((Protocol, u16), u32)>) {
        let mut seen = HashSet::new();
        for (key, pid) in entries {
            if key.1 > 0 && pid > 0 {
                self.port_map.insert(key, pid);
                seen.insert(key);
            }
        }
        self.port_map.retain(|key, _| seen.contains(key));
    }

    pub fn port_count(&self) -> usize {
        self.port_map.len()
    }

    /// Resolve and cache a PID's name via `sysinfo`.
    ///
    /// Called from ingestion loops, never from client requests.
    pub fn resolve(&self, pid: u32) -> Option<ProcessInfo> {
        if let Some(info) = self.info_cache.get(&pid) {
            return Some(info.clone());
        }
        let info = {
            let mut system = self.system.lock().unwrap();
            let sys_pid = Pid::from_u32(pid);
            system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
            system.process(sys_pid).map(|p| ProcessInfo {
                name: p.name().to_string_lossy().into_owned(),
            })
        }?;
        self.info_cache.insert(pid, info.clone());
        Some(info)
    }

    /// Cached process info without touching the OS.
    pub fn get_process_info(&self, pid: u32) -> Option<ProcessInfo> {
        self.info_cache.get(&pid).map(|r| r.clone())
    }

    /// Display name for a PID, falling back to `PID <n>` when unresolved.
    pub fn process_name(&self, pid: u32) -> String {
        self.get_process_info(pid)
            .map(|i| i.name)
            .unwrap_or_else(|| format!("PID {pid}"))
    }

    /// Drop cached identities of PIDs no longer present. PIDs get reused, so
    /// a stale name must not outlive its process.
    pub fn forget_except(&self, live_pids: &HashSet<u32>) {
        self.info_cache.retain(|pid, _| live_pids.contains(pid));
    }
}

impl Default for ProcessMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl ProcessMapper {
    fn remember(&self, pid: u32, info: ProcessInfo) {
        self.info_cache.insert(pid, info);
    }
}
