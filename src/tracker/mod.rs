//! Platform connection trackers.
//!
//! Each platform observes OS-level socket activity on background threads and
//! feeds a shared [`ConnectionTable`]:
//! - Linux: `/proc/net` table polling (`procfs_backend`)
//! - Windows: WinDivert SNIFF capture + iphlpapi owner tables (`windivert_backend`)
//! - elsewhere: [`UnsupportedTracker`], which never collects anything
//!
//! Client polls only read snapshots; they never drive collection.

#[cfg(target_os = "linux")]
pub mod procfs_backend;

#[cfg(target_os = "windows")]
pub mod windivert_backend;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::core::process_mapper::{ProcessMapper, Protocol};
use crate::core::traffic::ConnectionTable;
use crate::ipc::messages::{ConnectionStatsResponse, ProcessStatsResponse};

/// Lifecycle of a tracker. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    NotStarted,
    Running,
    Stopped,
}

/// Capability shared by every platform backend.
///
/// Stats calls are valid in every state and succeed with empty results
/// outside [`TrackerState::Running`]. `stop` is idempotent and never blocks on
/// the ingestion threads.
pub trait ConnectionTracker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Spawn the ingestion threads. A no-op when already running; an error
    /// once stopped.
    fn start(&self) -> anyhow::Result<()>;

    fn core(&self) -> &TrackerCore;

    fn state(&self) -> TrackerState {
        self.core().state()
    }

    fn connection_stats(&self) -> ConnectionStatsResponse {
        self.core().connection_stats()
    }

    fn process_stats(&self, pid_filter: &[u32]) -> ProcessStatsResponse {
        self.core().process_stats(pid_filter)
    }

    /// Drop idle connections and processes.
    fn prune_stale(&self, max_connection_idle: Duration, max_process_idle: Duration) {
        let core = self.core();
        core.table.remove_stale(max_connection_idle, max_process_idle);
        core.mapper.forget_except(&core.table.known_pids());
    }

    fn stop(&self) {
        self.core().stop(self.name());
    }
}

/// State shared by all backends: lifecycle, shutdown flag, accounting table.
pub struct TrackerCore {
    state: Mutex<TrackerState>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    pub table: Arc<ConnectionTable>,
    pub mapper: Arc<ProcessMapper>,
}

impl TrackerCore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::NotStarted),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            table: Arc::new(ConnectionTable::new()),
            mapper: Arc::new(ProcessMapper::new()),
        }
    }

    pub fn state(&self) -> TrackerState {
        *self.state.lock().unwrap()
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run `spawn` under the state lock and move to `Running` if it succeeds.
    /// A failed spawn leaves the tracker in `NotStarted`.
    pub fn start_with(
        &self,
        name: &str,
        spawn: impl FnOnce() -> anyhow::Result<Vec<JoinHandle<()>>>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        match *state {
            TrackerState::Running => return Ok(()),
            TrackerState::Stopped => {
                anyhow::bail!("{name} tracker has been stopped and cannot be restarted")
            }
            TrackerState::NotStarted => {}
        }
        let handles = spawn()?;
        self.threads.lock().unwrap().extend(handles);
        *state = TrackerState::Running;
        tracing::info!("{name} connection tracker started");
        Ok(())
    }

    pub fn stop(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if *state == TrackerState::Stopped {
            return;
        }
        self.shutdown.store(true, Ordering::Relaxed);
        // Threads observe the flag on their next iteration; dropping the
        // handles detaches them instead of joining.
        self.threads.lock().unwrap().clear();
        self.table.clear();
        *state = TrackerState::Stopped;
        tracing::info!("{name} connection tracker stopped");
    }

    pub fn connection_stats(&self) -> ConnectionStatsResponse {
        let processes = if self.state() == TrackerState::Running {
            self.table.connection_stats(&self.mapper)
        } else {
            Vec::new()
        };
        ConnectionStatsResponse {
            success: true,
            processes,
            truncated: false,
        }
    }

    pub fn process_stats(&self, pid_filter: &[u32]) -> ProcessStatsResponse {
        let processes = if self.state() == TrackerState::Running {
            self.table.process_stats(&self.mapper, pid_filter)
        } else {
            Vec::new()
        };
        ProcessStatsResponse {
            success: true,
            processes,
            truncated: false,
        }
    }
}

impl Default for TrackerCore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TrackerCore {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Tracker for platforms without a backend. Always reports empty stats.
pub struct UnsupportedTracker {
    core: TrackerCore,
}

impl UnsupportedTracker {
    pub fn new() -> Self {
        Self {
            core: TrackerCore::new(),
        }
    }
}

impl Default for UnsupportedTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker for UnsupportedTracker {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn start(&self) -> anyhow::Result<()> {
        anyhow::bail!(
            "connection tracking is not supported on {}",
            std::env::consts::OS
        )
    }

    fn core(&self) -> &TrackerCore {
        &self.core
    }
}

/// Pick the backend for the running OS.
pub fn create_tracker() -> Arc<dyn ConnectionTracker> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(procfs_backend::ProcfsTracker::new())
    }
    #[cfg(target_os = "windows")]
    {
        Arc::new(windivert_backend::WinDivertTracker::new())
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Arc::new(UnsupportedTracker::new())
    }
}

/// Sleep up to `total`, waking early once `shutdown` is set.
pub(crate) fn sleep_until_shutdown(shutdown: &AtomicBool, total: Duration) {
    const SLICE: Duration = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }
}

/// Transport-level facts extracted from a raw IP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub protocol: Protocol,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    /// Total IP packet length from the header.
    pub length: u64,
}

/// Parse an IPv4/IPv6 TCP or UDP packet header.
pub fn parse_ip_packet(data: &[u8]) -> Option<PacketInfo> {
    if data.is_empty() {
        return None;
    }

    let version = data[0] >> 4;
    let (protocol_byte, header_len, total_len, src_ip, dst_ip) = match version {
        4 => {
            if data.len() < 20 {
                return None;
            }
            let ihl = ((data[0] & 0x0F) as usize) * 4;
            if ihl < 20 {
                return None;
            }
            let total = u16::from_be_bytes([data[2], data[3]]) as u64;
            let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
            let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
            (data[9], ihl, total, IpAddr::V4(src), IpAddr::V4(dst))
        }
        6 => {
            if data.len() < 40 {
                return None;
            }
            let payload_len = u16::from_be_bytes([data[4], data[5]]) as u64;
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&data[8..24]);
            dst.copy_from_slice(&data[24..40]);
            (
                data[6],
                40,
                payload_len + 40,
                IpAddr::V6(Ipv6Addr::from(src)),
                IpAddr::V6(Ipv6Addr::from(dst)),
            )
        }
        _ => return None,
    };

    let protocol = match protocol_byte {
        6 => Protocol::Tcp,
        17 => Protocol::Udp,
        _ => return None,
    };

    if data.len() < header_len + 4 {
        return None;
    }

    let src_port = u16::from_be_bytes([data[header_len], data[header_len + 1]]);
    let dst_port = u16::from_be_bytes([data[header_len + 2], data[header_len + 3]]);

    Some(PacketInfo {
        protocol,
        source: SocketAddr::new(src_ip, src_port),
        destination: SocketAddr::new(dst_ip, dst_port),
        length: total_len,
    })
}
