//! Windows connection tracking using WinDivert 2.x in SNIFF mode.
//!
//! Two threads cooperate:
//! - `windivert-sniff` receives read-only packet copies from the kernel and
//!   charges their length to the owning connection.
//! - `socket-table-scan` refreshes the local-port → PID map from the
//!   iphlpapi owner tables and resolves process names.
//!
//! Packets are copied, never intercepted, so a failure here cannot affect
//! host connectivity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::Result;
use windivert::layer::NetworkLayer;
use windivert::prelude::*;

use crate::config::PROCESS_SCAN_INTERVAL_MS;
use crate::core::process_mapper::ProcessMapper;
use crate::core::traffic::ConnectionTable;
use crate::core::win_net_table::scan_socket_owners;
use crate::tracker::{parse_ip_packet, sleep_until_shutdown, ConnectionTracker, TrackerCore};

const SNIFF_FILTER: &str = "tcp or udp";

pub struct WinDivertTracker {
    core: TrackerCore,
}

impl WinDivertTracker {
    pub fn new() -> Self {
        Self {
            core: TrackerCore::new(),
        }
    }
}

impl Default for WinDivertTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker for WinDivertTracker {
    fn name(&self) -> &'static str {
        "windivert"
    }

    fn start(&self) -> Result<()> {
        self.core.start_with(self.name(), || {
            // Populate the port map before the first packet arrives.
            refresh_socket_owners(&self.core.mapper, &self.core.table);

            // The handle is opened on the capture thread; the open result is
            // reported back so a missing driver fails `start`.
            let (opened_tx, opened_rx) = mpsc::channel();
            let shutdown = self.core.shutdown_flag();
            let mapper = Arc::clone(&self.core.mapper);
            let table = Arc::clone(&self.core.table);
            let sniffer = std::thread::Builder::new()
                .name("windivert-sniff".into())
                .spawn(move || {
                    let wd = match open_sniff_handle() {
                        Ok(wd) => {
                            let _ = opened_tx.send(Ok(()));
                            wd
                        }
                        Err(e) => {
                            let _ = opened_tx.send(Err(e));
                            return;
                        }
                    };
                    run_sniff_loop(wd, &mapper, &table, &shutdown);
                })?;
            opened_rx
                .recv()
                .map_err(|_| anyhow::anyhow!("WinDivert capture thread exited before opening"))??;

            let shutdown = self.core.shutdown_flag();
            let mapper = Arc::clone(&self.core.mapper);
            let table = Arc::clone(&self.core.table);
            let scanner = std::thread::Builder::new()
                .name("socket-table-scan".into())
                .spawn(move || run_scan_loop(&mapper, &table, &shutdown))?;

            Ok(vec![scanner, sniffer])
        })
    }

    fn core(&self) -> &TrackerCore {
        &self.core
    }
}

fn open_sniff_handle() -> Result<WinDivert<NetworkLayer>> {
    let flags = WinDivertFlags::new().set_sniff();
    tracing::info!("Opening WinDivert handle with filter: {SNIFF_FILTER}");
    WinDivert::network(SNIFF_FILTER, 0, flags).map_err(|e| {
        tracing::error!("WinDivert::network() failed: {e:?}");
        anyhow::anyhow!(
            "Failed to open WinDivert handle (filter={SNIFF_FILTER}): {e:?}. \
             Ensure WinDivert.dll and WinDivert64.sys are next to the executable \
             and the helper is running as administrator."
        )
    })
}

fn run_sniff_loop(
    wd: WinDivert<NetworkLayer>,
    mapper: &ProcessMapper,
    table: &ConnectionTable,
    shutdown: &AtomicBool,
) {
    tracing::info!("WinDivert SNIFF capture started");
    let mut buf = vec![0u8; 65535];

    while !shutdown.load(Ordering::Relaxed) {
        match wd.recv(Some(&mut buf)) {
            Ok(packet) => {
                let outbound = packet.address.outbound();
                record_packet(mapper, table, &packet.data, outbound);
            }
            Err(e) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                tracing::error!("WinDivert recv error: {e}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    tracing::info!("WinDivert SNIFF capture stopped");
}

fn record_packet(mapper: &ProcessMapper, table: &ConnectionTable, data: &[u8], outbound: bool) {
    let Some(info) = parse_ip_packet(data) else {
        return;
    };
    let (local, remote) = if outbound {
        (info.source, info.destination)
    } else {
        (info.destination, info.source)
    };
    let Some(pid) = mapper.lookup_pid(info.protocol, local.port()) else {
        return;
    };
    if outbound {
        table.record_bytes(pid, info.protocol, local, remote, info.length, 0);
    } else {
        table.record_bytes(pid, info.protocol, local, remote, 0, info.length);
    }
}

fn run_scan_loop(mapper: &ProcessMapper, table: &ConnectionTable, shutdown: &AtomicBool) {
    let interval = Duration::from_millis(PROCESS_SCAN_INTERVAL_MS);
    while !shutdown.load(Ordering::Relaxed) {
        sleep_until_shutdown(shutdown, interval);
        refresh_socket_owners(mapper, table);
    }
}

fn refresh_socket_owners(mapper: &ProcessMapper, table: &ConnectionTable) {
    let owners = scan_socket_owners();
    mapper.replace_port_map(
        owners
            .iter()
            .map(|o| ((o.protocol, o.local.port()), o.pid)),
    );
    for pid in table.live_pids() {
        mapper.resolve(pid);
    }
}
