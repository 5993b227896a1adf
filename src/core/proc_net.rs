//! Parsing of the Linux `/proc/net/{tcp,tcp6,udp,udp6}` tables and
//! socket-inode to PID attribution through `/proc/<pid>/fd`.
//!
//! Table rows look like:
//!
//! ```text
//!   sl  local_address rem_address   st tx_queue:rx_queue tr tm->when retrnsmt   uid  timeout inode
//!    0: 0100007F:0277 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 21394 ...
//! ```
//!
//! Addresses are the kernel's in-memory words printed as hex: IPv4 is one
//! little-endian 32-bit word, IPv6 is four little-endian 32-bit words. Ports
//! are plain big-endian hex. A malformed row yields `None` and is skipped.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

use crate::core::process_mapper::Protocol;

/// One parsed socket-table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcNetEntry {
    pub protocol: Protocol,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    /// Raw kernel state code (`0x01` = ESTABLISHED, `0x0A` = LISTEN, ...).
    pub state: u8,
    pub inode: u64,
}

impl ProcNetEntry {
    /// Whether the row describes a connection worth reporting.
    ///
    /// TCP listeners and closed sockets are not connections. UDP sockets are
    /// always reported since the kernel marks unconnected ones as CLOSE.
    pub fn is_connection(&self) -> bool {
        match self.protocol {
            Protocol::Tcp => !matches!(self.state, TCP_LISTEN | TCP_CLOSE),
            Protocol::Udp => true,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self.protocol {
            Protocol::Tcp => tcp_state_name(self.state),
            Protocol::Udp => {
                if self.state == TCP_ESTABLISHED {
                    "CONNECTED"
                } else {
                    "UNCONNECTED"
                }
            }
        }
    }
}

const TCP_ESTABLISHED: u8 = 0x01;
const TCP_CLOSE: u8 = 0x07;
const TCP_LISTEN: u8 = 0x0A;

/// Kernel TCP state code to its conventional name.
pub fn tcp_state_name(state: u8) -> &'static str {
    match state {
        0x01 => "ESTABLISHED",
        0x02 => "SYN_SENT",
        0x03 => "SYN_RECV",
        0x04 => "FIN_WAIT1",
        0x05 => "FIN_WAIT2",
        0x06 => "TIME_WAIT",
        0x07 => "CLOSE",
        0x08 => "CLOSE_WAIT",
        0x09 => "LAST_ACK",
        0x0A => "LISTEN",
        0x0B => "CLOSING",
        0x0C => "NEW_SYN_RECV",
        _ => "UNKNOWN",
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn parse_le_word(hex: &str) -> Option<[u8; 4]> {
    if hex.len() != 8 || !is_hex(hex) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok().map(u32::to_le_bytes)
}

/// Decode an 8-hex-character little-endian IPv4 word.
pub fn parse_hex_ipv4(hex: &str) -> Option<Ipv4Addr> {
    parse_le_word(hex).map(Ipv4Addr::from)
}

/// Decode a 32-hex-character IPv6 address stored as four little-endian
/// 32-bit groups. Each group's bytes land in order in its 4-byte slice.
pub fn parse_hex_ipv6(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 || !is_hex(hex) {
        return None;
    }
    let mut octets = [0u8; 16];
    for (group, chunk) in octets.chunks_exact_mut(4).enumerate() {
        let start = group * 8;
        chunk.copy_from_slice(&parse_le_word(&hex[start..start + 8])?);
    }
    Some(Ipv6Addr::from(octets))
}

/// Decode `ADDR:PORT`, choosing IPv4 or IPv6 by address length.
pub fn parse_endpoint(field: &str) -> Option<SocketAddr> {
    let (addr_hex, port_hex) = field.split_once(':')?;
    if port_hex.len() != 4 || !is_hex(port_hex) {
        return None;
    }
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let ip = match addr_hex.len() {
        8 => IpAddr::V4(parse_hex_ipv4(addr_hex)?),
        32 => IpAddr::V6(parse_hex_ipv6(addr_hex)?),
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Parse one table row. Header lines and malformed rows return `None`.
pub fn parse_proc_net_line(line: &str, protocol: Protocol) -> Option<ProcNetEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 || !fields[0].ends_with(':') {
        return None;
    }
    let local = parse_endpoint(fields[1])?;
    let remote = parse_endpoint(fields[2])?;
    if fields[3].len() != 2 || !is_hex(fields[3]) {
        return None;
    }
    let state = u8::from_str_radix(fields[3], 16).ok()?;
    let (tx_hex, rx_hex) = fields[4].split_once(':')?;
    if !is_hex(tx_hex) || !is_hex(rx_hex) {
        return None;
    }
    let inode = fields[9].parse().ok()?;
    Some(ProcNetEntry {
        protocol,
        local,
        remote,
        state,
        inode,
    })
}

/// Parse a whole table, skipping rows that fail to parse.
pub fn parse_proc_net_table(contents: &str, protocol: Protocol) -> Vec<ProcNetEntry> {
    contents
        .lines()
        .filter_map(|line| parse_proc_net_line(line, protocol))
        .collect()
}

/// Read and parse every socket table under `proc_root` (normally `/proc`).
/// Missing tables (e.g. IPv6 disabled) are treated as empty.
pub fn read_socket_tables(proc_root: &Path) -> Vec<ProcNetEntry> {
    const TABLES: [(&str, Protocol); 4] = [
        ("net/tcp", Protocol::Tcp),
        ("net/tcp6", Protocol::Tcp),
        ("net/udp", Protocol::Udp),
        ("net/udp6", Protocol::Udp),
    ];
    let mut entries = Vec::new();
    for (table, protocol) in TABLES {
        match fs::read_to_string(proc_root.join(table)) {
            Ok(contents) => entries.extend(parse_proc_net_table(&contents, protocol)),
            Err(e) => tracing::trace!("Skipping {table}: {e}"),
        }
    }
    entries
}

/// Extract the inode from an fd link target of the form `socket:[12345]`.
pub fn parse_socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Map socket inodes to owning PIDs by walking `<proc_root>/<pid>/fd`.
///
/// Processes that exit mid-scan or deny access are skipped. When a socket
/// is shared, the lowest PID wins so attribution is stable across scans.
pub fn scan_socket_owners(proc_root: &Path) -> HashMap<u64, u32> {
    let mut owners: HashMap<u64, u32> = HashMap::new();
    let Ok(dir) = fs::read_dir(proc_root) else {
        return owners;
    };
    for entry in dir.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = fs::read_link(fd.path()) else {
                continue;
            };
            if let Some(inode) = target.to_str().and_then(parse_socket_inode) {
                owners
                    .entry(inode)
                    .and_modify(|owner| *owner = (*owner).min(pid))
                    .or_insert(pid);
            }
        }
    }
    owners
}
