//! Windows IP Helper FFI for querying socket-to-PID tables.
//!
//! Wraps `GetExtendedTcpTable` / `GetExtendedUdpTable` from `iphlpapi.dll`
//! for both IPv4 and IPv6 and flattens the four tables into [`SocketOwner`]
//! rows.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::core::process_mapper::Protocol;

pub const AF_INET: u32 = 2;
pub const AF_INET6: u32 = 23;
pub const TCP_TABLE_OWNER_PID_ALL: u32 = 5;
pub const UDP_TABLE_OWNER_PID: u32 = 1;
pub const NO_ERROR: u32 = 0;
pub const ERROR_INSUFFICIENT_BUFFER: u32 = 122;

// --- IPv4 row structures ---

#[repr(C)]
pub struct MibTcpRowOwnerPid {
    pub state: u32,
    pub local_addr: u32,
    pub local_port: u32,
    pub remote_addr: u32,
    pub remote_port: u32,
    pub owning_pid: u32,
}

#[repr(C)]
pub struct MibUdpRowOwnerPid {
    pub local_addr: u32,
    pub local_port: u32,
    pub owning_pid: u32,
}

// --- IPv6 row structures ---

#[repr(C)]
pub struct MibTcp6RowOwnerPid {
    pub local_addr: [u8; 16],
    pub local_scope_id: u32,
    pub local_port: u32,
    pub remote_addr: [u8; 16],
    pub remote_scope_id: u32,
    pub remote_port: u32,
    pub state: u32,
    pub owning_pid: u32,
}

#[repr(C)]
pub struct MibUdp6RowOwnerPid {
    pub local_addr: [u8; 16],
    pub local_scope_id: u32,
    pub local_port: u32,
    pub owning_pid: u32,
}

#[link(name = "iphlpapi")]
extern "system" {
    pub fn GetExtendedTcpTable(
        pTcpTable: *mut u8,
        pdwSize: *mut u32,
        bOrder: i32,
        ulAf: u32,
        TableClass: u32,
        Reserved: u32,
    ) -> u32;

    pub fn GetExtendedUdpTable(
        pUdpTable: *mut u8,
        pdwSize: *mut u32,
        bOrder: i32,
        ulAf: u32,
        TableClass: u32,
        Reserved: u32,
    ) -> u32;
}

/// One socket and the process that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOwner {
    pub protocol: Protocol,
    pub local: SocketAddr,
    pub pid: u32,
}

type TableFn = unsafe extern "system" fn(*mut u8, *mut u32, i32, u32, u32, u32) -> u32;

/// Scan all TCP and UDP tables (IPv4 + IPv6).
pub fn scan_socket_owners() -> Vec<SocketOwner> {
    let mut owners = Vec::new();
    scan_table::<MibTcpRowOwnerPid>(
        GetExtendedTcpTable,
        AF_INET,
        TCP_TABLE_OWNER_PID_ALL,
        "GetExtendedTcpTable",
        |row| SocketOwner {
            protocol: Protocol::Tcp,
            local: v4(row.local_addr, row.local_port),
            pid: row.owning_pid,
        },
        &mut owners,
    );
    scan_table::<MibUdpRowOwnerPid>(
        GetExtendedUdpTable,
        AF_INET,
        UDP_TABLE_OWNER_PID,
        "GetExtendedUdpTable",
        |row| SocketOwner {
            protocol: Protocol::Udp,
            local: v4(row.local_addr, row.local_port),
            pid: row.owning_pid,
        },
        &mut owners,
    );
    scan_table::<MibTcp6RowOwnerPid>(
        GetExtendedTcpTable,
        AF_INET6,
        TCP_TABLE_OWNER_PID_ALL,
        "GetExtendedTcpTable(AF_INET6)",
        |row| SocketOwner {
            protocol: Protocol::Tcp,
            local: v6(row.local_addr, row.local_port),
            pid: row.owning_pid,
        },
        &mut owners,
    );
    scan_table::<MibUdp6RowOwnerPid>(
        GetExtendedUdpTable,
        AF_INET6,
        UDP_TABLE_OWNER_PID,
        "GetExtendedUdpTable(AF_INET6)",
        |row| SocketOwner {
            protocol: Protocol::Udp,
            local: v6(row.local_addr, row.local_port),
            pid: row.owning_pid,
        },
        &mut owners,
    );
    owners
}

// Ports are stored in network byte order in the low 16 bits; IPv4 addresses
// are stored as the raw network-order bytes of a DWORD.
fn v4(addr: u32, port: u32) -> SocketAddr {
    SocketAddr::new(
        IpAddr::V4(Ipv4Addr::from(addr.to_ne_bytes())),
        u16::from_be(port as u16),
    )
}

fn v6(addr: [u8; 16], port: u32) -> SocketAddr {
    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(addr)), u16::from_be(port as u16))
}

fn scan_table<R>(
    query: TableFn,
    family: u32,
    class: u32,
    label: &str,
    to_owner: impl Fn(&R) -> SocketOwner,
    out: &mut Vec<SocketOwner>,
) {
    let mut size: u32 = 0;
    let ret = unsafe { query(std::ptr::null_mut(), &mut size, 0, family, class, 0) };
    if ret != ERROR_INSUFFICIENT_BUFFER {
        return;
    }

    let mut buf = vec![0u8; size as usize];
    let ret = unsafe { query(buf.as_mut_ptr(), &mut size, 0, family, class, 0) };
    if ret != NO_ERROR {
        tracing::warn!("{label} failed with code {ret}");
        return;
    }

    let Some(header) = buf.get(0..4) else {
        return;
    };
    let num_entries = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let row_size = std::mem::size_of::<R>();

    for i in 0..num_entries {
        let offset = 4 + i * row_size;
        if offset + row_size > buf.len() {
            break;
        }
        // Rows are DWORD-aligned within the table; read_unaligned avoids
        // relying on the Vec<u8> allocation's alignment.
        let row = unsafe { std::ptr::read_unaligned(buf.as_ptr().add(offset) as *const R) };
        let owner = to_owner(&row);
        if owner.local.port() > 0 && owner.pid > 0 {
            out.push(owner);
        }
    }
}
