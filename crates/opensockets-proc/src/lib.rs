//! opensockets-proc: Listening socket discovery
//!
//! This crate walks each process's descriptor table, picks out the sockets,
//! and looks each one up in the kernel's socket tables through a read-only
//! handle on the owning process. Only listening IPv4 TCP sockets are
//! reported.
//!
//! ## Pipeline
//!
//! | Stage | Linux primitive |
//! |-------|-----------------|
//! | Process enumeration | `/proc` |
//! | Descriptor listing | `/proc/[pid]/fd` |
//! | Socket classification | `stat(2)` on `/proc/[pid]/fd/[fd]` |
//! | Process handle | `pidfd_open(2)` + `/proc/[pid]/net/{tcp,tcp6,udp,udp6,unix}` |
//! | Socket queries | `socket:[inode]` link of `/proc/[pid]/fd/[fd]`, looked up by inode |
//! | Process metadata | `/proc/[pid]/comm`, `/proc/[pid]/cmdline` |
//!
//! Nothing here stops, signals, or otherwise changes the target process.
//!
//! ## Example
//!
//! ```rust,no_run
//! # #[cfg(target_os = "linux")]
//! # fn main() -> opensockets_core::OpensocketsResult<()> {
//! use opensockets_proc::{run, ProcfsHost, Reporter, ScanConfig};
//!
//! let config = ScanConfig::discover();
//! let mut reporter = Reporter::new(std::io::stdout(), std::io::stderr(), config.header);
//! let summary = run(&ProcfsHost::new(), &config, &mut reporter)?;
//! eprintln!("{} listening sockets", summary.sockets_reported);
//! # Ok(())
//! # }
//! # #[cfg(not(target_os = "linux"))]
//! # fn main() {}
//! ```

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::net::{SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

use opensockets_core::OpensocketsError;

mod report;
mod scan;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::{PidfdHandle, ProcfsHost, SocketTable, TableSocket};

pub use report::{format_header, format_record, Reporter, UNKNOWN};
pub use scan::{
    enumerate_targets, inspect_socket, parse_numeric_entry, run, scan_process, ProcessScan,
    Rejection, ScanConfig, ScanSummary, Targets,
};

/// Root of the process registry.
pub const PROCFS: &str = "/proc";

/// Largest PID that survives the cast to `pid_t`.
pub const MAX_SAFE_PID: u32 = i32::MAX as u32;

// ============================================================================
// Core Types
// ============================================================================

/// Socket type (`SOCK_STREAM`, `SOCK_DGRAM`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// `SOCK_STREAM` (TCP for inet sockets).
    Stream,
    /// `SOCK_DGRAM`.
    Datagram,
    /// Anything else, with the raw value.
    Other(i32),
}

/// Local or peer address of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketAddress {
    Inet(SocketAddrV4),
    Inet6(SocketAddrV6),
    /// Non-IP family (Unix domain, netlink, ...), with the raw `sa_family`.
    Other { family: i32 },
}

/// Address family of a [`SocketAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
    Other(i32),
}

impl SocketAddress {
    pub fn family(&self) -> AddressFamily {
        match self {
            SocketAddress::Inet(_) => AddressFamily::Inet,
            SocketAddress::Inet6(_) => AddressFamily::Inet6,
            SocketAddress::Other { family } => AddressFamily::Other(*family),
        }
    }
}

/// What the inspector learned about one socket descriptor.
///
/// Fields are filled in query order; inspection stops at the first one that
/// disqualifies the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketInfo {
    pub socket_type: SocketType,
    pub peer: Option<SocketAddress>,
    pub local: SocketAddress,
}

impl SocketInfo {
    pub fn family(&self) -> AddressFamily {
        self.local.family()
    }
}

/// An accepted listening IPv4 TCP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListeningSocket {
    /// Owning process.
    pub pid: u32,
    /// Descriptor number inside the owning process.
    pub fd: RawFd,
    /// Bound address; the port is in host byte order.
    pub addr: SocketAddrV4,
}

/// Executable name and argument string of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMetadata {
    /// Short executable name (`comm`).
    pub name: String,
    /// Full argument string, space separated.
    pub args: String,
}

/// One line of output: a socket joined with its owner's metadata.
///
/// `metadata` is `None` when the metadata query failed; the reporter prints
/// [`UNKNOWN`] in its place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRecord {
    pub socket: ListeningSocket,
    pub metadata: Option<ProcessMetadata>,
}

/// Non-fatal problems the user should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanWarning {
    /// `operation` on `pid` was refused for lack of privilege; the sockets
    /// of that process are missing from the output.
    PermissionDenied { pid: u32, operation: String },
}

impl ScanWarning {
    /// The warning `err` should raise, if any. Only privilege errors do;
    /// processes that exit mid-scan are skipped quietly.
    pub fn from_error(err: &OpensocketsError) -> Option<Self> {
        match err {
            OpensocketsError::PermissionDenied { pid, operation } => {
                Some(ScanWarning::PermissionDenied {
                    pid: *pid,
                    operation: operation.clone(),
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanWarning::PermissionDenied { pid, operation } => {
                write!(f, "pid {pid}: permission denied ({operation})")
            }
        }
    }
}

// ============================================================================
// Platform Seams
// ============================================================================

/// Source of processes and descriptors: the parts of discovery that never
/// touch the target process.
pub trait Host {
    type Handle: ProcessHandle;

    /// Raw entry names of the process registry (`/proc`).
    fn process_entries(&self) -> io::Result<Vec<OsString>>;

    /// Raw entry names of the descriptor directory of `pid`.
    fn descriptor_entries(&self, pid: u32) -> io::Result<Vec<OsString>>;

    /// True if descriptor `fd` of `pid` is a socket.
    fn is_socket(&self, pid: u32, fd: RawFd) -> io::Result<bool>;

    /// Attach a read-only, non-stopping handle to `pid`.
    ///
    /// Dropping the handle releases it.
    fn attach(&self, pid: u32) -> io::Result<Self::Handle>;
}

/// Read-only inspection handle on one process.
pub trait ProcessHandle {
    type Socket: SocketQuery;

    /// Obtain a query object for descriptor `fd` of the target process.
    fn socket(&self, fd: RawFd) -> io::Result<Self::Socket>;

    /// Executable name and arguments of the target process.
    fn metadata(&self) -> io::Result<ProcessMetadata>;
}

/// Queries against one socket of a target process.
pub trait SocketQuery {
    fn socket_type(&self) -> io::Result<SocketType>;
    fn peer_address(&self) -> io::Result<SocketAddress>;
    fn local_address(&self) -> io::Result<SocketAddress>;
}

/// Consumer of scan results.
pub trait ScanSink {
    /// Called once before any process is scanned.
    fn begin(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn record(&mut self, record: &SocketRecord) -> io::Result<()>;

    fn warning(&mut self, warning: &ScanWarning);
}

/// Collects records and warnings in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<SocketRecord>,
    pub warnings: Vec<ScanWarning>,
}

impl ScanSink for MemorySink {
    fn record(&mut self, record: &SocketRecord) -> io::Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn warning(&mut self, warning: &ScanWarning) {
        self.warnings.push(warning.clone());
    }
}
