//! The discovery pipeline: enumerate processes, list descriptors, classify,
//! attach lazily, inspect, report.
//!
//! Every failure is handled at the narrowest scope it can be: a descriptor
//! that cannot be queried is skipped, a process that cannot be read or
//! attached is skipped, and only an unreadable process registry (discovery
//! mode) or a failed write ends the run.

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::os::fd::RawFd;

use opensockets_core::error::map_io_error;
use opensockets_core::{OpensocketsError, OpensocketsResult};
use tracing::{debug, trace};

use crate::{
    AddressFamily, Host, ListeningSocket, ProcessHandle, ProcessMetadata, ScanSink, ScanWarning,
    SocketAddress, SocketInfo, SocketQuery, SocketRecord, SocketType, PROCFS,
};

// ============================================================================
// Configuration
// ============================================================================

/// Which processes to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    /// Every process in the registry except our own.
    Discover,
    /// Exactly these process IDs, as given on the command line.
    Explicit(Vec<String>),
}

/// Immutable run configuration, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    pub targets: Targets,
    /// Print the column header before any record.
    pub header: bool,
    /// Our own PID, excluded in discovery mode.
    pub self_pid: u32,
}

impl ScanConfig {
    /// Scan every process, with a header.
    pub fn discover() -> Self {
        Self {
            targets: Targets::Discover,
            header: true,
            self_pid: std::process::id(),
        }
    }

    /// Scan only `pids`, with a header. An empty list means discovery.
    pub fn explicit(pids: Vec<String>) -> Self {
        if pids.is_empty() {
            return Self::discover();
        }
        Self {
            targets: Targets::Explicit(pids),
            ..Self::discover()
        }
    }

    pub fn with_header(mut self, header: bool) -> Self {
        self.header = header;
        self
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Outcome of scanning one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessScan {
    /// The descriptor directory could not be listed.
    Unreadable,
    /// A socket was found but the handle could not be attached; the rest of
    /// the descriptors were not looked at.
    AttachFailed { sockets_seen: usize },
    /// Every descriptor was looked at.
    Completed {
        sockets_seen: usize,
        reported: usize,
        attached: bool,
    },
}

impl ProcessScan {
    pub fn attached(&self) -> bool {
        matches!(self, ProcessScan::Completed { attached: true, .. })
    }

    pub fn reported(&self) -> usize {
        match self {
            ProcessScan::Completed { reported, .. } => *reported,
            _ => 0,
        }
    }
}

/// Totals for a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub processes: usize,
    pub unreadable: usize,
    pub attach_failures: usize,
    pub attached: usize,
    pub sockets_reported: usize,
}

impl ScanSummary {
    fn absorb(&mut self, scan: ProcessScan) {
        self.processes += 1;
        match scan {
            ProcessScan::Unreadable => self.unreadable += 1,
            ProcessScan::AttachFailed { .. } => self.attach_failures += 1,
            ProcessScan::Completed {
                reported, attached, ..
            } => {
                if attached {
                    self.attached += 1;
                }
                self.sockets_reported += reported;
            }
        }
    }
}

/// Why a socket descriptor was not reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// A query through the process handle failed.
    QueryFailed {
        query: &'static str,
        kind: io::ErrorKind,
    },
    /// Not `SOCK_STREAM`.
    NotStream(SocketType),
    /// Has a peer, so it is a connection rather than a listener.
    Connected(SocketAddress),
    /// Not an IPv4 address.
    NotIpv4(AddressFamily),
    /// Bound to port 0.
    ZeroPort,
}

impl Rejection {
    fn query(query: &'static str) -> impl FnOnce(io::Error) -> Rejection {
        move |err| Rejection::QueryFailed {
            query,
            kind: err.kind(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::QueryFailed { query, kind } => write!(f, "{query} failed: {kind}"),
            Rejection::NotStream(ty) => write!(f, "socket type {ty:?} is not a stream"),
            Rejection::Connected(peer) => write!(f, "connected to {peer:?}"),
            Rejection::NotIpv4(family) => write!(f, "address family {family:?} is not IPv4"),
            Rejection::ZeroPort => write!(f, "port is 0"),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Parse a directory entry made only of ASCII digits.
///
/// Dot entries and names like `self` or `thread-self` yield `None`.
pub fn parse_numeric_entry(name: &OsStr) -> Option<u32> {
    let name = name.to_str()?;
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Produce the PIDs to scan.
///
/// Explicit PIDs are passed through unchecked; ones that are not numbers at
/// all are dropped here, which has the same effect as a PID that fails to
/// open later. Discovery lists the registry, which is the one fatal failure
/// of a run.
pub fn enumerate_targets<H: Host>(host: &H, config: &ScanConfig) -> OpensocketsResult<Vec<u32>> {
    match &config.targets {
        Targets::Explicit(args) => Ok(args
            .iter()
            .filter_map(|arg| match arg.trim().parse::<u32>() {
                Ok(pid) => Some(pid),
                Err(_) => {
                    debug!(arg = %arg, "ignoring process id that is not a number");
                    None
                }
            })
            .collect()),
        Targets::Discover => {
            debug!("opening {}", PROCFS);
            let entries = host
                .process_entries()
                .map_err(|err| OpensocketsError::registry(PROCFS, err))?;
            Ok(entries
                .iter()
                .filter_map(|entry| parse_numeric_entry(entry))
                .filter(|&pid| pid != config.self_pid)
                .collect())
        }
    }
}

/// Decide whether `socket`, descriptor `fd` of `pid`, is a listening IPv4
/// TCP socket.
///
/// Queries run in a fixed order and stop at the first that disqualifies
/// the socket: type, peer, local address, family, port.
pub fn inspect_socket<Q: SocketQuery>(
    socket: &Q,
    pid: u32,
    fd: RawFd,
) -> Result<ListeningSocket, Rejection> {
    let socket_type = socket
        .socket_type()
        .map_err(Rejection::query("socket type"))?;
    if socket_type != SocketType::Stream {
        return Err(Rejection::NotStream(socket_type));
    }

    if let Ok(peer) = socket.peer_address() {
        return Err(Rejection::Connected(peer));
    }

    let local = socket
        .local_address()
        .map_err(Rejection::query("local address"))?;
    let info = SocketInfo {
        socket_type,
        peer: None,
        local,
    };
    trace!(pid, fd, ?info, "socket info");

    let SocketAddress::Inet(addr) = info.local else {
        return Err(Rejection::NotIpv4(info.family()));
    };

    // Port 0 shows up for sockets that were never bound; dropping them
    // removes duplicate-looking rows. A heuristic, not a kernel guarantee.
    if addr.port() == 0 {
        return Err(Rejection::ZeroPort);
    }

    Ok(ListeningSocket { pid, fd, addr })
}

/// True if `err` from the process handle means the whole process is out of
/// reach, not just one descriptor.
fn process_unreachable(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied || err.raw_os_error() == Some(libc::ESRCH)
}

/// Log a process-level failure and pass any warning it carries to `sink`.
fn skip_process<S: ScanSink>(sink: &mut S, pid: u32, operation: &str, err: io::Error) {
    let err = map_io_error(err, pid, operation);
    debug!(pid, error = %err, "skipping process");
    if let Some(warning) = ScanWarning::from_error(&err) {
        sink.warning(&warning);
    }
}

/// Scan one process and hand each listening socket to `sink`.
///
/// The handle is attached on the first socket descriptor and dropped when
/// this function returns, whichever way it returns. A permission or
/// liveness failure on the handle abandons the process; any other failure
/// skips just the descriptor. Only a failed write to `sink` is an error.
pub fn scan_process<H: Host, S: ScanSink>(
    host: &H,
    pid: u32,
    sink: &mut S,
) -> io::Result<ProcessScan> {
    let entries = match host.descriptor_entries(pid) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(pid, "failed to open {}/{}/fd", PROCFS, pid);
            skip_process(sink, pid, "list descriptors", err);
            return Ok(ProcessScan::Unreadable);
        }
    };

    let mut handle: Option<H::Handle> = None;
    let mut metadata: Option<Option<ProcessMetadata>> = None;
    let mut sockets_seen = 0;
    let mut reported = 0;

    for fd in entries.iter().filter_map(|entry| parse_numeric_entry(entry)) {
        let Ok(fd) = RawFd::try_from(fd) else {
            continue;
        };

        match host.is_socket(pid, fd) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                trace!(pid, fd, error = %err, "failed to stat descriptor");
                continue;
            }
        }
        sockets_seen += 1;

        let attached = match handle {
            Some(ref attached) => attached,
            None => match host.attach(pid) {
                Ok(attached) => {
                    trace!(pid, "attached");
                    &*handle.insert(attached)
                }
                Err(err) => {
                    skip_process(sink, pid, "attach", err);
                    return Ok(ProcessScan::AttachFailed { sockets_seen });
                }
            },
        };

        let socket = match attached.socket(fd) {
            Ok(socket) => socket,
            Err(err) if process_unreachable(&err) => {
                skip_process(sink, pid, "inspect sockets", err);
                return Ok(ProcessScan::AttachFailed { sockets_seen });
            }
            Err(err) => {
                trace!(pid, fd, error = %err, "skipping socket");
                continue;
            }
        };

        let socket = match inspect_socket(&socket, pid, fd) {
            Ok(socket) => socket,
            Err(Rejection::ZeroPort) => {
                debug!(pid, fd, "pid {} fd {} port is 0", pid, fd);
                continue;
            }
            Err(rejection) => {
                trace!(pid, fd, %rejection, "skipping socket");
                continue;
            }
        };

        let metadata = metadata
            .get_or_insert_with(|| match attached.metadata() {
                Ok(meta) => Some(meta),
                Err(err) => {
                    debug!(pid, error = %err, "process metadata unavailable");
                    None
                }
            })
            .clone();

        sink.record(&SocketRecord { socket, metadata })?;
        reported += 1;
    }

    Ok(ProcessScan::Completed {
        sockets_seen,
        reported,
        attached: handle.is_some(),
    })
}

/// Run a full scan as described by `config`.
pub fn run<H: Host, S: ScanSink>(
    host: &H,
    config: &ScanConfig,
    sink: &mut S,
) -> OpensocketsResult<ScanSummary> {
    sink.begin().map_err(OpensocketsError::output)?;
    debug!(?config, "Initialization complete. Starting scan.");
    debug!("pid = {}", config.self_pid);

    let pids = enumerate_targets(host, config)?;
    let mut summary = ScanSummary::default();
    for pid in pids {
        debug!("processing pid {}", pid);
        let scan = scan_process(host, pid, sink).map_err(OpensocketsError::output)?;
        summary.absorb(scan);
    }

    debug!(
        processes = summary.processes,
        attached = summary.attached,
        sockets = summary.sockets_reported,
        "scan finished"
    );
    Ok(summary)
}

// ============================================================================
// Tests
// ============================================================================
