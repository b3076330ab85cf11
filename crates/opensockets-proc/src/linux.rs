//! Linux implementation using /proc and pidfds
//!
//! Reads from:
//! - `/proc` - process registry
//! - `/proc/[pid]/fd` - open descriptors (stat follows the link to the socket inode)
//! - `/proc/[pid]/net/{tcp,tcp6,udp,udp6,unix}` - the kernel's socket tables
//!   for the network namespace of the process
//! - `/proc/[pid]/comm` - executable name
//! - `/proc/[pid]/cmdline` - command line arguments
//!
//! A socket descriptor links to `socket:[inode]`. The inode is looked up in
//! the socket tables, which give its type, local address and peer. Nothing
//! is read from or written to the socket itself, and the target is never
//! stopped or signalled.
//!
//! The pidfd (`pidfd_open(2)`, Linux 5.3) pins the process identity: the
//! tables and metadata are read by PID, then checked against the pidfd so a
//! recycled PID is noticed.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::ptr;

use tracing::trace;

use crate::{
    Host, ProcessHandle, ProcessMetadata, SocketAddress, SocketQuery, SocketType, MAX_SAFE_PID,
    PROCFS,
};

// ============================================================================
// Host
// ============================================================================

/// Process and descriptor listing straight from `/proc`.
#[derive(Debug, Clone, Default)]
pub struct ProcfsHost {
    _private: (),
}

impl ProcfsHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Host for ProcfsHost {
    type Handle = PidfdHandle;

    fn process_entries(&self) -> io::Result<Vec<OsString>> {
        list_dir(Path::new(PROCFS))
    }

    fn descriptor_entries(&self, pid: u32) -> io::Result<Vec<OsString>> {
        list_dir(&proc_path(pid).join("fd"))
    }

    fn is_socket(&self, pid: u32, fd: RawFd) -> io::Result<bool> {
        Ok(fs::metadata(fd_path(pid, fd))?.file_type().is_socket())
    }

    fn attach(&self, pid: u32) -> io::Result<PidfdHandle> {
        PidfdHandle::open(pid)
    }
}

fn proc_path(pid: u32) -> PathBuf {
    Path::new(PROCFS).join(pid.to_string())
}

fn fd_path(pid: u32, fd: RawFd) -> PathBuf {
    proc_path(pid).join("fd").join(fd.to_string())
}

/// Entry names of a directory. Entries that fail mid-iteration (a process
/// exiting while we read) are dropped.
fn list_dir(path: &Path) -> io::Result<Vec<OsString>> {
    Ok(fs::read_dir(path)?
        .flatten()
        .map(|entry| entry.file_name())
        .collect())
}

// ============================================================================
// Process handle
// ============================================================================

/// A pidfd on the target process plus a snapshot of the sockets its network
/// namespace had when the handle was opened. The pidfd is closed on drop.
#[derive(Debug)]
pub struct PidfdHandle {
    pid: u32,
    pidfd: OwnedFd,
    sockets: SocketTable,
}

impl PidfdHandle {
    /// `pidfd_open(2)` on `pid`, then load its socket tables.
    pub fn open(pid: u32) -> io::Result<Self> {
        if pid == 0 || pid > MAX_SAFE_PID {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("PID {pid} is not a valid process id"),
            ));
        }

        let ret = unsafe {
            libc::syscall(
                libc::SYS_pidfd_open,
                pid as libc::pid_t,
                0 as libc::c_uint,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: pidfd_open returned a fresh descriptor that nothing else owns.
        let pidfd = unsafe { OwnedFd::from_raw_fd(ret as RawFd) };
        let mut handle = Self {
            pid,
            pidfd,
            sockets: SocketTable::default(),
        };

        handle.sockets = SocketTable::load(&proc_path(pid).join("net"))?;
        handle.ensure_alive()?;
        trace!(pid, sockets = handle.sockets.len(), "loaded socket tables");
        Ok(handle)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Fails with `ESRCH` once the process has exited, even if its PID has
    /// been reused.
    fn ensure_alive(&self) -> io::Result<()> {
        // Signal 0 runs the existence and permission checks without
        // delivering anything.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_pidfd_send_signal,
                self.pidfd.as_raw_fd(),
                0 as libc::c_int,
                ptr::null::<libc::siginfo_t>(),
                0 as libc::c_uint,
            )
        };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // Alive, just not ours to signal.
            Some(libc::EPERM) => Ok(()),
            _ => Err(err),
        }
    }
}

impl ProcessHandle for PidfdHandle {
    type Socket = TableSocket;

    /// Resolve descriptor `fd` to its entry in the socket tables.
    ///
    /// A link that cannot be read because the process is gone fails with
    /// `ESRCH` rather than `ENOENT`, so callers can tell a closed descriptor
    /// from an exited process.
    fn socket(&self, fd: RawFd) -> io::Result<TableSocket> {
        let target = match fs::read_link(fd_path(self.pid, fd)) {
            Ok(target) => target,
            Err(err) => {
                self.ensure_alive()?;
                return Err(err);
            }
        };

        let inode = socket_inode(&target).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a socket", target.display()),
            )
        })?;

        self.sockets.get(inode).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("socket inode {inode} not in the socket tables"),
            )
        })
    }

    fn metadata(&self) -> io::Result<ProcessMetadata> {
        let dir = proc_path(self.pid);
        let name = fs::read_to_string(dir.join("comm"))?
            .trim_end_matches('\n')
            .to_string();
        let args = read_cmdline(&dir.join("cmdline"))?;

        // The files above are looked up by PID; make sure it is still the
        // process we attached to.
        self.ensure_alive()?;

        let args = if args.is_empty() {
            // Kernel threads and zombies have no command line.
            name.clone()
        } else {
            args.join(" ")
        };
        Ok(ProcessMetadata { name, args })
    }
}

/// Read command line from /proc/[pid]/cmdline.
///
/// Arguments are separated by null bytes. Uses lossy UTF-8 conversion
/// to handle non-UTF-8 command line arguments gracefully.
fn read_cmdline(path: &Path) -> io::Result<Vec<String>> {
    let bytes = fs::read(path)?;
    Ok(split_cmdline(&bytes))
}

fn split_cmdline(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

/// Inode of a `socket:[12345]` link target.
fn socket_inode(target: &Path) -> Option<u64> {
    target
        .to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

// ============================================================================
// Socket tables
// ============================================================================

/// One socket as the kernel's tables describe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSocket {
    socket_type: SocketType,
    local: SocketAddress,
    peer: Option<SocketAddress>,
}

impl SocketQuery for TableSocket {
    fn socket_type(&self) -> io::Result<SocketType> {
        Ok(self.socket_type)
    }

    fn peer_address(&self) -> io::Result<SocketAddress> {
        self.peer
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    fn local_address(&self) -> io::Result<SocketAddress> {
        Ok(self.local)
    }
}

/// Sockets of one network namespace, keyed by inode.
#[derive(Debug, Clone, Default)]
pub struct SocketTable {
    sockets: HashMap<u64, TableSocket>,
}

/// The inet tables and the socket type their rows have.
const INET_TABLES: [(&str, SocketType); 4] = [
    ("tcp", SocketType::Stream),
    ("tcp6", SocketType::Stream),
    ("udp", SocketType::Datagram),
    ("udp6", SocketType::Datagram),
];

impl SocketTable {
    /// Read every table under `net_dir` (normally `/proc/[pid]/net`).
    ///
    /// A missing table (IPv6 disabled, no unix socket support) is empty.
    pub fn load(net_dir: &Path) -> io::Result<Self> {
        let mut table = Self::default();
        for (name, socket_type) in INET_TABLES {
            if let Some(contents) = read_table(&net_dir.join(name))? {
                table.add_inet(&contents, socket_type);
            }
        }
        if let Some(contents) = read_table(&net_dir.join("unix"))? {
            table.add_unix(&contents);
        }
        Ok(table)
    }

    pub fn get(&self, inode: u64) -> Option<TableSocket> {
        self.sockets.get(&inode).copied()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Add the rows of a `tcp`/`udp` style table.
    ///
    /// Columns: `sl local_address rem_address st tx:rx tr:when retrnsmt uid
    /// timeout inode ...`. Rows without an inode (`TIME_WAIT`) and rows that
    /// do not parse are skipped.
    fn add_inet(&mut self, contents: &str, socket_type: SocketType) {
        for line in contents.lines().skip(1) {
            let fields: Vec<&str> = line.split_ascii_whitespace().collect();
            let (Some(local), Some(remote), Some(inode)) = (
                fields.get(1).and_then(|f| parse_inet_address(f)),
                fields.get(2).and_then(|f| parse_inet_address(f)),
                fields.get(9).and_then(|f| f.parse::<u64>().ok()),
            ) else {
                trace!(line, "skipping unparsable socket table row");
                continue;
            };
            if inode == 0 {
                continue;
            }

            let peer = if is_unset(&remote) { None } else { Some(remote) };
            self.sockets.insert(
                inode,
                TableSocket {
                    socket_type,
                    local,
                    peer,
                },
            );
        }
    }

    /// Add the rows of the `unix` table.
    ///
    /// Columns: `Num RefCount Protocol Flags Type St Inode [Path]`, with
    /// `Type` in hex.
    fn add_unix(&mut self, contents: &str) {
        for line in contents.lines().skip(1) {
            let fields: Vec<&str> = line.split_ascii_whitespace().collect();
            let (Some(raw_type), Some(inode)) = (
                fields.get(4).and_then(|f| i32::from_str_radix(f, 16).ok()),
                fields.get(6).and_then(|f| f.parse::<u64>().ok()),
            ) else {
                trace!(line, "skipping unparsable unix table row");
                continue;
            };

            let socket_type = match raw_type {
                libc::SOCK_STREAM => SocketType::Stream,
                libc::SOCK_DGRAM => SocketType::Datagram,
                other => SocketType::Other(other),
            };
            self.sockets.insert(
                inode,
                TableSocket {
                    socket_type,
                    local: SocketAddress::Other {
                        family: libc::AF_UNIX,
                    },
                    peer: None,
                },
            );
        }
    }
}

fn read_table(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Parse `0100007F:0CEA` (IPv4) or a 32-digit IPv6 address and port.
///
/// The kernel prints each 32-bit word of the address in host byte order and
/// the port already converted from network order.
fn parse_inet_address(field: &str) -> Option<SocketAddress> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;

    match addr.len() {
        8 => {
            let word = u32::from_str_radix(addr, 16).ok()?;
            let ip = Ipv4Addr::from(word.to_ne_bytes());
            Some(SocketAddress::Inet(SocketAddrV4::new(ip, port)))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                let word = u32::from_str_radix(addr.get(i * 8..i * 8 + 8)?, 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            let ip = Ipv6Addr::from(octets);
            Some(SocketAddress::Inet6(SocketAddrV6::new(ip, port, 0, 0)))
        }
        _ => None,
    }
}

/// All-zero remote address: the socket has no peer.
fn is_unset(addr: &SocketAddress) -> bool {
    match addr {
        SocketAddress::Inet(a) => a.ip().is_unspecified() && a.port() == 0,
        SocketAddress::Inet6(a) => a.ip().is_unspecified() && a.port() == 0,
        SocketAddress::Other { .. } => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream, UdpSocket};

    /// Attach to ourselves, or `None` if this kernel or sandbox has no
    /// pidfd support.
    fn attach_self() -> Option<PidfdHandle> {
        match PidfdHandle::open(std::process::id()) {
            Ok(handle) => Some(handle),
            Err(err) => {
                eprintln!("skipping: pidfd_open unavailable: {err}");
                None
            }
        }
    }

    /// How the kernel prints an IPv4 address in the inet tables.
    fn hex_v4(ip: Ipv4Addr) -> String {
        format!("{:08X}", u32::from_ne_bytes(ip.octets()))
    }

    fn hex_v6(ip: Ipv6Addr) -> String {
        ip.octets()
            .chunks_exact(4)
            .map(|w| format!("{:08X}", u32::from_ne_bytes([w[0], w[1], w[2], w[3]])))
            .collect()
    }

    const TCP_HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";

    fn tcp_row(local: &str, remote: &str, state: &str, inode: u64) -> String {
        format!(
            "   0: {local} {remote} {state} 00000000:00000000 00:00000000 00000000  1000        0 {inode} 1 0000000000000000 100 0 0 10 0"
        )
    }

    #[test]
    fn test_parse_inet_address_v4() {
        let field = format!("{}:1F90", hex_v4(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(
            parse_inet_address(&field),
            Some(SocketAddress::Inet(SocketAddrV4::new(
                Ipv4Addr::new(10, 1, 2, 3),
                8080
            )))
        );
    }

    #[test]
    fn test_parse_inet_address_v6() {
        let field = format!("{}:01BB", hex_v6(Ipv6Addr::LOCALHOST));
        assert_eq!(
            parse_inet_address(&field),
            Some(SocketAddress::Inet6(SocketAddrV6::new(
                Ipv6Addr::LOCALHOST,
                443,
                0,
                0
            )))
        );
    }

    #[test]
    fn test_parse_inet_address_rejects_garbage() {
        assert_eq!(parse_inet_address("0100007F"), None);
        assert_eq!(parse_inet_address("0100:0050"), None);
        assert_eq!(parse_inet_address("ZZZZZZZZ:0050"), None);
    }

    #[test]
    fn test_inet_table_rows() {
        let listen = format!("{}:0CEA", hex_v4(Ipv4Addr::LOCALHOST));
        let client = format!("{}:D431", hex_v4(Ipv4Addr::LOCALHOST));
        let zero = format!("{}:0000", hex_v4(Ipv4Addr::UNSPECIFIED));
        let contents = [
            TCP_HEADER.to_string(),
            tcp_row(&listen, &zero, "0A", 1001),
            tcp_row(&client, &listen, "01", 1002),
            tcp_row(&client, &listen, "06", 0),
            "   3: not a row".to_string(),
        ]
        .join("\n");

        let mut table = SocketTable::default();
        table.add_inet(&contents, SocketType::Stream);
        assert_eq!(table.len(), 2);

        let listener = table.get(1001).unwrap();
        assert_eq!(listener.socket_type().unwrap(), SocketType::Stream);
        assert!(listener.peer_address().is_err());
        assert_eq!(
            listener.local_address().unwrap(),
            SocketAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3306))
        );

        let connected = table.get(1002).unwrap();
        assert_eq!(
            connected.peer_address().unwrap(),
            SocketAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3306))
        );
    }

    #[test]
    fn test_unix_table_rows() {
        let contents = "Num       RefCount Protocol Flags    Type St Inode Path\n\
             0000000000000000: 00000002 00000000 00010000 0001 01 2001 /run/app.sock\n\
             0000000000000000: 00000002 00000000 00000000 0002 01 2002\n";
        let mut table = SocketTable::default();
        table.add_unix(contents);

        let stream = table.get(2001).unwrap();
        assert_eq!(stream.socket_type, SocketType::Stream);
        assert_eq!(
            stream.local,
            SocketAddress::Other {
                family: libc::AF_UNIX
            }
        );
        assert_eq!(table.get(2002).unwrap().socket_type, SocketType::Datagram);
    }

    #[test]
    fn test_socket_inode() {
        assert_eq!(socket_inode(Path::new("socket:[12345]")), Some(12345));
        assert_eq!(socket_inode(Path::new("pipe:[12345]")), None);
        assert_eq!(socket_inode(Path::new("/dev/null")), None);
    }

    #[test]
    fn test_missing_tables_are_empty() {
        let table = SocketTable::load(Path::new("/nonexistent/net")).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_split_cmdline() {
        assert_eq!(
            split_cmdline(b"server\0--port\08080\0"),
            vec!["server", "--port", "8080"]
        );
        assert!(split_cmdline(b"").is_empty());
    }

    #[test]
    fn test_open_rejects_unsafe_pids() {
        for pid in [0, MAX_SAFE_PID + 1] {
            let err = PidfdHandle::open(pid).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
    }

    #[test]
    fn test_registry_lists_self() {
        let entries = ProcfsHost::new().process_entries().unwrap();
        let me = OsString::from(std::process::id().to_string());
        assert!(entries.contains(&me));
    }

    #[test]
    fn test_classifies_own_listener_as_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let file = fs::File::open("/proc/self/status").expect("open");
        let host = ProcfsHost::new();
        let pid = std::process::id();

        assert!(host.is_socket(pid, listener.as_raw_fd()).unwrap());
        assert!(!host.is_socket(pid, file.as_raw_fd()).unwrap());

        let fds = host.descriptor_entries(pid).unwrap();
        let wanted = OsString::from(listener.as_raw_fd().to_string());
        assert!(fds.contains(&wanted));
    }

    #[test]
    fn test_queries_own_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let Some(handle) = attach_self() else { return };
        let socket = handle.socket(listener.as_raw_fd()).unwrap();

        assert_eq!(socket.socket_type().unwrap(), SocketType::Stream);
        assert!(socket.peer_address().is_err());
        let local = listener.local_addr().unwrap();
        assert_eq!(
            socket.local_address().unwrap(),
            SocketAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, local.port()))
        );
    }

    #[test]
    fn test_queries_connected_stream_and_udp() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().unwrap()).expect("connect");
        let udp = UdpSocket::bind("127.0.0.1:0").expect("bind udp");
        let Some(handle) = attach_self() else { return };

        let stream = handle.socket(client.as_raw_fd()).unwrap();
        assert_eq!(stream.socket_type().unwrap(), SocketType::Stream);
        assert_eq!(
            stream.peer_address().unwrap(),
            SocketAddress::Inet(SocketAddrV4::new(
                Ipv4Addr::LOCALHOST,
                listener.local_addr().unwrap().port()
            ))
        );

        let dgram = handle.socket(udp.as_raw_fd()).unwrap();
        assert_eq!(dgram.socket_type().unwrap(), SocketType::Datagram);
    }

    #[test]
    fn test_non_socket_descriptor_is_rejected() {
        let file = fs::File::open("/proc/self/status").expect("open");
        let Some(handle) = attach_self() else { return };
        let err = handle.socket(file.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_self_metadata() {
        let Some(handle) = attach_self() else { return };
        let meta = handle.metadata().unwrap();
        assert!(!meta.name.is_empty());
        assert!(meta.name.len() <= 15, "comm is at most 15 bytes");
        assert!(!meta.args.is_empty());
        assert_eq!(handle.pid(), std::process::id());
    }
}
