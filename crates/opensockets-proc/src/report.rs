//! Fixed-column text output.
//!
//! Columns are left-justified: PID (8), EXEC (12), IP (17), PORT (7), then
//! the argument string unpadded. Long values are not truncated; they push
//! the following columns right.

use std::io::{self, Write};

use crate::{ScanSink, ScanWarning, SocketRecord};

/// Placeholder for metadata that could not be read.
pub const UNKNOWN: &str = "<unknown>";

/// The column header line, without a trailing newline.
pub fn format_header() -> String {
    format!(
        "{:<8} {:<12} {:<17} {:<7} {}",
        "PID", "EXEC", "IP", "PORT", "ARGS"
    )
}

/// One output line for `record`, without a trailing newline.
pub fn format_record(record: &SocketRecord) -> String {
    let (name, args) = match &record.metadata {
        Some(meta) => (meta.name.as_str(), meta.args.as_str()),
        None => (UNKNOWN, UNKNOWN),
    };
    format!(
        "{:<8} {:<12} {:<17} {:<7} {}",
        record.socket.pid,
        name,
        record.socket.addr.ip(),
        record.socket.addr.port(),
        args
    )
}

/// Writes records to `out` and warnings to `err`.
pub struct Reporter<W, E> {
    out: W,
    err: E,
    header: bool,
}

impl<W: Write, E: Write> Reporter<W, E> {
    pub fn new(out: W, err: E, header: bool) -> Self {
        Self { out, err, header }
    }
}

impl<W: Write, E: Write> ScanSink for Reporter<W, E> {
    fn begin(&mut self) -> io::Result<()> {
        if self.header {
            writeln!(self.out, "{}", format_header())?;
        }
        Ok(())
    }

    fn record(&mut self, record: &SocketRecord) -> io::Result<()> {
        writeln!(self.out, "{}", format_record(record))
    }

    fn warning(&mut self, warning: &ScanWarning) {
        // Nowhere left to report a failure to write a warning.
        let _ = writeln!(self.err, "Warning: {warning}");
    }
}
