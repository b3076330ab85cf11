//! Error types for opensockets operations.
//!
//! This module defines the error taxonomy used across the workspace:
//! - [`OpensocketsError`] - Canonical error type for all opensockets operations
//!
//! ## Design Principles
//!
//! - **Structured**: Errors carry typed context (pid, operation) not just messages
//! - **Scoped**: Most errors are per-descriptor or per-process and never stop a
//!   scan; only [`OpensocketsError::Registry`] and
//!   [`OpensocketsError::NotSupported`] end a run
//! - **ABI-aligned**: Uses `u32` for PIDs (unsigned, matches `std::process::id`)

use std::io;
use thiserror::Error;

// ============================================================================
// Canonical Error Type
// ============================================================================

/// Canonical error type for all opensockets operations.
///
/// Per-descriptor and per-process variants are normally logged and skipped
/// by the scanner; any variant that reaches `main` exits with status 1.
#[derive(Debug, Error)]
pub enum OpensocketsError {
    /// The system-wide process registry could not be listed.
    ///
    /// Fatal in discovery mode.
    #[error("failed to open {path}: {source}")]
    Registry {
        /// Registry location (normally `/proc`).
        path: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Results could not be written out.
    #[error("failed to write output: {source}")]
    Output {
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Permission denied for the operation.
    ///
    /// Typically returned when reading another user's descriptor table.
    #[error("Permission denied for '{operation}' on PID {pid}")]
    PermissionDenied {
        /// The process ID we attempted to operate on.
        pid: u32,
        /// The operation that was denied (e.g., "list descriptors").
        operation: String,
    },

    /// Target process not found.
    ///
    /// The specified PID does not exist or has already exited.
    #[error("Process {pid} not found")]
    NotFound {
        /// The process ID that was not found.
        pid: u32,
    },

    /// Operation not supported on the current platform or kernel.
    #[error("Operation '{feature}' not supported on {platform}")]
    NotSupported {
        /// The feature that is not supported.
        feature: String,
        /// The platform where it's not supported.
        platform: String,
    },

    /// Any other IO failure while operating on a process.
    #[error("'{operation}' failed on PID {pid}: {source}")]
    Io {
        /// The process ID we were operating on.
        pid: u32,
        /// The operation that failed.
        operation: String,
        /// The underlying IO error, errno included.
        #[source]
        source: io::Error,
    },
}

// ============================================================================
// Convenience Constructors
// ============================================================================

impl OpensocketsError {
    /// Create a `Registry` error.
    pub fn registry(path: impl Into<String>, source: io::Error) -> Self {
        OpensocketsError::Registry {
            path: path.into(),
            source,
        }
    }

    /// Create an `Output` error.
    pub fn output(source: io::Error) -> Self {
        OpensocketsError::Output { source }
    }

    /// True when output failed because the reader went away (`| head`).
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, OpensocketsError::Output { source } if source.kind() == io::ErrorKind::BrokenPipe)
    }

    /// Create a `PermissionDenied` error.
    pub fn permission_denied(pid: u32, operation: impl Into<String>) -> Self {
        OpensocketsError::PermissionDenied {
            pid,
            operation: operation.into(),
        }
    }

    /// Create a `NotFound` error.
    pub fn not_found(pid: u32) -> Self {
        OpensocketsError::NotFound { pid }
    }

    /// Create a `NotSupported` error.
    pub fn not_supported(feature: impl Into<String>, platform: impl Into<String>) -> Self {
        OpensocketsError::NotSupported {
            feature: feature.into(),
            platform: platform.into(),
        }
    }

    /// Create an `Io` error.
    pub fn io(pid: u32, operation: impl Into<String>, source: io::Error) -> Self {
        OpensocketsError::Io {
            pid,
            operation: operation.into(),
            source,
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

/// Map an IO error raised while operating on `pid` to a structured error.
///
/// `ESRCH`/`ENOENT` mean the process went away, `EPERM`/`EACCES` mean we
/// lack privilege, `ENOSYS` means the kernel lacks the primitive.
pub fn map_io_error(err: io::Error, pid: u32, operation: &str) -> OpensocketsError {
    match (err.kind(), err.raw_os_error()) {
        (io::ErrorKind::PermissionDenied, _) | (_, Some(EPERM)) => {
            OpensocketsError::permission_denied(pid, operation)
        }
        (io::ErrorKind::NotFound, _) | (_, Some(ESRCH)) => OpensocketsError::not_found(pid),
        (io::ErrorKind::Unsupported, _) | (_, Some(ENOSYS)) => {
            OpensocketsError::not_supported(operation, crate::get_platform())
        }
        _ => OpensocketsError::io(pid, operation, err),
    }
}

// Kept local so the core crate stays free of libc.
const EPERM: i32 = 1;
const ESRCH: i32 = 3;
const ENOSYS: i32 = 38;

// ============================================================================
// Result Type Alias
// ============================================================================

/// Result type alias for opensockets operations.
pub type OpensocketsResult<T> = Result<T, OpensocketsError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const EIO: i32 = 5;

    #[test]
    fn test_error_display() {
        let err = OpensocketsError::permission_denied(1234, "list descriptors");
        assert_eq!(
            err.to_string(),
            "Permission denied for 'list descriptors' on PID 1234"
        );

        let err = OpensocketsError::not_found(5678);
        assert_eq!(err.to_string(), "Process 5678 not found");

        let err = OpensocketsError::not_supported("pidfd_open", "linux");
        assert_eq!(
            err.to_string(),
            "Operation 'pidfd_open' not supported on linux"
        );
    }

    #[test]
    fn test_registry_error_keeps_source() {
        let err = OpensocketsError::registry(
            "/proc",
            io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
        );
        assert_eq!(
            err.to_string(),
            "failed to open /proc: No such file or directory"
        );
        match err {
            OpensocketsError::Registry { ref source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            _ => panic!("Expected Registry"),
        }
    }

    #[test]
    fn test_map_io_error_kinds() {
        let err = map_io_error(io::Error::from(io::ErrorKind::NotFound), 42, "stat");
        assert!(matches!(err, OpensocketsError::NotFound { pid: 42 }));

        let err = map_io_error(
            io::Error::from(io::ErrorKind::PermissionDenied),
            42,
            "list descriptors",
        );
        assert!(matches!(
            err,
            OpensocketsError::PermissionDenied { pid: 42, ref operation } if operation == "list descriptors"
        ));
    }

    #[test]
    fn test_map_io_error_errnos() {
        let err = map_io_error(io::Error::from_raw_os_error(ESRCH), 7, "attach");
        assert!(matches!(err, OpensocketsError::NotFound { pid: 7 }));

        let err = map_io_error(io::Error::from_raw_os_error(EPERM), 7, "attach");
        assert!(matches!(err, OpensocketsError::PermissionDenied { pid: 7, .. }));

        let err = map_io_error(io::Error::from_raw_os_error(ENOSYS), 7, "attach");
        assert!(matches!(err, OpensocketsError::NotSupported { .. }));
    }

    #[test]
    fn test_map_io_error_keeps_other_errors() {
        let err = map_io_error(io::Error::from_raw_os_error(EIO), 9, "attach");
        assert_eq!(err.to_string().split(':').next(), Some("'attach' failed on PID 9"));
        match err {
            OpensocketsError::Io { pid, source, .. } => {
                assert_eq!(pid, 9);
                assert_eq!(source.raw_os_error(), Some(EIO));
            }
            _ => panic!("Expected Io"),
        }
    }

    #[test]
    fn test_output_broken_pipe() {
        let err = OpensocketsError::output(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(err.is_broken_pipe());

        let err = OpensocketsError::output(io::Error::other("disk full"));
        assert!(!err.is_broken_pipe());
        assert_eq!(err.to_string(), "failed to write output: disk full");
    }

    #[test]
    fn test_pid_is_u32() {
        let err = OpensocketsError::permission_denied(u32::MAX, "attach");
        match err {
            OpensocketsError::PermissionDenied { pid, .. } => {
                assert_eq!(pid, u32::MAX);
            }
            _ => panic!("Expected PermissionDenied"),
        }
    }
}
