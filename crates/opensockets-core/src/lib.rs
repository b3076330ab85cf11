//! opensockets-core: Core types, errors, and platform detection
//!
//! This crate provides the foundational types used across the opensockets
//! workspace:
//! - The canonical error type [`OpensocketsError`] and [`OpensocketsResult`]
//! - IO error mapping with pid/operation context ([`error::map_io_error`])
//! - Platform detection utilities

use std::env::consts::OS;

pub mod error;

// Re-export canonical error type at crate root
pub use error::{OpensocketsError, OpensocketsResult};

// ============================================================================
// Platform Detection
// ============================================================================

/// Get the current platform identifier.
///
/// Returns one of: "linux", "macos", "windows", "freebsd", etc.
#[inline]
pub fn get_platform() -> &'static str {
    OS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_platform() {
        let platform = get_platform();
        assert!(!platform.is_empty());
        assert!(
            ["linux", "macos", "windows", "freebsd", "illumos", "solaris"].contains(&platform),
            "Unexpected platform: {}",
            platform
        );
    }
}
