//! Error types for Simular
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for Simular operations
pub type Result<T> = std::result::Result<T, SimularError>;

/// Error type for all Simular operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimularError {
    /// Fatal error raised by an external collaborator (kernel loader,
    /// work-item interpreter). Carries the originating source location and
    /// aborts the current launch when it reaches the device's top level.
    #[error("{message}")]
    Fatal {
        /// Source file the error originated from
        file: String,
        /// Line within that file
        line: u32,
        /// Human-readable description
        message: String,
    },

    /// Memory allocation request could not be satisfied
    #[error("Memory allocation of {size} bytes failed")]
    AllocationFailed {
        /// Requested allocation size in bytes
        size: usize,
    },

    /// Deallocation of an address that is not the base of a live allocation
    #[error("Deallocation of invalid address 0x{address:x}")]
    InvalidDeallocation {
        /// The offending address
        address: usize,
    },
}

impl SimularError {
    /// Construct a fatal error carrying its originating source location
    pub fn fatal(file: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        SimularError::Fatal {
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}
