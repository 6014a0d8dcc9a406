//! Error types for the DMA qualification subsystem.
//!
//! Only genuinely exceptional conditions are errors. A failed capability
//! test, an emergency abort, and a corrupt cache record are all *normal*
//! outcomes of this subsystem and travel through result records and
//! `Option` returns instead.

use core::fmt;

/// Main error type for DMA safety operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// Memory-related errors
    OutOfMemory {
        requested: usize,
    },
    /// Allocation retries exhausted without satisfying physical constraints
    BoundaryRetriesExhausted {
        size: usize,
        attempts: u8,
    },
    /// A buffer's physical placement cannot be used for the transfer
    UnsafePlacement {
        phys: u32,
        len: usize,
    },

    /// Bounce-pool errors
    BouncePoolExhausted {
        direction: &'static str,
    },
    TransferTooLarge {
        len: usize,
        max: usize,
    },

    /// Persistent-store errors (result cache I/O)
    StoreRead {
        detail: &'static str,
    },
    StoreWrite {
        detail: &'static str,
    },
    StoreDelete {
        detail: &'static str,
    },

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Result type alias for DMA safety operations
pub type DmaResult<T> = Result<T, DmaError>;

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {} bytes", requested)
            }
            Self::BoundaryRetriesExhausted { size, attempts } => {
                write!(
                    f,
                    "No boundary-safe placement for {} bytes after {} attempts",
                    size, attempts
                )
            }
            Self::UnsafePlacement { phys, len } => {
                write!(
                    f,
                    "Buffer at phys 0x{:08x} len {} unusable for DMA",
                    phys, len
                )
            }
            Self::BouncePoolExhausted { direction } => {
                write!(f, "{} bounce pool exhausted", direction)
            }
            Self::TransferTooLarge { len, max } => {
                write!(f, "Transfer of {} bytes exceeds bounce size {}", len, max)
            }
            Self::StoreRead { detail } => write!(f, "Cache store read failed: {}", detail),
            Self::StoreWrite { detail } => write!(f, "Cache store write failed: {}", detail),
            Self::StoreDelete { detail } => write!(f, "Cache store delete failed: {}", detail),
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument '{}': {}", name, value)
            }
            Self::InvalidState { expected, actual } => {
                write!(f, "Invalid state: expected {}, got {}", expected, actual)
            }
        }
    }
}
