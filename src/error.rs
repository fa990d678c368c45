//! Error taxonomy for the host control layer.
//!
//! Every precondition on the operand shape and the attached hardware is
//! checked eagerly, before the first command reaches a hardware queue.
//! Nothing here is transient: none of these errors is retried.

use std::time::Duration;

use thiserror::Error;

use crate::hw::DeviceMemoryError;

/// Which part of a run was in progress when it was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Streaming tokens and run configurations into the command queues.
    Push,
    /// Waiting for the Result stage to drain.
    Completion,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Push => write!(f, "push"),
            RunPhase::Completion => write!(f, "completion wait"),
        }
    }
}

/// Errors raised by the scheduler and dispatcher.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// The operand shape violates an alignment or divisibility precondition
    /// relative to the hardware geometry.
    #[error("unsupported shape: {reason}")]
    UnsupportedShape {
        /// Which precondition failed.
        reason: String,
    },

    /// The requested tiling does not fit the discovered hardware.
    #[error("capability mismatch: {reason}")]
    CapabilityMismatch {
        /// Which capacity was exceeded.
        reason: String,
    },

    /// The device did not identify itself as the expected accelerator.
    #[error("device not ready: expected signature 0x{expected:08x}, found 0x{found:08x}")]
    DeviceNotReady {
        /// Signature this driver was built for.
        expected: u32,
        /// Signature read from the device.
        found: u32,
    },

    /// A host operand does not match the shape the dispatcher was built for.
    #[error("{operand} operand mismatch: {reason}")]
    OperandMismatch {
        /// "lhs" or "rhs".
        operand: &'static str,
        /// What differs.
        reason: String,
    },

    /// Host/device data movement failed.
    #[error("device memory: {0}")]
    DeviceMemory(#[from] DeviceMemoryError),

    /// The run deadline passed before the pipeline drained.
    #[error("run timed out after {waited:?} during {phase}")]
    Timeout {
        /// Time spent in the run before giving up.
        waited: Duration,
        /// Phase that was in progress.
        phase: RunPhase,
    },

    /// The run was cancelled through its cancellation token.
    #[error("run cancelled during {phase}")]
    Cancelled {
        /// Phase that was in progress.
        phase: RunPhase,
    },
}

impl Error {
    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        Error::UnsupportedShape { reason: reason.into() }
    }

    pub(crate) fn mismatch(reason: impl Into<String>) -> Self {
        Error::CapabilityMismatch { reason: reason.into() }
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = Error::unsupported("cols_aligned 100 is not a multiple of 64");
        assert_eq!(e.to_string(), "unsupported shape: cols_aligned 100 is not a multiple of 64");

        let e = Error::DeviceNotReady { expected: 0xb15e0001, found: 0 };
        assert!(e.to_string().contains("0xb15e0001"));

        let e = Error::Cancelled { phase: RunPhase::Completion };
        assert_eq!(e.to_string(), "run cancelled during completion wait");
    }
}
