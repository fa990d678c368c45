//! Hardware-facing types for the bit-serial matrix multiplication overlay.
//!
//! This module provides:
//! - The capability descriptor read from the accelerator at attach time
//! - Stage and controller-state identifiers used for queues and counters
//! - The collaborator traits through which the dispatcher drives a device
//!
//! # Pipeline Overview
//!
//! The accelerator is three independent stages connected by on-chip
//! buffers. Each stage has its own command FIFOs fed by the host:
//!
//! ```text
//!            tokens + run configs (host)
//!          │              │              │
//!          ▼              ▼              ▼
//!     ┌─────────┐  2  ┌─────────┐  2  ┌─────────┐
//! DRAM│  Fetch  │────►│ Execute │────►│ Result  │DRAM
//! ───►│         │slots│ (DPA)   │slots│         │───►
//!     └─────────┘     └─────────┘     └─────────┘
//! ```
//!
//! Fetch fills one of [`FETCHEXEC_SLOTS`] operand buffer regions while
//! Execute consumes the other; Execute and Result overlap the same way over
//! [`EXECRES_SLOTS`] result buffer regions.

pub mod capability;
pub mod transport;

pub use capability::HardwareCapability;
pub use transport::{
    Accelerator, CapabilitySource, CommandTransport, CycleCounters, DeviceBuffer,
    DeviceMemory, DeviceMemoryError, StageControl,
};

/// Signature register value of a correctly programmed accelerator.
pub const ACCEL_SIGNATURE: u32 = 0xb15e_0a5c;

/// Number of operand buffer regions shared by Fetch and Execute.
pub const FETCHEXEC_SLOTS: usize = 2;

/// Number of result buffer regions shared by Execute and Result.
pub const EXECRES_SLOTS: usize = 2;

/// Number of controller states with a cycle counter.
pub const N_CTRL_STATES: usize = 4;

/// DRAM address alignment required by the Fetch stage, in bytes.
pub const FETCH_ADDR_ALIGN: usize = 64;

/// DRAM transfer size alignment required by the Fetch stage, in bytes.
pub const FETCH_SIZE_ALIGN: usize = 8;

/// Combined fetch alignment.
pub const FETCH_ALIGN: usize = if FETCH_ADDR_ALIGN > FETCH_SIZE_ALIGN {
    FETCH_ADDR_ALIGN
} else {
    FETCH_SIZE_ALIGN
};

/// Clock frequency assumed when none is configured (MHz).
pub const DEFAULT_FCLK_MHZ: f64 = 200.0;

/// Packed bit-group word of a bit-serial operand.
pub type PackedWord = u64;

/// Bits per packed word.
pub const PACKED_WORD_BITS: usize = PackedWord::BITS as usize;

/// Accumulator element written by the Result stage.
pub type ResultElem = i32;

/// Bytes per result element.
pub const RESULT_ELEM_BYTES: usize = std::mem::size_of::<ResultElem>();

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Loads operand tiles from DRAM into on-chip buffers.
    Fetch,
    /// Drives the dot product array from on-chip buffers.
    Execute,
    /// Writes accumulated results back to DRAM.
    Result,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 3] = [Stage::Fetch, Stage::Execute, Stage::Result];

    /// Position of this stage in [`Stage::ALL`].
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Fetch => write!(f, "Fetch"),
            Stage::Execute => write!(f, "Execute"),
            Stage::Result => write!(f, "Result"),
        }
    }
}

/// Phase of a stage's control sequencer, used for cycle attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ControllerState {
    /// Idle, waiting for the next command.
    #[default]
    GetCmd,
    /// Executing a run configuration.
    Run,
    /// Handing a buffer region to the downstream stage.
    Send,
    /// Waiting for a buffer region from a neighbouring stage.
    Receive,
}

impl ControllerState {
    /// All states in counter-select order.
    pub const ALL: [ControllerState; N_CTRL_STATES] = [
        ControllerState::GetCmd,
        ControllerState::Run,
        ControllerState::Send,
        ControllerState::Receive,
    ];

    /// Counter-select index of this state.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Short column label used in reports.
    pub fn label(self) -> &'static str {
        match self {
            ControllerState::GetCmd => "csGetCmd",
            ControllerState::Run => "csRun",
            ControllerState::Send => "csSend",
            ControllerState::Receive => "csReceive",
        }
    }
}
