//! Collaborator interfaces between the host control layer and a device.
//!
//! These traits define the narrow boundary the scheduler and dispatcher
//! need. How a field becomes register writes, how device memory is mapped,
//! and how the capability registers are read are all behind them:
//!
//! - [`CapabilitySource`]: signature and geometry, read once at attach time
//! - [`CommandTransport`]: per-stage token and run-configuration FIFOs
//! - [`StageControl`]: stage enables and reset
//! - [`CycleCounters`]: global and per-stage/per-state cycle counters
//! - [`DeviceMemory`]: operand and result buffers in device-visible DRAM
//!
//! The three stages share one queue shape, so [`CommandTransport`] is
//! parameterised by [`Stage`] rather than implemented once per stage.

use thiserror::Error;

use super::{ControllerState, HardwareCapability, Stage};
use crate::sched::{OperationToken, RunConfig};

/// Discovery of the attached device.
pub trait CapabilitySource {
    /// Read the identification register.
    fn signature(&mut self) -> u32;

    /// Read the instantiated hardware geometry.
    fn capability(&mut self) -> HardwareCapability;

    /// Accelerator clock frequency in MHz.
    fn fclk_mhz(&self) -> f64;
}

/// Command FIFOs of the three stages.
///
/// Pushes never block. Callers must check the matching `*_full` signal
/// first; pushing into a full queue is a caller bug.
pub trait CommandTransport {
    /// Whether the stage's operation-token FIFO can accept another entry.
    fn token_queue_full(&mut self, stage: Stage) -> bool;

    /// Push one operation token to a stage.
    fn push_token(&mut self, stage: Stage, token: &OperationToken);

    /// Whether the stage's run-configuration FIFO can accept another entry.
    fn config_queue_full(&mut self, stage: Stage) -> bool;

    /// Push one run configuration. The target stage is implied by the variant.
    fn push_config(&mut self, config: &RunConfig);

    /// Operations queued in or executing on a stage.
    fn outstanding_ops(&mut self, stage: Stage) -> u32;
}

/// Stage enables and reset.
pub trait StageControl {
    /// Enable or disable execution of each stage.
    fn set_stage_enables(&mut self, fetch: bool, execute: bool, result: bool);

    /// Reset the accelerator, dropping queued commands and on-chip state.
    fn reset(&mut self);
}

/// Performance counters.
pub trait CycleCounters {
    /// Gate the global cycle counter. It clears on a disabled-to-enabled transition.
    fn set_counter_enabled(&mut self, enabled: bool);

    /// Read the global cycle counter.
    fn cycle_count(&mut self) -> u32;

    /// Cycles a stage has spent in one controller state.
    fn stage_state_cycles(&mut self, stage: Stage, state: ControllerState) -> u32;
}

/// Handle to a device-visible DRAM buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    /// Device address of the first byte.
    pub addr: u64,
    /// Size in bytes.
    pub bytes: usize,
}

/// Errors from host/device data movement.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceMemoryError {
    /// The device cannot satisfy an allocation.
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes requested.
        requested: usize,
        /// Bytes still available.
        available: usize,
    },

    /// The handle does not name a live allocation.
    #[error("unknown device buffer at 0x{0:016x}")]
    UnknownBuffer(u64),

    /// A copy does not fit the buffer.
    #[error("copy of {len} bytes exceeds buffer of {capacity} bytes at 0x{addr:016x}")]
    OutOfBounds {
        /// Buffer address.
        addr: u64,
        /// Bytes requested.
        len: usize,
        /// Buffer size.
        capacity: usize,
    },
}

/// Device memory allocation and copies.
pub trait DeviceMemory {
    /// Allocate a buffer of at least `bytes` bytes.
    fn allocate(&mut self, bytes: usize) -> Result<DeviceBuffer, DeviceMemoryError>;

    /// Copy host bytes into the start of a device buffer.
    fn copy_to_device(&mut self, src: &[u8], dst: &DeviceBuffer) -> Result<(), DeviceMemoryError>;

    /// Copy the start of a device buffer into host memory.
    fn copy_from_device(&mut self, src: &DeviceBuffer, dst: &mut [u8]) -> Result<(), DeviceMemoryError>;

    /// Release a buffer.
    fn free(&mut self, buffer: DeviceBuffer);
}

/// Everything the dispatcher needs from one attached accelerator.
pub trait Accelerator:
    CapabilitySource + CommandTransport + StageControl + CycleCounters + DeviceMemory
{
}

impl<T> Accelerator for T where
    T: CapabilitySource + CommandTransport + StageControl + CycleCounters + DeviceMemory
{
}

// Forwarding impls so a dispatcher can drive a borrowed device.

impl<T: CapabilitySource + ?Sized> CapabilitySource for &mut T {
    fn signature(&mut self) -> u32 {
        (**self).signature()
    }
    fn capability(&mut self) -> HardwareCapability {
        (**self).capability()
    }
    fn fclk_mhz(&self) -> f64 {
        (**self).fclk_mhz()
    }
}

impl<T: CommandTransport + ?Sized> CommandTransport for &mut T {
    fn token_queue_full(&mut self, stage: Stage) -> bool {
        (**self).token_queue_full(stage)
    }
    fn push_token(&mut self, stage: Stage, token: &OperationToken) {
        (**self).push_token(stage, token)
    }
    fn config_queue_full(&mut self, stage: Stage) -> bool {
        (**self).config_queue_full(stage)
    }
    fn push_config(&mut self, config: &RunConfig) {
        (**self).push_config(config)
    }
    fn outstanding_ops(&mut self, stage: Stage) -> u32 {
        (**self).outstanding_ops(stage)
    }
}

impl<T: StageControl + ?Sized> StageControl for &mut T {
    fn set_stage_enables(&mut self, fetch: bool, execute: bool, result: bool) {
        (**self).set_stage_enables(fetch, execute, result)
    }
    fn reset(&mut self) {
        (**self).reset()
    }
}

impl<T: CycleCounters + ?Sized> CycleCounters for &mut T {
    fn set_counter_enabled(&mut self, enabled: bool) {
        (**self).set_counter_enabled(enabled)
    }
    fn cycle_count(&mut self) -> u32 {
        (**self).cycle_count()
    }
    fn stage_state_cycles(&mut self, stage: Stage, state: ControllerState) -> u32 {
        (**self).stage_state_cycles(stage, state)
    }
}

impl<T: DeviceMemory + ?Sized> DeviceMemory for &mut T {
    fn allocate(&mut self, bytes: usize) -> Result<DeviceBuffer, DeviceMemoryError> {
        (**self).allocate(bytes)
    }
    fn copy_to_device(&mut self, src: &[u8], dst: &DeviceBuffer) -> Result<(), DeviceMemoryError> {
        (**self).copy_to_device(src, dst)
    }
    fn copy_from_device(&mut self, src: &DeviceBuffer, dst: &mut [u8]) -> Result<(), DeviceMemoryError> {
        (**self).copy_from_device(src, dst)
    }
    fn free(&mut self, buffer: DeviceBuffer) {
        (**self).free(buffer)
    }
}
