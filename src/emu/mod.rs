//! Timing-level emulation of the accelerator.
//!
//! [`EmulatedAccel`] implements every collaborator trait in [`crate::hw`]
//! so the dispatcher can be driven end to end without hardware. It models
//! the command FIFOs, the controller state of each stage, the buffer-region
//! hand-offs between stages, and DRAM traffic. It does not compute
//! products: the Result stage writes back zeroed accumulators.
//!
//! Time advances one cycle per host register access, so a host polling
//! loop is also what drives the device forward.
//!
//! # Timing
//!
//! | Stage   | Run-phase cycles                             |
//! |---------|----------------------------------------------|
//! | Fetch   | bytes moved / (`read_chan_width` / 8), min 1 |
//! | Execute | L1 pairs x L0 tiles per pair                 |
//! | Result  | bytes written / (`write_chan_width` / 8)     |

pub mod memory;
pub mod stage;

pub use memory::{DeviceDram, MemoryRegion, DEFAULT_DRAM_CAPACITY, DRAM_BASE};
pub use stage::{SlotCounters, StageEvent, StageModel, StageOp};

use crate::config::Config;
use crate::hw::{
    CapabilitySource, CommandTransport, ControllerState, CycleCounters, DeviceBuffer,
    DeviceMemory, DeviceMemoryError, HardwareCapability, Stage, StageControl, ACCEL_SIGNATURE,
    DEFAULT_FCLK_MHZ, RESULT_ELEM_BYTES,
};
use crate::sched::{OperationToken, RunConfig};

/// Traffic and command statistics since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmuStats {
    /// Register accesses (and therefore cycles) seen.
    pub ticks: u64,
    pub tokens_pushed: u64,
    pub configs_pushed: u64,
    /// Bytes read from DRAM by the Fetch stage.
    pub bytes_read: u64,
    /// Bytes written to DRAM by the Result stage.
    pub bytes_written: u64,
}

/// Emulated accelerator.
#[derive(Debug)]
pub struct EmulatedAccel {
    cap: HardwareCapability,
    signature: u32,
    fclk_mhz: f64,
    stages: [StageModel; 3],
    enabled: [bool; 3],
    slots: SlotCounters,
    counter_enabled: bool,
    cycles: u32,
    dram: DeviceDram,
    stats: EmuStats,
}

impl EmulatedAccel {
    /// A correctly programmed device of the given geometry.
    pub fn new(cap: HardwareCapability) -> Self {
        let depth = cap.cmd_queue_entries as usize;
        Self {
            cap,
            signature: ACCEL_SIGNATURE,
            fclk_mhz: DEFAULT_FCLK_MHZ,
            stages: Stage::ALL.map(|s| StageModel::new(s, depth)),
            enabled: [false; 3],
            slots: SlotCounters::default(),
            counter_enabled: false,
            cycles: 0,
            dram: DeviceDram::default(),
            stats: EmuStats::default(),
        }
    }

    /// Device described by the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.emulator.unwrap_or_default()).with_fclk(config.fclk_mhz)
    }

    /// Report a different identification value.
    pub fn with_signature(mut self, signature: u32) -> Self {
        self.signature = signature;
        self
    }

    pub fn with_fclk(mut self, fclk_mhz: f64) -> Self {
        self.fclk_mhz = fclk_mhz;
        self
    }

    /// Limit allocatable DRAM.
    pub fn with_dram_capacity(mut self, bytes: usize) -> Self {
        self.dram = DeviceDram::new(bytes);
        self
    }

    /// Freeze or release a stage. A frozen stage accepts commands but never
    /// advances.
    pub fn stall(&mut self, stage: Stage, stalled: bool) {
        self.stages[stage.index()].set_stalled(stalled);
    }

    pub fn stage(&self, stage: Stage) -> &StageModel {
        &self.stages[stage.index()]
    }

    pub fn slots(&self) -> &SlotCounters {
        &self.slots
    }

    pub fn memory(&self) -> &DeviceDram {
        &self.dram
    }

    pub fn memory_mut(&mut self) -> &mut DeviceDram {
        &mut self.dram
    }

    /// Buffers allocated and not yet freed.
    pub fn live_buffers(&self) -> usize {
        self.dram.regions().count()
    }

    pub fn stats(&self) -> &EmuStats {
        &self.stats
    }

    /// Advance the device by `n` cycles without host interaction.
    pub fn step(&mut self, n: u64) {
        for _ in 0..n {
            self.tick();
        }
    }

    fn tick(&mut self) {
        self.stats.ticks += 1;
        if self.counter_enabled {
            self.cycles = self.cycles.wrapping_add(1);
        }
        let count = self.counter_enabled;
        let read_bpc = (self.cap.read_chan_width as u64 / 8).max(1);
        let write_bpc = (self.cap.write_chan_width as u64 / 8).max(1);

        for stage in Stage::ALL {
            if !self.enabled[stage.index()] {
                continue;
            }
            let event = self.stages[stage.index()].tick(&mut self.slots, count, |op| match &op.config {
                RunConfig::Fetch(cfg) => (cfg.bytes() as u64).div_ceil(read_bpc),
                RunConfig::Execute(cfg) => op.token.repeat as u64 * cfg.num_tiles as u64,
                RunConfig::Result(cfg) => (cfg.bytes() as u64).div_ceil(write_bpc),
            });
            if let StageEvent::Completed(op) = event {
                self.complete(op);
            }
        }
    }

    /// Apply the DRAM side effects of a finished operation.
    fn complete(&mut self, op: StageOp) {
        match op.config {
            RunConfig::Fetch(cfg) => {
                // Operand buffers are not modelled; only the traffic is.
                for block in [cfg.lhs, cfg.rhs].into_iter().flatten() {
                    self.dram.record_dma_read(block.dram_base, block.bytes());
                }
                self.stats.bytes_read += cfg.bytes() as u64;
                log::trace!("emu fetch {} slot {}: {} bytes", op.token.tile, cfg.slot, cfg.bytes());
            }
            RunConfig::Execute(cfg) => {
                log::trace!(
                    "emu execute {} shift {} negate {} commit {}",
                    op.token.tile,
                    cfg.shift_amount,
                    cfg.negate,
                    cfg.commit
                );
            }
            RunConfig::Result(cfg) => {
                let row = vec![0u8; cfg.lhs_rows as usize * RESULT_ELEM_BYTES];
                for r in 0..cfg.rhs_rows as u64 {
                    self.dram.write_bytes(cfg.dram_base + r * cfg.dram_skip, &row);
                }
                self.dram.record_dma_write(cfg.dram_base, cfg.bytes());
                self.stats.bytes_written += cfg.bytes() as u64;
                if cfg.wait_complete_bytes != 0 {
                    log::debug!("emu result: final tile written, {} bytes expected in total", cfg.wait_complete_bytes);
                }
            }
        }
    }
}

impl CapabilitySource for EmulatedAccel {
    fn signature(&mut self) -> u32 {
        self.tick();
        self.signature
    }

    fn capability(&mut self) -> HardwareCapability {
        self.tick();
        self.cap
    }

    fn fclk_mhz(&self) -> f64 {
        self.fclk_mhz
    }
}

impl CommandTransport for EmulatedAccel {
    fn token_queue_full(&mut self, stage: Stage) -> bool {
        self.tick();
        self.stages[stage.index()].token_full()
    }

    fn push_token(&mut self, stage: Stage, token: &OperationToken) {
        self.tick();
        self.stats.tokens_pushed += 1;
        self.stages[stage.index()].push_token(*token);
    }

    fn config_queue_full(&mut self, stage: Stage) -> bool {
        self.tick();
        self.stages[stage.index()].config_full()
    }

    fn push_config(&mut self, config: &RunConfig) {
        self.tick();
        self.stats.configs_pushed += 1;
        self.stages[config.stage().index()].push_config(*config);
    }

    fn outstanding_ops(&mut self, stage: Stage) -> u32 {
        self.tick();
        self.stages[stage.index()].outstanding()
    }
}

impl StageControl for EmulatedAccel {
    fn set_stage_enables(&mut self, fetch: bool, execute: bool, result: bool) {
        self.tick();
        self.enabled = [fetch, execute, result];
    }

    fn reset(&mut self) {
        log::debug!("emu reset");
        for stage in &mut self.stages {
            stage.reset();
        }
        self.enabled = [false; 3];
        self.slots = SlotCounters::default();
        self.counter_enabled = false;
        self.cycles = 0;
    }
}

impl CycleCounters for EmulatedAccel {
    fn set_counter_enabled(&mut self, enabled: bool) {
        self.tick();
        if enabled && !self.counter_enabled {
            self.cycles = 0;
            for stage in &mut self.stages {
                stage.clear_counters();
            }
        }
        self.counter_enabled = enabled;
    }

    fn cycle_count(&mut self) -> u32 {
        self.tick();
        self.cycles
    }

    fn stage_state_cycles(&mut self, stage: Stage, state: ControllerState) -> u32 {
        self.tick();
        self.stages[stage.index()].state_cycles(state)
    }
}

impl DeviceMemory for EmulatedAccel {
    fn allocate(&mut self, bytes: usize) -> Result<DeviceBuffer, DeviceMemoryError> {
        self.dram.allocate(bytes)
    }

    fn copy_to_device(&mut self, src: &[u8], dst: &DeviceBuffer) -> Result<(), DeviceMemoryError> {
        self.dram.copy_in(src, dst)
    }

    fn copy_from_device(&mut self, src: &DeviceBuffer, dst: &mut [u8]) -> Result<(), DeviceMemoryError> {
        self.dram.copy_out(src, dst)
    }

    fn free(&mut self, buffer: DeviceBuffer) {
        self.dram.free(buffer)
    }
}
