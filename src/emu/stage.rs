//! Timing model of one pipeline stage.
//!
//! Each stage owns a token FIFO and a run-configuration FIFO, both
//! `cmd_queue_entries` deep, and a four-state controller:
//!
//! ```text
//!   GetCmd ──(token + config)──► Receive ──(slot acquired)──► Run
//!     ▲                                                        │
//!     └──────────────────── Send ◄──────(work done)────────────┘
//! ```
//!
//! The stage spends one cycle in `Send` handing its buffer region to the
//! downstream stage. Buffer hand-offs between stages go through
//! [`SlotCounters`], which the accelerator model shares between all three.

use std::collections::VecDeque;

use crate::hw::{ControllerState, Stage, EXECRES_SLOTS, FETCHEXEC_SLOTS, N_CTRL_STATES};
use crate::sched::{OperationToken, RunConfig};

/// Buffer regions in flight between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCounters {
    /// Operand regions Fetch may fill.
    pub fetch_free: usize,
    /// Operand regions filled and waiting for Execute.
    pub fetch_full: usize,
    /// Result regions Execute may accumulate into.
    pub res_free: usize,
    /// Result regions committed and waiting for Result.
    pub res_full: usize,
}

impl Default for SlotCounters {
    fn default() -> Self {
        Self { fetch_free: FETCHEXEC_SLOTS, fetch_full: 0, res_free: EXECRES_SLOTS, res_full: 0 }
    }
}

impl SlotCounters {
    /// Take the regions `config` needs before running. Returns `false` if
    /// any is unavailable, in which case nothing is taken.
    pub fn acquire(&mut self, config: &RunConfig) -> bool {
        match config {
            RunConfig::Fetch(_) => take(&mut self.fetch_free),
            RunConfig::Execute(cfg) => {
                if self.fetch_full == 0 || (cfg.clear_before_first_accumulation && self.res_free == 0) {
                    return false;
                }
                self.fetch_full -= 1;
                if cfg.clear_before_first_accumulation {
                    self.res_free -= 1;
                }
                true
            }
            RunConfig::Result(_) => take(&mut self.res_full),
        }
    }

    /// Hand the regions `config` used to the next stage.
    pub fn release(&mut self, config: &RunConfig) {
        match config {
            RunConfig::Fetch(_) => self.fetch_full += 1,
            RunConfig::Execute(cfg) => {
                self.fetch_free += 1;
                if cfg.commit {
                    self.res_full += 1;
                }
            }
            RunConfig::Result(_) => self.res_free += 1,
        }
    }
}

fn take(counter: &mut usize) -> bool {
    if *counter == 0 {
        return false;
    }
    *counter -= 1;
    true
}

/// Work in progress on a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOp {
    pub token: OperationToken,
    pub config: RunConfig,
}

/// What a stage did on one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    /// Nothing observable.
    None,
    /// The run phase finished; the caller applies the op's memory effects.
    Completed(StageOp),
}

/// One stage's command queues and controller.
#[derive(Debug, Clone)]
pub struct StageModel {
    stage: Stage,
    depth: usize,
    tokens: VecDeque<OperationToken>,
    configs: VecDeque<RunConfig>,
    current: Option<StageOp>,
    state: ControllerState,
    remaining: u64,
    state_cycles: [u32; N_CTRL_STATES],
    stalled: bool,
    completed: u64,
    overflows: u64,
}

impl StageModel {
    pub fn new(stage: Stage, depth: usize) -> Self {
        Self {
            stage,
            depth,
            tokens: VecDeque::with_capacity(depth),
            configs: VecDeque::with_capacity(depth),
            current: None,
            state: ControllerState::GetCmd,
            remaining: 0,
            state_cycles: [0; N_CTRL_STATES],
            stalled: false,
            completed: 0,
            overflows: 0,
        }
    }

    pub fn token_full(&self) -> bool {
        self.tokens.len() >= self.depth
    }

    pub fn config_full(&self) -> bool {
        self.configs.len() >= self.depth
    }

    /// Queue a token. A push into a full queue is dropped and counted.
    pub fn push_token(&mut self, token: OperationToken) {
        if self.token_full() {
            log::warn!("{} token queue overflow, dropping {:?}", self.stage, token);
            self.overflows += 1;
            return;
        }
        self.tokens.push_back(token);
    }

    /// Queue a run configuration. A push into a full queue is dropped and counted.
    pub fn push_config(&mut self, config: RunConfig) {
        if self.config_full() {
            log::warn!("{} config queue overflow", self.stage);
            self.overflows += 1;
            return;
        }
        self.configs.push_back(config);
    }

    /// Queued tokens plus the operation in progress.
    pub fn outstanding(&self) -> u32 {
        self.tokens.len() as u32 + self.current.is_some() as u32
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn state_cycles(&self, state: ControllerState) -> u32 {
        self.state_cycles[state.index()]
    }

    pub fn clear_counters(&mut self) {
        self.state_cycles = [0; N_CTRL_STATES];
    }

    pub fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    /// Operations completed since the last reset.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Pushes dropped because a queue was full.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Drop all queued and in-flight work.
    pub fn reset(&mut self) {
        self.tokens.clear();
        self.configs.clear();
        self.current = None;
        self.state = ControllerState::GetCmd;
        self.remaining = 0;
        self.state_cycles = [0; N_CTRL_STATES];
        self.completed = 0;
    }

    /// Advance one cycle.
    ///
    /// `duration` gives the run-phase length of an operation and is only
    /// called when one is accepted. `count` gates the state cycle counters.
    pub fn tick(
        &mut self,
        slots: &mut SlotCounters,
        count: bool,
        duration: impl FnOnce(&StageOp) -> u64,
    ) -> StageEvent {
        if count {
            self.state_cycles[self.state.index()] = self.state_cycles[self.state.index()].saturating_add(1);
        }
        if self.stalled {
            return StageEvent::None;
        }

        match self.state {
            ControllerState::GetCmd => {
                if !self.tokens.is_empty() && !self.configs.is_empty() {
                    if let (Some(token), Some(config)) = (self.tokens.pop_front(), self.configs.pop_front()) {
                        self.current = Some(StageOp { token, config });
                        self.state = ControllerState::Receive;
                    }
                }
                StageEvent::None
            }
            ControllerState::Receive => {
                if let Some(op) = self.current {
                    if slots.acquire(&op.config) {
                        self.remaining = duration(&op).max(1);
                        self.state = ControllerState::Run;
                    }
                }
                StageEvent::None
            }
            ControllerState::Run => {
                self.remaining = self.remaining.saturating_sub(1);
                if self.remaining > 0 {
                    return StageEvent::None;
                }
                self.state = ControllerState::Send;
                match self.current {
                    Some(op) => StageEvent::Completed(op),
                    None => StageEvent::None,
                }
            }
            ControllerState::Send => {
                if let Some(op) = self.current.take() {
                    slots.release(&op.config);
                    self.completed += 1;
                }
                self.state = ControllerState::GetCmd;
                StageEvent::None
            }
        }
    }
}
