//! Pipelined instruction dispatcher.
//!
//! A [`Dispatcher`] is attached to one accelerator for one GEMM shape. It
//! owns the device buffers for both operands and the result, and the
//! residency table that lets repeated runs skip refetching unchanged
//! operands.
//!
//! # Run sequence
//!
//! 1. Build the schedule and commit its residency updates
//! 2. Disable the stages and prefill the command queues
//! 3. Enable the cycle counter and all three stages
//! 4. Drain the remaining tokens and configurations round-robin
//! 5. Poll until the Result stage has nothing outstanding
//! 6. Disable the stages and counter and read the performance counters
//!
//! Steps 4 and 5 honour the [`RunOptions`] deadline and cancellation token.
//! Without either, a stalled stage blocks [`Dispatcher::run`] forever.

pub mod drain;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use drain::{Drain, Stream};

use crate::config::Config;
use crate::error::{Error, Result, RunPhase};
use crate::hw::{
    Accelerator, DeviceBuffer, HardwareCapability, ResultElem, Stage, ACCEL_SIGNATURE,
    RESULT_ELEM_BYTES,
};
use crate::perf::{PerfCounters, PerfReport};
use crate::sched::{OperandBuffers, ResidencyTracker, Schedule, TileHierarchy};
use crate::shape::{BitSerialOperand, GemmShape, Operand};

/// Shared flag that aborts a run in progress.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect at the dispatcher's next poll.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear a previous cancellation so the token can be reused.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bounds on a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Give up once a run has taken this long.
    pub timeout: Option<Duration>,
    /// Give up once this token is cancelled.
    pub cancel: Option<CancelToken>,
}

impl RunOptions {
    /// Options from the loaded configuration (timeout only).
    pub fn from_config(config: &Config) -> Self {
        Self { timeout: config.run_timeout(), cancel: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Drives one accelerator through repeated GEMM runs of a fixed shape.
pub struct Dispatcher<A: Accelerator> {
    accel: A,
    cap: HardwareCapability,
    fclk_mhz: f64,
    shape: GemmShape,
    plan: TileHierarchy,
    lhs_buf: DeviceBuffer,
    rhs_buf: DeviceBuffer,
    res_buf: DeviceBuffer,
    residency: ResidencyTracker,
    options: RunOptions,
    runs: u64,
}

impl<A: Accelerator> Dispatcher<A> {
    /// Attach to `accel` for GEMMs of `shape`.
    ///
    /// Identifies the device, reads its capability and computes the tile
    /// plan before touching device memory, so an unusable shape or device
    /// fails without side effects.
    pub fn new(mut accel: A, shape: GemmShape, options: RunOptions) -> Result<Self> {
        let found = accel.signature();
        if found != ACCEL_SIGNATURE {
            return Err(Error::DeviceNotReady { expected: ACCEL_SIGNATURE, found });
        }
        let cap = accel.capability();
        cap.validate()?;
        let plan = TileHierarchy::new(&cap, &shape)?;
        Schedule::build(&cap, &shape, &plan, OperandBuffers::default(), &mut ResidencyTracker::new())?;
        let fclk_mhz = accel.fclk_mhz();

        log::info!(
            "attached {}x{}x{} accelerator at {} MHz for {}x{}x{} GEMM ({}x{} bits)",
            cap.dpa_dim_lhs,
            cap.dpa_dim_common,
            cap.dpa_dim_rhs,
            fclk_mhz,
            shape.lhs.rows,
            shape.lhs.cols,
            shape.rhs.rows,
            shape.lhs.bits,
            shape.rhs.bits
        );

        let lhs_buf = accel.allocate(shape.lhs_bytes())?;
        let rhs_buf = match accel.allocate(shape.rhs_bytes()) {
            Ok(b) => b,
            Err(e) => {
                accel.free(lhs_buf);
                return Err(e.into());
            }
        };
        let res_buf = match accel.allocate(shape.result_bytes()) {
            Ok(b) => b,
            Err(e) => {
                accel.free(lhs_buf);
                accel.free(rhs_buf);
                return Err(e.into());
            }
        };
        accel.reset();

        Ok(Self {
            accel,
            cap,
            fclk_mhz,
            shape,
            plan,
            lhs_buf,
            rhs_buf,
            res_buf,
            residency: ResidencyTracker::new(),
            options,
            runs: 0,
        })
    }

    pub fn capability(&self) -> &HardwareCapability {
        &self.cap
    }

    pub fn shape(&self) -> &GemmShape {
        &self.shape
    }

    pub fn plan(&self) -> &TileHierarchy {
        &self.plan
    }

    pub fn residency(&self) -> &ResidencyTracker {
        &self.residency
    }

    pub fn accelerator(&self) -> &A {
        &self.accel
    }

    pub fn accelerator_mut(&mut self) -> &mut A {
        &mut self.accel
    }

    pub fn options_mut(&mut self) -> &mut RunOptions {
        &mut self.options
    }

    /// Completed runs.
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Device addresses of the operand buffers.
    pub fn buffers(&self) -> OperandBuffers {
        OperandBuffers { lhs: self.lhs_buf.addr, rhs: self.rhs_buf.addr, result: self.res_buf.addr }
    }

    /// Replace the left-hand operand.
    pub fn set_lhs(&mut self, operand: &impl BitSerialOperand) -> Result<()> {
        self.set_operand(Operand::Lhs, operand)
    }

    /// Replace the right-hand operand.
    pub fn set_rhs(&mut self, operand: &impl BitSerialOperand) -> Result<()> {
        self.set_operand(Operand::Rhs, operand)
    }

    fn set_operand(&mut self, which: Operand, operand: &impl BitSerialOperand) -> Result<()> {
        let expected = *self.shape.operand(which);
        let got = operand.shape();
        if *got != expected {
            return Err(Error::OperandMismatch {
                operand: which.name(),
                reason: format!("shape {got:?} differs from attached {expected:?}"),
            });
        }
        let words = operand.packed_words();
        if words.len() != expected.words() {
            return Err(Error::OperandMismatch {
                operand: which.name(),
                reason: format!("{} packed words, shape needs {}", words.len(), expected.words()),
            });
        }
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let dst = match which {
            Operand::Lhs => self.lhs_buf,
            Operand::Rhs => self.rhs_buf,
        };
        self.accel.copy_to_device(&bytes, &dst)?;
        self.residency.invalidate(which);
        log::debug!("{} operand replaced ({} bytes)", which.name(), bytes.len());
        Ok(())
    }

    /// Copy the last result out, without alignment padding.
    ///
    /// `out` holds `rhs.rows * lhs.rows` elements; element `(r, l)` for RHS
    /// row `r` and LHS row `l` lands at `r * lhs.rows + l`.
    pub fn result(&mut self, out: &mut [ResultElem]) -> Result<()> {
        let (lhs, rhs) = (&self.shape.lhs, &self.shape.rhs);
        if out.len() != lhs.rows * rhs.rows {
            return Err(Error::OperandMismatch {
                operand: "result",
                reason: format!("buffer holds {} elements, result has {}", out.len(), lhs.rows * rhs.rows),
            });
        }
        let mut raw = vec![0u8; self.shape.result_bytes()];
        self.accel.copy_from_device(&self.res_buf, &mut raw)?;
        for r in 0..rhs.rows {
            for l in 0..lhs.rows {
                let at = (r * lhs.rows_aligned + l) * RESULT_ELEM_BYTES;
                let mut elem = [0u8; RESULT_ELEM_BYTES];
                elem.copy_from_slice(&raw[at..at + RESULT_ELEM_BYTES]);
                out[r * lhs.rows + l] = ResultElem::from_le_bytes(elem);
            }
        }
        Ok(())
    }

    /// Reset the accelerator and forget everything resident on-chip.
    pub fn reset(&mut self) {
        self.accel.reset();
        self.residency.invalidate_all();
    }

    /// Build the schedule the next run would stream, without running it.
    ///
    /// Residency is left untouched; only a run marks tiles resident.
    pub fn schedule(&self) -> Result<Schedule> {
        self.build_schedule().map(|(schedule, _)| schedule)
    }

    fn build_schedule(&self) -> Result<(Schedule, ResidencyTracker)> {
        let mut residency = self.residency.clone();
        let schedule = Schedule::build(&self.cap, &self.shape, &self.plan, self.buffers(), &mut residency)?;
        Ok((schedule, residency))
    }

    /// Execute one GEMM on the current operands.
    pub fn run(&mut self) -> Result<PerfReport> {
        let started = Instant::now();
        let (schedule, residency) = self.build_schedule()?;
        self.residency = residency;
        log::info!(
            "run {}: {} fetch, {} execute, {} result instructions; projected {} B read, {} B written",
            self.runs,
            schedule.fetch.len(),
            schedule.execute.len(),
            schedule.result.len(),
            schedule.traffic.fetch_bytes,
            schedule.traffic.write_bytes
        );

        self.accel.set_stage_enables(false, false, false);
        let mut drain = Drain::new(&schedule);
        drain.fill(&mut self.accel);

        self.accel.set_counter_enabled(true);
        self.accel.set_stage_enables(true, true, true);

        while !drain.all_pushed() {
            if let Err(e) = self.check_abort(started, RunPhase::Push) {
                return Err(self.abort(e));
            }
            drain.fill(&mut self.accel);
        }

        while self.accel.outstanding_ops(Stage::Result) != 0 {
            if let Err(e) = self.check_abort(started, RunPhase::Completion) {
                return Err(self.abort(e));
            }
        }

        self.accel.set_stage_enables(false, false, false);
        self.accel.set_counter_enabled(false);
        let counters = PerfCounters::read(&mut self.accel);
        self.runs += 1;

        log::info!(
            "run finished in {} cycles after {} drain passes ({:?} host time)",
            counters.cycles,
            drain.passes(),
            started.elapsed()
        );

        Ok(PerfReport {
            cap: self.cap,
            shape: self.shape,
            counters,
            traffic: schedule.traffic,
            fclk_mhz: self.fclk_mhz,
            instructions: schedule.instruction_counts(),
        })
    }

    fn check_abort(&self, started: Instant, phase: RunPhase) -> Result<()> {
        if let Some(cancel) = &self.options.cancel {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled { phase });
            }
        }
        if let Some(timeout) = self.options.timeout {
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(Error::Timeout { waited, phase });
            }
        }
        Ok(())
    }

    /// Stop the pipeline after an abandoned run. Queued commands and on-chip
    /// state are unknown afterwards, so the device is reset.
    fn abort(&mut self, err: Error) -> Error {
        log::warn!("abandoning run: {err}");
        self.accel.set_stage_enables(false, false, false);
        self.accel.set_counter_enabled(false);
        self.reset();
        err
    }
}

impl<A: Accelerator> Drop for Dispatcher<A> {
    fn drop(&mut self) {
        self.accel.free(self.lhs_buf);
        self.accel.free(self.rhs_buf);
        self.accel.free(self.res_buf);
    }
}
