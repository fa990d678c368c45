//! Performance accounting.
//!
//! After a run the dispatcher snapshots the accelerator's cycle counters
//! into [`PerfCounters`]. Everything else in this module is a pure
//! function of that snapshot plus the capability, the shape and the
//! schedule's projected traffic.

use std::fmt;

use crate::hw::{ControllerState, CycleCounters, HardwareCapability, Stage, N_CTRL_STATES};
use crate::sched::ByteTraffic;
use crate::shape::GemmShape;

/// Cycles one stage spent in each controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateCycles(pub [u32; N_CTRL_STATES]);

impl StateCycles {
    pub fn get(&self, state: ControllerState) -> u32 {
        self.0[state.index()]
    }

    pub fn total(&self) -> u64 {
        self.0.iter().map(|&c| c as u64).sum()
    }
}

/// Raw counter snapshot taken at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerfCounters {
    /// Global cycle counter.
    pub cycles: u32,
    /// Per-stage state cycles in [`Stage::ALL`] order.
    pub stages: [StateCycles; 3],
}

impl PerfCounters {
    /// Read every counter from the device.
    pub fn read<C: CycleCounters + ?Sized>(counters: &mut C) -> Self {
        let mut stages = [StateCycles::default(); 3];
        for stage in Stage::ALL {
            for state in ControllerState::ALL {
                stages[stage.index()].0[state.index()] = counters.stage_state_cycles(stage, state);
            }
        }
        Self { cycles: counters.cycle_count(), stages }
    }

    pub fn stage(&self, stage: Stage) -> &StateCycles {
        &self.stages[stage.index()]
    }

    /// Cycles a stage spent doing work.
    pub fn run_cycles(&self, stage: Stage) -> u32 {
        self.stage(stage).get(ControllerState::Run)
    }
}

/// `num / den`, or zero when there is nothing to divide by.
fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 { 0.0 } else { num / den }
}

/// Performance of one completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct PerfReport {
    pub cap: HardwareCapability,
    pub shape: GemmShape,
    pub counters: PerfCounters,
    /// Projected DRAM traffic of the schedule that ran.
    pub traffic: ByteTraffic,
    pub fclk_mhz: f64,
    /// Instructions issued per stage, in [`Stage::ALL`] order.
    pub instructions: [usize; 3],
}

impl PerfReport {
    pub fn ns_per_cycle(&self) -> f64 {
        ratio(1000.0, self.fclk_mhz)
    }

    pub fn runtime_cycles(&self) -> f64 {
        self.counters.cycles as f64
    }

    pub fn runtime_ns(&self) -> f64 {
        self.runtime_cycles() * self.ns_per_cycle()
    }

    pub fn op_count(&self, include_padding: bool) -> f64 {
        self.shape.op_count(include_padding)
    }

    pub fn binary_op_count(&self, include_padding: bool) -> f64 {
        self.shape.binary_op_count(include_padding)
    }

    /// Achieved binary GOPS (ops per nanosecond).
    pub fn achieved_binary_gops(&self, include_padding: bool) -> f64 {
        ratio(self.binary_op_count(include_padding), self.runtime_ns())
    }

    pub fn peak_binary_ops_per_cycle(&self) -> f64 {
        self.cap.peak_binary_ops_per_cycle()
    }

    pub fn peak_binary_gops(&self) -> f64 {
        ratio(self.peak_binary_ops_per_cycle(), self.ns_per_cycle())
    }

    /// Binary ops per operand byte.
    pub fn workload_read_oi(&self) -> f64 {
        ratio(self.binary_op_count(true), (self.shape.lhs_bytes() + self.shape.rhs_bytes()) as f64)
    }

    /// Binary ops per result byte.
    pub fn workload_write_oi(&self) -> f64 {
        ratio(self.binary_op_count(true), self.shape.result_bytes() as f64)
    }

    pub fn workload_oi(&self) -> f64 {
        let bytes = self.shape.lhs_bytes() + self.shape.rhs_bytes() + self.shape.result_bytes();
        ratio(self.binary_op_count(true), bytes as f64)
    }

    /// Peak read bandwidth, bytes per cycle.
    pub fn hw_read_bw(&self) -> f64 {
        self.cap.read_bytes_per_cycle()
    }

    /// Peak write bandwidth, bytes per cycle.
    pub fn hw_write_bw(&self) -> f64 {
        self.cap.write_bytes_per_cycle()
    }

    /// Read intensity above which the hardware is compute-bound.
    pub fn hw_compute_bound_read_oi(&self) -> f64 {
        ratio(self.peak_binary_ops_per_cycle(), self.hw_read_bw())
    }

    /// Write intensity above which the hardware is compute-bound.
    pub fn hw_compute_bound_write_oi(&self) -> f64 {
        ratio(self.peak_binary_ops_per_cycle(), self.hw_write_bw())
    }

    /// Bytes read per cycle over the whole run.
    pub fn effective_read_bw(&self) -> f64 {
        ratio(self.traffic.fetch_bytes as f64, self.runtime_cycles())
    }

    /// Bytes written per cycle over the whole run.
    pub fn effective_write_bw(&self) -> f64 {
        ratio(self.traffic.write_bytes as f64, self.runtime_cycles())
    }

    /// Bytes read per cycle the Fetch stage spent running.
    pub fn fetch_read_bw(&self) -> f64 {
        ratio(self.traffic.fetch_bytes as f64, self.counters.run_cycles(Stage::Fetch) as f64)
    }

    /// Bytes written per cycle the Result stage spent running.
    pub fn result_write_bw(&self) -> f64 {
        ratio(self.traffic.write_bytes as f64, self.counters.run_cycles(Stage::Result) as f64)
    }

    /// Achieved ops over what the array could do in the stage's running cycles.
    ///
    /// Zero when the stage never ran.
    pub fn stage_efficiency(&self, stage: Stage) -> f64 {
        let run = self.counters.run_cycles(stage) as f64;
        ratio(self.binary_op_count(true), run * self.peak_binary_ops_per_cycle())
    }

    /// Controller-state cycle table.
    pub fn state_table(&self) -> StateTable<'_> {
        StateTable(&self.counters)
    }
}

impl fmt::Display for PerfReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let padded = self.binary_op_count(true);
        let actual = self.binary_op_count(false);
        writeln!(f, "Performance Summary ====================================")?;
        writeln!(f, "Total workload: {padded} binary ops")?;
        writeln!(f, "Actual workload: {actual} binary ops ({:.2}%)", 100.0 * ratio(actual, padded))?;
        writeln!(f, "Input matrix bytes: LHS {} RHS {}", self.shape.lhs_bytes(), self.shape.rhs_bytes())?;
        writeln!(f, "Result matrix bytes: {}", self.shape.result_bytes())?;
        writeln!(
            f,
            "Instructions: {} fetch {} execute {} result",
            self.instructions[0], self.instructions[1], self.instructions[2]
        )?;
        writeln!(f, "HW input matrix buffer bytes: {}", self.cap.buffer_bytes())?;
        writeln!(f, "HW peak perf: {:.2} binary GOPS", self.peak_binary_gops())?;
        writeln!(f, "HW fclk: {} MHz", self.fclk_mhz)?;
        writeln!(f, "Runtime: {} cycles, {:.1} ns", self.counters.cycles, self.runtime_ns())?;
        let achieved = self.achieved_binary_gops(true);
        writeln!(
            f,
            "Achieved: {achieved:.2} binary GOPS ({:.2}%)",
            100.0 * ratio(achieved, self.peak_binary_gops())
        )?;
        writeln!(f, "Workload OI read: {:.2} write: {:.2}", self.workload_read_oi(), self.workload_write_oi())?;
        writeln!(
            f,
            "HW comp-bound OI read: {:.2} write: {:.2}",
            self.hw_compute_bound_read_oi(),
            self.hw_compute_bound_write_oi()
        )?;
        write!(f, "{}", self.state_table())?;
        writeln!(f, "Memory System ==========================================")?;
        let (rd, rd_peak) = (self.effective_read_bw(), self.hw_read_bw());
        writeln!(f, "DRAM reads: {} bytes", self.traffic.fetch_bytes)?;
        writeln!(f, "HW peak rd bandwidth: {rd_peak} bytes/cycle")?;
        writeln!(f, "Effective rd bandwidth: {rd:.3} bytes/cycle ({:.2}%)", 100.0 * ratio(rd, rd_peak))?;
        let fetch_bw = self.fetch_read_bw();
        writeln!(f, "Fetch rd bandwidth: {fetch_bw:.3} bytes/cycle ({:.2}%)", 100.0 * ratio(fetch_bw, rd_peak))?;
        let (wr, wr_peak) = (self.effective_write_bw(), self.hw_write_bw());
        writeln!(f, "DRAM writes: {} bytes", self.traffic.write_bytes)?;
        writeln!(f, "HW peak wr bandwidth: {wr_peak} bytes/cycle")?;
        writeln!(f, "Effective wr bandwidth: {wr:.3} bytes/cycle ({:.2}%)", 100.0 * ratio(wr, wr_peak))?;
        let res_bw = self.result_write_bw();
        writeln!(f, "Result wr bandwidth: {res_bw:.3} bytes/cycle ({:.2}%)", 100.0 * ratio(res_bw, wr_peak))?;
        writeln!(f, "Execute stage efficiency: {:.2}%", 100.0 * self.stage_efficiency(Stage::Execute))?;
        write!(f, "========================================================")
    }
}

/// Per-stage controller-state cycle table.
pub struct StateTable<'a>(&'a PerfCounters);

impl fmt::Display for StateTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const W: usize = 11;
        writeln!(f, "Cycles Spent in ControllerState ========================")?;
        write!(f, "{:<W$}", "Stage")?;
        for state in ControllerState::ALL {
            write!(f, "{:<W$}", state.label())?;
        }
        writeln!(f)?;
        for stage in Stage::ALL {
            write!(f, "{:<W$}", stage.to_string())?;
            for state in ControllerState::ALL {
                write!(f, "{:<W$}", self.0.stage(stage).get(state))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::OperandShape;

    fn report(cycles: u32, exec_run: u32) -> PerfReport {
        let cap = HardwareCapability {
            dpa_dim_lhs: 2,
            dpa_dim_rhs: 2,
            dpa_dim_common: 64,
            ..HardwareCapability::reference()
        };
        let shape = GemmShape::new(
            OperandShape::new(4, 4, 64, 64, 1, false),
            OperandShape::new(2, 2, 64, 64, 1, false),
        );
        let mut counters = PerfCounters { cycles, ..Default::default() };
        counters.stages[Stage::Execute.index()].0[ControllerState::Run.index()] = exec_run;
        counters.stages[Stage::Fetch.index()].0[ControllerState::Run.index()] = 6;
        PerfReport {
            cap,
            shape,
            counters,
            traffic: ByteTraffic { fetch_bytes: 48, write_bytes: 32 },
            fclk_mhz: 200.0,
            instructions: [1, 1, 1],
        }
    }

    #[test]
    fn test_runtime_conversion() {
        let r = report(100, 2);
        assert_eq!(r.ns_per_cycle(), 5.0);
        assert_eq!(r.runtime_ns(), 500.0);
    }

    #[test]
    fn test_throughput() {
        let r = report(100, 2);
        // 2 * 4 * 2 * 64 binary ops in 500 ns.
        assert_eq!(r.binary_op_count(true), 1024.0);
        assert!((r.achieved_binary_gops(true) - 1024.0 / 500.0).abs() < 1e-9);
        assert_eq!(r.peak_binary_ops_per_cycle(), 512.0);
        assert_eq!(r.peak_binary_gops(), 512.0 / 5.0);
    }

    #[test]
    fn test_intensity_and_bandwidth() {
        let r = report(100, 2);
        assert_eq!(r.workload_read_oi(), 1024.0 / 48.0);
        assert_eq!(r.workload_write_oi(), 1024.0 / 32.0);
        assert_eq!(r.hw_read_bw(), 8.0);
        assert_eq!(r.hw_compute_bound_read_oi(), 64.0);
        assert_eq!(r.effective_read_bw(), 0.48);
        assert_eq!(r.fetch_read_bw(), 8.0);
    }

    #[test]
    fn test_stage_efficiency() {
        let r = report(100, 2);
        assert_eq!(r.stage_efficiency(Stage::Execute), 1.0);
        // Result never ran.
        assert_eq!(r.stage_efficiency(Stage::Result), 0.0);
        assert_eq!(r.result_write_bw(), 0.0);
    }

    #[test]
    fn test_zero_cycles_does_not_divide_by_zero() {
        let r = report(0, 0);
        assert_eq!(r.achieved_binary_gops(true), 0.0);
        assert_eq!(r.effective_read_bw(), 0.0);
    }

    #[test]
    fn test_display_contains_state_table() {
        let text = report(100, 2).to_string();
        assert!(text.contains("Performance Summary"));
        assert!(text.contains("csReceive"));
        assert!(text.contains("Execute"));
        assert!(text.contains("Execute stage efficiency: 100.00%"));
    }
}
