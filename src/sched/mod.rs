//! Hierarchical tile scheduler.
//!
//! Turns a tile plan into the three per-stage programs the dispatcher
//! streams into the accelerator, and projects the DRAM traffic they cause.
//!
//! # Loop nest
//!
//! ```text
//! for lb in lhs row tiles            ┐
//!   for rb in rhs row tiles          ┘ output tile: one Result config
//!     for lp in lhs bit planes
//!       for rp in rhs bit planes
//!         for z in common tiles      step: one Fetch + one Execute config
//! ```
//!
//! Operand buffer slots rotate once per step and result buffer slots once
//! per output tile. Before emitting a fetch the scheduler asks the
//! [`ResidencyTracker`] whether the slot already holds the tile; a hit
//! drops that operand's block transfer from the step.
//!
//! The token and configuration streams of a stage are emitted in the same
//! order, since the hardware pairs them by position.
//!
//! Every Fetch and Result configuration is checked against the stages'
//! DRAM alignment rules as it is emitted. A schedule that would violate
//! them is never returned.

pub mod instr;
pub mod residency;
pub mod tiling;

pub use instr::{
    ExecRunCfg, FetchBlock, FetchRunCfg, OperationToken, ResultRunCfg, RunConfig, TileIndex,
};
pub use residency::{ResidencyTracker, INVALID_TILE};
pub use tiling::{LoopNest, OperandTiling, TileBound, TileHierarchy};

use crate::error::{Error, Result};
use crate::hw::{
    HardwareCapability, Stage, EXECRES_SLOTS, FETCHEXEC_SLOTS, FETCH_ADDR_ALIGN, FETCH_SIZE_ALIGN,
    RESULT_ELEM_BYTES,
};
use crate::shape::{GemmShape, Operand, OperandShape};

/// Device addresses of the three operand buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperandBuffers {
    pub lhs: u64,
    pub rhs: u64,
    pub result: u64,
}

/// Projected DRAM traffic of one schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteTraffic {
    /// Bytes read by the Fetch stage.
    pub fetch_bytes: u64,
    /// Bytes written by the Result stage.
    pub write_bytes: u64,
}

impl ByteTraffic {
    pub fn total(&self) -> u64 {
        self.fetch_bytes + self.write_bytes
    }
}

/// Paired configuration and token streams of one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageProgram {
    pub configs: Vec<RunConfig>,
    pub tokens: Vec<OperationToken>,
}

impl StageProgram {
    fn push(&mut self, config: RunConfig, token: OperationToken) {
        self.configs.push(config);
        self.tokens.push(token);
    }

    /// Number of instructions (configurations) in the stream.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

/// Everything one run streams into the accelerator.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub plan: TileHierarchy,
    pub nest: LoopNest,
    pub fetch: StageProgram,
    pub execute: StageProgram,
    pub result: StageProgram,
    pub traffic: ByteTraffic,
}

impl Schedule {
    /// Build the stage programs for `plan`, consulting and updating `residency`.
    ///
    /// `plan` must have been computed for the same capability and shape.
    /// Fails with `UnsupportedShape` if a fetch or result transfer would
    /// break the DRAM alignment rules; `residency` may then be partially
    /// updated and should be discarded.
    pub fn build(
        cap: &HardwareCapability,
        shape: &GemmShape,
        plan: &TileHierarchy,
        buffers: OperandBuffers,
        residency: &mut ResidencyTracker,
    ) -> Result<Self> {
        let nest = plan.loop_nest(shape);
        let mut fetch = StageProgram::default();
        let mut execute = StageProgram::default();
        let mut result = StageProgram::default();
        let mut traffic = ByteTraffic::default();

        let l1_pairs = (plan.lhs.l1_per_l2 * plan.rhs.l1_per_l2) as u32;
        let lhs_rows_aligned = shape.lhs.rows_aligned as u64;
        let mut step = 0usize;
        let mut output = 0usize;

        for lb in 0..nest.lhs_tiles {
            for rb in 0..nest.rhs_tiles {
                let result_slot = (output % EXECRES_SLOTS) as u32;
                let mut first = true;
                for lp in 0..nest.lhs_planes {
                    for rp in 0..nest.rhs_planes {
                        let negate = (shape.lhs.signed && lp + 1 == nest.lhs_planes)
                            ^ (shape.rhs.signed && rp + 1 == nest.rhs_planes);
                        for z in 0..nest.z_tiles {
                            let slot = step % FETCHEXEC_SLOTS;
                            let tile = TileIndex { lhs: lb as u32, rhs: rb as u32, z: z as u32 };

                            let lhs_addr = tile_addr(buffers.lhs, &shape.lhs, &plan.lhs, lp, lb, z);
                            let rhs_addr = tile_addr(buffers.rhs, &shape.rhs, &plan.rhs, rp, rb, z);
                            let lhs_block = (!residency.access(Operand::Lhs, slot, lhs_addr))
                                .then(|| fetch_block(cap, Operand::Lhs, &shape.lhs, &plan.lhs, slot, lhs_addr));
                            let rhs_block = (!residency.access(Operand::Rhs, slot, rhs_addr))
                                .then(|| fetch_block(cap, Operand::Rhs, &shape.rhs, &plan.rhs, slot, rhs_addr));

                            let fetch_cfg = FetchRunCfg {
                                slot: slot as u32,
                                lhs: lhs_block,
                                rhs: rhs_block,
                                tiles_per_row: plan.l0_per_l1 as u32,
                            };
                            verify_fetch(&fetch_cfg, tile)?;
                            traffic.fetch_bytes += fetch_cfg.bytes() as u64;
                            let transfers = fetch_cfg.transfers();
                            fetch.push(RunConfig::Fetch(fetch_cfg), OperationToken::new(tile, transfers));

                            let last = lp + 1 == nest.lhs_planes && rp + 1 == nest.rhs_planes && z + 1 == nest.z_tiles;
                            let exec_cfg = ExecRunCfg {
                                fetch_slot: slot as u32,
                                result_slot,
                                lhs_offset: (slot * plan.lhs.l0_per_slot) as u32,
                                rhs_offset: (slot * plan.rhs.l0_per_slot) as u32,
                                num_tiles: plan.l0_per_l1 as u32,
                                lhs_l1_per_l2: plan.lhs.l1_per_l2 as u32,
                                rhs_l1_per_l2: plan.rhs.l1_per_l2 as u32,
                                shift_amount: (lp + rp) as u32,
                                negate,
                                clear_before_first_accumulation: first,
                                commit: last,
                            };
                            execute.push(RunConfig::Execute(exec_cfg), OperationToken::new(tile, l1_pairs));

                            log::debug!(
                                "step {step}: tile {tile} planes ({lp}, {rp}) slot {slot} fetch {}B{}{}",
                                fetch_cfg.bytes(),
                                if lhs_block.is_none() { " lhs-hit" } else { "" },
                                if rhs_block.is_none() { " rhs-hit" } else { "" },
                            );
                            first = false;
                            step += 1;
                        }
                    }
                }

                let lhs_row0 = (lb * plan.lhs.rows_per_l2) as u64;
                let rhs_row0 = (rb * plan.rhs.rows_per_l2) as u64;
                let res_cfg = ResultRunCfg {
                    result_slot,
                    dram_base: buffers.result + (rhs_row0 * lhs_rows_aligned + lhs_row0) * RESULT_ELEM_BYTES as u64,
                    dram_skip: lhs_rows_aligned * RESULT_ELEM_BYTES as u64,
                    lhs_rows: plan.lhs.rows_per_l2 as u32,
                    rhs_rows: plan.rhs.rows_per_l2 as u32,
                    wait_complete_bytes: 0,
                };
                verify_result(&res_cfg)?;
                traffic.write_bytes += res_cfg.bytes() as u64;
                let tile = TileIndex { lhs: lb as u32, rhs: rb as u32, z: 0 };
                result.push(RunConfig::Result(res_cfg), OperationToken::new(tile, l1_pairs));
                output += 1;
            }
        }

        if let Some(RunConfig::Result(last)) = result.configs.last_mut() {
            last.wait_complete_bytes = shape.result_bytes() as u64;
        }

        log::debug!(
            "schedule: {} steps, {} output tiles, fetch {}B, write {}B",
            step,
            output,
            traffic.fetch_bytes,
            traffic.write_bytes
        );

        Ok(Self { plan: *plan, nest, fetch, execute, result, traffic })
    }

    /// Program of one stage.
    pub fn program(&self, stage: Stage) -> &StageProgram {
        match stage {
            Stage::Fetch => &self.fetch,
            Stage::Execute => &self.execute,
            Stage::Result => &self.result,
        }
    }

    /// Instruction count per stage, in [`Stage::ALL`] order.
    pub fn instruction_counts(&self) -> [usize; 3] {
        [self.fetch.len(), self.execute.len(), self.result.len()]
    }
}

fn tile_addr(base: u64, shape: &OperandShape, tiling: &OperandTiling, plane: usize, row_tile: usize, z: usize) -> u64 {
    base + (plane * shape.bitplane_bytes()
        + row_tile * tiling.rows_per_l2 * shape.row_bytes()
        + z * tiling.row_segment_bytes()) as u64
}

fn verify_fetch(cfg: &FetchRunCfg, tile: TileIndex) -> Result<()> {
    for (name, block) in [("lhs", cfg.lhs), ("rhs", cfg.rhs)] {
        let Some(block) = block else { continue };
        if block.dram_base % FETCH_ADDR_ALIGN as u64 != 0 {
            return Err(Error::unsupported(format!(
                "tile {tile}: {name} fetch base 0x{:x} is not {FETCH_ADDR_ALIGN}-byte aligned",
                block.dram_base
            )));
        }
        if block.block_size_bytes as usize % FETCH_SIZE_ALIGN != 0
            || block.block_offset_bytes as usize % FETCH_SIZE_ALIGN != 0
        {
            return Err(Error::unsupported(format!(
                "tile {tile}: {name} fetch blocks of {} bytes every {} bytes are not multiples of {FETCH_SIZE_ALIGN}",
                block.block_size_bytes, block.block_offset_bytes
            )));
        }
    }
    Ok(())
}

fn verify_result(cfg: &ResultRunCfg) -> Result<()> {
    let elem = RESULT_ELEM_BYTES as u64;
    if cfg.dram_base % elem != 0 || cfg.dram_skip % elem != 0 {
        return Err(Error::unsupported(format!(
            "result write at 0x{:x} stride {} is not aligned to {elem}-byte elements",
            cfg.dram_base, cfg.dram_skip
        )));
    }
    Ok(())
}

fn fetch_block(
    cap: &HardwareCapability,
    which: Operand,
    shape: &OperandShape,
    tiling: &OperandTiling,
    slot: usize,
    addr: u64,
) -> FetchBlock {
    let bram_id_start = match which {
        Operand::Lhs => 0,
        Operand::Rhs => cap.dpa_dim_lhs,
    };
    FetchBlock {
        dram_base: addr,
        block_size_bytes: tiling.row_segment_bytes() as u32,
        block_offset_bytes: shape.row_bytes() as u32,
        block_count: tiling.rows_per_l2 as u32,
        bram_addr_base: (slot * tiling.l0_per_slot) as u32,
        bram_id_start,
        bram_id_range: tiling.array_dim as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap_2x64x2() -> HardwareCapability {
        HardwareCapability {
            dpa_dim_lhs: 2,
            dpa_dim_rhs: 2,
            dpa_dim_common: 64,
            lhs_entries_per_mem: 1024,
            rhs_entries_per_mem: 1024,
            read_chan_width: 64,
            write_chan_width: 64,
            ..HardwareCapability::reference()
        }
    }

    fn buffers() -> OperandBuffers {
        OperandBuffers { lhs: 0x1000_0000, rhs: 0x1000_1000, result: 0x1000_2000 }
    }

    fn shape(lhs_rows: usize, rhs_rows: usize, cols: usize, bits: u32, signed: bool) -> GemmShape {
        GemmShape::new(
            OperandShape::new(lhs_rows, lhs_rows, cols, cols, bits, signed),
            OperandShape::new(rhs_rows, rhs_rows, cols, cols, bits, signed),
        )
    }

    fn build(cap: &HardwareCapability, s: &GemmShape, residency: &mut ResidencyTracker) -> Schedule {
        let plan = TileHierarchy::new(cap, s).unwrap();
        Schedule::build(cap, s, &plan, buffers(), residency).unwrap()
    }

    #[test]
    fn test_single_tile_traffic() {
        let cap = cap_2x64x2();
        let s = shape(4, 2, 64, 1, false);
        let mut residency = ResidencyTracker::new();
        let sched = build(&cap, &s, &mut residency);

        assert_eq!(sched.plan.lhs.l2_per_matrix, 1);
        assert_eq!(sched.plan.rhs.l2_per_matrix, 1);
        assert_eq!(sched.traffic.fetch_bytes, (s.lhs_bytes() + s.rhs_bytes()) as u64);
        assert_eq!(sched.traffic.fetch_bytes, 48);
        assert_eq!(sched.traffic.write_bytes, 32);
        assert_eq!(sched.instruction_counts(), [1, 1, 1]);
    }

    #[test]
    fn test_second_pass_hits() {
        let cap = cap_2x64x2();
        let s = shape(4, 2, 64, 1, false);
        let mut residency = ResidencyTracker::new();
        build(&cap, &s, &mut residency);
        let again = build(&cap, &s, &mut residency);

        assert_eq!(again.traffic.fetch_bytes, 0);
        assert_eq!(again.traffic.write_bytes, 32);
        match again.fetch.configs[0] {
            RunConfig::Fetch(cfg) => {
                assert!(cfg.lhs.is_none() && cfg.rhs.is_none());
            }
            ref other => panic!("unexpected config {other:?}"),
        }
        assert_eq!(again.fetch.tokens[0].repeat, 0);
    }

    #[test]
    fn test_invalidate_forces_refetch() {
        let cap = cap_2x64x2();
        let s = shape(4, 2, 64, 1, false);
        let mut residency = ResidencyTracker::new();
        build(&cap, &s, &mut residency);
        residency.invalidate(Operand::Rhs);
        let again = build(&cap, &s, &mut residency);
        assert_eq!(again.traffic.fetch_bytes, s.rhs_bytes() as u64);
    }

    #[test]
    fn test_idempotent_with_fresh_residency() {
        let cap = cap_2x64x2();
        let s = shape(8, 4, 256, 2, true);
        let a = build(&cap, &s, &mut ResidencyTracker::new());
        let b = build(&cap, &s, &mut ResidencyTracker::new());
        assert_eq!(a, b);
    }

    #[test]
    fn test_streams_pair_positionally() {
        let cap = HardwareCapability { lhs_entries_per_mem: 8, rhs_entries_per_mem: 8, ..cap_2x64x2() };
        let s = shape(8, 4, 256, 1, false);
        let sched = build(&cap, &s, &mut ResidencyTracker::new());
        for stage in Stage::ALL {
            let p = sched.program(stage);
            assert_eq!(p.configs.len(), p.tokens.len());
            assert!(p.configs.iter().all(|c| c.stage() == stage));
        }
        assert_eq!(sched.fetch.len(), sched.nest.steps());
        assert_eq!(sched.result.len(), sched.nest.output_tiles());
    }

    #[test]
    fn test_slot_rotation() {
        // 8 entries per slot, 16 stripes: 2 common tiles per output tile.
        let cap = HardwareCapability { lhs_entries_per_mem: 16, rhs_entries_per_mem: 16, ..cap_2x64x2() };
        let s = shape(2, 4, 1024, 1, false);
        let sched = build(&cap, &s, &mut ResidencyTracker::new());
        assert_eq!(sched.nest.z_tiles, 2);

        let slots: Vec<u32> = sched
            .execute
            .configs
            .iter()
            .map(|c| match c {
                RunConfig::Execute(e) => e.fetch_slot,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 0, 1]);

        let res_slots: Vec<u32> = sched
            .result
            .configs
            .iter()
            .map(|c| match c {
                RunConfig::Result(r) => r.result_slot,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(res_slots, vec![0, 1]);
    }

    #[test]
    fn test_rotation_resets_per_build() {
        // Two steps per run: both slots are reused identically on the next run.
        let cap = HardwareCapability { lhs_entries_per_mem: 16, rhs_entries_per_mem: 16, ..cap_2x64x2() };
        let s = shape(2, 2, 1024, 1, false);
        let mut residency = ResidencyTracker::new();
        let first = build(&cap, &s, &mut residency);
        assert_eq!(first.traffic.fetch_bytes, (s.lhs_bytes() + s.rhs_bytes()) as u64);
        let second = build(&cap, &s, &mut residency);
        assert_eq!(second.traffic.fetch_bytes, 0);
    }

    #[test]
    fn test_accumulation_flags() {
        let cap = cap_2x64x2();
        let s = shape(2, 2, 512, 2, true);
        let sched = build(&cap, &s, &mut ResidencyTracker::new());
        let exec: Vec<ExecRunCfg> = sched
            .execute
            .configs
            .iter()
            .map(|c| match c {
                RunConfig::Execute(e) => *e,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(exec.len(), 4);
        let shifts: Vec<u32> = exec.iter().map(|e| e.shift_amount).collect();
        assert_eq!(shifts, vec![0, 1, 1, 2]);
        let negate: Vec<bool> = exec.iter().map(|e| e.negate).collect();
        // Sign plane is plane 1 of each operand; both sign planes cancel out.
        assert_eq!(negate, vec![false, true, true, false]);
        assert!(exec[0].clear_before_first_accumulation);
        assert!(!exec[1].clear_before_first_accumulation);
        assert!(exec[3].commit);
        assert!(!exec[2].commit);
    }

    #[test]
    fn test_result_addresses() {
        // lhs 8 rows hardware-bound into two row tiles of 4.
        let cap = HardwareCapability { lhs_entries_per_mem: 8, rhs_entries_per_mem: 8, ..cap_2x64x2() };
        let s = shape(8, 4, 128, 1, false);
        let sched = build(&cap, &s, &mut ResidencyTracker::new());
        let res: Vec<ResultRunCfg> = sched
            .result
            .configs
            .iter()
            .map(|c| match c {
                RunConfig::Result(r) => *r,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].dram_base, buffers().result);
        assert_eq!(res[1].dram_base, buffers().result + 4 * 4);
        assert_eq!(res[0].dram_skip, 8 * 4);
        assert_eq!(res[0].wait_complete_bytes, 0);
        assert_eq!(res[1].wait_complete_bytes, s.result_bytes() as u64);
        assert_eq!(sched.traffic.write_bytes, s.result_bytes() as u64);
    }

    #[test]
    fn test_fetch_block_layout() {
        let cap = cap_2x64x2();
        let s = shape(4, 2, 64, 1, false);
        let sched = build(&cap, &s, &mut ResidencyTracker::new());
        let RunConfig::Fetch(cfg) = sched.fetch.configs[0] else {
            panic!("expected fetch config");
        };
        let lhs = cfg.lhs.unwrap();
        let rhs = cfg.rhs.unwrap();
        assert_eq!(lhs.dram_base, buffers().lhs);
        assert_eq!(lhs.block_size_bytes, 8);
        assert_eq!(lhs.block_count, 4);
        assert_eq!(lhs.bram_id_start, 0);
        assert_eq!(rhs.bram_id_start, 2);
        assert_eq!(rhs.bram_id_range, 2);
    }

    #[test]
    fn test_fetch_bases_aligned() {
        let cap = HardwareCapability { lhs_entries_per_mem: 16, rhs_entries_per_mem: 16, ..cap_2x64x2() };
        let s = GemmShape::for_hardware(&cap, 8, 1024, 4, 2, 2, true, true);
        let sched = build(&cap, &s, &mut ResidencyTracker::new());
        assert_eq!(sched.nest.z_tiles, 2);
        for cfg in &sched.fetch.configs {
            let RunConfig::Fetch(f) = cfg else { unreachable!() };
            for block in [f.lhs, f.rhs].into_iter().flatten() {
                assert_eq!(block.dram_base % FETCH_ADDR_ALIGN as u64, 0);
                assert_eq!(block.block_size_bytes as usize % FETCH_SIZE_ALIGN, 0);
            }
        }
    }

    #[test]
    fn test_misaligned_common_tiles_rejected() {
        // 4 entries per slot: common tiles start 32 bytes apart within a row.
        let cap = HardwareCapability { lhs_entries_per_mem: 8, rhs_entries_per_mem: 8, ..cap_2x64x2() };
        let s = GemmShape::for_hardware(&cap, 8, 512, 4, 1, 1, false, false);
        let plan = TileHierarchy::new(&cap, &s).unwrap();
        assert_eq!(plan.lhs.row_segment_bytes(), 32);
        let err = Schedule::build(&cap, &s, &plan, buffers(), &mut ResidencyTracker::new()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedShape { .. }));
    }

    #[test]
    fn test_misaligned_buffer_rejected() {
        let cap = cap_2x64x2();
        let s = shape(4, 2, 64, 1, false);
        let plan = TileHierarchy::new(&cap, &s).unwrap();
        let buffers = OperandBuffers { lhs: 0x1000_0008, ..buffers() };
        let err = Schedule::build(&cap, &s, &plan, buffers, &mut ResidencyTracker::new()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedShape { .. }));
    }
}
