//! Per-stage run configurations and operation tokens.
//!
//! A run configuration is a full parameter record for one unit of stage
//! work. An operation token is the small companion record that tells the
//! stage how many iterations of that configuration to perform. The
//! hardware pairs them positionally: the n-th token of a stage consumes the
//! n-th configuration of the same stage.

use crate::hw::Stage;

/// One strided DRAM block transfer into on-chip operand memory.
///
/// The transfer reads `block_count` blocks of `block_size_bytes`, starting
/// at `dram_base` and advancing by `block_offset_bytes`. Each block is one
/// row segment; consecutive blocks go to consecutive on-chip memories in
/// `bram_id_start..bram_id_start + bram_id_range`, wrapping round, and
/// each wrap advances the on-chip address by the row segment length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchBlock {
    pub dram_base: u64,
    pub block_size_bytes: u32,
    pub block_offset_bytes: u32,
    pub block_count: u32,
    pub bram_addr_base: u32,
    pub bram_id_start: u32,
    pub bram_id_range: u32,
}

impl FetchBlock {
    /// Bytes this block transfer moves.
    pub fn bytes(&self) -> usize {
        self.block_size_bytes as usize * self.block_count as usize
    }
}

/// Fetch stage parameters for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRunCfg {
    /// Operand buffer slot being filled.
    pub slot: u32,
    /// LHS transfer, `None` when the tile is already resident in `slot`.
    pub lhs: Option<FetchBlock>,
    /// RHS transfer, `None` when the tile is already resident in `slot`.
    pub rhs: Option<FetchBlock>,
    /// On-chip words written per row segment.
    pub tiles_per_row: u32,
}

impl FetchRunCfg {
    /// DRAM bytes this step reads.
    pub fn bytes(&self) -> usize {
        self.lhs.map_or(0, |b| b.bytes()) + self.rhs.map_or(0, |b| b.bytes())
    }

    /// Number of block transfers this step performs.
    pub fn transfers(&self) -> u32 {
        self.lhs.is_some() as u32 + self.rhs.is_some() as u32
    }
}

/// Execute stage parameters for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecRunCfg {
    /// Operand buffer slot to read.
    pub fetch_slot: u32,
    /// Result buffer slot to accumulate into.
    pub result_slot: u32,
    /// First LHS on-chip word of the slot.
    pub lhs_offset: u32,
    /// First RHS on-chip word of the slot.
    pub rhs_offset: u32,
    /// L0 tiles accumulated per L1 pair.
    pub num_tiles: u32,
    pub lhs_l1_per_l2: u32,
    pub rhs_l1_per_l2: u32,
    /// Left shift applied to partial products, `lhs_plane + rhs_plane`.
    pub shift_amount: u32,
    /// Subtract instead of add.
    pub negate: bool,
    /// Zero the accumulators before this step.
    pub clear_before_first_accumulation: bool,
    /// Hand the result slot to the Result stage after this step.
    pub commit: bool,
}

/// Result stage parameters for one output tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultRunCfg {
    /// Result buffer slot to drain.
    pub result_slot: u32,
    /// DRAM address of the tile's first element.
    pub dram_base: u64,
    /// DRAM distance between consecutive RHS rows of the tile.
    pub dram_skip: u64,
    /// LHS rows in the tile.
    pub lhs_rows: u32,
    /// RHS rows in the tile.
    pub rhs_rows: u32,
    /// Total result bytes expected once the whole run completes. Zero
    /// except on the final configuration of a run.
    pub wait_complete_bytes: u64,
}

impl ResultRunCfg {
    /// DRAM bytes this tile writes.
    pub fn bytes(&self) -> usize {
        self.lhs_rows as usize * self.rhs_rows as usize * crate::hw::RESULT_ELEM_BYTES
    }
}

/// A run configuration for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunConfig {
    Fetch(FetchRunCfg),
    Execute(ExecRunCfg),
    Result(ResultRunCfg),
}

impl RunConfig {
    /// Stage this configuration targets.
    pub fn stage(&self) -> Stage {
        match self {
            RunConfig::Fetch(_) => Stage::Fetch,
            RunConfig::Execute(_) => Stage::Execute,
            RunConfig::Result(_) => Stage::Result,
        }
    }
}

/// Position in the (LHS tile, RHS tile, common tile) iteration space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TileIndex {
    pub lhs: u32,
    pub rhs: u32,
    pub z: u32,
}

impl std::fmt::Display for TileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.lhs, self.rhs, self.z)
    }
}

/// Operation token: iterations of the paired run configuration.
///
/// `repeat` is the number of DRAM blocks moved for Fetch (zero when both
/// operands are resident and the step is a slot hand-off only), the number
/// of L1 pairs multiplied for Execute, and the number of L1 pairs written
/// for Result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperationToken {
    pub tile: TileIndex,
    pub repeat: u32,
}

impl OperationToken {
    pub fn new(tile: TileIndex, repeat: u32) -> Self {
        Self { tile, repeat }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(size: u32, count: u32) -> FetchBlock {
        FetchBlock {
            dram_base: 0x1000,
            block_size_bytes: size,
            block_offset_bytes: size,
            block_count: count,
            bram_addr_base: 0,
            bram_id_start: 0,
            bram_id_range: 2,
        }
    }

    #[test]
    fn test_fetch_bytes() {
        let cfg = FetchRunCfg { slot: 0, lhs: Some(block(8, 4)), rhs: Some(block(8, 2)), tiles_per_row: 1 };
        assert_eq!(cfg.bytes(), 48);
        assert_eq!(cfg.transfers(), 2);

        let hit = FetchRunCfg { lhs: None, ..cfg };
        assert_eq!(hit.bytes(), 16);
        assert_eq!(hit.transfers(), 1);
    }

    #[test]
    fn test_config_stage() {
        let res = ResultRunCfg {
            result_slot: 1,
            dram_base: 0,
            dram_skip: 16,
            lhs_rows: 4,
            rhs_rows: 2,
            wait_complete_bytes: 0,
        };
        assert_eq!(res.bytes(), 32);
        assert_eq!(RunConfig::Result(res).stage(), Stage::Result);
    }
}
