//! Tile hierarchy computation.
//!
//! Three levels per operand:
//!
//! - **L0**: one stripe that fills the dot product array once, `dim` rows by
//!   `dpa_dim_common` bits.
//! - **L1**: `l0_per_l1` consecutive L0 stripes along the common
//!   dimension, the longest run that fits one buffer slot and does not
//!   exceed the operand.
//! - **L2**: `l1_per_l2` L1 groups stacked along the row dimension, as many
//!   as either the slot (hardware-bound) or the operand's row count
//!   (software-bound) allows.
//!
//! Both operands share the common-dimension split, so `l0_per_l1` is
//! reconciled across them before the row dimension is tiled.

use crate::error::{Error, Result};
use crate::hw::HardwareCapability;
use crate::shape::{GemmShape, Operand, OperandShape};

/// Which limit decided the L2 row extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileBound {
    /// The buffer slot ran out before the operand's rows did.
    Hardware,
    /// All rows of a bit plane fit in one slot.
    Software,
}

/// Tiling of one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandTiling {
    /// Array dimension this operand feeds.
    pub array_dim: usize,
    pub bytes_per_l0: usize,
    /// L0 entries available per buffer slot.
    pub l0_per_slot: usize,
    pub l0_per_l1: usize,
    pub bytes_per_l1: usize,
    pub l1_per_l2: usize,
    pub bytes_per_l2: usize,
    /// Operand rows covered by one L2 tile.
    pub rows_per_l2: usize,
    /// L2 row tiles per bit plane.
    pub row_tiles_per_plane: usize,
    /// L2 tiles covering the whole packed operand.
    pub l2_per_matrix: usize,
    pub bound: TileBound,
}

impl OperandTiling {
    /// Bytes of one row within an L1 tile, the DRAM block a fetch moves per row.
    pub fn row_segment_bytes(&self) -> usize {
        self.bytes_per_l1 / self.array_dim
    }
}

/// Extent of the tile loop nest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopNest {
    /// Common-dimension tiles.
    pub z_tiles: usize,
    /// LHS row tiles per bit plane.
    pub lhs_tiles: usize,
    /// RHS row tiles per bit plane.
    pub rhs_tiles: usize,
    pub lhs_planes: usize,
    pub rhs_planes: usize,
}

impl LoopNest {
    /// Output tiles, each written once by the Result stage.
    pub fn output_tiles(&self) -> usize {
        self.lhs_tiles * self.rhs_tiles
    }

    /// Fetch/execute steps per output tile.
    pub fn steps_per_output(&self) -> usize {
        self.lhs_planes * self.rhs_planes * self.z_tiles
    }

    /// Total fetch/execute steps.
    pub fn steps(&self) -> usize {
        self.output_tiles() * self.steps_per_output()
    }
}

/// Tile hierarchy for one (capability, shape) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileHierarchy {
    pub lhs: OperandTiling,
    pub rhs: OperandTiling,
    /// L0 stripes along the common dimension.
    pub stripes: usize,
    /// L0 stripes per L1 tile, shared by both operands.
    pub l0_per_l1: usize,
    /// Common-dimension tiles (L1 groups along the common dimension).
    pub z_l2: usize,
}

impl TileHierarchy {
    /// Compute the hierarchy, failing fast on any precondition violation.
    pub fn new(cap: &HardwareCapability, shape: &GemmShape) -> Result<Self> {
        cap.validate()?;
        shape.validate(cap)?;

        let lhs_l0_per_slot = cap.lhs_l0_per_slot();
        let rhs_l0_per_slot = cap.rhs_l0_per_slot();
        if lhs_l0_per_slot == 0 || rhs_l0_per_slot == 0 {
            return Err(Error::mismatch(format!(
                "operand memories too shallow to double-buffer: lhs {} rhs {} entries",
                cap.lhs_entries_per_mem, cap.rhs_entries_per_mem
            )));
        }

        let max_shift = (shape.lhs.bits - 1) + (shape.rhs.bits - 1);
        if max_shift > cap.max_shift_steps {
            return Err(Error::mismatch(format!(
                "{}x{}-bit product needs shift {} but hardware supports {}",
                shape.lhs.bits, shape.rhs.bits, max_shift, cap.max_shift_steps
            )));
        }

        let stripes = shape.lhs.cols_aligned / cap.dpa_dim_common as usize;
        let l0_per_l1 = lhs_l0_per_slot.min(rhs_l0_per_slot).min(stripes);
        if stripes % l0_per_l1 != 0 {
            return Err(Error::unsupported(format!(
                "{stripes} common-dimension stripes do not split into L1 tiles of {l0_per_l1}"
            )));
        }
        let z_l2 = stripes / l0_per_l1;

        let lhs = tile_operand(cap, Operand::Lhs, &shape.lhs, cap.dpa_dim_lhs as usize, lhs_l0_per_slot, l0_per_l1, z_l2)?;
        let rhs = tile_operand(cap, Operand::Rhs, &shape.rhs, cap.dpa_dim_rhs as usize, rhs_l0_per_slot, l0_per_l1, z_l2)?;

        Ok(Self { lhs, rhs, stripes, l0_per_l1, z_l2 })
    }

    /// Tiling of one operand.
    pub fn operand(&self, which: Operand) -> &OperandTiling {
        match which {
            Operand::Lhs => &self.lhs,
            Operand::Rhs => &self.rhs,
        }
    }

    /// Extent of the loop nest walked by the scheduler.
    pub fn loop_nest(&self, shape: &GemmShape) -> LoopNest {
        LoopNest {
            z_tiles: self.z_l2,
            lhs_tiles: self.lhs.row_tiles_per_plane,
            rhs_tiles: self.rhs.row_tiles_per_plane,
            lhs_planes: shape.lhs.bits as usize,
            rhs_planes: shape.rhs.bits as usize,
        }
    }
}

fn tile_operand(
    cap: &HardwareCapability,
    which: Operand,
    shape: &OperandShape,
    array_dim: usize,
    l0_per_slot: usize,
    l0_per_l1: usize,
    z_l2: usize,
) -> Result<OperandTiling> {
    let name = which.name();
    let bytes_per_l0 = array_dim * cap.dpa_dim_common as usize / 8;
    let bytes_per_l1 = bytes_per_l0 * l0_per_l1;

    let max_l1_hw = l0_per_slot / l0_per_l1;
    let max_l1_sw = shape.rows_aligned / array_dim;
    let (l1_per_l2, bound) = if max_l1_hw < max_l1_sw {
        (max_l1_hw, TileBound::Hardware)
    } else {
        (max_l1_sw, TileBound::Software)
    };
    if l1_per_l2 == 0 {
        return Err(Error::mismatch(format!("{name} L2 tile holds no L1 tiles")));
    }

    let rows_per_l2 = l1_per_l2 * array_dim;
    if shape.rows_aligned % rows_per_l2 != 0 {
        return Err(Error::unsupported(format!(
            "{name}.rows_aligned {} does not split into L2 row tiles of {rows_per_l2}",
            shape.rows_aligned
        )));
    }
    let row_tiles_per_plane = shape.rows_aligned / rows_per_l2;

    let bytes_per_l2 = bytes_per_l1 * l1_per_l2;
    let bytes = shape.bytes();
    if bytes % bytes_per_l2 != 0 {
        return Err(Error::unsupported(format!(
            "{name} size {bytes} is not a multiple of the L2 tile size {bytes_per_l2}"
        )));
    }
    let l2_per_matrix = bytes / bytes_per_l2;
    let expected = shape.bits as usize * row_tiles_per_plane * z_l2;
    if l2_per_matrix != expected || l2_per_matrix * bytes_per_l2 != bytes {
        return Err(Error::unsupported(format!(
            "{name} L2 tiling leaves a gap: {l2_per_matrix} tiles of {bytes_per_l2} bytes, \
             {expected} expected for {bytes} bytes"
        )));
    }

    log::debug!(
        "{name} tiling: l0={bytes_per_l0}B l0/l1={l0_per_l1} l1/l2={l1_per_l2} ({bound:?}-bound) \
         l2={bytes_per_l2}B x{l2_per_matrix}"
    );

    Ok(OperandTiling {
        array_dim,
        bytes_per_l0,
        l0_per_slot,
        l0_per_l1,
        bytes_per_l1,
        l1_per_l2,
        bytes_per_l2,
        rows_per_l2,
        row_tiles_per_plane,
        l2_per_matrix,
        bound,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::OperandShape;

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

    fn shape(lhs_rows: usize, rhs_rows: usize, cols: usize, bits: u32) -> GemmShape {
        GemmShape::new(
            OperandShape::new(lhs_rows, lhs_rows, cols, cols, bits, false),
            OperandShape::new(rhs_rows, rhs_rows, cols, cols, bits, false),
        )
    }

    #[test]
    fn test_single_l2_tile_when_operand_fits() {
        let t = TileHierarchy::new(&cap_2x64x2(), &shape(4, 2, 64, 1)).unwrap();
        assert_eq!(t.stripes, 1);
        assert_eq!(t.l0_per_l1, 1);
        assert_eq!(t.z_l2, 1);
        assert_eq!(t.lhs.l1_per_l2, 2);
        assert_eq!(t.lhs.bytes_per_l2, 32);
        assert_eq!(t.lhs.l2_per_matrix, 1);
        assert_eq!(t.lhs.bound, TileBound::Software);
        assert_eq!(t.rhs.l1_per_l2, 1);
        assert_eq!(t.rhs.bytes_per_l2, 16);
        assert_eq!(t.rhs.l2_per_matrix, 1);
    }

    #[test]
    fn test_hardware_bound_rows() {
        // 8 entries per memory leaves 4 per slot: 2 stripes per L1, 2 L1 per L2.
        let cap = HardwareCapability { lhs_entries_per_mem: 8, rhs_entries_per_mem: 8, ..cap_2x64x2() };
        let t = TileHierarchy::new(&cap, &shape(8, 4, 128, 1)).unwrap();
        assert_eq!(t.l0_per_l1, 2);
        assert_eq!(t.z_l2, 1);
        assert_eq!(t.lhs.l1_per_l2, 2);
        assert_eq!(t.lhs.bound, TileBound::Hardware);
        assert_eq!(t.lhs.row_tiles_per_plane, 2);
        assert_eq!(t.rhs.bound, TileBound::Software);
        assert_eq!(t.rhs.row_tiles_per_plane, 1);
    }

    #[test]
    fn test_common_dimension_split() {
        // 4 entries per slot, 8 stripes: two common-dimension tiles.
        let cap = HardwareCapability { lhs_entries_per_mem: 8, rhs_entries_per_mem: 8, ..cap_2x64x2() };
        let t = TileHierarchy::new(&cap, &shape(2, 2, 512, 1)).unwrap();
        assert_eq!(t.stripes, 8);
        assert_eq!(t.l0_per_l1, 4);
        assert_eq!(t.z_l2, 2);
        assert_eq!(t.lhs.l2_per_matrix, 2);
        assert_eq!(t.lhs.row_segment_bytes(), 32);
    }

    #[test]
    fn test_tiles_cover_operand_exactly() {
        let cap = HardwareCapability { lhs_entries_per_mem: 16, rhs_entries_per_mem: 32, ..cap_2x64x2() };
        for (lr, rr, cols, bits) in [(2, 2, 64, 1), (8, 4, 256, 2), (16, 8, 512, 3), (32, 32, 128, 1)] {
            let s = shape(lr, rr, cols, bits);
            let t = TileHierarchy::new(&cap, &s).unwrap();
            for which in [Operand::Lhs, Operand::Rhs] {
                let ot = t.operand(which);
                assert_eq!(s.operand(which).bytes() % ot.bytes_per_l2, 0);
                assert_eq!(ot.l2_per_matrix * ot.bytes_per_l2, s.operand(which).bytes());
            }
            let nest = t.loop_nest(&s);
            assert_eq!(nest.steps(), nest.output_tiles() * (bits * bits) as usize * t.z_l2);
        }
    }

    #[test]
    fn test_uneven_row_tiles_rejected() {
        // 4 entries per slot, 1 stripe: 4 L1 per L2 covers 8 rows, 12 rows do not split.
        let cap = HardwareCapability { lhs_entries_per_mem: 8, rhs_entries_per_mem: 8, ..cap_2x64x2() };
        let err = TileHierarchy::new(&cap, &shape(12, 2, 64, 1)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedShape { .. }));
    }

    #[test]
    fn test_uneven_stripes_rejected() {
        // 3 entries per slot, 4 stripes.
        let cap = HardwareCapability { lhs_entries_per_mem: 6, rhs_entries_per_mem: 6, ..cap_2x64x2() };
        let err = TileHierarchy::new(&cap, &shape(2, 2, 256, 1)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedShape { .. }));
    }

    #[test]
    fn test_shift_exceeds_hardware() {
        let cap = HardwareCapability { max_shift_steps: 3, ..cap_2x64x2() };
        let err = TileHierarchy::new(&cap, &shape(2, 2, 64, 3)).unwrap_err();
        assert!(matches!(err, Error::CapabilityMismatch { .. }));
    }

    #[test]
    fn test_zero_sized_array_rejected() {
        for cap in [
            HardwareCapability { dpa_dim_lhs: 0, ..cap_2x64x2() },
            HardwareCapability { dpa_dim_rhs: 0, ..cap_2x64x2() },
            HardwareCapability { dpa_dim_common: 0, ..cap_2x64x2() },
        ] {
            let err = TileHierarchy::new(&cap, &shape(4, 2, 64, 1)).unwrap_err();
            assert!(matches!(err, Error::CapabilityMismatch { .. }));
        }
    }

    #[test]
    fn test_misaligned_cols_rejected() {
        let err = TileHierarchy::new(&cap_2x64x2(), &shape(4, 2, 96, 1)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedShape { .. }));
    }

    #[test]
    fn test_idempotent() {
        let cap = cap_2x64x2();
        let s = shape(8, 4, 256, 2);
        assert_eq!(TileHierarchy::new(&cap, &s).unwrap(), TileHierarchy::new(&cap, &s).unwrap());
    }
}
