//! Operand shape descriptors for bit-serial GEMM.
//!
//! A bit-serial operand is stored bit-plane-major: all rows of bit plane 0,
//! then all rows of bit plane 1, and so on. Each row is `cols_aligned` bits
//! packed into 64-bit words. Rows and columns are padded so that the
//! operand tiles evenly onto the dot product array:
//!
//! ```text
//!                cols_aligned (multiple of dpa_dim_common)
//!            ┌───────────────────────────────┐
//!  plane 0   │ row 0                         │ ┐
//!            │ ...                           │ │ rows_aligned
//!            │ row rows_aligned-1            │ ┘ (multiple of array dim)
//!            ├───────────────────────────────┤
//!  plane 1   │ ...                           │
//!            └───────────────────────────────┘
//! ```
//!
//! The packing itself is produced by an external bit-serial matrix library;
//! this crate consumes it through [`BitSerialOperand`].

use crate::error::{Error, Result};
use crate::hw::{HardwareCapability, PackedWord, FETCH_ALIGN, PACKED_WORD_BITS, RESULT_ELEM_BYTES};

/// Which input of the multiplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Left-hand side, mapped onto the array's LHS dimension.
    Lhs,
    /// Right-hand side, mapped onto the array's RHS dimension.
    Rhs,
}

impl Operand {
    /// Lower-case name used in messages.
    pub fn name(self) -> &'static str {
        match self {
            Operand::Lhs => "lhs",
            Operand::Rhs => "rhs",
        }
    }
}

/// Shape of one bit-serial operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandShape {
    /// Logical rows.
    pub rows: usize,
    /// Rows after padding to the array dimension.
    pub rows_aligned: usize,
    /// Logical columns (the common dimension).
    pub cols: usize,
    /// Columns after padding.
    pub cols_aligned: usize,
    /// Bit planes.
    pub bits: u32,
    /// Whether the most significant plane carries negative weight.
    pub signed: bool,
}

impl OperandShape {
    /// Describe an operand with explicit padding.
    pub fn new(rows: usize, rows_aligned: usize, cols: usize, cols_aligned: usize, bits: u32, signed: bool) -> Self {
        Self { rows, rows_aligned, cols, cols_aligned, bits, signed }
    }

    /// Describe an operand, padding rows and columns up to the given multiples.
    pub fn padded(rows: usize, cols: usize, bits: u32, signed: bool, row_align: usize, col_align: usize) -> Self {
        Self::new(rows, align_up(rows, row_align), cols, align_up(cols, col_align), bits, signed)
    }

    /// Packed words per row.
    #[inline]
    pub fn words_per_row(&self) -> usize {
        self.cols_aligned / PACKED_WORD_BITS
    }

    /// Packed words per bit plane.
    #[inline]
    pub fn words_per_bitplane(&self) -> usize {
        self.rows_aligned * self.words_per_row()
    }

    /// Bytes per packed row.
    #[inline]
    pub fn row_bytes(&self) -> usize {
        self.cols_aligned / 8
    }

    /// Bytes per bit plane.
    #[inline]
    pub fn bitplane_bytes(&self) -> usize {
        self.words_per_bitplane() * std::mem::size_of::<PackedWord>()
    }

    /// Total packed footprint in bytes.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.words_per_bitplane() * self.bits as usize * std::mem::size_of::<PackedWord>()
    }

    /// Total packed footprint in words.
    #[inline]
    pub fn words(&self) -> usize {
        self.words_per_bitplane() * self.bits as usize
    }

    fn validate(&self, which: Operand, array_dim: u32, cap: &HardwareCapability) -> Result<()> {
        let name = which.name();
        if self.bits == 0 {
            return Err(Error::unsupported(format!("{name} has zero bit planes")));
        }
        if self.rows == 0 || self.cols == 0 {
            return Err(Error::unsupported(format!("{name} is empty ({}x{})", self.rows, self.cols)));
        }
        if self.rows > self.rows_aligned || self.cols > self.cols_aligned {
            return Err(Error::unsupported(format!(
                "{name} padding smaller than logical size: {}x{} in {}x{}",
                self.rows, self.cols, self.rows_aligned, self.cols_aligned
            )));
        }
        if self.rows_aligned % array_dim as usize != 0 {
            return Err(Error::unsupported(format!(
                "{name}.rows_aligned {} is not a multiple of array dimension {}",
                self.rows_aligned, array_dim
            )));
        }
        if self.cols_aligned % cap.dpa_dim_common as usize != 0 {
            return Err(Error::unsupported(format!(
                "{name}.cols_aligned {} is not a multiple of dpa_dim_common {}",
                self.cols_aligned, cap.dpa_dim_common
            )));
        }
        if self.cols_aligned % PACKED_WORD_BITS != 0 {
            return Err(Error::unsupported(format!(
                "{name}.cols_aligned {} does not fill whole {}-bit words",
                self.cols_aligned, PACKED_WORD_BITS
            )));
        }
        Ok(())
    }
}

/// Shape of a complete `lhs x rhs^T` problem.
///
/// Both operands are stored row-major along the common dimension, so the
/// product is `rows(lhs) x rows(rhs)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmShape {
    /// Left-hand operand.
    pub lhs: OperandShape,
    /// Right-hand operand.
    pub rhs: OperandShape,
}

impl GemmShape {
    /// Build a shape from two operand descriptors.
    pub fn new(lhs: OperandShape, rhs: OperandShape) -> Self {
        Self { lhs, rhs }
    }

    /// Build a shape padded for the given hardware.
    ///
    /// Rows are padded to the matching array dimension. The common
    /// dimension is padded to a multiple of both `dpa_dim_common` and the
    /// fetch alignment, so every row starts on an aligned DRAM address.
    #[allow(clippy::too_many_arguments)]
    pub fn for_hardware(
        cap: &HardwareCapability,
        lhs_rows: usize,
        depth: usize,
        rhs_rows: usize,
        lhs_bits: u32,
        rhs_bits: u32,
        lhs_signed: bool,
        rhs_signed: bool,
    ) -> Self {
        let col_align = lcm(cap.dpa_dim_common.max(1) as usize, FETCH_ALIGN * 8);
        Self {
            lhs: OperandShape::padded(lhs_rows, depth, lhs_bits, lhs_signed, cap.dpa_dim_lhs.max(1) as usize, col_align),
            rhs: OperandShape::padded(rhs_rows, depth, rhs_bits, rhs_signed, cap.dpa_dim_rhs.max(1) as usize, col_align),
        }
    }

    /// Check every alignment precondition against the hardware geometry.
    pub fn validate(&self, cap: &HardwareCapability) -> Result<()> {
        self.lhs.validate(Operand::Lhs, cap.dpa_dim_lhs, cap)?;
        self.rhs.validate(Operand::Rhs, cap.dpa_dim_rhs, cap)?;
        if self.lhs.cols_aligned != self.rhs.cols_aligned || self.lhs.cols != self.rhs.cols {
            return Err(Error::unsupported(format!(
                "common dimension differs: lhs {} ({} aligned), rhs {} ({} aligned)",
                self.lhs.cols, self.lhs.cols_aligned, self.rhs.cols, self.rhs.cols_aligned
            )));
        }
        Ok(())
    }

    /// Shape of one operand.
    pub fn operand(&self, which: Operand) -> &OperandShape {
        match which {
            Operand::Lhs => &self.lhs,
            Operand::Rhs => &self.rhs,
        }
    }

    /// Packed LHS bytes.
    pub fn lhs_bytes(&self) -> usize {
        self.lhs.bytes()
    }

    /// Packed RHS bytes.
    pub fn rhs_bytes(&self) -> usize {
        self.rhs.bytes()
    }

    /// Elements in the aligned result.
    pub fn result_elems(&self) -> usize {
        self.lhs.rows_aligned * self.rhs.rows_aligned
    }

    /// Bytes in the aligned result.
    pub fn result_bytes(&self) -> usize {
        self.result_elems() * RESULT_ELEM_BYTES
    }

    /// Multiply-accumulate work counted as two ops per product term.
    pub fn op_count(&self, include_padding: bool) -> f64 {
        if include_padding {
            2.0 * self.lhs.rows_aligned as f64 * self.rhs.rows_aligned as f64 * self.lhs.cols_aligned as f64
        } else {
            2.0 * self.lhs.rows as f64 * self.rhs.rows as f64 * self.lhs.cols as f64
        }
    }

    /// Ops scaled by the number of bit-plane pairs.
    pub fn binary_op_count(&self, include_padding: bool) -> f64 {
        self.op_count(include_padding) * self.lhs.bits as f64 * self.rhs.bits as f64
    }
}

/// Read-only view of a packed bit-serial operand produced elsewhere.
pub trait BitSerialOperand {
    /// Shape of the packed data.
    fn shape(&self) -> &OperandShape;

    /// Packed words in bit-plane-major, row-major order.
    fn packed_words(&self) -> &[PackedWord];
}

/// Owned packed operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedOperand {
    shape: OperandShape,
    words: Vec<PackedWord>,
}

impl PackedOperand {
    /// All-zero operand of the given shape.
    pub fn zeroed(shape: OperandShape) -> Self {
        Self { words: vec![0; shape.words()], shape }
    }

    /// Wrap already-packed words. Fails if the word count does not match the shape.
    pub fn from_words(shape: OperandShape, words: Vec<PackedWord>) -> Result<Self> {
        if words.len() != shape.words() {
            return Err(Error::unsupported(format!(
                "packed data has {} words, shape needs {}",
                words.len(),
                shape.words()
            )));
        }
        Ok(Self { shape, words })
    }
}

impl BitSerialOperand for PackedOperand {
    fn shape(&self) -> &OperandShape {
        &self.shape
    }

    fn packed_words(&self) -> &[PackedWord] {
        &self.words
    }
}

/// Round `value` up to a multiple of `align`.
#[inline]
pub fn align_up(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
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

    #[test]
    fn test_operand_bytes() {
        let s = OperandShape::new(4, 4, 64, 64, 1, false);
        assert_eq!(s.words_per_row(), 1);
        assert_eq!(s.words_per_bitplane(), 4);
        assert_eq!(s.bytes(), 32);

        let s = OperandShape::new(3, 4, 100, 128, 3, true);
        assert_eq!(s.row_bytes(), 16);
        assert_eq!(s.bitplane_bytes(), 64);
        assert_eq!(s.bytes(), 192);
    }

    #[test]
    fn test_result_bytes() {
        let shape = GemmShape::new(
            OperandShape::new(4, 4, 64, 64, 1, false),
            OperandShape::new(2, 2, 64, 64, 1, false),
        );
        assert_eq!(shape.result_elems(), 8);
        assert_eq!(shape.result_bytes(), 32);
        assert_eq!(shape.op_count(true), 2.0 * 4.0 * 2.0 * 64.0);
    }

    #[test]
    fn test_for_hardware_pads() {
        let cap = cap_2x64x2();
        let shape = GemmShape::for_hardware(&cap, 3, 100, 5, 2, 1, true, false);
        assert_eq!(shape.lhs.rows_aligned, 4);
        assert_eq!(shape.rhs.rows_aligned, 6);
        assert_eq!(shape.lhs.cols_aligned, 512);
        assert!(shape.validate(&cap).is_ok());
    }

    #[test]
    fn test_validate_rows_alignment() {
        let cap = cap_2x64x2();
        let shape = GemmShape::new(
            OperandShape::new(3, 3, 64, 64, 1, false),
            OperandShape::new(2, 2, 64, 64, 1, false),
        );
        let err = shape.validate(&cap).unwrap_err();
        assert!(matches!(err, Error::UnsupportedShape { .. }));
        assert!(err.to_string().contains("lhs.rows_aligned"));
    }

    #[test]
    fn test_validate_cols_alignment() {
        let cap = cap_2x64x2();
        let shape = GemmShape::new(
            OperandShape::new(4, 4, 96, 96, 1, false),
            OperandShape::new(2, 2, 96, 96, 1, false),
        );
        let err = shape.validate(&cap).unwrap_err();
        assert!(err.to_string().contains("dpa_dim_common"));
    }

    #[test]
    fn test_validate_common_dim_mismatch() {
        let cap = cap_2x64x2();
        let shape = GemmShape::new(
            OperandShape::new(4, 4, 64, 64, 1, false),
            OperandShape::new(2, 2, 128, 128, 1, false),
        );
        assert!(shape.validate(&cap).is_err());
    }

    #[test]
    fn test_packed_operand_word_count() {
        let shape = OperandShape::new(4, 4, 64, 64, 2, false);
        assert_eq!(PackedOperand::zeroed(shape).packed_words().len(), 8);
        assert!(PackedOperand::from_words(shape, vec![0; 7]).is_err());
        assert!(PackedOperand::from_words(shape, vec![0; 8]).is_ok());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(lcm(64, 512), 512);
        assert_eq!(lcm(192, 512), 1536);
    }
}
