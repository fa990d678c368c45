//! Hardware capability descriptor.
//!
//! The accelerator is generated from a parameterised template, so the host
//! discovers its geometry at attach time instead of assuming it. The
//! descriptor is read once and never changes for the lifetime of a
//! dispatcher.

use serde::{Deserialize, Serialize};

use super::FETCHEXEC_SLOTS;
use crate::error::{Error, Result};

/// Geometry and capacity of an instantiated accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareCapability {
    /// Accumulator width in bits.
    pub acc_width: u32,
    /// Depth of each stage command FIFO.
    pub cmd_queue_entries: u32,
    /// Dot product array size along the common dimension (bits).
    pub dpa_dim_common: u32,
    /// Dot product array rows fed by the LHS operand.
    pub dpa_dim_lhs: u32,
    /// Dot product array columns fed by the RHS operand.
    pub dpa_dim_rhs: u32,
    /// Entries in each LHS on-chip memory (one `dpa_dim_common`-bit word each).
    pub lhs_entries_per_mem: u32,
    /// Largest accumulation shift the Execute stage supports.
    pub max_shift_steps: u32,
    /// DRAM read channel width (bits per cycle).
    pub read_chan_width: u32,
    /// Entries in each RHS on-chip memory.
    pub rhs_entries_per_mem: u32,
    /// DRAM write channel width (bits per cycle).
    pub write_chan_width: u32,
}

impl Default for HardwareCapability {
    fn default() -> Self {
        Self::reference()
    }
}

impl HardwareCapability {
    /// An 8x256x8 instance with 1024-entry buffers and 64-bit channels.
    pub fn reference() -> Self {
        Self {
            acc_width: 32,
            cmd_queue_entries: 16,
            dpa_dim_common: 256,
            dpa_dim_lhs: 8,
            dpa_dim_rhs: 8,
            lhs_entries_per_mem: 1024,
            max_shift_steps: 16,
            read_chan_width: 64,
            rhs_entries_per_mem: 1024,
            write_chan_width: 64,
        }
    }

    /// Check internal consistency of the descriptor.
    ///
    /// A descriptor that fails here cannot be scheduled against at all.
    pub fn validate(&self) -> Result<()> {
        if self.dpa_dim_lhs == 0 || self.dpa_dim_rhs == 0 || self.dpa_dim_common == 0 {
            return Err(Error::mismatch(format!(
                "zero-sized dot product array {}x{}x{}",
                self.dpa_dim_lhs, self.dpa_dim_common, self.dpa_dim_rhs
            )));
        }
        if self.read_chan_width == 0 || self.write_chan_width == 0 {
            return Err(Error::mismatch("zero-width DRAM channel"));
        }
        if self.dpa_dim_common < self.read_chan_width
            || self.dpa_dim_common % self.read_chan_width != 0
        {
            return Err(Error::mismatch(format!(
                "dpa_dim_common {} is not a multiple of read_chan_width {}",
                self.dpa_dim_common, self.read_chan_width
            )));
        }
        if self.dpa_dim_common % 8 != 0 || self.read_chan_width % 8 != 0 || self.write_chan_width % 8 != 0 {
            return Err(Error::mismatch("array and channel widths must be whole bytes"));
        }
        if self.cmd_queue_entries == 0 {
            return Err(Error::mismatch("command queues have no entries"));
        }
        Ok(())
    }

    /// Bytes in one LHS L0 tile (one array-height stripe of the common dimension).
    #[inline]
    pub fn lhs_bytes_per_l0(&self) -> usize {
        self.dpa_dim_lhs as usize * self.dpa_dim_common as usize / 8
    }

    /// Bytes in one RHS L0 tile.
    #[inline]
    pub fn rhs_bytes_per_l0(&self) -> usize {
        self.dpa_dim_rhs as usize * self.dpa_dim_common as usize / 8
    }

    /// LHS L0 tiles that fit in one double-buffer slot.
    #[inline]
    pub fn lhs_l0_per_slot(&self) -> usize {
        self.lhs_entries_per_mem as usize / FETCHEXEC_SLOTS
    }

    /// RHS L0 tiles that fit in one double-buffer slot.
    #[inline]
    pub fn rhs_l0_per_slot(&self) -> usize {
        self.rhs_entries_per_mem as usize / FETCHEXEC_SLOTS
    }

    /// Total LHS on-chip buffer capacity in bytes.
    pub fn lhs_buffer_bytes(&self) -> usize {
        self.dpa_dim_lhs as usize * self.lhs_entries_per_mem as usize * self.dpa_dim_common as usize / 8
    }

    /// Total RHS on-chip buffer capacity in bytes.
    pub fn rhs_buffer_bytes(&self) -> usize {
        self.dpa_dim_rhs as usize * self.rhs_entries_per_mem as usize * self.dpa_dim_common as usize / 8
    }

    /// Total operand buffer capacity in bytes.
    pub fn buffer_bytes(&self) -> usize {
        self.lhs_buffer_bytes() + self.rhs_buffer_bytes()
    }

    /// Fetch-channel words per array-width word.
    #[inline]
    pub fn exec_to_fetch_width_ratio(&self) -> usize {
        (self.dpa_dim_common / self.read_chan_width) as usize
    }

    /// Peak binary operations per cycle (multiply and add counted separately).
    pub fn peak_binary_ops_per_cycle(&self) -> f64 {
        2.0 * self.dpa_dim_lhs as f64 * self.dpa_dim_rhs as f64 * self.dpa_dim_common as f64
    }

    /// Peak DRAM read bandwidth in bytes per cycle.
    pub fn read_bytes_per_cycle(&self) -> f64 {
        self.read_chan_width as f64 / 8.0
    }

    /// Peak DRAM write bandwidth in bytes per cycle.
    pub fn write_bytes_per_cycle(&self) -> f64 {
        self.write_chan_width as f64 / 8.0
    }
}

impl std::fmt::Display for HardwareCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "accWidth = {}", self.acc_width)?;
        writeln!(f, "cmdQueueEntries = {}", self.cmd_queue_entries)?;
        writeln!(f, "dpaDimCommon = {}", self.dpa_dim_common)?;
        writeln!(f, "dpaDimLHS = {}", self.dpa_dim_lhs)?;
        writeln!(f, "dpaDimRHS = {}", self.dpa_dim_rhs)?;
        writeln!(f, "lhsEntriesPerMem = {}", self.lhs_entries_per_mem)?;
        writeln!(f, "maxShiftSteps = {}", self.max_shift_steps)?;
        writeln!(f, "readChanWidth = {}", self.read_chan_width)?;
        writeln!(f, "rhsEntriesPerMem = {}", self.rhs_entries_per_mem)?;
        write!(f, "writeChanWidth = {}", self.write_chan_width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> HardwareCapability {
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
    fn test_reference_is_valid() {
        assert!(HardwareCapability::reference().validate().is_ok());
    }

    #[test]
    fn test_derived_sizes() {
        let cap = small();
        assert_eq!(cap.lhs_bytes_per_l0(), 16);
        assert_eq!(cap.rhs_bytes_per_l0(), 16);
        assert_eq!(cap.lhs_l0_per_slot(), 512);
        assert_eq!(cap.lhs_buffer_bytes(), 2 * 1024 * 8);
        assert_eq!(cap.exec_to_fetch_width_ratio(), 1);
        assert_eq!(cap.peak_binary_ops_per_cycle(), 512.0);
        assert_eq!(cap.read_bytes_per_cycle(), 8.0);
    }

    #[test]
    fn test_common_dim_must_be_multiple_of_read_width() {
        let cap = HardwareCapability { dpa_dim_common: 96, ..small() };
        assert!(matches!(cap.validate(), Err(Error::CapabilityMismatch { .. })));

        let cap = HardwareCapability { dpa_dim_common: 32, ..small() };
        assert!(matches!(cap.validate(), Err(Error::CapabilityMismatch { .. })));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let cap = HardwareCapability { dpa_dim_rhs: 0, ..small() };
        assert!(cap.validate().is_err());
    }

    #[test]
    fn test_capability_from_toml() {
        let cap: HardwareCapability = toml::from_str(
            r#"
            acc_width = 32
            cmd_queue_entries = 8
            dpa_dim_common = 128
            dpa_dim_lhs = 4
            dpa_dim_rhs = 4
            lhs_entries_per_mem = 512
            max_shift_steps = 8
            read_chan_width = 64
            rhs_entries_per_mem = 512
            write_chan_width = 32
            "#,
        )
        .unwrap();
        assert_eq!(cap.dpa_dim_common, 128);
        assert_eq!(cap.exec_to_fetch_width_ratio(), 2);
        assert!(cap.validate().is_ok());
    }
}
