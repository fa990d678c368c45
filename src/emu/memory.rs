//! Emulated device-visible DRAM.
//!
//! Storage is sparse: 4KB pages are created on first write, and
//! unwritten memory reads as zero. Buffers are carved out of a fixed
//! window by a bump allocator; each live buffer is tracked as a
//! [`MemoryRegion`] so stage traffic can be attributed to it.
//!
//! ```text
//!  DRAM_BASE                                   DRAM_BASE + capacity
//!  ├──────────┬──────────┬──────────┬─────────────────────┤
//!  │  lhs     │  rhs     │  result  │   (unallocated)     │
//!  └──────────┴──────────┴──────────┴─────────────────────┘
//!        ▲ fetch reads              ▲ result writes
//! ```

use std::collections::BTreeMap;

use crate::hw::{DeviceBuffer, DeviceMemoryError, FETCH_ADDR_ALIGN};
use crate::shape::align_up;

/// First device address handed out.
pub const DRAM_BASE: u64 = 0x1000_0000;

/// Default allocatable window (256MB).
pub const DEFAULT_DRAM_CAPACITY: usize = 256 << 20;

/// A live allocation and the stage traffic that touched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base_address: u64,
    pub size: usize,
    /// Stage reads from this region.
    pub dma_reads: u64,
    /// Stage writes to this region.
    pub dma_writes: u64,
}

impl MemoryRegion {
    fn new(base_address: u64, size: usize) -> Self {
        Self { base_address, size, dma_reads: 0, dma_writes: 0 }
    }

    /// Check if an address range overlaps this region.
    #[inline]
    pub fn overlaps(&self, addr: u64, len: usize) -> bool {
        let end = addr.saturating_add(len as u64);
        let region_end = self.base_address.saturating_add(self.size as u64);
        addr < region_end && end > self.base_address
    }
}

/// Sparse paged DRAM with a bump allocator.
pub struct DeviceDram {
    /// page_address -> page_data
    pages: BTreeMap<u64, Box<[u8; Self::PAGE_SIZE]>>,
    /// Live allocations keyed by base address.
    regions: BTreeMap<u64, MemoryRegion>,
    next: u64,
    capacity: usize,
    total_bytes_written: u64,
    total_bytes_read: u64,
}

impl DeviceDram {
    pub const PAGE_SIZE: usize = 4096;

    const PAGE_MASK: u64 = !(Self::PAGE_SIZE as u64 - 1);

    pub fn new(capacity: usize) -> Self {
        Self {
            pages: BTreeMap::new(),
            regions: BTreeMap::new(),
            next: DRAM_BASE,
            capacity,
            total_bytes_written: 0,
            total_bytes_read: 0,
        }
    }

    fn used(&self) -> usize {
        (self.next - DRAM_BASE) as usize
    }

    /// Allocate `bytes`, aligned for the Fetch stage.
    ///
    /// Freed space is not reused.
    pub fn allocate(&mut self, bytes: usize) -> Result<DeviceBuffer, DeviceMemoryError> {
        let size = align_up(bytes.max(1), FETCH_ADDR_ALIGN);
        let available = self.capacity.saturating_sub(self.used());
        if size > available {
            return Err(DeviceMemoryError::OutOfMemory { requested: bytes, available });
        }
        let addr = self.next;
        self.next += size as u64;
        self.regions.insert(addr, MemoryRegion::new(addr, bytes));
        log::debug!("dram: allocated {bytes} bytes at 0x{addr:x}");
        Ok(DeviceBuffer { addr, bytes })
    }

    /// Release a buffer. Unknown handles are ignored.
    pub fn free(&mut self, buffer: DeviceBuffer) {
        if self.regions.remove(&buffer.addr).is_none() {
            log::warn!("dram: free of unknown buffer 0x{:x}", buffer.addr);
        }
    }

    fn checked(&self, buffer: &DeviceBuffer, len: usize) -> Result<(), DeviceMemoryError> {
        let region = self
            .regions
            .get(&buffer.addr)
            .ok_or(DeviceMemoryError::UnknownBuffer(buffer.addr))?;
        if len > region.size {
            return Err(DeviceMemoryError::OutOfBounds { addr: buffer.addr, len, capacity: region.size });
        }
        Ok(())
    }

    /// Host-to-device copy into the start of a live buffer.
    pub fn copy_in(&mut self, src: &[u8], dst: &DeviceBuffer) -> Result<(), DeviceMemoryError> {
        self.checked(dst, src.len())?;
        self.write_bytes(dst.addr, src);
        Ok(())
    }

    /// Device-to-host copy from the start of a live buffer.
    pub fn copy_out(&mut self, src: &DeviceBuffer, dst: &mut [u8]) -> Result<(), DeviceMemoryError> {
        self.checked(src, dst.len())?;
        self.read_bytes(src.addr, dst);
        Ok(())
    }

    /// Live allocations.
    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.values()
    }

    /// Region containing an address range, if any.
    pub fn region_at(&self, addr: u64, len: usize) -> Option<&MemoryRegion> {
        self.regions.values().find(|r| r.overlaps(addr, len))
    }

    fn get_or_create_page(&mut self, addr: u64) -> &mut [u8; Self::PAGE_SIZE] {
        let page_addr = addr & Self::PAGE_MASK;
        self.pages
            .entry(page_addr)
            .or_insert_with(|| Box::new([0u8; Self::PAGE_SIZE]))
    }

    fn get_page(&self, addr: u64) -> Option<&[u8; Self::PAGE_SIZE]> {
        self.pages.get(&(addr & Self::PAGE_MASK)).map(|b| b.as_ref())
    }

    /// Write a byte slice, creating pages as needed.
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        let mut current_addr = addr;
        let mut remaining = data;

        while !remaining.is_empty() {
            let page = self.get_or_create_page(current_addr);
            let offset = (current_addr & (Self::PAGE_SIZE as u64 - 1)) as usize;
            let to_write = remaining.len().min(Self::PAGE_SIZE - offset);

            page[offset..offset + to_write].copy_from_slice(&remaining[..to_write]);

            current_addr += to_write as u64;
            remaining = &remaining[to_write..];
        }

        self.total_bytes_written += data.len() as u64;
    }

    /// Read bytes into `buf`. Unwritten memory reads as zero.
    pub fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) {
        let mut current_addr = addr;
        let mut offset_in_buf = 0;

        while offset_in_buf < buf.len() {
            let page_offset = (current_addr & (Self::PAGE_SIZE as u64 - 1)) as usize;
            let to_read = (buf.len() - offset_in_buf).min(Self::PAGE_SIZE - page_offset);
            let dst = &mut buf[offset_in_buf..offset_in_buf + to_read];

            match self.get_page(current_addr) {
                Some(page) => dst.copy_from_slice(&page[page_offset..page_offset + to_read]),
                None => dst.fill(0),
            }

            current_addr += to_read as u64;
            offset_in_buf += to_read;
        }

        self.total_bytes_read += buf.len() as u64;
    }

    /// Record a stage read (called by the Fetch model).
    pub fn record_dma_read(&mut self, addr: u64, len: usize) {
        match self.regions.values_mut().find(|r| r.overlaps(addr, len)) {
            Some(region) => region.dma_reads += 1,
            None => log::warn!("dram: fetch from unmapped range 0x{addr:x}+{len}"),
        }
    }

    /// Record a stage write (called by the Result model).
    pub fn record_dma_write(&mut self, addr: u64, len: usize) {
        match self.regions.values_mut().find(|r| r.overlaps(addr, len)) {
            Some(region) => region.dma_writes += 1,
            None => log::warn!("dram: result write to unmapped range 0x{addr:x}+{len}"),
        }
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.total_bytes_read
    }

    pub fn allocated_pages(&self) -> usize {
        self.pages.len()
    }
}

impl Default for DeviceDram {
    fn default() -> Self {
        Self::new(DEFAULT_DRAM_CAPACITY)
    }
}

impl std::fmt::Debug for DeviceDram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDram")
            .field("allocated_pages", &self.pages.len())
            .field("live_buffers", &self.regions.len())
            .field("used", &self.used())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_are_aligned() {
        let mut mem = DeviceDram::default();
        let a = mem.allocate(10).unwrap();
        let b = mem.allocate(100).unwrap();
        assert_eq!(a.addr, DRAM_BASE);
        assert_eq!(b.addr % FETCH_ADDR_ALIGN as u64, 0);
        assert!(b.addr >= a.addr + 10);
        assert_eq!(mem.regions().count(), 2);
    }

    #[test]
    fn test_out_of_memory() {
        let mut mem = DeviceDram::new(128);
        mem.allocate(64).unwrap();
        let err = mem.allocate(100).unwrap_err();
        assert_eq!(err, DeviceMemoryError::OutOfMemory { requested: 100, available: 64 });
    }

    #[test]
    fn test_copy_bounds() {
        let mut mem = DeviceDram::default();
        let buf = mem.allocate(8).unwrap();
        mem.copy_in(&[1, 2, 3, 4, 5, 6, 7, 8], &buf).unwrap();
        assert!(matches!(mem.copy_in(&[0; 9], &buf), Err(DeviceMemoryError::OutOfBounds { .. })));

        let mut out = [0u8; 4];
        mem.copy_out(&buf, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        mem.free(buf);
        assert_eq!(mem.copy_out(&buf, &mut out), Err(DeviceMemoryError::UnknownBuffer(buf.addr)));
    }

    #[test]
    fn test_unwritten_reads_zero() {
        let mut mem = DeviceDram::default();
        let mut buf = [0xffu8; 4];
        mem.read_bytes(0x9999_0000, &mut buf);
        assert_eq!(buf, [0; 4]);
        assert_eq!(mem.allocated_pages(), 0);
    }

    #[test]
    fn test_cross_page_write() {
        let mut mem = DeviceDram::default();
        let addr = 4094;
        let data = [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE];
        mem.write_bytes(addr, &data);

        let mut buf = [0u8; 6];
        mem.read_bytes(addr, &mut buf);
        assert_eq!(buf, data);
        assert_eq!(mem.allocated_pages(), 2);
    }

    #[test]
    fn test_dma_attribution() {
        let mut mem = DeviceDram::default();
        let a = mem.allocate(64).unwrap();
        let b = mem.allocate(64).unwrap();
        mem.record_dma_read(a.addr + 8, 8);
        mem.record_dma_write(b.addr, 64);
        assert_eq!(mem.region_at(a.addr, 1).unwrap().dma_reads, 1);
        assert_eq!(mem.region_at(b.addr, 1).unwrap().dma_writes, 1);
        assert_eq!(mem.region_at(b.addr, 1).unwrap().dma_reads, 0);
    }
}
