//! Simulated device memory and address allocation
//!
//! L1 and DRAM are modelled as sparse 4 KB pages: untouched memory reads
//! as zero and costs nothing, so a full 8-chip system fits in a test.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Result, TesselError};

const PAGE: u32 = 4096;

/// Sparse byte-addressable memory.
#[derive(Debug, Default)]
pub(crate) struct SparseMemory {
    pages: HashMap<u32, Box<[u8]>>,
}

impl SparseMemory {
    pub(crate) fn write(&mut self, address: u32, data: &[u8]) {
        let mut addr = address;
        let mut rest = data;
        while !rest.is_empty() {
            let page = addr / PAGE;
            let offset = (addr % PAGE) as usize;
            let n = rest.len().min(PAGE as usize - offset);
            let buf = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE as usize].into_boxed_slice());
            buf[offset..offset + n].copy_from_slice(&rest[..n]);
            rest = &rest[n..];
            addr = addr.wrapping_add(n as u32);
        }
    }

    pub(crate) fn read(&self, address: u32, out: &mut [u8]) {
        let mut addr = address;
        let mut done = 0;
        while done < out.len() {
            let page = addr / PAGE;
            let offset = (addr % PAGE) as usize;
            let n = (out.len() - done).min(PAGE as usize - offset);
            match self.pages.get(&page) {
                Some(buf) => out[done..done + n].copy_from_slice(&buf[offset..offset + n]),
                None => out[done..done + n].fill(0),
            }
            done += n;
            addr = addr.wrapping_add(n as u32);
        }
    }

    pub(crate) fn read_u32(&self, address: u32) -> u32 {
        let mut word = [0u8; 4];
        self.read(address, &mut word);
        u32::from_le_bytes(word)
    }

    pub(crate) fn write_u32(&mut self, address: u32, value: u32) {
        self.write(address, &value.to_le_bytes());
    }
}

/// First-fit allocator over `[base, limit)`.
///
/// Mesh buffers and global semaphores are allocated once for the whole mesh,
/// which is what gives them the same address on every device.
#[derive(Debug)]
pub(crate) struct FreeListAllocator {
    name: &'static str,
    base: u32,
    limit: u32,
    alignment: u32,
    allocated: BTreeMap<u32, u32>,
}

impl FreeListAllocator {
    pub(crate) fn new(name: &'static str, base: u32, limit: u32, alignment: u32) -> Self {
        Self {
            name,
            base,
            limit,
            alignment: alignment.max(1),
            allocated: BTreeMap::new(),
        }
    }

    pub(crate) fn allocate(&mut self, size: u32) -> Result<u32> {
        if size == 0 {
            return Err(TesselError::out_of_memory(format!(
                "{}: zero-sized allocation",
                self.name
            )));
        }
        let size = size.div_ceil(self.alignment) * self.alignment;
        let mut cursor = self.base;
        for (&start, &len) in &self.allocated {
            if start >= cursor && start - cursor >= size {
                break;
            }
            cursor = cursor.max(start + len);
        }
        let end = u64::from(cursor) + u64::from(size);
        if end > u64::from(self.limit) {
            return Err(TesselError::out_of_memory(format!(
                "{}: {size} bytes requested, {} free above 0x{cursor:x}",
                self.name,
                self.limit.saturating_sub(cursor)
            )));
        }
        self.allocated.insert(cursor, size);
        Ok(cursor)
    }

    pub(crate) fn free(&mut self, address: u32) {
        self.allocated.remove(&address);
    }

    /// Highest address in use, or `base` when empty.
    pub(crate) fn high_water(&self) -> u32 {
        self.allocated
            .iter()
            .map(|(&start, &len)| start + len)
            .max()
            .unwrap_or(self.base)
    }

    /// Move the upper bound, refusing if live allocations would fall outside.
    pub(crate) fn set_limit(&mut self, limit: u32) -> Result<()> {
        if self.high_water() > limit {
            return Err(TesselError::out_of_memory(format!(
                "{}: live allocations reach 0x{:x}, cannot shrink to 0x{limit:x}",
                self.name,
                self.high_water()
            )));
        }
        self.limit = limit;
        Ok(())
    }

    pub(crate) const fn capacity(&self) -> u32 {
        self.limit - self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_memory_spans_pages() {
        let mut mem = SparseMemory::default();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        mem.write(4000, &data);
        let mut out = vec![0u8; data.len()];
        mem.read(4000, &mut out);
        assert_eq!(out, data);

        let mut untouched = [1u8; 8];
        mem.read(1 << 20, &mut untouched);
        assert_eq!(untouched, [0u8; 8]);
    }

    #[test]
    fn allocator_reuses_freed_holes() {
        let mut a = FreeListAllocator::new("test", 0x100, 0x1000, 32);
        let x = a.allocate(64).unwrap();
        let y = a.allocate(64).unwrap();
        let z = a.allocate(64).unwrap();
        assert_eq!((x, y, z), (0x100, 0x140, 0x180));
        a.free(y);
        assert_eq!(a.allocate(40).unwrap(), 0x140);
        assert!(a.allocate(0x1000).is_err());
    }

    #[test]
    fn limit_cannot_cut_live_allocations() {
        let mut a = FreeListAllocator::new("test", 0, 0x1000, 16);
        a.allocate(0x800).unwrap();
        assert!(a.set_limit(0x400).is_err());
        assert!(a.set_limit(0x900).is_ok());
        assert_eq!(a.capacity(), 0x900);
    }
}
