//! Mesh buffers
//!
//! A [`MeshBuffer`] is allocated once for the whole mesh, so it lives at the
//! same address on every device. Pages are interleaved round-robin: DRAM
//! buffers across banks, L1 buffers across worker cores.
//!
//! ```text
//! page p  →  bank/core  p % n
//!            offset     address + (p / n) * page_size
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tessel_chip::{ChipSpec, CoreCoord, CoreType};
use tracing::debug;

use crate::device::Device;
use crate::error::{Result, TesselError};
use crate::memory::FreeListAllocator;
use crate::mesh::MeshDevice;

const DRAM_ALIGNMENT: u32 = 32;
const L1_ALIGNMENT: u32 = 16;

/// Memory a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    /// Off-chip DRAM, interleaved across banks
    Dram,
    /// Core-local L1, interleaved across worker cores
    L1,
}

impl BufferType {
    const fn code(self) -> u32 {
        match self {
            Self::Dram => 0,
            Self::L1 => 1,
        }
    }
}

/// Per-device layout of a mesh buffer.
#[derive(Debug, Clone, Copy)]
pub struct DeviceLocalBufferConfig {
    /// Interleaving granule in bytes
    pub page_size: u32,
    /// Memory type
    pub buffer_type: BufferType,
}

/// How a mesh buffer's contents spread over the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalBufferConfig {
    /// Every device holds the same `size` bytes.
    Replicated {
        /// Bytes per device
        size: u32,
    },
    /// `global_size` bytes split evenly, row-major, across the devices.
    Sharded {
        /// Bytes across the whole mesh
        global_size: u32,
    },
}

/// Device-side view of a buffer, passable to kernels as three runtime args.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterleavedBuffer {
    /// Base address in every bank/core
    pub address: u32,
    /// Page size in bytes
    pub page_size: u32,
    /// Memory type
    pub buffer_type: BufferType,
}

impl InterleavedBuffer {
    /// Encode as runtime args.
    #[must_use]
    pub const fn to_args(&self) -> [u32; 3] {
        [self.address, self.page_size, self.buffer_type.code()]
    }

    /// Decode from runtime args.
    ///
    /// # Errors
    ///
    /// Returns `KernelArgument` if fewer than three args or an unknown type.
    pub fn from_args(args: &[u32]) -> Result<Self> {
        let &[address, page_size, kind, ..] = args else {
            return Err(TesselError::kernel_argument(format!(
                "buffer needs 3 args, got {}",
                args.len()
            )));
        };
        let buffer_type = match kind {
            0 => BufferType::Dram,
            1 => BufferType::L1,
            other => {
                return Err(TesselError::kernel_argument(format!("unknown buffer type {other}")))
            }
        };
        Ok(Self {
            address,
            page_size,
            buffer_type,
        })
    }

    pub(crate) const fn locate(&self, chip: &ChipSpec, page: u32) -> MemTarget {
        match self.buffer_type {
            BufferType::Dram => MemTarget::Dram {
                bank: page % chip.num_dram_banks,
                address: self.address + (page / chip.num_dram_banks) * self.page_size,
            },
            BufferType::L1 => MemTarget::L1 {
                noc: chip.noc_coord(CoreType::Tensix, chip.worker_from_index(page)),
                address: self.address + (page / chip.num_workers()) * self.page_size,
            },
        }
    }
}

/// A physical location on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemTarget {
    Dram { bank: u32, address: u32 },
    L1 { noc: CoreCoord, address: u32 },
}

impl MemTarget {
    pub(crate) fn read(&self, device: &Device, len: usize) -> Result<Vec<u8>> {
        match *self {
            Self::Dram { bank, address } => device.read_dram(bank, address, len),
            Self::L1 { noc, address } => device.read_l1(noc, address, len),
        }
    }

    pub(crate) fn write(&self, device: &Device, data: &[u8]) -> Result<()> {
        match *self {
            Self::Dram { bank, address } => device.write_dram(bank, address, data),
            Self::L1 { noc, address } => device.write_l1(noc, address, data),
        }
    }
}

/// Address-space allocators shared by every device of a mesh.
#[derive(Debug)]
pub(crate) struct MeshAllocators {
    pub(crate) dram: Mutex<FreeListAllocator>,
    pub(crate) l1: Mutex<FreeListAllocator>,
}

impl MeshAllocators {
    pub(crate) fn new(chip: &ChipSpec, dram_limit: u32, l1_limit: u32) -> Self {
        Self {
            dram: Mutex::new(FreeListAllocator::new("dram", 0, dram_limit, DRAM_ALIGNMENT)),
            l1: Mutex::new(FreeListAllocator::new(
                "l1",
                chip.l1_unreserved_base,
                l1_limit,
                L1_ALIGNMENT,
            )),
        }
    }

    fn allocator(&self, kind: BufferType) -> &Mutex<FreeListAllocator> {
        match kind {
            BufferType::Dram => &self.dram,
            BufferType::L1 => &self.l1,
        }
    }
}

/// Buffer allocated at the same address on every device of a mesh.
///
/// Freed when dropped.
#[derive(Debug)]
pub struct MeshBuffer {
    view: InterleavedBuffer,
    global: GlobalBufferConfig,
    device_size: u32,
    num_pages: u32,
    allocators: Arc<MeshAllocators>,
}

impl MeshBuffer {
    /// Allocate a buffer on every device of `mesh`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for a zero page size or a sharded size that
    /// does not split evenly, `OutOfMemory` if the allocator is full.
    pub fn create(
        mesh: &MeshDevice,
        local: DeviceLocalBufferConfig,
        global: GlobalBufferConfig,
    ) -> Result<Self> {
        if local.page_size == 0 {
            return Err(TesselError::invalid_state("buffer page size must be non-zero"));
        }
        let num_devices = mesh.num_devices() as u32;
        let device_size = match global {
            GlobalBufferConfig::Replicated { size } => size,
            GlobalBufferConfig::Sharded { global_size } => {
                if global_size % num_devices != 0 {
                    return Err(TesselError::invalid_state(format!(
                        "sharded buffer of {global_size} bytes does not split over {num_devices} devices"
                    )));
                }
                global_size / num_devices
            }
        };
        let chip = mesh.chip();
        let num_pages = device_size.div_ceil(local.page_size);
        let lanes = match local.buffer_type {
            BufferType::Dram => chip.num_dram_banks,
            BufferType::L1 => chip.num_workers(),
        };
        let per_lane = num_pages.div_ceil(lanes).max(1) * local.page_size;

        let allocators = mesh.allocators();
        let address = allocators.allocator(local.buffer_type).lock().allocate(per_lane)?;
        debug!(
            "Allocated {:?} buffer at 0x{address:x}: {device_size} bytes/device, {num_pages} page(s)",
            local.buffer_type
        );

        Ok(Self {
            view: InterleavedBuffer {
                address,
                page_size: local.page_size,
                buffer_type: local.buffer_type,
            },
            global,
            device_size,
            num_pages,
            allocators,
        })
    }

    /// Base address on every device.
    #[must_use]
    pub const fn address(&self) -> u32 {
        self.view.address
    }

    /// Bytes held by each device.
    #[must_use]
    pub const fn device_size(&self) -> u32 {
        self.device_size
    }

    /// Pages per device.
    #[must_use]
    pub const fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// Replicated or sharded.
    #[must_use]
    pub const fn global_config(&self) -> GlobalBufferConfig {
        self.global
    }

    /// View passed to kernels.
    #[must_use]
    pub const fn interleaved(&self) -> InterleavedBuffer {
        self.view
    }

    /// Split one device's bytes into page writes.
    pub(crate) fn page_writes(&self, chip: &ChipSpec, data: &[u8]) -> Vec<(MemTarget, Vec<u8>)> {
        data.chunks(self.view.page_size as usize)
            .enumerate()
            .map(|(page, chunk)| (self.view.locate(chip, page as u32), chunk.to_vec()))
            .collect()
    }

    /// Read one device's bytes.
    pub(crate) fn read_device(&self, device: &Device) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.device_size as usize);
        for page in 0..self.num_pages {
            let target = self.view.locate(device.chip(), page);
            out.extend(target.read(device, self.view.page_size as usize)?);
        }
        out.truncate(self.device_size as usize);
        Ok(out)
    }

    /// Bytes destined for device `index` (row-major) out of a full write.
    pub(crate) fn portion<'d>(&self, data: &'d [u8], index: usize) -> &'d [u8] {
        match self.global {
            GlobalBufferConfig::Replicated { .. } => data,
            GlobalBufferConfig::Sharded { .. } => {
                let size = self.device_size as usize;
                &data[index * size..(index + 1) * size]
            }
        }
    }

    /// Bytes a full-buffer write must supply.
    pub(crate) const fn host_size(&self) -> u32 {
        match self.global {
            GlobalBufferConfig::Replicated { size } => size,
            GlobalBufferConfig::Sharded { global_size } => global_size,
        }
    }
}

impl Drop for MeshBuffer {
    fn drop(&mut self) {
        self.allocators
            .allocator(self.view.buffer_type)
            .lock()
            .free(self.view.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dram_pages_round_robin_banks() {
        let chip = ChipSpec::WORMHOLE;
        let buf = InterleavedBuffer {
            address: 0x1000,
            page_size: 2048,
            buffer_type: BufferType::Dram,
        };
        assert_eq!(buf.locate(&chip, 0), MemTarget::Dram { bank: 0, address: 0x1000 });
        assert_eq!(buf.locate(&chip, 11), MemTarget::Dram { bank: 11, address: 0x1000 });
        assert_eq!(
            buf.locate(&chip, 12),
            MemTarget::Dram { bank: 0, address: 0x1000 + 2048 }
        );
    }

    #[test]
    fn l1_pages_round_robin_workers() {
        let chip = ChipSpec::WORMHOLE;
        let buf = InterleavedBuffer {
            address: 0x2_0000,
            page_size: 64,
            buffer_type: BufferType::L1,
        };
        let first = chip.noc_coord(CoreType::Tensix, CoreCoord::new(0, 0));
        let ninth = chip.noc_coord(CoreType::Tensix, CoreCoord::new(0, 1));
        assert_eq!(buf.locate(&chip, 0), MemTarget::L1 { noc: first, address: 0x2_0000 });
        assert_eq!(buf.locate(&chip, 8), MemTarget::L1 { noc: ninth, address: 0x2_0000 });
        assert_eq!(buf.locate(&chip, 64), MemTarget::L1 { noc: first, address: 0x2_0040 });
    }

    #[test]
    fn args_round_trip() {
        let buf = InterleavedBuffer {
            address: 0x40,
            page_size: 4096,
            buffer_type: BufferType::L1,
        };
        assert_eq!(InterleavedBuffer::from_args(&buf.to_args()).unwrap(), buf);
        assert!(InterleavedBuffer::from_args(&[1, 2]).is_err());
        assert!(InterleavedBuffer::from_args(&[1, 2, 9]).is_err());
    }
}
