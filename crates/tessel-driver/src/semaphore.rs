//! Global semaphores
//!
//! A semaphore word at one L1 address on every listed core of every device
//! in a mesh. Host writes go straight to L1 and are not ordered against
//! queued buffer writes.

use std::sync::Arc;

use tessel_chip::{CoreRangeSet, CoreType};
use tracing::debug;

use crate::buffer::MeshAllocators;
use crate::device::Device;
use crate::error::{Result, TesselError};
use crate::mesh::MeshDevice;

const SEMAPHORE_BYTES: u32 = 16;

/// Same-address semaphore across a mesh. Freed when dropped.
#[derive(Debug)]
pub struct GlobalSemaphore {
    address: u32,
    cores: CoreRangeSet,
    devices: Vec<Arc<Device>>,
    allocators: Arc<MeshAllocators>,
}

impl GlobalSemaphore {
    /// Allocate on `cores` of every device and set to `initial`.
    ///
    /// # Errors
    ///
    /// Returns `TooManyCores` for cores not on the chip, `OutOfMemory` if
    /// L1 is exhausted.
    pub fn create(mesh: &MeshDevice, cores: impl Into<CoreRangeSet>, initial: u32) -> Result<Self> {
        let cores = cores.into();
        let chip = mesh.chip();
        if let Some(bad) = cores.iter().find(|c| !chip.has_core(CoreType::Tensix, *c)) {
            return Err(TesselError::too_many_cores(format!(
                "global semaphore core {bad} not on chip"
            )));
        }
        let allocators = mesh.allocators();
        let address = allocators.l1.lock().allocate(SEMAPHORE_BYTES)?;
        let sem = Self {
            address,
            cores,
            devices: mesh.devices(),
            allocators,
        };
        sem.reset_value(initial)?;
        debug!(
            "Global semaphore at 0x{address:x} on {} core(s) x {} device(s)",
            sem.cores.num_cores(),
            sem.devices.len()
        );
        Ok(sem)
    }

    /// L1 address on every core.
    #[must_use]
    pub const fn address(&self) -> u32 {
        self.address
    }

    /// Cores holding the semaphore.
    #[must_use]
    pub const fn cores(&self) -> &CoreRangeSet {
        &self.cores
    }

    /// Set the value on every core of every device, bypassing the queues.
    ///
    /// # Errors
    ///
    /// Returns error if the L1 write fails.
    pub fn reset_value(&self, value: u32) -> Result<()> {
        for device in &self.devices {
            for core in self.cores.iter() {
                device.write_l1_u32(device.noc(CoreType::Tensix, core), self.address, value)?;
            }
        }
        Ok(())
    }
}

impl Drop for GlobalSemaphore {
    fn drop(&mut self) {
        self.allocators.l1.lock().free(self.address);
    }
}
