//! Chip geometry and memory map.
//!
//! ```text
//! L1 (per core, 1464 KB)
//! ──────────────────────────────────────────────────────────────
//!  0x0000_0000  firmware / mailbox            (reserved)
//!  0x0001_0000  program semaphores            16 × 16 B
//!  0x0001_1000  EDM termination word          ethernet cores only
//!  0x0001_1010  EDM handshake word            ethernet cores only
//!  0x0002_0000  unreserved, allocator owned   up to L1 size
//!
//! DRAM (per bank, 12 banks)
//! ──────────────────────────────────────────────────────────────
//!  0x0000_0000  interleaved buffers           allocator owned
//!  size - trace region                        device resident traces
//! ```
//!
//! NOC coordinates: worker `(x, y)` sits at `(x + 1, y + 2)`, ethernet core
//! `i` at `(i + 1, 0)`. Row 1 of the NOC grid holds DRAM controllers and is
//! never addressed as L1.

use crate::coord::{CoreCoord, CoreRange, CoreRangeSet, CoreType};

/// Geometry and memory layout of one chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipSpec {
    /// Worker grid columns.
    pub grid_x: u32,
    /// Worker grid rows.
    pub grid_y: u32,
    /// Ethernet cores per chip.
    pub num_ethernet_cores: u32,
    /// L1 bytes per core.
    pub l1_size: u32,
    /// First L1 address handed to the allocator.
    pub l1_unreserved_base: u32,
    /// Number of DRAM banks.
    pub num_dram_banks: u32,
    /// Bytes per DRAM bank.
    pub dram_bank_size: u32,
}

/// Base of the program-local semaphore block in L1.
pub const SEMAPHORE_BASE: u32 = 0x0001_0000;
/// Stride between program-local semaphores.
pub const SEMAPHORE_STRIDE: u32 = 16;
/// Maximum program-local semaphores per program.
pub const MAX_PROGRAM_SEMAPHORES: u32 = 16;
/// L1 word polled by an EDM for its termination signal.
pub const EDM_TERMINATION_ADDRESS: u32 = 0x0001_1000;
/// L1 word an EDM sets once its link handshake completes.
pub const EDM_HANDSHAKE_ADDRESS: u32 = 0x0001_1010;

impl ChipSpec {
    /// Wormhole-class chip: 8×8 workers, 16 ethernet cores, 12 DRAM banks.
    pub const WORMHOLE: Self = Self {
        grid_x: 8,
        grid_y: 8,
        num_ethernet_cores: 16,
        l1_size: 1464 * 1024,
        l1_unreserved_base: 0x0002_0000,
        num_dram_banks: 12,
        dram_bank_size: 1 << 30,
    };

    /// Number of worker cores.
    #[must_use]
    pub const fn num_workers(&self) -> u32 {
        self.grid_x * self.grid_y
    }

    /// Full worker grid as a range.
    #[must_use]
    pub fn worker_grid(&self) -> CoreRange {
        CoreRange::new(
            CoreCoord::new(0, 0),
            CoreCoord::new(self.grid_x - 1, self.grid_y - 1),
        )
    }

    /// All ethernet cores, logical `(i, 0)`.
    #[must_use]
    pub fn ethernet_cores(&self) -> CoreRangeSet {
        CoreRange::new(
            CoreCoord::new(0, 0),
            CoreCoord::new(self.num_ethernet_cores - 1, 0),
        )
        .into()
    }

    /// Whether a logical core of the given type exists on this chip.
    #[must_use]
    pub const fn has_core(&self, core_type: CoreType, core: CoreCoord) -> bool {
        match core_type {
            CoreType::Tensix => core.x < self.grid_x && core.y < self.grid_y,
            CoreType::Ethernet => core.x < self.num_ethernet_cores && core.y == 0,
        }
    }

    /// Logical worker core for a flat row-major index.
    #[must_use]
    pub const fn worker_from_index(&self, index: u32) -> CoreCoord {
        let i = index % self.num_workers();
        CoreCoord::new(i % self.grid_x, i / self.grid_x)
    }

    /// Translate a logical core to its NOC coordinate.
    #[must_use]
    pub const fn noc_coord(&self, core_type: CoreType, logical: CoreCoord) -> CoreCoord {
        match core_type {
            CoreType::Tensix => CoreCoord::new(logical.x + 1, logical.y + 2),
            CoreType::Ethernet => CoreCoord::new(logical.x + 1, 0),
        }
    }

    /// Translate a NOC coordinate back to its logical core.
    #[must_use]
    pub fn logical_from_noc(&self, noc: CoreCoord) -> Option<(CoreType, CoreCoord)> {
        if noc.x == 0 {
            return None;
        }
        let (core_type, logical) = match noc.y {
            0 => (CoreType::Ethernet, CoreCoord::new(noc.x - 1, 0)),
            1 => return None,
            y => (CoreType::Tensix, CoreCoord::new(noc.x - 1, y - 2)),
        };
        self.has_core(core_type, logical).then_some((core_type, logical))
    }

    /// L1 address of program semaphore `index`.
    #[must_use]
    pub const fn semaphore_address(index: u32) -> u32 {
        SEMAPHORE_BASE + index * SEMAPHORE_STRIDE
    }
}

impl Default for ChipSpec {
    fn default() -> Self {
        Self::WORMHOLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wormhole_geometry() {
        let chip = ChipSpec::WORMHOLE;
        assert_eq!(chip.num_workers(), 64);
        assert_eq!(chip.worker_grid().num_cores(), 64);
        assert_eq!(chip.ethernet_cores().num_cores(), 16);
    }

    #[test]
    fn noc_translation_round_trips() {
        let chip = ChipSpec::WORMHOLE;
        for core in chip.worker_grid().iter() {
            let noc = chip.noc_coord(CoreType::Tensix, core);
            assert_eq!(chip.logical_from_noc(noc), Some((CoreType::Tensix, core)));
        }
        for core in chip.ethernet_cores().iter() {
            let noc = chip.noc_coord(CoreType::Ethernet, core);
            assert_eq!(chip.logical_from_noc(noc), Some((CoreType::Ethernet, core)));
        }
        assert_eq!(chip.logical_from_noc(CoreCoord::new(3, 1)), None);
        assert_eq!(chip.logical_from_noc(CoreCoord::new(9, 2)), None);
    }

    #[test]
    fn semaphores_fit_below_edm_words() {
        let top = ChipSpec::semaphore_address(MAX_PROGRAM_SEMAPHORES);
        assert!(top <= EDM_TERMINATION_ADDRESS);
        assert!(EDM_HANDSHAKE_ADDRESS < ChipSpec::WORMHOLE.l1_unreserved_base);
    }
}
