//! Sub-device partitions
//!
//! A sub-device is a fixed set of worker and ethernet cores, identical on
//! every device of the mesh. A manager groups disjoint sub-devices with an
//! L1 reservation; exactly one manager is active per mesh. Each sub-device
//! gets its own execution lane, so work on one does not wait behind another
//! and host waits can be scoped to a stall group.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tessel_chip::{ChipSpec, CoreRangeSet, CoreType};

use crate::error::{Result, TesselError};
use crate::program::Program;

/// Upper bound on sub-devices per manager.
pub const MAX_SUB_DEVICES: usize = 16;

/// Index of a sub-device within its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubDeviceId(pub u8);

impl SubDeviceId {
    pub(crate) const fn lane(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SubDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a created manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubDeviceManagerId(pub u32);

/// Cores owned by one partition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubDevice {
    tensix: CoreRangeSet,
    ethernet: CoreRangeSet,
}

impl SubDevice {
    /// Partition of the given worker and ethernet cores.
    pub fn new(tensix: impl Into<CoreRangeSet>, ethernet: impl Into<CoreRangeSet>) -> Self {
        Self {
            tensix: tensix.into(),
            ethernet: ethernet.into(),
        }
    }

    /// Worker-only partition.
    pub fn tensix(cores: impl Into<CoreRangeSet>) -> Self {
        Self::new(cores, CoreRangeSet::empty())
    }

    /// Ethernet-only partition.
    pub fn ethernet(cores: impl Into<CoreRangeSet>) -> Self {
        Self::new(CoreRangeSet::empty(), cores)
    }

    /// Cores of one type.
    #[must_use]
    pub const fn cores(&self, core_type: CoreType) -> &CoreRangeSet {
        match core_type {
            CoreType::Tensix => &self.tensix,
            CoreType::Ethernet => &self.ethernet,
        }
    }

    fn is_empty(&self) -> bool {
        self.tensix.is_empty() && self.ethernet.is_empty()
    }
}

/// A set of disjoint sub-devices plus an L1 reservation.
#[derive(Debug, Clone)]
pub struct SubDeviceManager {
    id: SubDeviceManagerId,
    sub_devices: Vec<SubDevice>,
    local_l1_size: u32,
}

impl SubDeviceManager {
    /// Validate and build a manager.
    ///
    /// # Errors
    ///
    /// - `InvalidSubDevice` for an empty list, an empty partition or too many
    /// - `TooManyCores` for a core the chip does not have
    /// - `Overlap` when two partitions share a core
    /// - `OutOfMemory` when the reservation exceeds `l1_available`
    pub(crate) fn new(
        id: SubDeviceManagerId,
        sub_devices: Vec<SubDevice>,
        local_l1_size: u32,
        chip: &ChipSpec,
        l1_available: u32,
    ) -> Result<Self> {
        if sub_devices.is_empty() || sub_devices.len() > MAX_SUB_DEVICES {
            return Err(TesselError::invalid_sub_device(format!(
                "manager needs 1..={MAX_SUB_DEVICES} sub-devices, got {}",
                sub_devices.len()
            )));
        }
        for (i, sd) in sub_devices.iter().enumerate() {
            if sd.is_empty() {
                return Err(TesselError::invalid_sub_device(format!("sub-device {i} has no cores")));
            }
            for core_type in [CoreType::Tensix, CoreType::Ethernet] {
                if let Some(bad) = sd.cores(core_type).iter().find(|c| !chip.has_core(core_type, *c)) {
                    return Err(TesselError::too_many_cores(format!(
                        "sub-device {i} names {core_type:?} core {bad}, not present on every device"
                    )));
                }
            }
        }
        for (i, a) in sub_devices.iter().enumerate() {
            for (j, b) in sub_devices.iter().enumerate().skip(i + 1) {
                if a.tensix.intersects(&b.tensix) || a.ethernet.intersects(&b.ethernet) {
                    return Err(TesselError::overlap(format!(
                        "sub-devices {i} and {j} share cores"
                    )));
                }
            }
        }
        if local_l1_size > l1_available {
            return Err(TesselError::out_of_memory(format!(
                "local L1 reservation of {local_l1_size} bytes exceeds {l1_available} available"
            )));
        }
        Ok(Self {
            id,
            sub_devices,
            local_l1_size,
        })
    }

    /// One sub-device holding every core.
    pub(crate) fn default_for(chip: &ChipSpec) -> Self {
        Self {
            id: SubDeviceManagerId(0),
            sub_devices: vec![SubDevice::new(chip.worker_grid(), chip.ethernet_cores())],
            local_l1_size: 0,
        }
    }

    /// Manager id.
    #[must_use]
    pub const fn id(&self) -> SubDeviceManagerId {
        self.id
    }

    /// Number of sub-devices.
    #[must_use]
    pub fn num_sub_devices(&self) -> usize {
        self.sub_devices.len()
    }

    /// Ids of every sub-device.
    #[must_use]
    pub fn sub_device_ids(&self) -> Vec<SubDeviceId> {
        (0..self.sub_devices.len()).map(|i| SubDeviceId(i as u8)).collect()
    }

    /// Look up a sub-device.
    #[must_use]
    pub fn sub_device(&self, id: SubDeviceId) -> Option<&SubDevice> {
        self.sub_devices.get(id.lane())
    }

    /// Bytes of L1 reserved per core.
    #[must_use]
    pub const fn local_l1_size(&self) -> u32 {
        self.local_l1_size
    }

    /// Whether both managers partition the cores identically.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.sub_devices.len() == other.sub_devices.len()
            && self.sub_devices.iter().zip(&other.sub_devices).all(|(a, b)| {
                a.tensix.cores() == b.tensix.cores() && a.ethernet.cores() == b.ethernet.cores()
            })
    }

    /// Sub-device whose cores hold every core of `program`.
    pub(crate) fn sub_device_for(&self, program: &Program) -> Result<SubDeviceId> {
        let tensix = program.cores(CoreType::Tensix);
        let ethernet = program.cores(CoreType::Ethernet);
        self.sub_devices
            .iter()
            .position(|sd| sd.tensix.contains_set(&tensix) && sd.ethernet.contains_set(&ethernet))
            .map(|i| SubDeviceId(i as u8))
            .ok_or_else(|| {
                TesselError::invalid_sub_device(format!(
                    "program {} spans cores of more than one sub-device",
                    program.name()
                ))
            })
    }

    /// Check every id in a stall group exists.
    pub(crate) fn validate_group(&self, ids: &[SubDeviceId]) -> Result<()> {
        match ids.iter().find(|id| id.lane() >= self.sub_devices.len()) {
            Some(bad) => Err(TesselError::invalid_sub_device(format!(
                "sub-device {bad} not in manager ({} sub-devices)",
                self.sub_devices.len()
            ))),
            None => Ok(()),
        }
    }
}

/// Created managers and the active one.
#[derive(Debug)]
pub(crate) struct SubDeviceRegistry {
    managers: HashMap<SubDeviceManagerId, Arc<SubDeviceManager>>,
    default: Arc<SubDeviceManager>,
    active: Arc<SubDeviceManager>,
    next_id: u32,
}

impl SubDeviceRegistry {
    pub(crate) fn new(chip: &ChipSpec) -> Self {
        let default = Arc::new(SubDeviceManager::default_for(chip));
        Self {
            managers: HashMap::new(),
            active: Arc::clone(&default),
            default,
            next_id: 1,
        }
    }

    pub(crate) fn create(
        &mut self,
        sub_devices: Vec<SubDevice>,
        local_l1_size: u32,
        chip: &ChipSpec,
        l1_available: u32,
    ) -> Result<SubDeviceManagerId> {
        let id = SubDeviceManagerId(self.next_id);
        let manager = SubDeviceManager::new(id, sub_devices, local_l1_size, chip, l1_available)?;
        self.next_id += 1;
        self.managers.insert(id, Arc::new(manager));
        Ok(id)
    }

    pub(crate) fn get(&self, id: SubDeviceManagerId) -> Result<Arc<SubDeviceManager>> {
        if id == self.default.id() {
            return Ok(Arc::clone(&self.default));
        }
        self.managers.get(&id).cloned().ok_or_else(|| {
            TesselError::invalid_sub_device(format!("sub-device manager {} does not exist", id.0))
        })
    }

    pub(crate) fn remove(&mut self, id: SubDeviceManagerId) -> Result<()> {
        if id == self.active.id() {
            return Err(TesselError::invalid_state(format!(
                "sub-device manager {} is active",
                id.0
            )));
        }
        self.managers.remove(&id).map(|_| ()).ok_or_else(|| {
            TesselError::invalid_sub_device(format!("sub-device manager {} does not exist", id.0))
        })
    }

    pub(crate) fn active(&self) -> Arc<SubDeviceManager> {
        Arc::clone(&self.active)
    }

    pub(crate) fn default_manager(&self) -> Arc<SubDeviceManager> {
        Arc::clone(&self.default)
    }

    pub(crate) fn set_active(&mut self, manager: Arc<SubDeviceManager>) {
        self.active = manager;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Kernel, KernelConfig, KernelContext};
    use tessel_chip::{CoreCoord, CoreRange};

    const L1: u32 = 1 << 20;

    fn rect(x0: u32, y0: u32, x1: u32, y1: u32) -> CoreRange {
        CoreRange::new(CoreCoord::new(x0, y0), CoreCoord::new(x1, y1))
    }

    #[derive(Debug)]
    struct Noop;

    impl Kernel for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn run(&self, _ctx: &mut KernelContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn compatibility_compares_cores_only() {
        let chip = ChipSpec::WORMHOLE;
        let build = |id: u32, cores: CoreRange, local: u32| {
            SubDeviceManager::new(SubDeviceManagerId(id), vec![SubDevice::tensix(cores)], local, &chip, L1).unwrap()
        };
        let a = build(1, rect(0, 0, 1, 1), 0);
        assert!(a.is_compatible_with(&build(2, rect(0, 0, 1, 1), 64)));
        assert!(!a.is_compatible_with(&build(3, rect(0, 0, 1, 2), 0)));
        assert!(!a.is_compatible_with(&SubDeviceManager::default_for(&chip)));
    }

    #[test]
    fn rejects_overlap_and_missing_cores() {
        let chip = ChipSpec::WORMHOLE;
        let overlap = SubDeviceManager::new(
            SubDeviceManagerId(1),
            vec![SubDevice::tensix(rect(0, 0, 3, 3)), SubDevice::tensix(rect(3, 3, 4, 4))],
            0,
            &chip,
            L1,
        );
        assert!(matches!(overlap, Err(TesselError::Overlap { .. })));

        let off_chip = SubDeviceManager::new(
            SubDeviceManagerId(1),
            vec![SubDevice::tensix(rect(0, 0, 8, 0))],
            0,
            &chip,
            L1,
        );
        assert!(matches!(off_chip, Err(TesselError::TooManyCores { .. })));

        let too_much_l1 = SubDeviceManager::new(
            SubDeviceManagerId(1),
            vec![SubDevice::tensix(rect(0, 0, 0, 0))],
            L1 + 1,
            &chip,
            L1,
        );
        assert!(matches!(too_much_l1, Err(TesselError::OutOfMemory { .. })));
    }

    #[test]
    fn worker_and_ethernet_may_share_coordinates() {
        let chip = ChipSpec::WORMHOLE;
        let m = SubDeviceManager::new(
            SubDeviceManagerId(1),
            vec![SubDevice::tensix(rect(0, 0, 7, 7)), SubDevice::ethernet(rect(0, 0, 15, 0))],
            0,
            &chip,
            L1,
        )
        .unwrap();
        assert_eq!(m.sub_device_ids(), vec![SubDeviceId(0), SubDeviceId(1)]);
    }

    #[test]
    fn program_must_fit_one_sub_device() {
        let chip = ChipSpec::WORMHOLE;
        let m = SubDeviceManager::new(
            SubDeviceManagerId(1),
            vec![SubDevice::tensix(rect(0, 0, 0, 7)), SubDevice::tensix(rect(1, 0, 1, 7))],
            0,
            &chip,
            L1,
        )
        .unwrap();

        let mut inside = Program::new("inside");
        inside
            .add_kernel(Arc::new(Noop), rect(1, 2, 1, 3), KernelConfig::tensix())
            .unwrap();
        assert_eq!(m.sub_device_for(&inside).unwrap(), SubDeviceId(1));

        let mut spanning = Program::new("spanning");
        spanning
            .add_kernel(Arc::new(Noop), rect(0, 0, 1, 0), KernelConfig::tensix())
            .unwrap();
        assert!(matches!(
            m.sub_device_for(&spanning),
            Err(TesselError::InvalidSubDevice { .. })
        ));
        assert!(m.validate_group(&[SubDeviceId(2)]).is_err());
    }

    #[test]
    fn active_manager_cannot_be_removed() {
        let chip = ChipSpec::WORMHOLE;
        let mut reg = SubDeviceRegistry::new(&chip);
        let id = reg
            .create(vec![SubDevice::tensix(rect(0, 0, 1, 1))], 0, &chip, L1)
            .unwrap();
        let m = reg.get(id).unwrap();
        reg.set_active(m);
        assert!(reg.remove(id).is_err());
        reg.set_active(reg.default_manager());
        assert!(reg.remove(id).is_ok());
        assert!(reg.get(id).is_err());
    }
}
