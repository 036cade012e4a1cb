// SPDX-License-Identifier: AGPL-3.0-only

//! Software device model
//!
//! One [`Device`] per physical chip. Memory is addressed the way kernels see
//! it: L1 by NOC coordinate, DRAM by bank. Every L1 write wakes waiters so
//! semaphore polling does not spin.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tessel_chip::{ChipSpec, CoreCoord, CoreType};
use tracing::{error, warn};

use crate::error::{Result, TesselError};
use crate::fabric::EdmEndpoint;
use crate::memory::SparseMemory;
use crate::system::PhysicalDeviceId;

const FAULT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct DeviceMemory {
    l1: HashMap<CoreCoord, SparseMemory>,
    dram: Vec<SparseMemory>,
}

/// A simulated chip.
#[derive(Debug)]
pub struct Device {
    id: PhysicalDeviceId,
    chip: ChipSpec,
    memory: Mutex<DeviceMemory>,
    memory_changed: Condvar,
    fault: Mutex<Option<String>>,
    claimed: AtomicBool,
    edm_endpoints: RwLock<HashMap<CoreCoord, Arc<EdmEndpoint>>>,
}

impl Device {
    pub(crate) fn new(id: PhysicalDeviceId, chip: ChipSpec) -> Self {
        Self {
            id,
            chip,
            memory: Mutex::new(DeviceMemory {
                l1: HashMap::new(),
                dram: (0..chip.num_dram_banks).map(|_| SparseMemory::default()).collect(),
            }),
            memory_changed: Condvar::new(),
            fault: Mutex::new(None),
            claimed: AtomicBool::new(false),
            edm_endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Physical id.
    #[must_use]
    pub const fn id(&self) -> PhysicalDeviceId {
        self.id
    }

    /// Chip geometry.
    #[must_use]
    pub const fn chip(&self) -> &ChipSpec {
        &self.chip
    }

    fn check_l1(&self, noc: CoreCoord, address: u32, len: usize) -> Result<()> {
        if self.chip.logical_from_noc(noc).is_none() {
            return Err(TesselError::invalid_state(format!(
                "device {}: NOC {noc} is not an L1 endpoint",
                self.id
            )));
        }
        if u64::from(address) + len as u64 > u64::from(self.chip.l1_size) {
            return Err(TesselError::out_of_memory(format!(
                "device {}: L1 access 0x{address:x}+{len} past end of L1",
                self.id
            )));
        }
        Ok(())
    }

    fn check_dram(&self, bank: u32, address: u32, len: usize) -> Result<()> {
        if bank >= self.chip.num_dram_banks
            || u64::from(address) + len as u64 > u64::from(self.chip.dram_bank_size)
        {
            return Err(TesselError::out_of_memory(format!(
                "device {}: DRAM access bank {bank} 0x{address:x}+{len} out of range",
                self.id
            )));
        }
        Ok(())
    }

    /// Write L1 of the core at `noc`.
    ///
    /// # Errors
    ///
    /// Returns error if `noc` is not a core or the access leaves L1.
    pub fn write_l1(&self, noc: CoreCoord, address: u32, data: &[u8]) -> Result<()> {
        self.check_l1(noc, address, data.len())?;
        self.memory
            .lock()
            .l1
            .entry(noc)
            .or_default()
            .write(address, data);
        self.memory_changed.notify_all();
        Ok(())
    }

    /// Read L1 of the core at `noc`.
    ///
    /// # Errors
    ///
    /// Returns error if `noc` is not a core or the access leaves L1.
    pub fn read_l1(&self, noc: CoreCoord, address: u32, len: usize) -> Result<Vec<u8>> {
        self.check_l1(noc, address, len)?;
        let mut out = vec![0u8; len];
        if let Some(mem) = self.memory.lock().l1.get(&noc) {
            mem.read(address, &mut out);
        }
        Ok(out)
    }

    /// Read one L1 word.
    ///
    /// # Errors
    ///
    /// Returns error if `noc` is not a core or the access leaves L1.
    pub fn read_l1_u32(&self, noc: CoreCoord, address: u32) -> Result<u32> {
        self.check_l1(noc, address, 4)?;
        Ok(self
            .memory
            .lock()
            .l1
            .get(&noc)
            .map_or(0, |mem| mem.read_u32(address)))
    }

    /// Write one L1 word.
    ///
    /// # Errors
    ///
    /// Returns error if `noc` is not a core or the access leaves L1.
    pub fn write_l1_u32(&self, noc: CoreCoord, address: u32, value: u32) -> Result<()> {
        self.write_l1(noc, address, &value.to_le_bytes())
    }

    /// Atomically add `value` to an L1 word, returning the new value.
    pub(crate) fn atomic_inc(&self, noc: CoreCoord, address: u32, value: u32) -> Result<u32> {
        self.check_l1(noc, address, 4)?;
        let next = {
            let mut memory = self.memory.lock();
            let mem = memory.l1.entry(noc).or_default();
            let next = mem.read_u32(address).wrapping_add(value);
            mem.write_u32(address, next);
            next
        };
        self.memory_changed.notify_all();
        Ok(next)
    }

    /// Block until the L1 word satisfies `ready`, returning its value.
    pub(crate) fn wait_l1_u32(
        &self,
        noc: CoreCoord,
        address: u32,
        timeout: Duration,
        ready: impl Fn(u32) -> bool,
    ) -> Result<u32> {
        self.check_l1(noc, address, 4)?;
        let deadline = Instant::now() + timeout;
        let mut memory = self.memory.lock();
        loop {
            let value = memory.l1.get(&noc).map_or(0, |mem| mem.read_u32(address));
            if ready(value) {
                return Ok(value);
            }
            if let Some(reason) = self.fault.lock().clone() {
                return Err(TesselError::invalid_state(format!(
                    "wait aborted, device {} faulted: {reason}",
                    self.id
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TesselError::timeout(
                    format!("device {} core {noc} L1 0x{address:x} (last value {value})", self.id),
                    timeout,
                ));
            }
            let slice = (deadline - now).min(FAULT_POLL);
            self.memory_changed.wait_for(&mut memory, slice);
        }
    }

    /// Write a DRAM bank.
    pub(crate) fn write_dram(&self, bank: u32, address: u32, data: &[u8]) -> Result<()> {
        self.check_dram(bank, address, data.len())?;
        self.memory.lock().dram[bank as usize].write(address, data);
        Ok(())
    }

    /// Read a DRAM bank.
    pub(crate) fn read_dram(&self, bank: u32, address: u32, len: usize) -> Result<Vec<u8>> {
        self.check_dram(bank, address, len)?;
        let mut out = vec![0u8; len];
        self.memory.lock().dram[bank as usize].read(address, &mut out);
        Ok(out)
    }

    /// NOC coordinate of a logical core.
    #[must_use]
    pub const fn noc(&self, core_type: CoreType, logical: CoreCoord) -> CoreCoord {
        self.chip.noc_coord(core_type, logical)
    }

    /// First fault recorded since the device was claimed.
    #[must_use]
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    fn record_fault(&self, reason: &str) -> bool {
        let first = {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                *fault = Some(reason.to_string());
                true
            } else {
                false
            }
        };
        self.memory_changed.notify_all();
        first
    }

    pub(crate) fn claim(&self) -> bool {
        let ok = self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            *self.fault.lock() = None;
        }
        ok
    }

    pub(crate) fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    /// Whether an open mesh owns this device.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub(crate) fn register_edm(&self, core: CoreCoord, endpoint: Arc<EdmEndpoint>) {
        self.edm_endpoints.write().insert(core, endpoint);
    }

    pub(crate) fn unregister_edm(&self, core: CoreCoord) {
        self.edm_endpoints.write().remove(&core);
    }

    pub(crate) fn edm_at(&self, core: CoreCoord) -> Option<Arc<EdmEndpoint>> {
        self.edm_endpoints.read().get(&core).cloned()
    }

    pub(crate) fn edm_endpoints(&self) -> Vec<Arc<EdmEndpoint>> {
        self.edm_endpoints.read().values().cloned().collect()
    }
}

/// Device fault sink.
///
/// Stands in for the on-device watcher: the first fault on a device is kept,
/// logged and appended to the watcher log so hangs can be diagnosed after the
/// host has given up on the queue.
#[derive(Debug, Clone)]
pub(crate) struct Watcher {
    path: PathBuf,
}

impl Watcher {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn record(&self, device: &Device, reason: &str) {
        if !device.record_fault(reason) {
            return;
        }
        error!("Device {} fault: {reason}", device.id());
        let line = format!("device {}: {reason}\n", device.id());
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = written {
            warn!("Failed to append to watcher log {}: {e}", self.path.display());
        }
    }

    /// Fault on `device` as an error, if any.
    pub(crate) fn check(&self, device: &Device) -> Result<()> {
        match device.fault() {
            Some(reason) => Err(TesselError::DeviceFault {
                device: device.id().0,
                reason,
                watcher_log: self.path.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new(PhysicalDeviceId(0), ChipSpec::WORMHOLE)
    }

    #[test]
    fn l1_words_round_trip() {
        let dev = device();
        let noc = dev.noc(CoreType::Tensix, CoreCoord::new(2, 3));
        dev.write_l1_u32(noc, 0x2_0000, 42).unwrap();
        assert_eq!(dev.read_l1_u32(noc, 0x2_0000).unwrap(), 42);
        assert_eq!(dev.atomic_inc(noc, 0x2_0000, 3).unwrap(), 45);
    }

    #[test]
    fn rejects_non_core_noc() {
        let dev = device();
        assert!(dev.write_l1(CoreCoord::new(0, 0), 0, &[1]).is_err());
        assert!(dev.read_l1(CoreCoord::new(1, 1), 0, 4).is_err());
    }

    #[test]
    fn wait_times_out_and_wakes() {
        let dev = Arc::new(device());
        let noc = dev.noc(CoreType::Tensix, CoreCoord::new(0, 0));
        let err = dev
            .wait_l1_u32(noc, 0x2_0000, Duration::from_millis(30), |v| v == 1)
            .unwrap_err();
        assert!(matches!(err, TesselError::Timeout { .. }));

        let poker = Arc::clone(&dev);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            poker.atomic_inc(noc, 0x2_0000, 1).unwrap();
        });
        let v = dev
            .wait_l1_u32(noc, 0x2_0000, Duration::from_secs(5), |v| v >= 1)
            .unwrap();
        assert_eq!(v, 1);
        t.join().unwrap();
    }

    #[test]
    fn watcher_keeps_first_fault() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = Watcher::new(dir.path().join("watcher.log"));
        let dev = device();
        assert!(dev.claim());
        watcher.record(&dev, "first");
        watcher.record(&dev, "second");
        match watcher.check(&dev) {
            Err(TesselError::DeviceFault { reason, .. }) => assert_eq!(reason, "first"),
            other => panic!("expected fault, got {other:?}"),
        }
        let log = std::fs::read_to_string(watcher.path()).unwrap();
        assert!(log.contains("first"));
        assert!(!log.contains("second"));
    }
}
