// SPDX-License-Identifier: AGPL-3.0-only

//! Mesh devices
//!
//! A [`MeshDevice`] owns a set of physical chips arranged as a logical
//! [`MeshShape`], plus everything shared across them: the same-address
//! allocators, the trace region and trace arena, the sub-device managers and
//! one dispatcher per (device, command queue).
//!
//! Structural changes (reshape, sub-device manager load) take `&mut self`,
//! so no command queue handle can be alive while they run.
//!
//! ```text
//! DRAM bank layout on every device
//! ┌──────────────────────────────┬──────────────────┐
//! │ buffers (mesh allocator)     │ trace region     │
//! 0                bank_size - region         bank_size
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tessel_chip::{boustrophedon, ChipSpec, CoreCoord, CoreRangeSet, CoreType, MeshCoordinate, MeshShape, TerminationSignal};
use tracing::{debug, info, warn};

use crate::buffer::MeshAllocators;
use crate::command_queue::MeshCommandQueue;
use crate::config::{DispatchMode, MeshDeviceConfig, MeshTopology, MAX_COMMAND_QUEUES};
use crate::device::{Device, Watcher};
use crate::dispatch::Dispatcher;
use crate::error::{Result, TesselError};
use crate::memory::FreeListAllocator;
use crate::sub_device::{SubDevice, SubDeviceId, SubDeviceManager, SubDeviceManagerId, SubDeviceRegistry};
use crate::system::{PhysicalDeviceId, SystemMesh};
use crate::trace::{MeshTraceId, TraceArena, TraceCapture};

const TRACE_ALIGNMENT: u32 = 32;

/// Per-queue state.
#[derive(Debug)]
pub(crate) struct QueueState {
    pub(crate) dispatchers: HashMap<PhysicalDeviceId, Dispatcher>,
    pub(crate) capture: Mutex<Option<TraceCapture>>,
    pub(crate) stall_group: Mutex<Vec<SubDeviceId>>,
}

/// A logical grid of chips driven as one device.
#[derive(Debug)]
pub struct MeshDevice {
    system: Arc<SystemMesh>,
    config: MeshDeviceConfig,
    shape: MeshShape,
    devices: Vec<Arc<Device>>,
    opened_ids: Vec<PhysicalDeviceId>,
    allocators: Arc<MeshAllocators>,
    l1_limit: u32,
    trace_region: Mutex<FreeListAllocator>,
    traces: Mutex<TraceArena>,
    queues: Vec<QueueState>,
    sub_devices: SubDeviceRegistry,
    watcher: Watcher,
    closed: bool,
}

impl MeshDevice {
    /// Claim devices for `config.shape` and start their dispatchers.
    ///
    /// # Errors
    ///
    /// - `InvalidShape` if the shape cannot be mapped or explicit ids do not
    ///   match it
    /// - `DeviceNotFound` for an unknown explicit id
    /// - `IncompatibleTopology` if explicit ids are not physically connected
    ///   as `shape`, or a ring's ends are not neighbours
    /// - `InvalidState` if a device is owned by another open mesh or the
    ///   queue count is out of range
    /// - `OutOfMemory` if the trace region or L1 reservation does not fit
    pub fn open(system: Arc<SystemMesh>, config: MeshDeviceConfig) -> Result<Self> {
        let runtime = &config.runtime;
        if !(1..=MAX_COMMAND_QUEUES).contains(&runtime.num_command_queues) {
            return Err(TesselError::invalid_state(format!(
                "{} command queues requested, 1..={MAX_COMMAND_QUEUES} supported",
                runtime.num_command_queues
            )));
        }

        let shape = config.shape;
        let ids = match &config.physical_device_ids {
            Some(ids) => {
                if ids.len() != shape.num_devices() {
                    return Err(TesselError::invalid_shape(format!(
                        "{shape} needs {} devices, {} ids given",
                        shape.num_devices(),
                        ids.len()
                    )));
                }
                let mut sorted = ids.clone();
                sorted.sort_unstable();
                sorted.dedup();
                if sorted.len() != ids.len() {
                    return Err(TesselError::invalid_shape("physical device ids repeat"));
                }
                if let Some(&unknown) = ids.iter().find(|id| system.device(**id).is_err()) {
                    return Err(TesselError::DeviceNotFound { id: unknown.0 });
                }
                if !system.is_connected_grid(shape, ids) {
                    return Err(TesselError::incompatible_topology(format!(
                        "devices {:?} are not physically connected as {shape}",
                        ids.iter().map(|id| id.0).collect::<Vec<_>>()
                    )));
                }
                ids.clone()
            }
            None => system.get_mapped_physical_device_ids(shape, config.offset)?,
        };
        let devices = ids
            .iter()
            .map(|&id| system.device(id))
            .collect::<Result<Vec<_>>>()?;

        if config.topology == MeshTopology::Ring && devices.len() > 2 {
            let walk = boustrophedon(shape.rows(), shape.cols());
            let end = |(r, c): (u32, u32)| ids[(r * shape.cols() + c) as usize];
            if let (Some(&first), Some(&last)) = (walk.first(), walk.last()) {
                if !system.are_connected(end(first), end(last)) {
                    return Err(TesselError::incompatible_topology(format!(
                        "ring over {shape}: devices {} and {} are not neighbours",
                        end(first),
                        end(last)
                    )));
                }
            }
        }

        let chip = *system.chip();
        let bank_size = u64::from(chip.dram_bank_size);
        if runtime.trace_region_size > bank_size {
            return Err(TesselError::out_of_memory(format!(
                "trace region of {} bytes exceeds DRAM bank of {bank_size}",
                runtime.trace_region_size
            )));
        }
        let region_base = (bank_size - runtime.trace_region_size) as u32;
        let l1_limit = chip
            .l1_size
            .checked_sub(runtime.l1_small_size)
            .filter(|limit| *limit >= chip.l1_unreserved_base)
            .ok_or_else(|| {
                TesselError::out_of_memory(format!(
                    "L1 small region of {} bytes leaves no room for buffers",
                    runtime.l1_small_size
                ))
            })?;

        let mut claimed: Vec<&Arc<Device>> = Vec::with_capacity(devices.len());
        for device in &devices {
            if !device.claim() {
                for d in claimed {
                    d.release();
                }
                return Err(TesselError::invalid_state(format!(
                    "device {} is owned by another open mesh",
                    device.id()
                )));
            }
            claimed.push(device);
        }

        let watcher = Watcher::new(runtime.watcher_log_path.clone());
        let queues = match Self::start_queues(&devices, &config, &watcher) {
            Ok(queues) => queues,
            Err(e) => {
                for d in &devices {
                    d.release();
                }
                return Err(e);
            }
        };

        info!(
            "Opened {shape} mesh on devices {:?} ({:?} dispatch, {} queue(s))",
            ids.iter().map(|id| id.0).collect::<Vec<_>>(),
            runtime.dispatch_mode,
            runtime.num_command_queues
        );

        Ok(Self {
            allocators: Arc::new(MeshAllocators::new(&chip, region_base, l1_limit)),
            l1_limit,
            trace_region: Mutex::new(FreeListAllocator::new(
                "trace",
                region_base,
                chip.dram_bank_size,
                TRACE_ALIGNMENT,
            )),
            traces: Mutex::new(TraceArena::default()),
            sub_devices: SubDeviceRegistry::new(&chip),
            system,
            shape,
            devices,
            opened_ids: ids,
            queues,
            watcher,
            config,
            closed: false,
        })
    }

    fn start_queues(devices: &[Arc<Device>], config: &MeshDeviceConfig, watcher: &Watcher) -> Result<Vec<QueueState>> {
        let runtime = &config.runtime;
        (0..runtime.num_command_queues)
            .map(|queue| {
                let mut dispatchers = HashMap::new();
                if runtime.dispatch_mode == DispatchMode::Fast {
                    for device in devices {
                        let dispatcher = Dispatcher::spawn(
                            Arc::clone(device),
                            queue,
                            1,
                            watcher.clone(),
                            runtime.dispatch_timeout,
                        )?;
                        dispatchers.insert(device.id(), dispatcher);
                    }
                }
                Ok(QueueState {
                    dispatchers,
                    capture: Mutex::new(None),
                    stall_group: Mutex::new(Vec::new()),
                })
            })
            .collect()
    }

    // -- accessors ------------------------------------------------------

    /// Logical shape.
    #[must_use]
    pub const fn shape(&self) -> MeshShape {
        self.shape
    }

    /// Rows of the logical grid.
    #[must_use]
    pub const fn num_rows(&self) -> u32 {
        self.shape.rows()
    }

    /// Columns of the logical grid.
    #[must_use]
    pub const fn num_cols(&self) -> u32 {
        self.shape.cols()
    }

    /// Chips in the mesh.
    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Physical ids, row-major.
    #[must_use]
    pub fn get_device_ids(&self) -> Vec<PhysicalDeviceId> {
        self.devices.iter().map(|d| d.id()).collect()
    }

    /// Device at a logical coordinate.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRange` for a coordinate outside the mesh.
    pub fn device_at(&self, coord: MeshCoordinate) -> Result<Arc<Device>> {
        self.device_at_opt(coord).ok_or_else(|| {
            TesselError::invalid_range(format!("{coord} outside mesh {}", self.shape))
        })
    }

    pub(crate) fn device_at_opt(&self, coord: MeshCoordinate) -> Option<Arc<Device>> {
        if !self.shape.contains(coord) {
            return None;
        }
        self.devices.get(self.shape.linear_index(coord)).cloned()
    }

    /// Logical coordinate of a physical device, if it is in the mesh.
    #[must_use]
    pub fn coordinate_of(&self, id: PhysicalDeviceId) -> Option<MeshCoordinate> {
        self.devices
            .iter()
            .position(|d| d.id() == id)
            .map(|i| self.shape.coord_at(i))
    }

    /// Chip geometry shared by every device.
    #[must_use]
    pub fn chip(&self) -> &ChipSpec {
        self.system.chip()
    }

    /// Devices, row-major.
    #[must_use]
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.clone()
    }

    pub(crate) fn allocators(&self) -> Arc<MeshAllocators> {
        Arc::clone(&self.allocators)
    }

    /// The system the mesh was opened on.
    #[must_use]
    pub fn system(&self) -> &Arc<SystemMesh> {
        &self.system
    }

    /// Configuration the mesh was opened with.
    #[must_use]
    pub const fn config(&self) -> &MeshDeviceConfig {
        &self.config
    }

    /// Number of command queues.
    #[must_use]
    pub fn num_command_queues(&self) -> usize {
        self.queues.len()
    }

    pub(crate) fn queue_state(&self, id: usize) -> Result<&QueueState> {
        self.queues.get(id).ok_or(TesselError::InvalidQueue {
            index: id,
            count: self.queues.len(),
        })
    }

    pub(crate) const fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    pub(crate) fn active_manager(&self) -> Arc<SubDeviceManager> {
        self.sub_devices.active()
    }

    /// Handle to command queue `id`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQueue` for an index past the configured queues.
    pub fn command_queue(&self, id: usize) -> Result<MeshCommandQueue<'_>> {
        self.queue_state(id)?;
        Ok(MeshCommandQueue::new(self, id))
    }

    fn capture_active(&self) -> Option<usize> {
        self.queues.iter().position(|q| q.capture.lock().is_some())
    }

    /// Wait for every lane on every queue.
    fn drain(&self) -> Result<()> {
        for queue in &self.queues {
            for dispatcher in queue.dispatchers.values() {
                let lanes: Vec<usize> = (0..dispatcher.num_lanes()).collect();
                dispatcher.wait_lanes(&lanes)?;
            }
        }
        for device in &self.devices {
            self.watcher.check(device)?;
        }
        Ok(())
    }

    // -- host direct path -----------------------------------------------

    /// Write L1 of a worker core directly, bypassing the command queues.
    ///
    /// Not ordered with queued buffer writes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRange` for a coordinate outside the mesh, or the L1
    /// access error.
    pub fn write_core(&self, coord: MeshCoordinate, core: CoreCoord, address: u32, data: &[u8]) -> Result<()> {
        let device = self.device_at(coord)?;
        device.write_l1(device.noc(CoreType::Tensix, core), address, data)
    }

    /// Read L1 of a worker core directly.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRange` for a coordinate outside the mesh, or the L1
    /// access error.
    pub fn read_core(&self, coord: MeshCoordinate, core: CoreCoord, address: u32, len: usize) -> Result<Vec<u8>> {
        let device = self.device_at(coord)?;
        device.read_l1(device.noc(CoreType::Tensix, core), address, len)
    }

    /// Read one L1 word of a worker core directly.
    ///
    /// # Errors
    ///
    /// As [`read_core`](Self::read_core).
    pub fn read_core_u32(&self, coord: MeshCoordinate, core: CoreCoord, address: u32) -> Result<u32> {
        let device = self.device_at(coord)?;
        device.read_l1_u32(device.noc(CoreType::Tensix, core), address)
    }

    // -- reshape --------------------------------------------------------

    /// Re-arrange the same devices as `new_shape`.
    ///
    /// A line target walks the current grid in serpentine order; a grid
    /// target must be a physically connected block holding exactly the
    /// current devices.
    ///
    /// # Errors
    ///
    /// - `DeviceCountMismatch` if `new_shape` holds a different count
    /// - `IncompatibleTopology` if no block of `new_shape` matches
    /// - `InvalidState` while a trace capture is active
    pub fn reshape(&mut self, new_shape: MeshShape) -> Result<()> {
        if let Some(queue) = self.capture_active() {
            return Err(TesselError::invalid_state(format!(
                "cannot reshape during trace capture on queue {queue}"
            )));
        }
        if new_shape.num_devices() != self.devices.len() {
            return Err(TesselError::DeviceCountMismatch {
                current: self.devices.len(),
                requested: new_shape.num_devices(),
            });
        }
        let order = self.reshaped_order(new_shape).ok_or_else(|| {
            TesselError::incompatible_topology(format!(
                "devices of {} mesh do not form a connected {new_shape} block",
                self.shape
            ))
        })?;
        self.devices = order
            .iter()
            .map(|&id| self.system.device(id))
            .collect::<Result<Vec<_>>>()?;
        info!(
            "Reshaped mesh {} -> {new_shape}: {:?}",
            self.shape,
            order.iter().map(|id| id.0).collect::<Vec<_>>()
        );
        self.shape = new_shape;
        Ok(())
    }

    /// Row-major device order for `new_shape`.
    ///
    /// The shape the mesh was opened with always gets its opened order back.
    /// A line folds back along the serpentine walk when that stays connected;
    /// anything else falls back to the first matching physical block.
    fn reshaped_order(&self, new_shape: MeshShape) -> Option<Vec<PhysicalDeviceId>> {
        if new_shape == self.config.shape {
            return Some(self.opened_ids.clone());
        }
        let ids = self.get_device_ids();
        if new_shape.is_line() {
            if self.shape.is_line() {
                return Some(ids);
            }
            let cols = self.shape.cols();
            return Some(
                boustrophedon(self.shape.rows(), cols)
                    .into_iter()
                    .map(|(r, c)| ids[(r * cols + c) as usize])
                    .collect(),
            );
        }
        if self.shape.is_line() {
            if let Some(grid) = self.system.fold_line(new_shape, &ids) {
                return Some(grid);
            }
        }
        self.system.find_block(new_shape, &ids)
    }

    // -- sub-devices ----------------------------------------------------

    /// Register a partition of every device's cores.
    ///
    /// # Errors
    ///
    /// `Overlap`, `TooManyCores`, `InvalidSubDevice` or `OutOfMemory` as
    /// checked by the manager.
    pub fn create_sub_device_manager(
        &mut self,
        sub_devices: Vec<SubDevice>,
        local_l1_size: u32,
    ) -> Result<SubDeviceManagerId> {
        let chip = *self.chip();
        let available = self.l1_limit - chip.l1_unreserved_base;
        let id = self.sub_devices.create(sub_devices, local_l1_size, &chip, available)?;
        debug!("Created sub-device manager {}", id.0);
        Ok(id)
    }

    /// Make `id` the active manager: drain, resize the L1 allocator and
    /// rebuild the execution lanes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` during capture, `InvalidSubDevice` for an
    /// unknown id, `OutOfMemory` if live L1 buffers overlap the reservation,
    /// or a device fault surfaced while draining.
    pub fn load_sub_device_manager(&mut self, id: SubDeviceManagerId) -> Result<()> {
        let manager = self.sub_devices.get(id)?;
        self.activate(manager)
    }

    /// Go back to the default manager: one sub-device holding every core.
    ///
    /// # Errors
    ///
    /// As [`load_sub_device_manager`](Self::load_sub_device_manager).
    pub fn clear_loaded_sub_device_manager(&mut self) -> Result<()> {
        let manager = self.sub_devices.default_manager();
        self.activate(manager)
    }

    /// Forget a manager that is not active.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for the active manager, `InvalidSubDevice` for
    /// an unknown one.
    pub fn remove_sub_device_manager(&mut self, id: SubDeviceManagerId) -> Result<()> {
        self.sub_devices.remove(id)
    }

    fn activate(&mut self, manager: Arc<SubDeviceManager>) -> Result<()> {
        if let Some(queue) = self.capture_active() {
            return Err(TesselError::invalid_state(format!(
                "cannot switch sub-device manager during trace capture on queue {queue}"
            )));
        }
        self.drain()?;
        let limit = self.l1_limit - manager.local_l1_size();
        self.allocators.l1.lock().set_limit(limit)?;
        let lanes = manager.num_sub_devices();
        for queue in &self.queues {
            for dispatcher in queue.dispatchers.values() {
                dispatcher.reconfigure(lanes)?;
            }
            queue.stall_group.lock().clear();
        }
        info!(
            "Loaded sub-device manager {} ({lanes} sub-device(s), {} bytes local L1)",
            manager.id().0,
            manager.local_l1_size()
        );
        self.sub_devices.set_active(manager);
        Ok(())
    }

    /// Sub-devices of the active manager.
    #[must_use]
    pub fn get_sub_device_ids(&self) -> Vec<SubDeviceId> {
        self.sub_devices.active().sub_device_ids()
    }

    /// Cores of one type in a sub-device of the active manager.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSubDevice` for an unknown id.
    pub fn worker_cores(&self, core_type: CoreType, sub_device: SubDeviceId) -> Result<CoreRangeSet> {
        let manager = self.sub_devices.active();
        manager
            .sub_device(sub_device)
            .map(|sd| sd.cores(core_type).clone())
            .ok_or_else(|| {
                TesselError::invalid_sub_device(format!(
                    "sub-device {sub_device} not in manager {}",
                    manager.id().0
                ))
            })
    }

    // -- traces ---------------------------------------------------------

    /// Start recording everything enqueued on `queue`.
    ///
    /// # Errors
    ///
    /// Returns `CaptureAlreadyActive` if `queue` is already capturing,
    /// `InvalidState` in slow dispatch mode, `InvalidQueue` for a bad index.
    pub fn begin_trace_capture(&self, queue: usize) -> Result<MeshTraceId> {
        let state = self.queue_state(queue)?;
        if self.config.runtime.dispatch_mode == DispatchMode::Slow {
            return Err(TesselError::invalid_state("trace capture needs fast dispatch"));
        }
        let mut capture = state.capture.lock();
        if capture.is_some() {
            return Err(TesselError::CaptureAlreadyActive { queue });
        }
        let started = self.traces.lock().begin(queue, self.sub_devices.active());
        let id = started.id();
        *capture = Some(started);
        info!("Trace {id} capture started on queue {queue}");
        Ok(id)
    }

    /// Seal the capture on `queue` into the device trace regions.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCapture` if `queue` is not capturing `id`, and
    /// `TraceRegionExhausted` if the trace does not fit; the handle is
    /// released in that case.
    pub fn end_trace_capture(&self, queue: usize, id: MeshTraceId) -> Result<()> {
        let state = self.queue_state(queue)?;
        let capture = {
            let mut slot = state.capture.lock();
            match slot.take() {
                Some(c) if c.id() == id => c,
                other => {
                    *slot = other;
                    return Err(TesselError::NoActiveCapture { queue });
                }
            }
        };

        let size = capture.footprint();
        let allocated = {
            let mut allocator = self.trace_region.lock();
            let capacity = u64::from(allocator.capacity());
            u32::try_from(size)
                .ok()
                .and_then(|len| allocator.allocate(len).ok().map(|address| (address, len)))
                .ok_or(TesselError::TraceRegionExhausted { size, capacity })
        };
        let (address, len) = match allocated {
            Ok(region) => region,
            Err(e) => {
                self.discard_trace(id);
                return Err(e);
            }
        };

        let sealed = capture.seal(queue, address, len, &self.devices);
        let trace = match sealed {
            Ok(trace) => trace,
            Err(e) => {
                self.trace_region.lock().free(address);
                self.discard_trace(id);
                return Err(e);
            }
        };
        self.traces.lock().seal(id, trace)?;
        info!("Trace {id} sealed on queue {queue}: {size} bytes at 0x{address:x}");
        Ok(())
    }

    /// Drop a capture that failed to seal.
    fn discard_trace(&self, id: MeshTraceId) {
        if let Err(e) = self.traces.lock().release(id) {
            warn!("Failed to release unsealed trace {id}: {e}");
        }
    }

    /// Replay a sealed trace on `queue`.
    ///
    /// Each device gets one command for the whole trace; nothing is
    /// compiled or re-pushed from the host.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTraceHandle` for a stale id, `InvalidState` while
    /// `queue` is capturing or for a trace captured on another queue,
    /// `InvalidSubDevice` if the loaded manager partitions the cores
    /// differently from the one loaded at capture, or a device fault on a
    /// blocking replay.
    pub fn replay_trace(&self, queue: usize, id: MeshTraceId, blocking: bool) -> Result<()> {
        let state = self.queue_state(queue)?;
        if state.capture.lock().is_some() {
            return Err(TesselError::invalid_state(format!(
                "cannot replay trace {id} while queue {queue} is capturing"
            )));
        }
        let trace = self.traces.lock().get(id)?;
        if trace.queue() != queue {
            return Err(TesselError::invalid_state(format!(
                "trace {id} was captured on queue {}, not {queue}",
                trace.queue()
            )));
        }
        let active = self.sub_devices.active();
        let captured = trace.manager();
        if !Arc::ptr_eq(captured, &active) {
            if !captured.is_compatible_with(&active) {
                return Err(TesselError::invalid_sub_device(format!(
                    "trace {id} was captured under sub-device manager {}, loaded manager {} partitions the cores differently",
                    captured.id().0,
                    active.id().0
                )));
            }
            debug!(
                "Replaying trace {id} under manager {} with the partition of manager {}",
                active.id().0,
                captured.id().0
            );
        }
        for (device, stream) in trace.devices() {
            let dispatcher = state.dispatchers.get(device).ok_or_else(|| {
                TesselError::invalid_state(format!("trace {id} targets device {device}, not in this mesh"))
            })?;
            dispatcher.execute_trace(Arc::clone(stream))?;
        }
        debug!("Replaying trace {id} on queue {queue} ({} device(s))", trace.devices().len());
        if blocking {
            self.command_queue(queue)?.finish()?;
        }
        Ok(())
    }

    /// Free a trace and its region.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTraceHandle` for a stale or already released id.
    pub fn release_trace(&self, id: MeshTraceId) -> Result<()> {
        if let Some(trace) = self.traces.lock().release(id)? {
            self.trace_region.lock().free(trace.region_address());
            info!("Released trace {id} ({} bytes)", trace.region_size());
        }
        Ok(())
    }

    /// Live traces, sealed or capturing.
    #[must_use]
    pub fn num_traces(&self) -> usize {
        self.traces.lock().len()
    }

    // -- teardown -------------------------------------------------------

    /// Stop every data mover, drain the queues, stop the dispatchers,
    /// release traces and give the devices back.
    ///
    /// Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first fault or timeout seen while draining; the mesh is
    /// closed regardless.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for device in &self.devices {
            for edm in device.edm_endpoints() {
                if let Err(e) = edm.signal(device, TerminationSignal::Immediate) {
                    warn!("Failed to stop EDM on device {}: {e}", device.id());
                }
            }
        }
        let drained = self.drain();
        for queue in &self.queues {
            queue.capture.lock().take();
            for dispatcher in queue.dispatchers.values() {
                dispatcher.shutdown();
            }
        }
        let traces = self.traces.lock().drain();
        {
            let mut region = self.trace_region.lock();
            for trace in traces {
                region.free(trace.region_address());
            }
        }
        for device in &self.devices {
            device.release();
        }
        info!("Closed {} mesh", self.shape);
        drained
    }
}

impl Drop for MeshDevice {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Mesh closed with error: {e}");
        }
    }
}
