//! Mesh command queues
//!
//! A [`MeshCommandQueue`] is a borrowed handle onto one queue of a
//! [`MeshDevice`]. Everything it enqueues is FIFO per queue; programs on
//! different sub-devices run concurrently.
//!
//! Host waits (blocking enqueues, [`finish`](MeshCommandQueue::finish),
//! shard reads) only wait on the queue's stall group, so work on other
//! sub-devices can keep running across them.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tessel_chip::MeshCoordinate;
use tracing::{debug, error};

use crate::buffer::MeshBuffer;
use crate::config::DispatchMode;
use crate::device::Device;
use crate::dispatch::Dispatcher;
use crate::error::{Result, TesselError};
use crate::mesh::{MeshDevice, QueueState};
use crate::program::{self, LaunchMessage};
use crate::sub_device::SubDeviceId;
use crate::system::PhysicalDeviceId;
use crate::workload::{MeshWorkload, PlannedLaunch};

/// Handle to one command queue of a mesh.
#[derive(Debug, Clone, Copy)]
pub struct MeshCommandQueue<'a> {
    mesh: &'a MeshDevice,
    id: usize,
}

impl<'a> MeshCommandQueue<'a> {
    pub(crate) const fn new(mesh: &'a MeshDevice, id: usize) -> Self {
        Self { mesh, id }
    }

    /// Queue index.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    fn state(&self) -> Result<&'a QueueState> {
        self.mesh.queue_state(self.id)
    }

    fn capturing(&self) -> Result<bool> {
        Ok(self.state()?.capture.lock().is_some())
    }

    fn reject_during_capture(&self, what: &str) -> Result<()> {
        if self.capturing()? {
            return Err(TesselError::invalid_state(format!(
                "{what} not allowed while queue {} is capturing a trace",
                self.id
            )));
        }
        Ok(())
    }

    fn fast(&self) -> bool {
        self.mesh.config().runtime.dispatch_mode == DispatchMode::Fast
    }

    /// Lanes the host waits on: the stall group, or every active lane.
    fn stall_lanes(&self) -> Result<Vec<usize>> {
        let group = self.state()?.stall_group.lock().clone();
        Ok(if group.is_empty() {
            (0..self.mesh.active_manager().num_sub_devices()).collect()
        } else {
            group.into_iter().map(SubDeviceId::lane).collect()
        })
    }

    // -- workloads ------------------------------------------------------

    /// Enqueue every program of `workload` on its sub-grid.
    ///
    /// Programs are compiled per device the first time they are enqueued.
    /// While the queue is capturing, the launches run and are recorded.
    ///
    /// # Errors
    ///
    /// - `InvalidRange` if a program's range does not fit the mesh
    /// - `InvalidSubDevice` if a program spans sub-devices
    /// - `InvalidState` for a blocking enqueue during capture
    /// - `DeviceFault` if a device faulted, now or during the blocking wait
    pub fn enqueue_workload(&self, workload: &mut MeshWorkload, blocking: bool) -> Result<()> {
        let state = self.state()?;
        if blocking && self.capturing()? {
            return Err(TesselError::invalid_state(format!(
                "blocking enqueue while queue {} is capturing a trace",
                self.id
            )));
        }
        let manager = self.mesh.active_manager();
        let planned = workload.plan(self.mesh.shape(), |c| self.mesh.device_at_opt(c), &manager)?;

        debug!(
            "Queue {}: enqueue {} launch(es){}",
            self.id,
            planned.len(),
            if blocking { ", blocking" } else { "" }
        );

        if self.fast() {
            let mut capture = state.capture.lock();
            for PlannedLaunch { device, lane, launch } in planned {
                let dispatcher = self.dispatcher(state, device.id())?;
                // Only launches the dispatcher accepted go into the trace.
                match capture.as_mut() {
                    Some(capture) => {
                        dispatcher.launch(lane, launch.clone())?;
                        capture.record(device.id(), lane, launch);
                    }
                    None => dispatcher.launch(lane, launch)?,
                }
            }
            drop(capture);
            if blocking {
                self.finish()?;
            }
            Ok(())
        } else {
            self.run_slow(planned)
        }
    }

    fn dispatcher<'s>(
        &self,
        state: &'s QueueState,
        device: PhysicalDeviceId,
    ) -> Result<&'s Dispatcher> {
        state.dispatchers.get(&device).ok_or_else(|| {
            TesselError::invalid_state(format!(
                "no dispatcher for device {device} on queue {}",
                self.id
            ))
        })
    }

    /// Slow dispatch: one scoped task per device, joined before returning.
    fn run_slow(&self, planned: Vec<PlannedLaunch>) -> Result<()> {
        let mut by_device: HashMap<PhysicalDeviceId, (Arc<Device>, Vec<LaunchMessage>)> = HashMap::new();
        for PlannedLaunch { device, launch, .. } in planned {
            by_device
                .entry(device.id())
                .or_insert_with(|| (Arc::clone(&device), Vec::new()))
                .1
                .push(launch);
        }
        let timeout = self.mesh.config().runtime.dispatch_timeout;
        let watcher = self.mesh.watcher();

        std::thread::scope(|s| {
            for (device, launches) in by_device.values() {
                s.spawn(move || {
                    for launch in launches {
                        if let Err(e) = program::execute(device, launch, timeout) {
                            error!("Device {} fault in {}: {e}", device.id(), launch.program.name());
                            watcher.record(device, &e.to_string());
                            return;
                        }
                    }
                });
            }
        });

        for (device, _) in by_device.values() {
            watcher.check(device)?;
        }
        Ok(())
    }

    // -- buffers --------------------------------------------------------

    /// Write a whole mesh buffer: the full image when replicated, one shard
    /// per device in row-major order when sharded.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRange` if `data` is not exactly the buffer's host
    /// size, `InvalidState` during capture.
    pub fn write_buffer(&self, buffer: &MeshBuffer, data: &[u8], blocking: bool) -> Result<()> {
        self.reject_during_capture("buffer write")?;
        if data.len() != buffer.host_size() as usize {
            return Err(TesselError::invalid_range(format!(
                "write of {} bytes to a buffer of {} bytes",
                data.len(),
                buffer.host_size()
            )));
        }
        for (index, device) in self.mesh.devices().iter().enumerate() {
            self.write_device(buffer, device, buffer.portion(data, index))?;
        }
        if blocking {
            self.finish()?;
        }
        Ok(())
    }

    /// Write one device's portion of a buffer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRange` for a coordinate outside the mesh or a length
    /// other than the per-device size, `InvalidState` during capture.
    pub fn write_shard(&self, buffer: &MeshBuffer, coord: MeshCoordinate, data: &[u8], blocking: bool) -> Result<()> {
        self.reject_during_capture("shard write")?;
        if data.len() != buffer.device_size() as usize {
            return Err(TesselError::invalid_range(format!(
                "shard write of {} bytes, device portion is {} bytes",
                data.len(),
                buffer.device_size()
            )));
        }
        let device = self.mesh.device_at(coord)?;
        self.write_device(buffer, &device, data)?;
        if blocking {
            self.finish()?;
        }
        Ok(())
    }

    fn write_device(&self, buffer: &MeshBuffer, device: &Arc<Device>, data: &[u8]) -> Result<()> {
        let writes = buffer.page_writes(device.chip(), data);
        if self.fast() {
            let lanes = self.stall_lanes()?;
            self.dispatcher(self.state()?, device.id())?.write(&lanes, writes)
        } else {
            self.mesh.watcher().check(device)?;
            for (target, bytes) in writes {
                target.write(device, &bytes)?;
            }
            Ok(())
        }
    }

    /// Read one device's portion of a buffer, after the stall group drains.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRange` for a coordinate outside the mesh,
    /// `InvalidState` during capture, or a device fault seen while waiting.
    pub fn read_shard(&self, buffer: &MeshBuffer, coord: MeshCoordinate) -> Result<Bytes> {
        self.reject_during_capture("shard read")?;
        let device = self.mesh.device_at(coord)?;
        if self.fast() {
            let lanes = self.stall_lanes()?;
            self.dispatcher(self.state()?, device.id())?.wait_lanes(&lanes)?;
        }
        self.mesh.watcher().check(&device)?;
        Ok(Bytes::from(buffer.read_device(&device)?))
    }

    // -- synchronisation ------------------------------------------------

    /// Wait until every device finishes the stall group's work issued so
    /// far.
    ///
    /// # Errors
    ///
    /// Returns `DeviceFault` if a device faulted, `Timeout` if it hangs.
    pub fn finish(&self) -> Result<()> {
        let state = self.state()?;
        let lanes = self.stall_lanes()?;
        for dispatcher in state.dispatchers.values() {
            dispatcher.wait_lanes(&lanes)?;
        }
        for device in self.mesh.devices() {
            self.mesh.watcher().check(&device)?;
        }
        Ok(())
    }

    /// Restrict host waits to `ids`. An empty slice means every sub-device.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSubDevice` for an id outside the active manager.
    pub fn set_stall_group(&self, ids: &[SubDeviceId]) -> Result<()> {
        self.mesh.active_manager().validate_group(ids)?;
        let mut group = ids.to_vec();
        group.sort_unstable();
        group.dedup();
        *self.state()?.stall_group.lock() = group;
        Ok(())
    }

    /// Wait on every sub-device again.
    pub fn reset_stall_group(&self) {
        if let Ok(state) = self.state() {
            state.stall_group.lock().clear();
        }
    }

    /// Current stall group; empty means every sub-device.
    #[must_use]
    pub fn stall_group(&self) -> Vec<SubDeviceId> {
        self.state()
            .map(|s| s.stall_group.lock().clone())
            .unwrap_or_default()
    }
}
