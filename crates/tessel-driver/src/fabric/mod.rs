// SPDX-License-Identifier: AGPL-3.0-only

//! Ethernet fabric over a line of devices
//!
//! An [`EdmLineFabric`] puts a forward/backward pair of data movers on
//! every link between consecutive devices of a line:
//!
//! ```text
//!   line 0          line 1          line 2
//!   F0 ══════════► B1   F1 ══════► B2
//!   (link l)            (link l)
//! ```
//!
//! `F_i` sends toward higher line indices, `B_i` toward lower ones. A packet
//! arriving at `B_i` that must travel further is relayed into `F_i` on the
//! same device and link, and symmetrically for the backward direction.
//!
//! Two lifetimes are supported:
//!
//! - **Transient**: data movers are added to the worker program with
//!   [`EdmLineFabric::add_edm_kernels`] and a worker shuts them down with
//!   termination packets once its traffic is done.
//! - **Persistent**: data movers run as their own workload on a dedicated
//!   sub-device and are torn down from the host with
//!   [`EdmLineFabric::teardown`].

pub mod connection;
pub mod edm;
pub mod writer;

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tessel_chip::chip::EDM_TERMINATION_ADDRESS;
use tessel_chip::{CoreCoord, CoreRangeSet, CoreType, LogicalDeviceRange, MeshCoordinate, TerminationSignal};
use tracing::{debug, info, warn};

pub use connection::{FabricConnection, CONNECTION_ARGS};
pub(crate) use edm::EdmEndpoint;
pub use edm::{EdmKernel, FabricStats};
pub use writer::{payload_pattern, FabricWriter, FabricWriterArgs, LineSyncArgs, TerminationInfo};

use crate::command_queue::MeshCommandQueue;
use crate::device::Device;
use crate::error::{Result, TesselError};
use crate::mesh::MeshDevice;
use crate::program::{KernelConfig, Program};
use crate::sub_device::SubDeviceId;
use crate::workload::MeshWorkload;

const DRAIN_POLL: Duration = Duration::from_millis(1);

/// Data mover settings shared by every endpoint of a fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdmConfig {
    /// Slots in each sender and receiver ring
    pub num_buffers_per_channel: usize,
    /// Largest payload one packet may carry
    pub packet_payload_size: u32,
    /// L1 address of the termination mailbox on each ethernet core
    pub termination_address: u32,
    /// Links used between each pair of neighbours
    pub num_links: u32,
}

impl Default for EdmConfig {
    fn default() -> Self {
        Self {
            num_buffers_per_channel: 8,
            packet_payload_size: 4096,
            termination_address: EDM_TERMINATION_ADDRESS,
            num_links: 1,
        }
    }
}

/// How long the data movers live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricMode {
    /// Launched inside the worker program, terminated by a worker
    Transient,
    /// Launched as a separate workload, terminated from the host
    Persistent,
}

/// Travel direction along the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Toward higher line indices
    Forward,
    /// Toward lower line indices
    Backward,
}

impl Direction {
    /// The other direction.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Forward,
        }
    }
}

/// Traffic a worker on one link of one line position should generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterSchedule {
    /// Logical worker core receiving the payloads on every chip
    pub dest_core: CoreCoord,
    /// Base of the slot region on `dest_core`
    pub dest_addr: u32,
    /// Bytes per packet
    pub payload_size: u32,
    /// Multicasts per worker
    pub num_mcasts: u32,
    /// Unicasts per worker
    pub num_unicasts: u32,
    /// Distance of each unicast target
    pub unicast_hops: u32,
    /// Unicast forward rather than backward
    pub unicast_is_fwd: bool,
    /// Logical core and L1 address of the line-sync semaphore, if enabled
    pub line_sync: Option<(CoreCoord, u32)>,
    /// Where the sync core records what it observed each round
    pub result_addr: u32,
    /// Have the line-index-0 sync worker shut the fabric down
    pub terminate: bool,
}

#[derive(Debug)]
struct LineStop {
    coord: MeshCoordinate,
    device: Arc<Device>,
    forward: Vec<Arc<EdmEndpoint>>,
    backward: Vec<Arc<EdmEndpoint>>,
}

impl LineStop {
    fn endpoints(&self) -> impl Iterator<Item = &Arc<EdmEndpoint>> {
        self.forward.iter().chain(&self.backward)
    }

    fn eth_cores(&self) -> CoreRangeSet {
        CoreRangeSet::new(self.endpoints().map(|ep| ep.core().into()))
    }
}

/// Data movers on every link of a line of devices.
#[derive(Debug)]
pub struct EdmLineFabric {
    mode: FabricMode,
    config: EdmConfig,
    stops: Vec<LineStop>,
    stats: Arc<FabricStats>,
    timeout: Duration,
}

impl EdmLineFabric {
    /// Place data movers along `line`, a walk through mesh coordinates in
    /// which consecutive devices are physical neighbours.
    ///
    /// # Errors
    ///
    /// - `Fabric` for a line of fewer than two devices, a repeated device or
    ///   an ethernet core that already hosts a data mover
    /// - `InvalidRange` for a coordinate outside the mesh
    /// - `NoPhysicalLink` when neighbours share fewer than `num_links` links
    pub fn new(mesh: &MeshDevice, line: &[MeshCoordinate], mode: FabricMode, config: EdmConfig) -> Result<Self> {
        if line.len() < 2 {
            return Err(TesselError::fabric(format!(
                "fabric line needs at least two devices, got {}",
                line.len()
            )));
        }
        if config.num_links == 0 {
            return Err(TesselError::fabric("fabric needs at least one link"));
        }
        let mut stops = Vec::with_capacity(line.len());
        for &coord in line {
            let device = mesh.device_at(coord)?;
            if stops.iter().any(|s: &LineStop| s.device.id() == device.id()) {
                return Err(TesselError::fabric(format!(
                    "device {} appears twice on the fabric line",
                    device.id()
                )));
            }
            stops.push(LineStop {
                coord,
                device,
                forward: Vec::new(),
                backward: Vec::new(),
            });
        }

        let stats = Arc::new(FabricStats::default());
        let system = mesh.system();
        for i in 0..stops.len() - 1 {
            let (a, b) = (stops[i].device.id(), stops[i + 1].device.id());
            let links = system.ethernet_links(a, b);
            if links.len() < config.num_links as usize {
                return Err(TesselError::no_physical_link(format!(
                    "devices {a} and {b} share {} link(s), fabric needs {}",
                    links.len(),
                    config.num_links
                )));
            }
            for (link, (core_a, core_b)) in links.into_iter().take(config.num_links as usize).enumerate() {
                let link = link as u32;
                let fwd = Arc::new(EdmEndpoint::new(a, core_a, Direction::Forward, link, config, Arc::clone(&stats)));
                let bwd = Arc::new(EdmEndpoint::new(b, core_b, Direction::Backward, link, config, Arc::clone(&stats)));
                fwd.set_peer(&bwd);
                bwd.set_peer(&fwd);
                stops[i].forward.push(fwd);
                stops[i + 1].backward.push(bwd);
            }
        }
        for stop in &stops {
            for (fwd, bwd) in stop.forward.iter().zip(&stop.backward) {
                fwd.set_downstream(bwd);
                bwd.set_downstream(fwd);
            }
            for ep in stop.endpoints() {
                if stop.device.edm_at(ep.core()).is_some() {
                    return Err(TesselError::fabric(format!(
                        "ethernet core {} of device {} already hosts a data mover",
                        ep.core(),
                        stop.device.id()
                    )));
                }
            }
        }

        let fabric = Self {
            mode,
            config,
            stops,
            stats,
            timeout: mesh.config().runtime.dispatch_timeout,
        };
        for stop in &fabric.stops {
            for ep in stop.endpoints() {
                stop.device.register_edm(ep.core(), Arc::clone(ep));
            }
        }
        fabric.arm()?;
        info!(
            "{:?} fabric over {} device(s), {} link(s) per hop",
            mode,
            fabric.stops.len(),
            config.num_links
        );
        Ok(fabric)
    }

    /// Reset every termination mailbox so the data movers run when launched.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while packets are still in flight.
    pub fn arm(&self) -> Result<()> {
        if !self.stats.drained() {
            return Err(TesselError::invalid_state("cannot re-arm a fabric with packets in flight"));
        }
        self.signal_all(TerminationSignal::KeepRunning)
    }

    fn signal_all(&self, signal: TerminationSignal) -> Result<()> {
        for stop in &self.stops {
            for ep in stop.endpoints() {
                ep.signal(&stop.device, signal)?;
            }
        }
        Ok(())
    }

    fn stop(&self, line_index: usize) -> Result<&LineStop> {
        self.stops.get(line_index).ok_or_else(|| {
            TesselError::fabric(format!(
                "line index {line_index} outside fabric of {} device(s)",
                self.stops.len()
            ))
        })
    }

    /// Lifetime of the data movers.
    #[must_use]
    pub const fn mode(&self) -> FabricMode {
        self.mode
    }

    /// Data mover settings.
    #[must_use]
    pub const fn config(&self) -> &EdmConfig {
        &self.config
    }

    /// Devices on the line.
    #[must_use]
    pub fn line_size(&self) -> usize {
        self.stops.len()
    }

    /// Mesh coordinate of line position `line_index`.
    #[must_use]
    pub fn coord(&self, line_index: usize) -> Option<MeshCoordinate> {
        self.stops.get(line_index).map(|s| s.coord)
    }

    /// Line-wide packet counters.
    #[must_use]
    pub fn stats(&self) -> &FabricStats {
        &self.stats
    }

    /// Worker-side connection to the data mover sending `direction` from
    /// line position `line_index` over `link`.
    ///
    /// # Errors
    ///
    /// Returns `NoPhysicalLink` at the end of the line, `Fabric` for an
    /// unknown position or link.
    pub fn build_connection(&self, line_index: usize, direction: Direction, link: u32) -> Result<FabricConnection> {
        let stop = self.stop(line_index)?;
        if link >= self.config.num_links {
            return Err(TesselError::fabric(format!(
                "link {link} outside fabric of {} link(s)",
                self.config.num_links
            )));
        }
        let endpoints = match direction {
            Direction::Forward => &stop.forward,
            Direction::Backward => &stop.backward,
        };
        let ep = endpoints.get(link as usize).ok_or_else(|| {
            TesselError::no_physical_link(format!(
                "line position {line_index} (device {}) has no {direction:?} neighbour",
                stop.device.id()
            ))
        })?;
        Ok(FabricConnection::new(
            Arc::clone(ep),
            stop.device.noc(CoreType::Ethernet, ep.core()),
            self.timeout,
        ))
    }

    fn connection_args(&self, line_index: usize, direction: Direction, link: u32) -> Result<[u32; CONNECTION_ARGS]> {
        match self.build_connection(line_index, direction, link) {
            Ok(conn) => Ok(conn.to_args()),
            Err(TesselError::NoPhysicalLink { .. }) => Ok(FabricConnection::none_args()),
            Err(e) => Err(e),
        }
    }

    /// Add the data mover kernel on every ethernet core line position
    /// `line_index` uses.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for a persistent fabric, or the error from
    /// placing the kernel.
    pub fn add_edm_kernels(&self, program: &mut Program, line_index: usize) -> Result<()> {
        if self.mode == FabricMode::Persistent {
            return Err(TesselError::invalid_state(
                "persistent fabric data movers run in their own workload",
            ));
        }
        let stop = self.stop(line_index)?;
        program.add_kernel(Arc::new(EdmKernel), stop.eth_cores(), KernelConfig::ethernet())?;
        Ok(())
    }

    /// One data mover program per line device, for a persistent fabric.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for a transient fabric.
    pub fn fabric_workload(&self) -> Result<MeshWorkload> {
        if self.mode == FabricMode::Transient {
            return Err(TesselError::invalid_state(
                "transient fabric data movers belong in the worker program",
            ));
        }
        let mut workload = MeshWorkload::new();
        for (i, stop) in self.stops.iter().enumerate() {
            let mut program = Program::new(format!("edm_line_{i}"));
            program.add_kernel(Arc::new(EdmKernel), stop.eth_cores(), KernelConfig::ethernet())?;
            workload.add_program(program, LogicalDeviceRange::single(stop.coord))?;
        }
        Ok(workload)
    }

    /// Every data mover on the line as seen from `line_index`, ordered so
    /// that no termination packet needs a data mover already told to stop.
    ///
    /// Farther movers come first. Within one device, the movers on the
    /// route in from `line_index` come last, and movers on this device come
    /// last of all.
    ///
    /// # Errors
    ///
    /// Returns `Fabric` for an unknown position.
    pub fn termination_infos_farthest_to_nearest(&self, line_index: usize) -> Result<Vec<TerminationInfo>> {
        self.stop(line_index)?;
        let mut infos: Vec<(bool, TerminationInfo)> = Vec::new();
        for (j, stop) in self.stops.iter().enumerate() {
            let travel = if j < line_index {
                Direction::Backward
            } else {
                Direction::Forward
            };
            for ep in stop.endpoints() {
                let on_route = ep.link() == 0 && ep.direction() == travel.opposite();
                infos.push((
                    on_route,
                    TerminationInfo {
                        distance: j.abs_diff(line_index) as u32,
                        direction: travel,
                        noc: stop.device.noc(CoreType::Ethernet, ep.core()),
                        address: self.config.termination_address,
                    },
                ));
            }
        }
        infos.sort_by_key(|(on_route, t)| (Reverse(t.distance), *on_route));
        Ok(infos.into_iter().map(|(_, t)| t).collect())
    }

    /// Runtime args for the [`FabricWriter`] on `link` of line position
    /// `line_index`.
    ///
    /// Workers of link `l` are expected on logical core `(l, 0)`; the sync
    /// core is the link-0 worker. Only the line-index-0 sync worker carries
    /// termination targets.
    ///
    /// # Errors
    ///
    /// Returns `Fabric` for an unknown position or link, `InvalidState` for
    /// termination on a persistent fabric or without line sync.
    pub fn writer_args(&self, line_index: usize, link: u32, schedule: &WriterSchedule) -> Result<FabricWriterArgs> {
        let stop = self.stop(line_index)?;
        let line_size = self.stops.len() as u32;
        let terminations = if schedule.terminate && line_index == 0 && link == 0 {
            if self.mode == FabricMode::Persistent {
                return Err(TesselError::invalid_state(
                    "persistent fabric is terminated from the host",
                ));
            }
            if schedule.line_sync.is_none() {
                return Err(TesselError::invalid_state("worker termination requires line sync"));
            }
            self.termination_infos_farthest_to_nearest(line_index)?
        } else {
            Vec::new()
        };
        let line_sync = schedule.line_sync.map(|(core, address)| LineSyncArgs {
            noc: stop.device.noc(CoreType::Tensix, core),
            address,
            total_workers_per_sync: self.config.num_links * line_size,
            result_addr: schedule.result_addr,
        });
        Ok(FabricWriterArgs {
            dest_addr: schedule.dest_addr,
            payload_size: schedule.payload_size,
            dest_noc: stop.device.noc(CoreType::Tensix, schedule.dest_core),
            num_mcasts: schedule.num_mcasts,
            mcast_fwd_hops: line_size - line_index as u32 - 1,
            mcast_bwd_hops: line_index as u32,
            num_unicasts: schedule.num_unicasts,
            unicast_hops: schedule.unicast_hops,
            unicast_is_fwd: schedule.unicast_is_fwd,
            fwd_connection: self.connection_args(line_index, Direction::Forward, link)?,
            bwd_connection: self.connection_args(line_index, Direction::Backward, link)?,
            line_sync,
            line_index: line_index as u32,
            line_size,
            terminations,
        })
    }

    /// Signal every data mover from the host.
    ///
    /// A graceful signal first waits for every injected packet to retire.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the line does not drain.
    pub fn teardown_from_host(&self, signal: TerminationSignal) -> Result<()> {
        if signal == TerminationSignal::Graceful {
            let deadline = Instant::now() + self.timeout;
            while !self.stats.drained() {
                if Instant::now() >= deadline {
                    return Err(TesselError::timeout(
                        format!(
                            "fabric drain ({} injected, {} retired, {} dropped)",
                            self.stats.injected(),
                            self.stats.retired(),
                            self.stats.dropped()
                        ),
                        self.timeout,
                    ));
                }
                std::thread::sleep(DRAIN_POLL);
            }
        }
        self.signal_all(signal)?;
        debug!("Fabric signalled {signal:?} on {} device(s)", self.stops.len());
        Ok(())
    }

    /// Host teardown of a persistent fabric: wait for the workers, signal
    /// the data movers, then wait for them to exit.
    ///
    /// The stall group is reset afterwards, also on failure.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for a transient fabric, or the first error
    /// from the waits or the signal.
    pub fn teardown(
        &self,
        queue: &MeshCommandQueue<'_>,
        worker_group: &[SubDeviceId],
        fabric_group: &[SubDeviceId],
        signal: TerminationSignal,
    ) -> Result<()> {
        if self.mode == FabricMode::Transient {
            return Err(TesselError::invalid_state(
                "transient fabric is terminated by its workers",
            ));
        }
        let outcome = self.teardown_in_order(queue, worker_group, fabric_group, signal);
        queue.reset_stall_group();
        outcome
    }

    fn teardown_in_order(
        &self,
        queue: &MeshCommandQueue<'_>,
        worker_group: &[SubDeviceId],
        fabric_group: &[SubDeviceId],
        signal: TerminationSignal,
    ) -> Result<()> {
        queue.set_stall_group(worker_group)?;
        queue.finish()?;
        self.teardown_from_host(signal)?;
        queue.set_stall_group(fabric_group)?;
        queue.finish()
    }
}

impl Drop for EdmLineFabric {
    fn drop(&mut self) {
        for stop in &self.stops {
            for ep in stop.endpoints() {
                if let Err(e) = ep.signal(&stop.device, TerminationSignal::Immediate) {
                    warn!("Failed to stop EDM {} on device {}: {e}", ep.core(), stop.device.id());
                }
                if stop
                    .device
                    .edm_at(ep.core())
                    .is_some_and(|registered| Arc::ptr_eq(&registered, ep))
                {
                    stop.device.unregister_edm(ep.core());
                }
            }
        }
    }
}
