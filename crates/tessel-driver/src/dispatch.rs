// SPDX-License-Identifier: AGPL-3.0-only

//! Per-device command dispatch
//!
//! ```text
//!  host ──► inbox ──► dispatcher thread ──┬──► lane 0 thread (sub-device 0)
//!           (FIFO)    launches, traces,   ├──► lane 1 thread (sub-device 1)
//!                     writes, reconfigure └──► ...
//! ```
//!
//! One dispatcher per (device, command queue) drains commands in issue
//! order. Launches are handed to the lane of the sub-device that owns the
//! program's cores; lanes run their launches FIFO, so sub-devices make
//! progress independently. A buffer write first waits for the lanes of its
//! stall group, then touches memory.
//!
//! The host keeps issue counters, the device side keeps completion
//! counters; every host wait is "completed >= issued at the time of the
//! call". Kernel errors and hung waits are recorded on the device through
//! the [`Watcher`] and surface on the next host wait.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::buffer::MemTarget;
use crate::device::{Device, Watcher};
use crate::error::{Result, TesselError};
use crate::program::{self, LaunchMessage};
use crate::trace::DeviceTrace;

const HOST_POLL: Duration = Duration::from_millis(20);

pub(crate) enum DispatchCommand {
    Launch {
        lane: usize,
        launch: LaunchMessage,
    },
    ExecuteTrace(Arc<DeviceTrace>),
    Write {
        wait: Vec<(usize, u64)>,
        writes: Vec<(MemTarget, Vec<u8>)>,
    },
    Reconfigure {
        lanes: usize,
        done: Sender<()>,
    },
}

#[derive(Debug)]
struct Completion {
    processed: u64,
    lanes: Vec<u64>,
}

/// Device-side completion counters, shared by the dispatcher and its lanes.
#[derive(Debug)]
struct Progress {
    state: Mutex<Completion>,
    changed: Condvar,
}

impl Progress {
    fn new(lanes: usize) -> Self {
        Self {
            state: Mutex::new(Completion {
                processed: 0,
                lanes: vec![0; lanes],
            }),
            changed: Condvar::new(),
        }
    }

    fn mark_processed(&self) {
        self.state.lock().processed += 1;
        self.changed.notify_all();
    }

    fn lane_done(&self, lane: usize) {
        if let Some(done) = self.state.lock().lanes.get_mut(lane) {
            *done += 1;
        }
        self.changed.notify_all();
    }

    fn reset_lanes(&self, lanes: usize) {
        self.state.lock().lanes = vec![0; lanes];
        self.changed.notify_all();
    }

    fn lanes_reached(state: &Completion, targets: &[(usize, u64)]) -> bool {
        targets
            .iter()
            .all(|&(lane, target)| state.lanes.get(lane).copied().unwrap_or(0) >= target)
    }

    /// Block until `ready`, the device faults, or `timeout` passes.
    fn wait_until(
        &self,
        device: &Device,
        watcher: &Watcher,
        timeout: Duration,
        what: &str,
        ready: impl Fn(&Completion) -> bool,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            watcher.check(device)?;
            if ready(&state) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                drop(state);
                watcher.record(
                    device,
                    &format!("{what} did not complete within {}ms", timeout.as_millis()),
                );
                return watcher.check(device);
            }
            self.changed.wait_for(&mut state, (deadline - now).min(HOST_POLL));
        }
    }
}

#[derive(Debug, Default)]
struct Issued {
    commands: u64,
    lanes: Vec<u64>,
}

#[derive(Debug)]
struct HostSide {
    inbox: Option<Sender<DispatchCommand>>,
    issued: Issued,
}

/// Host handle for one (device, queue) dispatcher.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    device: Arc<Device>,
    queue: usize,
    host: Mutex<HostSide>,
    progress: Arc<Progress>,
    thread: Mutex<Option<JoinHandle<()>>>,
    watcher: Watcher,
    timeout: Duration,
}

impl Dispatcher {
    pub(crate) fn spawn(
        device: Arc<Device>,
        queue: usize,
        lanes: usize,
        watcher: Watcher,
        timeout: Duration,
    ) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let progress = Arc::new(Progress::new(lanes));
        let worker = DispatchLoop {
            device: Arc::clone(&device),
            queue,
            progress: Arc::clone(&progress),
            watcher: watcher.clone(),
            timeout,
        };
        let handle = std::thread::Builder::new()
            .name(format!("dispatch-d{}-q{queue}", device.id()))
            .spawn(move || worker.run(rx, lanes))
            .map_err(|e| TesselError::invalid_state(format!("failed to spawn dispatcher: {e}")))?;

        debug!("Dispatcher for device {} queue {queue} up with {lanes} lane(s)", device.id());

        Ok(Self {
            device,
            queue,
            host: Mutex::new(HostSide {
                inbox: Some(tx),
                issued: Issued {
                    commands: 0,
                    lanes: vec![0; lanes],
                },
            }),
            progress,
            thread: Mutex::new(Some(handle)),
            watcher,
            timeout,
        })
    }

    fn submit(&self, host: &mut HostSide, command: DispatchCommand) -> Result<()> {
        let inbox = host.inbox.as_ref().ok_or_else(|| {
            TesselError::invalid_state(format!(
                "dispatcher for device {} queue {} is shut down",
                self.device.id(),
                self.queue
            ))
        })?;
        inbox.send(command).map_err(|_| {
            TesselError::invalid_state(format!(
                "dispatcher for device {} queue {} exited",
                self.device.id(),
                self.queue
            ))
        })?;
        host.issued.commands += 1;
        Ok(())
    }

    /// Queue a program launch on a sub-device lane.
    pub(crate) fn launch(&self, lane: usize, launch: LaunchMessage) -> Result<()> {
        self.watcher.check(&self.device)?;
        let mut host = self.host.lock();
        if lane >= host.issued.lanes.len() {
            return Err(TesselError::invalid_sub_device(format!(
                "lane {lane} not active on device {}",
                self.device.id()
            )));
        }
        self.submit(&mut host, DispatchCommand::Launch { lane, launch })?;
        host.issued.lanes[lane] += 1;
        Ok(())
    }

    /// Queue a whole device-resident trace.
    pub(crate) fn execute_trace(&self, trace: Arc<DeviceTrace>) -> Result<()> {
        self.watcher.check(&self.device)?;
        let mut host = self.host.lock();
        let counts = trace.lane_counts().to_vec();
        if counts.len() > host.issued.lanes.len() {
            return Err(TesselError::invalid_state(format!(
                "trace uses {} sub-devices, {} active on device {}",
                counts.len(),
                host.issued.lanes.len(),
                self.device.id()
            )));
        }
        self.submit(&mut host, DispatchCommand::ExecuteTrace(trace))?;
        for (lane, n) in counts.into_iter().enumerate() {
            host.issued.lanes[lane] += n;
        }
        Ok(())
    }

    /// Queue memory writes ordered after the given lanes' issued work.
    pub(crate) fn write(&self, stall_lanes: &[usize], writes: Vec<(MemTarget, Vec<u8>)>) -> Result<()> {
        self.watcher.check(&self.device)?;
        let mut host = self.host.lock();
        let wait = stall_lanes
            .iter()
            .filter_map(|&l| host.issued.lanes.get(l).map(|&n| (l, n)))
            .collect();
        self.submit(&mut host, DispatchCommand::Write { wait, writes })
    }

    /// Swap the lane set; callers drain first.
    pub(crate) fn reconfigure(&self, lanes: usize) -> Result<()> {
        let (done_tx, done_rx) = channel::bounded(1);
        {
            let mut host = self.host.lock();
            self.submit(&mut host, DispatchCommand::Reconfigure { lanes, done: done_tx })?;
            host.issued.lanes = vec![0; lanes];
        }
        done_rx.recv_timeout(self.timeout).map_err(|_| {
            TesselError::timeout(
                format!("reconfiguring lanes on device {}", self.device.id()),
                self.timeout,
            )
        })
    }

    /// Wait until every command issued so far has been dispatched.
    pub(crate) fn wait_dispatched(&self) -> Result<()> {
        let target = self.host.lock().issued.commands;
        self.progress.wait_until(
            &self.device,
            &self.watcher,
            self.timeout,
            "command dispatch",
            |s| s.processed >= target,
        )
    }

    /// Wait until the given lanes finish everything issued to them so far.
    pub(crate) fn wait_lanes(&self, lanes: &[usize]) -> Result<()> {
        let targets: Vec<(usize, u64)> = {
            let host = self.host.lock();
            lanes
                .iter()
                .filter_map(|&l| host.issued.lanes.get(l).map(|&n| (l, n)))
                .collect()
        };
        self.wait_dispatched()?;
        self.progress.wait_until(
            &self.device,
            &self.watcher,
            self.timeout,
            "sub-device completion",
            |s| Progress::lanes_reached(s, &targets),
        )
    }

    /// Number of lanes currently configured.
    pub(crate) fn num_lanes(&self) -> usize {
        self.host.lock().issued.lanes.len()
    }

    /// Stop accepting commands and join the dispatcher.
    pub(crate) fn shutdown(&self) {
        self.host.lock().inbox = None;
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                self.watcher
                    .record(&self.device, &format!("dispatcher for queue {} panicked", self.queue));
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Lane {
    tx: Sender<LaunchMessage>,
    handle: JoinHandle<()>,
}

struct DispatchLoop {
    device: Arc<Device>,
    queue: usize,
    progress: Arc<Progress>,
    watcher: Watcher,
    timeout: Duration,
}

impl DispatchLoop {
    fn run(self, rx: Receiver<DispatchCommand>, lanes: usize) {
        let mut active = self.spawn_lanes(lanes);
        while let Ok(command) = rx.recv() {
            match command {
                DispatchCommand::Launch { lane, launch } => self.forward(&active, lane, launch),
                DispatchCommand::ExecuteTrace(trace) => match trace.decode() {
                    Ok(records) => {
                        trace!(
                            "Device {} queue {}: replaying {} launch(es)",
                            self.device.id(),
                            self.queue,
                            records.len()
                        );
                        for (lane, slot) in records {
                            match trace.launch(slot) {
                                Some(launch) => self.forward(&active, lane, launch.clone()),
                                None => self.watcher.record(
                                    &self.device,
                                    &format!("trace references missing launch slot {slot}"),
                                ),
                            }
                        }
                    }
                    Err(e) => self.watcher.record(&self.device, &format!("corrupt trace: {e}")),
                },
                DispatchCommand::Write { wait, writes } => {
                    let waited = self.progress.wait_until(
                        &self.device,
                        &self.watcher,
                        self.timeout,
                        "write barrier",
                        |s| Progress::lanes_reached(s, &wait),
                    );
                    if waited.is_ok() {
                        for (target, data) in writes {
                            if let Err(e) = target.write(&self.device, &data) {
                                self.watcher.record(&self.device, &format!("buffer write failed: {e}"));
                                break;
                            }
                        }
                    }
                }
                DispatchCommand::Reconfigure { lanes, done } => {
                    Self::join_lanes(std::mem::take(&mut active));
                    self.progress.reset_lanes(lanes);
                    active = self.spawn_lanes(lanes);
                    if done.send(()).is_err() {
                        warn!(
                            "Device {} queue {}: reconfigured {lanes} lane(s) after the host stopped waiting",
                            self.device.id(),
                            self.queue
                        );
                    }
                }
            }
            self.progress.mark_processed();
        }
        Self::join_lanes(active);
        debug!("Dispatcher for device {} queue {} stopped", self.device.id(), self.queue);
    }

    fn forward(&self, lanes: &[Lane], lane: usize, launch: LaunchMessage) {
        match lanes.get(lane) {
            Some(l) if l.tx.send(launch).is_ok() => {}
            _ => self
                .watcher
                .record(&self.device, &format!("launch for inactive lane {lane}")),
        }
    }

    fn spawn_lanes(&self, n: usize) -> Vec<Lane> {
        let mut lanes = Vec::with_capacity(n);
        for index in 0..n {
            let (tx, rx) = channel::unbounded::<LaunchMessage>();
            let device = Arc::clone(&self.device);
            let progress = Arc::clone(&self.progress);
            let watcher = self.watcher.clone();
            let timeout = self.timeout;
            let spawned = std::thread::Builder::new()
                .name(format!("lane-d{}-q{}-s{index}", self.device.id(), self.queue))
                .spawn(move || {
                    while let Ok(launch) = rx.recv() {
                        if device.fault().is_none() {
                            if let Err(e) = program::execute(&device, &launch, timeout) {
                                watcher.record(&device, &e.to_string());
                            }
                        }
                        progress.lane_done(index);
                    }
                });
            match spawned {
                Ok(handle) => lanes.push(Lane { tx, handle }),
                Err(e) => {
                    self.watcher
                        .record(&self.device, &format!("failed to spawn lane {index}: {e}"));
                    break;
                }
            }
        }
        lanes
    }

    fn join_lanes(lanes: Vec<Lane>) {
        for Lane { tx, handle } in lanes {
            drop(tx);
            if handle.join().is_err() {
                warn!("Lane thread panicked before it was joined");
            }
        }
    }
}
