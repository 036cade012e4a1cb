// SPDX-License-Identifier: AGPL-3.0-only

//! Ethernet data mover endpoints
//!
//! ```text
//!  device i                                   device i+1
//!  worker ─► F_i.sender ══ethernet══► B_i+1.receiver ─► deliver on i+1
//!                                          │ forward
//!                                          ▼
//!                                     F_i+1.sender ══► B_i+2.receiver ...
//! ```
//!
//! Each endpoint owns two fixed-depth slot rings: the sender channel fed by
//! a local worker or by the opposite-facing endpoint relaying a packet, and
//! the receiver channel fed by its ethernet peer. A full ring stalls the
//! writer; that is the only back-pressure.
//!
//! Every packet injected by a worker is counted once and retired once, line
//! wide. Graceful termination waits for the two counts to meet.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use tessel_chip::{CoreCoord, CoreType, PacketHeader, RoutingCommand, TerminationSignal};
use tracing::{debug, warn};

use super::{Direction, EdmConfig};
use crate::device::Device;
use crate::error::{Result, TesselError};
use crate::program::{Kernel, KernelContext};
use crate::system::PhysicalDeviceId;

const IDLE_BACKOFF: Duration = Duration::from_micros(50);

/// Line-wide packet accounting.
#[derive(Debug, Default)]
pub struct FabricStats {
    injected: AtomicU64,
    retired: AtomicU64,
    dropped: AtomicU64,
}

impl FabricStats {
    /// Packets workers have handed to the fabric.
    #[must_use]
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Acquire)
    }

    /// Packets that reached their last hop or were dropped.
    #[must_use]
    pub fn retired(&self) -> u64 {
        self.retired.load(Ordering::Acquire)
    }

    /// Packets discarded by immediate termination or misrouting.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    /// Nothing in flight anywhere on the line.
    #[must_use]
    pub fn drained(&self) -> bool {
        self.retired() >= self.injected()
    }

    pub(crate) fn inject(&self) {
        self.injected.fetch_add(1, Ordering::AcqRel);
    }

    fn retire(&self, n: u64) {
        self.retired.fetch_add(n, Ordering::AcqRel);
    }

    fn drop_packets(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::AcqRel);
        self.retire(n);
    }
}

#[derive(Debug)]
pub(crate) struct Packet {
    header: PacketHeader,
    from_worker: bool,
}

/// One direction of one link on one device.
#[derive(Debug)]
pub(crate) struct EdmEndpoint {
    device: PhysicalDeviceId,
    core: CoreCoord,
    direction: Direction,
    link: u32,
    config: EdmConfig,
    sender: (Sender<Packet>, Receiver<Packet>),
    receiver: (Sender<PacketHeader>, Receiver<PacketHeader>),
    peer: OnceCell<Weak<EdmEndpoint>>,
    downstream: OnceCell<Weak<EdmEndpoint>>,
    acked: Mutex<u64>,
    ack_changed: Condvar,
    connection_open: AtomicBool,
    stats: Arc<FabricStats>,
}

impl EdmEndpoint {
    pub(crate) fn new(
        device: PhysicalDeviceId,
        core: CoreCoord,
        direction: Direction,
        link: u32,
        config: EdmConfig,
        stats: Arc<FabricStats>,
    ) -> Self {
        let depth = config.num_buffers_per_channel.max(1);
        Self {
            device,
            core,
            direction,
            link,
            config,
            sender: channel::bounded(depth),
            receiver: channel::bounded(depth),
            peer: OnceCell::new(),
            downstream: OnceCell::new(),
            acked: Mutex::new(0),
            ack_changed: Condvar::new(),
            connection_open: AtomicBool::new(false),
            stats,
        }
    }

    pub(crate) const fn device(&self) -> PhysicalDeviceId {
        self.device
    }

    /// Logical ethernet core the endpoint runs on.
    pub(crate) const fn core(&self) -> CoreCoord {
        self.core
    }

    pub(crate) const fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) const fn link(&self) -> u32 {
        self.link
    }

    pub(crate) const fn config(&self) -> &EdmConfig {
        &self.config
    }

    pub(crate) fn set_peer(&self, peer: &Arc<Self>) {
        if self.peer.set(Arc::downgrade(peer)).is_err() {
            warn!("EDM {} on device {} already has a peer", self.core, self.device);
        }
    }

    pub(crate) fn set_downstream(&self, downstream: &Arc<Self>) {
        if self.downstream.set(Arc::downgrade(downstream)).is_err() {
            warn!("EDM {} on device {} already has a downstream", self.core, self.device);
        }
    }

    fn peer(&self) -> Option<Arc<Self>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    fn downstream(&self) -> Option<Arc<Self>> {
        self.downstream.get().and_then(Weak::upgrade)
    }

    /// Write a termination signal into the endpoint's L1 mailbox.
    pub(crate) fn signal(&self, device: &Device, signal: TerminationSignal) -> Result<()> {
        device.write_l1_u32(
            device.noc(CoreType::Ethernet, self.core),
            self.config.termination_address,
            signal.word(),
        )
    }

    // -- worker side ----------------------------------------------------

    /// Claim the worker channel, waiting up to `timeout` for another
    /// connection to close. Returns the ack count at open.
    pub(crate) fn claim(&self, timeout: Duration) -> Result<u64> {
        let deadline = Instant::now() + timeout;
        while self
            .connection_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if Instant::now() >= deadline {
                return Err(TesselError::timeout(
                    format!("opening EDM on device {} core {}", self.device, self.core),
                    timeout,
                ));
            }
            std::thread::sleep(IDLE_BACKOFF);
        }
        Ok(*self.acked.lock())
    }

    pub(crate) fn unclaim(&self) {
        self.connection_open.store(false, Ordering::Release);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection_open.load(Ordering::Acquire)
    }

    pub(crate) fn has_free_slot(&self) -> bool {
        !self.sender.0.is_full()
    }

    /// Hand a worker packet to the sender channel, blocking while it is full.
    pub(crate) fn push_from_worker(&self, header: PacketHeader, timeout: Duration) -> Result<()> {
        self.sender
            .0
            .send_timeout(
                Packet {
                    header,
                    from_worker: true,
                },
                timeout,
            )
            .map_err(|_| {
                TesselError::timeout(
                    format!("no free slot on EDM device {} core {}", self.device, self.core),
                    timeout,
                )
            })?;
        self.stats.inject();
        Ok(())
    }

    /// Wait until `target` worker packets have left the sender channel.
    pub(crate) fn wait_acked(&self, target: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut acked = self.acked.lock();
        while *acked < target {
            if self.ack_changed.wait_until(&mut acked, deadline).timed_out() && *acked < target {
                return Err(TesselError::timeout(
                    format!(
                        "flush on EDM device {} core {} ({} of {target} acked)",
                        self.device, self.core, *acked
                    ),
                    timeout,
                ));
            }
        }
        Ok(())
    }

    fn ack(&self) {
        *self.acked.lock() += 1;
        self.ack_changed.notify_all();
    }

    // -- EDM side -------------------------------------------------------

    fn is_idle(&self) -> bool {
        self.sender.1.is_empty() && self.receiver.1.is_empty()
    }

    /// Move a sender-channel packet onto the link. Gives the packet back if
    /// the peer's receiver is full.
    fn transmit(&self, ctx: &KernelContext<'_>, packet: Packet) -> Result<Option<Packet>> {
        if matches!(packet.header.routing, RoutingCommand::Local) {
            ctx.apply(&packet.header.command)?;
            self.stats.retire(1);
            if packet.from_worker {
                self.ack();
            }
            return Ok(None);
        }
        let Some(peer) = self.peer() else {
            warn!(
                "EDM device {} core {} has no peer, dropping packet",
                self.device, self.core
            );
            self.stats.drop_packets(1);
            if packet.from_worker {
                self.ack();
            }
            return Ok(None);
        };
        match peer.receiver.0.try_send(packet.header) {
            Ok(()) => {
                if packet.from_worker {
                    self.ack();
                }
                Ok(None)
            }
            Err(TrySendError::Full(header) | TrySendError::Disconnected(header)) => Ok(Some(Packet {
                header,
                from_worker: packet.from_worker,
            })),
        }
    }

    /// Pass a packet on to the next chip. Gives it back if the downstream
    /// sender is full.
    fn relay(&self, header: PacketHeader) -> Option<PacketHeader> {
        let Some(next) = self.downstream() else {
            warn!(
                "Packet routed past the end of the line at device {} core {}, dropping",
                self.device, self.core
            );
            self.stats.drop_packets(1);
            return None;
        };
        match next.sender.0.try_send(Packet {
            header,
            from_worker: false,
        }) {
            Ok(()) => None,
            Err(TrySendError::Full(p) | TrySendError::Disconnected(p)) => Some(p.header),
        }
    }

    /// Run the data mover until terminated.
    fn service(&self, ctx: &KernelContext<'_>) -> Result<()> {
        let mut outbound: Option<Packet> = None;
        let mut relaying: Option<PacketHeader> = None;
        let mut delivered = 0u64;

        loop {
            let signal = TerminationSignal::from_word(ctx.read_u32(self.config.termination_address)?);

            if signal == TerminationSignal::Immediate {
                let pending = u64::from(outbound.is_some()) + u64::from(relaying.is_some());
                let queued = (self.sender.1.try_iter().count() + self.receiver.1.try_iter().count()) as u64;
                let lost = pending + queued;
                if lost > 0 {
                    warn!(
                        "EDM device {} core {} terminated immediately, dropping {lost} packet(s)",
                        self.device, self.core
                    );
                    self.stats.drop_packets(lost);
                }
                debug!(
                    "EDM device {} core {} exits (immediate) after {delivered} delivery(ies)",
                    self.device, self.core
                );
                return Ok(());
            }

            let mut progressed = false;

            if outbound.is_none() {
                outbound = self.sender.1.try_recv().ok();
            }
            if let Some(packet) = outbound.take() {
                outbound = self.transmit(ctx, packet)?;
                progressed |= outbound.is_none();
            }

            if relaying.is_none() {
                if let Ok(mut header) = self.receiver.1.try_recv() {
                    progressed = true;
                    let hop = header.on_arrival();
                    if hop.deliver {
                        ctx.apply(&header.command)?;
                        delivered += 1;
                    }
                    if hop.forward {
                        relaying = Some(header);
                    } else {
                        self.stats.retire(1);
                    }
                }
            }
            if let Some(header) = relaying.take() {
                relaying = self.relay(header);
                progressed |= relaying.is_none();
            }

            if signal == TerminationSignal::Graceful
                && outbound.is_none()
                && relaying.is_none()
                && self.is_idle()
                && !self.is_connected()
                && self.stats.drained()
            {
                debug!(
                    "EDM device {} core {} exits (graceful) after {delivered} delivery(ies)",
                    self.device, self.core
                );
                return Ok(());
            }

            if !progressed {
                std::thread::sleep(IDLE_BACKOFF);
            }
        }
    }
}

/// Data mover kernel for ethernet cores.
///
/// Finds the endpoint registered on its core and services it until the
/// termination mailbox says otherwise.
#[derive(Debug, Default)]
pub struct EdmKernel;

impl Kernel for EdmKernel {
    fn name(&self) -> &str {
        "edm"
    }

    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        ctx.edm_endpoint()?.service(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_chip::NocCommand;

    fn endpoint(stats: &Arc<FabricStats>) -> EdmEndpoint {
        EdmEndpoint::new(
            PhysicalDeviceId(0),
            CoreCoord::new(0, 0),
            Direction::Forward,
            0,
            EdmConfig {
                num_buffers_per_channel: 2,
                ..EdmConfig::default()
            },
            Arc::clone(stats),
        )
    }

    fn header() -> PacketHeader {
        PacketHeader::new(
            RoutingCommand::Unicast { hops: 1 },
            NocCommand::AtomicInc {
                noc_x: 1,
                noc_y: 2,
                address: 0x2_0000,
                value: 1,
            },
        )
    }

    #[test]
    fn full_ring_applies_back_pressure() {
        let stats = Arc::new(FabricStats::default());
        let ep = endpoint(&stats);
        let t = Duration::from_millis(20);
        ep.push_from_worker(header(), t).unwrap();
        ep.push_from_worker(header(), t).unwrap();
        assert!(!ep.has_free_slot());
        assert!(matches!(
            ep.push_from_worker(header(), t),
            Err(TesselError::Timeout { .. })
        ));
        assert_eq!(stats.injected(), 2);
        assert!(!stats.drained());
    }

    #[test]
    fn links_are_set_once() {
        let stats = Arc::new(FabricStats::default());
        let ep = endpoint(&stats);
        let first = Arc::new(endpoint(&stats));
        let second = Arc::new(endpoint(&stats));
        ep.set_peer(&first);
        ep.set_peer(&second);
        assert!(ep.peer().is_some_and(|p| Arc::ptr_eq(&p, &first)));
        ep.set_downstream(&second);
        ep.set_downstream(&first);
        assert!(ep.downstream().is_some_and(|d| Arc::ptr_eq(&d, &second)));
    }

    #[test]
    fn connection_is_exclusive() {
        let stats = Arc::new(FabricStats::default());
        let ep = endpoint(&stats);
        ep.claim(Duration::from_millis(10)).unwrap();
        assert!(ep.claim(Duration::from_millis(10)).is_err());
        ep.unclaim();
        ep.claim(Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn flush_waits_for_acks() {
        let stats = Arc::new(FabricStats::default());
        let ep = endpoint(&stats);
        assert!(ep.wait_acked(1, Duration::from_millis(10)).is_err());
        ep.ack();
        ep.wait_acked(1, Duration::from_millis(10)).unwrap();
    }
}
