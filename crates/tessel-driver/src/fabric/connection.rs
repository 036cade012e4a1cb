//! Worker-side fabric connections
//!
//! A connection is built on the host, travels to the worker as three
//! runtime args, and is reopened in the kernel. Only one connection may be
//! open on an EDM's worker channel at a time.

use std::sync::Arc;
use std::time::Duration;

use tessel_chip::{CoreCoord, CoreType, PacketHeader};

use super::edm::EdmEndpoint;
use super::Direction;
use crate::device::Device;
use crate::error::{Result, TesselError};
use crate::system::PhysicalDeviceId;

/// Runtime-arg words a connection occupies.
pub const CONNECTION_ARGS: usize = 3;

/// Handle to one EDM's worker channel.
#[derive(Debug)]
pub struct FabricConnection {
    endpoint: Arc<EdmEndpoint>,
    noc: CoreCoord,
    timeout: Duration,
    state: Option<OpenState>,
}

#[derive(Debug, Clone, Copy)]
struct OpenState {
    acked_at_open: u64,
    sent: u64,
}

impl FabricConnection {
    pub(crate) fn new(endpoint: Arc<EdmEndpoint>, noc: CoreCoord, timeout: Duration) -> Self {
        Self {
            endpoint,
            noc,
            timeout,
            state: None,
        }
    }

    /// Args meaning "no connection in this direction".
    #[must_use]
    pub const fn none_args() -> [u32; CONNECTION_ARGS] {
        [0; CONNECTION_ARGS]
    }

    /// Encode as runtime args: valid flag and the EDM's NOC coordinate.
    #[must_use]
    pub const fn to_args(&self) -> [u32; CONNECTION_ARGS] {
        [1, self.noc.x, self.noc.y]
    }

    /// Reopen a connection from its args on `device`.
    ///
    /// Returns `None` for [`none_args`](Self::none_args).
    ///
    /// # Errors
    ///
    /// Returns `KernelArgument` if the args are short or do not name an
    /// ethernet core with a registered EDM.
    pub fn from_args(device: &Device, args: &[u32], timeout: Duration) -> Result<Option<Self>> {
        let &[valid, noc_x, noc_y, ..] = args else {
            return Err(TesselError::kernel_argument(format!(
                "fabric connection needs {CONNECTION_ARGS} args, got {}",
                args.len()
            )));
        };
        if valid == 0 {
            return Ok(None);
        }
        let noc = CoreCoord::new(noc_x, noc_y);
        let core = match device.chip().logical_from_noc(noc) {
            Some((CoreType::Ethernet, core)) => core,
            _ => {
                return Err(TesselError::kernel_argument(format!(
                    "NOC {noc} on device {} is not an ethernet core",
                    device.id()
                )))
            }
        };
        let endpoint = device.edm_at(core).ok_or_else(|| {
            TesselError::kernel_argument(format!(
                "no EDM on device {} ethernet core {core}",
                device.id()
            ))
        })?;
        Ok(Some(Self::new(endpoint, noc, timeout)))
    }

    /// Device the EDM lives on.
    #[must_use]
    pub fn device(&self) -> PhysicalDeviceId {
        self.endpoint.device()
    }

    /// Direction the EDM sends in.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.endpoint.direction()
    }

    /// Link index of the EDM.
    #[must_use]
    pub fn link(&self) -> u32 {
        self.endpoint.link()
    }

    /// Largest payload one packet may carry.
    #[must_use]
    pub fn max_payload(&self) -> u32 {
        self.endpoint.config().packet_payload_size
    }

    /// Whether this handle holds the channel.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Take the worker channel, waiting for a previous holder to close.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the channel stays busy.
    pub fn open(&mut self) -> Result<()> {
        if self.state.is_none() {
            let acked_at_open = self.endpoint.claim(self.timeout)?;
            self.state = Some(OpenState { acked_at_open, sent: 0 });
        }
        Ok(())
    }

    fn open_state(&mut self) -> Result<&mut OpenState> {
        let device = self.endpoint.device();
        self.state.as_mut().ok_or_else(|| {
            TesselError::fabric(format!("connection to EDM on device {device} is not open"))
        })
    }

    /// Block until the sender ring has a free slot.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the ring stays full.
    pub fn wait_for_empty_write_slot(&self) -> Result<()> {
        let deadline = std::time::Instant::now() + self.timeout;
        while !self.endpoint.has_free_slot() {
            if std::time::Instant::now() >= deadline {
                return Err(TesselError::timeout(
                    format!("free slot on EDM device {}", self.endpoint.device()),
                    self.timeout,
                ));
            }
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Queue a packet without waiting for it to leave the ring.
    ///
    /// # Errors
    ///
    /// Returns `Fabric` if the connection is closed or the payload is too
    /// large, `Timeout` if no slot frees up.
    pub fn send(&mut self, header: PacketHeader) -> Result<()> {
        let max = self.max_payload() as usize;
        if header.command.payload_len() > max {
            return Err(TesselError::fabric(format!(
                "payload of {} bytes exceeds packet size {max}",
                header.command.payload_len()
            )));
        }
        self.open_state()?;
        self.endpoint.push_from_worker(header, self.timeout)?;
        self.open_state()?.sent += 1;
        Ok(())
    }

    /// Send and wait until the EDM has moved the packet out of its slot.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus `Timeout` if the flush stalls.
    pub fn send_flush(&mut self, header: PacketHeader) -> Result<()> {
        self.send(header)?;
        self.flush()
    }

    /// Wait until every packet sent on this connection has left the ring.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the EDM stops draining.
    pub fn flush(&mut self) -> Result<()> {
        let state = *self.open_state()?;
        self.endpoint
            .wait_acked(state.acked_at_open + state.sent, self.timeout)
    }

    /// Flush and release the worker channel.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the final flush stalls; the channel is released
    /// either way.
    pub fn close(&mut self) -> Result<()> {
        if self.state.is_none() {
            return Ok(());
        }
        let flushed = self.flush();
        self.state = None;
        self.endpoint.unclaim();
        flushed
    }
}

impl Drop for FabricConnection {
    fn drop(&mut self) {
        if self.state.take().is_some() {
            self.endpoint.unclaim();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{EdmConfig, FabricStats};
    use tessel_chip::{ChipSpec, NocCommand, RoutingCommand};

    fn setup() -> (Device, CoreCoord) {
        let device = Device::new(PhysicalDeviceId(3), ChipSpec::WORMHOLE);
        let core = CoreCoord::new(2, 0);
        let ep = Arc::new(EdmEndpoint::new(
            device.id(),
            core,
            Direction::Forward,
            0,
            EdmConfig::default(),
            Arc::new(FabricStats::default()),
        ));
        device.register_edm(core, ep);
        (device, core)
    }

    #[test]
    fn args_round_trip_through_device() {
        let (device, core) = setup();
        let noc = device.noc(CoreType::Ethernet, core);
        let t = Duration::from_millis(10);
        let conn = FabricConnection::new(device.edm_at(core).unwrap(), noc, t);
        let back = FabricConnection::from_args(&device, &conn.to_args(), t)
            .unwrap()
            .unwrap();
        assert_eq!(back.device(), PhysicalDeviceId(3));
        assert!(FabricConnection::from_args(&device, &FabricConnection::none_args(), t)
            .unwrap()
            .is_none());

        let worker = device.noc(CoreType::Tensix, CoreCoord::new(0, 0));
        assert!(FabricConnection::from_args(&device, &[1, worker.x, worker.y], t).is_err());
        assert!(FabricConnection::from_args(&device, &[1], t).is_err());
    }

    #[test]
    fn send_requires_open_and_fitting_payload() {
        let (device, core) = setup();
        let noc = device.noc(CoreType::Ethernet, core);
        let mut conn = FabricConnection::new(device.edm_at(core).unwrap(), noc, Duration::from_millis(10));
        let small = PacketHeader::new(
            RoutingCommand::Unicast { hops: 1 },
            NocCommand::AtomicInc { noc_x: 1, noc_y: 2, address: 0x2_0000, value: 1 },
        );
        assert!(conn.send(small.clone()).is_err());
        conn.open().unwrap();
        conn.send(small).unwrap();

        let big = PacketHeader::new(
            RoutingCommand::Unicast { hops: 1 },
            NocCommand::UnicastWrite { noc_x: 1, noc_y: 2, address: 0x2_0000, payload: vec![0; 8192] },
        );
        assert!(matches!(conn.send(big), Err(TesselError::Fabric { .. })));

        // Nothing drains the ring, so the flush in close times out but still
        // releases the channel.
        assert!(conn.close().is_err());
        let mut other = FabricConnection::new(device.edm_at(core).unwrap(), noc, Duration::from_millis(10));
        other.open().unwrap();
    }
}
