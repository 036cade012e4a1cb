//! Fabric packet header model.
//!
//! A packet carries a routing command (where along the line it lands) and a
//! NOC command (what it does once it lands). Distance is counted in chips
//! from the sender: the first neighbour is distance 1.

/// Where a packet is delivered, relative to the sending chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingCommand {
    /// Applied on the sending chip; never crosses a link.
    Local,
    /// Delivered only on the chip `hops` links away.
    Unicast {
        /// Links to traverse, at least 1.
        hops: u32,
    },
    /// Delivered on every chip from `start_distance` to
    /// `start_distance + range - 1` links away.
    Multicast {
        /// First chip to deliver on.
        start_distance: u32,
        /// Number of consecutive chips delivered on.
        range: u32,
    },
}

impl RoutingCommand {
    /// Farthest chip the packet reaches, in links.
    #[must_use]
    pub const fn reach(&self) -> u32 {
        match *self {
            Self::Local => 0,
            Self::Unicast { hops } => hops,
            Self::Multicast { start_distance, range } => start_distance + range.saturating_sub(1),
        }
    }
}

/// What the packet does on a chip it is delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NocCommand {
    /// Write `payload` to L1 of the core at NOC `(noc_x, noc_y)`.
    UnicastWrite {
        /// Destination NOC column.
        noc_x: u32,
        /// Destination NOC row.
        noc_y: u32,
        /// Destination L1 address.
        address: u32,
        /// Bytes to write.
        payload: Vec<u8>,
    },
    /// Atomically add `value` to the L1 word at `address`.
    AtomicInc {
        /// Destination NOC column.
        noc_x: u32,
        /// Destination NOC row.
        noc_y: u32,
        /// Destination L1 address.
        address: u32,
        /// Increment.
        value: u32,
    },
}

impl NocCommand {
    /// Payload size in bytes (zero for atomics).
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::UnicastWrite { payload, .. } => payload.len(),
            Self::AtomicInc { .. } => 0,
        }
    }
}

/// What a chip does with an arriving packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopAction {
    /// Apply the NOC command on this chip.
    pub deliver: bool,
    /// Pass the packet on to the next chip.
    pub forward: bool,
}

/// Header of a fabric packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Routing.
    pub routing: RoutingCommand,
    /// Command applied where the packet lands.
    pub command: NocCommand,
    distance: u32,
}

impl PacketHeader {
    /// New header, not yet sent.
    #[must_use]
    pub const fn new(routing: RoutingCommand, command: NocCommand) -> Self {
        Self { routing, command, distance: 0 }
    }

    /// Links travelled so far.
    #[must_use]
    pub const fn distance(&self) -> u32 {
        self.distance
    }

    /// Record arrival on the next chip and decide what to do there.
    pub fn on_arrival(&mut self) -> HopAction {
        self.distance += 1;
        let d = self.distance;
        match self.routing {
            RoutingCommand::Local => HopAction { deliver: false, forward: false },
            RoutingCommand::Unicast { hops } => HopAction {
                deliver: d == hops,
                forward: d < hops,
            },
            RoutingCommand::Multicast { start_distance, range } => {
                let last = start_distance + range.saturating_sub(1);
                HopAction {
                    deliver: range > 0 && d >= start_distance && d <= last,
                    forward: d < last,
                }
            }
        }
    }
}

/// Termination signal written to an EDM's termination word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TerminationSignal {
    /// Keep servicing channels.
    KeepRunning = 0,
    /// Drain in-flight traffic, wait for connections to close, then exit.
    Graceful = 1,
    /// Exit now, dropping anything in flight.
    Immediate = 2,
}

impl TerminationSignal {
    /// Decode an L1 word; unknown values read as `KeepRunning`.
    #[must_use]
    pub const fn from_word(word: u32) -> Self {
        match word {
            1 => Self::Graceful,
            2 => Self::Immediate,
            _ => Self::KeepRunning,
        }
    }

    /// Encoded L1 word.
    #[must_use]
    pub const fn word(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inc() -> NocCommand {
        NocCommand::AtomicInc { noc_x: 1, noc_y: 2, address: 0x2_0000, value: 1 }
    }

    #[test]
    fn unicast_lands_on_last_hop_only() {
        let mut h = PacketHeader::new(RoutingCommand::Unicast { hops: 3 }, inc());
        let actions: Vec<_> = (0..3).map(|_| h.on_arrival()).collect();
        assert_eq!(actions[0], HopAction { deliver: false, forward: true });
        assert_eq!(actions[1], HopAction { deliver: false, forward: true });
        assert_eq!(actions[2], HopAction { deliver: true, forward: false });
    }

    #[test]
    fn multicast_delivers_along_range() {
        let mut h = PacketHeader::new(
            RoutingCommand::Multicast { start_distance: 1, range: 3 },
            inc(),
        );
        let delivered: Vec<_> = (0..3).map(|_| h.on_arrival()).collect();
        assert!(delivered.iter().all(|a| a.deliver));
        assert!(delivered[1].forward);
        assert!(!delivered[2].forward);
        assert_eq!(h.routing.reach(), 3);
    }

    #[test]
    fn multicast_can_skip_near_chips() {
        let mut h = PacketHeader::new(
            RoutingCommand::Multicast { start_distance: 2, range: 1 },
            inc(),
        );
        assert_eq!(h.on_arrival(), HopAction { deliver: false, forward: true });
        assert_eq!(h.on_arrival(), HopAction { deliver: true, forward: false });
    }

    #[test]
    fn termination_word_encoding() {
        for s in [
            TerminationSignal::KeepRunning,
            TerminationSignal::Graceful,
            TerminationSignal::Immediate,
        ] {
            assert_eq!(TerminationSignal::from_word(s.word()), s);
        }
        assert_eq!(TerminationSignal::from_word(77), TerminationSignal::KeepRunning);
    }
}
