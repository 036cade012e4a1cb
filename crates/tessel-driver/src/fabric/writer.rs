//! Fabric writer worker kernel
//!
//! Each worker owns the forward and backward connections of one link on
//! its device and runs, in order:
//!
//! 1. start line sync (targets N, then 2N) if enabled
//! 2. `num_mcasts` multicasts: local write plus forward and backward
//!    multicast of the same slot, each send flushed
//! 3. `num_unicasts` unicasts into a second slot region
//! 4. finish line sync (3N), after which the sync core resets the semaphore
//! 5. termination writes, farthest EDM first, when it carries any
//!
//! Slot layout at `dest_addr` on the destination core:
//!
//! ```text
//! [0, line_size)            multicast slot of line index i
//! [line_size, 2*line_size)  unicast slot of line index i
//! ```

use tessel_chip::{CoreCoord, NocCommand, PacketHeader, RoutingCommand, TerminationSignal};

use super::connection::{FabricConnection, CONNECTION_ARGS};
use super::Direction;
use crate::error::{Result, TesselError};
use crate::program::{Kernel, KernelContext};

/// Line-sync barrier settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSyncArgs {
    /// NOC coordinate of the core holding the sync semaphore
    pub noc: CoreCoord,
    /// Semaphore address on that core
    pub address: u32,
    /// Increments per round: one per worker on the line
    pub total_workers_per_sync: u32,
    /// Where the sync core records the value it observed each round
    pub result_addr: u32,
}

/// EDM to terminate, as seen from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationInfo {
    /// Chips away from the worker; 0 is the worker's own chip
    pub distance: u32,
    /// Which way the termination packet travels
    pub direction: Direction,
    /// NOC coordinate of the EDM's ethernet core
    pub noc: CoreCoord,
    /// Termination mailbox address
    pub address: u32,
}

const TERMINATION_WORDS: usize = 5;

/// Runtime args of [`FabricWriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricWriterArgs {
    /// Base of the slot region on the destination core
    pub dest_addr: u32,
    /// Bytes per packet
    pub payload_size: u32,
    /// Destination core, same on every chip
    pub dest_noc: CoreCoord,
    /// Multicast iterations
    pub num_mcasts: u32,
    /// Chips reached forward by each multicast
    pub mcast_fwd_hops: u32,
    /// Chips reached backward by each multicast
    pub mcast_bwd_hops: u32,
    /// Unicast iterations
    pub num_unicasts: u32,
    /// Distance of the unicast target
    pub unicast_hops: u32,
    /// Unicast over the forward connection rather than the backward one
    pub unicast_is_fwd: bool,
    /// Forward connection args
    pub fwd_connection: [u32; CONNECTION_ARGS],
    /// Backward connection args
    pub bwd_connection: [u32; CONNECTION_ARGS],
    /// Line-sync barrier, if enabled
    pub line_sync: Option<LineSyncArgs>,
    /// Position of this worker's chip on the line
    pub line_index: u32,
    /// Chips on the line
    pub line_size: u32,
    /// EDMs this worker shuts down, farthest first
    pub terminations: Vec<TerminationInfo>,
}

impl FabricWriterArgs {
    /// Encode as runtime args.
    #[must_use]
    pub fn to_args(&self) -> Vec<u32> {
        let mut args = vec![
            self.dest_addr,
            self.payload_size,
            self.dest_noc.x,
            self.dest_noc.y,
            self.num_mcasts,
            self.mcast_fwd_hops,
            self.mcast_bwd_hops,
            self.num_unicasts,
            self.unicast_hops,
            u32::from(self.unicast_is_fwd),
        ];
        args.extend(self.fwd_connection);
        args.extend(self.bwd_connection);
        match self.line_sync {
            Some(s) => args.extend([1, s.noc.x, s.noc.y, s.address, s.total_workers_per_sync, s.result_addr]),
            None => args.extend([0; 6]),
        }
        args.extend([self.line_index, self.line_size, self.terminations.len() as u32]);
        for t in &self.terminations {
            args.extend([
                t.distance,
                u32::from(t.direction == Direction::Backward),
                t.noc.x,
                t.noc.y,
                t.address,
            ]);
        }
        args
    }

    /// Decode from runtime args.
    ///
    /// # Errors
    ///
    /// Returns `KernelArgument` if the args are short.
    pub fn from_args(args: &[u32]) -> Result<Self> {
        let mut it = args.iter().copied();
        let mut next = |what: &str| {
            it.next().ok_or_else(|| {
                TesselError::kernel_argument(format!("fabric writer arg {what} missing"))
            })
        };

        let dest_addr = next("dest_addr")?;
        let payload_size = next("payload_size")?;
        let dest_noc = CoreCoord::new(next("dest_noc_x")?, next("dest_noc_y")?);
        let num_mcasts = next("num_mcasts")?;
        let mcast_fwd_hops = next("mcast_fwd_hops")?;
        let mcast_bwd_hops = next("mcast_bwd_hops")?;
        let num_unicasts = next("num_unicasts")?;
        let unicast_hops = next("unicast_hops")?;
        let unicast_is_fwd = next("unicast_is_fwd")? != 0;
        let mut connection = |what: &str| -> Result<[u32; CONNECTION_ARGS]> {
            Ok([next(what)?, next(what)?, next(what)?])
        };
        let fwd_connection = connection("fwd_connection")?;
        let bwd_connection = connection("bwd_connection")?;
        let sync_enabled = next("line_sync")? != 0;
        let sync = LineSyncArgs {
            noc: CoreCoord::new(next("sync_noc_x")?, next("sync_noc_y")?),
            address: next("sync_addr")?,
            total_workers_per_sync: next("total_workers_per_sync")?,
            result_addr: next("result_addr")?,
        };
        let line_index = next("line_index")?;
        let line_size = next("line_size")?;
        let count = next("num_terminations")? as usize;
        let mut terminations = Vec::with_capacity(count);
        for _ in 0..count {
            let mut words = [0u32; TERMINATION_WORDS];
            for w in &mut words {
                *w = next("termination")?;
            }
            terminations.push(TerminationInfo {
                distance: words[0],
                direction: if words[1] == 0 {
                    Direction::Forward
                } else {
                    Direction::Backward
                },
                noc: CoreCoord::new(words[2], words[3]),
                address: words[4],
            });
        }

        Ok(Self {
            dest_addr,
            payload_size,
            dest_noc,
            num_mcasts,
            mcast_fwd_hops,
            mcast_bwd_hops,
            num_unicasts,
            unicast_hops,
            unicast_is_fwd,
            fwd_connection,
            bwd_connection,
            line_sync: sync_enabled.then_some(sync),
            line_index,
            line_size,
            terminations,
        })
    }

    /// Address of line index `i`'s multicast slot.
    #[must_use]
    pub const fn mcast_slot(&self, line_index: u32) -> u32 {
        self.dest_addr + line_index * self.payload_size
    }

    /// Address of line index `i`'s unicast slot.
    #[must_use]
    pub const fn unicast_slot(&self, line_index: u32) -> u32 {
        self.dest_addr + (self.line_size + line_index) * self.payload_size
    }
}

/// Deterministic payload bytes for one send.
#[must_use]
pub fn payload_pattern(line_index: u32, iteration: u32, len: u32) -> Vec<u8> {
    let seed = line_index.wrapping_mul(31).wrapping_add(iteration.wrapping_mul(7));
    (0..len).map(|k| (seed.wrapping_add(k) & 0xff) as u8).collect()
}

struct Connections {
    fwd: Option<FabricConnection>,
    bwd: Option<FabricConnection>,
}

impl Connections {
    fn get(&mut self, direction: Direction) -> Option<&mut FabricConnection> {
        match direction {
            Direction::Forward => self.fwd.as_mut(),
            Direction::Backward => self.bwd.as_mut(),
        }
    }

    /// Multicast `command` both ways, flushing after each send.
    fn mcast(&mut self, args: &FabricWriterArgs, command: &NocCommand) -> Result<()> {
        for (direction, hops) in [
            (Direction::Forward, args.mcast_fwd_hops),
            (Direction::Backward, args.mcast_bwd_hops),
        ] {
            if hops == 0 {
                continue;
            }
            let Some(conn) = self.get(direction) else {
                return Err(TesselError::fabric(format!(
                    "{direction:?} multicast of {hops} hop(s) without a {direction:?} connection"
                )));
            };
            conn.wait_for_empty_write_slot()?;
            conn.send_flush(PacketHeader::new(
                RoutingCommand::Multicast {
                    start_distance: 1,
                    range: hops,
                },
                command.clone(),
            ))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let fwd = self.fwd.as_mut().map_or(Ok(()), FabricConnection::close);
        let bwd = self.bwd.as_mut().map_or(Ok(()), FabricConnection::close);
        fwd.and(bwd)
    }
}

/// Worker kernel exercising a fabric line.
#[derive(Debug, Default)]
pub struct FabricWriter;

impl FabricWriter {
    fn line_sync(
        ctx: &KernelContext<'_>,
        args: &FabricWriterArgs,
        conns: &mut Connections,
        sync: &LineSyncArgs,
        round: u32,
    ) -> Result<()> {
        let inc = NocCommand::AtomicInc {
            noc_x: sync.noc.x,
            noc_y: sync.noc.y,
            address: sync.address,
            value: 1,
        };
        conns.mcast(args, &inc)?;
        ctx.noc_semaphore_inc(sync.noc, sync.address, 1)?;
        if ctx.noc_core() == sync.noc {
            let seen = ctx.semaphore_wait_min(sync.address, round * sync.total_workers_per_sync)?;
            ctx.write_u32(sync.result_addr + 4 * (round - 1), seen)?;
        }
        Ok(())
    }

    fn terminate(ctx: &KernelContext<'_>, conns: &mut Connections, targets: &[TerminationInfo]) -> Result<()> {
        let word = TerminationSignal::Graceful.word();
        for t in targets {
            if t.distance == 0 {
                ctx.noc_write(t.noc, t.address, &word.to_le_bytes())?;
                continue;
            }
            let conn = conns.get(t.direction).ok_or_else(|| {
                TesselError::fabric(format!(
                    "no {:?} connection to terminate EDM {} hop(s) away",
                    t.direction, t.distance
                ))
            })?;
            conn.send_flush(PacketHeader::new(
                RoutingCommand::Unicast { hops: t.distance },
                NocCommand::UnicastWrite {
                    noc_x: t.noc.x,
                    noc_y: t.noc.y,
                    address: t.address,
                    payload: word.to_le_bytes().to_vec(),
                },
            ))?;
        }
        Ok(())
    }
}

impl Kernel for FabricWriter {
    fn name(&self) -> &str {
        "fabric_writer"
    }

    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let args = FabricWriterArgs::from_args(ctx.args())?;
        let is_sync_core = args.line_sync.is_some_and(|s| s.noc == ctx.noc_core());
        if !args.terminations.is_empty() && !is_sync_core {
            return Err(TesselError::invalid_state(
                "only the line-sync core may terminate the fabric",
            ));
        }
        if args.num_unicasts > 0 && args.unicast_hops == 0 {
            return Err(TesselError::kernel_argument("unicast needs at least one hop"));
        }

        let mut conns = Connections {
            fwd: ctx.fabric_connection(&args.fwd_connection)?,
            bwd: ctx.fabric_connection(&args.bwd_connection)?,
        };
        if let Some(c) = conns.fwd.as_mut() {
            c.open()?;
        }
        if let Some(c) = conns.bwd.as_mut() {
            c.open()?;
        }

        if let Some(sync) = &args.line_sync {
            Self::line_sync(ctx, &args, &mut conns, sync, 1)?;
            Self::line_sync(ctx, &args, &mut conns, sync, 2)?;
        }

        let slot = args.mcast_slot(args.line_index);
        for i in 0..args.num_mcasts {
            let payload = payload_pattern(args.line_index, i, args.payload_size);
            ctx.noc_write(args.dest_noc, slot, &payload)?;
            conns.mcast(
                &args,
                &NocCommand::UnicastWrite {
                    noc_x: args.dest_noc.x,
                    noc_y: args.dest_noc.y,
                    address: slot,
                    payload,
                },
            )?;
        }

        let slot = args.unicast_slot(args.line_index);
        let direction = if args.unicast_is_fwd {
            Direction::Forward
        } else {
            Direction::Backward
        };
        for i in 0..args.num_unicasts {
            let conn = conns.get(direction).ok_or_else(|| {
                TesselError::fabric(format!("{direction:?} unicast without a {direction:?} connection"))
            })?;
            conn.wait_for_empty_write_slot()?;
            conn.send_flush(PacketHeader::new(
                RoutingCommand::Unicast {
                    hops: args.unicast_hops,
                },
                NocCommand::UnicastWrite {
                    noc_x: args.dest_noc.x,
                    noc_y: args.dest_noc.y,
                    address: slot,
                    payload: payload_pattern(args.line_index, args.num_mcasts + i, args.payload_size),
                },
            ))?;
        }

        if let Some(sync) = &args.line_sync {
            Self::line_sync(ctx, &args, &mut conns, sync, 3)?;
            if is_sync_core {
                ctx.semaphore_set(sync.address, 0)?;
            }
        }

        Self::terminate(ctx, &mut conns, &args.terminations)?;
        conns.close()
    }
}
