//! Trace capture and replay
//!
//! ```text
//!   begin ──► Capturing ──end──► Sealed ──replay*──► Sealed ──release──► (slot freed)
//! ```
//!
//! A capture is a live run: launches still execute, and their descriptors
//! are recorded per device. Sealing encodes each device's stream into a
//! blob written to the device's trace region in DRAM; replay hands the whole
//! blob to the dispatcher as one command, so no host-side compile or
//! runtime-arg work happens per replay.
//!
//! Blob layout (little endian):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | magic `TRCE` |
//! | 4 | 4 | record count |
//! | 8 + 7n | 1 | opcode (1 = launch) |
//! | 9 + 7n | 2 | lane |
//! | 11 + 7n | 4 | launch slot |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::device::Device;
use crate::error::{Result, TesselError};
use crate::program::LaunchMessage;
use crate::sub_device::SubDeviceManager;
use crate::system::PhysicalDeviceId;

const MAGIC: u32 = u32::from_le_bytes(*b"TRCE");
const OP_LAUNCH: u8 = 1;
pub(crate) const HEADER_LEN: usize = 8;
const RECORD_LEN: usize = 7;

/// Handle to a trace: arena slot plus the generation it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshTraceId {
    index: u32,
    generation: u32,
}

impl fmt::Display for MeshTraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// One device's sealed command stream.
#[derive(Debug)]
pub(crate) struct DeviceTrace {
    blob: Bytes,
    launches: Vec<LaunchMessage>,
    lane_counts: Vec<u64>,
    region_address: u32,
}

impl DeviceTrace {
    /// Encode a recorded stream.
    fn encode(records: Vec<(usize, LaunchMessage)>, region_address: u32) -> Self {
        let mut blob = BytesMut::with_capacity(HEADER_LEN + records.len() * RECORD_LEN);
        blob.put_u32_le(MAGIC);
        blob.put_u32_le(records.len() as u32);

        let mut launches = Vec::with_capacity(records.len());
        let mut lane_counts = Vec::new();
        for (slot, (lane, launch)) in records.into_iter().enumerate() {
            blob.put_u8(OP_LAUNCH);
            blob.put_u16_le(lane as u16);
            blob.put_u32_le(slot as u32);
            if lane_counts.len() <= lane {
                lane_counts.resize(lane + 1, 0);
            }
            lane_counts[lane] += 1;
            launches.push(launch);
        }

        Self {
            blob: blob.freeze(),
            launches,
            lane_counts,
            region_address,
        }
    }

    /// Bytes the stream occupies in the trace region: records plus the
    /// runtime args they carry.
    fn footprint(records: &[(usize, LaunchMessage)]) -> usize {
        HEADER_LEN
            + records
                .iter()
                .map(|(_, l)| RECORD_LEN + l.args.encoded_len())
                .sum::<usize>()
    }

    /// `(lane, slot)` records in issue order.
    pub(crate) fn decode(&self) -> Result<Vec<(usize, usize)>> {
        let corrupt = |what: &str| TesselError::invalid_state(format!("trace blob {what}"));
        let mut buf = self.blob.clone();
        if buf.remaining() < HEADER_LEN || buf.get_u32_le() != MAGIC {
            return Err(corrupt("has a bad header"));
        }
        let count = buf.get_u32_le() as usize;
        if buf.remaining() != count * RECORD_LEN {
            return Err(corrupt("is truncated"));
        }
        (0..count)
            .map(|_| {
                let op = buf.get_u8();
                let lane = buf.get_u16_le() as usize;
                let slot = buf.get_u32_le() as usize;
                if op == OP_LAUNCH {
                    Ok((lane, slot))
                } else {
                    Err(corrupt(&format!("has unknown opcode {op}")))
                }
            })
            .collect()
    }

    pub(crate) fn launch(&self, slot: usize) -> Option<&LaunchMessage> {
        self.launches.get(slot)
    }

    /// Launches per lane.
    pub(crate) fn lane_counts(&self) -> &[u64] {
        &self.lane_counts
    }

    pub(crate) fn num_launches(&self) -> usize {
        self.launches.len()
    }

    /// Store the blob at the trace region address, bank 0.
    fn store(&self, device: &Device) -> Result<()> {
        device.write_dram(0, self.region_address, &self.blob)
    }
}

/// Live capture on one queue.
#[derive(Debug)]
pub(crate) struct TraceCapture {
    id: MeshTraceId,
    manager: Arc<SubDeviceManager>,
    streams: BTreeMap<PhysicalDeviceId, Vec<(usize, LaunchMessage)>>,
}

impl TraceCapture {
    pub(crate) const fn id(&self) -> MeshTraceId {
        self.id
    }

    /// Record one launch on one device.
    pub(crate) fn record(&mut self, device: PhysicalDeviceId, lane: usize, launch: LaunchMessage) {
        self.streams.entry(device).or_default().push((lane, launch));
    }

    /// Largest per-device footprint, which is what the region must hold.
    pub(crate) fn footprint(&self) -> usize {
        self.streams
            .values()
            .map(|s| DeviceTrace::footprint(s))
            .max()
            .unwrap_or(HEADER_LEN)
    }

    /// Encode every stream at `region_address` and store it on its device.
    pub(crate) fn seal(
        self,
        queue: usize,
        region_address: u32,
        region_size: u32,
        devices: &[Arc<Device>],
    ) -> Result<MeshTrace> {
        let mut sealed = Vec::with_capacity(self.streams.len());
        for (id, records) in self.streams {
            let trace = DeviceTrace::encode(records, region_address);
            if let Some(device) = devices.iter().find(|d| d.id() == id) {
                trace.store(device)?;
            }
            sealed.push((id, Arc::new(trace)));
        }
        Ok(MeshTrace {
            queue,
            manager: self.manager,
            region_address,
            region_size,
            devices: sealed,
        })
    }
}

/// Sealed trace for a whole mesh.
#[derive(Debug)]
pub(crate) struct MeshTrace {
    queue: usize,
    manager: Arc<SubDeviceManager>,
    region_address: u32,
    region_size: u32,
    devices: Vec<(PhysicalDeviceId, Arc<DeviceTrace>)>,
}

impl MeshTrace {
    pub(crate) const fn queue(&self) -> usize {
        self.queue
    }

    /// Manager loaded when the trace was captured.
    pub(crate) fn manager(&self) -> &Arc<SubDeviceManager> {
        &self.manager
    }

    pub(crate) const fn region_address(&self) -> u32 {
        self.region_address
    }

    pub(crate) const fn region_size(&self) -> u32 {
        self.region_size
    }

    /// Per-device streams.
    pub(crate) fn devices(&self) -> &[(PhysicalDeviceId, Arc<DeviceTrace>)] {
        &self.devices
    }
}

#[derive(Debug)]
enum Slot {
    Vacant,
    Capturing { queue: usize },
    Sealed(Arc<MeshTrace>),
}

#[derive(Debug)]
struct Entry {
    generation: u32,
    slot: Slot,
}

/// Generation-checked store of traces.
///
/// A handle stays valid until its trace is released; after that the slot's
/// generation moves on, so stale handles are rejected even once the slot is
/// reused.
#[derive(Debug, Default)]
pub(crate) struct TraceArena {
    entries: Vec<Entry>,
    free: Vec<u32>,
}

impl TraceArena {
    fn entry(&self, id: MeshTraceId) -> Result<&Entry> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.generation == id.generation && !matches!(e.slot, Slot::Vacant))
            .ok_or_else(|| TesselError::InvalidTraceHandle { id: id.to_string() })
    }

    /// Reserve a slot for a capture on `queue`.
    pub(crate) fn begin(&mut self, queue: usize, manager: Arc<SubDeviceManager>) -> TraceCapture {
        let index = match self.free.pop() {
            Some(index) => {
                self.entries[index as usize].slot = Slot::Capturing { queue };
                index
            }
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    slot: Slot::Capturing { queue },
                });
                self.entries.len() as u32 - 1
            }
        };
        let id = MeshTraceId {
            index,
            generation: self.entries[index as usize].generation,
        };
        TraceCapture {
            id,
            manager,
            streams: BTreeMap::new(),
        }
    }

    /// Store a sealed trace in its reserved slot.
    pub(crate) fn seal(&mut self, id: MeshTraceId, trace: MeshTrace) -> Result<()> {
        self.entry(id)?;
        self.entries[id.index as usize].slot = Slot::Sealed(Arc::new(trace));
        Ok(())
    }

    /// Sealed trace for `id`.
    pub(crate) fn get(&self, id: MeshTraceId) -> Result<Arc<MeshTrace>> {
        match &self.entry(id)?.slot {
            Slot::Sealed(trace) => Ok(Arc::clone(trace)),
            Slot::Capturing { queue } => Err(TesselError::invalid_state(format!(
                "trace {id} is still being captured on queue {queue}"
            ))),
            Slot::Vacant => Err(TesselError::InvalidTraceHandle { id: id.to_string() }),
        }
    }

    /// Free the slot, returning what it held.
    pub(crate) fn release(&mut self, id: MeshTraceId) -> Result<Option<Arc<MeshTrace>>> {
        self.entry(id)?;
        let entry = &mut self.entries[id.index as usize];
        let previous = std::mem::replace(&mut entry.slot, Slot::Vacant);
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        Ok(match previous {
            Slot::Sealed(trace) => Some(trace),
            Slot::Capturing { .. } | Slot::Vacant => None,
        })
    }

    /// Every sealed trace, for teardown.
    pub(crate) fn drain(&mut self) -> Vec<Arc<MeshTrace>> {
        let mut out = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Slot::Sealed(trace) = std::mem::replace(&mut entry.slot, Slot::Vacant) {
                out.push(trace);
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        out
    }

    /// Number of live (capturing or sealed) traces.
    pub(crate) fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !matches!(e.slot, Slot::Vacant))
            .count()
    }
}
