//! Mesh device runtime for multi-chip accelerator systems.
//!
//! A host opens a logical grid of chips as one [`MeshDevice`], binds
//! programs to sub-grids with a [`MeshWorkload`] and drives them through a
//! [`MeshCommandQueue`]. Sequences of enqueues can be captured once into a
//! device-resident trace and replayed without host work per replay. Cores
//! can be partitioned into sub-devices so the host waits on only part of the
//! chip, and an EDM fabric moves packets along lines of chips.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`system`] | Physical chips and their ethernet links |
//! | [`mesh`] | Open, reshape and close meshes; trace and sub-device control |
//! | [`command_queue`] | Workload enqueue, buffer I/O, stall groups |
//! | [`workload`] | Programs bound to logical device ranges |
//! | [`program`] | Kernels, runtime args, per-device compilation |
//! | [`trace`] | Trace ids, capture and the trace arena |
//! | [`sub_device`] | Core partitions and their managers |
//! | [`buffer`] / [`semaphore`] | Same-address mesh allocations |
//! | [`fabric`] | EDM line fabric, worker connections, writer kernel |
//! | [`kernels`] | Stock kernels used by tests and the CLI |
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessel_driver::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let system = Arc::new(SystemMesh::new(SystemConfig::T3000));
//! let mut mesh = MeshDevice::open(system, MeshDeviceConfig::new(MeshShape::new(2, 4)))?;
//! mesh.reshape(MeshShape::line(8))?;
//! let trace = mesh.begin_trace_capture(0)?;
//! // enqueue workloads on mesh.command_queue(0)? here
//! mesh.end_trace_capture(0, trace)?;
//! mesh.replay_trace(0, trace, true)?;
//! mesh.release_trace(trace)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod buffer;
pub mod command_queue;
pub mod config;
pub mod device;
mod dispatch;
mod error;
pub mod fabric;
pub mod kernels;
mod memory;
pub mod mesh;
pub mod program;
pub mod semaphore;
pub mod sub_device;
pub mod system;
pub mod trace;
pub mod workload;

pub use buffer::{BufferType, DeviceLocalBufferConfig, GlobalBufferConfig, InterleavedBuffer, MeshBuffer};
pub use command_queue::MeshCommandQueue;
pub use config::{
    seed_from_env, DispatchMode, MeshDeviceConfig, MeshTopology, RuntimeConfig, SystemConfig,
    MAX_COMMAND_QUEUES,
};
pub use device::Device;
pub use error::{Result, TesselError};
pub use fabric::{
    Direction, EdmConfig, EdmLineFabric, FabricConnection, FabricMode, FabricStats, FabricWriter,
    FabricWriterArgs, WriterSchedule,
};
pub use mesh::MeshDevice;
pub use program::{Kernel, KernelConfig, KernelContext, KernelHandle, Program};
pub use semaphore::GlobalSemaphore;
pub use sub_device::{SubDevice, SubDeviceId, SubDeviceManager, SubDeviceManagerId};
pub use system::{PhysicalDeviceId, SystemMesh};
pub use trace::MeshTraceId;
pub use workload::MeshWorkload;

/// Chip model types (re-exported from tessel-chip).
pub mod chip {
    pub use tessel_chip::{
        boustrophedon, ChipSpec, CoreCoord, CoreRange, CoreRangeSet, CoreType, LogicalDeviceRange,
        MeshCoordinate, MeshShape, NocCommand, PacketHeader, RoutingCommand, TerminationSignal,
    };
}

/// Commonly used types.
pub mod prelude {
    pub use crate::chip::{CoreCoord, CoreRange, CoreRangeSet, CoreType, LogicalDeviceRange, MeshCoordinate, MeshShape};
    pub use crate::{
        BufferType, DeviceLocalBufferConfig, GlobalBufferConfig, GlobalSemaphore, Kernel, KernelConfig,
        KernelContext, MeshBuffer, MeshCommandQueue, MeshDevice, MeshDeviceConfig, MeshTopology,
        MeshTraceId, MeshWorkload, Program, Result, RuntimeConfig, SubDevice, SubDeviceId,
        SubDeviceManagerId, SystemConfig, SystemMesh, TesselError,
    };
}
