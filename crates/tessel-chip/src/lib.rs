//! Chip model for the tessel mesh runtime.
//!
//! This crate has **no dependencies** and **no device access**. It is a pure
//! model of one accelerator chip and of the coordinate systems used to
//! address a mesh of them: core grids, the L1/DRAM memory map, logical mesh
//! shapes and ranges, and the header format carried by fabric packets.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`coord`] | Core coordinates, ranges and range sets |
//! | [`chip`] | Worker grid, ethernet cores, memory map, NOC translation |
//! | [`mesh`] | Mesh shapes, coordinates, device ranges, serpentine walk |
//! | [`packet`] | Fabric routing/NOC commands, termination signal |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod chip;
pub mod coord;
pub mod mesh;
pub mod packet;

pub use chip::ChipSpec;
pub use coord::{CoreCoord, CoreRange, CoreRangeSet, CoreType};
pub use mesh::{boustrophedon, LogicalDeviceRange, MeshCoordinate, MeshShape};
pub use packet::{HopAction, NocCommand, PacketHeader, RoutingCommand, TerminationSignal};
