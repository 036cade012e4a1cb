//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use tessel_driver::prelude::*;

/// Fresh eight-chip system.
pub fn t3000() -> Arc<SystemMesh> {
    Arc::new(SystemMesh::new(SystemConfig::T3000))
}

/// Open `shape` on a fresh eight-chip system.
pub fn open_mesh(shape: MeshShape) -> MeshDevice {
    open_mesh_with(shape, RuntimeConfig::default())
}

/// Open `shape` on a fresh eight-chip system with `runtime`.
pub fn open_mesh_with(shape: MeshShape, runtime: RuntimeConfig) -> MeshDevice {
    MeshDevice::open(t3000(), MeshDeviceConfig::new(shape).with_runtime(runtime)).expect("open mesh")
}

/// Range from `(r0, c0)` to `(r1, c1)` inclusive.
pub fn range(r0: u32, c0: u32, r1: u32, c1: u32) -> LogicalDeviceRange {
    LogicalDeviceRange::new(MeshCoordinate::new(r0, c0), MeshCoordinate::new(r1, c1)).expect("ordered range")
}

/// Replicated DRAM buffer of `size` bytes.
pub fn dram_buffer(mesh: &MeshDevice, size: u32, page_size: u32) -> MeshBuffer {
    MeshBuffer::create(
        mesh,
        DeviceLocalBufferConfig {
            page_size,
            buffer_type: BufferType::Dram,
        },
        GlobalBufferConfig::Replicated { size },
    )
    .expect("allocate buffer")
}

/// `n` copies of `value` as little-endian f32 bytes.
pub fn f32_bytes(value: f32, n: usize) -> Vec<u8> {
    std::iter::repeat(value).take(n).flat_map(f32::to_le_bytes).collect()
}

/// Decode little-endian f32s.
pub fn to_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|w| f32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}
