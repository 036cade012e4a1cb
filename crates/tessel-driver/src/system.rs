// SPDX-License-Identifier: AGPL-3.0-only

//! Physical device registry
//!
//! The [`SystemMesh`] owns every chip in the cluster and knows how they are
//! wired. Chips sit on a physical grid; each pair of grid neighbours is
//! joined by `links_per_neighbor` ethernet links. Ethernet channels are
//! assigned per direction:
//!
//! ```text
//! channel = direction * 4 + link      direction: E=0 W=1 S=2 N=3
//! ```
//!
//! The registry is built once and shared by `Arc` with every mesh device
//! opened on it; there is no process-wide instance.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tessel_chip::{boustrophedon, ChipSpec, CoreCoord, MeshCoordinate, MeshShape};
use tracing::{debug, info, warn};

use crate::config::SystemConfig;
use crate::device::Device;
use crate::error::{Result, TesselError};

const CHANNELS_PER_DIRECTION: u32 = 4;

/// Physical chip id, stable for the lifetime of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalDeviceId(pub u32);

impl fmt::Display for PhysicalDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    East,
    West,
    South,
    North,
}

impl Direction {
    const fn channel_base(self) -> u32 {
        (self as u32) * CHANNELS_PER_DIRECTION
    }

    const fn opposite(self) -> Self {
        match self {
            Self::East => Self::West,
            Self::West => Self::East,
            Self::South => Self::North,
            Self::North => Self::South,
        }
    }
}

/// Registry of physical chips and their ethernet adjacency.
#[derive(Debug)]
pub struct SystemMesh {
    config: SystemConfig,
    devices: Vec<Arc<Device>>,
    links: HashMap<(PhysicalDeviceId, CoreCoord), (PhysicalDeviceId, CoreCoord)>,
}

impl SystemMesh {
    /// Build the system described by `config`.
    pub fn new(config: SystemConfig) -> Self {
        let mut config = config;
        if config.links_per_neighbor > CHANNELS_PER_DIRECTION {
            warn!(
                "{} links per neighbour requested, clamping to {CHANNELS_PER_DIRECTION}",
                config.links_per_neighbor
            );
            config.links_per_neighbor = CHANNELS_PER_DIRECTION;
        }

        let devices: Vec<Arc<Device>> = (0..config.rows * config.cols)
            .map(|i| Arc::new(Device::new(PhysicalDeviceId(i), config.chip)))
            .collect();

        let mut links = HashMap::new();
        let id_at = |r: u32, c: u32| PhysicalDeviceId(r * config.cols + c);
        for r in 0..config.rows {
            for c in 0..config.cols {
                let here = id_at(r, c);
                let mut neighbours = Vec::new();
                if c + 1 < config.cols {
                    neighbours.push((Direction::East, id_at(r, c + 1)));
                }
                if r + 1 < config.rows {
                    neighbours.push((Direction::South, id_at(r + 1, c)));
                }
                for (dir, there) in neighbours {
                    for link in 0..config.links_per_neighbor {
                        let a = CoreCoord::new(dir.channel_base() + link, 0);
                        let b = CoreCoord::new(dir.opposite().channel_base() + link, 0);
                        links.insert((here, a), (there, b));
                        links.insert((there, b), (here, a));
                    }
                }
            }
        }

        info!(
            "System mesh: {} devices as {}x{}, {} link(s) per neighbour pair",
            devices.len(),
            config.rows,
            config.cols,
            config.links_per_neighbor
        );

        Self {
            config,
            devices,
            links,
        }
    }

    /// Configuration the system was built from.
    #[must_use]
    pub const fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Chip geometry shared by every device.
    #[must_use]
    pub const fn chip(&self) -> &ChipSpec {
        &self.config.chip
    }

    /// Number of physical devices.
    #[must_use]
    pub fn get_num_available_devices(&self) -> usize {
        self.devices.len()
    }

    /// Every device, ordered by id.
    #[must_use]
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Look up a device.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` for an unknown id.
    pub fn device(&self, id: PhysicalDeviceId) -> Result<Arc<Device>> {
        self.devices
            .get(id.0 as usize)
            .cloned()
            .ok_or(TesselError::DeviceNotFound { id: id.0 })
    }

    /// Physical grid position of a device.
    #[must_use]
    pub const fn position(&self, id: PhysicalDeviceId) -> (u32, u32) {
        (id.0 / self.config.cols, id.0 % self.config.cols)
    }

    const fn id_at(&self, row: u32, col: u32) -> PhysicalDeviceId {
        PhysicalDeviceId(row * self.config.cols + col)
    }

    /// Device and ethernet core at the far end of `eth_core`'s link.
    #[must_use]
    pub fn get_connected_neighbor(
        &self,
        device: PhysicalDeviceId,
        eth_core: CoreCoord,
    ) -> Option<(PhysicalDeviceId, CoreCoord)> {
        self.links.get(&(device, eth_core)).copied()
    }

    /// Link endpoints `(core on a, core on b)` between two devices, by link index.
    #[must_use]
    pub fn ethernet_links(&self, a: PhysicalDeviceId, b: PhysicalDeviceId) -> Vec<(CoreCoord, CoreCoord)> {
        let mut found: Vec<(CoreCoord, CoreCoord)> = self
            .links
            .iter()
            .filter(|((from, _), (to, _))| *from == a && *to == b)
            .map(|((_, ca), (_, cb))| (*ca, *cb))
            .collect();
        found.sort_by_key(|(ca, _)| ca.x);
        found
    }

    /// Whether two devices share at least one ethernet link.
    #[must_use]
    pub fn are_connected(&self, a: PhysicalDeviceId, b: PhysicalDeviceId) -> bool {
        let (ra, ca) = self.position(a);
        let (rb, cb) = self.position(b);
        self.config.links_per_neighbor > 0 && ra.abs_diff(rb) + ca.abs_diff(cb) == 1
    }

    /// Every device along the physical serpentine line.
    #[must_use]
    pub fn line_order(&self) -> Vec<PhysicalDeviceId> {
        boustrophedon(self.config.rows, self.config.cols)
            .into_iter()
            .map(|(r, c)| self.id_at(r, c))
            .collect()
    }

    fn block(&self, shape: MeshShape, row: u32, col: u32, transposed: bool) -> Option<Vec<PhysicalDeviceId>> {
        let (rows, cols) = if transposed {
            (shape.cols(), shape.rows())
        } else {
            (shape.rows(), shape.cols())
        };
        if row + rows > self.config.rows || col + cols > self.config.cols {
            return None;
        }
        Some(
            shape
                .coords()
                .map(|c| {
                    if transposed {
                        self.id_at(row + c.col(), col + c.row())
                    } else {
                        self.id_at(row + c.row(), col + c.col())
                    }
                })
                .collect(),
        )
    }

    /// Map a logical shape at an optional offset to physical devices, row-major.
    ///
    /// Grid shapes map onto the physical block at the offset, or onto its
    /// transpose when only that fits. Line shapes at the origin follow the
    /// serpentine line. Either way logical neighbours are physical neighbours.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the shape needs more devices than exist,
    /// leaves the physical grid at the offset, or the offset rank differs.
    pub fn get_mapped_physical_device_ids(
        &self,
        shape: MeshShape,
        offset: Option<MeshCoordinate>,
    ) -> Result<Vec<PhysicalDeviceId>> {
        let n = shape.num_devices();
        let total = self.devices.len();
        if n == 0 {
            return Err(TesselError::invalid_shape(format!("{shape} is empty")));
        }
        if n > total {
            return Err(TesselError::invalid_shape(format!(
                "{shape} needs {n} devices, system has {total}"
            )));
        }
        if let Some(off) = offset {
            if off.rank() != shape.rank() {
                return Err(TesselError::invalid_shape(format!(
                    "offset {off} has rank {}, shape {shape} has rank {}",
                    off.rank(),
                    shape.rank()
                )));
            }
        }

        if shape.rank() == 1 {
            let start = offset.map_or(0, |o| o.col() as usize);
            if start + n > total {
                return Err(TesselError::invalid_shape(format!(
                    "line of {n} at position {start} runs past {total} devices"
                )));
            }
            return Ok(self.line_order()[start..start + n].to_vec());
        }

        let off = offset.unwrap_or_else(|| MeshCoordinate::zero(2));
        if let Some(ids) = self.block(shape, off.row(), off.col(), false) {
            return Ok(ids);
        }
        if let Some(ids) = self.block(shape, off.row(), off.col(), true) {
            debug!("{shape} mapped transposed at {off}");
            return Ok(ids);
        }
        if shape.is_line() && off.is_zero() {
            return Ok(self.line_order()[..n].to_vec());
        }
        Err(TesselError::invalid_shape(format!(
            "{shape} at offset {off} exceeds physical mesh {}x{}",
            self.config.rows, self.config.cols
        )))
    }

    /// Whether every pair of logical neighbours in `ids`, laid out row-major
    /// over `shape`, is physically linked.
    #[must_use]
    pub fn is_connected_grid(&self, shape: MeshShape, ids: &[PhysicalDeviceId]) -> bool {
        if ids.len() != shape.num_devices() {
            return false;
        }
        let cols = shape.cols() as usize;
        ids.iter().enumerate().all(|(i, &id)| {
            let right = (i % cols + 1 < cols).then(|| ids[i + 1]);
            let down = ids.get(i + cols).copied();
            right.into_iter().chain(down).all(|n| self.are_connected(id, n))
        })
    }

    /// Fold a line of devices back into `shape` along the serpentine walk.
    ///
    /// Inverse of flattening a grid with [`boustrophedon`]; `None` unless the
    /// folded grid is physically connected.
    #[must_use]
    pub fn fold_line(&self, shape: MeshShape, line: &[PhysicalDeviceId]) -> Option<Vec<PhysicalDeviceId>> {
        if line.len() != shape.num_devices() {
            return None;
        }
        let cols = shape.cols();
        let mut grid = line.to_vec();
        for (&(r, c), &id) in boustrophedon(shape.rows(), cols).iter().zip(line) {
            grid[(r * cols + c) as usize] = id;
        }
        self.is_connected_grid(shape, &grid).then_some(grid)
    }

    /// Find a physical block of `shape` holding exactly `devices`, row-major.
    ///
    /// Direct placements are tried before transposed ones.
    #[must_use]
    pub fn find_block(&self, shape: MeshShape, devices: &[PhysicalDeviceId]) -> Option<Vec<PhysicalDeviceId>> {
        let wanted: HashSet<PhysicalDeviceId> = devices.iter().copied().collect();
        for transposed in [false, true] {
            for row in 0..self.config.rows {
                for col in 0..self.config.cols {
                    if let Some(ids) = self.block(shape, row, col, transposed) {
                        if ids.len() == wanted.len() && ids.iter().all(|id| wanted.contains(id)) {
                            return Some(ids);
                        }
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t3000() -> SystemMesh {
        SystemMesh::new(SystemConfig::T3000)
    }

    fn ids(v: &[u32]) -> Vec<PhysicalDeviceId> {
        v.iter().map(|&i| PhysicalDeviceId(i)).collect()
    }

    #[test]
    fn links_are_symmetric() {
        let sys = t3000();
        for dev in sys.devices() {
            for core in sys.chip().ethernet_cores().iter() {
                if let Some((peer, peer_core)) = sys.get_connected_neighbor(dev.id(), core) {
                    assert_eq!(sys.get_connected_neighbor(peer, peer_core), Some((dev.id(), core)));
                    assert!(sys.are_connected(dev.id(), peer));
                }
            }
        }
        assert_eq!(sys.ethernet_links(PhysicalDeviceId(0), PhysicalDeviceId(1)).len(), 2);
        assert!(sys.ethernet_links(PhysicalDeviceId(0), PhysicalDeviceId(5)).is_empty());
    }

    #[test]
    fn line_order_is_serpentine() {
        assert_eq!(t3000().line_order(), ids(&[0, 1, 2, 3, 7, 6, 5, 4]));
    }

    #[test]
    fn grid_and_transposed_mappings() {
        let sys = t3000();
        assert_eq!(
            sys.get_mapped_physical_device_ids(MeshShape::new(2, 4), None).unwrap(),
            ids(&[0, 1, 2, 3, 4, 5, 6, 7])
        );
        assert_eq!(
            sys.get_mapped_physical_device_ids(MeshShape::new(4, 2), None).unwrap(),
            ids(&[0, 4, 1, 5, 2, 6, 3, 7])
        );
        assert_eq!(
            sys.get_mapped_physical_device_ids(MeshShape::new(2, 2), Some(MeshCoordinate::new(0, 2)))
                .unwrap(),
            ids(&[2, 3, 6, 7])
        );
        assert_eq!(
            sys.get_mapped_physical_device_ids(MeshShape::new(1, 8), None).unwrap(),
            sys.line_order()
        );
    }

    #[test]
    fn rejects_out_of_bounds() {
        let sys = t3000();
        for (shape, offset) in [
            (MeshShape::line(9), None),
            (MeshShape::new(2, 5), None),
            (MeshShape::new(1, 8), Some(MeshCoordinate::new(0, 1))),
            (MeshShape::new(2, 3), Some(MeshCoordinate::new(1, 1))),
            (MeshShape::new(2, 2), Some(MeshCoordinate::line(1))),
            (MeshShape::line(8), Some(MeshCoordinate::line(1))),
        ] {
            let err = sys.get_mapped_physical_device_ids(shape, offset).unwrap_err();
            assert!(matches!(err, TesselError::InvalidShape { .. }), "{shape}: {err}");
        }
    }

    #[test]
    fn find_block_matches_sets() {
        let sys = t3000();
        assert_eq!(
            sys.find_block(MeshShape::new(2, 2), &ids(&[5, 0, 4, 1])),
            Some(ids(&[0, 1, 4, 5]))
        );
        assert_eq!(sys.find_block(MeshShape::new(2, 2), &ids(&[0, 1, 2, 3])), None);
    }

    #[test]
    fn connected_grid_checks_both_axes() {
        let sys = t3000();
        assert!(sys.is_connected_grid(MeshShape::new(2, 2), &ids(&[1, 0, 5, 4])));
        assert!(sys.is_connected_grid(MeshShape::new(1, 4), &ids(&[0, 1, 5, 4])));
        // 0 over 5 is diagonal.
        assert!(!sys.is_connected_grid(MeshShape::new(2, 2), &ids(&[0, 1, 5, 4])));
        assert!(!sys.is_connected_grid(MeshShape::new(1, 3), &ids(&[0, 1])));
    }

    #[test]
    fn fold_line_inverts_serpentine() {
        let sys = t3000();
        assert_eq!(
            sys.fold_line(MeshShape::new(2, 2), &ids(&[1, 0, 4, 5])),
            Some(ids(&[1, 0, 5, 4]))
        );
        assert_eq!(
            sys.fold_line(MeshShape::new(2, 4), &sys.line_order()),
            Some(ids(&[0, 1, 2, 3, 4, 5, 6, 7]))
        );
        assert_eq!(sys.fold_line(MeshShape::new(2, 2), &ids(&[0, 1, 2, 3])), None);
    }
}
