//! Runtime and system configuration
//!
//! Defaults describe an eight-chip 2×4 box; environment variables layer on
//! top for the knobs that tests and the CLI flip at runtime:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `TESSEL_SLOW_DISPATCH_MODE` | any value selects synchronous dispatch |
//! | `TESSEL_DISPATCH_TIMEOUT_MS` | device wait timeout before a fault |
//! | `TESSEL_TRACE_REGION_SIZE` | bytes of DRAM reserved for traces |
//! | `TESSEL_WATCHER_LOG` | where device faults are appended |
//! | `TESSEL_SEED` | seed for generated sanity workloads |

use std::path::PathBuf;
use std::time::Duration;
use tessel_chip::{ChipSpec, MeshCoordinate, MeshShape};
use tracing::{debug, warn};

use crate::system::PhysicalDeviceId;

/// Maximum command queues per mesh device.
pub const MAX_COMMAND_QUEUES: usize = 2;

/// How commands reach the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Asynchronous dispatcher and execution lanes per device.
    Fast,
    /// Every command runs to completion before the call returns.
    Slow,
}

/// Per-mesh runtime knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Command queues per mesh device (1 or 2)
    pub num_command_queues: usize,
    /// Bytes of DRAM per device reserved for sealed traces
    pub trace_region_size: u64,
    /// Bytes of L1 per core kept out of the buffer allocator
    pub l1_small_size: u32,
    /// Dispatch mode
    pub dispatch_mode: DispatchMode,
    /// How long a device-side wait may block before it is a fault
    pub dispatch_timeout: Duration,
    /// File device faults are appended to
    pub watcher_log_path: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_command_queues: 1,
            trace_region_size: 64 * 1024 * 1024,
            l1_small_size: 0,
            dispatch_mode: DispatchMode::Fast,
            dispatch_timeout: Duration::from_secs(10),
            watcher_log_path: std::env::temp_dir().join("tessel-watcher.log"),
        }
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if std::env::var_os("TESSEL_SLOW_DISPATCH_MODE").is_some() {
            config.dispatch_mode = DispatchMode::Slow;
        }
        if let Some(ms) = parse_env::<u64>("TESSEL_DISPATCH_TIMEOUT_MS") {
            config.dispatch_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse_env::<u64>("TESSEL_TRACE_REGION_SIZE") {
            config.trace_region_size = size;
        }
        if let Some(path) = std::env::var_os("TESSEL_WATCHER_LOG") {
            config.watcher_log_path = PathBuf::from(path);
        }

        debug!("Runtime config: {config:?}");
        config
    }

    /// Set the number of command queues.
    #[must_use]
    pub const fn with_command_queues(mut self, n: usize) -> Self {
        self.num_command_queues = n;
        self
    }

    /// Set the trace region size.
    #[must_use]
    pub const fn with_trace_region_size(mut self, bytes: u64) -> Self {
        self.trace_region_size = bytes;
        self
    }

    /// Set the dispatch timeout.
    #[must_use]
    pub const fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Set the dispatch mode.
    #[must_use]
    pub const fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Set the watcher log path.
    #[must_use]
    pub fn with_watcher_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.watcher_log_path = path.into();
        self
    }
}

/// Read the workload seed from `TESSEL_SEED`, falling back to `default`.
pub fn seed_from_env(default: u64) -> u64 {
    parse_env("TESSEL_SEED").unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {name}={raw}: not a valid number");
            None
        }
    }
}

/// Physical cluster description.
#[derive(Debug, Clone, Copy)]
pub struct SystemConfig {
    /// Physical grid rows
    pub rows: u32,
    /// Physical grid columns
    pub cols: u32,
    /// Ethernet links between each pair of grid neighbours
    pub links_per_neighbor: u32,
    /// Chip geometry, identical on every device
    pub chip: ChipSpec,
}

impl SystemConfig {
    /// Eight chips wired as a 2×4 grid with two links per neighbour pair.
    pub const T3000: Self = Self {
        rows: 2,
        cols: 4,
        links_per_neighbor: 2,
        chip: ChipSpec::WORMHOLE,
    };

    /// A single chip.
    pub const SINGLE: Self = Self {
        rows: 1,
        cols: 1,
        links_per_neighbor: 0,
        chip: ChipSpec::WORMHOLE,
    };
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self::T3000
    }
}

/// How the mesh's line order must close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeshTopology {
    /// Consecutive devices are neighbours.
    #[default]
    Line,
    /// Line whose last device is also a neighbour of the first.
    Ring,
}

/// Parameters for opening a mesh device.
#[derive(Debug, Clone)]
pub struct MeshDeviceConfig {
    /// Requested logical shape
    pub shape: MeshShape,
    /// Offset into the physical grid; rank must match `shape`
    pub offset: Option<MeshCoordinate>,
    /// Explicit physical devices, bound row-major
    pub physical_device_ids: Option<Vec<PhysicalDeviceId>>,
    /// Required line closure
    pub topology: MeshTopology,
    /// Runtime knobs
    pub runtime: RuntimeConfig,
}

impl MeshDeviceConfig {
    /// Config for `shape` with defaults elsewhere.
    pub fn new(shape: MeshShape) -> Self {
        Self {
            shape,
            offset: None,
            physical_device_ids: None,
            topology: MeshTopology::Line,
            runtime: RuntimeConfig::default(),
        }
    }

    /// Place the mesh at `offset` in the physical grid.
    #[must_use]
    pub const fn with_offset(mut self, offset: MeshCoordinate) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Bind these physical devices row-major.
    #[must_use]
    pub fn with_physical_ids(mut self, ids: Vec<PhysicalDeviceId>) -> Self {
        self.physical_device_ids = Some(ids);
        self
    }

    /// Require the given line closure.
    #[must_use]
    pub const fn with_topology(mut self, topology: MeshTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Use these runtime knobs.
    #[must_use]
    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_fast_dispatch_single_queue() {
        let c = RuntimeConfig::default();
        assert_eq!(c.dispatch_mode, DispatchMode::Fast);
        assert_eq!(c.num_command_queues, 1);
        assert!(c.trace_region_size > 0);
    }

    #[test]
    fn builders_override_defaults() {
        let c = RuntimeConfig::default()
            .with_command_queues(2)
            .with_dispatch_timeout(Duration::from_millis(250))
            .with_dispatch_mode(DispatchMode::Slow);
        assert_eq!(c.num_command_queues, 2);
        assert_eq!(c.dispatch_timeout, Duration::from_millis(250));
        assert_eq!(c.dispatch_mode, DispatchMode::Slow);
    }

    #[test]
    fn t3000_is_two_by_four() {
        let s = SystemConfig::T3000;
        assert_eq!(s.rows * s.cols, 8);
        assert_eq!(s.links_per_neighbor, 2);
    }
}
