//! Error types for mesh runtime operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for mesh runtime operations
pub type Result<T> = std::result::Result<T, TesselError>;

/// Errors that can occur during mesh runtime operations
#[derive(Debug, Error)]
pub enum TesselError {
    /// Requested mesh shape cannot be mapped onto the physical system
    #[error("Invalid mesh shape: {reason}")]
    InvalidShape {
        /// Reason for rejection
        reason: String,
    },

    /// Reshape target holds a different number of devices
    #[error("Cannot reshape mesh of {current} devices into {requested} devices")]
    DeviceCountMismatch {
        /// Devices in the current mesh
        current: usize,
        /// Devices the new shape needs
        requested: usize,
    },

    /// Reshape target cannot be tiled by the current physical devices
    #[error("Incompatible topology: {reason}")]
    IncompatibleTopology {
        /// Reason for rejection
        reason: String,
    },

    /// A trace capture is already in progress on this queue
    #[error("Trace capture already active on command queue {queue}")]
    CaptureAlreadyActive {
        /// Queue index
        queue: usize,
    },

    /// End of capture without a matching begin
    #[error("No active trace capture on command queue {queue}")]
    NoActiveCapture {
        /// Queue index
        queue: usize,
    },

    /// Trace handle is stale, released or never existed
    #[error("Invalid trace handle {id}")]
    InvalidTraceHandle {
        /// Handle as text
        id: String,
    },

    /// Sub-device names cores that do not exist on every device
    #[error("Too many cores: {reason}")]
    TooManyCores {
        /// Reason for rejection
        reason: String,
    },

    /// Two sub-devices or two workload ranges claim the same resources
    #[error("Overlap: {reason}")]
    Overlap {
        /// Reason for rejection
        reason: String,
    },

    /// Fabric connection requested to a neighbour with no ethernet link
    #[error("No physical link: {reason}")]
    NoPhysicalLink {
        /// Reason for rejection
        reason: String,
    },

    /// Device range does not lie inside the mesh
    #[error("Invalid device range: {reason}")]
    InvalidRange {
        /// Reason for rejection
        reason: String,
    },

    /// Program or stall group references an unknown sub-device
    #[error("Invalid sub-device: {reason}")]
    InvalidSubDevice {
        /// Reason for rejection
        reason: String,
    },

    /// Object is in an invalid state for the operation
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Allocator could not satisfy a request
    #[error("Out of memory: {reason}")]
    OutOfMemory {
        /// Reason for failure
        reason: String,
    },

    /// Sealed trace does not fit the device trace region
    #[error("Trace of {size} bytes does not fit trace region of {capacity} bytes")]
    TraceRegionExhausted {
        /// Trace size in bytes
        size: usize,
        /// Region capacity in bytes
        capacity: u64,
    },

    /// Device-side fault observed on a blocking wait
    #[error("Device {device} faulted: {reason} (see watcher log {})", .watcher_log.display())]
    DeviceFault {
        /// Physical device id
        device: u32,
        /// Fault description
        reason: String,
        /// Watcher log location
        watcher_log: PathBuf,
    },

    /// Operation timeout
    #[error("Operation timeout after {duration_ms}ms: {what}")]
    Timeout {
        /// What was being waited on
        what: String,
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Physical device id not present in the system
    #[error("Device {id} not found")]
    DeviceNotFound {
        /// Requested id
        id: u32,
    },

    /// Command queue index out of range
    #[error("Command queue {index} out of range (have {count} queues)")]
    InvalidQueue {
        /// Requested index
        index: usize,
        /// Number of configured queues
        count: usize,
    },

    /// Fabric transport error
    #[error("Fabric error: {reason}")]
    Fabric {
        /// Reason for failure
        reason: String,
    },

    /// Kernel runtime/compile argument missing or malformed
    #[error("Kernel argument error: {reason}")]
    KernelArgument {
        /// Reason for failure
        reason: String,
    },
}

impl TesselError {
    /// Create an invalid shape error
    pub fn invalid_shape(reason: impl Into<String>) -> Self {
        Self::InvalidShape {
            reason: reason.into(),
        }
    }

    /// Create an incompatible topology error
    pub fn incompatible_topology(reason: impl Into<String>) -> Self {
        Self::IncompatibleTopology {
            reason: reason.into(),
        }
    }

    /// Create a too many cores error
    pub fn too_many_cores(reason: impl Into<String>) -> Self {
        Self::TooManyCores {
            reason: reason.into(),
        }
    }

    /// Create an overlap error
    pub fn overlap(reason: impl Into<String>) -> Self {
        Self::Overlap {
            reason: reason.into(),
        }
    }

    /// Create a no physical link error
    pub fn no_physical_link(reason: impl Into<String>) -> Self {
        Self::NoPhysicalLink {
            reason: reason.into(),
        }
    }

    /// Create an invalid range error
    pub fn invalid_range(reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            reason: reason.into(),
        }
    }

    /// Create an invalid sub-device error
    pub fn invalid_sub_device(reason: impl Into<String>) -> Self {
        Self::InvalidSubDevice {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create an out of memory error
    pub fn out_of_memory(reason: impl Into<String>) -> Self {
        Self::OutOfMemory {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>, duration: std::time::Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a fabric error
    pub fn fabric(reason: impl Into<String>) -> Self {
        Self::Fabric {
            reason: reason.into(),
        }
    }

    /// Create a kernel argument error
    pub fn kernel_argument(reason: impl Into<String>) -> Self {
        Self::KernelArgument {
            reason: reason.into(),
        }
    }
}
