//! Error types for PIM collective operations

use thiserror::Error;

/// Result type alias for collective operations
pub type Result<T> = std::result::Result<T, CommError>;

/// Errors that can occur while planning or running a collective
///
/// Configuration and capacity errors are raised before any fabric I/O is
/// issued. Fabric errors are fatal to the job.
#[derive(Debug, Error)]
pub enum CommError {
    /// Comm-axis string does not describe the hypercube
    #[error("Axis spec {spec:?} malformed: {reason}")]
    InvalidAxisSpec {
        /// Offending spec string
        spec: String,
        /// What is wrong with it
        reason: String,
    },

    /// Hypercube shape cannot be mapped onto ranks
    #[error("Invalid topology: {reason}")]
    InvalidTopology {
        /// Reason for rejection
        reason: String,
    },

    /// Element size outside {1, 2, 4, 8}
    #[error("Element size {size} not supported (expected 1, 2, 4 or 8 bytes)")]
    InvalidElementSize {
        /// Requested size in bytes
        size: usize,
    },

    /// Rotation group size outside {1, 2, 4}
    #[error("Rotation group size {size} does not divide the 8-lane granule")]
    InvalidGroupSize {
        /// Requested group size
        size: usize,
    },

    /// Element width, group size and slot size do not fit one granule
    #[error("Kernel shape rejected: {reason}")]
    InvalidShape {
        /// Reason for rejection
        reason: String,
    },

    /// Offset or length not aligned to the MRAM word
    #[error("{what} {value:#x} not aligned to {align} bytes")]
    Misaligned {
        /// Which parameter
        what: &'static str,
        /// Offending value
        value: usize,
        /// Required alignment
        align: usize,
    },

    /// Requested bytes exceed a unit's MRAM
    #[error("Capacity exceeded on unit {unit}: {requested} bytes requested, limit {limit}")]
    CapacityExceeded {
        /// Unit whose bank would overflow
        unit: usize,
        /// Computed end of the access in bytes
        requested: usize,
        /// MRAM bytes per unit
        limit: usize,
    },

    /// Backend does not expose enough ranks for the hypercube
    #[error("Topology needs {needed} ranks, backend has {available}")]
    InsufficientRanks {
        /// Ranks required by the hypercube
        needed: usize,
        /// Ranks the backend maps
        available: usize,
    },

    /// Host buffers do not match the collective's layout
    #[error("Host buffer mismatch: {reason}")]
    HostBuffer {
        /// Reason for rejection
        reason: String,
    },

    /// Bounce buffer overlaps the ranges it protects
    #[error("Buffer range {buffer:#x}..{buffer_end:#x} overlaps {what}")]
    BufferOverlap {
        /// Start of the bounce buffer
        buffer: usize,
        /// End of the bounce buffer
        buffer_end: usize,
        /// Which range it collides with
        what: &'static str,
    },

    /// Physical fabric command failed
    #[error("Fabric command failed: {reason}")]
    Fabric {
        /// Reason for failure
        reason: String,
    },

    /// I/O error while mapping or accessing a rank region
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Backend lacks a capability the operation needs
    #[error("Backend does not support {capability}")]
    Unsupported {
        /// Missing capability
        capability: String,
    },

    /// Engine reached a state it should not be in
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },
}

impl CommError {
    /// Create an invalid axis spec error
    pub fn invalid_axis(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAxisSpec {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid topology error
    pub fn invalid_topology(reason: impl Into<String>) -> Self {
        Self::InvalidTopology {
            reason: reason.into(),
        }
    }

    /// Create an invalid shape error
    pub fn invalid_shape(reason: impl Into<String>) -> Self {
        Self::InvalidShape {
            reason: reason.into(),
        }
    }

    /// Create a host buffer error
    pub fn host_buffer(reason: impl Into<String>) -> Self {
        Self::HostBuffer {
            reason: reason.into(),
        }
    }

    /// Create a fabric error
    pub fn fabric(reason: impl Into<String>) -> Self {
        Self::Fabric {
            reason: reason.into(),
        }
    }

    /// Create an unsupported capability error
    pub fn unsupported(capability: impl Into<String>) -> Self {
        Self::Unsupported {
            capability: capability.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Whether the error was raised before any fabric I/O
    pub const fn is_configuration(&self) -> bool {
        !matches!(
            self,
            Self::Fabric { .. } | Self::Io { .. } | Self::InvalidState { .. }
        )
    }
}
