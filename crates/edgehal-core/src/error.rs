//! Unified error types for the edgehal public API.
//!
//! Every HAL entry point returns [`HalResult`]. Conditions the reference
//! hardware SDKs escalate to a hard abort (dtype enumeration gaps, the
//! device-memory precondition before dispatch, an unsupported batch size)
//! are surfaced here as typed, recoverable errors so callers and tests can
//! assert on them instead of crashing the process.

use thiserror::Error;

use crate::memory::PoolBackend;

/// Result alias used by all public HAL methods.
pub type HalResult<T> = Result<T, HalError>;

/// The canonical error type for the edgehal public API.
#[derive(Error, Debug)]
pub enum HalError {
    /// The backing allocator could not satisfy the request (heap OOM, no
    /// free hardware buffer slot, device memory exhausted).
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// An operation that needs a memory pool ran on an object without one.
    #[error("no memory pool attached")]
    PoolUnattached,

    /// Memory (or a model handle) was already set up on this object.
    #[error("already initialized: {0}")]
    AlreadyInitialized(String),

    /// A format/dtype combination with no defined mapping or kernel.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Tensor rank is not 4, or a declared length does not match the
    /// computed length.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// No compiled stage of the network matches the requested batch size.
    #[error("no compiled stage supports batch size {requested} (stages: {supported:?})")]
    UnsupportedBatchSize {
        requested: usize,
        supported: Vec<usize>,
    },

    /// A tensor bound for hardware execution is not backed by device memory.
    #[error("device memory type mismatch: {0}")]
    DeviceMemoryTypeMismatch(String),

    /// The vendor loader rejected the model artifact, or the supplied
    /// runtime memory regions do not cover the model's requirements.
    #[error("model load failed: {0}")]
    ModelLoadFailed(String),

    /// The model contains several candidate networks and none was named.
    #[error("model contains multiple networks {names:?} and no net name was selected")]
    AmbiguousNetworkName { names: Vec<String> },

    /// A cache-maintenance call was routed to a pool whose backend does not
    /// match the block's. Coherency ops are address based, but the address
    /// spaces of the backends are distinct; performing the wrong syscall
    /// would be undefined behavior, so this is rejected.
    #[error("cache op routed to {actual:?} pool but block was allocated from {expected:?}")]
    PoolMismatch {
        expected: PoolBackend,
        actual: PoolBackend,
    },

    /// A release was attempted on a borrowed (non-owning) block. The block
    /// is a view onto externally owned memory and is never freed by the HAL.
    #[error("refusing to release a borrowed memory block")]
    BorrowedRelease,

    /// The object is not in the right lifecycle state for the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// I/O error while reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encode/decode failure.
    #[error("image codec error: {0}")]
    Codec(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for HalError {
    fn from(err: serde_json::Error) -> Self {
        HalError::Serialization(err.to_string())
    }
}
