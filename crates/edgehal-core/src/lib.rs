//! edgehal-core: hardware abstraction layer for embedded NPU inference.
//!
//! One portable API over two hardware families plus a CPU model:
//!
//! | Layer | Edge (integrated NPU) | Accel (discrete) | Host |
//! |-------|----------------------|------------------|------|
//! | memory | contiguous/ION pool | device pool | heap pool |
//! | image | video-pipeline frames | accelerator descriptors | software frames |
//! | net | zero-copy, batch 1 | staged multi-batch | CPU model |
//! | preprocess | hardware scaler | CPU kernels | CPU kernels |
//!
//! The hardware itself sits behind driver seams (allocators, runtimes, the
//! scaler); [`context::HalContext`] carries the bound drivers plus the
//! process-wide registries, and [`factory`] picks concrete backends per
//! [`platform::InferencePlatform`]. [`pipeline::ModelPipeline`] ties it
//! together: preprocess frames into input tensors, schedule batches
//! greedily over the network's compiled stages, and hand outputs plus the
//! per-frame rescale mappings to a parser.
//!
//! ```no_run
//! use edgehal_core::context::HalContext;
//! use edgehal_core::factory;
//! use edgehal_core::net::NetParam;
//!
//! # fn main() -> edgehal_core::error::HalResult<()> {
//! let ctx = HalContext::host();
//! let mut net = factory::create_net(&ctx, NetParam::from_file("model.json"));
//! net.setup()?;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod dtype;
pub mod error;
pub mod factory;
pub mod image;
pub mod memory;
pub mod net;
pub mod pipeline;
pub mod platform;
pub mod preprocess;
pub mod tensor;

pub mod prelude {
    //! Convenience re-exports for application code.
    pub use crate::context::HalContext;
    pub use crate::dtype::DataType;
    pub use crate::error::{HalError, HalResult};
    pub use crate::factory;
    pub use crate::image::{Image, ImageFormat, ImageType};
    pub use crate::memory::{MemoryPool, Ownership, PoolBackend, SharedPool};
    pub use crate::net::{NetParam, Network, SharedTensor, TensorInfo};
    pub use crate::pipeline::{ModelPipeline, OutputParser};
    pub use crate::platform::InferencePlatform;
    pub use crate::preprocess::{PreprocessParams, Preprocessor, RescaleConfig};
    pub use crate::tensor::Tensor;
}
