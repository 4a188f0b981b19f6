//! Runtime driver seams.
//!
//! The two NPU runtime families bind here: the integrated NPU's
//! register/forward/cleanup cycle behind [`EdgeRuntime`], the discrete
//! accelerator's device/model/launch lifecycle behind [`AccelRuntime`].
//! [`crate::net::host::HostNpuDriver`] implements both on the CPU for
//! development and tests.

use crate::dtype::DataType;
use crate::error::HalResult;
use crate::net::{ModelSource, RuntimeMemRegions};

/// Static description of one network input or output, at batch 1.
#[derive(Debug, Clone)]
pub struct IoDesc {
    pub name: String,
    /// NCHW at the model's base batch.
    pub shape: [usize; 4],
    pub dtype: DataType,
    pub qscale: f32,
    pub zero_point: i32,
}

/// One compiled shape configuration of a network.
#[derive(Debug, Clone)]
pub struct StageDesc {
    /// Per-input shapes; index parallels `NetworkDesc::inputs`.
    pub input_shapes: Vec<[usize; 4]>,
    /// Per-output shapes; index parallels `NetworkDesc::outputs`.
    pub output_shapes: Vec<[usize; 4]>,
}

impl StageDesc {
    /// The batch size this stage runs: the leading dim of input 0.
    pub fn batch_size(&self) -> usize {
        self.input_shapes.first().map(|s| s[0]).unwrap_or(0)
    }
}

/// Everything the runtime reports about one network in a loaded model.
#[derive(Debug, Clone)]
pub struct NetworkDesc {
    pub name: String,
    pub inputs: Vec<IoDesc>,
    pub outputs: Vec<IoDesc>,
    pub stages: Vec<StageDesc>,
}

/// One tensor buffer bound to a launch. Buffers live in device memory;
/// `host_ptr` is the CPU mapping of the same range.
#[derive(Debug, Clone)]
pub struct IoBinding {
    pub device_addr: u64,
    pub host_ptr: *mut u8,
    pub byte_size: usize,
    pub shape: [usize; 4],
}

/// Device memory a model needs, segment by segment. Used to validate
/// caller-reserved [`RuntimeMemRegions`] before load.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelMemInfo {
    pub instruction_bytes: usize,
    pub variable_instruction_bytes: usize,
    pub neuron_bytes: usize,
    pub coeff_bytes: usize,
    pub io_bytes: usize,
}

/// Discrete accelerator runtime seam.
pub trait AccelRuntime: Send + Sync {
    /// Open a device and return an opaque handle.
    fn open_device(&self, device_id: u32) -> HalResult<u64>;

    fn close_device(&self, handle: u64);

    /// Query how much device memory a model will need, without loading it.
    fn model_mem_info(&self, source: &ModelSource) -> HalResult<ModelMemInfo>;

    /// Load a model onto an open device, optionally into caller-reserved
    /// memory regions. Returns an opaque model handle.
    fn load_model(
        &self,
        device: u64,
        source: &ModelSource,
        regions: Option<&RuntimeMemRegions>,
    ) -> HalResult<u64>;

    fn unload_model(&self, model: u64);

    fn network_names(&self, model: u64) -> HalResult<Vec<String>>;

    fn network_desc(&self, model: u64, network: &str) -> HalResult<NetworkDesc>;

    /// Run one stage synchronously. Bindings parallel the descriptor's
    /// input/output order.
    fn launch(
        &self,
        model: u64,
        network: &str,
        stage: usize,
        inputs: &[IoBinding],
        outputs: &[IoBinding],
    ) -> HalResult<()>;
}

/// I/O descriptor the integrated runtime hands back after registration:
/// the static description plus the runtime-owned buffer behind it.
#[derive(Debug, Clone)]
pub struct EdgeIoDesc {
    pub desc: IoDesc,
    pub host_ptr: *mut u8,
    pub phys_addr: u64,
    pub byte_size: usize,
}

/// Integrated NPU runtime seam. Registration fixes the I/O buffers for the
/// lifetime of the instance; forward consumes and produces them in place.
pub trait EdgeRuntime: Send + Sync {
    /// Load a model and return an opaque instance handle.
    fn register(&self, source: &ModelSource) -> HalResult<u64>;

    fn cleanup(&self, instance: u64);

    /// The instance's fixed input and output buffers.
    fn io_descriptors(&self, instance: u64) -> HalResult<(Vec<EdgeIoDesc>, Vec<EdgeIoDesc>)>;

    /// Run inference synchronously over the instance's buffers.
    fn forward(&self, instance: u64) -> HalResult<()>;
}
