//! Network abstraction over the two NPU runtime families.
//!
//! | Backend | Runtime model | Tensor memory |
//! |---------|---------------|---------------|
//! | [`edge::EdgeNet`] | integrated NPU, single-batch, zero-copy I/O | aliases the runtime's own buffers |
//! | [`accel::AccelNet`] | discrete accelerator, multi-stage batching | allocated from a device pool, bound per launch |
//!
//! Both present the same [`Network`] contract: declare the I/O you care
//! about, `setup`, then drive the update-inputs / forward / update-outputs
//! cycle. Runtimes bind through the seams in [`driver`].

pub mod accel;
pub mod driver;
pub mod edge;
pub mod host;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::dtype::DataType;
use crate::error::{HalError, HalResult};
use crate::platform::InferencePlatform;
use crate::tensor::Tensor;

pub use accel::AccelNet;
pub use driver::{
    AccelRuntime, EdgeIoDesc, EdgeRuntime, IoBinding, IoDesc, ModelMemInfo, NetworkDesc,
    StageDesc,
};
pub use edge::EdgeNet;
pub use host::HostNpuDriver;

/// Where model bytes come from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    File(PathBuf),
    Buffer(Vec<u8>),
}

impl ModelSource {
    pub(crate) fn bytes(&self) -> HalResult<Vec<u8>> {
        match self {
            ModelSource::File(path) => Ok(std::fs::read(path)?),
            ModelSource::Buffer(buf) => Ok(buf.clone()),
        }
    }
}

/// One pre-reserved device memory range.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemRegion {
    pub addr: u64,
    pub size: usize,
}

/// Caller-reserved device memory for the accelerator runtime's internal
/// segments. Any region left `None` is allocated by the runtime itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeMemRegions {
    pub instruction: Option<MemRegion>,
    pub variable_instruction: Option<MemRegion>,
    pub neuron: Option<MemRegion>,
    pub coeff: Option<MemRegion>,
    pub io: Option<MemRegion>,
}

impl RuntimeMemRegions {
    /// Check every provided region against the model's actual needs.
    pub fn validate_against(&self, info: &ModelMemInfo) -> HalResult<()> {
        let checks = [
            ("instruction", self.instruction, info.instruction_bytes),
            (
                "variable_instruction",
                self.variable_instruction,
                info.variable_instruction_bytes,
            ),
            ("neuron", self.neuron, info.neuron_bytes),
            ("coeff", self.coeff, info.coeff_bytes),
            ("io", self.io, info.io_bytes),
        ];
        for (name, region, needed) in checks {
            if let Some(region) = region {
                if region.size < needed {
                    return Err(HalError::ModelLoadFailed(format!(
                        "{name} region holds {} bytes, model needs {needed}",
                        region.size
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Everything needed to open a network.
#[derive(Debug, Clone)]
pub struct NetParam {
    pub source: ModelSource,
    pub device_id: u32,
    /// Network to select when the model packages several. `None` is valid
    /// only for single-network models.
    pub network_name: Option<String>,
    pub mem_regions: Option<RuntimeMemRegions>,
    pub platform: InferencePlatform,
}

impl NetParam {
    pub fn from_file(path: impl Into<PathBuf>) -> NetParam {
        NetParam {
            source: ModelSource::File(path.into()),
            device_id: 0,
            network_name: None,
            mem_regions: None,
            platform: InferencePlatform::Automatic,
        }
    }

    pub fn with_device(mut self, device_id: u32) -> NetParam {
        self.device_id = device_id;
        self
    }

    pub fn with_network_name(mut self, name: impl Into<String>) -> NetParam {
        self.network_name = Some(name.into());
        self
    }

    pub fn with_mem_regions(mut self, regions: RuntimeMemRegions) -> NetParam {
        self.mem_regions = Some(regions);
        self
    }
}

/// Shape, quantization and size of one network input or output.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    /// NCHW, leading dim scaled to the active batch.
    pub shape: [usize; 4],
    pub dtype: DataType,
    /// Quantization scale; 1.0 for float I/O.
    pub qscale: f32,
    pub zero_point: i32,
    pub elem_count: usize,
    pub byte_size: usize,
}

impl TensorInfo {
    pub(crate) fn from_desc(desc: &IoDesc, shape: [usize; 4]) -> TensorInfo {
        let elem_count: usize = shape.iter().product();
        TensorInfo {
            name: desc.name.clone(),
            shape,
            dtype: desc.dtype,
            qscale: desc.qscale,
            zero_point: desc.zero_point,
            elem_count,
            byte_size: elem_count * desc.dtype.size(),
        }
    }
}

/// Lifecycle of a network handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetState {
    /// Constructed, model not loaded yet.
    Unconfigured,
    /// Model loaded, I/O declared, tensors materialized.
    Ready,
}

pub type SharedTensor = Arc<Mutex<Tensor>>;

/// Lock a shared tensor, mapping a poisoned mutex onto a typed error.
pub fn lock_tensor(tensor: &SharedTensor) -> HalResult<MutexGuard<'_, Tensor>> {
    tensor
        .lock()
        .map_err(|_| HalError::InvalidState("tensor mutex poisoned".into()))
}

/// Record a declared I/O name. Idempotent: re-declaring a name the network
/// already binds is a no-op even after setup; only names unknown to the
/// loaded model are rejected once the network is up.
pub(crate) fn declare_io(
    list: &mut Vec<String>,
    name: &str,
    state: NetState,
    bound: &[String],
) -> HalResult<()> {
    if state != NetState::Unconfigured {
        if bound.iter().any(|n| n == name) {
            return Ok(());
        }
        return Err(HalError::AlreadyInitialized(format!(
            "cannot declare new I/O '{name}' after setup"
        )));
    }
    if !list.iter().any(|n| n == name) {
        list.push(name.to_string());
    }
    Ok(())
}

/// Common contract for the network backends.
pub trait Network {
    /// Register interest in an input by name. Idempotent; new names must
    /// be declared before [`Network::setup`].
    fn add_input(&mut self, name: &str) -> HalResult<()>;

    /// Register interest in an output by name. Idempotent.
    fn add_output(&mut self, name: &str) -> HalResult<()>;

    /// Load the model and materialize tensors for the declared I/O.
    fn setup(&mut self) -> HalResult<()>;

    fn state(&self) -> NetState;

    fn input_names(&self) -> Vec<String>;

    fn output_names(&self) -> Vec<String>;

    fn input_info(&self, name: &str) -> HalResult<TensorInfo>;

    fn output_info(&self, name: &str) -> HalResult<TensorInfo>;

    /// Batch sizes the loaded model can run, sorted descending.
    fn supported_batch_sizes(&self) -> &[usize];

    fn input_tensor(&self, name: &str) -> HalResult<SharedTensor>;

    fn output_tensor(&self, name: &str) -> HalResult<SharedTensor>;

    /// Commit input tensors for a batch of `batch` samples: select the
    /// matching stage, check shapes and push CPU writes to the hardware.
    fn update_input_tensors(&mut self, batch: usize) -> HalResult<()>;

    /// Run inference synchronously on the committed inputs.
    fn forward(&mut self) -> HalResult<()>;

    /// Make the hardware's output writes visible to the CPU and refresh
    /// output shapes for the completed batch.
    fn update_output_tensors(&mut self) -> HalResult<()>;

    fn device_id(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_regions_validated_against_model_needs() {
        let info = ModelMemInfo {
            instruction_bytes: 1024,
            variable_instruction_bytes: 0,
            neuron_bytes: 4096,
            coeff_bytes: 2048,
            io_bytes: 512,
        };
        let mut regions = RuntimeMemRegions {
            neuron: Some(MemRegion {
                addr: 0x1000,
                size: 8192,
            }),
            ..Default::default()
        };
        regions.validate_against(&info).unwrap();
        regions.coeff = Some(MemRegion {
            addr: 0x3000,
            size: 1024,
        });
        assert!(matches!(
            regions.validate_against(&info),
            Err(HalError::ModelLoadFailed(_))
        ));
    }

    #[test]
    fn test_tensor_info_byte_size_tracks_shape() {
        let desc = IoDesc {
            name: "input".into(),
            shape: [1, 3, 16, 16],
            dtype: DataType::Int8,
            qscale: 0.5,
            zero_point: 0,
        };
        let info = TensorInfo::from_desc(&desc, [4, 3, 16, 16]);
        assert_eq!(info.elem_count, 4 * 3 * 16 * 16);
        assert_eq!(info.byte_size, info.elem_count);
        assert_eq!(info.shape[0], 4);
    }
}
