//! Host (CPU-model) NPU runtime.
//!
//! Stands in for both runtime families on developer machines and in CI.
//! Models are JSON descriptors listing networks, their I/O and supported
//! batch sizes; "inference" copies input bytes to the outputs so data-path
//! plumbing (quantization params, batching, zero-copy aliasing, cache
//! discipline) can be exercised end to end without hardware.
//!
//! ```json
//! {
//!   "networks": [{
//!     "name": "classifier",
//!     "batch_sizes": [1, 4],
//!     "inputs":  [{"name": "data", "shape": [1, 3, 32, 32], "dtype": "int8", "qscale": 0.5}],
//!     "outputs": [{"name": "prob", "shape": [1, 10, 1, 1], "dtype": "fp32"}]
//!   }]
//! }
//! ```

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;

use crate::dtype::DataType;
use crate::error::{HalError, HalResult};
use crate::net::driver::{
    AccelRuntime, EdgeIoDesc, EdgeRuntime, IoBinding, IoDesc, ModelMemInfo, NetworkDesc, StageDesc,
};
use crate::net::{ModelSource, RuntimeMemRegions};

#[derive(Debug, Deserialize)]
struct ModelDoc {
    networks: Vec<NetworkDoc>,
}

#[derive(Debug, Deserialize)]
struct NetworkDoc {
    name: String,
    #[serde(default = "default_batch_sizes")]
    batch_sizes: Vec<usize>,
    inputs: Vec<IoDoc>,
    outputs: Vec<IoDoc>,
}

fn default_batch_sizes() -> Vec<usize> {
    vec![1]
}

#[derive(Debug, Deserialize)]
struct IoDoc {
    name: String,
    shape: Vec<usize>,
    dtype: DataType,
    #[serde(default = "default_qscale")]
    qscale: f32,
    #[serde(default)]
    zero_point: i32,
}

fn default_qscale() -> f32 {
    1.0
}

impl IoDoc {
    fn to_desc(&self) -> HalResult<IoDesc> {
        let shape: [usize; 4] = self.shape.as_slice().try_into().map_err(|_| {
            HalError::ModelLoadFailed(format!(
                "io '{}' must have a rank-4 shape, got {:?}",
                self.name, self.shape
            ))
        })?;
        Ok(IoDesc {
            name: self.name.clone(),
            shape,
            dtype: self.dtype,
            qscale: self.qscale,
            zero_point: self.zero_point,
        })
    }
}

fn parse_model(source: &ModelSource) -> HalResult<(Vec<NetworkDesc>, usize)> {
    let bytes = source.bytes()?;
    let doc: ModelDoc = serde_json::from_slice(&bytes)
        .map_err(|e| HalError::ModelLoadFailed(format!("model descriptor: {e}")))?;
    if doc.networks.is_empty() {
        return Err(HalError::ModelLoadFailed(
            "model descriptor lists no networks".into(),
        ));
    }
    let mut networks = Vec::with_capacity(doc.networks.len());
    for net in &doc.networks {
        let inputs: Vec<IoDesc> = net
            .inputs
            .iter()
            .map(IoDoc::to_desc)
            .collect::<HalResult<_>>()?;
        let outputs: Vec<IoDesc> = net
            .outputs
            .iter()
            .map(IoDoc::to_desc)
            .collect::<HalResult<_>>()?;
        if net.batch_sizes.is_empty() {
            return Err(HalError::ModelLoadFailed(format!(
                "network '{}' lists no batch sizes",
                net.name
            )));
        }
        let stages = net
            .batch_sizes
            .iter()
            .map(|&b| StageDesc {
                input_shapes: inputs.iter().map(|d| scale_batch(d.shape, b)).collect(),
                output_shapes: outputs.iter().map(|d| scale_batch(d.shape, b)).collect(),
            })
            .collect();
        networks.push(NetworkDesc {
            name: net.name.clone(),
            inputs,
            outputs,
            stages,
        });
    }
    Ok((networks, bytes.len()))
}

fn scale_batch(base: [usize; 4], batch: usize) -> [usize; 4] {
    [base[0] * batch, base[1], base[2], base[3]]
}

struct HostEdgeIo {
    desc: IoDesc,
    buf: Box<[u8]>,
}

struct HostEdgeInstance {
    inputs: Vec<HostEdgeIo>,
    outputs: Vec<HostEdgeIo>,
}

#[derive(Default)]
struct DriverState {
    next_handle: u64,
    devices: HashMap<u64, u32>,
    models: HashMap<u64, Vec<NetworkDesc>>,
    instances: HashMap<u64, HostEdgeInstance>,
}

impl DriverState {
    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// CPU-model implementation of both runtime seams.
#[derive(Default)]
pub struct HostNpuDriver {
    state: Mutex<DriverState>,
}

impl HostNpuDriver {
    pub fn new() -> Self {
        HostNpuDriver::default()
    }

    fn lock(&self) -> HalResult<std::sync::MutexGuard<'_, DriverState>> {
        self.state
            .lock()
            .map_err(|_| HalError::InvalidState("host npu driver mutex poisoned".into()))
    }
}

/// Identity model: each output receives the bytes of the input with the
/// same index (cyclically), truncated or zero-padded to fit.
fn identity_copy(src: &[u8], dst: &mut [u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    if n < dst.len() {
        dst[n..].fill(0);
    }
}

impl AccelRuntime for HostNpuDriver {
    fn open_device(&self, device_id: u32) -> HalResult<u64> {
        let mut state = self.lock()?;
        let handle = state.next();
        state.devices.insert(handle, device_id);
        log::debug!("host npu: opened device {device_id} as handle {handle}");
        Ok(handle)
    }

    fn close_device(&self, handle: u64) {
        if let Ok(mut state) = self.lock() {
            state.devices.remove(&handle);
        }
    }

    fn model_mem_info(&self, source: &ModelSource) -> HalResult<ModelMemInfo> {
        let (networks, coeff_bytes) = parse_model(source)?;
        let mut io_bytes = 0usize;
        for net in &networks {
            for stage in &net.stages {
                let stage_bytes: usize = net
                    .inputs
                    .iter()
                    .zip(&stage.input_shapes)
                    .chain(net.outputs.iter().zip(&stage.output_shapes))
                    .map(|(desc, shape)| shape.iter().product::<usize>() * desc.dtype.size())
                    .sum();
                io_bytes = io_bytes.max(stage_bytes);
            }
        }
        Ok(ModelMemInfo {
            instruction_bytes: 4096,
            variable_instruction_bytes: 0,
            neuron_bytes: io_bytes * 2,
            coeff_bytes,
            io_bytes,
        })
    }

    fn load_model(
        &self,
        device: u64,
        source: &ModelSource,
        regions: Option<&RuntimeMemRegions>,
    ) -> HalResult<u64> {
        let mut state = self.lock()?;
        if !state.devices.contains_key(&device) {
            return Err(HalError::InvalidState(format!(
                "load_model on unknown device handle {device}"
            )));
        }
        drop(state);
        if let Some(regions) = regions {
            regions.validate_against(&self.model_mem_info(source)?)?;
        }
        let (networks, _) = parse_model(source)?;
        let mut state = self.lock()?;
        let handle = state.next();
        state.models.insert(handle, networks);
        Ok(handle)
    }

    fn unload_model(&self, model: u64) {
        if let Ok(mut state) = self.lock() {
            state.models.remove(&model);
        }
    }

    fn network_names(&self, model: u64) -> HalResult<Vec<String>> {
        let state = self.lock()?;
        let networks = state
            .models
            .get(&model)
            .ok_or_else(|| HalError::InvalidState(format!("unknown model handle {model}")))?;
        Ok(networks.iter().map(|n| n.name.clone()).collect())
    }

    fn network_desc(&self, model: u64, network: &str) -> HalResult<NetworkDesc> {
        let state = self.lock()?;
        let networks = state
            .models
            .get(&model)
            .ok_or_else(|| HalError::InvalidState(format!("unknown model handle {model}")))?;
        networks
            .iter()
            .find(|n| n.name == network)
            .cloned()
            .ok_or_else(|| {
                HalError::ModelLoadFailed(format!("model has no network named '{network}'"))
            })
    }

    fn launch(
        &self,
        model: u64,
        network: &str,
        stage: usize,
        inputs: &[IoBinding],
        outputs: &[IoBinding],
    ) -> HalResult<()> {
        let desc = self.network_desc(model, network)?;
        let stage_desc = desc.stages.get(stage).ok_or_else(|| {
            HalError::InvalidState(format!("network '{network}' has no stage {stage}"))
        })?;
        for (binding, shape) in inputs.iter().zip(&stage_desc.input_shapes) {
            if binding.shape != *shape {
                return Err(HalError::ShapeMismatch {
                    expected: format!("{shape:?}"),
                    actual: format!("{:?}", binding.shape),
                });
            }
        }
        if inputs.is_empty() {
            return Err(HalError::InvalidState("launch with no inputs".into()));
        }
        for (i, out) in outputs.iter().enumerate() {
            let src = &inputs[i % inputs.len()];
            // Safety: bindings carry valid host mappings of `byte_size`.
            let (src_bytes, dst_bytes) = unsafe {
                (
                    std::slice::from_raw_parts(src.host_ptr, src.byte_size),
                    std::slice::from_raw_parts_mut(out.host_ptr, out.byte_size),
                )
            };
            identity_copy(src_bytes, dst_bytes);
        }
        Ok(())
    }
}

impl EdgeRuntime for HostNpuDriver {
    fn register(&self, source: &ModelSource) -> HalResult<u64> {
        let (networks, _) = parse_model(source)?;
        // The integrated runtime loads exactly one network per instance.
        let net = &networks[0];
        let make_io = |desc: &IoDesc| {
            let bytes = desc.shape.iter().product::<usize>() * desc.dtype.size();
            HostEdgeIo {
                desc: desc.clone(),
                buf: vec![0u8; bytes].into_boxed_slice(),
            }
        };
        let instance = HostEdgeInstance {
            inputs: net.inputs.iter().map(make_io).collect(),
            outputs: net.outputs.iter().map(make_io).collect(),
        };
        let mut state = self.lock()?;
        let handle = state.next();
        state.instances.insert(handle, instance);
        Ok(handle)
    }

    fn cleanup(&self, instance: u64) {
        if let Ok(mut state) = self.lock() {
            state.instances.remove(&instance);
        }
    }

    fn io_descriptors(&self, instance: u64) -> HalResult<(Vec<EdgeIoDesc>, Vec<EdgeIoDesc>)> {
        let mut state = self.lock()?;
        let inst = state
            .instances
            .get_mut(&instance)
            .ok_or_else(|| HalError::InvalidState(format!("unknown instance handle {instance}")))?;
        // The boxed buffers are heap-stable for the instance's lifetime, so
        // handing their addresses out mirrors what the real runtime does.
        let describe = |io: &mut HostEdgeIo| EdgeIoDesc {
            desc: io.desc.clone(),
            host_ptr: io.buf.as_mut_ptr(),
            phys_addr: io.buf.as_ptr() as u64,
            byte_size: io.buf.len(),
        };
        let inputs = inst.inputs.iter_mut().map(describe).collect();
        let outputs = inst.outputs.iter_mut().map(describe).collect();
        Ok((inputs, outputs))
    }

    fn forward(&self, instance: u64) -> HalResult<()> {
        let mut state = self.lock()?;
        let inst = state
            .instances
            .get_mut(&instance)
            .ok_or_else(|| HalError::InvalidState(format!("unknown instance handle {instance}")))?;
        if inst.inputs.is_empty() {
            return Err(HalError::InvalidState("forward with no inputs".into()));
        }
        let n_in = inst.inputs.len();
        for (i, out) in inst.outputs.iter_mut().enumerate() {
            let src = &inst.inputs[i % n_in].buf;
            identity_copy(src, &mut out.buf);
        }
        Ok(())
    }
}

/// Descriptor used across the crate's tests: one identity network with
/// batch sizes 1, 4 and 8.
#[cfg(test)]
pub(crate) fn demo_model_doc() -> Vec<u8> {
    br#"{
        "networks": [{
            "name": "classifier",
            "batch_sizes": [1, 4, 8],
            "inputs":  [{"name": "data", "shape": [1, 3, 4, 4], "dtype": "uint8"}],
            "outputs": [{"name": "prob", "shape": [1, 3, 4, 4], "dtype": "uint8"}]
        }]
    }"#
    .to_vec()
}
