//! Discrete-accelerator network backend.
//!
//! Models here are multi-network, multi-stage: one loaded model can
//! package several networks, and each network compiles several batch
//! sizes (stages). Tensors are allocated from a device pool at the largest
//! stage's size and rebound per launch; the update-inputs call picks the
//! stage whose batch matches and the forward launch is synchronous.

use std::sync::{Arc, Mutex};

use crate::context::{HalContext, LoadedModel};
use crate::error::{HalError, HalResult};
use crate::memory::{PoolBackend, SharedPool};
use crate::net::driver::{IoBinding, ModelMemInfo, NetworkDesc, StageDesc};
use crate::net::{
    lock_tensor, NetParam, NetState, Network, SharedTensor, TensorInfo,
};
use crate::tensor::Tensor;

struct AccelIo {
    /// Index into the descriptor's input/output list.
    desc_index: usize,
    info: TensorInfo,
    tensor: SharedTensor,
}

pub struct AccelNet {
    ctx: Arc<HalContext>,
    param: NetParam,
    state: NetState,
    declared_inputs: Vec<String>,
    declared_outputs: Vec<String>,
    model: Option<Arc<LoadedModel>>,
    network_name: String,
    pool: Option<SharedPool>,
    // (runtime stage index, stage), sorted by batch size descending
    stages: Vec<(usize, StageDesc)>,
    batch_sizes: Vec<usize>,
    active_stage: Option<usize>,
    inputs: Vec<AccelIo>,
    outputs: Vec<AccelIo>,
}

impl AccelNet {
    pub fn new(ctx: Arc<HalContext>, param: NetParam) -> AccelNet {
        AccelNet {
            ctx,
            param,
            state: NetState::Unconfigured,
            declared_inputs: Vec::new(),
            declared_outputs: Vec::new(),
            model: None,
            network_name: String::new(),
            pool: None,
            stages: Vec::new(),
            batch_sizes: Vec::new(),
            active_stage: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Device memory the loaded model occupies, segment by segment.
    pub fn model_mem_info(&self) -> HalResult<ModelMemInfo> {
        self.ctx.accel_runtime().model_mem_info(&self.param.source)
    }

    fn resolve_network_name(&self, names: Vec<String>) -> HalResult<String> {
        match &self.param.network_name {
            Some(wanted) => {
                if names.iter().any(|n| n == wanted) {
                    Ok(wanted.clone())
                } else {
                    Err(HalError::ModelLoadFailed(format!(
                        "model has no network named '{wanted}' (has {names:?})"
                    )))
                }
            }
            None if names.len() == 1 => Ok(names.into_iter().next().ok_or_else(|| {
                HalError::ModelLoadFailed("model lists no networks".into())
            })?),
            None => Err(HalError::AmbiguousNetworkName { names }),
        }
    }

    fn materialize(
        &self,
        pool: &SharedPool,
        desc: &NetworkDesc,
        largest: &StageDesc,
        declared: &[String],
        is_input: bool,
    ) -> HalResult<Vec<AccelIo>> {
        let (descs, shapes, side) = if is_input {
            (&desc.inputs, &largest.input_shapes, "input")
        } else {
            (&desc.outputs, &largest.output_shapes, "output")
        };
        let indices: Vec<usize> = if declared.is_empty() {
            (0..descs.len()).collect()
        } else {
            declared
                .iter()
                .map(|name| {
                    descs.iter().position(|d| d.name == *name).ok_or_else(|| {
                        HalError::ModelLoadFailed(format!("model has no {side} named '{name}'"))
                    })
                })
                .collect::<HalResult<_>>()?
        };
        let mut ios = Vec::with_capacity(indices.len());
        for idx in indices {
            let mut info = TensorInfo::from_desc(&descs[idx], shapes[idx]);
            if info.qscale == 0.0 || info.dtype.size() == 4 {
                info.qscale = 1.0;
            }
            let mut tensor = Tensor::new(pool.clone());
            tensor.reshape(info.dtype, info.shape)?;
            ios.push(AccelIo {
                desc_index: idx,
                info,
                tensor: Arc::new(Mutex::new(tensor)),
            });
        }
        Ok(ios)
    }

    fn find<'a>(ios: &'a [AccelIo], name: &str, side: &str) -> HalResult<&'a AccelIo> {
        ios.iter()
            .find(|io| io.info.name == name)
            .ok_or_else(|| HalError::InvalidState(format!("no {side} named '{name}'")))
    }

    fn bindings(ios: &[AccelIo]) -> HalResult<Vec<IoBinding>> {
        ios.iter()
            .map(|io| {
                let tensor = lock_tensor(&io.tensor)?;
                let block = tensor.memory_block().ok_or_else(|| {
                    HalError::InvalidState(format!("tensor '{}' has no memory", io.info.name))
                })?;
                if block.backend() != PoolBackend::Device {
                    return Err(HalError::DeviceMemoryTypeMismatch(format!(
                        "tensor '{}' is not in device memory",
                        io.info.name
                    )));
                }
                Ok(IoBinding {
                    device_addr: block.phys_addr(),
                    host_ptr: block.virt_addr(),
                    byte_size: io.info.byte_size,
                    shape: io.info.shape,
                })
            })
            .collect()
    }
}

impl Network for AccelNet {
    fn add_input(&mut self, name: &str) -> HalResult<()> {
        let bound = self.input_names();
        super::declare_io(&mut self.declared_inputs, name, self.state, &bound)
    }

    fn add_output(&mut self, name: &str) -> HalResult<()> {
        let bound = self.output_names();
        super::declare_io(&mut self.declared_outputs, name, self.state, &bound)
    }

    fn setup(&mut self) -> HalResult<()> {
        if self.state != NetState::Unconfigured {
            return Err(HalError::AlreadyInitialized("network already set up".into()));
        }
        let runtime = self.ctx.accel_runtime();
        if let Some(regions) = &self.param.mem_regions {
            regions.validate_against(&runtime.model_mem_info(&self.param.source)?)?;
        }
        let model = self.ctx.load_accel_model(
            &self.param.source,
            self.param.device_id,
            self.param.mem_regions.as_ref(),
        )?;
        let names = runtime.network_names(model.handle())?;
        let network_name = self.resolve_network_name(names)?;
        let desc = runtime.network_desc(model.handle(), &network_name)?;
        if desc.stages.is_empty() {
            return Err(HalError::ModelLoadFailed(format!(
                "network '{network_name}' has no stages"
            )));
        }

        let mut stages: Vec<(usize, StageDesc)> =
            desc.stages.iter().cloned().enumerate().collect();
        stages.sort_by(|a, b| b.1.batch_size().cmp(&a.1.batch_size()));
        let batch_sizes: Vec<usize> = stages.iter().map(|(_, s)| s.batch_size()).collect();

        let pool = self.ctx.create_device_pool(self.param.device_id);
        let largest = stages[0].1.clone();
        self.inputs =
            self.materialize(&pool, &desc, &largest, &self.declared_inputs.clone(), true)?;
        self.outputs =
            self.materialize(&pool, &desc, &largest, &self.declared_outputs.clone(), false)?;

        log::info!(
            "accelerator network '{network_name}' ready on device {}: batches {batch_sizes:?}",
            self.param.device_id
        );
        self.model = Some(model);
        self.network_name = network_name;
        self.pool = Some(pool);
        self.stages = stages;
        self.batch_sizes = batch_sizes;
        self.state = NetState::Ready;
        Ok(())
    }

    fn state(&self) -> NetState {
        self.state
    }

    fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|io| io.info.name.clone()).collect()
    }

    fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|io| io.info.name.clone()).collect()
    }

    fn input_info(&self, name: &str) -> HalResult<TensorInfo> {
        Ok(Self::find(&self.inputs, name, "input")?.info.clone())
    }

    fn output_info(&self, name: &str) -> HalResult<TensorInfo> {
        Ok(Self::find(&self.outputs, name, "output")?.info.clone())
    }

    fn supported_batch_sizes(&self) -> &[usize] {
        &self.batch_sizes
    }

    fn input_tensor(&self, name: &str) -> HalResult<SharedTensor> {
        Ok(Self::find(&self.inputs, name, "input")?.tensor.clone())
    }

    fn output_tensor(&self, name: &str) -> HalResult<SharedTensor> {
        Ok(Self::find(&self.outputs, name, "output")?.tensor.clone())
    }

    fn update_input_tensors(&mut self, batch: usize) -> HalResult<()> {
        if self.state != NetState::Ready {
            return Err(HalError::InvalidState("network not set up".into()));
        }
        let slot = self
            .stages
            .iter()
            .position(|(_, s)| s.batch_size() == batch)
            .ok_or_else(|| HalError::UnsupportedBatchSize {
                requested: batch,
                supported: self.batch_sizes.clone(),
            })?;
        let stage = self.stages[slot].1.clone();
        for io in &mut self.inputs {
            let shape = stage.input_shapes[io.desc_index];
            let mut tensor = lock_tensor(&io.tensor)?;
            // Capacity was sized for the largest stage; smaller batches
            // reuse the block.
            tensor.reshape(io.info.dtype, shape)?;
            io.info = TensorInfo {
                shape,
                elem_count: shape.iter().product(),
                byte_size: shape.iter().product::<usize>() * io.info.dtype.size(),
                ..io.info.clone()
            };
            tensor.flush()?;
        }
        for io in &mut self.outputs {
            let shape = stage.output_shapes[io.desc_index];
            let mut tensor = lock_tensor(&io.tensor)?;
            tensor.reshape(io.info.dtype, shape)?;
            io.info = TensorInfo {
                shape,
                elem_count: shape.iter().product(),
                byte_size: shape.iter().product::<usize>() * io.info.dtype.size(),
                ..io.info.clone()
            };
        }
        self.active_stage = Some(slot);
        Ok(())
    }

    fn forward(&mut self) -> HalResult<()> {
        let slot = self
            .active_stage
            .ok_or_else(|| HalError::InvalidState("no batch committed for forward".into()))?;
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| HalError::InvalidState("network not set up".into()))?;
        let (runtime_stage, _) = self.stages[slot];
        let inputs = Self::bindings(&self.inputs)?;
        let outputs = Self::bindings(&self.outputs)?;
        self.ctx.accel_runtime().launch(
            model.handle(),
            &self.network_name,
            runtime_stage,
            &inputs,
            &outputs,
        )
    }

    fn update_output_tensors(&mut self) -> HalResult<()> {
        if self.active_stage.is_none() {
            return Err(HalError::InvalidState("no completed forward".into()));
        }
        for io in &self.outputs {
            lock_tensor(&io.tensor)?.invalidate()?;
        }
        Ok(())
    }

    fn device_id(&self) -> u32 {
        self.param.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::host::demo_model_doc;
    use crate::net::ModelSource;
    use crate::platform::InferencePlatform;

    fn accel_net(doc: Vec<u8>) -> AccelNet {
        let ctx = HalContext::host();
        let param = NetParam {
            source: ModelSource::Buffer(doc),
            device_id: 0,
            network_name: None,
            mem_regions: None,
            platform: InferencePlatform::Accel,
        };
        AccelNet::new(ctx, param)
    }

    #[test]
    fn test_batch_sizes_sorted_descending() {
        let mut net = accel_net(demo_model_doc());
        net.setup().unwrap();
        assert_eq!(net.supported_batch_sizes(), &[8, 4, 1]);
    }

    #[test]
    fn test_unsupported_batch_size_lists_supported() {
        let mut net = accel_net(demo_model_doc());
        net.setup().unwrap();
        match net.update_input_tensors(3) {
            Err(HalError::UnsupportedBatchSize {
                requested,
                supported,
            }) => {
                assert_eq!(requested, 3);
                assert_eq!(supported, vec![8, 4, 1]);
            }
            other => panic!("expected UnsupportedBatchSize, got {other:?}"),
        }
    }

    #[test]
    fn test_forward_runs_selected_stage() {
        let mut net = accel_net(demo_model_doc());
        net.setup().unwrap();
        net.update_input_tensors(4).unwrap();
        assert_eq!(net.input_info("data").unwrap().shape, [4, 3, 4, 4]);

        let input = net.input_tensor("data").unwrap();
        let bytes = 4 * 3 * 4 * 4;
        let payload: Vec<u8> = (0..bytes as u32).map(|v| v as u8).collect();
        {
            let mut t = lock_tensor(&input).unwrap();
            for b in 0..4 {
                t.batch_slice_mut(b)
                    .unwrap()
                    .copy_from_slice(&payload[b * bytes / 4..(b + 1) * bytes / 4]);
            }
        }
        net.update_input_tensors(4).unwrap();
        net.forward().unwrap();
        net.update_output_tensors().unwrap();

        let output = net.output_tensor("prob").unwrap();
        let t = lock_tensor(&output).unwrap();
        for b in 0..4 {
            assert_eq!(
                t.batch_slice(b).unwrap(),
                &payload[b * bytes / 4..(b + 1) * bytes / 4]
            );
        }
    }

    #[test]
    fn test_multi_network_model_requires_name() {
        let doc = br#"{
            "networks": [
                {"name": "det", "inputs": [{"name": "x", "shape": [1, 3, 4, 4], "dtype": "uint8"}],
                 "outputs": [{"name": "y", "shape": [1, 3, 4, 4], "dtype": "uint8"}]},
                {"name": "cls", "inputs": [{"name": "x", "shape": [1, 3, 4, 4], "dtype": "uint8"}],
                 "outputs": [{"name": "y", "shape": [1, 3, 4, 4], "dtype": "uint8"}]}
            ]
        }"#
        .to_vec();
        let mut net = accel_net(doc.clone());
        match net.setup() {
            Err(HalError::AmbiguousNetworkName { names }) => {
                assert_eq!(names, vec!["det".to_string(), "cls".to_string()]);
            }
            other => panic!("expected AmbiguousNetworkName, got {other:?}"),
        }

        let ctx = HalContext::host();
        let param = NetParam {
            source: ModelSource::Buffer(doc),
            device_id: 0,
            network_name: Some("cls".into()),
            mem_regions: None,
            platform: InferencePlatform::Accel,
        };
        let mut net = AccelNet::new(ctx, param);
        net.setup().unwrap();
        assert_eq!(net.input_names(), vec!["x".to_string()]);
    }

    #[test]
    fn test_undersized_mem_regions_rejected() {
        use crate::net::{MemRegion, RuntimeMemRegions};
        let ctx = HalContext::host();
        let param = NetParam {
            source: ModelSource::Buffer(demo_model_doc()),
            device_id: 0,
            network_name: None,
            mem_regions: Some(RuntimeMemRegions {
                neuron: Some(MemRegion { addr: 0x1000, size: 1 }),
                ..Default::default()
            }),
            platform: InferencePlatform::Accel,
        };
        let mut net = AccelNet::new(ctx, param);
        assert!(matches!(net.setup(), Err(HalError::ModelLoadFailed(_))));
    }
}
