//! Integrated-NPU network backend.
//!
//! The edge runtime fixes its I/O buffers at registration time, so tensors
//! here alias runtime memory directly (zero copy) and the backend only
//! runs batch 1. Coherency over those buffers is the runtime's own
//! business; the tensors ride a CPU pool whose cache ops are no-ops.

use std::sync::{Arc, Mutex};

use crate::context::HalContext;
use crate::error::{HalError, HalResult};
use crate::memory::{MemoryBlock, PoolBackend};
use crate::net::driver::EdgeIoDesc;
use crate::net::{
    lock_tensor, NetParam, NetState, Network, SharedTensor, TensorInfo,
};
use crate::tensor::Tensor;

struct EdgeIo {
    info: TensorInfo,
    tensor: SharedTensor,
}

pub struct EdgeNet {
    ctx: Arc<HalContext>,
    param: NetParam,
    instance: Option<u64>,
    state: NetState,
    declared_inputs: Vec<String>,
    declared_outputs: Vec<String>,
    inputs: Vec<EdgeIo>,
    outputs: Vec<EdgeIo>,
    batch_sizes: Vec<usize>,
}

impl EdgeNet {
    pub fn new(ctx: Arc<HalContext>, param: NetParam) -> EdgeNet {
        EdgeNet {
            ctx,
            param,
            instance: None,
            state: NetState::Unconfigured,
            declared_inputs: Vec::new(),
            declared_outputs: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            batch_sizes: vec![1],
        }
    }

    fn materialize(
        &self,
        descs: Vec<EdgeIoDesc>,
        declared: &[String],
        side: &str,
    ) -> HalResult<Vec<EdgeIo>> {
        let selected: Vec<&EdgeIoDesc> = if declared.is_empty() {
            descs.iter().collect()
        } else {
            declared
                .iter()
                .map(|name| {
                    descs.iter().find(|d| d.desc.name == *name).ok_or_else(|| {
                        HalError::ModelLoadFailed(format!("model has no {side} named '{name}'"))
                    })
                })
                .collect::<HalResult<_>>()?
        };
        let mut ios = Vec::with_capacity(selected.len());
        for desc in selected {
            let mut info = TensorInfo::from_desc(&desc.desc, desc.desc.shape);
            // The runtime reports zero for unquantized I/O.
            if info.qscale == 0.0 || info.dtype.size() == 4 {
                info.qscale = 1.0;
            }
            let alias = MemoryBlock::borrowed(
                PoolBackend::Cpu,
                desc.host_ptr,
                desc.phys_addr,
                desc.byte_size,
            );
            let mut tensor = Tensor::new(self.ctx.create_cpu_pool());
            tensor.share_memory(alias, info.dtype, info.shape)?;
            ios.push(EdgeIo {
                info,
                tensor: Arc::new(Mutex::new(tensor)),
            });
        }
        Ok(ios)
    }

    fn find<'a>(ios: &'a [EdgeIo], name: &str, side: &str) -> HalResult<&'a EdgeIo> {
        ios.iter()
            .find(|io| io.info.name == name)
            .ok_or_else(|| HalError::InvalidState(format!("no {side} named '{name}'")))
    }

    fn ready(&self) -> HalResult<u64> {
        self.instance
            .ok_or_else(|| HalError::InvalidState("network not set up".into()))
    }
}

impl Network for EdgeNet {
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
        let runtime = self.ctx.edge_runtime();
        let instance = runtime.register(&self.param.source)?;
        let (in_descs, out_descs) = match runtime.io_descriptors(instance) {
            Ok(descs) => descs,
            Err(e) => {
                runtime.cleanup(instance);
                return Err(e);
            }
        };
        let built = self
            .materialize(in_descs, &self.declared_inputs.clone(), "input")
            .and_then(|inputs| {
                let outputs =
                    self.materialize(out_descs, &self.declared_outputs.clone(), "output")?;
                Ok((inputs, outputs))
            });
        match built {
            Ok((inputs, outputs)) => {
                self.inputs = inputs;
                self.outputs = outputs;
                self.instance = Some(instance);
                self.state = NetState::Ready;
                log::info!(
                    "edge network ready: {} inputs, {} outputs",
                    self.inputs.len(),
                    self.outputs.len()
                );
                Ok(())
            }
            Err(e) => {
                runtime.cleanup(instance);
                Err(e)
            }
        }
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
        self.ready()?;
        if batch != 1 {
            return Err(HalError::UnsupportedBatchSize {
                requested: batch,
                supported: self.batch_sizes.clone(),
            });
        }
        for io in &self.inputs {
            lock_tensor(&io.tensor)?.flush()?;
        }
        Ok(())
    }

    fn forward(&mut self) -> HalResult<()> {
        let instance = self.ready()?;
        self.ctx.edge_runtime().forward(instance)
    }

    fn update_output_tensors(&mut self) -> HalResult<()> {
        self.ready()?;
        for io in &self.outputs {
            lock_tensor(&io.tensor)?.invalidate()?;
        }
        Ok(())
    }

    fn device_id(&self) -> u32 {
        self.param.device_id
    }
}

impl Drop for EdgeNet {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.ctx.edge_runtime().cleanup(instance);
        }
    }
}
