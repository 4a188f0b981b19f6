//! Model pipeline: preprocessing, batch scheduling and output parsing
//! around one network.
//!
//! A run over N frames is split greedily: the largest supported batch size
//! that still fits the remaining frames wins each round, so 10 frames on a
//! {8, 4, 1} network run as 8 + 1 + 1. Each frame's forward rescale
//! mapping is collected in submission order so parsers can project network
//! coordinates back onto the original frames.
//!
//! Frames that already alias the input tensor's batch slots (tensor views)
//! skip preprocessing entirely and report an identity mapping.

use crate::error::{HalError, HalResult};
use crate::image::{Image, ImageFormat, ImageType};
use crate::net::{lock_tensor, NetState, Network};
use crate::preprocess::{PreprocessParams, Preprocessor, RescaleConfig};

/// Turns raw network outputs into domain results.
pub trait OutputParser {
    type Output;

    /// Parse one completed batch. `rescales` holds the forward mapping for
    /// each sample in the batch, in slot order.
    fn parse(
        &self,
        net: &dyn Network,
        batch: usize,
        rescales: &[RescaleConfig],
    ) -> HalResult<Vec<Self::Output>>;
}

pub struct ModelPipeline<P: OutputParser> {
    net: Box<dyn Network>,
    preprocessor: Box<dyn Preprocessor>,
    parser: P,
    params: PreprocessParams,
    /// `params` with the input's quantization scale folded in.
    folded: PreprocessParams,
    input_name: String,
    input_qscale: f32,
    dst_width: u32,
    dst_height: u32,
    dst_format: ImageFormat,
    rescale_configs: Vec<RescaleConfig>,
}

impl<P: OutputParser> ModelPipeline<P> {
    /// Build a pipeline around a network, setting it up if needed. Input
    /// geometry and sample type come from the network's first input.
    pub fn new(
        mut net: Box<dyn Network>,
        preprocessor: Box<dyn Preprocessor>,
        parser: P,
    ) -> HalResult<ModelPipeline<P>> {
        if net.state() == NetState::Unconfigured {
            net.setup()?;
        }
        let input_name = net
            .input_names()
            .into_iter()
            .next()
            .ok_or_else(|| HalError::InvalidState("network has no inputs".into()))?;
        let info = net.input_info(&input_name)?;
        let dst_format = match info.shape[1] {
            1 => ImageFormat::Gray,
            3 => ImageFormat::RgbPlanar,
            c => {
                return Err(HalError::UnsupportedFormat(format!(
                    "cannot preprocess into a {c}-channel input"
                )))
            }
        };
        let mut pipeline = ModelPipeline {
            net,
            preprocessor,
            parser,
            params: PreprocessParams::default(),
            folded: PreprocessParams::default(),
            input_name,
            input_qscale: info.qscale,
            dst_width: info.shape[3] as u32,
            dst_height: info.shape[2] as u32,
            dst_format,
            rescale_configs: Vec::new(),
        };
        pipeline.set_preprocess_params(PreprocessParams::default());
        Ok(pipeline)
    }

    pub fn network(&self) -> &dyn Network {
        self.net.as_ref()
    }

    pub fn preprocess_params(&self) -> &PreprocessParams {
        &self.params
    }

    /// Set the float-domain normalization; the input's quantization scale
    /// is folded into the per-channel factors here, once.
    pub fn set_preprocess_params(&mut self, params: PreprocessParams) {
        let mut folded = params.clone();
        for c in 0..3 {
            folded.scale[c] = params.scale[c] * self.input_qscale;
        }
        self.params = params;
        self.folded = folded;
    }

    /// Network input to BGR channel order means the planar target is
    /// written in BGR; callers preprocessing BGR-trained models set this.
    pub fn set_bgr_input(&mut self, bgr: bool) {
        self.dst_format = match (self.dst_format, bgr) {
            (ImageFormat::RgbPlanar | ImageFormat::BgrPlanar, true) => ImageFormat::BgrPlanar,
            (ImageFormat::RgbPlanar | ImageFormat::BgrPlanar, false) => ImageFormat::RgbPlanar,
            (other, _) => other,
        };
    }

    /// Forward rescale mappings of the last run, one per frame in
    /// submission order.
    pub fn rescale_configs(&self) -> &[RescaleConfig] {
        &self.rescale_configs
    }

    /// Largest supported batch that fits `remaining` frames.
    fn fit_batch_size(&self, remaining: usize) -> HalResult<usize> {
        let supported = self.net.supported_batch_sizes();
        supported
            .iter()
            .copied()
            .find(|&b| b <= remaining)
            .ok_or_else(|| HalError::UnsupportedBatchSize {
                requested: remaining,
                supported: supported.to_vec(),
            })
    }

    /// Run inference over `frames`, batching greedily. Results come back
    /// one per frame, in submission order.
    pub fn infer(&mut self, frames: &[&dyn Image]) -> HalResult<Vec<P::Output>> {
        if frames.is_empty() {
            return Err(HalError::InvalidState(
                "inference called with no frames".into(),
            ));
        }
        self.rescale_configs.clear();
        let mut results = Vec::with_capacity(frames.len());
        let mut offset = 0;
        while offset < frames.len() {
            let batch = self.fit_batch_size(frames.len() - offset)?;
            let chunk = &frames[offset..offset + batch];
            let chunk_rescales = self.run_chunk(chunk, batch)?;
            let parsed = self.parser.parse(self.net.as_ref(), batch, &chunk_rescales)?;
            if parsed.len() != batch {
                return Err(HalError::InvalidState(format!(
                    "parser produced {} results for a batch of {batch}",
                    parsed.len()
                )));
            }
            results.extend(parsed);
            self.rescale_configs.extend(chunk_rescales);
            offset += batch;
        }
        Ok(results)
    }

    pub fn infer_one(&mut self, frame: &dyn Image) -> HalResult<P::Output> {
        let mut results = self.infer(&[frame])?;
        results
            .pop()
            .ok_or_else(|| HalError::InvalidState("inference produced no result".into()))
    }

    fn run_chunk(&mut self, chunk: &[&dyn Image], batch: usize) -> HalResult<Vec<RescaleConfig>> {
        // First commit sets the stage shapes so the slots alias correctly.
        self.net.update_input_tensors(batch)?;
        let tensor = self.net.input_tensor(&self.input_name)?;
        let mut rescales = Vec::with_capacity(batch);
        for (slot, frame) in chunk.iter().enumerate() {
            if frame.image_type() == ImageType::TensorView {
                let slot_ptr = lock_tensor(&tensor)?.batch_ptr(slot)?;
                let frame_ptr = frame
                    .memory_block()
                    .ok_or_else(|| {
                        HalError::InvalidState("tensor view has no memory".into())
                    })?
                    .virt_addr();
                if frame_ptr != slot_ptr {
                    return Err(HalError::InvalidState(format!(
                        "tensor view does not alias input slot {slot}"
                    )));
                }
                rescales.push(RescaleConfig::identity());
                continue;
            }
            {
                let mut guard = lock_tensor(&tensor)?;
                self.preprocessor.preprocess_to_tensor(
                    *frame,
                    &mut guard,
                    slot,
                    self.dst_width,
                    self.dst_height,
                    self.dst_format,
                    &self.folded,
                )?;
            }
            rescales.push(self.preprocessor.rescale_config(
                &self.params,
                *frame,
                self.dst_width,
                self.dst_height,
            ));
        }
        // Second commit flushes the freshly written slots.
        self.net.update_input_tensors(batch)?;
        self.net.forward()?;
        self.net.update_output_tensors()?;
        Ok(rescales)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HalContext;
    use crate::dtype::DataType;
    use crate::memory::{CpuMemoryPool, SharedPool};
    use crate::net::host::demo_model_doc;
    use crate::net::{AccelNet, ModelSource, NetParam};
    use crate::image::SoftwareImage;
    use crate::platform::InferencePlatform;
    use crate::preprocess::SoftwarePreprocessor;
    use std::sync::{Arc, Mutex};

    /// Collects each sample's raw output bytes.
    struct BytesParser {
        output_name: String,
    }

    impl OutputParser for BytesParser {
        type Output = Vec<u8>;

        fn parse(
            &self,
            net: &dyn Network,
            batch: usize,
            rescales: &[RescaleConfig],
        ) -> HalResult<Vec<Vec<u8>>> {
            assert_eq!(rescales.len(), batch);
            let tensor = net.output_tensor(&self.output_name)?;
            let guard = lock_tensor(&tensor)?;
            (0..batch)
                .map(|b| Ok(guard.batch_slice(b)?.to_vec()))
                .collect()
        }
    }

    fn cpu_pool() -> SharedPool {
        Arc::new(Mutex::new(CpuMemoryPool::new()))
    }

    fn pipeline() -> ModelPipeline<BytesParser> {
        let ctx = HalContext::host();
        let param = NetParam {
            source: ModelSource::Buffer(demo_model_doc()),
            device_id: 0,
            network_name: None,
            mem_regions: None,
            platform: InferencePlatform::Accel,
        };
        let net = AccelNet::new(ctx, param);
        ModelPipeline::new(
            Box::new(net),
            Box::new(SoftwarePreprocessor::new()),
            BytesParser {
                output_name: "prob".into(),
            },
        )
        .unwrap()
    }

    fn frame(value: u8) -> SoftwareImage {
        let mut img = SoftwareImage::new(
            8,
            8,
            ImageFormat::RgbPacked,
            DataType::Uint8,
            Some(cpu_pool()),
        )
        .unwrap();
        img.allocate_memory().unwrap();
        img.copy_from_buffer(&vec![value; 8 * 8 * 3]).unwrap();
        img
    }

    #[test]
    fn test_greedy_batching_covers_all_frames() {
        let mut p = pipeline();
        let frames: Vec<SoftwareImage> = (0..10).map(|i| frame(i * 20)).collect();
        let refs: Vec<&dyn Image> = frames.iter().map(|f| f as &dyn Image).collect();
        let results = p.infer(&refs).unwrap();
        // 10 frames on {8, 4, 1}: one batch of 8, then 1 + 1.
        assert_eq!(results.len(), 10);
        assert_eq!(p.rescale_configs().len(), 10);
        // The identity model echoes each preprocessed frame, so a uniform
        // frame of value v comes back as all-v samples.
        for (i, out) in results.iter().enumerate() {
            assert_eq!(out.len(), 48);
            assert!(out.iter().all(|&v| v == i as u8 * 20), "frame {i}");
        }
    }

    #[test]
    fn test_empty_input_rejected() {
        let mut p = pipeline();
        assert!(matches!(p.infer(&[]), Err(HalError::InvalidState(_))));
    }

    #[test]
    fn test_rescale_configs_reported_per_frame() {
        let mut p = pipeline();
        let f = frame(100);
        p.infer_one(&f).unwrap();
        let cfg = p.rescale_configs()[0];
        // 8x8 into 4x4 is a plain 0.5x resize.
        assert_eq!(cfg.scale_x, 0.5);
        assert_eq!(cfg.scale_y, 0.5);
        assert_eq!(cfg.offset_x, 0.0);
        assert_eq!(cfg.offset_y, 0.0);
    }

    #[test]
    fn test_tensor_view_frames_skip_preprocessing() {
        let mut p = pipeline();
        // Stage the batch-1 shape, then alias slot 0 directly.
        p.net.update_input_tensors(1).unwrap();
        let tensor = p.net.input_tensor("data").unwrap();
        let view = {
            let guard = lock_tensor(&tensor).unwrap();
            let mut view = guard
                .construct_image_view(0, 4, 4, ImageFormat::RgbPlanar)
                .unwrap();
            drop(guard);
            view.copy_from_buffer(&vec![42u8; 48]).unwrap();
            view
        };
        let result = p.infer_one(&view).unwrap();
        assert!(result.iter().all(|&v| v == 42));
        assert_eq!(p.rescale_configs()[0], RescaleConfig::identity());
    }

    #[test]
    fn test_quantization_scale_folds_into_params() {
        let doc = br#"{
            "networks": [{
                "name": "q",
                "inputs":  [{"name": "x", "shape": [1, 3, 4, 4], "dtype": "int8", "qscale": 2.0}],
                "outputs": [{"name": "y", "shape": [1, 3, 4, 4], "dtype": "int8"}]
            }]
        }"#
        .to_vec();
        let ctx = HalContext::host();
        let param = NetParam {
            source: ModelSource::Buffer(doc),
            device_id: 0,
            network_name: None,
            mem_regions: None,
            platform: InferencePlatform::Accel,
        };
        let mut p = ModelPipeline::new(
            Box::new(AccelNet::new(ctx, param)),
            Box::new(SoftwarePreprocessor::new()),
            BytesParser {
                output_name: "y".into(),
            },
        )
        .unwrap();
        p.set_preprocess_params(PreprocessParams {
            scale: [0.5; 3],
            ..Default::default()
        });
        assert_eq!(p.folded.scale, [1.0; 3]);
        assert_eq!(p.params.scale, [0.5; 3]);
    }
}
