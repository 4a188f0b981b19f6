//! Minimal classification-style run against the CPU-model drivers.
//!
//! Usage: `cargo run --example classify_demo [image.png]`
//!
//! Without an argument a synthetic frame is used. The model is the
//! identity CPU model, so the "logits" are just the preprocessed pixels;
//! the point is to show the full flow: context, factories, pipeline.

use std::sync::{Arc, Mutex};

use edgehal_core::context::HalContext;
use edgehal_core::dtype::DataType;
use edgehal_core::error::HalResult;
use edgehal_core::factory;
use edgehal_core::image::{read_image, Image, ImageFormat, SoftwareImage};
use edgehal_core::memory::CpuMemoryPool;
use edgehal_core::net::{lock_tensor, ModelSource, NetParam, Network};
use edgehal_core::pipeline::{ModelPipeline, OutputParser};
use edgehal_core::platform::InferencePlatform;
use edgehal_core::preprocess::{PreprocessParams, RescaleConfig, SoftwarePreprocessor};

const MODEL: &[u8] = br#"{
    "networks": [{
        "name": "classifier",
        "batch_sizes": [1, 4],
        "inputs":  [{"name": "data",   "shape": [1, 3, 32, 32], "dtype": "uint8"}],
        "outputs": [{"name": "logits", "shape": [1, 3, 32, 32], "dtype": "uint8"}]
    }]
}"#;

struct TopByte;

impl OutputParser for TopByte {
    type Output = u8;

    fn parse(
        &self,
        net: &dyn Network,
        batch: usize,
        _rescales: &[RescaleConfig],
    ) -> HalResult<Vec<u8>> {
        let tensor = net.output_tensor("logits")?;
        let guard = lock_tensor(&tensor)?;
        (0..batch)
            .map(|b| {
                Ok(guard
                    .batch_slice(b)?
                    .iter()
                    .copied()
                    .max()
                    .unwrap_or_default())
            })
            .collect()
    }
}

fn main() -> HalResult<()> {
    env_logger::init();

    let ctx = HalContext::host();
    let frame: SoftwareImage = match std::env::args().nth(1) {
        Some(path) => read_image(
            path.as_ref(),
            false,
            Arc::new(Mutex::new(CpuMemoryPool::new())),
        )?,
        None => {
            let mut img = SoftwareImage::new(
                64,
                48,
                ImageFormat::BgrPacked,
                DataType::Uint8,
                Some(Arc::new(Mutex::new(CpuMemoryPool::new()))),
            )?;
            img.allocate_memory()?;
            let data: Vec<u8> = (0..64 * 48 * 3).map(|i| (i % 251) as u8).collect();
            img.copy_from_buffer(&data)?;
            img
        }
    };

    let param = NetParam {
        source: ModelSource::Buffer(MODEL.to_vec()),
        device_id: 0,
        network_name: None,
        mem_regions: None,
        platform: InferencePlatform::Automatic,
    };
    let net = factory::create_net(&ctx, param);
    let mut pipeline = ModelPipeline::new(net, Box::new(SoftwarePreprocessor::new()), TopByte)?;
    pipeline.set_preprocess_params(PreprocessParams {
        keep_aspect_ratio: true,
        ..Default::default()
    });

    let top = pipeline.infer_one(&frame)?;
    let cfg = pipeline.rescale_configs()[0];
    println!(
        "frame {}x{} -> top byte {top}, rescale {:?}",
        frame.width(),
        frame.height(),
        cfg
    );
    Ok(())
}
