//! End-to-end tests over the public API: context, factories, pipeline,
//! batching, zero-copy and the memory ownership rules.

use std::sync::{Arc, Mutex};

use edgehal_core::context::HalContext;
use edgehal_core::dtype::DataType;
use edgehal_core::error::{HalError, HalResult};
use edgehal_core::factory;
use edgehal_core::image::{read_image, write_image, Image, ImageFormat, SoftwareImage};
use edgehal_core::memory::{lock_pool, CpuMemoryPool, SharedPool};
use edgehal_core::net::{lock_tensor, ModelSource, NetParam, Network};
use edgehal_core::pipeline::{ModelPipeline, OutputParser};
use edgehal_core::platform::InferencePlatform;
use edgehal_core::preprocess::{PreprocessParams, RescaleConfig, SoftwarePreprocessor};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn model_doc() -> Vec<u8> {
    br#"{
        "networks": [{
            "name": "identity",
            "batch_sizes": [1, 4, 8],
            "inputs":  [{"name": "data", "shape": [1, 3, 16, 16], "dtype": "uint8"}],
            "outputs": [{"name": "out",  "shape": [1, 3, 16, 16], "dtype": "uint8"}]
        }]
    }"#
    .to_vec()
}

fn cpu_pool() -> SharedPool {
    Arc::new(Mutex::new(CpuMemoryPool::new()))
}

fn uniform_frame(width: u32, height: u32, value: u8) -> SoftwareImage {
    let mut img = SoftwareImage::new(
        width,
        height,
        ImageFormat::BgrPacked,
        DataType::Uint8,
        Some(cpu_pool()),
    )
    .unwrap();
    img.allocate_memory().unwrap();
    img.copy_from_buffer(&vec![value; (width * height * 3) as usize])
        .unwrap();
    img
}

/// Returns each sample's raw output bytes.
struct RawOutputs;

impl OutputParser for RawOutputs {
    type Output = Vec<u8>;

    fn parse(
        &self,
        net: &dyn Network,
        batch: usize,
        _rescales: &[RescaleConfig],
    ) -> HalResult<Vec<Vec<u8>>> {
        let tensor = net.output_tensor("out")?;
        let guard = lock_tensor(&tensor)?;
        (0..batch)
            .map(|b| Ok(guard.batch_slice(b)?.to_vec()))
            .collect()
    }
}

fn identity_pipeline(ctx: &Arc<HalContext>) -> ModelPipeline<RawOutputs> {
    let param = NetParam {
        source: ModelSource::Buffer(model_doc()),
        device_id: 0,
        network_name: None,
        mem_regions: None,
        platform: InferencePlatform::Accel,
    };
    let net = factory::create_net(ctx, param);
    ModelPipeline::new(net, Box::new(SoftwarePreprocessor::new()), RawOutputs).unwrap()
}

#[test]
fn test_batching_keeps_submission_order() {
    init_logs();
    let ctx = HalContext::host();
    let mut pipeline = identity_pipeline(&ctx);
    assert_eq!(pipeline.network().supported_batch_sizes(), &[8, 4, 1]);

    let frames: Vec<SoftwareImage> = (0..10u32)
        .map(|i| uniform_frame(32, 32, (i * 11) as u8))
        .collect();
    let refs: Vec<&dyn Image> = frames.iter().map(|f| f as &dyn Image).collect();
    let results = pipeline.infer(&refs).unwrap();

    assert_eq!(results.len(), 10);
    assert_eq!(pipeline.rescale_configs().len(), 10);
    for (i, out) in results.iter().enumerate() {
        assert_eq!(out.len(), 3 * 16 * 16);
        assert!(
            out.iter().all(|&v| v == (i * 11) as u8),
            "frame {i} came back out of order"
        );
    }
}

#[test]
fn test_letterbox_mapping_reported_per_frame() {
    init_logs();
    let ctx = HalContext::host();
    let mut pipeline = identity_pipeline(&ctx);
    pipeline.set_preprocess_params(PreprocessParams {
        keep_aspect_ratio: true,
        ..Default::default()
    });

    let wide = uniform_frame(32, 16, 50);
    pipeline.infer_one(&wide).unwrap();
    let cfg = pipeline.rescale_configs()[0];
    assert_eq!(cfg.scale_x, 0.5);
    assert_eq!(cfg.scale_y, 0.5);
    assert_eq!(cfg.offset_x, 0.0);
    assert_eq!(cfg.offset_y, 4.0);

    // Projecting a network-space point back lands on the source frame.
    let (sx, sy) = cfg.invert(8.0, 8.0);
    assert_eq!(sx, 16.0);
    assert_eq!(sy, 8.0);
}

#[test]
fn test_edge_network_aliases_runtime_memory() {
    init_logs();
    let ctx = HalContext::host();
    let param = NetParam {
        source: ModelSource::Buffer(model_doc()),
        device_id: 0,
        network_name: None,
        mem_regions: None,
        platform: InferencePlatform::Edge,
    };
    let mut net = factory::create_net(&ctx, param);
    net.setup().unwrap();
    assert_eq!(net.supported_batch_sizes(), &[1]);

    let input = net.input_tensor("data").unwrap();
    {
        let guard = lock_tensor(&input).unwrap();
        // Zero copy: the tensor borrows the runtime's buffer.
        assert!(!guard.memory_block().unwrap().is_owned());
    }
    let payload: Vec<u8> = (0..(3 * 16 * 16) as u32).map(|v| v as u8).collect();
    lock_tensor(&input)
        .unwrap()
        .batch_slice_mut(0)
        .unwrap()
        .copy_from_slice(&payload);

    net.update_input_tensors(1).unwrap();
    net.forward().unwrap();
    net.update_output_tensors().unwrap();

    let output = net.output_tensor("out").unwrap();
    assert_eq!(
        lock_tensor(&output).unwrap().batch_slice(0).unwrap(),
        &payload[..]
    );
}

#[test]
fn test_borrowed_blocks_survive_release_attempts() {
    init_logs();
    let ctx = HalContext::host();
    let pool = factory::create_memory_pool(&ctx, InferencePlatform::Edge, 0);
    let mut block = lock_pool(&pool).unwrap().allocate(256, 0).unwrap();
    let mut view = block.slice_view(64, 64).unwrap();

    // Cache maintenance is address based and works on the view.
    lock_pool(&pool).unwrap().flush_cache(&view).unwrap();
    lock_pool(&pool).unwrap().invalidate_cache(&view).unwrap();

    // Release is ownership based and must leave the view intact.
    assert!(matches!(
        lock_pool(&pool).unwrap().release(&mut view),
        Err(HalError::BorrowedRelease)
    ));
    assert_eq!(view.size(), 64);
    assert!(!view.virt_addr().is_null());

    lock_pool(&pool).unwrap().release(&mut block).unwrap();
}

#[test]
fn test_image_file_round_trip() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.png");
    let src = uniform_frame(8, 6, 120);
    write_image(&path, &src).unwrap();

    let loaded = read_image(&path, false, cpu_pool()).unwrap();
    assert_eq!(loaded.width(), 8);
    assert_eq!(loaded.height(), 6);
    assert_eq!(loaded.format(), ImageFormat::BgrPacked);
    assert_eq!(
        loaded.memory_block().unwrap().as_slice().unwrap(),
        src.memory_block().unwrap().as_slice().unwrap()
    );
}
