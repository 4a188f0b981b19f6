//! Platform factories.
//!
//! One dispatch point maps a resolved [`InferencePlatform`] onto the
//! concrete pool, image, network and preprocessor types for that hardware
//! family. Callers hold trait objects and never name a backend directly.

use std::sync::Arc;

use crate::context::HalContext;
use crate::dtype::DataType;
use crate::error::HalResult;
use crate::image::{AcceleratorImage, Image, ImageFormat, SoftwareImage, VideoFrameImage};
use crate::memory::SharedPool;
use crate::net::{AccelNet, EdgeNet, NetParam, Network};
use crate::platform::InferencePlatform;
use crate::preprocess::{Preprocessor, ScalerPreprocessor, SoftwarePreprocessor};

fn resolve(ctx: &HalContext, platform: InferencePlatform) -> InferencePlatform {
    // A context declared Automatic behaves as the CPU model.
    platform
        .resolve(ctx.platform())
        .resolve(InferencePlatform::Host)
}

/// Memory pool for a platform's tensor traffic: contiguous memory on the
/// edge, device memory on the accelerator, heap on the host.
pub fn create_memory_pool(
    ctx: &Arc<HalContext>,
    platform: InferencePlatform,
    device_id: u32,
) -> SharedPool {
    match resolve(ctx, platform) {
        InferencePlatform::Edge => ctx.create_contig_pool(format!("tensor_dev{device_id}")),
        InferencePlatform::Accel => ctx.create_device_pool(device_id),
        _ => ctx.create_cpu_pool(),
    }
}

/// Frame container for a platform's camera path.
pub fn create_image(
    ctx: &Arc<HalContext>,
    platform: InferencePlatform,
    width: u32,
    height: u32,
    format: ImageFormat,
    dtype: DataType,
) -> HalResult<Box<dyn Image>> {
    let pool = create_memory_pool(ctx, platform, 0);
    Ok(match resolve(ctx, platform) {
        InferencePlatform::Edge => Box::new(VideoFrameImage::new(
            width,
            height,
            format,
            dtype,
            Some(pool),
        )?),
        InferencePlatform::Accel => Box::new(AcceleratorImage::new(
            width,
            height,
            format,
            dtype,
            Some(pool),
        )?),
        _ => Box::new(SoftwareImage::new(width, height, format, dtype, Some(pool))?),
    })
}

/// Network backend for a platform. `param.platform` wins over the
/// context's platform when it names one explicitly.
pub fn create_net(ctx: &Arc<HalContext>, param: NetParam) -> Box<dyn Network> {
    match resolve(ctx, param.platform) {
        InferencePlatform::Edge => Box::new(EdgeNet::new(ctx.clone(), param)),
        // The host CPU model serves the accelerator contract.
        _ => Box::new(AccelNet::new(ctx.clone(), param)),
    }
}

/// Preprocessing engine for a platform: the hardware scaler on the edge,
/// CPU kernels everywhere else.
pub fn create_preprocessor(
    ctx: &Arc<HalContext>,
    platform: InferencePlatform,
) -> Box<dyn Preprocessor> {
    match resolve(ctx, platform) {
        InferencePlatform::Edge => Box::new(ScalerPreprocessor::new(ctx.scaler_driver())),
        _ => Box::new(SoftwarePreprocessor::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageType;
    use crate::memory::{lock_pool, PoolBackend};

    #[test]
    fn test_pool_backend_follows_platform() {
        let ctx = HalContext::host();
        let edge = create_memory_pool(&ctx, InferencePlatform::Edge, 0);
        assert_eq!(lock_pool(&edge).unwrap().backend(), PoolBackend::Contig);
        let accel = create_memory_pool(&ctx, InferencePlatform::Accel, 0);
        assert_eq!(lock_pool(&accel).unwrap().backend(), PoolBackend::Device);
        let auto = create_memory_pool(&ctx, InferencePlatform::Automatic, 0);
        assert_eq!(lock_pool(&auto).unwrap().backend(), PoolBackend::Cpu);
    }

    #[test]
    fn test_image_backend_follows_platform() {
        let ctx = HalContext::host();
        let img = create_image(
            &ctx,
            InferencePlatform::Edge,
            64,
            64,
            ImageFormat::Yuv420SpUv,
            DataType::Uint8,
        )
        .unwrap();
        assert_eq!(img.image_type(), ImageType::VideoFrame);
        let img = create_image(
            &ctx,
            InferencePlatform::Automatic,
            64,
            64,
            ImageFormat::BgrPacked,
            DataType::Uint8,
        )
        .unwrap();
        assert_eq!(img.image_type(), ImageType::Software);
    }
}
