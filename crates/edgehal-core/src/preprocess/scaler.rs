//! Hardware-scaler preprocessing engine.
//!
//! The SoC scaler does the warp and normalization in silicon; this engine
//! only adds the DMA cache discipline around the driver call: flush the
//! source so the scaler reads current pixels, invalidate the destination
//! so the CPU later reads what the scaler wrote.

use std::sync::Arc;

use crate::error::HalResult;
use crate::image::Image;
use crate::preprocess::software::SoftwarePreprocessor;
use crate::preprocess::{PreprocessParams, Preprocessor};

/// Driver seam for the SoC's scaler engine.
pub trait ScalerDriver: Send + Sync {
    fn process(
        &self,
        src: &dyn Image,
        dst: &mut dyn Image,
        params: &PreprocessParams,
    ) -> HalResult<()>;
}

/// CPU stand-in for the scaler hardware.
#[derive(Default)]
pub struct HostScalerDriver {
    engine: SoftwarePreprocessor,
}

impl HostScalerDriver {
    pub fn new() -> Self {
        HostScalerDriver::default()
    }
}

impl ScalerDriver for HostScalerDriver {
    fn process(
        &self,
        src: &dyn Image,
        dst: &mut dyn Image,
        params: &PreprocessParams,
    ) -> HalResult<()> {
        self.engine.preprocess(src, dst, params)
    }
}

pub struct ScalerPreprocessor {
    driver: Arc<dyn ScalerDriver>,
}

impl ScalerPreprocessor {
    pub fn new(driver: Arc<dyn ScalerDriver>) -> Self {
        ScalerPreprocessor { driver }
    }
}

impl Preprocessor for ScalerPreprocessor {
    fn preprocess(
        &self,
        src: &dyn Image,
        dst: &mut dyn Image,
        params: &PreprocessParams,
    ) -> HalResult<()> {
        src.flush_cache()?;
        self.driver.process(src, dst, params)?;
        dst.invalidate_cache()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DataType;
    use crate::image::{ImageFormat, SoftwareImage};
    use crate::memory::{ContigMemoryPool, HostContigAllocator, SharedPool};
    use std::sync::{Arc, Mutex};

    fn contig_pool() -> SharedPool {
        Arc::new(Mutex::new(ContigMemoryPool::new(
            "scaler_test",
            Arc::new(HostContigAllocator::new()),
        )))
    }

    #[test]
    fn test_scaler_path_resizes_through_driver() {
        let mut src = SoftwareImage::new(
            2,
            2,
            ImageFormat::Gray,
            DataType::Uint8,
            Some(contig_pool()),
        )
        .unwrap();
        src.allocate_memory().unwrap();
        src.copy_from_buffer(&[100, 100, 100, 100]).unwrap();
        let mut dst = SoftwareImage::new(
            4,
            4,
            ImageFormat::Gray,
            DataType::Uint8,
            Some(contig_pool()),
        )
        .unwrap();
        dst.allocate_memory().unwrap();
        let pre = ScalerPreprocessor::new(Arc::new(HostScalerDriver::new()));
        pre.preprocess(&src, &mut dst, &PreprocessParams::default())
            .unwrap();
        assert!(dst
            .memory_block()
            .unwrap()
            .as_slice()
            .unwrap()
            .iter()
            .all(|&v| v == 100));
    }
}
