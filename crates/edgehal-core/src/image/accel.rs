//! Accelerator-native image backend.
//!
//! The discrete accelerator's runtime describes images with its own
//! descriptor (geometry, strides, plane sizes, device address). That
//! descriptor is authoritative: wrapping one overrides whatever layout the
//! portable side would have computed, and extracting one reflects the
//! image's current memory exactly.

use std::any::Any;

use crate::dtype::DataType;
use crate::error::{HalError, HalResult};
use crate::image::{Image, ImageFormat, ImageLayout, ImageMem, ImageType};
use crate::memory::{MemoryBlock, PoolBackend, SharedPool};

/// Row alignment the accelerator's image DMA expects.
pub const ACCEL_STRIDE_ALIGN: usize = 64;

/// The accelerator runtime's image descriptor.
#[derive(Debug, Clone)]
pub struct NativeImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub dtype: DataType,
    pub strides: Vec<usize>,
    pub plane_lengths: Vec<usize>,
    pub device_addr: u64,
    pub mapped_addr: *mut u8,
}

pub struct AcceleratorImage {
    layout: ImageLayout,
    mem: ImageMem,
}

impl AcceleratorImage {
    pub fn new(
        width: u32,
        height: u32,
        format: ImageFormat,
        dtype: DataType,
        pool: Option<SharedPool>,
    ) -> HalResult<AcceleratorImage> {
        let layout = ImageLayout::compute(width, height, format, dtype, ACCEL_STRIDE_ALIGN)?;
        Ok(AcceleratorImage {
            layout,
            mem: ImageMem { pool, block: None },
        })
    }

    /// Wrap a descriptor the runtime produced. Its geometry wins over the
    /// locally computed layout; the memory stays owned by the runtime.
    pub fn from_native(desc: NativeImageDesc) -> HalResult<AcceleratorImage> {
        let mut layout =
            ImageLayout::compute(desc.width, desc.height, desc.format, desc.dtype, 1)?;
        layout.strides = desc.strides.clone();
        layout.plane_lengths = desc.plane_lengths.clone();
        let total = layout.byte_size();
        let block =
            MemoryBlock::borrowed(PoolBackend::Device, desc.mapped_addr, desc.device_addr, total);
        let mut mem = ImageMem::default();
        mem.adopt(block, total)?;
        Ok(AcceleratorImage { layout, mem })
    }

    /// Build the runtime descriptor for the current memory.
    pub fn extract(&self) -> HalResult<NativeImageDesc> {
        let block = self
            .mem
            .block
            .as_ref()
            .ok_or_else(|| HalError::InvalidState("image memory not set up".into()))?;
        Ok(NativeImageDesc {
            width: self.layout.width,
            height: self.layout.height,
            format: self.layout.format,
            dtype: self.layout.dtype,
            strides: self.layout.strides.clone(),
            plane_lengths: self.layout.plane_lengths.clone(),
            device_addr: block.phys_addr(),
            mapped_addr: block.virt_addr(),
        })
    }
}

impl Image for AcceleratorImage {
    fn image_type(&self) -> ImageType {
        ImageType::Accelerator
    }

    fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    fn prepare_image_info(
        &mut self,
        width: u32,
        height: u32,
        format: ImageFormat,
        dtype: DataType,
    ) -> HalResult<()> {
        if self.mem.block.is_some() {
            return Err(HalError::AlreadyInitialized(
                "cannot change geometry while memory is attached".into(),
            ));
        }
        self.layout = ImageLayout::compute(width, height, format, dtype, ACCEL_STRIDE_ALIGN)?;
        Ok(())
    }

    fn set_pool(&mut self, pool: SharedPool) {
        self.mem.pool = Some(pool);
    }

    fn allocate_memory(&mut self) -> HalResult<()> {
        let block = self.mem.allocate(self.layout.byte_size())?;
        self.mem.block = Some(block);
        Ok(())
    }

    fn free_memory(&mut self) -> HalResult<()> {
        self.mem.free()
    }

    fn setup_memory_block(&mut self, block: MemoryBlock) -> HalResult<()> {
        self.mem.adopt(block, self.layout.byte_size())
    }

    fn memory_block(&self) -> Option<&MemoryBlock> {
        self.mem.block.as_ref()
    }

    fn flush_cache(&self) -> HalResult<()> {
        match self.mem.pool {
            Some(_) => self.mem.flush(),
            // Runtime-owned descriptors synchronize through the runtime.
            None => Ok(()),
        }
    }

    fn invalidate_cache(&self) -> HalResult<()> {
        match self.mem.pool {
            Some(_) => self.mem.invalidate(),
            None => Ok(()),
        }
    }

    fn copy_from_buffer(&mut self, data: &[u8]) -> HalResult<()> {
        let expected = self.layout.byte_size();
        if data.len() != expected {
            return Err(HalError::ShapeMismatch {
                expected: format!("{expected} bytes"),
                actual: format!("{} bytes", data.len()),
            });
        }
        let block = self
            .mem
            .block
            .as_mut()
            .ok_or_else(|| HalError::InvalidState("image memory not set up".into()))?;
        block.as_mut_slice()?.copy_from_slice(data);
        self.flush_cache()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DeviceMemoryPool, HostDeviceAllocator};
    use std::sync::{Arc, Mutex};

    fn device_pool() -> SharedPool {
        Arc::new(Mutex::new(DeviceMemoryPool::new(
            0,
            Arc::new(HostDeviceAllocator::new()),
        )))
    }

    #[test]
    fn test_native_descriptor_geometry_is_authoritative() {
        let mut backing = vec![0u8; 256 * 4];
        let desc = NativeImageDesc {
            width: 100,
            height: 4,
            format: ImageFormat::Gray,
            dtype: DataType::Uint8,
            // The runtime padded rows to 256, wider than our own alignment.
            strides: vec![256],
            plane_lengths: vec![256 * 4],
            device_addr: 0x4000,
            mapped_addr: backing.as_mut_ptr(),
        };
        let img = AcceleratorImage::from_native(desc).unwrap();
        assert_eq!(img.layout().strides[0], 256);
        assert!(!img.is_aligned());
        assert!(!img.memory_block().unwrap().is_owned());
    }

    #[test]
    fn test_extract_round_trips_addresses() {
        let mut img = AcceleratorImage::new(
            32,
            8,
            ImageFormat::RgbPlanar,
            DataType::Uint8,
            Some(device_pool()),
        )
        .unwrap();
        img.allocate_memory().unwrap();
        let desc = img.extract().unwrap();
        assert_eq!(desc.device_addr, img.memory_block().unwrap().phys_addr());
        assert_eq!(desc.plane_lengths, img.layout().plane_lengths);
        img.free_memory().unwrap();
    }
}
