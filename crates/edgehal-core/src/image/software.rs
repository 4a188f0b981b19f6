//! Software image backend.
//!
//! Layout is computed locally with no hardware row alignment, so strides
//! are always tightly packed. This backend also provides the non-owning
//! views the pipeline uses to alias tensor batch slots.

use std::any::Any;

use crate::dtype::DataType;
use crate::error::{HalError, HalResult};
use crate::image::{Image, ImageFormat, ImageLayout, ImageMem, ImageType};
use crate::memory::{MemoryBlock, SharedPool};

pub struct SoftwareImage {
    layout: ImageLayout,
    mem: ImageMem,
    image_type: ImageType,
}

impl SoftwareImage {
    pub fn new(
        width: u32,
        height: u32,
        format: ImageFormat,
        dtype: DataType,
        pool: Option<SharedPool>,
    ) -> HalResult<SoftwareImage> {
        let layout = ImageLayout::compute(width, height, format, dtype, 1)?;
        Ok(SoftwareImage {
            layout,
            mem: ImageMem {
                pool,
                block: None,
            },
            image_type: ImageType::Software,
        })
    }

    /// Non-owning view over caller-provided memory (a tensor batch slot, a
    /// decoder's output buffer). The block must match the layout's size.
    pub fn view(
        width: u32,
        height: u32,
        format: ImageFormat,
        dtype: DataType,
        block: MemoryBlock,
    ) -> HalResult<SoftwareImage> {
        let layout = ImageLayout::compute(width, height, format, dtype, 1)?;
        let mut mem = ImageMem::default();
        mem.adopt(block, layout.byte_size())?;
        Ok(SoftwareImage {
            layout,
            mem,
            image_type: ImageType::TensorView,
        })
    }

    /// Single-plane raw buffer (feature vectors, audio frames). `width` is
    /// the element count per row.
    pub fn raw(
        width: u32,
        height: u32,
        dtype: DataType,
        pool: Option<SharedPool>,
    ) -> HalResult<SoftwareImage> {
        let mut img = SoftwareImage::new(width, height, ImageFormat::Gray, dtype, pool)?;
        img.image_type = ImageType::Raw;
        Ok(img)
    }
}

impl Image for SoftwareImage {
    fn image_type(&self) -> ImageType {
        self.image_type
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
        self.layout = ImageLayout::compute(width, height, format, dtype, 1)?;
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
            // Views without a pool have no coherency boundary of their own.
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
    use crate::memory::{CpuMemoryPool, PoolBackend};
    use std::sync::{Arc, Mutex};

    fn cpu_pool() -> SharedPool {
        Arc::new(Mutex::new(CpuMemoryPool::new()))
    }

    #[test]
    fn test_allocate_requires_pool() {
        let mut img =
            SoftwareImage::new(8, 8, ImageFormat::BgrPacked, DataType::Uint8, None).unwrap();
        assert!(matches!(
            img.allocate_memory(),
            Err(HalError::PoolUnattached)
        ));
        img.set_pool(cpu_pool());
        img.allocate_memory().unwrap();
        assert!(img.is_initialized());
        assert!(matches!(
            img.allocate_memory(),
            Err(HalError::AlreadyInitialized(_))
        ));
        img.free_memory().unwrap();
        assert!(!img.is_initialized());
    }

    #[test]
    fn test_setup_memory_block_checks_length() {
        let mut img =
            SoftwareImage::new(4, 4, ImageFormat::Gray, DataType::Uint8, None).unwrap();
        let mut backing = vec![0u8; 15];
        let wrong = MemoryBlock::borrowed(PoolBackend::Cpu, backing.as_mut_ptr(), 0, 15);
        assert!(matches!(
            img.setup_memory_block(wrong),
            Err(HalError::ShapeMismatch { .. })
        ));
        let mut backing = vec![0u8; 16];
        let right = MemoryBlock::borrowed(PoolBackend::Cpu, backing.as_mut_ptr(), 0, 16);
        img.setup_memory_block(right).unwrap();
    }

    #[test]
    fn test_copy_from_buffer_round_trip() {
        let mut img = SoftwareImage::new(
            2,
            2,
            ImageFormat::RgbPacked,
            DataType::Uint8,
            Some(cpu_pool()),
        )
        .unwrap();
        img.allocate_memory().unwrap();
        let data: Vec<u8> = (0..12).collect();
        img.copy_from_buffer(&data).unwrap();
        assert_eq!(img.memory_block().unwrap().as_slice().unwrap(), &data[..]);
        img.free_memory().unwrap();
    }

    #[test]
    fn test_planar_plane_addresses() {
        let mut img = SoftwareImage::new(
            4,
            2,
            ImageFormat::RgbPlanar,
            DataType::Uint8,
            Some(cpu_pool()),
        )
        .unwrap();
        img.allocate_memory().unwrap();
        let virts = img.virtual_address().unwrap();
        assert_eq!(virts.len(), 3);
        assert_eq!(virts[1] as usize - virts[0] as usize, 8);
        assert_eq!(virts[2] as usize - virts[1] as usize, 8);
        img.free_memory().unwrap();
    }

    #[test]
    fn test_software_strides_are_packed() {
        let img =
            SoftwareImage::new(13, 7, ImageFormat::BgrPacked, DataType::Uint8, None).unwrap();
        assert!(img.is_aligned());
    }
}
