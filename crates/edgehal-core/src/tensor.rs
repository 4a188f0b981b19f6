//! Tensors: NCHW-shaped buffers drawn from a memory pool.
//!
//! A tensor either owns a block allocated from its pool or aliases memory a
//! runtime handed out (zero-copy I/O). Reshaping reuses the current block
//! when it is large enough and reallocates only on growth; aliased tensors
//! can never grow because the runtime fixed their capacity.

use std::path::Path;

use crate::dtype::DataType;
use crate::error::{HalError, HalResult};
use crate::image::{Image, ImageFormat, SoftwareImage};
use crate::memory::{lock_pool, MemoryBlock, SharedPool};

pub struct Tensor {
    dtype: DataType,
    shape: [usize; 4],
    pool: SharedPool,
    block: Option<MemoryBlock>,
}

impl Tensor {
    pub fn new(pool: SharedPool) -> Tensor {
        Tensor {
            dtype: DataType::Uint8,
            shape: [0; 4],
            pool,
            block: None,
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// NCHW shape.
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.elem_count() * self.dtype.size()
    }

    /// Bytes per batch slot.
    pub fn batch_bytes(&self) -> usize {
        if self.shape[0] == 0 {
            0
        } else {
            self.byte_size() / self.shape[0]
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.block.is_some()
    }

    pub fn memory_block(&self) -> Option<&MemoryBlock> {
        self.block.as_ref()
    }

    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    /// Set dtype and shape, (re)allocating backing memory as needed.
    ///
    /// The current block is kept when it already has the capacity; growth
    /// releases it and allocates a larger one. Aliased (borrowed) memory
    /// cannot grow.
    pub fn reshape(&mut self, dtype: DataType, shape: [usize; 4]) -> HalResult<()> {
        let needed: usize = shape.iter().product::<usize>() * dtype.size();
        if needed == 0 {
            return Err(HalError::ShapeMismatch {
                expected: "a non-empty shape".into(),
                actual: format!("{shape:?}"),
            });
        }
        let capacity = self.block.as_ref().map(MemoryBlock::size).unwrap_or(0);
        if needed > capacity {
            if let Some(mut block) = self.block.take() {
                if !block.is_owned() {
                    self.block = Some(block);
                    return Err(HalError::InvalidState(
                        "cannot grow a tensor aliasing runtime memory".into(),
                    ));
                }
                lock_pool(&self.pool)?.release(&mut block)?;
            }
            let block = lock_pool(&self.pool)?.allocate(needed, 0)?;
            self.block = Some(block);
        }
        self.dtype = dtype;
        self.shape = shape;
        Ok(())
    }

    /// Alias runtime-owned memory (zero-copy network I/O). The tensor must
    /// not currently own a block, and the aliased range must cover the
    /// shape.
    pub fn share_memory(
        &mut self,
        block: MemoryBlock,
        dtype: DataType,
        shape: [usize; 4],
    ) -> HalResult<()> {
        if self.block.as_ref().is_some_and(MemoryBlock::is_owned) {
            return Err(HalError::AlreadyInitialized(
                "tensor already owns a memory block".into(),
            ));
        }
        let needed: usize = shape.iter().product::<usize>() * dtype.size();
        if block.size() < needed {
            return Err(HalError::ShapeMismatch {
                expected: format!("at least {needed} bytes"),
                actual: format!("{} bytes", block.size()),
            });
        }
        self.block = Some(block);
        self.dtype = dtype;
        self.shape = shape;
        Ok(())
    }

    pub fn release(&mut self) -> HalResult<()> {
        if let Some(mut block) = self.block.take() {
            if block.is_owned() {
                lock_pool(&self.pool)?.release(&mut block)?;
            }
        }
        self.shape = [0; 4];
        Ok(())
    }

    fn block_ref(&self) -> HalResult<&MemoryBlock> {
        self.block
            .as_ref()
            .ok_or_else(|| HalError::InvalidState("tensor has no memory".into()))
    }

    fn check_batch(&self, index: usize) -> HalResult<()> {
        if index >= self.shape[0] {
            return Err(HalError::ShapeMismatch {
                expected: format!("batch index < {}", self.shape[0]),
                actual: format!("{index}"),
            });
        }
        Ok(())
    }

    /// CPU address of one batch slot.
    pub fn batch_ptr(&self, index: usize) -> HalResult<*mut u8> {
        self.check_batch(index)?;
        let base = self.block_ref()?.virt_addr();
        if base.is_null() {
            return Err(HalError::InvalidState("tensor has no memory".into()));
        }
        // Safety: index bounds checked against shape[0] above.
        Ok(unsafe { base.add(index * self.batch_bytes()) })
    }

    /// Mutable bytes of one batch slot.
    pub fn batch_slice_mut(&mut self, index: usize) -> HalResult<&mut [u8]> {
        self.check_batch(index)?;
        let len = self.batch_bytes();
        let offset = index * len;
        let bytes = self
            .block
            .as_mut()
            .ok_or_else(|| HalError::InvalidState("tensor has no memory".into()))?
            .as_mut_slice()?;
        Ok(&mut bytes[offset..offset + len])
    }

    /// Bytes of one batch slot.
    pub fn batch_slice(&self, index: usize) -> HalResult<&[u8]> {
        self.check_batch(index)?;
        let len = self.batch_bytes();
        let offset = index * len;
        Ok(&self.block_ref()?.as_slice()?[offset..offset + len])
    }

    /// Build a planar image view aliasing one batch slot, so preprocessing
    /// can write straight into network input memory.
    ///
    /// The format must be planar (hardware-padded strides would break the
    /// aliasing) and its byte size must equal the slot size.
    pub fn construct_image_view(
        &self,
        index: usize,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> HalResult<SoftwareImage> {
        self.check_batch(index)?;
        if !format.is_planar() {
            return Err(HalError::UnsupportedFormat(format!(
                "tensor views require a planar format, got {format:?}"
            )));
        }
        let slot = self
            .block_ref()?
            .slice_view(index * self.batch_bytes(), self.batch_bytes())?;
        let view = SoftwareImage::view(width, height, format, self.dtype, slot)?;
        if !view.is_aligned() {
            return Err(HalError::UnsupportedFormat(
                "tensor view strides must be tightly packed".into(),
            ));
        }
        Ok(view)
    }

    /// Copy a planar or gray image into one batch slot, dropping any row
    /// padding the image layout carries.
    pub fn copy_from_image(&mut self, image: &dyn Image, index: usize) -> HalResult<()> {
        self.check_batch(index)?;
        let layout = image.layout().clone();
        if !layout.format.is_planar() {
            return Err(HalError::UnsupportedFormat(format!(
                "copy_from_image requires a planar source, got {:?}",
                layout.format
            )));
        }
        if layout.dtype != self.dtype {
            return Err(HalError::ShapeMismatch {
                expected: format!("{:?}", self.dtype),
                actual: format!("{:?}", layout.dtype),
            });
        }
        let row = layout.packed_row_bytes();
        let h = layout.height as usize;
        let packed = row * h * layout.plane_count();
        if packed != self.batch_bytes() {
            return Err(HalError::ShapeMismatch {
                expected: format!("{} bytes per batch", self.batch_bytes()),
                actual: format!("{packed} bytes of pixels"),
            });
        }
        image.invalidate_cache()?;
        let virts = image.virtual_address()?;
        let strides = layout.strides.clone();
        let dst = self.batch_slice_mut(index)?;
        let mut written = 0usize;
        for (plane, &src_base) in virts.iter().enumerate() {
            let stride = strides[plane];
            for y in 0..h {
                // Safety: plane rows carry `stride` valid bytes each.
                let src = unsafe { std::slice::from_raw_parts(src_base.add(y * stride), row) };
                dst[written..written + row].copy_from_slice(src);
                written += row;
            }
        }
        self.flush()
    }

    pub fn flush(&self) -> HalResult<()> {
        lock_pool(&self.pool)?.flush_cache(self.block_ref()?)
    }

    pub fn invalidate(&self) -> HalResult<()> {
        lock_pool(&self.pool)?.invalidate_cache(self.block_ref()?)
    }

    /// Write the raw tensor bytes to a file, invalidating first so the CPU
    /// sees what the hardware last wrote.
    pub fn dump_to_file(&self, path: &Path) -> HalResult<()> {
        self.invalidate()?;
        std::fs::write(path, self.block_ref()?.as_slice()?)?;
        Ok(())
    }

    /// Fill the tensor from a raw dump, flushing afterwards so hardware
    /// sees the new contents.
    pub fn load_from_file(&mut self, path: &Path) -> HalResult<()> {
        let data = std::fs::read(path)?;
        let expected = self.byte_size();
        if data.len() != expected {
            return Err(HalError::ShapeMismatch {
                expected: format!("{expected} bytes"),
                actual: format!("{} bytes in {}", data.len(), path.display()),
            });
        }
        let bytes = self
            .block
            .as_mut()
            .ok_or_else(|| HalError::InvalidState("tensor has no memory".into()))?
            .as_mut_slice()?;
        bytes[..expected].copy_from_slice(&data);
        self.flush()
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("tensor release on drop failed: {e}");
        }
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
    fn test_reshape_reuses_capacity() {
        let mut t = Tensor::new(cpu_pool());
        t.reshape(DataType::Fp32, [1, 3, 8, 8]).unwrap();
        let addr = t.memory_block().unwrap().virt_addr();
        // Shrinking keeps the block.
        t.reshape(DataType::Fp32, [1, 3, 4, 4]).unwrap();
        assert_eq!(t.memory_block().unwrap().virt_addr(), addr);
        // Growing reallocates.
        t.reshape(DataType::Fp32, [4, 3, 8, 8]).unwrap();
        assert_eq!(t.byte_size(), 4 * 3 * 8 * 8 * 4);
    }

    #[test]
    fn test_batch_slots_partition_the_buffer() {
        let mut t = Tensor::new(cpu_pool());
        t.reshape(DataType::Uint8, [4, 1, 2, 2]).unwrap();
        assert_eq!(t.batch_bytes(), 4);
        t.batch_slice_mut(2).unwrap().copy_from_slice(&[9; 4]);
        assert_eq!(t.batch_slice(1).unwrap(), &[0; 4]);
        assert_eq!(t.batch_slice(2).unwrap(), &[9; 4]);
        assert!(t.batch_ptr(4).is_err());
    }

    #[test]
    fn test_shared_memory_cannot_grow() {
        let mut backing = vec![0u8; 16];
        let alias = MemoryBlock::borrowed(PoolBackend::Cpu, backing.as_mut_ptr(), 0, 16);
        let mut t = Tensor::new(cpu_pool());
        t.share_memory(alias, DataType::Uint8, [1, 1, 4, 4]).unwrap();
        assert!(matches!(
            t.reshape(DataType::Uint8, [1, 1, 8, 8]),
            Err(HalError::InvalidState(_))
        ));
        // Dropping the tensor must not try to free the borrowed range.
        drop(t);
    }

    #[test]
    fn test_share_memory_rejects_short_block() {
        let mut backing = vec![0u8; 8];
        let alias = MemoryBlock::borrowed(PoolBackend::Cpu, backing.as_mut_ptr(), 0, 8);
        let mut t = Tensor::new(cpu_pool());
        assert!(matches!(
            t.share_memory(alias, DataType::Uint8, [1, 1, 4, 4]),
            Err(HalError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_image_view_aliases_batch_slot() {
        let mut t = Tensor::new(cpu_pool());
        t.reshape(DataType::Uint8, [2, 3, 4, 4]).unwrap();
        let mut view = t.construct_image_view(1, 4, 4, ImageFormat::RgbPlanar).unwrap();
        let data = vec![7u8; 48];
        view.copy_from_buffer(&data).unwrap();
        assert_eq!(t.batch_slice(1).unwrap(), &data[..]);
        assert_eq!(t.batch_slice(0).unwrap(), &[0; 48]);
        // Address identity: the view writes through, no copies.
        assert_eq!(
            view.memory_block().unwrap().virt_addr(),
            t.batch_ptr(1).unwrap()
        );
    }

    #[test]
    fn test_image_view_rejects_packed_formats() {
        let mut t = Tensor::new(cpu_pool());
        t.reshape(DataType::Uint8, [1, 3, 4, 4]).unwrap();
        assert!(matches!(
            t.construct_image_view(0, 4, 4, ImageFormat::RgbPacked),
            Err(HalError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_dump_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tensor.bin");
        let mut t = Tensor::new(cpu_pool());
        t.reshape(DataType::Uint8, [1, 1, 2, 8]).unwrap();
        t.batch_slice_mut(0)
            .unwrap()
            .copy_from_slice(&(0u8..16).collect::<Vec<_>>());
        t.dump_to_file(&path).unwrap();

        let mut loaded = Tensor::new(cpu_pool());
        loaded.reshape(DataType::Uint8, [1, 1, 2, 8]).unwrap();
        loaded.load_from_file(&path).unwrap();
        assert_eq!(loaded.batch_slice(0).unwrap(), t.batch_slice(0).unwrap());
    }
}
