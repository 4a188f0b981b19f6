//! Plain heap pool.
//!
//! Backing for platforms (and the CPU-model runtime) where tensors live in
//! ordinary system memory. There is no DMA boundary, so flush/invalidate
//! are successful no-ops.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;

use crate::error::{HalError, HalResult};
use crate::memory::{check_release_target, MemoryBlock, MemoryPool, PoolBackend};

/// Cache-line alignment for heap tensor buffers.
const HEAP_ALIGN: usize = 64;

#[derive(Default)]
pub struct CpuMemoryPool {
    // virt address -> allocation size, needed to rebuild the Layout on free.
    live: HashMap<usize, usize>,
}

impl CpuMemoryPool {
    pub fn new() -> Self {
        CpuMemoryPool::default()
    }

    fn layout_for(size: usize) -> HalResult<Layout> {
        Layout::from_size_align(size, HEAP_ALIGN)
            .map_err(|e| HalError::AllocationFailed(format!("bad layout for {size} bytes: {e}")))
    }
}

impl MemoryPool for CpuMemoryPool {
    fn backend(&self) -> PoolBackend {
        PoolBackend::Cpu
    }

    fn allocate(&mut self, size: usize, _timeout_ms: u32) -> HalResult<MemoryBlock> {
        if size == 0 {
            return Err(HalError::AllocationFailed("zero-size allocation".into()));
        }
        let layout = Self::layout_for(size)?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(HalError::AllocationFailed(format!(
                "heap allocation of {size} bytes failed"
            )));
        }
        self.live.insert(ptr as usize, size);
        log::debug!("cpu pool allocated {size} bytes at {ptr:p}");
        // Heap memory has no meaningful physical address at this layer.
        Ok(MemoryBlock::owned(PoolBackend::Cpu, ptr, 0, size))
    }

    fn release(&mut self, block: &mut MemoryBlock) -> HalResult<()> {
        check_release_target(PoolBackend::Cpu, block)?;
        let addr = block.virt_addr() as usize;
        let size = self.live.remove(&addr).ok_or_else(|| {
            HalError::InvalidState("release of a block this pool did not allocate".into())
        })?;
        let layout = Self::layout_for(size)?;
        // Safety: ptr/layout come from the matching alloc_zeroed above.
        unsafe { dealloc(block.virt_addr(), layout) };
        block.clear_after_release();
        Ok(())
    }

    fn flush_cache(&self, block: &MemoryBlock) -> HalResult<()> {
        if block.backend() != PoolBackend::Cpu {
            return Err(HalError::PoolMismatch {
                expected: block.backend(),
                actual: PoolBackend::Cpu,
            });
        }
        if block.virt_addr().is_null() {
            return Err(HalError::AllocationFailed(
                "cache op on an unallocated block".into(),
            ));
        }
        Ok(())
    }

    fn invalidate_cache(&self, block: &MemoryBlock) -> HalResult<()> {
        self.flush_cache(block)
    }
}

impl Drop for CpuMemoryPool {
    fn drop(&mut self) {
        if !self.live.is_empty() {
            log::warn!("cpu pool dropped with {} live allocations", self.live.len());
            for (&addr, &size) in &self.live {
                if let Ok(layout) = Self::layout_for(size) {
                    // Safety: recorded at allocation time with this layout.
                    unsafe { dealloc(addr as *mut u8, layout) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBlock, Ownership};

    #[test]
    fn test_allocate_and_release() {
        let mut pool = CpuMemoryPool::new();
        let mut block = pool.allocate(128, 0).unwrap();
        assert_eq!(block.size(), 128);
        assert_eq!(block.ownership(), Ownership::Owned);
        assert!(!block.virt_addr().is_null());
        assert_eq!(block.phys_addr(), 0);
        pool.release(&mut block).unwrap();
        assert!(block.virt_addr().is_null());
    }

    #[test]
    fn test_zero_size_allocation_fails() {
        let mut pool = CpuMemoryPool::new();
        assert!(matches!(
            pool.allocate(0, 0),
            Err(HalError::AllocationFailed(_))
        ));
    }

    #[test]
    fn test_cache_ops_are_successful_noops() {
        let mut pool = CpuMemoryPool::new();
        let mut block = pool.allocate(64, 0).unwrap();
        pool.flush_cache(&block).unwrap();
        pool.invalidate_cache(&block).unwrap();
        pool.release(&mut block).unwrap();
    }

    #[test]
    fn test_release_of_borrowed_block_is_flagged() {
        let mut pool = CpuMemoryPool::new();
        let mut backing = vec![0u8; 16];
        let mut view = MemoryBlock::borrowed(PoolBackend::Cpu, backing.as_mut_ptr(), 0, 16);
        assert!(matches!(
            pool.release(&mut view),
            Err(HalError::BorrowedRelease)
        ));
        // The view must still be intact afterwards.
        assert_eq!(view.size(), 16);
        assert!(!view.virt_addr().is_null());
    }

    #[test]
    fn test_cache_op_on_foreign_backend_is_rejected() {
        let pool = CpuMemoryPool::new();
        let mut backing = vec![0u8; 16];
        let view = MemoryBlock::borrowed(PoolBackend::Device, backing.as_mut_ptr(), 0x20, 16);
        assert!(matches!(
            pool.flush_cache(&view),
            Err(HalError::PoolMismatch { .. })
        ));
    }
}
