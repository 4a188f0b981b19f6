//! Contiguous-buffer pool for integrated platforms.
//!
//! Allocates through the SoC's contiguous allocator (ION or the video
//! pipeline's buffer pools). The allocator itself sits behind the
//! [`ContigAllocator`] seam: the real platform binds its alloc/free and
//! cache-maintenance syscalls there, the host build binds
//! [`crate::memory::host::HostContigAllocator`].

use std::sync::Arc;

use crate::error::HalResult;
use crate::memory::{
    check_cache_target, check_release_target, MemoryBlock, MemoryPool, PoolBackend,
};

/// Driver seam for the platform's contiguous allocator.
///
/// Cache maintenance operates on the physical range, not on ownership:
/// callers may pass ranges belonging to blocks they merely borrowed.
pub trait ContigAllocator: Send + Sync {
    /// Allocate `size` physically contiguous bytes mapped into the process.
    /// `name` tags the allocation for platform accounting; `timeout_ms`
    /// bounds the wait for a free hardware slot.
    fn alloc(&self, name: &str, size: usize, timeout_ms: u32) -> HalResult<(u64, *mut u8)>;

    fn free(&self, phys_addr: u64, virt_addr: *mut u8, size: usize);

    fn flush(&self, phys_addr: u64, virt_addr: *mut u8, size: usize) -> HalResult<()>;

    fn invalidate(&self, phys_addr: u64, virt_addr: *mut u8, size: usize) -> HalResult<()>;
}

pub struct ContigMemoryPool {
    name: String,
    allocator: Arc<dyn ContigAllocator>,
    num_allocated: u32,
}

impl ContigMemoryPool {
    pub fn new(name: impl Into<String>, allocator: Arc<dyn ContigAllocator>) -> Self {
        ContigMemoryPool {
            name: name.into(),
            allocator,
            num_allocated: 0,
        }
    }
}

impl MemoryPool for ContigMemoryPool {
    fn backend(&self) -> PoolBackend {
        PoolBackend::Contig
    }

    fn allocate(&mut self, size: usize, timeout_ms: u32) -> HalResult<MemoryBlock> {
        let tag = format!("{}_{}", self.name, self.num_allocated);
        let (phys, virt) = self.allocator.alloc(&tag, size, timeout_ms)?;
        self.num_allocated += 1;
        log::debug!("contig pool allocated {size} bytes, phys {phys:#x}, virt {virt:p}");
        Ok(MemoryBlock::owned(PoolBackend::Contig, virt, phys, size))
    }

    fn release(&mut self, block: &mut MemoryBlock) -> HalResult<()> {
        check_release_target(PoolBackend::Contig, block)?;
        self.allocator
            .free(block.phys_addr(), block.virt_addr(), block.size());
        block.clear_after_release();
        Ok(())
    }

    fn flush_cache(&self, block: &MemoryBlock) -> HalResult<()> {
        check_cache_target(PoolBackend::Contig, block, true)?;
        self.allocator
            .flush(block.phys_addr(), block.virt_addr(), block.size())
    }

    fn invalidate_cache(&self, block: &MemoryBlock) -> HalResult<()> {
        check_cache_target(PoolBackend::Contig, block, true)?;
        self.allocator
            .invalidate(block.phys_addr(), block.virt_addr(), block.size())
    }
}
