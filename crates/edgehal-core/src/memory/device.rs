//! Discrete-accelerator device memory pool.
//!
//! Memory here is physically separate from system RAM: the accelerator
//! runtime allocates it, maps it into the process for CPU access, and owns
//! the coherency primitives (which are distinct calls from the contiguous
//! pool's cache syscalls). The runtime binds through [`DeviceAllocator`].

use std::sync::Arc;

use crate::error::HalResult;
use crate::memory::{
    check_cache_target, check_release_target, MemoryBlock, MemoryPool, PoolBackend,
};

/// Driver seam for the accelerator runtime's memory service.
pub trait DeviceAllocator: Send + Sync {
    /// Allocate device memory and map it for CPU access. Returns the device
    /// address and the CPU mapping.
    fn alloc(&self, size: usize, timeout_ms: u32) -> HalResult<(u64, *mut u8)>;

    fn free(&self, device_addr: u64, mapped: *mut u8, size: usize);

    /// Push CPU writes through to device memory.
    fn flush(&self, device_addr: u64, mapped: *mut u8, size: usize) -> HalResult<()>;

    /// Pull device writes into the CPU mapping.
    fn invalidate(&self, device_addr: u64, mapped: *mut u8, size: usize) -> HalResult<()>;
}

pub struct DeviceMemoryPool {
    allocator: Arc<dyn DeviceAllocator>,
    device_id: u32,
}

impl DeviceMemoryPool {
    pub fn new(device_id: u32, allocator: Arc<dyn DeviceAllocator>) -> Self {
        DeviceMemoryPool {
            allocator,
            device_id,
        }
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl MemoryPool for DeviceMemoryPool {
    fn backend(&self) -> PoolBackend {
        PoolBackend::Device
    }

    fn allocate(&mut self, size: usize, timeout_ms: u32) -> HalResult<MemoryBlock> {
        let (dev, mapped) = self.allocator.alloc(size, timeout_ms)?;
        log::debug!(
            "device pool (dev {}) allocated {size} bytes at {dev:#x}",
            self.device_id
        );
        Ok(MemoryBlock::owned(PoolBackend::Device, mapped, dev, size))
    }

    fn release(&mut self, block: &mut MemoryBlock) -> HalResult<()> {
        check_release_target(PoolBackend::Device, block)?;
        self.allocator
            .free(block.phys_addr(), block.virt_addr(), block.size());
        block.clear_after_release();
        Ok(())
    }

    fn flush_cache(&self, block: &MemoryBlock) -> HalResult<()> {
        check_cache_target(PoolBackend::Device, block, true)?;
        self.allocator
            .flush(block.phys_addr(), block.virt_addr(), block.size())
    }

    fn invalidate_cache(&self, block: &MemoryBlock) -> HalResult<()> {
        check_cache_target(PoolBackend::Device, block, true)?;
        self.allocator
            .invalidate(block.phys_addr(), block.virt_addr(), block.size())
    }
}
