//! Memory pools and the blocks they hand out.
//!
//! Three incompatible physical memory systems sit behind one [`MemoryPool`]
//! contract:
//!
//! | Backend | Allocation | Cache maintenance |
//! |---------|------------|-------------------|
//! | [`cpu::CpuMemoryPool`] | process heap | no-op (no DMA boundary) |
//! | [`contig::ContigMemoryPool`] | SoC contiguous/ION buffer allocator | platform cache syscalls on the physical range |
//! | [`device::DeviceMemoryPool`] | discrete accelerator runtime | the accelerator's own flush/invalidate primitives |
//!
//! Ownership is part of the type, not a mutable flag: a block is either
//! [`Ownership::Owned`] (its pool frees it) or [`Ownership::Borrowed`] (a
//! view onto memory somebody else owns — a video-pipeline frame, a vendor
//! tensor buffer, a slice of another block). Cache operations are address
//! based and work on borrowed blocks too; release never does.

pub mod contig;
pub mod cpu;
pub mod device;
pub mod host;

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{HalError, HalResult};

pub use contig::{ContigAllocator, ContigMemoryPool};
pub use cpu::CpuMemoryPool;
pub use device::{DeviceAllocator, DeviceMemoryPool};
pub use host::{HostContigAllocator, HostDeviceAllocator};

/// Which pool family a block was allocated from. Cache ops are rejected
/// when routed to a pool of a different backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolBackend {
    Cpu,
    Contig,
    Device,
}

/// Whether the HAL is responsible for freeing a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Allocated by a pool; released back to it exactly once.
    Owned,
    /// A view onto externally owned memory. Never freed by the HAL.
    Borrowed,
}

/// One allocation as seen by the HAL.
///
/// `virt_addr` is exclusively owned by the block while allocated; the
/// physical/device address is what hardware sees. A `pool_id` is carried for
/// hardware buffer-pool slots that need it at release time.
#[derive(Debug)]
pub struct MemoryBlock {
    size: usize,
    virt_addr: *mut u8,
    phys_addr: u64,
    ownership: Ownership,
    pool_id: Option<u32>,
    backend: PoolBackend,
}

// A block is a passive record; the pointer it carries is only dereferenced
// by the single owner of the surrounding Image/Tensor handle.
unsafe impl Send for MemoryBlock {}

impl MemoryBlock {
    pub(crate) fn owned(
        backend: PoolBackend,
        virt_addr: *mut u8,
        phys_addr: u64,
        size: usize,
    ) -> Self {
        MemoryBlock {
            size,
            virt_addr,
            phys_addr,
            ownership: Ownership::Owned,
            pool_id: None,
            backend,
        }
    }

    /// Wrap externally owned memory (a video frame, a vendor tensor buffer).
    pub fn borrowed(backend: PoolBackend, virt_addr: *mut u8, phys_addr: u64, size: usize) -> Self {
        MemoryBlock {
            size,
            virt_addr,
            phys_addr,
            ownership: Ownership::Borrowed,
            pool_id: None,
            backend,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn virt_addr(&self) -> *mut u8 {
        self.virt_addr
    }

    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_owned(&self) -> bool {
        self.ownership == Ownership::Owned
    }

    pub fn backend(&self) -> PoolBackend {
        self.backend
    }

    pub fn pool_id(&self) -> Option<u32> {
        self.pool_id
    }

    pub(crate) fn set_pool_id(&mut self, id: u32) {
        self.pool_id = Some(id);
    }

    /// Borrowed sub-view over `[offset, offset + size)` of this block.
    pub fn slice_view(&self, offset: usize, size: usize) -> HalResult<MemoryBlock> {
        if offset + size > self.size {
            return Err(HalError::ShapeMismatch {
                expected: format!("view within {} bytes", self.size),
                actual: format!("offset {offset} + len {size}"),
            });
        }
        if self.virt_addr.is_null() {
            return Err(HalError::InvalidState(
                "slice view over an unallocated block".into(),
            ));
        }
        Ok(MemoryBlock {
            size,
            // Safety: offset + size was checked against the allocation above.
            virt_addr: unsafe { self.virt_addr.add(offset) },
            phys_addr: if self.phys_addr == 0 {
                0
            } else {
                self.phys_addr + offset as u64
            },
            ownership: Ownership::Borrowed,
            pool_id: self.pool_id,
            backend: self.backend,
        })
    }

    /// View the block contents as bytes.
    pub fn as_slice(&self) -> HalResult<&[u8]> {
        if self.virt_addr.is_null() {
            return Err(HalError::InvalidState("block has no virtual address".into()));
        }
        // Safety: virt_addr points at `size` bytes owned by this block.
        Ok(unsafe { std::slice::from_raw_parts(self.virt_addr, self.size) })
    }

    /// Mutable view of the block contents.
    pub fn as_mut_slice(&mut self) -> HalResult<&mut [u8]> {
        if self.virt_addr.is_null() {
            return Err(HalError::InvalidState("block has no virtual address".into()));
        }
        // Safety: virt_addr points at `size` bytes owned by this block.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.virt_addr, self.size) })
    }

    pub(crate) fn clear_after_release(&mut self) {
        self.virt_addr = std::ptr::null_mut();
        self.phys_addr = 0;
        self.size = 0;
        self.pool_id = None;
    }
}

/// Common contract for the three pool backends.
pub trait MemoryPool: Send {
    fn backend(&self) -> PoolBackend;

    /// Allocate `size` bytes. `timeout_ms` is honoured by hardware-pool
    /// backends where acquiring a buffer slot can block; the CPU backend
    /// ignores it.
    fn allocate(&mut self, size: usize, timeout_ms: u32) -> HalResult<MemoryBlock>;

    /// Release an owned block back to the pool. Releasing a borrowed block
    /// is flagged with [`HalError::BorrowedRelease`] and the underlying
    /// address is left untouched.
    fn release(&mut self, block: &mut MemoryBlock) -> HalResult<()>;

    /// Make CPU writes visible to hardware.
    fn flush_cache(&self, block: &MemoryBlock) -> HalResult<()>;

    /// Make hardware writes visible to the CPU.
    fn invalidate_cache(&self, block: &MemoryBlock) -> HalResult<()>;
}

/// Pools are shared between images, tensors and networks the same way the
/// rest of the SDK shares session state: an `Arc<Mutex<_>>` handle.
pub type SharedPool = Arc<Mutex<dyn MemoryPool>>;

/// Lock a shared pool, mapping a poisoned mutex onto a typed error.
pub fn lock_pool(pool: &SharedPool) -> HalResult<MutexGuard<'_, dyn MemoryPool + 'static>> {
    pool.lock()
        .map_err(|_| HalError::InvalidState("memory pool mutex poisoned".into()))
}

/// Shared precondition for the hardware pools' cache ops: the block must
/// belong to this backend and must have been allocated.
pub(crate) fn check_cache_target(
    pool_backend: PoolBackend,
    block: &MemoryBlock,
    require_phys: bool,
) -> HalResult<()> {
    if block.backend() != pool_backend {
        return Err(HalError::PoolMismatch {
            expected: block.backend(),
            actual: pool_backend,
        });
    }
    if block.virt_addr().is_null() {
        return Err(HalError::AllocationFailed(
            "cache op on a block with no virtual address".into(),
        ));
    }
    if require_phys && block.phys_addr() == 0 {
        return Err(HalError::AllocationFailed(
            "cache op on a block with no physical address".into(),
        ));
    }
    Ok(())
}

/// Shared precondition for release: borrowed blocks are flagged and left
/// alone, foreign blocks are rejected.
pub(crate) fn check_release_target(
    pool_backend: PoolBackend,
    block: &MemoryBlock,
) -> HalResult<()> {
    if block.backend() != pool_backend {
        return Err(HalError::PoolMismatch {
            expected: block.backend(),
            actual: pool_backend,
        });
    }
    if !block.is_owned() {
        log::warn!("release called on a borrowed memory block; ignoring");
        return Err(HalError::BorrowedRelease);
    }
    Ok(())
}
