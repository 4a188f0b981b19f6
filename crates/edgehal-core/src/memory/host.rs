//! Host (CPU-model) implementations of the memory driver seams.
//!
//! These stand in for the platform allocators on developer machines and in
//! CI: heap memory with an identity "physical" address, and tracked
//! alloc/free so a leaked or double-freed range is caught by tests. Cache
//! maintenance validates the range is live and otherwise does nothing —
//! there is no real DMA boundary on the host.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{HalError, HalResult};
use crate::memory::contig::ContigAllocator;
use crate::memory::device::DeviceAllocator;

/// Page alignment used for simulated contiguous/device ranges.
const HOST_RANGE_ALIGN: usize = 4096;

#[derive(Default)]
struct HostHeap {
    // phys (== virt) -> size
    live: Mutex<HashMap<u64, usize>>,
}

impl HostHeap {
    fn alloc(&self, size: usize) -> HalResult<(u64, *mut u8)> {
        if size == 0 {
            return Err(HalError::AllocationFailed("zero-size allocation".into()));
        }
        let layout = Layout::from_size_align(size, HOST_RANGE_ALIGN)
            .map_err(|e| HalError::AllocationFailed(format!("bad layout: {e}")))?;
        // Safety: non-zero size checked above.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(HalError::AllocationFailed(format!(
                "host allocation of {size} bytes failed"
            )));
        }
        let phys = ptr as u64;
        if let Ok(mut live) = self.live.lock() {
            live.insert(phys, size);
        }
        Ok((phys, ptr))
    }

    fn free(&self, phys: u64, virt: *mut u8, size: usize) {
        let tracked = self
            .live
            .lock()
            .ok()
            .and_then(|mut live| live.remove(&phys));
        match tracked {
            Some(tracked_size) => {
                debug_assert_eq!(tracked_size, size);
                if let Ok(layout) = Layout::from_size_align(tracked_size, HOST_RANGE_ALIGN) {
                    // Safety: range was allocated with this layout.
                    unsafe { dealloc(virt, layout) };
                }
            }
            None => log::error!("host heap: free of untracked range {phys:#x}"),
        }
    }

    fn check_live(&self, phys: u64) -> HalResult<()> {
        let live = self
            .live
            .lock()
            .map_err(|_| HalError::InvalidState("host heap mutex poisoned".into()))?;
        if live.contains_key(&phys) {
            Ok(())
        } else {
            Err(HalError::AllocationFailed(format!(
                "cache op on a range not owned by this allocator: {phys:#x}"
            )))
        }
    }

    fn check_live_range(&self, phys: u64) -> HalResult<()> {
        let live = self
            .live
            .lock()
            .map_err(|_| HalError::InvalidState("host heap mutex poisoned".into()))?;
        let inside = live
            .iter()
            .any(|(&base, &size)| phys >= base && phys < base + size as u64);
        if inside {
            Ok(())
        } else {
            Err(HalError::AllocationFailed(format!(
                "cache op on a range not owned by this allocator: {phys:#x}"
            )))
        }
    }
}

/// Heap-backed stand-in for the SoC contiguous allocator.
#[derive(Default)]
pub struct HostContigAllocator {
    heap: HostHeap,
}

impl HostContigAllocator {
    pub fn new() -> Self {
        HostContigAllocator::default()
    }
}

impl ContigAllocator for HostContigAllocator {
    fn alloc(&self, name: &str, size: usize, _timeout_ms: u32) -> HalResult<(u64, *mut u8)> {
        let out = self.heap.alloc(size)?;
        log::debug!("host contig alloc '{name}': {size} bytes at {:#x}", out.0);
        Ok(out)
    }

    fn free(&self, phys_addr: u64, virt_addr: *mut u8, size: usize) {
        self.heap.free(phys_addr, virt_addr, size);
    }

    fn flush(&self, phys_addr: u64, _virt_addr: *mut u8, _size: usize) -> HalResult<()> {
        // Views into a live range carry offset physical addresses; only the
        // base of the range is tracked, so accept any address inside one.
        self.heap.check_live_range(phys_addr)
    }

    fn invalidate(&self, phys_addr: u64, _virt_addr: *mut u8, _size: usize) -> HalResult<()> {
        self.heap.check_live_range(phys_addr)
    }
}

/// Heap-backed stand-in for the accelerator runtime's memory service.
#[derive(Default)]
pub struct HostDeviceAllocator {
    heap: HostHeap,
}

impl HostDeviceAllocator {
    pub fn new() -> Self {
        HostDeviceAllocator::default()
    }
}

impl DeviceAllocator for HostDeviceAllocator {
    fn alloc(&self, size: usize, _timeout_ms: u32) -> HalResult<(u64, *mut u8)> {
        self.heap.alloc(size)
    }

    fn free(&self, device_addr: u64, mapped: *mut u8, size: usize) {
        self.heap.free(device_addr, mapped, size);
    }

    fn flush(&self, device_addr: u64, _mapped: *mut u8, _size: usize) -> HalResult<()> {
        self.heap.check_live_range(device_addr)
    }

    fn invalidate(&self, device_addr: u64, _mapped: *mut u8, _size: usize) -> HalResult<()> {
        self.heap.check_live_range(device_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_heap_tracks_ranges() {
        let heap = HostHeap::default();
        let (phys, virt) = heap.alloc(64).unwrap();
        heap.check_live(phys).unwrap();
        heap.free(phys, virt, 64);
        assert!(heap.check_live(phys).is_err());
    }

    #[test]
    fn test_cache_check_accepts_interior_addresses() {
        let alloc = HostContigAllocator::new();
        let (phys, virt) = ContigAllocator::alloc(&alloc, "t", 128, 0).unwrap();
        alloc.flush(phys + 32, std::ptr::null_mut(), 16).unwrap();
        alloc.free(phys, virt, 128);
    }
}
