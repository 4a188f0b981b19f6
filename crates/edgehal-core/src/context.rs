//! The HAL context: one explicit object carrying the platform selection,
//! the injected drivers and the process-wide registries (open devices,
//! loaded models) that the reference stacks keep in globals.
//!
//! Everything downstream (pools, networks, pipelines) borrows an
//! `Arc<HalContext>`, so two contexts with different drivers can coexist
//! in one process, which is what makes the CPU-model tests possible.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{HalError, HalResult};
use crate::memory::{
    ContigAllocator, ContigMemoryPool, CpuMemoryPool, DeviceAllocator, DeviceMemoryPool,
    HostContigAllocator, HostDeviceAllocator, SharedPool,
};
use crate::net::driver::AccelRuntime;
use crate::net::{EdgeRuntime, HostNpuDriver, ModelSource, RuntimeMemRegions};
use crate::platform::InferencePlatform;
use crate::preprocess::{HostScalerDriver, ScalerDriver};

/// A model held in the context's cache. Unloads from the runtime when the
/// last user drops it.
pub struct LoadedModel {
    handle: u64,
    runtime: Arc<dyn AccelRuntime>,
}

impl LoadedModel {
    pub fn handle(&self) -> u64 {
        self.handle
    }
}

impl Drop for LoadedModel {
    fn drop(&mut self) {
        self.runtime.unload_model(self.handle);
    }
}

type ModelCacheKey = (PathBuf, u32);

pub struct HalContext {
    platform: InferencePlatform,
    contig: Arc<dyn ContigAllocator>,
    device_alloc: Arc<dyn DeviceAllocator>,
    accel: Arc<dyn AccelRuntime>,
    edge: Arc<dyn EdgeRuntime>,
    scaler: Arc<dyn ScalerDriver>,
    // device id -> open runtime handle
    devices: Mutex<HashMap<u32, u64>>,
    // (model path, device id) -> loaded model
    model_cache: Mutex<HashMap<ModelCacheKey, Arc<LoadedModel>>>,
}

impl HalContext {
    /// Context with every driver bound to its CPU-model implementation.
    pub fn host() -> Arc<HalContext> {
        let npu = Arc::new(HostNpuDriver::new());
        HalContext::builder(InferencePlatform::Host)
            .accel_runtime(npu.clone())
            .edge_runtime(npu)
            .build()
    }

    pub fn builder(platform: InferencePlatform) -> HalContextBuilder {
        HalContextBuilder {
            platform,
            contig: None,
            device_alloc: None,
            accel: None,
            edge: None,
            scaler: None,
        }
    }

    pub fn platform(&self) -> InferencePlatform {
        self.platform
    }

    pub fn contig_allocator(&self) -> Arc<dyn ContigAllocator> {
        self.contig.clone()
    }

    pub fn device_allocator(&self) -> Arc<dyn DeviceAllocator> {
        self.device_alloc.clone()
    }

    pub fn accel_runtime(&self) -> Arc<dyn AccelRuntime> {
        self.accel.clone()
    }

    pub fn edge_runtime(&self) -> Arc<dyn EdgeRuntime> {
        self.edge.clone()
    }

    pub fn scaler_driver(&self) -> Arc<dyn ScalerDriver> {
        self.scaler.clone()
    }

    pub fn create_cpu_pool(&self) -> SharedPool {
        Arc::new(Mutex::new(CpuMemoryPool::new()))
    }

    pub fn create_contig_pool(&self, name: impl Into<String>) -> SharedPool {
        Arc::new(Mutex::new(ContigMemoryPool::new(name, self.contig.clone())))
    }

    pub fn create_device_pool(&self, device_id: u32) -> SharedPool {
        Arc::new(Mutex::new(DeviceMemoryPool::new(
            device_id,
            self.device_alloc.clone(),
        )))
    }

    /// Runtime handle for a device, opening it on first use.
    pub fn device_handle(&self, device_id: u32) -> HalResult<u64> {
        let mut devices = self
            .devices
            .lock()
            .map_err(|_| HalError::InvalidState("device registry mutex poisoned".into()))?;
        if let Some(&handle) = devices.get(&device_id) {
            return Ok(handle);
        }
        let handle = self.accel.open_device(device_id)?;
        devices.insert(device_id, handle);
        log::info!("opened accelerator device {device_id}");
        Ok(handle)
    }

    /// Load a model for a device, deduplicating file loads by
    /// (path, device id). Buffer sources bypass the cache: there is no
    /// stable identity to key them on.
    pub fn load_accel_model(
        &self,
        source: &ModelSource,
        device_id: u32,
        regions: Option<&RuntimeMemRegions>,
    ) -> HalResult<Arc<LoadedModel>> {
        let key = match source {
            // Reserved-region loads are placement specific, never shared.
            ModelSource::File(path) if regions.is_none() => {
                Some((path.clone(), device_id))
            }
            _ => None,
        };
        if let Some(key) = &key {
            let cache = self
                .model_cache
                .lock()
                .map_err(|_| HalError::InvalidState("model cache mutex poisoned".into()))?;
            if let Some(model) = cache.get(key) {
                log::debug!("model cache hit for {:?}", key.0);
                return Ok(model.clone());
            }
        }
        let device = self.device_handle(device_id)?;
        let handle = self.accel.load_model(device, source, regions)?;
        let model = Arc::new(LoadedModel {
            handle,
            runtime: self.accel.clone(),
        });
        if let Some(key) = key {
            if let Ok(mut cache) = self.model_cache.lock() {
                cache.insert(key, model.clone());
            }
        }
        Ok(model)
    }
}

impl Drop for HalContext {
    fn drop(&mut self) {
        // Models must unload before their devices close.
        if let Ok(mut cache) = self.model_cache.lock() {
            cache.clear();
        }
        if let Ok(devices) = self.devices.lock() {
            for (&id, &handle) in devices.iter() {
                log::debug!("closing accelerator device {id}");
                self.accel.close_device(handle);
            }
        }
    }
}

pub struct HalContextBuilder {
    platform: InferencePlatform,
    contig: Option<Arc<dyn ContigAllocator>>,
    device_alloc: Option<Arc<dyn DeviceAllocator>>,
    accel: Option<Arc<dyn AccelRuntime>>,
    edge: Option<Arc<dyn EdgeRuntime>>,
    scaler: Option<Arc<dyn ScalerDriver>>,
}

impl HalContextBuilder {
    pub fn contig_allocator(mut self, contig: Arc<dyn ContigAllocator>) -> Self {
        self.contig = Some(contig);
        self
    }

    pub fn device_allocator(mut self, device_alloc: Arc<dyn DeviceAllocator>) -> Self {
        self.device_alloc = Some(device_alloc);
        self
    }

    pub fn accel_runtime(mut self, accel: Arc<dyn AccelRuntime>) -> Self {
        self.accel = Some(accel);
        self
    }

    pub fn edge_runtime(mut self, edge: Arc<dyn EdgeRuntime>) -> Self {
        self.edge = Some(edge);
        self
    }

    pub fn scaler_driver(mut self, scaler: Arc<dyn ScalerDriver>) -> Self {
        self.scaler = Some(scaler);
        self
    }

    /// Build the context; any driver not supplied falls back to its
    /// CPU-model implementation.
    pub fn build(self) -> Arc<HalContext> {
        let (accel, edge) = match (self.accel, self.edge) {
            (Some(accel), Some(edge)) => (accel, edge),
            (accel, edge) => {
                let host = Arc::new(HostNpuDriver::new());
                (
                    accel.unwrap_or_else(|| host.clone() as Arc<dyn AccelRuntime>),
                    edge.unwrap_or(host),
                )
            }
        };
        Arc::new(HalContext {
            platform: self.platform,
            contig: self
                .contig
                .unwrap_or_else(|| Arc::new(HostContigAllocator::new())),
            device_alloc: self
                .device_alloc
                .unwrap_or_else(|| Arc::new(HostDeviceAllocator::new())),
            accel,
            edge,
            scaler: self
                .scaler
                .unwrap_or_else(|| Arc::new(HostScalerDriver::new())),
            devices: Mutex::new(HashMap::new()),
            model_cache: Mutex::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::host::demo_model_doc;

    #[test]
    fn test_device_handle_is_opened_once() {
        let ctx = HalContext::host();
        let a = ctx.device_handle(0).unwrap();
        let b = ctx.device_handle(0).unwrap();
        assert_eq!(a, b);
        assert_ne!(ctx.device_handle(1).unwrap(), a);
    }

    #[test]
    fn test_file_models_cached_per_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, demo_model_doc()).unwrap();
        let ctx = HalContext::host();
        let source = ModelSource::File(path);
        let a = ctx.load_accel_model(&source, 0, None).unwrap();
        let b = ctx.load_accel_model(&source, 0, None).unwrap();
        assert_eq!(a.handle(), b.handle());
        let c = ctx.load_accel_model(&source, 1, None).unwrap();
        assert_ne!(c.handle(), a.handle());
    }

    #[test]
    fn test_buffer_models_bypass_cache() {
        let ctx = HalContext::host();
        let source = ModelSource::Buffer(demo_model_doc());
        let a = ctx.load_accel_model(&source, 0, None).unwrap();
        let b = ctx.load_accel_model(&source, 0, None).unwrap();
        assert_ne!(a.handle(), b.handle());
    }
}
