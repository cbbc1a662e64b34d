//! Compute context: device bootstrap, memory accounting, pipeline creation and batch
//! submission.

use candle_core::Device;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::batch::{BufferTable, CommandBatch};
use crate::backend::kernels::{Kernel, Pipeline};
use crate::config::{DeviceConfig, DeviceKind, DeviceLimits};
use crate::error::NovaError;
use crate::NovaResult;

/// Connection to one compute device.
///
/// Shared by every tensor allocated on it (`Arc<ComputeContext>`). All submitted work
/// runs on a single command stream, so dispatches and writes observe submission order.
#[derive(Debug)]
pub struct ComputeContext {
    device: Device,
    limits: DeviceLimits,
    allocated: AtomicUsize,
    live_staging: AtomicUsize,
    #[cfg(test)]
    pub(crate) faults: faults::FaultPlan,
}

impl ComputeContext {
    /// Open the device described by `config`
    pub fn new(config: DeviceConfig) -> NovaResult<Arc<Self>> {
        let device = open_device(config.kind)?;
        log::info!(
            "Compute context on {:?} (max buffer {} bytes, budget {:?})",
            device,
            config.limits.max_buffer_bytes,
            config.limits.memory_budget_bytes
        );
        Ok(Arc::new(Self::with_device(device, config.limits)))
    }

    /// CPU context with default limits
    pub fn cpu() -> Arc<Self> {
        Arc::new(Self::with_device(Device::Cpu, DeviceLimits::default()))
    }

    fn with_device(device: Device, limits: DeviceLimits) -> Self {
        Self {
            device,
            limits,
            allocated: AtomicUsize::new(0),
            live_staging: AtomicUsize::new(0),
            #[cfg(test)]
            faults: faults::FaultPlan::default(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    /// Bytes currently held by live tensors and staging regions
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    /// Staging regions acquired and not yet released
    pub fn live_staging(&self) -> usize {
        self.live_staging.load(Ordering::SeqCst)
    }

    /// Fail with [`NovaError::Capacity`] if a single buffer of `bytes` cannot exist here
    pub fn check_capacity(&self, label: &str, bytes: usize) -> NovaResult<()> {
        if bytes > self.limits.max_buffer_bytes {
            return Err(NovaError::Capacity(format!(
                "'{}' needs {} bytes, device maximum buffer is {} bytes",
                label, bytes, self.limits.max_buffer_bytes
            )));
        }
        Ok(())
    }

    /// Account for `bytes` of new device memory
    pub(crate) fn reserve(&self, label: &str, bytes: usize) -> NovaResult<()> {
        self.check_capacity(label, bytes)?;
        let budget = self.limits.memory_budget_bytes;
        self.allocated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let next = current.checked_add(bytes)?;
                match budget {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            })
            .map(|_| ())
            .map_err(|current| {
                NovaError::Allocation(format!(
                    "'{}' needs {} bytes with {} of {:?} bytes in use",
                    label, bytes, current, budget
                ))
            })
    }

    pub(crate) fn release(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub(crate) fn staging_acquired(&self) {
        self.live_staging.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn staging_released(&self) {
        self.live_staging.fetch_sub(1, Ordering::SeqCst);
    }

    /// Build a pipeline for `kernel`
    pub fn create_pipeline(&self, label: &'static str, kernel: Kernel) -> Pipeline {
        log::debug!("Built pipeline '{}' ({:?})", label, kernel);
        Pipeline::new(label, kernel)
    }

    /// Execute every dispatch of `batch` in recorded order.
    ///
    /// Stops at the first failing dispatch; later dispatches are not run.
    pub fn submit<T: BufferTable>(
        &self,
        batch: &CommandBatch<'_, T::Slot>,
        table: &T,
    ) -> NovaResult<()> {
        for (index, dispatch) in batch.iter().enumerate() {
            let pipeline = dispatch.group.pipeline();
            #[cfg(test)]
            self.faults.check_dispatch(index, pipeline.label())?;

            let bindings: Vec<_> = dispatch
                .group
                .slots()
                .iter()
                .map(|&slot| table.buffer(slot))
                .collect();
            pipeline
                .kernel()
                .execute(&bindings, dispatch.uniforms)
                .map_err(|e| NovaError::Dispatch {
                    index,
                    pipeline: pipeline.label(),
                    reason: e.to_string(),
                })?;
        }
        log::trace!("Batch '{}' completed {} dispatches", batch.label(), batch.len());
        Ok(())
    }
}

fn open_device(kind: DeviceKind) -> NovaResult<Device> {
    let unavailable = |e: candle_core::Error| NovaError::DeviceUnavailable(e.to_string());
    match kind {
        DeviceKind::Cpu => Ok(Device::Cpu),
        DeviceKind::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(unavailable),
        DeviceKind::Metal(ordinal) => Device::new_metal(ordinal).map_err(unavailable),
        DeviceKind::Auto => {
            let device = Device::cuda_if_available(0).map_err(unavailable)?;
            if cfg!(feature = "metal") && device.is_cpu() {
                return Ok(Device::new_metal(0).unwrap_or(Device::Cpu));
            }
            Ok(device)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_context_starts_empty() {
        let ctx = ComputeContext::cpu();
        assert!(ctx.device().is_cpu());
        assert_eq!(ctx.allocated_bytes(), 0);
        assert_eq!(ctx.live_staging(), 0);
    }

    #[test]
    fn test_reserve_respects_budget() {
        let ctx = ComputeContext::new(DeviceConfig::cpu().with_budget(64)).unwrap();
        ctx.reserve("a", 48).unwrap();
        let err = ctx.reserve("b", 32).unwrap_err();
        assert!(matches!(err, NovaError::Allocation(_)));
        assert_eq!(ctx.allocated_bytes(), 48);

        ctx.release(48);
        ctx.reserve("b", 32).unwrap();
        assert_eq!(ctx.allocated_bytes(), 32);
    }

    #[test]
    fn test_oversized_buffer_is_capacity_error() {
        let ctx = ComputeContext::new(DeviceConfig::cpu().with_max_buffer(16)).unwrap();
        assert!(matches!(ctx.reserve("big", 17), Err(NovaError::Capacity(_))));
        assert!(ctx.check_capacity("ok", 16).is_ok());
        assert_eq!(ctx.limits().max_buffer_bytes, 16);
        assert_eq!(ctx.limits().memory_budget_bytes, None);
    }

    #[test]
    fn test_cuda_without_feature_is_unavailable() {
        if cfg!(feature = "cuda") {
            return;
        }
        let config = DeviceConfig {
            kind: DeviceKind::Cuda(0),
            ..Default::default()
        };
        assert!(matches!(
            ComputeContext::new(config),
            Err(NovaError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_auto_falls_back_to_some_device() {
        let config = DeviceConfig {
            kind: DeviceKind::Auto,
            ..Default::default()
        };
        assert!(ComputeContext::new(config).is_ok());
    }
}
