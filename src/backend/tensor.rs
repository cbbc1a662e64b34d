//! Device-resident f32 tensors with explicit lifetime.
//!
//! A [`DeviceTensor`] owns one device allocation of `size × 4` bytes. Writes overwrite
//! the allocation in place; reads go through a staging region that is released on
//! every exit path; disposal frees the allocation and poisons the handle.

use candle_core::{DType, Device, Tensor};
use std::fmt;
use std::sync::Arc;

use crate::backend::context::ComputeContext;
use crate::error::NovaError;
use crate::NovaResult;

const F32_BYTES: usize = std::mem::size_of::<f32>();

pub struct DeviceTensor {
    ctx: Arc<ComputeContext>,
    label: String,
    shape: Vec<usize>,
    size: usize,
    inner: Option<Tensor>,
}

impl DeviceTensor {
    /// Allocate a zero-filled tensor of `shape` on the context's device
    pub fn create(
        ctx: &Arc<ComputeContext>,
        label: impl Into<String>,
        shape: &[usize],
    ) -> NovaResult<Self> {
        let label = label.into();
        if shape.is_empty() || shape.iter().any(|&d| d == 0) {
            return Err(NovaError::InvalidConfig(format!(
                "tensor '{}' needs positive dimensions, got {:?}",
                label, shape
            )));
        }
        let size = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .and_then(|n| n.checked_mul(F32_BYTES).map(|_| n))
            .ok_or_else(|| {
                NovaError::Capacity(format!("tensor '{}' shape {:?} overflows", label, shape))
            })?;

        let byte_len = size * F32_BYTES;
        ctx.reserve(&label, byte_len)?;
        let inner = match Tensor::zeros(shape, DType::F32, ctx.device()) {
            Ok(t) => t,
            Err(e) => {
                ctx.release(byte_len);
                return Err(NovaError::Allocation(format!("'{}': {}", label, e)));
            }
        };

        Ok(Self {
            ctx: Arc::clone(ctx),
            label,
            shape: shape.to_vec(),
            size,
            inner: Some(inner),
        })
    }

    /// Allocate and fill in one step
    pub fn from_slice(
        ctx: &Arc<ComputeContext>,
        label: impl Into<String>,
        shape: &[usize],
        data: &[f32],
    ) -> NovaResult<Self> {
        let mut tensor = Self::create(ctx, label, shape)?;
        tensor.write(data)?;
        Ok(tensor)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of f32 elements
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn byte_len(&self) -> usize {
        self.size * F32_BYTES
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_none()
    }

    /// Overwrite the whole tensor.
    ///
    /// `data` must hold exactly `size` floats; on mismatch the content is unchanged.
    pub fn write(&mut self, data: &[f32]) -> NovaResult<()> {
        self.live()?;
        let got = data.len() * F32_BYTES;
        if got != self.byte_len() {
            return Err(NovaError::SizeMismatch {
                expected: self.byte_len(),
                got,
            });
        }
        let src = Tensor::from_slice(data, self.shape.as_slice(), self.ctx.device())?;
        self.store(&src)
    }

    /// Overwrite from raw little-endian f32 bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) -> NovaResult<()> {
        self.live()?;
        if bytes.len() != self.byte_len() {
            return Err(NovaError::SizeMismatch {
                expected: self.byte_len(),
                got: bytes.len(),
            });
        }
        let data: Vec<f32> = bytes
            .chunks_exact(F32_BYTES)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        self.write(&data)
    }

    pub fn zero(&mut self) -> NovaResult<()> {
        let zeros = Tensor::zeros(self.shape.as_slice(), DType::F32, self.ctx.device())?;
        self.store(&zeros)
    }

    /// Device-side copy of `other` into this tensor
    pub fn copy_from(&mut self, other: &DeviceTensor) -> NovaResult<()> {
        if other.size != self.size {
            return Err(NovaError::SizeMismatch {
                expected: self.byte_len(),
                got: other.byte_len(),
            });
        }
        let src = other.tensor()?.reshape(self.shape.as_slice())?;
        self.store(&src)
    }

    /// Copy the tensor back to host memory.
    ///
    /// Acquires a staging region, copies into it, waits for the copy and decodes it.
    /// The staging region is released whether or not the copy succeeds.
    pub fn read(&self) -> NovaResult<Vec<f32>> {
        let inner = self.live()?;
        let staging = Staging::acquire(&self.ctx, &self.label, self.byte_len())?;
        staging.copy_out(inner)
    }

    /// Release the device allocation. Any later use fails with [`NovaError::Disposed`].
    pub fn dispose(&mut self) -> NovaResult<()> {
        match self.inner.take() {
            Some(_) => {
                self.ctx.release(self.byte_len());
                Ok(())
            }
            None => Err(NovaError::Disposed),
        }
    }

    pub(crate) fn tensor(&self) -> NovaResult<&Tensor> {
        self.live()
    }

    /// Copy `src` into this tensor's allocation.
    ///
    /// `src` must not share storage with `self`; kernels always hand in freshly
    /// computed tensors or views of a different buffer.
    pub(crate) fn store(&self, src: &Tensor) -> NovaResult<()> {
        let dst = self.live()?;
        if src.elem_count() != self.size {
            return Err(NovaError::SizeMismatch {
                expected: self.byte_len(),
                got: src.elem_count() * F32_BYTES,
            });
        }
        let src = if src.dims() == self.shape.as_slice() {
            src.clone()
        } else {
            src.reshape(self.shape.as_slice())?
        };
        let src = if src.is_contiguous() { src } else { src.contiguous()? };
        dst.slice_set(&src, 0, 0)?;
        Ok(())
    }

    fn live(&self) -> NovaResult<&Tensor> {
        self.inner.as_ref().ok_or(NovaError::Disposed)
    }
}

impl Drop for DeviceTensor {
    fn drop(&mut self) {
        if self.inner.take().is_some() {
            self.ctx.release(self.byte_len());
        }
    }
}

impl fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("label", &self.label)
            .field("shape", &self.shape)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Host-readable staging region, released on drop.
struct Staging<'a> {
    ctx: &'a ComputeContext,
    bytes: usize,
}

impl<'a> Staging<'a> {
    fn acquire(ctx: &'a ComputeContext, label: &str, bytes: usize) -> NovaResult<Self> {
        ctx.reserve(label, bytes)
            .map_err(|e| NovaError::Readback(format!("staging for '{}': {}", label, e)))?;
        ctx.staging_acquired();
        Ok(Self { ctx, bytes })
    }

    fn copy_out(&self, src: &Tensor) -> NovaResult<Vec<f32>> {
        #[cfg(test)]
        self.ctx.faults.check_readback()?;

        let readback = |e: candle_core::Error| NovaError::Readback(e.to_string());
        let host = src.to_device(&Device::Cpu).map_err(readback)?;
        host.flatten_all()
            .and_then(|flat| flat.to_vec1::<f32>())
            .map_err(readback)
    }
}

impl Drop for Staging<'_> {
    fn drop(&mut self) {
        self.ctx.release(self.bytes);
        self.ctx.staging_released();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    #[test]
    fn test_write_then_read_is_bit_exact() {
        let ctx = ComputeContext::cpu();
        let data = vec![1.5f32, -0.0, f32::MIN_POSITIVE, 3.0e-39, f32::MAX, -7.25];
        let mut t = DeviceTensor::create(&ctx, "t", &[2, 3]).unwrap();
        t.write(&data).unwrap();

        let back = t.read().unwrap();
        let bits: Vec<u32> = back.iter().map(|v| v.to_bits()).collect();
        let expected: Vec<u32> = data.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits, expected);
    }

    #[test]
    fn test_size_mismatch_leaves_content() {
        let ctx = ComputeContext::cpu();
        let mut t = DeviceTensor::from_slice(&ctx, "t", &[4], &[1.0, 2.0, 3.0, 4.0]).unwrap();

        let err = t.write(&[9.0, 9.0, 9.0]).unwrap_err();
        assert!(matches!(err, NovaError::SizeMismatch { expected: 16, got: 12 }));
        let err = t.write_bytes(&[0u8; 17]).unwrap_err();
        assert!(matches!(err, NovaError::SizeMismatch { expected: 16, got: 17 }));

        assert_eq!(t.read().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_write_bytes_decodes_little_endian() {
        let ctx = ComputeContext::cpu();
        let mut t = DeviceTensor::create(&ctx, "t", &[2]).unwrap();
        let bytes: Vec<u8> = [0.5f32, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        t.write_bytes(&bytes).unwrap();
        assert_eq!(t.read().unwrap(), vec![0.5, -2.0]);
    }

    #[test]
    fn test_use_after_dispose_fails() {
        let ctx = ComputeContext::cpu();
        let mut t = DeviceTensor::create(&ctx, "t", &[3]).unwrap();
        assert_eq!(ctx.allocated_bytes(), 12);

        t.dispose().unwrap();
        assert!(t.is_disposed());
        assert_eq!(ctx.allocated_bytes(), 0);
        assert!(matches!(t.read(), Err(NovaError::Disposed)));
        assert!(matches!(t.write(&[0.0; 3]), Err(NovaError::Disposed)));
        assert!(matches!(t.zero(), Err(NovaError::Disposed)));
        assert!(matches!(t.dispose(), Err(NovaError::Disposed)));
    }

    #[test]
    fn test_rejects_non_positive_dimensions() {
        let ctx = ComputeContext::cpu();
        assert!(matches!(
            DeviceTensor::create(&ctx, "t", &[4, 0]),
            Err(NovaError::InvalidConfig(_))
        ));
        assert!(DeviceTensor::create(&ctx, "t", &[]).is_err());
    }

    #[test]
    fn test_allocation_over_budget_fails() {
        let ctx = ComputeContext::new(DeviceConfig::cpu().with_budget(32)).unwrap();
        let _a = DeviceTensor::create(&ctx, "a", &[6]).unwrap();
        let err = DeviceTensor::create(&ctx, "b", &[4]).unwrap_err();
        assert!(matches!(err, NovaError::Allocation(_)));
        assert_eq!(ctx.allocated_bytes(), 24);
    }

    #[test]
    fn test_drop_releases_memory() {
        let ctx = ComputeContext::cpu();
        {
            let _t = DeviceTensor::create(&ctx, "scoped", &[8, 8]).unwrap();
            assert_eq!(ctx.allocated_bytes(), 256);
        }
        assert_eq!(ctx.allocated_bytes(), 0);
    }

    #[test]
    fn test_staging_released_after_success_and_failure() {
        let ctx = ComputeContext::cpu();
        let t = DeviceTensor::from_slice(&ctx, "t", &[2], &[1.0, 2.0]).unwrap();

        t.read().unwrap();
        assert_eq!(ctx.live_staging(), 0);
        assert_eq!(ctx.allocated_bytes(), 8);

        ctx.faults.fail_next_readback();
        assert!(matches!(t.read(), Err(NovaError::Readback(_))));
        assert_eq!(ctx.live_staging(), 0);
        assert_eq!(ctx.allocated_bytes(), 8);

        assert_eq!(t.read().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_staging_over_budget_is_readback_error() {
        let ctx = ComputeContext::new(DeviceConfig::cpu().with_budget(16)).unwrap();
        let t = DeviceTensor::from_slice(&ctx, "t", &[3], &[1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(t.read(), Err(NovaError::Readback(_))));
        assert_eq!(ctx.live_staging(), 0);
    }

    #[test]
    fn test_copy_from_and_zero() {
        let ctx = ComputeContext::cpu();
        let src = DeviceTensor::from_slice(&ctx, "src", &[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut dst = DeviceTensor::create(&ctx, "dst", &[2, 2]).unwrap();

        dst.copy_from(&src).unwrap();
        assert_eq!(dst.read().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

        dst.zero().unwrap();
        assert_eq!(dst.read().unwrap(), vec![0.0; 4]);
        assert_eq!(src.read().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
