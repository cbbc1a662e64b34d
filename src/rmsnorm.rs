//! # RMSNorm - Root Mean Square Normalization
//!
//! Normalizes the stream using only its root mean square, without mean subtraction.
//! Only basic tensor operations are used (sqr, mean, sqrt, div), so the same program
//! runs on every candle device.
//!
//! ## Formula
//! ```text
//! RMSNorm(x) = x / sqrt(mean(x^2) + eps) * gain
//! ```
//!
//! The `eps` floor keeps the result finite for an all-zero stream.

use candle_core::{Result as CandleResult, Tensor, D};

/// Default floor under the mean square
pub const DEFAULT_EPS: f64 = 1e-5;

/// Normalize `x` over its last dimension and scale by `gain`
pub fn rms_norm(x: &Tensor, gain: &Tensor, eps: f64) -> CandleResult<Tensor> {
    // Compute mean of x^2 along last dimension, keeping dims
    let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;

    // sqrt(mean(x^2) + eps)
    let rms = (mean_sq + eps)?.sqrt()?;

    x.broadcast_div(&rms)?.broadcast_mul(gain)
}
