//! # Manifold State
//!
//! The persistent complex-valued memory of the engine: one spinor `(re, im)` per model
//! channel, stored as a `[d_model, 2]` tensor.
//!
//! Two copies are kept:
//! - `base` - slow, checkpointable. Only [`ManifoldState::commit_to_base`] and
//!   [`ManifoldState::load_base`] change it.
//! - `working` - fast and volatile. Forward calls mutate it in place; it is restored
//!   from `base` at the start of every independent session.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;
use std::sync::Arc;

use crate::backend::{ComputeContext, DeviceTensor};
use crate::NovaResult;

/// `n` spinors of magnitude `radius` at uniformly random angles, interleaved `(re, im)`
pub fn unit_spinors<R: Rng>(rng: &mut R, n: usize, radius: f32) -> Vec<f32> {
    (0..n)
        .flat_map(|_| {
            let theta = rng.gen::<f32>() * TAU;
            [theta.cos() * radius, theta.sin() * radius]
        })
        .collect()
}

/// Magnitude summary of a state tensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ManifoldStats {
    pub mean_magnitude: f32,
    pub max_magnitude: f32,
    /// Sum of squared magnitudes
    pub energy: f32,
}

impl ManifoldStats {
    /// Summarize interleaved `(re, im)` pairs
    pub fn from_pairs(data: &[f32]) -> Self {
        let magnitudes: Vec<f32> = data
            .chunks_exact(2)
            .map(|p| (p[0] * p[0] + p[1] * p[1]).sqrt())
            .collect();
        let n = magnitudes.len().max(1) as f32;
        Self {
            mean_magnitude: magnitudes.iter().sum::<f32>() / n,
            max_magnitude: magnitudes.iter().copied().fold(0.0, f32::max),
            energy: magnitudes.iter().map(|m| m * m).sum(),
        }
    }
}

#[derive(Debug)]
pub struct ManifoldState {
    base: DeviceTensor,
    working: DeviceTensor,
}

impl ManifoldState {
    /// Base initialized to random unit spinors, working reset from it
    pub fn new<R: Rng>(
        ctx: &Arc<ComputeContext>,
        channels: usize,
        rng: &mut R,
    ) -> NovaResult<Self> {
        let base = DeviceTensor::from_slice(
            ctx,
            "manifold_base",
            &[channels, 2],
            &unit_spinors(rng, channels, 1.0),
        )?;
        let working = DeviceTensor::create(ctx, "manifold_working", &[channels, 2])?;
        let mut state = Self { base, working };
        state.reset_working()?;
        Ok(state)
    }

    pub fn channels(&self) -> usize {
        self.base.shape()[0]
    }

    pub fn base(&self) -> &DeviceTensor {
        &self.base
    }

    pub fn working(&self) -> &DeviceTensor {
        &self.working
    }

    /// base → working; discards adaptation since the last commit
    pub fn reset_working(&mut self) -> NovaResult<()> {
        self.working.copy_from(&self.base)
    }

    /// working → base; makes accumulated adaptation permanent
    pub fn commit_to_base(&mut self) -> NovaResult<()> {
        self.base.copy_from(&self.working)
    }

    /// Overwrite the base state (e.g. from a snapshot). Working is left alone.
    pub fn load_base(&mut self, data: &[f32]) -> NovaResult<()> {
        self.base.write(data)
    }

    /// Overwrite the working state directly
    pub fn load_working(&mut self, data: &[f32]) -> NovaResult<()> {
        self.working.write(data)
    }

    pub fn working_stats(&self) -> NovaResult<ManifoldStats> {
        Ok(ManifoldStats::from_pairs(&self.working.read()?))
    }

    pub fn base_stats(&self) -> NovaResult<ManifoldStats> {
        Ok(ManifoldStats::from_pairs(&self.base.read()?))
    }
}
