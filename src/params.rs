//! # Parameter Set
//!
//! The fixed projections that shape the recurrent dynamics: embedding, rotation /
//! value / gate projections, the gated feed-forward block, the prediction projection
//! and the norm gain. They are drawn once from a variance-scaled Gaussian and never
//! updated by a forward call.
//!
//! ## Initialization
//! ```text
//! std = sqrt(2 / (fan_in + fan_out)) * gain * extra_scale
//! extra_scale = 1                          (Xavier)
//!             = 1 / sqrt(2 * thinking_steps)  (Residual, FFN down-projection)
//! ```
//! The residual scale bounds variance growth across the iterated residual additions.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::{ComputeContext, DeviceTensor};
use crate::config::EngineConfig;
use crate::error::NovaError;
use crate::NovaResult;

/// Names of the tensors in a [`ParameterSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParameterName {
    Embedding,
    NormGain,
    Wr,
    Wv,
    Wg,
    Up1,
    Up2,
    Down,
    WPredict,
}

impl ParameterName {
    pub const ALL: [ParameterName; 9] = [
        ParameterName::Embedding,
        ParameterName::NormGain,
        ParameterName::Wr,
        ParameterName::Wv,
        ParameterName::Wg,
        ParameterName::Up1,
        ParameterName::Up2,
        ParameterName::Down,
        ParameterName::WPredict,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterName::Embedding => "embedding",
            ParameterName::NormGain => "norm_gain",
            ParameterName::Wr => "wr",
            ParameterName::Wv => "wv",
            ParameterName::Wg => "wg",
            ParameterName::Up1 => "ffn_up1",
            ParameterName::Up2 => "ffn_up2",
            ParameterName::Down => "ffn_down",
            ParameterName::WPredict => "w_predict",
        }
    }

    /// Tensor shape under `config`
    pub fn shape(&self, config: &EngineConfig) -> Vec<usize> {
        let (d, h) = (config.d_model, config.ffn_hidden);
        match self {
            ParameterName::Embedding => vec![config.vocab_size, d],
            ParameterName::NormGain => vec![d],
            ParameterName::Wr | ParameterName::Wv | ParameterName::Wg | ParameterName::WPredict => {
                vec![d, d]
            }
            ParameterName::Up1 | ParameterName::Up2 => vec![h, d],
            ParameterName::Down => vec![d, h],
        }
    }

    /// Initialization used for this tensor under `config`
    pub fn init_policy(&self, config: &EngineConfig) -> InitPolicy {
        let (d, h) = (config.d_model, config.ffn_hidden);
        match self {
            ParameterName::NormGain => InitPolicy::Ones,
            ParameterName::Embedding
            | ParameterName::Wr
            | ParameterName::Wv
            | ParameterName::Wg
            | ParameterName::WPredict => InitPolicy::Xavier { fan_in: d, fan_out: d },
            ParameterName::Up1 | ParameterName::Up2 => InitPolicy::Xavier { fan_in: d, fan_out: h },
            ParameterName::Down => InitPolicy::Residual {
                fan_in: h,
                fan_out: d,
                thinking_steps: config.thinking_steps,
            },
        }
    }
}

/// Per-tensor initialization policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitPolicy {
    /// Variance-scaled Gaussian
    Xavier { fan_in: usize, fan_out: usize },
    /// Variance-scaled Gaussian shrunk by `1 / sqrt(2 * thinking_steps)`
    Residual {
        fan_in: usize,
        fan_out: usize,
        thinking_steps: usize,
    },
    /// All ones (norm gain)
    Ones,
}

impl InitPolicy {
    /// Standard deviation of the Gaussian, `None` for constant policies
    pub fn std(&self, gain: f32) -> NovaResult<Option<f32>> {
        let (fan_in, fan_out, extra) = match *self {
            InitPolicy::Ones => return Ok(None),
            InitPolicy::Xavier { fan_in, fan_out } => (fan_in, fan_out, 1.0),
            InitPolicy::Residual {
                fan_in,
                fan_out,
                thinking_steps,
            } => {
                if thinking_steps == 0 {
                    return Err(NovaError::InvalidConfig("thinking_steps must be positive".into()));
                }
                (fan_in, fan_out, 1.0 / (2.0 * thinking_steps as f32).sqrt())
            }
        };
        if fan_in == 0 || fan_out == 0 {
            return Err(NovaError::InvalidConfig(format!(
                "fan_in and fan_out must be positive, got {} and {}",
                fan_in, fan_out
            )));
        }
        Ok(Some((2.0 / (fan_in + fan_out) as f32).sqrt() * gain * extra))
    }

    /// Draw `len` values following this policy
    pub fn sample<R: Rng + ?Sized>(
        &self,
        len: usize,
        gain: f32,
        rng: &mut R,
    ) -> NovaResult<Vec<f32>> {
        match self.std(gain)? {
            None => Ok(vec![1.0; len]),
            Some(std) => {
                let normal = Normal::new(0.0f32, std)
                    .map_err(|e| NovaError::InvalidConfig(format!("init std {}: {}", std, e)))?;
                Ok((0..len).map(|_| normal.sample(rng)).collect())
            }
        }
    }
}

/// Host copy of every named tensor, for an external snapshot collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    pub tensors: BTreeMap<ParameterName, Vec<f32>>,
    /// Base manifold state, `[d_model, 2]` flattened
    pub base_manifold: Option<Vec<f32>>,
}

/// The fixed projections of the engine
#[derive(Debug)]
pub struct ParameterSet {
    pub embedding: DeviceTensor,
    pub norm_gain: DeviceTensor,
    pub wr: DeviceTensor,
    pub wv: DeviceTensor,
    pub wg: DeviceTensor,
    pub up1: DeviceTensor,
    pub up2: DeviceTensor,
    pub down: DeviceTensor,
    pub w_predict: DeviceTensor,
}

impl ParameterSet {
    /// Allocate and initialize every tensor from `rng`
    pub fn new<R: Rng + ?Sized>(
        ctx: &Arc<ComputeContext>,
        config: &EngineConfig,
        rng: &mut R,
    ) -> NovaResult<Self> {
        config.validate()?;
        let mut build = |name: ParameterName| -> NovaResult<DeviceTensor> {
            let shape = name.shape(config);
            let mut tensor = DeviceTensor::create(ctx, name.as_str(), &shape)?;
            let data = name.init_policy(config).sample(tensor.size(), 1.0, rng)?;
            tensor.write(&data)?;
            Ok(tensor)
        };

        Ok(Self {
            embedding: build(ParameterName::Embedding)?,
            norm_gain: build(ParameterName::NormGain)?,
            wr: build(ParameterName::Wr)?,
            wv: build(ParameterName::Wv)?,
            wg: build(ParameterName::Wg)?,
            up1: build(ParameterName::Up1)?,
            up2: build(ParameterName::Up2)?,
            down: build(ParameterName::Down)?,
            w_predict: build(ParameterName::WPredict)?,
        })
    }

    pub fn get(&self, name: ParameterName) -> &DeviceTensor {
        match name {
            ParameterName::Embedding => &self.embedding,
            ParameterName::NormGain => &self.norm_gain,
            ParameterName::Wr => &self.wr,
            ParameterName::Wv => &self.wv,
            ParameterName::Wg => &self.wg,
            ParameterName::Up1 => &self.up1,
            ParameterName::Up2 => &self.up2,
            ParameterName::Down => &self.down,
            ParameterName::WPredict => &self.w_predict,
        }
    }

    pub fn get_mut(&mut self, name: ParameterName) -> &mut DeviceTensor {
        match name {
            ParameterName::Embedding => &mut self.embedding,
            ParameterName::NormGain => &mut self.norm_gain,
            ParameterName::Wr => &mut self.wr,
            ParameterName::Wv => &mut self.wv,
            ParameterName::Wg => &mut self.wg,
            ParameterName::Up1 => &mut self.up1,
            ParameterName::Up2 => &mut self.up2,
            ParameterName::Down => &mut self.down,
            ParameterName::WPredict => &mut self.w_predict,
        }
    }

    /// Total device bytes held by the parameters
    pub fn byte_len(&self) -> usize {
        ParameterName::ALL.iter().map(|&n| self.get(n).byte_len()).sum()
    }

    /// Read every tensor back to the host
    pub fn export(&self) -> NovaResult<ParameterSnapshot> {
        let mut tensors = BTreeMap::new();
        for name in ParameterName::ALL {
            tensors.insert(name, self.get(name).read()?);
        }
        Ok(ParameterSnapshot {
            tensors,
            base_manifold: None,
        })
    }

    /// Overwrite the tensors present in `snapshot`.
    ///
    /// Every present tensor is size-checked before any is written, so a bad snapshot
    /// leaves the set unchanged.
    pub fn import(&mut self, snapshot: &ParameterSnapshot) -> NovaResult<()> {
        for (&name, data) in &snapshot.tensors {
            let tensor = self.get(name);
            if data.len() != tensor.size() {
                return Err(NovaError::SizeMismatch {
                    expected: tensor.byte_len(),
                    got: data.len() * std::mem::size_of::<f32>(),
                });
            }
        }
        for (&name, data) in &snapshot.tensors {
            self.get_mut(name).write(data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn std_of(data: &[f32]) -> f32 {
        let mean = data.iter().sum::<f32>() / data.len() as f32;
        let var = data.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / data.len() as f32;
        var.sqrt()
    }

    #[test]
    fn test_init_std_formula() {
        let xavier = InitPolicy::Xavier { fan_in: 64, fan_out: 64 };
        assert!((xavier.std(1.0).unwrap().unwrap() - (2.0f32 / 128.0).sqrt()).abs() < 1e-7);

        let residual = InitPolicy::Residual {
            fan_in: 256,
            fan_out: 64,
            thinking_steps: 8,
        };
        let expected = (2.0f32 / 320.0).sqrt() / 4.0;
        assert!((residual.std(1.0).unwrap().unwrap() - expected).abs() < 1e-7);

        assert_eq!(InitPolicy::Ones.std(1.0).unwrap(), None);
    }

    #[test]
    fn test_init_rejects_zero_fans() {
        let policy = InitPolicy::Xavier { fan_in: 0, fan_out: 4 };
        assert!(matches!(policy.std(1.0), Err(NovaError::InvalidConfig(_))));
    }

    #[test]
    fn test_sampled_std_close_to_target() {
        let mut rng = StdRng::seed_from_u64(3);
        let policy = InitPolicy::Xavier { fan_in: 32, fan_out: 32 };
        let data = policy.sample(20_000, 1.0, &mut rng).unwrap();
        let target = policy.std(1.0).unwrap().unwrap();
        assert!((std_of(&data) - target).abs() < target * 0.05);
    }

    #[test]
    fn test_parameter_set_is_deterministic_per_seed() {
        let ctx = ComputeContext::cpu();
        let config = EngineConfig::tiny();
        let a = ParameterSet::new(&ctx, &config, &mut StdRng::seed_from_u64(11)).unwrap();
        let b = ParameterSet::new(&ctx, &config, &mut StdRng::seed_from_u64(11)).unwrap();
        let c = ParameterSet::new(&ctx, &config, &mut StdRng::seed_from_u64(12)).unwrap();

        assert_eq!(a.wr.read().unwrap(), b.wr.read().unwrap());
        assert_ne!(a.wr.read().unwrap(), c.wr.read().unwrap());
        assert_eq!(a.norm_gain.read().unwrap(), vec![1.0; config.d_model]);
    }

    #[test]
    fn test_shapes_follow_config() {
        let ctx = ComputeContext::cpu();
        let config = EngineConfig::tiny();
        let set = ParameterSet::new(&ctx, &config, &mut StdRng::seed_from_u64(1)).unwrap();

        assert_eq!(set.embedding.shape(), &[64, 16]);
        assert_eq!(set.up1.shape(), &[32, 16]);
        assert_eq!(set.down.shape(), &[16, 32]);
        assert_eq!(set.byte_len(), ctx.allocated_bytes());
    }

    #[test]
    fn test_down_projection_is_shrunk() {
        let ctx = ComputeContext::cpu();
        let config = EngineConfig {
            d_model: 64,
            ffn_hidden: 64,
            thinking_steps: 8,
            ..EngineConfig::tiny()
        };
        let set = ParameterSet::new(&ctx, &config, &mut StdRng::seed_from_u64(5)).unwrap();
        let up = std_of(&set.up1.read().unwrap());
        let down = std_of(&set.down.read().unwrap());
        // same fans, residual scale 1/4
        assert!((down / up - 0.25).abs() < 0.03, "ratio {}", down / up);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let ctx = ComputeContext::cpu();
        let config = EngineConfig::tiny();
        let source = ParameterSet::new(&ctx, &config, &mut StdRng::seed_from_u64(1)).unwrap();
        let mut target = ParameterSet::new(&ctx, &config, &mut StdRng::seed_from_u64(2)).unwrap();

        let snapshot = source.export().unwrap();
        assert_eq!(snapshot.tensors.len(), ParameterName::ALL.len());
        target.import(&snapshot).unwrap();
        assert_eq!(target.embedding.read().unwrap(), source.embedding.read().unwrap());
    }

    #[test]
    fn test_import_rejects_wrong_size_without_writing() {
        let ctx = ComputeContext::cpu();
        let config = EngineConfig::tiny();
        let mut set = ParameterSet::new(&ctx, &config, &mut StdRng::seed_from_u64(1)).unwrap();
        let before = set.wr.read().unwrap();

        let mut snapshot = ParameterSnapshot::default();
        snapshot.tensors.insert(ParameterName::Wr, vec![0.0; 16 * 16]);
        snapshot.tensors.insert(ParameterName::Wv, vec![0.0; 3]);
        assert!(matches!(set.import(&snapshot), Err(NovaError::SizeMismatch { .. })));
        assert_eq!(set.wr.read().unwrap(), before);
    }
}
