//! # Engine Configuration
//!
//! Model dimensions, adaptation rates and device selection. Every struct here is
//! serde-serializable so a host application can keep it in a `config.json` next to
//! whatever snapshot format it uses for weights.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::NovaError;
use crate::NovaResult;

/// How the manifold state is mixed with the per-iteration stimulus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MixerKind {
    /// Rotate, gate, then inject. Keeps the spinor magnitude bounded.
    #[default]
    Symplectic,
    /// Decay-and-write followed by a rotated, gated read.
    Holographic,
}

/// Configuration for the thinking engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Vocabulary size (rows of the embedding matrix)
    pub vocab_size: usize,
    /// Model width (channels of the stream and the manifold state)
    pub d_model: usize,
    /// Feed-forward intermediate width
    pub ffn_hidden: usize,
    /// Default number of thinking iterations per token
    pub thinking_steps: usize,
    /// Largest iteration count a call may request
    #[serde(default = "default_max_thinking_steps")]
    pub max_thinking_steps: usize,
    /// RMSNorm floor
    pub rms_eps: f64,
    /// Gate gain applied to the rotated state
    pub decay: f32,
    /// Step size of the local surprise correction
    pub learning_rate: f32,
    /// Imaginary share of the injected stimulus
    pub imag_scale: f32,
    /// Real/imaginary blend of the manifold read-out, clamped to [0, 1]
    pub read_mix: f32,
    /// State mixer
    pub mixer: MixerKind,
    /// Seed for parameter and spinor initialization; `None` draws from entropy
    pub seed: Option<u64>,
}

fn default_max_thinking_steps() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50257,
            d_model: 768,
            ffn_hidden: 3072,
            thinking_steps: 12,
            max_thinking_steps: default_max_thinking_steps(),
            rms_eps: 1e-5,
            decay: 0.9,
            learning_rate: 0.001,
            imag_scale: 0.25,
            read_mix: 1.0,
            mixer: MixerKind::Symplectic,
            seed: None,
        }
    }
}

impl EngineConfig {
    /// Create a tiny config for testing
    pub fn tiny() -> Self {
        Self {
            vocab_size: 64,
            d_model: 16,
            ffn_hidden: 32,
            thinking_steps: 3,
            seed: Some(7),
            ..Default::default()
        }
    }

    /// Create a small config for quick local experiments
    pub fn small() -> Self {
        Self {
            vocab_size: 4096,
            d_model: 128,
            ffn_hidden: 512,
            thinking_steps: 6,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_mixer(mut self, mixer: MixerKind) -> Self {
        self.mixer = mixer;
        self
    }

    pub fn with_rates(mut self, decay: f32, learning_rate: f32) -> Self {
        self.decay = decay;
        self.learning_rate = learning_rate;
        self
    }

    /// Reject dimensions and constants the engine cannot run with
    pub fn validate(&self) -> NovaResult<()> {
        for (name, value) in [
            ("vocab_size", self.vocab_size),
            ("d_model", self.d_model),
            ("ffn_hidden", self.ffn_hidden),
            ("thinking_steps", self.thinking_steps),
        ] {
            if value == 0 {
                return Err(NovaError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if self.thinking_steps > self.max_thinking_steps {
            return Err(NovaError::InvalidConfig(format!(
                "thinking_steps {} exceeds max_thinking_steps {}",
                self.thinking_steps, self.max_thinking_steps
            )));
        }
        if self.rms_eps.is_nan() || self.rms_eps <= 0.0 {
            return Err(NovaError::InvalidConfig(format!(
                "rms_eps must be positive, got {}",
                self.rms_eps
            )));
        }
        for (name, value) in [
            ("decay", self.decay),
            ("learning_rate", self.learning_rate),
            ("imag_scale", self.imag_scale),
            ("read_mix", self.read_mix),
        ] {
            if !value.is_finite() {
                return Err(NovaError::InvalidConfig(format!("{} must be finite", name)));
            }
        }
        Ok(())
    }

    /// Load a config from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> NovaResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| NovaError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save_json(&self, path: impl AsRef<Path>) -> NovaResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| NovaError::Serialization(e.to_string()))?;
        fs::write(path.as_ref(), json)?;
        log::info!("Saved engine config to {:?}", path.as_ref());
        Ok(())
    }
}

/// Which device backs the compute context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceKind {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
    /// First accelerator found, CPU otherwise
    Auto,
}

/// Resource limits enforced by the compute context
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceLimits {
    /// Largest single buffer, in bytes
    pub max_buffer_bytes: usize,
    /// Total device memory the context may hold; `None` leaves it to the device
    pub memory_budget_bytes: Option<usize>,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 1 << 30,
            memory_budget_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    pub limits: DeviceLimits,
}

impl DeviceConfig {
    pub fn cpu() -> Self {
        Self::default()
    }

    pub fn with_budget(mut self, bytes: usize) -> Self {
        self.limits.memory_budget_bytes = Some(bytes);
        self
    }

    pub fn with_max_buffer(mut self, bytes: usize) -> Self {
        self.limits.max_buffer_bytes = bytes;
        self
    }
}
