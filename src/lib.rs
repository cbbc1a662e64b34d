//! # Nova Manifold
//!
//! A recurrent "thinking" engine that maps a token id to vocabulary scores by
//! iterating a gated update over a persistent complex-valued manifold state. The
//! state adapts locally at inference time (active inference) without
//! back-propagation, and all numeric work runs as device dispatches.
//!
//! ## Features
//! - Persistent two-tier memory: `base` (checkpointable) and `working` (volatile)
//! - Symplectic-flow or holographic mixer over the complex state
//! - Local surprise correction of the working state during inference
//! - One command batch per forward call, bind groups built once at init
//! - RAII device buffers and staging with memory accounting
//! - CPU by default, CUDA / Metal via candle-core features
//!
//! ## Architecture
//!
//! ```text
//! token id → Embedding gather → stream
//!                                 │
//!              ┌──────── thinking step × N ────────┐
//!              │ RMSNorm → (r, v, σ(g))            │
//!              │        → mixer ⇄ working state    │
//!              │        → SwiGLU FFN → residual    │
//!              │        → RMSNorm                  │
//!              │ [adapt] predict → surprise → state│
//!              └───────────────────────────────────┘
//!                                 │
//!                     Embedding · stream → scores [vocab]
//! ```

// Device runtime
pub mod backend;
pub mod error;
pub mod config;

// Engine
pub mod params;
pub mod manifold;
pub mod rmsnorm;
pub mod workspace;
pub mod engine;


pub use backend::{
    BindGroup,
    BufferTable,
    CommandBatch,
    ComputeContext,
    DeviceTensor,
    Kernel,
    Pipeline,
    Uniforms,
};
pub use config::{DeviceConfig, DeviceKind, DeviceLimits, EngineConfig, MixerKind};
pub use engine::{
    AdaptationRates,
    EngineStatus,
    ForwardOptions,
    ObserveSummary,
    SequenceOptions,
    ThinkingEngine,
};
pub use error::NovaError;
pub use manifold::{ManifoldState, ManifoldStats};
pub use params::{InitPolicy, ParameterName, ParameterSet, ParameterSnapshot};

/// Result type for engine and device operations
pub type NovaResult<T> = Result<T, NovaError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        // Device
        ComputeContext,
        DeviceConfig,
        DeviceKind,
        DeviceTensor,

        // Engine
        EngineConfig,
        MixerKind,
        ThinkingEngine,
        ForwardOptions,
        SequenceOptions,
        EngineStatus,
        ParameterName,
        ParameterSnapshot,

        // Result type
        NovaResult,
        NovaError,
    };
}
