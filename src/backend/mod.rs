//! Device runtime for the thinking engine
//!
//! Everything that touches device memory lives here:
//!
//! - [`ComputeContext`] owns the candle [`Device`](candle_core::Device), tracks how many
//!   bytes are resident, builds pipelines and executes command batches.
//! - [`DeviceTensor`] is a fixed-shape f32 buffer with explicit write, staged read-back
//!   and disposal.
//! - [`Kernel`] / [`Pipeline`] describe the compute programs; [`BindGroup`] wires a
//!   pipeline to concrete buffers once, and [`CommandBatch`] records the dispatches of a
//!   single forward call so they are submitted together.
//!
//! The default device is the CPU. Build with `--features cuda` or `--features metal`
//! and pick [`DeviceKind::Cuda`](crate::config::DeviceKind) /
//! [`DeviceKind::Metal`](crate::config::DeviceKind) to run on an accelerator.
//!
//! ```bash
//! # Default (CPU)
//! cargo build --release
//!
//! # NVIDIA GPU
//! cargo build --release --features cuda
//! ```

pub mod batch;
pub mod context;
pub mod kernels;
pub mod tensor;

pub use batch::{BindGroup, BufferTable, CommandBatch, Dispatch};
pub use context::ComputeContext;
pub use kernels::{Kernel, Pipeline, Uniforms};
pub use tensor::DeviceTensor;
