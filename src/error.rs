//! Error types for the thinking engine and its device runtime

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NovaError {
    /// The device (or the context's memory budget) refused an allocation.
    #[error("Allocation failed: {0}")]
    Allocation(String),

    #[error("Tensor write size mismatch: expected {expected} bytes, got {got} bytes")]
    SizeMismatch { expected: usize, got: usize },

    #[error("Tensor disposed")]
    Disposed,

    #[error("Readback failed: {0}")]
    Readback(String),

    /// Requested dimensions exceed what the device supports.
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Token id {token} out of range for vocabulary of {vocab}")]
    TokenOutOfRange { token: usize, vocab: usize },

    #[error("Binding error in pipeline '{pipeline}': {reason}")]
    Binding { pipeline: &'static str, reason: String },

    #[error("Dispatch {index} ('{pipeline}') failed: {reason}")]
    Dispatch {
        index: usize,
        pipeline: &'static str,
        reason: String,
    },

    #[error("Engine invalidated: {0}")]
    Invalidated(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NovaError {
    /// Errors after which the engine can no longer run forward calls.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NovaError::Allocation(_)
                | NovaError::Capacity(_)
                | NovaError::DeviceUnavailable(_)
                | NovaError::Invalidated(_)
        )
    }
}
