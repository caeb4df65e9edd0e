//! Error types for convolution execution

use convkit_core::ConvError;
use convkit_quant::QuantError;
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while building or running an engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Conv(#[from] ConvError),

    #[error(transparent)]
    Quant(#[from] QuantError),

    #[error("Kernel unsupported: {0}")]
    KernelUnsupported(String),
}
