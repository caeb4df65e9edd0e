//! Facade re-exports for convkit-quant

pub use crate::api::error::*;
pub use crate::api::types::*;
pub use crate::core::requant::{
    dequantize_accumulator, dequantize_u8, quantize_u8, validate_calibration, Requantizer,
};
pub use crate::core::simd::{dot_u8i8_block, dot_u8i8_block_scalar_ref};
pub use crate::core::weights::{dequantize_weight, quantize_weights};
