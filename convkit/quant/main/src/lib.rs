//! # convkit quant
//!
//! Int8 quantization for the convkit convolution engine.
//!
//! This crate provides:
//! - One-time per-output-channel weight quantization (scale + row-sum factor)
//! - Calibrated activation quantize/dequantize helpers
//! - Saturating requantization of accumulators to u8/i8
//! - The u8 x i8 -> i32 block dot-product microkernel with ISA dispatch

pub mod api;
mod core;
mod saf;

pub use saf::*;
