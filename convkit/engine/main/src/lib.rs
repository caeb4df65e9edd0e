//! # convkit engine
//!
//! CPU convolution execution engine for inference.
//!
//! This crate provides:
//! - Winograd F(2x2,3x3) and F(3x3,3x3) transform kernels
//! - Blocked Gemm kernels for f32 and u8 x i8 -> i32, selected by CPU capability
//! - The tile scheduler: strategy selection, static tile ownership per worker,
//!   per-worker input-transform caches, and fused epilogues
//! - `ConvolutionEngine`, which owns transformed weights and scratch buffers
//!
//! ## Example
//!
//! ```rust,ignore
//! use convkit_engine::{ConvDesc, ConvolutionEngine};
//!
//! let desc = ConvDesc::default();
//! let mut engine = ConvolutionEngine::new(desc)?;
//! engine.execute_f32(&mut output, &input, &weights, None)?;
//! ```

pub mod api;
mod core;
mod saf;

pub use saf::*;
