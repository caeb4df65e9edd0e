//! # convkit core
//!
//! Leaf types shared by every convkit crate.
//!
//! This crate provides:
//! - The convolution descriptor (`ConvDesc`) and its memory layout tags
//! - `TensorView`, a strided view used for all address arithmetic
//! - `BlockingPlan`, the channel/tile blocking factors derived from a shape
//! - Reorders between plain (`Nchw`, `Nhwc`, `Oihw`, `Hwio`) and blocked layouts
//! - `RuntimeConfig`, the worker pool configuration
//!
//! ## Example
//!
//! ```rust,ignore
//! use convkit_core::{BlockingPlan, ConvDesc, Tiling, BlockingHints};
//!
//! let desc = ConvDesc::default();
//! let shape = desc.shape()?;
//! let plan = BlockingPlan::new(&shape, Tiling::Row { t: 8 }, &BlockingHints::default())?;
//! ```

pub mod api;
mod core;
mod saf;

pub use saf::*;
