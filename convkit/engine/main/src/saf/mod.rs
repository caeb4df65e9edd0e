//! Facade re-exports for convkit-engine

pub use crate::api::error::*;
pub use crate::api::traits::*;
pub use crate::api::types::*;
pub use crate::core::engine::ConvolutionEngine;
pub use crate::core::gemm::{select_gemm, Avx2Gemm, PortableGemm};
pub use crate::core::scheduler::select_strategy;
pub use crate::core::winograd::{WinogradMatrices, WinogradTransform, F2X3, F3X3};

pub use convkit_core::{
    ActDims, ActLayout, Algorithm, BlockingHints, BlockingPlan, ConvDesc, ConvDims, ConvError,
    ConvShape, DType, Formats, KernelPreference, Precision, QuantParams, RuntimeConfig,
    SamplingKind, TensorSizes, Tiling, WeightDims, WeightLayout, WeightsReuse, V,
};
pub use convkit_quant::{QuantError, Requantizer};
