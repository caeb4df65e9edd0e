//! Kernel traits

use convkit_core::DType;
use convkit_quant::Requantizer;

use crate::api::types::{GemmDims, KernelIsa, TileSource, TileWindow};

/// Blocked multiply-accumulate over `V`-wide channel blocks.
///
/// With `accumulate == false` each touched output tile is overwritten;
/// otherwise products are added to what is already there. Accumulation
/// order is fixed per call, so results do not depend on the caller's thread.
pub trait GemmKernel: Send + Sync {
    fn isa(&self) -> KernelIsa;

    fn gemm_f32(&self, out: &mut [f32], input: &[f32], weights: &[f32], dims: &GemmDims, accumulate: bool);

    /// u8 activations x i8 weights -> i32. Weight blocks use the
    /// `[V/VX][Vo][VX]` int8 layout.
    fn gemm_s8(&self, out: &mut [i32], input: &[u8], weights: &[i8], dims: &GemmDims, accumulate: bool);
}

/// Per-tile transforms into and out of a convolution-friendly domain.
///
/// All buffers carry `V` channel lanes per spatial position (`V x V` for weights).
pub trait TransformKernel: Send + Sync {
    /// Transform tile edge.
    fn alpha(&self) -> usize;

    /// Kernel edge the transform is built for.
    fn kernel_size(&self) -> usize;

    /// Output pixels per tile edge.
    fn out_tile(&self) -> usize {
        self.alpha() - self.kernel_size() + 1
    }

    /// `alpha x alpha` input tile -> transform domain. The whole tile must lie
    /// inside the source plane.
    fn forward_input(&self, out: &mut [f32], src: &TileSource<'_>);

    /// Like `forward_input`, reading only positions inside `window` and
    /// treating everything else as zero.
    fn forward_input_masked(&self, out: &mut [f32], src: &TileSource<'_>, window: TileWindow);

    /// `[k][k][Vi][Vo]` kernel -> `[alpha*alpha][Vi][Vo]`.
    fn forward_weights(&self, out: &mut [f32], weights: &[f32]);

    /// `[alpha*alpha][V]` accumulated tile -> `[out_tile*out_tile][V]`.
    fn inverse_output(&self, out: &mut [f32], input: &[f32]);
}

/// Element types an int8 convolution can write.
pub trait QuantOutput: bytemuck::Pod + Send + Sync {
    const DTYPE: DType;

    /// Convert a real (dequantized, post-activation) value.
    fn from_real(x: f32, requant: &Requantizer) -> Self;
}

impl QuantOutput for f32 {
    const DTYPE: DType = DType::F32;

    #[inline]
    fn from_real(x: f32, _requant: &Requantizer) -> Self {
        x
    }
}

impl QuantOutput for u8 {
    const DTYPE: DType = DType::U8;

    #[inline]
    fn from_real(x: f32, requant: &Requantizer) -> Self {
        requant.to_u8(x)
    }
}

impl QuantOutput for i8 {
    const DTYPE: DType = DType::I8;

    #[inline]
    fn from_real(x: f32, requant: &Requantizer) -> Self {
        requant.to_i8(x)
    }
}
