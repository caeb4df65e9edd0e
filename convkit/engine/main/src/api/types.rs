//! Types for the convolution engine

use convkit_core::{KernelPreference, Tiling};

/// Kernel capability level, picked once per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelIsa {
    /// Scalar kernels; available everywhere.
    Portable,
    /// AVX2 + FMA on x86_64.
    Avx2,
}

impl KernelIsa {
    /// Best level supported by the running CPU.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                return KernelIsa::Avx2;
            }
        }
        KernelIsa::Portable
    }

    pub fn resolve(pref: KernelPreference) -> Self {
        match pref {
            KernelPreference::Auto => Self::detect(),
            KernelPreference::Portable => KernelIsa::Portable,
        }
    }
}

impl std::fmt::Display for KernelIsa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelIsa::Portable => write!(f, "portable"),
            KernelIsa::Avx2 => write!(f, "avx2"),
        }
    }
}

/// Execution strategy chosen for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// f32 direct convolution, any kernel size, stride and padding.
    Direct,
    /// f32 1x1 convolution without padding as a plain Gemm over pixels.
    Pointwise,
    /// f32 Winograd for 3x3 unit-stride kernels, `alpha x alpha` tiles.
    Winograd { alpha: usize },
    /// u8 x i8 direct convolution with fused dequantize/requantize.
    Int8Direct,
}

impl Strategy {
    pub fn tiling(&self) -> Tiling {
        match self {
            Strategy::Direct | Strategy::Int8Direct => Tiling::Row { t: 0 },
            Strategy::Pointwise => Tiling::Flat { t: 0 },
            Strategy::Winograd { alpha } => Tiling::Winograd { alpha: *alpha, k: 3 },
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Direct => write!(f, "direct"),
            Strategy::Pointwise => write!(f, "pointwise"),
            Strategy::Winograd { alpha } => write!(f, "winograd_{}x{}", alpha, alpha),
            Strategy::Int8Direct => write!(f, "int8_direct"),
        }
    }
}

/// Lifecycle of an engine's transformed weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsState {
    Uninitialized,
    Ready,
}

/// Geometry of one Gemm call.
///
/// The kernel computes, for every output block `o < oc_blocks` and tile
/// `t < tiles`, `out[o][t][..V] (+)= sum_i input[i][t][..V] x weights[o][i]`,
/// where each weight block is a row-major `V x V` (`[Vi][Vo]`) matrix.
/// Strides are in elements and let callers read strided input in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmDims {
    pub oc_blocks: usize,
    pub ic_blocks: usize,
    pub tiles: usize,
    pub in_tile_stride: usize,
    pub in_block_stride: usize,
    pub out_block_stride: usize,
    pub w_oc_stride: usize,
    pub w_ic_stride: usize,
}

/// Inclusive tile-local window of positions a masked transform may read.
/// `h_start > h_end` (or `w_start > w_end`) is an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileWindow {
    pub h_start: usize,
    pub h_end: usize,
    pub w_start: usize,
    pub w_end: usize,
}

impl TileWindow {
    pub fn full(alpha: usize) -> Self {
        Self {
            h_start: 0,
            h_end: alpha - 1,
            w_start: 0,
            w_end: alpha - 1,
        }
    }

    /// Window that keeps nothing.
    pub fn empty(alpha: usize) -> Self {
        Self {
            h_start: alpha,
            h_end: 0,
            w_start: alpha,
            w_end: 0,
        }
    }

    /// Window of an `alpha x alpha` tile at `(origin_h, origin_w)` that lies
    /// inside an `h x w` plane.
    pub fn clip(alpha: usize, origin_h: isize, origin_w: isize, h: usize, w: usize) -> Self {
        let span = |o: isize, extent: usize| {
            let start = (-o).max(0);
            let end = (extent as isize - 1 - o).min(alpha as isize - 1);
            (start, end)
        };
        let (h_start, h_end) = span(origin_h, h);
        let (w_start, w_end) = span(origin_w, w);
        if h_end < h_start || w_end < w_start {
            return Self::empty(alpha);
        }
        Self {
            h_start: h_start as usize,
            h_end: h_end as usize,
            w_start: w_start as usize,
            w_end: w_end as usize,
        }
    }

    pub fn is_full(&self, alpha: usize) -> bool {
        *self == Self::full(alpha)
    }

    #[inline]
    pub fn contains(&self, h: usize, w: usize) -> bool {
        h >= self.h_start && h <= self.h_end && w >= self.w_start && w <= self.w_end
    }
}

/// One channel block's `[h][w][V]` plane plus a tile origin, which may lie
/// in the padding (negative).
#[derive(Debug, Clone, Copy)]
pub struct TileSource<'a> {
    pub plane: &'a [f32],
    pub width: usize,
    pub origin_h: isize,
    pub origin_w: isize,
}

impl<'a> TileSource<'a> {
    /// Offset of tile-local `(h, w)`; only valid inside the plane.
    #[inline]
    pub fn offset(&self, h: usize, w: usize) -> usize {
        let y = self.origin_h + h as isize;
        let x = self.origin_w + w as isize;
        debug_assert!(y >= 0 && x >= 0);
        (y as usize * self.width + x as usize) * convkit_core::V
    }
}
