//! Types shared across the convolution engine

use serde::{Deserialize, Serialize};

/// Channel block width: f32 lanes per blocked channel group.
pub const V: usize = 16;

/// Int8 lanes packed into one 32-bit dot-product step.
pub const VX: usize = 4;

/// Dot-product groups per channel block (`V / VX`).
pub const V1: usize = V / VX;

/// Round `n` up to the next multiple of `to`.
#[inline]
pub const fn align_up(n: usize, to: usize) -> usize {
    n.div_ceil(to) * to
}

/// Element type of a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    #[default]
    F32,
    U8,
    I8,
}

impl DType {
    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::U8 | DType::I8 => 1,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::U8 => write!(f, "u8"),
            DType::I8 => write!(f, "i8"),
        }
    }
}

/// Memory layout of an activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActLayout {
    Nchw,
    Nhwc,
    /// nChw16c: `[N][C/V][H][W][V]`
    #[default]
    Blocked,
}

/// Memory layout of a weight tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightLayout {
    Oihw,
    Hwio,
    /// OIhw16i16o: `[OC/V][IC/V][KH][KW][Vi][Vo]`
    #[default]
    Blocked,
}

/// Requested convolution algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Pick from the shape: Winograd for eligible 3x3, 1x1 GEMM, else direct.
    #[default]
    Auto,
    Direct,
    /// Winograd with a `tile_size x tile_size` transform tile (4 or 5).
    Winograd { tile_size: usize },
}

/// Arithmetic precision of the compute kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    F32,
    /// u8 activations, i8 weights, i32 accumulation.
    Int8,
}

/// How quantization parameters were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingKind {
    /// Scales and zero points supplied by an offline calibration step.
    #[default]
    Calibrated,
    /// Coarse per-call sampling of the activation range.
    Coarse,
    /// Fine-grained per-call sampling of the activation range.
    Fine,
}

/// Scale/zero-point pair: `real = scale * (q - zero_point)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: f32,
}

impl Default for QuantParams {
    fn default() -> Self {
        Self {
            scale: 1.0,
            zero_point: 0.0,
        }
    }
}

/// Whether transformed weights survive across `execute` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightsReuse {
    /// Re-transform the caller's weights on every call.
    #[default]
    PerCall,
    /// Transform once and reuse until `invalidate_weights` is called.
    Repeated,
}

/// Kernel implementation preference for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelPreference {
    /// Best kernel the CPU supports.
    #[default]
    Auto,
    /// Portable scalar kernels only.
    Portable,
}

/// Optional blocking overrides. Zero means "use the default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockingHints {
    /// Tile width T for direct and 1x1 tiling.
    pub tile_width: usize,
    /// Input-channel blocks consumed per Gemm call.
    pub i2: usize,
    /// Output-channel blocks produced per Gemm call.
    pub o2: usize,
    /// Serial input-channel passes.
    pub ic4: usize,
    /// Output-channel groups iterated per tile.
    pub oc4: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, V), 16);
        assert_eq!(align_up(16, V), 16);
        assert_eq!(align_up(17, V), 32);
        assert_eq!(align_up(0, V), 0);
    }

    #[test]
    fn test_lane_groups() {
        assert_eq!(V1 * VX, V);
    }

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F32.size_of(), 4);
        assert_eq!(DType::U8.size_of(), 1);
        assert_eq!(DType::I8.size_of(), 1);
    }
}
