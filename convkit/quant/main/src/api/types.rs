use convkit_core::V;

/// Largest quantized weight magnitude; weights map `[-absmax, absmax]` onto `[-127, 127]`.
pub const WEIGHT_QT_RANGE: f32 = 127.0;

/// Bytes in one quantized `V x V` weight block.
pub const INT8_BLOCK_BYTES: usize = V * V;

/// Block geometry of blocked weights: `[oc2][ic2][kh][kw][V][V]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightBlocks {
    pub oc2: usize,
    pub ic2: usize,
    pub kh: usize,
    pub kw: usize,
}

impl WeightBlocks {
    /// Elements per output-channel block.
    pub fn per_oc_block(&self) -> usize {
        self.ic2 * self.kh * self.kw * V * V
    }

    pub fn len(&self) -> usize {
        self.oc2 * self.per_oc_block()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn oc_aligned(&self) -> usize {
        self.oc2 * V
    }
}

/// Int8 weights with their per-output-channel bookkeeping.
///
/// `data` is laid out `[oc2][ic2][kh][kw][V/VX][Vo][VX]` so one output lane
/// reads VX consecutive input-channel weights per dot-product step.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedWeights {
    pub blocks: WeightBlocks,
    pub data: Vec<i8>,
    /// `absmax / 127` per aligned output channel.
    pub scale: Vec<f32>,
    /// Sum of quantized weights per aligned output channel.
    pub factor: Vec<i32>,
}
