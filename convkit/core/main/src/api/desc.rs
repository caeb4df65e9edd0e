//! Convolution descriptor
//!
//! `ConvDesc` is plain data: dimensions, strides, padding, layout tags,
//! algorithm, precision, epilogue flags and calibrated quantization
//! parameters. It deserializes from JSON with every field optional.

use serde::{Deserialize, Serialize};

use crate::api::error::{ConvError, ConvResult};
use crate::api::types::*;

/// Activation dimensions, logical order `n, h, w, c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActDims {
    pub n: usize,
    pub h: usize,
    pub w: usize,
    pub c: usize,
}

/// Weight dimensions, logical order `kh, kw, ic, oc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightDims {
    pub kh: usize,
    pub kw: usize,
    pub ic: usize,
    pub oc: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvDims {
    pub input: ActDims,
    pub weights: WeightDims,
    pub output: ActDims,
}

impl Default for ConvDims {
    fn default() -> Self {
        Self {
            input: ActDims { n: 1, h: 8, w: 8, c: 16 },
            weights: WeightDims { kh: 3, kw: 3, ic: 16, oc: 16 },
            output: ActDims { n: 1, h: 8, w: 8, c: 16 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Formats {
    pub input: ActLayout,
    pub weights: WeightLayout,
    pub output: ActLayout,
}

/// Convolution descriptor consumed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvDesc {
    pub dims: ConvDims,
    /// `[h, w]`
    pub strides: [usize; 2],
    /// `[top, bottom, left, right]`
    pub pads: [usize; 4],
    pub formats: Formats,
    pub algorithm: Algorithm,
    pub precision: Precision,
    pub with_bias: bool,
    pub with_relu: bool,
    pub with_residual_sum: bool,
    pub input_quant: QuantParams,
    pub output_quant: QuantParams,
    pub sampling: SamplingKind,
    /// Output element type for `Precision::Int8`. Ignored for f32.
    pub output_dtype: DType,
    pub blocking: BlockingHints,
    pub weights_reuse: WeightsReuse,
}

impl Default for ConvDesc {
    fn default() -> Self {
        Self {
            dims: ConvDims::default(),
            strides: [1, 1],
            pads: [1, 1, 1, 1],
            formats: Formats::default(),
            algorithm: Algorithm::Auto,
            precision: Precision::F32,
            with_bias: false,
            with_relu: false,
            with_residual_sum: false,
            input_quant: QuantParams::default(),
            output_quant: QuantParams::default(),
            sampling: SamplingKind::Calibrated,
            output_dtype: DType::F32,
            blocking: BlockingHints::default(),
            weights_reuse: WeightsReuse::PerCall,
        }
    }
}

/// Validated scalar geometry of one convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    pub n: usize,
    pub ic: usize,
    pub ih: usize,
    pub iw: usize,
    pub oc: usize,
    pub oh: usize,
    pub ow: usize,
    pub kh: usize,
    pub kw: usize,
    pub hs: usize,
    pub ws: usize,
    pub tp: usize,
    pub bp: usize,
    pub lp: usize,
    pub rp: usize,
}

impl ConvShape {
    pub fn is_pointwise(&self) -> bool {
        self.kh == 1 && self.kw == 1 && self.tp + self.bp + self.lp + self.rp == 0
    }
}

/// Element counts of every buffer `execute` consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorSizes {
    pub input: usize,
    pub weights: usize,
    pub output: usize,
    pub bias: usize,
}

fn out_extent(i: usize, p0: usize, p1: usize, k: usize, s: usize) -> Option<usize> {
    let padded = i + p0 + p1;
    if padded < k {
        return None;
    }
    Some((padded - k) / s + 1)
}

impl ConvDesc {
    /// Validate the dimensions and return the scalar geometry.
    pub fn shape(&self) -> ConvResult<ConvShape> {
        let ConvDims { input, weights, output } = self.dims;
        let [hs, ws] = self.strides;
        let [tp, bp, lp, rp] = self.pads;

        let all = [input.n, input.h, input.w, input.c, weights.kh, weights.kw, output.h, output.w];
        if all.contains(&0) || weights.oc == 0 {
            return Err(ConvError::Shape(format!("zero-sized dimension in {:?}", self.dims)));
        }
        if hs == 0 || ws == 0 {
            return Err(ConvError::Shape(format!("strides must be positive, got {:?}", self.strides)));
        }
        if input.n != output.n {
            return Err(ConvError::Shape(format!(
                "batch mismatch: input {} vs output {}",
                input.n, output.n
            )));
        }
        if weights.ic != input.c || weights.oc != output.c {
            return Err(ConvError::Shape(format!(
                "channel mismatch: input c={} output c={} weights ic={} oc={}",
                input.c, output.c, weights.ic, weights.oc
            )));
        }

        let oh = out_extent(input.h, tp, bp, weights.kh, hs);
        let ow = out_extent(input.w, lp, rp, weights.kw, ws);
        if oh != Some(output.h) || ow != Some(output.w) {
            return Err(ConvError::Shape(format!(
                "output {}x{} does not match input {}x{}, kernel {}x{}, strides {:?}, pads {:?}",
                output.h, output.w, input.h, input.w, weights.kh, weights.kw, self.strides, self.pads
            )));
        }

        Ok(ConvShape {
            n: input.n,
            ic: input.c,
            ih: input.h,
            iw: input.w,
            oc: output.c,
            oh: output.h,
            ow: output.w,
            kh: weights.kh,
            kw: weights.kw,
            hs,
            ws,
            tp,
            bp,
            lp,
            rp,
        })
    }

    pub fn input_dtype(&self) -> DType {
        match self.precision {
            Precision::F32 => DType::F32,
            Precision::Int8 => DType::U8,
        }
    }

    pub fn output_elem_dtype(&self) -> DType {
        match self.precision {
            Precision::F32 => DType::F32,
            Precision::Int8 => self.output_dtype,
        }
    }

    /// Element counts in the declared layouts. Blocked layouts count
    /// channels aligned up to `V`.
    pub fn sizes(&self) -> TensorSizes {
        let ConvDims { input, weights, output } = self.dims;
        let act = |d: ActDims, layout: ActLayout| {
            let c = match layout {
                ActLayout::Blocked => align_up(d.c, V),
                ActLayout::Nchw | ActLayout::Nhwc => d.c,
            };
            d.n * d.h * d.w * c
        };
        let (wic, woc) = match self.formats.weights {
            WeightLayout::Blocked => (align_up(weights.ic, V), align_up(weights.oc, V)),
            WeightLayout::Oihw | WeightLayout::Hwio => (weights.ic, weights.oc),
        };
        TensorSizes {
            input: act(input, self.formats.input),
            weights: weights.kh * weights.kw * wic * woc,
            output: act(output, self.formats.output),
            bias: if self.with_bias { weights.oc } else { 0 },
        }
    }

    /// Byte counts in the declared layouts. Weights and bias are always f32.
    pub fn byte_sizes(&self) -> TensorSizes {
        let s = self.sizes();
        TensorSizes {
            input: s.input * self.input_dtype().size_of(),
            weights: s.weights * DType::F32.size_of(),
            output: s.output * self.output_elem_dtype().size_of(),
            bias: s.bias * DType::F32.size_of(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_shape() {
        let shape = ConvDesc::default().shape().unwrap();
        assert_eq!((shape.oh, shape.ow), (8, 8));
        assert_eq!((shape.kh, shape.kw), (3, 3));
        assert!(!shape.is_pointwise());
    }

    #[test]
    fn test_output_mismatch() {
        let mut desc = ConvDesc::default();
        desc.dims.output.h = 7;
        assert!(matches!(desc.shape(), Err(ConvError::Shape(_))));
    }

    #[test]
    fn test_channel_mismatch() {
        let mut desc = ConvDesc::default();
        desc.dims.weights.ic = 32;
        assert!(matches!(desc.shape(), Err(ConvError::Shape(_))));
    }

    #[test]
    fn test_strided_extent() {
        let mut desc = ConvDesc::default();
        desc.dims.input.h = 9;
        desc.dims.input.w = 9;
        desc.strides = [2, 2];
        desc.dims.output.h = 5;
        desc.dims.output.w = 5;
        let shape = desc.shape().unwrap();
        assert_eq!((shape.hs, shape.oh), (2, 5));
    }

    #[test]
    fn test_sizes_blocked_vs_plain() {
        let mut desc = ConvDesc::default();
        desc.dims.input.c = 3;
        desc.dims.weights.ic = 3;
        let blocked = desc.sizes();
        assert_eq!(blocked.input, 8 * 8 * 16);
        assert_eq!(blocked.weights, 9 * 16 * 16);

        desc.formats.input = ActLayout::Nhwc;
        desc.formats.weights = WeightLayout::Hwio;
        let plain = desc.sizes();
        assert_eq!(plain.input, 8 * 8 * 3);
        assert_eq!(plain.weights, 9 * 3 * 16);
    }

    #[test]
    fn test_byte_sizes_int8() {
        let desc = ConvDesc {
            precision: Precision::Int8,
            output_dtype: DType::U8,
            with_bias: true,
            ..ConvDesc::default()
        };
        let bytes = desc.byte_sizes();
        assert_eq!(bytes.input, 8 * 8 * 16);
        assert_eq!(bytes.weights, 9 * 16 * 16 * 4);
        assert_eq!(bytes.output, 8 * 8 * 16);
        assert_eq!(bytes.bias, 16 * 4);
    }

    #[test]
    fn test_deserialize_partial_json() {
        let json = r#"{
            "dims": {
                "input": {"n": 2, "h": 6, "w": 6, "c": 32},
                "weights": {"kh": 1, "kw": 1, "ic": 32, "oc": 16},
                "output": {"n": 2, "h": 6, "w": 6, "c": 16}
            },
            "pads": [0, 0, 0, 0],
            "algorithm": "direct",
            "formats": {"input": "nhwc"},
            "blocking": {"oc4": 1}
        }"#;
        let desc: ConvDesc = serde_json::from_str(json).unwrap();
        assert_eq!(desc.formats.input, ActLayout::Nhwc);
        assert_eq!(desc.formats.output, ActLayout::Blocked);
        assert_eq!(desc.algorithm, Algorithm::Direct);
        assert!(desc.shape().unwrap().is_pointwise());
    }
}
