#![allow(dead_code)]

use convkit_engine::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Square-kernel convolution geometry in plain NHWC / HWIO terms.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub n: usize,
    pub h: usize,
    pub w: usize,
    pub ic: usize,
    pub oc: usize,
    pub k: usize,
    pub stride: usize,
    pub pad: usize,
}

impl Geometry {
    pub fn new(n: usize, hw: (usize, usize), ic: usize, oc: usize, k: usize, stride: usize, pad: usize) -> Self {
        Self { n, h: hw.0, w: hw.1, ic, oc, k, stride, pad }
    }

    pub fn out_hw(&self) -> (usize, usize) {
        (
            (self.h + 2 * self.pad - self.k) / self.stride + 1,
            (self.w + 2 * self.pad - self.k) / self.stride + 1,
        )
    }

    pub fn input_len(&self) -> usize {
        self.n * self.h * self.w * self.ic
    }

    pub fn weights_len(&self) -> usize {
        self.k * self.k * self.ic * self.oc
    }

    pub fn output_len(&self) -> usize {
        let (oh, ow) = self.out_hw();
        self.n * oh * ow * self.oc
    }

    /// Descriptor with NHWC activations and HWIO weights.
    pub fn desc(&self, algorithm: Algorithm) -> ConvDesc {
        let (oh, ow) = self.out_hw();
        ConvDesc {
            dims: ConvDims {
                input: ActDims { n: self.n, h: self.h, w: self.w, c: self.ic },
                weights: WeightDims { kh: self.k, kw: self.k, ic: self.ic, oc: self.oc },
                output: ActDims { n: self.n, h: oh, w: ow, c: self.oc },
            },
            strides: [self.stride, self.stride],
            pads: [self.pad; 4],
            formats: Formats {
                input: ActLayout::Nhwc,
                weights: WeightLayout::Hwio,
                output: ActLayout::Nhwc,
            },
            algorithm,
            ..ConvDesc::default()
        }
    }
}

pub fn random(len: usize, seed: u64, lo: f32, hi: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(lo..hi)).collect()
}

pub fn random_u8(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

/// Plain convolution in f64: NHWC input, HWIO weights, NHWC output.
pub fn reference(g: &Geometry, input: &[f32], weights: &[f32], bias: Option<&[f32]>, relu: bool) -> Vec<f32> {
    let (oh, ow) = g.out_hw();
    let mut out = vec![0.0f32; g.output_len()];
    for n in 0..g.n {
        for oy in 0..oh {
            for ox in 0..ow {
                for o in 0..g.oc {
                    let mut acc = bias.map_or(0.0, |b| b[o] as f64);
                    for ky in 0..g.k {
                        for kx in 0..g.k {
                            let iy = (oy * g.stride + ky) as isize - g.pad as isize;
                            let ix = (ox * g.stride + kx) as isize - g.pad as isize;
                            if iy < 0 || ix < 0 || iy >= g.h as isize || ix >= g.w as isize {
                                continue;
                            }
                            let (iy, ix) = (iy as usize, ix as usize);
                            for i in 0..g.ic {
                                let x = input[((n * g.h + iy) * g.w + ix) * g.ic + i] as f64;
                                let w = weights[((ky * g.k + kx) * g.ic + i) * g.oc + o] as f64;
                                acc += x * w;
                            }
                        }
                    }
                    if relu {
                        acc = acc.max(0.0);
                    }
                    out[((n * oh + oy) * ow + ox) * g.oc + o] = acc as f32;
                }
            }
        }
    }
    out
}

/// Sum of `|x|` over the receptive field of output `(n, oy, ox)`.
pub fn window_abs_sum(g: &Geometry, input: &[f32], n: usize, oy: usize, ox: usize) -> f32 {
    let mut sum = 0.0;
    for ky in 0..g.k {
        for kx in 0..g.k {
            let iy = (oy * g.stride + ky) as isize - g.pad as isize;
            let ix = (ox * g.stride + kx) as isize - g.pad as isize;
            if iy < 0 || ix < 0 || iy >= g.h as isize || ix >= g.w as isize {
                continue;
            }
            for i in 0..g.ic {
                sum += input[((n * g.h + iy as usize) * g.w + ix as usize) * g.ic + i].abs();
            }
        }
    }
    sum
}

pub fn assert_close(got: &[f32], want: &[f32], tol: f32, name: &str) {
    assert_eq!(got.len(), want.len(), "{name}: length mismatch");
    for (i, (a, b)) in got.iter().zip(want).enumerate() {
        let denom = b.abs().max(1.0);
        assert!(
            (a - b).abs() / denom <= tol,
            "{name}[{i}]: got={a}, want={b}"
        );
    }
}

pub fn engine(desc: ConvDesc, threads: usize) -> ConvolutionEngine {
    ConvolutionEngine::with_runtime(desc, RuntimeConfig::with_threads(threads)).unwrap()
}

/// Run an f32 descriptor once and return the output.
pub fn run_f32(desc: ConvDesc, threads: usize, input: &[f32], weights: &[f32], bias: Option<&[f32]>) -> Vec<f32> {
    let mut e = engine(desc, threads);
    let mut out = vec![0.0f32; e.desc().sizes().output];
    e.execute_f32(&mut out, input, weights, bias).unwrap();
    out
}
