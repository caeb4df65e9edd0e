use convkit_core::{V, VX};
use rayon::prelude::*;
use std::time::Instant;

use crate::api::error::{QuantError, QuantResult};
use crate::api::types::*;

/// Offset of weight `(vi, vo)` inside one quantized `V x V` block.
#[inline]
fn int8_lane(vi: usize, vo: usize) -> usize {
    ((vi / VX) * V + vo) * VX + vi % VX
}

/// Quantize blocked f32 weights `[oc2][ic2][kh][kw][Vi][Vo]` to int8.
///
/// Runs as four rayon passes, each a full barrier for the next:
/// 1. per-output-channel absmax over `(ic, kh, kw)`
/// 2. `q = round_ties_even(w * 127 / absmax)`
/// 3. per-output-channel row-sum of `q` (the zero-point `factor`)
/// 4. `scale = absmax / 127`
///
/// A channel with absmax 0 quantizes to all zeros with scale 0.
pub fn quantize_weights(src: &[f32], blocks: WeightBlocks) -> QuantResult<QuantizedWeights> {
    if src.len() != blocks.len() {
        return Err(QuantError::ShapeMismatch {
            expected: vec![blocks.oc2, blocks.ic2, blocks.kh, blocks.kw, V, V],
            actual: vec![src.len()],
        });
    }
    let _t = if log::log_enabled!(log::Level::Trace) { Some(Instant::now()) } else { None };

    let taps = blocks.kh * blocks.kw;
    let per_ob = blocks.per_oc_block();
    let block = INT8_BLOCK_BYTES;

    let absmax: Vec<f32> = (0..blocks.oc_aligned())
        .into_par_iter()
        .map(|o| {
            let (ob, vo) = (o / V, o % V);
            let oc_block = &src[ob * per_ob..(ob + 1) * per_ob];
            oc_block
                .chunks_exact(block)
                .flat_map(|b| (0..V).map(move |vi| b[vi * V + vo]))
                .fold(0.0f32, |m, w| m.max(w.abs()))
        })
        .collect();

    let mut data = vec![0i8; src.len()];
    data.par_chunks_mut(per_ob).enumerate().for_each(|(ob, out)| {
        let oc_block = &src[ob * per_ob..(ob + 1) * per_ob];
        let qs: Vec<f32> = (0..V)
            .map(|vo| {
                let m = absmax[ob * V + vo];
                if m == 0.0 { 0.0 } else { WEIGHT_QT_RANGE / m }
            })
            .collect();
        for (qb, wb) in out.chunks_exact_mut(block).zip(oc_block.chunks_exact(block)) {
            for vi in 0..V {
                for vo in 0..V {
                    let q = (wb[vi * V + vo] * qs[vo]).round_ties_even();
                    qb[int8_lane(vi, vo)] = q.clamp(-WEIGHT_QT_RANGE, WEIGHT_QT_RANGE) as i8;
                }
            }
        }
    });

    let factor: Vec<i32> = (0..blocks.oc_aligned())
        .into_par_iter()
        .map(|o| {
            let (ob, vo) = (o / V, o % V);
            let oc_block = &data[ob * per_ob..(ob + 1) * per_ob];
            oc_block
                .chunks_exact(block)
                .map(|b| (0..V).map(|vi| b[int8_lane(vi, vo)] as i32).sum::<i32>())
                .sum()
        })
        .collect();

    let scale: Vec<f32> = absmax.par_iter().map(|&m| m / WEIGHT_QT_RANGE).collect();

    if let Some(t) = _t {
        log::trace!(
            "[perf] quant::quantize_weights [{}x{}x{}x{}] taps={} {:.3}ms",
            blocks.oc2 * V,
            blocks.ic2 * V,
            blocks.kh,
            blocks.kw,
            taps,
            t.elapsed().as_secs_f64() * 1000.0
        );
    }

    Ok(QuantizedWeights { blocks, data, scale, factor })
}

/// Real value of quantized weight `(o, i, y, x)` (aligned channel indices).
pub fn dequantize_weight(qw: &QuantizedWeights, o: usize, i: usize, y: usize, x: usize) -> f32 {
    let b = qw.blocks;
    let base = (((o / V) * b.ic2 + i / V) * b.kh + y) * b.kw + x;
    qw.data[base * INT8_BLOCK_BYTES + int8_lane(i % V, o % V)] as f32 * qw.scale[o]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn blocked_index(b: &WeightBlocks, o: usize, i: usize, y: usize, x: usize) -> usize {
        ((((o / V) * b.ic2 + i / V) * b.kh + y) * b.kw + x) * V * V + (i % V) * V + o % V
    }

    #[test]
    fn test_shape_mismatch() {
        let blocks = WeightBlocks { oc2: 1, ic2: 1, kh: 1, kw: 1 };
        assert!(matches!(quantize_weights(&[0.0; 10], blocks), Err(QuantError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_scale_is_absmax_over_127() {
        let blocks = WeightBlocks { oc2: 1, ic2: 2, kh: 3, kw: 3 };
        let mut w = vec![0.0f32; blocks.len()];
        w[blocked_index(&blocks, 5, 20, 1, 2)] = -2.54;
        w[blocked_index(&blocks, 5, 3, 0, 0)] = 1.0;
        let qw = quantize_weights(&w, blocks).unwrap();

        assert!((qw.scale[5] - 0.02).abs() < 1e-6);
        let base = ((20 / V) * 3 + 1) * 3 + 2;
        assert_eq!(qw.data[base * INT8_BLOCK_BYTES + int8_lane(20 % V, 5)], -127);
        // 1.0 / 0.02 = 50
        assert!((dequantize_weight(&qw, 5, 3, 0, 0) - 1.0).abs() < 1e-6);
        assert_eq!(qw.factor[5], -127 + 50);
    }

    #[test]
    fn test_zero_channel() {
        let blocks = WeightBlocks { oc2: 1, ic2: 1, kh: 1, kw: 1 };
        let mut w = vec![0.0f32; blocks.len()];
        w[blocked_index(&blocks, 0, 0, 0, 0)] = 3.0;
        let qw = quantize_weights(&w, blocks).unwrap();
        assert_eq!(qw.scale[1], 0.0);
        assert_eq!(qw.factor[1], 0);
        assert_eq!(qw.factor[0], 127);
    }

    #[test]
    fn test_roundtrip_error_bound() {
        let blocks = WeightBlocks { oc2: 2, ic2: 2, kh: 3, kw: 3 };
        let mut rng = StdRng::seed_from_u64(7);
        let w: Vec<f32> = (0..blocks.len()).map(|_| rng.gen_range(-0.8f32..0.8)).collect();
        let qw = quantize_weights(&w, blocks).unwrap();

        for o in 0..32 {
            for i in 0..32 {
                for y in 0..3 {
                    for x in 0..3 {
                        let real = w[blocked_index(&blocks, o, i, y, x)];
                        let back = dequantize_weight(&qw, o, i, y, x);
                        assert!(
                            (real - back).abs() <= 0.5 * qw.scale[o] + 1e-6,
                            "o={} i={} real={} back={}",
                            o, i, real, back
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_factor_is_row_sum() {
        let blocks = WeightBlocks { oc2: 1, ic2: 1, kh: 2, kw: 1 };
        let mut rng = StdRng::seed_from_u64(11);
        let w: Vec<f32> = (0..blocks.len()).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let qw = quantize_weights(&w, blocks).unwrap();
        for o in 0..V {
            let mut sum = 0i32;
            for i in 0..V {
                for y in 0..2 {
                    let base = y * INT8_BLOCK_BYTES;
                    sum += qw.data[base + int8_lane(i, o)] as i32;
                }
            }
            assert_eq!(sum, qw.factor[o]);
        }
    }
}
