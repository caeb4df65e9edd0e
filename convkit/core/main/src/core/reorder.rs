//! Reorders between plain and blocked memory layouts.
//!
//! Blocked layouts pad channels up to a multiple of `V`; padded lanes are
//! written with a caller-chosen fill value on the way in and dropped on the
//! way out. Every routine splits its destination into independent planes and
//! fills them with rayon.

use rayon::prelude::*;

use crate::api::desc::{ActDims, WeightDims};
use crate::api::error::{ConvError, ConvResult};
use crate::api::types::{align_up, ActLayout, WeightLayout, V};
use crate::core::view::TensorView;

fn check_len(what: &'static str, expected: usize, actual: usize) -> ConvResult<()> {
    if expected != actual {
        return Err(ConvError::BufferSize { what, expected, actual });
    }
    Ok(())
}

/// Plain (or already blocked) activations -> nChw16c.
pub fn reorder_act_to_blocked<T>(
    src: &[T],
    layout: ActLayout,
    dims: ActDims,
    dst: &mut [T],
    fill: T,
) -> ConvResult<()>
where
    T: Copy + Send + Sync,
{
    let ActDims { n, h, w, c } = dims;
    let c2 = align_up(c, V) / V;
    check_len("blocked activations", n * c2 * h * w * V, dst.len())?;

    let plain = match TensorView::plain_activation(layout, n, c, h, w) {
        Some(view) => view,
        None => {
            check_len("activations", dst.len(), src.len())?;
            dst.copy_from_slice(src);
            return Ok(());
        }
    };
    check_len("activations", plain.len(), src.len())?;

    dst.par_chunks_mut(h * w * V).enumerate().for_each(|(plane, out)| {
        let (b, cb) = (plane / c2, plane % c2);
        let lanes = (c - cb * V).min(V);
        for y in 0..h {
            for x in 0..w {
                let px = &mut out[(y * w + x) * V..(y * w + x + 1) * V];
                for (v, slot) in px.iter_mut().enumerate() {
                    *slot = if v < lanes {
                        src[plain.offset(&[b, cb * V + v, y, x])]
                    } else {
                        fill
                    };
                }
            }
        }
    });
    Ok(())
}

/// nChw16c -> plain activations, keeping only the logical channels.
pub fn reorder_act_from_blocked<T>(
    src: &[T],
    layout: ActLayout,
    dims: ActDims,
    dst: &mut [T],
) -> ConvResult<()>
where
    T: Copy + Send + Sync,
{
    let ActDims { n, h, w, c } = dims;
    let c2 = align_up(c, V) / V;
    let blocked = TensorView::blocked_activation(n, c2, h, w);
    check_len("blocked activations", blocked.len(), src.len())?;

    match layout {
        ActLayout::Blocked => {
            check_len("activations", src.len(), dst.len())?;
            dst.copy_from_slice(src);
        }
        ActLayout::Nchw => {
            check_len("activations", n * c * h * w, dst.len())?;
            dst.par_chunks_mut(h * w).enumerate().for_each(|(plane, out)| {
                let (b, ch) = (plane / c, plane % c);
                for y in 0..h {
                    for x in 0..w {
                        out[y * w + x] = src[blocked.offset(&[b, ch / V, y, x, ch % V])];
                    }
                }
            });
        }
        ActLayout::Nhwc => {
            check_len("activations", n * c * h * w, dst.len())?;
            dst.par_chunks_mut(w * c).enumerate().for_each(|(row, out)| {
                let (b, y) = (row / h, row % h);
                for x in 0..w {
                    for ch in 0..c {
                        out[x * c + ch] = src[blocked.offset(&[b, ch / V, y, x, ch % V])];
                    }
                }
            });
        }
    }
    Ok(())
}

/// Plain (or already blocked) f32 weights -> OIhw16i16o with zeroed padding lanes.
pub fn reorder_weights_to_blocked(
    src: &[f32],
    layout: WeightLayout,
    dims: WeightDims,
    dst: &mut [f32],
) -> ConvResult<()> {
    let WeightDims { kh, kw, ic, oc } = dims;
    let (ic2, oc2) = (align_up(ic, V) / V, align_up(oc, V) / V);
    let blocked = TensorView::blocked_weights(oc2, ic2, kh, kw);
    check_len("blocked weights", blocked.len(), dst.len())?;

    let plain = match TensorView::plain_weights(layout, oc, ic, kh, kw) {
        Some(view) => view,
        None => {
            check_len("weights", dst.len(), src.len())?;
            dst.copy_from_slice(src);
            return Ok(());
        }
    };
    check_len("weights", plain.len(), src.len())?;

    let block = V * V;
    dst.par_chunks_mut(ic2 * kh * kw * block).enumerate().for_each(|(ob, out)| {
        for ib in 0..ic2 {
            for y in 0..kh {
                for x in 0..kw {
                    let base = ((ib * kh + y) * kw + x) * block;
                    for vi in 0..V {
                        for vo in 0..V {
                            let (o, i) = (ob * V + vo, ib * V + vi);
                            out[base + vi * V + vo] = if o < oc && i < ic {
                                src[plain.offset(&[o, i, y, x])]
                            } else {
                                0.0
                            };
                        }
                    }
                }
            }
        }
    });
    Ok(())
}

/// Copy blocked activations into a spatially padded blocked buffer,
/// writing `fill` into the border. `pads` is `[top, bottom, left, right]`.
pub fn pad_blocked_spatial<T>(
    src: &[T],
    dims: ActDims,
    pads: [usize; 4],
    fill: T,
    dst: &mut [T],
) -> ConvResult<()>
where
    T: Copy + Send + Sync,
{
    let ActDims { n, h, w, c } = dims;
    let c2 = align_up(c, V) / V;
    let [tp, bp, lp, rp] = pads;
    let (ph, pw) = (h + tp + bp, w + lp + rp);
    check_len("blocked activations", n * c2 * h * w * V, src.len())?;
    check_len("padded activations", n * c2 * ph * pw * V, dst.len())?;

    dst.par_chunks_mut(ph * pw * V)
        .zip(src.par_chunks(h * w * V))
        .for_each(|(out, plane)| {
            out.fill(fill);
            for y in 0..h {
                let row = &plane[y * w * V..(y + 1) * w * V];
                let start = ((y + tp) * pw + lp) * V;
                out[start..start + w * V].copy_from_slice(row);
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32).collect()
    }

    #[test]
    fn test_nchw_roundtrip_with_channel_padding() {
        let dims = ActDims { n: 2, h: 3, w: 4, c: 5 };
        let src = ramp(2 * 5 * 3 * 4);
        let mut blocked = vec![0.0f32; 2 * 16 * 3 * 4];
        reorder_act_to_blocked(&src, ActLayout::Nchw, dims, &mut blocked, -1.0).unwrap();

        // channel 2 of sample 1 at (y=1, x=3)
        let view = TensorView::blocked_activation(2, 1, 3, 4);
        assert_eq!(blocked[view.offset(&[1, 0, 1, 3, 2])], src[((1 * 5 + 2) * 3 + 1) * 4 + 3]);
        // padded lane
        assert_eq!(blocked[view.offset(&[0, 0, 0, 0, 7])], -1.0);

        let mut back = vec![0.0f32; src.len()];
        reorder_act_from_blocked(&blocked, ActLayout::Nchw, dims, &mut back).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn test_nhwc_roundtrip() {
        let dims = ActDims { n: 1, h: 2, w: 3, c: 20 };
        let src = ramp(2 * 3 * 20);
        let mut blocked = vec![0.0f32; 2 * 16 * 2 * 3];
        reorder_act_to_blocked(&src, ActLayout::Nhwc, dims, &mut blocked, 0.0).unwrap();

        let view = TensorView::blocked_activation(1, 2, 2, 3);
        // channel 17 -> block 1, lane 1
        assert_eq!(blocked[view.offset(&[0, 1, 1, 2, 1])], src[(1 * 3 + 2) * 20 + 17]);

        let mut back = vec![0.0f32; src.len()];
        reorder_act_from_blocked(&blocked, ActLayout::Nhwc, dims, &mut back).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn test_blocked_passthrough() {
        let dims = ActDims { n: 1, h: 2, w: 2, c: 16 };
        let src = ramp(64);
        let mut dst = vec![0.0f32; 64];
        reorder_act_to_blocked(&src, ActLayout::Blocked, dims, &mut dst, 0.0).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn test_size_mismatch() {
        let dims = ActDims { n: 1, h: 2, w: 2, c: 3 };
        let mut dst = vec![0u8; 64];
        let err = reorder_act_to_blocked(&[0u8; 5], ActLayout::Nchw, dims, &mut dst, 0);
        assert!(matches!(err, Err(ConvError::BufferSize { .. })));
    }

    #[test]
    fn test_hwio_and_oihw_agree() {
        let dims = WeightDims { kh: 3, kw: 3, ic: 3, oc: 18 };
        let oihw = ramp(18 * 3 * 9);
        let mut hwio = vec![0.0f32; oihw.len()];
        for o in 0..18 {
            for i in 0..3 {
                for y in 0..3 {
                    for x in 0..3 {
                        hwio[((y * 3 + x) * 3 + i) * 18 + o] = oihw[((o * 3 + i) * 3 + y) * 3 + x];
                    }
                }
            }
        }
        let len = 2 * 1 * 9 * 256;
        let mut a = vec![0.0f32; len];
        let mut b = vec![0.0f32; len];
        reorder_weights_to_blocked(&oihw, WeightLayout::Oihw, dims, &mut a).unwrap();
        reorder_weights_to_blocked(&hwio, WeightLayout::Hwio, dims, &mut b).unwrap();
        assert_eq!(a, b);

        let view = TensorView::blocked_weights(2, 1, 3, 3);
        // oc 17 -> block 1 lane 1, ic 2, tap (2, 0)
        assert_eq!(a[view.offset(&[1, 0, 2, 0, 2, 1])], oihw[((17 * 3 + 2) * 3 + 2) * 3]);
        // ic lane 5 is padding
        assert_eq!(a[view.offset(&[0, 0, 1, 1, 5, 0])], 0.0);
    }

    #[test]
    fn test_pad_blocked_spatial() {
        let dims = ActDims { n: 1, h: 2, w: 2, c: 16 };
        let src = vec![7u8; 2 * 2 * 16];
        let mut dst = vec![0u8; 4 * 5 * 16];
        pad_blocked_spatial(&src, dims, [1, 1, 2, 1], 3, &mut dst).unwrap();
        let view = TensorView::blocked_activation(1, 1, 4, 5);
        assert_eq!(dst[view.offset(&[0, 0, 0, 0, 0])], 3);
        assert_eq!(dst[view.offset(&[0, 0, 1, 2, 4])], 7);
        assert_eq!(dst[view.offset(&[0, 0, 2, 3, 15])], 7);
        assert_eq!(dst[view.offset(&[0, 0, 2, 4, 0])], 3);
        assert_eq!(dst[view.offset(&[0, 0, 3, 2, 0])], 3);
    }
}
