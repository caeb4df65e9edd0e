//! Blocking plan: channel blocking factors and the spatial tile grid.
//!
//! Channels are split as `C = c4 * c3 * c2_per_call * V`:
//! - `V` lanes per block
//! - `i2`/`o2` blocks per Gemm call (register blocking)
//! - `ic3`/`oc3` Gemm calls per pass (cache blocking)
//! - `ic4` serial passes, `oc4` output groups iterated per tile (thread blocking)
//!
//! The plan is a pure function of its inputs and is immutable once built.

use crate::api::desc::ConvShape;
use crate::api::error::{ConvError, ConvResult};
use crate::api::types::{align_up, BlockingHints, V};
use crate::core::view::TensorView;

/// Default upper bound for the direct-convolution tile width.
const DIRECT_T_MAX: usize = 14;
/// Default upper bound for the 1x1 tile length (flattened pixels).
const FLAT_T_MAX: usize = 16;

/// Spatial tiling scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tiling {
    /// One output row per tile row, `t` output pixels per tile. `t == 0` picks a default.
    Row { t: usize },
    /// Output pixels flattened to one line, `t` pixels per tile. `t == 0` picks a default.
    Flat { t: usize },
    /// Winograd tiles of `alpha x alpha` inputs for a `k x k` kernel.
    Winograd { alpha: usize, k: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingPlan {
    pub shape: ConvShape,
    pub tiling: Tiling,

    /// Input channels aligned up to `V`.
    pub ic_aligned: usize,
    /// Output channels aligned up to `V`.
    pub oc_aligned: usize,
    pub ic2: usize,
    pub oc2: usize,
    /// Valid lanes in the last input-channel block.
    pub ir: usize,
    /// Valid lanes in the last output-channel block.
    pub or: usize,

    pub i2: usize,
    pub ic3: usize,
    pub ic4: usize,
    pub o2: usize,
    pub oc3: usize,
    pub oc4: usize,

    /// Tile edge: pixels per tile for row/flat tiling, `alpha` for Winograd.
    pub t: usize,
    /// Valid output width of the last tile in a row.
    pub tr: usize,
    /// Output pixels per tile edge (`alpha - k + 1` for Winograd, `t` otherwise).
    pub m: usize,
    pub ht: usize,
    pub wt: usize,
}

fn or_default(v: usize, default: usize) -> usize {
    if v == 0 {
        default
    } else {
        v
    }
}

fn remainder(extent: usize, tiles: usize, step: usize) -> usize {
    extent - (tiles - 1) * step
}

impl BlockingPlan {
    pub fn new(shape: &ConvShape, tiling: Tiling, hints: &BlockingHints) -> ConvResult<Self> {
        let ic_aligned = align_up(shape.ic, V);
        let oc_aligned = align_up(shape.oc, V);
        let ic2 = ic_aligned / V;
        let oc2 = oc_aligned / V;
        let ir = shape.ic - (ic2 - 1) * V;
        let or = shape.oc - (oc2 - 1) * V;

        let i2 = or_default(hints.i2, 1);
        let ic4 = or_default(hints.ic4, 1);
        let ic3 = ic2 / (i2 * ic4);
        if ic3 == 0 || ic4 * ic3 * i2 * V != ic_aligned {
            return Err(ConvError::Shape(format!(
                "input channel blocking: ic4={} x i2={} does not divide {} channel blocks",
                ic4, i2, ic2
            )));
        }

        let o2 = or_default(hints.o2, 1);
        let oc4 = or_default(hints.oc4, 1);
        let oc3 = oc2 / (o2 * oc4);
        if oc3 == 0 || oc4 * oc3 * o2 * V != oc_aligned {
            return Err(ConvError::Shape(format!(
                "no output-channel tail support: oc4={} x o2={} does not divide {} channel blocks",
                oc4, o2, oc2
            )));
        }

        let (tiling, t, tr, m, ht, wt) = Self::tile_grid(shape, tiling, hints.tile_width)?;

        Ok(Self {
            shape: *shape,
            tiling,
            ic_aligned,
            oc_aligned,
            ic2,
            oc2,
            ir,
            or,
            i2,
            ic3,
            ic4,
            o2,
            oc3,
            oc4,
            t,
            tr,
            m,
            ht,
            wt,
        })
    }

    fn tile_grid(
        shape: &ConvShape,
        tiling: Tiling,
        hint_t: usize,
    ) -> ConvResult<(Tiling, usize, usize, usize, usize, usize)> {
        match tiling {
            Tiling::Row { t } => {
                let ow = shape.ow;
                let fits = |t: usize| {
                    let wt = ow.div_ceil(t);
                    t <= ow && t > shape.lp && remainder(ow, wt, t) > shape.rp
                };
                let t = match or_default(t, hint_t) {
                    0 => (1..=ow.min(DIRECT_T_MAX)).rev().find(|&t| fits(t)).ok_or_else(|| {
                        ConvError::Shape(format!(
                            "no tile width fits ow={} with left pad {} and right pad {}",
                            ow, shape.lp, shape.rp
                        ))
                    })?,
                    t if !fits(t) => {
                        return Err(ConvError::Shape(format!(
                            "tile width {} invalid for ow={}: need T <= ow, T > lp ({}), remainder > rp ({})",
                            t, ow, shape.lp, shape.rp
                        )))
                    }
                    t => t,
                };
                let wt = ow.div_ceil(t);
                Ok((Tiling::Row { t }, t, remainder(ow, wt, t), t, shape.oh, wt))
            }
            Tiling::Flat { t } => {
                if !shape.is_pointwise() {
                    return Err(ConvError::Shape(format!(
                        "flat tiling needs a 1x1 kernel without padding, got {}x{} pads {:?}",
                        shape.kh,
                        shape.kw,
                        [shape.tp, shape.bp, shape.lp, shape.rp]
                    )));
                }
                let pixels = shape.oh * shape.ow;
                let t = match or_default(t, hint_t) {
                    0 => pixels.min(FLAT_T_MAX),
                    t if t > pixels => {
                        return Err(ConvError::Shape(format!(
                            "tile length {} exceeds {} output pixels",
                            t, pixels
                        )))
                    }
                    t => t,
                };
                let wt = pixels.div_ceil(t);
                Ok((Tiling::Flat { t }, t, remainder(pixels, wt, t), t, 1, wt))
            }
            Tiling::Winograd { alpha, k } => {
                if alpha <= k || shape.kh != k || shape.kw != k {
                    return Err(ConvError::Shape(format!(
                        "winograd tile {} needs a {}x{} kernel, got {}x{}",
                        alpha, k, k, shape.kh, shape.kw
                    )));
                }
                if shape.hs != 1 || shape.ws != 1 {
                    return Err(ConvError::Shape(format!(
                        "winograd needs unit strides, got {}x{}",
                        shape.hs, shape.ws
                    )));
                }
                if [shape.tp, shape.bp, shape.lp, shape.rp].iter().any(|&p| p >= k) {
                    return Err(ConvError::Shape(format!(
                        "winograd padding must be below kernel size {}",
                        k
                    )));
                }
                if alpha > shape.ih + shape.tp + shape.bp || alpha > shape.iw + shape.lp + shape.rp {
                    return Err(ConvError::Shape(format!(
                        "winograd tile {} exceeds padded input {}x{}",
                        alpha,
                        shape.ih + shape.tp + shape.bp,
                        shape.iw + shape.lp + shape.rp
                    )));
                }
                let m = alpha - k + 1;
                let ht = shape.oh.div_ceil(m);
                let wt = shape.ow.div_ceil(m);
                Ok((tiling, alpha, remainder(shape.ow, wt, m), m, ht, wt))
            }
        }
    }

    /// Tiles in one sample's spatial grid.
    pub fn tiles_per_sample(&self) -> usize {
        self.ht * self.wt
    }

    /// Size of the flattened `(sample, tile-row, tile-col)` space.
    pub fn total_tiles(&self) -> usize {
        self.shape.n * self.tiles_per_sample()
    }

    /// Input-channel blocks consumed by one serial pass.
    pub fn ic_blocks_per_pass(&self) -> usize {
        self.ic3 * self.i2
    }

    /// Output-channel blocks owned by one `oc4` group.
    pub fn oc_blocks_per_group(&self) -> usize {
        self.oc3 * self.o2
    }

    /// Transformed-input elements per input-channel block of one tile.
    /// Zero for tiling schemes that read the input in place.
    pub fn tile_input_len(&self) -> usize {
        match self.tiling {
            Tiling::Row { .. } => 0,
            Tiling::Flat { t } => t * V,
            Tiling::Winograd { alpha, .. } => alpha * alpha * V,
        }
    }

    /// Accumulator elements per output-channel block of one tile.
    pub fn tile_output_len(&self) -> usize {
        match self.tiling {
            Tiling::Row { t } | Tiling::Flat { t } => t * V,
            Tiling::Winograd { alpha, .. } => alpha * alpha * V,
        }
    }

    // ==================== Buffer views ====================

    /// Blocked input `[N, IC/V, IH, IW, V]`.
    pub fn input_view(&self) -> TensorView {
        let s = &self.shape;
        TensorView::blocked_activation(s.n, self.ic2, s.ih, s.iw)
    }

    /// Blocked input with the padding stored on every side.
    pub fn padded_input_view(&self) -> TensorView {
        let s = &self.shape;
        TensorView::blocked_activation(s.n, self.ic2, s.ih + s.tp + s.bp, s.iw + s.lp + s.rp)
    }

    /// Blocked output `[N, OC/V, OH, OW, V]`.
    pub fn output_view(&self) -> TensorView {
        let s = &self.shape;
        TensorView::blocked_activation(s.n, self.oc2, s.oh, s.ow)
    }

    /// Prepared weights `[OC/V, IC/V, KH, KW, Vi, Vo]`. Winograd plans keep
    /// the `alpha x alpha` transformed tile where the kernel window would be.
    pub fn weights_view(&self) -> TensorView {
        match self.tiling {
            Tiling::Winograd { alpha, .. } => TensorView::blocked_weights(self.oc2, self.ic2, alpha, alpha),
            _ => TensorView::blocked_weights(self.oc2, self.ic2, self.shape.kh, self.shape.kw),
        }
    }
}
