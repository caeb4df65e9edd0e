//! Tile scheduler.
//!
//! Input-channel passes (`ic4`) run one after another, each as one parallel
//! region over the per-worker scratch slots. Inside a region a worker walks
//! the tiles it statically owns and, for each, every output-channel block of
//! the current group: transform (or gather) the input, run the Gemm, write
//! the tile out. Partial sums of early passes go straight into the output;
//! the epilogue (bias, ReLU, requantization) runs only on the last pass.

use std::time::Instant;

use convkit_core::{Algorithm, BlockingPlan, ConvDesc, ConvError, ConvShape, Precision, QuantParams, TensorView, V};
use convkit_quant::{dequantize_accumulator, QuantizedWeights, Requantizer};
use rayon::prelude::*;

use crate::api::error::{EngineError, EngineResult};
use crate::api::traits::{GemmKernel, QuantOutput, TransformKernel};
use crate::api::types::{GemmDims, Strategy, TileSource, TileWindow};
use crate::core::scratch::{SharedMut, TileCoord, WorkerScratch};

/// Tile edge used by `Algorithm::Auto` when Winograd applies.
const AUTO_WINOGRAD_ALPHA: usize = 5;

fn winograd_eligible(s: &ConvShape, alpha: usize) -> bool {
    s.kh == 3
        && s.kw == 3
        && s.hs == 1
        && s.ws == 1
        && [s.tp, s.bp, s.lp, s.rp].iter().all(|&p| p < 3)
        && s.ih + s.tp + s.bp >= alpha
        && s.iw + s.lp + s.rp >= alpha
}

/// Pick the execution strategy for a validated descriptor.
pub fn select_strategy(desc: &ConvDesc, shape: &ConvShape) -> EngineResult<Strategy> {
    match (desc.precision, desc.algorithm) {
        (Precision::Int8, Algorithm::Winograd { .. }) => Err(EngineError::KernelUnsupported(
            "winograd is only implemented for f32".into(),
        )),
        (Precision::Int8, _) => Ok(Strategy::Int8Direct),
        (Precision::F32, Algorithm::Winograd { tile_size }) => match tile_size {
            4 | 5 => Ok(Strategy::Winograd { alpha: tile_size }),
            other => Err(ConvError::UnsupportedConfig(format!(
                "winograd tile size {} (supported: 4, 5)",
                other
            ))
            .into()),
        },
        (Precision::F32, Algorithm::Auto) if winograd_eligible(shape, AUTO_WINOGRAD_ALPHA) => {
            Ok(Strategy::Winograd { alpha: AUTO_WINOGRAD_ALPHA })
        }
        (Precision::F32, _) if shape.is_pointwise() => Ok(Strategy::Pointwise),
        (Precision::F32, _) => Ok(Strategy::Direct),
    }
}

/// Fused write-out options.
#[derive(Debug, Clone, Copy)]
pub struct Epilogue<'a> {
    /// Per aligned output channel.
    pub bias: Option<&'a [f32]>,
    pub relu: bool,
    /// Add to what the output already holds.
    pub residual: bool,
}

/// Quantization parameters of the int8 path.
#[derive(Debug, Clone, Copy)]
pub struct Int8Params {
    pub input: QuantParams,
    pub requant: Requantizer,
}

#[derive(Debug, Clone, Copy)]
struct Pass {
    index: usize,
    last: bool,
}

/// One contiguous run of valid output pixels for a kernel tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tap {
    ky: usize,
    kx: usize,
    iy: usize,
    /// Input column of the first pixel.
    ix: usize,
    /// First pixel relative to the segment start.
    out: usize,
    count: usize,
}

/// Taps of output row `oy`, pixels `[ox0, ox0 + len)`, clipped to the
/// pixels whose input position lies inside the unpadded input.
fn for_each_tap(s: &ConvShape, oy: usize, ox0: usize, len: usize, mut f: impl FnMut(Tap)) {
    let ws = s.ws as isize;
    let end = (ox0 + len) as isize;
    for ky in 0..s.kh {
        let iy = (oy * s.hs + ky) as isize - s.tp as isize;
        if iy < 0 || iy >= s.ih as isize {
            continue;
        }
        for kx in 0..s.kw {
            // ix = ox * ws + shift
            let shift = kx as isize - s.lp as isize;
            let last = s.iw as isize - 1 - shift;
            if last < 0 {
                continue;
            }
            let first = if shift >= 0 { 0 } else { (-shift + ws - 1) / ws };
            let lo = first.max(ox0 as isize);
            let hi = (last / ws + 1).min(end);
            if lo >= hi {
                continue;
            }
            f(Tap {
                ky,
                kx,
                iy: iy as usize,
                ix: (lo * ws + shift) as usize,
                out: (lo - ox0 as isize) as usize,
                count: (hi - lo) as usize,
            });
        }
    }
}

/// Same geometry over an input already padded on every side.
fn prepadded(s: &ConvShape) -> ConvShape {
    ConvShape {
        ih: s.ih + s.tp + s.bp,
        iw: s.iw + s.lp + s.rp,
        tp: 0,
        bp: 0,
        lp: 0,
        rp: 0,
        ..*s
    }
}

/// Valid pixels of tile column `wt` for row and flat tilings.
fn tile_len(plan: &BlockingPlan, wt: usize) -> usize {
    if wt + 1 == plan.wt {
        plan.tr
    } else {
        plan.t
    }
}

/// Address maps of the blocked buffers a run reads and writes.
#[derive(Debug, Clone)]
struct BufferViews {
    /// Zero-point padded for the int8 path.
    input: TensorView,
    output: TensorView,
    weights: TensorView,
}

/// Everything fixed for the lifetime of an engine that a run reads.
pub struct Scheduler<'a> {
    pub plan: &'a BlockingPlan,
    pub strategy: Strategy,
    pub gemm: &'a dyn GemmKernel,
    pub transform: Option<&'a dyn TransformKernel>,
    pub epilogue: Epilogue<'a>,
    views: BufferViews,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        plan: &'a BlockingPlan,
        strategy: Strategy,
        gemm: &'a dyn GemmKernel,
        transform: Option<&'a dyn TransformKernel>,
        epilogue: Epilogue<'a>,
    ) -> Self {
        let input = match strategy {
            Strategy::Int8Direct => plan.padded_input_view(),
            _ => plan.input_view(),
        };
        let views = BufferViews { input, output: plan.output_view(), weights: plan.weights_view() };
        Self { plan, strategy, gemm, transform, epilogue, views }
    }

    fn check(&self, what: &'static str, expected: usize, actual: usize) -> EngineResult<()> {
        if expected != actual {
            return Err(ConvError::BufferSize { what, expected, actual }.into());
        }
        Ok(())
    }

    /// f32 convolution over blocked `input` into blocked `out`.
    pub fn run_f32(
        &self,
        pool: &rayon::ThreadPool,
        scratch: &mut [WorkerScratch],
        out: &mut [f32],
        input: &[f32],
        weights: &[f32],
    ) -> EngineResult<()> {
        let p = self.plan;
        let transform = match self.strategy {
            Strategy::Int8Direct => {
                return Err(EngineError::KernelUnsupported("int8 strategy on the f32 path".into()))
            }
            Strategy::Winograd { .. } => Some(self.transform.ok_or_else(|| {
                EngineError::KernelUnsupported("winograd strategy without a transform kernel".into())
            })?),
            Strategy::Direct | Strategy::Pointwise => None,
        };
        self.check("blocked output", self.views.output.len(), out.len())?;
        self.check("blocked input", self.views.input.len(), input.len())?;

        let _t = if log::log_enabled!(log::Level::Trace) { Some(Instant::now()) } else { None };
        let workers = scratch.len();
        let out = SharedMut::new(out);
        pool.install(|| {
            for index in 0..p.ic4 {
                let pass = Pass { index, last: index + 1 == p.ic4 };
                scratch.par_iter_mut().enumerate().for_each(|(worker, ws)| {
                    ws.cache.reset();
                    ws.for_owned_tiles(p, worker, workers, |ws, tile| match (self.strategy, transform) {
                        (Strategy::Winograd { .. }, Some(t)) => {
                            self.winograd_tile(ws, tile, pass, &out, input, weights, t)
                        }
                        (Strategy::Pointwise, _) => self.pointwise_tile(ws, tile, pass, &out, input, weights),
                        _ => self.direct_tile(ws, tile, pass, &out, input, weights),
                    });
                });
            }
        });

        if let Some(t) = _t {
            log::trace!(
                "[perf] engine::run_f32 {} tiles={} passes={} workers={} {:.3}ms",
                self.strategy,
                p.total_tiles(),
                p.ic4,
                workers,
                t.elapsed().as_secs_f64() * 1000.0
            );
        }
        Ok(())
    }

    /// u8 x i8 convolution over a zero-point padded blocked `input`.
    ///
    /// `acc` holds i32 partial sums between passes and may be empty when
    /// there is a single pass.
    #[allow(clippy::too_many_arguments)]
    pub fn run_int8<O: QuantOutput>(
        &self,
        pool: &rayon::ThreadPool,
        scratch: &mut [WorkerScratch],
        out: &mut [O],
        acc: &mut [i32],
        input: &[u8],
        weights: &QuantizedWeights,
        params: Int8Params,
    ) -> EngineResult<()> {
        let p = self.plan;
        let s = &p.shape;
        let padded = prepadded(s);
        if self.strategy != Strategy::Int8Direct {
            return Err(EngineError::KernelUnsupported(format!("{} strategy on the int8 path", self.strategy)));
        }
        self.check("blocked output", self.views.output.len(), out.len())?;
        self.check("padded input", self.views.input.len(), input.len())?;
        if p.ic4 > 1 {
            self.check("int8 accumulator", out.len(), acc.len())?;
        }

        let _t = if log::log_enabled!(log::Level::Trace) { Some(Instant::now()) } else { None };
        let workers = scratch.len();
        let out = SharedMut::new(out);
        let acc = SharedMut::new(acc);
        pool.install(|| {
            for index in 0..p.ic4 {
                let pass = Pass { index, last: index + 1 == p.ic4 };
                scratch.par_iter_mut().enumerate().for_each(|(worker, ws)| {
                    ws.for_owned_tiles(p, worker, workers, |ws, tile| {
                        self.int8_tile(ws, tile, pass, &padded, &out, &acc, input, weights, params)
                    });
                });
            }
        });

        if let Some(t) = _t {
            log::trace!(
                "[perf] engine::run_int8 -> {} tiles={} passes={} workers={} {:.3}ms",
                O::DTYPE,
                p.total_tiles(),
                p.ic4,
                workers,
                t.elapsed().as_secs_f64() * 1000.0
            );
        }
        Ok(())
    }

    /// Write one block's worth of tile output, applying the epilogue on the
    /// last pass. `dst` and `src` cover the same pixels.
    fn store_f32(&self, dst: &mut [f32], src: &[f32], ob: usize, pass: Pass) {
        if pass.index == 0 && !self.epilogue.residual {
            dst.copy_from_slice(src);
        } else {
            for (d, &x) in dst.iter_mut().zip(src) {
                *d += x;
            }
        }
        if !pass.last {
            return;
        }
        if let Some(bias) = self.epilogue.bias {
            let b = &bias[ob * V..(ob + 1) * V];
            for px in dst.chunks_exact_mut(V) {
                for (d, &x) in px.iter_mut().zip(b) {
                    *d += x;
                }
            }
        }
        if self.epilogue.relu {
            for d in dst.iter_mut() {
                *d = d.max(0.0);
            }
        }
    }

    /// Output offset of pixel `(y, x)` in block `ob` of `sample`.
    #[inline]
    fn out_offset(&self, sample: usize, ob: usize, y: usize, x: usize) -> usize {
        self.views.output.offset(&[sample, ob, y, x, 0])
    }

    fn direct_tile(
        &self,
        ws: &mut WorkerScratch,
        c: TileCoord,
        pass: Pass,
        out: &SharedMut<'_, f32>,
        input: &[f32],
        weights: &[f32],
    ) {
        let p = self.plan;
        let s = &p.shape;
        let (oy, ox0, len) = (c.ht, c.wt * p.t, tile_len(p, c.wt));
        let obpg = p.oc_blocks_per_group();
        let ibpp = p.ic_blocks_per_pass();

        let tout = &mut ws.tout[..obpg * p.t * V];
        tout.fill(0.0);
        let (iv, wv) = (&self.views.input, &self.views.weights);
        for o3 in 0..p.oc3 {
            let ob0 = c.group * obpg + o3 * p.o2;
            let acc = &mut tout[o3 * p.o2 * p.t * V..];
            for i3 in 0..p.ic3 {
                let ib0 = pass.index * ibpp + i3 * p.i2;
                for_each_tap(s, oy, ox0, len, |tap| {
                    let x = &input[iv.offset(&[c.sample, ib0, tap.iy, tap.ix, 0])..];
                    let w = &weights[wv.offset(&[ob0, ib0, tap.ky, tap.kx, 0, 0])..];
                    let dims = GemmDims {
                        oc_blocks: p.o2,
                        ic_blocks: p.i2,
                        tiles: tap.count,
                        in_tile_stride: s.ws * iv.strides()[3],
                        in_block_stride: iv.strides()[1],
                        out_block_stride: p.t * V,
                        w_oc_stride: wv.strides()[0],
                        w_ic_stride: wv.strides()[1],
                    };
                    self.gemm.gemm_f32(&mut acc[tap.out * V..], x, w, &dims, true);
                });
            }
        }

        for ob_local in 0..obpg {
            let ob = c.group * obpg + ob_local;
            // Safety: tiles are owned by exactly one worker and cover
            // disjoint output pixels.
            let dst = unsafe { out.slice_mut(self.out_offset(c.sample, ob, oy, ox0), len * V) };
            self.store_f32(dst, &tout[ob_local * p.t * V..][..len * V], ob, pass);
        }
    }

    fn pointwise_tile(
        &self,
        ws: &mut WorkerScratch,
        c: TileCoord,
        pass: Pass,
        out: &SharedMut<'_, f32>,
        input: &[f32],
        weights: &[f32],
    ) {
        let p = self.plan;
        let s = &p.shape;
        let (p0, len) = (c.wt * p.t, tile_len(p, c.wt));
        let obpg = p.oc_blocks_per_group();
        let ibpp = p.ic_blocks_per_pass();
        let iv = &self.views.input;

        let gather = |buf: &mut [f32]| {
            for ib_local in 0..ibpp {
                let ib = pass.index * ibpp + ib_local;
                let dst = &mut buf[ib_local * p.t * V..][..len * V];
                if s.hs == 1 && s.ws == 1 {
                    // unpadded stride 1: input pixels line up with output pixels
                    let at = iv.offset(&[c.sample, ib, p0 / s.iw, p0 % s.iw, 0]);
                    dst.copy_from_slice(&input[at..at + len * V]);
                } else {
                    for (q, px) in dst.chunks_exact_mut(V).enumerate() {
                        let (oy, ox) = ((p0 + q) / s.ow, (p0 + q) % s.ow);
                        let at = iv.offset(&[c.sample, ib, oy * s.hs, ox * s.ws, 0]);
                        px.copy_from_slice(&input[at..at + V]);
                    }
                }
            }
        };
        let WorkerScratch { tin, tout, cache, .. } = ws;
        let x: &[f32] = if cache.is_enabled() {
            cache.get_or_compute(c.slot, gather)
        } else {
            gather(&mut tin[..]);
            &tin[..]
        };

        let wv = &self.views.weights;
        for o3 in 0..p.oc3 {
            let ob0 = c.group * obpg + o3 * p.o2;
            for i3 in 0..p.ic3 {
                let ib0 = pass.index * ibpp + i3 * p.i2;
                let dims = GemmDims {
                    oc_blocks: p.o2,
                    ic_blocks: p.i2,
                    tiles: len,
                    in_tile_stride: V,
                    in_block_stride: p.t * V,
                    out_block_stride: p.t * V,
                    w_oc_stride: wv.strides()[0],
                    w_ic_stride: wv.strides()[1],
                };
                self.gemm.gemm_f32(
                    &mut tout[o3 * p.o2 * p.t * V..],
                    &x[i3 * p.i2 * p.t * V..],
                    &weights[wv.offset(&[ob0, ib0, 0, 0, 0, 0])..],
                    &dims,
                    i3 > 0,
                );
            }
        }

        for ob_local in 0..obpg {
            let ob = c.group * obpg + ob_local;
            let at = self.out_offset(c.sample, ob, p0 / s.ow, p0 % s.ow);
            // Safety: flat tiles of one sample never overlap.
            let dst = unsafe { out.slice_mut(at, len * V) };
            self.store_f32(dst, &tout[ob_local * p.t * V..][..len * V], ob, pass);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn winograd_tile(
        &self,
        ws: &mut WorkerScratch,
        c: TileCoord,
        pass: Pass,
        out: &SharedMut<'_, f32>,
        input: &[f32],
        weights: &[f32],
        transform: &dyn TransformKernel,
    ) {
        let p = self.plan;
        let s = &p.shape;
        let (a, m) = (p.t, p.m);
        let aa = a * a;
        let obpg = p.oc_blocks_per_group();
        let ibpp = p.ic_blocks_per_pass();
        let (iv, wv) = (&self.views.input, &self.views.weights);
        let plane_len = iv.strides()[1];

        let (oy0, ox0) = (c.ht * m, c.wt * m);
        let (rh, rw) = (m.min(s.oh - oy0), m.min(s.ow - ox0));
        let origin_h = oy0 as isize - s.tp as isize;
        let origin_w = ox0 as isize - s.lp as isize;
        let window = TileWindow::clip(a, origin_h, origin_w, s.ih, s.iw);
        let full = window.is_full(a);

        let forward = |buf: &mut [f32]| {
            for ib_local in 0..ibpp {
                let ib = pass.index * ibpp + ib_local;
                let src = TileSource {
                    plane: &input[iv.offset(&[c.sample, ib, 0, 0, 0])..][..plane_len],
                    width: s.iw,
                    origin_h,
                    origin_w,
                };
                let dst = &mut buf[ib_local * aa * V..][..aa * V];
                if full {
                    transform.forward_input(dst, &src);
                } else {
                    transform.forward_input_masked(dst, &src, window);
                }
            }
        };
        let WorkerScratch { tin, tout, ybuf, cache, .. } = ws;
        let x: &[f32] = if cache.is_enabled() {
            cache.get_or_compute(c.slot, forward)
        } else {
            forward(&mut tin[..]);
            &tin[..]
        };

        for o3 in 0..p.oc3 {
            let ob0 = c.group * obpg + o3 * p.o2;
            for i3 in 0..p.ic3 {
                let ib0 = pass.index * ibpp + i3 * p.i2;
                for pt in 0..aa {
                    let dims = GemmDims {
                        oc_blocks: p.o2,
                        ic_blocks: p.i2,
                        tiles: 1,
                        in_tile_stride: V,
                        in_block_stride: aa * V,
                        out_block_stride: aa * V,
                        w_oc_stride: wv.strides()[0],
                        w_ic_stride: wv.strides()[1],
                    };
                    self.gemm.gemm_f32(
                        &mut tout[(o3 * p.o2 * aa + pt) * V..],
                        &x[(i3 * p.i2 * aa + pt) * V..],
                        &weights[wv.offset(&[ob0, ib0, pt / a, pt % a, 0, 0])..],
                        &dims,
                        i3 > 0,
                    );
                }
            }
        }

        let y = &mut ybuf[..m * m * V];
        for ob_local in 0..obpg {
            let ob = c.group * obpg + ob_local;
            transform.inverse_output(y, &tout[ob_local * aa * V..][..aa * V]);
            for r in 0..rh {
                // Safety: Winograd tiles cover disjoint output squares.
                let dst = unsafe { out.slice_mut(self.out_offset(c.sample, ob, oy0 + r, ox0), rw * V) };
                self.store_f32(dst, &y[r * m * V..][..rw * V], ob, pass);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn int8_tile<O: QuantOutput>(
        &self,
        ws: &mut WorkerScratch,
        c: TileCoord,
        pass: Pass,
        padded: &ConvShape,
        out: &SharedMut<'_, O>,
        acc: &SharedMut<'_, i32>,
        input: &[u8],
        weights: &QuantizedWeights,
        params: Int8Params,
    ) {
        let p = self.plan;
        let s = padded;
        let (oy, ox0, len) = (c.ht, c.wt * p.t, tile_len(p, c.wt));
        let obpg = p.oc_blocks_per_group();
        let ibpp = p.ic_blocks_per_pass();

        let tout = &mut ws.tout_i32[..obpg * p.t * V];
        tout.fill(0);
        let (iv, wv) = (&self.views.input, &self.views.weights);
        for o3 in 0..p.oc3 {
            let ob0 = c.group * obpg + o3 * p.o2;
            let part = &mut tout[o3 * p.o2 * p.t * V..];
            for i3 in 0..p.ic3 {
                let ib0 = pass.index * ibpp + i3 * p.i2;
                for_each_tap(s, oy, ox0, len, |tap| {
                    let x = &input[iv.offset(&[c.sample, ib0, tap.iy, tap.ix, 0])..];
                    let w = &weights.data[wv.offset(&[ob0, ib0, tap.ky, tap.kx, 0, 0])..];
                    let dims = GemmDims {
                        oc_blocks: p.o2,
                        ic_blocks: p.i2,
                        tiles: tap.count,
                        in_tile_stride: s.ws * iv.strides()[3],
                        in_block_stride: iv.strides()[1],
                        out_block_stride: p.t * V,
                        w_oc_stride: wv.strides()[0],
                        w_ic_stride: wv.strides()[1],
                    };
                    self.gemm.gemm_s8(&mut part[tap.out * V..], x, w, &dims, true);
                });
            }
        }

        for ob_local in 0..obpg {
            let ob = c.group * obpg + ob_local;
            let at = self.out_offset(c.sample, ob, oy, ox0);
            let src = &tout[ob_local * p.t * V..][..len * V];
            if !pass.last {
                // Safety: same disjoint tile ownership as the output.
                let dst = unsafe { acc.slice_mut(at, len * V) };
                if pass.index == 0 {
                    dst.copy_from_slice(src);
                } else {
                    for (d, &x) in dst.iter_mut().zip(src) {
                        *d += x;
                    }
                }
                continue;
            }

            let prior: Option<&[i32]> = if pass.index > 0 {
                // Safety: as above; this worker is the only reader.
                Some(unsafe { acc.slice_mut(at, len * V) })
            } else {
                None
            };
            // Safety: as above.
            let dst = unsafe { out.slice_mut(at, len * V) };
            for (e, (d, &x)) in dst.iter_mut().zip(src).enumerate() {
                let total = x + prior.map_or(0, |prev| prev[e]);
                let ch = ob * V + e % V;
                let mut real = dequantize_accumulator(total, weights.factor[ch], params.input, weights.scale[ch]);
                if let Some(bias) = self.epilogue.bias {
                    real += bias[ch];
                }
                if self.epilogue.relu {
                    real = real.max(0.0);
                }
                *d = O::from_real(real, &params.requant);
            }
        }
    }
}
