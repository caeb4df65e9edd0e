//! Engine-owned transformed weights.

use std::time::Instant;

use convkit_core::{reorder_weights_to_blocked, BlockingPlan, WeightDims, WeightLayout, V};
use convkit_quant::{quantize_weights, QuantizedWeights, WeightBlocks};
use rayon::prelude::*;

use crate::api::error::{EngineError, EngineResult};
use crate::api::traits::TransformKernel;
use crate::api::types::Strategy;

/// Weights in the layout a strategy's Gemm reads.
#[derive(Debug)]
pub enum TransformedWeights {
    /// `[oc2][ic2][kh][kw][Vi][Vo]`
    Blocked(Vec<f32>),
    /// `[oc2][ic2][alpha*alpha][Vi][Vo]`
    Winograd(Vec<f32>),
    Int8(QuantizedWeights),
}

fn blocks_of(plan: &BlockingPlan) -> WeightBlocks {
    WeightBlocks {
        oc2: plan.oc2,
        ic2: plan.ic2,
        kh: plan.shape.kh,
        kw: plan.shape.kw,
    }
}

impl TransformedWeights {
    pub fn allocate(strategy: Strategy, plan: &BlockingPlan) -> Self {
        let blocks = blocks_of(plan);
        match strategy {
            Strategy::Direct | Strategy::Pointwise => TransformedWeights::Blocked(vec![0.0; blocks.len()]),
            Strategy::Winograd { alpha } => {
                TransformedWeights::Winograd(vec![0.0; plan.oc2 * plan.ic2 * alpha * alpha * V * V])
            }
            Strategy::Int8Direct => TransformedWeights::Int8(QuantizedWeights {
                blocks,
                data: vec![0; blocks.len()],
                scale: vec![0.0; blocks.oc_aligned()],
                factor: vec![0; blocks.oc_aligned()],
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransformedWeights::Blocked(_) => "blocked",
            TransformedWeights::Winograd(_) => "winograd",
            TransformedWeights::Int8(_) => "int8",
        }
    }

    /// Whether `update` needs a blocked f32 staging buffer.
    pub fn needs_staging(&self) -> bool {
        !matches!(self, TransformedWeights::Blocked(_))
    }

    /// Reorder user weights and transform them in place.
    ///
    /// `staging` holds the blocked f32 copy for the Winograd and int8 variants.
    pub fn update(
        &mut self,
        src: &[f32],
        layout: WeightLayout,
        dims: WeightDims,
        staging: &mut [f32],
        transform: Option<&dyn TransformKernel>,
    ) -> EngineResult<()> {
        let _t = if log::log_enabled!(log::Level::Trace) { Some(Instant::now()) } else { None };

        match self {
            TransformedWeights::Blocked(buf) => reorder_weights_to_blocked(src, layout, dims, buf)?,
            TransformedWeights::Winograd(buf) => {
                let transform = transform.ok_or_else(|| {
                    EngineError::KernelUnsupported("winograd weights need a transform kernel".into())
                })?;
                reorder_weights_to_blocked(src, layout, dims, staging)?;
                let aa = transform.alpha() * transform.alpha();
                let taps = dims.kh * dims.kw;
                buf.par_chunks_mut(aa * V * V)
                    .zip(staging.par_chunks(taps * V * V))
                    .for_each(|(out, block)| transform.forward_weights(out, block));
            }
            TransformedWeights::Int8(qw) => {
                reorder_weights_to_blocked(src, layout, dims, staging)?;
                *qw = quantize_weights(staging, qw.blocks)?;
            }
        }

        if let Some(t) = _t {
            log::trace!(
                "[perf] engine::weights {} [{}x{}x{}x{}] {:.3}ms",
                self.kind(),
                dims.oc,
                dims.ic,
                dims.kh,
                dims.kw,
                t.elapsed().as_secs_f64() * 1000.0
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::winograd::WinogradTransform;
    use convkit_core::{BlockingHints, ConvDesc};

    fn plan_for(strategy: Strategy) -> BlockingPlan {
        let shape = ConvDesc::default().shape().unwrap();
        BlockingPlan::new(&shape, strategy.tiling(), &BlockingHints::default()).unwrap()
    }

    fn dims() -> WeightDims {
        WeightDims { kh: 3, kw: 3, ic: 16, oc: 16 }
    }

    #[test]
    fn test_blocked_passthrough() {
        let plan = plan_for(Strategy::Direct);
        let mut w = TransformedWeights::allocate(Strategy::Direct, &plan);
        assert!(!w.needs_staging());
        let src: Vec<f32> = (0..9 * V * V).map(|i| i as f32).collect();
        w.update(&src, WeightLayout::Blocked, dims(), &mut [], None).unwrap();
        match w {
            TransformedWeights::Blocked(buf) => assert_eq!(buf, src),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_winograd_needs_transform() {
        let plan = plan_for(Strategy::Winograd { alpha: 4 });
        let mut w = TransformedWeights::allocate(Strategy::Winograd { alpha: 4 }, &plan);
        let src = vec![0.0f32; 9 * V * V];
        let mut staging = vec![0.0f32; 9 * V * V];
        let err = w.update(&src, WeightLayout::Blocked, dims(), &mut staging, None);
        assert!(matches!(err, Err(EngineError::KernelUnsupported(_))));
    }

    #[test]
    fn test_winograd_centre_tap() {
        // a centre-only kernel transforms to the centre column of G times its row
        let plan = plan_for(Strategy::Winograd { alpha: 4 });
        let t = WinogradTransform::new(4).unwrap();
        let mut w = TransformedWeights::allocate(Strategy::Winograd { alpha: 4 }, &plan);
        let mut src = vec![0.0f32; 9 * V * V];
        src[4 * V * V] = 1.0;
        let mut staging = vec![0.0f32; 9 * V * V];
        w.update(&src, WeightLayout::Blocked, dims(), &mut staging, Some(&t)).unwrap();
        let g_mid = [0.0f32, 0.5, -0.5, 0.0];
        let TransformedWeights::Winograd(buf) = w else { panic!("expected winograd weights") };
        for r in 0..4 {
            for c in 0..4 {
                assert_eq!(buf[(r * 4 + c) * V * V], g_mid[r] * g_mid[c]);
            }
        }
    }

    #[test]
    fn test_int8_quantizes() {
        let plan = plan_for(Strategy::Int8Direct);
        let mut w = TransformedWeights::allocate(Strategy::Int8Direct, &plan);
        let src: Vec<f32> = (0..9 * V * V).map(|i| ((i % 7) as f32 - 3.0) * 0.1).collect();
        let mut staging = vec![0.0f32; 9 * V * V];
        w.update(&src, WeightLayout::Blocked, dims(), &mut staging, None).unwrap();
        let TransformedWeights::Int8(qw) = w else { panic!("expected int8 weights") };
        assert!(qw.scale.iter().all(|&s| s > 0.0));
        assert!(qw.data.iter().any(|&q| q == 127 || q == -127));
    }
}
