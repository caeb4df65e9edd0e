//! Convolution engine: owns the plan, kernels, worker pool, transformed
//! weights and every staging buffer a call needs.

use std::time::Instant;

use convkit_core::{
    align_up, pad_blocked_spatial, reorder_act_from_blocked, reorder_act_to_blocked, ActDims, ActLayout,
    BlockingPlan, ConvDesc, ConvError, ConvResult, DType, Precision, QuantParams, RuntimeConfig,
    WeightsReuse, V,
};
use convkit_quant::{validate_calibration, Requantizer};

use crate::api::error::{EngineError, EngineResult};
use crate::api::traits::{GemmKernel, QuantOutput, TransformKernel};
use crate::api::types::{KernelIsa, Strategy, WeightsState};
use crate::core::gemm::select_gemm;
use crate::core::scheduler::{select_strategy, Epilogue, Int8Params, Scheduler};
use crate::core::scratch::WorkerScratch;
use crate::core::weights::TransformedWeights;
use crate::core::winograd::WinogradTransform;

fn check_len(what: &'static str, expected: usize, actual: usize) -> ConvResult<()> {
    if expected != actual {
        return Err(ConvError::BufferSize { what, expected, actual });
    }
    Ok(())
}

fn cast<'b, T: bytemuck::Pod>(what: &str, bytes: &'b [u8]) -> ConvResult<&'b [T]> {
    bytemuck::try_cast_slice(bytes).map_err(|e| ConvError::Alignment(format!("{}: {:?}", what, e)))
}

fn cast_mut<'b, T: bytemuck::Pod>(what: &str, bytes: &'b mut [u8]) -> ConvResult<&'b mut [T]> {
    bytemuck::try_cast_slice_mut(bytes).map_err(|e| ConvError::Alignment(format!("{}: {:?}", what, e)))
}

/// Plain -> blocked activation reorder on the engine's workers.
fn stage_in<T: Copy + Send + Sync>(
    pool: &rayon::ThreadPool,
    src: &[T],
    layout: ActLayout,
    dims: ActDims,
    dst: &mut [T],
    fill: T,
) -> ConvResult<()> {
    pool.install(|| reorder_act_to_blocked(src, layout, dims, dst, fill))
}

/// Blocked -> plain activation reorder on the engine's workers.
fn stage_out<T: Copy + Send + Sync>(
    pool: &rayon::ThreadPool,
    src: &[T],
    layout: ActLayout,
    dims: ActDims,
    dst: &mut [T],
) -> ConvResult<()> {
    pool.install(|| reorder_act_from_blocked(src, layout, dims, dst))
}

/// Validate everything a descriptor promises before anything is allocated.
fn validate(desc: &ConvDesc, shape_ic: usize) -> EngineResult<Requantizer> {
    match desc.precision {
        Precision::F32 => {
            if desc.output_dtype != DType::F32 {
                return Err(ConvError::Format(format!(
                    "f32 convolution cannot write {} output",
                    desc.output_dtype
                ))
                .into());
            }
        }
        Precision::Int8 => {
            validate_calibration(desc.sampling)?;
            Requantizer::validate_input(desc.input_quant)?;
            if shape_ic % V != 0 {
                return Err(ConvError::UnsupportedConfig(format!(
                    "int8 needs input channels in multiples of {}, got {}",
                    V, shape_ic
                ))
                .into());
            }
            if desc.with_residual_sum {
                return Err(EngineError::KernelUnsupported("residual sum with int8 precision".into()));
            }
        }
    }
    let requant = match desc.output_elem_dtype() {
        DType::U8 | DType::I8 => Requantizer::new(desc.output_quant)?,
        DType::F32 => Requantizer::new(QuantParams::default())?,
    };
    Ok(requant)
}

/// Runs one convolution descriptor, many times.
///
/// Construction validates the descriptor, picks a strategy and kernels,
/// builds a dedicated worker pool and allocates all scratch. `execute*`
/// calls then only reorder, transform and compute.
pub struct ConvolutionEngine {
    desc: ConvDesc,
    plan: BlockingPlan,
    strategy: Strategy,
    gemm: Box<dyn GemmKernel>,
    transform: Option<WinogradTransform>,
    pool: rayon::ThreadPool,
    scratch: Vec<WorkerScratch>,

    weights: TransformedWeights,
    weights_staging: Vec<f32>,
    state: WeightsState,
    bias: Vec<f32>,
    requant: Requantizer,
    /// Input zero point as stored in padding.
    pad_u8: u8,

    input_f32: Vec<f32>,
    input_u8: Vec<u8>,
    input_padded: Vec<u8>,
    /// Blocked output for non-blocked layouts, reinterpreted per element type.
    output_staging: Vec<f32>,
    acc: Vec<i32>,
}

impl ConvolutionEngine {
    pub fn new(desc: ConvDesc) -> EngineResult<Self> {
        Self::with_runtime(desc, RuntimeConfig::default())
    }

    pub fn with_runtime(desc: ConvDesc, runtime: RuntimeConfig) -> EngineResult<Self> {
        let shape = desc.shape()?;
        let requant = validate(&desc, shape.ic)?;
        let strategy = select_strategy(&desc, &shape)?;
        let plan = BlockingPlan::new(&shape, strategy.tiling(), &desc.blocking)?;
        let gemm = select_gemm(KernelIsa::resolve(runtime.kernel));
        let transform = match strategy {
            Strategy::Winograd { alpha } => Some(WinogradTransform::new(alpha).ok_or_else(|| {
                EngineError::KernelUnsupported(format!("no winograd transform for tile {}", alpha))
            })?),
            _ => None,
        };
        let pool = runtime.build_pool()?;

        let int8 = desc.precision == Precision::Int8;
        let workers = pool.current_num_threads();
        let out_tile = transform.as_ref().map_or(0, |t| t.out_tile());
        let scratch = (0..workers).map(|_| WorkerScratch::for_plan(&plan, workers, int8, out_tile)).collect();

        let weights = TransformedWeights::allocate(strategy, &plan);
        let weights_staging = if weights.needs_staging() {
            vec![0.0; plan.oc2 * plan.ic2 * shape.kh * shape.kw * V * V]
        } else {
            Vec::new()
        };

        let blocked_in = shape.n * plan.ic2 * shape.ih * shape.iw * V;
        let blocked_out = shape.n * plan.oc2 * shape.oh * shape.ow * V;
        let plain_in = desc.formats.input != ActLayout::Blocked;
        let input_f32 = if !int8 && plain_in { vec![0.0; blocked_in] } else { Vec::new() };
        let input_u8 = if int8 && plain_in { vec![0; blocked_in] } else { Vec::new() };
        let input_padded = if int8 {
            vec![0; shape.n * plan.ic2 * (shape.ih + shape.tp + shape.bp) * (shape.iw + shape.lp + shape.rp) * V]
        } else {
            Vec::new()
        };
        let output_staging = if desc.formats.output != ActLayout::Blocked {
            vec![0.0; (blocked_out * desc.output_elem_dtype().size_of()).div_ceil(DType::F32.size_of())]
        } else {
            Vec::new()
        };
        let acc = if int8 && plan.ic4 > 1 { vec![0; blocked_out] } else { Vec::new() };
        // whole and in range for int8, see `Requantizer::validate_input`
        let pad_u8 = desc.input_quant.zero_point as u8;

        log::debug!(
            "[engine] strategy={} isa={} threads={} tiles={} ic4={} oc4={} t={}",
            strategy,
            gemm.isa(),
            workers,
            plan.total_tiles(),
            plan.ic4,
            plan.oc4,
            plan.t
        );

        Ok(Self {
            bias: vec![0.0; align_up(shape.oc, V)],
            desc,
            plan,
            strategy,
            gemm,
            transform,
            pool,
            scratch,
            weights,
            weights_staging,
            state: WeightsState::Uninitialized,
            requant,
            pad_u8,
            input_f32,
            input_u8,
            input_padded,
            output_staging,
            acc,
        })
    }

    pub fn desc(&self) -> &ConvDesc {
        &self.desc
    }

    pub fn plan(&self) -> &BlockingPlan {
        &self.plan
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn kernel_isa(&self) -> KernelIsa {
        self.gemm.isa()
    }

    pub fn num_threads(&self) -> usize {
        self.scratch.len()
    }

    pub fn weights_state(&self) -> WeightsState {
        self.state
    }

    /// Force the next call to re-transform weights.
    pub fn invalidate_weights(&mut self) {
        self.state = WeightsState::Uninitialized;
    }

    fn check_sizes(&self, input: usize, weights: usize, output: usize, bias: Option<usize>) -> ConvResult<()> {
        let sizes = self.desc.sizes();
        check_len("input", sizes.input, input)?;
        check_len("weights", sizes.weights, weights)?;
        check_len("output", sizes.output, output)?;
        check_len("bias", sizes.bias, bias.unwrap_or(0))
    }

    fn prepare_weights(&mut self, weights: &[f32], bias: Option<&[f32]>) -> EngineResult<()> {
        if let Some(b) = bias {
            self.bias[..b.len()].copy_from_slice(b);
        }
        if self.state == WeightsState::Ready && self.desc.weights_reuse == WeightsReuse::Repeated {
            return Ok(());
        }
        self.state = WeightsState::Uninitialized;
        let transform = self.transform.as_ref().map(|t| t as &dyn TransformKernel);
        let (layout, dims) = (self.desc.formats.weights, self.desc.dims.weights);
        let (store, staging) = (&mut self.weights, &mut self.weights_staging[..]);
        self.pool.install(|| store.update(weights, layout, dims, staging, transform))?;
        self.state = WeightsState::Ready;
        Ok(())
    }

    /// f32 convolution. Buffers are in the descriptor's layouts; `bias`
    /// must be present exactly when the descriptor asks for it.
    pub fn execute_f32(
        &mut self,
        output: &mut [f32],
        input: &[f32],
        weights: &[f32],
        bias: Option<&[f32]>,
    ) -> EngineResult<()> {
        if self.desc.precision != Precision::F32 {
            return Err(ConvError::Format("execute_f32 on an int8 engine".into()).into());
        }
        self.check_sizes(input.len(), weights.len(), output.len(), bias.map(<[f32]>::len))?;
        let _t = if log::log_enabled!(log::Level::Trace) { Some(Instant::now()) } else { None };

        self.prepare_weights(weights, bias)?;

        let formats = self.desc.formats;
        let dims = self.desc.dims;
        let input: &[f32] = match formats.input {
            ActLayout::Blocked => input,
            layout => {
                stage_in(&self.pool, input, layout, dims.input, &mut self.input_f32[..], 0.0)?;
                &self.input_f32
            }
        };
        let weights = match &self.weights {
            TransformedWeights::Blocked(w) | TransformedWeights::Winograd(w) => w,
            TransformedWeights::Int8(_) => {
                return Err(EngineError::KernelUnsupported("int8 weights on the f32 path".into()))
            }
        };
        let epilogue = Epilogue {
            bias: self.desc.with_bias.then_some(&self.bias[..]),
            relu: self.desc.with_relu,
            residual: self.desc.with_residual_sum,
        };
        let transform = self.transform.as_ref().map(|t| t as &dyn TransformKernel);
        let sched = Scheduler::new(&self.plan, self.strategy, &*self.gemm, transform, epilogue);

        match formats.output {
            ActLayout::Blocked => sched.run_f32(&self.pool, &mut self.scratch, output, input, weights)?,
            layout => {
                let staging = &mut self.output_staging[..];
                if self.desc.with_residual_sum {
                    stage_in(&self.pool, &*output, layout, dims.output, staging, 0.0)?;
                }
                sched.run_f32(&self.pool, &mut self.scratch, staging, input, weights)?;
                stage_out(&self.pool, &*staging, layout, dims.output, output)?;
            }
        }

        if let Some(t) = _t {
            log::trace!(
                "[perf] engine::execute_f32 {} {:?}->{:?} {:.3}ms",
                self.strategy,
                formats.input,
                formats.output,
                t.elapsed().as_secs_f64() * 1000.0
            );
        }
        Ok(())
    }

    /// u8 input, f32 weights quantized per output channel, output `O`.
    pub fn execute_int8<O: QuantOutput>(
        &mut self,
        output: &mut [O],
        input: &[u8],
        weights: &[f32],
        bias: Option<&[f32]>,
    ) -> EngineResult<()> {
        if self.desc.precision != Precision::Int8 {
            return Err(ConvError::Format("execute_int8 on an f32 engine".into()).into());
        }
        if O::DTYPE != self.desc.output_dtype {
            return Err(ConvError::Format(format!(
                "engine writes {} output, called with {}",
                self.desc.output_dtype,
                O::DTYPE
            ))
            .into());
        }
        self.check_sizes(input.len(), weights.len(), output.len(), bias.map(<[f32]>::len))?;
        let _t = if log::log_enabled!(log::Level::Trace) { Some(Instant::now()) } else { None };

        self.prepare_weights(weights, bias)?;

        let formats = self.desc.formats;
        let dims = self.desc.dims;
        let blocked: &[u8] = match formats.input {
            ActLayout::Blocked => input,
            layout => {
                stage_in(&self.pool, input, layout, dims.input, &mut self.input_u8[..], self.pad_u8)?;
                &self.input_u8
            }
        };
        let (pads, pad_u8) = (self.desc.pads, self.pad_u8);
        let padded = &mut self.input_padded[..];
        self.pool.install(|| pad_blocked_spatial(blocked, dims.input, pads, pad_u8, padded))?;

        let TransformedWeights::Int8(qw) = &self.weights else {
            return Err(EngineError::KernelUnsupported("f32 weights on the int8 path".into()));
        };
        let epilogue = Epilogue {
            bias: self.desc.with_bias.then_some(&self.bias[..]),
            relu: self.desc.with_relu,
            residual: false,
        };
        let sched = Scheduler::new(&self.plan, self.strategy, &*self.gemm, None, epilogue);
        let params = Int8Params {
            input: self.desc.input_quant,
            requant: self.requant,
        };

        match formats.output {
            ActLayout::Blocked => sched.run_int8(
                &self.pool,
                &mut self.scratch,
                output,
                &mut self.acc,
                &self.input_padded,
                qw,
                params,
            )?,
            layout => {
                let p = &self.plan;
                let len = p.shape.n * p.oc2 * p.shape.oh * p.shape.ow * V;
                let staging: &mut [O] = bytemuck::try_cast_slice_mut(&mut self.output_staging[..])
                    .map_err(|e| ConvError::Alignment(format!("output staging: {:?}", e)))?;
                let staging = &mut staging[..len];
                sched.run_int8(
                    &self.pool,
                    &mut self.scratch,
                    staging,
                    &mut self.acc,
                    &self.input_padded,
                    qw,
                    params,
                )?;
                stage_out(&self.pool, &*staging, layout, dims.output, output)?;
            }
        }

        if let Some(t) = _t {
            log::trace!(
                "[perf] engine::execute_int8 -> {} {:?}->{:?} {:.3}ms",
                O::DTYPE,
                formats.input,
                formats.output,
                t.elapsed().as_secs_f64() * 1000.0
            );
        }
        Ok(())
    }

    /// Byte-level entry point. Element types follow the descriptor:
    /// activations are f32 (or u8 for int8), weights and bias are f32.
    pub fn execute(
        &mut self,
        output: &mut [u8],
        input: &[u8],
        weights: &[u8],
        bias: Option<&[u8]>,
    ) -> EngineResult<()> {
        let bytes = self.desc.byte_sizes();
        check_len("input bytes", bytes.input, input.len())?;
        check_len("weight bytes", bytes.weights, weights.len())?;
        check_len("output bytes", bytes.output, output.len())?;
        check_len("bias bytes", bytes.bias, bias.map_or(0, <[u8]>::len))?;

        let weights: &[f32] = cast("weights", weights)?;
        let bias: Option<&[f32]> = bias.map(|b| cast("bias", b)).transpose()?;
        match (self.desc.precision, self.desc.output_dtype) {
            (Precision::F32, _) => {
                let input: &[f32] = cast("input", input)?;
                self.execute_f32(cast_mut("output", output)?, input, weights, bias)
            }
            (Precision::Int8, DType::F32) => {
                self.execute_int8::<f32>(cast_mut("output", output)?, input, weights, bias)
            }
            (Precision::Int8, DType::U8) => self.execute_int8::<u8>(output, input, weights, bias),
            (Precision::Int8, DType::I8) => {
                self.execute_int8::<i8>(cast_mut("output", output)?, input, weights, bias)
            }
        }
    }
}
