//! Blocked Gemm kernels.
//!
//! Both implementations share one driver loop (`o`, then `i`, then tile) and
//! differ only in the `V x V` block microkernel. Dispatch hierarchy:
//! - x86_64: AVX2+FMA -> portable
//! - Other: portable

use convkit_core::V;
use convkit_quant::{dot_u8i8_block, dot_u8i8_block_scalar_ref};

use crate::api::traits::GemmKernel;
use crate::api::types::{GemmDims, KernelIsa};

/// Shared driver: `out[o][t] (+)= sum_i block(input[i][t], weights[o][i])`.
#[inline]
fn drive<A, X, W>(
    micro: impl Fn(&mut [A], &[X], &[W]),
    out: &mut [A],
    input: &[X],
    weights: &[W],
    dims: &GemmDims,
    accumulate: bool,
) where
    A: Copy + Default,
{
    for o in 0..dims.oc_blocks {
        let out_o = &mut out[o * dims.out_block_stride..];
        if !accumulate {
            out_o[..dims.tiles * V].fill(A::default());
        }
        for i in 0..dims.ic_blocks {
            let w = &weights[o * dims.w_oc_stride + i * dims.w_ic_stride..][..V * V];
            let x_i = &input[i * dims.in_block_stride..];
            for t in 0..dims.tiles {
                let x = &x_i[t * dims.in_tile_stride..][..V];
                micro(&mut out_o[t * V..(t + 1) * V], x, w);
            }
        }
    }
}

/// Scalar f32 block product: `acc[vo] += sum_vi x[vi] * w[vi][vo]`.
fn block_f32_scalar(acc: &mut [f32], x: &[f32], w: &[f32]) {
    for (vi, &a) in x.iter().enumerate().take(V) {
        let row = &w[vi * V..(vi + 1) * V];
        for (o, &b) in acc.iter_mut().zip(row) {
            *o += a * b;
        }
    }
}

// --- x86_64 SIMD implementation ---

#[cfg(target_arch = "x86_64")]
mod x86 {
    use convkit_core::V;

    #[target_feature(enable = "avx2,fma")]
    pub(super) unsafe fn block_f32_fma(acc: &mut [f32], x: &[f32], w: &[f32]) {
        use std::arch::x86_64::*;
        debug_assert!(acc.len() >= V && x.len() >= V && w.len() >= V * V);

        let mut lo = _mm256_loadu_ps(acc.as_ptr());
        let mut hi = _mm256_loadu_ps(acc.as_ptr().add(8));
        for vi in 0..V {
            let a = _mm256_set1_ps(*x.get_unchecked(vi));
            let row = w.as_ptr().add(vi * V);
            lo = _mm256_fmadd_ps(a, _mm256_loadu_ps(row), lo);
            hi = _mm256_fmadd_ps(a, _mm256_loadu_ps(row.add(8)), hi);
        }
        _mm256_storeu_ps(acc.as_mut_ptr(), lo);
        _mm256_storeu_ps(acc.as_mut_ptr().add(8), hi);
    }
}

/// Scalar kernels for every target.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortableGemm;

impl GemmKernel for PortableGemm {
    fn isa(&self) -> KernelIsa {
        KernelIsa::Portable
    }

    fn gemm_f32(&self, out: &mut [f32], input: &[f32], weights: &[f32], dims: &GemmDims, accumulate: bool) {
        drive(block_f32_scalar, out, input, weights, dims, accumulate)
    }

    fn gemm_s8(&self, out: &mut [i32], input: &[u8], weights: &[i8], dims: &GemmDims, accumulate: bool) {
        drive(dot_u8i8_block_scalar_ref, out, input, weights, dims, accumulate)
    }
}

/// AVX2+FMA kernels. Only constructible when the CPU supports them.
#[derive(Debug, Clone, Copy)]
pub struct Avx2Gemm {
    _detected: (),
}

impl Avx2Gemm {
    pub fn new() -> Option<Self> {
        (KernelIsa::detect() == KernelIsa::Avx2).then_some(Self { _detected: () })
    }
}

impl GemmKernel for Avx2Gemm {
    fn isa(&self) -> KernelIsa {
        KernelIsa::Avx2
    }

    fn gemm_f32(&self, out: &mut [f32], input: &[f32], weights: &[f32], dims: &GemmDims, accumulate: bool) {
        #[cfg(target_arch = "x86_64")]
        {
            // Safety: `Avx2Gemm::new` verified avx2 and fma.
            let micro = |acc: &mut [f32], x: &[f32], w: &[f32]| unsafe { x86::block_f32_fma(acc, x, w) };
            return drive(micro, out, input, weights, dims, accumulate);
        }
        #[allow(unreachable_code)]
        drive(block_f32_scalar, out, input, weights, dims, accumulate)
    }

    fn gemm_s8(&self, out: &mut [i32], input: &[u8], weights: &[i8], dims: &GemmDims, accumulate: bool) {
        drive(dot_u8i8_block, out, input, weights, dims, accumulate)
    }
}

/// Kernel for a capability level, falling back to portable when the level
/// is unavailable on this CPU.
pub fn select_gemm(isa: KernelIsa) -> Box<dyn GemmKernel> {
    match isa {
        KernelIsa::Avx2 => match Avx2Gemm::new() {
            Some(k) => Box::new(k),
            None => Box::new(PortableGemm),
        },
        KernelIsa::Portable => Box::new(PortableGemm),
    }
}
