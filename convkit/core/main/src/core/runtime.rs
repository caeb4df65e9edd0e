use crate::api::error::{ConvError, ConvResult};
use crate::api::types::KernelPreference;

/// Runtime configuration for the engine's worker pool and kernel choice.
///
/// Each engine builds its own pool from this config, so engines with
/// different thread counts can coexist in one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads.
    /// 0 means auto-detect (use all available cores).
    pub num_threads: usize,
    /// Kernel implementation preference.
    pub kernel: KernelPreference,
}

impl RuntimeConfig {
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads,
            ..Self::default()
        }
    }

    /// Build a dedicated rayon pool sized by `num_threads`.
    pub fn build_pool(&self) -> ConvResult<rayon::ThreadPool> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .thread_name(|i| format!("convkit-worker-{}", i))
            .build()
            .map_err(|e| ConvError::ThreadPool(format!("Failed to build rayon thread pool: {}", e)))?;

        log::debug!(
            "[runtime] pool threads={} simd={}",
            pool.current_num_threads(),
            Self::detect_simd()
        );
        Ok(pool)
    }

    /// Detect available SIMD instruction sets.
    pub fn detect_simd() -> &'static str {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                return "AVX2+FMA";
            }
            if is_x86_feature_detected!("avx2") {
                return "AVX2";
            }
            if is_x86_feature_detected!("sse2") {
                return "SSE2";
            }
        }
        #[cfg(target_arch = "aarch64")]
        {
            // NEON is always available on aarch64
            return "NEON";
        }
        #[allow(unreachable_code)]
        "scalar"
    }
}
