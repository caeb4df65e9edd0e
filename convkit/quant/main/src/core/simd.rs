//! SIMD u8 x i8 dot-product kernel for one channel block.
//!
//! One call multiplies a pixel's `V` input lanes (u8) by a `V x V` weight
//! block (i8, layout `[V/VX][Vo][VX]`) and adds the `V` i32 results to `acc`.
//! Integer arithmetic is exact, so every path returns identical results.
//!
//! Dispatch hierarchy:
//! - x86_64: AVX2 -> scalar
//! - Other: scalar fallback

use convkit_core::{V, V1, VX};

/// Scalar block dot product.
fn dot_u8i8_block_scalar(acc: &mut [i32], src: &[u8], w: &[i8]) {
    for g in 0..V1 {
        let s = &src[g * VX..(g + 1) * VX];
        let wg = &w[g * V * VX..(g + 1) * V * VX];
        for (vo, a) in acc.iter_mut().take(V).enumerate() {
            let ws = &wg[vo * VX..(vo + 1) * VX];
            let mut sum = 0i32;
            for x in 0..VX {
                sum += (s[x] as i32) * (ws[x] as i32);
            }
            *a += sum;
        }
    }
}

// --- x86_64 SIMD implementation ---

#[cfg(target_arch = "x86_64")]
mod x86 {
    use convkit_core::{V, V1, VX};

    /// Widen VX u8 lanes to i16 and broadcast them across a 256-bit register.
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn broadcast_group(s: &[u8]) -> std::arch::x86_64::__m256i {
        use std::arch::x86_64::*;
        let pattern = (s[0] as i64) | ((s[1] as i64) << 16) | ((s[2] as i64) << 32) | ((s[3] as i64) << 48);
        _mm256_set1_epi64x(pattern)
    }

    /// Eight output lanes from 32 weight bytes (`[8][VX]`).
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn dot8(s16: std::arch::x86_64::__m256i, w: *const i8) -> std::arch::x86_64::__m256i {
        use std::arch::x86_64::*;
        let w0 = _mm256_cvtepi8_epi16(_mm_loadu_si128(w as *const __m128i));
        let w1 = _mm256_cvtepi8_epi16(_mm_loadu_si128(w.add(16) as *const __m128i));
        // pairwise products summed: two partial sums per output lane
        let p0 = _mm256_madd_epi16(s16, w0);
        let p1 = _mm256_madd_epi16(s16, w1);
        // lanes come out as [0,1,4,5 | 2,3,6,7]
        let h = _mm256_hadd_epi32(p0, p1);
        _mm256_permutevar8x32_epi32(h, _mm256_setr_epi32(0, 1, 4, 5, 2, 3, 6, 7))
    }

    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn dot_u8i8_block_avx2(acc: &mut [i32], src: &[u8], w: &[i8]) {
        use std::arch::x86_64::*;

        let mut lo = _mm256_loadu_si256(acc.as_ptr() as *const __m256i);
        let mut hi = _mm256_loadu_si256(acc.as_ptr().add(8) as *const __m256i);

        for g in 0..V1 {
            let s16 = broadcast_group(&src[g * VX..(g + 1) * VX]);
            let wg = w.as_ptr().add(g * V * VX);
            lo = _mm256_add_epi32(lo, dot8(s16, wg));
            hi = _mm256_add_epi32(hi, dot8(s16, wg.add(8 * VX)));
        }

        _mm256_storeu_si256(acc.as_mut_ptr() as *mut __m256i, lo);
        _mm256_storeu_si256(acc.as_mut_ptr().add(8) as *mut __m256i, hi);
    }
}

// --- Public dispatch function ---

/// `acc[vo] += sum_vi src[vi] * w[vi, vo]` for one `V x V` int8 block.
pub fn dot_u8i8_block(acc: &mut [i32], src: &[u8], w: &[i8]) {
    assert!(acc.len() >= V && src.len() >= V && w.len() >= V * V);

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            return unsafe { x86::dot_u8i8_block_avx2(acc, src, w) };
        }
    }

    #[allow(unreachable_code)]
    dot_u8i8_block_scalar(acc, src, w)
}

/// Public scalar reference for testing.
pub fn dot_u8i8_block_scalar_ref(acc: &mut [i32], src: &[u8], w: &[i8]) {
    dot_u8i8_block_scalar(acc, src, w)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(src: &[u8], w: &[i8]) -> Vec<i32> {
        (0..V)
            .map(|vo| {
                (0..V)
                    .map(|vi| {
                        let (g, x) = (vi / VX, vi % VX);
                        src[vi] as i32 * w[(g * V + vo) * VX + x] as i32
                    })
                    .sum()
            })
            .collect()
    }

    #[test]
    fn test_scalar_matches_reference() {
        let src: Vec<u8> = (0..V).map(|i| (i * 17 % 256) as u8).collect();
        let w: Vec<i8> = (0..V * V).map(|i| ((i * 37) % 255) as i32 - 127).map(|v| v as i8).collect();
        let mut acc = vec![0i32; V];
        dot_u8i8_block_scalar_ref(&mut acc, &src, &w);
        assert_eq!(acc, reference(&src, &w));
    }

    #[test]
    fn test_scalar_vs_dispatch() {
        let src: Vec<u8> = (0..V).map(|i| 255 - (i * 13 % 256) as u8).collect();
        let w: Vec<i8> = (0..V * V).map(|i| if i % 3 == 0 { -128 } else { (i % 127) as i8 }).collect();

        let mut scalar = vec![5i32; V];
        let mut dispatched = vec![5i32; V];
        dot_u8i8_block_scalar_ref(&mut scalar, &src, &w);
        dot_u8i8_block(&mut dispatched, &src, &w);

        assert_eq!(scalar, dispatched, "scalar {:?} vs dispatched {:?}", scalar, dispatched);
    }

    #[test]
    fn test_extreme_values_do_not_saturate() {
        let src = vec![255u8; V];
        let w = vec![-128i8; V * V];
        let mut acc = vec![0i32; V];
        dot_u8i8_block(&mut acc, &src, &w);
        assert!(acc.iter().all(|&a| a == 255 * -128 * V as i32));
    }
}
