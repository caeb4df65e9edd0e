//! Winograd F(m x m, 3 x 3) transforms.
//!
//! For an `alpha x alpha` input tile `d` and a `3 x 3` kernel `g`:
//!
//! ```text
//! V = Bt d Bt^T        (input)
//! U = G g G^T          (weights, once)
//! Y = At (U .* V) At^T (output, m = alpha - 2)
//! ```
//!
//! `Y[i][j] = sum_ab g[a][b] d[i+a][j+b]` (cross-correlation). The input and
//! output matrices only hold small integers, so those transforms add no
//! rounding beyond float addition.

use convkit_core::V;

use crate::api::traits::TransformKernel;
use crate::api::types::{TileSource, TileWindow};

/// Fixed transform matrices, row-major.
#[derive(Debug)]
pub struct WinogradMatrices {
    pub alpha: usize,
    pub k: usize,
    /// `alpha x alpha`
    pub bt: &'static [f32],
    /// `alpha x k`
    pub g: &'static [f32],
    /// `m x alpha`
    pub at: &'static [f32],
}

/// F(2x2, 3x3), points 0, 1, -1, inf.
pub static F2X3: WinogradMatrices = WinogradMatrices {
    alpha: 4,
    k: 3,
    #[rustfmt::skip]
    bt: &[
        1.0,  0.0, -1.0,  0.0,
        0.0,  1.0,  1.0,  0.0,
        0.0, -1.0,  1.0,  0.0,
        0.0,  1.0,  0.0, -1.0,
    ],
    #[rustfmt::skip]
    g: &[
        1.0,  0.0, 0.0,
        0.5,  0.5, 0.5,
        0.5, -0.5, 0.5,
        0.0,  0.0, 1.0,
    ],
    #[rustfmt::skip]
    at: &[
        1.0, 1.0,  1.0,  0.0,
        0.0, 1.0, -1.0, -1.0,
    ],
};

/// F(3x3, 3x3), points 0, -1, 1, 2, inf.
pub static F3X3: WinogradMatrices = WinogradMatrices {
    alpha: 5,
    k: 3,
    #[rustfmt::skip]
    bt: &[
        -2.0,  1.0,  2.0, -1.0,  0.0,
         0.0, -2.0,  3.0, -1.0,  0.0,
         0.0,  2.0,  1.0, -1.0,  0.0,
         0.0,  1.0,  0.0, -1.0,  0.0,
         0.0, -2.0,  1.0,  2.0, -1.0,
    ],
    #[rustfmt::skip]
    g: &[
        -1.0 / 2.0,  0.0,        0.0,
         1.0 / 6.0, -1.0 / 6.0,  1.0 / 6.0,
         1.0 / 2.0,  1.0 / 2.0,  1.0 / 2.0,
        -1.0 / 6.0, -1.0 / 3.0, -2.0 / 3.0,
         0.0,        0.0,       -1.0,
    ],
    #[rustfmt::skip]
    at: &[
        1.0,  1.0, 1.0, 1.0, 0.0,
        0.0, -1.0, 1.0, 2.0, 0.0,
        0.0,  1.0, 1.0, 4.0, 1.0,
    ],
};

const MAX_ALPHA: usize = 5;
const MAX_TILE: usize = MAX_ALPHA * MAX_ALPHA * V;

/// `out = M x M^T` per lane, with `M` `rows x cols`, `x` `cols x cols x lanes`
/// and `out` `rows x rows x lanes`. Zero coefficients are skipped.
fn sandwich(out: &mut [f32], x: &[f32], m: &[f32], rows: usize, cols: usize, lanes: usize, tmp: &mut [f32]) {
    // tmp[r][c] = sum_k m[r][k] x[k][c]
    for r in 0..rows {
        for c in 0..cols {
            let t = &mut tmp[(r * cols + c) * lanes..][..lanes];
            t.fill(0.0);
            for k in 0..cols {
                let coef = m[r * cols + k];
                if coef == 0.0 {
                    continue;
                }
                let xs = &x[(k * cols + c) * lanes..][..lanes];
                for (a, &b) in t.iter_mut().zip(xs) {
                    *a += coef * b;
                }
            }
        }
    }
    // out[r][s] = sum_k tmp[r][k] m[s][k]
    for r in 0..rows {
        for s in 0..rows {
            let o = &mut out[(r * rows + s) * lanes..][..lanes];
            o.fill(0.0);
            for k in 0..cols {
                let coef = m[s * cols + k];
                if coef == 0.0 {
                    continue;
                }
                let ts = &tmp[(r * cols + k) * lanes..][..lanes];
                for (a, &b) in o.iter_mut().zip(ts) {
                    *a += coef * b;
                }
            }
        }
    }
}

/// Winograd transform kernel over one of the fixed matrix sets.
#[derive(Debug, Clone, Copy)]
pub struct WinogradTransform {
    mats: &'static WinogradMatrices,
}

impl WinogradTransform {
    /// Transform with `alpha x alpha` tiles; `None` unless alpha is 4 or 5.
    pub fn new(alpha: usize) -> Option<Self> {
        match alpha {
            4 => Some(Self { mats: &F2X3 }),
            5 => Some(Self { mats: &F3X3 }),
            _ => None,
        }
    }

    pub fn matrices(&self) -> &'static WinogradMatrices {
        self.mats
    }

    fn transform_tile(&self, out: &mut [f32], tile: &[f32]) {
        let a = self.mats.alpha;
        let mut tmp = [0.0f32; MAX_TILE];
        sandwich(out, tile, self.mats.bt, a, a, V, &mut tmp);
    }
}

impl TransformKernel for WinogradTransform {
    fn alpha(&self) -> usize {
        self.mats.alpha
    }

    fn kernel_size(&self) -> usize {
        self.mats.k
    }

    fn forward_input(&self, out: &mut [f32], src: &TileSource<'_>) {
        let a = self.mats.alpha;
        let mut tile = [0.0f32; MAX_TILE];
        for h in 0..a {
            let row = src.offset(h, 0);
            tile[h * a * V..(h + 1) * a * V].copy_from_slice(&src.plane[row..row + a * V]);
        }
        self.transform_tile(out, &tile[..a * a * V]);
    }

    fn forward_input_masked(&self, out: &mut [f32], src: &TileSource<'_>, window: TileWindow) {
        let a = self.mats.alpha;
        let mut tile = [0.0f32; MAX_TILE];
        for h in 0..a {
            for w in 0..a {
                if window.contains(h, w) {
                    let at = src.offset(h, w);
                    tile[(h * a + w) * V..(h * a + w + 1) * V].copy_from_slice(&src.plane[at..at + V]);
                }
            }
        }
        self.transform_tile(out, &tile[..a * a * V]);
    }

    fn forward_weights(&self, out: &mut [f32], weights: &[f32]) {
        let (a, k) = (self.mats.alpha, self.mats.k);
        let mut tmp = vec![0.0f32; a * k * V * V];
        sandwich(out, weights, self.mats.g, a, k, V * V, &mut tmp);
    }

    fn inverse_output(&self, out: &mut [f32], input: &[f32]) {
        let a = self.mats.alpha;
        let m = self.out_tile();
        let mut tmp = [0.0f32; MAX_TILE];
        sandwich(out, input, self.mats.at, m, a, V, &mut tmp);
    }
}
