//! Strided views: logical index -> flat offset, with no data attached.

use smallvec::SmallVec;

use crate::api::error::{ConvError, ConvResult};
use crate::api::types::{ActLayout, WeightLayout, V};

pub(crate) type Dims = SmallVec<[usize; 6]>;

/// A strided multi-dimensional view over a flat buffer.
///
/// Views never own or borrow data; kernels and reorders ask them for
/// offsets and index the buffer themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorView {
    dims: Dims,
    strides: Dims,
}

fn row_major_strides(dims: &[usize]) -> Dims {
    if dims.is_empty() {
        return SmallVec::new();
    }
    let mut strides: Dims = smallvec::smallvec![1usize; dims.len()];
    for i in (0..dims.len() - 1).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

impl TensorView {
    /// Contiguous row-major view.
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
            strides: row_major_strides(dims),
        }
    }

    /// View with explicit strides.
    pub fn with_strides(dims: &[usize], strides: &[usize]) -> ConvResult<Self> {
        if dims.len() != strides.len() {
            return Err(ConvError::Shape(format!(
                "view rank mismatch: {} dims vs {} strides",
                dims.len(),
                strides.len()
            )));
        }
        Ok(Self {
            dims: SmallVec::from_slice(dims),
            strides: SmallVec::from_slice(strides),
        })
    }

    /// Reorder dimensions; `order[i]` names the source dim placed at `i`.
    pub fn permute(&self, order: &[usize]) -> ConvResult<Self> {
        if order.len() != self.dims.len() {
            return Err(ConvError::Shape(format!(
                "permutation must have {} dimensions, got {}",
                self.dims.len(),
                order.len()
            )));
        }
        let mut seen: SmallVec<[bool; 6]> = smallvec::smallvec![false; self.dims.len()];
        for &d in order {
            if d >= self.dims.len() || seen[d] {
                return Err(ConvError::Shape(format!("invalid permutation {:?}", order)));
            }
            seen[d] = true;
        }
        Ok(Self {
            dims: order.iter().map(|&d| self.dims[d]).collect(),
            strides: order.iter().map(|&d| self.strides[d]).collect(),
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Number of logical elements.
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest buffer length that covers every element of the view.
    pub fn span(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        1 + self
            .dims
            .iter()
            .zip(self.strides.iter())
            .map(|(&d, &s)| (d - 1) * s)
            .sum::<usize>()
    }

    /// Flat offset of a logical index. Bounds are debug-asserted only.
    #[inline]
    pub fn offset(&self, idx: &[usize]) -> usize {
        debug_assert_eq!(idx.len(), self.dims.len());
        debug_assert!(idx.iter().zip(self.dims.iter()).all(|(&i, &d)| i < d));
        idx.iter().zip(self.strides.iter()).map(|(&i, &s)| i * s).sum()
    }

    /// Bounds-checked flat offset.
    pub fn try_offset(&self, idx: &[usize]) -> ConvResult<usize> {
        if idx.len() != self.dims.len() {
            return Err(ConvError::Shape(format!(
                "index rank {} does not match view rank {}",
                idx.len(),
                self.dims.len()
            )));
        }
        for (dim, (&i, &d)) in idx.iter().zip(self.dims.iter()).enumerate() {
            if i >= d {
                return Err(ConvError::Shape(format!(
                    "index {} out of bounds for dim {} of size {}",
                    i, dim, d
                )));
            }
        }
        Ok(self.offset(idx))
    }

    // ==================== Layout views ====================

    /// Logical `[N, C, H, W]` view over a plain activation buffer.
    ///
    /// Returns `None` for the blocked layout, which is not expressible
    /// as a plain permutation.
    pub fn plain_activation(layout: ActLayout, n: usize, c: usize, h: usize, w: usize) -> Option<Self> {
        match layout {
            ActLayout::Nchw => Some(Self::new(&[n, c, h, w])),
            ActLayout::Nhwc => Some(Self {
                dims: smallvec::smallvec![n, c, h, w],
                strides: smallvec::smallvec![h * w * c, 1, w * c, c],
            }),
            ActLayout::Blocked => None,
        }
    }

    /// `[N, C/V, H, W, V]` view over a blocked activation buffer; `c2` is the
    /// number of channel blocks.
    pub fn blocked_activation(n: usize, c2: usize, h: usize, w: usize) -> Self {
        Self::new(&[n, c2, h, w, V])
    }

    /// Logical `[OC, IC, KH, KW]` view over a plain weight buffer.
    pub fn plain_weights(layout: WeightLayout, oc: usize, ic: usize, kh: usize, kw: usize) -> Option<Self> {
        match layout {
            WeightLayout::Oihw => Some(Self::new(&[oc, ic, kh, kw])),
            WeightLayout::Hwio => Some(Self {
                dims: smallvec::smallvec![oc, ic, kh, kw],
                strides: smallvec::smallvec![1, oc, kw * ic * oc, ic * oc],
            }),
            WeightLayout::Blocked => None,
        }
    }

    /// `[OC/V, IC/V, KH, KW, Vi, Vo]` view over blocked weights.
    pub fn blocked_weights(oc2: usize, ic2: usize, kh: usize, kw: usize) -> Self {
        Self::new(&[oc2, ic2, kh, kw, V, V])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_major_offsets() {
        let v = TensorView::new(&[2, 3, 4]);
        assert_eq!(v.strides(), &[12, 4, 1]);
        assert_eq!(v.offset(&[1, 2, 3]), 23);
        assert_eq!(v.len(), 24);
        assert_eq!(v.span(), 24);
    }

    #[test]
    fn test_try_offset_bounds() {
        let v = TensorView::new(&[2, 3]);
        assert_eq!(v.try_offset(&[1, 2]).unwrap(), 5);
        assert!(v.try_offset(&[2, 0]).is_err());
        assert!(v.try_offset(&[0]).is_err());
    }

    #[test]
    fn test_permute() {
        let v = TensorView::new(&[2, 3, 4]).permute(&[2, 0, 1]).unwrap();
        assert_eq!(v.dims(), &[4, 2, 3]);
        assert_eq!(v.strides(), &[1, 12, 4]);
        assert!(TensorView::new(&[2, 3]).permute(&[0, 0]).is_err());
    }

    #[test]
    fn test_nhwc_matches_permuted_row_major() {
        let (n, c, h, w) = (2, 5, 3, 4);
        let nhwc = TensorView::plain_activation(ActLayout::Nhwc, n, c, h, w).unwrap();
        let expected = TensorView::new(&[n, h, w, c]).permute(&[0, 3, 1, 2]).unwrap();
        assert_eq!(nhwc, expected);
        assert_eq!(nhwc.span(), n * c * h * w);
    }

    #[test]
    fn test_hwio_matches_permuted_row_major() {
        let (oc, ic, kh, kw) = (4, 3, 3, 2);
        let hwio = TensorView::plain_weights(WeightLayout::Hwio, oc, ic, kh, kw).unwrap();
        let expected = TensorView::new(&[kh, kw, ic, oc]).permute(&[3, 2, 0, 1]).unwrap();
        assert_eq!(hwio, expected);
    }

    #[test]
    fn test_with_strides_rank() {
        assert!(TensorView::with_strides(&[2, 2], &[2]).is_err());
        let v = TensorView::with_strides(&[2, 2], &[1, 2]).unwrap();
        assert_eq!(v.offset(&[1, 1]), 3);
    }
}
