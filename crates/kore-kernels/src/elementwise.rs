//! Element-wise binary operations with numpy-style broadcasting.

use smallvec::SmallVec;

use crate::numel;

/// Broadcast two shapes against each other.
/// Returns the broadcasted shape or None if incompatible.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<SmallVec<[usize; 4]>> {
    let max_ndim = a.len().max(b.len());
    let mut result = SmallVec::with_capacity(max_ndim);

    for i in 0..max_ndim {
        let da = if i < a.len() { a[a.len() - 1 - i] } else { 1 };
        let db = if i < b.len() { b[b.len() - 1 - i] } else { 1 };

        if da == db || db == 1 {
            result.push(da);
        } else if da == 1 {
            result.push(db);
        } else {
            return None;
        }
    }

    result.reverse();
    Some(result)
}

/// Strides of `dims` viewed through `out_dims`; broadcast axes get stride 0.
fn broadcast_strides(dims: &[usize], out_dims: &[usize]) -> SmallVec<[usize; 4]> {
    let offset = out_dims.len() - dims.len();
    let mut strides = SmallVec::from_elem(0usize, out_dims.len());
    let mut acc = 1usize;
    for i in (0..dims.len()).rev() {
        strides[offset + i] = if dims[i] == 1 { 0 } else { acc };
        acc *= dims[i];
    }
    strides
}

/// out[i] = f(a[i'], b[i'']) where a and b are broadcast to `out_dims`.
pub fn binary_broadcast<F>(
    a: &[f32],
    a_dims: &[usize],
    b: &[f32],
    b_dims: &[usize],
    out: &mut [f32],
    out_dims: &[usize],
    f: F,
) where
    F: Fn(f32, f32) -> f32,
{
    let n = numel(out_dims);
    if a_dims == b_dims {
        for i in 0..n {
            out[i] = f(a[i], b[i]);
        }
        return;
    }

    let sa = broadcast_strides(a_dims, out_dims);
    let sb = broadcast_strides(b_dims, out_dims);
    let rank = out_dims.len();
    let mut index: SmallVec<[usize; 4]> = SmallVec::from_elem(0usize, rank);
    let (mut ia, mut ib) = (0usize, 0usize);

    for o in 0..n {
        out[o] = f(a[ia], b[ib]);
        for d in (0..rank).rev() {
            index[d] += 1;
            ia += sa[d];
            ib += sb[d];
            if index[d] < out_dims[d] {
                break;
            }
            ia -= sa[d] * out_dims[d];
            ib -= sb[d] * out_dims[d];
            index[d] = 0;
        }
    }
}

/// Copy slice
pub fn copy(src: &[f32], dst: &mut [f32]) {
    dst.copy_from_slice(src);
}
