//! Pointwise activations and last-axis softmax.
//!
//! Every kernel reads `src` and writes `dst` of the same length, so a backend
//! can run straight from a bound input buffer into an output buffer.

fn map(src: &[f32], dst: &mut [f32], f: impl Fn(f32) -> f32) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = f(s);
    }
}

/// `1 / (1 + e^-x)`, evaluated on the side that cannot overflow.
fn logistic(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub fn relu(src: &[f32], dst: &mut [f32]) {
    map(src, dst, |x| x.max(0.0));
}

pub fn sigmoid(src: &[f32], dst: &mut [f32]) {
    map(src, dst, logistic);
}

pub fn tanh(src: &[f32], dst: &mut [f32]) {
    map(src, dst, f32::tanh);
}

/// GELU, tanh approximation.
pub fn gelu(src: &[f32], dst: &mut [f32]) {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    const CUBIC: f32 = 0.044_715;
    map(src, dst, |x| {
        let inner = SQRT_2_OVER_PI * (x + CUBIC * x * x * x);
        0.5 * x * (1.0 + inner.tanh())
    });
}

/// SiLU: `x * sigmoid(x)`.
pub fn silu(src: &[f32], dst: &mut [f32]) {
    map(src, dst, |x| x * logistic(x));
}

/// Softmax along the last axis of `dims`.
///
/// Each row is shifted by its maximum before exponentiation. A zero-length
/// last axis leaves `dst` untouched.
pub fn softmax_last_axis(src: &[f32], dst: &mut [f32], dims: &[usize]) {
    let axis = dims.last().copied().unwrap_or(1);
    if axis == 0 {
        return;
    }
    for (row_in, row_out) in src.chunks_exact(axis).zip(dst.chunks_exact_mut(axis)) {
        let peak = row_in.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut total = 0.0f32;
        for (o, &x) in row_out.iter_mut().zip(row_in) {
            *o = (x - peak).exp();
            total += *o;
        }
        let scale = total.recip();
        row_out.iter_mut().for_each(|o| *o *= scale);
    }
}
