//! Matrix multiplication. C = A[M,K] @ B[K,N] → C[M,N].

/// f32 matmul: C[M,N] = A[M,K] @ B[K,N]
pub fn matmul_f32(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += a[i * k + p] * b[p * n + j];
            }
            c[i * n + j] = acc;
        }
    }
}

/// Batched matmul over `batch` independent [M,K] @ [K,N] products.
///
/// When `shared_rhs` is set, every batch reuses the same B matrix
/// (a rank-2 weight applied to a batched activation).
#[allow(clippy::too_many_arguments)]
pub fn matmul_batched(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    batch: usize,
    m: usize,
    n: usize,
    k: usize,
    shared_rhs: bool,
) {
    for bi in 0..batch {
        let a_mat = &a[bi * m * k..(bi + 1) * m * k];
        let b_mat = if shared_rhs {
            &b[..k * n]
        } else {
            &b[bi * k * n..(bi + 1) * k * n]
        };
        let c_mat = &mut c[bi * m * n..(bi + 1) * m * n];
        matmul_f32(a_mat, b_mat, c_mat, m, n, k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_2x2() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let mut c = [0.0f32; 4];
        matmul_f32(&a, &b, &mut c, 2, 2, 2);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_batched_shared_rhs() {
        let a = [1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0];
        let b = [1.0, 2.0, 3.0, 4.0];
        let mut c = [0.0f32; 8];
        matmul_batched(&a, &b, &mut c, 2, 2, 2, 2, true);
        assert_eq!(c, [1.0, 2.0, 3.0, 4.0, 2.0, 4.0, 6.0, 8.0]);
    }
}
