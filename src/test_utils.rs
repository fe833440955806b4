// Naive matrix multiplication for testing. `a: [m, k]`, `b: [k, n]`.
pub(crate) fn matrix_mul(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    let size = m * n;

    let mut c = Vec::with_capacity(size);

    for idx in 0..size {
        let i = idx / n;
        let j = idx % n;

        let mut sum = 0.0;
        for di in 0..k {
            sum += a[(i * k) + di] * b[(di * n) + j];
        }
        c.push(sum);
    }

    c
}

pub(crate) fn transpose(a: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut t = vec![0.0; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            t[c * rows + r] = a[r * cols + c];
        }
    }
    t
}

pub(crate) fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "Lengths not equal");

    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

pub(crate) fn vertices_approx_eq(a: &[f32], b: &[f32], tolerance: f32) {
    let distance = euclidean_distance(a, b);
    assert!(
        distance < tolerance,
        "Distance not less than tolerance: {} < {} ",
        distance,
        tolerance
    );
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{matrix_mul, transpose};

    #[test]
    fn naive_matrix_mul_correctness() {
        let a = vec![1., 2., 6., 24., 120., 720.];
        let b = vec![1., 2., 6., 24., 120., 720.];
        // [3, 2] x [2, 3]
        let result = matrix_mul(&a, &b, 3, 3, 2);
        assert_eq!(
            result,
            &[49., 242., 1446., 582., 2892., 17316., 17400., 86640., 519120.]
        );
    }

    #[test]
    fn transpose_swaps_axes() {
        let a = vec![1., 2., 3., 4., 5., 6.];
        assert_eq!(transpose(&a, 2, 3), vec![1., 4., 2., 5., 3., 6.]);
    }
}
