use crate::device::Device;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::{assert_eq_result, assert_result, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activation {
    Gelu,
    Tanh,
}

impl Activation {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Gelu => gelu(x),
            Activation::Tanh => x.tanh(),
        }
    }
}

/// Tanh approximation of GELU.
#[inline]
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    const COEFF: f32 = 0.044_715;
    let inner = SQRT_2_OVER_PI * (x + COEFF * x * x * x);
    0.5 * x * (1.0 + inner.tanh())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmParameters {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    /// `B` is stored `[n, k]` instead of `[k, n]`.
    pub transpose_b: bool,
    pub fused_bias: bool,
    pub fused_activation: Option<Activation>,
}

/// Rows of `A` sharing one pass over a block of `B`.
const ROW_BLOCK: usize = 4;
/// Rows of `B` (values of `k`) per block.
const K_BLOCK: usize = 16;

/// `C = act(A · B + bias)` with `A: [m, k]` and `bias: [n]`, run on `device`.
///
/// `B` is `[n, k]` when `transpose_b` is set (a linear layer's weight as
/// stored) and `[k, n]` otherwise. Every kernel accumulates each output over
/// `k` in increasing order starting from zero, then adds the bias, then
/// applies the activation, so the two layouts and fused or unfused calls give
/// bit-identical results on the host.
pub fn gemm(
    device: Device,
    a: &Tensor<f32>,
    b: &Tensor<f32>,
    transpose_b: bool,
    bias: Option<&Tensor<f32>>,
    fused_activation: Option<Activation>,
) -> Result<Tensor<f32>> {
    let (m, k) = a.shape().dims2()?;
    let (n, b_k) = if transpose_b {
        b.shape().dims2()?
    } else {
        let (b_k, n) = b.shape().dims2()?;
        (n, b_k)
    };

    assert_eq_result!(
        k,
        b_k,
        "K must be equal to B_K, but got K={} and B_K={}",
        k,
        b_k
    );
    assert_result!(m > 0, "M must be greater than 0");
    assert_result!(n > 0, "N must be greater than 0");
    assert_result!(k > 0, "K must be greater than 0");
    if let Some(d) = bias {
        assert_eq_result!(
            d.shape().dims(),
            &[n][..],
            "Bias tensor must have N={} entries, got shape {}",
            n,
            d.shape()
        );
    }

    let parameters = GemmParameters {
        m,
        n,
        k,
        transpose_b,
        fused_bias: bias.is_some(),
        fused_activation,
    };
    let bias = bias.map(|d| d.data());
    match device {
        Device::Cpu if transpose_b => Ok(encode_dot(a.data(), b.data(), bias, parameters)),
        Device::Cpu => Ok(encode_blocked(a.data(), b.data(), bias, parameters)),
        Device::Metal => encode_metal(a.data(), b.data(), bias, parameters),
    }
}

#[cfg(target_os = "macos")]
fn encode_metal(
    a: &[f32],
    b: &[f32],
    bias: Option<&[f32]>,
    p: GemmParameters,
) -> Result<Tensor<f32>> {
    crate::pipeline::with_context(|context| context.gemm(a, b, bias, p))
}

#[cfg(not(target_os = "macos"))]
fn encode_metal(
    _: &[f32],
    _: &[f32],
    _: Option<&[f32]>,
    _: GemmParameters,
) -> Result<Tensor<f32>> {
    Device::Metal.check_available()?;
    Err(crate::Error::Metal("no Metal backend on this platform".to_string()))
}

#[inline]
fn epilogue(out: &mut [f32], bias: Option<&[f32]>, act: Option<Activation>) {
    if let Some(d) = bias {
        for (v, b) in out.iter_mut().zip(d) {
            *v += b;
        }
    }
    if let Some(act) = act {
        for v in out.iter_mut() {
            *v = act.apply(*v);
        }
    }
}

/// Reference kernel over `B: [n, k]`: one dot product of two contiguous rows
/// per output element.
fn encode_dot(a: &[f32], b: &[f32], bias: Option<&[f32]>, p: GemmParameters) -> Tensor<f32> {
    let mut c = Tensor::<f32>::zeros(Shape::new(vec![p.m, p.n]));
    let out = c.data_mut();
    for i in 0..p.m {
        let a_row = &a[i * p.k..(i + 1) * p.k];
        let c_row = &mut out[i * p.n..(i + 1) * p.n];
        for (j, acc) in c_row.iter_mut().enumerate() {
            let b_row = &b[j * p.k..(j + 1) * p.k];
            let mut sum = 0.0f32;
            for (x, w) in a_row.iter().zip(b_row) {
                sum += x * w;
            }
            *acc = sum;
        }
        epilogue(c_row, bias, p.fused_activation);
    }
    c
}

/// Blocked kernel over `B: [k, n]`. Each step scales one contiguous row of `B`
/// into a row of `C`, which vectorizes across `n`; a block of `B` rows is
/// reused by `ROW_BLOCK` rows of `A` while it is in cache.
fn encode_blocked(a: &[f32], b: &[f32], bias: Option<&[f32]>, p: GemmParameters) -> Tensor<f32> {
    let mut c = Tensor::<f32>::zeros(Shape::new(vec![p.m, p.n]));
    let out = c.data_mut();
    for i0 in (0..p.m).step_by(ROW_BLOCK) {
        let i1 = (i0 + ROW_BLOCK).min(p.m);
        for k0 in (0..p.k).step_by(K_BLOCK) {
            let k1 = (k0 + K_BLOCK).min(p.k);
            for i in i0..i1 {
                let c_row = &mut out[i * p.n..(i + 1) * p.n];
                for kk in k0..k1 {
                    let x = a[i * p.k + kk];
                    let b_row = &b[kk * p.n..(kk + 1) * p.n];
                    for (acc, w) in c_row.iter_mut().zip(b_row) {
                        *acc += x * w;
                    }
                }
            }
        }
        for i in i0..i1 {
            epilogue(&mut out[i * p.n..(i + 1) * p.n], bias, p.fused_activation);
        }
    }
    c
}

/// Applies `act` element-wise in place.
pub fn activate(t: &mut Tensor<f32>, act: Activation) {
    for v in t.data_mut() {
        *v = act.apply(*v);
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::test_utils::{matrix_mul, transpose, vertices_approx_eq};

    #[test]
    fn correctness() {
        const M: usize = 7;
        const N: usize = 5;
        const K: usize = 11;
        const ITERATIONS: usize = 20;

        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..ITERATIONS {
            let a = Tensor::<f32>::random(&mut rng, [M, K], 0.0..1.0);
            let b = Tensor::<f32>::random(&mut rng, [N, K], 0.0..1.0);
            let c = gemm(Device::Cpu, &a, &b, true, None, None).expect("gemm failed");

            let expected = matrix_mul(&a.contents(), &transpose(&b.contents(), N, K), M, N, K);
            vertices_approx_eq(&c.contents(), &expected, 1e-4);
        }
    }

    #[test]
    fn layouts_are_bit_identical() {
        let mut rng = StdRng::seed_from_u64(5);
        for (m, n, k) in [(1, 1, 1), (3, 7, 5), (9, 33, 40), (25, 48, 17)] {
            let a = Tensor::<f32>::random(&mut rng, [m, k], -1.0..1.0);
            let b = Tensor::<f32>::random(&mut rng, [n, k], -1.0..1.0);
            let b_t = Tensor::from_vec(transpose(&b.contents(), n, k), [k, n]).unwrap();
            let bias = Tensor::<f32>::random(&mut rng, [n], -1.0..1.0);

            for act in [None, Some(Activation::Gelu), Some(Activation::Tanh)] {
                let dot = gemm(Device::Cpu, &a, &b, true, Some(&bias), act).unwrap();
                let blocked = gemm(Device::Cpu, &a, &b_t, false, Some(&bias), act).unwrap();
                assert_eq!(dot, blocked, "m={m} n={n} k={k} act={act:?}");
            }
        }
    }

    #[test]
    fn fused_bias_and_activation_match_separate_passes() {
        let mut rng = StdRng::seed_from_u64(4);
        let a = Tensor::<f32>::random(&mut rng, [3, 8], -1.0..1.0);
        let b = Tensor::<f32>::random(&mut rng, [6, 8], -1.0..1.0);
        let bias = Tensor::<f32>::random(&mut rng, [6], -1.0..1.0);

        let fused = gemm(Device::Cpu, &a, &b, true, Some(&bias), Some(Activation::Gelu)).unwrap();
        let mut separate = gemm(Device::Cpu, &a, &b, true, Some(&bias), None).unwrap();
        activate(&mut separate, Activation::Gelu);
        assert_eq!(fused, separate);
    }

    #[test]
    fn rejects_mismatched_inner_dimension() {
        let a = Tensor::<f32>::zeros([2, 3]);
        let b = Tensor::<f32>::zeros([4, 5]);
        assert!(gemm(Device::Cpu, &a, &b, true, None, None).is_err());
        assert!(gemm(Device::Cpu, &a, &b, false, None, None).is_err());
    }

    #[test]
    fn rejects_wrong_bias_length() {
        let a = Tensor::<f32>::zeros([2, 3]);
        let b = Tensor::<f32>::zeros([4, 3]);
        let bias = Tensor::<f32>::zeros([3]);
        assert!(gemm(Device::Cpu, &a, &b, true, Some(&bias), None).is_err());
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn metal_gemm_unavailable_off_macos() {
        let a = Tensor::<f32>::zeros([2, 3]);
        let b = Tensor::<f32>::zeros([4, 3]);
        assert!(matches!(
            gemm(Device::Metal, &a, &b, true, None, None),
            Err(crate::Error::DeviceUnavailable { .. })
        ));
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn metal_gemm_matches_host() {
        if Device::Metal.check_available().is_err() {
            return;
        }
        let mut rng = StdRng::seed_from_u64(6);
        let a = Tensor::<f32>::random(&mut rng, [5, 24], -1.0..1.0);
        let b = Tensor::<f32>::random(&mut rng, [10, 24], -1.0..1.0);
        let bias = Tensor::<f32>::random(&mut rng, [10], -1.0..1.0);
        let b_t = Tensor::from_vec(transpose(&b.contents(), 10, 24), [24, 10]).unwrap();
        let host = gemm(Device::Cpu, &a, &b, true, Some(&bias), Some(Activation::Gelu)).unwrap();
        let metal = gemm(Device::Metal, &a, &b, true, Some(&bias), Some(Activation::Gelu)).unwrap();
        vertices_approx_eq(&metal.contents(), &host.contents(), 1e-4);
        let packed = gemm(Device::Metal, &a, &b_t, false, Some(&bias), Some(Activation::Gelu)).unwrap();
        vertices_approx_eq(&packed.contents(), &host.contents(), 1e-4);
    }

    #[test]
    fn gelu_reference_points() {
        assert_eq!(gelu(0.0), 0.0);
        assert!((gelu(1.0) - 0.841_192).abs() < 1e-5);
        assert!(gelu(-10.0).abs() < 1e-6);
    }
}
