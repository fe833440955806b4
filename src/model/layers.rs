use rand::distributions::{Bernoulli, Distribution};
use rand::Rng;

use crate::datatype::Precision;
use crate::device::Device;
use crate::gemm::{gemm, Activation};
use crate::tensor::Tensor;
use crate::{assert_eq_result, Result};

/// Uniform range with standard deviation `std`.
pub(crate) fn init_range(std: f32) -> std::ops::Range<f32> {
    let half_width = std * 3f32.sqrt();
    -half_width..half_width
}

/// `y = x · Wᵀ + b` with `W: [out, in]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    pub weight: Tensor<f32>,
    pub bias: Tensor<f32>,
}

impl Linear {
    pub fn new(weight: Tensor<f32>, bias: Tensor<f32>) -> Result<Self> {
        let (out, _) = weight.shape().dims2()?;
        assert_eq_result!(
            bias.shape().dims(),
            &[out][..],
            "bias shape {} does not match {} outputs",
            bias.shape(),
            out
        );
        Ok(Linear { weight, bias })
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R, in_features: usize, out_features: usize, std: f32) -> Self {
        Linear {
            weight: Tensor::random(rng, [out_features, in_features], init_range(std)),
            bias: Tensor::zeros([out_features]),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape().dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape().dims()[0]
    }

    pub fn forward(&self, x: &Tensor<f32>, device: Device) -> Result<Tensor<f32>> {
        gemm(device, x, &self.weight, true, Some(&self.bias), None)
    }

    pub fn forward_activated(
        &self,
        x: &Tensor<f32>,
        act: Activation,
        device: Device,
    ) -> Result<Tensor<f32>> {
        gemm(device, x, &self.weight, true, Some(&self.bias), Some(act))
    }

    pub fn round_to(&mut self, precision: Precision) {
        self.weight.round_to(precision);
        self.bias.round_to(precision);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerNorm {
    pub gamma: Tensor<f32>,
    pub beta: Tensor<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(dim: usize, eps: f32) -> Self {
        LayerNorm {
            gamma: Tensor::full([dim], 1.0),
            beta: Tensor::zeros([dim]),
            eps,
        }
    }

    /// Normalizes every row of `x: [rows, dim]`.
    pub fn forward(&self, x: &Tensor<f32>) -> Result<Tensor<f32>> {
        let (rows, dim) = x.shape().dims2()?;
        assert_eq_result!(
            dim,
            self.gamma.count(),
            "LayerNorm over {} features applied to rows of {}",
            self.gamma.count(),
            dim
        );
        let gamma = self.gamma.data();
        let beta = self.beta.data();

        let mut out = x.clone();
        for r in 0..rows {
            let row = &mut out.data_mut()[r * dim..(r + 1) * dim];
            let mean = row.iter().sum::<f32>() / dim as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / dim as f32;
            let inv_std = 1.0 / (var + self.eps).sqrt();
            for ((v, g), b) in row.iter_mut().zip(gamma).zip(beta) {
                *v = (*v - mean) * inv_std * g + b;
            }
        }
        Ok(out)
    }

    pub fn round_to(&mut self, precision: Precision) {
        self.gamma.round_to(precision);
        self.beta.round_to(precision);
    }
}

/// Inverted dropout: zeroes each element with probability `p` and scales the
/// survivors by `1 / (1 - p)`. A no-op for `p == 0`.
pub fn dropout<R: Rng + ?Sized>(x: &mut Tensor<f32>, p: f32, rng: &mut R) {
    if p <= 0.0 {
        return;
    }
    let Ok(mask) = Bernoulli::new(p as f64) else {
        return;
    };
    let keep_scale = 1.0 / (1.0 - p);
    for v in x.data_mut() {
        *v = if mask.sample(rng) { 0.0 } else { *v * keep_scale };
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn layer_norm_zero_mean_unit_variance() {
        let norm = LayerNorm::new(4, 1e-12);
        let x = Tensor::<f32>::from_vec(vec![1., 2., 3., 4., 10., 10., 10., 10.], [2, 4]).unwrap();
        let y = norm.forward(&x).unwrap();
        let row = y.row(0).unwrap();
        assert!(row.iter().sum::<f32>().abs() < 1e-5);
        let var = row.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!((var - 1.0).abs() < 1e-4);
        // A constant row normalizes to beta.
        assert!(y.row(1).unwrap().iter().all(|v| v.abs() < 1e-3));
    }

    #[test]
    fn linear_checks_bias_shape() {
        assert!(Linear::new(Tensor::zeros([3, 2]), Tensor::zeros([3])).is_ok());
        assert!(Linear::new(Tensor::zeros([3, 2]), Tensor::zeros([2])).is_err());
    }

    #[test]
    fn linear_random_has_requested_geometry() {
        let mut rng = StdRng::seed_from_u64(0);
        let l = Linear::random(&mut rng, 8, 3, 0.02);
        assert_eq!((l.in_features(), l.out_features()), (8, 3));
        let bound = init_range(0.02).end;
        assert!(l.weight.data().iter().all(|w| w.abs() <= bound));
    }

    #[test]
    fn linear_forward_adds_bias_per_output() {
        let weight = Tensor::<f32>::from_vec(vec![1., 0., 0., 1., 1., 1.], [3, 2]).unwrap();
        let bias = Tensor::<f32>::from_vec(vec![0.5, -0.5, 0.0], [3]).unwrap();
        let l = Linear::new(weight, bias).unwrap();
        let x = Tensor::<f32>::from_vec(vec![2., 3.], [1, 2]).unwrap();
        let y = l.forward(&x, Device::Cpu).unwrap();
        assert_eq!(y.data(), &[2.5, 2.5, 5.0]);
        let y = l.forward_activated(&x, Activation::Tanh, Device::Cpu).unwrap();
        assert_eq!(y.data(), &[2.5f32.tanh(), 2.5f32.tanh(), 5f32.tanh()]);
    }

    #[test]
    fn dropout_zero_probability_is_identity() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut x = Tensor::<f32>::full([16], 2.0);
        dropout(&mut x, 0.0, &mut rng);
        assert!(x.data().iter().all(|&v| v == 2.0));
    }

    #[test]
    fn dropout_scales_survivors() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut x = Tensor::<f32>::full([1000], 1.0);
        dropout(&mut x, 0.5, &mut rng);
        assert!(x.data().iter().all(|&v| v == 0.0 || v == 2.0));
        let dropped = x.data().iter().filter(|&&v| v == 0.0).count();
        assert!(dropped > 350 && dropped < 650);
    }
}
