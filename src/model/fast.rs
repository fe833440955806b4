//! Fast-path encoder.
//!
//! Same weights as [`StandardEncoder`], restructured for inference:
//! - Projection weights are transposed once at conversion to `[in, out]`, the
//!   layout the blocked GEMM kernel streams through row by row.
//! - Q, K and V come from one fused projection `[H, 3H]`, so the input is read
//!   once per layer and attention consumes the packed result in place.
//! - Attention runs blockwise with an online softmax and never allocates the
//!   `[heads, seq, seq]` probability matrix.
//! - The intermediate projection applies GELU inside the GEMM epilogue.
//! - No dropout state is touched in eval mode.

use super::bert::{residual_norm, StandardEncoder};
use rand::Rng;

use super::layers::{LayerNorm, Linear};
use super::ModuleState;
use crate::attention::encode_flash_attention;
use crate::datatype::Precision;
use crate::device::Device;
use crate::gemm::{gemm, Activation};
use crate::tensor::Tensor;
use crate::{assert_eq_result, Result};

/// Key/value columns visited per attention block.
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Linear layer with its weight stored `[in, out]`.
#[derive(Debug, Clone, PartialEq)]
struct PackedLinear {
    weight: Tensor<f32>,
    bias: Tensor<f32>,
}

impl PackedLinear {
    fn from_rows(rows: &[f32], bias: Vec<f32>, in_features: usize) -> Result<Self> {
        let out_features = bias.len();
        assert_eq_result!(
            rows.len(),
            out_features * in_features,
            "{} weights cannot form {} rows of {}",
            rows.len(),
            out_features,
            in_features
        );
        let mut packed = vec![0.0; rows.len()];
        for (o, row) in rows.chunks_exact(in_features).enumerate() {
            for (i, &w) in row.iter().enumerate() {
                packed[i * out_features + o] = w;
            }
        }
        Ok(PackedLinear {
            weight: Tensor::from_vec(packed, [in_features, out_features])?,
            bias: Tensor::from_vec(bias, [out_features])?,
        })
    }

    fn pack(linear: &Linear) -> Result<Self> {
        Self::from_rows(
            linear.weight.data(),
            linear.bias.data().to_vec(),
            linear.in_features(),
        )
    }

    /// Concatenates the outputs of `parts`, which share their input size.
    fn fuse(parts: [&Linear; 3]) -> Result<Self> {
        let in_features = parts[0].in_features();
        let mut rows = Vec::new();
        let mut bias = Vec::new();
        for part in parts {
            assert_eq_result!(
                part.in_features(),
                in_features,
                "cannot fuse projections over {} and {} inputs",
                in_features,
                part.in_features()
            );
            rows.extend_from_slice(part.weight.data());
            bias.extend_from_slice(part.bias.data());
        }
        Self::from_rows(&rows, bias, in_features)
    }

    fn forward(
        &self,
        x: &Tensor<f32>,
        act: Option<Activation>,
        device: Device,
    ) -> Result<Tensor<f32>> {
        gemm(device, x, &self.weight, false, Some(&self.bias), act)
    }

    fn round_to(&mut self, precision: Precision) {
        self.weight.round_to(precision);
        self.bias.round_to(precision);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FastEncoderLayer {
    qkv: PackedLinear,
    attention_output: PackedLinear,
    attention_norm: LayerNorm,
    intermediate: PackedLinear,
    output: PackedLinear,
    output_norm: LayerNorm,
}

impl FastEncoderLayer {
    fn forward<R: Rng + ?Sized>(
        &self,
        x: &Tensor<f32>,
        heads: usize,
        block_size: usize,
        state: &ModuleState,
        dropout_prob: f32,
        mut rng: Option<&mut R>,
    ) -> Result<Tensor<f32>> {
        let precision = state.precision;
        let device = state.device;

        let mut qkv = self.qkv.forward(x, None, device)?;
        qkv.round_to(precision);
        let mut context = encode_flash_attention(&qkv, heads, block_size)?;
        context.round_to(precision);
        let projected = self.attention_output.forward(&context, None, device)?;
        let attended = residual_norm(
            projected,
            x,
            &self.attention_norm,
            state,
            dropout_prob,
            rng.as_deref_mut(),
        )?;

        let mut inner = self.intermediate.forward(&attended, Some(Activation::Gelu), device)?;
        inner.round_to(precision);
        let projected = self.output.forward(&inner, None, device)?;
        residual_norm(projected, &attended, &self.output_norm, state, dropout_prob, rng)
    }

    fn round_to(&mut self, precision: Precision) {
        self.qkv.round_to(precision);
        self.attention_output.round_to(precision);
        self.attention_norm.round_to(precision);
        self.intermediate.round_to(precision);
        self.output.round_to(precision);
        self.output_norm.round_to(precision);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FastEncoder {
    layers: Vec<FastEncoderLayer>,
    num_heads: usize,
    hidden_dropout_prob: f32,
    block_size: usize,
    state: ModuleState,
}

impl FastEncoder {
    /// Repacks the weights of `encoder`. The new module starts in the default
    /// state regardless of the source's state.
    pub fn from_standard(encoder: &StandardEncoder) -> Result<Self> {
        let layers = encoder
            .layers
            .iter()
            .map(|l| {
                Ok(FastEncoderLayer {
                    qkv: PackedLinear::fuse([&l.query, &l.key, &l.value])?,
                    attention_output: PackedLinear::pack(&l.attention_output)?,
                    attention_norm: l.attention_norm.clone(),
                    intermediate: PackedLinear::pack(&l.intermediate)?,
                    output: PackedLinear::pack(&l.output)?,
                    output_norm: l.output_norm.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(layers = layers.len(), "converted encoder to fast path");
        Ok(FastEncoder {
            layers,
            num_heads: encoder.num_heads,
            hidden_dropout_prob: encoder.hidden_dropout_prob,
            block_size: DEFAULT_BLOCK_SIZE,
            state: ModuleState::default(),
        })
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub(crate) fn with_state(mut self, state: ModuleState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut ModuleState {
        &mut self.state
    }

    pub(crate) fn round_to(&mut self, precision: Precision) {
        for layer in &mut self.layers {
            layer.round_to(precision);
        }
    }

    pub fn forward(&self, hidden: Tensor<f32>, device: Device) -> Result<Tensor<f32>> {
        self.state.check_device(device)?;
        let mut rng = self.state.training.then(rand::thread_rng);
        let mut x = hidden;
        for layer in &self.layers {
            x = layer.forward(
                &x,
                self.num_heads,
                self.block_size,
                &self.state,
                self.hidden_dropout_prob,
                rng.as_mut(),
            )?;
        }
        Ok(x)
    }
}
