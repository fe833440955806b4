use rand::Rng;

use super::config::BertConfig;
use super::fast::FastEncoder;
use super::layers::{dropout, init_range, LayerNorm, Linear};
use super::{ClassifierOutput, ModuleState, SequenceClassifier};
use crate::attention::encode_attention;
use crate::datatype::Precision;
use crate::device::Device;
use crate::gemm::{activate, Activation};
use crate::tensor::{Tensor, TokenBatch};
use crate::{assert_result, Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Embeddings {
    word: Tensor<f32>,
    position: Tensor<f32>,
    token_type: Tensor<f32>,
    norm: LayerNorm,
}

impl Embeddings {
    fn random<R: Rng + ?Sized>(rng: &mut R, config: &BertConfig) -> Self {
        let range = init_range(config.initializer_range);
        let hidden = config.hidden_size;
        Embeddings {
            word: Tensor::random(rng, [config.vocab_size, hidden], range.clone()),
            position: Tensor::random(rng, [config.max_position_embeddings, hidden], range.clone()),
            token_type: Tensor::random(rng, [config.type_vocab_size, hidden], range),
            norm: LayerNorm::new(hidden, config.layer_norm_eps),
        }
    }

    /// Word + position + segment-0 embeddings of one sequence, normalized.
    fn forward(&self, ids: &[u32]) -> Result<Tensor<f32>> {
        let (vocab_size, hidden) = self.word.shape().dims2()?;
        let (max_positions, _) = self.position.shape().dims2()?;
        assert_result!(
            ids.len() <= max_positions,
            "sequence of {} tokens exceeds {} positions",
            ids.len(),
            max_positions
        );

        let segment = self.token_type.row(0)?;
        let mut x = Tensor::<f32>::zeros([ids.len(), hidden]);
        for (i, &id) in ids.iter().enumerate() {
            if id as usize >= vocab_size {
                return Err(Error::TokenOutOfRange {
                    token: id,
                    vocab_size,
                });
            }
            let word = self.word.row(id as usize)?;
            let position = self.position.row(i)?;
            let out = &mut x.data_mut()[i * hidden..(i + 1) * hidden];
            for (j, v) in out.iter_mut().enumerate() {
                *v = word[j] + position[j] + segment[j];
            }
        }
        self.norm.forward(&x)
    }

    fn round_to(&mut self, precision: Precision) {
        self.word.round_to(precision);
        self.position.round_to(precision);
        self.token_type.round_to(precision);
        self.norm.round_to(precision);
    }
}

/// `norm(dropout(projected) + residual)`, rounded to the module precision.
/// Dropout is applied only when an rng is given, which is the case in
/// training mode.
pub(crate) fn residual_norm<R: Rng + ?Sized>(
    mut projected: Tensor<f32>,
    residual: &Tensor<f32>,
    norm: &LayerNorm,
    state: &ModuleState,
    dropout_prob: f32,
    rng: Option<&mut R>,
) -> Result<Tensor<f32>> {
    if let Some(rng) = rng {
        dropout(&mut projected, dropout_prob, rng);
    }
    projected.add_assign(residual)?;
    let mut out = norm.forward(&projected)?;
    out.round_to(state.precision);
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderLayer {
    pub query: Linear,
    pub key: Linear,
    pub value: Linear,
    pub attention_output: Linear,
    pub attention_norm: LayerNorm,
    pub intermediate: Linear,
    pub output: Linear,
    pub output_norm: LayerNorm,
}

impl EncoderLayer {
    fn random<R: Rng + ?Sized>(rng: &mut R, config: &BertConfig) -> Self {
        let hidden = config.hidden_size;
        let std = config.initializer_range;
        EncoderLayer {
            query: Linear::random(rng, hidden, hidden, std),
            key: Linear::random(rng, hidden, hidden, std),
            value: Linear::random(rng, hidden, hidden, std),
            attention_output: Linear::random(rng, hidden, hidden, std),
            attention_norm: LayerNorm::new(hidden, config.layer_norm_eps),
            intermediate: Linear::random(rng, hidden, config.intermediate_size, std),
            output: Linear::random(rng, config.intermediate_size, hidden, std),
            output_norm: LayerNorm::new(hidden, config.layer_norm_eps),
        }
    }

    fn forward<R: Rng + ?Sized>(
        &self,
        x: &Tensor<f32>,
        heads: usize,
        state: &ModuleState,
        dropout_prob: f32,
        mut rng: Option<&mut R>,
    ) -> Result<Tensor<f32>> {
        let precision = state.precision;
        let device = state.device;

        let mut q = self.query.forward(x, device)?;
        let mut k = self.key.forward(x, device)?;
        let mut v = self.value.forward(x, device)?;
        q.round_to(precision);
        k.round_to(precision);
        v.round_to(precision);

        let mut context = encode_attention(&q, &k, &v, heads)?;
        context.round_to(precision);
        let projected = self.attention_output.forward(&context, device)?;
        let attended = residual_norm(
            projected,
            x,
            &self.attention_norm,
            state,
            dropout_prob,
            rng.as_deref_mut(),
        )?;

        let mut inner = self.intermediate.forward(&attended, device)?;
        activate(&mut inner, Activation::Gelu);
        inner.round_to(precision);
        let projected = self.output.forward(&inner, device)?;
        residual_norm(projected, &attended, &self.output_norm, state, dropout_prob, rng)
    }

    fn round_to(&mut self, precision: Precision) {
        for linear in [
            &mut self.query,
            &mut self.key,
            &mut self.value,
            &mut self.attention_output,
            &mut self.intermediate,
            &mut self.output,
        ] {
            linear.round_to(precision);
        }
        self.attention_norm.round_to(precision);
        self.output_norm.round_to(precision);
    }
}

/// Reference encoder: separate Q/K/V projections and fully materialized
/// attention probabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardEncoder {
    pub layers: Vec<EncoderLayer>,
    pub num_heads: usize,
    pub hidden_dropout_prob: f32,
    state: ModuleState,
}

impl StandardEncoder {
    fn random<R: Rng + ?Sized>(rng: &mut R, config: &BertConfig) -> Self {
        StandardEncoder {
            layers: (0..config.num_hidden_layers)
                .map(|_| EncoderLayer::random(rng, config))
                .collect(),
            num_heads: config.num_attention_heads,
            hidden_dropout_prob: config.hidden_dropout_prob,
            state: ModuleState::default(),
        }
    }

    fn forward(&self, hidden: Tensor<f32>, device: Device) -> Result<Tensor<f32>> {
        self.state.check_device(device)?;
        let mut rng = self.state.training.then(rand::thread_rng);
        let mut x = hidden;
        for layer in &self.layers {
            x = layer.forward(
                &x,
                self.num_heads,
                &self.state,
                self.hidden_dropout_prob,
                rng.as_mut(),
            )?;
        }
        Ok(x)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Encoder {
    Standard(StandardEncoder),
    Fast(FastEncoder),
}

impl Encoder {
    pub fn forward(&self, hidden: Tensor<f32>, device: Device) -> Result<Tensor<f32>> {
        match self {
            Encoder::Standard(e) => e.forward(hidden, device),
            Encoder::Fast(e) => e.forward(hidden, device),
        }
    }

    /// Builds the fast-path version of this encoder.
    ///
    /// The result carries the same weights but the default module state
    /// (training mode, host device, f32); callers re-apply their settings.
    pub fn to_fast(&self) -> Result<Encoder> {
        Ok(match self {
            Encoder::Standard(e) => Encoder::Fast(FastEncoder::from_standard(e)?),
            Encoder::Fast(e) => Encoder::Fast(e.clone().with_state(ModuleState::default())),
        })
    }

    pub fn is_fast(&self) -> bool {
        matches!(self, Encoder::Fast(_))
    }

    pub fn state(&self) -> ModuleState {
        match self {
            Encoder::Standard(e) => e.state,
            Encoder::Fast(e) => e.state(),
        }
    }

    fn state_mut(&mut self) -> &mut ModuleState {
        match self {
            Encoder::Standard(e) => &mut e.state,
            Encoder::Fast(e) => e.state_mut(),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.state_mut().training = training;
    }

    pub fn set_device(&mut self, device: Device) {
        self.state_mut().device = device;
    }

    pub fn cast(&mut self, precision: Precision) {
        match self {
            Encoder::Standard(e) => e.layers.iter_mut().for_each(|l| l.round_to(precision)),
            Encoder::Fast(e) => e.round_to(precision),
        }
        self.state_mut().precision = precision;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BertForSequenceClassification {
    config: BertConfig,
    embeddings: Embeddings,
    pub encoder: Encoder,
    pooler: Linear,
    classifier: Linear,
    state: ModuleState,
}

impl BertForSequenceClassification {
    /// A model with weights drawn from `rng`, in the default module state.
    pub fn new_random<R: Rng + ?Sized>(config: BertConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size;
        let std = config.initializer_range;
        Ok(BertForSequenceClassification {
            embeddings: Embeddings::random(rng, &config),
            encoder: Encoder::Standard(StandardEncoder::random(rng, &config)),
            pooler: Linear::random(rng, hidden, hidden, std),
            classifier: Linear::random(rng, hidden, config.num_labels, std),
            state: ModuleState::default(),
            config,
        })
    }

    pub fn config(&self) -> &BertConfig {
        &self.config
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn eval(mut self) -> Self {
        self.state.training = false;
        self.encoder.set_training(false);
        self
    }

    pub fn train(mut self) -> Self {
        self.state.training = true;
        self.encoder.set_training(true);
        self
    }

    pub fn to(mut self, device: Device) -> Result<Self> {
        device.check_available()?;
        self.state.device = device;
        self.encoder.set_device(device);
        Ok(self)
    }

    /// Rounds every weight through `precision`; activations are rounded to it
    /// after each sub-layer from now on.
    pub fn cast(mut self, precision: Precision) -> Self {
        self.embeddings.round_to(precision);
        self.encoder.cast(precision);
        self.pooler.round_to(precision);
        self.classifier.round_to(precision);
        self.state.precision = precision;
        self
    }

    pub fn half(self) -> Self {
        self.cast(Precision::F16)
    }

    fn classify_sequence<R: Rng + ?Sized>(
        &self,
        ids: &[u32],
        device: Device,
        mut rng: Option<&mut R>,
    ) -> Result<Tensor<f32>> {
        let state = &self.state;
        let p = self.config.hidden_dropout_prob;

        let mut hidden = self.embeddings.forward(ids)?;
        hidden.round_to(state.precision);
        if let Some(rng) = rng.as_deref_mut() {
            dropout(&mut hidden, p, rng);
        }
        let hidden = self.encoder.forward(hidden, device)?;

        let first = Tensor::from_vec(hidden.row(0)?.to_vec(), [1, self.config.hidden_size])?;
        let mut pooled = self.pooler.forward_activated(&first, Activation::Tanh, device)?;
        pooled.round_to(state.precision);
        if let Some(rng) = rng {
            dropout(&mut pooled, p, rng);
        }
        let mut logits = self.classifier.forward(&pooled, device)?;
        logits.round_to(state.precision);
        Ok(logits)
    }
}

impl SequenceClassifier for BertForSequenceClassification {
    fn forward(&self, input: &TokenBatch) -> Result<ClassifierOutput> {
        self.state.check_device(input.device())?;
        let mut rng = self.state.training.then(rand::thread_rng);
        let labels = self.config.num_labels;

        let mut logits = Vec::with_capacity(input.batch_size() * labels);
        for b in 0..input.batch_size() {
            let row = self.classify_sequence(input.sequence(b), input.device(), rng.as_mut())?;
            logits.extend_from_slice(row.data());
        }
        Ok(ClassifierOutput {
            logits: Tensor::from_vec(logits, [input.batch_size(), labels])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn tiny() -> BertForSequenceClassification {
        let mut rng = StdRng::seed_from_u64(42);
        BertForSequenceClassification::new_random(BertConfig::bert_tiny(), &mut rng).unwrap()
    }

    fn batch(seed: u64, batch_size: usize, seq_len: usize) -> TokenBatch {
        let mut rng = StdRng::seed_from_u64(seed);
        TokenBatch::random(&mut rng, batch_size, seq_len, 1..25000, Device::Cpu).unwrap()
    }

    #[test]
    fn logits_have_batch_by_labels_shape() {
        let model = tiny().eval();
        let out = model.forward(&batch(1, 3, 10)).unwrap();
        assert_eq!(out.logits.shape().dims(), &[3, 2]);
        assert!(out.logits.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn eval_mode_is_deterministic() {
        let model = tiny().eval();
        let input = batch(2, 2, 8);
        assert_eq!(model.forward(&input).unwrap(), model.forward(&input).unwrap());
    }

    #[test]
    fn train_mode_applies_dropout() {
        let model = tiny().train();
        let input = batch(3, 1, 16);
        let a = model.forward(&input).unwrap();
        let b = model.forward(&input).unwrap();
        let c = model.forward(&input).unwrap();
        assert!(a != b || b != c);
    }

    #[test]
    fn half_rounds_logits_to_f16() {
        let model = tiny().eval().half();
        assert_eq!(model.state().precision, Precision::F16);
        let out = model.forward(&batch(4, 1, 5)).unwrap();
        for &v in out.logits.data() {
            assert_eq!(Precision::F16.round(v), v);
        }
    }

    #[test]
    fn token_outside_vocabulary_is_rejected() {
        let model = tiny().eval();
        let input = TokenBatch::new(vec![1, 30000], 1, 2, Device::Cpu).unwrap();
        assert!(matches!(
            model.forward(&input),
            Err(Error::TokenOutOfRange { token: 30000, .. })
        ));
    }

    #[test]
    fn sequence_longer_than_positions_is_rejected() {
        let model = tiny().eval();
        assert!(model.forward(&batch(5, 1, 65)).is_err());
    }

    #[test]
    fn input_on_other_device_is_rejected() {
        let model = tiny().eval();
        let input = batch(6, 1, 4).to(Device::Metal);
        assert!(matches!(
            model.forward(&input),
            Err(Error::DeviceMismatch { input: Device::Metal, module: Device::Cpu })
        ));
    }

    #[test]
    fn to_fast_resets_encoder_state() {
        let mut model = tiny().eval().half();
        assert!(!model.encoder.state().training);
        model.encoder = model.encoder.to_fast().unwrap();
        assert!(model.encoder.is_fast());
        assert_eq!(model.encoder.state(), ModuleState::default());

        let model = model.eval().cast(Precision::F16);
        let state = model.encoder.state();
        assert!(!state.training);
        assert_eq!(state.precision, Precision::F16);
    }
}
