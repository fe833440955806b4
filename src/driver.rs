//! Baseline versus fast-path benchmark of a sequence classifier.

use std::fmt;
use std::ops::Range;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::bench::{benchmark_function, get_outputs};
use crate::compare::{numerical_test, NumericalReport, Tolerance};
use crate::datatype::Precision;
use crate::device::Device;
use crate::model::{self, BertForSequenceClassification, SequenceClassifier};
use crate::tensor::TokenBatch;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkConfig {
    /// Number of timed batches. Default 500.
    pub num_batches: usize,
    /// Sequences per batch. Default 1.
    pub batch_size: usize,
    /// Tokens per sequence. Default 25.
    pub seq_len: usize,
    /// Registry identifier. Default `bert-base-cased`.
    pub model_id: String,
    /// Default: the accelerator when present, else the host.
    pub device: Device,
    /// Reduced precision the model is cast to. Default f16.
    pub precision: Precision,
    /// Half-open range token ids are drawn from. Default `1..25000`.
    pub token_range: Range<u32>,
    /// Bound for the output comparison. Default `atol = 0`, `rtol = 1e-2`.
    pub tolerance: Tolerance,
    /// Seed for the synthetic inputs; `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        BenchmarkConfig {
            num_batches: 500,
            batch_size: 1,
            seq_len: 25,
            model_id: "bert-base-cased".to_string(),
            device: Device::preferred(),
            precision: Precision::F16,
            token_range: 1..25000,
            tolerance: Tolerance::new(0.0, 1e-2),
            seed: None,
        }
    }
}

impl BenchmarkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_num_batches(mut self, n: usize) -> Self {
        self.num_batches = n;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    #[must_use]
    pub fn with_seq_len(mut self, n: usize) -> Self {
        self.seq_len = n;
        self
    }

    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    #[must_use]
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    #[must_use]
    pub fn with_token_range(mut self, range: Range<u32>) -> Self {
        self.token_range = range;
        self
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_batches == 0 || self.batch_size == 0 || self.seq_len == 0 {
            return Err(Error::Config(format!(
                "num_batches, batch_size and seq_len must be non-zero, got {}, {}, {}",
                self.num_batches, self.batch_size, self.seq_len
            )));
        }
        if self.token_range.is_empty() {
            return Err(Error::Config(format!(
                "token range {:?} is empty",
                self.token_range
            )));
        }
        if self.tolerance.atol < 0.0 || self.tolerance.rtol < 0.0 {
            return Err(Error::Config(format!(
                "tolerances must be non-negative, got {:?}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkReport {
    /// Seconds per batch before the transform.
    pub baseline: f64,
    /// Seconds per batch after the transform.
    pub fast_path: f64,
    pub numerical: NumericalReport,
}

impl BenchmarkReport {
    pub fn speedup(&self) -> f64 {
        self.baseline / self.fast_path
    }
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HF time per batch {}", self.baseline)?;
        writeln!(f, "BT time per batch {}", self.fast_path)?;
        write!(f, "{}", self.numerical)
    }
}

/// Random token batches on the configured device.
pub fn synthesize_inputs(config: &BenchmarkConfig) -> Result<Vec<TokenBatch>> {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    (0..config.num_batches)
        .map(|_| {
            TokenBatch::random(
                &mut rng,
                config.batch_size,
                config.seq_len,
                config.token_range.clone(),
                config.device,
            )
        })
        .collect()
}

fn prepare(
    model: BertForSequenceClassification,
    config: &BenchmarkConfig,
) -> Result<BertForSequenceClassification> {
    Ok(model.eval().to(config.device)?.cast(config.precision))
}

fn measure<M: SequenceClassifier>(
    model: &M,
    inputs: &[TokenBatch],
    device: Device,
) -> Result<(f64, Vec<crate::tensor::Tensor<f32>>)> {
    let mut timer = device.timer()?;
    let per_batch = benchmark_function(timer.as_mut(), |x| model.forward(x), inputs)?;
    let outputs = get_outputs(model, inputs)?;
    Ok((per_batch, outputs))
}

pub fn run_benchmark(config: &BenchmarkConfig) -> Result<BenchmarkReport> {
    config.validate()?;
    config.device.check_available()?;

    let span = tracing::info_span!("benchmark", model = %config.model_id, device = %config.device);
    let _enter = span.enter();

    let model = prepare(model::from_pretrained(&config.model_id)?, config)?;
    let inputs = synthesize_inputs(config)?;
    tracing::debug!(
        batches = inputs.len(),
        batch_size = config.batch_size,
        seq_len = config.seq_len,
        "synthesized inputs"
    );

    let (baseline, baseline_outputs) = measure(&model, &inputs, config.device)?;
    tracing::info!(seconds_per_batch = baseline, "baseline measured");

    let mut model = model;
    model.encoder = model.encoder.to_fast()?;
    // The new encoder does not inherit mode, placement or precision.
    let model = prepare(model, config)?;

    let (fast_path, fast_outputs) = measure(&model, &inputs, config.device)?;
    tracing::info!(seconds_per_batch = fast_path, "fast path measured");

    // The fast-path outputs are the reference side of the relative bound.
    let numerical = numerical_test(&baseline_outputs, &fast_outputs, config.tolerance);
    let report = BenchmarkReport {
        baseline,
        fast_path,
        numerical,
    };
    tracing::info!(speedup = report.speedup(), "benchmark finished");
    Ok(report)
}
