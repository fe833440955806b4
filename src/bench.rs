use std::hint::black_box;

use crate::model::SequenceClassifier;
use crate::tensor::{Tensor, TokenBatch};
use crate::timer::Timer;
use crate::{Error, Result};

/// Average seconds per call of `f` over `inputs`.
///
/// The first input is run once untimed to absorb lazy initialization; then the
/// whole sequence is timed in one region by `timer`.
pub fn benchmark_function<I, O, F>(timer: &mut dyn Timer, mut f: F, inputs: &[I]) -> Result<f64>
where
    F: FnMut(&I) -> Result<O>,
{
    let first = inputs.first().ok_or(Error::EmptyInput)?;
    black_box(f(first)?);

    timer.start()?;
    for x in inputs {
        black_box(f(x)?);
    }
    let elapsed = timer.stop()?;

    let per_call = elapsed.as_secs_f64() / inputs.len() as f64;
    tracing::debug!(
        timer = timer.name(),
        calls = inputs.len(),
        total_s = elapsed.as_secs_f64(),
        per_call_s = per_call,
        "benchmark finished"
    );
    Ok(per_call)
}

/// Logits of `model` for every input, in order.
pub fn get_outputs<M: SequenceClassifier + ?Sized>(
    model: &M,
    inputs: &[TokenBatch],
) -> Result<Vec<Tensor<f32>>> {
    inputs
        .iter()
        .map(|x| model.forward(x).map(|out| out.logits))
        .collect()
}
