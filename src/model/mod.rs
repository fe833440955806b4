//! BERT-style sequence classifier with a swappable encoder.
//!
//! The model keeps a [`ModuleState`] per sub-module, as a framework module
//! tree does: `eval`, `to` and `cast` on the model propagate to every child,
//! but an encoder produced by [`Encoder::to_fast`] starts from the default
//! state and has to be configured again.

pub mod bert;
pub mod config;
pub mod fast;
pub mod layers;
pub mod registry;

pub use bert::{BertForSequenceClassification, Encoder, StandardEncoder};
pub use config::BertConfig;
pub use fast::FastEncoder;
pub use registry::{available_models, from_pretrained};

use crate::datatype::Precision;
use crate::device::Device;
use crate::tensor::{Tensor, TokenBatch};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierOutput {
    /// `[batch_size, num_labels]`
    pub logits: Tensor<f32>,
}

pub trait SequenceClassifier {
    fn forward(&self, input: &TokenBatch) -> Result<ClassifierOutput>;
}

/// Mode, placement and precision of one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleState {
    pub training: bool,
    pub device: Device,
    pub precision: Precision,
}

impl Default for ModuleState {
    fn default() -> Self {
        ModuleState {
            training: true,
            device: Device::Cpu,
            precision: Precision::F32,
        }
    }
}

impl ModuleState {
    pub(crate) fn check_device(&self, input: Device) -> Result<()> {
        if input != self.device {
            return Err(Error::DeviceMismatch {
                input,
                module: self.device,
            });
        }
        Ok(())
    }
}
