use crate::{Error, Result};

/// Hyper-parameters of a BERT-style encoder with a classification head.
#[derive(Debug, Clone, PartialEq)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    pub num_labels: usize,
    pub layer_norm_eps: f32,
    pub hidden_dropout_prob: f32,
    pub initializer_range: f32,
}

impl BertConfig {
    pub fn bert_base_cased() -> Self {
        BertConfig {
            vocab_size: 28996,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            num_labels: 2,
            layer_norm_eps: 1e-12,
            hidden_dropout_prob: 0.1,
            initializer_range: 0.02,
        }
    }

    pub fn bert_base_uncased() -> Self {
        BertConfig {
            vocab_size: 30522,
            ..Self::bert_base_cased()
        }
    }

    /// Two layers of width 32; small enough for unit tests.
    pub fn bert_tiny() -> Self {
        BertConfig {
            vocab_size: 25000,
            hidden_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            intermediate_size: 64,
            max_position_embeddings: 64,
            type_vocab_size: 2,
            num_labels: 2,
            layer_norm_eps: 1e-12,
            hidden_dropout_prob: 0.1,
            initializer_range: 0.02,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::Config(format!(
                "hidden size {} is not divisible by {} attention heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.vocab_size == 0 || self.num_labels == 0 || self.max_position_embeddings == 0 {
            return Err(Error::Config(
                "vocabulary, label and position counts must be non-zero".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.hidden_dropout_prob) {
            return Err(Error::Config(format!(
                "dropout probability {} is outside [0, 1)",
                self.hidden_dropout_prob
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::BertConfig;

    #[test]
    fn presets_are_valid() {
        BertConfig::bert_base_cased().validate().unwrap();
        BertConfig::bert_base_uncased().validate().unwrap();
        BertConfig::bert_tiny().validate().unwrap();
        assert_eq!(BertConfig::bert_base_cased().head_dim(), 64);
    }

    #[test]
    fn rejects_indivisible_heads() {
        let config = BertConfig {
            num_attention_heads: 5,
            ..BertConfig::bert_tiny()
        };
        assert!(config.validate().is_err());
    }
}
