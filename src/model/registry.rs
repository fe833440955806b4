use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::bert::BertForSequenceClassification;
use super::config::BertConfig;
use crate::{Error, Result};

const KNOWN_MODELS: &[(&str, fn() -> BertConfig)] = &[
    ("bert-base-cased", BertConfig::bert_base_cased),
    ("bert-base-uncased", BertConfig::bert_base_uncased),
    ("bert-tiny", BertConfig::bert_tiny),
];

static MODEL_CACHE: Lazy<Mutex<HashMap<String, Arc<BertForSequenceClassification>>>> =
    Lazy::new(|| Mutex::new(HashMap::default()));

pub fn available_models() -> Vec<&'static str> {
    KNOWN_MODELS.iter().map(|(id, _)| *id).collect()
}

pub fn config_for(model_id: &str) -> Result<BertConfig> {
    KNOWN_MODELS
        .iter()
        .find(|(id, _)| *id == model_id)
        .map(|(_, config)| config())
        .ok_or_else(|| Error::ModelNotFound {
            requested: model_id.to_string(),
            available: available_models(),
        })
}

/// Checkpoint seed derived from the identifier (FNV-1a), so every identifier
/// always materializes the same weights.
fn weight_seed(model_id: &str) -> u64 {
    model_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325, |h, b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3))
}

fn get_cached_model(model_id: &str) -> Option<Arc<BertForSequenceClassification>> {
    if let Ok(cache) = MODEL_CACHE.lock() {
        cache.get(model_id).cloned()
    } else {
        None
    }
}

fn cache_model(model_id: &str, model: Arc<BertForSequenceClassification>) {
    if let Ok(mut cache) = MODEL_CACHE.lock() {
        cache.insert(model_id.to_string(), model);
    }
}

/// Loads the classifier registered under `model_id`, in the default module
/// state (training mode, host device, f32).
pub fn from_pretrained(model_id: &str) -> Result<BertForSequenceClassification> {
    if let Some(model) = get_cached_model(model_id) {
        tracing::debug!(model_id, "model served from cache");
        return Ok((*model).clone());
    }

    let config = config_for(model_id)?;
    tracing::info!(
        model_id,
        layers = config.num_hidden_layers,
        hidden = config.hidden_size,
        head_dim = config.head_dim(),
        "materializing model weights"
    );
    let mut rng = StdRng::seed_from_u64(weight_seed(model_id));
    let model = Arc::new(BertForSequenceClassification::new_random(config, &mut rng)?);
    cache_model(model_id, model.clone());
    Ok((*model).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Precision;

    #[test]
    fn unknown_identifier_lists_alternatives() {
        match from_pretrained("gpt-17") {
            Err(Error::ModelNotFound {
                requested,
                available,
            }) => {
                assert_eq!(requested, "gpt-17");
                assert!(available.contains(&"bert-base-cased"));
            }
            other => panic!("expected ModelNotFound, got {other:?}"),
        }
    }

    #[test]
    fn same_identifier_loads_same_weights() {
        let a = from_pretrained("bert-tiny").unwrap();
        let b = from_pretrained("bert-tiny").unwrap();
        assert_eq!(a, b);
        assert!(a.state().training);
        assert_eq!(a.state().precision, Precision::F32);
    }

    #[test]
    fn cached_copy_is_not_affected_by_casts() {
        let half = from_pretrained("bert-tiny").unwrap().half();
        let fresh = from_pretrained("bert-tiny").unwrap();
        assert_ne!(half, fresh);
        assert_eq!(fresh.state().precision, Precision::F32);
    }

    #[test]
    fn seeds_differ_per_identifier() {
        assert_ne!(weight_seed("bert-base-cased"), weight_seed("bert-base-uncased"));
    }
}
