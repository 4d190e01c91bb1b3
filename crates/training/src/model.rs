//! The model seam the trainer drives, plus an encoder-decoder implementation
//! backed by `candle-transformers`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::marian;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{config::ModelSourceConfig, error::to_runtime_error, TrainingError};

pub const CONFIG_FILENAME: &str = "config.json";
pub const WEIGHTS_FILENAME: &str = "model.safetensors";

/// Encoder-decoder language model as seen by the training loop.
pub trait Seq2SeqModel: Send {
    /// Returns decoder logits `(batch, target_len, vocab)`.
    fn forward(
        &mut self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
    ) -> Result<Tensor, TrainingError>;

    /// Trainable parameters sorted by name, so every replica enumerates them
    /// in the same order.
    fn parameters(&self) -> Vec<(String, Var)>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Writes `config.json` and `model.safetensors` into `dir` and returns the
    /// written paths.
    fn save_pretrained(&self, dir: &Path) -> Result<Vec<PathBuf>, TrainingError>;

    fn parameter_count(&self) -> usize {
        self.parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }
}

/// Architecture hyperparameters, using the Hugging Face BART field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BartConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default)]
    pub decoder_vocab_size: Option<usize>,
    #[serde(default = "default_d_model")]
    pub d_model: usize,
    #[serde(default = "default_layers")]
    pub encoder_layers: usize,
    #[serde(default = "default_layers")]
    pub decoder_layers: usize,
    #[serde(default = "default_heads")]
    pub encoder_attention_heads: usize,
    #[serde(default = "default_heads")]
    pub decoder_attention_heads: usize,
    #[serde(default = "default_ffn_dim")]
    pub encoder_ffn_dim: usize,
    #[serde(default = "default_ffn_dim")]
    pub decoder_ffn_dim: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_activation")]
    pub activation_function: String,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
    #[serde(default = "default_decoder_start_token_id")]
    pub decoder_start_token_id: u32,
    #[serde(default)]
    pub forced_eos_token_id: Option<u32>,
    #[serde(default)]
    pub scale_embedding: bool,
}

impl Default for BartConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            decoder_vocab_size: None,
            d_model: default_d_model(),
            encoder_layers: default_layers(),
            decoder_layers: default_layers(),
            encoder_attention_heads: default_heads(),
            decoder_attention_heads: default_heads(),
            encoder_ffn_dim: default_ffn_dim(),
            decoder_ffn_dim: default_ffn_dim(),
            max_position_embeddings: default_max_position_embeddings(),
            activation_function: default_activation(),
            pad_token_id: 0,
            eos_token_id: default_eos_token_id(),
            decoder_start_token_id: default_decoder_start_token_id(),
            forced_eos_token_id: None,
            scale_embedding: false,
        }
    }
}

impl BartConfig {
    pub fn from_file(path: &Path) -> Result<Self, TrainingError> {
        let contents = fs::read_to_string(path)?;
        let config: BartConfig = serde_json::from_str(&contents).map_err(|err| {
            TrainingError::ConfigFormat(format!("{}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();
        if self.vocab_size == 0 || self.d_model == 0 {
            errors.push("vocab_size and d_model must be greater than 0".to_string());
        }
        for (label, heads) in [
            ("encoder_attention_heads", self.encoder_attention_heads),
            ("decoder_attention_heads", self.decoder_attention_heads),
        ] {
            if heads == 0 || self.d_model % heads != 0 {
                errors.push(format!(
                    "{label} ({heads}) must evenly divide d_model ({})",
                    self.d_model
                ));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }

    fn to_marian(&self) -> Result<marian::Config, TrainingError> {
        let value = serde_json::json!({
            "vocab_size": self.vocab_size,
            "decoder_vocab_size": self.decoder_vocab_size,
            "max_position_embeddings": self.max_position_embeddings,
            "encoder_layers": self.encoder_layers,
            "encoder_ffn_dim": self.encoder_ffn_dim,
            "encoder_attention_heads": self.encoder_attention_heads,
            "decoder_layers": self.decoder_layers,
            "decoder_ffn_dim": self.decoder_ffn_dim,
            "decoder_attention_heads": self.decoder_attention_heads,
            "use_cache": false,
            "is_encoder_decoder": true,
            "activation_function": self.activation_function,
            "d_model": self.d_model,
            "decoder_start_token_id": self.decoder_start_token_id,
            "scale_embedding": self.scale_embedding,
            "pad_token_id": self.pad_token_id,
            "eos_token_id": self.eos_token_id,
            "forced_eos_token_id": self.forced_eos_token_id.unwrap_or(self.eos_token_id),
            "share_encoder_decoder_embeddings": true,
        });
        serde_json::from_value(value).map_err(|err| {
            TrainingError::initialization(format!("unsupported model configuration: {err}"))
        })
    }
}

/// Encoder-decoder transformer whose weights live in a [`VarMap`].
///
/// The underlying encoder takes no padding mask, so padded encoder states are
/// zeroed before the decoder's cross-attention sees them.
pub struct MarianSeq2Seq {
    config: BartConfig,
    varmap: VarMap,
    model: marian::MTModel,
    training: bool,
}

impl MarianSeq2Seq {
    pub fn new(config: BartConfig, device: &Device) -> Result<Self, TrainingError> {
        config.validate()?;
        let marian_config = config.to_marian()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = marian::MTModel::new(&marian_config, vb).map_err(|err| {
            TrainingError::initialization(format!("failed to build model: {err}"))
        })?;
        Ok(Self {
            config,
            varmap,
            model,
            training: true,
        })
    }

    /// Loads a directory previously written by [`Seq2SeqModel::save_pretrained`].
    pub fn from_pretrained(dir: &Path, device: &Device) -> Result<Self, TrainingError> {
        let config = BartConfig::from_file(&dir.join(CONFIG_FILENAME))?;
        let mut model = Self::new(config, device)?;
        let weights = dir.join(WEIGHTS_FILENAME);
        model.varmap.load(&weights).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to load weights from {}: {err}",
                weights.display()
            ))
        })?;
        Ok(model)
    }

    pub fn config(&self) -> &BartConfig {
        &self.config
    }
}

impl Seq2SeqModel for MarianSeq2Seq {
    fn forward(
        &mut self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        self.model.reset_kv_cache();
        let encoded = self
            .model
            .encoder()
            .forward(input_ids, 0)
            .map_err(to_runtime_error)?;
        let keep = attention_mask
            .to_dtype(encoded.dtype())
            .and_then(|mask| mask.unsqueeze(2))
            .map_err(to_runtime_error)?;
        let encoded = encoded.broadcast_mul(&keep).map_err(to_runtime_error)?;
        let logits = self
            .model
            .decode(decoder_input_ids, &encoded, 0)
            .map_err(to_runtime_error);
        self.model.reset_kv_cache();
        logits
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        let vars = match self.varmap.data().lock() {
            Ok(vars) => vars,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut named: Vec<(String, Var)> = vars
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn save_pretrained(&self, dir: &Path) -> Result<Vec<PathBuf>, TrainingError> {
        fs::create_dir_all(dir)?;
        let config_path = dir.join(CONFIG_FILENAME);
        let json = serde_json::to_vec_pretty(&self.config)
            .map_err(|err| TrainingError::runtime(format!("failed to serialize config: {err}")))?;
        fs::write(&config_path, json)?;

        let weights_path = dir.join(WEIGHTS_FILENAME);
        self.varmap.save(&weights_path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to write weights to {}: {err}",
                weights_path.display()
            ))
        })?;
        Ok(vec![config_path, weights_path])
    }
}

/// Builds the model named by the configuration on `device`.
pub fn build_model(
    source: &ModelSourceConfig,
    device: &Device,
) -> Result<MarianSeq2Seq, TrainingError> {
    let model = match (&source.pretrained_model, &source.model_config) {
        (Some(dir), _) => {
            info!(path = %dir.display(), "loading pretrained model");
            MarianSeq2Seq::from_pretrained(dir, device)?
        }
        (None, Some(config_path)) => {
            info!(path = %config_path.display(), "initializing model from config");
            MarianSeq2Seq::new(BartConfig::from_file(config_path)?, device)?
        }
        (None, None) => {
            return Err(TrainingError::initialization(
                "no pretrained model or model config supplied",
            ))
        }
    };
    Ok(model)
}

fn default_vocab_size() -> usize {
    50265
}

fn default_d_model() -> usize {
    768
}

fn default_layers() -> usize {
    6
}

fn default_heads() -> usize {
    12
}

fn default_ffn_dim() -> usize {
    3072
}

fn default_max_position_embeddings() -> usize {
    1024
}

fn default_activation() -> String {
    "gelu".to_string()
}

fn default_eos_token_id() -> u32 {
    2
}

fn default_decoder_start_token_id() -> u32 {
    102
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn tiny_config() -> BartConfig {
        BartConfig {
            vocab_size: 16,
            d_model: 8,
            encoder_layers: 1,
            decoder_layers: 1,
            encoder_attention_heads: 2,
            decoder_attention_heads: 2,
            encoder_ffn_dim: 16,
            decoder_ffn_dim: 16,
            max_position_embeddings: 32,
            decoder_start_token_id: 1,
            ..BartConfig::default()
        }
    }

    fn ids(rows: &[&[u32]]) -> Tensor {
        let width = rows[0].len();
        let flat: Vec<u32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), width), &Device::Cpu).unwrap()
    }

    #[test]
    fn forward_produces_vocab_logits() {
        let mut model = MarianSeq2Seq::new(tiny_config(), &Device::Cpu).unwrap();
        let input = ids(&[&[3, 4, 5, 0], &[6, 7, 0, 0]]);
        let mask = ids(&[&[1, 1, 1, 0], &[1, 1, 0, 0]]);
        let decoder = ids(&[&[1, 3, 4], &[1, 6, 7]]);
        let logits = model.forward(&input, &mask, &decoder).unwrap();
        assert_eq!(logits.dims(), &[2, 3, 16]);
        // A second call must not see cached keys from the first.
        let again = model.forward(&input, &mask, &decoder).unwrap();
        assert_eq!(again.dims(), &[2, 3, 16]);
    }

    #[test]
    fn parameters_are_sorted_and_counted() {
        let model = MarianSeq2Seq::new(tiny_config(), &Device::Cpu).unwrap();
        let params = model.parameters();
        assert!(!params.is_empty());
        assert!(params.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(model.parameter_count() > 0);
    }

    #[test]
    fn save_and_reload_round_trips_weights() {
        let dir = tempfile::tempdir().unwrap();
        let model = MarianSeq2Seq::new(tiny_config(), &Device::Cpu).unwrap();
        let written = model.save_pretrained(dir.path()).unwrap();
        assert_eq!(written.len(), 2);

        let reloaded = MarianSeq2Seq::from_pretrained(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(reloaded.config(), model.config());
        for ((name_a, a), (name_b, b)) in model.parameters().iter().zip(reloaded.parameters()) {
            assert_eq!(name_a, &name_b);
            let diff = (a.as_tensor() - b.as_tensor())
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_vec0::<f32>()
                .unwrap();
            assert_eq!(diff, 0.0, "{name_a} differs after reload");
        }
    }

    #[test]
    fn rejects_heads_that_do_not_divide_width() {
        let config = BartConfig {
            encoder_attention_heads: 3,
            ..tiny_config()
        };
        assert!(matches!(config.validate(), Err(TrainingError::Validation(_))));
    }
}
