use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::TrainingError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelSourceConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
}

impl TrainingConfig {
    /// Loads a TOML or JSON file. Relative paths inside the file resolve
    /// against the file's directory.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.data_path.is_none() {
            errors.push("data.data_path is required".to_string());
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.max_length < 2 {
            errors.push("data.max_length must be at least 2".to_string());
        }
        if !(self.data.val_rate > 0.0 && self.data.val_rate < 1.0) {
            errors.push("data.val_rate must be in (0, 1)".to_string());
        }

        match (&self.model.pretrained_model, &self.model.model_config) {
            (None, None) => errors
                .push("either model.pretrained_model or model.model_config must be set".to_string()),
            (Some(_), Some(_)) => errors.push(
                "model.pretrained_model and model.model_config are mutually exclusive".to_string(),
            ),
            _ => {}
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.adam_eps <= 0.0 {
            errors.push("optimizer.adam_eps must be greater than 0".to_string());
        }
        for (idx, beta) in self.optimizer.adam_betas.iter().enumerate() {
            if !(0.0..1.0).contains(beta) {
                errors.push(format!("optimizer.adam_betas[{idx}] must be in [0, 1)"));
            }
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be non-negative".to_string());
        }
        if self.optimizer.gradient_clip_val < 0.0 {
            errors.push("optimizer.gradient_clip_val must be non-negative".to_string());
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }
        if self.runtime.log_step == 0 {
            errors.push("runtime.log_step must be greater than 0".to_string());
        }
        if self.runtime.accumulate_grad_batches == 0 {
            errors.push("runtime.accumulate_grad_batches must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.runtime.label_smoothing) {
            errors.push("runtime.label_smoothing must be in [0, 1)".to_string());
        }
        if self.runtime.min_delta < 0.0 {
            errors.push("runtime.min_delta must be non-negative".to_string());
        }

        if self.distributed.multi_spawn && self.distributed.nproc_per_node == Some(0) {
            errors.push("distributed.nproc_per_node must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }

    /// Splits the global batch size across the processes of one node.
    pub fn per_worker_batch_size(&self, nprocs: usize) -> Result<usize, TrainingError> {
        let nprocs = nprocs.max(1);
        let per_worker = self.data.batch_size / nprocs;
        if per_worker == 0 {
            return Err(TrainingError::validation(vec![format!(
                "data.batch_size {} is smaller than the {} processes per node",
                self.data.batch_size, nprocs
            )]));
        }
        Ok(per_worker)
    }

    fn apply_base_path(&mut self, base: &Path) {
        for path in [
            self.data.data_path.as_mut(),
            self.data.vocab_path.as_mut(),
            self.model.pretrained_model.as_mut(),
            self.model.model_config.as_mut(),
            self.runtime.log_path.as_mut(),
            self.runtime.tb_log_dir.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
        absolutize_in_place(&mut self.runtime.save_model_path, base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default)]
    pub data_path: Option<PathBuf>,
    #[serde(default)]
    pub vocab_path: Option<PathBuf>,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_val_rate")]
    pub val_rate: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Accepted for command-line compatibility. Loading is synchronous.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default = "default_decoder_start_token_id")]
    pub decoder_start_token_id: u32,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_path: None,
            vocab_path: None,
            max_length: default_max_length(),
            val_rate: default_val_rate(),
            batch_size: default_batch_size(),
            num_workers: default_num_workers(),
            pad_token_id: 0,
            decoder_start_token_id: default_decoder_start_token_id(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSourceConfig {
    /// Directory holding `config.json` and `model.safetensors`.
    #[serde(default)]
    pub pretrained_model: Option<PathBuf>,
    /// Architecture JSON for a freshly initialized model.
    #[serde(default)]
    pub model_config: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_adam_eps")]
    pub adam_eps: f64,
    #[serde(default = "default_adam_betas")]
    pub adam_betas: [f64; 2],
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Global gradient norm ceiling. Zero disables clipping.
    #[serde(default = "default_gradient_clip_val")]
    pub gradient_clip_val: f64,
    #[serde(default)]
    pub weight_decay_exclude: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            adam_eps: default_adam_eps(),
            adam_betas: default_adam_betas(),
            weight_decay: default_weight_decay(),
            gradient_clip_val: default_gradient_clip_val(),
            weight_decay_exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            warmup_steps: default_warmup_steps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_log_step")]
    pub log_step: usize,
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f64,
    #[serde(default = "default_accumulate_grad_batches")]
    pub accumulate_grad_batches: usize,
    /// Zero disables early stopping.
    #[serde(default)]
    pub patience: usize,
    #[serde(default)]
    pub min_delta: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_save_model_path")]
    pub save_model_path: PathBuf,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub tb_log_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            log_step: default_log_step(),
            label_smoothing: default_label_smoothing(),
            accumulate_grad_batches: default_accumulate_grad_batches(),
            patience: 0,
            min_delta: 0.0,
            seed: None,
            save_model_path: default_save_model_path(),
            log_path: None,
            tb_log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Tcp,
    Nccl,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(feature = "nccl") {
            Backend::Nccl
        } else {
            Backend::Tcp
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Number of nodes when multi-spawning, total workers otherwise. -1 defers
    /// to the environment.
    #[serde(default = "default_unset")]
    pub world_size: i64,
    #[serde(default = "default_unset")]
    pub rank: i64,
    #[serde(default = "default_unset")]
    pub local_rank: i64,
    #[serde(default)]
    pub multi_spawn: bool,
    #[serde(default)]
    pub nproc_per_node: Option<usize>,
    #[serde(default)]
    pub node_rank: usize,
    #[serde(default = "default_master_addr")]
    pub master_addr: String,
    #[serde(default = "default_master_port")]
    pub master_port: u16,
    #[serde(default)]
    pub backend: Backend,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: default_unset(),
            rank: default_unset(),
            local_rank: default_unset(),
            multi_spawn: false,
            nproc_per_node: None,
            node_rank: 0,
            master_addr: default_master_addr(),
            master_port: default_master_port(),
            backend: Backend::default(),
        }
    }
}

/// Parses betas written as `(0.9,0.999)`, `[0.9, 0.999]` or `0.9,0.999`.
pub fn parse_adam_betas(value: &str) -> Result<[f64; 2], TrainingError> {
    let trimmed = value
        .trim()
        .trim_start_matches(['(', '['])
        .trim_end_matches([')', ']']);
    let parts = trimmed
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| {
            TrainingError::validation(vec![format!("invalid adam betas '{value}': {err}")])
        })?;
    match parts.as_slice() {
        [beta1, beta2] => Ok([*beta1, *beta2]),
        _ => Err(TrainingError::validation(vec![format!(
            "adam betas '{value}' must contain exactly two values"
        )])),
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_max_length() -> usize {
    128
}

fn default_val_rate() -> f64 {
    0.001
}

fn default_batch_size() -> usize {
    64
}

fn default_num_workers() -> usize {
    1
}

fn default_decoder_start_token_id() -> u32 {
    102
}

fn default_learning_rate() -> f64 {
    3e-5
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_adam_betas() -> [f64; 2] {
    [0.9, 0.999]
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_gradient_clip_val() -> f64 {
    0.1
}

fn default_warmup_steps() -> usize {
    100
}

fn default_epochs() -> usize {
    15
}

fn default_log_step() -> usize {
    200
}

fn default_label_smoothing() -> f64 {
    0.1
}

fn default_accumulate_grad_batches() -> usize {
    4
}

fn default_save_model_path() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_unset() -> i64 {
    -1
}

fn default_master_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_master_port() -> u16 {
    29500
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> TrainingConfig {
        let mut config = TrainingConfig::default();
        config.data.data_path = Some(PathBuf::from("data.jsonl"));
        config.model.model_config = Some(PathBuf::from("bart.json"));
        config
    }

    #[test]
    fn defaults_match_command_line_defaults() {
        let config = TrainingConfig::default();
        assert_eq!(config.runtime.epochs, 15);
        assert_eq!(config.data.batch_size, 64);
        assert_eq!(config.runtime.log_step, 200);
        assert_eq!(config.data.max_length, 128);
        assert_eq!(config.optimizer.adam_betas, [0.9, 0.999]);
        assert_eq!(config.runtime.accumulate_grad_batches, 4);
        assert_eq!(config.runtime.patience, 0);
        assert_eq!(config.data.decoder_start_token_id, 102);
        assert_eq!(config.distributed.world_size, -1);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = minimal();
        config.data.batch_size = 0;
        config.runtime.label_smoothing = 1.0;
        config.model.pretrained_model = Some(PathBuf::from("pretrained"));
        match config.validate() {
            Err(TrainingError::Validation(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn per_worker_batch_size_divides_by_process_count() {
        let mut config = minimal();
        config.data.batch_size = 64;
        assert_eq!(config.per_worker_batch_size(8).unwrap(), 8);
        assert_eq!(config.per_worker_batch_size(3).unwrap(), 21);
        config.data.batch_size = 2;
        assert!(config.per_worker_batch_size(4).is_err());
    }

    #[test]
    fn parses_betas_in_several_spellings() {
        assert_eq!(parse_adam_betas("(0.9,0.999)").unwrap(), [0.9, 0.999]);
        assert_eq!(parse_adam_betas("[0.8, 0.95]").unwrap(), [0.8, 0.95]);
        assert_eq!(parse_adam_betas("0.5,0.5").unwrap(), [0.5, 0.5]);
        assert!(parse_adam_betas("(0.9)").is_err());
        assert!(parse_adam_betas("a,b").is_err());
    }

    #[test]
    fn loads_toml_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.toml");
        fs::write(
            &path,
            r#"
[data]
data_path = "corpus.jsonl"
batch_size = 16

[model]
model_config = "bart.json"

[runtime]
epochs = 2
patience = 3

[distributed]
backend = "tcp"
"#,
        )
        .unwrap();

        let config = TrainingConfig::from_path(&path).unwrap();
        assert_eq!(config.data.batch_size, 16);
        assert_eq!(config.runtime.epochs, 2);
        assert_eq!(config.runtime.patience, 3);
        assert_eq!(config.distributed.backend, Backend::Tcp);
        assert_eq!(
            config.data.data_path.as_deref(),
            Some(dir.path().join("corpus.jsonl").as_path())
        );
        assert_eq!(config.runtime.save_model_path, dir.path().join("checkpoints"));
        config.validate().unwrap();
    }
}
