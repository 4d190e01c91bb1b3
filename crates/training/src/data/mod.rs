use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::{DType, Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{config::DataConfig, distributed::RankContext, error::to_runtime_error, TrainingError};

pub mod sampler;

pub use sampler::DistributedSampler;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// One record padded to the dataset's fixed length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<u32>,
}

impl Example {
    /// Truncates or pads both sequences to `max_length`. Without an explicit
    /// mask, every non-padding input position is attended.
    pub fn from_ids(
        mut input_ids: Vec<u32>,
        mut labels: Vec<u32>,
        attention_mask: Option<Vec<u32>>,
        max_length: usize,
        pad_token_id: u32,
    ) -> Self {
        input_ids.truncate(max_length);
        labels.truncate(max_length);
        let mut attention_mask = match attention_mask {
            Some(mut mask) => {
                mask.truncate(input_ids.len());
                mask.resize(input_ids.len(), 1);
                mask
            }
            None => input_ids
                .iter()
                .map(|&id| u32::from(id != pad_token_id))
                .collect(),
        };
        input_ids.resize(max_length, pad_token_id);
        attention_mask.resize(max_length, 0);
        labels.resize(max_length, pad_token_id);
        Self {
            input_ids,
            attention_mask,
            labels,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Record {
    Tokenized {
        input_ids: Vec<u32>,
        labels: Vec<u32>,
        #[serde(default)]
        attention_mask: Option<Vec<u32>>,
    },
    Text {
        src: String,
        tgt: String,
    },
}

#[derive(Debug, Clone)]
pub struct Seq2SeqDataset {
    examples: Vec<Example>,
    max_length: usize,
}

impl Seq2SeqDataset {
    pub fn new(examples: Vec<Example>, max_length: usize) -> Result<Self> {
        if let Some(bad) = examples.iter().position(|ex| {
            ex.input_ids.len() != max_length
                || ex.attention_mask.len() != max_length
                || ex.labels.len() != max_length
        }) {
            return Err(TrainingError::data(format!(
                "example {bad} is not padded to max_length {max_length}"
            )));
        }
        Ok(Self {
            examples,
            max_length,
        })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn get(&self, index: usize) -> Option<&Example> {
        self.examples.get(index)
    }
}

/// Reads every record under `config.data_path` and splits off a validation
/// set of `ceil(n * val_rate)` examples chosen by a seeded shuffle.
pub fn load_train_valid(config: &DataConfig, seed: u64) -> Result<(Seq2SeqDataset, Seq2SeqDataset)> {
    let data_path = config
        .data_path
        .as_deref()
        .ok_or_else(|| TrainingError::data("no data path configured"))?;
    let mut reader = RecordReader::new(config);
    let mut examples = Vec::new();
    for file in dataset_files(data_path)? {
        reader.read_file(&file, &mut examples)?;
    }
    info!(
        path = %data_path.display(),
        examples = examples.len(),
        "dataset loaded"
    );

    let (train, valid) = split_train_valid(examples, config.val_rate, seed)?;
    Ok((
        Seq2SeqDataset::new(train, config.max_length)?,
        Seq2SeqDataset::new(valid, config.max_length)?,
    ))
}

pub fn split_train_valid(
    mut examples: Vec<Example>,
    val_rate: f64,
    seed: u64,
) -> Result<(Vec<Example>, Vec<Example>)> {
    let total = examples.len();
    let valid_len = (total as f64 * val_rate).ceil() as usize;
    if total < 2 || valid_len == 0 || valid_len >= total {
        return Err(TrainingError::data(format!(
            "cannot split {total} examples with validation rate {val_rate}"
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    examples.shuffle(&mut rng);
    let train = examples.split_off(valid_len);
    Ok((train, examples))
}

fn dataset_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(TrainingError::data(format!(
            "data path {} does not exist",
            path.display()
        )));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file = entry.path();
        let is_record_file = matches!(
            file.extension().and_then(|ext| ext.to_str()),
            Some("json") | Some("jsonl")
        );
        if entry.file_type()?.is_file() && is_record_file {
            files.push(file);
        }
    }
    files.sort();
    if files.is_empty() {
        return Err(TrainingError::data(format!(
            "no .json or .jsonl files under {}",
            path.display()
        )));
    }
    Ok(files)
}

struct RecordReader<'a> {
    config: &'a DataConfig,
    tokenizer: Option<Tokenizer>,
}

impl<'a> RecordReader<'a> {
    fn new(config: &'a DataConfig) -> Self {
        Self {
            config,
            tokenizer: None,
        }
    }

    fn read_file(&mut self, path: &Path, out: &mut Vec<Example>) -> Result<()> {
        let contents = fs::read_to_string(path)?;
        let trimmed = contents.trim_start();
        if trimmed.starts_with('[') {
            let records: Vec<Record> = serde_json::from_str(trimmed).map_err(|err| {
                TrainingError::data(format!("{}: {err}", path.display()))
            })?;
            for record in records {
                out.push(self.encode(record)?);
            }
        } else {
            for (line_no, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let record: Record = serde_json::from_str(line).map_err(|err| {
                    TrainingError::data(format!("{}:{}: {err}", path.display(), line_no + 1))
                })?;
                out.push(self.encode(record)?);
            }
        }
        debug!(file = %path.display(), total = out.len(), "records read");
        Ok(())
    }

    fn encode(&mut self, record: Record) -> Result<Example> {
        let (input_ids, labels, attention_mask) = match record {
            Record::Tokenized {
                input_ids,
                labels,
                attention_mask,
            } => (input_ids, labels, attention_mask),
            Record::Text { src, tgt } => {
                let tokenizer = self.tokenizer()?;
                (encode_text(tokenizer, &src)?, encode_text(tokenizer, &tgt)?, None)
            }
        };
        Ok(Example::from_ids(
            input_ids,
            labels,
            attention_mask,
            self.config.max_length,
            self.config.pad_token_id,
        ))
    }

    fn tokenizer(&mut self) -> Result<&Tokenizer> {
        if self.tokenizer.is_none() {
            let vocab = self.config.vocab_path.as_deref().ok_or_else(|| {
                TrainingError::data("text records require a vocab path with tokenizer.json")
            })?;
            let file = if vocab.is_dir() {
                vocab.join("tokenizer.json")
            } else {
                vocab.to_path_buf()
            };
            let tokenizer = Tokenizer::from_file(&file).map_err(|err| {
                TrainingError::data(format!("failed to load tokenizer {}: {err}", file.display()))
            })?;
            self.tokenizer = Some(tokenizer);
        }
        self.tokenizer
            .as_ref()
            .ok_or_else(|| TrainingError::data("tokenizer unavailable"))
    }
}

fn encode_text(tokenizer: &Tokenizer, text: &str) -> Result<Vec<u32>> {
    tokenizer
        .encode(text, true)
        .map(|encoding| encoding.get_ids().to_vec())
        .map_err(|err| TrainingError::data(format!("tokenization failed: {err}")))
}

/// Tensors for one mini-batch, all `(batch, seq)` and `u32`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn new(input_ids: Tensor, attention_mask: Tensor, labels: Tensor) -> Result<Self> {
        let batch = input_ids.dims().first().copied();
        let consistent = input_ids.rank() == 2
            && attention_mask.rank() == 2
            && labels.rank() == 2
            && attention_mask.dims().first().copied() == batch
            && labels.dims().first().copied() == batch
            && attention_mask.dims() == input_ids.dims();
        if !consistent {
            return Err(TrainingError::runtime(format!(
                "inconsistent batch: input_ids {:?}, attention_mask {:?}, labels {:?}",
                input_ids.dims(),
                attention_mask.dims(),
                labels.dims()
            )));
        }
        Ok(Self {
            input_ids,
            attention_mask,
            labels,
        })
    }

    pub fn from_examples(examples: &[&Example], device: &Device) -> Result<Self> {
        let rows = examples.len();
        let width = examples.first().map(|ex| ex.input_ids.len()).unwrap_or(0);
        let stack = |select: fn(&Example) -> &Vec<u32>| -> Result<Tensor> {
            let flat: Vec<u32> = examples
                .iter()
                .flat_map(|ex| select(ex).iter().copied())
                .collect();
            Tensor::from_vec(flat, (rows, width), device).map_err(to_runtime_error)
        };
        Self::new(
            stack(|ex| &ex.input_ids)?,
            stack(|ex| &ex.attention_mask)?,
            stack(|ex| &ex.labels)?,
        )
    }

    pub fn size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }
}

/// Builds decoder inputs: prepend `decoder_start_token_id` and drop the last
/// label. Signed labels equal to -100 become `pad_token_id`.
pub fn shift_tokens_right(
    labels: &Tensor,
    pad_token_id: u32,
    decoder_start_token_id: u32,
) -> Result<Tensor> {
    let (batch, seq_len) = labels.dims2().map_err(to_runtime_error)?;
    let labels = match labels.dtype() {
        DType::U32 => labels.clone(),
        DType::I64 => {
            let ignored = labels.lt(0i64).map_err(to_runtime_error)?;
            let pad = Tensor::full(pad_token_id as i64, (batch, seq_len), labels.device())
                .map_err(to_runtime_error)?;
            ignored
                .where_cond(&pad, labels)
                .and_then(|t| t.to_dtype(DType::U32))
                .map_err(to_runtime_error)?
        }
        dtype => {
            return Err(TrainingError::runtime(format!(
                "unsupported label dtype {:?}",
                dtype
            )))
        }
    };
    if seq_len == 0 {
        return Ok(labels);
    }
    let start = Tensor::full(decoder_start_token_id, (batch, 1), labels.device())
        .map_err(to_runtime_error)?;
    let body = labels.narrow(1, 0, seq_len - 1).map_err(to_runtime_error)?;
    Tensor::cat(&[&start, &body], 1).map_err(to_runtime_error)
}

/// A rank's view of a dataset: sampler shard grouped into batches.
///
/// The last batch of an epoch may be short. Every rank gets the same number
/// of batches because the sampler pads shards to equal length.
pub struct ShardedLoader {
    name: &'static str,
    dataset: Arc<Seq2SeqDataset>,
    sampler: DistributedSampler,
    batch_size: usize,
    device: Device,
}

impl ShardedLoader {
    pub fn new(
        name: &'static str,
        dataset: Arc<Seq2SeqDataset>,
        rank: RankContext,
        batch_size: usize,
        seed: u64,
        device: Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        let sampler =
            DistributedSampler::new(dataset.len(), rank.world_size, rank.global_rank, true, seed);
        Ok(Self {
            name,
            dataset,
            sampler,
            batch_size,
            device,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.sampler.set_epoch(epoch);
    }

    pub fn num_batches(&self) -> usize {
        self.sampler.num_samples().div_ceil(self.batch_size)
    }

    pub fn batches(&self) -> BatchIter<'_> {
        BatchIter {
            loader: self,
            indices: self.sampler.indices(),
            cursor: 0,
        }
    }
}

pub struct BatchIter<'a> {
    loader: &'a ShardedLoader,
    indices: Vec<usize>,
    cursor: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.indices.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.indices.len());
        let chunk = &self.indices[self.cursor..end];
        self.cursor = end;

        let examples = chunk
            .iter()
            .map(|&idx| {
                self.loader.dataset.get(idx).ok_or_else(|| {
                    TrainingError::data(format!("sampler produced out-of-range index {idx}"))
                })
            })
            .collect::<Result<Vec<_>>>();
        Some(examples.and_then(|examples| Batch::from_examples(&examples, &self.loader.device)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor_from(rows: &[&[u32]]) -> Tensor {
        let width = rows[0].len();
        let flat: Vec<u32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), width), &Device::Cpu).unwrap()
    }

    fn example(id: u32, max_length: usize) -> Example {
        Example::from_ids(vec![id, id + 1], vec![id + 2], None, max_length, 0)
    }

    #[test]
    fn shift_prepends_start_token_and_drops_last_label() {
        let labels = tensor_from(&[&[5, 6, 7, 0]]);
        let shifted = shift_tokens_right(&labels, 0, 102).unwrap();
        assert_eq!(shifted.to_vec2::<u32>().unwrap(), vec![vec![102, 5, 6, 7]]);
    }

    #[test]
    fn shift_replaces_ignored_signed_labels_with_padding() {
        let labels = Tensor::new(&[[5i64, -100, 7]], &Device::Cpu).unwrap();
        let shifted = shift_tokens_right(&labels, 1, 2).unwrap();
        assert_eq!(shifted.to_vec2::<u32>().unwrap(), vec![vec![2, 5, 1]]);
    }

    #[test]
    fn examples_are_truncated_and_padded() {
        let ex = Example::from_ids(vec![4, 5, 6, 7], vec![8, 9], None, 3, 0);
        assert_eq!(ex.input_ids, vec![4, 5, 6]);
        assert_eq!(ex.attention_mask, vec![1, 1, 1]);
        assert_eq!(ex.labels, vec![8, 9, 0]);

        let ex = Example::from_ids(vec![4], vec![8], Some(vec![1]), 3, 0);
        assert_eq!(ex.input_ids, vec![4, 0, 0]);
        assert_eq!(ex.attention_mask, vec![1, 0, 0]);
    }

    #[test]
    fn batch_rejects_mismatched_batch_dimension() {
        let ids = tensor_from(&[&[1, 2], &[3, 4]]);
        let mask = tensor_from(&[&[1, 1], &[1, 1]]);
        let labels = tensor_from(&[&[1, 2]]);
        assert!(Batch::new(ids, mask, labels).is_err());
    }

    #[test]
    fn split_keeps_at_least_one_validation_example() {
        let examples: Vec<Example> = (0..10).map(|i| example(i * 3, 4)).collect();
        let (train, valid) = split_train_valid(examples.clone(), 0.001, 0).unwrap();
        assert_eq!((train.len(), valid.len()), (9, 1));
        let (train, valid) = split_train_valid(examples.clone(), 0.25, 0).unwrap();
        assert_eq!((train.len(), valid.len()), (7, 3));
        assert_eq!(split_train_valid(examples, 0.25, 0).unwrap().1, valid);
        assert!(split_train_valid(vec![example(1, 4)], 0.5, 0).is_err());
    }

    #[test]
    fn loader_yields_equal_batch_counts_on_every_rank() {
        let dataset = Arc::new(
            Seq2SeqDataset::new((0..11).map(|i| example(i, 4)).collect(), 4).unwrap(),
        );
        let mut counts = Vec::new();
        for rank in 0..3 {
            let ctx = RankContext::new(rank, rank, 3).unwrap();
            let mut loader =
                ShardedLoader::new("train", Arc::clone(&dataset), ctx, 2, 0, Device::Cpu).unwrap();
            loader.set_epoch(1);
            let batches: Vec<Batch> = loader.batches().collect::<Result<_>>().unwrap();
            assert_eq!(batches.len(), loader.num_batches());
            assert_eq!(batches.iter().map(Batch::size).sum::<usize>(), 4);
            assert_eq!(batches[0].input_ids.dims(), &[2, 4]);
            counts.push(batches.len());
        }
        assert_eq!(counts, vec![2, 2, 2]);
    }

    #[test]
    fn reads_tokenized_jsonl_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        let mut lines = String::new();
        for i in 0..8u32 {
            lines.push_str(&format!(
                "{{\"input_ids\": [{}, {}], \"labels\": [{}]}}\n\n",
                i + 3,
                i + 4,
                i + 5
            ));
        }
        fs::write(&path, lines).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let config = DataConfig {
            data_path: Some(dir.path().to_path_buf()),
            max_length: 4,
            val_rate: 0.25,
            ..DataConfig::default()
        };
        let (train, valid) = load_train_valid(&config, 3).unwrap();
        assert_eq!((train.len(), valid.len()), (6, 2));
        let ex = train.get(0).unwrap();
        assert_eq!(ex.input_ids.len(), 4);
        assert_eq!(ex.attention_mask, vec![1, 1, 0, 0]);
    }

    #[test]
    fn malformed_records_report_file_and_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        fs::write(&path, "{\"input_ids\": [1], \"labels\": [2]}\n{\"oops\": 1}\n").unwrap();
        let config = DataConfig {
            data_path: Some(path),
            ..DataConfig::default()
        };
        match load_train_valid(&config, 0) {
            Err(TrainingError::Data(msg)) => assert!(msg.contains(":2:"), "{msg}"),
            other => panic!("expected data error, got {other:?}"),
        }
    }
}
