use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::{model::Seq2SeqModel, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const BEST_DIRNAME: &str = "min_ppl_model";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Snapshot taken at the end of a (zero based) epoch.
    Epoch(usize),
    /// Lowest validation loss so far, replaced on every strict improvement.
    Best,
}

impl CheckpointKind {
    pub fn dir_name(&self) -> String {
        match self {
            CheckpointKind::Epoch(epoch) => format!("epoch{epoch}"),
            CheckpointKind::Best => BEST_DIRNAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TrainingProgressSnapshot {
    pub epoch: usize,
    pub global_step: usize,
    pub optimizer_step: usize,
    pub valid_loss: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub files: Vec<FileRecord>,
    pub progress: TrainingProgressSnapshot,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

/// Writes the model to `<base_dir>/<kind>/` together with a manifest that
/// records a checksum for every file. An existing directory of the same name
/// is replaced.
pub fn save_checkpoint(
    base_dir: &Path,
    kind: CheckpointKind,
    model: &dyn Seq2SeqModel,
    progress: TrainingProgressSnapshot,
) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(base_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            base_dir.display()
        ))
    })?;

    let checkpoint_dir = base_dir.join(kind.dir_name());
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to remove existing checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;
    }
    fs::create_dir_all(&checkpoint_dir)?;

    let files = model
        .save_pretrained(&checkpoint_dir)?
        .iter()
        .map(|path| file_record(path))
        .collect::<Result<Vec<_>, _>>()?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        files,
        progress,
    };
    write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;
    info!(dir = %checkpoint_dir.display(), "checkpoint saved");

    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

/// Reads a checkpoint manifest and checks every listed file against it.
pub fn verify_checkpoint(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    let manifest: CheckpointManifest = read_json(&manifest_path)?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }
    for record in &manifest.files {
        let path = directory.join(&record.filename);
        if sha256_file(&path)? != record.sha256 {
            return Err(TrainingError::runtime(format!(
                "checkpoint file {} failed checksum validation",
                path.display()
            )));
        }
    }
    Ok(manifest)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path.metadata()?.len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}
