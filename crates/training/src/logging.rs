use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use chrono::{Local, NaiveDate};
use crc32fast::Hasher as Crc32;
use prost::Message;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::{distributed::RankContext, TrainingError};

pub const TRAIN_LOSS_TAG: &str = "train_loss";
pub const VALID_LOSS_TAG: &str = "valid_loss";

/// Daily text log file name, `train_log_YYYYMMDD.log`.
pub fn log_file_name(date: NaiveDate) -> String {
    format!("train_log_{}.log", date.format("%Y%m%d"))
}

/// Installs the global subscriber: console output on every worker and, on the
/// primary worker with a `log_path`, a plain-text file layer.
///
/// The returned guard must be held until exit so buffered lines are flushed.
/// Calling this when a subscriber is already installed is not an error.
pub fn init_tracing(
    log_path: Option<&Path>,
    rank: &RankContext,
) -> Result<Option<WorkerGuard>, TrainingError> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false).with_filter(filter());

    let (file_layer, guard) = match log_path {
        Some(dir) if rank.is_primary() => {
            fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::never(dir, log_file_name(Local::now().date_naive()));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    // A second install (tests, repeated workers in one process) keeps the first.
    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init();
    Ok(guard)
}

/// Scalar event stream readable by TensorBoard.
pub struct ScalarWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ScalarWriter {
    pub fn create(dir: &Path) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_scalar(&mut self, tag: &str, step: usize, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step: step as i64,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        let mut buffer = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let record = frame_record(&buffer);
        self.writer.write_all(&record).map_err(|err| {
            TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
        })?;
        // Scalars are sparse (every log_step batches), so keep the file current.
        self.flush()
    }

    pub fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })
    }
}

impl Drop for ScalarWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// TFRecord framing: length, masked CRC of the length, payload, masked CRC of
/// the payload. All integers little endian.
fn frame_record(data: &[u8]) -> Vec<u8> {
    let len_bytes = (data.len() as u64).to_le_bytes();
    let mut record = Vec::with_capacity(data.len() + 16);
    record.extend_from_slice(&len_bytes);
    record.extend_from_slice(&masked_crc32(&len_bytes).to_le_bytes());
    record.extend_from_slice(data);
    record.extend_from_slice(&masked_crc32(data).to_le_bytes());
    record
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_events(path: &Path) -> Vec<Event> {
        let bytes = fs::read(path).unwrap();
        let mut events = Vec::new();
        let mut cursor = 0;
        while cursor < bytes.len() {
            let len_bytes: [u8; 8] = bytes[cursor..cursor + 8].try_into().unwrap();
            let len = u64::from_le_bytes(len_bytes) as usize;
            let len_crc = u32::from_le_bytes(bytes[cursor + 8..cursor + 12].try_into().unwrap());
            assert_eq!(len_crc, masked_crc32(&len_bytes));
            let data = &bytes[cursor + 12..cursor + 12 + len];
            let data_crc = u32::from_le_bytes(
                bytes[cursor + 12 + len..cursor + 16 + len].try_into().unwrap(),
            );
            assert_eq!(data_crc, masked_crc32(data));
            events.push(Event::decode(data).unwrap());
            cursor += len + 16;
        }
        events
    }

    #[test]
    fn log_file_is_named_by_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(log_file_name(date), "train_log_20240307.log");
    }

    #[test]
    fn scalars_are_framed_and_decodable() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ScalarWriter::create(&dir.path().join("tb")).unwrap();
        writer.write_scalar(TRAIN_LOSS_TAG, 200, 3.5).unwrap();
        writer.write_scalar(VALID_LOSS_TAG, 400, 2.25).unwrap();

        let name = writer.path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("events.out.tfevents."));

        let events = read_events(writer.path());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].step, 200);
        let value = &events[1].summary.as_ref().unwrap().value[0];
        assert_eq!(value.tag, VALID_LOSS_TAG);
        assert_eq!(value.simple_value, Some(2.25));
    }

    #[test]
    fn file_layer_is_only_installed_for_the_primary_worker() {
        let dir = tempfile::tempdir().unwrap();
        let secondary = RankContext::new(1, 1, 2).unwrap();
        let guard = init_tracing(Some(dir.path()), &secondary).unwrap();
        assert!(guard.is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        let primary = RankContext::new(0, 0, 2).unwrap();
        let guard = init_tracing(Some(dir.path()), &primary).unwrap();
        assert!(guard.is_some());
        let expected = dir.path().join(log_file_name(Local::now().date_naive()));
        assert!(expected.exists());
    }
}
