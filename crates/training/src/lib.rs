pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod early_stopping;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use config::{Backend, TrainingConfig};
pub use data::{shift_tokens_right, Batch, Example, Seq2SeqDataset, ShardedLoader};
pub use distributed::{
    scaled_all_reduce, LocalGroup, PendingReduce, ProcessGroup, RankContext, TcpGroup,
};
pub use early_stopping::{BestLossTracker, EarlyStopping, Observation};
pub use error::TrainingError;
pub use loss::{label_smoothed_nll_loss, LabelSmoothedNllLoss, LossOutput};
pub use model::{BartConfig, MarianSeq2Seq, Seq2SeqModel};
pub use optimizer::{AdamWConfig, TrainerOptimizer};
pub use scheduler::{LRScheduler, LinearWarmupDecay};
pub use trainer::{run_worker, FitSummary, Phase, Trainer, TrainingState};
