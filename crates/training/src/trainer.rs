use std::sync::Arc;

use candle_core::{backprop::GradStore, utils::cuda_is_available, DType, Device, Var};
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{self, CheckpointKind, TrainingProgressSnapshot},
    config::TrainingConfig,
    data::{self, shift_tokens_right, Batch, Seq2SeqDataset, ShardedLoader},
    distributed::{
        self, average_gradients, broadcast_parameters, default_nproc_per_node,
        scaled_all_reduce, ProcessGroup, RankContext,
    },
    early_stopping::{BestLossTracker, EarlyStopping},
    error::to_runtime_error,
    logging::{ScalarWriter, TRAIN_LOSS_TAG, VALID_LOSS_TAG},
    loss::{LabelSmoothedNllLoss, LossOutput},
    metrics::EpochMetrics,
    model::{self, Seq2SeqModel},
    optimizer::{clip_grad_norm, merge_gradient_store, AdamWConfig, TrainerOptimizer},
    scheduler::{LRScheduler, LinearWarmupDecay},
    TrainingError,
};

/// Seed for the train/validation split and sampler shuffles when none is set.
/// Must be identical on every worker.
const DEFAULT_DATA_SEED: u64 = 0;

/// Worker lifecycle. Transitions only move forward, one state at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Uninitialized,
    ProcessGroupJoined,
    ModelBuilt,
    Training,
    Terminated,
}

impl Phase {
    fn successor(self) -> Option<Phase> {
        match self {
            Phase::Uninitialized => Some(Phase::ProcessGroupJoined),
            Phase::ProcessGroupJoined => Some(Phase::ModelBuilt),
            Phase::ModelBuilt => Some(Phase::Training),
            Phase::Training => Some(Phase::Terminated),
            Phase::Terminated => None,
        }
    }

    pub fn advance(&mut self, next: Phase) -> Result<(), TrainingError> {
        if self.successor() != Some(next) {
            return Err(TrainingError::runtime(format!(
                "invalid lifecycle transition {:?} -> {:?}",
                self, next
            )));
        }
        debug!(from = ?self, to = ?next, "lifecycle transition");
        *self = next;
        Ok(())
    }
}

/// Counters owned by the trainer. Reset at process start, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub epoch: usize,
    /// Batches processed across all epochs, the x axis of the loss stream.
    pub global_step: usize,
    pub best_val_loss: f64,
    pub early_stop_counter: usize,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            best_val_loss: BestLossTracker::INITIAL_BEST,
            early_stop_counter: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FitSummary {
    pub train_losses: Vec<f64>,
    pub valid_losses: Vec<f64>,
    pub best_loss: f64,
    pub stopped_early: bool,
    pub global_step: usize,
}

pub struct Trainer<M: Seq2SeqModel> {
    config: TrainingConfig,
    rank: RankContext,
    group: Box<dyn ProcessGroup>,
    model: M,
    params: Vec<(String, Var)>,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    loss: LabelSmoothedNllLoss,
    train_loader: ShardedLoader,
    valid_loader: ShardedLoader,
    early_stopping: EarlyStopping,
    best: BestLossTracker,
    scalars: Option<ScalarWriter>,
    state: TrainingState,
    phase: Phase,
}

impl<M: Seq2SeqModel> Trainer<M> {
    /// Wires a built model to a joined process group. Replica weights are
    /// overwritten with rank 0's before the optimizer sees them.
    pub fn new(
        config: TrainingConfig,
        rank: RankContext,
        group: Box<dyn ProcessGroup>,
        model: M,
        train: Seq2SeqDataset,
        valid: Seq2SeqDataset,
        device: Device,
    ) -> Result<Self, TrainingError> {
        if group.rank() != rank.global_rank || group.world_size() != rank.world_size {
            return Err(TrainingError::topology(format!(
                "process group reports rank {}/{} but worker is rank {}/{}",
                group.rank(),
                group.world_size(),
                rank.global_rank,
                rank.world_size
            )));
        }

        let params = model.parameters();
        broadcast_parameters(group.as_ref(), &params)?;
        if rank.is_primary() {
            info!(
                parameters = model.parameter_count(),
                tensors = params.len(),
                "model ready"
            );
        }

        let nprocs = config
            .distributed
            .nproc_per_node
            .unwrap_or_else(default_nproc_per_node);
        let batch_size = config.per_worker_batch_size(nprocs)?;
        let seed = config.runtime.seed.unwrap_or(DEFAULT_DATA_SEED);
        let train_loader = ShardedLoader::new(
            "train",
            Arc::new(train),
            rank,
            batch_size,
            seed,
            device.clone(),
        )?;
        let valid_loader =
            ShardedLoader::new("valid", Arc::new(valid), rank, batch_size, seed, device)?;
        if train_loader.num_batches() == 0 {
            return Err(TrainingError::EmptyLoader(train_loader.name()));
        }
        if valid_loader.num_batches() == 0 {
            return Err(TrainingError::EmptyLoader(valid_loader.name()));
        }

        let optimizer = TrainerOptimizer::new(
            params.clone(),
            AdamWConfig::from(&config.optimizer),
            &config.optimizer.weight_decay_exclude,
        )?;
        let total_steps = LinearWarmupDecay::total_steps_for(
            train_loader.num_batches(),
            config.runtime.accumulate_grad_batches,
            config.runtime.epochs,
        );
        let scheduler = LinearWarmupDecay::new(
            config.optimizer.learning_rate,
            config.scheduler.warmup_steps,
            total_steps,
        )?;
        let loss = LabelSmoothedNllLoss::new(config.runtime.label_smoothing)?
            .with_ignore_index(Some(config.data.pad_token_id));

        let scalars = match config.runtime.tb_log_dir.as_deref() {
            Some(dir) if rank.is_primary() => Some(ScalarWriter::create(dir)?),
            _ => None,
        };

        info!(
            rank = rank.global_rank,
            local_rank = rank.local_rank,
            batch_size,
            train_batches = train_loader.num_batches(),
            valid_batches = valid_loader.num_batches(),
            total_steps,
            "trainer initialized"
        );

        let early_stopping = EarlyStopping::new(config.runtime.patience, config.runtime.min_delta);
        Ok(Self {
            config,
            rank,
            group,
            model,
            params,
            optimizer,
            scheduler: Box::new(scheduler),
            loss,
            train_loader,
            valid_loader,
            early_stopping,
            best: BestLossTracker::new(),
            scalars,
            state: TrainingState::default(),
            phase: Phase::ModelBuilt,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn rank(&self) -> RankContext {
        self.rank
    }

    /// Runs train and validation epochs until the budget is spent or early
    /// stopping fires. The trainer is terminated afterwards either way.
    pub fn fit(&mut self) -> Result<FitSummary, TrainingError> {
        self.phase.advance(Phase::Training)?;
        let result = self.run_epochs();
        self.phase = Phase::Terminated;
        if let Some(writer) = self.scalars.as_mut() {
            writer.flush()?;
        }
        result
    }

    fn run_epochs(&mut self) -> Result<FitSummary, TrainingError> {
        let mut train_losses = Vec::with_capacity(self.config.runtime.epochs);
        let mut valid_losses = Vec::with_capacity(self.config.runtime.epochs);
        let mut stopped_early = false;

        for epoch in 0..self.config.runtime.epochs {
            self.state.epoch = epoch;
            train_losses.push(self.train_epoch(epoch)?);
            let valid_loss = self.valid_epoch(epoch)?;
            valid_losses.push(valid_loss);

            if self.best.update(valid_loss) {
                self.state.best_val_loss = valid_loss;
                if self.rank.is_primary() {
                    checkpoint::save_checkpoint(
                        &self.config.runtime.save_model_path,
                        CheckpointKind::Best,
                        &self.model,
                        self.progress(Some(valid_loss)),
                    )?;
                    info!(epoch, valid_loss, "validation loss improved, best model saved");
                }
            }

            let observation = self.early_stopping.observe(valid_loss);
            self.state.early_stop_counter = observation.counter;
            if self.rank.is_primary() {
                let mean_train = train_losses.iter().sum::<f64>() / train_losses.len() as f64;
                info!(
                    epoch,
                    mean_train_loss = mean_train,
                    valid_loss,
                    early_stop_counter = observation.counter,
                    "epoch summary"
                );
            }
            if observation.stop {
                info!(
                    epoch,
                    patience = self.config.runtime.patience,
                    "early stopping"
                );
                stopped_early = true;
                break;
            }
        }

        Ok(FitSummary {
            train_losses,
            valid_losses,
            best_loss: self.best.best(),
            stopped_early,
            global_step: self.state.global_step,
        })
    }

    /// One pass over this rank's training shard. Returns the mean of the
    /// cross-worker averaged batch losses.
    pub fn train_epoch(&mut self, epoch: usize) -> Result<f64, TrainingError> {
        self.model.set_training(true);
        self.train_loader.set_epoch(epoch as u64);

        let accumulate = self.config.runtime.accumulate_grad_batches.max(1);
        let log_step = self.config.runtime.log_step.max(1);
        let clip = self.config.optimizer.gradient_clip_val;
        let total_batches = self.train_loader.num_batches();
        let mut metrics = EpochMetrics::new(self.train_loader.name());
        let mut accumulated: Option<GradStore> = None;

        for (batch_idx, batch) in self.train_loader.batches().enumerate() {
            let batch = batch?;
            let output = forward_loss(&mut self.model, &self.loss, &batch, &self.config)?;
            let (loss_value, nll_value) = reduce_losses(self.group.as_ref(), &output)?;

            // The local loss is optimized; only the logged value is global.
            let micro_grads = output
                .loss
                .affine(1.0 / accumulate as f64, 0.0)
                .and_then(|scaled| scaled.backward())
                .map_err(to_runtime_error)?;
            match accumulated.as_mut() {
                Some(existing) => merge_gradient_store(existing, micro_grads, &self.params)?,
                None => accumulated = Some(micro_grads),
            }

            let boundary = (batch_idx + 1) % accumulate == 0 || batch_idx + 1 == total_batches;
            if boundary {
                if let Some(mut grads) = accumulated.take() {
                    average_gradients(self.group.as_ref(), &mut grads, &self.params)?;
                    let grad_norm = clip_grad_norm(&mut grads, &self.params, clip)?;
                    let lr = self.scheduler.step();
                    self.optimizer.set_learning_rate(lr);
                    self.optimizer.step(&mut grads)?;
                    self.optimizer.zero_grad(&mut grads);
                    debug!(
                        step = self.optimizer.steps_taken(),
                        lr, grad_norm, "optimizer step"
                    );
                }
            }

            metrics.record(loss_value, nll_value);
            self.state.global_step += 1;

            if self.rank.is_primary() && self.state.global_step % log_step == 0 {
                info!(
                    epoch,
                    step = batch_idx + 1,
                    global_step = self.state.global_step,
                    loss = loss_value,
                    running_loss = metrics.running_loss() / metrics.batches() as f64,
                    lr = self.scheduler.learning_rate(),
                    "train"
                );
                if let Some(writer) = self.scalars.as_mut() {
                    writer.write_scalar(TRAIN_LOSS_TAG, self.state.global_step, loss_value)?;
                }
            }
        }

        let summary = metrics.finish()?;
        if self.rank.is_primary() {
            checkpoint::save_checkpoint(
                &self.config.runtime.save_model_path,
                CheckpointKind::Epoch(epoch),
                &self.model,
                self.progress(None),
            )?;
            info!(
                epoch,
                loss = summary.mean_loss,
                nll = summary.mean_nll,
                batches = summary.batches,
                seconds = summary.duration.as_secs_f64(),
                "train epoch finished"
            );
        }
        Ok(summary.mean_loss)
    }

    /// Evaluation pass over this rank's validation shard. The returned mean is
    /// built from reduced values and so agrees on every rank.
    pub fn valid_epoch(&mut self, epoch: usize) -> Result<f64, TrainingError> {
        self.model.set_training(false);
        self.valid_loader.set_epoch(epoch as u64);
        let mut metrics = EpochMetrics::new(self.valid_loader.name());

        for batch in self.valid_loader.batches() {
            let batch = batch?;
            let output = forward_loss(&mut self.model, &self.loss, &batch, &self.config)?;
            let (loss_value, nll_value) = reduce_losses(self.group.as_ref(), &output)?;
            metrics.record(loss_value, nll_value);
        }
        self.model.set_training(true);

        let summary = metrics.finish()?;
        if self.rank.is_primary() {
            info!(
                epoch,
                valid_loss = summary.mean_loss,
                ppl = summary.perplexity(),
                seconds = summary.duration.as_secs_f64(),
                "validation finished"
            );
            if let Some(writer) = self.scalars.as_mut() {
                writer.write_scalar(VALID_LOSS_TAG, self.state.global_step, summary.mean_loss)?;
            }
        }
        Ok(summary.mean_loss)
    }

    fn progress(&self, valid_loss: Option<f64>) -> TrainingProgressSnapshot {
        TrainingProgressSnapshot {
            epoch: self.state.epoch,
            global_step: self.state.global_step,
            optimizer_step: self.optimizer.steps_taken(),
            valid_loss,
        }
    }
}

fn forward_loss<M: Seq2SeqModel>(
    model: &mut M,
    loss: &LabelSmoothedNllLoss,
    batch: &Batch,
    config: &TrainingConfig,
) -> Result<LossOutput, TrainingError> {
    let decoder_input_ids = shift_tokens_right(
        &batch.labels,
        config.data.pad_token_id,
        config.data.decoder_start_token_id,
    )?;
    let logits = model.forward(&batch.input_ids, &batch.attention_mask, &decoder_input_ids)?;
    loss.compute(&logits, &batch.labels)
}

/// Barrier, then the cross-worker mean of `[loss, nll]`. Every rank issues
/// exactly these two reductions per batch.
fn reduce_losses(
    group: &dyn ProcessGroup,
    output: &LossOutput,
) -> Result<(f64, f64), TrainingError> {
    group.barrier()?;
    let reduced = scaled_all_reduce(group, &[output.loss.clone(), output.nll_loss.clone()])?;
    let value = |idx: usize| -> Result<f64, TrainingError> {
        reduced
            .get(idx)
            .ok_or_else(|| TrainingError::collective("reduction dropped a tensor"))?
            .to_dtype(DType::F32)
            .and_then(|t| t.to_vec0::<f32>())
            .map(f64::from)
            .map_err(to_runtime_error)
    };
    Ok((value(0)?, value(1)?))
}

/// CUDA device `local_rank` when available, otherwise the CPU.
pub fn select_device(rank: &RankContext) -> Result<Device, TrainingError> {
    if cuda_is_available() {
        Device::new_cuda(rank.local_rank).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to open CUDA device {}: {err}",
                rank.local_rank
            ))
        })
    } else {
        Ok(Device::Cpu)
    }
}

/// Full worker lifecycle for an already resolved rank: join the group, build
/// the model, load data and train.
pub fn run_worker(config: TrainingConfig, rank: RankContext) -> Result<FitSummary, TrainingError> {
    config.validate()?;
    let mut phase = Phase::Uninitialized;

    let (master_addr, master_port) =
        distributed::resolve_master(&config.distributed, |key| std::env::var(key).ok())?;
    let group = distributed::init_process_group(
        config.distributed.backend,
        rank,
        &master_addr,
        master_port,
    )?;
    phase.advance(Phase::ProcessGroupJoined)?;
    info!(
        rank = rank.global_rank,
        world_size = rank.world_size,
        backend = group.backend_name(),
        "joined process group"
    );

    let device = select_device(&rank)?;
    if let Some(seed) = config.runtime.seed {
        warn!(
            seed,
            "seeded training is slower and may still differ across hardware"
        );
        if device.is_cuda() {
            device.set_seed(seed).map_err(to_runtime_error)?;
        }
    }

    let model = model::build_model(&config.model, &device)?;
    phase.advance(Phase::ModelBuilt)?;
    if rank.is_primary() {
        match serde_json::to_string(&config) {
            Ok(resolved) => info!(config = %resolved, "resolved configuration"),
            Err(err) => warn!(%err, "failed to render configuration"),
        }
    }

    let seed = config.runtime.seed.unwrap_or(DEFAULT_DATA_SEED);
    let (train, valid) = data::load_train_valid(&config.data, seed)?;
    info!(train = train.len(), valid = valid.len(), "dataset split");

    let mut trainer = Trainer::new(config, rank, group, model, train, valid, device)?;
    trainer.fit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_one_step_at_a_time() {
        let mut phase = Phase::Uninitialized;
        assert!(phase.advance(Phase::ModelBuilt).is_err());
        phase.advance(Phase::ProcessGroupJoined).unwrap();
        phase.advance(Phase::ModelBuilt).unwrap();
        phase.advance(Phase::Training).unwrap();
        phase.advance(Phase::Terminated).unwrap();
        assert!(phase.advance(Phase::Terminated).is_err());
        assert_eq!(phase, Phase::Terminated);
    }

    #[test]
    fn fresh_state_starts_from_the_initial_best() {
        let state = TrainingState::default();
        assert_eq!(state.global_step, 0);
        assert_eq!(state.best_val_loss, BestLossTracker::INITIAL_BEST);
    }
}
