use std::{ffi::OsString, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use seq2seq_ddp::{
    config::parse_adam_betas,
    distributed::{default_nproc_per_node, resolve_rank_context, spawn_local_workers, SpawnPlan},
    logging::init_tracing,
    run_worker, Backend, RankContext, TrainingConfig,
};
use tracing::info;

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {err:#}");
        std::process::exit(1);
    }
}

/// Unset flags keep the value from `--config`, or the built-in default noted
/// in each help line.
#[derive(Parser, Debug)]
#[command(author, version, about = "Distributed data-parallel seq2seq training", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "TOML or JSON file with training settings")]
    config: Option<PathBuf>,

    #[arg(long, help = "Training epochs [default: 15]")]
    epochs: Option<usize>,
    #[arg(long, help = "Global batch size, split across local processes [default: 64]")]
    batch_size: Option<usize>,
    #[arg(long, help = "Log the training loss every N batches [default: 200]")]
    log_step: Option<usize>,
    #[arg(long, value_name = "PATH")]
    data_path: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Checkpoint root [default: checkpoints]")]
    save_model_path: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Directory with config.json and model.safetensors")]
    pretrained_model: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Architecture JSON for a freshly initialized model")]
    model_config: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Directory for the daily text log")]
    log_path: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Directory for TensorBoard scalars")]
    tb_log_dir: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Tokenizer directory for raw text records")]
    vocab_path: Option<PathBuf>,
    #[arg(long, help = "[default: 128]")]
    max_length: Option<usize>,
    #[arg(long, help = "[default: 3e-5]")]
    lr: Option<f64>,
    #[arg(long, help = "[default: 1e-8]")]
    adam_eps: Option<f64>,
    #[arg(long, help = "[default: 100]")]
    warmup_steps: Option<usize>,
    #[arg(long, help = "[default: 0.1]")]
    label_smoothing: Option<f64>,
    #[arg(long, help = "[default: 0.01]")]
    weight_decay: Option<f64>,
    #[arg(long, value_name = "(B1,B2)", help = "[default: (0.9,0.999)]")]
    adam_betas: Option<String>,
    #[arg(long, help = "[default: 4]")]
    accumulate_grad_batches: Option<usize>,
    #[arg(long, help = "Global gradient norm ceiling, 0 disables [default: 0.1]")]
    gradient_clip_val: Option<f64>,
    #[arg(long, help = "Epochs without improvement before stopping, 0 disables [default: 0]")]
    patience: Option<usize>,
    #[arg(long, help = "Fraction of records held out for validation [default: 0.001]")]
    val_rate: Option<f64>,
    #[arg(long, help = "Accepted for compatibility; loading is synchronous [default: 1]")]
    num_workers: Option<usize>,
    #[arg(long, allow_negative_numbers = true, help = "Node count with --multi-spawn [default: -1]")]
    world_size: Option<i64>,
    #[arg(long, allow_negative_numbers = true, help = "[default: -1]")]
    rank: Option<i64>,
    #[arg(long, allow_negative_numbers = true, help = "Used when LOCAL_RANK is unset [default: -1]")]
    local_rank: Option<i64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, help = "Spawn one worker per local device from this process")]
    multi_spawn: bool,
    #[arg(long, env = "LOCAL_WORLD_SIZE", help = "Workers per node [default: visible devices]")]
    nproc_per_node: Option<usize>,
    #[arg(long, help = "[default: 0]")]
    node_rank: Option<usize>,
    #[arg(long, value_enum)]
    backend: Option<Backend>,
    #[arg(long, help = "[default: 127.0.0.1]")]
    master_addr: Option<String>,
    #[arg(long, help = "[default: 29500]")]
    master_port: Option<u16>,
    #[arg(long, help = "[default: 0]")]
    pad_token_id: Option<u32>,
    #[arg(long, help = "[default: 102]")]
    decoder_start_token_id: Option<u32>,
}

impl Args {
    fn apply(&self, config: &mut TrainingConfig) -> Result<()> {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }
        fn set_some<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *target = value.clone();
            }
        }

        let data = &mut config.data;
        set_some(&mut data.data_path, &self.data_path);
        set_some(&mut data.vocab_path, &self.vocab_path);
        set(&mut data.batch_size, &self.batch_size);
        set(&mut data.max_length, &self.max_length);
        set(&mut data.val_rate, &self.val_rate);
        set(&mut data.num_workers, &self.num_workers);
        set(&mut data.pad_token_id, &self.pad_token_id);
        set(&mut data.decoder_start_token_id, &self.decoder_start_token_id);

        set_some(&mut config.model.pretrained_model, &self.pretrained_model);
        set_some(&mut config.model.model_config, &self.model_config);

        let optimizer = &mut config.optimizer;
        set(&mut optimizer.learning_rate, &self.lr);
        set(&mut optimizer.adam_eps, &self.adam_eps);
        set(&mut optimizer.weight_decay, &self.weight_decay);
        set(&mut optimizer.gradient_clip_val, &self.gradient_clip_val);
        if let Some(betas) = &self.adam_betas {
            optimizer.adam_betas = parse_adam_betas(betas)?;
        }

        set(&mut config.scheduler.warmup_steps, &self.warmup_steps);

        let runtime = &mut config.runtime;
        set(&mut runtime.epochs, &self.epochs);
        set(&mut runtime.log_step, &self.log_step);
        set(&mut runtime.label_smoothing, &self.label_smoothing);
        set(&mut runtime.accumulate_grad_batches, &self.accumulate_grad_batches);
        set(&mut runtime.patience, &self.patience);
        set(&mut runtime.save_model_path, &self.save_model_path);
        set_some(&mut runtime.seed, &self.seed);
        set_some(&mut runtime.log_path, &self.log_path);
        set_some(&mut runtime.tb_log_dir, &self.tb_log_dir);

        let distributed = &mut config.distributed;
        set(&mut distributed.world_size, &self.world_size);
        set(&mut distributed.rank, &self.rank);
        set(&mut distributed.local_rank, &self.local_rank);
        set(&mut distributed.node_rank, &self.node_rank);
        set(&mut distributed.backend, &self.backend);
        set(&mut distributed.master_addr, &self.master_addr);
        set(&mut distributed.master_port, &self.master_port);
        set_some(&mut distributed.nproc_per_node, &self.nproc_per_node);
        distributed.multi_spawn |= self.multi_spawn;
        Ok(())
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => TrainingConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => TrainingConfig::default(),
    };
    args.apply(&mut config)?;
    config.validate()?;

    if config.distributed.multi_spawn {
        let _guard = init_tracing(None, &RankContext::single())?;
        let nprocs = config
            .distributed
            .nproc_per_node
            .unwrap_or_else(default_nproc_per_node);
        let plan = SpawnPlan::from_config(&config.distributed, nprocs)?;
        // Children rerun this command as externally launched workers.
        let child_args: Vec<OsString> = std::env::args_os()
            .skip(1)
            .filter(|arg| arg != "--multi-spawn")
            .collect();
        spawn_local_workers(&plan, &child_args).context("worker launch failed")?;
        return Ok(());
    }

    let rank = resolve_rank_context(&config.distributed, |key| std::env::var(key).ok())
        .context("externally launched workers need LOCAL_RANK, RANK and WORLD_SIZE")?;
    let _guard = init_tracing(config.runtime.log_path.as_deref(), &rank)?;

    let summary = run_worker(config, rank)?;
    if rank.is_primary() {
        info!(
            epochs = summary.train_losses.len(),
            best_loss = summary.best_loss,
            stopped_early = summary.stopped_early,
            global_step = summary.global_step,
            "training finished"
        );
    }
    Ok(())
}
