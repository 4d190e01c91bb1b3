use std::fs;

use anyhow::Result;
use candle_core::Device;
use seq2seq_ddp::{
    checkpoint::verify_checkpoint, run_worker, MarianSeq2Seq, RankContext, Seq2SeqModel,
    TrainingConfig,
};
use tempfile::tempdir;

#[test]
fn single_worker_trains_marian_from_jsonl_records() -> Result<()> {
    let dir = tempdir()?;
    let model_config = dir.path().join("bart.json");
    fs::write(
        &model_config,
        r#"{
            "vocab_size": 16,
            "d_model": 8,
            "encoder_layers": 1,
            "decoder_layers": 1,
            "encoder_attention_heads": 2,
            "decoder_attention_heads": 2,
            "encoder_ffn_dim": 16,
            "decoder_ffn_dim": 16,
            "max_position_embeddings": 32,
            "decoder_start_token_id": 1
        }"#,
    )?;

    let data = dir.path().join("pairs.jsonl");
    let records: String = (0..10u32)
        .map(|i| {
            format!(
                "{{\"input_ids\": [{}, {}, {}], \"labels\": [{}, {}]}}\n",
                2 + i % 13,
                3 + i % 12,
                4 + i % 11,
                5 + i % 10,
                2
            )
        })
        .collect();
    fs::write(&data, records)?;

    let mut config = TrainingConfig::default();
    config.data.data_path = Some(data);
    config.data.max_length = 6;
    config.data.val_rate = 0.2;
    config.data.batch_size = 2;
    config.data.decoder_start_token_id = 1;
    config.model.model_config = Some(model_config);
    config.optimizer.learning_rate = 1e-3;
    config.scheduler.warmup_steps = 2;
    config.runtime.epochs = 2;
    config.runtime.accumulate_grad_batches = 2;
    config.runtime.log_step = 2;
    config.runtime.save_model_path = dir.path().join("checkpoints");
    config.distributed.nproc_per_node = Some(1);

    let summary = run_worker(config, RankContext::single())?;
    assert_eq!(summary.train_losses.len(), 2);
    assert_eq!(summary.valid_losses.len(), 2);
    // 8 training records in batches of 2.
    assert_eq!(summary.global_step, 8);
    assert!(summary.best_loss.is_finite());

    let best_dir = dir.path().join("checkpoints").join("min_ppl_model");
    let manifest = verify_checkpoint(&best_dir)?;
    assert_eq!(manifest.progress.valid_loss, Some(summary.best_loss));
    let reloaded = MarianSeq2Seq::from_pretrained(&best_dir, &Device::Cpu)?;
    assert!(reloaded.parameter_count() > 0);
    Ok(())
}

#[test]
fn invalid_configuration_fails_before_joining_a_group() {
    let config = TrainingConfig::default();
    let err = run_worker(config, RankContext::single()).unwrap_err();
    assert!(err.to_string().contains("data.data_path is required"));
}
