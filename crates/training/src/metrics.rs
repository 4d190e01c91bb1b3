use std::time::{Duration, Instant};

use crate::TrainingError;

/// Running totals for one pass over a loader.
#[derive(Debug)]
pub struct EpochMetrics {
    loader: &'static str,
    loss_sum: f64,
    nll_sum: f64,
    batches: usize,
    started: Instant,
}

impl EpochMetrics {
    pub fn new(loader: &'static str) -> Self {
        Self {
            loader,
            loss_sum: 0.0,
            nll_sum: 0.0,
            batches: 0,
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, loss: f64, nll: f64) {
        self.loss_sum += loss;
        self.nll_sum += nll;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn running_loss(&self) -> f64 {
        self.loss_sum
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Mean over recorded batches. A pass without batches is an error.
    pub fn finish(self) -> Result<EpochSummary, TrainingError> {
        if self.batches == 0 {
            return Err(TrainingError::EmptyLoader(self.loader));
        }
        let count = self.batches as f64;
        Ok(EpochSummary {
            mean_loss: self.loss_sum / count,
            mean_nll: self.nll_sum / count,
            batches: self.batches,
            duration: self.started.elapsed(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub mean_loss: f64,
    pub mean_nll: f64,
    pub batches: usize,
    pub duration: Duration,
}

impl EpochSummary {
    pub fn perplexity(&self) -> f64 {
        self.mean_loss.exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_recorded_batches() {
        let mut metrics = EpochMetrics::new("train");
        metrics.record(2.0, 1.5);
        metrics.record(4.0, 2.5);
        assert_eq!(metrics.batches(), 2);
        assert_eq!(metrics.running_loss(), 6.0);
        let summary = metrics.finish().unwrap();
        assert_eq!(summary.mean_loss, 3.0);
        assert_eq!(summary.mean_nll, 2.0);
        assert!((summary.perplexity() - 3f64.exp()).abs() < 1e-12);
    }

    #[test]
    fn empty_pass_is_an_error() {
        match EpochMetrics::new("valid").finish() {
            Err(TrainingError::EmptyLoader(name)) => assert_eq!(name, "valid"),
            other => panic!("expected empty loader error, got {other:?}"),
        }
    }
}
