use crate::TrainingError;

pub trait LRScheduler: Send {
    /// Returns the learning rate for the upcoming optimizer step and advances.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

/// Linear ramp from zero to `base_lr` over `warmup_steps`, then linear decay
/// back to zero at `total_steps`.
///
/// Optimizer step `s` (zero based) uses `base_lr * s / warmup` during warmup
/// and `base_lr * (total - s) / (total - warmup)` afterwards, floored at zero.
#[derive(Debug, Clone)]
pub struct LinearWarmupDecay {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
    current_lr: f64,
}

impl LinearWarmupDecay {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        Ok(Self {
            base_lr,
            warmup_steps,
            total_steps,
            step: 0,
            current_lr: 0.0,
        })
    }

    /// Steps per epoch rounded up to whole optimizer steps, times epochs.
    pub fn total_steps_for(batches_per_epoch: usize, accumulate: usize, epochs: usize) -> usize {
        batches_per_epoch.div_ceil(accumulate.max(1)) * epochs
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    fn compute_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        self.base_lr * (remaining / span).max(0.0)
    }
}

impl LRScheduler for LinearWarmupDecay {
    fn step(&mut self) -> f64 {
        let lr = self.compute_lr(self.step);
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(scheduler: &mut LinearWarmupDecay, steps: usize) -> Vec<f64> {
        (0..steps).map(|_| scheduler.step()).collect()
    }

    #[test]
    fn warms_up_then_decays_to_zero() {
        let mut scheduler = LinearWarmupDecay::new(1.0, 2, 10).unwrap();
        let lrs = collect(&mut scheduler, 12);
        let expected = [0.0, 0.5, 1.0, 0.875, 0.75, 0.625, 0.5, 0.375, 0.25, 0.125, 0.0, 0.0];
        for (got, want) in lrs.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{lrs:?}");
        }
        assert_eq!(scheduler.learning_rate(), 0.0);
    }

    #[test]
    fn zero_warmup_starts_at_base_rate() {
        let mut scheduler = LinearWarmupDecay::new(3e-5, 0, 4).unwrap();
        assert!((scheduler.step() - 3e-5).abs() < 1e-15);
        assert!((scheduler.step() - 2.25e-5).abs() < 1e-15);
    }

    #[test]
    fn warmup_longer_than_training_never_decays() {
        let mut scheduler = LinearWarmupDecay::new(1.0, 100, 4).unwrap();
        let lrs = collect(&mut scheduler, 4);
        assert_eq!(lrs, vec![0.0, 0.01, 0.02, 0.03]);
    }

    #[test]
    fn total_steps_round_partial_accumulation_up() {
        assert_eq!(LinearWarmupDecay::total_steps_for(10, 4, 3), 9);
        assert_eq!(LinearWarmupDecay::total_steps_for(8, 4, 2), 4);
        assert_eq!(LinearWarmupDecay::total_steps_for(5, 1, 1), 5);
        assert!(LinearWarmupDecay::new(1.0, 0, 0).is_err());
        assert!(LinearWarmupDecay::new(0.0, 0, 1).is_err());
    }
}
