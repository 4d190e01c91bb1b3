/// Patience-based early stopping on validation loss.
///
/// A loss improves when it is below `best - min_delta`; the first observation
/// always improves. Training stops once the number of consecutive
/// non-improving epochs exceeds `patience`. A patience of zero disables
/// stopping.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: Option<f64>,
    counter: usize,
    stopped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub improved: bool,
    pub counter: usize,
    pub stop: bool,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta: min_delta.max(0.0),
            best: None,
            counter: 0,
            stopped: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.patience > 0
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn should_stop(&self) -> bool {
        self.stopped
    }

    pub fn observe(&mut self, loss: f64) -> Observation {
        let improved = match self.best {
            None => true,
            Some(best) => loss < best - self.min_delta,
        };
        if improved {
            self.best = Some(loss);
            self.counter = 0;
        } else {
            self.counter += 1;
            if self.is_enabled() && self.counter > self.patience {
                self.stopped = true;
            }
        }
        Observation {
            improved,
            counter: self.counter,
            stop: self.stopped,
        }
    }
}

/// Tracks the lowest validation loss and reports strict decreases, which is
/// when the best-model snapshot gets replaced.
#[derive(Debug, Clone)]
pub struct BestLossTracker {
    best: f64,
}

impl BestLossTracker {
    /// Starts above any realistic loss so the first finite value wins.
    pub const INITIAL_BEST: f64 = 1000.0;

    pub fn new() -> Self {
        Self {
            best: Self::INITIAL_BEST,
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn update(&mut self, loss: f64) -> bool {
        if loss < self.best {
            self.best = loss;
            true
        } else {
            false
        }
    }
}

impl Default for BestLossTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_on_third_non_improvement_with_patience_two() {
        let mut stopping = EarlyStopping::new(2, 0.0);
        assert!(stopping.observe(1.0).improved);
        assert!(stopping.observe(0.8).improved);
        assert_eq!(
            stopping.observe(0.9),
            Observation {
                improved: false,
                counter: 1,
                stop: false
            }
        );
        assert!(!stopping.observe(0.85).stop);
        let third = stopping.observe(0.8);
        assert!(third.stop);
        assert_eq!(third.counter, 3);
        assert_eq!(stopping.best(), Some(0.8));
    }

    #[test]
    fn improvement_resets_the_counter() {
        let mut stopping = EarlyStopping::new(2, 0.0);
        stopping.observe(1.0);
        stopping.observe(1.1);
        stopping.observe(1.2);
        let obs = stopping.observe(0.5);
        assert!(obs.improved);
        assert_eq!(obs.counter, 0);
        assert!(!stopping.observe(0.6).stop);
        assert!(!stopping.should_stop());
    }

    #[test]
    fn zero_patience_never_stops() {
        let mut stopping = EarlyStopping::new(0, 0.0);
        stopping.observe(1.0);
        for _ in 0..10 {
            assert!(!stopping.observe(2.0).stop);
        }
        assert!(!stopping.is_enabled());
    }

    #[test]
    fn min_delta_requires_a_margin() {
        let mut stopping = EarlyStopping::new(5, 0.1);
        stopping.observe(1.0);
        assert!(!stopping.observe(0.95).improved);
        assert!(stopping.observe(0.85).improved);
    }

    #[test]
    fn best_loss_updates_only_on_strict_decrease() {
        let mut tracker = BestLossTracker::new();
        assert!(tracker.update(2.0));
        assert!(!tracker.update(2.0));
        assert!(!tracker.update(2.5));
        assert!(tracker.update(1.5));
        assert_eq!(tracker.best(), 1.5);
        assert!(!BestLossTracker::new().update(f64::NAN));
    }
}
