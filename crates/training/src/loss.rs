use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{error::to_runtime_error, TrainingError};

/// Label-smoothed negative log-likelihood over decoder logits.
///
/// Ignored positions are zeroed before averaging and the mean runs over every
/// `batch * seq` position, so padding stays in the denominator.
#[derive(Debug, Clone)]
pub struct LabelSmoothedNllLoss {
    epsilon: f64,
    ignore_index: Option<u32>,
}

impl LabelSmoothedNllLoss {
    pub fn new(epsilon: f64) -> Result<Self, TrainingError> {
        if !(0.0..1.0).contains(&epsilon) {
            return Err(TrainingError::initialization(
                "label smoothing must be in [0, 1)",
            ));
        }
        Ok(Self {
            epsilon,
            ignore_index: None,
        })
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Applies `log_softmax` over the vocabulary before computing the loss.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let lprobs = ops::log_softmax(logits, D::Minus1).map_err(to_runtime_error)?;
        label_smoothed_nll_loss(&lprobs, targets, self.epsilon, self.ignore_index)
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Smoothed loss, the quantity that gets backpropagated.
    pub loss: Tensor,
    pub nll_loss: Tensor,
    pub tokens: usize,
}

impl LossOutput {
    pub fn loss_value(&self) -> Result<f32, TrainingError> {
        scalar_value(&self.loss)
    }

    pub fn nll_value(&self) -> Result<f32, TrainingError> {
        scalar_value(&self.nll_loss)
    }
}

pub fn label_smoothed_nll_loss(
    lprobs: &Tensor,
    target: &Tensor,
    epsilon: f64,
    ignore_index: Option<u32>,
) -> Result<LossOutput, TrainingError> {
    if !(0.0..1.0).contains(&epsilon) {
        return Err(TrainingError::runtime(format!(
            "label smoothing epsilon {epsilon} outside [0, 1)"
        )));
    }

    let dims = lprobs.dims();
    if dims.len() != target.rank() + 1 {
        return Err(TrainingError::runtime(format!(
            "log-probabilities rank {} must be target rank {} plus one",
            dims.len(),
            target.rank()
        )));
    }
    let (vocab_size, token_dims) = match dims.split_last() {
        Some((vocab, rest)) => (*vocab, rest),
        None => return Err(TrainingError::runtime("log-probabilities must not be scalar")),
    };
    if target.dims() != token_dims {
        return Err(TrainingError::runtime(format!(
            "target shape {:?} does not match log-probabilities {:?}",
            target.dims(),
            dims
        )));
    }
    let token_count: usize = token_dims.iter().product();
    if token_count == 0 || vocab_size == 0 {
        return Err(TrainingError::runtime(
            "no tokens available for loss computation",
        ));
    }

    let lprobs = lprobs
        .reshape((token_count, vocab_size))
        .map_err(to_runtime_error)?;
    let target = match target.dtype() {
        DType::U32 => target.clone(),
        DType::I64 | DType::U8 => target.to_dtype(DType::U32).map_err(to_runtime_error)?,
        dtype => {
            return Err(TrainingError::runtime(format!(
                "unsupported target dtype {:?}",
                dtype
            )))
        }
    };
    let target = target
        .to_device(lprobs.device())
        .and_then(|t| t.reshape((token_count, 1)))
        .map_err(to_runtime_error)?;

    let mut nll = lprobs
        .gather(&target, 1)
        .and_then(|t| t.neg())
        .map_err(to_runtime_error)?;
    let mut smooth = lprobs
        .sum_keepdim(1)
        .and_then(|t| t.neg())
        .map_err(to_runtime_error)?;

    let tokens = if let Some(ignore_index) = ignore_index {
        let keep = target.ne(ignore_index).map_err(to_runtime_error)?;
        let zeros = nll.zeros_like().map_err(to_runtime_error)?;
        nll = keep.where_cond(&nll, &zeros).map_err(to_runtime_error)?;
        smooth = keep.where_cond(&smooth, &zeros).map_err(to_runtime_error)?;
        keep.to_dtype(DType::F32)
            .and_then(|t| t.sum_all())
            .and_then(|t| t.to_vec0::<f32>())
            .map_err(to_runtime_error)?
            .round() as usize
    } else {
        token_count
    };

    let nll_loss = nll.mean_all().map_err(to_runtime_error)?;
    let smooth_loss = smooth.mean_all().map_err(to_runtime_error)?;
    let eps_i = epsilon / vocab_size as f64;
    let loss = nll_loss
        .affine(1.0 - epsilon, 0.0)
        .and_then(|nll_term| nll_term.add(&smooth_loss.affine(eps_i, 0.0)?))
        .map_err(to_runtime_error)?;

    Ok(LossOutput {
        loss,
        nll_loss,
        tokens,
    })
}

fn scalar_value(tensor: &Tensor) -> Result<f32, TrainingError> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)
}
