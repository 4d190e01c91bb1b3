use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{config, error::to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;
const CLIP_EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        AdamWConfig {
            learning_rate: value.learning_rate,
            beta1: value.adam_betas[0],
            beta2: value.adam_betas[1],
            epsilon: value.adam_eps,
            weight_decay: value.weight_decay,
        }
    }
}

/// AdamW with decoupled weight decay over a fixed, ordered parameter list.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl TrainerOptimizer {
    /// Parameters whose name contains any entry of `weight_decay_exclude`
    /// skip weight decay.
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        weight_decay_exclude: &[String],
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let first_moment = Tensor::zeros(tensor.dims(), DType::F32, tensor.device())
                .map_err(to_runtime_error)?;
            let second_moment = first_moment.zeros_like().map_err(to_runtime_error)?;
            let apply_weight_decay = !weight_decay_exclude
                .iter()
                .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()));

            params.push(ParameterSlot {
                name,
                dtype: tensor.dtype(),
                param: var,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    /// Applies one update from `grads`, consuming the gradients it uses.
    /// Parameters without a gradient are left untouched.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        self.step += 1;
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = 1.0 / bias_correction1.max(EPS);
        let scale_v = 1.0 / bias_correction2.max(EPS);

        for slot in self.params.iter_mut() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .and_then(|m| m.add(&grad.affine(1.0 - cfg.beta1, 0.0)?))
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .and_then(|v| v.add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?))
                .map_err(to_runtime_error)?;

            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = new_m
                .affine(scale_m, 0.0)
                .and_then(|m| m.div(&denom))
                .and_then(|u| u.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let base = slot
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed
                .sub(&update)
                .and_then(|t| t.to_dtype(slot.dtype))
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    /// Drops every parameter gradient held in `grads`.
    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }
}

/// Adds the parameter gradients of `new_grads` into `accum`. Gradients of
/// non-parameter tensors are dropped.
pub fn merge_gradient_store(
    accum: &mut GradStore,
    mut new_grads: GradStore,
    params: &[(String, Var)],
) -> Result<(), TrainingError> {
    for (_, var) in params {
        let tensor = var.as_tensor();
        if let Some(grad) = new_grads.remove(tensor) {
            let combined = match accum.remove(tensor) {
                Some(existing) => existing.add(&grad).map_err(to_runtime_error)?,
                None => grad,
            };
            accum.insert(tensor, combined);
        }
    }
    Ok(())
}

/// Rescales gradients so their global L2 norm is at most `max_norm` and
/// returns the norm measured before clipping.
pub fn clip_grad_norm(
    grads: &mut GradStore,
    params: &[(String, Var)],
    max_norm: f64,
) -> Result<f64, TrainingError> {
    let mut sum_squares = 0.0f64;
    for (_, var) in params {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq = grad
                .to_dtype(DType::F32)
                .and_then(|g| g.sqr())
                .and_then(|g| g.sum_all())
                .and_then(|g| g.to_vec0::<f32>())
                .map_err(to_runtime_error)?;
            sum_squares += sq as f64;
        }
    }
    let total_norm = sum_squares.sqrt();

    if max_norm > 0.0 && total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + CLIP_EPS);
        for (_, var) in params {
            let tensor = var.as_tensor();
            if let Some(grad) = grads.remove(tensor) {
                let clipped = grad.affine(clip_coef, 0.0).map_err(to_runtime_error)?;
                grads.insert(tensor, clipped);
            }
        }
    }
    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn config(weight_decay: f64) -> AdamWConfig {
        AdamWConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
        }
    }

    fn quadratic_grads(var: &Var) -> GradStore {
        var.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap()
    }

    #[test]
    fn first_step_moves_by_learning_rate_against_gradient_sign() {
        let var = Var::new(&[1f32, -2.0], &Device::Cpu).unwrap();
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".into(), var.clone())], config(0.0), &[]).unwrap();
        let mut grads = quadratic_grads(&var);
        optimizer.step(&mut grads).unwrap();
        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!((values[0] - 0.9).abs() < 1e-5);
        assert!((values[1] + 1.9).abs() < 1e-5);
        assert_eq!(optimizer.steps_taken(), 1);
        assert!(grads.get(var.as_tensor()).is_none());
    }

    #[test]
    fn weight_decay_respects_exclusions() {
        let decayed = Var::new(&[1f32], &Device::Cpu).unwrap();
        let exempt = Var::new(&[1f32], &Device::Cpu).unwrap();
        let mut optimizer = TrainerOptimizer::new(
            vec![
                ("layer.weight".into(), decayed.clone()),
                ("layer_norm.bias".into(), exempt.clone()),
            ],
            config(0.5),
            &["bias".to_string()],
        )
        .unwrap();
        let loss = (decayed.as_tensor().affine(0.0, 0.0).unwrap()
            + exempt.as_tensor().affine(0.0, 0.0).unwrap())
        .unwrap()
        .sum_all()
        .unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();
        let decayed = decayed.as_tensor().to_vec1::<f32>().unwrap()[0];
        let exempt = exempt.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((decayed - 0.95).abs() < 1e-5);
        assert!((exempt - 1.0).abs() < 1e-5);
    }

    #[test]
    fn clipping_bounds_the_global_norm() {
        let a = Var::new(&[3f32], &Device::Cpu).unwrap();
        let b = Var::new(&[4f32], &Device::Cpu).unwrap();
        let params = vec![("a".to_string(), a.clone()), ("b".to_string(), b.clone())];
        let loss = (a.as_tensor().sqr().unwrap() + b.as_tensor().sqr().unwrap())
            .unwrap()
            .affine(0.5, 0.0)
            .unwrap()
            .sum_all()
            .unwrap();
        let mut grads = loss.backward().unwrap();

        let norm = clip_grad_norm(&mut grads, &params, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-5);
        let ga = grads.get(a.as_tensor()).unwrap().to_vec1::<f32>().unwrap()[0];
        let gb = grads.get(b.as_tensor()).unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((ga - 0.6).abs() < 1e-4);
        assert!((gb - 0.8).abs() < 1e-4);

        let untouched = clip_grad_norm(&mut grads, &params, 0.0).unwrap();
        assert!((untouched - 1.0).abs() < 1e-4);
    }

    #[test]
    fn merging_accumulates_micro_batch_gradients() {
        let var = Var::new(&[2f32], &Device::Cpu).unwrap();
        let params = vec![("w".to_string(), var.clone())];
        let mut accum = quadratic_grads(&var);
        merge_gradient_store(&mut accum, quadratic_grads(&var), &params).unwrap();
        let grad = accum.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(grad, vec![8.0]);
    }
}
