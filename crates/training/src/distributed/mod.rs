//! Collective communication for synchronous data-parallel training.
//!
//! Every worker must issue the same collectives in the same order with the
//! same tensor shapes. Backends check what they can (sequence numbers, payload
//! lengths) and fail with [`TrainingError::Collective`] on divergence instead
//! of mixing unrelated values.

use candle_core::{backprop::GradStore, DType, Device, Shape, Tensor, Var};

use crate::{config::Backend, error::to_runtime_error, TrainingError};

pub mod launch;
pub mod local;
#[cfg(feature = "nccl")]
pub mod nccl;
pub mod tcp;

pub use launch::{
    default_nproc_per_node, resolve_master, resolve_rank_context, spawn_local_workers, SpawnPlan,
};
pub use local::LocalGroup;
#[cfg(feature = "nccl")]
pub use nccl::NcclGroup;
pub use tcp::TcpGroup;

/// Position of this worker in the job. Fixed for the worker's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankContext {
    pub local_rank: usize,
    pub global_rank: usize,
    pub world_size: usize,
}

impl RankContext {
    pub fn new(
        local_rank: usize,
        global_rank: usize,
        world_size: usize,
    ) -> Result<Self, TrainingError> {
        if world_size == 0 {
            return Err(TrainingError::topology("world size must be at least 1"));
        }
        if global_rank >= world_size {
            return Err(TrainingError::topology(format!(
                "rank {global_rank} out of range for world size {world_size}"
            )));
        }
        if local_rank > global_rank {
            return Err(TrainingError::topology(format!(
                "local rank {local_rank} exceeds global rank {global_rank}"
            )));
        }
        Ok(Self {
            local_rank,
            global_rank,
            world_size,
        })
    }

    pub fn single() -> Self {
        Self {
            local_rank: 0,
            global_rank: 0,
            world_size: 1,
        }
    }

    /// One designated writer per node: checkpoints, text logs and metrics
    /// are only produced where this holds.
    pub fn is_primary(&self) -> bool {
        self.local_rank == 0
    }
}

pub trait ProcessGroup: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Starts a sum all-reduce and returns without waiting for peers.
    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<PendingReduce, TrainingError>;

    /// Blocks until every worker reaches the same barrier.
    fn barrier(&self) -> Result<(), TrainingError>;

    fn backend_name(&self) -> &'static str;
}

pub(crate) trait ReduceCompletion: Send {
    fn complete(self: Box<Self>) -> Result<Vec<f32>, TrainingError>;
}

/// Result of a single-participant reduction.
pub(crate) struct Ready(pub Vec<f32>);

impl ReduceCompletion for Ready {
    fn complete(self: Box<Self>) -> Result<Vec<f32>, TrainingError> {
        Ok(self.0)
    }
}

/// Handle to an in-flight all-reduce. [`PendingReduce::wait`] yields the sum
/// with the input's shape, dtype and device.
#[must_use = "an issued reduction must be waited on"]
pub struct PendingReduce {
    completion: Box<dyn ReduceCompletion>,
    shape: Shape,
    dtype: DType,
    device: Device,
}

impl PendingReduce {
    pub(crate) fn new(tensor: &Tensor, completion: Box<dyn ReduceCompletion>) -> Self {
        Self {
            completion,
            shape: tensor.shape().clone(),
            dtype: tensor.dtype(),
            device: tensor.device().clone(),
        }
    }

    pub fn wait(self) -> Result<Tensor, TrainingError> {
        let expected = self.shape.elem_count();
        let data = self.completion.complete()?;
        if data.len() != expected {
            return Err(TrainingError::collective(format!(
                "reduction returned {} elements, expected {}",
                data.len(),
                expected
            )));
        }
        Tensor::from_vec(data, self.shape, &Device::Cpu)
            .and_then(|t| t.to_dtype(self.dtype))
            .and_then(|t| t.to_device(&self.device))
            .map_err(to_runtime_error)
    }
}

/// Copies a tensor into a flat host `f32` buffer for transport.
pub(crate) fn stage_to_host(tensor: &Tensor) -> Result<Vec<f32>, TrainingError> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)
}

/// Sums each tensor across workers and divides by the world size.
///
/// All reductions are issued before any is awaited, then awaited in issue
/// order. Callers on every rank must pass the same number of tensors with
/// matching shapes.
pub fn scaled_all_reduce(
    group: &dyn ProcessGroup,
    tensors: &[Tensor],
) -> Result<Vec<Tensor>, TrainingError> {
    let pending = tensors
        .iter()
        .map(|tensor| group.all_reduce_sum(tensor))
        .collect::<Result<Vec<_>, _>>()?;
    let scale = 1.0 / group.world_size() as f64;
    pending
        .into_iter()
        .map(|handle| {
            handle
                .wait()?
                .affine(scale, 0.0)
                .map_err(to_runtime_error)
        })
        .collect()
}

/// Overwrites every replica's parameters with rank 0's values.
pub fn broadcast_parameters(
    group: &dyn ProcessGroup,
    params: &[(String, Var)],
) -> Result<(), TrainingError> {
    if group.world_size() == 1 {
        return Ok(());
    }
    let mut pending = Vec::with_capacity(params.len());
    for (_, var) in params {
        let contribution = if group.rank() == 0 {
            var.as_tensor().clone()
        } else {
            var.as_tensor().zeros_like().map_err(to_runtime_error)?
        };
        pending.push((var, group.all_reduce_sum(&contribution)?));
    }
    for (var, handle) in pending {
        var.set(&handle.wait()?).map_err(to_runtime_error)?;
    }
    Ok(())
}

/// Replaces each parameter gradient with its mean across workers.
///
/// Parameters without a local gradient contribute zeros so every rank issues
/// one reduction per parameter.
pub fn average_gradients(
    group: &dyn ProcessGroup,
    grads: &mut GradStore,
    params: &[(String, Var)],
) -> Result<(), TrainingError> {
    if group.world_size() == 1 {
        return Ok(());
    }
    let mut pending = Vec::with_capacity(params.len());
    for (_, var) in params {
        let grad = match grads.remove(var.as_tensor()) {
            Some(grad) => grad,
            None => var.as_tensor().zeros_like().map_err(to_runtime_error)?,
        };
        pending.push((var, group.all_reduce_sum(&grad)?));
    }
    let scale = 1.0 / group.world_size() as f64;
    for (var, handle) in pending {
        let averaged = handle.wait()?.affine(scale, 0.0).map_err(to_runtime_error)?;
        grads.insert(var.as_tensor(), averaged);
    }
    Ok(())
}

/// Joins the process group for `rank` using the configured backend.
pub fn init_process_group(
    backend: Backend,
    rank: RankContext,
    master_addr: &str,
    master_port: u16,
) -> Result<Box<dyn ProcessGroup>, TrainingError> {
    if rank.world_size == 1 {
        return Ok(Box::new(LocalGroup::single()));
    }
    match backend {
        Backend::Tcp => Ok(Box::new(TcpGroup::connect(
            master_addr,
            master_port,
            rank.global_rank,
            rank.world_size,
        )?)),
        #[cfg(feature = "nccl")]
        Backend::Nccl => Ok(Box::new(NcclGroup::connect(
            master_addr,
            master_port,
            rank,
        )?)),
        #[cfg(not(feature = "nccl"))]
        Backend::Nccl => Err(TrainingError::initialization(
            "nccl backend requested but the binary was built without the `nccl` feature",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn rank_context_rejects_out_of_range_ranks() {
        assert!(RankContext::new(0, 3, 2).is_err());
        assert!(RankContext::new(0, 0, 0).is_err());
        assert!(RankContext::new(2, 1, 4).is_err());
        let ctx = RankContext::new(1, 5, 8).unwrap();
        assert!(!ctx.is_primary());
        assert!(RankContext::single().is_primary());
    }

    #[test]
    fn identical_scalars_survive_scaled_reduction() {
        let world_size = 4;
        let handles: Vec<_> = LocalGroup::new_group(world_size)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let loss = Tensor::new(2.5f32, &Device::Cpu).unwrap();
                    let nll = Tensor::new(1.25f32, &Device::Cpu).unwrap();
                    let reduced = scaled_all_reduce(&group, &[loss, nll]).unwrap();
                    (
                        reduced[0].to_vec0::<f32>().unwrap(),
                        reduced[1].to_vec0::<f32>().unwrap(),
                    )
                })
            })
            .collect();
        for handle in handles {
            let (loss, nll) = handle.join().unwrap();
            assert!((loss - 2.5).abs() < 1e-6);
            assert!((nll - 1.25).abs() < 1e-6);
        }
    }

    #[test]
    fn scaled_reduction_averages_distinct_values() {
        let handles: Vec<_> = LocalGroup::new_group(3)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let value = group.rank() as f32;
                    let tensor = Tensor::new(&[value, 2.0 * value], &Device::Cpu).unwrap();
                    scaled_all_reduce(&group, &[tensor]).unwrap()[0]
                        .to_vec1::<f32>()
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            let values = handle.join().unwrap();
            assert!((values[0] - 1.0).abs() < 1e-6);
            assert!((values[1] - 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn broadcast_copies_rank_zero_parameters() {
        let handles: Vec<_> = LocalGroup::new_group(3)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let init = group.rank() as f32 + 1.0;
                    let var = Var::new(&[init, init], &Device::Cpu).unwrap();
                    let params = vec![("w".to_string(), var.clone())];
                    broadcast_parameters(&group, &params).unwrap();
                    var.as_tensor().to_vec1::<f32>().unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![1.0, 1.0]);
        }
    }

    #[test]
    fn gradients_are_averaged_and_missing_ones_count_as_zero() {
        let handles: Vec<_> = LocalGroup::new_group(2)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let a = Var::new(&[1f32, 1.0], &Device::Cpu).unwrap();
                    let b = Var::new(&[1f32], &Device::Cpu).unwrap();
                    let scale = if group.rank() == 0 { 2.0 } else { 4.0 };
                    let loss = a.as_tensor().affine(scale, 0.0).unwrap().sum_all().unwrap();
                    let loss = if group.rank() == 0 {
                        (loss + b.as_tensor().sum_all().unwrap()).unwrap()
                    } else {
                        loss
                    };
                    let mut grads = loss.backward().unwrap();
                    let params = vec![("a".to_string(), a.clone()), ("b".to_string(), b.clone())];
                    average_gradients(&group, &mut grads, &params).unwrap();
                    (
                        grads.get(a.as_tensor()).unwrap().to_vec1::<f32>().unwrap(),
                        grads.get(b.as_tensor()).unwrap().to_vec1::<f32>().unwrap(),
                    )
                })
            })
            .collect();
        for handle in handles {
            let (grad_a, grad_b) = handle.join().unwrap();
            assert_eq!(grad_a, vec![3.0, 3.0]);
            assert_eq!(grad_b, vec![0.5]);
        }
    }

    #[test]
    fn single_worker_group_skips_communication() {
        let group = init_process_group(Backend::Tcp, RankContext::single(), "127.0.0.1", 0).unwrap();
        assert_eq!(group.world_size(), 1);
        let tensor = Tensor::new(&[3f32, 4.0], &Device::Cpu).unwrap();
        let reduced = scaled_all_reduce(group.as_ref(), &[tensor]).unwrap();
        assert_eq!(reduced[0].to_vec1::<f32>().unwrap(), vec![3.0, 4.0]);
        group.barrier().unwrap();
    }
}
