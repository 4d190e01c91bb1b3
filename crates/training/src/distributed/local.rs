//! In-process process group. Each member lives on its own thread and meets
//! its peers in a shared hub keyed by collective sequence number.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
};

use candle_core::Tensor;

use super::{stage_to_host, PendingReduce, ProcessGroup, Ready, ReduceCompletion};
use crate::TrainingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Reduce,
    Barrier,
}

struct Slot {
    op: Op,
    contributions: Vec<Option<Vec<f32>>>,
    arrived: usize,
    collected: usize,
    result: Option<Arc<Vec<f32>>>,
}

struct Hub {
    world_size: usize,
    slots: Mutex<HashMap<u64, Slot>>,
    ready: Condvar,
}

impl Hub {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<u64, Slot>>, TrainingError> {
        self.slots
            .lock()
            .map_err(|_| TrainingError::collective("local process group hub poisoned"))
    }

    fn contribute(
        &self,
        seq: u64,
        rank: usize,
        op: Op,
        data: Vec<f32>,
    ) -> Result<(), TrainingError> {
        let mut slots = self.lock()?;
        let slot = slots.entry(seq).or_insert_with(|| Slot {
            op,
            contributions: vec![None; self.world_size],
            arrived: 0,
            collected: 0,
            result: None,
        });
        if slot.op != op {
            return Err(TrainingError::collective(format!(
                "rank {rank} issued {op:?} as collective #{seq} while a peer issued {:?}",
                slot.op
            )));
        }
        if let Some(len) = slot.contributions.iter().flatten().map(Vec::len).next() {
            if len != data.len() {
                return Err(TrainingError::collective(format!(
                    "rank {rank} contributed {} elements to collective #{seq}, peers sent {len}",
                    data.len()
                )));
            }
        }
        slot.contributions[rank] = Some(data);
        slot.arrived += 1;
        if slot.arrived == self.world_size {
            let mut sum: Vec<f32> = Vec::new();
            for contribution in slot.contributions.iter_mut() {
                let values = contribution.take().unwrap_or_default();
                if sum.is_empty() {
                    sum = values;
                } else {
                    sum.iter_mut().zip(values).for_each(|(acc, v)| *acc += v);
                }
            }
            slot.result = Some(Arc::new(sum));
            self.ready.notify_all();
        }
        Ok(())
    }

    fn collect(&self, seq: u64) -> Result<Vec<f32>, TrainingError> {
        let mut slots = self.lock()?;
        loop {
            let slot = slots.get_mut(&seq).ok_or_else(|| {
                TrainingError::collective(format!("collective #{seq} vanished from the hub"))
            })?;
            if let Some(result) = slot.result.clone() {
                slot.collected += 1;
                if slot.collected == self.world_size {
                    slots.remove(&seq);
                }
                return Ok(result.as_ref().clone());
            }
            slots = self
                .ready
                .wait(slots)
                .map_err(|_| TrainingError::collective("local process group hub poisoned"))?;
        }
    }
}

pub struct LocalGroup {
    rank: usize,
    hub: Arc<Hub>,
    next_seq: AtomicU64,
}

impl LocalGroup {
    /// Creates `world_size` connected members, ordered by rank.
    pub fn new_group(world_size: usize) -> Vec<LocalGroup> {
        let hub = Arc::new(Hub {
            world_size: world_size.max(1),
            slots: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        });
        (0..world_size.max(1))
            .map(|rank| LocalGroup {
                rank,
                hub: Arc::clone(&hub),
                next_seq: AtomicU64::new(0),
            })
            .collect()
    }

    pub fn single() -> LocalGroup {
        LocalGroup {
            rank: 0,
            hub: Arc::new(Hub {
                world_size: 1,
                slots: Mutex::new(HashMap::new()),
                ready: Condvar::new(),
            }),
            next_seq: AtomicU64::new(0),
        }
    }

    fn issue(&self, op: Op, data: Vec<f32>) -> Result<u64, TrainingError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.hub.contribute(seq, self.rank, op, data)?;
        Ok(seq)
    }
}

struct LocalReduce {
    hub: Arc<Hub>,
    seq: u64,
}

impl ReduceCompletion for LocalReduce {
    fn complete(self: Box<Self>) -> Result<Vec<f32>, TrainingError> {
        self.hub.collect(self.seq)
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.hub.world_size
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<PendingReduce, TrainingError> {
        let data = stage_to_host(tensor)?;
        if self.hub.world_size == 1 {
            return Ok(PendingReduce::new(tensor, Box::new(Ready(data))));
        }
        let seq = self.issue(Op::Reduce, data)?;
        Ok(PendingReduce::new(
            tensor,
            Box::new(LocalReduce {
                hub: Arc::clone(&self.hub),
                seq,
            }),
        ))
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        if self.hub.world_size == 1 {
            return Ok(());
        }
        let seq = self.issue(Op::Barrier, Vec::new())?;
        self.hub.collect(seq).map(|_| ())
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::thread;

    #[test]
    fn reductions_can_be_awaited_out_of_issue_order() {
        let handles: Vec<_> = LocalGroup::new_group(2)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let base = group.rank() as f32;
                    let first = group
                        .all_reduce_sum(&Tensor::new(&[base], &Device::Cpu).unwrap())
                        .unwrap();
                    let second = group
                        .all_reduce_sum(&Tensor::new(&[base + 10.0], &Device::Cpu).unwrap())
                        .unwrap();
                    let second = second.wait().unwrap().to_vec1::<f32>().unwrap();
                    let first = first.wait().unwrap().to_vec1::<f32>().unwrap();
                    (first, second)
                })
            })
            .collect();
        for handle in handles {
            let (first, second) = handle.join().unwrap();
            assert_eq!(first, vec![1.0]);
            assert_eq!(second, vec![21.0]);
        }
    }

    #[test]
    fn mismatched_lengths_are_reported() {
        let mut members = LocalGroup::new_group(2);
        let second = members.pop().unwrap();
        let first = members.pop().unwrap();
        let ok = first.all_reduce_sum(&Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap());
        assert!(ok.is_ok());
        let err = second.all_reduce_sum(&Tensor::new(&[1f32], &Device::Cpu).unwrap());
        assert!(matches!(err, Err(TrainingError::Collective(_))));
    }

    #[test]
    fn barrier_releases_every_member() {
        let handles: Vec<_> = LocalGroup::new_group(4)
            .into_iter()
            .map(|group| thread::spawn(move || group.barrier()))
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    }
}
