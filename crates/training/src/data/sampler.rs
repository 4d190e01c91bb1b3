use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// Partitions dataset indices across ranks.
///
/// Each epoch the full index list is shuffled with `seed + epoch`, padded by
/// wrapping around to a multiple of `num_replicas`, then strided so rank `r`
/// takes positions `r, r + n, r + 2n, ...`. Every rank therefore sees the same
/// number of samples and the shards of one epoch are disjoint up to padding.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    dataset_len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
}

impl DistributedSampler {
    pub fn new(dataset_len: usize, num_replicas: usize, rank: usize, shuffle: bool, seed: u64) -> Self {
        let num_replicas = num_replicas.max(1);
        Self {
            dataset_len,
            num_replicas,
            rank: rank.min(num_replicas - 1),
            shuffle,
            seed,
            epoch: 0,
        }
    }

    /// Reseeds the shuffle. Call once per epoch before iterating.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Samples per rank per epoch.
    pub fn num_samples(&self) -> usize {
        self.dataset_len.div_ceil(self.num_replicas)
    }

    pub fn indices(&self) -> Vec<usize> {
        if self.dataset_len == 0 {
            return Vec::new();
        }
        let mut indices: Vec<usize> = (0..self.dataset_len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            indices.shuffle(&mut rng);
        }

        let total_size = self.num_samples() * self.num_replicas;
        let mut cursor = 0;
        while indices.len() < total_size {
            indices.push(indices[cursor]);
            cursor += 1;
        }

        indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }
}
