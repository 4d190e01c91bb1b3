//! NCCL backend. The unique communicator id is created on rank 0 and handed
//! to the other ranks over the TCP rendezvous.
//!
//! A worker that dies mid-collective leaves its peers blocked inside NCCL;
//! there is no timeout at this layer.

use std::{ffi::c_char, sync::Arc};

use candle_core::Tensor;
use cudarc::{
    driver::{CudaContext, CudaSlice, CudaStream},
    nccl::safe::{Comm, Id, ReduceOp},
};
use tracing::info;

use super::{
    stage_to_host, tcp::Rendezvous, PendingReduce, ProcessGroup, RankContext, Ready,
    ReduceCompletion,
};
use crate::TrainingError;

const NCCL_ID_LEN: usize = 128;

pub struct NcclGroup {
    rank: usize,
    world_size: usize,
    stream: Arc<CudaStream>,
    comm: Comm,
}

impl NcclGroup {
    pub fn connect(addr: &str, port: u16, rank: RankContext) -> Result<Self, TrainingError> {
        let mut links = Rendezvous::establish(addr, port, rank.global_rank, rank.world_size)?;

        let context = CudaContext::new(rank.local_rank).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to open CUDA device {}: {err:?}",
                rank.local_rank
            ))
        })?;
        let stream = context.default_stream();

        let id = if rank.global_rank == 0 {
            let id = Id::new().map_err(|err| {
                TrainingError::initialization(format!("failed to create NCCL id: {err:?}"))
            })?;
            let bytes: Vec<u8> = id.internal().iter().map(|&b| b as u8).collect();
            links.share_bytes(Some(&bytes))?;
            id
        } else {
            let bytes = links.share_bytes(None)?;
            let internal: [c_char; NCCL_ID_LEN] = bytes
                .into_iter()
                .map(|b| b as c_char)
                .collect::<Vec<_>>()
                .try_into()
                .map_err(|_| TrainingError::initialization("received malformed NCCL id"))?;
            Id::uninit(internal)
        };

        let comm = Comm::from_rank(stream.clone(), rank.global_rank, rank.world_size, id)
            .map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to create NCCL communicator: {err:?}"
                ))
            })?;
        info!(
            rank = rank.global_rank,
            world_size = rank.world_size,
            device = rank.local_rank,
            "nccl process group ready"
        );

        Ok(Self {
            rank: rank.global_rank,
            world_size: rank.world_size,
            stream,
            comm,
        })
    }

    fn reduce_host(&self, host: &[f32]) -> Result<CudaSlice<f32>, TrainingError> {
        let send = self.stream.memcpy_stod(host).map_err(cuda_error)?;
        let mut recv = self.stream.alloc_zeros::<f32>(host.len()).map_err(cuda_error)?;
        self.comm
            .all_reduce(&send, &mut recv, &ReduceOp::Sum)
            .map_err(|err| TrainingError::collective(format!("nccl all_reduce failed: {err:?}")))?;
        Ok(recv)
    }
}

struct NcclReduce {
    stream: Arc<CudaStream>,
    result: CudaSlice<f32>,
}

impl ReduceCompletion for NcclReduce {
    fn complete(self: Box<Self>) -> Result<Vec<f32>, TrainingError> {
        self.stream.memcpy_dtov(&self.result).map_err(cuda_error)
    }
}

impl ProcessGroup for NcclGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<PendingReduce, TrainingError> {
        let host = stage_to_host(tensor)?;
        if host.is_empty() {
            return Ok(PendingReduce::new(tensor, Box::new(Ready(host))));
        }
        let result = self.reduce_host(&host)?;
        Ok(PendingReduce::new(
            tensor,
            Box::new(NcclReduce {
                stream: Arc::clone(&self.stream),
                result,
            }),
        ))
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        let result = self.reduce_host(&[0.0])?;
        self.stream.memcpy_dtov(&result).map_err(cuda_error)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "nccl"
    }
}

fn cuda_error(err: cudarc::driver::DriverError) -> TrainingError {
    TrainingError::collective(format!("cuda transfer failed: {err:?}"))
}
