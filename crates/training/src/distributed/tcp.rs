//! Multi-process CPU backend over TCP.
//!
//! Rank 0 listens on the master address and every other rank keeps one
//! connection to it. A reduction ships a frame `(op, seq, len, f32 payload)`
//! to rank 0, which sums contributions in rank order and sends the result
//! back to every peer.

use std::{
    collections::{BTreeMap, HashMap},
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use candle_core::Tensor;
use tracing::{debug, info};

use super::{stage_to_host, PendingReduce, ProcessGroup, ReduceCompletion};
use crate::TrainingError;

const HELLO_MAGIC: u32 = 0x5332_5344;
const HEADER_LEN: usize = 1 + 8 + 4;
const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Op {
    Reduce = 1,
    Barrier = 2,
}

impl TryFrom<u8> for Op {
    type Error = TrainingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Op::Reduce),
            2 => Ok(Op::Barrier),
            other => Err(TrainingError::collective(format!(
                "unknown frame opcode {other}"
            ))),
        }
    }
}

struct Frame {
    op: Op,
    seq: u64,
    payload: Vec<f32>,
}

/// Connections established by the rendezvous, before any collective runs.
pub(crate) enum Rendezvous {
    /// Rank 0. `peers[i]` is the stream to rank `i + 1`.
    Master { peers: Vec<TcpStream> },
    Worker { master: TcpStream },
}

impl Rendezvous {
    pub(crate) fn establish(
        addr: &str,
        port: u16,
        rank: usize,
        world_size: usize,
    ) -> Result<Self, TrainingError> {
        if rank == 0 {
            Self::accept_peers(addr, port, world_size)
        } else {
            Self::join_master(addr, port, rank, world_size)
        }
    }

    fn accept_peers(addr: &str, port: u16, world_size: usize) -> Result<Self, TrainingError> {
        let listener = TcpListener::bind((addr, port)).map_err(|err| {
            TrainingError::initialization(format!("failed to listen on {addr}:{port}: {err}"))
        })?;
        info!(addr, port, world_size, "waiting for peers");

        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        for _ in 1..world_size {
            let (mut stream, remote) = listener.accept().map_err(io_error)?;
            stream.set_nodelay(true).map_err(io_error)?;
            let mut hello = [0u8; 12];
            stream.read_exact(&mut hello).map_err(io_error)?;
            let mut hello = &hello[..];
            let magic = hello.get_u32_le();
            let peer_rank = hello.get_u32_le() as usize;
            let peer_world = hello.get_u32_le() as usize;
            if magic != HELLO_MAGIC {
                return Err(TrainingError::initialization(format!(
                    "unexpected handshake from {remote}"
                )));
            }
            if peer_world != world_size {
                return Err(TrainingError::topology(format!(
                    "rank {peer_rank} expects world size {peer_world}, master has {world_size}"
                )));
            }
            let slot = peer_rank
                .checked_sub(1)
                .and_then(|idx| slots.get_mut(idx))
                .ok_or_else(|| {
                    TrainingError::topology(format!("peer announced invalid rank {peer_rank}"))
                })?;
            if slot.is_some() {
                return Err(TrainingError::topology(format!(
                    "rank {peer_rank} joined twice"
                )));
            }
            debug!(peer_rank, %remote, "peer joined");
            *slot = Some(stream);
        }

        let mut peers = slots.into_iter().flatten().collect::<Vec<_>>();
        for stream in peers.iter_mut() {
            stream.write_all(&HELLO_MAGIC.to_le_bytes()).map_err(io_error)?;
        }
        Ok(Rendezvous::Master { peers })
    }

    fn join_master(
        addr: &str,
        port: u16,
        rank: usize,
        world_size: usize,
    ) -> Result<Self, TrainingError> {
        let deadline = Instant::now() + RENDEZVOUS_TIMEOUT;
        let mut stream = loop {
            match TcpStream::connect((addr, port)) {
                Ok(stream) => break stream,
                Err(err) if Instant::now() < deadline => {
                    debug!(rank, %err, "master not reachable yet");
                    thread::sleep(CONNECT_BACKOFF);
                }
                Err(err) => {
                    return Err(TrainingError::initialization(format!(
                        "rank {rank} could not reach master {addr}:{port}: {err}"
                    )))
                }
            }
        };
        stream.set_nodelay(true).map_err(io_error)?;

        let mut hello = BytesMut::with_capacity(12);
        hello.put_u32_le(HELLO_MAGIC);
        hello.put_u32_le(rank as u32);
        hello.put_u32_le(world_size as u32);
        stream.write_all(&hello).map_err(io_error)?;

        let mut ack = [0u8; 4];
        stream.read_exact(&mut ack).map_err(io_error)?;
        if u32::from_le_bytes(ack) != HELLO_MAGIC {
            return Err(TrainingError::initialization(
                "master sent an invalid acknowledgement",
            ));
        }
        Ok(Rendezvous::Worker { master: stream })
    }

    /// Sends `payload` from rank 0 to every other rank. Non-zero ranks pass
    /// `None` and receive rank 0's bytes.
    #[cfg_attr(not(feature = "nccl"), allow(dead_code))]
    pub(crate) fn share_bytes(&mut self, payload: Option<&[u8]>) -> Result<Vec<u8>, TrainingError> {
        match self {
            Rendezvous::Master { peers } => {
                let payload = payload.ok_or_else(|| {
                    TrainingError::collective("rank 0 must provide the shared payload")
                })?;
                for stream in peers.iter_mut() {
                    stream
                        .write_all(&(payload.len() as u32).to_le_bytes())
                        .and_then(|_| stream.write_all(payload))
                        .map_err(io_error)?;
                }
                Ok(payload.to_vec())
            }
            Rendezvous::Worker { master } => {
                let mut len = [0u8; 4];
                master.read_exact(&mut len).map_err(io_error)?;
                let mut buf = vec![0u8; u32::from_le_bytes(len) as usize];
                master.read_exact(&mut buf).map_err(io_error)?;
                Ok(buf)
            }
        }
    }
}

struct TcpState {
    links: Rendezvous,
    next_seq: u64,
    /// Rank 0 only: local contributions not yet combined with the peers'.
    pending: BTreeMap<u64, (Op, Vec<f32>)>,
    completed: HashMap<u64, Vec<f32>>,
}

impl TcpState {
    fn issue(&mut self, op: Op, data: Vec<f32>) -> Result<u64, TrainingError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        match &mut self.links {
            Rendezvous::Master { .. } => {
                self.pending.insert(seq, (op, data));
            }
            Rendezvous::Worker { master } => write_frame(master, op, seq, &data)?,
        }
        Ok(seq)
    }

    fn complete(&mut self, seq: u64) -> Result<Vec<f32>, TrainingError> {
        loop {
            if let Some(result) = self.completed.remove(&seq) {
                return Ok(result);
            }
            if seq >= self.next_seq {
                return Err(TrainingError::collective(format!(
                    "collective #{seq} was never issued"
                )));
            }
            self.progress()?;
        }
    }

    fn progress(&mut self) -> Result<(), TrainingError> {
        match &mut self.links {
            Rendezvous::Master { peers } => {
                let (seq, (op, mut sum)) = self.pending.pop_first().ok_or_else(|| {
                    TrainingError::collective("no outstanding collective to progress")
                })?;
                for (idx, stream) in peers.iter_mut().enumerate() {
                    let frame = read_frame(stream)?;
                    check_frame(&frame, idx + 1, op, seq, sum.len())?;
                    sum.iter_mut()
                        .zip(frame.payload)
                        .for_each(|(acc, value)| *acc += value);
                }
                for stream in peers.iter_mut() {
                    write_frame(stream, op, seq, &sum)?;
                }
                self.completed.insert(seq, sum);
            }
            Rendezvous::Worker { master } => {
                let frame = read_frame(master)?;
                self.completed.insert(frame.seq, frame.payload);
            }
        }
        Ok(())
    }
}

pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    state: Arc<Mutex<TcpState>>,
}

impl TcpGroup {
    pub fn connect(
        addr: &str,
        port: u16,
        rank: usize,
        world_size: usize,
    ) -> Result<Self, TrainingError> {
        let links = Rendezvous::establish(addr, port, rank, world_size)?;
        info!(rank, world_size, "tcp process group ready");
        Ok(Self {
            rank,
            world_size,
            state: Arc::new(Mutex::new(TcpState {
                links,
                next_seq: 0,
                pending: BTreeMap::new(),
                completed: HashMap::new(),
            })),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, TcpState>, TrainingError> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<TcpState>) -> Result<MutexGuard<'_, TcpState>, TrainingError> {
    state
        .lock()
        .map_err(|_| TrainingError::collective("tcp process group state poisoned"))
}

struct TcpReduce {
    state: Arc<Mutex<TcpState>>,
    seq: u64,
}

impl ReduceCompletion for TcpReduce {
    fn complete(self: Box<Self>) -> Result<Vec<f32>, TrainingError> {
        lock_state(&self.state)?.complete(self.seq)
    }
}

impl ProcessGroup for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<PendingReduce, TrainingError> {
        let data = stage_to_host(tensor)?;
        let seq = self.lock()?.issue(Op::Reduce, data)?;
        Ok(PendingReduce::new(
            tensor,
            Box::new(TcpReduce {
                state: Arc::clone(&self.state),
                seq,
            }),
        ))
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        let mut state = self.lock()?;
        let seq = state.issue(Op::Barrier, Vec::new())?;
        state.complete(seq).map(|_| ())
    }

    fn backend_name(&self) -> &'static str {
        "tcp"
    }
}

fn check_frame(
    frame: &Frame,
    peer_rank: usize,
    op: Op,
    seq: u64,
    len: usize,
) -> Result<(), TrainingError> {
    if frame.seq != seq || frame.op != op {
        return Err(TrainingError::collective(format!(
            "rank {peer_rank} sent {:?} #{} while rank 0 expected {:?} #{}",
            frame.op, frame.seq, op, seq
        )));
    }
    if frame.payload.len() != len {
        return Err(TrainingError::collective(format!(
            "rank {peer_rank} sent {} elements for collective #{seq}, expected {len}",
            frame.payload.len()
        )));
    }
    Ok(())
}

fn write_frame(stream: &mut TcpStream, op: Op, seq: u64, payload: &[f32]) -> Result<(), TrainingError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len() * 4);
    buf.put_u8(op as u8);
    buf.put_u64_le(seq);
    buf.put_u32_le(payload.len() as u32);
    for value in payload {
        buf.put_f32_le(*value);
    }
    stream.write_all(&buf).map_err(io_error)
}

fn read_frame(stream: &mut TcpStream) -> Result<Frame, TrainingError> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).map_err(io_error)?;
    let mut header = &header[..];
    let op = Op::try_from(header.get_u8())?;
    let seq = header.get_u64_le();
    let len = header.get_u32_le() as usize;

    let mut body = vec![0u8; len * 4];
    stream.read_exact(&mut body).map_err(io_error)?;
    let mut body = &body[..];
    let payload = (0..len).map(|_| body.get_f32_le()).collect();
    Ok(Frame { op, seq, payload })
}

fn io_error(err: std::io::Error) -> TrainingError {
    TrainingError::collective(format!("peer connection failed: {err}"))
}
