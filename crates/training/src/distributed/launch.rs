//! Topology resolution and the single-node multi-process launcher.

use std::{
    ffi::OsString,
    process::{Child, Command},
};

use tracing::{error, info};

use super::RankContext;
use crate::{config::DistributedConfig, TrainingError};

pub const LOCAL_RANK_VAR: &str = "LOCAL_RANK";
pub const RANK_VAR: &str = "RANK";
pub const WORLD_SIZE_VAR: &str = "WORLD_SIZE";
pub const LOCAL_WORLD_SIZE_VAR: &str = "LOCAL_WORLD_SIZE";
pub const MASTER_ADDR_VAR: &str = "MASTER_ADDR";
pub const MASTER_PORT_VAR: &str = "MASTER_PORT";

/// Reads the rank context of an externally launched worker.
///
/// `LOCAL_RANK` falls back to the configured local rank when absent. `RANK`
/// and `WORLD_SIZE` are mandatory.
pub fn resolve_rank_context<F>(
    config: &DistributedConfig,
    lookup: F,
) -> Result<RankContext, TrainingError>
where
    F: Fn(&str) -> Option<String>,
{
    let local_rank = match lookup(LOCAL_RANK_VAR) {
        Some(value) => parse_var(LOCAL_RANK_VAR, &value)?,
        None if config.local_rank >= 0 => config.local_rank as usize,
        None => {
            return Err(TrainingError::topology(format!(
                "{LOCAL_RANK_VAR} is not set and no local rank was given"
            )))
        }
    };
    let global_rank = required_var(&lookup, RANK_VAR)?;
    let world_size = required_var(&lookup, WORLD_SIZE_VAR)?;
    RankContext::new(local_rank, global_rank, world_size)
}

/// Master address and port, preferring the environment over configuration.
pub fn resolve_master<F>(config: &DistributedConfig, lookup: F) -> Result<(String, u16), TrainingError>
where
    F: Fn(&str) -> Option<String>,
{
    let addr = lookup(MASTER_ADDR_VAR).unwrap_or_else(|| config.master_addr.clone());
    let port = match lookup(MASTER_PORT_VAR) {
        Some(value) => value.trim().parse::<u16>().map_err(|err| {
            TrainingError::topology(format!("invalid {MASTER_PORT_VAR} '{value}': {err}"))
        })?,
        None => config.master_port,
    };
    Ok((addr, port))
}

fn required_var<F>(lookup: &F, name: &str) -> Result<usize, TrainingError>
where
    F: Fn(&str) -> Option<String>,
{
    let value =
        lookup(name).ok_or_else(|| TrainingError::topology(format!("{name} is not set")))?;
    parse_var(name, &value)
}

fn parse_var(name: &str, value: &str) -> Result<usize, TrainingError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|err| TrainingError::topology(format!("invalid {name} '{value}': {err}")))
}

/// How many workers this node spawns and where they sit in the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnPlan {
    pub nprocs: usize,
    pub nnodes: usize,
    pub node_rank: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl SpawnPlan {
    /// In multi-spawn mode the configured world size counts nodes.
    pub fn from_config(config: &DistributedConfig, nprocs: usize) -> Result<Self, TrainingError> {
        if nprocs == 0 {
            return Err(TrainingError::topology("at least one process per node is required"));
        }
        let nnodes = if config.world_size > 0 {
            config.world_size as usize
        } else {
            1
        };
        if config.node_rank >= nnodes {
            return Err(TrainingError::topology(format!(
                "node rank {} out of range for {} nodes",
                config.node_rank, nnodes
            )));
        }
        Ok(Self {
            nprocs,
            nnodes,
            node_rank: config.node_rank,
            master_addr: config.master_addr.clone(),
            master_port: config.master_port,
        })
    }

    pub fn world_size(&self) -> usize {
        self.nprocs * self.nnodes
    }

    pub fn global_rank(&self, local_rank: usize) -> usize {
        self.node_rank * self.nprocs + local_rank
    }

    pub fn worker_env(&self, local_rank: usize) -> Vec<(&'static str, String)> {
        vec![
            (LOCAL_RANK_VAR, local_rank.to_string()),
            (RANK_VAR, self.global_rank(local_rank).to_string()),
            (WORLD_SIZE_VAR, self.world_size().to_string()),
            (LOCAL_WORLD_SIZE_VAR, self.nprocs.to_string()),
            (MASTER_ADDR_VAR, self.master_addr.clone()),
            (MASTER_PORT_VAR, self.master_port.to_string()),
        ]
    }
}

/// Number of local devices to spawn workers for when none is configured.
pub fn default_nproc_per_node() -> usize {
    #[cfg(feature = "nccl")]
    {
        match cudarc::driver::CudaContext::device_count() {
            Ok(count) if count > 0 => return count as usize,
            Ok(_) => tracing::warn!("no CUDA devices visible, spawning a single worker"),
            Err(err) => tracing::warn!(?err, "failed to count CUDA devices, spawning a single worker"),
        }
    }
    1
}

/// Re-executes the current binary once per local rank with the rank
/// variables set, then waits for every child.
pub fn spawn_local_workers(plan: &SpawnPlan, args: &[OsString]) -> Result<(), TrainingError> {
    let binary = std::env::current_exe()?;
    info!(
        nprocs = plan.nprocs,
        nnodes = plan.nnodes,
        node_rank = plan.node_rank,
        world_size = plan.world_size(),
        "spawning workers"
    );

    let mut children: Vec<(usize, Child)> = Vec::with_capacity(plan.nprocs);
    for local_rank in 0..plan.nprocs {
        let mut command = Command::new(&binary);
        command.args(args).envs(plan.worker_env(local_rank));
        match command.spawn() {
            Ok(child) => children.push((local_rank, child)),
            Err(err) => {
                for (_, child) in children.iter_mut() {
                    let _ = child.kill();
                }
                return Err(TrainingError::initialization(format!(
                    "failed to spawn worker {local_rank}: {err}"
                )));
            }
        }
    }

    let mut failed = Vec::new();
    for (local_rank, mut child) in children {
        let status = child.wait()?;
        if status.success() {
            info!(local_rank, "worker finished");
        } else {
            error!(local_rank, %status, "worker failed");
            failed.push(format!("worker {local_rank} exited with {status}"));
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(TrainingError::runtime(failed.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn reads_ranks_from_environment() {
        let config = DistributedConfig::default();
        let ctx = resolve_rank_context(
            &config,
            env(&[("LOCAL_RANK", "1"), ("RANK", "5"), ("WORLD_SIZE", "8")]),
        )
        .unwrap();
        assert_eq!(ctx, RankContext::new(1, 5, 8).unwrap());
    }

    #[test]
    fn local_rank_falls_back_to_configuration() {
        let config = DistributedConfig {
            local_rank: 2,
            ..DistributedConfig::default()
        };
        let ctx = resolve_rank_context(&config, env(&[("RANK", "2"), ("WORLD_SIZE", "4")])).unwrap();
        assert_eq!(ctx.local_rank, 2);
    }

    #[test]
    fn missing_or_malformed_variables_are_topology_errors() {
        let config = DistributedConfig::default();
        let missing = resolve_rank_context(&config, env(&[("LOCAL_RANK", "0"), ("RANK", "0")]));
        assert!(matches!(missing, Err(TrainingError::Topology(_))));
        let malformed = resolve_rank_context(
            &config,
            env(&[("LOCAL_RANK", "0"), ("RANK", "zero"), ("WORLD_SIZE", "2")]),
        );
        assert!(matches!(malformed, Err(TrainingError::Topology(_))));
        let no_local = resolve_rank_context(&config, env(&[("RANK", "0"), ("WORLD_SIZE", "2")]));
        assert!(matches!(no_local, Err(TrainingError::Topology(_))));
    }

    #[test]
    fn master_prefers_environment() {
        let config = DistributedConfig::default();
        let (addr, port) = resolve_master(&config, env(&[("MASTER_PORT", "1234")])).unwrap();
        assert_eq!(addr, "127.0.0.1");
        assert_eq!(port, 1234);
        assert!(resolve_master(&config, env(&[("MASTER_PORT", "x")])).is_err());
    }

    #[test]
    fn spawn_plan_multiplies_nodes_by_processes() {
        let config = DistributedConfig {
            world_size: 2,
            node_rank: 1,
            multi_spawn: true,
            ..DistributedConfig::default()
        };
        let plan = SpawnPlan::from_config(&config, 4).unwrap();
        assert_eq!(plan.world_size(), 8);
        assert_eq!(plan.global_rank(3), 7);
        let env = plan.worker_env(2);
        assert!(env.contains(&("RANK", "6".to_string())));
        assert!(env.contains(&("WORLD_SIZE", "8".to_string())));
        assert!(env.contains(&("LOCAL_RANK", "2".to_string())));
        assert!(env.contains(&("LOCAL_WORLD_SIZE", "4".to_string())));

        let single = SpawnPlan::from_config(&DistributedConfig::default(), 2).unwrap();
        assert_eq!(single.world_size(), 2);
        assert!(SpawnPlan::from_config(&config, 0).is_err());
        let bad_node = DistributedConfig {
            node_rank: 3,
            ..config
        };
        assert!(SpawnPlan::from_config(&bad_node, 1).is_err());
    }
}
