//! Data collectors: iterators of rollout batches
//!
//! A collector steps one or more environments with a policy (or random actions when
//! there is none) and yields [`TensorDict`] batches of `frames_per_batch` steps with a
//! single batch dimension. Environments continue across batches and are reset when an
//! episode ends.
mod multi;
mod runner;
mod sync;

pub use multi::{MultiSyncDataCollector, MultiaSyncDataCollector};
pub use sync::SyncDataCollector;

use crate::envs::EnvError;
use crate::modules::ModuleError;
use crate::resolve::{Args, BuildError, Instance, RegistryBuilder, TargetDef};
use crate::tensordict::{TensorDict, TensorDictError};
use std::fmt;
use thiserror::Error;

/// Key of the trajectory id of each collected step.
pub const TRAJ_ID_KEY: &str = "traj_ids";

/// Error collecting data.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error("policy failed")]
    Module(#[from] ModuleError),
    #[error(transparent)]
    TensorDict(#[from] TensorDictError),
    #[error("invalid collector settings: {0}")]
    Invalid(String),
    #[error("worker {0} disconnected")]
    WorkerDisconnected(usize),
}

/// Iterator over collected batches.
///
/// Iteration ends once `total_frames` frames have been yielded or after
/// [`shutdown`](Collector::shutdown).
pub trait Collector: Iterator<Item = Result<TensorDict, CollectorError>> + fmt::Debug + Send {
    fn frames_per_batch(&self) -> usize;

    /// Total number of frames to collect; `None` for no limit.
    fn total_frames(&self) -> Option<usize>;

    /// Number of frames yielded so far.
    fn frames_collected(&self) -> usize;

    /// Stop any workers and close the environments. Idempotent.
    fn shutdown(&mut self);
}

/// Settings shared by every collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorSettings {
    pub frames_per_batch: usize,
    pub total_frames: Option<usize>,
    /// Reset an environment after this many steps of one trajectory.
    pub max_frames_per_traj: Option<usize>,
    pub seed: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            frames_per_batch: 200,
            total_frames: None,
            max_frames_per_traj: None,
            seed: 0,
        }
    }
}

impl CollectorSettings {
    /// Whether a collector that has yielded `collected` frames is done.
    pub(crate) fn exhausted(&self, collected: usize) -> bool {
        self.total_frames.map_or(false, |total| collected >= total)
    }

    fn from_args(args: &mut Args) -> Result<Self, BuildError> {
        let default = Self::default();
        let settings = Self {
            frames_per_batch: args.value_or("frames_per_batch", default.frames_per_batch)?,
            total_frames: limit(args, "total_frames")?,
            max_frames_per_traj: limit(args, "max_frames_per_traj")?,
            seed: args.value_or("seed", default.seed)?,
        };
        if settings.frames_per_batch == 0 {
            return Err(BuildError::Invalid {
                key: "frames_per_batch".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(settings)
    }
}

/// A frame limit where null or a negative number means unlimited.
fn limit(args: &mut Args, key: &str) -> Result<Option<usize>, BuildError> {
    Ok(args
        .opt_value::<i64>(key)?
        .and_then(|n| usize::try_from(n).ok()))
}

fn collector_def(name: &str) -> TargetDef {
    TargetDef::new(name)
        .required("create_env_fn")
        .optional("policy")
        .optional("frames_per_batch")
        .optional("total_frames")
        .optional("max_frames_per_traj")
        .optional("seed")
}

/// Register the collectors.
pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .register(collector_def("collectors.SyncDataCollector"), |args| {
            let factories = args.env_factories("create_env_fn")?;
            let factory = match <[_; 1]>::try_from(factories) {
                Ok([factory]) => factory,
                Err(factories) => {
                    return Err(BuildError::Invalid {
                        key: "create_env_fn".into(),
                        reason: format!("expected one environment factory, got {}", factories.len()),
                    })
                }
            };
            let policy = args.opt_module("policy")?;
            let settings = CollectorSettings::from_args(args)?;
            let collector = SyncDataCollector::new(&factory, policy, settings)?;
            Ok(Instance::Collector(Box::new(collector)))
        })
        .register(collector_def("collectors.MultiSyncDataCollector"), |args| {
            let factories = args.env_factories("create_env_fn")?;
            let policy = args.opt_module("policy")?;
            let settings = CollectorSettings::from_args(args)?;
            let collector = MultiSyncDataCollector::new(&factories, policy, settings)?;
            Ok(Instance::Collector(Box::new(collector)))
        })
        .register(collector_def("collectors.MultiaSyncDataCollector"), |args| {
            let factories = args.env_factories("create_env_fn")?;
            let policy = args.opt_module("policy")?;
            let settings = CollectorSettings::from_args(args)?;
            let collector = MultiaSyncDataCollector::new(&factories, policy, settings)?;
            Ok(Instance::Collector(Box::new(collector)))
        })
}
