//! Replay buffers
mod replay;
mod samplers;
mod storage;

pub use replay::ReplayBuffer;
pub use samplers::{PrioritizedSampler, RandomSampler, SampledIndices, Sampler};
pub use storage::{ListStorage, Storage};

use crate::resolve::{Args, BuildError, Instance, RegistryBuilder, TargetDef};
use crate::tensordict::TensorDictError;
use thiserror::Error;

/// Default storage size of a replay buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("cannot sample from an empty buffer")]
    Empty,
    #[error("index {index} out of range for {len} stored elements")]
    OutOfRange { index: usize, len: usize },
    #[error("expected a leading batch dimension")]
    NoBatchDim,
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    TensorDict(#[from] TensorDictError),
}

fn positive_size(args: &mut Args, key: &str) -> Result<Option<usize>, BuildError> {
    match args.opt_value::<usize>(key)? {
        Some(0) => Err(BuildError::Invalid {
            key: key.into(),
            reason: "must be positive".into(),
        }),
        size => Ok(size),
    }
}

/// Register the replay buffer components.
pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .register(TargetDef::new("data.ListStorage").required("max_size"), |args| {
            let max_size = positive_size(args, "max_size")?.ok_or_else(|| BuildError::Missing("max_size".into()))?;
            Ok(Instance::Storage(Box::new(ListStorage::new(max_size))))
        })
        .register(TargetDef::new("data.RandomSampler"), |_| {
            Ok(Instance::Sampler(Box::new(RandomSampler)))
        })
        .register(
            TargetDef::new("data.PrioritizedSampler")
                .required("alpha")
                .required("beta")
                .optional("eps"),
            |args| {
                let sampler = PrioritizedSampler::new(args.value("alpha")?, args.value("beta")?)?
                    .with_eps(args.value_or("eps", PrioritizedSampler::DEFAULT_EPS)?);
                Ok(Instance::Sampler(Box::new(sampler)))
            },
        )
        // Without a storage, `size` sizes a `ListStorage`; with one it must agree with it.
        .register(
            TargetDef::new("data.ReplayBuffer")
                .optional("storage")
                .optional("sampler")
                .optional("size"),
            |args| {
                let size = positive_size(args, "size")?;
                let storage: Box<dyn Storage> = if args.contains("storage") {
                    args.storage("storage")?
                } else {
                    Box::new(ListStorage::new(size.unwrap_or(DEFAULT_BUFFER_SIZE)))
                };
                if let Some(size) = size.filter(|&s| s != storage.max_size()) {
                    return Err(BuildError::Invalid {
                        key: "size".into(),
                        reason: format!("{} differs from the storage size {}", size, storage.max_size()),
                    });
                }
                let sampler = args
                    .opt_sampler("sampler")?
                    .unwrap_or_else(|| Box::new(RandomSampler));
                Ok(Instance::ReplayBuffer(ReplayBuffer::new(storage, sampler)))
            },
        )
}
