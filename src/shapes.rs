//! Shapes only known once an environment exists
//!
//! Network sizes such as the number of outputs or input channels depend on the
//! environment's specs. Configurations leave them unset; the resolver returns partial
//! constructors and [`ShapeInference`] fills them in from an instantiated environment.
use crate::config::Value;
use crate::envs::{EnvError, Environment};
use crate::resolve::{Args, Instance, PartialSlot, ResolveError};
use crate::tensordict::TensorDict;
use crate::wiring::OutputHead;
use crate::Prng;
use log::debug;
use rand::SeedableRng;
use std::fmt;
use thiserror::Error;

/// A dimension derived from an environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShapeRequest {
    /// Network outputs for the action space: the trailing action dimension, multiplied
    /// and prefixed as described by the head.
    Action(OutputHead),
    /// Channels of a channels-last image observation, read from a one-step rollout.
    PixelChannels { key: String },
    /// Trailing dimension of a vector observation.
    ObservationFeatures { key: String },
}

impl ShapeRequest {
    pub fn pixel_channels<S: Into<String>>(key: S) -> Self {
        Self::PixelChannels { key: key.into() }
    }

    pub fn observation_features<S: Into<String>>(key: S) -> Self {
        Self::ObservationFeatures { key: key.into() }
    }
}

impl fmt::Display for ShapeRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Action(head) => write!(f, "action outputs {}", head),
            Self::PixelChannels { key } => write!(f, "channels of `{}`", key),
            Self::ObservationFeatures { key } => write!(f, "features of `{}`", key),
        }
    }
}

#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("cannot infer {request}: {reason}")]
    IncompatibleSpec { request: String, reason: String },
    #[error("rollout for shape inference failed")]
    Env(#[from] EnvError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

impl ShapeError {
    fn incompatible<S: Into<String>>(request: &ShapeRequest, reason: S) -> Self {
        Self::IncompatibleSpec {
            request: request.to_string(),
            reason: reason.into(),
        }
    }
}

/// A partial constructor together with the shapes it is waiting on.
#[derive(Debug)]
pub struct ShapeBinding<'a> {
    slot: &'a mut PartialSlot,
    requests: Vec<(String, ShapeRequest)>,
    args: Args,
}

impl<'a> ShapeBinding<'a> {
    pub fn new(slot: &'a mut PartialSlot) -> Self {
        Self {
            slot,
            requests: Vec::new(),
            args: Args::new(),
        }
    }

    /// Pass the inferred `request` as `argument`.
    #[must_use]
    pub fn request<S: Into<String>>(mut self, argument: S, request: ShapeRequest) -> Self {
        self.requests.push((argument.into(), request));
        self
    }

    /// Pass a fixed runtime argument as well.
    #[must_use]
    pub fn with<K: Into<String>, V: Into<Instance>>(mut self, key: K, value: V) -> Self {
        self.args.insert(key, value);
        self
    }

    pub fn slot(&self) -> &PartialSlot {
        self.slot
    }
}

/// Derives dimensions from an environment's specs.
///
/// Pixel requests need a rollout to observe the rendered images; it runs at most once
/// per inference, with random actions.
#[derive(Debug)]
pub struct ShapeInference<'e> {
    env: &'e mut dyn Environment,
    rollout: Option<TensorDict>,
    rng: Prng,
}

impl<'e> ShapeInference<'e> {
    pub fn new(env: &'e mut dyn Environment) -> Self {
        Self {
            env,
            rollout: None,
            rng: Prng::seed_from_u64(0),
        }
    }

    fn rollout(&mut self) -> Result<&TensorDict, ShapeError> {
        let rollout = match self.rollout.take() {
            Some(rollout) => rollout,
            None => {
                debug!("one-step rollout of `{}` for shape inference", self.env.name());
                self.env.rollout(1, None, &mut self.rng)?
            }
        };
        Ok(self.rollout.insert(rollout))
    }

    /// Infer the value of `request`.
    ///
    /// Single dimensions are integers; action heads with a leading dimension are lists.
    pub fn infer(&mut self, request: &ShapeRequest) -> Result<Value, ShapeError> {
        let value = match request {
            ShapeRequest::Action(head) => {
                let action_dim = self
                    .env
                    .action_spec()
                    .last_dim()
                    .ok_or_else(|| ShapeError::incompatible(request, "scalar action spec"))?;
                match head.out_features(action_dim).as_slice() {
                    [n] => Value::from(*n),
                    dims => Value::from(dims.to_vec()),
                }
            }
            ShapeRequest::ObservationFeatures { key } => {
                let spec = self
                    .env
                    .observation_spec()
                    .get(key)
                    .ok_or_else(|| ShapeError::incompatible(request, "no such observation"))?;
                let features = spec
                    .last_dim()
                    .ok_or_else(|| ShapeError::incompatible(request, "scalar observation"))?;
                Value::from(features)
            }
            ShapeRequest::PixelChannels { key } => {
                let spec = self
                    .env
                    .observation_spec()
                    .get(key)
                    .ok_or_else(|| ShapeError::incompatible(request, "no such observation"))?;
                let rank = spec.shape().len();
                if rank != 3 {
                    return Err(ShapeError::incompatible(
                        request,
                        format!("expected a [height, width, channels] image, found rank {}", rank),
                    ));
                }
                let spec_channels = spec.last_dim();
                let observed = self
                    .rollout()?
                    .get(key)
                    .ok_or_else(|| ShapeError::incompatible(request, "missing from the rollout"))?;
                let channels = observed.shape().last().copied();
                if channels != spec_channels {
                    return Err(ShapeError::incompatible(
                        request,
                        format!("rollout has {:?} channels, spec has {:?}", channels, spec_channels),
                    ));
                }
                Value::from(channels.unwrap_or_default())
            }
        };
        debug!("inferred {} = {:?}", request, value);
        Ok(value)
    }

    /// Infer every request of `binding` and finalize its constructor.
    pub fn finalize(&mut self, binding: ShapeBinding) -> Result<Instance, ShapeError> {
        let ShapeBinding {
            slot,
            requests,
            mut args,
        } = binding;
        for (argument, request) in &requests {
            args.insert(argument.clone(), self.infer(request)?);
        }
        Ok(slot.finalize(args)?)
    }
}

/// Finalize each binding with shapes inferred from `env`, in order.
pub fn resolve_shapes(
    env: &mut dyn Environment,
    bindings: Vec<ShapeBinding>,
) -> Result<Vec<Instance>, ShapeError> {
    let mut inference = ShapeInference::new(env);
    bindings
        .into_iter()
        .map(|binding| inference.finalize(binding))
        .collect()
}
