//! Reinforcement learning environments
mod cartpole;
mod mock;
mod pendulum;
mod render;
mod transformed;

pub use cartpole::{CartPole, CartPoleConfig, EnvironmentParams, PhysicalConstants};
pub use mock::{MockContinuousEnv, MockContinuousEnvConfig, MockDiscreteEnv, MockDiscreteEnvConfig};
pub use pendulum::{Pendulum, PendulumConfig};
pub use transformed::TransformedEnv;

use crate::modules::ModuleError;
use crate::resolve::{Instance, RegistryBuilder, TargetDef};
use crate::specs::{CompositeSpec, TensorSpec};
use crate::tensordict::{TensorDict, TensorDictError};
use crate::transforms::Transform;
use crate::wiring::Component;
use crate::Prng;
use ndarray::ArrayD;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Key of the action entry.
pub const ACTION_KEY: &str = "action";
/// Key of the reward entry.
pub const REWARD_KEY: &str = "reward";
/// Key of the termination flag.
pub const DONE_KEY: &str = "done";
/// Prefix of entries describing the state after a step.
pub const NEXT_PREFIX: &str = "next_";

/// Key of the successor entry for observation `key`.
pub fn next_key(key: &str) -> String {
    format!("{}{}", NEXT_PREFIX, key)
}

/// Error interacting with an environment
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("invalid action for `{env}`: {reason}")]
    InvalidAction { env: String, reason: String },
    #[error("`{0}` must be reset before stepping")]
    NeedsReset(String),
    #[error("`{env}` does not support {operation}")]
    Unsupported {
        env: String,
        operation: &'static str,
    },
    #[error("transform `{transform}`: {reason}")]
    Transform { transform: String, reason: String },
    #[error(transparent)]
    TensorDict(#[from] TensorDictError),
    #[error("policy failed")]
    Policy(#[from] ModuleError),
    #[error("environment factory failed")]
    Factory(#[source] Box<dyn StdError + Send + Sync>),
}

impl EnvError {
    pub fn factory<E: StdError + Send + Sync + 'static>(err: E) -> Self {
        Self::Factory(Box::new(err))
    }
}

/// A reinforcement learning environment exchanging [`TensorDict`]s.
///
/// Unbatched: `reset` and `step` produce entries with an empty batch size.
pub trait Environment: fmt::Debug + Send {
    fn name(&self) -> &str;

    /// Spec of every observation entry, by key.
    fn observation_spec(&self) -> &CompositeSpec;

    fn action_spec(&self) -> &TensorSpec;

    fn reward_spec(&self) -> TensorSpec {
        TensorSpec::Unbounded { shape: vec![1] }
    }

    /// Reseed the environment's internal randomness.
    fn set_seed(&mut self, seed: u64);

    /// Start a new episode; returns the initial observation entries.
    fn reset(&mut self) -> Result<TensorDict, EnvError>;

    /// Apply the [`ACTION_KEY`] entry of `data`.
    ///
    /// Returns the successor observations under [`next_key`] names together with
    /// [`REWARD_KEY`] and [`DONE_KEY`] entries of shape `[1]`.
    fn step(&mut self, data: &TensorDict) -> Result<TensorDict, EnvError>;

    /// Run one episode of at most `max_steps` steps.
    ///
    /// Actions come from `policy`, or are sampled from the action spec if there is none.
    /// Each step records the current observations, the action and the step output;
    /// the steps are stacked along a new leading batch dimension. Zero steps give a
    /// batch of size 0 holding the reset entries.
    fn rollout(
        &mut self,
        max_steps: usize,
        policy: Option<&dyn Component>,
        rng: &mut Prng,
    ) -> Result<TensorDict, EnvError> {
        let mut current = self.reset()?;
        let mut steps = Vec::with_capacity(max_steps);
        for _ in 0..max_steps {
            let mut data = current;
            match policy {
                Some(policy) => policy.forward(&mut data, rng)?,
                None => {
                    let action = self.action_spec().rand(&[], rng);
                    data.insert(ACTION_KEY, action)?;
                }
            }
            let out = self.step(&data)?;
            data.update(&out)?;
            let done = is_done(&data);
            current = step_mdp(&data, self.observation_spec());
            steps.push(data);
            if done {
                break;
            }
        }
        if steps.is_empty() {
            let mut empty = TensorDict::new(vec![0]);
            for (key, value) in &current {
                let mut shape = vec![0];
                shape.extend_from_slice(value.shape());
                empty.insert(key.clone(), ArrayD::zeros(shape))?;
            }
            return Ok(empty);
        }
        Ok(TensorDict::stack(&steps)?)
    }

    /// Append a transform applied to every subsequent output.
    fn append_transform(&mut self, transform: Box<dyn Transform>) -> Result<(), EnvError> {
        Err(EnvError::Unsupported {
            env: format!("{} (transform `{}`)", self.name(), transform.name()),
            operation: "appending transforms",
        })
    }

    /// Release resources. The environment must not be used afterwards.
    fn close(&mut self) {}
}

/// Builds a fresh environment on each call.
#[derive(Clone)]
pub struct EnvFactory(Arc<dyn Fn() -> Result<Box<dyn Environment>, EnvError> + Send + Sync>);

impl fmt::Debug for EnvFactory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EnvFactory")
    }
}

impl EnvFactory {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Environment>, EnvError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn create(&self) -> Result<Box<dyn Environment>, EnvError> {
        (self.0)()
    }
}

/// Observations for the next step: the `next_` entries of `data` renamed to their
/// observation keys.
pub fn step_mdp(data: &TensorDict, observation_spec: &CompositeSpec) -> TensorDict {
    let mut next = TensorDict::new(data.batch_size().to_vec());
    for key in observation_spec.keys() {
        if let Some(value) = data.get(&next_key(key)) {
            next.set(key, value.clone());
        }
    }
    next
}

/// Whether any done flag in `data` is set.
pub fn is_done(data: &TensorDict) -> bool {
    data.get(DONE_KEY)
        .map_or(false, |done| done.iter().any(|&d| d > 0.5))
}

/// Validate and take the action entry of `data`.
pub(crate) fn read_action<'a>(
    env: &str,
    data: &'a TensorDict,
    spec: &TensorSpec,
) -> Result<&'a ArrayD<f64>, EnvError> {
    let action = data.get(ACTION_KEY).ok_or_else(|| EnvError::InvalidAction {
        env: env.into(),
        reason: format!("missing `{}` entry", ACTION_KEY),
    })?;
    if action.shape() != spec.shape().as_slice() {
        return Err(EnvError::InvalidAction {
            env: env.into(),
            reason: format!("expected shape {:?}, got {:?}", spec.shape(), action.shape()),
        });
    }
    Ok(action)
}

/// Step output: successor observations, reward and done flag.
pub(crate) fn step_output(
    observations: TensorDict,
    reward: f64,
    done: bool,
) -> TensorDict {
    let mut out = TensorDict::new(vec![]);
    for (key, value) in &observations {
        out.set(next_key(key), value.clone());
    }
    out.set(REWARD_KEY, ArrayD::from_elem(vec![1], reward));
    out.set(DONE_KEY, ArrayD::from_elem(vec![1], if done { 1.0 } else { 0.0 }));
    out
}

/// Register the environments of this module.
pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .register(
            TargetDef::new("envs.CartPole")
                .optional("seed")
                .optional("from_pixels")
                .optional("pixels_only")
                .optional("render_size")
                .optional("max_steps")
                .optional("physics")
                .optional("params"),
            |args| {
                let config: CartPoleConfig = args.take_config()?;
                Ok(Instance::Env(Box::new(config.build())))
            },
        )
        .register(
            TargetDef::new("envs.Pendulum")
                .optional("seed")
                .optional("from_pixels")
                .optional("pixels_only")
                .optional("render_size")
                .optional("max_steps"),
            |args| {
                let config: PendulumConfig = args.take_config()?;
                Ok(Instance::Env(Box::new(config.build())))
            },
        )
        .register(
            TargetDef::new("envs.MockContinuousEnv")
                .optional("seed")
                .optional("max_steps"),
            |args| {
                let config: MockContinuousEnvConfig = args.take_config()?;
                Ok(Instance::Env(Box::new(config.build())))
            },
        )
        .register(
            TargetDef::new("envs.MockDiscreteEnv")
                .optional("num_actions")
                .optional("seed")
                .optional("max_steps"),
            |args| {
                let config: MockDiscreteEnvConfig = args.take_config()?;
                Ok(Instance::Env(Box::new(config.build())))
            },
        )
        .register(
            TargetDef::new("envs.TransformedEnv")
                .required("env")
                .optional("transforms"),
            |args| {
                let env = args.env("env")?;
                let transforms = args.transforms("transforms")?;
                Ok(Instance::Env(Box::new(TransformedEnv::new(env, transforms)?)))
            },
        )
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use rand::SeedableRng;

    /// Run a few random episodes, checking outputs against the env specs.
    pub fn check_env(env: &mut dyn Environment, num_steps: usize) {
        let mut rng = Prng::seed_from_u64(0);
        let observation_spec = env.observation_spec().clone();
        let action_spec = env.action_spec().clone();
        let mut data = env.reset().unwrap();
        assert!(observation_spec.is_in(&data), "{} not in {}", data, observation_spec);
        for _ in 0..num_steps {
            data.set(ACTION_KEY, action_spec.rand(&[], &mut rng));
            let out = env.step(&data).unwrap();
            assert_eq!(out.get(REWARD_KEY).unwrap().shape(), &[1]);
            data = step_mdp(&out, &observation_spec);
            assert!(observation_spec.is_in(&data), "{} not in {}", data, observation_spec);
            if is_done(&out) {
                data = env.reset().unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Value;
    use crate::resolve::{Args, NodeResolver};
    use rand::SeedableRng;

    #[test]
    fn rollout_records_next_entries() {
        let mut env = MockDiscreteEnv::new(3);
        let mut rng = Prng::seed_from_u64(0);
        let rollout = env.rollout(5, None, &mut rng).unwrap();
        assert_eq!(rollout.batch_size(), &[5]);
        for key in ["observation", "next_observation", "action", "reward", "done"] {
            assert!(rollout.contains(key), "{}", key);
        }
        assert!(env.action_spec().is_in(rollout.get("action").unwrap()));
    }

    #[test]
    fn zero_step_rollout_is_empty_batch() {
        let mut env = MockContinuousEnv::default();
        let rollout = env.rollout(0, None, &mut Prng::seed_from_u64(0)).unwrap();
        assert_eq!(rollout.batch_size(), &[0]);
        assert_eq!(rollout.numel(), 0);
        assert_eq!(rollout.get("observation").unwrap().shape(), &[0, 7]);
    }

    #[test]
    fn rollout_stops_when_done() {
        let mut env = MockDiscreteEnvConfig {
            max_steps: 2,
            ..MockDiscreteEnvConfig::default()
        }
        .build();
        let mut rng = Prng::seed_from_u64(0);
        assert_eq!(env.rollout(10, None, &mut rng).unwrap().numel(), 2);
    }

    #[test]
    fn step_before_reset_fails() {
        let mut env = MockContinuousEnv::default();
        let mut data = TensorDict::new(vec![]);
        data.set(ACTION_KEY, ArrayD::zeros(vec![7]));
        assert!(matches!(env.step(&data), Err(EnvError::NeedsReset(_))));
    }

    #[test]
    fn base_env_rejects_transforms() {
        let mut env = MockContinuousEnv::default();
        let transform = crate::transforms::RewardScaling::new(0.0, 2.0);
        assert!(matches!(
            env.append_transform(Box::new(transform)),
            Err(EnvError::Unsupported { .. })
        ));
    }

    #[test]
    fn factory_creates_fresh_envs() {
        let factory = EnvFactory::new(|| Ok(Box::new(MockContinuousEnv::default()) as Box<dyn Environment>));
        let a = factory.create().unwrap();
        let b = factory.clone().create().unwrap();
        assert_eq!(a.observation_spec(), b.observation_spec());
    }

    #[test]
    fn resolve_transformed_env() {
        let node = Value::from_yaml(
            "
_target_: envs.TransformedEnv
env:
  _target_: envs.CartPole
  seed: 1
transforms:
  - _target_: transforms.RewardScaling
    loc: 0.0
    scale: 0.5
",
        )
        .unwrap();
        let mut env = NodeResolver::standard()
            .instantiate(&node, Args::new())
            .unwrap()
            .into_env()
            .unwrap();
        let mut rng = Prng::seed_from_u64(0);
        let rollout = env.rollout(3, None, &mut rng).unwrap();
        assert!(rollout.get("reward").unwrap().iter().all(|&r| r == 0.5));
    }

    #[test]
    fn unknown_env_option() {
        let node = Value::from_yaml("{_target_: envs.Pendulum, physics: {}}").unwrap();
        assert!(NodeResolver::standard().instantiate(&node, Args::new()).is_err());
    }
}
