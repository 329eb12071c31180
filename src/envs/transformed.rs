use super::{EnvError, Environment, NEXT_PREFIX};
use crate::specs::{CompositeSpec, TensorSpec};
use crate::tensordict::TensorDict;
use crate::transforms::Transform;
use log::debug;

/// An environment whose outputs pass through a chain of transforms.
///
/// Transforms apply in order to the reset observations and to the successor
/// observations and reward of every step. The observation spec is the base spec
/// transformed by the same chain.
#[derive(Debug)]
pub struct TransformedEnv {
    name: String,
    env: Box<dyn Environment>,
    transforms: Vec<Box<dyn Transform>>,
    observation_spec: CompositeSpec,
}

impl TransformedEnv {
    pub fn new(
        env: Box<dyn Environment>,
        transforms: Vec<Box<dyn Transform>>,
    ) -> Result<Self, EnvError> {
        let mut transformed = Self {
            name: format!("TransformedEnv({})", env.name()),
            observation_spec: env.observation_spec().clone(),
            env,
            transforms,
        };
        transformed.refresh_spec()?;
        Ok(transformed)
    }

    pub fn base_env(&self) -> &dyn Environment {
        self.env.as_ref()
    }

    pub fn transforms(&self) -> &[Box<dyn Transform>] {
        &self.transforms
    }

    fn refresh_spec(&mut self) -> Result<(), EnvError> {
        let mut spec = self.env.observation_spec().clone();
        for transform in &self.transforms {
            spec = transform.transform_observation_spec(spec)?;
        }
        self.observation_spec = spec;
        Ok(())
    }
}

impl Environment for TransformedEnv {
    fn name(&self) -> &str {
        &self.name
    }

    fn observation_spec(&self) -> &CompositeSpec {
        &self.observation_spec
    }

    fn action_spec(&self) -> &TensorSpec {
        self.env.action_spec()
    }

    fn reward_spec(&self) -> TensorSpec {
        self.transforms
            .iter()
            .fold(self.env.reward_spec(), |spec, t| t.transform_reward_spec(spec))
    }

    fn set_seed(&mut self, seed: u64) {
        self.env.set_seed(seed);
    }

    fn reset(&mut self) -> Result<TensorDict, EnvError> {
        let mut data = self.env.reset()?;
        for transform in &mut self.transforms {
            transform.reset(&mut data)?;
        }
        Ok(data)
    }

    fn step(&mut self, data: &TensorDict) -> Result<TensorDict, EnvError> {
        let mut out = self.env.step(data)?;
        for transform in &mut self.transforms {
            transform.call(&mut out, NEXT_PREFIX)?;
        }
        Ok(out)
    }

    fn append_transform(&mut self, transform: Box<dyn Transform>) -> Result<(), EnvError> {
        debug!("appending `{}` to `{}`", transform.name(), self.name);
        self.transforms.push(transform);
        if let Err(err) = self.refresh_spec() {
            self.transforms.pop();
            return Err(err);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.env.close();
    }
}
