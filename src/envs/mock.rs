//! Lightweight environments for tests and smoke runs
use super::{read_action, step_output, EnvError, Environment};
use crate::specs::{argmax, CompositeSpec, TensorSpec};
use crate::tensordict::TensorDict;
use crate::Prng;
use ndarray::{Array1, ArrayD};
use rand::distributions::Distribution;
use rand::SeedableRng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

const CONTINUOUS_DIM: usize = 7;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MockContinuousEnvConfig {
    pub seed: u64,
    pub max_steps: usize,
}

impl Default for MockContinuousEnvConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            max_steps: 1000,
        }
    }
}

impl MockContinuousEnvConfig {
    pub fn build(&self) -> MockContinuousEnv {
        MockContinuousEnv {
            config: *self,
            observation_spec: CompositeSpec::new().with(
                "observation",
                TensorSpec::Unbounded {
                    shape: vec![CONTINUOUS_DIM],
                },
            ),
            action_spec: TensorSpec::bounded(vec![CONTINUOUS_DIM], -1.0, 1.0),
            rng: Prng::seed_from_u64(self.seed),
            state: None,
            num_steps: 0,
        }
    }
}

/// Continuous 7-dimensional observations and actions.
///
/// The observation drifts by a tenth of the (clamped) action plus a little noise;
/// the reward is the negative squared norm of the new observation.
#[derive(Debug, Clone)]
pub struct MockContinuousEnv {
    config: MockContinuousEnvConfig,
    observation_spec: CompositeSpec,
    action_spec: TensorSpec,
    rng: Prng,
    state: Option<Array1<f64>>,
    num_steps: usize,
}

impl Default for MockContinuousEnv {
    fn default() -> Self {
        MockContinuousEnvConfig::default().build()
    }
}

impl MockContinuousEnv {
    fn observe(state: &Array1<f64>) -> TensorDict {
        let mut data = TensorDict::new(vec![]);
        data.set("observation", state.clone().into_dyn());
        data
    }
}

impl Environment for MockContinuousEnv {
    fn name(&self) -> &str {
        "MockContinuousEnv"
    }

    fn observation_spec(&self) -> &CompositeSpec {
        &self.observation_spec
    }

    fn action_spec(&self) -> &TensorSpec {
        &self.action_spec
    }

    fn set_seed(&mut self, seed: u64) {
        self.rng = Prng::seed_from_u64(seed);
    }

    fn reset(&mut self) -> Result<TensorDict, EnvError> {
        let rng = &mut self.rng;
        let state = Array1::from_shape_simple_fn(CONTINUOUS_DIM, || StandardNormal.sample(rng));
        let data = Self::observe(&state);
        self.state = Some(state);
        self.num_steps = 0;
        Ok(data)
    }

    fn step(&mut self, data: &TensorDict) -> Result<TensorDict, EnvError> {
        let state = self
            .state
            .take()
            .ok_or_else(|| EnvError::NeedsReset(self.name().into()))?;
        let action = match read_action(self.name(), data, &self.action_spec) {
            Ok(action) => self.action_spec.project(action),
            Err(err) => {
                self.state = Some(state);
                return Err(err);
            }
        };
        let rng = &mut self.rng;
        let noise = Array1::from_shape_simple_fn(CONTINUOUS_DIM, || {
            let x: f64 = StandardNormal.sample(rng);
            0.01 * x
        });
        let next = state + &action.iter().map(|a| 0.1 * a).collect::<Array1<f64>>() + noise;
        let reward = -next.dot(&next);
        let out = Self::observe(&next);

        self.num_steps += 1;
        let done = self.num_steps >= self.config.max_steps;
        if !done {
            self.state = Some(next);
        }
        Ok(step_output(out, reward, done))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MockDiscreteEnvConfig {
    pub num_actions: usize,
    pub seed: u64,
    pub max_steps: usize,
}

impl Default for MockDiscreteEnvConfig {
    fn default() -> Self {
        Self {
            num_actions: 4,
            seed: 0,
            max_steps: 100,
        }
    }
}

impl MockDiscreteEnvConfig {
    pub fn build(&self) -> MockDiscreteEnv {
        MockDiscreteEnv {
            config: *self,
            observation_spec: CompositeSpec::new()
                .with("observation", TensorSpec::Unbounded { shape: vec![4] }),
            action_spec: TensorSpec::OneHot {
                n: self.num_actions,
            },
            rng: Prng::seed_from_u64(self.seed),
            num_steps: None,
        }
    }
}

/// Random 4-dimensional observations and a one-hot action.
///
/// Action `i` earns a reward of 1 on steps where `step % num_actions == i`.
#[derive(Debug, Clone)]
pub struct MockDiscreteEnv {
    config: MockDiscreteEnvConfig,
    observation_spec: CompositeSpec,
    action_spec: TensorSpec,
    rng: Prng,
    /// Steps taken in the current episode; `None` until reset and after the episode ends.
    num_steps: Option<usize>,
}

impl Default for MockDiscreteEnv {
    fn default() -> Self {
        MockDiscreteEnvConfig::default().build()
    }
}

impl MockDiscreteEnv {
    pub fn new(num_actions: usize) -> Self {
        MockDiscreteEnvConfig {
            num_actions,
            ..MockDiscreteEnvConfig::default()
        }
        .build()
    }

    fn observe(&mut self) -> TensorDict {
        let rng = &mut self.rng;
        let mut data = TensorDict::new(vec![]);
        data.set(
            "observation",
            ArrayD::from_shape_simple_fn(vec![4], || StandardNormal.sample(rng)),
        );
        data
    }
}

impl Environment for MockDiscreteEnv {
    fn name(&self) -> &str {
        "MockDiscreteEnv"
    }

    fn observation_spec(&self) -> &CompositeSpec {
        &self.observation_spec
    }

    fn action_spec(&self) -> &TensorSpec {
        &self.action_spec
    }

    fn set_seed(&mut self, seed: u64) {
        self.rng = Prng::seed_from_u64(seed);
    }

    fn reset(&mut self) -> Result<TensorDict, EnvError> {
        self.num_steps = Some(0);
        Ok(self.observe())
    }

    fn step(&mut self, data: &TensorDict) -> Result<TensorDict, EnvError> {
        let step = self
            .num_steps
            .ok_or_else(|| EnvError::NeedsReset(self.name().into()))?;
        let action = read_action(self.name(), data, &self.action_spec)?;
        let reward = if argmax(action.iter().copied()) == Some(step % self.config.num_actions) {
            1.0
        } else {
            0.0
        };
        let done = step + 1 >= self.config.max_steps;
        self.num_steps = if done { None } else { Some(step + 1) };
        let out = self.observe();
        Ok(step_output(out, reward, done))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use ndarray::arr1;

    #[test]
    fn run_continuous() {
        testing::check_env(&mut MockContinuousEnv::default(), 100);
    }

    #[test]
    fn run_discrete() {
        testing::check_env(&mut MockDiscreteEnv::new(4), 250);
    }

    #[test]
    fn discrete_reward_follows_step() {
        let mut env = MockDiscreteEnv::new(2);
        env.reset().unwrap();
        let mut data = TensorDict::new(vec![]);
        data.set("action", arr1(&[1.0, 0.0]).into_dyn());
        let rewards: Vec<f64> = (0..4)
            .map(|_| env.step(&data).unwrap().get("reward").unwrap()[[0]])
            .collect();
        assert_eq!(rewards, vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn continuous_rejects_wrong_shape() {
        let mut env = MockContinuousEnv::default();
        env.reset().unwrap();
        let mut data = TensorDict::new(vec![]);
        data.set("action", arr1(&[0.0; 3]).into_dyn());
        assert!(matches!(env.step(&data), Err(EnvError::InvalidAction { .. })));
        data.set("action", arr1(&[0.0; 7]).into_dyn());
        assert!(env.step(&data).is_ok());
    }
}
