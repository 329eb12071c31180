//! Stepping one environment with a policy
use super::{CollectorError, TRAJ_ID_KEY};
use crate::envs::{is_done, step_mdp, Environment, ACTION_KEY};
use crate::tensordict::TensorDict;
use crate::wiring::Component;
use crate::Prng;
use ndarray::ArrayD;
use rand::SeedableRng;
use std::sync::Arc;

/// Steps an environment continuously across episode boundaries.
///
/// An episode ends when the environment reports done or after `max_frames_per_traj`
/// steps; the next step then starts from a fresh reset.
#[derive(Debug)]
pub(crate) struct EnvRunner {
    env: Box<dyn Environment>,
    policy: Option<Arc<dyn Component>>,
    rng: Prng,
    max_frames_per_traj: Option<usize>,
    /// Observations for the next step; `None` when a reset is due.
    current: Option<TensorDict>,
    traj_steps: usize,
    traj_id: usize,
    /// Offset between the trajectory ids of different runners.
    traj_id_stride: usize,
}

impl EnvRunner {
    pub fn new(
        mut env: Box<dyn Environment>,
        policy: Option<Arc<dyn Component>>,
        max_frames_per_traj: Option<usize>,
        seed: u64,
    ) -> Self {
        env.set_seed(seed);
        Self {
            env,
            policy,
            rng: Prng::seed_from_u64(seed),
            max_frames_per_traj,
            current: None,
            traj_steps: 0,
            traj_id: 0,
            traj_id_stride: 1,
        }
    }

    /// Number trajectories `offset`, `offset + stride`, ...
    #[must_use]
    pub const fn with_traj_ids(mut self, offset: usize, stride: usize) -> Self {
        self.traj_id = offset;
        self.traj_id_stride = stride;
        self
    }

    pub fn env_name(&self) -> &str {
        self.env.name()
    }

    fn step(&mut self) -> Result<TensorDict, CollectorError> {
        let mut data = match self.current.take() {
            Some(data) => data,
            None => {
                self.traj_steps = 0;
                self.env.reset()?
            }
        };
        match &self.policy {
            Some(policy) => policy.forward(&mut data, &mut self.rng)?,
            None => {
                let action = self.env.action_spec().rand(&[], &mut self.rng);
                data.insert(ACTION_KEY, action)?;
            }
        }
        let out = self.env.step(&data)?;
        data.update(&out)?;
        #[allow(clippy::cast_precision_loss)]
        let traj_id = self.traj_id as f64;
        data.insert(TRAJ_ID_KEY, ArrayD::from_elem(vec![1], traj_id))?;
        self.traj_steps += 1;

        let truncated = self
            .max_frames_per_traj
            .map_or(false, |max| self.traj_steps >= max);
        if is_done(&data) || truncated {
            self.traj_id += self.traj_id_stride;
        } else {
            self.current = Some(step_mdp(&data, self.env.observation_spec()));
        }
        Ok(data)
    }

    /// Collect `frames` consecutive steps stacked along a leading batch dimension.
    pub fn collect(&mut self, frames: usize) -> Result<TensorDict, CollectorError> {
        let steps = (0..frames)
            .map(|_| self.step())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TensorDict::stack(&steps)?)
    }

    pub fn close(&mut self) {
        self.env.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envs::{MockDiscreteEnvConfig, DONE_KEY};

    fn runner(max_steps: usize, max_frames_per_traj: Option<usize>) -> EnvRunner {
        let env = MockDiscreteEnvConfig {
            max_steps,
            ..MockDiscreteEnvConfig::default()
        }
        .build();
        EnvRunner::new(Box::new(env), None, max_frames_per_traj, 0)
    }

    fn traj_ids(batch: &TensorDict) -> Vec<f64> {
        batch.get(TRAJ_ID_KEY).unwrap().iter().copied().collect()
    }

    #[test]
    fn continues_across_episodes() {
        let mut runner = runner(3, None);
        let batch = runner.collect(7).unwrap();
        assert_eq!(batch.batch_size(), &[7]);
        assert_eq!(traj_ids(&batch), vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let done: Vec<f64> = batch.get(DONE_KEY).unwrap().iter().copied().collect();
        assert_eq!(done[2], 1.0);
    }

    #[test]
    fn truncates_long_trajectories() {
        let mut runner = runner(100, Some(2));
        let batch = runner.collect(5).unwrap();
        assert_eq!(traj_ids(&batch), vec![0.0, 0.0, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn state_carries_between_batches() {
        let mut runner = runner(3, None).with_traj_ids(1, 4);
        runner.collect(2).unwrap();
        let batch = runner.collect(2).unwrap();
        assert_eq!(traj_ids(&batch), vec![1.0, 5.0]);
    }
}
