use super::render::Canvas;
use super::{read_action, step_output, EnvError, Environment};
use crate::specs::{CompositeSpec, TensorSpec};
use crate::tensordict::TensorDict;
use crate::Prng;
use ndarray::{arr1, ArrayD};
use rand::distributions::{Distribution, Uniform};
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

const MAX_SPEED: f64 = 8.0;
const MAX_TORQUE: f64 = 2.0;
const DT: f64 = 0.05;
const GRAVITY: f64 = 10.0;
const MASS: f64 = 1.0;
const LENGTH: f64 = 1.0;

/// Configuration for the [`Pendulum`] environment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PendulumConfig {
    pub seed: u64,
    /// Observe rendered RGB images under the `pixels` key.
    pub from_pixels: bool,
    /// With `from_pixels`, drop the `observation` state vector.
    pub pixels_only: bool,
    pub render_size: usize,
    pub max_steps: usize,
}

impl Default for PendulumConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            from_pixels: false,
            pixels_only: true,
            render_size: 64,
            max_steps: 200,
        }
    }
}

impl PendulumConfig {
    pub fn build(&self) -> Pendulum {
        let mut observation_spec = CompositeSpec::new();
        if !(self.from_pixels && self.pixels_only) {
            observation_spec.insert("observation", TensorSpec::bounded(vec![3], -MAX_SPEED, MAX_SPEED));
        }
        if self.from_pixels {
            observation_spec.insert(
                "pixels",
                TensorSpec::bounded(vec![self.render_size, self.render_size, 3], 0.0, 255.0),
            );
        }
        Pendulum {
            config: *self,
            observation_spec,
            action_spec: TensorSpec::bounded(vec![1], -MAX_TORQUE, MAX_TORQUE),
            rng: Prng::seed_from_u64(self.seed),
            state: None,
            num_steps: 0,
        }
    }
}

/// Inverted pendulum swing-up with a continuous torque action.
///
/// Dynamics and reward follow the OpenAI Gym `Pendulum-v1` environment.
/// Observations are `[cos(theta), sin(theta), angular_velocity]`.
#[derive(Debug, Clone)]
pub struct Pendulum {
    config: PendulumConfig,
    observation_spec: CompositeSpec,
    action_spec: TensorSpec,
    rng: Prng,
    /// `(theta, angular_velocity)`; `None` until reset and after the episode ends.
    state: Option<(f64, f64)>,
    num_steps: usize,
}

impl Default for Pendulum {
    fn default() -> Self {
        PendulumConfig::default().build()
    }
}

impl Pendulum {
    fn observe(&self, theta: f64, velocity: f64) -> TensorDict {
        let mut data = TensorDict::new(vec![]);
        if self.observation_spec.contains("observation") {
            data.set("observation", arr1(&[theta.cos(), theta.sin(), velocity]).into_dyn());
        }
        if self.config.from_pixels {
            data.set("pixels", self.render(theta));
        }
        data
    }

    fn render(&self, theta: f64) -> ArrayD<f64> {
        #[allow(clippy::cast_precision_loss)]
        let size = self.config.render_size as f64;
        let mut canvas = Canvas::new(self.config.render_size, self.config.render_size);
        let center = (size / 2.0, size / 2.0);
        let radius = 0.4 * size;
        let tip = (center.0 + radius * theta.sin(), center.1 - radius * theta.cos());
        canvas.draw_line(center, tip, 0.08 * size, [204.0, 77.0, 77.0]);
        canvas.fill_rect(
            (center.0 - 1.0, center.1 - 1.0),
            (center.0 + 1.0, center.1 + 1.0),
            [0.0, 0.0, 0.0],
        );
        canvas.into_array()
    }
}

/// Angle wrapped into `[-pi, pi)`.
fn angle_normalize(x: f64) -> f64 {
    (x + PI).rem_euclid(2.0 * PI) - PI
}

impl Environment for Pendulum {
    fn name(&self) -> &str {
        "Pendulum"
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
        let theta = Uniform::new_inclusive(-PI, PI).sample(&mut self.rng);
        let velocity = Uniform::new_inclusive(-1.0, 1.0).sample(&mut self.rng);
        self.state = Some((theta, velocity));
        self.num_steps = 0;
        Ok(self.observe(theta, velocity))
    }

    fn step(&mut self, data: &TensorDict) -> Result<TensorDict, EnvError> {
        let (theta, velocity) = self
            .state
            .ok_or_else(|| EnvError::NeedsReset(self.name().into()))?;
        let action = read_action(self.name(), data, &self.action_spec)?;
        let torque = action[[0]].clamp(-MAX_TORQUE, MAX_TORQUE);

        let cost = angle_normalize(theta).powi(2) + 0.1 * velocity.powi(2) + 0.001 * torque.powi(2);
        let acceleration =
            3.0 * GRAVITY / (2.0 * LENGTH) * theta.sin() + 3.0 / (MASS * LENGTH.powi(2)) * torque;
        let velocity = DT.mul_add(acceleration, velocity).clamp(-MAX_SPEED, MAX_SPEED);
        let theta = DT.mul_add(velocity, theta);

        self.num_steps += 1;
        let done = self.num_steps >= self.config.max_steps;
        self.state = if done { None } else { Some((theta, velocity)) };
        Ok(step_output(self.observe(theta, velocity), -cost, done))
    }
}
