use super::render::Canvas;
use super::{read_action, step_output, EnvError, Environment};
use crate::specs::{argmax, CompositeSpec, TensorSpec};
use crate::tensordict::TensorDict;
use crate::Prng;
use ndarray::arr1;
use rand::distributions::{Distribution, Uniform};
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Configuration for the [`CartPole`] environment.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CartPoleConfig {
    pub seed: u64,
    /// Observe rendered RGB images under the `pixels` key.
    pub from_pixels: bool,
    /// With `from_pixels`, drop the `observation` state vector.
    pub pixels_only: bool,
    /// Height and width of rendered images.
    pub render_size: usize,
    /// Episode step limit.
    pub max_steps: usize,
    /// Physics configuration
    pub physics: PhysicalConstants,
    /// Environment environment configuration
    pub params: EnvironmentParams,
}

impl Default for CartPoleConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            from_pixels: false,
            pixels_only: true,
            render_size: 64,
            max_steps: 500,
            physics: PhysicalConstants::default(),
            params: EnvironmentParams::default(),
        }
    }
}

impl CartPoleConfig {
    pub fn build(&self) -> CartPole {
        let mut observation_spec = CompositeSpec::new();
        if !(self.from_pixels && self.pixels_only) {
            observation_spec.insert("observation", TensorSpec::Unbounded { shape: vec![4] });
        }
        if self.from_pixels {
            observation_spec.insert(
                "pixels",
                TensorSpec::bounded(vec![self.render_size, self.render_size, 3], 0.0, 255.0),
            );
        }
        CartPole {
            phys: self.physics.into(),
            env: self.params,
            config: *self,
            observation_spec,
            action_spec: TensorSpec::OneHot { n: 2 },
            rng: Prng::seed_from_u64(self.seed),
            state: None,
            num_steps: 0,
        }
    }
}

/// Cart-Pole environment
///
/// Consists of a simulated cart on a track with a vertical pole attached by a hinge on the top.
/// The goal is to keep the pole upright by applying left and right forces to the cart.
/// The action is one-hot over (left, right).
///
/// The environment is based on [Barto et al. (1983)][barto1983] with updated dynamics equations
/// from [Florian (2005)][florian2005], who corrects the friction term.
/// The default dynamics constants and episode parameters are based on the
/// [OpenAI Gym][gym_cartpole] [CartPole-v1 environment][cartpole_source].
///
/// [barto1983]: https://ieeexplore.ieee.org/document/6313077
/// [florian2005]: https://coneural.org/florian/papers/05_cart_pole.pdf
/// [gym_cartpole]: https://gym.openai.com/envs/CartPole-v1/
/// [cartpole_source]: https://github.com/openai/gym/blob/master/gym/envs/classic_control/cartpole.py
#[derive(Debug, Clone)]
pub struct CartPole {
    phys: InternalPhysicalConstants,
    env: EnvironmentParams,
    config: CartPoleConfig,
    observation_spec: CompositeSpec,
    action_spec: TensorSpec,
    rng: Prng,
    /// `None` until reset and after the episode ends.
    state: Option<CartPoleInternalState>,
    num_steps: usize,
}

impl Default for CartPole {
    fn default() -> Self {
        CartPoleConfig::default().build()
    }
}

impl CartPole {
    fn observe(&self, state: &CartPolePhysicalState) -> TensorDict {
        let mut data = TensorDict::new(vec![]);
        if self.observation_spec.contains("observation") {
            data.set(
                "observation",
                arr1(&[
                    state.cart_position,
                    state.cart_velocity,
                    state.pole_angle,
                    state.pole_angular_velocity,
                ])
                .into_dyn(),
            );
        }
        if self.config.from_pixels {
            data.set("pixels", self.render(state));
        }
        data
    }

    /// RGB image of the cart and pole, channels last, values in `[0, 255]`.
    fn render(&self, state: &CartPolePhysicalState) -> ndarray::ArrayD<f64> {
        #[allow(clippy::cast_precision_loss)]
        let size = self.config.render_size as f64;
        let scale = size / (2.0 * self.env.max_pos);
        let mut canvas = Canvas::new(self.config.render_size, self.config.render_size);
        let track_y = 0.75 * size;
        canvas.draw_line((0.0, track_y), (size, track_y), 0.5, [0.0, 0.0, 0.0]);

        let cart_x = state.cart_position.mul_add(scale, size / 2.0);
        let (cart_w, cart_h) = (0.12 * size, 0.06 * size);
        canvas.fill_rect(
            (cart_x - cart_w / 2.0, track_y - cart_h),
            (cart_x + cart_w / 2.0, track_y),
            [0.0, 0.0, 0.0],
        );
        let pole_len = 2.0 * self.phys.c.length_half_pole * scale;
        let (sin_angle, cos_angle) = state.pole_angle.sin_cos();
        let base = (cart_x, track_y - cart_h);
        let tip = (
            base.0 + pole_len * sin_angle,
            base.1 - pole_len * cos_angle,
        );
        canvas.draw_line(base, tip, 0.02 * size, [204.0, 153.0, 102.0]);
        canvas.into_array()
    }
}

impl Environment for CartPole {
    fn name(&self) -> &str {
        "CartPole"
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
        // All parameters are sampled from the same range of values
        let dist = Uniform::new_inclusive(-0.05, 0.05);
        let state = CartPoleInternalState {
            physical: CartPolePhysicalState {
                cart_position: dist.sample(&mut self.rng),
                cart_velocity: dist.sample(&mut self.rng),
                pole_angle: dist.sample(&mut self.rng),
                pole_angular_velocity: dist.sample(&mut self.rng),
            },
            cached_normal_velocity_is_positive: true,
        };
        self.state = Some(state);
        self.num_steps = 0;
        Ok(self.observe(&state.physical))
    }

    fn step(&mut self, data: &TensorDict) -> Result<TensorDict, EnvError> {
        let state = self
            .state
            .ok_or_else(|| EnvError::NeedsReset(self.name().into()))?;
        let action = read_action(self.name(), data, &self.action_spec)?;
        let applied_force = match argmax(action.iter().copied()) {
            Some(0) => -self.env.action_force,
            _ => self.env.action_force,
        };
        let next_state = self.phys.next_state(&state, applied_force);
        self.num_steps += 1;
        let terminal = next_state.physical.cart_position.abs() > self.env.max_pos
            || next_state.physical.pole_angle.abs() > self.env.max_angle;
        let done = terminal || self.num_steps >= self.config.max_steps;
        self.state = if done { None } else { Some(next_state) };
        Ok(step_output(self.observe(&next_state.physical), 1.0, done))
    }
}

/// Physical constants for the [`CartPole`] environment.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicalConstants {
    /// Downward force of gravity (m/s^2)
    pub gravity: f64,
    /// Mass of the cart (kg)
    pub mass_cart: f64,
    /// Mass of the pole (kg)
    pub mass_pole: f64,
    /// Half the length of the pole (m)
    pub length_half_pole: f64,
    /// Coefficient of friction between the cart and the track (unitless).
    ///
    /// The track is assumed to fully confine the cart in the vertical direction and this same
    /// friction coefficient applies whether the normal force of the cart is up or down.
    pub friction_cart: f64,
    /// Coefficient of friction between the pole and the cart at the hinge (unitless).
    pub friction_pole: f64,
    /// Simulation time step (s)
    pub time_step: f64,
}

impl Default for PhysicalConstants {
    fn default() -> Self {
        // Defaults (other than friction) from the OpenAI CartPole-v1 environment
        Self {
            gravity: 9.8,
            mass_cart: 1.0,
            mass_pole: 0.1,
            length_half_pole: 0.5,
            friction_cart: 0.01,
            friction_pole: 0.01,
            time_step: 0.02,
        }
    }
}

/// Parameters for [`CartPole`] as a reinforcement learning environment.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentParams {
    /// Magnitude of the force (N) applied by actions.
    pub action_force: f64,
    /// Maximum absolute position (meters) before the episode is ended.
    pub max_pos: f64,
    /// Maximum absolute pole angle from vertical (radians) before the episode is ended.
    pub max_angle: f64,
}

impl Default for EnvironmentParams {
    fn default() -> Self {
        // Defaults from the OpenAI CartPole-v1 environment
        Self {
            action_force: 10.0,
            max_pos: 2.4,
            max_angle: 12.0f64.to_radians(), // 12 degrees
        }
    }
}

/// Internal cart-pole constants with pre-computed common values.
#[derive(Debug, Copy, Clone, PartialEq)]
struct InternalPhysicalConstants {
    /// Fundamental constants
    c: PhysicalConstants,
    /// Gravitational weight of the combined system (N): `gravity * (mass_cart + mass_pole)`.
    total_weight: f64,
    /// `1 / (mass_cart + mass_pole)`,
    inv_total_mass: f64,
    /// `mass_pole * length_half_pole`
    mass_length_pole: f64,
}

impl From<PhysicalConstants> for InternalPhysicalConstants {
    fn from(c: PhysicalConstants) -> Self {
        let total_mass = c.mass_cart + c.mass_pole;
        Self {
            c,
            total_weight: c.gravity * total_mass,
            inv_total_mass: total_mass.recip(),
            mass_length_pole: c.mass_pole * c.length_half_pole,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
struct CartPolePhysicalState {
    cart_position: f64,
    cart_velocity: f64,
    pole_angle: f64,
    pole_angular_velocity: f64,
}

#[derive(Debug, Copy, Clone, PartialEq)]
struct CartPoleInternalState {
    physical: CartPolePhysicalState,
    /// Sign of `normal_force * cart_velocity` from the previous step.
    ///
    /// The dynamics are circular in this term. The previous value is tried first and
    /// negated if the result is inconsistent.
    cached_normal_velocity_is_positive: bool,
}

impl InternalPhysicalConstants {
    /// Simulate the state for one time step with an applied force on the cart (in N).
    fn next_state(&self, state: &CartPoleInternalState, applied_force: f64) -> CartPoleInternalState {
        // "Correct equations for the dynamics of the cart-pole system" by Florian (2005)
        let phys = &state.physical;
        let (sin_angle, cos_angle) = phys.pole_angle.sin_cos();
        let angular_velocity_squared = phys.pole_angular_velocity * phys.pole_angular_velocity;

        let solve = |signed_cart_friction: f64| {
            let angular_acceleration = self.angular_acceleration(
                phys,
                applied_force,
                signed_cart_friction,
                angular_velocity_squared,
                sin_angle,
                cos_angle,
            );
            let normal_force = angular_acceleration.mul_add(
                -self.mass_length_pole * sin_angle,
                self.total_weight - self.mass_length_pole * angular_velocity_squared * cos_angle,
            );
            (angular_acceleration, normal_force)
        };

        let mut signed_cart_friction = if state.cached_normal_velocity_is_positive {
            self.c.friction_cart
        } else {
            -self.c.friction_cart
        };
        let (mut angular_acceleration, mut normal_force) = solve(signed_cart_friction);
        let normal_velocity_is_positive = (normal_force * phys.cart_velocity).is_sign_positive();
        if normal_velocity_is_positive != state.cached_normal_velocity_is_positive {
            signed_cart_friction = -signed_cart_friction;
            let (a, n) = solve(signed_cart_friction);
            angular_acceleration = a;
            normal_force = n;
        }

        let force_pole = self.mass_length_pole
            * angular_velocity_squared.mul_add(sin_angle, angular_acceleration * cos_angle);
        let force_friction = -signed_cart_friction * normal_force;
        let cart_acceleration = (applied_force + force_pole + force_friction) * self.inv_total_mass;

        // Semi-implicit euler integration
        let dt = self.c.time_step;
        let cart_velocity = dt.mul_add(cart_acceleration, phys.cart_velocity);
        let pole_angular_velocity = dt.mul_add(angular_acceleration, phys.pole_angular_velocity);
        CartPoleInternalState {
            physical: CartPolePhysicalState {
                cart_position: dt.mul_add(cart_velocity, phys.cart_position),
                cart_velocity,
                pole_angle: dt.mul_add(phys.pole_angular_velocity, phys.pole_angle),
                pole_angular_velocity,
            },
            cached_normal_velocity_is_positive: normal_velocity_is_positive,
        }
    }

    /// The pole angular acceleration; equation (21) of Florian (2005).
    ///
    /// # Args
    /// * `applied_force`            - Applied horizontal force on the cart (N).
    /// * `signed_cart_friction`     - `friction_cart * sign(normal_force * cart_velocity)`
    /// * `angular_velocity_squared` - `pole_angular_velocity ** 2`
    fn angular_acceleration(
        &self,
        state: &CartPolePhysicalState,
        applied_force: f64,
        signed_cart_friction: f64,
        angular_velocity_squared: f64,
        sin_angle: f64,
        cos_angle: f64,
    ) -> f64 {
        let alpha = (-applied_force
            - self.mass_length_pole
                * angular_velocity_squared
                * signed_cart_friction.mul_add(cos_angle, sin_angle))
            * self.inv_total_mass;
        let beta = self.c.friction_pole * state.pole_angular_velocity / self.mass_length_pole;
        let numerator = self.c.gravity.mul_add(
            sin_angle,
            cos_angle * self.c.gravity.mul_add(signed_cart_friction, alpha),
        ) - beta;
        let denominator = self.c.length_half_pole
            * (4.0 / 3.0
                - self.c.mass_pole
                    * cos_angle
                    * self.inv_total_mass
                    * (cos_angle - signed_cart_friction));
        numerator / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(false, true)]
    #[case(true, true)]
    #[case(true, false)]
    fn run_default(#[case] from_pixels: bool, #[case] pixels_only: bool) {
        let mut env = CartPoleConfig {
            from_pixels,
            pixels_only,
            render_size: 16,
            ..CartPoleConfig::default()
        }
        .build();
        testing::check_env(&mut env, 200);
    }

    #[test]
    fn pixel_spec_is_channels_last() {
        let env = CartPoleConfig {
            from_pixels: true,
            ..CartPoleConfig::default()
        }
        .build();
        let spec = env.observation_spec().get("pixels").unwrap();
        assert_eq!(spec.shape(), vec![64, 64, 3]);
        assert!(!env.observation_spec().contains("observation"));
    }

    #[test]
    fn pushing_right_moves_right() {
        let mut env = CartPole::default();
        let start = env.reset().unwrap();
        let mut data = TensorDict::new(vec![]);
        data.set("action", arr1(&[0.0, 1.0]).into_dyn());
        let mut out = env.step(&data).unwrap();
        for _ in 0..4 {
            out = env.step(&data).unwrap();
        }
        let x0 = start.get("observation").unwrap()[[0]];
        let x1 = out.get("next_observation").unwrap()[[0]];
        assert!(x1 > x0);
    }

    #[test]
    fn episode_terminates() {
        let mut env = CartPole::default();
        env.reset().unwrap();
        let mut data = TensorDict::new(vec![]);
        data.set("action", arr1(&[1.0, 0.0]).into_dyn());
        let done = (0..500).any(|_| super::super::is_done(&env.step(&data).unwrap()));
        assert!(done);
        assert!(matches!(env.step(&data), Err(EnvError::NeedsReset(_))));
    }

    #[test]
    fn seeded_resets_repeat() {
        let mut a = CartPole::default();
        let mut b = CartPole::default();
        assert_eq!(a.reset().unwrap(), b.reset().unwrap());
        b.set_seed(7);
        assert_ne!(a.reset().unwrap(), b.reset().unwrap());
    }
}
