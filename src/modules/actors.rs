//! Networks bound to tensordict keys
use super::distributions::{
    log_softmax_inplace, BatchDistribution, DistributionKind, OneHotCategorical, TanhNormal,
};
use super::{
    gather_input, split_last, ModuleError, ACTION_VALUE_KEY, CHOSEN_ACTION_VALUE_KEY,
    SAMPLE_LOG_PROB_KEY,
};
use crate::envs::ACTION_KEY;
use crate::nn::Network;
use crate::specs::TensorSpec;
use crate::tensordict::TensorDict;
use crate::wiring::{Component, KeyContract};
use crate::Prng;
use ndarray::{Array1, ArrayD, Axis};
use serde::{Deserialize, Serialize};

/// A network reading `in_keys` and writing `out_keys`.
///
/// Several input keys are concatenated along their trailing axis. With several output
/// keys the network output is split evenly along its trailing axis, in key order.
#[derive(Debug)]
pub struct TensorDictModule {
    name: String,
    network: Box<dyn Network>,
    contract: KeyContract,
}

impl TensorDictModule {
    pub fn new(
        network: Box<dyn Network>,
        in_keys: Vec<String>,
        out_keys: Vec<String>,
    ) -> Result<Self, ModuleError> {
        Self::named("TensorDictModule", network, in_keys, out_keys)
    }

    fn named(
        kind: &str,
        network: Box<dyn Network>,
        in_keys: Vec<String>,
        out_keys: Vec<String>,
    ) -> Result<Self, ModuleError> {
        let name = format!("{}({})", kind, network.name());
        if in_keys.is_empty() || out_keys.is_empty() {
            return Err(ModuleError::invalid(
                &name,
                "at least one input key and one output key are required",
            ));
        }
        Ok(Self {
            name,
            network,
            contract: KeyContract::new(in_keys, out_keys),
        })
    }

    pub fn network(&self) -> &dyn Network {
        self.network.as_ref()
    }

    /// Network output for the inputs in `data`.
    fn evaluate(&self, data: &TensorDict) -> Result<ArrayD<f64>, ModuleError> {
        let input = gather_input(&self.name, data, self.in_keys())?;
        self.network.forward(&input)
    }

    fn write(&self, data: &mut TensorDict, output: ArrayD<f64>) -> Result<(), ModuleError> {
        match self.out_keys() {
            [key] => {
                data.insert(key.clone(), output)?;
            }
            keys => {
                for (key, part) in keys.iter().zip(split_last(&self.name, &output, keys.len())?) {
                    data.insert(key.clone(), part)?;
                }
            }
        }
        Ok(())
    }
}

impl Component for TensorDictModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn contract(&self) -> &KeyContract {
        &self.contract
    }

    fn forward(&self, data: &mut TensorDict, _: &mut Prng) -> Result<(), ModuleError> {
        let output = self.evaluate(data)?;
        self.write(data, output)
    }
}

/// Deterministic actor writing an action (by default to `action`).
///
/// With a spec, the first output is projected onto it.
#[derive(Debug)]
pub struct Actor {
    module: TensorDictModule,
    spec: Option<TensorSpec>,
}

impl Actor {
    pub fn new(
        network: Box<dyn Network>,
        in_keys: Vec<String>,
        out_keys: Vec<String>,
        spec: Option<TensorSpec>,
    ) -> Result<Self, ModuleError> {
        Ok(Self {
            module: TensorDictModule::named("Actor", network, in_keys, out_keys)?,
            spec,
        })
    }

    pub const fn spec(&self) -> Option<&TensorSpec> {
        self.spec.as_ref()
    }
}

impl Component for Actor {
    fn name(&self) -> &str {
        self.module.name()
    }

    fn contract(&self) -> &KeyContract {
        self.module.contract()
    }

    fn forward(&self, data: &mut TensorDict, rng: &mut Prng) -> Result<(), ModuleError> {
        self.module.forward(data, rng)?;
        if let (Some(spec), Some(key)) = (&self.spec, self.out_keys().first()) {
            if let Some(action) = data.get_mut(key) {
                *action = spec.project(action);
            }
        }
        Ok(())
    }
}

/// State-value critic writing `state_value`.
#[derive(Debug)]
pub struct ValueOperator {
    module: TensorDictModule,
}

impl ValueOperator {
    pub fn new(
        network: Box<dyn Network>,
        in_keys: Vec<String>,
        out_keys: Vec<String>,
    ) -> Result<Self, ModuleError> {
        Ok(Self {
            module: TensorDictModule::named("ValueOperator", network, in_keys, out_keys)?,
        })
    }
}

impl Component for ValueOperator {
    fn name(&self) -> &str {
        self.module.name()
    }

    fn contract(&self) -> &KeyContract {
        self.module.contract()
    }

    fn forward(&self, data: &mut TensorDict, rng: &mut Prng) -> Result<(), ModuleError> {
        self.module.forward(data, rng)
    }
}

/// One-hot encoding of the largest value along the trailing axis.
fn greedy(values: &ArrayD<f64>) -> ArrayD<f64> {
    let n = values.shape().last().copied().unwrap_or(0);
    TensorSpec::OneHot { n }.project(values)
}

fn trailing_axis(module: &str, values: &ArrayD<f64>, min_ndim: usize) -> Result<Axis, ModuleError> {
    if values.ndim() < min_ndim || values.shape().last() == Some(&0) {
        return Err(ModuleError::shape(
            module,
            format!("expected at least {} non-empty dimension(s), got {:?}", min_ndim, values.shape()),
        ));
    }
    Ok(Axis(values.ndim() - 1))
}

/// Greedy actor over a Q-value network.
///
/// Writes the network output as `action_value`, its one-hot argmax as `action` and the
/// value of that action as `chosen_action_value`.
#[derive(Debug)]
pub struct QValueActor {
    module: TensorDictModule,
}

impl QValueActor {
    pub fn new(network: Box<dyn Network>, in_keys: Vec<String>) -> Result<Self, ModuleError> {
        let out_keys = [ACTION_KEY, ACTION_VALUE_KEY, CHOSEN_ACTION_VALUE_KEY]
            .iter()
            .map(|&k| k.to_string())
            .collect();
        Ok(Self {
            module: TensorDictModule::named("QValueActor", network, in_keys, out_keys)?,
        })
    }
}

impl Component for QValueActor {
    fn name(&self) -> &str {
        self.module.name()
    }

    fn contract(&self) -> &KeyContract {
        self.module.contract()
    }

    fn forward(&self, data: &mut TensorDict, _: &mut Prng) -> Result<(), ModuleError> {
        let values = self.module.evaluate(data)?;
        let axis = trailing_axis(self.name(), &values, 1)?;
        let action = greedy(&values);
        let chosen = (&values * &action).sum_axis(axis).insert_axis(axis);
        data.insert(ACTION_KEY, action)?;
        data.insert(ACTION_VALUE_KEY, values)?;
        data.insert(CHOSEN_ACTION_VALUE_KEY, chosen)?;
        Ok(())
    }
}

/// Greedy actor over a distributional Q-value network.
///
/// The network outputs `[.., atoms, actions]` logits. They are normalized over the atom
/// axis and written as `action_value`; the action maximizes the expected value under
/// the support `linspace(vmin, vmax, atoms)`.
#[derive(Debug)]
pub struct DistributionalQValueActor {
    module: TensorDictModule,
    vmin: f64,
    vmax: f64,
}

impl DistributionalQValueActor {
    pub fn new(
        network: Box<dyn Network>,
        in_keys: Vec<String>,
        vmin: f64,
        vmax: f64,
    ) -> Result<Self, ModuleError> {
        let out_keys = vec![ACTION_KEY.to_string(), ACTION_VALUE_KEY.to_string()];
        let module = TensorDictModule::named("DistributionalQValueActor", network, in_keys, out_keys)?;
        if vmin.is_nan() || vmax.is_nan() || vmin >= vmax {
            return Err(ModuleError::invalid(
                module.name(),
                format!("support bounds must satisfy vmin < vmax, got [{}, {}]", vmin, vmax),
            ));
        }
        Ok(Self { module, vmin, vmax })
    }

    pub fn support(&self, num_atoms: usize) -> Array1<f64> {
        Array1::linspace(self.vmin, self.vmax, num_atoms)
    }
}

impl Component for DistributionalQValueActor {
    fn name(&self) -> &str {
        self.module.name()
    }

    fn contract(&self) -> &KeyContract {
        self.module.contract()
    }

    fn forward(&self, data: &mut TensorDict, _: &mut Prng) -> Result<(), ModuleError> {
        let logits = self.module.evaluate(data)?;
        trailing_axis(self.name(), &logits, 2)?;
        let atom_axis = Axis(logits.ndim() - 2);
        let mut log_probs = logits;
        log_softmax_inplace(&mut log_probs, atom_axis);
        let support = self.support(log_probs.len_of(atom_axis));
        let expected = log_probs.map_axis(atom_axis, |lane| {
            lane.iter().zip(&support).map(|(lp, z)| lp.exp() * z).sum::<f64>()
        });
        data.insert(ACTION_KEY, greedy(&expected))?;
        data.insert(ACTION_VALUE_KEY, log_probs)?;
        Ok(())
    }
}

/// How a [`ProbabilisticActor`] picks its action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    /// Sample from the distribution.
    Random,
    /// Take the most likely action.
    Mode,
}

impl Default for InteractionMode {
    fn default() -> Self {
        Self::Random
    }
}

/// Stochastic actor.
///
/// The network output is split into the distribution parameters, which are written under
/// their parameter keys, then an action is drawn from the distribution. A bounded spec
/// rescales a `tanh_normal` action to its bounds; any spec is projected onto last.
#[derive(Debug)]
pub struct ProbabilisticActor {
    name: String,
    network: Box<dyn Network>,
    contract: KeyContract,
    distribution: DistributionKind,
    interaction_mode: InteractionMode,
    return_log_prob: bool,
    spec: Option<TensorSpec>,
}

impl ProbabilisticActor {
    pub fn new(
        network: Box<dyn Network>,
        in_keys: Vec<String>,
        distribution: DistributionKind,
        param_keys: Vec<String>,
    ) -> Result<Self, ModuleError> {
        let name = format!("ProbabilisticActor({})", network.name());
        if param_keys.len() != distribution.num_params() {
            return Err(ModuleError::invalid(
                &name,
                format!(
                    "{:?} takes {} parameter key(s), got {:?}",
                    distribution,
                    distribution.num_params(),
                    param_keys
                ),
            ));
        }
        if in_keys.is_empty() {
            return Err(ModuleError::invalid(&name, "at least one input key is required"));
        }
        let mut out_keys = param_keys;
        out_keys.push(ACTION_KEY.into());
        Ok(Self {
            name,
            network,
            contract: KeyContract::new(in_keys, out_keys),
            distribution,
            interaction_mode: InteractionMode::default(),
            return_log_prob: false,
            spec: None,
        })
    }

    /// Also write the log-probability of the action to `sample_log_prob`.
    #[must_use]
    pub fn with_log_prob(mut self, return_log_prob: bool) -> Self {
        if return_log_prob && !self.return_log_prob {
            self.contract.out_keys.push(SAMPLE_LOG_PROB_KEY.into());
        }
        self.return_log_prob = return_log_prob;
        self
    }

    #[must_use]
    pub const fn with_interaction_mode(mut self, mode: InteractionMode) -> Self {
        self.interaction_mode = mode;
        self
    }

    #[must_use]
    pub fn with_spec(mut self, spec: Option<TensorSpec>) -> Self {
        self.spec = spec;
        self
    }

    pub const fn distribution_kind(&self) -> DistributionKind {
        self.distribution
    }

    pub fn param_keys(&self) -> &[String] {
        &self.contract.out_keys[..self.distribution.num_params()]
    }

    pub const fn spec(&self) -> Option<&TensorSpec> {
        self.spec.as_ref()
    }

    fn build_distribution(
        &self,
        params: &[ArrayD<f64>],
    ) -> Result<Box<dyn BatchDistribution>, ModuleError> {
        let distribution: Box<dyn BatchDistribution> = match (self.distribution, params) {
            (DistributionKind::OneHotCategorical, [logits]) => {
                Box::new(OneHotCategorical::new(logits)?)
            }
            (DistributionKind::TanhNormal, [loc, scale]) => {
                let dist = TanhNormal::new(loc.clone(), scale.clone())?;
                match self.spec {
                    Some(TensorSpec::Bounded { low, high, .. }) => Box::new(dist.with_bounds(low, high)),
                    _ => Box::new(dist),
                }
            }
            (kind, _) => {
                return Err(ModuleError::invalid(
                    &self.name,
                    format!("{:?} got {} parameter tensor(s)", kind, params.len()),
                ))
            }
        };
        Ok(distribution)
    }
}

impl Component for ProbabilisticActor {
    fn name(&self) -> &str {
        &self.name
    }

    fn contract(&self) -> &KeyContract {
        &self.contract
    }

    fn forward(&self, data: &mut TensorDict, rng: &mut Prng) -> Result<(), ModuleError> {
        let input = gather_input(&self.name, data, self.in_keys())?;
        let output = self.network.forward(&input)?;
        let params = split_last(&self.name, &output, self.distribution.num_params())?;
        let distribution = self.build_distribution(&params)?;
        let action = match self.interaction_mode {
            InteractionMode::Random => distribution.sample(rng),
            InteractionMode::Mode => distribution.mode(),
        };
        let log_prob = if self.return_log_prob {
            Some(distribution.log_probs(&action)?)
        } else {
            None
        };
        let action = match &self.spec {
            Some(spec) => spec.project(&action),
            None => action,
        };
        for (key, param) in self.param_keys().iter().zip(params) {
            data.insert(key.clone(), param)?;
        }
        data.insert(ACTION_KEY, action)?;
        if let Some(log_prob) = log_prob {
            data.insert(SAMPLE_LOG_PROB_KEY, log_prob)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Dims, Linear, MlpConfig};
    use ndarray::{arr1, arr2};
    use rand::SeedableRng;

    /// Network returning a fixed output regardless of its input batch.
    #[derive(Debug)]
    struct Constant(ArrayD<f64>);

    impl Network for Constant {
        fn name(&self) -> &str {
            "Constant"
        }

        fn forward(&self, input: &ArrayD<f64>) -> Result<ArrayD<f64>, ModuleError> {
            let mut shape = input.shape()[..input.ndim() - 1].to_vec();
            shape.extend_from_slice(self.0.shape());
            self.0
                .broadcast(shape)
                .map(|view| view.to_owned())
                .ok_or_else(|| ModuleError::shape("Constant", "cannot broadcast"))
        }
    }

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|&k| k.to_string()).collect()
    }

    fn observation(batch: usize, features: usize) -> TensorDict {
        let mut data = TensorDict::new(vec![batch]);
        data.set("observation", ArrayD::ones(vec![batch, features]));
        data
    }

    fn rng() -> Prng {
        Prng::seed_from_u64(0)
    }

    /// Whether the exponentiated values sum to one along `axis`.
    fn normalized(log_probs: &ArrayD<f64>, axis: Axis) -> bool {
        log_probs
            .mapv(f64::exp)
            .sum_axis(axis)
            .iter()
            .all(|s| (s - 1.0).abs() < 1e-9)
    }

    #[test]
    fn module_splits_outputs() {
        let network = Box::new(Constant(arr1(&[1.0, 2.0, 3.0, 4.0]).into_dyn()));
        let module = TensorDictModule::new(network, keys(&["observation"]), keys(&["loc", "scale"])).unwrap();
        let mut data = observation(2, 3);
        module.forward(&mut data, &mut rng()).unwrap();
        assert_eq!(data.get("loc").unwrap(), &arr2(&[[1.0, 2.0], [1.0, 2.0]]).into_dyn());
        assert_eq!(data.get("scale").unwrap(), &arr2(&[[3.0, 4.0], [3.0, 4.0]]).into_dyn());
    }

    #[test]
    fn module_requires_keys() {
        let network = Box::new(Linear::new(None, 2, true, 0));
        assert!(TensorDictModule::new(network, vec![], keys(&["action"])).is_err());
    }

    #[test]
    fn actor_projects_onto_spec() {
        let network = Box::new(Constant(arr1(&[3.0, -3.0]).into_dyn()));
        let spec = TensorSpec::bounded(vec![2], -1.0, 1.0);
        let actor = Actor::new(network, keys(&["observation"]), keys(&["action"]), Some(spec.clone())).unwrap();
        let mut data = observation(5, 3);
        actor.forward(&mut data, &mut rng()).unwrap();
        assert!(spec.is_in(data.get("action").unwrap()));
    }

    #[test]
    fn q_value_actor_is_greedy() {
        let network = Box::new(Constant(arr1(&[0.5, 2.0, -1.0]).into_dyn()));
        let actor = QValueActor::new(network, keys(&["observation"])).unwrap();
        let mut data = observation(2, 4);
        actor.forward(&mut data, &mut rng()).unwrap();
        assert_eq!(data.get("action").unwrap(), &arr2(&[[0.0, 1.0, 0.0]; 2]).into_dyn());
        assert_eq!(data.get("chosen_action_value").unwrap(), &arr2(&[[2.0]; 2]).into_dyn());
        assert_eq!(data.get("action_value").unwrap().shape(), &[2, 3]);
    }

    #[test]
    fn distributional_actor_maximizes_expectation() {
        // Atom 1 (value 10) is certain for action 0; atom 0 (value -10) for action 1.
        let logits = arr2(&[[-50.0, 50.0], [50.0, -50.0]]).into_dyn();
        let actor = DistributionalQValueActor::new(Box::new(Constant(logits)), keys(&["observation"]), -10.0, 10.0)
            .unwrap();
        let mut data = observation(3, 2);
        actor.forward(&mut data, &mut rng()).unwrap();
        assert_eq!(data.get("action").unwrap(), &arr2(&[[1.0, 0.0]; 3]).into_dyn());
        let action_value = data.get("action_value").unwrap();
        assert_eq!(action_value.shape(), &[3, 2, 2]);
        assert!(normalized(action_value, Axis(1)));
    }

    #[test]
    fn distributional_actor_rejects_flat_output() {
        let network = Box::new(Constant(arr1(&[1.0, 2.0]).into_dyn()));
        let actor = DistributionalQValueActor::new(network, keys(&["observation"]), -1.0, 1.0).unwrap();
        let mut data = TensorDict::new(vec![]);
        data.set("observation", ArrayD::ones(vec![3]));
        assert!(actor.forward(&mut data, &mut rng()).is_err());
    }

    #[test]
    fn invalid_support() {
        let network = Box::new(Linear::new(None, 2, true, 0));
        assert!(DistributionalQValueActor::new(network, keys(&["observation"]), 1.0, 1.0).is_err());
    }

    #[test]
    fn categorical_actor_writes_valid_actions() {
        let network = MlpConfig {
            out_features: Dims::One(4),
            ..MlpConfig::default()
        }
        .build()
        .unwrap();
        let actor = ProbabilisticActor::new(
            Box::new(network),
            keys(&["observation"]),
            DistributionKind::OneHotCategorical,
            keys(&["logits"]),
        )
        .unwrap()
        .with_log_prob(true);
        assert_eq!(actor.out_keys(), &["logits", "action", "sample_log_prob"]);
        let mut data = observation(6, 3);
        actor.forward(&mut data, &mut rng()).unwrap();
        assert!(TensorSpec::OneHot { n: 4 }.is_in(data.get("action").unwrap()));
        assert_eq!(data.get("sample_log_prob").unwrap().shape(), &[6, 1]);
    }

    #[test]
    fn tanh_normal_actor_respects_bounds() {
        let network = Box::new(Constant(arr1(&[0.0, 0.0, 1.0, 1.0]).into_dyn()));
        let spec = TensorSpec::bounded(vec![2], -2.0, 2.0);
        let actor = ProbabilisticActor::new(
            network,
            keys(&["observation"]),
            DistributionKind::TanhNormal,
            keys(&["loc", "scale"]),
        )
        .unwrap()
        .with_spec(Some(spec.clone()));
        let mut data = observation(10, 1);
        actor.forward(&mut data, &mut rng()).unwrap();
        assert!(spec.is_in(data.get("action").unwrap()));
        assert!(data.contains("loc") && data.contains("scale"));
    }

    #[test]
    fn mode_is_deterministic() {
        let network = Box::new(Constant(arr1(&[0.1, 0.9, 0.3]).into_dyn()));
        let actor = ProbabilisticActor::new(
            network,
            keys(&["observation"]),
            DistributionKind::OneHotCategorical,
            keys(&["logits"]),
        )
        .unwrap()
        .with_interaction_mode(InteractionMode::Mode);
        let mut data = observation(2, 1);
        actor.forward(&mut data, &mut rng()).unwrap();
        assert_eq!(data.get("action").unwrap(), &arr2(&[[0.0, 1.0, 0.0]; 2]).into_dyn());
    }

    #[test]
    fn wrong_param_key_count() {
        let network = Box::new(Linear::new(None, 2, true, 0));
        assert!(ProbabilisticActor::new(
            network,
            keys(&["observation"]),
            DistributionKind::TanhNormal,
            keys(&["loc"]),
        )
        .is_err());
    }
}
