//! Key-contract modules: networks bound to tensordict keys, actors and critics
//!
//! A module reads its input keys from a [`TensorDict`], applies a
//! [`Network`](crate::nn::Network) and writes its output keys. Actors add an
//! `action` entry on top of the network output.
mod actor_critic;
mod actors;
mod distributions;
mod wrappers;

pub use actor_critic::ActorCritic;
pub use actors::{
    Actor, DistributionalQValueActor, InteractionMode, ProbabilisticActor, QValueActor,
    TensorDictModule, ValueOperator,
};
pub use distributions::{BatchDistribution, DistributionKind, OneHotCategorical, TanhNormal};
pub use wrappers::NormalParamWrapper;

use crate::config::Value;
use crate::resolve::{Args, BuildError, Instance, RegistryBuilder, TargetDef};
use crate::specs::TensorSpec;
use crate::tensordict::{TensorDict, TensorDictError};
use crate::wiring::Component;
use ndarray::{concatenate, ArrayD, ArrayViewD, Axis, Slice};
use std::sync::Arc;
use thiserror::Error;

/// Key of the state value written by [`ValueOperator`].
pub const STATE_VALUE_KEY: &str = "state_value";
/// Key of the log-probability written by [`ProbabilisticActor`].
pub const SAMPLE_LOG_PROB_KEY: &str = "sample_log_prob";
/// Key of the per-action values written by the Q-value actors.
pub const ACTION_VALUE_KEY: &str = "action_value";
/// Key of the value of the selected action.
pub const CHOSEN_ACTION_VALUE_KEY: &str = "chosen_action_value";

const OBSERVATION_KEY: &str = "observation";

/// Error evaluating a module or network.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error(transparent)]
    TensorDict(#[from] TensorDictError),
    #[error("`{module}`: unexpected shape: {reason}")]
    Shape { module: String, reason: String },
    #[error("`{module}`: {reason}")]
    Invalid { module: String, reason: String },
}

impl ModuleError {
    pub fn shape<S: Into<String>>(module: &str, reason: S) -> Self {
        Self::Shape {
            module: module.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid<S: Into<String>>(module: &str, reason: S) -> Self {
        Self::Invalid {
            module: module.into(),
            reason: reason.into(),
        }
    }
}

/// The module input: the `in_keys` entries joined along their trailing axis.
pub(crate) fn gather_input(
    module: &str,
    data: &TensorDict,
    in_keys: &[String],
) -> Result<ArrayD<f64>, ModuleError> {
    match in_keys {
        [] => Err(ModuleError::invalid(module, "no input keys")),
        [key] => Ok(data.get_required(key)?.clone()),
        keys => {
            let views = keys
                .iter()
                .map(|key| data.get_required(key).map(ArrayD::view))
                .collect::<Result<Vec<ArrayViewD<f64>>, _>>()?;
            let last = Axis(views[0].ndim().saturating_sub(1));
            concatenate(last, &views).map_err(|err| ModuleError::shape(module, err.to_string()))
        }
    }
}

/// Split the trailing axis of `output` into `n` equal parts.
pub(crate) fn split_last(
    module: &str,
    output: &ArrayD<f64>,
    n: usize,
) -> Result<Vec<ArrayD<f64>>, ModuleError> {
    let axis = match output.ndim() {
        0 => return Err(ModuleError::shape(module, "output is a scalar")),
        ndim => Axis(ndim - 1),
    };
    let size = output.len_of(axis);
    if n == 0 || size % n != 0 {
        return Err(ModuleError::shape(
            module,
            format!("cannot split {} outputs into {} equal parts", size, n),
        ));
    }
    let part = size / n;
    Ok((0..n)
        .map(|i| {
            output
                .slice_axis(axis, Slice::from(i * part..(i + 1) * part))
                .to_owned()
        })
        .collect())
}

fn module(component: impl Component) -> Instance {
    Instance::Module(Arc::new(component))
}

fn keys(args: &mut Args, key: &str) -> Result<Option<Vec<String>>, BuildError> {
    args.opt_value(key)
}

fn keys_or(args: &mut Args, key: &str, default: &[&str]) -> Result<Vec<String>, BuildError> {
    Ok(keys(args, key)?.unwrap_or_else(|| default.iter().map(|&k| k.to_string()).collect()))
}

/// Take an optional action spec. Null counts as absent.
fn opt_spec(args: &mut Args, key: &str) -> Result<Option<TensorSpec>, BuildError> {
    match args.take(key) {
        None | Some(Instance::Value(Value::Null)) => Ok(None),
        Some(instance) => instance
            .into_spec()
            .map(Some)
            .map_err(|source| BuildError::Kind {
                key: key.into(),
                source,
            }),
    }
}

/// Register the modules of this module.
pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .register(
            TargetDef::new("modules.TensorDictModule")
                .deferred("module")
                .required("in_keys")
                .required("out_keys"),
            |args| {
                let network = args.network("module")?;
                let in_keys = args.value("in_keys")?;
                let out_keys = args.value("out_keys")?;
                Ok(module(TensorDictModule::new(network, in_keys, out_keys)?))
            },
        )
        .register(
            TargetDef::new("modules.Actor")
                .deferred("module")
                .optional("in_keys")
                .optional("out_keys")
                .optional("spec"),
            |args| {
                let network = args.network("module")?;
                let in_keys = keys_or(args, "in_keys", &[OBSERVATION_KEY])?;
                let out_keys = keys_or(args, "out_keys", &[crate::envs::ACTION_KEY])?;
                let spec = opt_spec(args, "spec")?;
                Ok(module(Actor::new(network, in_keys, out_keys, spec)?))
            },
        )
        .register(
            TargetDef::new("modules.QValueActor")
                .deferred("module")
                .optional("in_keys"),
            |args| {
                let network = args.network("module")?;
                let in_keys = keys_or(args, "in_keys", &[OBSERVATION_KEY])?;
                Ok(module(QValueActor::new(network, in_keys)?))
            },
        )
        .register(
            TargetDef::new("modules.DistributionalQValueActor")
                .deferred("module")
                .optional("in_keys")
                .optional("vmin")
                .optional("vmax"),
            |args| {
                let network = args.network("module")?;
                let in_keys = keys_or(args, "in_keys", &[OBSERVATION_KEY])?;
                let vmin = args.value_or("vmin", -10.0)?;
                let vmax = args.value_or("vmax", 10.0)?;
                Ok(module(DistributionalQValueActor::new(
                    network, in_keys, vmin, vmax,
                )?))
            },
        )
        .register(
            TargetDef::new("modules.ProbabilisticActor")
                .deferred("module")
                .optional("in_keys")
                .optional("distribution")
                .optional("dist_param_keys")
                .optional("return_log_prob")
                .optional("default_interaction_mode")
                .optional("spec"),
            |args| {
                let network = args.network("module")?;
                let in_keys = keys_or(args, "in_keys", &[OBSERVATION_KEY])?;
                let distribution: DistributionKind =
                    args.value_or("distribution", DistributionKind::default())?;
                let param_keys = match keys(args, "dist_param_keys")? {
                    Some(keys) => keys,
                    None => distribution.default_param_keys(),
                };
                let mode = args.value_or("default_interaction_mode", InteractionMode::default())?;
                let actor = ProbabilisticActor::new(network, in_keys, distribution, param_keys)?
                    .with_log_prob(args.value_or("return_log_prob", false)?)
                    .with_interaction_mode(mode)
                    .with_spec(opt_spec(args, "spec")?);
                Ok(module(actor))
            },
        )
        .register(
            TargetDef::new("modules.ValueOperator")
                .deferred("module")
                .optional("in_keys")
                .optional("out_keys"),
            |args| {
                let network = args.network("module")?;
                let in_keys = keys_or(args, "in_keys", &[OBSERVATION_KEY])?;
                let out_keys = keys_or(args, "out_keys", &[STATE_VALUE_KEY])?;
                Ok(module(ValueOperator::new(network, in_keys, out_keys)?))
            },
        )
        .register(
            TargetDef::new("modules.NormalParamWrapper")
                .deferred("network")
                .optional("scale_lb"),
            |args| {
                let network = args.network("network")?;
                let wrapper = NormalParamWrapper::new(network)
                    .with_scale_lb(args.value_or("scale_lb", NormalParamWrapper::DEFAULT_SCALE_LB)?);
                Ok(Instance::Network(Box::new(wrapper)))
            },
        )
        .register(
            TargetDef::new("modules.ActorCriticWrapper")
                .deferred("policy_operator")
                .required("value_operator"),
            |args| {
                let policy = args.module("policy_operator")?;
                let value = args.module("value_operator")?;
                Ok(module(ActorCritic::wrapper(policy, value)?))
            },
        )
        .register(
            TargetDef::new("modules.ActorValueOperator")
                .required("common_operator")
                .deferred("policy_operator")
                .required("value_operator"),
            |args| {
                let common = args.module("common_operator")?;
                let policy = args.module("policy_operator")?;
                let value = args.module("value_operator")?;
                Ok(module(ActorCritic::with_common(common, policy, value)?))
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::NodeResolver;
    use ndarray::{arr1, arr2};
    use rstest::rstest;

    #[test]
    fn gather_concatenates_in_order() {
        let mut data = TensorDict::new(vec![2]);
        data.set("a", arr2(&[[1.0], [2.0]]).into_dyn());
        data.set("b", arr2(&[[3.0, 4.0], [5.0, 6.0]]).into_dyn());
        let keys = vec!["b".to_string(), "a".to_string()];
        let input = gather_input("m", &data, &keys).unwrap();
        assert_eq!(input, arr2(&[[3.0, 4.0, 1.0], [5.0, 6.0, 2.0]]).into_dyn());
    }

    #[test]
    fn gather_missing_key() {
        let data = TensorDict::new(vec![]);
        assert!(matches!(
            gather_input("m", &data, &["observation".to_string()]),
            Err(ModuleError::TensorDict(TensorDictError::MissingKey(key))) if key == "observation"
        ));
    }

    #[rstest]
    #[case(4, 2, true)]
    #[case(4, 3, false)]
    #[case(4, 0, false)]
    fn split_sizes(#[case] size: usize, #[case] n: usize, #[case] ok: bool) {
        let output = ArrayD::zeros(vec![3, size]);
        assert_eq!(split_last("m", &output, n).is_ok(), ok);
    }

    #[test]
    fn split_preserves_values() {
        let parts = split_last("m", &arr1(&[1.0, 2.0, 3.0, 4.0]).into_dyn(), 2).unwrap();
        assert_eq!(parts[0], arr1(&[1.0, 2.0]).into_dyn());
        assert_eq!(parts[1], arr1(&[3.0, 4.0]).into_dyn());
    }

    #[test]
    fn resolve_value_operator() {
        let node = Value::from_yaml(
            "
_target_: modules.ValueOperator
module: {_target_: nn.Mlp, out_features: 1, num_cells: [8]}
in_keys: [hidden]
",
        )
        .unwrap();
        let value = NodeResolver::standard()
            .instantiate(&node, Args::new())
            .unwrap()
            .into_module()
            .unwrap();
        assert_eq!(value.in_keys(), &["hidden"]);
        assert_eq!(value.out_keys(), &[STATE_VALUE_KEY]);
    }

    #[test]
    fn actor_waits_for_module() {
        let node = Value::from_yaml("{_target_: modules.QValueActor}").unwrap();
        let slot = NodeResolver::standard()
            .instantiate(&node, Args::new())
            .unwrap()
            .into_partial()
            .unwrap();
        assert_eq!(slot.missing(), vec!["module"]);
    }

    #[test]
    fn mismatched_param_keys() {
        let node = Value::from_yaml(
            "
_target_: modules.ProbabilisticActor
module: {_target_: nn.Linear, out_features: 4}
distribution: tanh_normal
dist_param_keys: [loc]
",
        )
        .unwrap();
        assert!(NodeResolver::standard().instantiate(&node, Args::new()).is_err());
    }
}
