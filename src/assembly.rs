//! Standard assembly flows
//!
//! Each flow instantiates the environment first. The `network` and `model` groups resolve
//! to bundles holding partial constructors; their missing sizes are inferred from the
//! environment, and the finished components are wired against its observation spec.
use crate::collectors::Collector;
use crate::config::{ResolvedConfig, Value};
use crate::envs::{EnvFactory, Environment};
use crate::error::Error;
use crate::modules::ActorCritic;
use crate::resolve::{Args, Bundle, Instance, NodeResolver};
use crate::shapes::{ShapeBinding, ShapeInference, ShapeRequest};
use crate::specs::CompositeSpec;
use crate::wiring::{downcast_component, Component, Composite, DependencyWirer, OutputHead, WireError};
use log::info;
use std::sync::Arc;

/// Instantiate the `env` node of `config` and append each transform listed under
/// `transforms`, in order.
pub fn build_env(
    resolver: &NodeResolver,
    config: &ResolvedConfig,
) -> Result<Box<dyn Environment>, Error> {
    let mut env = resolver.instantiate_path(config, "env", Args::new())?.into_env()?;
    if config.get("transforms").is_some() {
        let transforms = match resolver.instantiate_path(config, "transforms", Args::new())? {
            Instance::Seq(items) => items,
            Instance::Value(Value::Null) => Vec::new(),
            other => vec![other],
        };
        for transform in transforms {
            env.append_transform(transform.into_transform()?)?;
        }
    }
    info!("built environment `{}`", env.name());
    Ok(env)
}

/// Instantiate the `collector` node of `config`.
///
/// With `num_workers = 0` (or no `num_workers` entry) the collector receives `create_env`
/// itself; otherwise it receives `num_workers` copies of it.
pub fn build_collector(
    resolver: &NodeResolver,
    config: &ResolvedConfig,
    create_env: EnvFactory,
    policy: Option<Arc<dyn Component>>,
) -> Result<Box<dyn Collector>, Error> {
    let num_workers: usize = match config.get("num_workers") {
        Some(_) => config.get_as("num_workers")?,
        None => 0,
    };
    let create_env_fn = match num_workers {
        0 => Instance::from(create_env),
        n => Instance::from(
            (0..n)
                .map(|_| Instance::from(create_env.clone()))
                .collect::<Vec<_>>(),
        ),
    };
    let mut args = Args::new().with("create_env_fn", create_env_fn);
    if let Some(policy) = policy {
        args.insert("policy", policy);
    }
    Ok(resolver.instantiate_path(config, "collector", args)?.into_collector()?)
}

/// Request input sizes the partial still wants from a single observation key.
///
/// Images give `in_channels`, vectors give `in_features`. Inputs read from keys that
/// are not observations are left to lazy sizing.
fn bind_inputs<'a>(
    binding: ShapeBinding<'a>,
    spec: &CompositeSpec,
    in_keys: &[String],
) -> ShapeBinding<'a> {
    let key = match in_keys {
        [key] => key,
        _ => return binding,
    };
    let rank = match spec.get(key) {
        Some(observation) => observation.shape().len(),
        None => return binding,
    };
    if rank == 3 && binding.slot().wants("in_channels") {
        binding.request("in_channels", ShapeRequest::pixel_channels(key.as_str()))
    } else if rank == 1 && binding.slot().wants("in_features") {
        binding.request("in_features", ShapeRequest::observation_features(key.as_str()))
    } else {
        binding
    }
}

/// Build a Q-value actor from resolved `network` and `model` bundles.
///
/// # Args
/// * `network` - Bundle with a partial `network` and the `in_keys` it reads.
/// * `model` - Bundle with a partial `actor` and an optional `out_features`: the number of
///     atoms of a distributional head.
pub fn build_dqn_actor(
    env: &mut dyn Environment,
    network: &mut Bundle,
    model: &mut Bundle,
) -> Result<Composite, Error> {
    let head = match model.opt_value::<usize>("out_features")? {
        Some(atoms) => OutputHead::new().with_leading(atoms),
        None => OutputHead::new(),
    };
    let in_keys: Vec<String> = network.value("in_keys")?;
    let observation_spec = env.observation_spec().clone();

    let binding = bind_inputs(
        ShapeBinding::new(network.partial_mut("network")?),
        &observation_spec,
        &in_keys,
    )
    .request("out_features", ShapeRequest::Action(head));
    let q_network = ShapeInference::new(env).finalize(binding)?;

    let actor = model
        .finalize(
            "actor",
            Args::new()
                .with("module", q_network)
                .with_value("in_keys", in_keys),
        )?
        .into_module()?;
    let actor = DependencyWirer::from_spec(&observation_spec).wire("dqn_actor", vec![actor])?;
    info!("built DQN actor: {}", actor.contract());
    Ok(actor)
}

/// Build an actor-critic from resolved `network` and `model` bundles.
///
/// # Args
/// * `network` - Bundle with a partial `policy_network`, the `in_keys_policy_module` the
///     policy reads, and a partial `actor_critic` awaiting its `policy_operator`.
/// * `model` - Bundle with a partial `actor`, an optional `out_features_multiplier`
///     (outputs per action dimension, default 1) and an optional partial `module_wrapper`
///     applied to the policy network.
pub fn build_ppo_actor_critic(
    env: &mut dyn Environment,
    network: &mut Bundle,
    model: &mut Bundle,
) -> Result<Arc<ActorCritic>, Error> {
    let multiplier = model
        .opt_value::<usize>("out_features_multiplier")?
        .unwrap_or(1);
    let in_keys: Vec<String> = network.value("in_keys_policy_module")?;
    let observation_spec = env.observation_spec().clone();
    let action_spec = env.action_spec().clone();

    let binding = bind_inputs(
        ShapeBinding::new(network.partial_mut("policy_network")?),
        &observation_spec,
        &in_keys,
    )
    .request(
        "out_features",
        ShapeRequest::Action(OutputHead::new().with_multiplier(multiplier)),
    );
    let mut policy_network = ShapeInference::new(env).finalize(binding)?;

    match model.get("module_wrapper") {
        None | Some(Instance::Value(Value::Null)) => {}
        Some(_) => {
            policy_network =
                model.finalize("module_wrapper", Args::new().with("network", policy_network))?;
        }
    }
    let policy_operator = model.finalize(
        "actor",
        Args::new()
            .with("module", policy_network)
            .with_value("in_keys", in_keys)
            .with("spec", action_spec),
    )?;
    let actor_critic = network
        .finalize(
            "actor_critic",
            Args::new().with("policy_operator", policy_operator),
        )?
        .into_module()?;
    let actor_critic = downcast_component::<ActorCritic>(actor_critic).map_err(|other| {
        WireError::Invalid {
            component: other.name().into(),
            reason: "`actor_critic` must be an actor-critic wrapper".into(),
        }
    })?;

    let as_component: Arc<dyn Component> = actor_critic.clone();
    let wired = DependencyWirer::from_spec(&observation_spec).wire("actor_critic", vec![as_component])?;
    info!("built actor-critic: {}", wired.contract());
    Ok(actor_critic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envs::{CartPoleConfig, MockContinuousEnv, MockDiscreteEnv, ACTION_KEY};
    use crate::modules::STATE_VALUE_KEY;
    use crate::Prng;
    use rand::SeedableRng;

    fn bundle(yaml: &str) -> Bundle {
        NodeResolver::standard()
            .instantiate(&Value::from_yaml(yaml).unwrap(), Args::new())
            .unwrap()
            .into_bundle()
            .unwrap()
    }

    const STATE_NETWORK: &str = "
in_keys: [observation]
network: {_target_: nn.Mlp, num_cells: [16]}
";

    #[test]
    fn dqn_actor_selects_valid_actions() {
        let mut env = MockDiscreteEnv::new(4);
        let mut network = bundle(STATE_NETWORK);
        let mut model = bundle("{actor: {_target_: modules.QValueActor}}");
        let actor = build_dqn_actor(&mut env, &mut network, &mut model).unwrap();
        assert_eq!(actor.in_keys(), &["observation".to_string()]);

        let mut rng = Prng::seed_from_u64(0);
        let mut data = env.rollout(3, None, &mut rng).unwrap();
        actor.forward(&mut data, &mut rng).unwrap();
        assert!(env.action_spec().is_in(data.get(ACTION_KEY).unwrap()));
    }

    #[test]
    fn distributional_head_prefixes_atoms() {
        let mut env = MockDiscreteEnv::new(4);
        let mut network = bundle(STATE_NETWORK);
        let mut model = bundle(
            "{out_features: 51, actor: {_target_: modules.DistributionalQValueActor, vmin: -5.0, vmax: 5.0}}",
        );
        let actor = build_dqn_actor(&mut env, &mut network, &mut model).unwrap();
        let mut rng = Prng::seed_from_u64(0);
        let mut data = env.rollout(2, None, &mut rng).unwrap();
        actor.forward(&mut data, &mut rng).unwrap();
        assert_eq!(data.get(ACTION_KEY).unwrap().shape(), &[2, 4]);
    }

    #[test]
    fn dqn_actor_needs_observed_keys() {
        let mut env = MockDiscreteEnv::new(2);
        let mut network = bundle("{in_keys: [pixels], network: {_target_: nn.Mlp}}");
        let mut model = bundle("{actor: {_target_: modules.QValueActor}}");
        let err = build_dqn_actor(&mut env, &mut network, &mut model).unwrap_err();
        assert!(matches!(err, Error::Wire(WireError::KeyMismatch { key, .. }) if key == "pixels"));
    }

    #[test]
    fn independent_continuous_actor_critic() {
        let mut env = MockContinuousEnv::default();
        let mut network = bundle(
            "
in_keys_policy_module: [observation]
policy_network: {_target_: nn.Mlp, num_cells: [16]}
actor_critic:
  _target_: modules.ActorCriticWrapper
  value_operator:
    _target_: modules.ValueOperator
    module: {_target_: nn.Mlp, num_cells: [16], out_features: 1}
",
        );
        let mut model = bundle(
            "
out_features_multiplier: 2
module_wrapper: {_target_: modules.NormalParamWrapper}
actor: {_target_: modules.ProbabilisticActor, distribution: tanh_normal}
",
        );
        let actor_critic = build_ppo_actor_critic(&mut env, &mut network, &mut model).unwrap();
        let mut rng = Prng::seed_from_u64(1);
        let mut data = env.rollout(3, None, &mut rng).unwrap();
        actor_critic.forward(&mut data, &mut rng).unwrap();
        assert!(env.action_spec().is_in(data.get(ACTION_KEY).unwrap()));
        assert_eq!(data.get(STATE_VALUE_KEY).unwrap().shape(), &[3, 1]);
    }

    #[test]
    fn shared_discrete_actor_critic() {
        let mut env = CartPoleConfig::default().build();
        let mut network = bundle(
            "
in_keys_policy_module: [hidden]
policy_network: {_target_: nn.Linear}
actor_critic:
  _target_: modules.ActorValueOperator
  common_operator:
    _target_: modules.TensorDictModule
    module: {_target_: nn.Mlp, num_cells: [16], out_features: 8, activate_last_layer: true}
    in_keys: [observation]
    out_keys: [hidden]
  value_operator:
    _target_: modules.ValueOperator
    module: {_target_: nn.Linear, out_features: 1}
    in_keys: [hidden]
",
        );
        let mut model = bundle("{actor: {_target_: modules.ProbabilisticActor}}");
        let actor_critic = build_ppo_actor_critic(&mut env, &mut network, &mut model).unwrap();
        assert!(actor_critic.common_operator().is_some());
        assert_eq!(actor_critic.in_keys(), &["observation".to_string()]);

        let mut rng = Prng::seed_from_u64(2);
        let mut data = env.rollout(3, None, &mut rng).unwrap();
        actor_critic.forward(&mut data, &mut rng).unwrap();
        assert!(env.action_spec().is_in(data.get(ACTION_KEY).unwrap()));
    }

    #[test]
    fn actor_critic_target_must_wrap() {
        let mut env = MockContinuousEnv::default();
        let mut network = bundle(
            "
in_keys_policy_module: [observation]
policy_network: {_target_: nn.Mlp}
actor_critic: {_target_: modules.ValueOperator}
",
        );
        let mut model = bundle("{actor: {_target_: modules.ProbabilisticActor}}");
        let err = build_ppo_actor_critic(&mut env, &mut network, &mut model).unwrap_err();
        assert!(matches!(err, Error::Resolve(_)));
    }
}
