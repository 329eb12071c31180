//! Assemble DQN actors and PPO actor-critics from the shipped configurations.
use rlconf::assembly::{build_dqn_actor, build_env, build_ppo_actor_critic};
use rlconf::modules::STATE_VALUE_KEY;
use rlconf::shapes::{resolve_shapes, ShapeBinding};
use rlconf::wiring::WireError;
use rlconf::{
    Args, Component, ConfigStore, Error, NodeResolver, OutputHead, Prng, ResolvedConfig,
    ShapeRequest,
};
use ndarray::ArrayD;
use rand::SeedableRng;
use rstest::{fixture, rstest};

#[fixture]
fn store() -> ConfigStore {
    ConfigStore::from_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/configs"))
}

fn env_overrides(pixels: bool) -> Vec<String> {
    let mut overrides = vec!["env=cartpole".to_string()];
    if pixels {
        overrides.push("transforms=pixels".into());
        overrides.push("++env.env.from_pixels=true".into());
        overrides.push("env.env.render_size=32".into());
    } else {
        overrides.push("transforms=state".into());
    }
    overrides
}

fn compose(store: &ConfigStore, pixels: bool, network: &str, model: &str) -> ResolvedConfig {
    let mut overrides = env_overrides(pixels);
    overrides.push(format!("network={}", network));
    overrides.push(format!("model={}", model));
    store.compose("config", overrides).unwrap()
}

#[rstest]
fn dqn(
    store: ConfigStore,
    #[values(true, false)] pixels: bool,
    #[values(true, false)] distributional: bool,
) {
    let network = if pixels { "dqn/pixels" } else { "dqn/state" };
    let model = if distributional { "dqn/distributional" } else { "dqn/regular" };
    let cfg = compose(&store, pixels, network, model);

    let resolver = NodeResolver::standard();
    let mut env = build_env(&resolver, &cfg).unwrap();
    let mut model = resolver
        .instantiate_path(&cfg, "model", Args::new())
        .unwrap()
        .into_bundle()
        .unwrap();
    let mut network = resolver
        .instantiate_path(&cfg, "network", Args::new())
        .unwrap()
        .into_bundle()
        .unwrap();
    let actor = build_dqn_actor(env.as_mut(), &mut network, &mut model).unwrap();

    let mut rng = Prng::seed_from_u64(0);
    let mut rollout = env.rollout(3, None, &mut rng).unwrap();
    actor.forward(&mut rollout, &mut rng).unwrap();
    assert!(env.action_spec().is_in(rollout.get("action").unwrap()));
    env.close();
}

#[rstest]
fn ppo(
    store: ConfigStore,
    #[values(true, false)] pixels: bool,
    #[values(true, false)] independent: bool,
    #[values(true, false)] continuous: bool,
) {
    let prefix = if independent { "independent" } else { "shared" };
    let suffix = if pixels { "pixels" } else { "state" };
    let network = format!("ppo/{}_{}", prefix, suffix);
    let model = if continuous { "ppo/continuous" } else { "ppo/discrete" };
    let cfg = compose(&store, pixels, &network, model);

    let resolver = NodeResolver::standard();
    let mut env = build_env(&resolver, &cfg).unwrap();
    let mut model = resolver
        .instantiate_path(&cfg, "model", Args::new())
        .unwrap()
        .into_bundle()
        .unwrap();
    let mut network = resolver
        .instantiate_path(&cfg, "network", Args::new())
        .unwrap()
        .into_bundle()
        .unwrap();
    let actor_critic = build_ppo_actor_critic(env.as_mut(), &mut network, &mut model).unwrap();
    assert_eq!(actor_critic.common_operator().is_none(), independent);

    let mut rng = Prng::seed_from_u64(0);
    let mut rollout = env.rollout(3, None, &mut rng).unwrap();
    for key in actor_critic.in_keys() {
        assert!(rollout.contains(key), "rollout lacks `{}`", key);
    }
    actor_critic.forward(&mut rollout, &mut rng).unwrap();
    assert!(env.action_spec().is_in(rollout.get("action").unwrap()));
    assert_eq!(rollout.get(STATE_VALUE_KEY).unwrap().shape(), &[3, 1]);

    // The policy alone produces actions without evaluating the critic
    let mut fresh = env.rollout(1, None, &mut rng).unwrap();
    fresh.remove("action");
    actor_critic.policy_operator().forward(&mut fresh, &mut rng).unwrap();
    assert!(fresh.contains("action"));
    assert!(!fresh.contains(STATE_VALUE_KEY));
    env.close();
}

#[rstest]
fn distributional_network_has_atoms_times_actions_outputs(store: ConfigStore) {
    let cfg = store
        .compose(
            "config",
            ["env=mock", "network=dqn/state", "model=dqn/distributional"],
        )
        .unwrap();
    let resolver = NodeResolver::standard();
    let mut network = resolver
        .instantiate_path(&cfg, "network", Args::new())
        .unwrap()
        .into_bundle()
        .unwrap();
    let atoms: usize = cfg.get_as("model.out_features").unwrap();
    assert_eq!(atoms, 51);

    // Four discrete actions
    let mut env = rlconf::envs::MockDiscreteEnv::new(4);
    let binding = ShapeBinding::new(network.partial_mut("network").unwrap())
        .request("out_features", ShapeRequest::Action(OutputHead::new().with_leading(atoms)));
    let q_network = resolve_shapes(&mut env, vec![binding])
        .unwrap()
        .pop()
        .unwrap()
        .into_network()
        .unwrap();
    let out = q_network.forward(&ArrayD::zeros(vec![1, 4])).unwrap();
    assert_eq!(out.len(), 204);
}

#[rstest]
fn pixel_network_on_state_env_is_rejected(store: ConfigStore) {
    let mut overrides = env_overrides(false);
    overrides.push("network=dqn/state".into());
    overrides.push("model=dqn/regular".into());
    overrides.push("network.in_keys=[pixels]".into());
    let cfg = store.compose("config", overrides).unwrap();

    let resolver = NodeResolver::standard();
    let mut env = build_env(&resolver, &cfg).unwrap();
    let mut model = resolver
        .instantiate_path(&cfg, "model", Args::new())
        .unwrap()
        .into_bundle()
        .unwrap();
    let mut network = resolver
        .instantiate_path(&cfg, "network", Args::new())
        .unwrap()
        .into_bundle()
        .unwrap();
    let err = build_dqn_actor(env.as_mut(), &mut network, &mut model).unwrap_err();
    match err {
        Error::Wire(WireError::KeyMismatch { key, .. }) => assert_eq!(key, "pixels"),
        other => panic!("unexpected error: {}", other),
    }
}

#[rstest]
fn observation_missing_from_pixel_source(store: ConfigStore) {
    let mut overrides = env_overrides(true);
    overrides.push("network=ppo/independent_state".into());
    overrides.push("model=ppo/discrete".into());
    let cfg = store.compose("config", overrides).unwrap();

    let resolver = NodeResolver::standard();
    let mut env = build_env(&resolver, &cfg).unwrap();
    let mut model = resolver
        .instantiate_path(&cfg, "model", Args::new())
        .unwrap()
        .into_bundle()
        .unwrap();
    let mut network = resolver
        .instantiate_path(&cfg, "network", Args::new())
        .unwrap()
        .into_bundle()
        .unwrap();
    let err = build_ppo_actor_critic(env.as_mut(), &mut network, &mut model).unwrap_err();
    assert!(
        matches!(&err, Error::Wire(WireError::KeyMismatch { key, .. }) if key == "observation"),
        "unexpected error: {}",
        err
    );
}
