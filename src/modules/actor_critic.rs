//! Actor-critic operators
use super::ModuleError;
use crate::tensordict::TensorDict;
use crate::wiring::{Component, Composite, DependencyWirer, KeyContract, WireError};
use crate::Prng;
use log::debug;
use std::sync::Arc;

/// A policy operator and a value operator evaluated as one component.
///
/// Built either from two independent operators ([`ActorCritic::wrapper`]) or from a
/// common trunk feeding both heads ([`ActorCritic::with_common`]). In both cases the
/// chain is validated by a [`DependencyWirer`] whose sources are the inputs that no
/// component of the chain produces.
#[derive(Debug, Clone)]
pub struct ActorCritic {
    composite: Composite,
    common_operator: Option<Arc<dyn Component>>,
    policy_operator: Arc<dyn Component>,
    value_operator: Arc<dyn Component>,
}

/// Inputs of `components` that none of them writes, in order of first use.
fn external_inputs(components: &[Arc<dyn Component>]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for component in components {
        for key in component.in_keys() {
            let produced = components.iter().any(|c| c.contract().writes(key));
            if !produced && !sources.contains(key) {
                sources.push(key.clone());
            }
        }
    }
    sources
}

impl ActorCritic {
    /// Independent policy and value operators.
    pub fn wrapper(
        policy_operator: Arc<dyn Component>,
        value_operator: Arc<dyn Component>,
    ) -> Result<Self, WireError> {
        let chain = vec![Arc::clone(&policy_operator), Arc::clone(&value_operator)];
        let wirer = DependencyWirer::new(external_inputs(&chain));
        let composite = wirer.wire("ActorCriticWrapper", chain)?;
        Ok(Self {
            composite,
            common_operator: None,
            policy_operator,
            value_operator,
        })
    }

    /// A common operator whose outputs feed both the policy head and the value head.
    pub fn with_common(
        common_operator: Arc<dyn Component>,
        policy_head: Arc<dyn Component>,
        value_head: Arc<dyn Component>,
    ) -> Result<Self, WireError> {
        for head in [&policy_head, &value_head] {
            if !head.in_keys().iter().any(|key| common_operator.contract().writes(key)) {
                return Err(WireError::Invalid {
                    component: head.name().into(),
                    reason: format!(
                        "reads none of the outputs {:?} of `{}`",
                        common_operator.out_keys(),
                        common_operator.name()
                    ),
                });
            }
        }
        let chain = vec![
            Arc::clone(&common_operator),
            Arc::clone(&policy_head),
            Arc::clone(&value_head),
        ];
        let wirer = DependencyWirer::new(external_inputs(&chain));
        let composite = wirer.wire("ActorValueOperator", chain)?;
        let policy_operator = wirer.wire(
            "policy_operator",
            vec![Arc::clone(&common_operator), policy_head],
        )?;
        let value_operator = wirer.wire(
            "value_operator",
            vec![Arc::clone(&common_operator), value_head],
        )?;
        debug!(
            "shared trunk `{}` feeds `{}` and `{}`",
            common_operator.name(),
            policy_operator.name(),
            value_operator.name()
        );
        Ok(Self {
            composite,
            common_operator: Some(common_operator),
            policy_operator: Arc::new(policy_operator),
            value_operator: Arc::new(value_operator),
        })
    }

    /// The policy: reads observations and writes the action.
    ///
    /// With a common trunk this is the trunk followed by the policy head.
    pub fn policy_operator(&self) -> Arc<dyn Component> {
        Arc::clone(&self.policy_operator)
    }

    /// The critic. With a common trunk this is the trunk followed by the value head.
    pub fn value_operator(&self) -> Arc<dyn Component> {
        Arc::clone(&self.value_operator)
    }

    pub fn common_operator(&self) -> Option<Arc<dyn Component>> {
        self.common_operator.clone()
    }
}

impl Component for ActorCritic {
    fn name(&self) -> &str {
        self.composite.name()
    }

    fn contract(&self) -> &KeyContract {
        self.composite.contract()
    }

    fn forward(&self, data: &mut TensorDict, rng: &mut Prng) -> Result<(), ModuleError> {
        self.composite.forward(data, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ProbabilisticActor, TensorDictModule, ValueOperator, STATE_VALUE_KEY};
    use super::*;
    use crate::envs::ACTION_KEY;
    use crate::modules::DistributionKind;
    use crate::nn::{Dims, Linear, MlpConfig, Network};
    use ndarray::ArrayD;
    use rand::SeedableRng;
    use rstest::{fixture, rstest};

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|&k| k.to_string()).collect()
    }

    fn mlp(out_features: usize) -> Box<dyn Network> {
        Box::new(
            MlpConfig {
                out_features: Dims::One(out_features),
                num_cells: Dims::One(8),
                ..MlpConfig::default()
            }
            .build()
            .unwrap(),
        )
    }

    fn policy(in_key: &str) -> Arc<dyn Component> {
        Arc::new(
            ProbabilisticActor::new(
                mlp(2),
                keys(&[in_key]),
                DistributionKind::OneHotCategorical,
                keys(&["logits"]),
            )
            .unwrap(),
        )
    }

    fn value(in_key: &str) -> Arc<dyn Component> {
        Arc::new(ValueOperator::new(mlp(1), keys(&[in_key]), keys(&[STATE_VALUE_KEY])).unwrap())
    }

    fn trunk() -> Arc<dyn Component> {
        Arc::new(
            TensorDictModule::new(
                Box::new(Linear::new(None, 6, true, 3)),
                keys(&["observation"]),
                keys(&["hidden"]),
            )
            .unwrap(),
        )
    }

    #[fixture]
    fn data() -> TensorDict {
        let mut data = TensorDict::new(vec![5]);
        data.set("observation", crate::nn::testing::input(&[5, 4]));
        data
    }

    #[rstest]
    fn independent_operators(mut data: TensorDict) {
        let actor_critic = ActorCritic::wrapper(policy("observation"), value("observation")).unwrap();
        assert_eq!(actor_critic.in_keys(), &["observation"]);
        assert!(actor_critic.common_operator().is_none());
        let mut rng = Prng::seed_from_u64(0);
        actor_critic.forward(&mut data, &mut rng).unwrap();
        assert_eq!(data.get(ACTION_KEY).unwrap().shape(), &[5, 2]);
        assert_eq!(data.get(STATE_VALUE_KEY).unwrap().shape(), &[5, 1]);
    }

    #[rstest]
    fn shared_trunk(mut data: TensorDict) {
        let actor_critic = ActorCritic::with_common(trunk(), policy("hidden"), value("hidden")).unwrap();
        assert_eq!(actor_critic.in_keys(), &["observation"]);
        assert!(actor_critic.out_keys().contains(&"hidden".to_string()));

        let policy = actor_critic.policy_operator();
        assert_eq!(policy.in_keys(), &["observation"]);
        assert!(!policy.out_keys().contains(&STATE_VALUE_KEY.to_string()));

        let mut rng = Prng::seed_from_u64(0);
        policy.forward(&mut data, &mut rng).unwrap();
        assert!(data.contains(ACTION_KEY));
        assert!(!data.contains(STATE_VALUE_KEY));
        actor_critic.value_operator().forward(&mut data, &mut rng).unwrap();
        assert!(data.contains(STATE_VALUE_KEY));
    }

    #[test]
    fn head_must_read_trunk() {
        let err = ActorCritic::with_common(trunk(), policy("hidden"), value("observation")).unwrap_err();
        assert!(matches!(err, WireError::Invalid { component, .. } if component.contains("ValueOperator")));
    }

    #[test]
    fn policy_cannot_read_later_outputs() {
        // The policy reads the value estimate, which is only written after it runs.
        let err = ActorCritic::wrapper(policy(STATE_VALUE_KEY), value("observation")).unwrap_err();
        assert!(matches!(err, WireError::KeyMismatch { key, .. } if key == STATE_VALUE_KEY));
    }

    #[test]
    fn forward_requires_sources() {
        let actor_critic = ActorCritic::wrapper(policy("observation"), value("observation")).unwrap();
        let mut empty = TensorDict::new(vec![1]);
        empty.set("pixels", ArrayD::zeros(vec![1, 4]));
        let mut rng = Prng::seed_from_u64(0);
        assert!(actor_critic.forward(&mut empty, &mut rng).is_err());
    }
}
