//! Dueling Q-networks
//!
//! A shared feature network feeds an advantage head and a value head, combined as
//! `Q = V + A - mean(A)` with the mean over the trailing (action) axis. With a
//! multi-dimensional output such as `[atoms, actions]` the value head produces
//! `[atoms, 1]`.
use super::{Activation, ConvMlpConfig, ConvNet, Dims, Mlp, MlpConfig, Network};
use crate::modules::ModuleError;
use crate::resolve::BuildError;
use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

#[derive(Debug)]
struct DuelingHead {
    advantage: Mlp,
    value: Mlp,
}

impl DuelingHead {
    fn new(out_features: &Dims, cells: &Dims, activation: Activation, seed: u64) -> Result<Self, BuildError> {
        let advantage_shape = out_features.to_vec();
        let mut value_shape = advantage_shape.clone();
        if let Some(last) = value_shape.last_mut() {
            *last = 1;
        }
        let head = |shape: Vec<usize>, seed| MlpConfig {
            out_features: Dims::Many(shape),
            in_features: None,
            num_cells: cells.clone(),
            activation,
            activate_last_layer: false,
            seed,
        };
        Ok(Self {
            advantage: head(advantage_shape, seed.wrapping_add(2000)).build()?,
            value: head(value_shape, seed.wrapping_add(3000)).build()?,
        })
    }

    fn forward(&self, module: &str, features: &ArrayD<f64>) -> Result<ArrayD<f64>, ModuleError> {
        let advantage = self.advantage.forward(features)?;
        let value = self.value.forward(features)?;
        let last = Axis(advantage.ndim() - 1);
        let mean = advantage
            .mean_axis(last)
            .ok_or_else(|| ModuleError::shape(module, "empty action axis"))?
            .insert_axis(last);
        Ok((advantage - &mean) + &value)
    }
}

/// Configuration for the [`DuelingMlpDqn`] network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DuelingMlpDqnConfig {
    pub out_features: Dims,
    pub in_features: Option<usize>,
    /// Sizes of the shared feature layers.
    pub num_cells: Dims,
    /// Hidden sizes of each head.
    pub head_cells: Dims,
    pub activation: Activation,
    pub seed: u64,
}

impl Default for DuelingMlpDqnConfig {
    fn default() -> Self {
        Self {
            out_features: Dims::Many(Vec::new()),
            in_features: None,
            num_cells: Dims::Many(vec![64, 64]),
            head_cells: Dims::Many(vec![64]),
            activation: Activation::Elu,
            seed: 0,
        }
    }
}

impl DuelingMlpDqnConfig {
    pub fn build(&self) -> Result<DuelingMlpDqn, BuildError> {
        let cells = self.num_cells.to_vec();
        let (&feature_size, hidden) = cells.split_last().ok_or_else(|| BuildError::Invalid {
            key: "num_cells".into(),
            reason: "at least one feature layer is required".into(),
        })?;
        let features = Mlp::new(
            self.in_features,
            hidden,
            vec![feature_size],
            self.activation,
            true,
            self.seed,
        );
        let head = DuelingHead::new(&self.out_features, &self.head_cells, self.activation, self.seed)?;
        Ok(DuelingMlpDqn { features, head })
    }
}

/// Dueling Q-network over vector observations.
#[derive(Debug)]
pub struct DuelingMlpDqn {
    features: Mlp,
    head: DuelingHead,
}

impl Network for DuelingMlpDqn {
    fn name(&self) -> &str {
        "DuelingMlpDqn"
    }

    fn forward(&self, input: &ArrayD<f64>) -> Result<ArrayD<f64>, ModuleError> {
        self.head.forward(self.name(), &self.features.forward(input)?)
    }
}

/// Configuration for the [`DuelingCnnDqn`] network.
///
/// Same fields as [`ConvMlpConfig`]; `mlp_cells` sizes each head.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DuelingCnnDqnConfig(pub ConvMlpConfig);

impl DuelingCnnDqnConfig {
    pub fn build(&self) -> Result<DuelingCnnDqn, BuildError> {
        let config = &self.0;
        let features = config.conv_config().build()?;
        let head = DuelingHead::new(
            &config.out_features,
            &config.mlp_cells,
            config.activation,
            config.seed,
        )?;
        Ok(DuelingCnnDqn { features, head })
    }
}

/// Dueling Q-network over channels-last images.
#[derive(Debug)]
pub struct DuelingCnnDqn {
    features: ConvNet,
    head: DuelingHead,
}

impl Network for DuelingCnnDqn {
    fn name(&self) -> &str {
        "DuelingCnnDqn"
    }

    fn forward(&self, input: &ArrayD<f64>) -> Result<ArrayD<f64>, ModuleError> {
        self.head.forward(self.name(), &self.features.forward(input)?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Dims::One(4), &[3, 5], &[3, 4])]
    #[case(Dims::Many(vec![51, 4]), &[3, 5], &[3, 51, 4])]
    fn mlp_output_shape(#[case] out_features: Dims, #[case] input: &[usize], #[case] expected: &[usize]) {
        let net = DuelingMlpDqnConfig {
            out_features,
            ..DuelingMlpDqnConfig::default()
        }
        .build()
        .unwrap();
        assert_eq!(net.forward(&testing::input(input)).unwrap().shape(), expected);
    }

    #[test]
    fn advantage_is_centered() {
        let net = DuelingMlpDqnConfig {
            out_features: Dims::One(3),
            ..DuelingMlpDqnConfig::default()
        }
        .build()
        .unwrap();
        let x = testing::input(&[2, 4]);
        let features = net.features.forward(&x).unwrap();
        let q = net.forward(&x).unwrap();
        let v = net.head.value.forward(&features).unwrap();
        for (q_row, v_row) in q.outer_iter().zip(v.outer_iter()) {
            let mean = q_row.mean().unwrap();
            assert!((mean - v_row[[0]]).abs() < 1e-9);
        }
    }

    #[test]
    fn cnn_output_shape() {
        let net = DuelingCnnDqnConfig(ConvMlpConfig {
            out_features: Dims::Many(vec![5, 2]),
            num_cells: Dims::Many(vec![4]),
            ..ConvMlpConfig::default()
        })
        .build()
        .unwrap();
        assert_eq!(net.forward(&testing::input(&[6, 6, 3])).unwrap().shape(), &[5, 2]);
    }

    #[test]
    fn empty_features_invalid() {
        let config = DuelingMlpDqnConfig {
            out_features: Dims::One(2),
            num_cells: Dims::Many(vec![]),
            ..DuelingMlpDqnConfig::default()
        };
        assert!(config.build().is_err());
    }
}
