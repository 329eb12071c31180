//! Multi-layer perceptron
use super::{unflatten_last, Activation, Dims, Linear, Network};
use crate::modules::ModuleError;
use crate::resolve::BuildError;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::iter;

/// Configuration for the [`Mlp`] network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MlpConfig {
    /// Output shape; a list gives a multi-dimensional output.
    pub out_features: Dims,
    /// Size of the trailing input axis. Inferred on the first forward pass if unset.
    pub in_features: Option<usize>,
    /// Sizes of the hidden layers
    pub num_cells: Dims,
    /// Activation function between layers.
    pub activation: Activation,
    /// Also apply the activation to the output.
    pub activate_last_layer: bool,
    pub seed: u64,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            out_features: Dims::Many(Vec::new()),
            in_features: None,
            num_cells: Dims::Many(vec![32, 32]),
            activation: Activation::default(),
            activate_last_layer: false,
            seed: 0,
        }
    }
}

impl MlpConfig {
    pub fn build(&self) -> Result<Mlp, BuildError> {
        let out_shape = self.out_features.to_vec();
        if out_shape.is_empty() || out_shape.contains(&0) {
            return Err(BuildError::Invalid {
                key: "out_features".into(),
                reason: format!("expected positive sizes, got {}", self.out_features),
            });
        }
        Ok(Mlp::new(
            self.in_features,
            &self.num_cells.to_vec(),
            out_shape,
            self.activation,
            self.activate_last_layer,
            self.seed,
        ))
    }
}

/// Multi-layer perceptron
#[derive(Debug)]
pub struct Mlp {
    layers: Vec<Linear>,
    activation: Activation,
    activate_last_layer: bool,
    out_shape: Vec<usize>,
}

impl Mlp {
    pub fn new(
        in_features: Option<usize>,
        hidden_sizes: &[usize],
        out_shape: Vec<usize>,
        activation: Activation,
        activate_last_layer: bool,
        seed: u64,
    ) -> Self {
        let out_dim = out_shape.iter().product();
        let in_dims = iter::once(in_features).chain(hidden_sizes.iter().copied().map(Some));
        let out_dims = hidden_sizes.iter().copied().chain(iter::once(out_dim));
        let layers = in_dims
            .zip(out_dims)
            .zip(0..)
            .map(|((in_, out_), i)| Linear::new(in_, out_, true, seed.wrapping_add(i)))
            .collect();
        Self {
            layers,
            activation,
            activate_last_layer,
            out_shape,
        }
    }

    /// Shape of the trailing output dimensions.
    pub fn out_shape(&self) -> &[usize] {
        &self.out_shape
    }
}

impl Network for Mlp {
    fn name(&self) -> &str {
        "Mlp"
    }

    fn forward(&self, input: &ArrayD<f64>) -> Result<ArrayD<f64>, ModuleError> {
        let (last, hidden_layers) = self
            .layers
            .split_last()
            .ok_or_else(|| ModuleError::invalid(self.name(), "no layers"))?;
        let mut hidden = input.clone();
        for layer in hidden_layers {
            hidden = self.activation.forward_owned(layer.forward(&hidden)?);
        }
        let mut output = last.forward(&hidden)?;
        if self.activate_last_layer {
            output = self.activation.forward_owned(output);
        }
        unflatten_last(self.name(), output, &self.out_shape)
    }
}
