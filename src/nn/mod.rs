//! Neural network layers over `ndarray` tensors
//!
//! Inputs carry arbitrary leading batch dimensions. Input sizes may be left unset: layers
//! then size their weights on the first forward pass.
mod conv;
mod dueling;
mod linear;
mod mlp;

pub use conv::{Conv2d, ConvMlp, ConvMlpConfig, ConvNet, ConvNetConfig};
pub use dueling::{DuelingCnnDqn, DuelingCnnDqnConfig, DuelingMlpDqn, DuelingMlpDqnConfig};
pub use linear::Linear;
pub use mlp::{Mlp, MlpConfig};

use crate::modules::ModuleError;
use crate::resolve::{BuildError, Instance, RegistryBuilder, TargetDef};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A feed-forward network over tensors.
pub trait Network: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Apply the network to a `[batch..., features...]` input.
    fn forward(&self, input: &ArrayD<f64>) -> Result<ArrayD<f64>, ModuleError>;
}

/// Activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// No transformation
    Identity,
    /// Rectified linear
    Relu,
    /// Exponential linear
    Elu,
    /// Sigmoid function
    Sigmoid,
    /// Hyperbolic tangent
    Tanh,
}

impl Default for Activation {
    fn default() -> Self {
        Self::Tanh
    }
}

impl Activation {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Identity => x,
            Self::Relu => x.max(0.0),
            Self::Elu => {
                if x > 0.0 {
                    x
                } else {
                    x.exp_m1()
                }
            }
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
        }
    }

    pub fn forward_owned(self, tensor: ArrayD<f64>) -> ArrayD<f64> {
        match self {
            Self::Identity => tensor,
            _ => tensor.mapv_into(|x| self.apply(x)),
        }
    }
}

/// One size or a list of sizes.
///
/// As `out_features`, a list gives a multi-dimensional output shape; as per-layer settings
/// a single value applies to every layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dims {
    One(usize),
    Many(Vec<usize>),
}

impl Default for Dims {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl From<usize> for Dims {
    fn from(n: usize) -> Self {
        Self::One(n)
    }
}

impl From<Vec<usize>> for Dims {
    fn from(dims: Vec<usize>) -> Self {
        Self::Many(dims)
    }
}

impl Dims {
    pub fn to_vec(&self) -> Vec<usize> {
        match self {
            Self::One(n) => vec![*n],
            Self::Many(dims) => dims.clone(),
        }
    }

    /// One value per layer for `num_layers` layers.
    pub fn per_layer(&self, name: &str, num_layers: usize) -> Result<Vec<usize>, BuildError> {
        match self {
            Self::One(n) => Ok(vec![*n; num_layers]),
            Self::Many(dims) if dims.len() == num_layers => Ok(dims.clone()),
            Self::Many(dims) => Err(BuildError::Invalid {
                key: name.into(),
                reason: format!("expected {} values, got {}", num_layers, dims.len()),
            }),
        }
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::One(n) => write!(f, "{}", n),
            Self::Many(dims) => write!(f, "{:?}", dims),
        }
    }
}

/// Reshape the trailing axis of `output` into `shape`.
pub(crate) fn unflatten_last(
    module: &str,
    output: ArrayD<f64>,
    shape: &[usize],
) -> Result<ArrayD<f64>, ModuleError> {
    let ndim = output.ndim();
    let mut full = output.shape()[..ndim.saturating_sub(1)].to_vec();
    full.extend_from_slice(shape);
    output
        .into_shape(full)
        .map_err(|err| ModuleError::shape(module, err.to_string()))
}

fn network(network: impl Network + 'static) -> Instance {
    Instance::Network(Box::new(network))
}

/// Register the networks of this module.
pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .register(
            TargetDef::new("nn.Linear")
                .deferred("out_features")
                .optional("in_features")
                .optional("bias")
                .optional("seed"),
            |args| {
                let out_features = args.value("out_features")?;
                let in_features = args.opt_value("in_features")?;
                let bias = args.value_or("bias", true)?;
                let seed = args.value_or("seed", 0)?;
                Ok(network(Linear::new(in_features, out_features, bias, seed)))
            },
        )
        .register(
            TargetDef::new("nn.Mlp")
                .deferred("out_features")
                .optional("in_features")
                .optional("num_cells")
                .optional("activation")
                .optional("activate_last_layer")
                .optional("seed"),
            |args| {
                let config: MlpConfig = args.take_config()?;
                Ok(network(config.build()?))
            },
        )
        .register(
            TargetDef::new("nn.ConvNet")
                .optional("in_channels")
                .optional("num_cells")
                .optional("kernel_sizes")
                .optional("strides")
                .optional("activation")
                .optional("seed"),
            |args| {
                let config: ConvNetConfig = args.take_config()?;
                Ok(network(config.build()?))
            },
        )
        .register(
            TargetDef::new("nn.ConvMlp")
                .deferred("out_features")
                .optional("in_channels")
                .optional("num_cells")
                .optional("kernel_sizes")
                .optional("strides")
                .optional("mlp_cells")
                .optional("activation")
                .optional("seed"),
            |args| {
                let config: ConvMlpConfig = args.take_config()?;
                Ok(network(config.build()?))
            },
        )
        .register(
            TargetDef::new("nn.DuelingMlpDqn")
                .deferred("out_features")
                .optional("in_features")
                .optional("num_cells")
                .optional("head_cells")
                .optional("activation")
                .optional("seed"),
            |args| {
                let config: DuelingMlpDqnConfig = args.take_config()?;
                Ok(network(config.build()?))
            },
        )
        .register(
            TargetDef::new("nn.DuelingCnnDqn")
                .deferred("out_features")
                .optional("in_channels")
                .optional("num_cells")
                .optional("kernel_sizes")
                .optional("strides")
                .optional("mlp_cells")
                .optional("activation")
                .optional("seed"),
            |args| {
                let config: DuelingCnnDqnConfig = args.take_config()?;
                Ok(network(config.build()?))
            },
        )
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use ndarray::{Dimension, IxDyn};

    /// A deterministic input with the given shape.
    #[allow(clippy::cast_precision_loss)]
    pub fn input(shape: &[usize]) -> ArrayD<f64> {
        let n = shape.iter().product::<usize>().max(1);
        ArrayD::from_shape_fn(IxDyn(shape), |index| {
            let flat: usize = index.as_array_view().iter().sum();
            (flat as f64 / n as f64).sin()
        })
    }
}
