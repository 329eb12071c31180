//! Convolutional networks over channels-last images
use super::{Activation, Dims, Mlp, MlpConfig, Network};
use crate::modules::ModuleError;
use crate::resolve::BuildError;
use crate::Prng;
use ndarray::{s, Array1, Array2, Array4, ArrayD};
use once_cell::sync::OnceCell;
use rand::distributions::{Distribution, Uniform};
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// 2D convolution without padding over `[..., height, width, channels]` inputs.
///
/// The number of input channels is fixed at construction or taken from the first input.
#[derive(Debug)]
pub struct Conv2d {
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    seed: u64,
    /// `[out_channels, kernel * kernel * in_channels]`, row-major over `(ky, kx, c)`.
    weight: OnceCell<Array2<f64>>,
    bias: Array1<f64>,
}

impl Conv2d {
    pub fn new(
        in_channels: Option<usize>,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        seed: u64,
    ) -> Self {
        let conv = Self {
            out_channels,
            kernel_size,
            stride: stride.max(1),
            seed,
            weight: OnceCell::new(),
            bias: Array1::zeros(out_channels),
        };
        if let Some(in_channels) = in_channels {
            let _ = conv.weight.set(conv.init(in_channels));
        }
        conv
    }

    pub fn in_channels(&self) -> Option<usize> {
        self.weight
            .get()
            .map(|w| w.ncols() / (self.kernel_size * self.kernel_size).max(1))
    }

    #[allow(clippy::cast_precision_loss)]
    fn init(&self, in_channels: usize) -> Array2<f64> {
        let mut rng = Prng::seed_from_u64(self.seed);
        let fan_in = self.kernel_size * self.kernel_size * in_channels;
        let fan_out = self.kernel_size * self.kernel_size * self.out_channels;
        let bound = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        Array2::from_shape_simple_fn((self.out_channels, fan_in), || dist.sample(&mut rng))
    }

    fn weight(&self, in_channels: usize) -> Result<&Array2<f64>, ModuleError> {
        let weight = self.weight.get_or_init(|| self.init(in_channels));
        if self.in_channels() == Some(in_channels) {
            Ok(weight)
        } else {
            Err(ModuleError::shape(
                self.name(),
                format!(
                    "expected {} input channels, got {}",
                    weight.ncols() / (self.kernel_size * self.kernel_size).max(1),
                    in_channels
                ),
            ))
        }
    }

    /// Spatial output size for an input of size `n`.
    fn out_size(&self, n: usize) -> Option<usize> {
        n.checked_sub(self.kernel_size).map(|d| d / self.stride + 1)
    }
}

impl Network for Conv2d {
    fn name(&self) -> &str {
        "Conv2d"
    }

    fn forward(&self, input: &ArrayD<f64>) -> Result<ArrayD<f64>, ModuleError> {
        let shape = input.shape();
        let (h, w, c) = match shape {
            [.., h, w, c] => (*h, *w, *c),
            _ => {
                return Err(ModuleError::shape(
                    self.name(),
                    format!("expected [.., h, w, c] input, got {:?}", shape),
                ))
            }
        };
        let leading = &shape[..shape.len() - 3];
        let (oh, ow) = match (self.out_size(h), self.out_size(w)) {
            (Some(oh), Some(ow)) if self.kernel_size > 0 => (oh, ow),
            _ => {
                return Err(ModuleError::shape(
                    self.name(),
                    format!("kernel {} larger than input {}x{}", self.kernel_size, h, w),
                ))
            }
        };
        let weight = self.weight(c)?;
        let n = leading.iter().product::<usize>();
        let images = input
            .as_standard_layout()
            .into_owned()
            .into_shape((n, h, w, c))
            .map_err(|err| ModuleError::shape(self.name(), err.to_string()))?;

        let (k, stride) = (self.kernel_size, self.stride);
        let mut output = Array4::zeros((n, oh, ow, self.out_channels));
        for b in 0..n {
            for i in 0..oh {
                for j in 0..ow {
                    let patch: Array1<f64> = images
                        .slice(s![b, i * stride..i * stride + k, j * stride..j * stride + k, ..])
                        .iter()
                        .copied()
                        .collect();
                    output
                        .slice_mut(s![b, i, j, ..])
                        .assign(&(weight.dot(&patch) + &self.bias));
                }
            }
        }
        let mut out_shape = leading.to_vec();
        out_shape.extend([oh, ow, self.out_channels]);
        output
            .into_shape(out_shape)
            .map_err(|err| ModuleError::shape(self.name(), err.to_string()))
    }
}

/// Configuration for the [`ConvNet`] network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConvNetConfig {
    /// Input channels. Inferred on the first forward pass if unset.
    pub in_channels: Option<usize>,
    /// Output channels of each layer.
    pub num_cells: Dims,
    pub kernel_sizes: Dims,
    pub strides: Dims,
    pub activation: Activation,
    pub seed: u64,
}

impl Default for ConvNetConfig {
    fn default() -> Self {
        Self {
            in_channels: None,
            num_cells: Dims::Many(vec![32, 32, 32]),
            kernel_sizes: Dims::One(3),
            strides: Dims::One(1),
            activation: Activation::Elu,
            seed: 0,
        }
    }
}

impl ConvNetConfig {
    pub fn build(&self) -> Result<ConvNet, BuildError> {
        let channels = self.num_cells.to_vec();
        if channels.is_empty() {
            return Err(BuildError::Invalid {
                key: "num_cells".into(),
                reason: "at least one layer is required".into(),
            });
        }
        let kernels = self.kernel_sizes.per_layer("kernel_sizes", channels.len())?;
        let strides = self.strides.per_layer("strides", channels.len())?;
        if kernels.contains(&0) || strides.contains(&0) {
            return Err(BuildError::Invalid {
                key: "kernel_sizes".into(),
                reason: "kernel sizes and strides must be positive".into(),
            });
        }
        let in_channels = std::iter::once(self.in_channels).chain(channels.iter().copied().map(Some));
        let layers = in_channels
            .zip(&channels)
            .zip(kernels.iter().zip(&strides))
            .zip(0..)
            .map(|(((in_, &out), (&k, &s)), i)| Conv2d::new(in_, out, k, s, self.seed.wrapping_add(i)))
            .collect();
        Ok(ConvNet {
            layers,
            activation: self.activation,
        })
    }
}

/// Stack of [`Conv2d`] layers, each followed by the activation, with the trailing
/// `[h, w, c]` axes flattened into one feature axis.
#[derive(Debug)]
pub struct ConvNet {
    layers: Vec<Conv2d>,
    activation: Activation,
}

impl ConvNet {
    pub fn layers(&self) -> &[Conv2d] {
        &self.layers
    }
}

impl Network for ConvNet {
    fn name(&self) -> &str {
        "ConvNet"
    }

    fn forward(&self, input: &ArrayD<f64>) -> Result<ArrayD<f64>, ModuleError> {
        let mut hidden = input.clone();
        for layer in &self.layers {
            hidden = self.activation.forward_owned(layer.forward(&hidden)?);
        }
        let shape = hidden.shape();
        let split = shape.len() - 3;
        let mut flat_shape = shape[..split].to_vec();
        flat_shape.push(shape[split..].iter().product());
        hidden
            .into_shape(flat_shape)
            .map_err(|err| ModuleError::shape(self.name(), err.to_string()))
    }
}

/// Configuration for the [`ConvMlp`] network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConvMlpConfig {
    pub out_features: Dims,
    pub in_channels: Option<usize>,
    pub num_cells: Dims,
    pub kernel_sizes: Dims,
    pub strides: Dims,
    /// Hidden layer sizes of the fully connected part.
    pub mlp_cells: Dims,
    pub activation: Activation,
    pub seed: u64,
}

impl Default for ConvMlpConfig {
    fn default() -> Self {
        let conv = ConvNetConfig::default();
        Self {
            out_features: Dims::Many(Vec::new()),
            in_channels: conv.in_channels,
            num_cells: conv.num_cells,
            kernel_sizes: conv.kernel_sizes,
            strides: conv.strides,
            mlp_cells: Dims::Many(vec![64]),
            activation: conv.activation,
            seed: 0,
        }
    }
}

impl ConvMlpConfig {
    pub(crate) fn conv_config(&self) -> ConvNetConfig {
        ConvNetConfig {
            in_channels: self.in_channels,
            num_cells: self.num_cells.clone(),
            kernel_sizes: self.kernel_sizes.clone(),
            strides: self.strides.clone(),
            activation: self.activation,
            seed: self.seed,
        }
    }

    pub fn build(&self) -> Result<ConvMlp, BuildError> {
        let conv = self.conv_config().build()?;
        let mlp = MlpConfig {
            out_features: self.out_features.clone(),
            in_features: None,
            num_cells: self.mlp_cells.clone(),
            activation: self.activation,
            activate_last_layer: false,
            seed: self.seed.wrapping_add(1000),
        }
        .build()?;
        Ok(ConvMlp { conv, mlp })
    }
}

/// A [`ConvNet`] feature extractor followed by an [`Mlp`].
#[derive(Debug)]
pub struct ConvMlp {
    conv: ConvNet,
    mlp: Mlp,
}

impl Network for ConvMlp {
    fn name(&self) -> &str {
        "ConvMlp"
    }

    fn forward(&self, input: &ArrayD<f64>) -> Result<ArrayD<f64>, ModuleError> {
        self.mlp.forward(&self.conv.forward(input)?)
    }
}
