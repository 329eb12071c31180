//! Lazily sized linear layer
use super::Network;
use crate::modules::ModuleError;
use crate::Prng;
use ndarray::{Array1, Array2, ArrayD};
use once_cell::sync::OnceCell;
use rand::distributions::{Distribution, Uniform};
use rand::SeedableRng;

#[derive(Debug, Clone)]
struct Params {
    /// `[out_features, in_features]`
    weight: Array2<f64>,
    bias: Option<Array1<f64>>,
}

impl Params {
    /// Glorot uniform weights and zero bias.
    #[allow(clippy::cast_precision_loss)]
    fn init(in_features: usize, out_features: usize, bias: bool, seed: u64) -> Self {
        let mut rng = Prng::seed_from_u64(seed);
        let bound = (6.0 / (in_features + out_features).max(1) as f64).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        Self {
            weight: Array2::from_shape_simple_fn((out_features, in_features), || {
                dist.sample(&mut rng)
            }),
            bias: bias.then(|| Array1::zeros(out_features)),
        }
    }
}

/// Affine layer `y = x W^T + b` over the trailing axis.
///
/// When `in_features` is not given the weights are created on the first forward pass
/// from the size of the input's trailing axis, and later inputs must match it.
#[derive(Debug)]
pub struct Linear {
    out_features: usize,
    bias: bool,
    seed: u64,
    params: OnceCell<Params>,
}

impl Linear {
    pub fn new(in_features: Option<usize>, out_features: usize, bias: bool, seed: u64) -> Self {
        let params = OnceCell::new();
        if let Some(in_features) = in_features {
            let _ = params.set(Params::init(in_features, out_features, bias, seed));
        }
        Self {
            out_features,
            bias,
            seed,
            params,
        }
    }

    pub const fn out_features(&self) -> usize {
        self.out_features
    }

    /// Input size, once known.
    pub fn in_features(&self) -> Option<usize> {
        self.params.get().map(|p| p.weight.ncols())
    }

    fn params(&self, in_features: usize) -> Result<&Params, ModuleError> {
        let params = self
            .params
            .get_or_init(|| Params::init(in_features, self.out_features, self.bias, self.seed));
        if params.weight.ncols() == in_features {
            Ok(params)
        } else {
            Err(ModuleError::shape(
                self.name(),
                format!(
                    "expected {} input features, got {}",
                    params.weight.ncols(),
                    in_features
                ),
            ))
        }
    }
}

impl Network for Linear {
    fn name(&self) -> &str {
        "Linear"
    }

    fn forward(&self, input: &ArrayD<f64>) -> Result<ArrayD<f64>, ModuleError> {
        let shape = input.shape();
        let (&in_features, leading) = shape
            .split_last()
            .ok_or_else(|| ModuleError::shape(self.name(), "input is a scalar"))?;
        let params = self.params(in_features)?;
        let rows = leading.iter().product::<usize>();
        let matrix = input
            .as_standard_layout()
            .into_owned()
            .into_shape((rows, in_features))
            .map_err(|err| ModuleError::shape(self.name(), err.to_string()))?;
        let mut output = matrix.dot(&params.weight.t());
        if let Some(bias) = &params.bias {
            output += bias;
        }
        let mut out_shape = leading.to_vec();
        out_shape.push(self.out_features);
        output
            .into_shape(out_shape)
            .map_err(|err| ModuleError::shape(self.name(), err.to_string()))
    }
}
