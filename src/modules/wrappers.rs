//! Network wrappers
use super::{split_last, ModuleError};
use crate::nn::Network;
use ndarray::{concatenate, ArrayD, Axis};

/// Maps the output of a network to normal distribution parameters.
///
/// The trailing axis of the inner output is split in half into `[loc, scale]`; the scale
/// half goes through a softplus and is clamped below by `scale_lb`.
#[derive(Debug)]
pub struct NormalParamWrapper {
    name: String,
    network: Box<dyn Network>,
    scale_lb: f64,
}

impl NormalParamWrapper {
    pub const DEFAULT_SCALE_LB: f64 = 1e-4;

    pub fn new(network: Box<dyn Network>) -> Self {
        Self {
            name: format!("NormalParamWrapper({})", network.name()),
            network,
            scale_lb: Self::DEFAULT_SCALE_LB,
        }
    }

    #[must_use]
    pub const fn with_scale_lb(mut self, scale_lb: f64) -> Self {
        self.scale_lb = scale_lb;
        self
    }
}

fn softplus(x: f64) -> f64 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

impl Network for NormalParamWrapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f64>) -> Result<ArrayD<f64>, ModuleError> {
        let output = self.network.forward(input)?;
        let parts = split_last(&self.name, &output, 2)?;
        let scale = parts[1].mapv(|x| softplus(x).max(self.scale_lb));
        let axis = Axis(output.ndim() - 1);
        concatenate(axis, &[parts[0].view(), scale.view()])
            .map_err(|err| ModuleError::shape(&self.name, err.to_string()))
    }
}
