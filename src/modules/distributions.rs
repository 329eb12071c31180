//! Action distributions
//!
//! Each type represents a batch of distributions: the trailing axis of the parameters
//! holds the event dimension and every leading axis is a batch axis.
use super::ModuleError;
use crate::specs::argmax;
use crate::Prng;
use ndarray::{ArrayD, Axis, Zip};
use rand::distributions::Distribution;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Distribution families available to [`ProbabilisticActor`](super::ProbabilisticActor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionKind {
    /// Categorical over one-hot vectors, parameterized by logits.
    OneHotCategorical,
    /// Normal squashed by `tanh`, parameterized by location and scale.
    TanhNormal,
}

impl Default for DistributionKind {
    fn default() -> Self {
        Self::OneHotCategorical
    }
}

impl DistributionKind {
    /// Number of parameter tensors.
    pub const fn num_params(self) -> usize {
        match self {
            Self::OneHotCategorical => 1,
            Self::TanhNormal => 2,
        }
    }

    pub fn default_param_keys(self) -> Vec<String> {
        let keys: &[&str] = match self {
            Self::OneHotCategorical => &["logits"],
            Self::TanhNormal => &["loc", "scale"],
        };
        keys.iter().map(|&k| k.to_string()).collect()
    }
}

/// A batch of distributions.
pub trait BatchDistribution {
    /// One sample from each distribution in the batch.
    fn sample(&self, rng: &mut Prng) -> ArrayD<f64>;

    /// The most likely element of each distribution.
    fn mode(&self) -> ArrayD<f64>;

    /// Log probability of each element, shaped `[BATCH_SHAPE.., 1]`.
    fn log_probs(&self, elements: &ArrayD<f64>) -> Result<ArrayD<f64>, ModuleError>;
}

/// Normalize log probabilities in place along `axis`.
pub(crate) fn log_softmax_inplace(values: &mut ArrayD<f64>, axis: Axis) {
    for mut lane in values.lanes_mut(axis) {
        let max = lane.fold(f64::NEG_INFINITY, |m, &x| m.max(x));
        let log_normalizer = lane.iter().map(|x| (x - max).exp()).sum::<f64>().ln() + max;
        lane.mapv_inplace(|x| x - log_normalizer);
    }
}

fn event_axis(name: &str, params: &ArrayD<f64>) -> Result<Axis, ModuleError> {
    match params.shape().last() {
        Some(0) => Err(ModuleError::shape(name, "empty event dimension")),
        Some(_) => Ok(Axis(params.ndim() - 1)),
        None => Err(ModuleError::shape(name, "parameters are a scalar")),
    }
}

fn check_elements(name: &str, params: &ArrayD<f64>, elements: &ArrayD<f64>) -> Result<(), ModuleError> {
    if params.shape() == elements.shape() {
        Ok(())
    } else {
        Err(ModuleError::shape(
            name,
            format!(
                "elements of shape {:?} for parameters of shape {:?}",
                elements.shape(),
                params.shape()
            ),
        ))
    }
}

/// Categorical distribution(s) over one-hot vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct OneHotCategorical {
    /// Normalized log probability of each event.
    log_probs: ArrayD<f64>,
}

impl OneHotCategorical {
    const NAME: &'static str = "OneHotCategorical";

    /// Initialize from possibly unnormalized log probabilities.
    pub fn new(logits: &ArrayD<f64>) -> Result<Self, ModuleError> {
        let axis = event_axis(Self::NAME, logits)?;
        let mut log_probs = logits.clone();
        log_softmax_inplace(&mut log_probs, axis);
        Ok(Self { log_probs })
    }

    pub fn probs(&self) -> ArrayD<f64> {
        self.log_probs.mapv(f64::exp)
    }

    fn axis(&self) -> Axis {
        Axis(self.log_probs.ndim() - 1)
    }
}

impl BatchDistribution for OneHotCategorical {
    fn sample(&self, rng: &mut Prng) -> ArrayD<f64> {
        let axis = self.axis();
        let mut out = ArrayD::zeros(self.log_probs.raw_dim());
        for (lane, mut out_lane) in self.log_probs.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
            let u: f64 = rng.gen();
            let mut cumulative = 0.0;
            let index = lane
                .iter()
                .position(|log_prob| {
                    cumulative += log_prob.exp();
                    u < cumulative
                })
                .unwrap_or(lane.len() - 1);
            out_lane[index] = 1.0;
        }
        out
    }

    fn mode(&self) -> ArrayD<f64> {
        let axis = self.axis();
        let mut out = ArrayD::zeros(self.log_probs.raw_dim());
        for (lane, mut out_lane) in self.log_probs.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
            if let Some(i) = argmax(lane.iter().copied()) {
                out_lane[i] = 1.0;
            }
        }
        out
    }

    fn log_probs(&self, elements: &ArrayD<f64>) -> Result<ArrayD<f64>, ModuleError> {
        check_elements(Self::NAME, &self.log_probs, elements)?;
        let axis = self.axis();
        // Zero entries select nothing, even against -inf log probabilities.
        let selected = Zip::from(elements)
            .and(&self.log_probs)
            .map_collect(|&e, &lp| if e == 0.0 { 0.0 } else { e * lp });
        Ok(selected.sum_axis(axis).insert_axis(axis))
    }
}

/// Normal distribution(s) squashed by `tanh` into `[low, high]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TanhNormal {
    loc: ArrayD<f64>,
    scale: ArrayD<f64>,
    low: f64,
    high: f64,
}

impl TanhNormal {
    const NAME: &'static str = "TanhNormal";
    /// Keeps inverted samples away from the asymptotes of `atanh`.
    const EPSILON: f64 = 1e-6;

    /// Distribution over `[-1, 1]`. `scale` must be positive.
    pub fn new(loc: ArrayD<f64>, scale: ArrayD<f64>) -> Result<Self, ModuleError> {
        event_axis(Self::NAME, &loc)?;
        check_elements(Self::NAME, &loc, &scale)?;
        if scale.iter().any(|&s| s.is_nan() || s <= 0.0) {
            return Err(ModuleError::invalid(Self::NAME, "scale must be positive"));
        }
        Ok(Self {
            loc,
            scale,
            low: -1.0,
            high: 1.0,
        })
    }

    /// Rescale the support to the finite interval `[low, high]`.
    #[must_use]
    pub fn with_bounds(mut self, low: f64, high: f64) -> Self {
        if low.is_finite() && high.is_finite() && low < high {
            self.low = low;
            self.high = high;
        }
        self
    }

    fn half_width(&self) -> f64 {
        (self.high - self.low) / 2.0
    }

    fn squash(&self, u: f64) -> f64 {
        self.low + (u.tanh() + 1.0) * self.half_width()
    }
}

impl BatchDistribution for TanhNormal {
    fn sample(&self, rng: &mut Prng) -> ArrayD<f64> {
        Zip::from(&self.loc).and(&self.scale).map_collect(|&loc, &scale| {
            let noise: f64 = StandardNormal.sample(rng);
            self.squash(loc + scale * noise)
        })
    }

    fn mode(&self) -> ArrayD<f64> {
        self.loc.mapv(|loc| self.squash(loc))
    }

    fn log_probs(&self, elements: &ArrayD<f64>) -> Result<ArrayD<f64>, ModuleError> {
        check_elements(Self::NAME, &self.loc, elements)?;
        let half_width = self.half_width();
        let log_density = Zip::from(elements)
            .and(&self.loc)
            .and(&self.scale)
            .map_collect(|&x, &loc, &scale| {
                let t = ((x - self.low) / half_width - 1.0)
                    .clamp(-1.0 + Self::EPSILON, 1.0 - Self::EPSILON);
                let z = (t.atanh() - loc) / scale;
                let normal = -0.5 * z * z - scale.ln() - 0.5 * (2.0 * PI).ln();
                normal - (1.0 - t * t).ln() - half_width.ln()
            });
        let axis = Axis(log_density.ndim() - 1);
        Ok(log_density.sum_axis(axis).insert_axis(axis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};
    use rand::SeedableRng;

    #[test]
    fn categorical_normalizes() {
        let dist = OneHotCategorical::new(&arr2(&[[0.0, 0.0], [1.0, 1.0]]).into_dyn()).unwrap();
        for p in dist.probs().iter() {
            assert!((p - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn categorical_log_probs() {
        let logits = arr2(&[[-1.0, 0.0, 1.0], [f64::NEG_INFINITY, 0.0, 0.0]]).into_dyn();
        let dist = OneHotCategorical::new(&logits).unwrap();
        let elements = arr2(&[[0.0, 0.0, 1.0], [0.0, 1.0, 0.0]]).into_dyn();
        let log_probs = dist.log_probs(&elements).unwrap();
        let log_normalizer = ((-1.0_f64).exp() + 1.0 + 1.0_f64.exp()).ln();
        assert_eq!(log_probs.shape(), &[2, 1]);
        assert!((log_probs[[0, 0]] - (1.0 - log_normalizer)).abs() < 1e-9);
        assert!((log_probs[[1, 0]] + 2.0_f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn categorical_samples_are_one_hot() {
        let logits = arr2(&[[f64::NEG_INFINITY, 0.0, f64::NEG_INFINITY]; 4]).into_dyn();
        let dist = OneHotCategorical::new(&logits).unwrap();
        let mut rng = Prng::seed_from_u64(0);
        let sample = dist.sample(&mut rng);
        for row in sample.outer_iter() {
            assert_eq!(row, arr1(&[0.0, 1.0, 0.0]).into_dyn());
        }
        assert_eq!(dist.mode(), sample);
    }

    #[test]
    fn categorical_rejects_scalar() {
        assert!(OneHotCategorical::new(&ArrayD::zeros(vec![])).is_err());
    }

    #[test]
    fn tanh_normal_within_bounds() {
        let dist = TanhNormal::new(ArrayD::zeros(vec![100, 2]), ArrayD::from_elem(vec![100, 2], 3.0))
            .unwrap()
            .with_bounds(-2.0, 2.0);
        let mut rng = Prng::seed_from_u64(0);
        let sample = dist.sample(&mut rng);
        assert!(sample.iter().all(|x| (-2.0..=2.0).contains(x)));
        let log_probs = dist.log_probs(&sample).unwrap();
        assert_eq!(log_probs.shape(), &[100, 1]);
        assert!(log_probs.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn tanh_normal_mode() {
        let dist = TanhNormal::new(arr1(&[0.0, 100.0]).into_dyn(), arr1(&[1.0, 1.0]).into_dyn())
            .unwrap()
            .with_bounds(0.0, 4.0);
        let mode = dist.mode();
        assert!((mode[0] - 2.0).abs() < 1e-12);
        assert!((mode[1] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn tanh_normal_rejects_nonpositive_scale() {
        assert!(TanhNormal::new(arr1(&[0.0]).into_dyn(), arr1(&[0.0]).into_dyn()).is_err());
    }

    #[test]
    fn default_param_keys_match_counts() {
        for kind in [DistributionKind::OneHotCategorical, DistributionKind::TanhNormal] {
            assert_eq!(kind.default_param_keys().len(), kind.num_params());
        }
    }
}
