//! Tensor specifications: the shape and domain of environment inputs and outputs.
use crate::tensordict::TensorDict;
use ndarray::{ArrayD, Axis, IxDyn};
use rand::distributions::Distribution;
use rand::Rng;
use rand_distr::{Bernoulli, Gamma, StandardNormal};
use std::collections::{btree_map, BTreeMap};
use std::fmt;

/// Domain of a single tensor entry. Shapes exclude batch dimensions.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorSpec {
    /// One-hot vectors of length `n`.
    OneHot { n: usize },
    /// Vectors of `n` values in `{0, 1}`.
    Binary { n: usize },
    /// Real values in the closed interval `[low, high]`.
    Bounded {
        shape: Vec<usize>,
        low: f64,
        high: f64,
    },
    /// Real values.
    Unbounded { shape: Vec<usize> },
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OneHot { n } => write!(f, "OneHot({})", n),
            Self::Binary { n } => write!(f, "Binary({})", n),
            Self::Bounded { shape, low, high } => {
                write!(f, "Bounded({:?}, {}, {})", shape, low, high)
            }
            Self::Unbounded { shape } => write!(f, "Unbounded({:?})", shape),
        }
    }
}

impl TensorSpec {
    pub fn bounded(shape: Vec<usize>, low: f64, high: f64) -> Self {
        assert!(low <= high, "require low <= high");
        Self::Bounded { shape, low, high }
    }

    /// Shape of a single (unbatched) element.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Self::OneHot { n } | Self::Binary { n } => vec![*n],
            Self::Bounded { shape, .. } | Self::Unbounded { shape } => shape.clone(),
        }
    }

    /// Size of the trailing dimension. `None` for scalars.
    pub fn last_dim(&self) -> Option<usize> {
        self.shape().last().copied()
    }

    /// Total number of scalar values in one element.
    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    pub const fn is_discrete(&self) -> bool {
        matches!(self, Self::OneHot { .. } | Self::Binary { .. })
    }

    /// The same domain with a different element shape.
    ///
    /// Discrete specs stay discrete for rank-1 shapes and become unbounded otherwise.
    pub fn reshaped(&self, shape: Vec<usize>) -> Self {
        match (self, shape.as_slice()) {
            (Self::OneHot { .. }, [n]) => Self::OneHot { n: *n },
            (Self::Binary { .. }, [n]) => Self::Binary { n: *n },
            (Self::Bounded { low, high, .. }, _) => Self::Bounded {
                shape,
                low: *low,
                high: *high,
            },
            _ => Self::Unbounded { shape },
        }
    }

    /// Whether `value` belongs to the domain.
    ///
    /// Leading dimensions of `value` beyond the element shape are batch dimensions.
    pub fn is_in(&self, value: &ArrayD<f64>) -> bool {
        let shape = self.shape();
        let ndim = value.ndim();
        if ndim < shape.len() || value.shape()[ndim - shape.len()..] != shape[..] {
            return false;
        }
        match self {
            Self::OneHot { .. } => {
                if ndim == 0 {
                    return false;
                }
                value.lanes(Axis(ndim - 1)).into_iter().all(|lane| {
                    lane.iter().all(|&x| x == 0.0 || x == 1.0)
                        && lane.iter().filter(|&&x| x == 1.0).count() == 1
                })
            }
            Self::Binary { .. } => value.iter().all(|&x| x == 0.0 || x == 1.0),
            Self::Bounded { low, high, .. } => value.iter().all(|x| low <= x && x <= high),
            Self::Unbounded { .. } => value.iter().all(|x| !x.is_nan()),
        }
    }

    /// Project `value` onto the domain.
    ///
    /// One-hot lanes keep their largest entry, binary values are thresholded at 0.5 and
    /// bounded values are clamped.
    pub fn project(&self, value: &ArrayD<f64>) -> ArrayD<f64> {
        match self {
            Self::OneHot { .. } => {
                let mut out = ArrayD::zeros(value.raw_dim());
                if value.ndim() == 0 {
                    return out;
                }
                let axis = Axis(value.ndim() - 1);
                for (lane, mut out_lane) in value.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
                    if let Some(i) = argmax(lane.iter().copied()) {
                        out_lane[i] = 1.0;
                    }
                }
                out
            }
            Self::Binary { .. } => value.mapv(|x| if x >= 0.5 { 1.0 } else { 0.0 }),
            Self::Bounded { low, high, .. } => value.mapv(|x| x.clamp(*low, *high)),
            Self::Unbounded { .. } => value.clone(),
        }
    }

    /// A random element of the domain for each index of `batch`.
    pub fn rand<R: Rng + ?Sized>(&self, batch: &[usize], rng: &mut R) -> ArrayD<f64> {
        let full = full_shape(batch, &self.shape());
        match self {
            Self::OneHot { n } => {
                let mut out = ArrayD::zeros(IxDyn(&full));
                let axis = Axis(full.len() - 1);
                for mut lane in out.lanes_mut(axis) {
                    lane[rng.gen_range(0..*n)] = 1.0;
                }
                out
            }
            Self::Binary { .. } => {
                let coin = Bernoulli::new(0.5).expect("valid probability");
                ArrayD::from_shape_simple_fn(IxDyn(&full), || f64::from(u8::from(coin.sample(rng))))
            }
            Self::Bounded { low, high, .. } => ArrayD::from_shape_simple_fn(IxDyn(&full), || {
                sample_interval(*low, *high, rng)
            }),
            Self::Unbounded { .. } => {
                ArrayD::from_shape_simple_fn(IxDyn(&full), || StandardNormal.sample(rng))
            }
        }
    }

    /// An element of all zeros (the first category for one-hot specs).
    pub fn zero(&self, batch: &[usize]) -> ArrayD<f64> {
        let full = full_shape(batch, &self.shape());
        let mut out = ArrayD::zeros(IxDyn(&full));
        if let Self::OneHot { .. } = self {
            let axis = Axis(full.len() - 1);
            for mut lane in out.lanes_mut(axis) {
                lane[0] = 1.0;
            }
        }
        out
    }
}

fn full_shape(batch: &[usize], shape: &[usize]) -> Vec<usize> {
    batch.iter().chain(shape).copied().collect()
}

fn sample_interval<R: Rng + ?Sized>(low: f64, high: f64, rng: &mut R) -> f64 {
    let gamma = || Gamma::new(1.0, 1.0).expect("valid gamma parameters");
    match (low.is_finite(), high.is_finite()) {
        (true, true) if low < high => rng.gen_range(low..=high),
        (true, true) => low,
        (true, false) => low + gamma().sample(rng),
        (false, true) => high - gamma().sample(rng),
        (false, false) => StandardNormal.sample(rng),
    }
}

/// Index of the largest value. Ties keep the first.
pub(crate) fn argmax<I: IntoIterator<Item = f64>>(values: I) -> Option<usize> {
    values
        .into_iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, x)| match best {
            Some((_, b)) if b >= x => best,
            _ => Some((i, x)),
        })
        .map(|(i, _)| i)
}

/// Specs of the entries of a [`TensorDict`], by key.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CompositeSpec {
    entries: BTreeMap<String, TensorSpec>,
}

impl fmt::Display for CompositeSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CompositeSpec(")?;
        for (i, (key, spec)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", key, spec)?;
        }
        write!(f, ")")
    }
}

impl CompositeSpec {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with<K: Into<String>>(mut self, key: K, spec: TensorSpec) -> Self {
        self.insert(key, spec);
        self
    }

    pub fn insert<K: Into<String>>(&mut self, key: K, spec: TensorSpec) -> Option<TensorSpec> {
        self.entries.insert(key.into(), spec)
    }

    pub fn get(&self, key: &str) -> Option<&TensorSpec> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut TensorSpec> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<TensorSpec> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<String, TensorSpec> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether every entry of `data` named by this spec is in its domain.
    ///
    /// Entries missing from `data` fail the check.
    pub fn is_in(&self, data: &TensorDict) -> bool {
        self.entries
            .iter()
            .all(|(key, spec)| data.get(key).map_or(false, |value| spec.is_in(value)))
    }

    /// A random element of every entry.
    pub fn rand<R: Rng + ?Sized>(&self, batch: &[usize], rng: &mut R) -> TensorDict {
        let mut data = TensorDict::new(batch.to_vec());
        for (key, spec) in &self.entries {
            data.set(key.clone(), spec.rand(batch, rng));
        }
        data
    }

    /// A zero element of every entry.
    pub fn zero(&self, batch: &[usize]) -> TensorDict {
        let mut data = TensorDict::new(batch.to_vec());
        for (key, spec) in &self.entries {
            data.set(key.clone(), spec.zero(batch));
        }
        data
    }
}

impl<'a> IntoIterator for &'a CompositeSpec {
    type Item = (&'a String, &'a TensorSpec);
    type IntoIter = btree_map::Iter<'a, String, TensorSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl<K: Into<String>> FromIterator<(K, TensorSpec)> for CompositeSpec {
    fn from_iter<I: IntoIterator<Item = (K, TensorSpec)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
