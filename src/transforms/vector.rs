use super::{map_entries, map_specs, transform_error, Transform};
use crate::envs::{EnvError, REWARD_KEY};
use crate::specs::{CompositeSpec, TensorSpec};
use crate::tensordict::{TensorDict, TensorDictError};
use ndarray::{concatenate, ArrayViewD, Axis};

/// Affine normalization of observations.
///
/// With `standard_normal` the output is `(x - loc) / scale`, otherwise `x * scale + loc`.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationNorm {
    loc: f64,
    scale: f64,
    standard_normal: bool,
    in_keys: Vec<String>,
}

impl ObservationNorm {
    pub fn new(loc: f64, scale: f64, standard_normal: bool, in_keys: Vec<String>) -> Self {
        Self {
            loc,
            scale,
            standard_normal,
            in_keys,
        }
    }

    fn apply(&self, x: f64) -> f64 {
        if self.standard_normal {
            (x - self.loc) / self.scale
        } else {
            x.mul_add(self.scale, self.loc)
        }
    }
}

impl Transform for ObservationNorm {
    fn name(&self) -> &str {
        "ObservationNorm"
    }

    fn transform_observation_spec(&self, spec: CompositeSpec) -> Result<CompositeSpec, EnvError> {
        if self.scale == 0.0 {
            return Err(transform_error(self.name(), "scale must be non-zero"));
        }
        map_specs(self.name(), spec, &self.in_keys, |spec| {
            Ok(match spec {
                TensorSpec::Bounded { shape, low, high } => {
                    let (a, b) = (self.apply(*low), self.apply(*high));
                    TensorSpec::bounded(shape.clone(), a.min(b), a.max(b))
                }
                other => TensorSpec::Unbounded {
                    shape: other.shape(),
                },
            })
        })
    }

    fn call(&mut self, data: &mut TensorDict, prefix: &str) -> Result<(), EnvError> {
        let this = &*self;
        map_entries(data, prefix, &this.in_keys, |_, x| Ok(x.mapv(|v| this.apply(v))))
    }
}

/// Affine reward rescaling: `reward * scale + loc`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RewardScaling {
    loc: f64,
    scale: f64,
}

impl RewardScaling {
    pub const fn new(loc: f64, scale: f64) -> Self {
        Self { loc, scale }
    }
}

impl Transform for RewardScaling {
    fn name(&self) -> &str {
        "RewardScaling"
    }

    fn transform_observation_spec(&self, spec: CompositeSpec) -> Result<CompositeSpec, EnvError> {
        Ok(spec)
    }

    fn transform_reward_spec(&self, spec: TensorSpec) -> TensorSpec {
        match spec {
            TensorSpec::Bounded { shape, low, high } => {
                let (a, b) = (
                    low.mul_add(self.scale, self.loc),
                    high.mul_add(self.scale, self.loc),
                );
                TensorSpec::bounded(shape, a.min(b), a.max(b))
            }
            other => other,
        }
    }

    fn reset(&mut self, _data: &mut TensorDict) -> Result<(), EnvError> {
        Ok(())
    }

    /// The reward entry is never prefixed.
    fn call(&mut self, data: &mut TensorDict, _prefix: &str) -> Result<(), EnvError> {
        let (loc, scale) = (self.loc, self.scale);
        let reward = data
            .get_mut(REWARD_KEY)
            .ok_or_else(|| TensorDictError::MissingKey(REWARD_KEY.into()))?;
        reward.mapv_inplace(|r| r.mul_add(scale, loc));
        Ok(())
    }
}

/// Concatenate several entries along their trailing axis into one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatTensors {
    in_keys: Vec<String>,
    out_key: String,
    del_keys: bool,
}

impl CatTensors {
    pub fn new<S: Into<String>>(in_keys: Vec<String>, out_key: S) -> Self {
        Self {
            in_keys,
            out_key: out_key.into(),
            del_keys: true,
        }
    }

    /// Whether to remove the input entries (default `true`).
    #[must_use]
    pub fn with_del_keys(mut self, del_keys: bool) -> Self {
        self.del_keys = del_keys;
        self
    }
}

impl Transform for CatTensors {
    fn name(&self) -> &str {
        "CatTensors"
    }

    fn transform_observation_spec(&self, mut spec: CompositeSpec) -> Result<CompositeSpec, EnvError> {
        if self.in_keys.is_empty() {
            return Err(transform_error(self.name(), "no input keys"));
        }
        let mut leading: Option<Vec<usize>> = None;
        let mut width = 0;
        let mut bounds = Some((f64::INFINITY, f64::NEG_INFINITY));
        for key in &self.in_keys {
            let entry = spec
                .get(key)
                .ok_or_else(|| transform_error(self.name(), format!("no observation `{}`", key)))?;
            let shape = entry.shape();
            let (last, rest) = shape.split_last().ok_or_else(|| {
                transform_error(self.name(), format!("observation `{}` is a scalar", key))
            })?;
            match &leading {
                Some(expected) if expected.as_slice() != rest => {
                    return Err(transform_error(
                        self.name(),
                        format!("observation `{}` has shape {:?}", key, shape),
                    ))
                }
                _ => leading = Some(rest.to_vec()),
            }
            width += last;
            bounds = match (bounds, entry) {
                (Some((lo, hi)), TensorSpec::Bounded { low, high, .. }) => {
                    Some((lo.min(*low), hi.max(*high)))
                }
                _ => None,
            };
        }
        let mut shape = leading.unwrap_or_default();
        shape.push(width);
        if self.del_keys {
            for key in &self.in_keys {
                spec.remove(key);
            }
        }
        let out = match bounds {
            Some((low, high)) => TensorSpec::bounded(shape, low, high),
            None => TensorSpec::Unbounded { shape },
        };
        spec.insert(self.out_key.clone(), out);
        Ok(spec)
    }

    fn call(&mut self, data: &mut TensorDict, prefix: &str) -> Result<(), EnvError> {
        if self.in_keys.is_empty() {
            return Err(transform_error(self.name(), "no input keys"));
        }
        let full: Vec<String> = self.in_keys.iter().map(|k| format!("{}{}", prefix, k)).collect();
        let joined = {
            let views = full
                .iter()
                .map(|k| data.get_required(k).map(|v| v.view()))
                .collect::<Result<Vec<ArrayViewD<f64>>, _>>()?;
            let axis = views[0].ndim().checked_sub(1).ok_or_else(|| {
                transform_error(self.name(), "cannot concatenate scalar entries")
            })?;
            concatenate(Axis(axis), &views).map_err(|err| transform_error(self.name(), err.to_string()))?
        };
        if self.del_keys {
            for key in &full {
                data.remove(key);
            }
        }
        data.insert(format!("{}{}", prefix, self.out_key), joined)?;
        Ok(())
    }
}
