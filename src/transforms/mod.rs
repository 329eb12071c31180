//! Observation and reward transforms applied by [`TransformedEnv`](crate::envs::TransformedEnv)
mod frames;
mod image;
mod vector;

pub use frames::CatFrames;
pub use image::{GrayScale, Resize, ToTensorImage};
pub use vector::{CatTensors, ObservationNorm, RewardScaling};

use crate::envs::EnvError;
use crate::resolve::{Args, BuildError, Instance, RegistryBuilder, TargetDef};
use crate::specs::{CompositeSpec, TensorSpec};
use crate::tensordict::{TensorDict, TensorDictError};
use ndarray::ArrayD;
use std::fmt;

/// A stateful map over environment outputs.
///
/// A transform rewrites some entries of each reset and step output and describes the
/// matching change to the observation spec. Step outputs carry observations under
/// prefixed names (`next_pixels`), so [`Transform::call`] receives the prefix to apply to
/// its keys.
pub trait Transform: fmt::Debug + Send {
    fn name(&self) -> &str;

    /// The observation spec after this transform.
    ///
    /// Fails if the transform cannot apply to `spec`.
    fn transform_observation_spec(&self, spec: CompositeSpec) -> Result<CompositeSpec, EnvError>;

    fn transform_reward_spec(&self, spec: TensorSpec) -> TensorSpec {
        spec
    }

    /// Transform the initial observations of an episode.
    fn reset(&mut self, data: &mut TensorDict) -> Result<(), EnvError> {
        self.call(data, "")
    }

    /// Transform the entries `prefix + key` of `data` in place.
    fn call(&mut self, data: &mut TensorDict, prefix: &str) -> Result<(), EnvError>;
}

pub(crate) fn transform_error<S: Into<String>>(transform: &str, reason: S) -> EnvError {
    EnvError::Transform {
        transform: transform.into(),
        reason: reason.into(),
    }
}

/// Replace each spec named in `keys` by `f(spec)`.
pub(crate) fn map_specs<F>(
    transform: &str,
    mut spec: CompositeSpec,
    keys: &[String],
    mut f: F,
) -> Result<CompositeSpec, EnvError>
where
    F: FnMut(&TensorSpec) -> Result<TensorSpec, EnvError>,
{
    for key in keys {
        let entry = spec
            .get_mut(key)
            .ok_or_else(|| transform_error(transform, format!("no observation `{}`", key)))?;
        *entry = f(entry)?;
    }
    Ok(spec)
}

/// Replace each entry `prefix + key` of `data` by `f(key, value)`.
pub(crate) fn map_entries<F>(
    data: &mut TensorDict,
    prefix: &str,
    keys: &[String],
    mut f: F,
) -> Result<(), EnvError>
where
    F: FnMut(&str, ArrayD<f64>) -> Result<ArrayD<f64>, EnvError>,
{
    for key in keys {
        let full = format!("{}{}", prefix, key);
        let value = data
            .remove(&full)
            .ok_or_else(|| TensorDictError::MissingKey(full.clone()))?;
        data.insert(full, f(key, value)?)?;
    }
    Ok(())
}

fn keys_or(args: &mut Args, default: &str) -> Result<Vec<String>, BuildError> {
    args.value_or("in_keys", vec![default.to_string()])
}

/// Register the transforms of this module.
pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .register(
            TargetDef::new("transforms.ToTensorImage").optional("in_keys"),
            |args| {
                let in_keys = keys_or(args, "pixels")?;
                Ok(Instance::Transform(Box::new(ToTensorImage::new(in_keys))))
            },
        )
        .register(
            TargetDef::new("transforms.Resize")
                .required("w")
                .required("h")
                .optional("in_keys"),
            |args| {
                let w = args.value("w")?;
                let h = args.value("h")?;
                let in_keys = keys_or(args, "pixels")?;
                Ok(Instance::Transform(Box::new(Resize::new(w, h, in_keys))))
            },
        )
        .register(
            TargetDef::new("transforms.GrayScale").optional("in_keys"),
            |args| {
                let in_keys = keys_or(args, "pixels")?;
                Ok(Instance::Transform(Box::new(GrayScale::new(in_keys))))
            },
        )
        .register(
            TargetDef::new("transforms.CatFrames")
                .required("N")
                .optional("in_keys"),
            |args| {
                let n = args.value("N")?;
                let in_keys = keys_or(args, "pixels")?;
                Ok(Instance::Transform(Box::new(CatFrames::new(n, in_keys))))
            },
        )
        .register(
            TargetDef::new("transforms.ObservationNorm")
                .optional("loc")
                .optional("scale")
                .optional("standard_normal")
                .optional("in_keys"),
            |args| {
                let loc = args.value_or("loc", 0.0)?;
                let scale = args.value_or("scale", 1.0)?;
                let standard_normal = args.value_or("standard_normal", false)?;
                let in_keys = keys_or(args, "observation")?;
                Ok(Instance::Transform(Box::new(ObservationNorm::new(
                    loc,
                    scale,
                    standard_normal,
                    in_keys,
                ))))
            },
        )
        .register(
            TargetDef::new("transforms.RewardScaling")
                .required("loc")
                .required("scale"),
            |args| {
                let loc = args.value("loc")?;
                let scale = args.value("scale")?;
                Ok(Instance::Transform(Box::new(RewardScaling::new(loc, scale))))
            },
        )
        .register(
            TargetDef::new("transforms.CatTensors")
                .required("in_keys")
                .optional("out_key")
                .optional("del_keys"),
            |args| {
                let in_keys = args.value("in_keys")?;
                let out_key: String = args.value_or("out_key", "observation_vector".to_string())?;
                let del_keys = args.value_or("del_keys", true)?;
                Ok(Instance::Transform(Box::new(
                    CatTensors::new(in_keys, out_key).with_del_keys(del_keys),
                )))
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Value;
    use crate::resolve::NodeResolver;
    use rstest::rstest;

    #[rstest]
    #[case("{_target_: transforms.ToTensorImage}", "ToTensorImage")]
    #[case("{_target_: transforms.Resize, w: 84, h: 84}", "Resize")]
    #[case("{_target_: transforms.GrayScale}", "GrayScale")]
    #[case("{_target_: transforms.CatFrames, N: 4}", "CatFrames")]
    #[case("{_target_: transforms.ObservationNorm, loc: 0.5, scale: 2.0}", "ObservationNorm")]
    #[case("{_target_: transforms.RewardScaling, loc: 0.0, scale: 0.1}", "RewardScaling")]
    #[case("{_target_: transforms.CatTensors, in_keys: [a, b]}", "CatTensors")]
    fn instantiate_transform(#[case] yaml: &str, #[case] name: &str) {
        let node = Value::from_yaml(yaml).unwrap();
        let transform = NodeResolver::standard()
            .instantiate(&node, Args::new())
            .unwrap()
            .into_transform()
            .unwrap();
        assert_eq!(transform.name(), name);
    }

    #[test]
    fn resize_requires_size() {
        let node = Value::from_yaml("{_target_: transforms.Resize, w: 84}").unwrap();
        assert!(NodeResolver::standard().instantiate(&node, Args::new()).is_err());
    }

    #[test]
    fn missing_spec_key_is_reported() {
        let spec = CompositeSpec::new().with("observation", TensorSpec::Unbounded { shape: vec![3] });
        let err = map_specs("T", spec, &["pixels".to_string()], |s| Ok(s.clone())).unwrap_err();
        assert!(matches!(err, EnvError::Transform { .. }));
    }
}
