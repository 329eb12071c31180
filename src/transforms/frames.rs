use super::{map_entries, map_specs, transform_error, Transform};
use crate::envs::EnvError;
use crate::specs::CompositeSpec;
use crate::tensordict::TensorDict;
use ndarray::{concatenate, ArrayD, ArrayViewD, Axis};
use std::collections::{HashMap, VecDeque};

/// Stack the last `n` frames of each key along the trailing (channel) axis.
///
/// On reset the history is filled with copies of the first frame.
#[derive(Debug, Clone)]
pub struct CatFrames {
    n: usize,
    in_keys: Vec<String>,
    history: HashMap<String, VecDeque<ArrayD<f64>>>,
}

impl CatFrames {
    pub fn new(n: usize, in_keys: Vec<String>) -> Self {
        Self {
            n,
            in_keys,
            history: HashMap::new(),
        }
    }

    fn push(&mut self, key: &str, frame: ArrayD<f64>) -> Result<ArrayD<f64>, EnvError> {
        let n = self.n;
        let frames = self.history.entry(key.to_string()).or_default();
        if frames.back().map_or(false, |last| last.shape() != frame.shape()) {
            frames.clear();
        }
        while frames.len() + 1 < n {
            frames.push_back(frame.clone());
        }
        frames.push_back(frame);
        while frames.len() > n {
            frames.pop_front();
        }
        let last_axis = frames[0].ndim().checked_sub(1).ok_or_else(|| {
            transform_error("CatFrames", format!("entry `{}` is a scalar", key))
        })?;
        let views: Vec<ArrayViewD<f64>> = frames.iter().map(ArrayD::view).collect();
        concatenate(Axis(last_axis), &views).map_err(|err| transform_error("CatFrames", err.to_string()))
    }
}

impl Transform for CatFrames {
    fn name(&self) -> &str {
        "CatFrames"
    }

    fn transform_observation_spec(&self, spec: CompositeSpec) -> Result<CompositeSpec, EnvError> {
        if self.n == 0 {
            return Err(transform_error(self.name(), "N must be positive"));
        }
        map_specs(self.name(), spec, &self.in_keys, |spec| {
            let mut shape = spec.shape();
            match shape.last_mut() {
                Some(last) => *last *= self.n,
                None => return Err(transform_error(self.name(), "cannot stack scalar entries")),
            }
            Ok(spec.reshaped(shape))
        })
    }

    fn reset(&mut self, data: &mut TensorDict) -> Result<(), EnvError> {
        self.history.clear();
        self.call(data, "")
    }

    fn call(&mut self, data: &mut TensorDict, prefix: &str) -> Result<(), EnvError> {
        let keys = self.in_keys.clone();
        map_entries(data, prefix, &keys, |key, frame| self.push(key, frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::TensorSpec;

    fn frame(value: f64) -> ArrayD<f64> {
        ArrayD::from_elem(vec![2, 2, 1], value)
    }

    #[test]
    fn spec_multiplies_channels() {
        let spec = CompositeSpec::new().with("pixels", TensorSpec::bounded(vec![8, 8, 1], 0.0, 1.0));
        let spec = CatFrames::new(4, vec!["pixels".into()])
            .transform_observation_spec(spec)
            .unwrap();
        assert_eq!(spec.get("pixels").unwrap().shape(), vec![8, 8, 4]);
    }

    #[test]
    fn keeps_latest_frames() {
        let mut transform = CatFrames::new(3, vec!["pixels".into()]);
        let mut data = TensorDict::new(vec![]);
        data.set("pixels", frame(0.0));
        transform.reset(&mut data).unwrap();
        assert_eq!(data.get("pixels").unwrap().shape(), &[2, 2, 3]);

        for value in [1.0, 2.0, 3.0] {
            let mut out = TensorDict::new(vec![]);
            out.set("next_pixels", frame(value));
            transform.call(&mut out, "next_").unwrap();
            data = out;
        }
        let stacked = data.get("next_pixels").unwrap();
        assert_eq!(
            (stacked[[0, 0, 0]], stacked[[0, 0, 1]], stacked[[0, 0, 2]]),
            (1.0, 2.0, 3.0)
        );
    }

    #[test]
    fn reset_clears_history() {
        let mut transform = CatFrames::new(2, vec!["pixels".into()]);
        let mut data = TensorDict::new(vec![]);
        data.set("pixels", frame(5.0));
        transform.reset(&mut data).unwrap();
        let mut data = TensorDict::new(vec![]);
        data.set("pixels", frame(7.0));
        transform.reset(&mut data).unwrap();
        assert!(data.get("pixels").unwrap().iter().all(|&x| x == 7.0));
    }
}
