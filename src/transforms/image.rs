//! Image transforms. Images are channels-last: `[..., height, width, channels]`.
use super::{map_entries, map_specs, transform_error, Transform};
use crate::envs::EnvError;
use crate::specs::{CompositeSpec, TensorSpec};
use crate::tensordict::TensorDict;
use ndarray::{ArrayD, Dimension, IxDyn};

/// ITU-R 601 luma weights.
const LUMA: [f64; 3] = [0.2989, 0.587, 0.114];

/// `(height, width, channels)` of an image shape.
fn image_dims(transform: &str, shape: &[usize]) -> Result<(usize, usize, usize), EnvError> {
    match shape {
        [.., h, w, c] => Ok((*h, *w, *c)),
        _ => Err(transform_error(
            transform,
            format!("expected an image of shape [.., h, w, c], got {:?}", shape),
        )),
    }
}

fn with_image_dims(shape: &[usize], h: usize, w: usize, c: usize) -> Vec<usize> {
    let mut out = shape[..shape.len() - 3].to_vec();
    out.extend([h, w, c]);
    out
}

/// Scale `[0, 255]` pixel values to `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToTensorImage {
    in_keys: Vec<String>,
}

impl ToTensorImage {
    pub fn new(in_keys: Vec<String>) -> Self {
        Self { in_keys }
    }
}

impl Transform for ToTensorImage {
    fn name(&self) -> &str {
        "ToTensorImage"
    }

    fn transform_observation_spec(&self, spec: CompositeSpec) -> Result<CompositeSpec, EnvError> {
        map_specs(self.name(), spec, &self.in_keys, |spec| {
            let shape = spec.shape();
            image_dims(self.name(), &shape)?;
            Ok(TensorSpec::bounded(shape, 0.0, 1.0))
        })
    }

    fn call(&mut self, data: &mut TensorDict, prefix: &str) -> Result<(), EnvError> {
        map_entries(data, prefix, &self.in_keys, |_, image| Ok(image / 255.0))
    }
}

/// Nearest-neighbour resize to `h` by `w`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resize {
    w: usize,
    h: usize,
    in_keys: Vec<String>,
}

impl Resize {
    pub fn new(w: usize, h: usize, in_keys: Vec<String>) -> Self {
        Self { w, h, in_keys }
    }

    fn resize(&self, image: &ArrayD<f64>) -> Result<ArrayD<f64>, EnvError> {
        let shape = image.shape();
        let (h, w, c) = image_dims(self.name(), shape)?;
        if h == 0 || w == 0 {
            return Err(transform_error(self.name(), "cannot resize an empty image"));
        }
        let ndim = shape.len();
        let out_shape = with_image_dims(shape, self.h, self.w, c);
        let source = |i: usize, from: usize, to: usize| ((2 * i + 1) * from / (2 * to)).min(from - 1);
        Ok(ArrayD::from_shape_fn(IxDyn(&out_shape), |index| {
            let mut src = index.slice().to_vec();
            src[ndim - 3] = source(src[ndim - 3], h, self.h);
            src[ndim - 2] = source(src[ndim - 2], w, self.w);
            image[src.as_slice()]
        }))
    }
}

impl Transform for Resize {
    fn name(&self) -> &str {
        "Resize"
    }

    fn transform_observation_spec(&self, spec: CompositeSpec) -> Result<CompositeSpec, EnvError> {
        if self.h == 0 || self.w == 0 {
            return Err(transform_error(self.name(), "target size must be non-zero"));
        }
        map_specs(self.name(), spec, &self.in_keys, |spec| {
            let shape = spec.shape();
            let (h, w, c) = image_dims(self.name(), &shape)?;
            if h == 0 || w == 0 {
                return Err(transform_error(self.name(), "cannot resize an empty image"));
            }
            Ok(spec.reshaped(with_image_dims(&shape, self.h, self.w, c)))
        })
    }

    fn call(&mut self, data: &mut TensorDict, prefix: &str) -> Result<(), EnvError> {
        let this = &*self;
        map_entries(data, prefix, &this.in_keys, |_, image| this.resize(&image))
    }
}

/// Convert RGB images to a single luma channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayScale {
    in_keys: Vec<String>,
}

impl GrayScale {
    pub fn new(in_keys: Vec<String>) -> Self {
        Self { in_keys }
    }

    fn check_rgb(&self, shape: &[usize]) -> Result<(), EnvError> {
        match image_dims(self.name(), shape)? {
            (_, _, 3) => Ok(()),
            (_, _, c) => Err(transform_error(
                self.name(),
                format!("expected 3 colour channels, got {}", c),
            )),
        }
    }
}

impl Transform for GrayScale {
    fn name(&self) -> &str {
        "GrayScale"
    }

    fn transform_observation_spec(&self, spec: CompositeSpec) -> Result<CompositeSpec, EnvError> {
        map_specs(self.name(), spec, &self.in_keys, |spec| {
            let shape = spec.shape();
            self.check_rgb(&shape)?;
            let (h, w, _) = image_dims(self.name(), &shape)?;
            Ok(spec.reshaped(with_image_dims(&shape, h, w, 1)))
        })
    }

    fn call(&mut self, data: &mut TensorDict, prefix: &str) -> Result<(), EnvError> {
        let this = &*self;
        map_entries(data, prefix, &this.in_keys, |_, image| {
            this.check_rgb(image.shape())?;
            let mut shape = image.shape().to_vec();
            let last = shape.len() - 1;
            shape[last] = 1;
            Ok(ArrayD::from_shape_fn(IxDyn(&shape), |index| {
                let mut src = index.slice().to_vec();
                LUMA.iter()
                    .enumerate()
                    .map(|(c, weight)| {
                        src[last] = c;
                        weight * image[src.as_slice()]
                    })
                    .sum()
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn image_data(h: usize, w: usize) -> TensorDict {
        let mut data = TensorDict::new(vec![]);
        let image = Array::from_shape_fn((h, w, 3), |(i, j, c)| (i * 10 + j + c) as f64).into_dyn();
        data.set("pixels", image);
        data
    }

    fn pixels() -> Vec<String> {
        vec!["pixels".into()]
    }

    #[test]
    fn to_tensor_image_scales() {
        let spec = CompositeSpec::new().with("pixels", TensorSpec::bounded(vec![2, 2, 3], 0.0, 255.0));
        let mut transform = ToTensorImage::new(pixels());
        let spec = transform.transform_observation_spec(spec).unwrap();
        assert_eq!(spec.get("pixels"), Some(&TensorSpec::bounded(vec![2, 2, 3], 0.0, 1.0)));

        let mut data = TensorDict::new(vec![]);
        data.set("next_pixels", ArrayD::from_elem(vec![2, 2, 3], 255.0));
        transform.call(&mut data, "next_").unwrap();
        assert!(data.get("next_pixels").unwrap().iter().all(|&x| x == 1.0));
    }

    #[test]
    fn resize_nearest() {
        let mut data = image_data(4, 4);
        Resize::new(2, 2, pixels()).call(&mut data, "").unwrap();
        let image = data.get("pixels").unwrap();
        assert_eq!(image.shape(), &[2, 2, 3]);
        assert_eq!(image[[0, 0, 0]], 11.0);
        assert_eq!(image[[1, 1, 0]], 33.0);
    }

    #[test]
    fn resize_upsamples() {
        let mut data = image_data(2, 2);
        Resize::new(4, 3, pixels()).call(&mut data, "").unwrap();
        assert_eq!(data.get("pixels").unwrap().shape(), &[3, 4, 3]);
    }

    #[test]
    fn grayscale_single_channel() {
        let mut data = TensorDict::new(vec![]);
        data.set("pixels", ArrayD::from_elem(vec![2, 2, 3], 100.0));
        GrayScale::new(pixels()).call(&mut data, "").unwrap();
        let image = data.get("pixels").unwrap();
        assert_eq!(image.shape(), &[2, 2, 1]);
        assert!((image[[1, 1, 0]] - 99.99).abs() < 1e-9);
    }

    #[test]
    fn grayscale_rejects_vectors() {
        let spec = CompositeSpec::new().with("pixels", TensorSpec::Unbounded { shape: vec![4] });
        assert!(GrayScale::new(pixels()).transform_observation_spec(spec).is_err());
    }

    #[test]
    fn missing_entry_fails() {
        let mut data = TensorDict::new(vec![]);
        assert!(matches!(
            ToTensorImage::new(pixels()).call(&mut data, ""),
            Err(EnvError::TensorDict(_))
        ));
    }
}
