//! Index samplers for replay buffers
use super::DataError;
use crate::Prng;
use rand::Rng;
use std::fmt;

/// Sampled storage indices with their importance weights.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledIndices {
    pub indices: Vec<usize>,
    pub weights: Vec<f64>,
}

/// Chooses which stored elements make up a batch.
pub trait Sampler: fmt::Debug + Send {
    /// Draw `batch_size` indices in `0..len`, with replacement.
    fn sample(&mut self, len: usize, batch_size: usize, rng: &mut Prng) -> Result<SampledIndices, DataError>;

    /// Called after an element is written at `index`.
    fn on_insert(&mut self, _index: usize) {}

    /// Set the priority of the element at `index`.
    ///
    /// Samplers without priorities ignore updates.
    fn update_priority(&mut self, _index: usize, _priority: f64) -> Result<(), DataError> {
        Ok(())
    }
}

fn check_len(len: usize) -> Result<(), DataError> {
    if len == 0 {
        Err(DataError::Empty)
    } else {
        Ok(())
    }
}

/// Uniform sampling with replacement.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RandomSampler;

impl Sampler for RandomSampler {
    fn sample(&mut self, len: usize, batch_size: usize, rng: &mut Prng) -> Result<SampledIndices, DataError> {
        check_len(len)?;
        Ok(SampledIndices {
            indices: (0..batch_size).map(|_| rng.gen_range(0..len)).collect(),
            weights: vec![1.0; batch_size],
        })
    }
}

/// Proportional prioritized sampling.
///
/// Element `i` is drawn with probability `p_i^alpha / sum_j p_j^alpha` and weighted by
/// `(len * P(i))^-beta`, normalized so the largest weight in the batch is 1.
/// New elements get the largest priority seen so far.
#[derive(Debug, Clone, PartialEq)]
pub struct PrioritizedSampler {
    alpha: f64,
    beta: f64,
    eps: f64,
    priorities: Vec<f64>,
    max_priority: f64,
}

impl PrioritizedSampler {
    pub const DEFAULT_EPS: f64 = 1e-8;

    pub fn new(alpha: f64, beta: f64) -> Result<Self, DataError> {
        if !(alpha >= 0.0 && beta >= 0.0) {
            return Err(DataError::Invalid(format!(
                "alpha and beta must be non-negative, got {} and {}",
                alpha, beta
            )));
        }
        Ok(Self {
            alpha,
            beta,
            eps: Self::DEFAULT_EPS,
            priorities: Vec::new(),
            max_priority: 1.0,
        })
    }

    #[must_use]
    pub const fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn priority(&self, index: usize) -> Option<f64> {
        self.priorities.get(index).copied()
    }
}

impl Sampler for PrioritizedSampler {
    fn sample(&mut self, len: usize, batch_size: usize, rng: &mut Prng) -> Result<SampledIndices, DataError> {
        check_len(len)?;
        if self.priorities.len() < len {
            self.priorities.resize(len, self.max_priority);
        }
        let mut cumulative = Vec::with_capacity(len);
        let mut total = 0.0;
        for p in &self.priorities[..len] {
            total += p.powf(self.alpha);
            cumulative.push(total);
        }

        let mut indices = Vec::with_capacity(batch_size);
        let mut weights = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let target = rng.gen::<f64>() * total;
            let index = cumulative.partition_point(|&c| c <= target).min(len - 1);
            let prob = self.priorities[index].powf(self.alpha) / total;
            #[allow(clippy::cast_precision_loss)]
            let weight = (len as f64 * prob).powf(-self.beta);
            indices.push(index);
            weights.push(weight);
        }
        let max_weight = weights.iter().copied().fold(0.0, f64::max);
        if max_weight > 0.0 {
            weights.iter_mut().for_each(|w| *w /= max_weight);
        }
        Ok(SampledIndices { indices, weights })
    }

    fn on_insert(&mut self, index: usize) {
        if index >= self.priorities.len() {
            self.priorities.resize(index + 1, self.max_priority);
        }
        self.priorities[index] = self.max_priority;
    }

    fn update_priority(&mut self, index: usize, priority: f64) -> Result<(), DataError> {
        if !priority.is_finite() {
            return Err(DataError::Invalid(format!("priority {} is not finite", priority)));
        }
        if index >= self.priorities.len() {
            return Err(DataError::OutOfRange {
                index,
                len: self.priorities.len(),
            });
        }
        let priority = priority.abs() + self.eps;
        self.priorities[index] = priority;
        self.max_priority = self.max_priority.max(priority);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rstest::rstest;

    #[test]
    fn random_in_range() {
        let mut rng = Prng::seed_from_u64(0);
        let sample = RandomSampler.sample(3, 50, &mut rng).unwrap();
        assert_eq!(sample.indices.len(), 50);
        assert!(sample.indices.iter().all(|&i| i < 3));
        assert!(sample.weights.iter().all(|&w| w == 1.0));
    }

    #[rstest]
    #[case(Box::new(RandomSampler))]
    #[case(Box::new(PrioritizedSampler::new(0.6, 0.4).unwrap()))]
    fn empty_storage(#[case] mut sampler: Box<dyn Sampler>) {
        let mut rng = Prng::seed_from_u64(0);
        assert!(matches!(sampler.sample(0, 4, &mut rng), Err(DataError::Empty)));
    }

    #[test]
    fn priorities_bias_sampling() {
        let mut sampler = PrioritizedSampler::new(1.0, 1.0).unwrap();
        for i in 0..4 {
            sampler.on_insert(i);
        }
        sampler.update_priority(0, 0.0).unwrap();
        sampler.update_priority(3, 100.0).unwrap();
        let mut rng = Prng::seed_from_u64(1);
        let sample = sampler.sample(4, 200, &mut rng).unwrap();
        let count = |k| sample.indices.iter().filter(|&&i| i == k).count();
        assert_eq!(count(0), 0);
        assert!(count(3) > count(1) + count(2));
        // Frequent elements get the smallest weights
        let weight_of = |k| sample.indices.iter().position(|&i| i == k).map(|p| sample.weights[p]);
        if let (Some(frequent), Some(rare)) = (weight_of(3), weight_of(1)) {
            assert!(frequent < rare);
        }
    }

    #[test]
    fn new_elements_get_max_priority() {
        let mut sampler = PrioritizedSampler::new(0.5, 0.5).unwrap();
        sampler.on_insert(0);
        sampler.update_priority(0, 5.0).unwrap();
        sampler.on_insert(1);
        assert_eq!(sampler.priority(1), sampler.priority(0));
    }

    #[test]
    fn rejects_bad_updates() {
        let mut sampler = PrioritizedSampler::new(0.5, 0.5).unwrap();
        sampler.on_insert(0);
        assert!(sampler.update_priority(0, f64::NAN).is_err());
        assert!(matches!(
            sampler.update_priority(4, 1.0),
            Err(DataError::OutOfRange { index: 4, len: 1 })
        ));
    }

    #[test]
    fn rejects_negative_exponents() {
        assert!(PrioritizedSampler::new(-1.0, 0.5).is_err());
    }
}
