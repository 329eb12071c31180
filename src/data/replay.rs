use super::{DataError, Sampler, Storage};
use crate::tensordict::TensorDict;
use crate::Prng;
use log::debug;
use ndarray::{arr1, Array1};

/// A replay buffer: a storage of transitions and a sampler over it.
///
/// The buffer holds at most [`capacity`](Self::capacity) transitions; the capacity is
/// always the maximum size of the underlying storage.
#[derive(Debug)]
pub struct ReplayBuffer {
    storage: Box<dyn Storage>,
    sampler: Box<dyn Sampler>,
}

impl ReplayBuffer {
    /// Key of the storage index of each sampled transition.
    pub const INDEX_KEY: &'static str = "index";
    /// Key of the importance weight of each sampled transition.
    pub const WEIGHT_KEY: &'static str = "_weight";

    pub fn new(storage: Box<dyn Storage>, sampler: Box<dyn Sampler>) -> Self {
        Self { storage, sampler }
    }

    pub fn capacity(&self) -> usize {
        self.storage.max_size()
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Add one transition and return its storage index.
    pub fn add(&mut self, transition: TensorDict) -> usize {
        let index = self.storage.add(transition);
        self.sampler.on_insert(index);
        index
    }

    /// Add every element along the first batch dimension of `batch`.
    pub fn extend(&mut self, batch: &TensorDict) -> Result<Vec<usize>, DataError> {
        let n = *batch.batch_size().first().ok_or(DataError::NoBatchDim)?;
        let indices = (0..n).map(|i| self.add(batch.index(i))).collect();
        debug!("replay buffer holds {} of {} transitions", self.len(), self.capacity());
        Ok(indices)
    }

    /// Sample `batch_size` transitions with replacement.
    ///
    /// The result also holds the storage index and importance weight of each element
    /// under [`INDEX_KEY`](Self::INDEX_KEY) and [`WEIGHT_KEY`](Self::WEIGHT_KEY).
    pub fn sample(&mut self, batch_size: usize, rng: &mut Prng) -> Result<TensorDict, DataError> {
        let sampled = self.sampler.sample(self.storage.len(), batch_size, rng)?;
        let elements = sampled
            .indices
            .iter()
            .map(|&i| {
                self.storage.get(i).cloned().ok_or(DataError::OutOfRange {
                    index: i,
                    len: self.storage.len(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut batch = TensorDict::stack(&elements)?;
        #[allow(clippy::cast_precision_loss)]
        let index: Array1<f64> = sampled.indices.iter().map(|&i| i as f64).collect();
        batch.insert(Self::INDEX_KEY, index.into_dyn())?;
        batch.insert(Self::WEIGHT_KEY, arr1(&sampled.weights).into_dyn())?;
        Ok(batch)
    }

    /// Update the sampling priority of the transitions at `indices`.
    pub fn update_priority(&mut self, indices: &[usize], priorities: &[f64]) -> Result<(), DataError> {
        if indices.len() != priorities.len() {
            return Err(DataError::Invalid(format!(
                "{} indices for {} priorities",
                indices.len(),
                priorities.len()
            )));
        }
        for (&index, &priority) in indices.iter().zip(priorities) {
            self.sampler.update_priority(index, priority)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ListStorage, PrioritizedSampler, RandomSampler};
    use super::*;
    use ndarray::{Array2, ArrayD};
    use rand::SeedableRng;
    use rstest::{fixture, rstest};

    fn batch(start: usize, n: usize) -> TensorDict {
        let mut td = TensorDict::new(vec![n]);
        #[allow(clippy::cast_precision_loss)]
        let obs = Array2::from_shape_fn((n, 2), |(i, j)| (start + i) as f64 + j as f64 / 10.0);
        td.set("observation", obs.into_dyn());
        td.set("reward", ArrayD::ones(vec![n, 1]));
        td
    }

    #[fixture]
    fn buffer() -> ReplayBuffer {
        ReplayBuffer::new(Box::new(ListStorage::new(5)), Box::new(RandomSampler))
    }

    #[rstest]
    fn capacity_is_storage_size(buffer: ReplayBuffer) {
        assert_eq!(buffer.capacity(), 5);
        assert_eq!(buffer.capacity(), buffer.storage().max_size());
    }

    #[rstest]
    fn extend_wraps(mut buffer: ReplayBuffer) {
        assert_eq!(buffer.extend(&batch(0, 3)).unwrap(), vec![0, 1, 2]);
        assert_eq!(buffer.extend(&batch(3, 4)).unwrap(), vec![3, 4, 0, 1]);
        assert_eq!(buffer.len(), 5);
        let first = buffer.storage().get(0).unwrap().get("observation").unwrap().clone();
        assert_eq!(first[[0]], 5.0);
    }

    #[rstest]
    fn sample_shapes(mut buffer: ReplayBuffer) {
        buffer.extend(&batch(0, 4)).unwrap();
        let mut rng = Prng::seed_from_u64(0);
        let sample = buffer.sample(8, &mut rng).unwrap();
        assert_eq!(sample.batch_size(), &[8]);
        assert_eq!(sample.get("observation").unwrap().shape(), &[8, 2]);
        assert_eq!(sample.get(ReplayBuffer::INDEX_KEY).unwrap().shape(), &[8]);
        // The stored observation encodes its index
        let obs = sample.get("observation").unwrap();
        let index = sample.get(ReplayBuffer::INDEX_KEY).unwrap();
        for i in 0..8 {
            assert_eq!(obs[[i, 0]], index[[i]]);
        }
    }

    #[rstest]
    fn sample_empty(mut buffer: ReplayBuffer) {
        let mut rng = Prng::seed_from_u64(0);
        assert!(matches!(buffer.sample(1, &mut rng), Err(DataError::Empty)));
    }

    #[rstest]
    fn extend_needs_batch(mut buffer: ReplayBuffer) {
        assert!(matches!(
            buffer.extend(&TensorDict::new(vec![])),
            Err(DataError::NoBatchDim)
        ));
    }

    #[test]
    fn prioritized_weights() {
        let sampler = PrioritizedSampler::new(1.0, 1.0).unwrap();
        let mut buffer = ReplayBuffer::new(Box::new(ListStorage::new(4)), Box::new(sampler));
        let indices = buffer.extend(&batch(0, 4)).unwrap();
        buffer.update_priority(&indices, &[1.0, 1.0, 1.0, 10.0]).unwrap();
        let mut rng = Prng::seed_from_u64(3);
        let sample = buffer.sample(64, &mut rng).unwrap();
        let weights = sample.get(ReplayBuffer::WEIGHT_KEY).unwrap();
        assert!(weights.iter().all(|&w| w > 0.0 && w <= 1.0));
        assert!(buffer.update_priority(&[0], &[]).is_err());
    }
}
