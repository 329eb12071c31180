//! Replay storages
use crate::tensordict::TensorDict;
use std::fmt;

/// Fixed-size storage of transitions addressed by index.
pub trait Storage: fmt::Debug + Send {
    /// Maximum number of stored elements.
    fn max_size(&self) -> usize;

    /// Number of stored elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store one element and return the index it was written to.
    ///
    /// Once full, the oldest element is overwritten.
    fn add(&mut self, element: TensorDict) -> usize;

    fn get(&self, index: usize) -> Option<&TensorDict>;
}

/// Circular storage backed by a vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ListStorage {
    max_size: usize,
    elements: Vec<TensorDict>,
    /// Index of the next write once the storage is full.
    cursor: usize,
}

impl ListStorage {
    /// Storage for at most `max_size` elements. `max_size` must be positive.
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0, "storage size must be positive");
        Self {
            max_size,
            elements: Vec::new(),
            cursor: 0,
        }
    }
}

impl Storage for ListStorage {
    fn max_size(&self) -> usize {
        self.max_size
    }

    fn len(&self) -> usize {
        self.elements.len()
    }

    fn add(&mut self, element: TensorDict) -> usize {
        if self.elements.len() < self.max_size {
            self.elements.push(element);
            return self.elements.len() - 1;
        }
        let index = self.cursor;
        self.elements[index] = element;
        self.cursor = (self.cursor + 1) % self.max_size;
        index
    }

    fn get(&self, index: usize) -> Option<&TensorDict> {
        self.elements.get(index)
    }
}
