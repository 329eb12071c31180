//! String-keyed tensor collections sharing a batch shape
use ndarray::{concatenate, stack, ArrayD, ArrayViewD, Axis};
use std::collections::{btree_map, BTreeMap};
use std::fmt;
use thiserror::Error;

/// Error manipulating a [`TensorDict`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorDictError {
    #[error("entry `{key}` has shape {found:?}, incompatible with batch size {expected:?}")]
    BatchMismatch {
        key: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("no entry `{0}`")]
    MissingKey(String),
    #[error("cannot combine tensordicts with keys {expected:?} and {found:?}")]
    KeysMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("cannot combine entry `{key}`: {reason}")]
    Shape { key: String, reason: String },
    #[error("cannot combine an empty list of tensordicts")]
    Empty,
}

/// A map from keys to arrays whose leading dimensions equal `batch_size`.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDict {
    batch_size: Vec<usize>,
    entries: BTreeMap<String, ArrayD<f64>>,
}

impl fmt::Display for TensorDict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TensorDict(batch_size={:?}", self.batch_size)?;
        for (key, value) in &self.entries {
            write!(f, ", {}: {:?}", key, value.shape())?;
        }
        write!(f, ")")
    }
}

impl TensorDict {
    pub const fn new(batch_size: Vec<usize>) -> Self {
        Self {
            batch_size,
            entries: BTreeMap::new(),
        }
    }

    pub fn batch_size(&self) -> &[usize] {
        &self.batch_size
    }

    /// Number of batch elements.
    pub fn numel(&self) -> usize {
        self.batch_size.iter().product()
    }

    /// Insert an entry, checking that its leading dimensions match the batch size.
    pub fn insert<K: Into<String>>(
        &mut self,
        key: K,
        value: ArrayD<f64>,
    ) -> Result<Option<ArrayD<f64>>, TensorDictError> {
        let key = key.into();
        let shape = value.shape();
        if shape.len() < self.batch_size.len() || shape[..self.batch_size.len()] != self.batch_size[..] {
            return Err(TensorDictError::BatchMismatch {
                key,
                expected: self.batch_size.clone(),
                found: shape.to_vec(),
            });
        }
        Ok(self.entries.insert(key, value))
    }

    /// Insert an entry known to match the batch size.
    ///
    /// # Panics
    /// If the leading dimensions of `value` differ from the batch size.
    pub fn set<K: Into<String>>(&mut self, key: K, value: ArrayD<f64>) {
        if let Err(err) = self.insert(key, value) {
            panic!("{}", err);
        }
    }

    pub fn get(&self, key: &str) -> Option<&ArrayD<f64>> {
        self.entries.get(key)
    }

    /// An entry that must be present.
    pub fn get_required(&self, key: &str) -> Result<&ArrayD<f64>, TensorDictError> {
        self.get(key)
            .ok_or_else(|| TensorDictError::MissingKey(key.into()))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ArrayD<f64>> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ArrayD<f64>> {
        self.entries.remove(key)
    }

    /// Move an entry to a new key. Returns whether `from` existed.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        match self.entries.remove(from) {
            Some(value) => {
                self.entries.insert(to.into(), value);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<String, ArrayD<f64>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A copy holding only the named entries that are present.
    pub fn select(&self, keys: &[&str]) -> Self {
        Self {
            batch_size: self.batch_size.clone(),
            entries: keys
                .iter()
                .filter_map(|&k| self.entries.get(k).map(|v| (k.to_string(), v.clone())))
                .collect(),
        }
    }

    /// A copy without the named entries.
    pub fn exclude(&self, keys: &[&str]) -> Self {
        Self {
            batch_size: self.batch_size.clone(),
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| !keys.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Copy every entry of `other` into `self`, replacing entries with the same key.
    pub fn update(&mut self, other: &Self) -> Result<(), TensorDictError> {
        for (key, value) in &other.entries {
            self.insert(key.clone(), value.clone())?;
        }
        Ok(())
    }

    /// The `index`-th element along the first batch dimension.
    ///
    /// # Panics
    /// If the tensordict has no batch dimension or `index` is out of bounds.
    pub fn index(&self, index: usize) -> Self {
        Self {
            batch_size: self.batch_size[1..].to_vec(),
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.index_axis(Axis(0), index).to_owned()))
                .collect(),
        }
    }

    /// Stack tensordicts along a new leading batch dimension.
    pub fn stack(items: &[Self]) -> Result<Self, TensorDictError> {
        let first = items.first().ok_or(TensorDictError::Empty)?;
        check_keys(first, items)?;
        let mut batch_size = vec![items.len()];
        batch_size.extend_from_slice(&first.batch_size);
        let mut out = Self::new(batch_size);
        for key in first.entries.keys() {
            let views = views(items, key);
            let stacked = stack(Axis(0), &views).map_err(|err| TensorDictError::Shape {
                key: key.clone(),
                reason: err.to_string(),
            })?;
            out.insert(key.clone(), stacked)?;
        }
        Ok(out)
    }

    /// Concatenate tensordicts along the first batch dimension.
    pub fn cat(items: &[Self]) -> Result<Self, TensorDictError> {
        let first = items.first().ok_or(TensorDictError::Empty)?;
        if first.batch_size.is_empty() {
            return Err(TensorDictError::Shape {
                key: String::new(),
                reason: "no batch dimension to concatenate along".into(),
            });
        }
        check_keys(first, items)?;
        let mut batch_size = first.batch_size.clone();
        batch_size[0] = items.iter().map(|td| td.batch_size.first().copied().unwrap_or(0)).sum();
        let mut out = Self::new(batch_size);
        for key in first.entries.keys() {
            let views = views(items, key);
            let joined = concatenate(Axis(0), &views).map_err(|err| TensorDictError::Shape {
                key: key.clone(),
                reason: err.to_string(),
            })?;
            out.insert(key.clone(), joined)?;
        }
        Ok(out)
    }
}

fn check_keys(first: &TensorDict, items: &[TensorDict]) -> Result<(), TensorDictError> {
    let expected: Vec<_> = first.entries.keys().cloned().collect();
    for item in items {
        if !item.entries.keys().eq(first.entries.keys()) {
            return Err(TensorDictError::KeysMismatch {
                expected,
                found: item.entries.keys().cloned().collect(),
            });
        }
    }
    Ok(())
}

fn views<'a>(items: &'a [TensorDict], key: &str) -> Vec<ArrayViewD<'a, f64>> {
    items
        .iter()
        .filter_map(|td| td.entries.get(key).map(ArrayD::view))
        .collect()
}

impl<'a> IntoIterator for &'a TensorDict {
    type Item = (&'a String, &'a ArrayD<f64>);
    type IntoIter = btree_map::Iter<'a, String, ArrayD<f64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array};

    fn step(value: f64) -> TensorDict {
        let mut td = TensorDict::new(vec![]);
        td.set("observation", arr1(&[value, value]).into_dyn());
        td.set("reward", arr1(&[value]).into_dyn());
        td
    }

    #[test]
    fn insert_checks_batch() {
        let mut td = TensorDict::new(vec![3]);
        assert!(td.insert("a", Array::zeros(vec![3, 2])).is_ok());
        assert!(matches!(
            td.insert("b", Array::zeros(vec![2, 3])),
            Err(TensorDictError::BatchMismatch { key, .. }) if key == "b"
        ));
        assert_eq!(td.numel(), 3);
    }

    #[test]
    fn stack_then_cat() {
        let a = TensorDict::stack(&[step(0.0), step(1.0)]).unwrap();
        let b = TensorDict::stack(&[step(2.0)]).unwrap();
        assert_eq!(a.batch_size(), &[2]);
        assert_eq!(a.get("observation").unwrap().shape(), &[2, 2]);

        let joined = TensorDict::cat(&[a, b]).unwrap();
        assert_eq!(joined.numel(), 3);
        assert_eq!(
            joined.get("observation").unwrap(),
            &arr2(&[[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]]).into_dyn()
        );
        assert_eq!(joined.index(2), step(2.0));
    }

    #[test]
    fn stack_requires_same_keys() {
        let mut other = step(1.0);
        other.remove("reward");
        assert!(matches!(
            TensorDict::stack(&[step(0.0), other]),
            Err(TensorDictError::KeysMismatch { .. })
        ));
        assert_eq!(TensorDict::stack(&[]), Err(TensorDictError::Empty));
    }

    #[test]
    fn select_exclude_rename() {
        let mut td = step(1.0);
        assert_eq!(td.select(&["reward", "missing"]).keys().collect::<Vec<_>>(), vec!["reward"]);
        assert_eq!(td.exclude(&["reward"]).keys().collect::<Vec<_>>(), vec!["observation"]);
        assert!(td.rename("observation", "next_observation"));
        assert!(!td.contains("observation"));
        assert!(matches!(td.get_required("observation"), Err(TensorDictError::MissingKey(_))));
    }
}
