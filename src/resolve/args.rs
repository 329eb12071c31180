//! Constructor arguments
use super::{BuildError, Instance, KindMismatch};
use crate::config::{Node, Value};
use crate::data::{Sampler, Storage};
use crate::envs::{EnvFactory, Environment};
use crate::nn::Network;
use crate::specs::TensorSpec;
use crate::transforms::Transform;
use crate::wiring::Component;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Named arguments passed to a registered factory.
///
/// Factories take arguments out by name; the typed getters report the argument name on
/// failure.
#[derive(Debug, Default)]
pub struct Args {
    entries: BTreeMap<String, Instance>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with<K: Into<String>, V: Into<Instance>>(mut self, key: K, value: V) -> Self {
        self.insert(key, value);
        self
    }

    /// Add a plain data argument.
    #[must_use]
    pub fn with_value<K: Into<String>, V: Into<Value>>(self, key: K, value: V) -> Self {
        self.with(key, Instance::Value(value.into()))
    }

    pub fn insert<K: Into<String>, V: Into<Instance>>(
        &mut self,
        key: K,
        value: V,
    ) -> Option<Instance> {
        self.entries.insert(key.into(), value.into())
    }

    /// Add every entry of `other`, replacing existing entries of the same name.
    pub fn extend(&mut self, other: Self) {
        self.entries.extend(other.entries);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Instance> {
        self.entries.get(key)
    }

    pub fn take(&mut self, key: &str) -> Option<Instance> {
        self.entries.remove(key)
    }

    /// Take an argument that must be present.
    pub fn require(&mut self, key: &str) -> Result<Instance, BuildError> {
        self.take(key).ok_or_else(|| BuildError::Missing(key.into()))
    }

    /// Take a required data argument and deserialize it.
    pub fn value<T: DeserializeOwned>(&mut self, key: &str) -> Result<T, BuildError> {
        self.opt_value(key)?
            .ok_or_else(|| BuildError::Missing(key.into()))
    }

    /// Take an optional data argument, falling back to `default` when absent or null.
    pub fn value_or<T: DeserializeOwned>(&mut self, key: &str, default: T) -> Result<T, BuildError> {
        Ok(self.opt_value(key)?.unwrap_or(default))
    }

    /// Take an optional data argument. Null counts as absent.
    pub fn opt_value<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, BuildError> {
        let value = match self.take(key) {
            None => return Ok(None),
            Some(instance) => instance.into_value().map_err(|found| kind_error(key, "a value", found))?,
        };
        if value == Value::Null {
            return Ok(None);
        }
        value
            .deserialize_into()
            .map(Some)
            .map_err(|err| BuildError::Invalid {
                key: key.into(),
                reason: err.to_string(),
            })
    }

    pub fn network(&mut self, key: &str) -> Result<Box<dyn Network>, BuildError> {
        self.require(key)?.into_network().map_err(|e| kind(key, e))
    }

    pub fn module(&mut self, key: &str) -> Result<Arc<dyn Component>, BuildError> {
        self.require(key)?.into_module().map_err(|e| kind(key, e))
    }

    /// Take an optional module. Null counts as absent.
    pub fn opt_module(&mut self, key: &str) -> Result<Option<Arc<dyn Component>>, BuildError> {
        match self.take(key) {
            None | Some(Instance::Value(Value::Null)) => Ok(None),
            Some(instance) => instance.into_module().map(Some).map_err(|e| kind(key, e)),
        }
    }

    pub fn env(&mut self, key: &str) -> Result<Box<dyn Environment>, BuildError> {
        self.require(key)?.into_env().map_err(|e| kind(key, e))
    }

    /// Take one environment factory, or a sequence of them.
    pub fn env_factories(&mut self, key: &str) -> Result<Vec<EnvFactory>, BuildError> {
        match self.require(key)? {
            Instance::Seq(items) => items
                .into_iter()
                .map(|item| item.into_env_factory().map_err(|e| kind(key, e)))
                .collect(),
            other => Ok(vec![other.into_env_factory().map_err(|e| kind(key, e))?]),
        }
    }

    /// Take a sequence of transforms. Absent or null means none.
    pub fn transforms(&mut self, key: &str) -> Result<Vec<Box<dyn Transform>>, BuildError> {
        match self.take(key) {
            None | Some(Instance::Value(Value::Null)) => Ok(Vec::new()),
            Some(Instance::Seq(items)) => items
                .into_iter()
                .map(|item| item.into_transform().map_err(|e| kind(key, e)))
                .collect(),
            Some(other) => Ok(vec![other.into_transform().map_err(|e| kind(key, e))?]),
        }
    }

    pub fn storage(&mut self, key: &str) -> Result<Box<dyn Storage>, BuildError> {
        self.require(key)?.into_storage().map_err(|e| kind(key, e))
    }

    /// Take an optional sampler. Null counts as absent.
    pub fn opt_sampler(&mut self, key: &str) -> Result<Option<Box<dyn Sampler>>, BuildError> {
        match self.take(key) {
            None | Some(Instance::Value(Value::Null)) => Ok(None),
            Some(instance) => instance.into_sampler().map(Some).map_err(|e| kind(key, e)),
        }
    }

    pub fn spec(&mut self, key: &str) -> Result<TensorSpec, BuildError> {
        self.require(key)?.into_spec().map_err(|e| kind(key, e))
    }

    /// Take every remaining argument and deserialize them together as one struct.
    ///
    /// All remaining arguments must be data.
    pub fn take_config<T: DeserializeOwned>(&mut self) -> Result<T, BuildError> {
        let mut node = Node::new();
        for (key, instance) in std::mem::take(&mut self.entries) {
            let value = instance
                .into_value()
                .map_err(|found| kind_error(&key, "a value", found))?;
            node.insert(key, value);
        }
        Value::Map(node)
            .deserialize_into()
            .map_err(|err| BuildError::Invalid {
                key: "<arguments>".into(),
                reason: err.to_string(),
            })
    }

    /// Clone the arguments if every one of them is plain data.
    pub fn try_clone(&self) -> Option<Self> {
        self.entries
            .iter()
            .map(|(k, v)| v.try_clone().map(|v| (k.clone(), v)))
            .collect::<Option<_>>()
            .map(|entries| Self { entries })
    }

    pub(crate) fn into_entries(self) -> BTreeMap<String, Instance> {
        self.entries
    }
}

impl FromIterator<(String, Instance)> for Args {
    fn from_iter<I: IntoIterator<Item = (String, Instance)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn kind(key: &str, source: KindMismatch) -> BuildError {
    BuildError::Kind {
        key: key.into(),
        source,
    }
}

fn kind_error(key: &str, expected: &'static str, found: Instance) -> BuildError {
    kind(
        key,
        KindMismatch {
            expected,
            found: found.kind(),
        },
    )
}
