//! Resolved instances
use super::{Args, KindMismatch, PartialSlot, ResolveError};
use crate::collectors::Collector;
use crate::config::{self, Node, Value};
use crate::data::{ReplayBuffer, Sampler, Storage};
use crate::envs::{EnvError, EnvFactory, Environment};
use crate::nn::Network;
use crate::specs::TensorSpec;
use crate::transforms::Transform;
use crate::wiring::Component;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Anything the resolver can produce from a configuration node.
#[derive(Debug)]
pub enum Instance {
    /// Plain data.
    Value(Value),
    Seq(Vec<Instance>),
    /// An instantiated mapping without a target.
    Bundle(Bundle),
    Partial(PartialSlot),
    Env(Box<dyn Environment>),
    EnvFactory(EnvFactory),
    Transform(Box<dyn Transform>),
    Network(Box<dyn Network>),
    Module(Arc<dyn Component>),
    Collector(Box<dyn Collector>),
    ReplayBuffer(ReplayBuffer),
    Storage(Box<dyn Storage>),
    Sampler(Box<dyn Sampler>),
    Spec(TensorSpec),
}

macro_rules! into_variant {
    ($name:ident, $variant:ident, $ty:ty, $expected:literal) => {
        #[doc = concat!("Unwrap a ", $expected, " instance.")]
        pub fn $name(self) -> Result<$ty, KindMismatch> {
            match self {
                Self::$variant(inner) => Ok(inner),
                other => Err(KindMismatch {
                    expected: $expected,
                    found: other.kind(),
                }),
            }
        }
    };
}

impl Instance {
    /// Human readable name of the variant.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Seq(_) => "sequence",
            Self::Bundle(_) => "bundle",
            Self::Partial(_) => "partial",
            Self::Env(_) => "environment",
            Self::EnvFactory(_) => "environment factory",
            Self::Transform(_) => "transform",
            Self::Network(_) => "network",
            Self::Module(_) => "module",
            Self::Collector(_) => "collector",
            Self::ReplayBuffer(_) => "replay buffer",
            Self::Storage(_) => "storage",
            Self::Sampler(_) => "sampler",
            Self::Spec(_) => "spec",
        }
    }

    into_variant!(into_bundle, Bundle, Bundle, "bundle");
    into_variant!(into_partial, Partial, PartialSlot, "partial");
    into_variant!(into_env, Env, Box<dyn Environment>, "environment");
    into_variant!(into_transform, Transform, Box<dyn Transform>, "transform");
    into_variant!(into_network, Network, Box<dyn Network>, "network");
    into_variant!(into_module, Module, Arc<dyn Component>, "module");
    into_variant!(into_collector, Collector, Box<dyn Collector>, "collector");
    into_variant!(into_replay_buffer, ReplayBuffer, ReplayBuffer, "replay buffer");
    into_variant!(into_storage, Storage, Box<dyn Storage>, "storage");
    into_variant!(into_sampler, Sampler, Box<dyn Sampler>, "sampler");
    into_variant!(into_spec, Spec, TensorSpec, "spec");

    /// Convert to plain data.
    ///
    /// Sequences and bundles convert when all their elements do. On failure the
    /// instance is returned unchanged.
    pub fn into_value(self) -> Result<Value, Self> {
        if self.to_value().is_none() {
            return Err(self);
        }
        match self {
            Self::Value(value) => Ok(value),
            Self::Seq(items) => items
                .into_iter()
                .map(Self::into_value)
                .collect::<Result<_, _>>()
                .map(Value::Seq),
            Self::Bundle(bundle) => bundle
                .entries
                .into_iter()
                .map(|(k, v)| v.into_value().map(|v| (k, v)))
                .collect::<Result<_, _>>()
                .map(Value::Map),
            other => Err(other),
        }
    }

    /// Plain data copy of this instance, if it is data.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value.clone()),
            Self::Seq(items) => items.iter().map(Self::to_value).collect::<Option<_>>().map(Value::Seq),
            Self::Bundle(bundle) => bundle
                .entries
                .iter()
                .map(|(k, v)| v.to_value().map(|v| (k.clone(), v)))
                .collect::<Option<Node>>()
                .map(Value::Map),
            _ => None,
        }
    }

    /// Clone the instance if it holds no live object.
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Value(value) => Some(Self::Value(value.clone())),
            Self::Seq(items) => items
                .iter()
                .map(Self::try_clone)
                .collect::<Option<_>>()
                .map(Self::Seq),
            Self::Bundle(bundle) => bundle
                .entries
                .iter()
                .map(|(k, v)| v.try_clone().map(|v| (k.clone(), v)))
                .collect::<Option<_>>()
                .map(|entries| {
                    Self::Bundle(Bundle {
                        path: bundle.path.clone(),
                        entries,
                    })
                }),
            Self::EnvFactory(factory) => Some(Self::EnvFactory(factory.clone())),
            Self::Module(module) => Some(Self::Module(Arc::clone(module))),
            Self::Spec(spec) => Some(Self::Spec(spec.clone())),
            _ => None,
        }
    }

    /// Unwrap an environment factory.
    ///
    /// A partial environment constructor is accepted too and becomes a factory that
    /// builds a fresh environment on every call.
    pub fn into_env_factory(self) -> Result<EnvFactory, KindMismatch> {
        match self {
            Self::EnvFactory(factory) => Ok(factory),
            Self::Partial(mut slot) => {
                let shared = slot
                    .take()
                    .ok()
                    .and_then(|partial| partial.share().ok())
                    .ok_or(KindMismatch {
                        expected: "environment factory",
                        found: "partial",
                    })?;
                Ok(EnvFactory::new(move || {
                    shared
                        .build(Args::new())
                        .map_err(EnvError::factory)?
                        .into_env()
                        .map_err(EnvError::factory)
                }))
            }
            other => Err(KindMismatch {
                expected: "environment factory",
                found: other.kind(),
            }),
        }
    }
}

impl From<Value> for Instance {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Vec<Instance>> for Instance {
    fn from(items: Vec<Instance>) -> Self {
        Self::Seq(items)
    }
}

impl From<Bundle> for Instance {
    fn from(bundle: Bundle) -> Self {
        Self::Bundle(bundle)
    }
}

impl From<PartialSlot> for Instance {
    fn from(slot: PartialSlot) -> Self {
        Self::Partial(slot)
    }
}

impl From<Box<dyn Environment>> for Instance {
    fn from(env: Box<dyn Environment>) -> Self {
        Self::Env(env)
    }
}

impl From<EnvFactory> for Instance {
    fn from(factory: EnvFactory) -> Self {
        Self::EnvFactory(factory)
    }
}

impl From<Box<dyn Transform>> for Instance {
    fn from(transform: Box<dyn Transform>) -> Self {
        Self::Transform(transform)
    }
}

impl From<Box<dyn Network>> for Instance {
    fn from(network: Box<dyn Network>) -> Self {
        Self::Network(network)
    }
}

impl From<Arc<dyn Component>> for Instance {
    fn from(module: Arc<dyn Component>) -> Self {
        Self::Module(module)
    }
}

impl From<TensorSpec> for Instance {
    fn from(spec: TensorSpec) -> Self {
        Self::Spec(spec)
    }
}

/// An instantiated mapping without a target.
///
/// Entries are taken out by name, so a partial can be finalized in place and a
/// second finalization through the same entry fails.
#[derive(Debug, Default)]
pub struct Bundle {
    path: String,
    entries: BTreeMap<String, Instance>,
}

impl Bundle {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Configuration path this bundle was resolved from.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn insert<K: Into<String>, V: Into<Instance>>(&mut self, key: K, value: V) -> Option<Instance> {
        self.entries.insert(key.into(), value.into())
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

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Instance> {
        self.entries.get_mut(key)
    }

    pub fn take(&mut self, key: &str) -> Result<Instance, ResolveError> {
        self.entries
            .remove(key)
            .ok_or_else(|| self.missing(key))
    }

    /// Deserialize a data entry, leaving it in place.
    pub fn value<T: DeserializeOwned>(&self, key: &str) -> Result<T, ResolveError> {
        self.opt_value(key)?.ok_or_else(|| self.missing(key))
    }

    /// Deserialize a data entry if present. Null counts as absent.
    pub fn opt_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ResolveError> {
        let path = config::join(&self.path, key);
        let value = match self.entries.get(key) {
            None => return Ok(None),
            Some(instance) => instance.to_value().ok_or_else(|| ResolveError::Kind {
                path: path.clone(),
                source: KindMismatch {
                    expected: "a value",
                    found: instance.kind(),
                },
            })?,
        };
        if value == Value::Null {
            return Ok(None);
        }
        value
            .deserialize_into()
            .map(Some)
            .map_err(|source| ResolveError::InvalidValue { path, source })
    }

    /// The partial stored under `key`.
    pub fn partial_mut(&mut self, key: &str) -> Result<&mut PartialSlot, ResolveError> {
        let path = config::join(&self.path, key);
        match self.entries.get_mut(key) {
            Some(Instance::Partial(slot)) => Ok(slot),
            Some(other) => Err(ResolveError::NotPartial {
                path,
                found: other.kind(),
            }),
            None => Err(ResolveError::MissingEntry {
                path: self.path.clone(),
                key: key.into(),
            }),
        }
    }

    /// Finalize the partial stored under `key` with the remaining arguments.
    ///
    /// The slot stays in the bundle, finalized; finalizing it again fails with
    /// [`ResolveError::AlreadyFinalized`].
    pub fn finalize(&mut self, key: &str, args: Args) -> Result<Instance, ResolveError> {
        self.partial_mut(key)?.finalize(args)
    }

    pub fn into_entries(self) -> BTreeMap<String, Instance> {
        self.entries
    }

    fn missing(&self, key: &str) -> ResolveError {
        ResolveError::MissingEntry {
            path: self.path.clone(),
            key: key.into(),
        }
    }
}

impl IntoIterator for Bundle {
    type Item = (String, Instance);
    type IntoIter = std::collections::btree_map::IntoIter<String, Instance>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_conversion() {
        let mut bundle = Bundle::new("model");
        bundle.insert("out_features", Value::Int(51));
        bundle.insert(
            "keys",
            Instance::Seq(vec![Value::from("pixels").into(), Value::from("action").into()]),
        );
        assert_eq!(bundle.value::<usize>("out_features").unwrap(), 51);
        assert_eq!(
            bundle.value::<Vec<String>>("keys").unwrap(),
            vec!["pixels", "action"]
        );
        let value = Instance::Bundle(bundle).into_value().unwrap();
        assert_eq!(value.lookup("out_features"), Some(&Value::Int(51)));
    }

    #[test]
    fn live_object_is_not_data() {
        let env: Box<dyn Environment> = Box::new(crate::envs::MockDiscreteEnv::new(2));
        let instance = Instance::Seq(vec![Value::Int(1).into(), env.into()]);
        assert!(instance.to_value().is_none());
        let instance = instance.into_value().unwrap_err();
        assert_eq!(instance.kind(), "sequence");
    }

    #[test]
    fn missing_entry_names_path() {
        let mut bundle = Bundle::new("network");
        assert!(matches!(
            bundle.take("policy_network"),
            Err(ResolveError::MissingEntry { path, key }) if path == "network" && key == "policy_network"
        ));
    }

    #[test]
    fn missing_partial_names_path() {
        let mut bundle = Bundle::new("network");
        assert!(matches!(
            bundle.partial_mut("network"),
            Err(ResolveError::MissingEntry { path, key }) if path == "network" && key == "network"
        ));
    }

    #[test]
    fn not_partial() {
        let mut bundle = Bundle::new("model");
        bundle.insert("out_features", Value::Int(1));
        assert!(matches!(
            bundle.finalize("out_features", Args::new()),
            Err(ResolveError::NotPartial { found: "value", .. })
        ));
    }

    #[test]
    fn kind_mismatch() {
        let err = Instance::Value(Value::Null).into_network().unwrap_err();
        assert_eq!(err.to_string(), "expected network, found value");
    }
}
