//! Key contracts and composite components
use crate::modules::ModuleError;
use crate::specs::CompositeSpec;
use crate::tensordict::TensorDict;
use crate::Prng;
use log::debug;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Ordered keys a component reads and writes.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct KeyContract {
    pub in_keys: Vec<String>,
    pub out_keys: Vec<String>,
}

impl KeyContract {
    pub fn new<I, O, S, T>(in_keys: I, out_keys: O) -> Self
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            in_keys: in_keys.into_iter().map(Into::into).collect(),
            out_keys: out_keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn reads(&self, key: &str) -> bool {
        self.in_keys.iter().any(|k| k == key)
    }

    pub fn writes(&self, key: &str) -> bool {
        self.out_keys.iter().any(|k| k == key)
    }
}

impl fmt::Display for KeyContract {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} -> {:?}", self.in_keys, self.out_keys)
    }
}

/// Access to the concrete type behind a trait object.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A component that reads its input keys from a [`TensorDict`] and writes its output keys.
pub trait Component: AsAny + fmt::Debug {
    fn name(&self) -> &str;

    fn contract(&self) -> &KeyContract;

    fn in_keys(&self) -> &[String] {
        &self.contract().in_keys
    }

    fn out_keys(&self) -> &[String] {
        &self.contract().out_keys
    }

    /// Read the input keys of `data` and write the output keys in place.
    fn forward(&self, data: &mut TensorDict, rng: &mut Prng) -> Result<(), ModuleError>;
}

/// Recover the concrete type of a shared component.
///
/// Returns the component unchanged if it is not a `T`.
pub fn downcast_component<T: Component>(
    component: Arc<dyn Component>,
) -> Result<Arc<T>, Arc<dyn Component>> {
    if (*component).as_any().is::<T>() {
        component
            .into_any_arc()
            .downcast::<T>()
            .map(Ok)
            .expect("component type checked above")
    } else {
        Err(component)
    }
}

/// Error wiring components together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("`{component}` requires key `{key}`, which is not available (available: {})", .available.join(", "))]
    KeyMismatch {
        key: String,
        component: String,
        available: Vec<String>,
    },
    #[error("`{component}`: {reason}")]
    Invalid { component: String, reason: String },
}

/// Components chained in order, exposing a single contract.
#[derive(Debug, Clone)]
pub struct Composite {
    name: String,
    contract: KeyContract,
    components: Vec<Arc<dyn Component>>,
}

impl Composite {
    pub fn components(&self) -> &[Arc<dyn Component>] {
        &self.components
    }
}

impl Component for Composite {
    fn name(&self) -> &str {
        &self.name
    }

    fn contract(&self) -> &KeyContract {
        &self.contract
    }

    fn forward(&self, data: &mut TensorDict, rng: &mut Prng) -> Result<(), ModuleError> {
        for component in &self.components {
            component.forward(data, rng)?;
        }
        Ok(())
    }
}

/// Checks that each component's inputs are available, in declared order.
///
/// A key is available if it is a source key or an output of an earlier component.
/// Components are never reordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyWirer {
    source_keys: Vec<String>,
}

impl DependencyWirer {
    pub fn new<I, S>(source_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source_keys: source_keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Wirer whose sources are the keys of an observation spec.
    pub fn from_spec(spec: &CompositeSpec) -> Self {
        Self::new(spec.keys())
    }

    /// Validate the chain and combine it into a [`Composite`] named `name`.
    ///
    /// The composite reads the inputs not produced within the chain and writes the union
    /// of all outputs.
    pub fn wire<S: Into<String>>(
        &self,
        name: S,
        components: Vec<Arc<dyn Component>>,
    ) -> Result<Composite, WireError> {
        let name = name.into();
        let mut available = self.source_keys.clone();
        let mut contract = KeyContract::default();
        for component in &components {
            for key in component.in_keys() {
                if !available.contains(key) {
                    return Err(WireError::KeyMismatch {
                        key: key.clone(),
                        component: component.name().into(),
                        available,
                    });
                }
                if !contract.writes(key) && !contract.reads(key) {
                    contract.in_keys.push(key.clone());
                }
            }
            for key in component.out_keys() {
                if !contract.writes(key) {
                    contract.out_keys.push(key.clone());
                }
                if !available.contains(key) {
                    available.push(key.clone());
                }
            }
        }
        debug!("wired `{}`: {}", name, contract);
        Ok(Composite {
            name,
            contract,
            components,
        })
    }
}

/// Wire `components` against `source_keys`. See [`DependencyWirer::wire`].
pub fn wire<S: AsRef<str>>(
    source_keys: &[S],
    components: Vec<Arc<dyn Component>>,
) -> Result<Composite, WireError> {
    DependencyWirer::new(source_keys.iter().map(AsRef::as_ref)).wire("composite", components)
}

/// How a network's output dimension derives from the action dimension.
///
/// The trailing output dimension is `action_dim * multiplier`; a `leading` dimension
/// (the number of atoms of a distributional head) is prepended when set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputHead {
    pub leading: Option<usize>,
    pub multiplier: usize,
}

impl Default for OutputHead {
    fn default() -> Self {
        Self {
            leading: None,
            multiplier: 1,
        }
    }
}

impl fmt::Display for OutputHead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.leading {
            Some(leading) => write!(f, "[{}, action x {}]", leading, self.multiplier),
            None => write!(f, "[action x {}]", self.multiplier),
        }
    }
}

impl OutputHead {
    pub const fn new() -> Self {
        Self {
            leading: None,
            multiplier: 1,
        }
    }

    #[must_use]
    pub const fn with_leading(mut self, leading: usize) -> Self {
        self.leading = Some(leading);
        self
    }

    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: usize) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Output shape for an action space with `action_dim` dimensions.
    pub fn out_features(&self, action_dim: usize) -> Vec<usize> {
        self.leading
            .into_iter()
            .chain(std::iter::once(action_dim * self.multiplier))
            .collect()
    }

    /// Total number of network outputs for `action_dim`.
    pub fn numel(&self, action_dim: usize) -> usize {
        self.out_features(action_dim).iter().product()
    }
}
