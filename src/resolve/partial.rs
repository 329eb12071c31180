//! Partial constructors
use super::registry::Registered;
use super::{Args, Instance, NodeResolver, ResolveError};
use crate::config::Node;
use log::debug;
use std::fmt;
use std::sync::Arc;

/// A registered constructor bound to some of its arguments.
///
/// The node's own arguments are kept as configuration and resolved on
/// [`finalize`](PartialConstructor::finalize), which consumes the constructor.
pub struct PartialConstructor {
    resolver: NodeResolver,
    registered: Arc<Registered>,
    path: String,
    /// Unresolved arguments from the configuration node.
    node: Node,
    /// Arguments supplied at resolution time.
    bound: Args,
}

impl fmt::Debug for PartialConstructor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PartialConstructor")
            .field("target", &self.target())
            .field("path", &self.path)
            .field("missing", &self.missing())
            .finish()
    }
}

impl PartialConstructor {
    pub(crate) fn new(
        resolver: NodeResolver,
        registered: Arc<Registered>,
        path: String,
        node: Node,
        bound: Args,
    ) -> Self {
        Self {
            resolver,
            registered,
            path,
            node,
            bound,
        }
    }

    /// Name of the target this constructor builds.
    pub fn target(&self) -> &str {
        self.registered.def.name()
    }

    /// Configuration path the constructor was resolved from.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_bound(&self, argument: &str) -> bool {
        self.node.contains_key(argument) || self.bound.contains(argument)
    }

    /// Whether the target declares a parameter named `argument`.
    pub fn accepts(&self, argument: &str) -> bool {
        self.registered.def.param(argument).is_some()
    }

    /// Required and deferred arguments not yet bound.
    pub fn missing(&self) -> Vec<String> {
        self.registered
            .def
            .params()
            .iter()
            .filter(|p| p.kind != super::ParamKind::Optional && !self.is_bound(&p.name))
            .map(|p| p.name.clone())
            .collect()
    }

    /// Construct the target; `args` win over previously bound arguments.
    pub fn finalize(mut self, args: Args) -> Result<Instance, ResolveError> {
        let bound = std::mem::take(&mut self.bound);
        self.construct_with(bound, args)
    }

    fn construct_with(&self, mut bound: Args, args: Args) -> Result<Instance, ResolveError> {
        bound.extend(args);
        debug!("finalizing `{}` at `{}`", self.registered.def.name(), self.path);
        self.resolver
            .construct(&self.path, &self.registered, &self.node, bound)
    }

    /// Convert into a constructor that can be finalized any number of times.
    ///
    /// Fails if a bound argument is a live object.
    pub fn share(self) -> Result<SharedPartial, ResolveError> {
        let bound = self
            .bound
            .try_clone()
            .ok_or_else(|| ResolveError::InvalidNode {
                path: self.path.clone(),
                reason: "bound arguments hold live objects and cannot be shared".into(),
            })?;
        let bound = bound
            .into_entries()
            .into_iter()
            .map(|(key, instance)| {
                let value = instance.into_value().map_err(|found| ResolveError::InvalidNode {
                    path: self.path.clone(),
                    reason: format!("bound argument `{}` is a {}", key, found.kind()),
                })?;
                Ok((key, value))
            })
            .collect::<Result<Node, ResolveError>>()?;
        Ok(SharedPartial {
            resolver: self.resolver,
            registered: self.registered,
            path: self.path,
            node: self.node,
            bound,
        })
    }
}

/// A partial constructor holding only configuration data.
///
/// Each [`build`](SharedPartial::build) resolves the node afresh.
#[derive(Clone)]
pub struct SharedPartial {
    resolver: NodeResolver,
    registered: Arc<Registered>,
    path: String,
    node: Node,
    bound: Node,
}

impl fmt::Debug for SharedPartial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SharedPartial")
            .field("target", &self.registered.def.name())
            .field("path", &self.path)
            .finish()
    }
}

impl SharedPartial {
    pub fn target(&self) -> &str {
        self.registered.def.name()
    }

    pub fn build(&self, args: Args) -> Result<Instance, ResolveError> {
        let mut bound: Args = self
            .bound
            .iter()
            .map(|(k, v)| (k.clone(), Instance::Value(v.clone())))
            .collect();
        bound.extend(args);
        self.resolver
            .construct(&self.path, &self.registered, &self.node, bound)
    }
}

/// Holds a partial constructor until it is finalized.
///
/// Finalizing moves the constructor out; the slot remembers it was consumed.
#[derive(Debug)]
pub struct PartialSlot {
    target: String,
    path: String,
    inner: Option<PartialConstructor>,
}

impl From<PartialConstructor> for PartialSlot {
    fn from(partial: PartialConstructor) -> Self {
        Self {
            target: partial.target().into(),
            path: partial.path.clone(),
            inner: Some(partial),
        }
    }
}

impl PartialSlot {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.is_none()
    }

    /// The constructor, unless already finalized.
    pub fn get(&self) -> Option<&PartialConstructor> {
        self.inner.as_ref()
    }

    /// Whether the constructor takes `argument` and has not bound it yet.
    pub fn wants(&self, argument: &str) -> bool {
        self.inner
            .as_ref()
            .map_or(false, |p| p.accepts(argument) && !p.is_bound(argument))
    }

    /// Arguments still missing. Empty once finalized.
    pub fn missing(&self) -> Vec<String> {
        self.inner
            .as_ref()
            .map(PartialConstructor::missing)
            .unwrap_or_default()
    }

    /// Move the constructor out of the slot.
    pub fn take(&mut self) -> Result<PartialConstructor, ResolveError> {
        self.inner
            .take()
            .ok_or_else(|| ResolveError::AlreadyFinalized {
                path: self.path.clone(),
                target: self.target.clone(),
            })
    }

    /// Finalize the constructor. The slot is consumed only once construction succeeds.
    ///
    /// Bound arguments that hold live objects cannot be kept for a retry; such a
    /// constructor is consumed by the first attempt either way.
    pub fn finalize(&mut self, args: Args) -> Result<Instance, ResolveError> {
        let partial = self.take()?;
        match partial.bound.try_clone() {
            Some(bound) => {
                let result = partial.construct_with(bound, args);
                if result.is_err() {
                    self.inner = Some(partial);
                }
                result
            }
            None => partial.finalize(args),
        }
    }
}
