//! Constructor registry
use super::{Args, BuildError, Instance, ResolveError};
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Factory building an instance from its arguments.
///
/// Arguments are taken out of `args` as they are consumed.
pub type Factory = Arc<dyn Fn(&mut Args) -> Result<Instance, BuildError> + Send + Sync>;

/// How a constructor parameter must be supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// Must be present before construction.
    Required,
    /// May be omitted; the factory supplies a default.
    Optional,
    /// Required, but only known after another component exists (typically a shape derived
    /// from an environment). A node missing a deferred argument resolves to a partial
    /// constructor.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
}

/// Declared parameters of a registered target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetDef {
    name: String,
    params: Vec<Param>,
}

impl TargetDef {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    fn with_param(mut self, name: &str, kind: ParamKind) -> Self {
        self.params.push(Param {
            name: name.into(),
            kind,
        });
        self
    }

    #[must_use]
    pub fn required(self, name: &str) -> Self {
        self.with_param(name, ParamKind::Required)
    }

    #[must_use]
    pub fn optional(self, name: &str) -> Self {
        self.with_param(name, ParamKind::Optional)
    }

    #[must_use]
    pub fn deferred(self, name: &str) -> Self {
        self.with_param(name, ParamKind::Deferred)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Required and deferred parameters absent from `args`.
    pub fn missing(&self, args: &Args) -> Vec<String> {
        self.params
            .iter()
            .filter(|p| p.kind != ParamKind::Optional && !args.contains(&p.name))
            .map(|p| p.name.clone())
            .collect()
    }

    /// Deferred parameters absent from `args`.
    pub fn deferred_missing(&self, args: &Args) -> Vec<String> {
        self.params
            .iter()
            .filter(|p| p.kind == ParamKind::Deferred && !args.contains(&p.name))
            .map(|p| p.name.clone())
            .collect()
    }

    /// The first argument that is not a declared parameter.
    pub fn unexpected<'a>(&self, args: &'a Args) -> Option<&'a str> {
        args.keys().find(|key| self.param(key).is_none())
    }
}

/// A target definition together with its factory.
pub(crate) struct Registered {
    pub def: TargetDef,
    factory: Factory,
}

impl fmt::Debug for Registered {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Registered")
            .field("def", &self.def)
            .finish()
    }
}

impl Registered {
    /// Check arguments against the definition, then run the factory.
    pub fn construct(&self, path: &str, mut args: Args) -> Result<Instance, ResolveError> {
        self.check_unexpected(path, &args)?;
        let missing = self.def.missing(&args);
        if !missing.is_empty() {
            return Err(ResolveError::MissingArgument {
                path: path.into(),
                target: self.def.name.clone(),
                missing,
            });
        }
        debug!("building `{}` at `{}`", self.def.name, path);
        (self.factory)(&mut args).map_err(|source| ResolveError::Build {
            path: path.into(),
            target: self.def.name.clone(),
            source,
        })
    }

    pub fn check_unexpected(&self, path: &str, args: &Args) -> Result<(), ResolveError> {
        match self.def.unexpected(args) {
            Some(argument) => Err(ResolveError::UnexpectedArgument {
                path: path.into(),
                target: self.def.name.clone(),
                argument: argument.into(),
            }),
            None => Ok(()),
        }
    }
}

/// Collects registrations, then freezes them into a [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    entries: HashMap<String, Arc<Registered>>,
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("num_entries", &self.entries.len())
            .finish()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A later registration of the same name replaces the earlier one.
    #[must_use]
    pub fn register<F>(mut self, def: TargetDef, factory: F) -> Self
    where
        F: Fn(&mut Args) -> Result<Instance, BuildError> + Send + Sync + 'static,
    {
        let registered = Registered {
            def,
            factory: Arc::new(factory),
        };
        self.entries
            .insert(registered.def.name.clone(), Arc::new(registered));
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            entries: Arc::new(self.entries),
        }
    }
}

/// Immutable mapping from target names to factories.
///
/// Cloning shares the underlying table; lookups never lock.
#[derive(Clone)]
pub struct Registry {
    entries: Arc<HashMap<String, Arc<Registered>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// A builder pre-populated with every component shipped by this crate.
    pub fn standard_builder() -> RegistryBuilder {
        let builder = RegistryBuilder::new();
        let builder = crate::envs::register(builder);
        let builder = crate::transforms::register(builder);
        let builder = crate::nn::register(builder);
        let builder = crate::modules::register(builder);
        let builder = crate::collectors::register(builder);
        crate::data::register(builder)
    }

    /// Registry of every component shipped by this crate.
    pub fn standard() -> Self {
        Self::standard_builder().build()
    }

    pub fn get(&self, name: &str) -> Option<&TargetDef> {
        self.entries.get(name).map(|r| &r.def)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<Registered>> {
        self.entries.get(name).cloned()
    }
}
