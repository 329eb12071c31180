//! Recursive node instantiation
use super::registry::Registered;
use super::{Args, Bundle, Instance, PartialConstructor, Registry, ResolveError};
use crate::config::{self, Node, ResolvedConfig, Value, PARTIAL_KEY, RECURSIVE_KEY, TARGET_KEY};
use crate::error::Error;
use log::debug;

/// Instantiates configuration nodes using a [`Registry`].
#[derive(Debug, Clone)]
pub struct NodeResolver {
    registry: Registry,
}

impl Default for NodeResolver {
    fn default() -> Self {
        Self::standard()
    }
}

impl NodeResolver {
    pub const fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Resolver over [`Registry::standard`].
    pub fn standard() -> Self {
        Self::new(Registry::standard())
    }

    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Instantiate a node.
    ///
    /// # Args
    /// * `node` - Configuration node. Target nodes become objects or partial constructors,
    ///     sequences resolve element-wise, untargeted mappings become [`Bundle`]s and
    ///     scalars stay data.
    /// * `args` - Runtime arguments. They take precedence over the node's own entries.
    pub fn instantiate(&self, node: &Value, args: Args) -> Result<Instance, ResolveError> {
        self.instantiate_at("", node, args)
    }

    /// Instantiate the node at `path` of a composed configuration.
    pub fn instantiate_path(
        &self,
        config: &ResolvedConfig,
        path: &str,
        args: Args,
    ) -> Result<Instance, Error> {
        let node = config.node(path)?;
        Ok(self.instantiate_at(path, node, args)?)
    }

    /// Instantiate a node, naming it `path` in errors.
    pub fn instantiate_at(
        &self,
        path: &str,
        node: &Value,
        args: Args,
    ) -> Result<Instance, ResolveError> {
        match node {
            Value::Map(map) => match map.get(TARGET_KEY) {
                Some(Value::Str(target)) => self.resolve_target(path, target, map, args),
                Some(other) => Err(invalid(
                    path,
                    format!("`{}` must be a string, found {}", TARGET_KEY, other.kind()),
                )),
                None => self.resolve_bundle(path, map, args),
            },
            Value::Seq(items) => {
                if !args.is_empty() {
                    return Err(invalid(path, "a sequence does not take arguments".into()));
                }
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        self.instantiate_at(&config::join(path, &i.to_string()), item, Args::new())
                    })
                    .collect::<Result<_, _>>()
                    .map(Instance::Seq)
            }
            scalar => {
                if !args.is_empty() {
                    return Err(invalid(path, format!("a {} does not take arguments", scalar.kind())));
                }
                Ok(Instance::Value(scalar.clone()))
            }
        }
    }

    fn resolve_bundle(&self, path: &str, node: &Node, mut args: Args) -> Result<Instance, ResolveError> {
        let mut bundle = Bundle::new(path);
        for (key, value) in node {
            let instance = match args.take(key) {
                Some(given) => given,
                None => self.instantiate_at(&config::join(path, key), value, Args::new())?,
            };
            bundle.insert(key.clone(), instance);
        }
        for (key, instance) in args.into_entries() {
            bundle.insert(key, instance);
        }
        Ok(Instance::Bundle(bundle))
    }

    fn resolve_target(
        &self,
        path: &str,
        target: &str,
        node: &Node,
        args: Args,
    ) -> Result<Instance, ResolveError> {
        let registered = self.lookup(path, target)?;
        check_reserved(path, node)?;
        if let Some(argument) = argument_keys(node)
            .chain(args.keys())
            .find(|key| registered.def.param(key).is_none())
        {
            return Err(ResolveError::UnexpectedArgument {
                path: path.into(),
                target: target.into(),
                argument: argument.into(),
            });
        }

        let forced = flag(path, node, PARTIAL_KEY, false)?;
        let deferred: Vec<_> = registered
            .def
            .deferred_missing(&args)
            .into_iter()
            .filter(|name| !node.contains_key(name))
            .collect();
        if forced || !deferred.is_empty() {
            if flag(path, node, RECURSIVE_KEY, true)? {
                for (key, value) in node.iter().filter(|(k, _)| !is_reserved(k)) {
                    self.validate(&config::join(path, key), value)?;
                }
            }
            debug!(
                "`{}` at `{}` is partial (awaiting: {})",
                target,
                path,
                deferred.join(", ")
            );
            let partial =
                PartialConstructor::new(self.clone(), registered, path.into(), node.clone(), args);
            return Ok(Instance::Partial(partial.into()));
        }
        self.construct(path, &registered, node, args)
    }

    /// Resolve the node's arguments and run the factory.
    pub(crate) fn construct(
        &self,
        path: &str,
        registered: &Registered,
        node: &Node,
        runtime: Args,
    ) -> Result<Instance, ResolveError> {
        let recursive = flag(path, node, RECURSIVE_KEY, true)?;
        let mut args = Args::new();
        for (key, value) in node.iter().filter(|(k, _)| !is_reserved(k)) {
            if runtime.contains(key) {
                continue;
            }
            let instance = if recursive {
                self.instantiate_at(&config::join(path, key), value, Args::new())?
            } else {
                Instance::Value(value.clone())
            };
            args.insert(key.clone(), instance);
        }
        args.extend(runtime);
        registered.construct(path, args)
    }

    /// Check targets and argument names below a node without building anything.
    fn validate(&self, path: &str, node: &Value) -> Result<(), ResolveError> {
        match node {
            Value::Map(map) => {
                if let Some(target) = map.get(TARGET_KEY) {
                    let target = target.as_str().ok_or_else(|| {
                        invalid(path, format!("`{}` must be a string", TARGET_KEY))
                    })?;
                    let registered = self.lookup(path, target)?;
                    check_reserved(path, map)?;
                    if let Some(argument) =
                        argument_keys(map).find(|key| registered.def.param(key).is_none())
                    {
                        return Err(ResolveError::UnexpectedArgument {
                            path: path.into(),
                            target: target.into(),
                            argument: argument.into(),
                        });
                    }
                    if !flag(path, map, RECURSIVE_KEY, true)? {
                        return Ok(());
                    }
                }
                map.iter()
                    .filter(|(k, _)| !is_reserved(k))
                    .try_for_each(|(key, value)| self.validate(&config::join(path, key), value))
            }
            Value::Seq(items) => items
                .iter()
                .enumerate()
                .try_for_each(|(i, item)| self.validate(&config::join(path, &i.to_string()), item)),
            _ => Ok(()),
        }
    }

    fn lookup(&self, path: &str, target: &str) -> Result<std::sync::Arc<Registered>, ResolveError> {
        self.registry
            .lookup(target)
            .ok_or_else(|| ResolveError::UnresolvedTarget {
                path: path.into(),
                target: target.into(),
            })
    }
}

fn is_reserved(key: &str) -> bool {
    key == TARGET_KEY || key == PARTIAL_KEY || key == RECURSIVE_KEY
}

/// Reject `_name_` keys other than the supported ones.
fn check_reserved(path: &str, node: &Node) -> Result<(), ResolveError> {
    match node.keys().find(|key| {
        key.len() > 2 && key.starts_with('_') && key.ends_with('_') && !is_reserved(key)
    }) {
        Some(key) => Err(invalid(path, format!("unsupported reserved key `{}`", key))),
        None => Ok(()),
    }
}

fn argument_keys(node: &Node) -> impl Iterator<Item = &str> {
    node.keys().map(String::as_str).filter(|k| !is_reserved(k))
}

fn flag(path: &str, node: &Node, key: &str, default: bool) -> Result<bool, ResolveError> {
    match node.get(key) {
        None => Ok(default),
        Some(Value::Bool(value)) => Ok(*value),
        Some(other) => Err(invalid(
            path,
            format!("`{}` must be a boolean, found {}", key, other.kind()),
        )),
    }
}

fn invalid(path: &str, reason: String) -> ResolveError {
    ResolveError::InvalidNode {
        path: path.into(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::{BuildError, TargetDef};
    use rstest::{fixture, rstest};

    /// `test.Layer(in_features [deferred], out_features, bias = true)` returns its
    /// arguments as a mapping; `test.Fail` always fails.
    #[fixture]
    fn resolver() -> NodeResolver {
        let registry = Registry::builder()
            .register(
                TargetDef::new("test.Layer")
                    .deferred("in_features")
                    .required("out_features")
                    .optional("bias"),
                |args| {
                    let mut node = Node::new();
                    node.insert("in".into(), Value::Int(args.value("in_features")?));
                    node.insert("out".into(), Value::Int(args.value("out_features")?));
                    node.insert("bias".into(), Value::Bool(args.value_or("bias", true)?));
                    Ok(Instance::Value(Value::Map(node)))
                },
            )
            .register(TargetDef::new("test.List").required("items"), |args| {
                let items = args.require("items")?;
                Ok(items)
            })
            .register(TargetDef::new("test.Fail"), |_| {
                Err(BuildError::Invalid {
                    key: "none".into(),
                    reason: "always fails".into(),
                })
            })
            .build();
        NodeResolver::new(registry)
    }

    fn node(yaml: &str) -> Value {
        Value::from_yaml(yaml).unwrap()
    }

    #[rstest]
    fn eager_when_complete(resolver: NodeResolver) {
        let out = resolver
            .instantiate(
                &node("{_target_: test.Layer, in_features: 3, out_features: 4}"),
                Args::new(),
            )
            .unwrap();
        assert_eq!(out.to_value(), Some(node("{in: 3, out: 4, bias: true}")));
    }

    #[rstest]
    fn runtime_args_win(resolver: NodeResolver) {
        let out = resolver
            .instantiate(
                &node("{_target_: test.Layer, in_features: 3, out_features: 4}"),
                Args::new().with_value("out_features", 9_i64),
            )
            .unwrap();
        assert_eq!(out.to_value().unwrap().lookup("out"), Some(&Value::Int(9)));
    }

    #[rstest]
    fn deferred_gives_partial(resolver: NodeResolver) {
        let out = resolver
            .instantiate(&node("{_target_: test.Layer, out_features: 4}"), Args::new())
            .unwrap();
        let mut slot = out.into_partial().unwrap();
        assert_eq!(slot.target(), "test.Layer");
        assert_eq!(slot.missing(), vec!["in_features"]);

        let built = slot
            .finalize(Args::new().with_value("in_features", 7_i64))
            .unwrap();
        assert_eq!(built.to_value().unwrap().lookup("in"), Some(&Value::Int(7)));

        assert!(slot.is_finalized());
        assert!(matches!(
            slot.finalize(Args::new().with_value("in_features", 7_i64)),
            Err(ResolveError::AlreadyFinalized { .. })
        ));
    }

    #[rstest]
    fn forced_partial(resolver: NodeResolver) {
        let out = resolver
            .instantiate(
                &node("{_target_: test.Layer, _partial_: true, in_features: 1, out_features: 2}"),
                Args::new(),
            )
            .unwrap();
        let slot = out.into_partial().unwrap();
        assert!(slot.missing().is_empty());
    }

    #[rstest]
    fn missing_required_at_finalize(resolver: NodeResolver) {
        let out = resolver
            .instantiate(&node("{_target_: test.Layer}"), Args::new())
            .unwrap();
        let partial = out.into_partial().unwrap().take().unwrap();
        assert_eq!(partial.missing(), vec!["in_features", "out_features"]);
        assert!(matches!(
            partial.finalize(Args::new().with_value("in_features", 1_i64)),
            Err(ResolveError::MissingArgument { missing, .. }) if missing == vec!["out_features"]
        ));
    }

    #[rstest]
    fn missing_required_eagerly(resolver: NodeResolver) {
        let err = resolver
            .instantiate(&node("{_target_: test.List}"), Args::new())
            .unwrap_err();
        assert!(matches!(err, ResolveError::MissingArgument { missing, .. } if missing == vec!["items"]));
    }

    #[rstest]
    fn unexpected_argument(resolver: NodeResolver) {
        let err = resolver
            .instantiate(
                &node("{net: {_target_: test.Layer, out_features: 1, width: 3}}"),
                Args::new(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::UnexpectedArgument { path, argument, .. } if path == "net" && argument == "width"
        ));
    }

    #[rstest]
    fn unresolved_target_names_path(resolver: NodeResolver) {
        let err = resolver
            .instantiate(&node("{a: [{_target_: test.Nope}]}"), Args::new())
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::UnresolvedTarget { path, target } if path == "a.0" && target == "test.Nope"
        ));
    }

    #[rstest]
    fn partial_validates_children(resolver: NodeResolver) {
        let err = resolver
            .instantiate(
                &node("{_target_: test.Layer, out_features: {_target_: test.Nope}}"),
                Args::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnresolvedTarget { path, .. } if path == "out_features"));
    }

    #[rstest]
    fn sequences_keep_order(resolver: NodeResolver) {
        let out = resolver
            .instantiate(
                &node(
                    "[{_target_: test.Layer, in_features: 1, out_features: 1}, \
                     {_target_: test.Layer, in_features: 2, out_features: 2}, 3]",
                ),
                Args::new(),
            )
            .unwrap();
        let value = out.to_value().unwrap();
        assert_eq!(value.lookup("1.in"), Some(&Value::Int(2)));
        assert_eq!(value.lookup("2"), Some(&Value::Int(3)));
    }

    #[rstest]
    fn non_recursive_passes_raw_config(resolver: NodeResolver) {
        let out = resolver
            .instantiate(
                &node("{_target_: test.List, _recursive_: false, items: [{_target_: test.Nope}]}"),
                Args::new(),
            )
            .unwrap();
        assert_eq!(out.to_value(), Some(node("[{_target_: test.Nope}]")));
    }

    #[rstest]
    fn bundle_keeps_partials(resolver: NodeResolver) {
        let out = resolver
            .instantiate(
                &node("{in_keys: [pixels], network: {_target_: test.Layer, out_features: 2}}"),
                Args::new(),
            )
            .unwrap();
        let mut bundle = out.into_bundle().unwrap();
        assert_eq!(bundle.value::<Vec<String>>("in_keys").unwrap(), vec!["pixels"]);
        assert!(bundle
            .finalize("network", Args::new().with_value("in_features", 3_i64))
            .is_ok());
        assert!(matches!(
            bundle.finalize("network", Args::new().with_value("in_features", 3_i64)),
            Err(ResolveError::AlreadyFinalized { path, .. }) if path == "network"
        ));
    }

    #[rstest]
    fn bundle_partial_survives_failed_finalize(resolver: NodeResolver) {
        let out = resolver
            .instantiate(&node("{network: {_target_: test.Layer, out_features: 2}}"), Args::new())
            .unwrap();
        let mut bundle = out.into_bundle().unwrap();
        assert!(matches!(
            bundle.finalize("network", Args::new().with_value("in_features", "oops")),
            Err(ResolveError::Build { .. })
        ));
        let built = bundle
            .finalize("network", Args::new().with_value("in_features", 3_i64))
            .unwrap();
        assert_eq!(built.to_value().unwrap().lookup("in"), Some(&Value::Int(3)));
    }

    #[rstest]
    fn build_failure_wraps_source(resolver: NodeResolver) {
        let err = resolver
            .instantiate(&node("{x: {_target_: test.Fail}}"), Args::new())
            .unwrap_err();
        assert!(matches!(err, ResolveError::Build { ref path, .. } if path == "x"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[rstest]
    #[case("{_target_: 3}")]
    #[case("{_target_: test.Layer, _partial_: yes please}")]
    #[case("{_target_: test.Layer, _convert_: all}")]
    fn invalid_nodes(resolver: NodeResolver, #[case] text: &str) {
        assert!(matches!(
            resolver.instantiate(&node(text), Args::new()),
            Err(ResolveError::InvalidNode { .. })
        ));
    }

    #[rstest]
    fn shared_partial_builds_repeatedly(resolver: NodeResolver) {
        let out = resolver
            .instantiate(&node("{_target_: test.Layer, out_features: 2}"), Args::new())
            .unwrap();
        let shared = out.into_partial().unwrap().take().unwrap().share().unwrap();
        for n in 1..3_i64 {
            let built = shared.build(Args::new().with_value("in_features", n)).unwrap();
            assert_eq!(built.to_value().unwrap().lookup("in"), Some(&Value::Int(n)));
        }
    }

    #[test]
    fn instantiate_path_reports_missing_node() {
        let config = ResolvedConfig::from_value(Value::default());
        assert!(matches!(
            NodeResolver::new(Registry::builder().build()).instantiate_path(&config, "env", Args::new()),
            Err(Error::Compose(_))
        ));
    }
}
