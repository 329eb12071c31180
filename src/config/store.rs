//! Composing resolved configurations
use super::interpolate::resolve_interpolations;
use super::value::Node;
use super::{
    segments, ComposeError, ConfigSource, DirSource, Override, OverrideMode, Value,
};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// How repeated point overrides of the same path are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictPolicy {
    /// The last override wins. Replaced overrides are logged and recorded.
    LastWriteWins,
    /// Two overrides of one path with different values fail with
    /// [`ComposeError::MergeConflict`] unless the later one uses `++`.
    Strict,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self::LastWriteWins
    }
}

/// Loads and merges layered configuration sources.
///
/// The store itself is immutable and cheap to clone.
/// Parsed documents are cached per [`Session`].
#[derive(Debug, Clone)]
pub struct ConfigStore {
    source: Arc<dyn ConfigSource>,
    policy: ConflictPolicy,
}

impl ConfigStore {
    pub fn new<S: ConfigSource + 'static>(source: S) -> Self {
        Self {
            source: Arc::new(source),
            policy: ConflictPolicy::default(),
        }
    }

    /// Store reading documents from a configuration directory.
    pub fn from_dir<P: Into<PathBuf>>(root: P) -> Self {
        Self::new(DirSource::new(root))
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn source(&self) -> &dyn ConfigSource {
        self.source.as_ref()
    }

    pub const fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Start a session with an empty document cache.
    pub fn session(&self) -> Session {
        Session {
            store: self.clone(),
            cache: HashMap::new(),
        }
    }

    /// Compose a configuration in a throwaway session.
    pub fn compose<I>(&self, base: &str, overrides: I) -> Result<ResolvedConfig, ComposeError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.session().compose(base, overrides)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DocKey {
    Base(String),
    Member(String, String),
}

/// A sequence of related [`ConfigStore::compose`] requests sharing a document cache.
///
/// Cached documents are cloned on every read so one composition can never affect another.
/// Call [`Session::clear`] between independent runs.
#[derive(Debug)]
pub struct Session {
    store: ConfigStore,
    cache: HashMap<DocKey, Value>,
}

impl Session {
    pub const fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Drop all cached documents.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Number of parsed documents in the cache.
    pub fn cached_documents(&self) -> usize {
        self.cache.len()
    }

    /// Compose base document `base` with a sequence of override expressions.
    ///
    /// Order of application:
    /// 1. the base document and the group members selected by its `defaults` list;
    /// 2. group selections from `overrides`, in order (later selections win);
    /// 3. point overrides from `overrides`, in order (later overrides win);
    /// 4. `${path}` interpolation.
    pub fn compose<I>(&mut self, base: &str, overrides: I) -> Result<ResolvedConfig, ComposeError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let overrides = overrides
            .into_iter()
            .map(|expr| Override::parse(expr.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut root = match self.document(DocKey::Base(base.to_string()))? {
            Some(Value::Map(node)) => node,
            Some(other) => {
                return Err(ComposeError::InvalidDocument {
                    document: base.to_string(),
                    reason: format!("expected a mapping, found a {}", other.kind()),
                })
            }
            None => return Err(ComposeError::UnknownBase(base.to_string())),
        };
        let mut selections = parse_defaults(base, root.remove("defaults"))?;

        let mut known_groups: BTreeSet<String> =
            selections.iter().map(|(group, _)| group.clone()).collect();
        known_groups.extend(self.store.source.groups()?);

        let mut point_overrides = Vec::new();
        for ov in overrides {
            match classify(&ov, &known_groups, &root)? {
                Classified::Select(group, member) => {
                    select(&mut selections, group, member);
                }
                Classified::Point => point_overrides.push(ov),
            }
        }

        let mut resolved_selections = Vec::new();
        for (group, member) in &selections {
            let member = match member {
                Some(member) => member,
                None => continue,
            };
            let document = self
                .document(DocKey::Member(group.clone(), member.clone()))?
                .ok_or_else(|| ComposeError::UnknownMember {
                    group: group.clone(),
                    member: member.clone(),
                    available: self
                        .store
                        .source
                        .members(group)
                        .map(|m| m.join(", "))
                        .unwrap_or_default(),
                })?;
            debug!("group `{}`: selected member `{}`", group, member);
            root.insert(group.clone(), document);
            resolved_selections.push((group.clone(), member.clone()));
        }

        let mut root = Value::Map(root);
        let shadowed = apply_point_overrides(&mut root, &point_overrides, self.store.policy)?;
        resolve_interpolations(&mut root)?;

        Ok(ResolvedConfig {
            root,
            selections: resolved_selections,
            shadowed,
        })
    }

    /// Load a parsed document, through the cache.
    fn document(&mut self, key: DocKey) -> Result<Option<Value>, ComposeError> {
        if let Some(value) = self.cache.get(&key) {
            return Ok(Some(value.clone()));
        }
        let (name, text) = match &key {
            DocKey::Base(name) => (name.clone(), self.store.source.load_base(name)?),
            DocKey::Member(group, member) => (
                format!("{}/{}", group, member),
                self.store.source.load_member(group, member)?,
            ),
        };
        let text = match text {
            Some(text) => text,
            None => return Ok(None),
        };
        let value = Value::from_yaml(&text).map_err(|source| ComposeError::Parse {
            document: name,
            source,
        })?;
        self.cache.insert(key, value.clone());
        Ok(Some(value))
    }
}

/// Parse the `defaults` list of a base document.
fn parse_defaults(
    base: &str,
    defaults: Option<Value>,
) -> Result<Vec<(String, Option<String>)>, ComposeError> {
    let invalid = |reason: String| ComposeError::InvalidDocument {
        document: base.to_string(),
        reason,
    };
    let entries = match defaults {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Seq(entries)) => entries,
        Some(other) => {
            return Err(invalid(format!(
                "`defaults` must be a sequence, found a {}",
                other.kind()
            )))
        }
    };

    let mut selections = Vec::new();
    for entry in entries {
        match entry {
            Value::Str(s) if s == "_self_" => {}
            Value::Map(node) if node.len() == 1 => {
                for (group, member) in node {
                    let member = match member {
                        Value::Null => None,
                        Value::Str(member) => Some(member),
                        other => {
                            return Err(invalid(format!(
                                "default for group `{}` must be a member name, found {}",
                                group, other
                            )))
                        }
                    };
                    select(&mut selections, group, member);
                }
            }
            other => return Err(invalid(format!("unsupported defaults entry `{}`", other))),
        }
    }
    Ok(selections)
}

/// Record a group selection, replacing an earlier selection of the same group in place.
fn select(selections: &mut Vec<(String, Option<String>)>, group: String, member: Option<String>) {
    match selections.iter_mut().find(|(g, _)| *g == group) {
        Some((_, current)) => {
            if current.is_some() && *current != member {
                info!(
                    "group `{}`: member `{}` replaced by `{}`",
                    group,
                    current.as_deref().unwrap_or("null"),
                    member.as_deref().unwrap_or("null")
                );
            }
            *current = member;
        }
        None => selections.push((group, member)),
    }
}

enum Classified {
    Select(String, Option<String>),
    Point,
}

/// Decide whether an override selects a group member or sets a field.
///
/// A top-level `key=value` selects a member when `key` names a group. Otherwise it must name
/// an existing field; an unknown key with a member-like string value is reported as an
/// unknown group, any other unknown key as an unknown field.
fn classify(
    ov: &Override,
    known_groups: &BTreeSet<String>,
    base: &Node,
) -> Result<Classified, ComposeError> {
    if !ov.is_top_level() || ov.mode == OverrideMode::Delete {
        return Ok(Classified::Point);
    }
    let is_group = known_groups.contains(&ov.path);
    let member = match &ov.value {
        Some(Value::Str(member)) => Some(Some(member.clone())),
        Some(Value::Null) => Some(None),
        _ => None,
    };
    match (ov.mode, is_group, member) {
        (OverrideMode::Assign | OverrideMode::Add | OverrideMode::ForceAdd, true, Some(member)) => {
            Ok(Classified::Select(ov.path.clone(), member))
        }
        (OverrideMode::Assign, false, Some(Some(_))) if !base.contains_key(&ov.path) => {
            Err(ComposeError::UnknownGroup {
                group: ov.path.clone(),
                known: known_groups
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
        }
        _ => Ok(Classified::Point),
    }
}

/// A point override replaced by a later override of the same path.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowedOverride {
    pub path: String,
    /// The replaced override expression.
    pub replaced: String,
    /// The override that took effect instead.
    pub by: String,
}

impl fmt::Display for ShadowedOverride {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "`{}` replaced by `{}`", self.replaced, self.by)
    }
}

fn apply_point_overrides(
    root: &mut Value,
    overrides: &[Override],
    policy: ConflictPolicy,
) -> Result<Vec<ShadowedOverride>, ComposeError> {
    let mut shadowed = Vec::new();
    let mut written: HashMap<&str, &Override> = HashMap::new();

    for ov in overrides {
        if let Some(previous) = written.insert(&ov.path, ov) {
            let disagree = previous.value != ov.value || previous.mode != ov.mode;
            let forced =
                ov.mode == OverrideMode::ForceAdd || previous.mode == OverrideMode::ForceAdd;
            if disagree && policy == ConflictPolicy::Strict && !forced {
                return Err(ComposeError::MergeConflict {
                    path: ov.path.clone(),
                    reason: format!("`{}` and `{}` disagree", previous, ov),
                });
            }
            if disagree {
                warn!("override `{}` replaced by later override `{}`", previous, ov);
                shadowed.push(ShadowedOverride {
                    path: ov.path.clone(),
                    replaced: previous.to_string(),
                    by: ov.to_string(),
                });
            }
        }
        apply(root, ov)?;
    }
    Ok(shadowed)
}

fn apply(root: &mut Value, ov: &Override) -> Result<(), ComposeError> {
    let path = ov.path.as_str();
    match ov.mode {
        OverrideMode::Assign => {
            let slot = root
                .lookup_mut(path)
                .ok_or_else(|| ComposeError::UnknownField { path: path.into() })?;
            *slot = ov.value.clone().unwrap_or(Value::Null);
        }
        OverrideMode::Add => {
            if root.lookup(path).is_some() {
                return Err(ComposeError::MergeConflict {
                    path: path.into(),
                    reason: format!("field already exists; use `++{}` to replace it", path),
                });
            }
            insert(root, path, ov.value.clone().unwrap_or(Value::Null))?;
        }
        OverrideMode::ForceAdd => {
            insert(root, path, ov.value.clone().unwrap_or(Value::Null))?;
        }
        OverrideMode::Delete => {
            let current = root
                .lookup(path)
                .ok_or_else(|| ComposeError::UnknownField { path: path.into() })?;
            if let Some(expected) = &ov.value {
                if expected != current {
                    return Err(ComposeError::MergeConflict {
                        path: path.into(),
                        reason: format!("cannot delete: value is `{}`, not `{}`", current, expected),
                    });
                }
            }
            remove(root, path)?;
        }
    }
    Ok(())
}

/// Set a value, creating intermediate mappings as needed.
fn insert(root: &mut Value, path: &str, value: Value) -> Result<(), ComposeError> {
    let parts: Vec<&str> = segments(path).collect();
    let (last, parents) = match parts.split_last() {
        Some(split) => split,
        None => {
            *root = value;
            return Ok(());
        }
    };

    let mut current = root;
    let mut walked = String::new();
    for part in parents {
        walked = super::join(&walked, part);
        current = match current {
            Value::Map(node) => node
                .entry((*part).to_string())
                .or_insert_with(|| Value::Map(Node::new())),
            Value::Seq(items) => part
                .parse::<usize>()
                .ok()
                .and_then(move |i| items.get_mut(i))
                .ok_or_else(|| ComposeError::UnknownField {
                    path: walked.clone(),
                })?,
            other => {
                return Err(ComposeError::MergeConflict {
                    path: path.into(),
                    reason: format!("`{}` is a {}, not a mapping", walked, other.kind()),
                })
            }
        };
    }
    match current {
        Value::Map(node) => {
            node.insert((*last).to_string(), value);
            Ok(())
        }
        Value::Seq(items) => match last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(ComposeError::UnknownField { path: path.into() }),
        },
        other => Err(ComposeError::MergeConflict {
            path: path.into(),
            reason: format!("`{}` is a {}, not a mapping", walked, other.kind()),
        }),
    }
}

fn remove(root: &mut Value, path: &str) -> Result<(), ComposeError> {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (parent, last),
        None => ("", path),
    };
    let unknown = || ComposeError::UnknownField { path: path.into() };
    match root.lookup_mut(parent).ok_or_else(unknown)? {
        Value::Map(node) => node.remove(last).map(drop).ok_or_else(unknown),
        Value::Seq(items) => match last.parse::<usize>() {
            Ok(i) if i < items.len() => {
                items.remove(i);
                Ok(())
            }
            _ => Err(unknown()),
        },
        _ => Err(unknown()),
    }
}

/// The immutable, fully merged configuration tree for one request.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    root: Value,
    selections: Vec<(String, String)>,
    shadowed: Vec<ShadowedOverride>,
}

impl ResolvedConfig {
    /// Wrap an already-merged tree.
    pub fn from_value(root: Value) -> Self {
        Self {
            root,
            selections: Vec::new(),
            shadowed: Vec::new(),
        }
    }

    pub const fn root(&self) -> &Value {
        &self.root
    }

    /// The value at a dotted path, if any.
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.root.lookup(path)
    }

    /// The value at a dotted path.
    pub fn node(&self, path: &str) -> Result<&Value, ComposeError> {
        self.get(path)
            .ok_or_else(|| ComposeError::UnknownField { path: path.into() })
    }

    /// Deserialize the value at a dotted path.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<T, ComposeError> {
        self.node(path)?
            .deserialize_into()
            .map_err(|source| ComposeError::InvalidValue {
                path: path.into(),
                source,
            })
    }

    /// The member selected for a group.
    pub fn selection(&self, group: &str) -> Option<&str> {
        self.selections
            .iter()
            .find(|(g, _)| g == group)
            .map(|(_, m)| m.as_str())
    }

    /// All `(group, member)` selections in application order.
    pub fn selections(&self) -> &[(String, String)] {
        &self.selections
    }

    /// Point overrides that were replaced by later overrides of the same path.
    pub fn shadowed(&self) -> &[ShadowedOverride] {
        &self.shadowed
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        self.root.to_yaml()
    }
}

/// Two resolved configurations are equal when every path holds the same value.
impl PartialEq for ResolvedConfig {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
    }
}
