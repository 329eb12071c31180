//! Configuration tree values
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Key naming the constructor of a target node.
pub const TARGET_KEY: &str = "_target_";
/// Key forcing a target node to resolve as a partial constructor.
pub const PARTIAL_KEY: &str = "_partial_";
/// Key disabling recursive instantiation of a target node's arguments.
pub const RECURSIVE_KEY: &str = "_recursive_";

/// A mapping from names to configuration values.
pub type Node = BTreeMap<String, Value>;

/// A configuration value.
///
/// A [`Value::Map`] holding a [`TARGET_KEY`] entry describes an object to instantiate;
/// every other value is plain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<Value>),
    Map(Node),
}

impl Default for Value {
    fn default() -> Self {
        Self::Map(Node::new())
    }
}

impl Value {
    /// Parse a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        let raw: serde_yaml::Value = serde_yaml::from_str(text)?;
        Ok(raw.into())
    }

    /// Serialize as a YAML document.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Deserialize into a typed value.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T, serde_yaml::Error> {
        serde_yaml::from_value(serde_yaml::to_value(self)?)
    }

    /// A short name for the kind of value, used in error messages.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Seq(_) => "sequence",
            Self::Map(_) => "mapping",
        }
    }

    pub const fn as_map(&self) -> Option<&Node> {
        match self {
            Self::Map(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }


    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The target name if this is a target node.
    pub fn target(&self) -> Option<&str> {
        self.as_map()?.get(TARGET_KEY)?.as_str()
    }

    /// Look up a dotted path such as `env.env.from_pixels`.
    ///
    /// Sequence elements are addressed by their index (`transforms.0`).
    /// The empty path refers to `self`.
    pub fn lookup(&self, path: &str) -> Option<&Self> {
        segments(path).try_fold(self, |value, segment| value.child(segment))
    }

    /// Mutable version of [`Value::lookup`].
    pub fn lookup_mut(&mut self, path: &str) -> Option<&mut Self> {
        segments(path).try_fold(self, |value, segment| value.child_mut(segment))
    }

    fn child(&self, segment: &str) -> Option<&Self> {
        match self {
            Self::Map(node) => node.get(segment),
            Self::Seq(items) => items.get(segment.parse::<usize>().ok()?),
            _ => None,
        }
    }

    fn child_mut(&mut self, segment: &str) -> Option<&mut Self> {
        match self {
            Self::Map(node) => node.get_mut(segment),
            Self::Seq(items) => items.get_mut(segment.parse::<usize>().ok()?),
            _ => None,
        }
    }

    /// Visit every string leaf mutably, with its path.
    pub(crate) fn visit_strings_mut<F, E>(&mut self, path: &str, f: &mut F) -> Result<(), E>
    where
        F: FnMut(&str, &mut Self) -> Result<(), E>,
    {
        match self {
            Self::Str(_) => f(path, self),
            Self::Seq(items) => items
                .iter_mut()
                .enumerate()
                .try_for_each(|(i, item)| item.visit_strings_mut(&join(path, &i.to_string()), f)),
            Self::Map(node) => node
                .iter_mut()
                .try_for_each(|(key, item)| item.visit_strings_mut(&join(path, key), f)),
            _ => Ok(()),
        }
    }
}

/// Split a dotted path into segments. The empty path has no segments.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

/// Join a parent path and a child key.
pub fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

impl From<serde_yaml::Value> for Value {
    fn from(raw: serde_yaml::Value) -> Self {
        use serde_yaml::Value as Yaml;
        match raw {
            Yaml::Null => Self::Null,
            Yaml::Bool(b) => Self::Bool(b),
            Yaml::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Yaml::String(s) => Self::Str(s),
            Yaml::Sequence(items) => Self::Seq(items.into_iter().map(Into::into).collect()),
            Yaml::Mapping(mapping) => Self::Map(
                mapping
                    .into_iter()
                    .map(|(k, v)| (key_string(k), v.into()))
                    .collect(),
            ),
            Yaml::Tagged(tagged) => tagged.value.into(),
        }
    }
}

fn key_string(key: serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s,
        other => match Value::from(other) {
            Value::Null => "null".into(),
            scalar => scalar.to_string(),
        },
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<usize> for Value {
    // Configuration sizes never approach i64::MAX
    #[allow(clippy::cast_possible_wrap)]
    fn from(i: usize) -> Self {
        Self::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl<T: Into<Self>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::Seq(items.into_iter().map(Into::into).collect())
    }
}

/// Compact single-line rendering.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{:?}", x),
            Self::Str(s) => write!(f, "{}", s),
            Self::Seq(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Self::Map(node) => {
                write!(f, "{{")?;
                for (i, (key, item)) in node.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, item)?;
                }
                write!(f, "}}")
            }
        }
    }
}
