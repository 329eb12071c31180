//! Instantiating configuration nodes.
//!
//! A node tagged with [`TARGET_KEY`](crate::config::TARGET_KEY) names a constructor in the
//! [`Registry`]. Its other entries are arguments, resolved recursively. A target whose
//! deferred arguments are still missing (or that sets `_partial_: true`) resolves to a
//! [`PartialConstructor`] instead of an object.
mod args;
mod instance;
mod partial;
mod registry;
mod resolver;

pub use args::Args;
pub use instance::{Bundle, Instance};
pub use partial::{PartialConstructor, PartialSlot, SharedPartial};
pub use registry::{Factory, Param, ParamKind, Registry, RegistryBuilder, TargetDef};
pub use resolver::NodeResolver;

use crate::collectors::CollectorError;
use crate::data::DataError;
use crate::envs::EnvError;
use crate::modules::ModuleError;
use crate::wiring::WireError;
use thiserror::Error;

/// An instance was not of the expected kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected}, found {found}")]
pub struct KindMismatch {
    pub expected: &'static str,
    pub found: &'static str,
}

/// Error raised by a registered factory.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing argument `{0}`")]
    Missing(String),
    #[error("argument `{key}`: {source}")]
    Kind {
        key: String,
        #[source]
        source: KindMismatch,
    },
    #[error("argument `{key}`: {reason}")]
    Invalid { key: String, reason: String },
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error(transparent)]
    Data(#[from] DataError),
}

/// Error instantiating a configuration node.
///
/// Every variant names the configuration path of the offending node.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("`{path}`: unknown target `{target}`")]
    UnresolvedTarget { path: String, target: String },
    #[error("`{path}`: `{target}` is missing argument(s) {}", .missing.join(", "))]
    MissingArgument {
        path: String,
        target: String,
        missing: Vec<String>,
    },
    #[error("`{path}`: `{target}` does not accept argument `{argument}`")]
    UnexpectedArgument {
        path: String,
        target: String,
        argument: String,
    },
    #[error("`{path}`: partial constructor for `{target}` was already finalized")]
    AlreadyFinalized { path: String, target: String },
    #[error("`{path}`: expected a partial constructor, found {found}")]
    NotPartial { path: String, found: &'static str },
    #[error("`{path}`: no entry `{key}`")]
    MissingEntry { path: String, key: String },
    #[error("`{path}`: invalid node: {reason}")]
    InvalidNode { path: String, reason: String },
    #[error("`{path}`: invalid value")]
    InvalidValue {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("`{path}`: {source}")]
    Kind {
        path: String,
        #[source]
        source: KindMismatch,
    },
    #[error("`{path}`: failed to build `{target}`")]
    Build {
        path: String,
        target: String,
        #[source]
        source: BuildError,
    },
}
