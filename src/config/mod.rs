//! Layered configuration: base documents, swappable groups and point overrides.
//!
//! A base document may start with a `defaults` list selecting one member per group:
//! ```yaml
//! defaults:
//!   - collector: sync_single
//!   - env: cartpole
//!   - network: null   # declared, nothing selected
//! num_workers: 2
//! ```
//! Each selected member document replaces the subtree stored under its group name.
//! Overrides are then applied in order, see [`Override`] for the syntax.
mod interpolate;
mod overrides;
mod source;
mod store;
mod value;

pub use overrides::{Override, OverrideMode};
pub use source::{ConfigSource, DirSource, MemorySource};
pub use store::{ConfigStore, ConflictPolicy, ResolvedConfig, Session, ShadowedOverride};
pub use value::{join, segments, Node, Value, PARTIAL_KEY, RECURSIVE_KEY, TARGET_KEY};

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Error composing a configuration.
///
/// Every variant names the document, group, member or path at fault.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("unknown base configuration `{0}`")]
    UnknownBase(String),
    #[error("unknown configuration group `{group}` (known groups: {known})")]
    UnknownGroup { group: String, known: String },
    #[error("group `{group}` has no member `{member}` (available: {available})")]
    UnknownMember {
        group: String,
        member: String,
        available: String,
    },
    #[error("could not override `{path}`: no such field; use `++{path}=...` to add it")]
    UnknownField { path: String },
    #[error("conflicting overrides at `{path}`: {reason}")]
    MergeConflict { path: String, reason: String },
    #[error("invalid override `{expr}`: {reason}")]
    InvalidOverride { expr: String, reason: String },
    #[error("cannot interpolate `{expr}` at `{path}`: {reason}")]
    Interpolation {
        path: String,
        expr: String,
        reason: String,
    },
    #[error("invalid document `{document}`: {reason}")]
    InvalidDocument { document: String, reason: String },
    #[error("invalid value at `{path}`")]
    InvalidValue {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to parse `{document}`")]
    Parse {
        document: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
