//! Compose reinforcement learning components from layered configuration trees.
//!
//! A request flows through four stages:
//! 1. [`config::ConfigStore`] merges a base document, group selections and point overrides
//!    into an immutable [`config::ResolvedConfig`].
//! 2. [`resolve::NodeResolver`] turns target-tagged nodes into live [`resolve::Instance`]s,
//!    or into partial constructors when some arguments are only known later.
//! 3. [`shapes::ShapeInference`] reads an instantiated environment's specs and finalizes
//!    the partial constructors that were waiting on shapes.
//! 4. [`wiring::DependencyWirer`] checks key contracts and chains the components into a
//!    composite.
//!
//! [`assembly`] packages the common flows for value-based and actor-critic models.
#![warn(clippy::cast_lossless)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::doc_markdown)]
#![warn(clippy::explicit_iter_loop)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::redundant_closure_for_method_calls)]
#![warn(clippy::use_self)]
pub mod assembly;
pub mod collectors;
pub mod config;
pub mod data;
pub mod envs;
mod error;
pub mod modules;
pub mod nn;
pub mod resolve;
pub mod shapes;
pub mod specs;
pub mod tensordict;
pub mod transforms;
pub mod wiring;

pub use config::{ConfigStore, ResolvedConfig, Session, Value};
pub use error::Error;
pub use resolve::{Args, Instance, NodeResolver, PartialConstructor, Registry};
pub use shapes::{resolve_shapes, ShapeInference, ShapeRequest};
pub use specs::{CompositeSpec, TensorSpec};
pub use tensordict::TensorDict;
pub use wiring::{wire, Component, DependencyWirer, KeyContract, OutputHead};

/// Pseudo-random number generator used throughout the crate.
pub type Prng = rand_chacha::ChaCha8Rng;
