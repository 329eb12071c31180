//! Error type
use crate::collectors::CollectorError;
use crate::config::ComposeError;
use crate::data::DataError;
use crate::envs::EnvError;
use crate::modules::ModuleError;
use crate::resolve::{KindMismatch, ResolveError};
use crate::shapes::ShapeError;
use crate::wiring::WireError;
use thiserror::Error;

/// Error from any stage of composing and running components.
#[derive(Error, Debug)]
pub enum Error {
    #[error("error composing configuration")]
    Compose(#[from] ComposeError),
    #[error("error instantiating configuration")]
    Resolve(#[from] ResolveError),
    #[error("error wiring components")]
    Wire(#[from] WireError),
    #[error("error inferring shapes")]
    Shape(#[from] ShapeError),
    #[error("environment error")]
    Env(#[from] EnvError),
    #[error("module error")]
    Module(#[from] ModuleError),
    #[error("collector error")]
    Collector(#[from] CollectorError),
    #[error("replay buffer error")]
    Data(#[from] DataError),
    #[error(transparent)]
    Kind(#[from] KindMismatch),
}
