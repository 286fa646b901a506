use thiserror::Error;

use crate::model::{ConId, VarId};

/// Errors raised while building or querying an NLP over a symbolic model.
#[derive(Debug, Error)]
pub enum Error {
    /// The model must have exactly one active objective.
    #[error(
        "only single objective problems are supported, found {found} active objectives; \
         deactivate extra objectives or add a dummy objective (f(x) = 0) for square problems"
    )]
    UnsupportedObjectiveCount { found: usize },
    #[error("variable {0} is not part of this NLP")]
    UnknownVariable(VarId),
    #[error("constraint {0} is not part of this NLP")]
    UnknownConstraint(ConId),
    /// The positions stored in a position map do not cover `0..len` exactly once.
    #[error("position map is not a bijection onto 0..{len}: missing position {missing}")]
    IncompletePositionMap { len: usize, missing: usize },
    #[error(
        "called {operation} with an invalid output buffer: \
         expected size {expected}, found {found}"
    )]
    BufferSize {
        operation: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
    #[error("invalid symbol {0:?} in symbol map")]
    InvalidSymbol(String),
    #[error("malformed exchange artifact: {0}")]
    Artifact(String),
    #[error("grey-box {name:?}: {message}")]
    GreyBox { name: String, message: String },
    #[error("evaluation engine error: {0}")]
    Engine(String),
    #[error("I/O error")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("artifact serialization error")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
