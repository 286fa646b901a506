//! Collaborators consumed while building an NLP: a model writer producing the exchange
//! artifact and symbol map, and a loader turning the artifact into an evaluation engine.
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::model::{Entity, Model};
use crate::nlp::Nlp;
use crate::symbols::SymbolMap;

/// Decides whether a constraint or objective is written.
pub type EntityFilter<'a> = &'a dyn Fn(Entity) -> bool;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriterOptions {
    /// Also write the ordinary constraints declared inside grey-box blocks.
    pub descend_into_grey_boxes: bool,
    /// Embed display names in the artifact.
    pub symbolic_names: bool,
}

/// Serializes a model into an exchange artifact.
pub trait ModelWriter {
    /// Write `model` to `path` and return the artifact location along with the symbol map
    /// linking every written symbol to its entity.
    fn write(
        &self,
        model: &Model,
        path: &Path,
        filter: EntityFilter<'_>,
        options: &WriterOptions,
    ) -> Result<(PathBuf, SymbolMap)>;
}

/// Builds an evaluation engine from an exchange artifact.
pub trait EngineLoader {
    type Engine: Nlp;

    fn load(&self, artifact: &Path) -> Result<Self::Engine>;
}
