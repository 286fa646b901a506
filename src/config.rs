use crate::backend::WriterOptions;

/// Construction settings shared by [`ModelNlp`](crate::ModelNlp) and
/// [`GreyBoxNlp`](crate::GreyBoxNlp).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Environment variable read by the engine for external function libraries.
    pub library_path_var: String,
    /// Secondary variable whose value is appended to the primary one while the engine loads.
    pub fallback_library_path_var: String,
    /// File name of the exchange artifact inside the scoped temporary directory.
    pub artifact_name: String,
    pub writer: WriterOptions,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            library_path_var: "AMPLFUNC".to_string(),
            fallback_library_path_var: "PYOMO_AMPLFUNC".to_string(),
            artifact_name: "model.nlp.json".to_string(),
            writer: WriterOptions::default(),
        }
    }
}

impl AdapterConfig {
    pub fn with_library_path_var(mut self, var: impl Into<String>) -> Self {
        self.library_path_var = var.into();
        self
    }

    pub fn with_fallback_library_path_var(mut self, var: impl Into<String>) -> Self {
        self.fallback_library_path_var = var.into();
        self
    }

    pub fn with_artifact_name(mut self, name: impl Into<String>) -> Self {
        self.artifact_name = name.into();
        self
    }

    pub fn with_symbolic_names(mut self, symbolic_names: bool) -> Self {
        self.writer.symbolic_names = symbolic_names;
        self
    }

    pub fn with_descend_into_grey_boxes(mut self, descend: bool) -> Self {
        self.writer.descend_into_grey_boxes = descend;
        self
    }
}
