use std::sync::Arc;

/// Supplies the file-name extension a pipeline stage adds to an artifact.
pub trait FileExtProvider {
    fn file_ext(&self) -> Option<Arc<str>>;
}
