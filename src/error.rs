use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CalimeshError>;

/// Errors tagged by the pipeline stage that raised them
#[derive(Debug, Error)]
pub enum CalimeshError {
    #[error("Input error: {0}")]
    Input(String),
    #[error("Mesher error: {0}")]
    Mesher(String),
    #[error("Calibration error: {0}")]
    Calibration(String),
    #[error("Material error: {0}")]
    Material(String),
    #[error("Export error: {0}")]
    Export(String),
    #[error("Pipeline error: {0}")]
    Pipeline(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CalimeshError {
    /// Wraps an I/O error with the path that caused it
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> CalimeshError {
        CalimeshError::Io {
            path: path.into(),
            source,
        }
    }
}
