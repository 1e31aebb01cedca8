use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unresolved reference: '{entity}' points to unknown process '{reference}'")]
    UnresolvedReference { entity: String, reference: String },

    #[error("Cycle detected among derived processes: {0}")]
    CycleDetected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BuildError>;
