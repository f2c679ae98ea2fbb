use std::path::PathBuf;

/// Shared error type used across all llamagate crates.
///
/// Variants are grouped by the failure domain they belong to:
/// configuration, resources (files, downloads, contexts), the inference
/// runtime, protocol violations by the model, cancellation, and shutdown.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("unknown grammar: {0}")]
    UnknownGrammar(String),

    #[error("config: {0}")]
    Config(String),

    #[error("model file missing and no download url: {}", .0.display())]
    ModelFileMissing(PathBuf),

    #[error("download failed: {0}")]
    Download(String),

    #[error("context creation failed: {0}")]
    ContextCreation(String),

    #[error("runtime: {0}")]
    Runtime(String),

    /// The adapter reported the generation context as no longer usable.
    /// The owning instance must be disposed and its slot emptied.
    #[error("context unusable: {0}")]
    ContextUnusable(String),

    #[error("model invoked undefined function: {0}")]
    UndefinedFunction(String),

    #[error("function {name}: {message}")]
    FunctionFailed { name: String, message: String },

    /// The caller aborted before the request was dispatched to an
    /// instance. Aborts after dispatch are not errors — they resolve with
    /// finish reason `abort`.
    #[error("request aborted")]
    Aborted,

    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
