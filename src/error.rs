use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid profile name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("profile not found: {0}")]
    NotFound(String),

    #[error("initial default already captured (use --force to replace it)")]
    AlreadyCaptured,

    #[error("no initial default captured yet")]
    NoDefaultCaptured,

    #[error("no enabled parameters to apply")]
    NothingToApply,

    #[error("invalid value for {parameter}: {detail}")]
    InvalidValue { parameter: String, detail: String },

    #[error("import failed: {0}")]
    InvalidImport(String),

    #[error("state file error: {}: {detail}", path.display())]
    Persistence { path: PathBuf, detail: String },

    #[error("{program} failed: {detail}")]
    Executor { program: String, detail: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn persistence(path: impl Into<PathBuf>, detail: impl std::fmt::Display) -> Self {
        Error::Persistence {
            path: path.into(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn invalid_name(name: &str, reason: &str) -> Self {
        Error::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
