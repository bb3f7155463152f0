use std::path::PathBuf;
use thiserror::Error;

use crate::codes;
use crate::plugin::PluginError;
use crate::resolve::ResolveError;
use crate::transform::TransformError;

/// Core error type for configuration and setup.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid pattern '{pattern}' in rule {index}: {message}")]
    InvalidPattern {
        index: usize,
        pattern: String,
        message: String,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// A failure that stops a pipeline run (or, in tolerant mode, one module).
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Emit conflict at {path}: {first} and {second} produce different bytes")]
    EmitConflict {
        path: String,
        first: String,
        second: String,
    },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Entry '{name}' not found: {}", .path.display())]
    EntryNotFound { name: String, path: PathBuf },

    #[error(transparent)]
    Config(#[from] Error),
}

impl PipelineError {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Resolve(_) => codes::RESOLVE_FAILED,
            Self::Transform(_) => codes::TRANSFORM_FAILED,
            Self::EmitConflict { .. } => codes::EMIT_CONFLICT,
            Self::Plugin(_) => codes::PLUGIN_FAILED,
            Self::Read { .. } => codes::READ_FAILED,
            Self::Write { .. } => codes::WRITE_FAILED,
            Self::EntryNotFound { .. } => codes::ENTRY_NOT_FOUND,
            Self::Config(_) => codes::CONFIG_INVALID,
        }
    }

    /// Returns true for errors caused by configuration rather than sources.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// The source file most closely associated with this error, if any.
    #[must_use]
    pub fn file(&self) -> Option<PathBuf> {
        match self {
            Self::Resolve(e) => Some(e.importer.clone()),
            Self::Transform(e) => Some(e.path.clone()),
            Self::Read { path, .. } | Self::EntryNotFound { path, .. } => Some(path.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_codes() {
        let err = PipelineError::EmitConflict {
            path: "js/main.js".into(),
            first: "chunk main".into(),
            second: "asset logo.png".into(),
        };
        assert_eq!(err.code(), codes::EMIT_CONFLICT);
        assert!(err.to_string().contains("js/main.js"));

        let err = PipelineError::from(Error::InvalidConfig("no entries".into()));
        assert!(err.is_config());
        assert_eq!(err.code(), codes::CONFIG_INVALID);
    }

    #[test]
    fn test_read_error_names_path() {
        let err = PipelineError::Read {
            path: PathBuf::from("/p/src/a.js"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert!(err.to_string().contains("/p/src/a.js"));
        assert_eq!(err.file(), Some(PathBuf::from("/p/src/a.js")));
    }
}
