use std::path::PathBuf;
use thiserror::Error;

/// Problems detected before any pipeline stage starts
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("unsupported dump extension for {path:?}: expected .xml or .bz2")]
    UnsupportedExtension { path: PathBuf },

    #[error("failed to open dump {path:?}: {source}")]
    OpenInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create {what} at {path:?}: {source}")]
    CreateOutput {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// The dump byte stream became unreadable mid-parse
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("malformed XML at byte {position}: {source}")]
    Xml {
        position: usize,
        #[source]
        source: quick_xml::Error,
    },

    #[error("dump reader panicked: {message}")]
    Panicked { message: String },
}
