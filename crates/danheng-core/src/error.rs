//! Error types for the core crate.

use std::path::PathBuf;

use thiserror::Error;

/// Error raised while rewriting a request URL to the redirect target.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RewriteError {
    /// The request URL could not be parsed.
    #[error("invalid request URL {url:?}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// The request URL has no `scheme://authority` part to replace.
    #[error("request URL {0:?} has no authority")]
    MissingAuthority(String),

    /// The configured destination does not form a valid URL.
    #[error("invalid redirect target {target:?}: {reason}")]
    InvalidTarget {
        /// The rewritten URL that failed to parse.
        target: String,
        /// Parser message.
        reason: String,
    },
}

/// Error raised while loading the rule configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither the config file nor its template exists.
    #[error("config template not found at {0}")]
    MissingTemplate(PathBuf),

    /// IO error while reading or creating the config file.
    #[error("IO error on {path}: {source}")]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for a rule set.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File being parsed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The config parsed but holds an unusable value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
