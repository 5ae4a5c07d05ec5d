//! Error types for the stevedore agent.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for stevedore operations.
pub type Result<T> = std::result::Result<T, StevedoreError>;

/// Main error type for the stevedore agent.
#[derive(Error, Debug)]
pub enum StevedoreError {
    // Build context assembly errors
    #[error("Failed to create build context in {path:?}: {source}")]
    ContextSetup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Build pipeline errors
    #[error("Build kind not supported: {kind}")]
    UnsupportedBuildKind { kind: String },

    #[error("Build request invalid: {reason}")]
    InvalidRequest { reason: String },

    #[error("Build engine solve failed: {0}")]
    Solve(#[from] tonic::Status),

    #[error("Failed to connect to build engine at {addr}: {reason}")]
    EngineConnect { addr: String, reason: String },

    // Registry errors
    #[error("Invalid image reference {image}: {reason}")]
    InvalidReference { image: String, reason: String },

    #[error("Failed to fetch manifest for {image}: {reason}")]
    ManifestFetch { image: String, reason: String },

    // App metadata errors
    #[error("Invalid app configuration YAML: {0}")]
    InvalidAppYaml(#[from] serde_yaml::Error),

    #[error("Failed to read application archive: {reason}")]
    Archive { reason: String },

    // Discovery errors
    #[error("Failed to resolve builder namespace for app {app}: {reason}")]
    NamespaceLookup { app: String, reason: String },

    #[error("Builder pod discovery requires an app or a fixed namespace")]
    DiscoveryUnscoped,

    #[error("Builder pod watch failed: {0}")]
    Watch(#[source] kube::Error),

    #[error("Cluster API error: {0}")]
    Cluster(#[from] kube::Error),

    // Hook execution errors
    #[error("Command {command:?} exited with status {code}")]
    HookFailed { command: String, code: i32 },

    #[error("Timed out waiting for command {command:?} to finish")]
    HookTimeout { command: String },

    // Cancellation
    #[error("Operation cancelled")]
    Cancelled,

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StevedoreError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Whether this error is a cancellation, as opposed to an ordinary
    /// failure. Callers racing against an ambient cancellation use this to
    /// avoid reporting a cancelled attempt as a build failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
